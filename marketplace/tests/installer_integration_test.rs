//! Integration tests for the install state machine
//!
//! A wiremock server plays the registry and artifact host; stores live in
//! temp directories.

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use nexus_marketplace::verifier::{compute_checksum, generate_key_pair, sign_data};
use nexus_marketplace::{
    Installer, MarketplaceError, RegistryClient, SignaturePolicy, Store, Verifier,
};
use pluginsdk::{InstallOptions, UpdateOptions};

fn tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

fn plugin_json(server: &MockServer, id: &str, version: &str, checksum: &str) -> Value {
    json!({
        "id": id,
        "name": id,
        "version": version,
        "description": format!("{} plugin", id),
        "artifacts": [{
            "os": "any",
            "arch": "any",
            "url": format!("{}/artifacts/{}-{}.tar.gz", server.uri(), id, version),
            "checksum": checksum
        }]
    })
}

/// Serve an index listing `plugins` and each artifact under /artifacts
async fn publish(server: &MockServer, plugins: &[(&str, &str, Vec<u8>)]) {
    let entries: Vec<Value> = plugins
        .iter()
        .map(|(id, version, data)| plugin_json(server, id, version, &compute_checksum(data)))
        .collect();

    Mock::given(method("GET"))
        .and(path("/index.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "version": "1",
            "plugins": entries
        })))
        .mount(server)
        .await;

    for (id, version, data) in plugins {
        Mock::given(method("GET"))
            .and(path(format!("/artifacts/{}-{}.tar.gz", id, version)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
            .mount(server)
            .await;
    }
}

fn setup(server: &MockServer, dir: &TempDir, verifier: Verifier) -> (Arc<Store>, Installer) {
    let store = Arc::new(Store::open(dir.path()).unwrap());
    let registry = Arc::new(
        RegistryClient::new(vec![server.uri()])
            .unwrap()
            .with_cache_ttl(Duration::ZERO),
    );
    let installer = Installer::new(Arc::clone(&store), registry, Arc::new(verifier));
    (store, installer)
}

fn binary_content(store: &Store, id: &str) -> String {
    fs::read_to_string(store.plugin_path(id).join("plugin.so")).unwrap()
}

fn staging_leftovers(base: &Path) -> Vec<String> {
    fs::read_dir(base)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with(".install-") || n.contains(".bak-") || n.contains(".failed-"))
        .collect()
}

#[tokio::test]
async fn test_fresh_install_from_tar_gz() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    publish(&server, &[("pkg", "1.0.0", tar_gz(&[("plugin.so", b"v1")]))]).await;
    let (store, installer) = setup(&server, &dir, Verifier::new());

    let result = installer.install("pkg", InstallOptions::default()).await.unwrap();

    assert!(result.installed);
    assert!(!result.updated);
    assert!(result.previous_version.is_none());
    assert_eq!(store.get("pkg").unwrap().version, "1.0.0");

    let record = store.get("pkg").unwrap();
    assert!(record.verified);
    assert!(record.enabled);
    assert_eq!(record.source, server.uri());
    assert_eq!(record.binary_path, store.plugin_path("pkg").join("plugin.so"));
    assert!(record.manifest_path.is_file());
    assert_eq!(record.binary_checksum, compute_checksum(b"v1"));
    assert_eq!(binary_content(&store, "pkg"), "v1");
    assert!(staging_leftovers(dir.path()).is_empty());
}

#[tokio::test]
async fn test_reinstall_without_force_fails() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    publish(&server, &[("pkg", "1.0.0", tar_gz(&[("plugin.so", b"v1")]))]).await;
    let (_store, installer) = setup(&server, &dir, Verifier::new());

    installer.install("pkg", InstallOptions::default()).await.unwrap();
    let err = installer
        .install("pkg", InstallOptions::default())
        .await
        .unwrap_err();

    assert!(err.to_string().contains("already installed"));
}

#[tokio::test]
async fn test_update_to_new_version() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    publish(&server, &[("pkg", "1.0.0", tar_gz(&[("plugin.so", b"v1")]))]).await;
    let (store, installer) = setup(&server, &dir, Verifier::new());

    let mut config = pluginsdk::PluginConfig::new();
    config.insert("token".to_string(), json!("abc"));
    installer
        .install(
            "pkg",
            InstallOptions {
                auto_update: true,
                config: config.clone(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    server.reset().await;
    publish(&server, &[("pkg", "1.1.0", tar_gz(&[("plugin.so", b"v2")]))]).await;

    let result = installer.update("pkg", UpdateOptions::default()).await.unwrap();

    assert!(result.updated);
    assert_eq!(result.previous_version.as_deref(), Some("1.0.0"));

    let record = store.get("pkg").unwrap();
    assert_eq!(record.version, "1.1.0");
    assert!(record.auto_update);
    assert_eq!(record.config, config);
    assert_eq!(binary_content(&store, "pkg"), "v2");
    assert!(staging_leftovers(dir.path()).is_empty());
}

#[tokio::test]
async fn test_update_same_version_is_rejected_unless_forced() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    publish(&server, &[("pkg", "1.0.0", tar_gz(&[("plugin.so", b"v1")]))]).await;
    let (_store, installer) = setup(&server, &dir, Verifier::new());

    installer.install("pkg", InstallOptions::default()).await.unwrap();

    let err = installer
        .update("pkg", UpdateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MarketplaceError::UpToDate(_)));

    let forced = installer
        .update(
            "pkg",
            UpdateOptions {
                force: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(forced.updated);
    assert_eq!(forced.previous_version.as_deref(), Some("1.0.0"));
}

#[tokio::test]
async fn test_tampered_artifact_is_rejected() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    let genuine = tar_gz(&[("plugin.so", b"v1")]);
    let tampered = tar_gz(&[("plugin.so", b"evil")]);

    Mock::given(method("GET"))
        .and(path("/index.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "version": "1",
            "plugins": [plugin_json(&server, "pkg", "1.0.0", &compute_checksum(&genuine))]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/artifacts/pkg-1.0.0.tar.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(tampered))
        .mount(&server)
        .await;

    let (store, installer) = setup(&server, &dir, Verifier::new());
    let err = installer
        .install("pkg", InstallOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, MarketplaceError::Verification(_)));
    assert!(!store.is_installed("pkg"));
    assert!(!store.plugin_dir_exists("pkg"));
    assert!(staging_leftovers(dir.path()).is_empty());
}

#[tokio::test]
async fn test_skip_verify_installs_unverified() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();

    Mock::given(method("GET"))
        .and(path("/index.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "version": "1",
            "plugins": [plugin_json(&server, "pkg", "1.0.0", &"0".repeat(64))]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/artifacts/pkg-1.0.0.tar.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(tar_gz(&[("plugin.so", b"v1")])))
        .mount(&server)
        .await;

    let (store, installer) = setup(&server, &dir, Verifier::new());
    installer
        .install(
            "pkg",
            InstallOptions {
                skip_verify: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(!store.get("pkg").unwrap().verified);
}

#[tokio::test]
async fn test_failed_update_keeps_previous_version() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    publish(&server, &[("pkg", "1.0.0", tar_gz(&[("plugin.so", b"v1")]))]).await;
    let (store, installer) = setup(&server, &dir, Verifier::new());
    installer.install("pkg", InstallOptions::default()).await.unwrap();

    // New version ships no binary, so extraction fails after download
    server.reset().await;
    publish(&server, &[("pkg", "1.1.0", tar_gz(&[("README.md", b"docs")]))]).await;

    let err = installer
        .update("pkg", UpdateOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, MarketplaceError::Extraction(_)));
    assert_eq!(store.get("pkg").unwrap().version, "1.0.0");
    assert_eq!(binary_content(&store, "pkg"), "v1");
    assert!(staging_leftovers(dir.path()).is_empty());
}

#[tokio::test]
async fn test_store_failure_rolls_back_activation() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    publish(&server, &[("pkg", "1.0.0", tar_gz(&[("plugin.so", b"v1")]))]).await;
    let (store, installer) = setup(&server, &dir, Verifier::new());
    installer.install("pkg", InstallOptions::default()).await.unwrap();

    server.reset().await;
    publish(&server, &[("pkg", "1.1.0", tar_gz(&[("plugin.so", b"v2")]))]).await;

    // A directory in place of index.json makes the store write fail
    fs::remove_file(store.index_path()).unwrap();
    fs::create_dir(store.index_path()).unwrap();

    let err = installer
        .update("pkg", UpdateOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, MarketplaceError::Store(_)));
    assert_eq!(store.get("pkg").unwrap().version, "1.0.0");
    assert_eq!(binary_content(&store, "pkg"), "v1");
    assert!(staging_leftovers(dir.path()).is_empty());
}

#[tokio::test]
async fn test_store_failure_on_fresh_install_leaves_no_directory() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    publish(&server, &[("pkg", "1.0.0", tar_gz(&[("plugin.so", b"v1")]))]).await;
    let (store, installer) = setup(&server, &dir, Verifier::new());

    fs::create_dir(store.index_path()).unwrap();

    assert!(installer.install("pkg", InstallOptions::default()).await.is_err());
    assert!(!store.is_installed("pkg"));
    assert!(!store.plugin_dir_exists("pkg"));
}

#[tokio::test]
async fn test_version_mismatch_and_unknown_plugin() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    publish(&server, &[("pkg", "1.0.0", tar_gz(&[("plugin.so", b"v1")]))]).await;
    let (_store, installer) = setup(&server, &dir, Verifier::new());

    let err = installer
        .install(
            "pkg",
            InstallOptions {
                version: Some("2.0.0".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MarketplaceError::VersionUnavailable { .. }));

    let err = installer
        .install("missing", InstallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MarketplaceError::PluginNotFound(_)));
}

#[tokio::test]
async fn test_no_artifact_for_platform() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let store = Arc::new(Store::open(dir.path()).unwrap());
    let registry = Arc::new(RegistryClient::new(vec![server.uri()]).unwrap());

    Mock::given(method("GET"))
        .and(path("/index.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "version": "1",
            "plugins": [{
                "id": "pkg",
                "version": "1.0.0",
                "artifacts": [{"os": "plan9", "arch": "mips", "url": "https://x/p.so"}]
            }]
        })))
        .mount(&server)
        .await;

    let installer = Installer::new(store, registry, Arc::new(Verifier::new()))
        .with_platform("linux", "amd64");
    let err = installer
        .install("pkg", InstallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MarketplaceError::NoCompatibleArtifact { .. }));
}

#[tokio::test]
async fn test_signed_artifact_policy() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    let (public, private) = generate_key_pair();

    let data = tar_gz(&[("plugin.so", b"signed")]);
    let mut signed = plugin_json(&server, "signed", "1.0.0", &compute_checksum(&data));
    signed["artifacts"][0]["signature"] = json!(sign_data(&data, &private));
    let unsigned = plugin_json(&server, "unsigned", "1.0.0", &compute_checksum(&data));

    Mock::given(method("GET"))
        .and(path("/index.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "version": "1",
            "plugins": [signed, unsigned]
        })))
        .mount(&server)
        .await;
    for id in ["signed", "unsigned"] {
        Mock::given(method("GET"))
            .and(path(format!("/artifacts/{}-1.0.0.tar.gz", id)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
            .mount(&server)
            .await;
    }

    let verifier = Verifier::new()
        .with_trusted_key("official", public)
        .with_signature_policy(SignaturePolicy::Required);
    let (store, installer) = setup(&server, &dir, verifier);

    installer.install("signed", InstallOptions::default()).await.unwrap();
    assert!(store.is_installed("signed"));

    let err = installer
        .install("unsigned", InstallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MarketplaceError::Verification(_)));
    assert!(!store.plugin_dir_exists("unsigned"));
}

#[tokio::test]
async fn test_verify_installed_detects_tampering() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    publish(&server, &[("pkg", "1.0.0", tar_gz(&[("plugin.so", b"v1")]))]).await;
    let (store, installer) = setup(&server, &dir, Verifier::new());
    installer.install("pkg", InstallOptions::default()).await.unwrap();

    assert!(installer.verify_installed("pkg").await.unwrap().valid);

    fs::write(store.plugin_path("pkg").join("plugin.so"), b"patched").unwrap();
    let result = installer.verify_installed("pkg").await.unwrap();
    assert!(!result.valid);
    assert!(!result.checksum_valid);
}

#[tokio::test]
async fn test_uninstall_removes_files_and_record() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    publish(&server, &[("pkg", "1.0.0", tar_gz(&[("plugin.so", b"v1")]))]).await;
    let (store, installer) = setup(&server, &dir, Verifier::new());
    installer.install("pkg", InstallOptions::default()).await.unwrap();

    installer.uninstall("pkg").await.unwrap();
    assert!(!store.is_installed("pkg"));
    assert!(!store.plugin_dir_exists("pkg"));

    assert!(matches!(
        installer.uninstall("pkg").await,
        Err(MarketplaceError::NotInstalled(_))
    ));
}

#[tokio::test]
async fn test_update_all_and_check_updates() {
    let server = MockServer::start().await;
    let dir = TempDir::new().unwrap();
    publish(
        &server,
        &[
            ("auto", "1.0.0", tar_gz(&[("plugin.so", b"a1")])),
            ("manual", "1.0.0", tar_gz(&[("plugin.so", b"m1")])),
            ("steady", "1.0.0", tar_gz(&[("plugin.so", b"s1")])),
        ],
    )
    .await;
    let (store, installer) = setup(&server, &dir, Verifier::new());

    let auto = InstallOptions {
        auto_update: true,
        ..Default::default()
    };
    installer.install("auto", auto.clone()).await.unwrap();
    installer.install("manual", InstallOptions::default()).await.unwrap();
    installer.install("steady", auto).await.unwrap();

    server.reset().await;
    publish(
        &server,
        &[
            ("auto", "1.1.0", tar_gz(&[("plugin.so", b"a2")])),
            ("manual", "1.1.0", tar_gz(&[("plugin.so", b"m2")])),
            ("steady", "1.0.0", tar_gz(&[("plugin.so", b"s1")])),
        ],
    )
    .await;

    let updates = installer.check_updates().await.unwrap();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates.get("auto").map(String::as_str), Some("1.1.0"));
    assert_eq!(updates.get("manual").map(String::as_str), Some("1.1.0"));

    let results = installer.update_all().await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].plugin.id, "auto");
    assert_eq!(store.get("auto").unwrap().version, "1.1.0");
    assert_eq!(store.get("manual").unwrap().version, "1.0.0");
    assert_eq!(store.get("steady").unwrap().version, "1.0.0");
}
