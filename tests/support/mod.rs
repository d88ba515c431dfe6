// Copyright 2025 The Uptane Client Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Shared scaffolding for the end-to-end scenario tests: a simulated
//! backend that generates and signs role metadata, plus a client wired to
//! mock collaborators.

use futures::channel::mpsc;
use serde_json::{json, Value};
use uptane_client::bootloader::mock::MockBootloader;
use uptane_client::canonical::canonicalize;
use uptane_client::config::Config;
use uptane_client::crypto::{self, HashAlgorithm};
use uptane_client::events::Event;
use uptane_client::keystore::{EphemeralKeyStore, KeyStore};
use uptane_client::pacman::mock::MockPackageManager;
use uptane_client::storage::{MemStorage, Storage};
use uptane_client::transport::mock::MockTransport;
use uptane_client::UptaneClient;

pub const DIRECTOR: &str = "https://director.example";
pub const IMAGES: &str = "https://images.example";
pub const GATEWAY: &str = "https://gateway.example";
pub const PRIMARY_SERIAL: &str = "primary-1";
pub const PRIMARY_HW: &str = "hw-primary";
pub const EXPIRES: &str = "2030-01-01T00:00:00Z";

pub type TestClient<S> =
    UptaneClient<MockTransport, S, MockPackageManager, MockBootloader, EphemeralKeyStore>;

pub fn config() -> Config {
    let mut config = Config::default();
    config.uptane.director_server = DIRECTOR.to_string();
    config.uptane.repo_server = IMAGES.to_string();
    config.uptane.primary_ecu_serial = PRIMARY_SERIAL.to_string();
    config.uptane.primary_ecu_hardware_id = PRIMARY_HW.to_string();
    config.tls.server = GATEWAY.to_string();
    config.pacman.ostree_server = "https://treehub.example".to_string();
    config
}

pub fn build_client<S: Storage>(
    storage: S,
    pacman: MockPackageManager,
    bootloader: MockBootloader,
) -> (TestClient<S>, mpsc::UnboundedReceiver<Event>) {
    UptaneClient::new(
        config(),
        MockTransport::new(),
        storage,
        pacman,
        bootloader,
        EphemeralKeyStore::generate().unwrap(),
    )
    .expect("build client")
}

pub struct TestEnv {
    pub client: TestClient<MemStorage>,
    pub events: mpsc::UnboundedReceiver<Event>,
    pub keys: BackendKeys,
}

impl TestEnv {
    pub fn new() -> Self {
        Self::with(MockPackageManager::new(), MockBootloader::new())
    }

    pub fn with(pacman: MockPackageManager, bootloader: MockBootloader) -> Self {
        let (client, events) = build_client(MemStorage::new(), pacman, bootloader);
        TestEnv { client, events, keys: BackendKeys::generate() }
    }

    /// Drain everything currently on the event channel.
    pub fn take_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(Some(event)) = self.events.try_next() {
            events.push(event);
        }
        events
    }

    /// Serve a consistent v1 backend on both repositories.
    pub fn serve_backend(&mut self, director_targets: Value, images_targets: Value) {
        let keys = BackendKeys::generate();
        serve_backend_on(self.client.transport_mut(), &keys, director_targets, images_targets);
        self.keys = keys;
    }
}

/// Serve a consistent v1 backend for `keys` on `transport`.
pub fn serve_backend_on(
    transport: &mut MockTransport,
    keys: &BackendKeys,
    director_targets: Value,
    images_targets: Value,
) {
    let director_root = keys.director_root(1);
    let images_root = keys.images_root(1);
    let director_targets = keys.director_targets(1, director_targets);
    let (timestamp, snapshot, images_targets) = keys.images_chain(1, images_targets);

    transport.serve(format!("{}/1.root.json", DIRECTOR), director_root.clone());
    transport.serve(format!("{}/root.json", DIRECTOR), director_root);
    transport.serve(format!("{}/targets.json", DIRECTOR), director_targets);
    transport.serve(format!("{}/1.root.json", IMAGES), images_root.clone());
    transport.serve(format!("{}/root.json", IMAGES), images_root);
    transport.serve(format!("{}/timestamp.json", IMAGES), timestamp);
    transport.serve(format!("{}/snapshot.json", IMAGES), snapshot);
    transport.serve(format!("{}/targets.json", IMAGES), images_targets);
}

/// The signing keys of the simulated backend, one per (repo, role).
pub struct BackendKeys {
    pub director_root: EphemeralKeyStore,
    pub director_targets: EphemeralKeyStore,
    pub images_root: EphemeralKeyStore,
    pub images_timestamp: EphemeralKeyStore,
    pub images_snapshot: EphemeralKeyStore,
    pub images_targets: EphemeralKeyStore,
}

impl BackendKeys {
    pub fn generate() -> Self {
        BackendKeys {
            director_root: EphemeralKeyStore::generate().unwrap(),
            director_targets: EphemeralKeyStore::generate().unwrap(),
            images_root: EphemeralKeyStore::generate().unwrap(),
            images_timestamp: EphemeralKeyStore::generate().unwrap(),
            images_snapshot: EphemeralKeyStore::generate().unwrap(),
            images_targets: EphemeralKeyStore::generate().unwrap(),
        }
    }

    fn key_entry(keys: &mut serde_json::Map<String, Value>, store: &EphemeralKeyStore) -> Value {
        let key = store.public_key();
        keys.insert(key.key_id().to_string(), key.to_uptane());
        json!([key.key_id().as_str()])
    }

    pub fn director_root(&self, version: u64) -> Vec<u8> {
        self.director_root_with(version, &self.director_root, &[&self.director_root])
    }

    /// A Director root whose root role is held by `root_key`, signed by
    /// `signers` (rotation scenarios sign with both the old and new key).
    pub fn director_root_with(
        &self,
        version: u64,
        root_key: &EphemeralKeyStore,
        signers: &[&EphemeralKeyStore],
    ) -> Vec<u8> {
        let mut keys = serde_json::Map::new();
        let root_ids = Self::key_entry(&mut keys, root_key);
        let targets_ids = Self::key_entry(&mut keys, &self.director_targets);
        let signed = json!({
            "_type": "Root",
            "expires": EXPIRES,
            "version": version,
            "keys": keys,
            "roles": {
                "root": {"keyids": root_ids, "threshold": 1},
                "targets": {"keyids": targets_ids, "threshold": 1},
            },
        });
        sign(&signed, signers)
    }

    pub fn images_root(&self, version: u64) -> Vec<u8> {
        let mut keys = serde_json::Map::new();
        let root_ids = Self::key_entry(&mut keys, &self.images_root);
        let timestamp_ids = Self::key_entry(&mut keys, &self.images_timestamp);
        let snapshot_ids = Self::key_entry(&mut keys, &self.images_snapshot);
        let targets_ids = Self::key_entry(&mut keys, &self.images_targets);
        let signed = json!({
            "_type": "Root",
            "expires": EXPIRES,
            "version": version,
            "keys": keys,
            "roles": {
                "root": {"keyids": root_ids, "threshold": 1},
                "timestamp": {"keyids": timestamp_ids, "threshold": 1},
                "snapshot": {"keyids": snapshot_ids, "threshold": 1},
                "targets": {"keyids": targets_ids, "threshold": 1},
            },
        });
        sign(&signed, &[&self.images_root])
    }

    pub fn director_targets(&self, version: u64, targets: Value) -> Vec<u8> {
        let signed = json!({
            "_type": "Targets",
            "expires": EXPIRES,
            "version": version,
            "targets": targets,
        });
        sign(&signed, &[&self.director_targets])
    }

    /// Timestamp, snapshot and targets for the Images repository, with the
    /// timestamp bound to the exact snapshot bytes and the snapshot bounding
    /// the targets.
    pub fn images_chain(&self, version: u64, targets: Value) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let targets_doc = sign(
            &json!({
                "_type": "Targets",
                "expires": EXPIRES,
                "version": version,
                "targets": targets,
            }),
            &[&self.images_targets],
        );
        let snapshot_doc = sign(
            &json!({
                "_type": "Snapshot",
                "expires": EXPIRES,
                "version": version,
                "meta": {
                    "targets.json": {"version": version, "length": targets_doc.len()},
                },
            }),
            &[&self.images_snapshot],
        );
        let timestamp_doc = self.timestamp_for(version, &snapshot_doc);
        (timestamp_doc, snapshot_doc, targets_doc)
    }

    pub fn timestamp_for(&self, version: u64, snapshot: &[u8]) -> Vec<u8> {
        let digest = crypto::digest(&HashAlgorithm::Sha256, snapshot).unwrap();
        let signed = json!({
            "_type": "Timestamp",
            "expires": EXPIRES,
            "version": version,
            "meta": {
                "snapshot.json": {
                    "version": version,
                    "length": snapshot.len(),
                    "hashes": {"sha256": digest.to_hex()},
                },
            },
        });
        sign(&signed, &[&self.images_timestamp])
    }
}

/// Sign a role body the way the backend does.
pub fn sign(signed: &Value, signers: &[&EphemeralKeyStore]) -> Vec<u8> {
    let canonical = canonicalize(signed).unwrap();
    let signatures: Vec<Value> = signers
        .iter()
        .map(|signer| serde_json::to_value(signer.sign(&canonical).unwrap()).unwrap())
        .collect();
    serde_json::to_vec(&json!({"signatures": signatures, "signed": signed})).unwrap()
}

/// A binary target entry addressed to one ECU.
pub fn binary_target(filename: &str, payload: &[u8], serial: &str, hw: &str) -> (String, Value) {
    let digest = crypto::digest(&HashAlgorithm::Sha256, payload).unwrap();
    (
        filename.to_string(),
        json!({
            "length": payload.len(),
            "hashes": {"sha256": digest.to_hex()},
            "custom": {
                "ecuIdentifiers": {(serial): {"hardwareId": hw}},
                "targetFormat": "BINARY",
            },
        }),
    )
}

/// Build a `targets` map out of entries.
pub fn targets_map(entries: &[(String, Value)]) -> Value {
    let mut map = serde_json::Map::new();
    for (filename, entry) in entries {
        map.insert(filename.clone(), entry.clone());
    }
    Value::Object(map)
}
