// Copyright 2025 The Uptane Client Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Secondary ECUs and the fan-out dispatcher.
//!
//! Secondaries are reached only through the Primary. The dispatcher owns the
//! connections during a fan-out and keeps per-ECU failures from aborting the
//! others; the orchestrator supplies the metadata and root history to push.

use crate::canonical::canonicalize;
use crate::crypto::PublicKey;
use crate::error::{Error, Result};
use crate::metadata::{EcuSerial, HardwareId, RepositoryType};
use log::{error, warn};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// The full verified metadata set a Secondary needs for its own checks.
#[derive(Clone, Debug)]
pub struct MetadataBundle {
    pub director_root: Vec<u8>,
    pub director_targets: Vec<u8>,
    pub images_root: Vec<u8>,
    pub images_timestamp: Vec<u8>,
    pub images_snapshot: Vec<u8>,
    pub images_targets: Vec<u8>,
}

/// One Secondary ECU link (network or serial; the transport is the
/// implementor's business).
pub trait Secondary {
    fn serial(&self) -> EcuSerial;

    fn hw_id(&self) -> HardwareId;

    fn public_key(&self) -> PublicKey;

    /// Latest root version the Secondary holds for a repository, or `None`
    /// when it cannot say.
    fn root_version(&self, repo: RepositoryType) -> Option<u64>;

    fn put_root(&mut self, bytes: &[u8], repo: RepositoryType) -> bool;

    fn put_metadata(&mut self, bundle: &MetadataBundle) -> bool;

    fn send_firmware(&mut self, payload: &[u8]) -> bool;

    fn get_manifest(&self) -> Option<Value>;
}

/// A Secondary's manifest that passed self-verification.
pub struct VerifiedManifest {
    pub serial: EcuSerial,
    pub manifest: Value,
    /// File name the Secondary reports as installed, when present.
    pub filepath: Option<String>,
}

/// Owns the registered Secondaries and performs per-ECU operations.
pub struct SecondaryDispatcher {
    secondaries: BTreeMap<EcuSerial, Box<dyn Secondary>>,
}

impl SecondaryDispatcher {
    pub fn new() -> Self {
        SecondaryDispatcher { secondaries: BTreeMap::new() }
    }

    /// Register a Secondary. A duplicate serial is refused.
    pub fn register(&mut self, secondary: Box<dyn Secondary>) -> bool {
        let serial = secondary.serial();
        if self.secondaries.contains_key(&serial) {
            error!("multiple secondaries found with the same serial: {}", serial);
            return false;
        }
        self.secondaries.insert(serial, secondary);
        true
    }

    pub fn is_registered(&self, serial: &EcuSerial) -> bool {
        self.secondaries.contains_key(serial)
    }

    pub fn serials(&self) -> Vec<EcuSerial> {
        self.secondaries.keys().cloned().collect()
    }

    pub fn hw_ids(&self) -> HashMap<EcuSerial, HardwareId> {
        self.secondaries
            .iter()
            .map(|(serial, sec)| (serial.clone(), sec.hw_id()))
            .collect()
    }

    pub fn root_version(&self, serial: &EcuSerial, repo: RepositoryType) -> Option<u64> {
        self.secondaries.get(serial).and_then(|sec| sec.root_version(repo))
    }

    pub fn push_root(
        &mut self,
        serial: &EcuSerial,
        repo: RepositoryType,
        bytes: &[u8],
    ) -> Result<()> {
        let secondary = self
            .secondaries
            .get_mut(serial)
            .ok_or_else(|| Error::UnknownEcu(serial.clone()))?;
        if !secondary.put_root(bytes, repo) {
            return Err(Error::SecondaryUnreachable(serial.clone()));
        }
        Ok(())
    }

    pub fn put_metadata(&mut self, serial: &EcuSerial, bundle: &MetadataBundle) -> Result<()> {
        let secondary = self
            .secondaries
            .get_mut(serial)
            .ok_or_else(|| Error::UnknownEcu(serial.clone()))?;
        if !secondary.put_metadata(bundle) {
            return Err(Error::SecondaryUnreachable(serial.clone()));
        }
        Ok(())
    }

    pub fn send_firmware(&mut self, serial: &EcuSerial, payload: &[u8]) -> Result<()> {
        let secondary = self
            .secondaries
            .get_mut(serial)
            .ok_or_else(|| Error::UnknownEcu(serial.clone()))?;
        if !secondary.send_firmware(payload) {
            return Err(Error::SecondaryUnreachable(serial.clone()));
        }
        Ok(())
    }

    /// Collect every Secondary's version manifest, keeping only those whose
    /// signature verifies against the Secondary's own public key. Failures
    /// are logged and the ECU is left out of the aggregate.
    pub fn collect_manifests(&self) -> Vec<VerifiedManifest> {
        let mut manifests = Vec::new();
        for (serial, secondary) in &self.secondaries {
            let manifest = match secondary.get_manifest() {
                Some(manifest) => manifest,
                None => {
                    warn!("no manifest from secondary {}", serial);
                    continue;
                }
            };
            if !manifest_self_verifies(&manifest, &secondary.public_key()) {
                error!("secondary {} manifest failed verification, omitting", serial);
                continue;
            }
            let filepath = manifest["signed"]["installed_image"]["filepath"]
                .as_str()
                .map(String::from);
            manifests.push(VerifiedManifest { serial: serial.clone(), manifest, filepath });
        }
        manifests
    }
}

impl Default for SecondaryDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

fn manifest_self_verifies(manifest: &Value, key: &PublicKey) -> bool {
    let signed = match manifest.get("signed") {
        Some(signed) => signed,
        None => return false,
    };
    let signatures = match manifest.get("signatures").and_then(Value::as_array) {
        Some(signatures) if !signatures.is_empty() => signatures,
        _ => return false,
    };
    let canonical = match canonicalize(signed) {
        Ok(canonical) => canonical,
        Err(_) => return false,
    };
    signatures.iter().any(|sig| {
        sig.get("sig")
            .and_then(Value::as_str)
            .map(|sig| key.verify_signature(&canonical, sig))
            .unwrap_or(false)
    })
}

pub mod mock {
    use super::*;
    use crate::keystore::{EphemeralKeyStore, KeyStore};
    use crate::metadata::extract_version_untrusted;
    use serde_json::json;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Observable state of a [`MockSecondary`]. Tests keep a handle to it
    /// (via [`MockSecondary::state`]) after the mock is boxed into the
    /// dispatcher.
    #[derive(Default)]
    pub struct SecondaryState {
        /// File name this Secondary reports as installed.
        pub installed_filepath: String,
        /// When set, every RPC fails.
        pub unreachable: bool,
        /// When set, the manifest is signed with garbage.
        pub corrupt_manifest: bool,
        pub root_versions: HashMap<RepositoryType, u64>,
        pub received_roots: Vec<(RepositoryType, Vec<u8>)>,
        pub received_metadata: Vec<MetadataBundle>,
        pub received_firmware: Vec<Vec<u8>>,
    }

    /// A scriptable in-process Secondary.
    pub struct MockSecondary {
        serial: EcuSerial,
        hw_id: HardwareId,
        keystore: EphemeralKeyStore,
        state: Rc<RefCell<SecondaryState>>,
    }

    impl MockSecondary {
        pub fn new(serial: &str, hw_id: &str) -> Self {
            let state = SecondaryState {
                installed_filepath: "noimage".to_string(),
                ..Default::default()
            };
            MockSecondary {
                serial: EcuSerial::new(serial),
                hw_id: HardwareId::new(hw_id),
                keystore: EphemeralKeyStore::generate().unwrap(),
                state: Rc::new(RefCell::new(state)),
            }
        }

        pub fn state(&self) -> Rc<RefCell<SecondaryState>> {
            Rc::clone(&self.state)
        }
    }

    impl Secondary for MockSecondary {
        fn serial(&self) -> EcuSerial {
            self.serial.clone()
        }

        fn hw_id(&self) -> HardwareId {
            self.hw_id.clone()
        }

        fn public_key(&self) -> PublicKey {
            self.keystore.public_key().clone()
        }

        fn root_version(&self, repo: RepositoryType) -> Option<u64> {
            self.state.borrow().root_versions.get(&repo).copied()
        }

        fn put_root(&mut self, bytes: &[u8], repo: RepositoryType) -> bool {
            let mut state = self.state.borrow_mut();
            if state.unreachable {
                return false;
            }
            state.received_roots.push((repo, bytes.to_vec()));
            if let Ok(version) = extract_version_untrusted(bytes) {
                state.root_versions.insert(repo, version);
            }
            true
        }

        fn put_metadata(&mut self, bundle: &MetadataBundle) -> bool {
            let mut state = self.state.borrow_mut();
            if state.unreachable {
                return false;
            }
            state.received_metadata.push(bundle.clone());
            true
        }

        fn send_firmware(&mut self, payload: &[u8]) -> bool {
            let mut state = self.state.borrow_mut();
            if state.unreachable {
                return false;
            }
            state.received_firmware.push(payload.to_vec());
            true
        }

        fn get_manifest(&self) -> Option<Value> {
            let state = self.state.borrow();
            if state.unreachable {
                return None;
            }
            let signed = json!({
                "ecu_serial": self.serial.as_str(),
                "installed_image": {
                    "filepath": state.installed_filepath,
                    "fileinfo": {"length": 0, "hashes": {}},
                },
            });
            if state.corrupt_manifest {
                return Some(json!({
                    "signatures": [{"keyid": self.keystore.public_key().key_id().as_str(),
                                    "sig": "bm90IGEgcmVhbCBzaWduYXR1cmU="}],
                    "signed": signed,
                }));
            }
            crate::keystore::sign_payload(&self.keystore, signed).ok()
        }
    }
}
