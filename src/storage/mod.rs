// Copyright 2025 The Uptane Client Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Durable device state.
//!
//! Everything the client must remember across process lifetimes lives behind
//! [`Storage`]: the root history per repository, the current non-root role
//! copies, the ECU serial table, the append-only installed-versions log, the
//! last installation result, TLS credentials and the report queue.
//!
//! [`FsStorage`] is the on-device implementation; writes are atomic with
//! respect to crashes. [`MemStorage`] backs the test environments.

mod fs;
mod memory;

pub use fs::FsStorage;
pub use memory::MemStorage;

use crate::metadata::{EcuSerial, HardwareId, RepositoryType, Role, Target};
use crate::pacman::InstallationResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt stored record: {0}")]
    Json(#[from] serde_json::Error),
}

/// TLS client credentials, when they are file-backed rather than living in
/// an HSM.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsCredentials {
    pub ca: String,
    pub cert: String,
    pub pkey: String,
}

/// One entry of the append-only installation history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InstalledVersion {
    pub target: Target,
    pub ecu_serial: EcuSerial,
    pub installed_at: DateTime<Utc>,
}

pub trait Storage {
    /// Store a root at its version slot, overwriting any prior copy there.
    /// Roots are retained per version so Secondary rotation can replay the
    /// chain from any starting point.
    fn store_root(
        &mut self,
        repo: RepositoryType,
        version: u64,
        bytes: &[u8],
    ) -> Result<(), StorageError>;

    fn load_root(&self, repo: RepositoryType, version: u64) -> Result<Option<Vec<u8>>, StorageError>;

    fn latest_root_version(&self, repo: RepositoryType) -> Result<Option<u64>, StorageError>;

    fn load_latest_root(&self, repo: RepositoryType) -> Result<Option<Vec<u8>>, StorageError> {
        match self.latest_root_version(repo)? {
            Some(version) => self.load_root(repo, version),
            None => Ok(None),
        }
    }

    /// Replace the current copy of a non-root role. Old content is not
    /// retained.
    fn store_non_root(
        &mut self,
        repo: RepositoryType,
        role: Role,
        bytes: &[u8],
    ) -> Result<(), StorageError>;

    fn load_non_root(&self, repo: RepositoryType, role: Role)
        -> Result<Option<Vec<u8>>, StorageError>;

    /// Wipe timestamp, snapshot and targets for a repository. Called after
    /// every successful root rotation, since the new root may have revoked
    /// the keys that signed them.
    fn clear_non_root(&mut self, repo: RepositoryType) -> Result<(), StorageError>;

    /// Persist the ECU table. Index 0 is the Primary.
    fn store_ecu_serials(
        &mut self,
        serials: &[(EcuSerial, HardwareId)],
    ) -> Result<(), StorageError>;

    fn load_ecu_serials(&self) -> Result<Vec<(EcuSerial, HardwareId)>, StorageError>;

    /// Append to the installation history. Entries are never rewritten.
    fn save_installed_version(&mut self, version: &InstalledVersion) -> Result<(), StorageError>;

    fn load_installed_versions(&self) -> Result<Vec<InstalledVersion>, StorageError>;

    fn store_installation_result(
        &mut self,
        result: &InstallationResult,
    ) -> Result<(), StorageError>;

    fn load_installation_result(&self) -> Result<Option<InstallationResult>, StorageError>;

    /// Remember (or forget, with `None`) the target whose installation is
    /// waiting for a reboot to complete.
    fn store_pending_target(&mut self, target: Option<&Target>) -> Result<(), StorageError>;

    fn load_pending_target(&self) -> Result<Option<Target>, StorageError>;

    fn store_tls_creds(&mut self, creds: &TlsCredentials) -> Result<(), StorageError>;

    fn load_tls_creds(&self) -> Result<Option<TlsCredentials>, StorageError>;

    /// Append a report to the durable FIFO, returning its sequence number.
    fn enqueue_report(&mut self, report: &Value) -> Result<u64, StorageError>;

    /// All queued reports in FIFO order.
    fn load_reports(&self) -> Result<Vec<(u64, Value)>, StorageError>;

    fn remove_report(&mut self, seq: u64) -> Result<(), StorageError>;

    /// Store a downloaded binary payload under the target's file name.
    fn store_target_payload(&mut self, filename: &str, bytes: &[u8]) -> Result<(), StorageError>;

    fn load_target_payload(&self, filename: &str) -> Result<Option<Vec<u8>>, StorageError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::HardwareId;
    use crate::pacman::ResultCode;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn target(filename: &str) -> Target {
        serde_json::from_value(json!({
            "filename": filename,
            "length": 4,
            "hashes": {"sha256": "00aa"},
            "custom": {"ecuIdentifiers": {}, "targetFormat": "BINARY"},
        }))
        .unwrap()
    }

    fn installed(filename: &str) -> InstalledVersion {
        InstalledVersion {
            target: target(filename),
            ecu_serial: EcuSerial::new("primary-1"),
            installed_at: Utc::now(),
        }
    }

    // Both implementations must honor the same contract.
    fn exercise(storage: &mut dyn Storage) {
        // Root history is versioned and the latest wins.
        assert_eq!(storage.latest_root_version(RepositoryType::Director).unwrap(), None);
        storage.store_root(RepositoryType::Director, 1, b"root-1").unwrap();
        storage.store_root(RepositoryType::Director, 2, b"root-2").unwrap();
        storage.store_root(RepositoryType::Images, 1, b"images-root-1").unwrap();
        assert_eq!(storage.latest_root_version(RepositoryType::Director).unwrap(), Some(2));
        assert_eq!(
            storage.load_root(RepositoryType::Director, 1).unwrap(),
            Some(b"root-1".to_vec())
        );
        assert_eq!(
            storage.load_latest_root(RepositoryType::Director).unwrap(),
            Some(b"root-2".to_vec())
        );
        assert_eq!(
            storage.load_latest_root(RepositoryType::Images).unwrap(),
            Some(b"images-root-1".to_vec())
        );

        // Overwriting a version slot replaces its content.
        storage.store_root(RepositoryType::Director, 2, b"root-2b").unwrap();
        assert_eq!(
            storage.load_root(RepositoryType::Director, 2).unwrap(),
            Some(b"root-2b".to_vec())
        );

        // Non-root roles are single-slot per (repo, role).
        storage
            .store_non_root(RepositoryType::Images, Role::Timestamp, b"ts-7")
            .unwrap();
        storage
            .store_non_root(RepositoryType::Images, Role::Targets, b"tgt-3")
            .unwrap();
        storage
            .store_non_root(RepositoryType::Director, Role::Targets, b"dir-tgt")
            .unwrap();
        assert_eq!(
            storage.load_non_root(RepositoryType::Images, Role::Timestamp).unwrap(),
            Some(b"ts-7".to_vec())
        );

        // clear_non_root wipes one repository, not the other.
        storage.clear_non_root(RepositoryType::Images).unwrap();
        assert_eq!(storage.load_non_root(RepositoryType::Images, Role::Timestamp).unwrap(), None);
        assert_eq!(storage.load_non_root(RepositoryType::Images, Role::Targets).unwrap(), None);
        assert_eq!(
            storage.load_non_root(RepositoryType::Director, Role::Targets).unwrap(),
            Some(b"dir-tgt".to_vec())
        );
        // Roots survive the wipe.
        assert_eq!(storage.latest_root_version(RepositoryType::Images).unwrap(), Some(1));

        // ECU table round-trips in order.
        let serials = vec![
            (EcuSerial::new("primary-1"), HardwareId::new("hw-prime")),
            (EcuSerial::new("sec-1"), HardwareId::new("hw-sec")),
        ];
        storage.store_ecu_serials(&serials).unwrap();
        assert_eq!(storage.load_ecu_serials().unwrap(), serials);

        // Installation log is append-only.
        storage.save_installed_version(&installed("fw-1.bin")).unwrap();
        storage.save_installed_version(&installed("fw-2.bin")).unwrap();
        let log = storage.load_installed_versions().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].target.filename, "fw-1.bin");
        assert_eq!(log[1].target.filename, "fw-2.bin");

        // Last installation result and pending target.
        assert_eq!(storage.load_installation_result().unwrap(), None);
        let result = InstallationResult::new("fw-2.bin", ResultCode::NeedsCompletion, "reboot");
        storage.store_installation_result(&result).unwrap();
        assert_eq!(storage.load_installation_result().unwrap(), Some(result));
        storage.store_pending_target(Some(&target("fw-2.bin"))).unwrap();
        assert_eq!(
            storage.load_pending_target().unwrap().unwrap().filename,
            "fw-2.bin"
        );
        storage.store_pending_target(None).unwrap();
        assert_eq!(storage.load_pending_target().unwrap(), None);

        // TLS credentials.
        let creds = TlsCredentials {
            ca: "ca".into(),
            cert: "cert".into(),
            pkey: "pkey".into(),
        };
        storage.store_tls_creds(&creds).unwrap();
        assert_eq!(storage.load_tls_creds().unwrap(), Some(creds));

        // Report queue is FIFO and removal is per entry.
        let a = storage.enqueue_report(&json!({"n": 1})).unwrap();
        let b = storage.enqueue_report(&json!({"n": 2})).unwrap();
        assert!(a < b);
        let reports = storage.load_reports().unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].1, json!({"n": 1}));
        storage.remove_report(a).unwrap();
        let reports = storage.load_reports().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].0, b);

        // Target payloads.
        assert_eq!(storage.load_target_payload("fw-1.bin").unwrap(), None);
        storage.store_target_payload("fw-1.bin", b"\x7fELF").unwrap();
        assert_eq!(
            storage.load_target_payload("fw-1.bin").unwrap(),
            Some(b"\x7fELF".to_vec())
        );
    }

    #[test]
    fn mem_storage_contract() {
        let mut storage = MemStorage::new();
        exercise(&mut storage);
    }

    #[test]
    fn fs_storage_contract() {
        let dir = TempDir::new().unwrap();
        let mut storage = FsStorage::new(dir.path()).unwrap();
        exercise(&mut storage);
    }

    #[test]
    fn fs_storage_state_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut storage = FsStorage::new(dir.path()).unwrap();
            storage.store_root(RepositoryType::Director, 1, b"root-1").unwrap();
            storage.save_installed_version(&installed("fw-1.bin")).unwrap();
            storage.enqueue_report(&json!({"n": 1})).unwrap();
        }
        let storage = FsStorage::new(dir.path()).unwrap();
        assert_eq!(
            storage.load_latest_root(RepositoryType::Director).unwrap(),
            Some(b"root-1".to_vec())
        );
        assert_eq!(storage.load_installed_versions().unwrap().len(), 1);
        assert_eq!(storage.load_reports().unwrap().len(), 1);
    }

    #[test]
    fn fs_storage_ignores_foreign_files_in_root_history() {
        let dir = TempDir::new().unwrap();
        let mut storage = FsStorage::new(dir.path()).unwrap();
        storage.store_root(RepositoryType::Director, 3, b"root-3").unwrap();
        std::fs::write(dir.path().join("roots/director/readme.txt"), b"hi").unwrap();
        assert_eq!(storage.latest_root_version(RepositoryType::Director).unwrap(), Some(3));
    }

    #[test]
    fn fs_storage_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let mut storage = FsStorage::new(dir.path()).unwrap();
        storage.store_non_root(RepositoryType::Images, Role::Targets, b"tgt").unwrap();
        storage.store_installation_result(&InstallationResult::ok("x")).unwrap();
        let stray: Vec<_> = walk(dir.path())
            .into_iter()
            .filter(|p| p.extension().map_or(false, |e| e == "tmp"))
            .collect();
        assert_eq!(stray, Vec::<std::path::PathBuf>::new());
    }

    fn walk(dir: &std::path::Path) -> Vec<std::path::PathBuf> {
        let mut out = Vec::new();
        if let Ok(entries) = std::fs::read_dir(dir) {
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    out.extend(walk(&path));
                } else {
                    out.push(path);
                }
            }
        }
        out
    }
}
