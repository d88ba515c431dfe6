// Copyright 2025 The Uptane Client Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The Images repository: fleet-wide provenance for firmware images.
//!
//! Runs the full role chain: root, then timestamp, then snapshot (bounded
//! and cross-checked by timestamp), then targets (bounded and version-pinned
//! by snapshot).

use super::RepoState;
use crate::crypto;
use crate::error::{Error, Result};
use crate::metadata::{
    RepositoryType, Role, SnapshotMetadata, TargetsMetadata, TimestampMetadata,
};
use chrono::{DateTime, Utc};

pub struct ImagesRepo {
    state: RepoState,
    timestamp: Option<TimestampMetadata>,
    snapshot: Option<SnapshotMetadata>,
    targets: Option<TargetsMetadata>,
}

impl ImagesRepo {
    pub fn new() -> Self {
        ImagesRepo {
            state: RepoState::new(RepositoryType::Images),
            timestamp: None,
            snapshot: None,
            targets: None,
        }
    }

    /// Drop all verified state before a fresh iteration.
    pub fn reset(&mut self) {
        self.state.reset();
        self.timestamp = None;
        self.snapshot = None;
        self.targets = None;
    }

    pub fn init_root(&mut self, bytes: &[u8]) -> Result<()> {
        self.state.init_root(bytes)
    }

    pub fn verify_root(&mut self, bytes: &[u8]) -> Result<()> {
        self.state.verify_root(bytes)
    }

    pub fn root_version(&self) -> u64 {
        self.state.root_version()
    }

    pub fn check_root_expired(&self, now: &DateTime<Utc>) -> Result<()> {
        self.state.check_root_expired(now)
    }

    pub fn verify_timestamp(&mut self, bytes: &[u8]) -> Result<()> {
        let doc = self.state.verify_signed(Role::Timestamp, bytes)?;
        self.timestamp = Some(TimestampMetadata::from_signed(&doc.signed)?);
        Ok(())
    }

    pub fn timestamp(&self) -> Option<&TimestampMetadata> {
        self.timestamp.as_ref()
    }

    pub fn check_timestamp_expired(&self, now: &DateTime<Utc>) -> Result<()> {
        let expired = self.timestamp.as_ref().map(|t| t.expired(now)).unwrap_or(true);
        if expired {
            return Err(Error::ExpiredMetadata {
                repo: RepositoryType::Images,
                role: Role::Timestamp,
            });
        }
        Ok(())
    }

    /// Size bound for the snapshot fetch, as recorded by the verified
    /// timestamp.
    pub fn snapshot_size(&self) -> Option<u64> {
        self.timestamp.as_ref().and_then(|t| t.snapshot.length)
    }

    /// Verify a snapshot document.
    ///
    /// Beyond signatures this checks the document against what the verified
    /// timestamp recorded about it (length and hashes), and refuses any role
    /// whose version went backwards relative to `prior` (the last snapshot
    /// this device accepted).
    pub fn verify_snapshot(
        &mut self,
        bytes: &[u8],
        prior: Option<&SnapshotMetadata>,
    ) -> Result<()> {
        let doc = self.state.verify_signed(Role::Snapshot, bytes)?;
        let meta = SnapshotMetadata::from_signed(&doc.signed)?;

        if let Some(timestamp) = &self.timestamp {
            if let Some(declared) = timestamp.snapshot.length {
                if bytes.len() as u64 != declared {
                    return Err(Error::MalformedMetadata(format!(
                        "snapshot is {} bytes, timestamp recorded {}",
                        bytes.len(),
                        declared
                    )));
                }
            }
            if let Some(hashes) = &timestamp.snapshot.hashes {
                for (alg, declared) in hashes {
                    match crypto::digest(alg, bytes) {
                        Some(actual) if &actual == declared => {}
                        Some(_) => {
                            return Err(Error::MalformedMetadata(format!(
                                "snapshot {} digest does not match timestamp record",
                                alg
                            )));
                        }
                        None => {}
                    }
                }
            }
        }

        if let Some(prior) = prior {
            if meta.version < prior.version {
                return Err(Error::VersionRollback {
                    repo: RepositoryType::Images,
                    role: Role::Snapshot,
                    stored: prior.version,
                    offered: meta.version,
                });
            }
            for (path, prior_item) in &prior.meta {
                let role = match path.trim_end_matches(".json").parse::<Role>() {
                    Ok(role) => role,
                    Err(_) => continue,
                };
                let offered = meta.meta.get(path).map(|item| item.version).unwrap_or(0);
                if offered < prior_item.version {
                    return Err(Error::VersionRollback {
                        repo: RepositoryType::Images,
                        role,
                        stored: prior_item.version,
                        offered,
                    });
                }
            }
        }

        self.snapshot = Some(meta);
        Ok(())
    }

    pub fn snapshot(&self) -> Option<&SnapshotMetadata> {
        self.snapshot.as_ref()
    }

    pub fn check_snapshot_expired(&self, now: &DateTime<Utc>) -> Result<()> {
        let expired = self.snapshot.as_ref().map(|s| s.expired(now)).unwrap_or(true);
        if expired {
            return Err(Error::ExpiredMetadata {
                repo: RepositoryType::Images,
                role: Role::Snapshot,
            });
        }
        Ok(())
    }

    /// Size bound for the targets fetch, as recorded by the verified
    /// snapshot.
    pub fn targets_size(&self) -> Option<u64> {
        self.snapshot
            .as_ref()
            .and_then(|s| s.targets_meta())
            .and_then(|item| item.length)
    }

    /// Verify a targets document against the snapshot's version record.
    pub fn verify_targets(&mut self, bytes: &[u8]) -> Result<()> {
        let doc = self.state.verify_signed(Role::Targets, bytes)?;
        let meta = TargetsMetadata::from_signed(&doc.signed)?;

        if let Some(recorded) = self.snapshot.as_ref().and_then(|s| s.targets_meta()) {
            if meta.version < recorded.version {
                return Err(Error::VersionRollback {
                    repo: RepositoryType::Images,
                    role: Role::Targets,
                    stored: recorded.version,
                    offered: meta.version,
                });
            }
        }

        self.targets = Some(meta);
        Ok(())
    }

    pub fn targets(&self) -> Option<&TargetsMetadata> {
        self.targets.as_ref()
    }

    pub fn check_targets_expired(&self, now: &DateTime<Utc>) -> Result<()> {
        let expired = self.targets.as_ref().map(|t| t.expired(now)).unwrap_or(true);
        if expired {
            return Err(Error::ExpiredMetadata {
                repo: RepositoryType::Images,
                role: Role::Targets,
            });
        }
        Ok(())
    }
}

impl Default for ImagesRepo {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{sign, RootBuilder};
    use super::*;
    use crate::crypto::HashAlgorithm;
    use crate::keystore::EphemeralKeyStore;
    use serde_json::json;

    struct Keys {
        root: EphemeralKeyStore,
        timestamp: EphemeralKeyStore,
        snapshot: EphemeralKeyStore,
        targets: EphemeralKeyStore,
    }

    impl Keys {
        fn generate() -> Self {
            Keys {
                root: EphemeralKeyStore::generate().unwrap(),
                timestamp: EphemeralKeyStore::generate().unwrap(),
                snapshot: EphemeralKeyStore::generate().unwrap(),
                targets: EphemeralKeyStore::generate().unwrap(),
            }
        }

        fn repo(&self) -> ImagesRepo {
            let mut repo = ImagesRepo::new();
            let root = RootBuilder::version(1)
                .role(Role::Root, &[&self.root], 1)
                .role(Role::Timestamp, &[&self.timestamp], 1)
                .role(Role::Snapshot, &[&self.snapshot], 1)
                .role(Role::Targets, &[&self.targets], 1)
                .signed_by(&[&self.root]);
            repo.init_root(&root).unwrap();
            repo
        }
    }

    fn snapshot_doc(keys: &Keys, version: u64, targets_version: u64) -> Vec<u8> {
        let signed = json!({
            "_type": "Snapshot",
            "expires": "2030-01-01T00:00:00Z",
            "version": version,
            "meta": {"targets.json": {"version": targets_version}},
        });
        sign(&signed, &[&keys.snapshot])
    }

    fn timestamp_doc_for(keys: &Keys, version: u64, snapshot_bytes: &[u8]) -> Vec<u8> {
        let digest = crypto::digest(&HashAlgorithm::Sha256, snapshot_bytes).unwrap();
        let signed = json!({
            "_type": "Timestamp",
            "expires": "2030-01-01T00:00:00Z",
            "version": version,
            "meta": {
                "snapshot.json": {
                    "version": 1,
                    "length": snapshot_bytes.len(),
                    "hashes": {"sha256": digest.to_hex()},
                },
            },
        });
        sign(&signed, &[&keys.timestamp])
    }

    fn targets_doc(keys: &Keys, version: u64) -> Vec<u8> {
        let signed = json!({
            "_type": "Targets",
            "expires": "2030-01-01T00:00:00Z",
            "version": version,
            "targets": {"fw.bin": {"length": 4, "hashes": {"sha256": "00aa"}}},
        });
        sign(&signed, &[&keys.targets])
    }

    #[test]
    fn full_chain_verifies() {
        let keys = Keys::generate();
        let mut repo = keys.repo();

        let snapshot = snapshot_doc(&keys, 1, 3);
        let timestamp = timestamp_doc_for(&keys, 1, &snapshot);

        repo.verify_timestamp(&timestamp).unwrap();
        repo.check_timestamp_expired(&Utc::now()).unwrap();
        assert_eq!(repo.snapshot_size(), Some(snapshot.len() as u64));

        repo.verify_snapshot(&snapshot, None).unwrap();
        repo.check_snapshot_expired(&Utc::now()).unwrap();

        repo.verify_targets(&targets_doc(&keys, 3)).unwrap();
        repo.check_targets_expired(&Utc::now()).unwrap();
        assert!(repo.targets().unwrap().find("fw.bin").is_some());
    }

    #[test]
    fn snapshot_must_match_timestamp_record() {
        let keys = Keys::generate();
        let mut repo = keys.repo();

        let real_snapshot = snapshot_doc(&keys, 1, 1);
        let timestamp = timestamp_doc_for(&keys, 1, &real_snapshot);
        repo.verify_timestamp(&timestamp).unwrap();

        // A different (but also validly signed) snapshot than the timestamp
        // vouched for.
        let other_snapshot = snapshot_doc(&keys, 2, 1);
        let err = repo.verify_snapshot(&other_snapshot, None).unwrap_err();
        assert!(matches!(err, Error::MalformedMetadata(_)));
        assert!(repo.snapshot().is_none());
    }

    #[test]
    fn snapshot_role_versions_may_not_regress() {
        let keys = Keys::generate();
        let mut repo = keys.repo();

        let snapshot = snapshot_doc(&keys, 2, 1);
        let timestamp = timestamp_doc_for(&keys, 1, &snapshot);
        repo.verify_timestamp(&timestamp).unwrap();

        let prior_signed = json!({
            "_type": "Snapshot",
            "expires": "2030-01-01T00:00:00Z",
            "version": 1,
            "meta": {"targets.json": {"version": 5}},
        });
        let prior = SnapshotMetadata::from_signed(&prior_signed).unwrap();

        // New snapshot knows targets.json only at version 1 < 5.
        let err = repo.verify_snapshot(&snapshot, Some(&prior)).unwrap_err();
        assert!(matches!(
            err,
            Error::VersionRollback { role: Role::Targets, stored: 5, offered: 1, .. }
        ));
    }

    #[test]
    fn snapshot_version_rollback_is_refused() {
        let keys = Keys::generate();
        let mut repo = keys.repo();

        let snapshot = snapshot_doc(&keys, 3, 1);
        let timestamp = timestamp_doc_for(&keys, 1, &snapshot);
        repo.verify_timestamp(&timestamp).unwrap();

        let prior_signed = json!({
            "_type": "Snapshot",
            "expires": "2030-01-01T00:00:00Z",
            "version": 7,
            "meta": {},
        });
        let prior = SnapshotMetadata::from_signed(&prior_signed).unwrap();
        let err = repo.verify_snapshot(&snapshot, Some(&prior)).unwrap_err();
        assert!(matches!(
            err,
            Error::VersionRollback { role: Role::Snapshot, stored: 7, offered: 3, .. }
        ));
    }

    #[test]
    fn targets_below_snapshot_record_are_refused() {
        let keys = Keys::generate();
        let mut repo = keys.repo();

        let snapshot = snapshot_doc(&keys, 1, 4);
        let timestamp = timestamp_doc_for(&keys, 1, &snapshot);
        repo.verify_timestamp(&timestamp).unwrap();
        repo.verify_snapshot(&snapshot, None).unwrap();

        let err = repo.verify_targets(&targets_doc(&keys, 3)).unwrap_err();
        assert!(matches!(
            err,
            Error::VersionRollback { role: Role::Targets, stored: 4, offered: 3, .. }
        ));
    }

    #[test]
    fn wrong_role_key_is_refused_per_role() {
        let keys = Keys::generate();
        let mut repo = keys.repo();

        // Timestamp signed with the snapshot key.
        let snapshot = snapshot_doc(&keys, 1, 1);
        let digest = crypto::digest(&HashAlgorithm::Sha256, &snapshot).unwrap();
        let signed = json!({
            "_type": "Timestamp",
            "expires": "2030-01-01T00:00:00Z",
            "version": 1,
            "meta": {"snapshot.json": {"version": 1, "length": snapshot.len(), "hashes": {"sha256": digest.to_hex()}}},
        });
        let bad = sign(&signed, &[&keys.snapshot]);
        assert!(matches!(
            repo.verify_timestamp(&bad).unwrap_err(),
            Error::ThresholdUnmet { role: Role::Timestamp, .. }
        ));
    }
}
