// Copyright 2025 The Uptane Client Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-repository metadata verification state machines.
//!
//! Both repositories share the root chain logic: a trusted root is either
//! adopted trust-on-first-use (a self-consistently signed version 1) or
//! loaded from storage, and every subsequent root must be signed by the key
//! sets of both the outgoing and the incoming root at their declared
//! thresholds. Rollback of any role version is refused.

mod director;
mod images;

pub use director::DirectorRepo;
pub use images::ImagesRepo;

use crate::error::{Error, Result};
use crate::metadata::{RepositoryType, Role, RootMetadata, SignedObject};
use crate::verify::KeySet;
use chrono::{DateTime, Utc};

/// Metadata size caps, applied when the size is not already bounded by a
/// verified role (timestamp bounding snapshot, snapshot bounding targets).
pub const MAX_ROOT_SIZE: u64 = 64 * 1024;
pub const MAX_TIMESTAMP_SIZE: u64 = 64 * 1024;
pub const MAX_SNAPSHOT_SIZE: u64 = 5 * 1024 * 1024;
pub const MAX_IMAGES_TARGETS_SIZE: u64 = 1024 * 1024;
pub const MAX_DIRECTOR_TARGETS_SIZE: u64 = 64 * 1024;

struct TrustedRoot {
    meta: RootMetadata,
    keys: KeySet,
}

/// Root-chain state shared by both repositories.
pub(crate) struct RepoState {
    repo: RepositoryType,
    root: Option<TrustedRoot>,
}

impl RepoState {
    fn new(repo: RepositoryType) -> Self {
        RepoState { repo, root: None }
    }

    fn reset(&mut self) {
        self.root = None;
    }

    /// Adopt a starting root: on a cold start this is trust-on-first-use, so
    /// the only requirement is that the document is signed to its own
    /// declared root threshold.
    fn init_root(&mut self, bytes: &[u8]) -> Result<()> {
        let doc = SignedObject::from_slice(bytes)?;
        let meta = RootMetadata::from_signed(&doc.signed)?;
        let keys = KeySet::from_root(self.repo, &meta);
        keys.verify_role(Role::Root, &doc)?;
        self.root = Some(TrustedRoot { meta, keys });
        Ok(())
    }

    /// Advance the chain by one version.
    ///
    /// The incoming root must be exactly one version ahead and signed by the
    /// root role of the trusted root *and* by its own root role, both at
    /// their declared thresholds, so that a rotation can neither skip back
    /// nor bootstrap itself.
    fn verify_root(&mut self, bytes: &[u8]) -> Result<()> {
        let current = self
            .root
            .as_ref()
            .ok_or_else(|| Error::MalformedMetadata("no trusted root".into()))?;

        let doc = SignedObject::from_slice(bytes)?;
        let meta = RootMetadata::from_signed(&doc.signed)?;

        if meta.version <= current.meta.version {
            return Err(Error::VersionRollback {
                repo: self.repo,
                role: Role::Root,
                stored: current.meta.version,
                offered: meta.version,
            });
        }
        if meta.version != current.meta.version + 1 {
            return Err(Error::MalformedMetadata(format!(
                "root chain skipped from version {} to {}",
                current.meta.version, meta.version
            )));
        }

        let new_keys = KeySet::from_root(self.repo, &meta);
        let version = meta.version;
        current
            .keys
            .verify_role(Role::Root, &doc)
            .and_then(|()| new_keys.verify_role(Role::Root, &doc))
            .map_err(|_| Error::UnmetThresholdAfterRotation { repo: self.repo, version })?;

        self.root = Some(TrustedRoot { meta, keys: new_keys });
        Ok(())
    }

    fn root_version(&self) -> u64 {
        self.root.as_ref().map(|r| r.meta.version).unwrap_or(0)
    }

    fn root_expired(&self, now: &DateTime<Utc>) -> bool {
        self.root.as_ref().map(|r| r.meta.expired(now)).unwrap_or(true)
    }

    fn check_root_expired(&self, now: &DateTime<Utc>) -> Result<()> {
        if self.root_expired(now) {
            return Err(Error::ExpiredMetadata { repo: self.repo, role: Role::Root });
        }
        Ok(())
    }

    /// Parse a role document and check its signatures against the trusted
    /// root's key table.
    fn verify_signed(&self, role: Role, bytes: &[u8]) -> Result<SignedObject> {
        let root = self
            .root
            .as_ref()
            .ok_or_else(|| Error::MalformedMetadata("no trusted root".into()))?;
        let doc = SignedObject::from_slice(bytes)?;
        root.keys.verify_role(role, &doc)?;
        Ok(doc)
    }
}


#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;
    use crate::keystore::EphemeralKeyStore;

    #[test]
    fn tofu_adopts_self_signed_v1() {
        let key = EphemeralKeyStore::generate().unwrap();
        let root = RootBuilder::version(1)
            .role(Role::Root, &[&key], 1)
            .role(Role::Targets, &[&key], 1)
            .signed_by(&[&key]);

        let mut state = RepoState::new(RepositoryType::Director);
        state.init_root(&root).unwrap();
        assert_eq!(state.root_version(), 1);
    }

    #[test]
    fn tofu_refuses_unsigned_root() {
        let key = EphemeralKeyStore::generate().unwrap();
        let outsider = EphemeralKeyStore::generate().unwrap();
        let root = RootBuilder::version(1)
            .role(Role::Root, &[&key], 1)
            .signed_by(&[&outsider]);

        let mut state = RepoState::new(RepositoryType::Director);
        assert!(matches!(
            state.init_root(&root).unwrap_err(),
            Error::ThresholdUnmet { role: Role::Root, .. }
        ));
    }

    #[test]
    fn rotation_needs_old_and_new_keys() {
        let k1 = EphemeralKeyStore::generate().unwrap();
        let k2 = EphemeralKeyStore::generate().unwrap();

        let mut state = RepoState::new(RepositoryType::Director);
        state
            .init_root(&RootBuilder::version(1).role(Role::Root, &[&k1], 1).signed_by(&[&k1]))
            .unwrap();

        // v2 rotates root to k2 but is signed only by k2: the old root keys
        // never vouched for it.
        let only_new = RootBuilder::version(2).role(Role::Root, &[&k2], 1).signed_by(&[&k2]);
        assert!(matches!(
            state.verify_root(&only_new).unwrap_err(),
            Error::UnmetThresholdAfterRotation { version: 2, .. }
        ));

        // Signed by both: accepted.
        let both = RootBuilder::version(2).role(Role::Root, &[&k2], 1).signed_by(&[&k1, &k2]);
        state.verify_root(&both).unwrap();
        assert_eq!(state.root_version(), 2);
    }

    #[test]
    fn rotation_refuses_version_decrease_and_skip() {
        let k1 = EphemeralKeyStore::generate().unwrap();
        let mut state = RepoState::new(RepositoryType::Images);
        state
            .init_root(&RootBuilder::version(2).role(Role::Root, &[&k1], 1).signed_by(&[&k1]))
            .unwrap();

        let stale = RootBuilder::version(1).role(Role::Root, &[&k1], 1).signed_by(&[&k1]);
        assert!(matches!(
            state.verify_root(&stale).unwrap_err(),
            Error::VersionRollback { role: Role::Root, stored: 2, offered: 1, .. }
        ));

        let skipped = RootBuilder::version(4).role(Role::Root, &[&k1], 1).signed_by(&[&k1]);
        assert!(matches!(state.verify_root(&skipped).unwrap_err(), Error::MalformedMetadata(_)));
    }

    #[test]
    fn expired_root_is_flagged() {
        let key = EphemeralKeyStore::generate().unwrap();
        let root = RootBuilder::version(1)
            .expires("2020-01-01T00:00:00Z")
            .role(Role::Root, &[&key], 1)
            .signed_by(&[&key]);

        let mut state = RepoState::new(RepositoryType::Director);
        state.init_root(&root).unwrap();
        assert!(state.root_expired(&Utc::now()));
        assert!(matches!(
            state.check_root_expired(&Utc::now()).unwrap_err(),
            Error::ExpiredMetadata { role: Role::Root, .. }
        ));
    }
}
