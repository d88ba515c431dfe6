// Copyright 2025 The Uptane Client Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Threshold signature verification against a trusted root's key table.

use crate::canonical::canonicalize;
use crate::crypto::{KeyId, PublicKey};
use crate::error::{Error, Result};
use crate::metadata::{RepositoryType, Role, RoleKeys, RootMetadata, SignedObject};
use log::debug;
use std::collections::{HashMap, HashSet};

/// The key material and per-role thresholds one trusted root authorizes.
#[derive(Clone, Debug)]
pub struct KeySet {
    repo: RepositoryType,
    keys: HashMap<KeyId, PublicKey>,
    roles: HashMap<Role, RoleKeys>,
}

impl KeySet {
    pub fn from_root(repo: RepositoryType, root: &RootMetadata) -> Self {
        KeySet { repo, keys: root.keys.clone(), roles: root.roles.clone() }
    }

    pub fn role_keys(&self, role: Role) -> Option<&RoleKeys> {
        self.roles.get(&role)
    }

    /// Check that `doc` carries at least `threshold` valid signatures for
    /// `role` over the canonical form of its `signed` body.
    ///
    /// Only keys the root authorizes for the role count, each key id at most
    /// once. A bad signature from an authorized key is ignored rather than
    /// fatal; the document fails only if the count stays below threshold.
    pub fn verify_role(&self, role: Role, doc: &SignedObject) -> Result<()> {
        let role_keys = self
            .roles
            .get(&role)
            .ok_or(Error::ThresholdUnmet { repo: self.repo, role })?;

        let canonical = canonicalize(&doc.signed)?;

        let mut valid: HashSet<&KeyId> = HashSet::new();
        for signature in &doc.signatures {
            if !role_keys.keyids.contains(&signature.keyid) {
                debug!("{}: signature by {} not authorized for {}", self.repo, signature.keyid, role);
                continue;
            }
            if valid.contains(&signature.keyid) {
                continue;
            }
            let key = match self.keys.get(&signature.keyid) {
                Some(key) => key,
                None => continue,
            };
            if key.verify_signature(&canonical, &signature.sig) {
                valid.insert(&signature.keyid);
            } else {
                debug!("{}: invalid {} signature by {}", self.repo, role, signature.keyid);
            }
        }

        if (valid.len() as u32) < role_keys.threshold {
            return Err(Error::ThresholdUnmet { repo: self.repo, role });
        }
        Ok(())
    }
}
