// Copyright 2025 The Uptane Client Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The Director repository: vehicle-specific install instructions.
//!
//! In this metadata dialect the Director serves only root and targets; there
//! is no timestamp/snapshot layer in front of its targets role.

use super::RepoState;
use crate::error::{Error, Result};
use crate::metadata::{RepositoryType, Role, TargetsMetadata};
use chrono::{DateTime, Utc};

pub struct DirectorRepo {
    state: RepoState,
    targets: Option<TargetsMetadata>,
}

impl DirectorRepo {
    pub fn new() -> Self {
        DirectorRepo { state: RepoState::new(RepositoryType::Director), targets: None }
    }

    /// Drop all verified state before a fresh iteration.
    pub fn reset(&mut self) {
        self.state.reset();
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

    pub fn verify_targets(&mut self, bytes: &[u8]) -> Result<()> {
        let doc = self.state.verify_signed(Role::Targets, bytes)?;
        self.targets = Some(TargetsMetadata::from_signed(&doc.signed)?);
        Ok(())
    }

    pub fn targets(&self) -> Option<&TargetsMetadata> {
        self.targets.as_ref()
    }

    pub fn check_targets_expired(&self, now: &DateTime<Utc>) -> Result<()> {
        let expired = self.targets.as_ref().map(|t| t.expired(now)).unwrap_or(true);
        if expired {
            return Err(Error::ExpiredMetadata {
                repo: RepositoryType::Director,
                role: Role::Targets,
            });
        }
        Ok(())
    }
}

impl Default for DirectorRepo {
    fn default() -> Self {
        Self::new()
    }
}
