// Copyright 2025 The Uptane Client Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! In-memory storage used by tests and simulations.

use super::{InstalledVersion, Storage, StorageError, TlsCredentials};
use crate::metadata::{EcuSerial, HardwareId, RepositoryType, Role, Target};
use crate::pacman::InstallationResult;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
pub struct MemStorage {
    roots: BTreeMap<(RepositoryType, u64), Vec<u8>>,
    non_roots: HashMap<(RepositoryType, Role), Vec<u8>>,
    ecu_serials: Vec<(EcuSerial, HardwareId)>,
    installed_versions: Vec<InstalledVersion>,
    installation_result: Option<InstallationResult>,
    pending_target: Option<Target>,
    tls_creds: Option<TlsCredentials>,
    reports: BTreeMap<u64, Value>,
    next_report_seq: u64,
    target_payloads: HashMap<String, Vec<u8>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Default::default()
    }
}

impl Storage for MemStorage {
    fn store_root(
        &mut self,
        repo: RepositoryType,
        version: u64,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        self.roots.insert((repo, version), bytes.to_vec());
        Ok(())
    }

    fn load_root(
        &self,
        repo: RepositoryType,
        version: u64,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.roots.get(&(repo, version)).cloned())
    }

    fn latest_root_version(&self, repo: RepositoryType) -> Result<Option<u64>, StorageError> {
        Ok(self
            .roots
            .keys()
            .filter(|(r, _)| *r == repo)
            .map(|(_, version)| *version)
            .max())
    }

    fn store_non_root(
        &mut self,
        repo: RepositoryType,
        role: Role,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        self.non_roots.insert((repo, role), bytes.to_vec());
        Ok(())
    }

    fn load_non_root(
        &self,
        repo: RepositoryType,
        role: Role,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.non_roots.get(&(repo, role)).cloned())
    }

    fn clear_non_root(&mut self, repo: RepositoryType) -> Result<(), StorageError> {
        for role in [Role::Timestamp, Role::Snapshot, Role::Targets] {
            self.non_roots.remove(&(repo, role));
        }
        Ok(())
    }

    fn store_ecu_serials(
        &mut self,
        serials: &[(EcuSerial, HardwareId)],
    ) -> Result<(), StorageError> {
        self.ecu_serials = serials.to_vec();
        Ok(())
    }

    fn load_ecu_serials(&self) -> Result<Vec<(EcuSerial, HardwareId)>, StorageError> {
        Ok(self.ecu_serials.clone())
    }

    fn save_installed_version(&mut self, version: &InstalledVersion) -> Result<(), StorageError> {
        self.installed_versions.push(version.clone());
        Ok(())
    }

    fn load_installed_versions(&self) -> Result<Vec<InstalledVersion>, StorageError> {
        Ok(self.installed_versions.clone())
    }

    fn store_installation_result(
        &mut self,
        result: &InstallationResult,
    ) -> Result<(), StorageError> {
        self.installation_result = Some(result.clone());
        Ok(())
    }

    fn load_installation_result(&self) -> Result<Option<InstallationResult>, StorageError> {
        Ok(self.installation_result.clone())
    }

    fn store_pending_target(&mut self, target: Option<&Target>) -> Result<(), StorageError> {
        self.pending_target = target.cloned();
        Ok(())
    }

    fn load_pending_target(&self) -> Result<Option<Target>, StorageError> {
        Ok(self.pending_target.clone())
    }

    fn store_tls_creds(&mut self, creds: &TlsCredentials) -> Result<(), StorageError> {
        self.tls_creds = Some(creds.clone());
        Ok(())
    }

    fn load_tls_creds(&self) -> Result<Option<TlsCredentials>, StorageError> {
        Ok(self.tls_creds.clone())
    }

    fn enqueue_report(&mut self, report: &Value) -> Result<u64, StorageError> {
        let seq = self.next_report_seq;
        self.next_report_seq += 1;
        self.reports.insert(seq, report.clone());
        Ok(seq)
    }

    fn load_reports(&self) -> Result<Vec<(u64, Value)>, StorageError> {
        Ok(self.reports.iter().map(|(seq, v)| (*seq, v.clone())).collect())
    }

    fn remove_report(&mut self, seq: u64) -> Result<(), StorageError> {
        self.reports.remove(&seq);
        Ok(())
    }

    fn store_target_payload(&mut self, filename: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.target_payloads.insert(filename.to_string(), bytes.to_vec());
        Ok(())
    }

    fn load_target_payload(&self, filename: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.target_payloads.get(filename).cloned())
    }
}
