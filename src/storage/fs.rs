// Copyright 2025 The Uptane Client Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Filesystem-backed storage.
//!
//! Layout under the base directory:
//!
//! ```bash
//! roots/{director,images}/<version>.json
//! {director,images}/{timestamp,snapshot,targets}.json
//! installed_versions.json
//! ecu_serials.json
//! installation_result.json
//! pending_target.json
//! tls_creds.json
//! report_queue/<seq>.json
//! targets/<filename>
//! ```
//!
//! Every write goes to a sibling temp file first and is renamed into place,
//! so a crash mid-write leaves the previous content intact.

use super::{InstalledVersion, Storage, StorageError, TlsCredentials};
use crate::metadata::{EcuSerial, HardwareId, RepositoryType, Role, Target};
use crate::pacman::InstallationResult;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub struct FsStorage {
    base: PathBuf,
}

impl FsStorage {
    pub fn new(base: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let base = base.into();
        fs::create_dir_all(&base)?;
        Ok(FsStorage { base })
    }

    fn roots_dir(&self, repo: RepositoryType) -> PathBuf {
        self.base.join("roots").join(repo.to_string())
    }

    fn non_root_path(&self, repo: RepositoryType, role: Role) -> PathBuf {
        self.base.join(repo.to_string()).join(role.metadata_path())
    }

    fn reports_dir(&self) -> PathBuf {
        self.base.join("report_queue")
    }

    fn targets_dir(&self) -> PathBuf {
        self.base.join("targets")
    }

    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    fn read_opt(&self, path: &Path) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<(), StorageError> {
        let bytes = serde_json::to_vec(value)?;
        self.write_atomic(&self.base.join(name), &bytes)
    }

    fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StorageError> {
        match self.read_opt(&self.base.join(name))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn remove_if_present(&self, path: &Path) -> Result<(), StorageError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl Storage for FsStorage {
    fn store_root(
        &mut self,
        repo: RepositoryType,
        version: u64,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        let path = self.roots_dir(repo).join(format!("{}.json", version));
        self.write_atomic(&path, bytes)
    }

    fn load_root(
        &self,
        repo: RepositoryType,
        version: u64,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        self.read_opt(&self.roots_dir(repo).join(format!("{}.json", version)))
    }

    fn latest_root_version(&self, repo: RepositoryType) -> Result<Option<u64>, StorageError> {
        let dir = self.roots_dir(repo);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut latest = None;
        for entry in entries {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".json") {
                if let Ok(version) = stem.parse::<u64>() {
                    latest = latest.max(Some(version));
                }
            }
        }
        Ok(latest)
    }

    fn store_non_root(
        &mut self,
        repo: RepositoryType,
        role: Role,
        bytes: &[u8],
    ) -> Result<(), StorageError> {
        self.write_atomic(&self.non_root_path(repo, role), bytes)
    }

    fn load_non_root(
        &self,
        repo: RepositoryType,
        role: Role,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        self.read_opt(&self.non_root_path(repo, role))
    }

    fn clear_non_root(&mut self, repo: RepositoryType) -> Result<(), StorageError> {
        for role in [Role::Timestamp, Role::Snapshot, Role::Targets] {
            self.remove_if_present(&self.non_root_path(repo, role))?;
        }
        Ok(())
    }

    fn store_ecu_serials(
        &mut self,
        serials: &[(EcuSerial, HardwareId)],
    ) -> Result<(), StorageError> {
        self.write_json("ecu_serials.json", &serials)
    }

    fn load_ecu_serials(&self) -> Result<Vec<(EcuSerial, HardwareId)>, StorageError> {
        Ok(self.read_json("ecu_serials.json")?.unwrap_or_default())
    }

    fn save_installed_version(&mut self, version: &InstalledVersion) -> Result<(), StorageError> {
        let mut log: Vec<InstalledVersion> =
            self.read_json("installed_versions.json")?.unwrap_or_default();
        log.push(version.clone());
        self.write_json("installed_versions.json", &log)
    }

    fn load_installed_versions(&self) -> Result<Vec<InstalledVersion>, StorageError> {
        Ok(self.read_json("installed_versions.json")?.unwrap_or_default())
    }

    fn store_installation_result(
        &mut self,
        result: &InstallationResult,
    ) -> Result<(), StorageError> {
        self.write_json("installation_result.json", result)
    }

    fn load_installation_result(&self) -> Result<Option<InstallationResult>, StorageError> {
        self.read_json("installation_result.json")
    }

    fn store_pending_target(&mut self, target: Option<&Target>) -> Result<(), StorageError> {
        match target {
            Some(target) => self.write_json("pending_target.json", target),
            None => self.remove_if_present(&self.base.join("pending_target.json")),
        }
    }

    fn load_pending_target(&self) -> Result<Option<Target>, StorageError> {
        self.read_json("pending_target.json")
    }

    fn store_tls_creds(&mut self, creds: &TlsCredentials) -> Result<(), StorageError> {
        self.write_json("tls_creds.json", creds)
    }

    fn load_tls_creds(&self) -> Result<Option<TlsCredentials>, StorageError> {
        self.read_json("tls_creds.json")
    }

    fn enqueue_report(&mut self, report: &Value) -> Result<u64, StorageError> {
        let seq = self
            .load_reports()?
            .last()
            .map(|(seq, _)| seq + 1)
            .unwrap_or(0);
        let path = self.reports_dir().join(format!("{:020}.json", seq));
        self.write_atomic(&path, &serde_json::to_vec(report)?)?;
        Ok(seq)
    }

    fn load_reports(&self) -> Result<Vec<(u64, Value)>, StorageError> {
        let entries = match fs::read_dir(self.reports_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut reports = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let name = match path.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => continue,
            };
            if let Some(stem) = name.strip_suffix(".json") {
                if let Ok(seq) = stem.parse::<u64>() {
                    if let Some(bytes) = self.read_opt(&path)? {
                        reports.push((seq, serde_json::from_slice(&bytes)?));
                    }
                }
            }
        }
        reports.sort_by_key(|(seq, _)| *seq);
        Ok(reports)
    }

    fn remove_report(&mut self, seq: u64) -> Result<(), StorageError> {
        self.remove_if_present(&self.reports_dir().join(format!("{:020}.json", seq)))
    }

    fn store_target_payload(&mut self, filename: &str, bytes: &[u8]) -> Result<(), StorageError> {
        self.write_atomic(&self.targets_dir().join(filename), bytes)
    }

    fn load_target_payload(&self, filename: &str) -> Result<Option<Vec<u8>>, StorageError> {
        self.read_opt(&self.targets_dir().join(filename))
    }
}
