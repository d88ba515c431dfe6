// Copyright 2025 The Uptane Client Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Typed views over signed Uptane role documents.
//!
//! A role document on the wire is `{"signatures": [...], "signed": {...}}`.
//! The `signed` body is kept as raw JSON so the canonical form that the
//! signatures cover can always be recomputed, and is additionally parsed into
//! the typed structs below once its signatures check out.

use crate::crypto::{HashAlgorithm, HashValue, KeyId, PublicKey, Signature};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// The two independently rooted metadata repositories.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepositoryType {
    Director,
    Images,
}

impl fmt::Display for RepositoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryType::Director => f.write_str("director"),
            RepositoryType::Images => f.write_str("images"),
        }
    }
}

/// Top-level metadata roles.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Root,
    Targets,
    Timestamp,
    Snapshot,
}

impl Role {
    /// File name this role is served and stored under.
    pub fn metadata_path(&self) -> &'static str {
        match self {
            Role::Root => "root.json",
            Role::Targets => "targets.json",
            Role::Timestamp => "timestamp.json",
            Role::Snapshot => "snapshot.json",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Root => f.write_str("root"),
            Role::Targets => f.write_str("targets"),
            Role::Timestamp => f.write_str("timestamp"),
            Role::Snapshot => f.write_str("snapshot"),
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "root" => Ok(Role::Root),
            "targets" => Ok(Role::Targets),
            "timestamp" => Ok(Role::Timestamp),
            "snapshot" => Ok(Role::Snapshot),
            other => Err(Error::MalformedMetadata(format!("unknown role {:?}", other))),
        }
    }
}

/// Serial number of one ECU. Opaque; fixed at provisioning.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EcuSerial(String);

impl EcuSerial {
    pub fn new(s: impl Into<String>) -> Self {
        EcuSerial(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EcuSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hardware identifier of one ECU model.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HardwareId(String);

impl HardwareId {
    pub fn new(s: impl Into<String>) -> Self {
        HardwareId(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HardwareId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A role document split into its signatures and raw `signed` body.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedObject {
    pub signatures: Vec<Signature>,
    pub signed: Value,
}

impl SignedObject {
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::MalformedMetadata(e.to_string()))
    }
}

/// Read `signed.version` without any verification.
///
/// Only used to decide whether a fetch/rotation walk is needed; every other
/// use of the version goes through a verified document.
pub fn extract_version_untrusted(bytes: &[u8]) -> Result<u64> {
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| Error::MalformedMetadata(e.to_string()))?;
    value
        .get("signed")
        .and_then(|signed| signed.get("version"))
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::MalformedMetadata("missing signed.version".into()))
}

fn parse_expires(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::MalformedMetadata(format!("bad expiry {:?}: {}", s, e)))
}

/// Render an expiry the way the backend writes them.
pub fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn check_type(signed: &Value, role: Role) -> Result<()> {
    let typ = signed
        .get("_type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::MalformedMetadata("missing _type".into()))?;
    if !typ.eq_ignore_ascii_case(&role.to_string()) {
        return Err(Error::MalformedMetadata(format!(
            "expected {} metadata, got {:?}",
            role, typ
        )));
    }
    Ok(())
}

/// Key ids and threshold authorized for one role.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleKeys {
    pub keyids: Vec<KeyId>,
    pub threshold: u32,
}

/// The `signed` body of a root document.
#[derive(Clone, Debug)]
pub struct RootMetadata {
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub keys: HashMap<KeyId, PublicKey>,
    pub roles: HashMap<Role, RoleKeys>,
}

impl RootMetadata {
    pub fn from_signed(signed: &Value) -> Result<Self> {
        check_type(signed, Role::Root)?;

        #[derive(Deserialize)]
        struct Shim {
            expires: String,
            version: u64,
            keys: HashMap<KeyId, Value>,
            roles: HashMap<String, RoleKeys>,
        }
        let shim: Shim = serde_json::from_value(signed.clone())
            .map_err(|e| Error::MalformedMetadata(e.to_string()))?;

        let mut keys = HashMap::new();
        for (keyid, value) in &shim.keys {
            let key = PublicKey::from_uptane(value)?;
            if key.key_id() != keyid {
                // Tolerated: the reference is still the id the signed root
                // declares, which is what the roles table points at.
                warn!("declared key id {} does not match computed {}", keyid, key.key_id());
            }
            keys.insert(keyid.clone(), key);
        }

        let mut roles = HashMap::new();
        for (name, role_keys) in shim.roles {
            let role = match name.parse::<Role>() {
                Ok(role) => role,
                Err(_) => {
                    warn!("ignoring unknown role {:?} in root metadata", name);
                    continue;
                }
            };
            if role_keys.threshold < 1 {
                return Err(Error::MalformedMetadata(format!(
                    "role {} has threshold {}",
                    role, role_keys.threshold
                )));
            }
            roles.insert(role, role_keys);
        }

        Ok(RootMetadata {
            version: shim.version,
            expires: parse_expires(&shim.expires)?,
            keys,
            roles,
        })
    }

    pub fn expired(&self, now: &DateTime<Utc>) -> bool {
        self.expires <= *now
    }
}

/// Image format a target installs as.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetFormat {
    Ostree,
    Binary,
}

/// One firmware image named by a targets role.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(into = "TargetRecord", try_from = "TargetRecord")]
pub struct Target {
    pub filename: String,
    pub length: u64,
    pub hashes: HashMap<HashAlgorithm, HashValue>,
    pub format: TargetFormat,
    pub uri: Option<String>,
    pub ecus: HashMap<EcuSerial, HardwareId>,
}

impl Target {
    fn from_entry(filename: String, entry: TargetEntry) -> Self {
        let custom = entry.custom.unwrap_or_default();
        let format = match custom.target_format.as_deref() {
            Some(s) if s.eq_ignore_ascii_case("binary") => TargetFormat::Binary,
            // The atomic-tree format is the fleet default and may be elided.
            _ => TargetFormat::Ostree,
        };
        Target {
            filename,
            length: entry.length,
            hashes: entry.hashes,
            format,
            uri: custom.uri,
            ecus: custom
                .ecu_identifiers
                .into_iter()
                .map(|(serial, hw)| (serial, hw.hardware_id))
                .collect(),
        }
    }

    pub fn is_ostree(&self) -> bool {
        self.format == TargetFormat::Ostree
    }

    /// The content address used to pull an atomic-tree commit.
    pub fn sha256_hash(&self) -> Option<String> {
        self.hashes.get(&HashAlgorithm::Sha256).map(HashValue::to_hex)
    }

    /// True when the hash sets agree: every algorithm both sides know must
    /// carry the same digest, and at least one supported algorithm is shared.
    pub fn matches_hashes(&self, other: &Target) -> bool {
        let mut shared = 0;
        for (alg, value) in &self.hashes {
            if !alg.is_supported() {
                continue;
            }
            match other.hashes.get(alg) {
                Some(other_value) if other_value == value => shared += 1,
                Some(_) => return false,
                None => {}
            }
        }
        shared > 0
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.filename == other.filename
            && self.length == other.length
            && self.matches_hashes(other)
    }
}

impl Eq for Target {}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.filename, self.length)
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct TargetCustom {
    #[serde(rename = "ecuIdentifiers", default)]
    ecu_identifiers: HashMap<EcuSerial, EcuHardware>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    uri: Option<String>,
    #[serde(rename = "targetFormat", default, skip_serializing_if = "Option::is_none")]
    target_format: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct EcuHardware {
    #[serde(rename = "hardwareId")]
    hardware_id: HardwareId,
}

/// A target entry as it appears in a targets role, keyed by file name.
#[derive(Deserialize)]
struct TargetEntry {
    length: u64,
    hashes: HashMap<HashAlgorithm, HashValue>,
    #[serde(default)]
    custom: Option<TargetCustom>,
}

/// Standalone serialized form of a [`Target`] (installed-version log,
/// pending installs).
#[derive(Serialize, Deserialize)]
struct TargetRecord {
    filename: String,
    length: u64,
    hashes: HashMap<HashAlgorithm, HashValue>,
    custom: TargetCustom,
}

impl From<Target> for TargetRecord {
    fn from(t: Target) -> Self {
        TargetRecord {
            filename: t.filename,
            length: t.length,
            hashes: t.hashes,
            custom: TargetCustom {
                ecu_identifiers: t
                    .ecus
                    .into_iter()
                    .map(|(serial, hw)| (serial, EcuHardware { hardware_id: hw }))
                    .collect(),
                uri: t.uri,
                target_format: Some(
                    match t.format {
                        TargetFormat::Ostree => "OSTREE",
                        TargetFormat::Binary => "BINARY",
                    }
                    .to_string(),
                ),
            },
        }
    }
}

impl std::convert::TryFrom<TargetRecord> for Target {
    type Error = Error;

    fn try_from(record: TargetRecord) -> Result<Self> {
        Ok(Target::from_entry(
            record.filename.clone(),
            TargetEntry {
                length: record.length,
                hashes: record.hashes,
                custom: Some(record.custom),
            },
        ))
    }
}

/// The `signed` body of a targets document.
#[derive(Clone, Debug)]
pub struct TargetsMetadata {
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub targets: Vec<Target>,
}

impl TargetsMetadata {
    pub fn from_signed(signed: &Value) -> Result<Self> {
        check_type(signed, Role::Targets)?;

        #[derive(Deserialize)]
        struct Shim {
            expires: String,
            version: u64,
            targets: HashMap<String, TargetEntry>,
        }
        let shim: Shim = serde_json::from_value(signed.clone())
            .map_err(|e| Error::MalformedMetadata(e.to_string()))?;

        let mut targets: Vec<Target> = shim
            .targets
            .into_iter()
            .map(|(filename, entry)| Target::from_entry(filename, entry))
            .collect();
        targets.sort_by(|a, b| a.filename.cmp(&b.filename));

        Ok(TargetsMetadata {
            version: shim.version,
            expires: parse_expires(&shim.expires)?,
            targets,
        })
    }

    pub fn find(&self, filename: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.filename == filename)
    }

    pub fn expired(&self, now: &DateTime<Utc>) -> bool {
        self.expires <= *now
    }
}

/// Version and optional size/hashes another role records about a metadata
/// file.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct MetaItem {
    pub version: u64,
    #[serde(default)]
    pub length: Option<u64>,
    #[serde(default)]
    pub hashes: Option<HashMap<HashAlgorithm, HashValue>>,
}

/// The `signed` body of a snapshot document.
#[derive(Clone, Debug)]
pub struct SnapshotMetadata {
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub meta: HashMap<String, MetaItem>,
}

impl SnapshotMetadata {
    pub fn from_signed(signed: &Value) -> Result<Self> {
        check_type(signed, Role::Snapshot)?;

        #[derive(Deserialize)]
        struct Shim {
            expires: String,
            version: u64,
            meta: HashMap<String, MetaItem>,
        }
        let shim: Shim = serde_json::from_value(signed.clone())
            .map_err(|e| Error::MalformedMetadata(e.to_string()))?;

        Ok(SnapshotMetadata {
            version: shim.version,
            expires: parse_expires(&shim.expires)?,
            meta: shim.meta,
        })
    }

    pub fn targets_meta(&self) -> Option<&MetaItem> {
        self.meta.get(Role::Targets.metadata_path())
    }

    pub fn expired(&self, now: &DateTime<Utc>) -> bool {
        self.expires <= *now
    }
}

/// The `signed` body of a timestamp document.
#[derive(Clone, Debug)]
pub struct TimestampMetadata {
    pub version: u64,
    pub expires: DateTime<Utc>,
    pub snapshot: MetaItem,
}

impl TimestampMetadata {
    pub fn from_signed(signed: &Value) -> Result<Self> {
        check_type(signed, Role::Timestamp)?;

        #[derive(Deserialize)]
        struct Shim {
            expires: String,
            version: u64,
            meta: HashMap<String, MetaItem>,
        }
        let mut shim: Shim = serde_json::from_value(signed.clone())
            .map_err(|e| Error::MalformedMetadata(e.to_string()))?;

        let snapshot = shim
            .meta
            .remove(Role::Snapshot.metadata_path())
            .ok_or_else(|| Error::MalformedMetadata("timestamp lacks snapshot meta".into()))?;

        Ok(TimestampMetadata {
            version: shim.version,
            expires: parse_expires(&shim.expires)?,
            snapshot,
        })
    }

    pub fn expired(&self, now: &DateTime<Utc>) -> bool {
        self.expires <= *now
    }
}
