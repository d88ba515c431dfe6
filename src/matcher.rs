// Copyright 2025 The Uptane Client Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Cross-repository target resolution and change detection.
//!
//! The Director says *what to install where*; the Images repository attests
//! *what the bits are*. A Director target is only actionable when an Images
//! target of the same name vouches for every hash the Director lists.

use crate::error::{Error, Result};
use crate::metadata::{EcuSerial, HardwareId, Target, TargetsMetadata};
use log::{error, warn};
use std::collections::HashMap;

/// Select the Director targets that actually change something on this
/// vehicle.
///
/// A target is new when at least one of its addressed ECUs currently runs a
/// different file name. Targets addressing an ECU serial this device does not
/// know are logged and skipped; a known serial advertised with the wrong
/// hardware id aborts the cycle, since that points at misdirection rather
/// than staleness.
pub fn new_targets(
    director_targets: &TargetsMetadata,
    hw_ids: &HashMap<EcuSerial, HardwareId>,
    installed_images: &HashMap<EcuSerial, String>,
) -> Result<Vec<Target>> {
    let mut new = Vec::new();
    'targets: for target in &director_targets.targets {
        let mut is_new = false;
        for (serial, hw_id) in &target.ecus {
            let known = match hw_ids.get(serial) {
                Some(known) => known,
                None => {
                    warn!("unknown ECU {} in director targets metadata", serial);
                    continue 'targets;
                }
            };
            if known != hw_id {
                error!("wrong hardware identifier for ECU {}", serial);
                return Err(Error::HardwareIdMismatch(serial.clone()));
            }
            let installed = match installed_images.get(serial) {
                Some(installed) => installed,
                None => {
                    warn!("no installed image known for ECU {}", serial);
                    continue 'targets;
                }
            };
            if installed != &target.filename {
                is_new = true;
            }
        }
        if is_new {
            new.push(target.clone());
        }
    }
    Ok(new)
}

/// Resolve a Director target against the Images targets role.
///
/// The Images entry must exist under the same file name, agree on the length,
/// and its hash set must cover every supported hash the Director lists. The
/// returned entry carries the Images-side payload, including any custom fetch
/// uri.
pub fn resolve_image_target<'a>(
    images_targets: &'a TargetsMetadata,
    director_target: &Target,
) -> Result<&'a Target> {
    let image = images_targets
        .find(&director_target.filename)
        .ok_or_else(|| Error::CrossRepoMismatch(director_target.filename.clone()))?;

    if image.length != director_target.length {
        return Err(Error::CrossRepoMismatch(director_target.filename.clone()));
    }

    let mut shared = 0;
    for (alg, value) in &director_target.hashes {
        if !alg.is_supported() {
            continue;
        }
        match image.hashes.get(alg) {
            Some(image_value) if image_value == value => shared += 1,
            _ => return Err(Error::CrossRepoMismatch(director_target.filename.clone())),
        }
    }
    if shared == 0 {
        return Err(Error::CrossRepoMismatch(director_target.filename.clone()));
    }

    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn targets_meta(targets: serde_json::Value) -> TargetsMetadata {
        TargetsMetadata::from_signed(&json!({
            "_type": "Targets",
            "expires": "2030-01-01T00:00:00Z",
            "version": 1,
            "targets": targets,
        }))
        .unwrap()
    }

    fn director_entry(hash: &str, serial: &str, hw: &str) -> serde_json::Value {
        json!({
            "length": 4,
            "hashes": {"sha256": hash},
            "custom": {"ecuIdentifiers": {(serial): {"hardwareId": hw}}},
        })
    }

    fn device() -> (HashMap<EcuSerial, HardwareId>, HashMap<EcuSerial, String>) {
        let mut hw_ids = HashMap::new();
        hw_ids.insert(EcuSerial::new("s1"), HardwareId::new("hw-a"));
        let mut installed = HashMap::new();
        installed.insert(EcuSerial::new("s1"), "fw-1.1.bin".to_string());
        (hw_ids, installed)
    }

    #[test]
    fn changed_filename_is_new() {
        let (hw_ids, installed) = device();
        let director = targets_meta(json!({"fw-1.2.bin": director_entry("00aa", "s1", "hw-a")}));
        let new = new_targets(&director, &hw_ids, &installed).unwrap();
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].filename, "fw-1.2.bin");
    }

    #[test]
    fn already_installed_filename_is_skipped() {
        let (hw_ids, installed) = device();
        let director = targets_meta(json!({"fw-1.1.bin": director_entry("00aa", "s1", "hw-a")}));
        assert_eq!(new_targets(&director, &hw_ids, &installed).unwrap(), vec![]);
    }

    #[test]
    fn unknown_serial_skips_target_only() {
        let (hw_ids, installed) = device();
        let director = targets_meta(json!({
            "fw-1.2.bin": director_entry("00aa", "s1", "hw-a"),
            "other.bin": director_entry("00bb", "ghost", "hw-x"),
        }));
        let new = new_targets(&director, &hw_ids, &installed).unwrap();
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].filename, "fw-1.2.bin");
    }

    #[test]
    fn wrong_hardware_id_aborts() {
        let (hw_ids, installed) = device();
        let director = targets_meta(json!({"fw-1.2.bin": director_entry("00aa", "s1", "hw-b")}));
        let err = new_targets(&director, &hw_ids, &installed).unwrap_err();
        assert!(matches!(err, Error::HardwareIdMismatch(serial) if serial.as_str() == "s1"));
    }

    #[test]
    fn resolve_matches_superset_hashes() {
        let director = targets_meta(json!({"fw.bin": {"length": 4, "hashes": {"sha256": "00aa"}}}));
        let images = targets_meta(json!({
            "fw.bin": {
                "length": 4,
                "hashes": {"sha256": "00aa", "sha512": "00bb"},
                "custom": {"uri": "https://mirror.example/fw.bin"},
            },
        }));
        let resolved =
            resolve_image_target(&images, director.find("fw.bin").unwrap()).unwrap();
        assert_eq!(resolved.uri.as_deref(), Some("https://mirror.example/fw.bin"));
    }

    #[test]
    fn resolve_rejects_hash_disagreement() {
        let director = targets_meta(json!({"fw-1.2.bin": {"length": 4, "hashes": {"sha256": "00aa"}}}));
        let images = targets_meta(json!({"fw-1.2.bin": {"length": 4, "hashes": {"sha256": "00bb"}}}));
        let err =
            resolve_image_target(&images, director.find("fw-1.2.bin").unwrap()).unwrap_err();
        assert!(matches!(err, Error::CrossRepoMismatch(name) if name == "fw-1.2.bin"));
    }

    #[test]
    fn resolve_rejects_missing_entry_and_length_mismatch() {
        let director = targets_meta(json!({"fw.bin": {"length": 4, "hashes": {"sha256": "00aa"}}}));
        let empty = targets_meta(json!({}));
        assert!(resolve_image_target(&empty, director.find("fw.bin").unwrap()).is_err());

        let wrong_length = targets_meta(json!({"fw.bin": {"length": 5, "hashes": {"sha256": "00aa"}}}));
        assert!(resolve_image_target(&wrong_length, director.find("fw.bin").unwrap()).is_err());
    }

    #[test]
    fn resolve_requires_shared_supported_algorithm() {
        let director = targets_meta(json!({"fw.bin": {"length": 4, "hashes": {"md5": "00aa"}}}));
        let images = targets_meta(json!({"fw.bin": {"length": 4, "hashes": {"sha256": "00bb"}}}));
        assert!(resolve_image_target(&images, director.find("fw.bin").unwrap()).is_err());
    }
}
