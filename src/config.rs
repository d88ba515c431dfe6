// Copyright 2025 The Uptane Client Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Client configuration.
//!
//! Parsing a config file into these sections is the embedder's business;
//! the client only reads the resulting struct.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub uptane: UptaneConfig,
    pub storage: StorageConfig,
    pub pacman: PacmanConfig,
    pub tls: TlsConfig,
    pub telemetry: TelemetryConfig,
    pub device: DeviceConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct UptaneConfig {
    /// Base URL of the vehicle-specific Director repository.
    pub director_server: String,
    /// Base URL of the fleet-wide Images repository.
    pub repo_server: String,
    pub primary_ecu_serial: String,
    pub primary_ecu_hardware_id: String,
    /// Seconds between automatic metadata polls.
    pub polling_sec: u64,
}

impl Default for UptaneConfig {
    fn default() -> Self {
        UptaneConfig {
            director_server: String::new(),
            repo_server: String::new(),
            primary_ecu_serial: String::new(),
            primary_ecu_hardware_id: String::new(),
            polling_sec: 10,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PacmanConfig {
    /// Default remote for atomic-tree pulls, unless a target carries its own
    /// uri.
    pub ostree_server: String,
    /// Extra HTTP headers for tree pulls.
    pub extra_headers: std::collections::HashMap<String, String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Base URL of the device gateway (telemetry, inventory, events).
    pub server: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub report_network: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig { report_network: true }
    }
}

/// Facts about the device the embedder collected; pushed verbatim by
/// `SendDeviceData`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub hardware_info: Value,
    pub network_info: Value,
}
