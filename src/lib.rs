// Copyright 2025 The Uptane Client Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! An Uptane over-the-air update client for a vehicle Primary ECU.
//!
//! The crate verifies signed metadata from the two Uptane repositories (the
//! vehicle-specific Director and the fleet-wide Images repository), resolves
//! which firmware images each ECU should run, downloads and verifies the
//! payloads, dispatches metadata and firmware to Secondary ECUs, and reports
//! results back to the backend.
//!
//! Platform collaborators (HTTP transport, package manager, bootloader,
//! signing keys, Secondary ECU links) are injected through traits so that the
//! verification engine and the update cycle stay testable off-vehicle.

pub mod bootloader;
pub mod canonical;
pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod keystore;
pub mod matcher;
pub mod metadata;
pub mod pacman;
pub mod repo;
pub mod report;
pub mod secondary;
pub mod storage;
pub mod transport;
pub mod verify;

pub use crate::client::UptaneClient;
pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::events::{Command, Event};
