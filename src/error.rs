// Copyright 2025 The Uptane Client Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Error types for metadata verification and the update cycle.

use crate::metadata::{EcuSerial, RepositoryType, Role};
use crate::storage::StorageError;
use crate::transport::TransportError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong while verifying metadata or driving an
/// update cycle.
///
/// Verification failures abort the running cycle and are surfaced through the
/// event channel and the next manifest; they are never persisted. Transport
/// failures are transient and retried on the next poll.
#[derive(Debug, Error)]
pub enum Error {
    #[error("malformed metadata: {0}")]
    MalformedMetadata(String),

    #[error("signature verification failed")]
    SignatureInvalid,

    #[error("{role} on {repo} repository signed below threshold")]
    ThresholdUnmet { repo: RepositoryType, role: Role },

    #[error("root v{version} on {repo} repository not signed by both old and new keys")]
    UnmetThresholdAfterRotation { repo: RepositoryType, version: u64 },

    #[error("expired {role} metadata on {repo} repository")]
    ExpiredMetadata { repo: RepositoryType, role: Role },

    #[error("{role} on {repo} repository went back from version {stored} to {offered}")]
    VersionRollback { repo: RepositoryType, role: Role, stored: u64, offered: u64 },

    #[error("director and images repositories disagree about {0}")]
    CrossRepoMismatch(String),

    #[error("unknown ECU serial {0} in director targets")]
    UnknownEcu(EcuSerial),

    #[error("wrong hardware identifier for ECU {0}")]
    HardwareIdMismatch(EcuSerial),

    #[error("downloaded {0} does not match its metadata hashes")]
    DownloadHashMismatch(String),

    #[error("installation failed: {0}")]
    InstallFailed(String),

    #[error("secondary ECU {0} unreachable")]
    SecondaryUnreachable(EcuSerial),

    #[error("key store: {0}")]
    KeyStore(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}
