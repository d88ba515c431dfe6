// Copyright 2025 The Uptane Client Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The command and event surface of the update client.

use crate::metadata::Target;

/// Commands the embedder (or the polling timer) enqueues for the client.
/// They are processed strictly in order, one at a time.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Push hardware info, installed packages and the current manifest.
    SendDeviceData,
    /// Put the aggregate version manifest to the Director.
    PutManifest,
    /// Run an online Uptane iteration against both repositories.
    FetchMeta,
    /// Re-validate stored metadata offline and report any new targets.
    CheckUpdates,
    /// Download and verify the given targets.
    StartDownload(Vec<Target>),
    /// Install the given targets on the Primary and fan out to Secondaries.
    UptaneInstall(Vec<Target>),
    /// Stop the command loop.
    Shutdown,
}

/// Events emitted on the event channel as commands complete.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    SendDeviceDataComplete,
    PutManifestComplete,
    FetchMetaComplete,
    /// New targets were found for at least one ECU.
    UpdateAvailable(Vec<Target>),
    /// Metadata is current and nothing new is installable.
    UptaneTimestampUpdated,
    /// Every requested target was downloaded and verified.
    DownloadComplete(Vec<Target>),
    InstallComplete,
    Error(String),
}
