// Copyright 2025 The Uptane Client Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The package manager seam.
//!
//! The backend that actually writes images to disk (atomic tree deployment
//! or plain binary install) lives behind [`PackageManager`]. The client only
//! ever sees installation results and the currently deployed content digest.

use crate::metadata::Target;
use crate::storage::TlsCredentials;
use crate::transport::FlowControlToken;
use futures::future::LocalBoxFuture;
use serde::de::Error as DeserializeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::HashMap;

/// Outcome class of one installation attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResultCode {
    Ok,
    AlreadyProcessed,
    ValidationFailed,
    InstallFailed,
    GeneralFailure,
    InProgress,
    NeedsCompletion,
}

impl ResultCode {
    pub fn as_code(&self) -> u32 {
        match self {
            ResultCode::Ok => 0,
            ResultCode::AlreadyProcessed => 1,
            ResultCode::ValidationFailed => 2,
            ResultCode::InstallFailed => 3,
            ResultCode::GeneralFailure => 4,
            ResultCode::InProgress => 5,
            ResultCode::NeedsCompletion => 6,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            0 => ResultCode::Ok,
            1 => ResultCode::AlreadyProcessed,
            2 => ResultCode::ValidationFailed,
            3 => ResultCode::InstallFailed,
            5 => ResultCode::InProgress,
            6 => ResultCode::NeedsCompletion,
            _ => ResultCode::GeneralFailure,
        }
    }
}

impl Serialize for ResultCode {
    fn serialize<S: Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_u32(self.as_code())
    }
}

impl<'de> Deserialize<'de> for ResultCode {
    fn deserialize<D: Deserializer<'de>>(de: D) -> Result<Self, D::Error> {
        let code: u32 = Deserialize::deserialize(de)?;
        if code > 6 {
            return Err(DeserializeError::custom(format!("unknown result code {}", code)));
        }
        Ok(ResultCode::from_code(code))
    }
}

/// Result of one install/download attempt for one target.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallationResult {
    /// File name of the target the attempt was for.
    pub id: String,
    pub result_code: ResultCode,
    pub result_text: String,
}

impl InstallationResult {
    pub fn new(id: impl Into<String>, result_code: ResultCode, result_text: impl Into<String>) -> Self {
        InstallationResult { id: id.into(), result_code, result_text: result_text.into() }
    }

    pub fn ok(id: impl Into<String>) -> Self {
        InstallationResult::new(id, ResultCode::Ok, "Installation successful")
    }

    pub fn is_success(&self) -> bool {
        matches!(self.result_code, ResultCode::Ok | ResultCode::AlreadyProcessed)
    }
}

/// One entry of the installed-software inventory pushed to the backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledPackage {
    pub name: String,
    pub version: String,
}

/// Whether a previously fetched target is still present and intact.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetStatus {
    Good,
    NotFound,
}

/// Where an atomic-tree pull fetches commits from.
#[derive(Clone, Debug, Default)]
pub struct TreehubRemote {
    pub url: String,
    pub credentials: Option<TlsCredentials>,
    pub headers: HashMap<String, String>,
}

/// Receives coarse progress while a pull is running.
///
/// Implementations are called at most a few times per second; the pull checks
/// its cancellation token at the same cadence.
pub trait ProgressObserver {
    fn receive_progress(&self, target: &Target, operation: &str, percent: u32);
}

pub trait PackageManager {
    fn name(&self) -> &'static str;

    /// The currently deployed image, identified by its content digest.
    ///
    /// `None` on a fresh device that has never reported nor installed
    /// anything through this client.
    fn get_current(&self) -> Option<Target>;

    fn installed_packages(&self) -> Vec<InstalledPackage>;

    /// True when the running image differs from the one that booted last
    /// time, i.e. an installation took effect.
    fn image_updated(&self) -> bool;

    fn install(&mut self, target: &Target) -> InstallationResult;

    /// Complete an installation that needed a reboot to take effect.
    fn finalize_install(&mut self, target: &Target) -> InstallationResult;

    fn verify_target(&self, target: &Target) -> TargetStatus;

    /// Pull an atomic-tree target by its refhash from `remote`.
    ///
    /// Long pulls poll `token` at progress granularity and abort cleanly
    /// when it is cancelled.
    fn fetch_target<'a>(
        &'a mut self,
        target: &'a Target,
        remote: &'a TreehubRemote,
        token: &'a FlowControlToken,
        progress: Option<&'a dyn ProgressObserver>,
    ) -> LocalBoxFuture<'a, InstallationResult>;
}

pub mod mock {
    use super::*;
    use futures::future;
    use futures::FutureExt;
    use std::collections::VecDeque;

    /// Scriptable package manager: results are queued per operation, calls
    /// are recorded for assertions. An empty queue yields success.
    #[derive(Default)]
    pub struct MockPackageManager {
        pub current: Option<Target>,
        pub packages: Vec<InstalledPackage>,
        pub updated: bool,
        /// Targets `verify_target` reports as already present.
        pub present_targets: Vec<String>,
        install_results: VecDeque<InstallationResult>,
        finalize_results: VecDeque<InstallationResult>,
        fetch_results: VecDeque<InstallationResult>,
        pub installed: Vec<Target>,
        pub finalized: Vec<Target>,
        pub fetched: Vec<Target>,
    }

    impl MockPackageManager {
        pub fn new() -> Self {
            Default::default()
        }

        pub fn enqueue_install_result(&mut self, result: InstallationResult) {
            self.install_results.push_back(result);
        }

        pub fn enqueue_finalize_result(&mut self, result: InstallationResult) {
            self.finalize_results.push_back(result);
        }

        pub fn enqueue_fetch_result(&mut self, result: InstallationResult) {
            self.fetch_results.push_back(result);
        }
    }

    impl PackageManager for MockPackageManager {
        fn name(&self) -> &'static str {
            "mock"
        }

        fn get_current(&self) -> Option<Target> {
            self.current.clone()
        }

        fn installed_packages(&self) -> Vec<InstalledPackage> {
            self.packages.clone()
        }

        fn image_updated(&self) -> bool {
            self.updated
        }

        fn install(&mut self, target: &Target) -> InstallationResult {
            self.installed.push(target.clone());
            self.install_results
                .pop_front()
                .unwrap_or_else(|| InstallationResult::ok(target.filename.as_str()))
        }

        fn finalize_install(&mut self, target: &Target) -> InstallationResult {
            self.finalized.push(target.clone());
            self.finalize_results
                .pop_front()
                .unwrap_or_else(|| InstallationResult::ok(target.filename.as_str()))
        }

        fn verify_target(&self, target: &Target) -> TargetStatus {
            if self.present_targets.contains(&target.filename) {
                TargetStatus::Good
            } else {
                TargetStatus::NotFound
            }
        }

        fn fetch_target<'a>(
            &'a mut self,
            target: &'a Target,
            _remote: &'a TreehubRemote,
            token: &'a FlowControlToken,
            progress: Option<&'a dyn ProgressObserver>,
        ) -> LocalBoxFuture<'a, InstallationResult> {
            self.fetched.push(target.clone());
            let result = if !token.can_continue() {
                InstallationResult::new(
                    target.filename.as_str(),
                    ResultCode::GeneralFailure,
                    "Pull cancelled",
                )
            } else {
                if let Some(progress) = progress {
                    progress.receive_progress(target, "Receiving objects", 100);
                }
                self.fetch_results
                    .pop_front()
                    .unwrap_or_else(|| InstallationResult::ok(target.filename.as_str()))
            };
            future::ready(result).boxed_local()
        }
    }
}
