// Copyright 2025 The Uptane Client Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The update orchestrator running on the Primary ECU.
//!
//! One logical worker owns the client and processes commands strictly in
//! order: fetch and verify metadata from both repositories, work out which
//! targets are new, download and verify payloads, fan out to Secondaries,
//! install on the Primary, and report results. Verification failures abort
//! the running cycle without touching stored state; transport failures are
//! simply retried on the next poll.

use crate::bootloader::Bootloader;
use crate::config::Config;
use crate::crypto;
use crate::error::{Error, Result};
use crate::events::{Command, Event};
use crate::keystore::{self, KeyStore};
use crate::matcher;
use crate::metadata::{
    extract_version_untrusted, EcuSerial, HardwareId, RepositoryType, Role, SignedObject,
    SnapshotMetadata, Target, TargetFormat,
};
use crate::pacman::{
    InstallationResult, PackageManager, ProgressObserver, ResultCode, TreehubRemote,
};
use crate::repo::{
    DirectorRepo, ImagesRepo, MAX_DIRECTOR_TARGETS_SIZE, MAX_IMAGES_TARGETS_SIZE, MAX_ROOT_SIZE,
    MAX_SNAPSHOT_SIZE, MAX_TIMESTAMP_SIZE,
};
use crate::report;
use crate::secondary::{MetadataBundle, Secondary, SecondaryDispatcher};
use crate::storage::{InstalledVersion, Storage};
use crate::transport::{Fetcher, FlowControlToken, Transport};
use chrono::Utc;
use futures::channel::mpsc;
use futures::StreamExt;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};

/// Logs pull progress; doubles as the cadence at which cancellation is
/// observed.
struct LogProgress;

impl ProgressObserver for LogProgress {
    fn receive_progress(&self, target: &Target, operation: &str, percent: u32) {
        info!("{}: {} {}%", target.filename, operation, percent);
    }
}

pub struct UptaneClient<T, S, P, B, K> {
    config: Config,
    transport: T,
    storage: S,
    pacman: P,
    bootloader: B,
    keystore: K,
    secondaries: SecondaryDispatcher,
    director: DirectorRepo,
    images: ImagesRepo,
    fetcher: Fetcher,
    events: mpsc::UnboundedSender<Event>,
    primary_serial: EcuSerial,
    primary_hw_id: HardwareId,
    hw_ids: HashMap<EcuSerial, HardwareId>,
    installed_images: HashMap<EcuSerial, String>,
    last_exception: Option<String>,
    last_network_info: Option<Value>,
    token: FlowControlToken,
}

impl<T, S, P, B, K> UptaneClient<T, S, P, B, K>
where
    T: Transport,
    S: Storage,
    P: PackageManager,
    B: Bootloader,
    K: KeyStore,
{
    /// Build a client and run startup reconciliation: adopt or provision the
    /// ECU table, mark the boot good when an installation took effect, and
    /// finish any install that was waiting for this reboot.
    pub fn new(
        config: Config,
        transport: T,
        storage: S,
        pacman: P,
        bootloader: B,
        keystore: K,
    ) -> Result<(Self, mpsc::UnboundedReceiver<Event>)> {
        let (events, events_rx) = mpsc::unbounded();
        let fetcher = Fetcher::new(
            config.uptane.director_server.as_str(),
            config.uptane.repo_server.as_str(),
        );
        let primary_serial = EcuSerial::new(config.uptane.primary_ecu_serial.as_str());
        let primary_hw_id = HardwareId::new(config.uptane.primary_ecu_hardware_id.as_str());

        let mut client = UptaneClient {
            config,
            transport,
            storage,
            pacman,
            bootloader,
            keystore,
            secondaries: SecondaryDispatcher::new(),
            director: DirectorRepo::new(),
            images: ImagesRepo::new(),
            fetcher,
            events,
            primary_serial,
            primary_hw_id,
            hw_ids: HashMap::new(),
            installed_images: HashMap::new(),
            last_exception: None,
            last_network_info: None,
            token: FlowControlToken::new(),
        };
        client.initialize()?;
        Ok((client, events_rx))
    }

    fn initialize(&mut self) -> Result<()> {
        let mut serials = self.storage.load_ecu_serials()?;
        if serials.is_empty() {
            serials = vec![(self.primary_serial.clone(), self.primary_hw_id.clone())];
            self.storage.store_ecu_serials(&serials)?;
        }
        // Index 0 is the Primary; a stored table wins over configuration.
        self.primary_serial = serials[0].0.clone();
        self.primary_hw_id = serials[0].1.clone();
        self.hw_ids = serials.into_iter().collect();

        // The boot is good as soon as we are running. A missing network
        // connection is not a reason to roll back.
        if self.pacman.image_updated() {
            self.bootloader.set_boot_ok();
        }

        if self.bootloader.reboot_detected() {
            self.complete_pending_install()?;
        }
        Ok(())
    }

    /// Finish an installation that reported `NeedsCompletion` before the
    /// reboot. If a different image booted than the one we installed, the
    /// deployment rolled back underneath us.
    fn complete_pending_install(&mut self) -> Result<()> {
        let pending = match self.storage.load_pending_target()? {
            Some(pending) => pending,
            None => {
                self.bootloader.reboot_flag_clear();
                return Ok(());
            }
        };

        let booted = self.pacman.get_current().and_then(|t| t.sha256_hash());
        let result = if booted.is_some() && booted == pending.sha256_hash() {
            let result = self.pacman.finalize_install(&pending);
            if result.result_code == ResultCode::Ok {
                self.storage.save_installed_version(&InstalledVersion {
                    target: pending.clone(),
                    ecu_serial: self.primary_serial.clone(),
                    installed_at: Utc::now(),
                })?;
            }
            result
        } else {
            error!("{}: different image booted than installed", pending.filename);
            InstallationResult::new(
                pending.filename.as_str(),
                ResultCode::InstallFailed,
                "Wrong version booted",
            )
        };

        self.storage.store_installation_result(&result)?;
        self.storage.store_pending_target(None)?;
        self.bootloader.reboot_flag_clear();
        Ok(())
    }

    /// Register a Secondary and persist the extended ECU table.
    pub fn add_secondary(&mut self, secondary: Box<dyn Secondary>) -> Result<()> {
        let serial = secondary.serial();
        let hw_id = secondary.hw_id();
        if !self.secondaries.register(secondary) {
            return Ok(());
        }
        self.hw_ids.insert(serial, hw_id);

        let mut serials = vec![(self.primary_serial.clone(), self.primary_hw_id.clone())];
        for serial in self.secondaries.serials() {
            if let Some(hw_id) = self.hw_ids.get(&serial) {
                serials.push((serial.clone(), hw_id.clone()));
            }
        }
        self.storage.store_ecu_serials(&serials)?;
        Ok(())
    }

    /// A clone of the cancellation token; aborting it cancels any in-flight
    /// pull at progress granularity. Installs are never interrupted.
    pub fn flow_control(&self) -> FlowControlToken {
        self.token.clone()
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn pacman(&self) -> &P {
        &self.pacman
    }

    pub fn pacman_mut(&mut self) -> &mut P {
        &mut self.pacman
    }

    pub fn bootloader(&self) -> &B {
        &self.bootloader
    }

    /// Process commands until the channel closes or `Shutdown` arrives.
    pub async fn run(&mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.next().await {
            if !self.handle_command(command).await {
                return;
            }
        }
    }

    /// Process a single command. Returns false once the client should stop.
    pub async fn handle_command(&mut self, command: Command) -> bool {
        info!("got {} command", command_name(&command));
        match command {
            Command::SendDeviceData => match self.send_device_data().await {
                Ok(()) => self.send_event(Event::SendDeviceDataComplete),
                Err(e) => self.report_error(e),
            },
            Command::PutManifest => match self.put_manifest().await {
                Ok(true) => self.send_event(Event::PutManifestComplete),
                Ok(false) => self.send_event(Event::Error("Could not put manifest.".into())),
                Err(e) => self.report_error(e),
            },
            Command::FetchMeta => match self.fetch_meta().await {
                Ok(()) => self.send_event(Event::FetchMetaComplete),
                Err(e) => self.report_error(e),
            },
            Command::CheckUpdates => self.check_updates(),
            Command::StartDownload(targets) => self.download_images(&targets).await,
            Command::UptaneInstall(targets) => self.uptane_install(&targets).await,
            Command::Shutdown => {
                self.token.abort();
                return false;
            }
        }
        true
    }

    fn send_event(&self, event: Event) {
        let _ = self.events.unbounded_send(event);
    }

    fn report_error(&mut self, err: Error) {
        error!("{}", err);
        // Transport errors are transient; everything else is remembered for
        // the next manifest.
        if !matches!(err, Error::Transport(_)) {
            self.last_exception = Some(err.to_string());
        }
        self.send_event(Event::Error(err.to_string()));
    }

    async fn send_device_data(&mut self) -> Result<()> {
        self.report_hw_info().await?;
        self.report_installed_packages().await?;
        self.report_network_info().await?;
        self.put_manifest().await?;
        Ok(())
    }

    async fn report_hw_info(&mut self) -> Result<()> {
        let hw_info = self.config.device.hardware_info.clone();
        if hw_info.is_null() {
            return Ok(());
        }
        let url = format!("{}/core/system_info", self.config.tls.server);
        crate::transport::put_json(&mut self.transport, &url, &hw_info).await
    }

    async fn report_installed_packages(&mut self) -> Result<()> {
        let packages = serde_json::to_value(self.pacman.installed_packages())
            .map_err(|e| Error::MalformedMetadata(e.to_string()))?;
        let url = format!("{}/core/installed", self.config.tls.server);
        crate::transport::put_json(&mut self.transport, &url, &packages).await
    }

    async fn report_network_info(&mut self) -> Result<()> {
        if !self.config.telemetry.report_network {
            debug!("not reporting network information because telemetry is disabled");
            return Ok(());
        }
        let network_info = self.config.device.network_info.clone();
        if network_info.is_null() || self.last_network_info.as_ref() == Some(&network_info) {
            return Ok(());
        }
        let url = format!("{}/system_info/network", self.config.tls.server);
        crate::transport::put_json(&mut self.transport, &url, &network_info).await?;
        self.last_network_info = Some(network_info);
        Ok(())
    }

    /// Assemble and upload the aggregate version manifest. Returns false when
    /// the upload was suppressed because some ECU is still mid-install.
    async fn put_manifest(&mut self) -> Result<bool> {
        let manifests = self.assemble_manifest()?;
        if has_pending_updates(&manifests) {
            debug!("not putting manifest while an installation is in progress");
            return Ok(false);
        }

        let mut payload = json!({ "ecu_version_manifests": manifests });
        if let Some(last_exception) = &self.last_exception {
            payload["custom"] = json!({ "last_exception": last_exception });
        }
        let signed = keystore::sign_payload(&self.keystore, payload)?;

        let url = format!("{}/manifest", self.config.uptane.director_server);
        crate::transport::put_json(&mut self.transport, &url, &signed).await?;
        Ok(true)
    }

    /// Build `{ecu_serial: signed version manifest}` for every ECU, and
    /// refresh the installed-images map as a side effect.
    fn assemble_manifest(&mut self) -> Result<Value> {
        self.installed_images.clear();

        let current = self.current_target()?;
        let hashes = serde_json::to_value(&current.hashes)
            .map_err(|e| Error::MalformedMetadata(e.to_string()))?;
        let mut unsigned = json!({
            "ecu_serial": self.primary_serial.as_str(),
            "installed_image": {
                "filepath": current.filename,
                "fileinfo": {
                    "length": current.length,
                    "hashes": hashes,
                },
            },
        });
        if let Some(result) = self.storage.load_installation_result()? {
            unsigned["custom"] = json!({ "operation_result": result });
        }
        self.installed_images
            .insert(self.primary_serial.clone(), current.filename.clone());

        let mut manifests = serde_json::Map::new();
        manifests.insert(
            self.primary_serial.to_string(),
            keystore::sign_payload(&self.keystore, unsigned)?,
        );

        for verified in self.secondaries.collect_manifests() {
            if let Some(filepath) = &verified.filepath {
                self.installed_images.insert(verified.serial.clone(), filepath.clone());
            }
            manifests.insert(verified.serial.to_string(), verified.manifest);
        }
        Ok(Value::Object(manifests))
    }

    /// What the Primary currently runs, reconciled against the installation
    /// log: the newest log entry matching the package manager's reported
    /// digest wins. A digest the log does not know yields a synthetic target
    /// so the backend can still identify the device.
    fn current_target(&self) -> Result<Target> {
        let digest = self.pacman.get_current().and_then(|t| t.sha256_hash());
        let digest = match digest {
            Some(digest) => digest,
            None => return Ok(unknown_target("noimage", None)),
        };

        for entry in self.storage.load_installed_versions()?.iter().rev() {
            if entry.target.sha256_hash().as_deref() == Some(digest.as_str()) {
                return Ok(entry.target.clone());
            }
        }
        Ok(unknown_target("unknown", Some(&digest)))
    }

    async fn fetch_meta(&mut self) -> Result<()> {
        if let Err(e) = self.report_network_info().await {
            warn!("could not report network info: {}", e);
        }
        self.put_manifest().await?;
        self.uptane_iteration().await
    }

    async fn uptane_iteration(&mut self) -> Result<()> {
        self.update_director_meta().await?;

        let targets = self.new_targets()?;
        if targets.is_empty() {
            return Ok(());
        }
        info!("got new updates");

        self.update_images_meta().await
    }

    fn new_targets(&self) -> Result<Vec<Target>> {
        let targets = self
            .director
            .targets()
            .ok_or_else(|| Error::MalformedMetadata("director targets not verified".into()))?;
        matcher::new_targets(targets, &self.hw_ids, &self.installed_images)
    }

    /// Director: root chain, then targets.
    async fn update_director_meta(&mut self) -> Result<()> {
        self.director.reset();
        let repo = RepositoryType::Director;

        match self.storage.load_latest_root(repo)? {
            Some(root) => self.director.init_root(&root)?,
            None => {
                // Cold start: trust-on-first-use of root version 1.
                let root = self
                    .fetcher
                    .fetch_role(&mut self.transport, repo, Role::Root, Some(1), MAX_ROOT_SIZE)
                    .await?;
                self.director.init_root(&root)?;
                self.storage.store_root(repo, 1, &root)?;
            }
        }

        let latest = self
            .fetcher
            .fetch_role(&mut self.transport, repo, Role::Root, None, MAX_ROOT_SIZE)
            .await?;
        let remote_version = extract_version_untrusted(&latest)?;
        let local_version = self.director.root_version();
        for version in (local_version + 1)..=remote_version {
            let root = self
                .fetcher
                .fetch_role(&mut self.transport, repo, Role::Root, Some(version), MAX_ROOT_SIZE)
                .await?;
            self.director.verify_root(&root)?;
            self.storage.store_root(repo, version, &root)?;
            // The rotated root may have revoked the keys that signed the
            // current non-root roles.
            self.storage.clear_non_root(repo)?;
        }
        self.director.check_root_expired(&Utc::now())?;

        let targets = self
            .fetcher
            .fetch_role(&mut self.transport, repo, Role::Targets, None, MAX_DIRECTOR_TARGETS_SIZE)
            .await?;
        let remote_version = extract_version_untrusted(&targets)?;
        let local_version = match self.storage.load_non_root(repo, Role::Targets)? {
            Some(stored) => Some(extract_version_untrusted(&stored)?),
            None => None,
        };

        self.director.verify_targets(&targets)?;
        self.commit_non_root(repo, Role::Targets, local_version, remote_version, &targets)?;
        self.director.check_targets_expired(&Utc::now())?;
        Ok(())
    }

    /// Images: root chain, timestamp, snapshot, targets.
    async fn update_images_meta(&mut self) -> Result<()> {
        self.images.reset();
        let repo = RepositoryType::Images;

        match self.storage.load_latest_root(repo)? {
            Some(root) => self.images.init_root(&root)?,
            None => {
                let root = self
                    .fetcher
                    .fetch_role(&mut self.transport, repo, Role::Root, Some(1), MAX_ROOT_SIZE)
                    .await?;
                self.images.init_root(&root)?;
                self.storage.store_root(repo, 1, &root)?;
            }
        }

        let latest = self
            .fetcher
            .fetch_role(&mut self.transport, repo, Role::Root, None, MAX_ROOT_SIZE)
            .await?;
        let remote_version = extract_version_untrusted(&latest)?;
        let local_version = self.images.root_version();
        for version in (local_version + 1)..=remote_version {
            let root = self
                .fetcher
                .fetch_role(&mut self.transport, repo, Role::Root, Some(version), MAX_ROOT_SIZE)
                .await?;
            self.images.verify_root(&root)?;
            self.storage.store_root(repo, version, &root)?;
            self.storage.clear_non_root(repo)?;
        }
        self.images.check_root_expired(&Utc::now())?;

        // Timestamp.
        let timestamp = self
            .fetcher
            .fetch_role(&mut self.transport, repo, Role::Timestamp, None, MAX_TIMESTAMP_SIZE)
            .await?;
        let remote_version = extract_version_untrusted(&timestamp)?;
        let local_version = match self.storage.load_non_root(repo, Role::Timestamp)? {
            Some(stored) => Some(extract_version_untrusted(&stored)?),
            None => None,
        };
        self.images.verify_timestamp(&timestamp)?;
        self.commit_non_root(repo, Role::Timestamp, local_version, remote_version, &timestamp)?;
        self.images.check_timestamp_expired(&Utc::now())?;

        // Snapshot, bounded by what the timestamp recorded.
        let max_size = self.images.snapshot_size().unwrap_or(MAX_SNAPSHOT_SIZE);
        let snapshot = self
            .fetcher
            .fetch_role(&mut self.transport, repo, Role::Snapshot, None, max_size)
            .await?;
        let remote_version = extract_version_untrusted(&snapshot)?;
        let prior = self.stored_snapshot()?;
        let local_version = prior.as_ref().map(|s| s.version);
        self.images.verify_snapshot(&snapshot, prior.as_ref())?;
        self.commit_non_root(repo, Role::Snapshot, local_version, remote_version, &snapshot)?;
        self.images.check_snapshot_expired(&Utc::now())?;

        // Targets, bounded by what the snapshot recorded.
        let max_size = self.images.targets_size().unwrap_or(MAX_IMAGES_TARGETS_SIZE);
        let targets = self
            .fetcher
            .fetch_role(&mut self.transport, repo, Role::Targets, None, max_size)
            .await?;
        let remote_version = extract_version_untrusted(&targets)?;
        let local_version = match self.storage.load_non_root(repo, Role::Targets)? {
            Some(stored) => Some(extract_version_untrusted(&stored)?),
            None => None,
        };
        self.images.verify_targets(&targets)?;
        self.commit_non_root(repo, Role::Targets, local_version, remote_version, &targets)?;
        self.images.check_targets_expired(&Utc::now())?;
        Ok(())
    }

    /// Version-gate a verified non-root role into storage: refuse rollback,
    /// write when newer, re-verify silently when equal.
    fn commit_non_root(
        &mut self,
        repo: RepositoryType,
        role: Role,
        local_version: Option<u64>,
        remote_version: u64,
        bytes: &[u8],
    ) -> Result<()> {
        match local_version {
            Some(stored) if stored > remote_version => Err(Error::VersionRollback {
                repo,
                role,
                stored,
                offered: remote_version,
            }),
            Some(stored) if stored == remote_version => Ok(()),
            _ => {
                self.storage.store_non_root(repo, role, bytes)?;
                Ok(())
            }
        }
    }

    /// The last snapshot this device accepted, if one is stored.
    fn stored_snapshot(&self) -> Result<Option<SnapshotMetadata>> {
        let bytes = match self.storage.load_non_root(RepositoryType::Images, Role::Snapshot)? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        // Stored copies were verified when written; a corrupt one just
        // loses the regression baseline.
        match SignedObject::from_slice(&bytes)
            .and_then(|doc| SnapshotMetadata::from_signed(&doc.signed))
        {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!("ignoring unreadable stored snapshot: {}", e);
                Ok(None)
            }
        }
    }

    /// `CheckUpdates`: validate stored metadata offline and report new
    /// targets without touching the network.
    fn check_updates(&mut self) {
        if let Err(e) = self.assemble_manifest() {
            error!("could not assemble manifest: {}", e);
        }

        let new = match self.offline_iteration() {
            Ok(new) => new,
            Err(e) => {
                error!("invalid stored uptane metadata: {}", e);
                self.report_error(e);
                return;
            }
        };

        // Only targets the Images repository vouches for are installable.
        let mut installable = Vec::new();
        for target in new {
            let resolved = self
                .images
                .targets()
                .ok_or_else(|| Error::MalformedMetadata("images targets not verified".into()))
                .and_then(|images| matcher::resolve_image_target(images, &target).map(|_| ()));
            match resolved {
                Ok(()) => installable.push(target),
                Err(e) => self.report_error(e),
            }
        }

        if installable.is_empty() {
            self.send_event(Event::UptaneTimestampUpdated);
        } else {
            self.send_event(Event::UpdateAvailable(installable));
        }
    }

    fn offline_iteration(&mut self) -> Result<Vec<Target>> {
        self.check_director_meta_offline()?;
        let targets = self.new_targets()?;
        if targets.is_empty() {
            return Ok(targets);
        }
        info!("got new updates");
        self.check_images_meta_offline()?;
        Ok(targets)
    }

    fn check_director_meta_offline(&mut self) -> Result<()> {
        self.director.reset();
        let repo = RepositoryType::Director;

        let root = self
            .storage
            .load_latest_root(repo)?
            .ok_or_else(|| Error::MalformedMetadata("no stored director root".into()))?;
        self.director.init_root(&root)?;
        self.director.check_root_expired(&Utc::now())?;

        let targets = self
            .storage
            .load_non_root(repo, Role::Targets)?
            .ok_or_else(|| Error::MalformedMetadata("no stored director targets".into()))?;
        self.director.verify_targets(&targets)?;
        self.director.check_targets_expired(&Utc::now())?;
        Ok(())
    }

    fn check_images_meta_offline(&mut self) -> Result<()> {
        self.images.reset();
        let repo = RepositoryType::Images;

        let root = self
            .storage
            .load_latest_root(repo)?
            .ok_or_else(|| Error::MalformedMetadata("no stored images root".into()))?;
        self.images.init_root(&root)?;
        self.images.check_root_expired(&Utc::now())?;

        let timestamp = self
            .storage
            .load_non_root(repo, Role::Timestamp)?
            .ok_or_else(|| Error::MalformedMetadata("no stored images timestamp".into()))?;
        self.images.verify_timestamp(&timestamp)?;
        self.images.check_timestamp_expired(&Utc::now())?;

        let snapshot = self
            .storage
            .load_non_root(repo, Role::Snapshot)?
            .ok_or_else(|| Error::MalformedMetadata("no stored images snapshot".into()))?;
        self.images.verify_snapshot(&snapshot, None)?;
        self.images.check_snapshot_expired(&Utc::now())?;

        let targets = self
            .storage
            .load_non_root(repo, Role::Targets)?
            .ok_or_else(|| Error::MalformedMetadata("no stored images targets".into()))?;
        self.images.verify_targets(&targets)?;
        self.images.check_targets_expired(&Utc::now())?;
        Ok(())
    }

    /// `StartDownload`: fetch and verify every target's payload. Targets
    /// that fail are dropped; `DownloadComplete` is only emitted when the
    /// whole set succeeded.
    async fn download_images(&mut self, targets: &[Target]) {
        let mut downloaded = Vec::new();
        for target in targets {
            match self.download_target(target).await {
                Ok(()) => downloaded.push(target.clone()),
                Err(e) => {
                    error!("download of {} failed: {}", target.filename, e);
                    if !matches!(e, Error::Transport(_)) {
                        self.last_exception = Some(e.to_string());
                    }
                }
            }
        }

        if targets.is_empty() {
            info!("no new updates, sending UptaneTimestampUpdated event");
            self.send_event(Event::UptaneTimestampUpdated);
        } else if downloaded.len() == targets.len() {
            self.send_event(Event::DownloadComplete(downloaded));
            if let Err(e) = self.send_download_report().await {
                warn!("could not send download report: {}", e);
            }
        } else {
            error!(
                "only {} of {} targets were successfully downloaded, report not sent",
                downloaded.len(),
                targets.len()
            );
            self.send_event(Event::Error("Partial download".into()));
        }
    }

    async fn download_target(&mut self, target: &Target) -> Result<()> {
        // Resolve against the Images repository; its entry carries the
        // authoritative hashes and any custom fetch uri.
        let image_target = {
            let images = self
                .images
                .targets()
                .ok_or_else(|| Error::MalformedMetadata("images targets not verified".into()))?;
            matcher::resolve_image_target(images, target)?.clone()
        };

        if image_target.is_ostree() {
            if self.pacman.verify_target(&image_target) == crate::pacman::TargetStatus::Good {
                debug!("{} already fetched", image_target.filename);
                return Ok(());
            }
            let remote = self.treehub_remote(&image_target)?;
            let token = self.token.clone();
            let result = self
                .pacman
                .fetch_target(&image_target, &remote, &token, Some(&LogProgress))
                .await;
            if !result.is_success() {
                return Err(Error::InstallFailed(result.result_text));
            }
        } else {
            let bytes = self
                .fetcher
                .fetch_target_payload(
                    &mut self.transport,
                    &image_target.filename,
                    image_target.uri.as_deref(),
                    image_target.length,
                )
                .await?;
            verify_payload(&image_target, &bytes)?;
            self.storage.store_target_payload(&image_target.filename, &bytes)?;
        }
        Ok(())
    }

    fn treehub_remote(&self, target: &Target) -> Result<TreehubRemote> {
        let url = target
            .uri
            .clone()
            .unwrap_or_else(|| self.config.pacman.ostree_server.clone());
        Ok(TreehubRemote {
            url,
            credentials: self.storage.load_tls_creds()?,
            headers: self.config.pacman.extra_headers.clone(),
        })
    }

    async fn send_download_report(&mut self) -> Result<()> {
        let targets = self
            .storage
            .load_non_root(RepositoryType::Director, Role::Targets)?
            .ok_or_else(|| Error::MalformedMetadata("no stored director targets".into()))?;
        let targets: Value = serde_json::from_slice(&targets)
            .map_err(|e| Error::MalformedMetadata(e.to_string()))?;
        report::enqueue(&mut self.storage, "DownloadComplete", 1, targets)?;
        report::flush(&mut self.storage, &mut self.transport, &self.config.tls.server).await?;
        Ok(())
    }

    /// `UptaneInstall`: metadata fan-out, Primary install, firmware fan-out.
    async fn uptane_install(&mut self, targets: &[Target]) {
        let primary_updates: Vec<Target> = targets
            .iter()
            .filter(|t| t.ecus.contains_key(&self.primary_serial))
            .cloned()
            .collect();

        self.send_metadata_to_ecus(targets).await;

        // One deployed tree per Primary, so at most one update applies.
        if let Some(target) = primary_updates.first() {
            if self.is_installed_on_primary(target) {
                let result = InstallationResult::new(
                    target.filename.as_str(),
                    ResultCode::AlreadyProcessed,
                    "Package already installed",
                );
                if let Err(e) = self.storage.store_installation_result(&result) {
                    error!("could not store installation result: {}", e);
                }
            } else {
                // Installation is not atomic; a premature notification does
                // not hurt once rollbacks work.
                self.bootloader.update_notify();
                self.install_and_record(target);
            }
        } else {
            info!("no update to install on primary");
        }

        self.send_images_to_ecus(targets).await;
        self.send_event(Event::InstallComplete);
    }

    fn is_installed_on_primary(&self, target: &Target) -> bool {
        let current = match self.pacman.get_current().and_then(|t| t.sha256_hash()) {
            Some(current) => current,
            None => return false,
        };
        target.sha256_hash().as_deref() == Some(current.as_str())
    }

    fn install_and_record(&mut self, target: &Target) {
        info!("installing {} using the {} package manager", target, self.pacman.name());
        let result = self.pacman.install(target);
        match result.result_code {
            ResultCode::Ok => {
                let entry = InstalledVersion {
                    target: target.clone(),
                    ecu_serial: self.primary_serial.clone(),
                    installed_at: Utc::now(),
                };
                if let Err(e) = self.storage.save_installed_version(&entry) {
                    error!("could not record installed version: {}", e);
                }
            }
            ResultCode::NeedsCompletion => {
                if let Err(e) = self.storage.store_pending_target(Some(target)) {
                    error!("could not record pending target: {}", e);
                }
                self.bootloader.reboot_flag_set();
            }
            _ => {}
        }
        if let Err(e) = self.storage.store_installation_result(&result) {
            error!("could not store installation result: {}", e);
        }
    }

    /// Push roots (Director first) and the metadata bundle to every
    /// Secondary addressed by `targets`. Per-ECU failures never abort the
    /// others.
    async fn send_metadata_to_ecus(&mut self, targets: &[Target]) {
        let bundle = match self.load_metadata_bundle() {
            Ok(bundle) => bundle,
            Err(e) => {
                error!("no metadata to send to secondaries: {}", e);
                return;
            }
        };

        let mut dispatched = BTreeSet::new();
        for target in targets {
            for serial in target.ecus.keys() {
                if !self.secondaries.is_registered(serial) || !dispatched.insert(serial.clone()) {
                    continue;
                }
                for repo in [RepositoryType::Director, RepositoryType::Images] {
                    if let Err(e) = self.rotate_secondary_root(repo, serial).await {
                        error!("root rotation for {} failed: {}", serial, e);
                    }
                }
                if let Err(e) = self.secondaries.put_metadata(serial, &bundle) {
                    error!("sending metadata to {} failed: {}", serial, e);
                    self.record_secondary_failure(serial, &e);
                }
            }
        }
    }

    fn load_metadata_bundle(&self) -> Result<MetadataBundle> {
        let load_non_root = |repo, role| -> Result<Vec<u8>> {
            self.storage.load_non_root(repo, role)?.ok_or_else(|| {
                Error::MalformedMetadata(format!("no stored {} {} metadata", repo, role))
            })
        };
        let load_root = |repo| -> Result<Vec<u8>> {
            self.storage
                .load_latest_root(repo)?
                .ok_or_else(|| Error::MalformedMetadata(format!("no stored {} root", repo)))
        };
        Ok(MetadataBundle {
            director_root: load_root(RepositoryType::Director)?,
            director_targets: load_non_root(RepositoryType::Director, Role::Targets)?,
            images_root: load_root(RepositoryType::Images)?,
            images_timestamp: load_non_root(RepositoryType::Images, Role::Timestamp)?,
            images_snapshot: load_non_root(RepositoryType::Images, Role::Snapshot)?,
            images_targets: load_non_root(RepositoryType::Images, Role::Targets)?,
        })
    }

    /// Bring one Secondary's root up to the local latest, replaying every
    /// intermediate version so it can verify the chain itself.
    async fn rotate_secondary_root(
        &mut self,
        repo: RepositoryType,
        serial: &EcuSerial,
    ) -> Result<()> {
        let local_version = match self.storage.load_latest_root(repo)? {
            Some(bytes) => extract_version_untrusted(&bytes)?,
            None => {
                error!("no {} root metadata to send", repo);
                return Ok(());
            }
        };
        let secondary_version = match self.secondaries.root_version(serial, repo) {
            Some(version) => version,
            None => return Ok(()),
        };

        for version in (secondary_version + 1)..=local_version {
            let root = match self.storage.load_root(repo, version)? {
                Some(root) => root,
                None => {
                    warn!("{} root v{} not in storage, trying the repository", repo, version);
                    self.fetcher
                        .fetch_role(&mut self.transport, repo, Role::Root, Some(version), MAX_ROOT_SIZE)
                        .await?
                }
            };
            self.secondaries.push_root(serial, repo, &root)?;
        }
        Ok(())
    }

    /// Stream each target's firmware to its addressed Secondaries: stored
    /// payload bytes for binary targets, a credentials package for
    /// atomic-tree targets so the Secondary pulls the commit itself.
    async fn send_images_to_ecus(&mut self, targets: &[Target]) {
        for target in targets {
            for serial in target.ecus.keys() {
                if !self.secondaries.is_registered(serial) {
                    continue;
                }
                let payload = match target.format {
                    TargetFormat::Ostree => match self.treehub_credentials() {
                        Ok(payload) => payload,
                        Err(e) => {
                            error!("cannot send tree update to {}: {}", serial, e);
                            continue;
                        }
                    },
                    TargetFormat::Binary => {
                        match self.storage.load_target_payload(&target.filename) {
                            Ok(Some(payload)) => payload,
                            Ok(None) => {
                                error!("no stored payload for {}", target.filename);
                                continue;
                            }
                            Err(e) => {
                                error!("could not read payload for {}: {}", target.filename, e);
                                continue;
                            }
                        }
                    }
                };
                if let Err(e) = self.secondaries.send_firmware(serial, &payload) {
                    error!("sending firmware to {} failed: {}", serial, e);
                    self.record_secondary_failure(serial, &e);
                }
            }
        }
    }

    /// Credentials package an atomic-tree Secondary needs to pull from the
    /// same remote as the Primary.
    fn treehub_credentials(&self) -> Result<Vec<u8>> {
        let creds = self.storage.load_tls_creds()?.ok_or_else(|| {
            Error::InstallFailed("could not load TLS credentials from storage".into())
        })?;
        let package = json!({
            "ca.pem": creds.ca,
            "client.pem": creds.cert,
            "pkey.pem": creds.pkey,
            "server.url": self.config.pacman.ostree_server,
        });
        serde_json::to_vec(&package).map_err(|e| Error::MalformedMetadata(e.to_string()))
    }

    fn record_secondary_failure(&mut self, serial: &EcuSerial, err: &Error) {
        let event = json!({ "ecu": serial.as_str(), "error": err.to_string() });
        if let Err(e) = report::enqueue(&mut self.storage, "EcuDispatchFailed", 1, event) {
            error!("could not queue dispatch-failure report: {}", e);
        }
    }
}

fn command_name(command: &Command) -> &'static str {
    match command {
        Command::SendDeviceData => "SendDeviceData",
        Command::PutManifest => "PutManifest",
        Command::FetchMeta => "FetchMeta",
        Command::CheckUpdates => "CheckUpdates",
        Command::StartDownload(_) => "StartDownload",
        Command::UptaneInstall(_) => "UptaneInstall",
        Command::Shutdown => "Shutdown",
    }
}

fn has_pending_updates(manifests: &Value) -> bool {
    manifests
        .as_object()
        .map(|manifests| {
            manifests.values().any(|manifest| {
                manifest["signed"]["custom"]["operation_result"]["result_code"].as_u64()
                    == Some(ResultCode::InProgress.as_code() as u64)
            })
        })
        .unwrap_or(false)
}

/// A placeholder target for images nothing in the log accounts for.
fn unknown_target(filename: &str, sha256: Option<&str>) -> Target {
    let mut hashes = HashMap::new();
    if let Some(digest) = sha256 {
        if let Ok(value) = crypto::HashValue::from_hex(digest) {
            hashes.insert(crypto::HashAlgorithm::Sha256, value);
        }
    }
    Target {
        filename: filename.to_string(),
        length: 0,
        hashes,
        format: TargetFormat::Ostree,
        uri: None,
        ecus: HashMap::new(),
    }
}

/// Check a downloaded payload against its metadata: exact length and every
/// locally computable hash, of which there must be at least one.
fn verify_payload(target: &Target, bytes: &[u8]) -> Result<()> {
    if bytes.len() as u64 != target.length {
        return Err(Error::DownloadHashMismatch(target.filename.clone()));
    }
    let mut checked = 0;
    for (alg, expected) in &target.hashes {
        if let Some(actual) = crypto::digest(alg, bytes) {
            if &actual != expected {
                return Err(Error::DownloadHashMismatch(target.filename.clone()));
            }
            checked += 1;
        }
    }
    if checked == 0 {
        return Err(Error::DownloadHashMismatch(target.filename.clone()));
    }
    Ok(())
}
