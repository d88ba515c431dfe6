// Copyright 2025 The Uptane Client Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The bootloader seam.
//!
//! Installations that only take effect after a reboot are coordinated through
//! a reboot flag: set when an install reports it needs completion, observed
//! on the next startup, cleared once the result is reconciled.

pub trait Bootloader {
    /// Mark the currently running image as good. Called once the client is
    /// up; a missing network connection is not a reason to roll back.
    fn set_boot_ok(&mut self);

    /// Notify that an installation is about to mutate the system.
    fn update_notify(&mut self);

    /// Persist the flag that a reboot is required to finish an install.
    fn reboot_flag_set(&mut self);

    fn reboot_flag_clear(&mut self);

    /// True when this process start is the first one after a reboot that was
    /// requested through [`Bootloader::reboot_flag_set`].
    fn reboot_detected(&self) -> bool;

    /// Trigger the reboot itself.
    fn reboot(&mut self);
}

pub mod mock {
    use super::*;

    #[derive(Default)]
    pub struct MockBootloader {
        pub boot_ok_calls: u32,
        pub update_notifications: u32,
        pub flag: bool,
        pub detected: bool,
        pub reboots: u32,
    }

    impl MockBootloader {
        pub fn new() -> Self {
            Default::default()
        }

        /// Simulate coming back up after a flagged reboot.
        pub fn rebooted() -> Self {
            MockBootloader { detected: true, flag: true, ..Default::default() }
        }
    }

    impl Bootloader for MockBootloader {
        fn set_boot_ok(&mut self) {
            self.boot_ok_calls += 1;
        }

        fn update_notify(&mut self) {
            self.update_notifications += 1;
        }

        fn reboot_flag_set(&mut self) {
            self.flag = true;
        }

        fn reboot_flag_clear(&mut self) {
            self.flag = false;
        }

        fn reboot_detected(&self) -> bool {
            self.detected
        }

        fn reboot(&mut self) {
            self.reboots += 1;
        }
    }
}
