// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod retry;
pub mod identity;
pub mod workload;
pub mod install;
pub mod uninstall;
pub mod login;
pub mod discovery;

pub mod sync;
pub mod jobs;
pub mod images;

// Re-export services for convenience
pub use install::{InstallError, InstallOutcome, InstallStep, Installer};
pub use uninstall::{UninstallError, UninstallOutcome, Uninstaller};
pub use identity::{IdentityError, IdentityProvisioner};
pub use sync::{ContentSyncEngine, SyncError, SyncSettings};
pub use jobs::{JobError, JobTracker, ProgressSettings};
pub use images::{ImagesError, ImagesService};
