// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod cluster;
pub mod containerd;
pub mod content;
pub mod event_bus;
pub mod pki;
pub mod registry;
