// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the kiln CLI

pub mod agent;
pub mod builder;
pub mod image;

pub use self::agent::AgentArgs;
pub use self::builder::BuilderCommand;
pub use self::image::ImageCommand;
