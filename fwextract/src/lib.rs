// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

//! fwextract is primarily an application, so the semver versioning covers the
//! CLI only. All Rust APIs can change at any time, even in patch releases.
//!
//! The decoders in [`format`] are generic over their readers and writers,
//! while the CLI source files use concrete types wherever possible.

pub mod cli;
pub mod config;
pub mod format;
pub mod protobuf;
pub mod stream;
pub mod util;
