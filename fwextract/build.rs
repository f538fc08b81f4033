// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::io;

use constcat::concat;

const PROTO_DIR: &str = "protobuf";
const UPDATE_METADATA_PROTO: &str = concat!(PROTO_DIR, "/update_metadata.proto");

fn main() -> io::Result<()> {
    println!("cargo:rerun-if-changed={PROTO_DIR}");
    println!("cargo:rerun-if-changed={UPDATE_METADATA_PROTO}");

    let fds = protox::compile([UPDATE_METADATA_PROTO], [PROTO_DIR])
        .map_err(|e| io::Error::other(e.to_string()))?;

    prost_build::Config::new()
        // Keep the generated maps deterministic.
        .btree_map(["."])
        .compile_fds(fds)
}
