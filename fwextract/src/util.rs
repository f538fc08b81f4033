// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{
    ffi::OsStr,
    fmt, io,
    path::{Component, Path, PathBuf},
};

const ZEROS: [u8; 16384] = [0u8; 16384];

/// Check if a byte slice is all zeros.
pub fn is_zero(mut buf: &[u8]) -> bool {
    while !buf.is_empty() {
        let n = buf.len().min(ZEROS.len());
        if buf[..n] != ZEROS[..n] {
            return false;
        }

        buf = &buf[n..];
    }

    true
}

/// Get the non-empty parent of a path. If the path has no parent in the string,
/// then `.` is returned. This does not perform any filesystem operations.
pub fn parent_path(path: &Path) -> &Path {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            return parent;
        }
    }

    Path::new(".")
}

/// A string that is shown via its [`fmt::Debug`] representation. This is used
/// in error types to store potentially non-printable values without keeping a
/// reference to the original.
#[derive(Clone, PartialEq, Eq)]
pub struct DebugString(String);

impl DebugString {
    pub fn new(value: impl fmt::Debug) -> Self {
        Self(format!("{value:?}"))
    }
}

impl fmt::Debug for DebugString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Join `name` onto `base`, ensuring that `name` is a single normal path
/// component. This prevents names from untrusted metadata from escaping the
/// output directory.
pub fn path_join_single(base: &Path, name: impl AsRef<OsStr>) -> io::Result<PathBuf> {
    let name = name.as_ref();
    let mut components = Path::new(name).components();

    match (components.next(), components.next()) {
        (Some(Component::Normal(c)), None) if c == name => Ok(base.join(c)),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("Unsafe path component: {name:?}"),
        )),
    }
}
