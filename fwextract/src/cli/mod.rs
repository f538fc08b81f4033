// SPDX-FileCopyrightText: 2023-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, io};

use thiserror::Error;

use crate::format::{self, Category};

pub mod args;
pub mod completion;
pub mod config;
pub mod lp;
pub mod payload;
pub mod probe;
pub mod sparse;
pub mod transfer;

macro_rules! status {
    ($($arg:tt)*) => {
        println!("\x1b[1m[*] {}\x1b[0m", format!($($arg)*))
    }
}

macro_rules! warning {
    ($($arg:tt)*) => {
        println!("\x1b[1;31m[WARNING] {}\x1b[0m", format!($($arg)+))
    }
}

pub(crate) use status;
pub(crate) use warning;

/// One or more partitions could not be extracted. The other partitions were
/// still written.
#[derive(Debug, Error)]
pub struct PartitionsFailed {
    /// Names and categories in the order the partitions were listed.
    pub failures: Vec<(String, Category)>,
}

impl fmt::Display for PartitionsFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed to extract {} partition(s):", self.failures.len())?;

        for (name, category) in &self.failures {
            write!(f, " {name} ({category})")?;
        }

        Ok(())
    }
}

impl PartitionsFailed {
    pub fn category(&self) -> Category {
        self.failures
            .first()
            .map(|(_, c)| *c)
            .unwrap_or(Category::Io)
    }
}

/// Find the most specific category for an error. The first error in the
/// chain with a known type determines the category.
pub fn error_category(error: &anyhow::Error) -> Category {
    for cause in error.chain() {
        if let Some(e) = cause.downcast_ref::<format::sparse::Error>() {
            return e.category();
        } else if let Some(e) = cause.downcast_ref::<format::transfer::Error>() {
            return e.category();
        } else if let Some(e) = cause.downcast_ref::<format::lp::Error>() {
            return e.category();
        } else if let Some(e) = cause.downcast_ref::<format::payload::Error>() {
            return e.category();
        } else if let Some(e) = cause.downcast_ref::<format::probe::Error>() {
            return e.category();
        } else if let Some(e) = cause.downcast_ref::<PartitionsFailed>() {
            return e.category();
        } else if cause.downcast_ref::<crate::config::Error>().is_some() {
            return Category::Io;
        } else if let Some(e) = cause.downcast_ref::<io::Error>() {
            return Category::from_io(e);
        }
    }

    Category::Io
}
