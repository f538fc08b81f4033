// SPDX-FileCopyrightText: 2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fs, io, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::format::{DEFAULT_BLOCK_SIZE, DecodeOptions, OutputPolicy};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to read config: {0:?}")]
    Read(Box<Path>, #[source] io::Error),
    #[error("Failed to parse config: {0:?}")]
    Parse(Box<Path>, #[source] toml_edit::de::Error),
    #[error("Failed to serialize config")]
    Serialize(#[from] toml_edit::ser::Error),
    #[error("Block size must be a non-zero multiple of 4: {0}")]
    InvalidBlockSize(u32),
}

type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Self::ERROR,
            LogLevel::Warn => Self::WARN,
            LogLevel::Info => Self::INFO,
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Trace => Self::TRACE,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecodeConfig {
    pub block_size: u32,
    pub verify: bool,
    /// 0 uses the available parallelism.
    pub workers: usize,
    pub output_exists: OutputPolicy,
}

impl Default for DecodeConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            verify: true,
            workers: 0,
            output_exists: OutputPolicy::Fail,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: LogLevel,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub decode: DecodeConfig,
    pub logging: LoggingConfig,
}

impl FromStr for Config {
    type Err = toml_edit::de::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        toml_edit::de::from_str(s)
    }
}

impl Config {
    /// Load the config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path).map_err(|e| Error::Read(path.into(), e))?;
        let config = data
            .parse::<Self>()
            .map_err(|e| Error::Parse(path.into(), e))?;

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let block_size = self.decode.block_size;
        if block_size == 0 || block_size % 4 != 0 {
            return Err(Error::InvalidBlockSize(block_size));
        }

        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml_edit::ser::to_string_pretty(self)?)
    }

    pub fn decode_options(&self) -> DecodeOptions {
        DecodeOptions {
            block_size: self.decode.block_size,
            verify: self.decode.verify,
            workers: self.decode.workers,
            output_exists: self.decode.output_exists,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_partial() {
        let config = "[decode]\nworkers = 4\noutput_exists = \"overwrite\"\n"
            .parse::<Config>()
            .unwrap();

        assert_eq!(config.decode.workers, 4);
        assert_eq!(config.decode.output_exists, OutputPolicy::Overwrite);
        assert_eq!(config.decode.block_size, 4096);
        assert!(config.decode.verify);
        assert_eq!(config.logging.level, LogLevel::Info);

        let options = config.decode_options();
        assert_eq!(options.workers, 4);
        assert_eq!(options.output_exists, OutputPolicy::Overwrite);
    }

    #[test]
    fn reject_unknown_keys() {
        assert!("[decode]\nblocksize = 512\n".parse::<Config>().is_err());
        assert!("[other]\n".parse::<Config>().is_err());
        assert!("[logging]\nlevel = \"loud\"\n".parse::<Config>().is_err());
    }

    #[test]
    fn round_trip_default() {
        let config = Config::default();
        let toml = config.to_toml().unwrap();

        assert_eq!(toml.parse::<Config>().unwrap(), config);
    }

    #[test]
    fn load_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("fwextract.toml");

        fs::write(&path, "[decode]\nblock_size = 512\nverify = false\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.decode.block_size, 512);
        assert!(!config.decode.verify);

        fs::write(&path, "[decode]\nblock_size = 3\n").unwrap();
        assert_matches!(Config::load(&path), Err(Error::InvalidBlockSize(3)));

        assert_matches!(
            Config::load(&temp_dir.path().join("missing.toml")),
            Err(Error::Read(_, _))
        );
    }
}
