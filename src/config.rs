//! Machine configuration.
//!
//! A configuration file is JSON; every field is optional and falls back to
//! the default machine: 512K words of memory, ND-100 status bit set, start
//! and load at address 0.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cpu::memory::MEMORY_WORDS;

/// Largest memory reachable with 14-bit extended page numbers.
pub const MAX_MEMORY_WORDS: usize = 16 * 1024 * 1024;

/// Default step budget of the host runner.
pub const DEFAULT_MAX_STEPS: u64 = 1_000_000;

/// Machine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Installed physical memory in words.
    pub memory_words: usize,
    /// Report an ND-100 in the status register (N100 bit).
    pub nd100: bool,
    /// Initial P.
    pub start_address: u16,
    /// Physical address a program image is loaded at.
    pub load_address: u32,
    /// Steps the host runner allows before giving up.
    pub max_steps: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            memory_words: MEMORY_WORDS,
            nd100: true,
            start_address: 0,
            load_address: 0,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }
}

impl Config {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    /// Check field ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_words == 0 || self.memory_words > MAX_MEMORY_WORDS {
            return Err(ConfigError::MemorySize(self.memory_words));
        }
        if self.load_address as usize >= self.memory_words {
            return Err(ConfigError::LoadAddress {
                address: self.load_address,
                memory_words: self.memory_words,
            });
        }
        Ok(())
    }

    /// Pretty-printed JSON.
    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("memory size {0} words is outside 1..={max}", max = MAX_MEMORY_WORDS)]
    MemorySize(usize),

    #[error("load address {address:#o} is beyond {memory_words} words of memory")]
    LoadAddress { address: u32, memory_words: usize },
}
