//! Configuration options.
//!
//! Connection grouping is configured per protocol at stack bring-up from a TOML file. The path to
//! the configuration file itself will typically be a command line argument passed to the
//! application. See [configs](../../configs) for examples.

use crate::lcore;
use crate::pcbgroup::HashFields;

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

/// Loads a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RuntimeConfig> {
    let path = path.as_ref();
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    parse_config(&config_str).with_context(|| format!("Invalid config file {}", path.display()))
}

/// Parses and validates a configuration from a TOML string.
pub fn parse_config(config_str: &str) -> Result<RuntimeConfig> {
    let config: RuntimeConfig = toml::from_str(config_str)?;
    config.validate()?;
    Ok(config)
}

/// Loads a default configuration.
///
/// Equivalent to:
/// ```toml
/// [pcbgroup]
///     hash_fields = "four_tuple"
///     table_size_hint = 512
///     fallback_disabled = true
/// ```
pub fn default_config() -> RuntimeConfig {
    RuntimeConfig::default()
}

/* --------------------------------------------------------------------------------- */

/// Runtime configuration options.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Connection group settings.
    #[serde(default = "default_pcbgroup")]
    pub pcbgroup: PcbGroupConfig,
}

impl RuntimeConfig {
    fn validate(&self) -> Result<()> {
        self.pcbgroup.validate()
    }
}

fn default_pcbgroup() -> PcbGroupConfig {
    PcbGroupConfig::default()
}

/* --------------------------------------------------------------------------------- */

/// Connection group options.
///
/// ## Example
/// ```toml
/// [pcbgroup]
///     hash_fields = "four_tuple"
///     table_size_hint = 8192
///     nb_groups = 16
///     fallback_disabled = false
/// ```
///
/// ## Remarks
/// The group count is fixed for the lifetime of the protocol. Groups are not resized when
/// processors come online or go offline.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct PcbGroupConfig {
    /// Header fields used to pick a connection's group. `"none"` disables grouping. Defaults to
    /// `"four_tuple"`.
    #[serde(default = "default_hash_fields")]
    pub hash_fields: HashFields,

    /// Expected number of connections, used to size every group's hash table and the wildcard
    /// table. Rounded up to a power of two. Defaults to `512`.
    #[serde(default = "default_table_size_hint")]
    pub table_size_hint: usize,

    /// Number of groups. Defaults to `None`, meaning the number of processors the process may run
    /// on. A value of `1` disables grouping.
    #[serde(default = "default_nb_groups")]
    pub nb_groups: Option<usize>,

    /// If set, a table allocation failure at bring-up leaves grouping disabled instead of failing.
    /// Defaults to `true`.
    #[serde(default = "default_fallback_disabled")]
    pub fallback_disabled: bool,
}

impl PcbGroupConfig {
    /// Returns the number of groups to create.
    pub fn nb_groups(&self) -> usize {
        self.nb_groups.unwrap_or_else(lcore::online_cores)
    }

    fn validate(&self) -> Result<()> {
        if self.table_size_hint == 0 {
            bail!("pcbgroup.table_size_hint must be positive");
        }
        if self.nb_groups == Some(0) {
            bail!("pcbgroup.nb_groups must be positive");
        }
        Ok(())
    }
}

impl Default for PcbGroupConfig {
    fn default() -> Self {
        PcbGroupConfig {
            hash_fields: default_hash_fields(),
            table_size_hint: default_table_size_hint(),
            nb_groups: default_nb_groups(),
            fallback_disabled: default_fallback_disabled(),
        }
    }
}

fn default_hash_fields() -> HashFields {
    HashFields::FourTuple
}

fn default_table_size_hint() -> usize {
    512
}

fn default_nb_groups() -> Option<usize> {
    None
}

fn default_fallback_disabled() -> bool {
    true
}
