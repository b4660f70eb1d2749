//! In-process configuration for the harness.
//!
//! [Config] carries nothing that affects harness *behaviour*: no feature
//! this crate implements is gated by it. It exists to control how much
//! detail [crate::diag]'s reports surface, and to give embedders something
//! TOML-shaped to fold into whatever configuration format they already have.
//! There is no file I/O here: loading or saving a particular path is the
//! caller's business.

use crate::err::{Error, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// String representations of each [Verbosity], used for parsing and display.
pub mod string {
    /// Name of [super::Verbosity::Silent].
    pub const SILENT: &str = "silent";
    /// Name of [super::Verbosity::Summary].
    pub const SUMMARY: &str = "summary";
    /// Name of [super::Verbosity::Trace].
    pub const TRACE: &str = "trace";
    /// Names of all verbosities.
    pub const ALL: &[&str] = &[SILENT, SUMMARY, TRACE];
}

/// How much detail [crate::diag]'s reports should include.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[non_exhaustive]
pub enum Verbosity {
    /// Reports render as the empty string.
    Silent,
    /// Reports render one line per registry or driver.
    Summary,
    /// Reports render the full table.
    Trace,
}

impl Default for Verbosity {
    fn default() -> Self {
        Self::Summary
    }
}

impl FromStr for Verbosity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            string::SILENT => Ok(Self::Silent),
            string::SUMMARY => Ok(Self::Summary),
            string::TRACE => Ok(Self::Trace),
            s => Err(Error::BadVerbosity(s.to_owned())),
        }
    }
}

impl std::fmt::Display for Verbosity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::Silent => string::SILENT,
                Self::Summary => string::SUMMARY,
                Self::Trace => string::TRACE,
            }
        )
    }
}

impl Verbosity {
    /// All verbosities, in increasing order of detail.
    pub fn all() -> impl Iterator<Item = Self> {
        vec![Self::Silent, Self::Summary, Self::Trace].into_iter()
    }
}

/// The harness's in-process configuration.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Controls the detail level of [crate::diag] reports.
    pub verbosity: Verbosity,
}

impl Config {
    /// Tries to dump this config to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

impl FromStr for Config {
    type Err = Error;

    /// Tries to load a config from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        Ok(toml::from_str(s)?)
    }
}
