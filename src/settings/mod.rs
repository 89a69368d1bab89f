//! Configuration: a settings file overlaid by CLI flags.
//!
//! Recognized keys: `remote_host`, `client_port`, `log_mask`,
//! `hosts_path`, `log_path`.

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use config::{Config, ConfigError, File};
use serde::Deserialize;

pub const LOG_MASK_DEBUG: u8 = 0b0001;
pub const LOG_MASK_INFO: u8 = 0b0010;
pub const LOG_MASK_ERROR: u8 = 0b0100;
pub const LOG_MASK_FATAL: u8 = 0b1000;

/// Raw settings, every key optional.  The same shape is produced by
/// the settings file and by the CLI, so the two merge with `overlay`.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize, Default)]
pub struct Settings {
    /// IPv4 address of the upstream resolver.
    #[serde(default)]
    pub remote_host: Option<Ipv4Addr>,

    /// UDP port the upstream socket binds; 0 for OS-assigned.
    #[serde(default)]
    pub client_port: Option<u16>,

    /// 4-bit mask: 1=debug, 2=info, 4=error, 8=fatal.
    #[serde(default)]
    pub log_mask: Option<u8>,

    /// Path to the hosts table.
    #[serde(default)]
    pub hosts_path: Option<PathBuf>,

    /// Path to the log file; stderr when unset.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

impl Settings {
    /// Load settings from a file.
    ///
    /// # Errors
    ///
    /// If the file cannot be read or parsed.
    pub fn from_file(filename: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::with_name(filename))
            .build()?
            .try_deserialize()
    }

    /// Lay `other` over `self`: any key present in `other` wins.
    pub fn overlay(self, other: Settings) -> Settings {
        Settings {
            remote_host: other.remote_host.or(self.remote_host),
            client_port: other.client_port.or(self.client_port),
            log_mask: other.log_mask.or(self.log_mask),
            hosts_path: other.hosts_path.or(self.hosts_path),
            log_path: other.log_path.or(self.log_path),
        }
    }

    /// Validate and apply defaults, producing the final options the
    /// daemon runs with.
    ///
    /// # Errors
    ///
    /// If a key is missing or out of range.
    pub fn finalise(self) -> Result<Options, Error> {
        let remote_host = self.remote_host.ok_or(Error::MissingRemoteHost)?;

        let client_port = self.client_port.unwrap_or(0);
        if client_port != 0 && client_port < 1024 {
            return Err(Error::InvalidClientPort(client_port));
        }

        let log_mask = self.log_mask.unwrap_or(0b1111);
        if log_mask > 0b1111 {
            return Err(Error::InvalidLogMask(log_mask));
        }

        Ok(Options {
            remote_host,
            client_port,
            log_mask,
            hosts_path: self.hosts_path.unwrap_or_else(|| PathBuf::from("hosts.txt")),
            log_path: self.log_path,
        })
    }
}

/// Validated daemon options.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Options {
    pub remote_host: Ipv4Addr,
    pub client_port: u16,
    pub log_mask: u8,
    pub hosts_path: PathBuf,
    pub log_path: Option<PathBuf>,
}

impl Options {
    /// The default `tracing` directive for the log mask.  The mask
    /// selects independent channels but tracing levels nest, so the
    /// most verbose requested channel decides.
    pub fn log_filter(&self) -> &'static str {
        if self.log_mask & LOG_MASK_DEBUG != 0 {
            "debug"
        } else if self.log_mask & LOG_MASK_INFO != 0 {
            "info"
        } else if self.log_mask & (LOG_MASK_ERROR | LOG_MASK_FATAL) != 0 {
            "error"
        } else {
            "off"
        }
    }
}

/// An error in the provided configuration.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Error {
    MissingRemoteHost,
    InvalidClientPort(u16),
    InvalidLogMask(u8),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::MissingRemoteHost => write!(f, "remote_host is required"),
            Error::InvalidClientPort(port) => {
                write!(f, "client_port must be 0 or 1024-65535, got {port}")
            }
            Error::InvalidLogMask(mask) => {
                write!(f, "log_mask must be 0-15, got {mask}")
            }
        }
    }
}

impl std::error::Error for Error {}
