// Copyright 2015-2023 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// https://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// https://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-zone configuration

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use ipnet::IpNet;
use serde::Deserialize;

use crate::error::{ZoneError, ZoneErrorKind};

const DEFAULT_DBSYNC_TIMEOUT: u64 = 0;
const DEFAULT_NOTIFY_RETRIES: u32 = 3;
const DEFAULT_BOOTSTRAP_RETRY: u64 = 30;
const DEFAULT_MAX_CONN_IDLE: u64 = 20;
const DEFAULT_JOURNAL_MAX_BYTES: usize = 1024 * 1024;

/// How the serial of a new zone version is computed
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SerialPolicy {
    /// The old serial plus one, wrapping
    #[default]
    Increment,
    /// Seconds since the Unix epoch at the time the new version is built
    Unixtime,
}

/// A remote server the zone talks to, e.g. a NOTIFY target
#[derive(Deserialize, Debug, Clone)]
pub struct RemoteConfig {
    /// Address and port of the remote
    pub addr: SocketAddr,
    /// Name of the TSIG key to sign messages to this remote with
    #[serde(default)]
    pub tsig_key: Option<String>,
}

/// Configuration snapshot for a single zone.
///
/// The snapshot is owned by the zone handle and treated as immutable for the
/// lifetime of the handle; reconfiguration builds a new handle.
#[derive(Deserialize, Debug, Clone)]
pub struct ZoneConfig {
    /// Path to the text zonefile backing this zone
    pub zone_file_path: PathBuf,
    /// Path to the changeset journal, if the zone keeps one
    #[serde(default)]
    pub journal_file_path: Option<PathBuf>,
    /// Master server to refresh from; `None` makes this a primary-only zone
    #[serde(default)]
    pub master: Option<SocketAddr>,
    /// Name of the TSIG key used for transfers with the master
    #[serde(default)]
    pub tsig_key: Option<String>,
    /// Whether zonefile reloads should record their difference in the journal
    #[serde(default)]
    pub build_diffs: bool,
    /// Whether the zone is DNSSEC signed and maintained
    #[serde(default)]
    pub dnssec_enable: bool,
    /// Seconds between journal-to-zonefile synchronizations; `0` syncs
    /// immediately after every change
    #[serde(default = "default_dbsync_timeout")]
    pub dbsync_timeout: u64,
    /// How new serials are computed
    #[serde(default)]
    pub serial_policy: SerialPolicy,
    /// Times a NOTIFY is retried before giving up
    #[serde(default = "default_notify_retries")]
    pub notify_retries: u32,
    /// Remotes to NOTIFY after the zone changed
    #[serde(default)]
    pub notify: Vec<RemoteConfig>,
    /// Networks allowed to send dynamic updates; empty allows any peer that
    /// passed TSIG verification
    #[serde(default)]
    pub update_allow: Vec<IpNet>,
    /// Seconds between bootstrap retries while the zone has no contents
    #[serde(default = "default_bootstrap_retry")]
    pub bootstrap_retry: u64,
    /// Upper bound on connection idle time, used as slack when arming the
    /// EXPIRE timer
    #[serde(default = "default_max_conn_idle")]
    pub max_conn_idle: u64,
    /// Maximum size of the changeset journal in bytes
    #[serde(default = "default_journal_max_bytes")]
    pub journal_max_bytes: usize,
}

fn default_dbsync_timeout() -> u64 {
    DEFAULT_DBSYNC_TIMEOUT
}

fn default_notify_retries() -> u32 {
    DEFAULT_NOTIFY_RETRIES
}

fn default_bootstrap_retry() -> u64 {
    DEFAULT_BOOTSTRAP_RETRY
}

fn default_max_conn_idle() -> u64 {
    DEFAULT_MAX_CONN_IDLE
}

fn default_journal_max_bytes() -> usize {
    DEFAULT_JOURNAL_MAX_BYTES
}

impl ZoneConfig {
    /// Minimal configuration for a primary zone backed by the given zonefile
    pub fn primary(zone_file_path: PathBuf) -> Self {
        Self {
            zone_file_path,
            journal_file_path: None,
            master: None,
            tsig_key: None,
            build_diffs: false,
            dnssec_enable: false,
            dbsync_timeout: DEFAULT_DBSYNC_TIMEOUT,
            serial_policy: SerialPolicy::default(),
            notify_retries: DEFAULT_NOTIFY_RETRIES,
            notify: Vec::new(),
            update_allow: Vec::new(),
            bootstrap_retry: DEFAULT_BOOTSTRAP_RETRY,
            max_conn_idle: DEFAULT_MAX_CONN_IDLE,
            journal_max_bytes: DEFAULT_JOURNAL_MAX_BYTES,
        }
    }

    /// Read a zone configuration from a TOML string
    pub fn from_toml(toml: &str) -> Result<Self, ZoneError> {
        toml::from_str(toml)
            .map_err(|_| ZoneError::from(ZoneErrorKind::InvalidArgument("bad zone toml")))
    }

    /// True when the peer address is allowed to submit dynamic updates
    pub fn is_update_allowed(&self, peer: IpAddr) -> bool {
        if self.update_allow.is_empty() {
            return true;
        }

        self.update_allow.iter().any(|net| net.contains(&peer))
    }
}
