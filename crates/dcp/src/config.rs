// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Daemon configuration.
//!
//! Each daemon loads one JSON file with a section per concern; every field
//! has a default so a minimal file (or none at all) yields a runnable
//! configuration. Validation happens once at startup and is fatal: a
//! daemon never limps along with an inconsistent parameter set.

use crate::bp::wire::{BeaconHeader, PayloadHeader};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Configuration error; fatal at daemon startup.
#[derive(Debug)]
pub struct ConfigError(pub String);

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "configuration error: {}", self.0)
    }
}

impl std::error::Error for ConfigError {}

fn fail(msg: impl Into<String>) -> Result<(), ConfigError> {
    Err(ConfigError(msg.into()))
}

// ---------------------------------------------------------------------
// Logging (shared section)
// ---------------------------------------------------------------------

/// Logging block shared across all daemons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log to stderr instead of rotating files.
    #[serde(default = "default_true", rename = "loggingToConsole")]
    pub logging_to_console: bool,

    /// Prefix for log file names when file logging is active.
    #[serde(default = "default_log_prefix", rename = "filenamePrefix")]
    pub filename_prefix: String,

    /// Flush after every record.
    #[serde(default, rename = "autoFlush")]
    pub auto_flush: bool,

    /// One of trace, debug, info, warning, error, fatal.
    #[serde(default = "default_severity", rename = "severityLevel")]
    pub severity_level: String,

    /// Rotate log files after this many bytes (>= 1 MB).
    #[serde(default = "default_rotation_size", rename = "rotationSize")]
    pub rotation_size: u64,
}

fn default_true() -> bool {
    true
}
fn default_log_prefix() -> String {
    "/tmp/dcp-log".to_string()
}
fn default_severity() -> String {
    "info".to_string()
}
fn default_rotation_size() -> u64 {
    10 * 1024 * 1024
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            logging_to_console: true,
            filename_prefix: default_log_prefix(),
            auto_flush: false,
            severity_level: default_severity(),
            rotation_size: default_rotation_size(),
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.severity_level.as_str() {
            "trace" | "debug" | "info" | "warning" | "error" | "fatal" => {}
            other => return fail(format!("unknown severityLevel '{other}'")),
        }
        if self.rotation_size < 1024 * 1024 {
            return fail("rotationSize must be at least 1 MB");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// BP
// ---------------------------------------------------------------------

/// Default BP command socket path.
pub const DEFAULT_BP_SOCKET: &str = "/tmp/dcp-bp-command-socket";
/// Default Vardis command socket path.
pub const DEFAULT_VARDIS_SOCKET: &str = "/tmp/dcp-vardis-command-socket";

/// BP daemon parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BpConfig {
    /// Wireless interface to own.
    #[serde(default = "default_interface")]
    pub interface_name: String,

    /// Interface MTU; bounds maxBeaconSize.
    #[serde(default = "default_mtu", rename = "interface_mtuSize")]
    pub interface_mtu_size: u16,

    /// Ethernet-II ether type of beacon frames.
    #[serde(default = "default_ether_type", rename = "interface_etherType")]
    pub interface_ether_type: u16,

    /// Upper bound for an assembled beacon, headers included.
    #[serde(default = "default_max_beacon_size", rename = "maxBeaconSize")]
    pub max_beacon_size: u16,

    /// Average beacon period in milliseconds.
    #[serde(default = "default_beacon_period", rename = "avgBeaconPeriodMS")]
    pub avg_beacon_period_ms: u32,

    /// Jitter factor j; each period is uniform in [(1-j)T, (1+j)T].
    #[serde(default = "default_jitter", rename = "jitterFactor")]
    pub jitter_factor: f64,

    /// EWMA weight for the inter-beacon reception time statistic.
    #[serde(default = "default_alpha", rename = "interBeaconTimeEWMAAlpha")]
    pub inter_beacon_time_ewma_alpha: f64,

    /// EWMA weight for the beacon size statistic.
    #[serde(default = "default_alpha", rename = "beaconSizeEWMAAlpha")]
    pub beacon_size_ewma_alpha: f64,

    /// Command socket path.
    #[serde(default = "default_bp_socket", rename = "commandSocketPath")]
    pub command_socket_path: String,

    /// Command socket per-exchange timeout in milliseconds.
    #[serde(default = "default_socket_timeout", rename = "commandSocketTimeoutMS")]
    pub command_socket_timeout_ms: u32,
}

fn default_interface() -> String {
    "wlan0".to_string()
}
fn default_mtu() -> u16 {
    1500
}
fn default_ether_type() -> u16 {
    0x4953
}
fn default_max_beacon_size() -> u16 {
    1400
}
fn default_beacon_period() -> u32 {
    100
}
fn default_jitter() -> f64 {
    0.1
}
fn default_alpha() -> f64 {
    0.9
}
fn default_bp_socket() -> String {
    DEFAULT_BP_SOCKET.to_string()
}
fn default_socket_timeout() -> u32 {
    500
}

impl Default for BpConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("default BpConfig")
    }
}

impl BpConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interface_name.is_empty() {
            return fail("interface_name must not be empty");
        }
        if self.interface_mtu_size < 256 {
            return fail("interface_mtuSize must be at least 256");
        }
        if self.interface_ether_type < 0x0800 {
            return fail("interface_etherType must be at least 0x0800");
        }
        let min_beacon = (BeaconHeader::FIXED_WIRE_SIZE + PayloadHeader::FIXED_WIRE_SIZE) as u16;
        if self.max_beacon_size <= min_beacon {
            return fail(format!(
                "maxBeaconSize must exceed the header overhead of {min_beacon} bytes"
            ));
        }
        if self.max_beacon_size > self.interface_mtu_size {
            return fail("maxBeaconSize must not exceed interface_mtuSize");
        }
        if self.avg_beacon_period_ms == 0 {
            return fail("avgBeaconPeriodMS must be positive");
        }
        if !(self.jitter_factor > 0.0 && self.jitter_factor < 1.0) {
            return fail("jitterFactor must lie strictly between 0 and 1");
        }
        for (name, alpha) in [
            ("interBeaconTimeEWMAAlpha", self.inter_beacon_time_ewma_alpha),
            ("beaconSizeEWMAAlpha", self.beacon_size_ewma_alpha),
        ] {
            if !(0.0..=1.0).contains(&alpha) {
                return fail(format!("{name} must lie in [0, 1]"));
            }
        }
        if self.command_socket_path.is_empty() {
            return fail("commandSocketPath must not be empty");
        }
        Ok(())
    }

    /// Largest client payload a beacon of this configuration can carry.
    #[must_use]
    pub fn max_client_payload_size(&self) -> u16 {
        self.max_beacon_size
            - (BeaconHeader::FIXED_WIRE_SIZE + PayloadHeader::FIXED_WIRE_SIZE) as u16
    }
}

// ---------------------------------------------------------------------
// Vardis
// ---------------------------------------------------------------------

/// Vardis daemon parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VardisConfig {
    /// Maximum length of a variable value in bytes.
    #[serde(default = "default_max_value_len", rename = "maxValueLength")]
    pub max_value_length: u8,

    /// Maximum length of a variable description in bytes.
    #[serde(default = "default_max_descr_len", rename = "maxDescriptionLength")]
    pub max_description_length: u8,

    /// Upper bound of per-variable repetition counts (1..15).
    #[serde(default = "default_max_repetitions", rename = "maxRepetitions")]
    pub max_repetitions: u8,

    /// Maximum Vardis payload handed to BP per tick.
    #[serde(default = "default_max_payload", rename = "maxPayloadSize")]
    pub max_payload_size: u16,

    /// Summary records allowed per SUMMARIES container.
    #[serde(default = "default_max_summaries", rename = "maxSummaries")]
    pub max_summaries: u16,

    /// Scrubber wake-up period in milliseconds (1..65000).
    #[serde(default = "default_scrub_period", rename = "scrubbingPeriodMS")]
    pub scrubbing_period_ms: u16,

    /// Timeout after which a silent variable is delete-marked; 0 disables
    /// scrubbing-driven expiry.
    #[serde(default, rename = "variableTimeoutMS")]
    pub variable_timeout_ms: u32,

    /// Payload generation tick in milliseconds.
    #[serde(default = "default_gen_interval", rename = "payloadGenerationIntervalMS")]
    pub payload_generation_interval_ms: u16,

    /// RTDB service queue polling interval in milliseconds.
    #[serde(default = "default_poll_interval", rename = "pollRTDBServiceIntervalMS")]
    pub poll_rtdb_service_interval_ms: u16,

    /// BP payload queue depth (queueing mode QUEUE_DROPTAIL).
    #[serde(default = "default_queue_max", rename = "queueMaxEntries")]
    pub queue_max_entries: u16,

    /// Release the store lock between instruction containers.
    #[serde(default, rename = "lockingIndividualContainers")]
    pub locking_individual_containers: bool,

    /// Vardis command socket path.
    #[serde(default = "default_vardis_socket", rename = "commandSocketPath")]
    pub command_socket_path: String,

    /// Command socket per-exchange timeout in milliseconds.
    #[serde(default = "default_socket_timeout", rename = "commandSocketTimeoutMS")]
    pub command_socket_timeout_ms: u32,

    /// BP daemon command socket to register against.
    #[serde(default = "default_bp_socket", rename = "bpCommandSocketPath")]
    pub bp_command_socket_path: String,

    /// Shared memory name for the Vardis<->BP control segment.
    #[serde(default = "default_vardis_bp_shm", rename = "bpShmName")]
    pub bp_shm_name: String,

    /// Shared memory name of the variable store.
    #[serde(default = "default_store_shm", rename = "storeShmName")]
    pub store_shm_name: String,
}

fn default_max_value_len() -> u8 {
    32
}
fn default_max_descr_len() -> u8 {
    64
}
fn default_max_repetitions() -> u8 {
    1
}
fn default_max_payload() -> u16 {
    512
}
fn default_max_summaries() -> u16 {
    20
}
fn default_scrub_period() -> u16 {
    1000
}
fn default_gen_interval() -> u16 {
    50
}
fn default_poll_interval() -> u16 {
    20
}
fn default_queue_max() -> u16 {
    10
}
fn default_vardis_socket() -> String {
    DEFAULT_VARDIS_SOCKET.to_string()
}
fn default_vardis_bp_shm() -> String {
    "/dcp-bp-vardis".to_string()
}
fn default_store_shm() -> String {
    "/dcp-vardis-store".to_string()
}

impl Default for VardisConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("default VardisConfig")
    }
}

impl VardisConfig {
    /// `max_beacon_payload` is the BP side's largest admissible client
    /// payload; the Vardis payload must fit into it.
    pub fn validate(&self, max_beacon_payload: u16) -> Result<(), ConfigError> {
        if self.max_repetitions < 1 || self.max_repetitions > 15 {
            return fail("maxRepetitions must lie in 1..=15");
        }
        if self.max_payload_size == 0 || self.max_payload_size > max_beacon_payload {
            return fail(format!(
                "maxPayloadSize must lie in 1..={max_beacon_payload}"
            ));
        }
        if self.max_summaries == 0 {
            return fail("maxSummaries must be positive");
        }
        if self.scrubbing_period_ms == 0 || self.scrubbing_period_ms > 65000 {
            return fail("scrubbingPeriodMS must lie in 1..=65000");
        }
        if self.payload_generation_interval_ms == 0 {
            return fail("payloadGenerationIntervalMS must be positive");
        }
        if self.poll_rtdb_service_interval_ms == 0 {
            return fail("pollRTDBServiceIntervalMS must be positive");
        }
        if self.queue_max_entries == 0 || self.queue_max_entries as usize >= 64 {
            return fail("queueMaxEntries must lie in 1..=63");
        }
        for (key, name) in [
            (&self.bp_shm_name, "bpShmName"),
            (&self.store_shm_name, "storeShmName"),
        ] {
            if !key.starts_with('/') || key.len() < 2 {
                return fail(format!("{name} must be '/<name>'"));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// SRP
// ---------------------------------------------------------------------

/// SRP daemon parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrpConfig {
    /// Safety-data broadcast period in milliseconds.
    #[serde(default = "default_srp_generation", rename = "generationPeriodMS")]
    pub generation_period_ms: u16,

    /// Indication polling period in milliseconds.
    #[serde(default = "default_srp_reception", rename = "receptionPeriodMS")]
    pub reception_period_ms: u16,

    /// Neighbour table scrubbing period in milliseconds.
    #[serde(default = "default_scrub_period", rename = "scrubbingPeriodMS")]
    pub scrubbing_period_ms: u16,

    /// Stop transmitting after this long without fresh own safety data.
    #[serde(default = "default_keepalive", rename = "keepaliveTimeoutMS")]
    pub keepalive_timeout_ms: u16,

    /// Remove neighbour entries older than this.
    #[serde(default = "default_srp_scrub_timeout", rename = "scrubbingTimeoutMS")]
    pub scrubbing_timeout_ms: u16,

    /// BP daemon command socket to register against.
    #[serde(default = "default_bp_socket", rename = "bpCommandSocketPath")]
    pub bp_command_socket_path: String,

    /// Shared memory name for the SRP<->BP control segment.
    #[serde(default = "default_srp_bp_shm", rename = "bpShmName")]
    pub bp_shm_name: String,

    /// Shared memory name of the neighbour store.
    #[serde(default = "default_srp_store_shm", rename = "storeShmName")]
    pub store_shm_name: String,
}

fn default_srp_generation() -> u16 {
    100
}
fn default_srp_reception() -> u16 {
    50
}
fn default_keepalive() -> u16 {
    1000
}
fn default_srp_scrub_timeout() -> u16 {
    3000
}
fn default_srp_bp_shm() -> String {
    "/dcp-bp-srp".to_string()
}
fn default_srp_store_shm() -> String {
    "/dcp-srp-store".to_string()
}

impl Default for SrpConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("default SrpConfig")
    }
}

impl SrpConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("generationPeriodMS", self.generation_period_ms),
            ("receptionPeriodMS", self.reception_period_ms),
            ("scrubbingPeriodMS", self.scrubbing_period_ms),
            ("keepaliveTimeoutMS", self.keepalive_timeout_ms),
            ("scrubbingTimeoutMS", self.scrubbing_timeout_ms),
        ] {
            if value == 0 {
                return fail(format!("{name} must be positive"));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------
// Per-daemon files
// ---------------------------------------------------------------------

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError(format!("cannot read {}: {e}", path.display())))?;
    serde_json::from_str(&text)
        .map_err(|e| ConfigError(format!("cannot parse {}: {e}", path.display())))
}

/// BP daemon configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BpDaemonConfig {
    #[serde(default)]
    pub bp: BpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BpDaemonConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = load_json(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bp.validate()?;
        self.logging.validate()
    }
}

/// Vardis daemon configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VardisDaemonConfig {
    #[serde(default)]
    pub vardis: VardisConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl VardisDaemonConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = load_json(path)?;
        config.logging.validate()?;
        // The real payload bound is only known to the BP daemon, which
        // rejects an oversized maxPayloadSize at registration time.
        config.vardis.validate(u16::MAX)?;
        Ok(config)
    }
}

/// SRP daemon configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SrpDaemonConfig {
    #[serde(default)]
    pub srp: SrpConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl SrpDaemonConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let config: Self = load_json(path)?;
        config.srp.validate()?;
        config.logging.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        BpConfig::default().validate().expect("BP defaults");
        VardisConfig::default().validate(1400).expect("Vardis defaults");
        SrpConfig::default().validate().expect("SRP defaults");
        LoggingConfig::default().validate().expect("logging defaults");
    }

    #[test]
    fn test_bp_rejects_bad_jitter() {
        let mut config = BpConfig::default();
        config.jitter_factor = 0.0;
        assert!(config.validate().is_err());
        config.jitter_factor = 1.0;
        assert!(config.validate().is_err());
        config.jitter_factor = 0.25;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bp_rejects_beacon_larger_than_mtu() {
        let mut config = BpConfig::default();
        config.interface_mtu_size = 600;
        config.max_beacon_size = 601;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bp_rejects_low_ether_type() {
        let mut config = BpConfig::default();
        config.interface_ether_type = 0x07ff;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_vardis_rejects_out_of_range() {
        let mut config = VardisConfig::default();
        config.max_repetitions = 0;
        assert!(config.validate(1400).is_err());
        config.max_repetitions = 16;
        assert!(config.validate(1400).is_err());

        let mut config = VardisConfig::default();
        config.max_payload_size = 1401;
        assert!(config.validate(1400).is_err());

        let mut config = VardisConfig::default();
        config.scrubbing_period_ms = 0;
        assert!(config.validate(1400).is_err());
    }

    #[test]
    fn test_logging_rejects_unknown_severity() {
        let mut config = LoggingConfig::default();
        config.severity_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_keys_spelled_as_documented() {
        let json = r#"{
            "bp": {
                "interface_name": "wlp3s0",
                "interface_mtuSize": 1400,
                "maxBeaconSize": 1200,
                "avgBeaconPeriodMS": 80,
                "jitterFactor": 0.2
            },
            "logging": { "severityLevel": "debug" }
        }"#;
        let config: BpDaemonConfig = serde_json::from_str(json).expect("parse failed");
        assert_eq!(config.bp.interface_name, "wlp3s0");
        assert_eq!(config.bp.interface_mtu_size, 1400);
        assert_eq!(config.bp.max_beacon_size, 1200);
        assert_eq!(config.bp.avg_beacon_period_ms, 80);
        assert_eq!(config.logging.severity_level, "debug");
        config.validate().expect("validate failed");
    }
}
