// Daemon configuration
//
// One record per subsystem, all fields recognized by the JSON config
// file. Missing fields fall back to the defaults below.

use crate::error::Result;
use crate::naming::EndpointId;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Local administrative endpoint.
    pub local_eid: EndpointId,

    /// Root directory for durable state (tables and payload files).
    pub data_dir: PathBuf,

    /// Allow immediate deletion once a bundle is delivered/transmitted.
    pub early_deletion: bool,

    /// Drop arrivals whose GBOF is already known.
    pub suppress_duplicates: bool,

    /// Default custody policy for custody-requesting bundles.
    pub accept_custody: bool,

    /// Permit reactive fragmentation on partial transmission.
    pub reactive_frag_enabled: bool,

    /// Resend over reliable links when a session is cancelled unacked.
    pub retry_reliable_unacked: bool,

    /// Save links to the durable store.
    pub persistent_links: bool,

    /// Reincarnate non-opportunistic links at startup.
    pub recreate_links_on_restart: bool,

    /// Emit an IPN announce bundle at startup.
    pub announce_ipn: bool,

    /// Purge queued bundles when an opportunistic link drops.
    pub clear_bundles_when_opp_link_unavailable: bool,

    /// Service number answered by the IPN echo handler.
    pub ipn_echo_service_number: u64,

    /// Longest echo payload returned, in bytes.
    pub ipn_echo_max_return_length: u64,

    /// Custody retransmit interval, seconds.
    pub custody_timer_intvl: u32,

    /// Custody retransmit attempts before giving up on a link.
    pub custody_timer_retries: u32,

    /// Aggregate custody signalling on/off.
    pub acs_enabled: bool,

    /// Default seconds to accumulate custody IDs before flushing an ACS.
    pub acs_delay: u32,

    /// Default max ACS payload size in bytes (0 = unlimited).
    pub acs_size: u32,

    pub ltp: LtpConfig,
    pub restage: RestageConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            local_eid: EndpointId::ipn(1, 0),
            data_dir: PathBuf::from("./dtn-data"),
            early_deletion: true,
            suppress_duplicates: true,
            accept_custody: true,
            reactive_frag_enabled: false,
            retry_reliable_unacked: true,
            persistent_links: true,
            recreate_links_on_restart: true,
            announce_ipn: false,
            clear_bundles_when_opp_link_unavailable: true,
            ipn_echo_service_number: 2047,
            ipn_echo_max_return_length: 1024,
            custody_timer_intvl: 30,
            custody_timer_retries: 10,
            acs_enabled: true,
            acs_delay: 10,
            acs_size: 500,
            ltp: LtpConfig::default(),
            restage: RestageConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn payload_dir(&self) -> PathBuf {
        self.data_dir.join("payloads")
    }

    pub fn store_dir(&self) -> PathBuf {
        self.data_dir.join("store")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LtpConfig {
    /// Local LTP engine number.
    pub engine_id: u64,

    /// Max concurrent outbound sessions per remote engine.
    pub max_sessions: u32,

    /// Close the loading session once this many payload bytes queue up.
    pub agg_size: u64,

    /// Close the loading session after this many milliseconds.
    pub agg_time_millis: u64,

    /// Max data-segment payload bytes.
    pub seg_size: u64,

    /// Refuse sessions mixing red and green data.
    pub ccsds_compatible: bool,

    /// Checkpoint/report/cancel retransmit interval, seconds.
    pub retran_intvl: u32,

    /// Retransmit attempts before cancelling the session.
    pub retran_retries: u32,

    /// Seconds without any packet before the receiver cancels.
    pub inactivity_intvl: u32,

    /// Extra checkpoint cadence within a block (0 = final segment only).
    pub bytes_per_checkpoint: u64,

    /// Raw inbound DS backlog allowed before red segments are dropped.
    pub queued_bytes_quota: u64,

    /// Spool outbound sessions >= 10 MB to disk.
    pub use_files_xmit: bool,

    /// Spool inbound red parts to disk.
    pub use_files_recv: bool,

    /// Directory for disk-backed session files.
    pub dir_path: PathBuf,

    /// Token bucket rate in bits per second (0 = unthrottled).
    pub rate: u64,

    pub bucket_type: BucketType,

    /// Bucket depth in bits.
    pub bucket_depth: u64,
}

impl Default for LtpConfig {
    fn default() -> Self {
        Self {
            engine_id: 0,
            max_sessions: 100,
            agg_size: 100_000,
            agg_time_millis: 500,
            seg_size: 1400,
            ccsds_compatible: true,
            retran_intvl: 7,
            retran_retries: 7,
            inactivity_intvl: 30,
            bytes_per_checkpoint: 0,
            queued_bytes_quota: 1_073_741_824,
            use_files_xmit: false,
            use_files_recv: false,
            dir_path: PathBuf::from("./ltp-sessions"),
            rate: 0,
            bucket_type: BucketType::Standard,
            bucket_depth: 65_535 * 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketType {
    Standard,
    Leaky,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestageConfig {
    /// Storage lives on a dedicated mount point that can disappear.
    pub mount_point: bool,

    /// Days a restaged file is kept before garbage collection.
    pub days_retention: u32,

    /// Also delete files whose encoded bundle expiration has passed.
    pub expire_bundles: bool,

    /// Minimum remaining TTL in seconds granted to reloaded bundles.
    pub ttl_override: u64,

    /// Seconds between automatic reload attempts (0 = manual only).
    pub auto_reload_interval: u64,

    /// Bytes of disk this instance may consume (0 = whole volume).
    pub disk_quota: u64,

    /// Participates in the BARD pooled quota.
    pub part_of_pool: bool,

    pub email_enabled: bool,
    pub from_email: String,
    pub notify_emails: Vec<String>,

    /// Separator between filename fields. Fixed at link creation.
    pub field_separator: char,

    /// Separator within embedded EID fields. Must differ from
    /// `field_separator`.
    pub eid_field_separator: char,
}

impl Default for RestageConfig {
    fn default() -> Self {
        Self {
            mount_point: true,
            days_retention: 7,
            expire_bundles: true,
            ttl_override: 0,
            auto_reload_interval: 3600,
            disk_quota: 0,
            part_of_pool: true,
            email_enabled: false,
            from_email: String::new(),
            notify_emails: Vec::new(),
            field_separator: '_',
            eid_field_separator: '-',
        }
    }
}

impl RestageConfig {
    pub fn validate(&self) -> Result<()> {
        if self.field_separator == self.eid_field_separator {
            return Err(crate::error::DtnError::Configuration(
                "field_separator and eid_field_separator must differ".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let config = DaemonConfig::default();
        assert!(config.restage.validate().is_ok());
        assert!(config.ltp.retran_retries > 0);
    }

    #[test]
    fn test_partial_json() {
        let config: DaemonConfig =
            serde_json::from_str(r#"{"accept_custody": false, "ltp": {"seg_size": 900}}"#)
                .unwrap();
        assert!(!config.accept_custody);
        assert_eq!(config.ltp.seg_size, 900);
        // untouched fields keep defaults
        assert!(config.suppress_duplicates);
        assert_eq!(config.ltp.retran_intvl, 7);
    }

    #[test]
    fn test_separator_validation() {
        let mut config = RestageConfig::default();
        config.eid_field_separator = '_';
        assert!(config.validate().is_err());
    }
}
