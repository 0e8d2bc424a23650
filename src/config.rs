//! Immutable driver configuration.
//!
//! Built once at startup from defaults overlaid with `AQUEDUCT_*` environment
//! variables; per-channel URI params may narrow individual streams further
//! but never widen past these bounds.

use std::path::PathBuf;
use std::time::Duration;

use crate::logbuffer::meta::{check_page_size, check_term_length, PAGE_MIN_SIZE};
use crate::Result;

pub const DEFAULT_DRIVER_DIR: &str = "/dev/shm/aqueduct";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadingMode {
    /// Conductor, sender and receiver share one thread.
    Shared,
    /// Conductor on one thread; sender and receiver share a second.
    SharedNetwork,
    /// One thread each.
    Dedicated,
}

#[derive(Clone, Debug)]
pub struct DriverConfig {
    pub dir: PathBuf,
    pub dir_delete_on_start: bool,
    pub threading_mode: ThreadingMode,

    pub term_buffer_length: usize,
    pub ipc_term_buffer_length: usize,
    pub mtu_length: usize,
    pub initial_window_length: usize,
    pub file_page_size: usize,
    pub publication_window_length: usize,

    pub conductor_buffer_length: usize,
    pub to_clients_buffer_length: usize,
    pub counter_values_buffer_length: usize,
    pub error_buffer_length: usize,
    pub loss_report_buffer_length: usize,

    pub client_liveness_timeout_ns: u64,
    pub image_liveness_timeout_ns: u64,
    pub publication_unblock_timeout_ns: u64,
    pub publication_linger_timeout_ns: u64,
    pub status_message_timeout_ns: u64,
    pub counter_free_to_reuse_timeout_ns: u64,
    pub untethered_window_limit_timeout_ns: u64,
    pub untethered_linger_timeout_ns: u64,
    pub untethered_resting_timeout_ns: u64,
    pub nak_unicast_delay_ns: u64,
    pub nak_unicast_retry_delay_ratio: u64,
    pub nak_multicast_max_backoff_ns: u64,
    pub receiver_liveness_timeout_ns: u64,
    pub conductor_service_interval_ns: u64,

    pub max_messages_per_send: usize,
    pub max_resend: usize,
    pub async_task_executor_threads: usize,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(DEFAULT_DRIVER_DIR),
            dir_delete_on_start: false,
            threading_mode: ThreadingMode::Shared,

            term_buffer_length: 16 * 1024 * 1024,
            ipc_term_buffer_length: 64 * 1024 * 1024,
            mtu_length: 1408,
            initial_window_length: 128 * 1024,
            file_page_size: PAGE_MIN_SIZE,
            publication_window_length: 0, // derived from term length when 0

            conductor_buffer_length: 1024 * 1024,
            to_clients_buffer_length: 1024 * 1024,
            counter_values_buffer_length: 1024 * 1024,
            error_buffer_length: 1024 * 1024,
            loss_report_buffer_length: 1024 * 1024,

            client_liveness_timeout_ns: 10_000_000_000,
            image_liveness_timeout_ns: 10_000_000_000,
            publication_unblock_timeout_ns: 15_000_000_000,
            publication_linger_timeout_ns: 5_000_000_000,
            status_message_timeout_ns: 200_000_000,
            counter_free_to_reuse_timeout_ns: 1_000_000_000,
            untethered_window_limit_timeout_ns: 10_000_000_000,
            untethered_linger_timeout_ns: 10_000_000_000,
            untethered_resting_timeout_ns: 10_000_000_000,
            nak_unicast_delay_ns: 100_000,
            nak_unicast_retry_delay_ratio: 100,
            nak_multicast_max_backoff_ns: 60_000_000,
            receiver_liveness_timeout_ns: 2_000_000_000,
            conductor_service_interval_ns: 1_000_000_000,

            max_messages_per_send: 2,
            max_resend: 16,
            async_task_executor_threads: 1,
        }
    }
}

impl DriverConfig {
    /// Defaults overridden from the environment.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("AQUEDUCT_DIR") {
            config.dir = PathBuf::from(dir);
        }
        if let Ok(mode) = std::env::var("AQUEDUCT_THREADING_MODE") {
            config.threading_mode = match mode.as_str() {
                "shared" => ThreadingMode::Shared,
                "shared-network" => ThreadingMode::SharedNetwork,
                "dedicated" => ThreadingMode::Dedicated,
                other => {
                    return Err(crate::Error::Generic(format!("unknown threading mode: {other}")))
                }
            };
        }

        macro_rules! env_usize {
            ($field:ident, $name:literal) => {
                if let Ok(value) = std::env::var($name) {
                    config.$field = value
                        .parse::<usize>()
                        .map_err(|_| crate::Error::Generic(format!("bad {}: {value}", $name)))?;
                }
            };
        }
        macro_rules! env_duration {
            ($field:ident, $name:literal) => {
                if let Ok(value) = std::env::var($name) {
                    config.$field = parse_duration_ns(&value)
                        .map_err(|_| crate::Error::Generic(format!("bad {}: {value}", $name)))?;
                }
            };
        }

        env_usize!(term_buffer_length, "AQUEDUCT_TERM_BUFFER_LENGTH");
        env_usize!(ipc_term_buffer_length, "AQUEDUCT_IPC_TERM_BUFFER_LENGTH");
        env_usize!(mtu_length, "AQUEDUCT_MTU_LENGTH");
        env_usize!(initial_window_length, "AQUEDUCT_INITIAL_WINDOW_LENGTH");
        env_usize!(file_page_size, "AQUEDUCT_FILE_PAGE_SIZE");
        env_usize!(conductor_buffer_length, "AQUEDUCT_CONDUCTOR_BUFFER_LENGTH");
        env_usize!(to_clients_buffer_length, "AQUEDUCT_TO_CLIENTS_BUFFER_LENGTH");
        env_usize!(counter_values_buffer_length, "AQUEDUCT_COUNTER_VALUES_BUFFER_LENGTH");
        env_usize!(error_buffer_length, "AQUEDUCT_ERROR_BUFFER_LENGTH");
        env_usize!(loss_report_buffer_length, "AQUEDUCT_LOSS_REPORT_BUFFER_LENGTH");
        env_usize!(max_messages_per_send, "AQUEDUCT_MAX_MESSAGES_PER_SEND");
        env_usize!(max_resend, "AQUEDUCT_MAX_RESEND");
        env_usize!(async_task_executor_threads, "AQUEDUCT_ASYNC_TASK_EXECUTOR_THREADS");

        env_duration!(client_liveness_timeout_ns, "AQUEDUCT_CLIENT_LIVENESS_TIMEOUT");
        env_duration!(image_liveness_timeout_ns, "AQUEDUCT_IMAGE_LIVENESS_TIMEOUT");
        env_duration!(publication_unblock_timeout_ns, "AQUEDUCT_PUBLICATION_UNBLOCK_TIMEOUT");
        env_duration!(publication_linger_timeout_ns, "AQUEDUCT_PUBLICATION_LINGER_TIMEOUT");
        env_duration!(status_message_timeout_ns, "AQUEDUCT_STATUS_MESSAGE_TIMEOUT");
        env_duration!(untethered_window_limit_timeout_ns, "AQUEDUCT_UNTETHERED_WINDOW_LIMIT_TIMEOUT");
        env_duration!(untethered_linger_timeout_ns, "AQUEDUCT_UNTETHERED_LINGER_TIMEOUT");
        env_duration!(untethered_resting_timeout_ns, "AQUEDUCT_UNTETHERED_RESTING_TIMEOUT");
        env_duration!(nak_unicast_delay_ns, "AQUEDUCT_NAK_UNICAST_DELAY");
        env_duration!(nak_multicast_max_backoff_ns, "AQUEDUCT_NAK_MULTICAST_MAX_BACKOFF");

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        check_term_length(self.term_buffer_length)?;
        check_term_length(self.ipc_term_buffer_length)?;
        check_page_size(self.file_page_size)?;
        if self.mtu_length < 96 || self.mtu_length > 65504 || self.mtu_length % 32 != 0 {
            return Err(crate::Error::Generic(format!(
                "mtu length {} must be a multiple of 32 in [96, 65504]",
                self.mtu_length
            )));
        }
        if self.max_messages_per_send == 0 {
            return Err(crate::Error::Generic("max messages per send must be positive".into()));
        }
        Ok(())
    }

    /// Publication window when the URI does not narrow it: half a term.
    pub fn publication_window_for(&self, term_length: usize) -> usize {
        if self.publication_window_length != 0 {
            std::cmp::min(self.publication_window_length, term_length / 2)
        } else {
            term_length / 2
        }
    }
}

/// Parses `<N>` or `<N>{ns|us|ms|s}` into nanoseconds.
pub fn parse_duration_ns(value: &str) -> Result<u64> {
    let value = value.trim();
    let (digits, scale) = if let Some(stripped) = value.strip_suffix("ns") {
        (stripped, 1u64)
    } else if let Some(stripped) = value.strip_suffix("us") {
        (stripped, 1_000)
    } else if let Some(stripped) = value.strip_suffix("ms") {
        (stripped, 1_000_000)
    } else if let Some(stripped) = value.strip_suffix('s') {
        (stripped, 1_000_000_000)
    } else {
        (value, 1)
    };
    let number: u64 = digits
        .parse()
        .map_err(|_| crate::Error::Generic(format!("bad duration: {value}")))?;
    number
        .checked_mul(scale)
        .ok_or_else(|| crate::Error::Generic(format!("duration overflows: {value}")))
}

pub fn duration_from_ns(ns: u64) -> Duration {
    Duration::from_nanos(ns)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        DriverConfig::default().validate().unwrap();
    }

    #[test]
    fn duration_suffixes() {
        assert_eq!(parse_duration_ns("100").unwrap(), 100);
        assert_eq!(parse_duration_ns("100ns").unwrap(), 100);
        assert_eq!(parse_duration_ns("100us").unwrap(), 100_000);
        assert_eq!(parse_duration_ns("15ms").unwrap(), 15_000_000);
        assert_eq!(parse_duration_ns("2s").unwrap(), 2_000_000_000);
        assert!(parse_duration_ns("fast").is_err());
    }

    #[test]
    fn bad_mtu_is_rejected() {
        let mut config = DriverConfig::default();
        config.mtu_length = 1000; // not 32-aligned
        assert!(config.validate().is_err());
        config.mtu_length = 70_000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn publication_window_defaults_to_half_term() {
        let config = DriverConfig::default();
        assert_eq!(config.publication_window_for(64 * 1024), 32 * 1024);
    }
}
