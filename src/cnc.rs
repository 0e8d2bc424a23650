//! The driver directory's control-and-counters file.
//!
//! One mapped file fronts the whole client interface: a metadata header
//! followed by the to-driver command ring, the to-clients broadcast region,
//! the counter metadata and values regions, and the distinct error log.
//! Clients attach to the same directory and resolve the regions from the
//! header; every region length is aligned to the file page size.

use std::path::{Path, PathBuf};

use crate::buffer::{align_up, AtomicBuffer};
use crate::config::DriverConfig;
use crate::mmap::MmapFile;
use crate::{Error, Result};

pub const CNC_FILE: &str = "cnc.dat";
pub const CNC_VERSION: i32 = 1;

const VERSION_OFFSET: usize = 0;
const FILE_PAGE_SIZE_OFFSET: usize = 4;
const DRIVER_PID_OFFSET: usize = 8;
const START_TIMESTAMP_MS_OFFSET: usize = 16;
const HEARTBEAT_TIMESTAMP_MS_OFFSET: usize = 24;
const TO_DRIVER_LENGTH_OFFSET: usize = 32;
const TO_CLIENTS_LENGTH_OFFSET: usize = 36;
const COUNTERS_METADATA_LENGTH_OFFSET: usize = 40;
const COUNTERS_VALUES_LENGTH_OFFSET: usize = 44;
const ERROR_LOG_LENGTH_OFFSET: usize = 48;

pub struct CncFile {
    _mmap: MmapFile,
    header: AtomicBuffer,
    pub to_driver: AtomicBuffer,
    pub to_clients: AtomicBuffer,
    pub counters_metadata: AtomicBuffer,
    pub counters_values: AtomicBuffer,
    pub error_log: AtomicBuffer,
}

impl CncFile {
    pub fn path(dir: &Path) -> PathBuf {
        dir.join(CNC_FILE)
    }

    pub fn create(config: &DriverConfig, now_ms: i64) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;
        let page = config.file_page_size;
        let to_driver_length = align_up(config.conductor_buffer_length, page);
        let to_clients_length = align_up(config.to_clients_buffer_length, page);
        let values_length = align_up(config.counter_values_buffer_length, page);
        // Metadata records are 4x the value slot spacing per counter.
        let metadata_length = align_up(
            values_length / crate::counters::COUNTER_LENGTH * crate::counters::METADATA_LENGTH,
            page,
        );
        let error_log_length = align_up(config.error_buffer_length, page);

        let total = page
            + to_driver_length
            + to_clients_length
            + metadata_length
            + values_length
            + error_log_length;

        let path = Self::path(&config.dir);
        let mut mmap = MmapFile::create(&path, total, false)?;
        // SAFETY: the mapping is owned by this CncFile and outlives the views.
        let whole = unsafe { AtomicBuffer::new(mmap.as_mut_ptr(), mmap.len()) };

        let header = whole.view(0, page);
        let mut offset = page;
        let to_driver = whole.view(offset, to_driver_length);
        offset += to_driver_length;
        let to_clients = whole.view(offset, to_clients_length);
        offset += to_clients_length;
        let counters_metadata = whole.view(offset, metadata_length);
        offset += metadata_length;
        let counters_values = whole.view(offset, values_length);
        offset += values_length;
        let error_log = whole.view(offset, error_log_length);

        header.put_i32(FILE_PAGE_SIZE_OFFSET, page as i32);
        header.put_i64(DRIVER_PID_OFFSET, std::process::id() as i64);
        header.put_i64(START_TIMESTAMP_MS_OFFSET, now_ms);
        header.put_i64(HEARTBEAT_TIMESTAMP_MS_OFFSET, now_ms);
        header.put_i32(TO_DRIVER_LENGTH_OFFSET, to_driver_length as i32);
        header.put_i32(TO_CLIENTS_LENGTH_OFFSET, to_clients_length as i32);
        header.put_i32(COUNTERS_METADATA_LENGTH_OFFSET, metadata_length as i32);
        header.put_i32(COUNTERS_VALUES_LENGTH_OFFSET, values_length as i32);
        header.put_i32(ERROR_LOG_LENGTH_OFFSET, error_log_length as i32);
        // Version is the readiness word: published last.
        header.put_i32_ordered(VERSION_OFFSET, CNC_VERSION);

        Ok(Self {
            _mmap: mmap,
            header,
            to_driver,
            to_clients,
            counters_metadata,
            counters_values,
            error_log,
        })
    }

    pub fn open(dir: &Path) -> Result<Self> {
        let path = Self::path(dir);
        let mut mmap = MmapFile::open(&path)?;
        // SAFETY: as in create().
        let whole = unsafe { AtomicBuffer::new(mmap.as_mut_ptr(), mmap.len()) };
        if whole.len() < 64 {
            return Err(Error::Corrupt("cnc file too short"));
        }
        let version = whole.get_i32_volatile(VERSION_OFFSET);
        if version != CNC_VERSION {
            return Err(Error::Corrupt("cnc version mismatch"));
        }
        let page = whole.get_i32(FILE_PAGE_SIZE_OFFSET) as usize;
        let header = whole.view(0, page);
        let to_driver_length = header.get_i32(TO_DRIVER_LENGTH_OFFSET) as usize;
        let to_clients_length = header.get_i32(TO_CLIENTS_LENGTH_OFFSET) as usize;
        let metadata_length = header.get_i32(COUNTERS_METADATA_LENGTH_OFFSET) as usize;
        let values_length = header.get_i32(COUNTERS_VALUES_LENGTH_OFFSET) as usize;
        let error_log_length = header.get_i32(ERROR_LOG_LENGTH_OFFSET) as usize;

        let expected = page
            + to_driver_length
            + to_clients_length
            + metadata_length
            + values_length
            + error_log_length;
        if whole.len() < expected {
            return Err(Error::Corrupt("cnc region lengths exceed file"));
        }

        let mut offset = page;
        let to_driver = whole.view(offset, to_driver_length);
        offset += to_driver_length;
        let to_clients = whole.view(offset, to_clients_length);
        offset += to_clients_length;
        let counters_metadata = whole.view(offset, metadata_length);
        offset += metadata_length;
        let counters_values = whole.view(offset, values_length);
        offset += values_length;
        let error_log = whole.view(offset, error_log_length);

        Ok(Self {
            _mmap: mmap,
            header,
            to_driver,
            to_clients,
            counters_metadata,
            counters_values,
            error_log,
        })
    }

    pub fn update_heartbeat(&self, now_ms: i64) {
        self.header.put_i64_ordered(HEARTBEAT_TIMESTAMP_MS_OFFSET, now_ms);
    }

    pub fn heartbeat_ms(&self) -> i64 {
        self.header.get_i64_volatile(HEARTBEAT_TIMESTAMP_MS_OFFSET)
    }

    pub fn driver_pid(&self) -> i64 {
        self.header.get_i64(DRIVER_PID_OFFSET)
    }

    pub fn start_timestamp_ms(&self) -> i64 {
        self.header.get_i64(START_TIMESTAMP_MS_OFFSET)
    }
}

const LOG_RECORD_LENGTH_OFFSET: usize = 0;
const LOG_OBSERVATION_COUNT_OFFSET: usize = 4;
const LOG_LAST_OBSERVATION_OFFSET: usize = 8;
const LOG_FIRST_OBSERVATION_OFFSET: usize = 16;
const LOG_MESSAGE_OFFSET: usize = 24;
const LOG_RECORD_ALIGNMENT: usize = 8;

/// One observed distinct error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorObservation {
    pub observation_count: i32,
    pub first_observation_ms: i64,
    pub last_observation_ms: i64,
    pub message: String,
}

/// Append-only log of distinct errors; repeat observations bump the count on
/// the existing record instead of consuming space.
pub struct ErrorLog {
    buffer: AtomicBuffer,
}

impl ErrorLog {
    pub fn new(buffer: AtomicBuffer) -> Self {
        Self { buffer }
    }

    pub fn record(&self, message: &str, now_ms: i64) {
        let mut offset = 0;
        loop {
            if offset + LOG_MESSAGE_OFFSET >= self.buffer.len() {
                return; // log full; drop the observation
            }
            let record_length = self.buffer.get_i32_volatile(offset + LOG_RECORD_LENGTH_OFFSET);
            if record_length == 0 {
                break;
            }
            let message_length = record_length as usize - LOG_MESSAGE_OFFSET;
            let mut raw = vec![0u8; message_length];
            self.buffer.get_bytes(offset + LOG_MESSAGE_OFFSET, &mut raw);
            if raw == message.as_bytes() {
                self.buffer.put_i64(offset + LOG_LAST_OBSERVATION_OFFSET, now_ms);
                let count = self.buffer.get_i32(offset + LOG_OBSERVATION_COUNT_OFFSET);
                self.buffer
                    .put_i32_ordered(offset + LOG_OBSERVATION_COUNT_OFFSET, count + 1);
                return;
            }
            offset += align_up(record_length as usize, LOG_RECORD_ALIGNMENT);
        }

        let record_length = LOG_MESSAGE_OFFSET + message.len();
        if offset + align_up(record_length, LOG_RECORD_ALIGNMENT) > self.buffer.len() {
            return;
        }
        self.buffer.put_i64(offset + LOG_FIRST_OBSERVATION_OFFSET, now_ms);
        self.buffer.put_i64(offset + LOG_LAST_OBSERVATION_OFFSET, now_ms);
        self.buffer.put_bytes(offset + LOG_MESSAGE_OFFSET, message.as_bytes());
        self.buffer.put_i32(offset + LOG_OBSERVATION_COUNT_OFFSET, 1);
        // Length is the publish word for readers scanning the log.
        self.buffer
            .put_i32_ordered(offset + LOG_RECORD_LENGTH_OFFSET, record_length as i32);
    }

    pub fn read(&self) -> Vec<ErrorObservation> {
        let mut observations = Vec::new();
        let mut offset = 0;
        while offset + LOG_MESSAGE_OFFSET < self.buffer.len() {
            let record_length = self.buffer.get_i32_volatile(offset + LOG_RECORD_LENGTH_OFFSET);
            if record_length == 0 {
                break;
            }
            let message_length = record_length as usize - LOG_MESSAGE_OFFSET;
            let mut raw = vec![0u8; message_length];
            self.buffer.get_bytes(offset + LOG_MESSAGE_OFFSET, &mut raw);
            observations.push(ErrorObservation {
                observation_count: self.buffer.get_i32_volatile(offset + LOG_OBSERVATION_COUNT_OFFSET),
                first_observation_ms: self.buffer.get_i64(offset + LOG_FIRST_OBSERVATION_OFFSET),
                last_observation_ms: self.buffer.get_i64(offset + LOG_LAST_OBSERVATION_OFFSET),
                message: String::from_utf8_lossy(&raw).into_owned(),
            });
            offset += align_up(record_length as usize, LOG_RECORD_ALIGNMENT);
        }
        observations
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::AlignedBuffer;
    use tempfile::TempDir;

    #[test]
    fn create_and_reopen_resolves_regions() {
        let dir = TempDir::new().unwrap();
        let mut config = DriverConfig::default();
        config.dir = dir.path().to_path_buf();
        config.conductor_buffer_length = 64 * 1024;
        config.to_clients_buffer_length = 64 * 1024;
        config.counter_values_buffer_length = 64 * 1024;
        config.error_buffer_length = 64 * 1024;

        let cnc = CncFile::create(&config, 1234).unwrap();
        cnc.update_heartbeat(5678);
        drop(cnc);

        let cnc = CncFile::open(dir.path()).unwrap();
        assert_eq!(cnc.start_timestamp_ms(), 1234);
        assert_eq!(cnc.heartbeat_ms(), 5678);
        assert_eq!(cnc.to_driver.len(), 64 * 1024);
        assert_eq!(cnc.counters_values.len(), 64 * 1024);
        assert_eq!(
            cnc.counters_metadata.len(),
            64 * 1024 / crate::counters::COUNTER_LENGTH * crate::counters::METADATA_LENGTH
        );
    }

    #[test]
    fn error_log_dedups_by_message() {
        let owned = AlignedBuffer::new(4096);
        let log = ErrorLog::new(owned.buffer());
        log.record("boom", 100);
        log.record("boom", 200);
        log.record("different", 300);

        let observations = log.read();
        assert_eq!(observations.len(), 2);
        assert_eq!(observations[0].observation_count, 2);
        assert_eq!(observations[0].first_observation_ms, 100);
        assert_eq!(observations[0].last_observation_ms, 200);
        assert_eq!(observations[0].message, "boom");
        assert_eq!(observations[1].observation_count, 1);
        assert_eq!(observations[1].message, "different");
    }

    #[test]
    fn full_error_log_drops_new_distinct_errors() {
        let owned = AlignedBuffer::new(64);
        let log = ErrorLog::new(owned.buffer());
        log.record("first-error-that-fits-in-the-region", 1);
        log.record("second error that does not fit anymore", 2);
        let observations = log.read();
        assert_eq!(observations.len(), 1);
        // Repeat observations of the recorded error still count.
        log.record("first-error-that-fits-in-the-region", 3);
        assert_eq!(log.read()[0].observation_count, 2);
    }
}
