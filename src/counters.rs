//! Fixed-slot registry of 64-bit counters with metadata.
//!
//! Values live in a cache-line-spaced region read and written lock-free
//! across threads and processes; a parallel metadata region carries the slot
//! state machine, type id, ownership and label. Slot state is published with
//! release stores and read with acquire loads; values are advisory relaxed
//! reads except where a counter doubles as a position.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::buffer::AtomicBuffer;
use crate::{Error, Result};

pub const CACHE_LINE_LENGTH: usize = 64;
/// Value slot spacing: two cache lines so neighbouring counters never share.
pub const COUNTER_LENGTH: usize = 2 * CACHE_LINE_LENGTH;
pub const METADATA_LENGTH: usize = 512;

pub const MAX_KEY_LENGTH: usize = 64;
pub const MAX_LABEL_LENGTH: usize = 380;

pub const NULL_COUNTER_ID: i32 = -1;
pub const NULL_OWNER_ID: i64 = -1;
pub const NULL_REGISTRATION_ID: i64 = -1;

pub const STATE_UNUSED: i32 = 0;
pub const STATE_ALLOCATED: i32 = 1;
pub const STATE_RECLAIMED: i32 = 2;

const STATE_OFFSET: usize = 0;
const TYPE_ID_OFFSET: usize = 4;
const DEADLINE_OFFSET: usize = 8;
const REGISTRATION_ID_OFFSET: usize = 16;
const OWNER_ID_OFFSET: usize = 24;
const KEY_OFFSET: usize = 32;
const LABEL_LENGTH_OFFSET: usize = KEY_OFFSET + MAX_KEY_LENGTH;
const LABEL_OFFSET: usize = LABEL_LENGTH_OFFSET + 4;

const _: () = assert!(LABEL_OFFSET + MAX_LABEL_LENGTH <= METADATA_LENGTH);

/// Handle onto one allocated value slot.
#[derive(Clone, Copy)]
pub struct Counter {
    id: i32,
    addr: *const AtomicI64,
}

// SAFETY: the slot storage is owned by the CounterTable, which callers keep
// alive (Arc) for as long as any handle exists.
unsafe impl Send for Counter {}
unsafe impl Sync for Counter {}

impl Counter {
    pub fn id(&self) -> i32 {
        self.id
    }

    #[inline]
    fn slot(&self) -> &AtomicI64 {
        // SAFETY: addr points into the table's values region, alive per above.
        unsafe { &*self.addr }
    }

    pub fn get(&self) -> i64 {
        self.slot().load(Ordering::Relaxed)
    }

    pub fn get_volatile(&self) -> i64 {
        self.slot().load(Ordering::Acquire)
    }

    pub fn set_release(&self, value: i64) {
        self.slot().store(value, Ordering::Release);
    }

    pub fn set(&self, value: i64) {
        self.slot().store(value, Ordering::Relaxed);
    }

    pub fn increment(&self) -> i64 {
        self.slot().fetch_add(1, Ordering::AcqRel)
    }

    pub fn add(&self, delta: i64) -> i64 {
        self.slot().fetch_add(delta, Ordering::AcqRel)
    }

    /// Sets the value to `proposed` if it is greater (single-writer use).
    pub fn propose_max(&self, proposed: i64) -> bool {
        if self.get() < proposed {
            self.set_release(proposed);
            true
        } else {
            false
        }
    }
}

/// Fixed-capacity counter registry over a values and a metadata region.
pub struct CounterTable {
    values: AtomicBuffer,
    metadata: AtomicBuffer,
    capacity: usize,
    free_to_reuse_timeout_ns: u64,
}

impl CounterTable {
    pub fn new(values: AtomicBuffer, metadata: AtomicBuffer, free_to_reuse_timeout_ns: u64) -> Self {
        let capacity = std::cmp::min(
            values.len() / COUNTER_LENGTH,
            metadata.len() / METADATA_LENGTH,
        );
        Self {
            values,
            metadata,
            capacity,
            free_to_reuse_timeout_ns,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn meta_offset(&self, id: i32) -> usize {
        id as usize * METADATA_LENGTH
    }

    pub fn state(&self, id: i32) -> i32 {
        self.metadata.get_i32_volatile(self.meta_offset(id) + STATE_OFFSET)
    }

    pub fn type_id(&self, id: i32) -> i32 {
        self.metadata.get_i32(self.meta_offset(id) + TYPE_ID_OFFSET)
    }

    pub fn owner_id(&self, id: i32) -> i64 {
        self.metadata.get_i64(self.meta_offset(id) + OWNER_ID_OFFSET)
    }

    pub fn registration_id(&self, id: i32) -> i64 {
        self.metadata.get_i64(self.meta_offset(id) + REGISTRATION_ID_OFFSET)
    }

    pub fn label(&self, id: i32) -> String {
        let offset = self.meta_offset(id);
        let length = self.metadata.get_i32(offset + LABEL_LENGTH_OFFSET) as usize;
        let length = std::cmp::min(length, MAX_LABEL_LENGTH);
        let mut raw = vec![0u8; length];
        self.metadata.get_bytes(offset + LABEL_OFFSET, &mut raw);
        String::from_utf8_lossy(&raw).into_owned()
    }

    pub fn key(&self, id: i32) -> [u8; MAX_KEY_LENGTH] {
        let mut key = [0u8; MAX_KEY_LENGTH];
        self.metadata.get_bytes(self.meta_offset(id) + KEY_OFFSET, &mut key);
        key
    }

    pub fn counter(&self, id: i32) -> Counter {
        assert!((id as usize) < self.capacity, "counter id out of range");
        let value_offset = id as usize * COUNTER_LENGTH;
        let slice = self.values.as_slice();
        Counter {
            id,
            addr: slice[value_offset..].as_ptr() as *const AtomicI64,
        }
    }

    pub fn allocate(
        &self,
        type_id: i32,
        key: &[u8],
        label: &str,
        registration_id: i64,
        owner_id: i64,
    ) -> Result<Counter> {
        if key.len() > MAX_KEY_LENGTH {
            return Err(Error::Generic(format!("counter key length {} exceeds {MAX_KEY_LENGTH}", key.len())));
        }
        for id in 0..self.capacity as i32 {
            if self.state(id) != STATE_UNUSED {
                continue;
            }
            let offset = self.meta_offset(id);
            self.metadata.set_memory(offset + KEY_OFFSET, MAX_KEY_LENGTH, 0);
            self.metadata.put_bytes(offset + KEY_OFFSET, key);
            let label_bytes = &label.as_bytes()[..std::cmp::min(label.len(), MAX_LABEL_LENGTH)];
            self.metadata.set_memory(offset + LABEL_OFFSET, MAX_LABEL_LENGTH, 0);
            self.metadata.put_bytes(offset + LABEL_OFFSET, label_bytes);
            self.metadata.put_i32(offset + LABEL_LENGTH_OFFSET, label_bytes.len() as i32);
            self.metadata.put_i32(offset + TYPE_ID_OFFSET, type_id);
            self.metadata.put_i64(offset + REGISTRATION_ID_OFFSET, registration_id);
            self.metadata.put_i64(offset + OWNER_ID_OFFSET, owner_id);
            self.metadata.put_i64(offset + DEADLINE_OFFSET, 0);

            let counter = self.counter(id);
            counter.set(0);
            // State is the publish word: readers acquire it before metadata.
            self.metadata.put_i32_ordered(offset + STATE_OFFSET, STATE_ALLOCATED);
            return Ok(counter);
        }
        Err(Error::CounterSpaceExhausted)
    }

    /// Static counters are idempotent by `(typeId, registrationId)` and never
    /// carry an owner.
    pub fn allocate_static(
        &self,
        type_id: i32,
        key: &[u8],
        label: &str,
        registration_id: i64,
    ) -> Result<Counter> {
        if let Some(id) = self.find_by_registration(type_id, registration_id) {
            if self.owner_id(id) != NULL_OWNER_ID {
                return Err(Error::StaticCounterCollision { type_id, registration_id });
            }
            return Ok(self.counter(id));
        }
        self.allocate(type_id, key, label, registration_id, NULL_OWNER_ID)
    }

    /// Guards a non-static allocation against an existing static counter with
    /// the same `(typeId, registrationId)`.
    pub fn check_static_collision(&self, type_id: i32, registration_id: i64) -> Result<()> {
        if registration_id == NULL_REGISTRATION_ID {
            return Ok(());
        }
        if let Some(id) = self.find_by_registration(type_id, registration_id) {
            if self.owner_id(id) == NULL_OWNER_ID {
                return Err(Error::StaticCounterCollision { type_id, registration_id });
            }
        }
        Ok(())
    }

    pub fn find_by_registration(&self, type_id: i32, registration_id: i64) -> Option<i32> {
        (0..self.capacity as i32).find(|&id| {
            self.state(id) == STATE_ALLOCATED
                && self.type_id(id) == type_id
                && self.registration_id(id) == registration_id
        })
    }

    pub fn free(&self, id: i32, now_ns: u64) {
        let offset = self.meta_offset(id);
        self.metadata.put_i64(
            offset + DEADLINE_OFFSET,
            (now_ns + self.free_to_reuse_timeout_ns) as i64,
        );
        self.metadata.put_i32_ordered(offset + STATE_OFFSET, STATE_RECLAIMED);
    }

    /// Moves RECLAIMED slots past their grace period back to UNUSED.
    pub fn reclaim_sweep(&self, now_ns: u64) {
        for id in 0..self.capacity as i32 {
            let offset = self.meta_offset(id);
            if self.state(id) == STATE_RECLAIMED
                && self.metadata.get_i64(offset + DEADLINE_OFFSET) <= now_ns as i64
            {
                self.metadata.put_i32_ordered(offset + STATE_OFFSET, STATE_UNUSED);
            }
        }
    }

    /// Frees every non-static counter owned by `owner_id`.
    pub fn free_owned(&self, owner_id: i64, now_ns: u64) {
        for id in 0..self.capacity as i32 {
            if self.state(id) == STATE_ALLOCATED && self.owner_id(id) == owner_id {
                self.free(id, now_ns);
            }
        }
    }
}

/// System counter assignments, allocated once at driver start.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum SystemCounter {
    Errors = 0,
    UnblockedPublications = 1,
    PublicationsRevoked = 2,
    HeartbeatsSent = 3,
    HeartbeatsReceived = 4,
    RetransmitsSent = 5,
    RetransmittedBytes = 6,
    NakMessagesSent = 7,
    NakMessagesReceived = 8,
    StatusMessagesSent = 9,
    StatusMessagesReceived = 10,
    ShortSends = 11,
    SenderFlowControlLimits = 12,
    FlowControlOverRuns = 13,
    FlowControlUnderRuns = 14,
    InvalidPackets = 15,
    ClientTimeouts = 16,
    ConductorServiceTimeouts = 17,
    ImagesRejected = 18,
    LossGapFills = 19,
}

pub const SYSTEM_COUNTER_TYPE_ID: i32 = 0;

// Per-stream counter type ids.
pub const PUBLISHER_POSITION_TYPE_ID: i32 = 1;
pub const PUBLISHER_LIMIT_TYPE_ID: i32 = 2;
pub const SENDER_POSITION_TYPE_ID: i32 = 3;
pub const SENDER_LIMIT_TYPE_ID: i32 = 4;
pub const SUBSCRIBER_POSITION_TYPE_ID: i32 = 5;
pub const RECEIVER_HWM_TYPE_ID: i32 = 6;
pub const RECEIVER_POSITION_TYPE_ID: i32 = 7;
pub const SENDER_BPE_TYPE_ID: i32 = 8;
pub const RECEIVER_NAKS_SENT_TYPE_ID: i32 = 9;

const SYSTEM_COUNTERS: &[(SystemCounter, &str)] = &[
    (SystemCounter::Errors, "Errors"),
    (SystemCounter::UnblockedPublications, "Unblocked Publications"),
    (SystemCounter::PublicationsRevoked, "Publications Revoked"),
    (SystemCounter::HeartbeatsSent, "Heartbeats Sent"),
    (SystemCounter::HeartbeatsReceived, "Heartbeats Received"),
    (SystemCounter::RetransmitsSent, "Retransmits Sent"),
    (SystemCounter::RetransmittedBytes, "Retransmitted Bytes"),
    (SystemCounter::NakMessagesSent, "NAK Messages Sent"),
    (SystemCounter::NakMessagesReceived, "NAK Messages Received"),
    (SystemCounter::StatusMessagesSent, "Status Messages Sent"),
    (SystemCounter::StatusMessagesReceived, "Status Messages Received"),
    (SystemCounter::ShortSends, "Short Sends"),
    (SystemCounter::SenderFlowControlLimits, "Sender Flow Control Limits"),
    (SystemCounter::FlowControlOverRuns, "Flow Control Over Runs"),
    (SystemCounter::FlowControlUnderRuns, "Flow Control Under Runs"),
    (SystemCounter::InvalidPackets, "Invalid Packets"),
    (SystemCounter::ClientTimeouts, "Client Timeouts"),
    (SystemCounter::ConductorServiceTimeouts, "Conductor Service Timeouts"),
    (SystemCounter::ImagesRejected, "Images Rejected"),
    (SystemCounter::LossGapFills, "Loss Gap Fills"),
];

/// The driver's own counters, id-stable across restarts.
pub struct SystemCounters {
    counters: Vec<Counter>,
}

impl SystemCounters {
    pub fn allocate(table: &CounterTable) -> Result<Self> {
        let mut counters = Vec::with_capacity(SYSTEM_COUNTERS.len());
        for (descriptor, label) in SYSTEM_COUNTERS {
            let counter =
                table.allocate(SYSTEM_COUNTER_TYPE_ID, &[], label, *descriptor as i64, NULL_OWNER_ID)?;
            debug_assert_eq!(counter.id(), *descriptor as i32);
            counters.push(counter);
        }
        Ok(Self { counters })
    }

    pub fn get(&self, descriptor: SystemCounter) -> &Counter {
        &self.counters[descriptor as usize]
    }
}

/// Convenience owner bundling the backing store for in-process tables.
pub struct HeapCounterTable {
    _values: crate::buffer::AlignedBuffer,
    _metadata: crate::buffer::AlignedBuffer,
    pub table: Arc<CounterTable>,
}

impl HeapCounterTable {
    pub fn new(capacity: usize, free_to_reuse_timeout_ns: u64) -> Self {
        let values = crate::buffer::AlignedBuffer::new(capacity * COUNTER_LENGTH);
        let metadata = crate::buffer::AlignedBuffer::new(capacity * METADATA_LENGTH);
        let table = Arc::new(CounterTable::new(
            values.buffer(),
            metadata.buffer(),
            free_to_reuse_timeout_ns,
        ));
        Self {
            _values: values,
            _metadata: metadata,
            table,
        }
    }
}
