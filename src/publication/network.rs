//! Sender-side network publication.
//!
//! The sender thread drains committed frames into MTU-sized datagrams,
//! emits SETUP and heartbeat frames on their timers, folds status messages
//! into the sender limit and answers NAKs through the retransmit handler.
//! The conductor thread owns the lifecycle, publisher limit, spy subscribers
//! and the blocked-publisher watchdog.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::buffer::align_up;
use crate::counters::{Counter, SystemCounter, SystemCounters};
use crate::error::ErrorCode;
use crate::event::Notification;
use crate::flow_control::FlowControl;
use crate::logbuffer::frame::{self, frame_length_volatile, FrameHeader, FRAME_ALIGNMENT};
#[cfg(test)]
use crate::logbuffer::frame::HEADER_LENGTH;
use crate::logbuffer::meta::RawLog;
use crate::logbuffer::position::{
    compute_position, compute_term_id_from_position, compute_term_offset_from_position,
    index_by_position, position_bits_to_shift,
};
use crate::logbuffer::term;
use crate::protocol::{NakFrame, RttMeasurement, SetupFrame, StatusMessage};
use crate::publication::PublicationState;
use crate::subscribable::{Subscribable, SubscriberPosition, TetherState};

pub const HEARTBEAT_TIMEOUT_NS: u64 = 100_000_000;
pub const SETUP_TIMEOUT_NS: u64 = 100_000_000;
pub const CONNECTION_TIMEOUT_NS: u64 = 5_000_000_000;
const RETRANSMIT_LINGER_NS: u64 = 10_000_000;

/// Deduplicates NAKs and schedules resends, bounded by `max_retransmits`.
pub struct RetransmitHandler {
    pending: Vec<RetransmitAction>,
    max_retransmits: usize,
    delay_ns: u64,
    linger_ns: u64,
}

#[derive(Clone, Copy)]
struct RetransmitAction {
    term_id: i32,
    term_offset: i32,
    length: i32,
    deadline_ns: u64,
    lingering: bool,
}

impl RetransmitHandler {
    pub fn new(max_retransmits: usize, delay_ns: u64, linger_ns: u64) -> Self {
        Self {
            pending: Vec::new(),
            max_retransmits,
            delay_ns,
            linger_ns,
        }
    }

    /// Schedules a resend unless an overlapping request is already in flight
    /// or lingering.
    pub fn on_nak(&mut self, term_id: i32, term_offset: i32, length: i32, now_ns: u64) -> bool {
        let overlaps = self.pending.iter().any(|action| {
            action.term_id == term_id
                && term_offset < action.term_offset + action.length
                && action.term_offset < term_offset + length
        });
        if overlaps || self.active_count() >= self.max_retransmits {
            return false;
        }
        self.pending.push(RetransmitAction {
            term_id,
            term_offset,
            length,
            deadline_ns: now_ns + self.delay_ns,
            lingering: false,
        });
        true
    }

    fn active_count(&self) -> usize {
        self.pending.iter().filter(|a| !a.lingering).count()
    }

    /// Returns the due resends and expires lingering entries.
    pub fn poll(&mut self, now_ns: u64) -> Vec<(i32, i32, i32)> {
        let mut due = Vec::new();
        for action in self.pending.iter_mut() {
            if !action.lingering && now_ns >= action.deadline_ns {
                due.push((action.term_id, action.term_offset, action.length));
                action.lingering = true;
                action.deadline_ns = now_ns + self.linger_ns;
            }
        }
        self.pending
            .retain(|action| !(action.lingering && now_ns >= action.deadline_ns));
        due
    }
}

pub struct NetworkPublicationParams {
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub channel: String,
    pub log_file: String,
    pub is_exclusive: bool,
    pub spies_simulate_connection: bool,
    pub signal_eos: bool,
    pub term_window_length: usize,
    pub mtu_length: usize,
    pub linger_timeout_ns: u64,
    pub unblock_timeout_ns: u64,
    pub untethered_window_limit_timeout_ns: u64,
    pub untethered_linger_timeout_ns: u64,
    pub untethered_resting_timeout_ns: u64,
    pub max_messages_per_send: usize,
    pub max_resend: usize,
}

struct SenderFields {
    flow_control: FlowControl,
    retransmit: RetransmitHandler,
    time_of_last_data_or_hb_ns: u64,
    time_of_last_setup_ns: u64,
    has_initial_connection: bool,
}

struct ConductorFields {
    state: PublicationState,
    ref_count: i32,
    trip_limit: i64,
    last_consumer_position: i64,
    time_of_last_consumer_update_ns: u64,
    time_of_last_state_change_ns: u64,
    subscribable: Subscribable,
}

pub struct NetworkPublication {
    registration_id: i64,
    session_id: i32,
    stream_id: i32,
    initial_term_id: i32,
    channel: String,
    log_file: String,
    is_exclusive: bool,
    spies_simulate_connection: bool,
    signal_eos: bool,
    position_bits_to_shift: u32,
    term_length: usize,
    mtu_length: usize,
    term_window_length: i64,
    trip_gain: i64,
    linger_timeout_ns: u64,
    unblock_timeout_ns: u64,
    untethered_window_limit_timeout_ns: u64,
    untethered_linger_timeout_ns: u64,
    untethered_resting_timeout_ns: u64,
    max_messages_per_send: usize,

    log: RawLog,
    pub_pos: Counter,
    pub_lmt: Counter,
    snd_pos: Counter,
    snd_lmt: Counter,
    snd_bpe: Counter,
    system: Arc<SystemCounters>,

    has_receivers: AtomicBool,
    has_required_receivers: AtomicBool,
    has_spies: AtomicBool,
    is_connected: AtomicBool,
    is_end_of_stream: AtomicBool,
    is_setup_elicited: AtomicBool,
    has_sender_released: AtomicBool,
    has_received_eos_ack: AtomicBool,
    end_of_stream_position: AtomicI64,
    clean_position: AtomicI64,
    time_of_last_status_message_ns: AtomicU64,

    sender: Mutex<SenderFields>,
    conductor: Mutex<ConductorFields>,
}

impl NetworkPublication {
    pub fn new(
        params: NetworkPublicationParams,
        log: RawLog,
        pub_pos: Counter,
        pub_lmt: Counter,
        snd_pos: Counter,
        snd_lmt: Counter,
        snd_bpe: Counter,
        flow_control: FlowControl,
        system: Arc<SystemCounters>,
        now_ns: u64,
    ) -> Self {
        let bits = position_bits_to_shift(log.term_length());
        let initial_position = term::producer_position(&log);
        pub_pos.set_release(initial_position);
        pub_lmt.set_release(initial_position);
        snd_pos.set_release(initial_position);
        snd_lmt.set_release(initial_position);

        Self {
            registration_id: params.registration_id,
            session_id: params.session_id,
            stream_id: params.stream_id,
            initial_term_id: log.meta().initial_term_id(),
            channel: params.channel,
            log_file: params.log_file,
            is_exclusive: params.is_exclusive,
            spies_simulate_connection: params.spies_simulate_connection,
            signal_eos: params.signal_eos,
            position_bits_to_shift: bits,
            term_length: log.term_length(),
            mtu_length: params.mtu_length,
            term_window_length: params.term_window_length as i64,
            trip_gain: (params.term_window_length >> 3) as i64,
            linger_timeout_ns: params.linger_timeout_ns,
            unblock_timeout_ns: params.unblock_timeout_ns,
            untethered_window_limit_timeout_ns: params.untethered_window_limit_timeout_ns,
            untethered_linger_timeout_ns: params.untethered_linger_timeout_ns,
            untethered_resting_timeout_ns: params.untethered_resting_timeout_ns,
            max_messages_per_send: params.max_messages_per_send,
            log,
            pub_pos,
            pub_lmt,
            snd_pos,
            snd_lmt,
            snd_bpe,
            system,
            has_receivers: AtomicBool::new(false),
            has_required_receivers: AtomicBool::new(false),
            has_spies: AtomicBool::new(false),
            is_connected: AtomicBool::new(false),
            is_end_of_stream: AtomicBool::new(false),
            is_setup_elicited: AtomicBool::new(false),
            has_sender_released: AtomicBool::new(false),
            has_received_eos_ack: AtomicBool::new(false),
            end_of_stream_position: AtomicI64::new(i64::MAX),
            clean_position: AtomicI64::new(initial_position),
            time_of_last_status_message_ns: AtomicU64::new(0),
            sender: Mutex::new(SenderFields {
                flow_control,
                retransmit: RetransmitHandler::new(params.max_resend, 0, RETRANSMIT_LINGER_NS),
                time_of_last_data_or_hb_ns: now_ns,
                time_of_last_setup_ns: 0,
                has_initial_connection: false,
            }),
            conductor: Mutex::new(ConductorFields {
                state: PublicationState::Active,
                ref_count: 0,
                trip_limit: 0,
                last_consumer_position: initial_position,
                time_of_last_consumer_update_ns: now_ns,
                time_of_last_state_change_ns: now_ns,
                subscribable: Subscribable::default(),
            }),
        }
    }

    pub fn registration_id(&self) -> i64 {
        self.registration_id
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn log_file(&self) -> &str {
        &self.log_file
    }

    pub fn is_exclusive(&self) -> bool {
        self.is_exclusive
    }

    pub fn raw_log(&self) -> &RawLog {
        &self.log
    }

    pub fn publisher_limit_id(&self) -> i32 {
        self.pub_lmt.id()
    }

    pub fn producer_position(&self) -> i64 {
        term::producer_position(&self.log)
    }

    pub fn sender_position(&self) -> i64 {
        self.snd_pos.get_volatile()
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(Ordering::Acquire)
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.is_end_of_stream.load(Ordering::Acquire)
    }

    pub fn sender_release(&self) {
        self.has_sender_released.store(true, Ordering::Release);
    }

    pub fn has_sender_released(&self) -> bool {
        self.has_sender_released.load(Ordering::Acquire)
    }

    // --- sender side ---

    /// One sender duty cycle: data, then setup/heartbeat timers, then due
    /// retransmits. Datagrams are handed to `sink`.
    pub fn send(&self, now_ns: u64, sink: &mut dyn FnMut(&[u8])) -> usize {
        let mut sender = self.sender.lock().expect("publication sender lock");
        let mut work_count = 0;

        let snd_lmt = self.snd_lmt.get_volatile();
        let producer_position = self.producer_position();
        let available_limit = std::cmp::min(snd_lmt, producer_position);
        let mut position = self.snd_pos.get();

        let mut bytes_sent = 0usize;
        for _ in 0..self.max_messages_per_send {
            if position >= available_limit {
                break;
            }
            let chunk = self.scan_chunk(position, available_limit);
            if chunk == 0 {
                break;
            }
            self.emit_range(position, chunk, sink);
            position += chunk as i64;
            bytes_sent += chunk;
        }

        if bytes_sent > 0 {
            self.snd_pos.set_release(position);
            sender.time_of_last_data_or_hb_ns = now_ns;
            work_count += 1;
        } else if position < producer_position && position >= snd_lmt {
            // Data is committed but the flow control window is exhausted.
            self.snd_bpe.increment();
            self.system.get(SystemCounter::SenderFlowControlLimits).increment();
        }

        work_count += self.check_setup(&mut sender, now_ns, sink);
        work_count += self.check_heartbeat(&mut sender, position, bytes_sent, now_ns, sink);
        work_count += self.check_retransmits(&mut sender, now_ns, sink);
        self.check_receiver_liveness(&mut sender, now_ns);

        work_count
    }

    /// Largest run of committed frames from `position`, bounded by the MTU,
    /// the term end and `limit`.
    fn scan_chunk(&self, position: i64, limit: i64) -> usize {
        let term_offset = (position & (self.term_length as i64 - 1)) as usize;
        let index = index_by_position(position, self.position_bits_to_shift);
        let term = self.log.term(index);

        let mut end = term_offset;
        while end < self.term_length {
            let frame_length = frame_length_volatile(term, end);
            if frame_length <= 0 {
                break;
            }
            let aligned = align_up(frame_length as usize, FRAME_ALIGNMENT);
            let chunk = end + aligned - term_offset;
            if chunk > self.mtu_length || position + chunk as i64 > limit {
                break;
            }
            end += aligned;
        }
        end - term_offset
    }

    fn emit_range(&self, position: i64, length: usize, sink: &mut dyn FnMut(&[u8])) {
        let term_offset = (position & (self.term_length as i64 - 1)) as usize;
        let index = index_by_position(position, self.position_bits_to_shift);
        let mut datagram = vec![0u8; length];
        self.log.term(index).get_bytes(term_offset, &mut datagram);
        sink(&datagram);
    }

    fn check_setup(
        &self,
        sender: &mut SenderFields,
        now_ns: u64,
        sink: &mut dyn FnMut(&[u8]),
    ) -> usize {
        let unconnected = !sender.has_initial_connection;
        let elicited = self.is_setup_elicited.load(Ordering::Acquire);
        if !unconnected && !elicited {
            return 0;
        }
        if now_ns.saturating_sub(sender.time_of_last_setup_ns) < SETUP_TIMEOUT_NS {
            return 0;
        }
        sender.time_of_last_setup_ns = now_ns;

        let position = self.snd_pos.get();
        let setup = SetupFrame {
            term_offset: compute_term_offset_from_position(position, self.position_bits_to_shift),
            session_id: self.session_id,
            stream_id: self.stream_id,
            initial_term_id: self.initial_term_id,
            active_term_id: compute_term_id_from_position(
                position,
                self.position_bits_to_shift,
                self.initial_term_id,
            ),
            term_length: self.term_length as i32,
            mtu_length: self.mtu_length as i32,
            ttl: 0,
        };
        let mut buf = [0u8; SetupFrame::LENGTH];
        let length = setup.encode(&mut buf);
        sink(&buf[..length]);
        if elicited && self.has_receivers.load(Ordering::Acquire) {
            self.is_setup_elicited.store(false, Ordering::Release);
        }
        1
    }

    fn check_heartbeat(
        &self,
        sender: &mut SenderFields,
        position: i64,
        bytes_sent: usize,
        now_ns: u64,
        sink: &mut dyn FnMut(&[u8]),
    ) -> usize {
        if bytes_sent > 0
            || !sender.has_initial_connection
            || now_ns.saturating_sub(sender.time_of_last_data_or_hb_ns) < HEARTBEAT_TIMEOUT_NS
        {
            return 0;
        }
        let mut flags = frame::BEGIN_FRAG_FLAG | frame::END_FRAG_FLAG;
        if self.is_end_of_stream.load(Ordering::Acquire) {
            flags |= frame::EOS_FLAG;
        }
        let header = FrameHeader {
            frame_length: 0,
            version: frame::CURRENT_VERSION,
            flags,
            frame_type: frame::HDR_TYPE_DATA,
            term_offset: compute_term_offset_from_position(position, self.position_bits_to_shift),
            session_id: self.session_id,
            stream_id: self.stream_id,
            term_id: compute_term_id_from_position(
                position,
                self.position_bits_to_shift,
                self.initial_term_id,
            ),
            reserved_value: 0,
        };
        sink(&header.to_bytes());
        sender.time_of_last_data_or_hb_ns = now_ns;
        self.system.get(SystemCounter::HeartbeatsSent).increment();
        1
    }

    fn check_retransmits(
        &self,
        sender: &mut SenderFields,
        now_ns: u64,
        sink: &mut dyn FnMut(&[u8]),
    ) -> usize {
        let due = sender.retransmit.poll(now_ns);
        let mut work_count = 0;
        for (term_id, term_offset, length) in due {
            work_count += self.resend(term_id, term_offset, length, sink);
        }
        work_count
    }

    /// Resends the committed, uncleaned part of the requested range.
    fn resend(
        &self,
        term_id: i32,
        term_offset: i32,
        length: i32,
        sink: &mut dyn FnMut(&[u8]),
    ) -> usize {
        let start_position = compute_position(
            term_id,
            term_offset,
            self.position_bits_to_shift,
            self.initial_term_id,
        );
        if start_position < self.clean_position.load(Ordering::Acquire)
            || start_position + length as i64 > self.snd_pos.get_volatile()
        {
            return 0;
        }

        let index = index_by_position(start_position, self.position_bits_to_shift);
        let term = self.log.term(index);
        let end_offset = std::cmp::min(term_offset as usize + length as usize, self.term_length);
        let mut offset = term_offset as usize;
        let mut resent_bytes = 0usize;

        while offset < end_offset {
            let mut chunk_end = offset;
            while chunk_end < end_offset {
                let frame_length = frame_length_volatile(term, chunk_end);
                if frame_length <= 0 {
                    break;
                }
                let aligned = align_up(frame_length as usize, FRAME_ALIGNMENT);
                if chunk_end + aligned - offset > self.mtu_length {
                    break;
                }
                chunk_end += aligned;
            }
            if chunk_end == offset {
                break;
            }
            let mut datagram = vec![0u8; chunk_end - offset];
            term.get_bytes(offset, &mut datagram);
            sink(&datagram);
            resent_bytes += chunk_end - offset;
            offset = chunk_end;
        }

        if resent_bytes > 0 {
            self.system.get(SystemCounter::RetransmitsSent).increment();
            self.system
                .get(SystemCounter::RetransmittedBytes)
                .add(resent_bytes as i64);
        }
        resent_bytes.min(1)
    }

    /// Folds a received status message into connection state and the sender
    /// limit.
    pub fn on_status_message(&self, sm: &StatusMessage, now_ns: u64) {
        let mut sender = self.sender.lock().expect("publication sender lock");
        self.system.get(SystemCounter::StatusMessagesReceived).increment();
        self.time_of_last_status_message_ns.store(now_ns, Ordering::Release);

        if sm.is_setup_eliciting() && !self.is_end_of_stream.load(Ordering::Acquire) {
            self.is_setup_elicited.store(true, Ordering::Release);
        }

        if !sender.has_initial_connection {
            sender.has_initial_connection = true;
        }
        self.has_receivers.store(true, Ordering::Release);

        let current_limit = self.snd_lmt.get();
        let new_limit = sender.flow_control.on_status_message(sm, current_limit, now_ns);
        if new_limit > current_limit || sender.flow_control.receiver_count() > 0 {
            self.snd_lmt.set_release(new_limit);
        }
        self.has_required_receivers
            .store(sender.flow_control.has_required_receivers(), Ordering::Release);

        if !self.is_connected.load(Ordering::Relaxed) {
            self.is_connected.store(true, Ordering::Release);
            self.log.meta().set_is_connected(true);
        }

        if self.is_end_of_stream.load(Ordering::Acquire) {
            let sm_position = compute_position(
                sm.consumption_term_id,
                sm.consumption_term_offset,
                self.position_bits_to_shift,
                self.initial_term_id,
            );
            if sm_position >= self.end_of_stream_position.load(Ordering::Acquire) {
                self.has_received_eos_ack.store(true, Ordering::Release);
            }
        }
    }

    pub fn on_nak(&self, nak: &NakFrame, now_ns: u64) {
        let mut sender = self.sender.lock().expect("publication sender lock");
        self.system.get(SystemCounter::NakMessagesReceived).increment();
        sender
            .retransmit
            .on_nak(nak.term_id, nak.term_offset, nak.length, now_ns);
    }

    /// Answers an RTT probe; replies are consumed by the sender silently.
    pub fn on_rtt_measurement(&self, rttm: &RttMeasurement, now_ns: u64) -> Option<RttMeasurement> {
        if rttm.is_reply() {
            return None;
        }
        Some(RttMeasurement {
            flags: frame::REPLY_FLAG,
            session_id: self.session_id,
            stream_id: self.stream_id,
            echo_timestamp_ns: rttm.echo_timestamp_ns,
            reception_delta_ns: now_ns as i64 - rttm.echo_timestamp_ns,
            receiver_id: rttm.receiver_id,
        })
    }

    fn check_receiver_liveness(&self, sender: &mut SenderFields, now_ns: u64) {
        let new_limit = sender.flow_control.on_idle(now_ns, self.snd_lmt.get());
        self.snd_lmt.set_release(new_limit);
        self.has_required_receivers
            .store(sender.flow_control.has_required_receivers(), Ordering::Release);

        if self.has_receivers.load(Ordering::Relaxed) {
            let last_sm = self.time_of_last_status_message_ns.load(Ordering::Acquire);
            if now_ns.saturating_sub(last_sm) > CONNECTION_TIMEOUT_NS {
                self.has_receivers.store(false, Ordering::Release);
                let spy_connected = self.spies_simulate_connection
                    && self.has_spies.load(Ordering::Acquire);
                if !spy_connected {
                    self.is_connected.store(false, Ordering::Release);
                    self.log.meta().set_is_connected(false);
                }
            }
        }
    }

    // --- conductor side ---

    pub fn inc_ref(&self) {
        let mut con = self.conductor.lock().expect("publication conductor lock");
        con.ref_count += 1;
    }

    pub fn dec_ref(&self) {
        let mut con = self.conductor.lock().expect("publication conductor lock");
        con.ref_count -= 1;
        if con.ref_count == 0 {
            let producer_position = self.producer_position();
            self.pub_lmt.set_release(producer_position);
            self.end_of_stream_position.store(producer_position, Ordering::Release);
            self.is_end_of_stream.store(true, Ordering::Release);
            if self.signal_eos {
                self.log.meta().set_end_of_stream_position(producer_position);
            }
            if !self.log.meta().is_publication_revoked() {
                con.state = PublicationState::Draining;
            }
        }
    }

    pub fn revoke(&self) {
        self.log.meta().set_publication_revoked();
    }

    pub fn state(&self) -> PublicationState {
        self.conductor.lock().expect("publication conductor lock").state
    }

    pub fn has_reached_end_of_life(&self) -> bool {
        self.state() == PublicationState::Done
    }

    pub fn is_accepting_subscriptions(&self) -> bool {
        let con = self.conductor.lock().expect("publication conductor lock");
        con.state == PublicationState::Active
            || (con.state == PublicationState::Draining
                && !con.subscribable.all_caught_up_to(self.producer_position()))
    }

    /// Spy subscribers attach directly to the sender's log.
    pub fn add_spy_subscriber(&self, position: SubscriberPosition) {
        let mut con = self.conductor.lock().expect("publication conductor lock");
        con.subscribable.add(position);
        self.has_spies.store(true, Ordering::Release);
        if self.spies_simulate_connection {
            self.is_connected.store(true, Ordering::Release);
            self.log.meta().set_is_connected(true);
        }
    }

    pub fn remove_spy_subscriber(&self, subscription_id: i64) -> Option<SubscriberPosition> {
        let mut con = self.conductor.lock().expect("publication conductor lock");
        let removed = con.subscribable.remove(subscription_id);
        if con.subscribable.is_empty() {
            self.has_spies.store(false, Ordering::Release);
        }
        removed
    }

    pub fn spy_count(&self) -> usize {
        self.conductor.lock().expect("publication conductor lock").subscribable.len()
    }

    pub fn join_position(&self) -> i64 {
        self.snd_pos.get_volatile()
    }

    /// One conductor tick. Returns positions freed by untethered removal.
    pub fn on_time_event(
        &self,
        now_ns: u64,
        notifications: &mut Vec<Notification>,
    ) -> Vec<SubscriberPosition> {
        let mut con = self.conductor.lock().expect("publication conductor lock");
        let mut freed = Vec::new();
        match con.state {
            PublicationState::Active => {
                if self.log.meta().is_publication_revoked() {
                    let revoked_position = self.producer_position();
                    self.pub_lmt.set_release(revoked_position);
                    self.end_of_stream_position.store(revoked_position, Ordering::Release);
                    self.is_end_of_stream.store(true, Ordering::Release);
                    self.log.meta().set_end_of_stream_position(revoked_position);
                    self.log.meta().set_is_connected(false);
                    self.is_connected.store(false, Ordering::Release);
                    for position in con.subscribable.iter() {
                        notifications.push(Notification::UnavailableImage {
                            correlation_id: self.registration_id,
                            subscription_registration_id: position.subscription_id,
                            stream_id: self.stream_id,
                        });
                    }
                    notifications.push(Notification::PublicationError {
                        registration_id: self.registration_id,
                        session_id: self.session_id,
                        stream_id: self.stream_id,
                        code: ErrorCode::PublicationRevoked,
                        message: "publication revoked".to_string(),
                    });
                    con.state = PublicationState::Linger;
                    con.time_of_last_state_change_ns = now_ns;
                    self.system.get(SystemCounter::PublicationsRevoked).increment();
                } else {
                    freed = self.check_untethered(&mut con, now_ns, notifications);
                    let producer_position = self.producer_position();
                    self.pub_pos.set_release(producer_position);
                    if !self.is_exclusive {
                        self.check_for_blocked_publisher(&mut con, producer_position, now_ns);
                    }
                }
            }
            PublicationState::Draining => {
                let producer_position = self.producer_position();
                self.pub_pos.set_release(producer_position);
                let sender_position = self.snd_pos.get_volatile();
                let sender_done = sender_position >= producer_position
                    && (!self.has_receivers.load(Ordering::Acquire)
                        || self.has_received_eos_ack.load(Ordering::Acquire)
                        || now_ns.saturating_sub(con.time_of_last_state_change_ns)
                            > CONNECTION_TIMEOUT_NS);
                if sender_done && con.subscribable.all_caught_up_to(producer_position) {
                    for position in con.subscribable.iter() {
                        notifications.push(Notification::UnavailableImage {
                            correlation_id: self.registration_id,
                            subscription_registration_id: position.subscription_id,
                            stream_id: self.stream_id,
                        });
                    }
                    self.log.meta().set_is_connected(false);
                    con.state = PublicationState::Linger;
                    con.time_of_last_state_change_ns = now_ns;
                } else if term::unblock(&self.log, sender_position) {
                    self.system.get(SystemCounter::UnblockedPublications).increment();
                }
            }
            PublicationState::Linger => {
                if con.ref_count == 0
                    && self.has_sender_released.load(Ordering::Acquire)
                    && now_ns.saturating_sub(con.time_of_last_state_change_ns)
                        > self.linger_timeout_ns
                {
                    freed = con.subscribable.clear();
                    con.state = PublicationState::Done;
                }
            }
            PublicationState::Done => {}
        }
        freed
    }

    /// Advances the publisher position/limit; subscriber (sender and spy) lag
    /// throttles the publisher, with trip-limit hysteresis.
    pub fn update_publisher_position_and_limit(&self) -> usize {
        let mut con = self.conductor.lock().expect("publication conductor lock");
        if con.state != PublicationState::Active {
            return 0;
        }

        let producer_position = self.producer_position();
        self.pub_pos.set_release(producer_position);

        let sender_position = self.snd_pos.get_volatile();
        let has_spies = con.subscribable.has_working_positions();
        let connected_for_limit = self.has_required_receivers.load(Ordering::Acquire)
            || (self.spies_simulate_connection && has_spies);

        if connected_for_limit {
            let mut min_consumer_position = sender_position;
            if has_spies {
                min_consumer_position = std::cmp::min(
                    min_consumer_position,
                    con.subscribable.min_position(i64::MAX),
                );
            }
            let proposed_limit = min_consumer_position + self.term_window_length;
            if proposed_limit >= con.trip_limit {
                self.clean_buffer_to(min_consumer_position - self.term_length as i64);
                self.pub_lmt.set_release(proposed_limit);
                con.trip_limit = proposed_limit + self.trip_gain;
                return 1;
            }
        } else if self.pub_lmt.get() > sender_position {
            con.trip_limit = sender_position;
            self.pub_lmt.set_release(sender_position);
            self.clean_buffer_to(sender_position - self.term_length as i64);
            return 1;
        }

        0
    }

    fn check_for_blocked_publisher(
        &self,
        con: &mut ConductorFields,
        producer_position: i64,
        now_ns: u64,
    ) {
        let consumer_position = self.snd_pos.get_volatile();
        if consumer_position == con.last_consumer_position
            && producer_position > consumer_position
        {
            if now_ns.saturating_sub(con.time_of_last_consumer_update_ns) > self.unblock_timeout_ns
                && term::unblock(&self.log, consumer_position)
            {
                self.system.get(SystemCounter::UnblockedPublications).increment();
            }
        } else {
            con.time_of_last_consumer_update_ns = now_ns;
            con.last_consumer_position = consumer_position;
        }
    }

    fn clean_buffer_to(&self, position: i64) {
        let clean_position = self.clean_position.load(Ordering::Relaxed);
        let new_position = term::clean_to(&self.log, clean_position, position);
        if new_position != clean_position {
            self.clean_position.store(new_position, Ordering::Release);
        }
    }

    fn check_untethered(
        &self,
        con: &mut ConductorFields,
        now_ns: u64,
        notifications: &mut Vec<Notification>,
    ) -> Vec<SubscriberPosition> {
        let consumer_position = self.snd_pos.get_volatile();
        let window = self.term_window_length;
        let untethered_window_limit = (consumer_position - window) + (window >> 2);
        let join_position = consumer_position;

        let mut to_remove = Vec::new();
        for position in con.subscribable.iter_mut() {
            if position.is_tether {
                continue;
            }
            match position.state {
                TetherState::Active => {
                    if position.counter.get_volatile() > untethered_window_limit {
                        position.time_of_last_update_ns = now_ns;
                    } else if now_ns
                        >= position.time_of_last_update_ns + self.untethered_window_limit_timeout_ns
                    {
                        notifications.push(Notification::UnavailableImage {
                            correlation_id: self.registration_id,
                            subscription_registration_id: position.subscription_id,
                            stream_id: self.stream_id,
                        });
                        position.transition(TetherState::Linger, now_ns);
                    }
                }
                TetherState::Linger => {
                    if now_ns >= position.time_of_last_update_ns + self.untethered_linger_timeout_ns {
                        if position.is_rejoin {
                            position.transition(TetherState::Resting, now_ns);
                        } else {
                            to_remove.push(position.subscription_id);
                        }
                    }
                }
                TetherState::Resting => {
                    if now_ns >= position.time_of_last_update_ns + self.untethered_resting_timeout_ns {
                        position.counter.set_release(join_position);
                        notifications.push(Notification::AvailableImage {
                            correlation_id: self.registration_id,
                            subscription_registration_id: position.subscription_id,
                            session_id: self.session_id,
                            stream_id: self.stream_id,
                            join_position,
                            log_file: self.log_file.clone(),
                            source_identity: self.channel.clone(),
                        });
                        position.transition(TetherState::Active, now_ns);
                    }
                }
            }
        }

        let mut freed = Vec::new();
        for subscription_id in to_remove {
            if let Some(position) = con.subscribable.remove(subscription_id) {
                freed.push(position);
            }
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::HeapCounterTable;
    use crate::logbuffer::meta::{test_init, TERM_MIN_LENGTH};
    use crate::logbuffer::term::Appender;
    use crate::protocol::SetupFrame;

    const WINDOW: usize = TERM_MIN_LENGTH / 2;
    const MTU: usize = 1408;

    struct Fixture {
        _counters: HeapCounterTable,
        system: Arc<SystemCounters>,
        publication: NetworkPublication,
    }

    fn fixture() -> Fixture {
        let counters = HeapCounterTable::new(64, 0);
        let system = Arc::new(SystemCounters::allocate(&counters.table).unwrap());
        let log = RawLog::heap(test_init(TERM_MIN_LENGTH), TERM_MIN_LENGTH).unwrap();
        let bits = position_bits_to_shift(TERM_MIN_LENGTH);
        let flow_control = FlowControl::new(Some("max"), 2_000_000_000, bits, 0, None).unwrap();

        let pub_pos = counters.table.allocate(10, &[], "pub-pos", -1, -1).unwrap();
        let pub_lmt = counters.table.allocate(11, &[], "pub-lmt", -1, -1).unwrap();
        let snd_pos = counters.table.allocate(12, &[], "snd-pos", -1, -1).unwrap();
        let snd_lmt = counters.table.allocate(13, &[], "snd-lmt", -1, -1).unwrap();
        let snd_bpe = counters.table.allocate(14, &[], "snd-bpe", -1, -1).unwrap();

        let publication = NetworkPublication::new(
            NetworkPublicationParams {
                registration_id: 9,
                session_id: 7,
                stream_id: 1001,
                channel: "aqueduct:udp?endpoint=localhost:5555".to_string(),
                log_file: String::new(),
                is_exclusive: false,
                spies_simulate_connection: false,
                signal_eos: true,
                term_window_length: WINDOW,
                mtu_length: MTU,
                linger_timeout_ns: 1_000,
                unblock_timeout_ns: 1_000_000,
                untethered_window_limit_timeout_ns: 1_000,
                untethered_linger_timeout_ns: 1_000,
                untethered_resting_timeout_ns: 1_000,
                max_messages_per_send: 2,
                max_resend: 16,
            },
            log,
            pub_pos,
            pub_lmt,
            snd_pos,
            snd_lmt,
            snd_bpe,
            flow_control,
            Arc::clone(&system),
            0,
        );
        publication.inc_ref();
        Fixture { _counters: counters, system, publication }
    }

    fn receiver_sm(term_id: i32, term_offset: i32, window: i32) -> StatusMessage {
        StatusMessage {
            flags: 0,
            session_id: 7,
            stream_id: 1001,
            consumption_term_id: term_id,
            consumption_term_offset: term_offset,
            receiver_window: window,
            receiver_id: 77,
            group_tag: None,
        }
    }

    #[test]
    fn sends_setup_until_connected() {
        let f = fixture();
        let mut frames: Vec<Vec<u8>> = Vec::new();
        f.publication.send(SETUP_TIMEOUT_NS, &mut |bytes| frames.push(bytes.to_vec()));
        assert_eq!(frames.len(), 1);
        let setup = SetupFrame::decode(&frames[0]).unwrap();
        assert_eq!(setup.session_id, 7);
        assert_eq!(setup.term_length, TERM_MIN_LENGTH as i32);

        // Not repeated before the timeout.
        frames.clear();
        f.publication.send(SETUP_TIMEOUT_NS + 1, &mut |bytes| frames.push(bytes.to_vec()));
        assert!(frames.is_empty());

        // Connected: no more setup frames.
        f.publication.on_status_message(&receiver_sm(0, 0, WINDOW as i32), SETUP_TIMEOUT_NS + 2);
        frames.clear();
        f.publication.send(3 * SETUP_TIMEOUT_NS, &mut |bytes| frames.push(bytes.to_vec()));
        // Only a heartbeat may appear, never a setup.
        for frame_bytes in &frames {
            assert_ne!(frame_bytes[6], frame::HDR_TYPE_SETUP as u8);
        }
    }

    #[test]
    fn sends_committed_frames_within_sender_limit() {
        let f = fixture();
        f.publication.on_status_message(&receiver_sm(0, 0, 4096), 1);
        assert_eq!(f.publication.snd_lmt.get_volatile(), 4096);

        let appender = Appender::new(f.publication.raw_log(), false);
        for _ in 0..4 {
            appender.append(&[5u8; 992], i64::MAX).unwrap().unwrap();
        }

        let mut frames: Vec<Vec<u8>> = Vec::new();
        f.publication.send(2, &mut |bytes| frames.push(bytes.to_vec()));
        // 4 KiB of committed data fits two MTU-bounded datagrams (1376 each).
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), 1024);
        assert_eq!(f.publication.sender_position(), 2048);

        // Next cycle sends the rest.
        frames.clear();
        f.publication.send(3, &mut |bytes| frames.push(bytes.to_vec()));
        assert_eq!(f.publication.sender_position(), 4096);

        // Limit reached: back-pressure is counted, nothing more flows.
        appender.append(&[5u8; 992], i64::MAX).unwrap().unwrap();
        frames.clear();
        f.publication.send(4, &mut |bytes| frames.push(bytes.to_vec()));
        assert!(frames.is_empty());
        assert_eq!(f.publication.snd_bpe.get(), 1);
    }

    #[test]
    fn heartbeats_flow_when_idle() {
        let f = fixture();
        f.publication.on_status_message(&receiver_sm(0, 0, WINDOW as i32), 1);

        let mut frames: Vec<Vec<u8>> = Vec::new();
        f.publication.send(HEARTBEAT_TIMEOUT_NS + 2, &mut |bytes| frames.push(bytes.to_vec()));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), HEADER_LENGTH);
        let frame_length = i32::from_le_bytes(frames[0][0..4].try_into().unwrap());
        assert_eq!(frame_length, 0);
        assert_eq!(f.system.get(SystemCounter::HeartbeatsSent).get(), 1);

        // EOS heartbeats carry the end-of-stream flag.
        f.publication.dec_ref();
        frames.clear();
        f.publication.send(2 * HEARTBEAT_TIMEOUT_NS + 4, &mut |bytes| frames.push(bytes.to_vec()));
        assert_eq!(frames.len(), 1);
        assert_ne!(frames[0][frame::FLAGS_OFFSET] & frame::EOS_FLAG, 0);
    }

    #[test]
    fn nak_triggers_byte_identical_retransmit() {
        let f = fixture();
        f.publication.on_status_message(&receiver_sm(0, 0, WINDOW as i32), 1);

        let appender = Appender::new(f.publication.raw_log(), false);
        let payload: Vec<u8> = (0..992u32).map(|i| i as u8).collect();
        appender.append(&payload, i64::MAX).unwrap().unwrap();

        let mut originals: Vec<Vec<u8>> = Vec::new();
        f.publication.send(2, &mut |bytes| originals.push(bytes.to_vec()));
        assert_eq!(originals.len(), 1);

        f.publication.on_nak(
            &NakFrame { session_id: 7, stream_id: 1001, term_id: 0, term_offset: 0, length: 1024 },
            3,
        );
        let mut retransmits: Vec<Vec<u8>> = Vec::new();
        f.publication.send(4, &mut |bytes| retransmits.push(bytes.to_vec()));
        assert_eq!(retransmits.len(), 1);
        assert_eq!(retransmits[0], originals[0]);
        assert_eq!(f.system.get(SystemCounter::RetransmitsSent).get(), 1);
        assert_eq!(f.system.get(SystemCounter::RetransmittedBytes).get(), 1024);
        assert_eq!(f.system.get(SystemCounter::NakMessagesReceived).get(), 1);
    }

    #[test]
    fn overlapping_naks_are_suppressed() {
        let mut handler = RetransmitHandler::new(16, 0, 1_000);
        assert!(handler.on_nak(0, 0, 1024, 0));
        assert!(!handler.on_nak(0, 512, 1024, 0)); // overlaps
        assert!(handler.on_nak(0, 2048, 512, 0)); // disjoint

        let due = handler.poll(0);
        assert_eq!(due.len(), 2);
        // While lingering, the same range stays suppressed.
        assert!(!handler.on_nak(0, 0, 256, 500));
        // After the linger expires it may be requested again.
        handler.poll(2_000);
        assert!(handler.on_nak(0, 0, 256, 2_001));
    }

    #[test]
    fn retransmit_count_is_bounded() {
        let mut handler = RetransmitHandler::new(2, 0, 1_000);
        assert!(handler.on_nak(0, 0, 64, 0));
        assert!(handler.on_nak(0, 128, 64, 0));
        assert!(!handler.on_nak(0, 256, 64, 0));
    }

    #[test]
    fn spies_gate_publisher_limit_but_not_flow_control() {
        let f = fixture();
        let spy_position = f._counters.table.allocate(30, &[], "spy", -1, -1).unwrap();
        spy_position.set_release(0);
        f.publication
            .add_spy_subscriber(SubscriberPosition::new(3, spy_position, true, false, 0));

        // Without ssc a spy alone does not open the publisher window.
        assert_eq!(f.publication.update_publisher_position_and_limit(), 0);
        assert!(!f.publication.is_connected());

        // A network receiver opens it, and the spy's lag bounds the limit.
        f.publication.on_status_message(&receiver_sm(0, 8192, 4096), 1);
        assert_eq!(f.publication.update_publisher_position_and_limit(), 1);
        assert_eq!(
            f.publication.pub_lmt.get_volatile(),
            WINDOW as i64 // min(spy=0, snd_pos=0) + window
        );
        // The sender limit follows the receiver alone, ignoring the spy.
        assert_eq!(f.publication.snd_lmt.get_volatile(), 8192 + 4096);
    }

    #[test]
    fn drain_completes_after_eos_ack() {
        let f = fixture();
        f.publication.on_status_message(&receiver_sm(0, 0, WINDOW as i32), 1);

        let appender = Appender::new(f.publication.raw_log(), false);
        appender.append(&[1u8; 16], i64::MAX).unwrap().unwrap();
        let mut sink = |_: &[u8]| {};
        f.publication.send(2, &mut sink);
        assert_eq!(f.publication.sender_position(), 48);

        f.publication.dec_ref();
        assert_eq!(f.publication.state(), PublicationState::Draining);

        let mut notifications = Vec::new();
        // Receiver has not acknowledged the EOS position yet.
        f.publication.on_time_event(3, &mut notifications);
        assert_eq!(f.publication.state(), PublicationState::Draining);

        f.publication.on_status_message(&receiver_sm(0, 48, WINDOW as i32), 4);
        f.publication.on_time_event(5, &mut notifications);
        assert_eq!(f.publication.state(), PublicationState::Linger);

        f.publication.sender_release();
        f.publication.on_time_event(5 + 1_001, &mut notifications);
        assert_eq!(f.publication.state(), PublicationState::Done);
    }
}
