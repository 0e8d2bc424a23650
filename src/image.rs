//! Receive-side image of one sender's stream on one channel.
//!
//! The receiver thread inserts packets, rebuilds terms in order, advances the
//! high-water mark and receiver position, schedules NAKs for gaps and emits
//! status messages. The conductor thread owns the lifecycle, subscriber set
//! and untethered sweep. The two field groups live behind their own locks,
//! each only ever taken by its owning thread; everything crossing between
//! them is an atomic.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::counters::{Counter, SystemCounter, SystemCounters};
use crate::error::ErrorCode;
use crate::event::Notification;
use crate::logbuffer::frame::{self, HEADER_LENGTH};
use crate::logbuffer::meta::RawLog;
use crate::logbuffer::position::{
    compute_position, compute_term_id_from_position, compute_term_offset_from_position,
    index_by_position, position_bits_to_shift,
};
use crate::logbuffer::term::{self, Gap};
use crate::loss::{EntryHandle, LossReport};
use crate::protocol::{ErrorFrame, NakFrame, StatusMessage};
use crate::subscribable::{Subscribable, SubscriberPosition, TetherState};

/// Delay policy for NAK emission on gap detection.
#[derive(Clone, Copy, Debug)]
pub enum FeedbackDelayGenerator {
    /// NAK on the next poll; used for low-latency unicast and tests.
    Immediate,
    /// Fixed first delay with a longer retry delay.
    Static { delay_ns: u64, retry_ns: u64 },
    /// Doubling backoff from `max / 8` up to `max`, for multicast feedback
    /// suppression.
    Backoff { max_backoff_ns: u64 },
}

impl FeedbackDelayGenerator {
    pub fn initial_delay_ns(&self) -> u64 {
        match self {
            FeedbackDelayGenerator::Immediate => 0,
            FeedbackDelayGenerator::Static { delay_ns, .. } => *delay_ns,
            FeedbackDelayGenerator::Backoff { max_backoff_ns } => max_backoff_ns / 8,
        }
    }

    pub fn retry_delay_ns(&self, retries: u32) -> u64 {
        match self {
            FeedbackDelayGenerator::Immediate => 0,
            FeedbackDelayGenerator::Static { retry_ns, .. } => *retry_ns,
            FeedbackDelayGenerator::Backoff { max_backoff_ns } => {
                let base = max_backoff_ns / 8;
                base.saturating_mul(1u64 << std::cmp::min(retries, 8))
                    .min(*max_backoff_ns)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageState {
    Active,
    Draining,
    Linger,
    Done,
}

#[derive(Clone, Debug)]
pub struct ImageParams {
    pub correlation_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub initial_term_id: i32,
    pub active_term_id: i32,
    pub initial_term_offset: i32,
    pub source_identity: String,
    pub channel: String,
    pub log_file: String,
    pub is_reliable: bool,
    pub group_tag: Option<i64>,
    pub window_length: usize,
    pub image_liveness_timeout_ns: u64,
    pub status_message_timeout_ns: u64,
    pub untethered_window_limit_timeout_ns: u64,
    pub untethered_linger_timeout_ns: u64,
    pub untethered_resting_timeout_ns: u64,
}

struct NakState {
    gap: Gap,
    deadline_ns: u64,
    retries: u32,
}

struct ReceiverFields {
    rebuild_position: i64,
    last_sm_position: i64,
    sm_deadline_ns: u64,
    force_status_message: bool,
    nak: Option<NakState>,
    /// `(term_id, end_offset)` of the furthest loss extent already reported.
    reported_loss: Option<(i32, i32)>,
    report_entry: Option<EntryHandle>,
    pending_error: Option<ErrorFrame>,
}

struct ConductorFields {
    state: ImageState,
    subscribable: Subscribable,
    time_of_last_state_change_ns: u64,
    in_cooldown: bool,
    cooldown_deadline_ns: u64,
}

pub struct PublicationImage {
    correlation_id: i64,
    session_id: i32,
    stream_id: i32,
    initial_term_id: i32,
    position_bits_to_shift: u32,
    term_length: usize,
    window_length: usize,
    sm_trip_gain: i64,
    is_reliable: bool,
    group_tag: Option<i64>,
    source_identity: String,
    channel: String,
    log_file: String,
    image_liveness_timeout_ns: u64,
    status_message_timeout_ns: u64,
    untethered_window_limit_timeout_ns: u64,
    untethered_linger_timeout_ns: u64,
    untethered_resting_timeout_ns: u64,

    log: RawLog,
    hwm_position: Counter,
    rcv_position: Counter,
    rcv_naks_sent: Counter,
    system: Arc<SystemCounters>,
    delay_generator: FeedbackDelayGenerator,
    loss_report: Option<Arc<Mutex<LossReport>>>,

    begin_loss_change: AtomicI64,
    end_loss_change: AtomicI64,
    loss_term_id: AtomicI32,
    loss_term_offset: AtomicI32,
    loss_length: AtomicI32,

    is_end_of_stream: AtomicBool,
    end_of_stream_position: AtomicI64,
    time_of_last_packet_ns: AtomicU64,

    receiver: Mutex<ReceiverFields>,
    conductor: Mutex<ConductorFields>,
}

impl PublicationImage {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: ImageParams,
        log: RawLog,
        hwm_position: Counter,
        rcv_position: Counter,
        rcv_naks_sent: Counter,
        system: Arc<SystemCounters>,
        delay_generator: FeedbackDelayGenerator,
        loss_report: Option<Arc<Mutex<LossReport>>>,
        now_ns: u64,
    ) -> Self {
        let term_length = log.term_length();
        let bits = position_bits_to_shift(term_length);
        let initial_position = compute_position(
            params.active_term_id,
            params.initial_term_offset,
            bits,
            params.initial_term_id,
        );
        hwm_position.set_release(initial_position);
        rcv_position.set_release(initial_position);

        Self {
            correlation_id: params.correlation_id,
            session_id: params.session_id,
            stream_id: params.stream_id,
            initial_term_id: params.initial_term_id,
            position_bits_to_shift: bits,
            term_length,
            window_length: params.window_length,
            sm_trip_gain: (params.window_length / 4) as i64,
            is_reliable: params.is_reliable,
            group_tag: params.group_tag,
            source_identity: params.source_identity,
            channel: params.channel,
            log_file: params.log_file,
            image_liveness_timeout_ns: params.image_liveness_timeout_ns,
            status_message_timeout_ns: params.status_message_timeout_ns,
            untethered_window_limit_timeout_ns: params.untethered_window_limit_timeout_ns,
            untethered_linger_timeout_ns: params.untethered_linger_timeout_ns,
            untethered_resting_timeout_ns: params.untethered_resting_timeout_ns,
            log,
            hwm_position,
            rcv_position,
            rcv_naks_sent,
            system,
            delay_generator,
            loss_report,
            begin_loss_change: AtomicI64::new(0),
            end_loss_change: AtomicI64::new(0),
            loss_term_id: AtomicI32::new(0),
            loss_term_offset: AtomicI32::new(0),
            loss_length: AtomicI32::new(0),
            is_end_of_stream: AtomicBool::new(false),
            end_of_stream_position: AtomicI64::new(i64::MAX),
            time_of_last_packet_ns: AtomicU64::new(now_ns),
            receiver: Mutex::new(ReceiverFields {
                rebuild_position: initial_position,
                last_sm_position: initial_position,
                sm_deadline_ns: now_ns,
                force_status_message: true,
                nak: None,
                reported_loss: None,
                report_entry: None,
                pending_error: None,
            }),
            conductor: Mutex::new(ConductorFields {
                state: ImageState::Active,
                subscribable: Subscribable::default(),
                time_of_last_state_change_ns: now_ns,
                in_cooldown: false,
                cooldown_deadline_ns: 0,
            }),
        }
    }

    pub fn correlation_id(&self) -> i64 {
        self.correlation_id
    }

    pub fn session_id(&self) -> i32 {
        self.session_id
    }

    pub fn stream_id(&self) -> i32 {
        self.stream_id
    }

    pub fn source_identity(&self) -> &str {
        &self.source_identity
    }

    pub fn log_file(&self) -> &str {
        &self.log_file
    }

    pub fn hwm_position(&self) -> i64 {
        self.hwm_position.get_volatile()
    }

    pub fn rcv_position(&self) -> i64 {
        self.rcv_position.get_volatile()
    }

    pub fn is_end_of_stream(&self) -> bool {
        self.is_end_of_stream.load(Ordering::Acquire)
    }

    /// Position at which the sender declared end of stream, or `i64::MAX`.
    pub fn end_of_stream_position(&self) -> i64 {
        self.end_of_stream_position.load(Ordering::Acquire)
    }

    pub fn raw_log(&self) -> &RawLog {
        &self.log
    }

    /// Inserts one packet (data frames or a heartbeat) received from the
    /// source. Returns the bytes accepted.
    pub fn insert_packet(
        &self,
        term_id: i32,
        term_offset: i32,
        packet: &[u8],
        now_ns: u64,
    ) -> usize {
        if packet.len() < HEADER_LENGTH {
            self.system.get(SystemCounter::InvalidPackets).increment();
            return 0;
        }
        let frame_length =
            i32::from_le_bytes(packet[0..4].try_into().expect("slice length"));
        let is_heartbeat = packet.len() == HEADER_LENGTH && frame_length == 0;
        let packet_position = compute_position(
            term_id,
            term_offset,
            self.position_bits_to_shift,
            self.initial_term_id,
        );
        let proposed_position = if is_heartbeat {
            packet_position
        } else {
            packet_position + packet.len() as i64
        };

        let mut rcv = self.receiver.lock().expect("image receiver lock");
        if packet_position < rcv.last_sm_position {
            self.system.get(SystemCounter::FlowControlUnderRuns).increment();
            return 0;
        }
        if proposed_position > rcv.last_sm_position + self.window_length as i64 {
            self.system.get(SystemCounter::FlowControlOverRuns).increment();
            return 0;
        }

        self.time_of_last_packet_ns.store(now_ns, Ordering::Release);

        if is_heartbeat {
            let flags = packet[frame::FLAGS_OFFSET];
            if flags & frame::EOS_FLAG != 0 && !self.is_end_of_stream.load(Ordering::Relaxed) {
                self.end_of_stream_position.store(packet_position, Ordering::Release);
                self.is_end_of_stream.store(true, Ordering::Release);
            }
            self.system.get(SystemCounter::HeartbeatsReceived).increment();
            self.hwm_position.propose_max(packet_position);
        } else {
            let index = index_by_position(packet_position, self.position_bits_to_shift);
            term::insert_into_term(self.log.term(index), term_offset as usize, packet);
            self.hwm_position.propose_max(proposed_position);
        }

        self.rebuild(&mut rcv, now_ns);
        packet.len()
    }

    /// Advances the receiver position over contiguous committed frames and
    /// (re)schedules loss feedback for the first gap.
    fn rebuild(&self, rcv: &mut ReceiverFields, now_ns: u64) {
        let term_length = self.term_length as i64;
        loop {
            let hwm = self.hwm_position.get_volatile();
            if rcv.rebuild_position >= hwm {
                rcv.nak = None;
                break;
            }

            let term_begin = rcv.rebuild_position & !(term_length - 1);
            let rebuild_offset = (rcv.rebuild_position - term_begin) as usize;
            let limit_offset =
                std::cmp::min(self.term_length, (hwm - term_begin) as usize);
            let term_id = compute_term_id_from_position(
                rcv.rebuild_position,
                self.position_bits_to_shift,
                self.initial_term_id,
            );
            let index = index_by_position(rcv.rebuild_position, self.position_bits_to_shift);

            let (new_offset, gap) = term::scan_for_gap(
                self.log.term(index),
                term_id,
                rebuild_offset,
                limit_offset,
            );
            rcv.rebuild_position = term_begin + new_offset as i64;
            self.rcv_position.set_release(rcv.rebuild_position);

            match gap {
                Some(gap) => {
                    let fresh = match &rcv.nak {
                        Some(state) => state.gap != gap,
                        None => true,
                    };
                    if fresh {
                        rcv.nak = Some(NakState {
                            gap,
                            deadline_ns: now_ns + self.delay_generator.initial_delay_ns(),
                            retries: 0,
                        });
                    }
                    break;
                }
                None if new_offset == self.term_length => continue,
                None => {
                    rcv.nak = None;
                    break;
                }
            }
        }
    }

    /// Emits a NAK for the tracked gap once its delay expires; on unreliable
    /// subscriptions the gap is padded over instead.
    pub fn poll_nak(&self, now_ns: u64, now_ms: i64) -> Option<NakFrame> {
        let mut rcv = self.receiver.lock().expect("image receiver lock");
        let gap = match &rcv.nak {
            Some(state) if now_ns >= state.deadline_ns => state.gap,
            _ => return None,
        };

        self.track_loss(&mut rcv, gap.term_id, gap.term_offset, gap.length, now_ms);

        if !self.is_reliable {
            self.fill_gap(&gap);
            self.system.get(SystemCounter::LossGapFills).increment();
            rcv.nak = None;
            self.rebuild(&mut rcv, now_ns);
            return None;
        }

        if let Some(state) = rcv.nak.as_mut() {
            state.retries += 1;
            state.deadline_ns = now_ns + self.delay_generator.retry_delay_ns(state.retries);
        }
        self.rcv_naks_sent.increment();
        self.system.get(SystemCounter::NakMessagesSent).increment();
        log::debug!(
            "nak session={} stream={} term={} offset={} length={}",
            self.session_id,
            self.stream_id,
            gap.term_id,
            gap.term_offset,
            gap.length
        );
        Some(NakFrame {
            session_id: self.session_id,
            stream_id: self.stream_id,
            term_id: gap.term_id,
            term_offset: gap.term_offset,
            length: gap.length,
        })
    }

    fn fill_gap(&self, gap: &Gap) {
        let position = compute_position(
            gap.term_id,
            gap.term_offset,
            self.position_bits_to_shift,
            self.initial_term_id,
        );
        let index = index_by_position(position, self.position_bits_to_shift);
        let term = self.log.term(index);
        frame::write_header_without_length(
            term,
            gap.term_offset as usize,
            frame::HDR_TYPE_PAD,
            frame::UNFRAGMENTED,
            gap.term_offset,
            self.session_id,
            self.stream_id,
            gap.term_id,
        );
        frame::frame_length_ordered(term, gap.term_offset as usize, gap.length);
    }

    /// Records a detected gap for concurrent observers and the loss report.
    pub fn on_gap_detected(&self, term_id: i32, term_offset: i32, length: i32, now_ms: i64) {
        let mut rcv = self.receiver.lock().expect("image receiver lock");
        self.track_loss(&mut rcv, term_id, term_offset, length, now_ms);
    }

    fn track_loss(
        &self,
        rcv: &mut ReceiverFields,
        term_id: i32,
        term_offset: i32,
        length: i32,
        now_ms: i64,
    ) {
        let change_number = self.begin_loss_change.load(Ordering::Relaxed) + 1;
        self.begin_loss_change.store(change_number, Ordering::Release);
        self.loss_term_id.store(term_id, Ordering::Relaxed);
        self.loss_term_offset.store(term_offset, Ordering::Relaxed);
        self.loss_length.store(length, Ordering::Relaxed);
        self.end_loss_change.store(change_number, Ordering::Release);

        let new_end = term_offset + length;
        let bytes_lost = match rcv.reported_loss {
            None => length,
            Some((reported_term, _)) if reported_term != term_id => length,
            Some((_, reported_end)) if term_offset >= reported_end => length,
            Some((_, reported_end)) if new_end > reported_end => new_end - reported_end,
            Some(_) => 0,
        };
        if bytes_lost <= 0 {
            return;
        }
        rcv.reported_loss = Some((term_id, new_end));

        if let Some(report) = &self.loss_report {
            let mut report = report.lock().expect("loss report lock");
            match rcv.report_entry {
                Some(entry) => report.record_observation(entry, bytes_lost as i64, now_ms),
                None => {
                    rcv.report_entry = report.create_entry(
                        bytes_lost as i64,
                        now_ms,
                        self.session_id,
                        self.stream_id,
                        &self.channel,
                        &self.source_identity,
                    );
                }
            }
        }
    }

    /// Consistent snapshot of the tracked loss, for observers outside the
    /// receiver thread.
    pub fn loss_snapshot(&self) -> (i64, i32, i32, i32) {
        loop {
            let end = self.end_loss_change.load(Ordering::Acquire);
            let term_id = self.loss_term_id.load(Ordering::Relaxed);
            let term_offset = self.loss_term_offset.load(Ordering::Relaxed);
            let length = self.loss_length.load(Ordering::Relaxed);
            let begin = self.begin_loss_change.load(Ordering::Acquire);
            if begin == end {
                return (end, term_id, term_offset, length);
            }
            std::hint::spin_loop();
        }
    }

    /// Emits a status message when the deadline passes or the consumer has
    /// advanced a trip gain beyond the last report.
    pub fn poll_status_message(&self, now_ns: u64) -> Option<StatusMessage> {
        let mut rcv = self.receiver.lock().expect("image receiver lock");
        let position = rcv.rebuild_position;
        let due = rcv.force_status_message
            || now_ns >= rcv.sm_deadline_ns
            || position >= rcv.last_sm_position + self.sm_trip_gain;
        if !due {
            return None;
        }
        rcv.force_status_message = false;
        rcv.last_sm_position = position;
        rcv.sm_deadline_ns = now_ns + self.status_message_timeout_ns;
        self.system.get(SystemCounter::StatusMessagesSent).increment();
        Some(StatusMessage {
            flags: 0,
            session_id: self.session_id,
            stream_id: self.stream_id,
            consumption_term_id: compute_term_id_from_position(
                position,
                self.position_bits_to_shift,
                self.initial_term_id,
            ),
            consumption_term_offset: compute_term_offset_from_position(
                position,
                self.position_bits_to_shift,
            ),
            receiver_window: self.window_length as i32,
            receiver_id: self.correlation_id,
            group_tag: self.group_tag,
        })
    }

    /// Takes the pending error frame raised by a rejection, if any.
    pub fn take_pending_error(&self) -> Option<ErrorFrame> {
        self.receiver.lock().expect("image receiver lock").pending_error.take()
    }

    // --- conductor side ---

    pub fn add_subscriber(&self, position: SubscriberPosition) {
        let mut con = self.conductor.lock().expect("image conductor lock");
        con.subscribable.add(position);
        self.log.meta().set_is_connected(true);
    }

    pub fn remove_subscriber(&self, subscription_id: i64) -> Option<SubscriberPosition> {
        let mut con = self.conductor.lock().expect("image conductor lock");
        let removed = con.subscribable.remove(subscription_id);
        if con.subscribable.is_empty() {
            self.log.meta().set_is_connected(false);
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.conductor.lock().expect("image conductor lock").subscribable.len()
    }

    pub fn state(&self) -> ImageState {
        self.conductor.lock().expect("image conductor lock").state
    }

    pub fn is_accepting_subscriptions(&self) -> bool {
        let con = self.conductor.lock().expect("image conductor lock");
        !con.in_cooldown && con.state == ImageState::Active
    }

    pub fn has_reached_end_of_life(&self) -> bool {
        self.conductor.lock().expect("image conductor lock").state == ImageState::Done
    }

    pub fn join_position(&self) -> i64 {
        self.rcv_position.get_volatile()
    }

    /// Tears the image down on client request and refuses new subscribers
    /// until the liveness timeout passes. Returns the freed positions.
    pub fn reject(
        &self,
        reason: &str,
        now_ns: u64,
        notifications: &mut Vec<Notification>,
    ) -> Vec<SubscriberPosition> {
        let mut con = self.conductor.lock().expect("image conductor lock");
        let mut freed = Vec::new();
        if !con.in_cooldown {
            for position in con.subscribable.iter() {
                notifications.push(Notification::UnavailableImage {
                    correlation_id: self.correlation_id,
                    subscription_registration_id: position.subscription_id,
                    stream_id: self.stream_id,
                });
            }
            freed = con.subscribable.clear();
            self.log.meta().set_is_connected(false);
            con.in_cooldown = true;
            con.state = ImageState::Linger;
            con.time_of_last_state_change_ns = now_ns;
            self.system.get(SystemCounter::ImagesRejected).increment();

            let mut rcv = self.receiver.lock().expect("image receiver lock");
            rcv.pending_error = Some(ErrorFrame {
                session_id: self.session_id,
                stream_id: self.stream_id,
                error_code: ErrorCode::ImageRejected as i32,
                message: reason.to_string(),
            });
            log::warn!(
                "image rejected session={} stream={} reason={reason}",
                self.session_id,
                self.stream_id
            );
        }
        con.cooldown_deadline_ns = now_ns + self.image_liveness_timeout_ns;
        freed
    }

    /// One conductor tick. Returns positions freed by untethered removal.
    pub fn on_time_event(
        &self,
        now_ns: u64,
        notifications: &mut Vec<Notification>,
    ) -> Vec<SubscriberPosition> {
        let mut con = self.conductor.lock().expect("image conductor lock");
        let mut freed = Vec::new();
        match con.state {
            ImageState::Active => {
                freed = self.check_untethered(&mut con, now_ns, notifications);
                let last_packet = self.time_of_last_packet_ns.load(Ordering::Acquire);
                if now_ns.saturating_sub(last_packet) > self.image_liveness_timeout_ns {
                    con.state = ImageState::Draining;
                    con.time_of_last_state_change_ns = now_ns;
                    log::debug!(
                        "image draining session={} stream={}",
                        self.session_id,
                        self.stream_id
                    );
                }
            }
            ImageState::Draining => {
                let delivered = self.rcv_position.get_volatile();
                if con.subscribable.all_caught_up_to(delivered) {
                    for position in con.subscribable.iter() {
                        notifications.push(Notification::UnavailableImage {
                            correlation_id: self.correlation_id,
                            subscription_registration_id: position.subscription_id,
                            stream_id: self.stream_id,
                        });
                    }
                    self.log.meta().set_is_connected(false);
                    con.state = ImageState::Linger;
                    con.time_of_last_state_change_ns = now_ns;
                }
            }
            ImageState::Linger => {
                let cooldown_holds = con.in_cooldown && now_ns < con.cooldown_deadline_ns;
                if !cooldown_holds
                    && now_ns.saturating_sub(con.time_of_last_state_change_ns)
                        > self.image_liveness_timeout_ns
                {
                    freed = con.subscribable.clear();
                    con.state = ImageState::Done;
                }
            }
            ImageState::Done => {}
        }
        freed
    }

    fn check_untethered(
        &self,
        con: &mut ConductorFields,
        now_ns: u64,
        notifications: &mut Vec<Notification>,
    ) -> Vec<SubscriberPosition> {
        let consumer_position = self.rcv_position.get_volatile();
        let window = self.window_length as i64;
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
                            correlation_id: self.correlation_id,
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
                            correlation_id: self.correlation_id,
                            subscription_registration_id: position.subscription_id,
                            session_id: self.session_id,
                            stream_id: self.stream_id,
                            join_position,
                            log_file: self.log_file.clone(),
                            source_identity: self.source_identity.clone(),
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
    use crate::buffer::AlignedBuffer;
    use crate::counters::HeapCounterTable;
    use crate::logbuffer::frame::{FrameHeader, CURRENT_VERSION, UNFRAGMENTED};
    use crate::logbuffer::meta::{test_init, TERM_MIN_LENGTH};
    use crate::logbuffer::position::position_bits_to_shift;

    const TERM_LENGTH: usize = TERM_MIN_LENGTH;
    const SESSION_ID: i32 = 888;
    const STREAM_ID: i32 = 101010;
    const INITIAL_TERM_ID: i32 = -444666;
    const ACTIVE_TERM_ID: i32 = INITIAL_TERM_ID + 111;
    const TERM_OFFSET: i32 = (TERM_LENGTH - TERM_LENGTH / 4) as i32;
    const WINDOW: usize = 128 * 1024;

    struct Fixture {
        _counters: HeapCounterTable,
        system: Arc<SystemCounters>,
        image: PublicationImage,
        _loss_buffer: AlignedBuffer,
    }

    fn fixture(delay: FeedbackDelayGenerator, reliable: bool) -> Fixture {
        let counters = HeapCounterTable::new(64, 0);
        let system = Arc::new(SystemCounters::allocate(&counters.table).unwrap());
        let hwm = counters.table.allocate(20, &[], "rcv-hwm", -1, -1).unwrap();
        let rcv = counters.table.allocate(21, &[], "rcv-pos", -1, -1).unwrap();
        let naks = counters.table.allocate(22, &[], "rcv-naks", -1, -1).unwrap();

        let mut init = test_init(TERM_LENGTH);
        init.session_id = SESSION_ID;
        init.stream_id = STREAM_ID;
        init.initial_term_id = INITIAL_TERM_ID;
        init.starting_term_id = ACTIVE_TERM_ID;
        init.starting_term_offset = TERM_OFFSET;
        let log = RawLog::heap(init, TERM_LENGTH).unwrap();

        let loss_buffer = AlignedBuffer::new(4096);
        let loss_report = Arc::new(Mutex::new(LossReport::new(loss_buffer.buffer())));

        let image = PublicationImage::new(
            ImageParams {
                correlation_id: 42,
                session_id: SESSION_ID,
                stream_id: STREAM_ID,
                initial_term_id: INITIAL_TERM_ID,
                active_term_id: ACTIVE_TERM_ID,
                initial_term_offset: TERM_OFFSET,
                source_identity: "127.0.0.1:5555".to_string(),
                channel: "aqueduct:udp?endpoint=localhost:5555".to_string(),
                log_file: String::new(),
                is_reliable: reliable,
                group_tag: None,
                window_length: WINDOW,
                image_liveness_timeout_ns: 10_000_000_000,
                status_message_timeout_ns: 150_000_000,
                untethered_window_limit_timeout_ns: 1_000_000_000,
                untethered_linger_timeout_ns: 150_000_000,
                untethered_resting_timeout_ns: 800_000_000,
            },
            log,
            hwm,
            rcv,
            naks,
            Arc::clone(&system),
            delay,
            Some(loss_report),
            0,
        );
        Fixture { _counters: counters, system, image, _loss_buffer: loss_buffer }
    }

    fn data_frame(term_id: i32, term_offset: i32, payload_len: usize) -> Vec<u8> {
        let frame_length = (HEADER_LENGTH + payload_len) as i32;
        let mut packet = vec![0u8; crate::buffer::align_up(frame_length as usize, 32)];
        let header = FrameHeader {
            frame_length,
            version: CURRENT_VERSION,
            flags: UNFRAGMENTED,
            frame_type: frame::HDR_TYPE_DATA,
            term_offset,
            session_id: SESSION_ID,
            stream_id: STREAM_ID,
            term_id,
            reserved_value: 0,
        };
        packet[..HEADER_LENGTH].copy_from_slice(&header.to_bytes());
        for (i, byte) in packet[HEADER_LENGTH..].iter_mut().enumerate() {
            *byte = i as u8;
        }
        packet
    }

    fn heartbeat_frame(term_id: i32, term_offset: i32, flags: u8) -> Vec<u8> {
        let mut packet = vec![0u8; HEADER_LENGTH];
        packet[4] = CURRENT_VERSION;
        packet[5] = flags;
        packet[6..8].copy_from_slice(&frame::HDR_TYPE_DATA.to_le_bytes());
        packet[8..12].copy_from_slice(&term_offset.to_le_bytes());
        packet[20..24].copy_from_slice(&term_id.to_le_bytes());
        packet
    }

    fn position_of(term_id: i32, term_offset: i32) -> i64 {
        compute_position(
            term_id,
            term_offset,
            position_bits_to_shift(TERM_LENGTH),
            INITIAL_TERM_ID,
        )
    }

    #[test]
    fn insert_advances_hwm_by_packet_length() {
        let f = fixture(FeedbackDelayGenerator::Immediate, true);
        let packet = data_frame(ACTIVE_TERM_ID, TERM_OFFSET, 480);
        let bytes = f.image.insert_packet(ACTIVE_TERM_ID, TERM_OFFSET, &packet, 1);
        assert_eq!(bytes, packet.len());
        assert_eq!(
            f.image.hwm_position(),
            position_of(ACTIVE_TERM_ID, TERM_OFFSET) + packet.len() as i64
        );
        assert_eq!(
            f.image.rcv_position(),
            position_of(ACTIVE_TERM_ID, TERM_OFFSET) + packet.len() as i64
        );
    }

    #[test]
    fn heartbeat_advances_hwm_and_counts() {
        let f = fixture(FeedbackDelayGenerator::Immediate, true);
        let data = data_frame(ACTIVE_TERM_ID, TERM_OFFSET, 512 - HEADER_LENGTH);
        f.image.insert_packet(ACTIVE_TERM_ID, TERM_OFFSET, &data, 1);

        let hb_offset = TERM_OFFSET + 512 + 512;
        let heartbeat = heartbeat_frame(ACTIVE_TERM_ID, hb_offset, 0);
        let bytes = f.image.insert_packet(ACTIVE_TERM_ID, hb_offset, &heartbeat, 2);
        assert_eq!(bytes, HEADER_LENGTH);
        assert_eq!(f.image.hwm_position(), position_of(ACTIVE_TERM_ID, hb_offset));
        assert_eq!(f.system.get(SystemCounter::HeartbeatsReceived).get(), 1);
    }

    #[test]
    fn eos_heartbeat_latches_end_of_stream() {
        let f = fixture(FeedbackDelayGenerator::Immediate, true);
        let heartbeat = heartbeat_frame(ACTIVE_TERM_ID, TERM_OFFSET, frame::EOS_FLAG);
        f.image.insert_packet(ACTIVE_TERM_ID, TERM_OFFSET, &heartbeat, 1);
        assert!(f.image.is_end_of_stream());
    }

    #[test]
    fn packet_beyond_window_is_dropped() {
        let f = fixture(FeedbackDelayGenerator::Immediate, true);
        let far_offset = TERM_OFFSET; // window is measured from the SM position
        let packet = data_frame(ACTIVE_TERM_ID + 3, far_offset, 64);
        let bytes = f.image.insert_packet(ACTIVE_TERM_ID + 3, far_offset, &packet, 1);
        assert_eq!(bytes, 0);
        assert_eq!(f.system.get(SystemCounter::FlowControlOverRuns).get(), 1);
    }

    #[test]
    fn gap_produces_nak_after_delay() {
        let f = fixture(
            FeedbackDelayGenerator::Static { delay_ns: 100_000, retry_ns: 200_000 },
            true,
        );
        // Committed frame one slot past the expected offset leaves a gap.
        let gap_length = 1024;
        let ahead = data_frame(ACTIVE_TERM_ID, TERM_OFFSET + gap_length, 96);
        f.image.insert_packet(ACTIVE_TERM_ID, TERM_OFFSET + gap_length, &ahead, 1);

        assert!(f.image.poll_nak(50_000, 0).is_none());
        let nak = f.image.poll_nak(100_001, 0).unwrap();
        assert_eq!(nak.term_id, ACTIVE_TERM_ID);
        assert_eq!(nak.term_offset, TERM_OFFSET);
        assert_eq!(nak.length, gap_length);
        assert_eq!(f.system.get(SystemCounter::NakMessagesSent).get(), 1);

        // Backed off until the retry delay passes.
        assert!(f.image.poll_nak(150_000, 0).is_none());
        assert!(f.image.poll_nak(300_002, 0).is_some());

        // Filling the gap clears the scheduled NAK.
        let fill = data_frame(ACTIVE_TERM_ID, TERM_OFFSET, gap_length as usize - HEADER_LENGTH);
        f.image.insert_packet(ACTIVE_TERM_ID, TERM_OFFSET, &fill, 2);
        assert!(f.image.poll_nak(1_000_000, 0).is_none());
    }

    #[test]
    fn unreliable_gap_is_padded_not_naked() {
        let f = fixture(FeedbackDelayGenerator::Immediate, false);
        let gap_length = 512;
        let ahead = data_frame(ACTIVE_TERM_ID, TERM_OFFSET + gap_length, 96);
        f.image.insert_packet(ACTIVE_TERM_ID, TERM_OFFSET + gap_length, &ahead, 1);

        assert!(f.image.poll_nak(1, 0).is_none());
        assert_eq!(f.system.get(SystemCounter::LossGapFills).get(), 1);
        assert_eq!(f.system.get(SystemCounter::NakMessagesSent).get(), 0);
        // The padded gap lets the receiver position pass over it.
        assert_eq!(
            f.image.rcv_position(),
            position_of(ACTIVE_TERM_ID, TERM_OFFSET + gap_length) + ahead.len() as i64
        );
    }

    #[test]
    fn loss_tracking_records_unique_loss_only() {
        let f = fixture(FeedbackDelayGenerator::Immediate, true);
        let image = &f.image;
        let term_id = 0;

        image.on_gap_detected(term_id, 0, 1024, 100);
        assert_eq!(image.loss_snapshot(), (1, term_id, 0, 1024));

        // Same loss: fields updated, nothing new reported.
        image.on_gap_detected(term_id, 0, 1024, 200);
        assert_eq!(image.loss_snapshot(), (2, term_id, 0, 1024));

        // Smaller loss: no report.
        image.on_gap_detected(term_id, 0, 32, 300);
        assert_eq!(image.loss_snapshot(), (3, term_id, 0, 32));

        // Extended, overlapping, disjoint and new-term losses all report.
        image.on_gap_detected(term_id, 0, 1024 + 128, 400);
        image.on_gap_detected(term_id, 512, 800, 500);
        image.on_gap_detected(term_id, 512 + 800, 32, 600);
        image.on_gap_detected(term_id, 4096, 2048, 700);
        image.on_gap_detected(term_id + 11, 0, 256, 800);
        assert_eq!(image.loss_snapshot(), (8, term_id + 11, 0, 256));

        let entries = LossReport::read(&f._loss_buffer.buffer());
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].observation_count, 6);
        assert_eq!(
            entries[0].total_bytes_lost,
            1024 + 128 + 160 + 32 + 2048 + 256
        );
        assert_eq!(entries[0].first_observation_ms, 100);
        assert_eq!(entries[0].last_observation_ms, 800);
    }

    #[test]
    fn status_messages_follow_deadline_and_trip_gain() {
        let f = fixture(FeedbackDelayGenerator::Immediate, true);
        // The initial status message is forced.
        let first = f.image.poll_status_message(1).unwrap();
        assert_eq!(first.receiver_window, WINDOW as i32);
        assert_eq!(
            position_of(first.consumption_term_id, first.consumption_term_offset),
            position_of(ACTIVE_TERM_ID, TERM_OFFSET)
        );

        // Nothing new before the deadline without progress.
        assert!(f.image.poll_status_message(2).is_none());

        // A trip gain of progress elicits one early; the stream crosses into
        // the next term on the way.
        let target = position_of(ACTIVE_TERM_ID, TERM_OFFSET) + (WINDOW / 4) as i64;
        let mut term_id = ACTIVE_TERM_ID;
        let mut offset = TERM_OFFSET as usize;
        while position_of(term_id, offset as i32) < target {
            let packet = data_frame(term_id, offset as i32, 4096 - HEADER_LENGTH);
            assert!(f.image.insert_packet(term_id, offset as i32, &packet, 3) > 0);
            offset += 4096;
            if offset == TERM_LENGTH {
                offset = 0;
                term_id += 1;
            }
        }
        assert!(f.image.poll_status_message(4).is_some());
        assert_eq!(f.system.get(SystemCounter::StatusMessagesSent).get(), 2);
    }

    #[test]
    fn lifeless_image_drains_lingers_and_dies() {
        let f = fixture(FeedbackDelayGenerator::Immediate, true);
        let mut notifications = Vec::new();
        let counters = HeapCounterTable::new(4, 0);
        let position = counters.table.allocate(1, &[], "sub", -1, -1).unwrap();
        position.set_release(position_of(ACTIVE_TERM_ID, TERM_OFFSET));
        f.image
            .add_subscriber(SubscriberPosition::new(7, position, true, false, 0));

        let liveness = 10_000_000_000u64;
        f.image.on_time_event(liveness + 1, &mut notifications);
        assert_eq!(f.image.state(), ImageState::Draining);

        // Subscriber is caught up, so the image lingers and notifies.
        f.image.on_time_event(liveness + 2, &mut notifications);
        assert_eq!(f.image.state(), ImageState::Linger);
        assert!(matches!(
            notifications.last(),
            Some(Notification::UnavailableImage { subscription_registration_id: 7, .. })
        ));

        f.image.on_time_event(2 * liveness + 3, &mut notifications);
        assert_eq!(f.image.state(), ImageState::Done);
        assert!(f.image.has_reached_end_of_life());
    }

    #[test]
    fn rejected_image_enters_cooldown() {
        let f = fixture(FeedbackDelayGenerator::Immediate, true);
        let mut notifications = Vec::new();
        f.image.reject("bad schema", 1_000, &mut notifications);
        assert!(!f.image.is_accepting_subscriptions());
        assert_eq!(f.system.get(SystemCounter::ImagesRejected).get(), 1);

        let error = f.image.take_pending_error().unwrap();
        assert_eq!(error.error_code, ErrorCode::ImageRejected as i32);
        assert_eq!(error.message, "bad schema");

        // Still refusing inside the cooldown window.
        f.image.on_time_event(2_000, &mut notifications);
        assert!(!f.image.is_accepting_subscriptions());
    }
}
