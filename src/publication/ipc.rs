//! In-process shared-memory publication.
//!
//! Publisher and subscribers exchange data through the mapped log alone; the
//! conductor only advances the publisher limit, cleans consumed terms, frees
//! blocked claims and drives the lifecycle. All state here is owned by the
//! conductor thread.

use crate::counters::Counter;
use crate::error::ErrorCode;
use crate::event::Notification;
use crate::logbuffer::meta::RawLog;
use crate::logbuffer::position::position_bits_to_shift;
use crate::logbuffer::term;
use crate::publication::PublicationState;
use crate::subscribable::{Subscribable, SubscriberPosition, TetherState};

pub struct IpcPublicationParams {
    pub registration_id: i64,
    pub session_id: i32,
    pub stream_id: i32,
    pub channel: String,
    pub log_file: String,
    pub is_exclusive: bool,
    pub term_window_length: usize,
    pub unblock_timeout_ns: u64,
    pub image_liveness_timeout_ns: u64,
    pub linger_timeout_ns: u64,
    pub untethered_window_limit_timeout_ns: u64,
    pub untethered_linger_timeout_ns: u64,
    pub untethered_resting_timeout_ns: u64,
}

pub struct IpcPublication {
    registration_id: i64,
    session_id: i32,
    stream_id: i32,
    channel: String,
    log_file: String,
    is_exclusive: bool,
    position_bits_to_shift: u32,
    term_window_length: i64,
    trip_gain: i64,
    unblock_timeout_ns: u64,
    image_liveness_timeout_ns: u64,
    linger_timeout_ns: u64,
    untethered_window_limit_timeout_ns: u64,
    untethered_linger_timeout_ns: u64,
    untethered_resting_timeout_ns: u64,

    log: RawLog,
    publisher_pos: Counter,
    publisher_limit: Counter,
    unblocked_publications: Counter,
    publications_revoked: Counter,

    state: PublicationState,
    ref_count: i32,
    trip_limit: i64,
    consumer_position: i64,
    last_consumer_position: i64,
    time_of_last_consumer_update_ns: u64,
    time_of_last_state_change_ns: u64,
    clean_position: i64,
    in_cooldown: bool,
    cooldown_deadline_ns: u64,
    subscribable: Subscribable,
}

impl IpcPublication {
    pub fn new(
        params: IpcPublicationParams,
        log: RawLog,
        publisher_pos: Counter,
        publisher_limit: Counter,
        unblocked_publications: Counter,
        publications_revoked: Counter,
        now_ns: u64,
    ) -> Self {
        let bits = position_bits_to_shift(log.term_length());
        let initial_position = term::producer_position(&log);
        publisher_pos.set_release(initial_position);
        publisher_limit.set_release(initial_position);

        Self {
            registration_id: params.registration_id,
            session_id: params.session_id,
            stream_id: params.stream_id,
            channel: params.channel,
            log_file: params.log_file,
            is_exclusive: params.is_exclusive,
            position_bits_to_shift: bits,
            term_window_length: params.term_window_length as i64,
            trip_gain: (params.term_window_length >> 3) as i64,
            unblock_timeout_ns: params.unblock_timeout_ns,
            image_liveness_timeout_ns: params.image_liveness_timeout_ns,
            linger_timeout_ns: params.linger_timeout_ns,
            untethered_window_limit_timeout_ns: params.untethered_window_limit_timeout_ns,
            untethered_linger_timeout_ns: params.untethered_linger_timeout_ns,
            untethered_resting_timeout_ns: params.untethered_resting_timeout_ns,
            log,
            publisher_pos,
            publisher_limit,
            unblocked_publications,
            publications_revoked,
            state: PublicationState::Active,
            ref_count: 0,
            trip_limit: 0,
            consumer_position: initial_position,
            last_consumer_position: initial_position,
            time_of_last_consumer_update_ns: now_ns,
            time_of_last_state_change_ns: now_ns,
            clean_position: initial_position,
            in_cooldown: false,
            cooldown_deadline_ns: 0,
            subscribable: Subscribable::default(),
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

    pub fn state(&self) -> PublicationState {
        self.state
    }

    pub fn raw_log(&self) -> &RawLog {
        &self.log
    }

    pub fn publisher_limit_id(&self) -> i32 {
        self.publisher_limit.id()
    }

    pub fn producer_position(&self) -> i64 {
        term::producer_position(&self.log)
    }

    pub fn consumer_position(&self) -> i64 {
        self.consumer_position
    }

    pub fn joint_position(&self) -> i64 {
        self.subscribable.min_position(self.consumer_position)
    }

    pub fn inc_ref(&mut self) {
        self.ref_count += 1;
    }

    pub fn dec_ref(&mut self) {
        self.ref_count -= 1;
        if self.ref_count == 0 {
            let producer_position = self.producer_position();
            self.publisher_limit.set_release(producer_position);
            if self.log.meta().signal_eos() {
                self.log.meta().set_end_of_stream_position(producer_position);
            }
            if !self.log.meta().is_publication_revoked() {
                self.state = PublicationState::Draining;
            }
        }
    }

    pub fn ref_count(&self) -> i32 {
        self.ref_count
    }

    /// Marks the revocation flag; the lifecycle picks it up next tick.
    pub fn revoke(&self) {
        self.log.meta().set_publication_revoked();
    }

    pub fn is_accepting_subscriptions(&self) -> bool {
        !self.in_cooldown
            && (self.state == PublicationState::Active
                || (self.state == PublicationState::Draining
                    && !self.subscribable.all_caught_up_to(self.producer_position())))
    }

    pub fn has_reached_end_of_life(&self) -> bool {
        self.state == PublicationState::Done
    }

    pub fn add_subscriber(&mut self, position: SubscriberPosition) {
        self.subscribable.add(position);
        self.log.meta().set_is_connected(true);
    }

    pub fn remove_subscriber(&mut self, subscription_id: i64) -> Option<SubscriberPosition> {
        let removed = self.subscribable.remove(subscription_id);
        if self.subscribable.is_empty() {
            self.log.meta().set_is_connected(false);
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribable.len()
    }

    /// One conductor tick. Returns positions freed by untethered removal.
    pub fn on_time_event(
        &mut self,
        now_ns: u64,
        notifications: &mut Vec<Notification>,
    ) -> Vec<SubscriberPosition> {
        let mut freed = Vec::new();
        match self.state {
            PublicationState::Active => {
                if self.log.meta().is_publication_revoked() {
                    let revoked_position = self.producer_position();
                    self.publisher_limit.set_release(revoked_position);
                    self.log.meta().set_end_of_stream_position(revoked_position);
                    self.log.meta().set_is_connected(false);
                    for position in self.subscribable.iter() {
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
                    self.state = PublicationState::Linger;
                    self.time_of_last_state_change_ns = now_ns;
                    self.publications_revoked.increment();
                    log::debug!(
                        "publication revoked position={} session={} stream={} channel={}",
                        revoked_position,
                        self.session_id,
                        self.stream_id,
                        self.channel
                    );
                } else {
                    freed = self.check_untethered(now_ns, notifications);
                    self.log.meta().set_is_connected(self.subscribable.has_working_positions());
                    let producer_position = self.producer_position();
                    self.publisher_pos.set_release(producer_position);
                    if !self.is_exclusive {
                        self.check_for_blocked_publisher(producer_position, now_ns);
                    }
                    if self.in_cooldown && now_ns > self.cooldown_deadline_ns {
                        self.in_cooldown = false;
                        self.cooldown_deadline_ns = 0;
                    }
                }
            }
            PublicationState::Draining => {
                let producer_position = self.producer_position();
                self.publisher_pos.set_release(producer_position);
                if self.subscribable.all_caught_up_to(producer_position) {
                    for position in self.subscribable.iter() {
                        notifications.push(Notification::UnavailableImage {
                            correlation_id: self.registration_id,
                            subscription_registration_id: position.subscription_id,
                            stream_id: self.stream_id,
                        });
                    }
                    self.log.meta().set_is_connected(false);
                    self.state = PublicationState::Linger;
                    self.time_of_last_state_change_ns = now_ns;
                } else if term::unblock(&self.log, self.consumer_position) {
                    self.unblocked_publications.increment();
                }
            }
            PublicationState::Linger => {
                if self.ref_count == 0
                    && now_ns.saturating_sub(self.time_of_last_state_change_ns)
                        > self.linger_timeout_ns
                {
                    freed = self.subscribable.clear();
                    self.state = PublicationState::Done;
                }
            }
            PublicationState::Done => {}
        }
        freed
    }

    /// Advances the consumer position, publisher limit and cleaned region.
    /// The trip-limit hysteresis batches limit updates to one per gain.
    pub fn update_publisher_position_and_limit(&mut self) -> usize {
        if self.state != PublicationState::Active {
            return 0;
        }

        let producer_position = self.producer_position();
        self.publisher_pos.set_release(producer_position);

        if self.subscribable.has_working_positions() {
            let min_position = self.subscribable.min_position(i64::MAX);
            let max_position = self.subscribable.max_position(self.consumer_position);

            if max_position > self.consumer_position {
                self.consumer_position = max_position;
            }

            let proposed_limit = min_position + self.term_window_length;
            if proposed_limit >= self.trip_limit {
                self.clean_buffer_to(min_position);
                self.publisher_limit.set_release(proposed_limit);
                self.trip_limit = proposed_limit + self.trip_gain;
                return 1;
            }
        } else if self.publisher_limit.get() > self.consumer_position {
            self.trip_limit = self.consumer_position;
            self.publisher_limit.set_release(self.consumer_position);
            self.clean_buffer_to(self.consumer_position);
            return 1;
        }

        0
    }

    /// Emits a publication error and refuses subscribers for a cooldown.
    /// Returns the freed positions.
    pub fn reject(
        &mut self,
        reason: &str,
        now_ns: u64,
        notifications: &mut Vec<Notification>,
    ) -> Vec<SubscriberPosition> {
        notifications.push(Notification::PublicationError {
            registration_id: self.registration_id,
            session_id: self.session_id,
            stream_id: self.stream_id,
            code: ErrorCode::ImageRejected,
            message: reason.to_string(),
        });

        let mut freed = Vec::new();
        if !self.in_cooldown {
            self.log.meta().set_is_connected(false);
            for position in self.subscribable.iter() {
                notifications.push(Notification::UnavailableImage {
                    correlation_id: self.registration_id,
                    subscription_registration_id: position.subscription_id,
                    stream_id: self.stream_id,
                });
            }
            freed = self.subscribable.clear();
            self.in_cooldown = true;
        }
        self.cooldown_deadline_ns = now_ns + self.image_liveness_timeout_ns;
        freed
    }

    fn check_for_blocked_publisher(&mut self, producer_position: i64, now_ns: u64) {
        let consumer_position = self.consumer_position;
        if consumer_position == self.last_consumer_position
            && self.is_possibly_blocked(producer_position, consumer_position)
        {
            if now_ns.saturating_sub(self.time_of_last_consumer_update_ns) > self.unblock_timeout_ns
                && term::unblock(&self.log, consumer_position)
            {
                self.unblocked_publications.increment();
                log::debug!(
                    "unblocked publication at position={} session={} stream={}",
                    consumer_position,
                    self.session_id,
                    self.stream_id
                );
            }
        } else {
            self.time_of_last_consumer_update_ns = now_ns;
            self.last_consumer_position = consumer_position;
        }
    }

    fn is_possibly_blocked(&self, producer_position: i64, consumer_position: i64) -> bool {
        let producer_term_count = self.log.meta().active_term_count();
        let expected_term_count = (consumer_position >> self.position_bits_to_shift) as i32;
        if producer_term_count != expected_term_count {
            return true;
        }
        producer_position > consumer_position
    }

    fn clean_buffer_to(&mut self, position: i64) {
        self.clean_position = term::clean_to(&self.log, self.clean_position, position);
    }

    fn check_untethered(
        &mut self,
        now_ns: u64,
        notifications: &mut Vec<Notification>,
    ) -> Vec<SubscriberPosition> {
        let consumer_position = self.consumer_position;
        let window = self.term_window_length;
        let untethered_window_limit = (consumer_position - window) + (window >> 2);
        let join_position = self.joint_position();

        let registration_id = self.registration_id;
        let session_id = self.session_id;
        let stream_id = self.stream_id;
        let log_file = self.log_file.clone();

        let mut to_remove = Vec::new();
        for position in self.subscribable.iter_mut() {
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
                            correlation_id: registration_id,
                            subscription_registration_id: position.subscription_id,
                            stream_id,
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
                            correlation_id: registration_id,
                            subscription_registration_id: position.subscription_id,
                            session_id,
                            stream_id,
                            join_position,
                            log_file: log_file.clone(),
                            source_identity: "ipc".to_string(),
                        });
                        position.transition(TetherState::Active, now_ns);
                    }
                }
            }
        }

        let mut freed = Vec::new();
        for subscription_id in to_remove {
            if let Some(position) = self.subscribable.remove(subscription_id) {
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
    use std::sync::Arc;

    const WINDOW: usize = TERM_MIN_LENGTH / 2;

    struct Fixture {
        counters: HeapCounterTable,
        publication: IpcPublication,
    }

    fn fixture() -> Fixture {
        let counters = HeapCounterTable::new(64, 0);
        let table = Arc::clone(&counters.table);
        let log = RawLog::heap(test_init(TERM_MIN_LENGTH), TERM_MIN_LENGTH).unwrap();
        let pub_pos = table.allocate(10, &[], "pub-pos", -1, -1).unwrap();
        let pub_lmt = table.allocate(11, &[], "pub-lmt", -1, -1).unwrap();
        let unblocked = table.allocate(12, &[], "unblocked", -1, -1).unwrap();
        let revoked = table.allocate(13, &[], "revoked", -1, -1).unwrap();

        let mut publication = IpcPublication::new(
            IpcPublicationParams {
                registration_id: 1,
                session_id: 7,
                stream_id: 1001,
                channel: "aqueduct:ipc".to_string(),
                log_file: String::new(),
                is_exclusive: false,
                term_window_length: WINDOW,
                unblock_timeout_ns: 1_000_000,
                image_liveness_timeout_ns: 10_000_000_000,
                linger_timeout_ns: 1_000,
                untethered_window_limit_timeout_ns: 1_000,
                untethered_linger_timeout_ns: 1_000,
                untethered_resting_timeout_ns: 1_000,
            },
            log,
            pub_pos,
            pub_lmt,
            unblocked,
            revoked,
            0,
        );
        publication.inc_ref();
        Fixture { counters, publication }
    }

    #[test]
    fn limit_follows_subscribers_with_trip_hysteresis() {
        let mut f = fixture();
        let counter = f.counters.table.allocate(30, &[], "sub-pos", -1, -1).unwrap();
        counter.set_release(0);
        f.publication
            .add_subscriber(SubscriberPosition::new(5, counter, true, false, 0));

        assert_eq!(f.publication.update_publisher_position_and_limit(), 1);
        let window = WINDOW as i64;
        assert_eq!(f.publication.publisher_limit.get_volatile(), window);

        // Progress below the trip gain publishes nothing new.
        counter.set_release(1024);
        assert_eq!(f.publication.update_publisher_position_and_limit(), 0);

        // A full trip gain republishes the limit.
        let gain = window >> 3;
        counter.set_release(gain);
        assert_eq!(f.publication.update_publisher_position_and_limit(), 1);
        assert_eq!(f.publication.publisher_limit.get_volatile(), gain + window);
    }

    #[test]
    fn limit_collapses_to_consumer_position_without_subscribers() {
        let mut f = fixture();
        let counter = f.counters.table.allocate(30, &[], "sub-pos", -1, -1).unwrap();
        counter.set_release(96);
        f.publication
            .add_subscriber(SubscriberPosition::new(5, counter, true, false, 0));
        f.publication.update_publisher_position_and_limit();

        f.publication.remove_subscriber(5).unwrap();
        assert_eq!(f.publication.update_publisher_position_and_limit(), 1);
        assert_eq!(f.publication.publisher_limit.get_volatile(), 96);
        assert_eq!(f.publication.consumer_position(), 96);
    }

    #[test]
    fn revoke_ends_stream_within_one_tick() {
        let mut f = fixture();
        let appender = Appender::new(f.publication.raw_log(), false);
        for _ in 0..85 {
            appender.append(&[0u8; 16], i64::MAX).unwrap().unwrap();
        }
        let position = f.publication.producer_position();
        assert_eq!(position, 85 * 48);

        f.publication.revoke();
        let mut notifications = Vec::new();
        f.publication.on_time_event(100, &mut notifications);

        assert_eq!(f.publication.state(), PublicationState::Linger);
        assert!(!f.publication.raw_log().meta().is_connected());
        assert_eq!(
            f.publication.raw_log().meta().end_of_stream_position(),
            position
        );
        assert_eq!(f.publication.publications_revoked.get(), 1);
        assert!(matches!(
            notifications.last(),
            Some(Notification::PublicationError { code: ErrorCode::PublicationRevoked, .. })
        ));

        // DONE only after the linger timeout with no references.
        f.publication.dec_ref();
        f.publication.on_time_event(200, &mut notifications);
        assert_eq!(f.publication.state(), PublicationState::Linger);
        f.publication.on_time_event(100 + 1_001, &mut notifications);
        assert_eq!(f.publication.state(), PublicationState::Done);
        assert!(f.publication.has_reached_end_of_life());
    }

    #[test]
    fn blocked_publisher_is_freed_after_timeout() {
        let mut f = fixture();
        let counter = f.counters.table.allocate(30, &[], "sub-pos", -1, -1).unwrap();
        counter.set_release(0);
        f.publication
            .add_subscriber(SubscriberPosition::new(5, counter, true, false, 0));
        f.publication.update_publisher_position_and_limit();

        // A claim that is never committed blocks the stream at offset 0.
        let appender = Appender::new(f.publication.raw_log(), false);
        let claim = appender.claim(224, i64::MAX).unwrap().unwrap();
        std::mem::forget(claim);

        let mut notifications = Vec::new();
        f.publication.on_time_event(10, &mut notifications);
        assert_eq!(f.publication.unblocked_publications.get(), 0);

        // Consumer has not moved for longer than the unblock timeout.
        f.publication.on_time_event(2_000_000, &mut notifications);
        assert_eq!(f.publication.unblocked_publications.get(), 1);
        assert_eq!(
            crate::logbuffer::frame::frame_length_volatile(f.publication.raw_log().term(0), 0),
            256
        );
    }

    #[test]
    fn dec_ref_to_zero_drains_then_lingers() {
        let mut f = fixture();
        let counter = f.counters.table.allocate(30, &[], "sub-pos", -1, -1).unwrap();
        counter.set_release(0);
        f.publication
            .add_subscriber(SubscriberPosition::new(5, counter, true, false, 0));

        let appender = Appender::new(f.publication.raw_log(), false);
        appender.append(&[1u8; 16], i64::MAX).unwrap().unwrap();

        f.publication.dec_ref();
        assert_eq!(f.publication.state(), PublicationState::Draining);
        assert_eq!(
            f.publication.raw_log().meta().end_of_stream_position(),
            48
        );

        // Subscriber lagging: still draining.
        let mut notifications = Vec::new();
        f.publication.on_time_event(1, &mut notifications);
        assert_eq!(f.publication.state(), PublicationState::Draining);

        counter.set_release(48);
        f.publication.on_time_event(2, &mut notifications);
        assert_eq!(f.publication.state(), PublicationState::Linger);
        assert!(matches!(
            notifications.last(),
            Some(Notification::UnavailableImage { subscription_registration_id: 5, .. })
        ));
    }

    #[test]
    fn untethered_subscriber_cycles_to_resting_and_back() {
        let mut f = fixture();
        let tethered = f.counters.table.allocate(30, &[], "t", -1, -1).unwrap();
        let untethered = f.counters.table.allocate(30, &[], "u", -1, -1).unwrap();
        f.publication
            .add_subscriber(SubscriberPosition::new(1, tethered, true, false, 0));
        f.publication
            .add_subscriber(SubscriberPosition::new(2, untethered, false, true, 0));

        // Push the stream a window ahead so the untethered position lags.
        let appender = Appender::new(f.publication.raw_log(), false);
        let window = WINDOW as i64;
        while f.publication.producer_position() < 2 * window {
            appender.append(&[0u8; 992], i64::MAX).unwrap().ok();
        }
        tethered.set_release(f.publication.producer_position());
        untethered.set_release(0);
        f.publication.update_publisher_position_and_limit();

        let mut notifications = Vec::new();
        // Active -> window limit breached, clock runs past the timeout.
        f.publication.on_time_event(500, &mut notifications);
        f.publication.on_time_event(2_000, &mut notifications);
        assert!(matches!(
            notifications.last(),
            Some(Notification::UnavailableImage { subscription_registration_id: 2, .. })
        ));

        // Linger -> Resting -> Active again with a fresh join position.
        f.publication.on_time_event(4_000, &mut notifications);
        f.publication.on_time_event(6_000, &mut notifications);
        let last = notifications.last().unwrap();
        match last {
            Notification::AvailableImage { subscription_registration_id, join_position, .. } => {
                assert_eq!(*subscription_registration_id, 2);
                assert_eq!(*join_position, f.publication.producer_position());
            }
            other => panic!("expected AvailableImage, got {other:?}"),
        }
    }
}
