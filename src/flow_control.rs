//! Sender flow control strategies.
//!
//! A strategy folds the stream of received status messages into a single
//! sender limit. `max` tracks the fastest receiver, `min` the slowest, and
//! `tagged` the slowest receiver carrying a matching group tag. Receivers
//! that stop reporting are aged out after the receiver timeout.

use crate::logbuffer::position::compute_position;
use crate::protocol::StatusMessage;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Strategy {
    Max,
    Min,
    Tagged { group_tag: i64, required_group_size: usize },
}

struct Receiver {
    receiver_id: i64,
    last_position: i64,
    last_position_plus_window: i64,
    time_of_last_status_message_ns: u64,
}

pub struct FlowControl {
    strategy: Strategy,
    receivers: Vec<Receiver>,
    receiver_timeout_ns: u64,
    position_bits_to_shift: u32,
    initial_term_id: i32,
}

impl FlowControl {
    pub fn new(
        strategy_uri: Option<&str>,
        receiver_timeout_ns: u64,
        position_bits_to_shift: u32,
        initial_term_id: i32,
        channel_group_tag: Option<i64>,
    ) -> Result<Self> {
        let strategy = match strategy_uri {
            None | Some("max") => Strategy::Max,
            Some("min") => Strategy::Min,
            Some(value) if value.starts_with("tagged") => {
                Self::parse_tagged(value, channel_group_tag)?
            }
            Some(other) => {
                return Err(Error::InvalidChannel(format!("unknown flow control: {other}")))
            }
        };
        Ok(Self {
            strategy,
            receivers: Vec::new(),
            receiver_timeout_ns,
            position_bits_to_shift,
            initial_term_id,
        })
    }

    /// `tagged,g:<tag>[/<minSize>]`.
    fn parse_tagged(value: &str, channel_group_tag: Option<i64>) -> Result<Strategy> {
        let mut group_tag = channel_group_tag;
        let mut required_group_size = 0usize;
        for part in value.split(',').skip(1) {
            if let Some(group) = part.strip_prefix("g:") {
                let (tag_str, size_str) = match group.split_once('/') {
                    Some((tag, size)) => (tag, Some(size)),
                    None => (group, None),
                };
                if !tag_str.is_empty() {
                    group_tag = Some(tag_str.parse().map_err(|_| {
                        Error::InvalidChannel(format!("bad flow control group tag: {tag_str}"))
                    })?);
                }
                if let Some(size_str) = size_str {
                    required_group_size = size_str.parse().map_err(|_| {
                        Error::InvalidChannel(format!("bad flow control group size: {size_str}"))
                    })?;
                }
            } else {
                return Err(Error::InvalidChannel(format!("bad flow control option: {part}")));
            }
        }
        let group_tag = group_tag
            .ok_or_else(|| Error::InvalidChannel("tagged flow control needs a group tag".into()))?;
        Ok(Strategy::Tagged { group_tag, required_group_size })
    }

    fn matches(&self, sm: &StatusMessage) -> bool {
        match self.strategy {
            Strategy::Max | Strategy::Min => true,
            Strategy::Tagged { group_tag, .. } => sm.group_tag == Some(group_tag),
        }
    }

    /// Folds a status message into the sender limit.
    pub fn on_status_message(
        &mut self,
        sm: &StatusMessage,
        sender_limit: i64,
        now_ns: u64,
    ) -> i64 {
        let position = compute_position(
            sm.consumption_term_id,
            sm.consumption_term_offset,
            self.position_bits_to_shift,
            self.initial_term_id,
        );
        let window_edge = position + sm.receiver_window as i64;

        if self.matches(sm) {
            match self.receivers.iter_mut().find(|r| r.receiver_id == sm.receiver_id) {
                Some(receiver) => {
                    receiver.last_position = std::cmp::max(receiver.last_position, position);
                    receiver.last_position_plus_window = window_edge;
                    receiver.time_of_last_status_message_ns = now_ns;
                }
                None => self.receivers.push(Receiver {
                    receiver_id: sm.receiver_id,
                    last_position: position,
                    last_position_plus_window: window_edge,
                    time_of_last_status_message_ns: now_ns,
                }),
            }
        }

        self.compute_limit(sender_limit, window_edge)
    }

    /// Ages out silent receivers; returns the recomputed limit.
    pub fn on_idle(&mut self, now_ns: u64, sender_limit: i64) -> i64 {
        let timeout = self.receiver_timeout_ns;
        self.receivers
            .retain(|r| now_ns.saturating_sub(r.time_of_last_status_message_ns) <= timeout);
        self.compute_limit(sender_limit, sender_limit)
    }

    fn compute_limit(&self, sender_limit: i64, fallback_window_edge: i64) -> i64 {
        match self.strategy {
            // The fastest receiver lifts the limit; it never regresses.
            Strategy::Max => {
                let aggregated = self
                    .receivers
                    .iter()
                    .map(|r| r.last_position_plus_window)
                    .max()
                    .unwrap_or(fallback_window_edge);
                std::cmp::max(sender_limit, aggregated)
            }
            // The slowest matching receiver pins the limit while it is live;
            // with no live receivers the current limit holds.
            Strategy::Min | Strategy::Tagged { .. } => self
                .receivers
                .iter()
                .map(|r| r.last_position_plus_window)
                .min()
                .unwrap_or(sender_limit),
        }
    }

    pub fn has_required_receivers(&self) -> bool {
        match self.strategy {
            Strategy::Max | Strategy::Min => !self.receivers.is_empty(),
            Strategy::Tagged { required_group_size, .. } => {
                self.receivers.len() >= std::cmp::max(required_group_size, 1)
            }
        }
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BITS: u32 = 16; // 64 KiB terms

    fn sm(receiver_id: i64, term_id: i32, term_offset: i32, window: i32, tag: Option<i64>) -> StatusMessage {
        StatusMessage {
            flags: 0,
            session_id: 1,
            stream_id: 1,
            consumption_term_id: term_id,
            consumption_term_offset: term_offset,
            receiver_window: window,
            receiver_id,
            group_tag: tag,
        }
    }

    #[test]
    fn max_takes_the_fastest_receiver() {
        let mut fc = FlowControl::new(Some("max"), 1_000, BITS, 0, None).unwrap();
        let limit = fc.on_status_message(&sm(1, 0, 1024, 4096, None), 0, 0);
        assert_eq!(limit, 1024 + 4096);
        let limit = fc.on_status_message(&sm(2, 0, 512, 1024, None), limit, 0);
        assert_eq!(limit, 1024 + 4096);
        let limit = fc.on_status_message(&sm(2, 0, 8192, 4096, None), limit, 0);
        assert_eq!(limit, 8192 + 4096);
    }

    #[test]
    fn min_is_gated_by_the_slowest_receiver() {
        let mut fc = FlowControl::new(Some("min"), 1_000, BITS, 0, None).unwrap();
        let limit = fc.on_status_message(&sm(1, 0, 8192, 4096, None), 0, 0);
        assert_eq!(limit, 8192 + 4096);
        // A slower receiver joining pulls the limit back to its window edge.
        let limit = fc.on_status_message(&sm(2, 0, 1024, 1024, None), limit, 0);
        assert_eq!(limit, 1024 + 1024);
    }

    #[test]
    fn min_releases_when_slow_receiver_times_out() {
        let mut fc = FlowControl::new(Some("min"), 1_000, BITS, 0, None).unwrap();
        fc.on_status_message(&sm(1, 0, 8192, 4096, None), 0, 0);
        fc.on_status_message(&sm(2, 0, 1024, 1024, None), 0, 500);
        let limit = fc.on_idle(2_000, 2048);
        // Receiver 1 last reported at 0 and receiver 2 at 500; both are past
        // the 1000ns timeout by 2000ns, so the limit holds.
        assert_eq!(fc.receiver_count(), 0);
        assert_eq!(limit, 2048);
    }

    #[test]
    fn tagged_ignores_untagged_receivers() {
        let mut fc = FlowControl::new(Some("tagged,g:7"), 1_000, BITS, 0, None).unwrap();
        let limit = fc.on_status_message(&sm(1, 0, 512, 1024, None), 0, 0);
        assert_eq!(limit, 0);
        assert_eq!(fc.receiver_count(), 0);

        let limit = fc.on_status_message(&sm(2, 0, 2048, 1024, Some(7)), 0, 0);
        assert_eq!(limit, 2048 + 1024);
        assert_eq!(fc.receiver_count(), 1);
    }

    #[test]
    fn tagged_group_size_gates_required_receivers() {
        let mut fc = FlowControl::new(Some("tagged,g:7/2"), 1_000, BITS, 0, None).unwrap();
        fc.on_status_message(&sm(1, 0, 0, 1024, Some(7)), 0, 0);
        assert!(!fc.has_required_receivers());
        fc.on_status_message(&sm(2, 0, 0, 1024, Some(7)), 0, 0);
        assert!(fc.has_required_receivers());
    }

    #[test]
    fn group_tag_falls_back_to_channel_gtag() {
        let fc = FlowControl::new(Some("tagged"), 1_000, BITS, 0, Some(3)).unwrap();
        assert!(matches!(fc.strategy, Strategy::Tagged { group_tag: 3, .. }));
        assert!(FlowControl::new(Some("tagged"), 1_000, BITS, 0, None).is_err());
    }

    #[test]
    fn max_limit_never_regresses() {
        let mut fc = FlowControl::new(Some("max"), 1_000, BITS, 0, None).unwrap();
        let limit = fc.on_status_message(&sm(1, 0, 8192, 4096, None), 0, 0);
        // The same receiver reporting a smaller window does not pull it back.
        let shrunk = fc.on_status_message(&sm(1, 0, 8192, 1024, None), limit, 0);
        assert_eq!(shrunk, limit);
    }
}
