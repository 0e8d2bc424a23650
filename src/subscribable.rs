//! The set of subscriber positions attached to one stream.
//!
//! Each position is a counter updated by the subscriber process and read by
//! the driver. Untethered subscriptions additionally cycle through a tether
//! state machine: ACTIVE (delivering) -> LINGER (stopped, client notified)
//! -> RESTING (waiting to rejoin) -> ACTIVE.

use crate::counters::Counter;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TetherState {
    Active,
    Linger,
    Resting,
}

pub struct SubscriberPosition {
    pub subscription_id: i64,
    pub counter: Counter,
    pub is_tether: bool,
    pub is_rejoin: bool,
    pub state: TetherState,
    pub time_of_last_update_ns: u64,
}

impl SubscriberPosition {
    pub fn new(subscription_id: i64, counter: Counter, is_tether: bool, is_rejoin: bool, now_ns: u64) -> Self {
        Self {
            subscription_id,
            counter,
            is_tether,
            is_rejoin,
            state: TetherState::Active,
            time_of_last_update_ns: now_ns,
        }
    }

    /// RESTING positions are parked; they neither gate flow control nor count
    /// as connected readers.
    pub fn is_working(&self) -> bool {
        self.state != TetherState::Resting
    }

    pub fn transition(&mut self, state: TetherState, now_ns: u64) {
        self.state = state;
        self.time_of_last_update_ns = now_ns;
    }
}

#[derive(Default)]
pub struct Subscribable {
    positions: Vec<SubscriberPosition>,
}

impl Subscribable {
    pub fn add(&mut self, position: SubscriberPosition) {
        self.positions.push(position);
    }

    pub fn remove(&mut self, subscription_id: i64) -> Option<SubscriberPosition> {
        let index = self
            .positions
            .iter()
            .position(|p| p.subscription_id == subscription_id)?;
        Some(self.positions.swap_remove(index))
    }

    pub fn clear(&mut self) -> Vec<SubscriberPosition> {
        std::mem::take(&mut self.positions)
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn working_count(&self) -> usize {
        self.positions.iter().filter(|p| p.is_working()).count()
    }

    pub fn has_working_positions(&self) -> bool {
        self.positions.iter().any(|p| p.is_working())
    }

    /// Minimum working position, or `default` when no position is working.
    pub fn min_position(&self, default: i64) -> i64 {
        self.positions
            .iter()
            .filter(|p| p.is_working())
            .map(|p| p.counter.get_volatile())
            .min()
            .unwrap_or(default)
    }

    /// Maximum working position, at least `floor`.
    pub fn max_position(&self, floor: i64) -> i64 {
        self.positions
            .iter()
            .filter(|p| p.is_working())
            .map(|p| p.counter.get_volatile())
            .fold(floor, std::cmp::max)
    }

    /// True when every working position has reached `position`.
    pub fn all_caught_up_to(&self, position: i64) -> bool {
        self.positions
            .iter()
            .filter(|p| p.is_working())
            .all(|p| p.counter.get_volatile() >= position)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SubscriberPosition> {
        self.positions.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut SubscriberPosition> {
        self.positions.iter_mut()
    }

    /// Removes positions selected by `predicate` and hands them back.
    pub fn drain_where(
        &mut self,
        mut predicate: impl FnMut(&SubscriberPosition) -> bool,
    ) -> Vec<SubscriberPosition> {
        let mut removed = Vec::new();
        let mut index = 0;
        while index < self.positions.len() {
            if predicate(&self.positions[index]) {
                removed.push(self.positions.swap_remove(index));
            } else {
                index += 1;
            }
        }
        removed
    }
}
