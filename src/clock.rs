use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of nanosecond timestamps.
///
/// The driver reads time once per conductor duty cycle and shares the cached
/// value with every timed check in that cycle, so implementations only need
/// to be cheap at that granularity.
pub trait Clock: Send + Sync + 'static {
    /// Current timestamp in nanoseconds since the UNIX epoch.
    fn nano_time(&self) -> u64;
}

/// Wall-clock time via `std::time::SystemTime`.
///
/// Susceptible to NTP adjustment; used for epoch-ish timestamps such as the
/// driver heartbeat and error-log records.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn nano_time(&self) -> u64 {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before UNIX epoch");
        u64::try_from(timestamp.as_nanos()).expect("system time exceeds timestamp range")
    }
}

/// TSC-anchored monotonic clock.
///
/// Anchors to wall time once at construction, then advances with `quanta`
/// ticks. No backward jumps.
#[derive(Debug, Clone)]
pub struct NanoClock {
    clock: quanta::Clock,
    start_wall_ns: u64,
    start_instant: quanta::Instant,
}

impl Default for NanoClock {
    fn default() -> Self {
        let clock = quanta::Clock::new();
        let start_instant = clock.now();
        let start_wall_ns = SystemClock.nano_time();

        Self {
            clock,
            start_wall_ns,
            start_instant,
        }
    }
}

impl NanoClock {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for NanoClock {
    fn nano_time(&self) -> u64 {
        let delta = self.clock.now().duration_since(self.start_instant);
        self.start_wall_ns + delta.as_nanos() as u64
    }
}

/// One timestamp per duty cycle, readable from any agent thread.
///
/// The conductor calls [`CachedNanoClock::update`] at the top of each cycle;
/// everything timed within that cycle observes the same reading.
#[derive(Debug, Default)]
pub struct CachedNanoClock {
    cached_ns: AtomicU64,
}

impl CachedNanoClock {
    pub fn new(initial_ns: u64) -> Self {
        Self {
            cached_ns: AtomicU64::new(initial_ns),
        }
    }

    pub fn update(&self, now_ns: u64) {
        self.cached_ns.store(now_ns, Ordering::Release);
    }

    pub fn nano_time(&self) -> u64 {
        self.cached_ns.load(Ordering::Acquire)
    }
}
