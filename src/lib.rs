//! Low-latency shared-memory publish/subscribe media driver.
//!
//! A driver process owns the wire side (UDP, loopback IPC) and a directory of
//! memory-mapped log buffers; client processes attach to the same directory
//! and publish or subscribe without the driver touching the data path. The
//! driver manages lifecycles, flow control, loss recovery and counters.

pub mod buffer;
pub mod channel;
pub mod clock;
pub mod cnc;
pub mod conductor;
pub mod config;
pub mod counters;
pub mod driver;
pub mod error;
pub mod event;
pub mod flow_control;
pub mod image;
pub mod logbuffer;
pub mod loss;
pub mod mmap;
pub mod protocol;
pub mod publication;
pub mod ring;
pub mod subscribable;

pub use clock::{CachedNanoClock, Clock, NanoClock, SystemClock};
pub use conductor::DriverConductor;
pub use config::{DriverConfig, ThreadingMode};
pub use driver::{IdleStrategy, MediaDriver};
pub use error::{Error, ErrorCode, Result};
pub use event::{ClientCommand, ClientEvent};
