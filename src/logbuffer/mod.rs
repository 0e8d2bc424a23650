//! The partitioned, append-only log buffer: framing, metadata, position
//! arithmetic and the producer/consumer operations over term buffers.

pub mod frame;
pub mod meta;
pub mod position;
pub mod term;

pub use frame::{FrameHeader, FRAME_ALIGNMENT, HEADER_LENGTH};
pub use meta::{LogMeta, LogMetaInit, RawLog, LOG_META_LENGTH, TERM_MAX_LENGTH, TERM_MIN_LENGTH};
pub use position::PARTITION_COUNT;
pub use term::{producer_position, Appender, Claim, ClaimOutcome, Gap};
