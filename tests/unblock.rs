//! A publisher that dies mid-claim blocks the stream; the conductor's
//! watchdog pads the unfinished frame after the unblock timeout.

use std::path::Path;
use std::sync::Arc;

use aqueduct::conductor::DriverConductor;
use aqueduct::config::DriverConfig;
use aqueduct::counters::{HeapCounterTable, SystemCounter, SystemCounters};
use aqueduct::event::{ClientCommand, ClientEvent};
use aqueduct::logbuffer::frame::{frame_length_volatile, frame_type, HDR_TYPE_PAD};
use aqueduct::logbuffer::meta::RawLog;
use aqueduct::logbuffer::position::index_by_term;
use aqueduct::logbuffer::term::Appender;
use tempfile::TempDir;

#[test]
fn abandoned_claim_is_padded_after_unblock_timeout() {
    let dir = TempDir::new().unwrap();
    let mut config = DriverConfig::default();
    config.dir = dir.path().to_path_buf();
    config.publication_unblock_timeout_ns = 1_000_000;
    let counters = HeapCounterTable::new(128, 0);
    let system = Arc::new(SystemCounters::allocate(&counters.table).unwrap());
    let mut conductor = DriverConductor::new(
        config,
        Arc::clone(&counters.table),
        Arc::clone(&system),
        None,
        None,
    );

    conductor.on_command(
        ClientCommand::AddPublication {
            client_id: 1,
            correlation_id: 5,
            stream_id: 9,
            channel: "aqueduct:ipc?term-length=64k|init-term-id=5|term-id=5|term-offset=0"
                .to_string(),
            is_exclusive: false,
        },
        0,
    );
    let log_file = conductor
        .drain_events()
        .iter()
        .find_map(|event| match event {
            ClientEvent::PublicationReady { log_file, .. } => Some(log_file.clone()),
            _ => None,
        })
        .unwrap();
    conductor.do_work(1);

    // A producer claims 256 bytes in term 5 and dies before committing.
    let log = RawLog::open(Path::new(&log_file)).unwrap();
    let appender = Appender::new(&log, false);
    let claim = appender.claim(224, i64::MAX).unwrap().unwrap();
    assert_eq!(claim.term_id, 5);
    assert_eq!(claim.term_offset, 0);
    drop(claim);

    // Within the timeout the watchdog leaves the claim alone.
    conductor.do_work(2);
    conductor.do_work(500_000);
    assert_eq!(system.get(SystemCounter::UnblockedPublications).get(), 0);

    // Past the timeout, the gap becomes one 256-byte padding frame.
    conductor.do_work(1_100_000);
    assert_eq!(system.get(SystemCounter::UnblockedPublications).get(), 1);

    let term = log.term(index_by_term(5, 5));
    assert_eq!(frame_type(term, 0), HDR_TYPE_PAD);
    assert_eq!(frame_length_volatile(term, 0), 256);

    // Exactly one unblock, even across further ticks.
    conductor.do_work(2_200_000);
    assert_eq!(system.get(SystemCounter::UnblockedPublications).get(), 1);
}
