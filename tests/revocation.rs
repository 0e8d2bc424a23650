//! Producer-initiated revocation: the stream ends at the revoked position
//! within one conductor tick and the log is freed after the linger.

use std::path::Path;
use std::sync::Arc;

use aqueduct::conductor::DriverConductor;
use aqueduct::config::DriverConfig;
use aqueduct::counters::{HeapCounterTable, SystemCounter, SystemCounters};
use aqueduct::event::{ClientCommand, ClientEvent};
use aqueduct::logbuffer::meta::RawLog;
use aqueduct::logbuffer::term::Appender;
use aqueduct::publication::PublicationState;
use tempfile::TempDir;

#[test]
fn revoked_publication_lingers_then_frees_the_log() {
    let dir = TempDir::new().unwrap();
    let mut config = DriverConfig::default();
    config.dir = dir.path().to_path_buf();
    config.ipc_term_buffer_length = 64 * 1024;
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
            stream_id: 42,
            channel: "aqueduct:ipc?term-length=64k|linger=1ms".to_string(),
            is_exclusive: false,
        },
        0,
    );
    let events = conductor.drain_events();
    let (registration_id, log_file) = events
        .iter()
        .find_map(|event| match event {
            ClientEvent::PublicationReady { registration_id, log_file, .. } => {
                Some((*registration_id, log_file.clone()))
            }
            _ => None,
        })
        .unwrap();

    conductor.do_work(1);

    // Publish up to position 4096, then revoke from the producer side.
    let log = RawLog::open(Path::new(&log_file)).unwrap();
    let appender = Appender::new(&log, false);
    for _ in 0..16 {
        appender.append(&[7u8; 224], i64::MAX).unwrap().unwrap();
    }
    {
        let publication = conductor.ipc_publication(registration_id).unwrap();
        assert_eq!(publication.producer_position(), 4096);
        publication.revoke();
    }

    // One tick: disconnected, end of stream at the revoked position, LINGER.
    conductor.do_work(2);
    {
        let publication = conductor.ipc_publication(registration_id).unwrap();
        assert_eq!(publication.state(), PublicationState::Linger);
    }
    assert!(!log.meta().is_connected());
    assert_eq!(log.meta().end_of_stream_position(), 4096);
    assert_eq!(system.get(SystemCounter::PublicationsRevoked).get(), 1);
    let events = conductor.drain_events();
    assert!(events
        .iter()
        .any(|event| matches!(event, ClientEvent::PublicationError { .. })));

    // Still referenced: the linger holds even past the timeout.
    conductor.do_work(2_000_003);
    assert!(conductor.ipc_publication(registration_id).is_some());

    conductor.on_command(
        ClientCommand::RemovePublication {
            client_id: 1,
            correlation_id: 6,
            registration_id,
        },
        2_000_004,
    );
    conductor.do_work(4_000_005);

    // DONE: the publication is reaped and its log file deleted.
    assert!(conductor.ipc_publication(registration_id).is_none());
    assert!(!Path::new(&log_file).exists());
}
