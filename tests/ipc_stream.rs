//! An IPC stream end to end: conductor wiring, mapped log, framing and
//! position arithmetic as a publisher and reader would observe them.

use std::path::Path;
use std::sync::Arc;

use aqueduct::conductor::DriverConductor;
use aqueduct::config::DriverConfig;
use aqueduct::counters::{HeapCounterTable, SystemCounters};
use aqueduct::event::{ClientCommand, ClientEvent};
use aqueduct::logbuffer::frame::{frame_length_volatile, HEADER_LENGTH, UNFRAGMENTED};
use aqueduct::logbuffer::meta::RawLog;
use aqueduct::logbuffer::term::Appender;
use tempfile::TempDir;

fn conductor(dir: &TempDir) -> (DriverConductor, HeapCounterTable) {
    let mut config = DriverConfig::default();
    config.dir = dir.path().to_path_buf();
    config.ipc_term_buffer_length = 64 * 1024;
    let counters = HeapCounterTable::new(128, 0);
    let system = Arc::new(SystemCounters::allocate(&counters.table).unwrap());
    let conductor = DriverConductor::new(config, Arc::clone(&counters.table), system, None, None);
    (conductor, counters)
}

#[test]
fn ten_messages_land_at_expected_positions() {
    let dir = TempDir::new().unwrap();
    let (mut conductor, counters) = conductor(&dir);

    conductor.on_command(
        ClientCommand::AddSubscription {
            client_id: 1,
            correlation_id: 10,
            stream_id: 1001,
            channel: "aqueduct:ipc".to_string(),
        },
        0,
    );
    conductor.on_command(
        ClientCommand::AddPublication {
            client_id: 2,
            correlation_id: 11,
            stream_id: 1001,
            channel: "aqueduct:ipc?term-length=64k|init-term-id=0".to_string(),
            is_exclusive: false,
        },
        0,
    );

    let events = conductor.drain_events();
    let (log_file, limit_counter_id) = events
        .iter()
        .find_map(|event| match event {
            ClientEvent::PublicationReady { log_file, position_limit_counter_id, .. } => {
                Some((log_file.clone(), *position_limit_counter_id))
            }
            _ => None,
        })
        .expect("publication ready");
    assert!(events
        .iter()
        .any(|event| matches!(event, ClientEvent::SubscriptionReady { .. })));
    assert!(events
        .iter()
        .any(|event| matches!(event, ClientEvent::AvailableImage { join_position: 0, .. })));

    // First conductor pass opens the publisher window.
    conductor.do_work(1);
    let publisher_limit = counters.table.counter(limit_counter_id);
    assert_eq!(publisher_limit.get_volatile(), 32 * 1024);

    // The publisher maps the same log file the driver allocated.
    let log = RawLog::open(Path::new(&log_file)).unwrap();
    let appender = Appender::new(&log, false);

    let mut positions = Vec::new();
    for sequence in 0..10u8 {
        let payload = [sequence; 16];
        let position = appender
            .append(&payload, publisher_limit.get_volatile())
            .unwrap()
            .unwrap();
        positions.push(position);
    }
    assert_eq!(positions, vec![0, 48, 96, 144, 192, 240, 288, 336, 384, 432]);

    // Reader side: walk the committed frames and check contents.
    let term = log.term(0);
    let mut offset = 0usize;
    let mut observed = Vec::new();
    for sequence in 0..10u8 {
        let frame_length = frame_length_volatile(term, offset);
        assert_eq!(frame_length as usize, HEADER_LENGTH + 16);
        assert_eq!(term.as_slice()[offset + 5], UNFRAGMENTED);
        assert_eq!(
            &term.as_slice()[offset + HEADER_LENGTH..offset + HEADER_LENGTH + 16],
            &[sequence; 16]
        );
        observed.push(offset as i64);
        offset += 48;
    }
    assert_eq!(observed, positions);

    // No more committed frames past the last message.
    assert_eq!(frame_length_volatile(term, offset), 0);
}

#[test]
fn subscriber_lag_throttles_the_publisher() {
    let dir = TempDir::new().unwrap();
    let (mut conductor, counters) = conductor(&dir);

    conductor.on_command(
        ClientCommand::AddSubscription {
            client_id: 1,
            correlation_id: 10,
            stream_id: 7,
            channel: "aqueduct:ipc".to_string(),
        },
        0,
    );
    conductor.on_command(
        ClientCommand::AddPublication {
            client_id: 2,
            correlation_id: 11,
            stream_id: 7,
            channel: "aqueduct:ipc?term-length=64k|pub-wnd=4096".to_string(),
            is_exclusive: false,
        },
        0,
    );
    let events = conductor.drain_events();
    let (log_file, limit_counter_id) = events
        .iter()
        .find_map(|event| match event {
            ClientEvent::PublicationReady { log_file, position_limit_counter_id, .. } => {
                Some((log_file.clone(), *position_limit_counter_id))
            }
            _ => None,
        })
        .unwrap();
    assert!(events
        .iter()
        .any(|event| matches!(event, ClientEvent::AvailableImage { .. })));
    // Allocation order: pub-pos, pub-lmt, then the subscriber position.
    let subscriber_counter_id = limit_counter_id + 1;
    conductor.do_work(1);

    let log = RawLog::open(Path::new(&log_file)).unwrap();
    let appender = Appender::new(&log, false);
    let publisher_limit = counters.table.counter(limit_counter_id);

    // Fill the window; the next append back-pressures.
    let mut accepted = 0;
    loop {
        match appender.append(&[0u8; 992], publisher_limit.get_volatile()).unwrap() {
            Ok(_) => accepted += 1,
            Err(_) => break,
        }
    }
    assert_eq!(accepted, 4); // 4 KiB window over 1 KiB frames

    // The subscriber catching up reopens the window after a conductor pass.
    let subscriber_position = counters.table.counter(subscriber_counter_id);
    subscriber_position.set_release(4 * 1024);
    conductor.do_work(2);
    assert!(publisher_limit.get_volatile() > 4 * 1024);
    assert!(appender.append(&[0u8; 992], publisher_limit.get_volatile()).unwrap().is_ok());
}
