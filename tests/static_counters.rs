//! Static counters: idempotent by `(typeId, registrationId)`, ownerless, and
//! they survive the closing of the client that created them.

use std::sync::Arc;

use aqueduct::conductor::DriverConductor;
use aqueduct::config::DriverConfig;
use aqueduct::counters::{
    HeapCounterTable, SystemCounters, NULL_OWNER_ID, STATE_ALLOCATED, STATE_RECLAIMED,
};
use aqueduct::error::ErrorCode;
use aqueduct::event::{ClientCommand, ClientEvent};
use tempfile::TempDir;

const TYPE_ID: i32 = 1101;
const REGISTRATION_ID: i64 = 100;

fn conductor(dir: &TempDir) -> (DriverConductor, HeapCounterTable) {
    let mut config = DriverConfig::default();
    config.dir = dir.path().to_path_buf();
    let counters = HeapCounterTable::new(128, 1_000);
    let system = Arc::new(SystemCounters::allocate(&counters.table).unwrap());
    let conductor = DriverConductor::new(config, Arc::clone(&counters.table), system, None, None);
    (conductor, counters)
}

fn add_static(conductor: &mut DriverConductor, client_id: i64, correlation_id: i64, now: u64) {
    conductor.on_command(
        ClientCommand::AddStaticCounter {
            client_id,
            correlation_id,
            type_id: TYPE_ID,
            key: b"K".to_vec(),
            label: "L".to_string(),
            registration_id: REGISTRATION_ID,
        },
        now,
    );
}

fn counter_ready_id(events: &[ClientEvent], correlation_id: i64) -> i32 {
    events
        .iter()
        .find_map(|event| match event {
            ClientEvent::CounterReady { correlation_id: c, counter_id } if *c == correlation_id => {
                Some(*counter_id)
            }
            _ => None,
        })
        .expect("counter ready")
}

#[test]
fn same_registration_returns_same_counter_across_clients() {
    let dir = TempDir::new().unwrap();
    let (mut conductor, counters) = conductor(&dir);

    add_static(&mut conductor, 1, 10, 0);
    let id_from_a = counter_ready_id(&conductor.drain_events(), 10);
    assert_eq!(counters.table.owner_id(id_from_a), NULL_OWNER_ID);
    assert_eq!(counters.table.label(id_from_a), "L");

    // Closing client A leaves the static counter allocated.
    conductor.on_command(ClientCommand::ClientClose { client_id: 1 }, 1);
    conductor.do_work(2);
    assert_eq!(counters.table.state(id_from_a), STATE_ALLOCATED);

    // Client B asking with the same registration gets the same id, and the
    // original metadata is untouched.
    add_static(&mut conductor, 2, 11, 3);
    let id_from_b = counter_ready_id(&conductor.drain_events(), 11);
    assert_eq!(id_from_b, id_from_a);
    assert_eq!(counters.table.owner_id(id_from_b), NULL_OWNER_ID);
    assert_eq!(counters.table.label(id_from_b), "L");
}

#[test]
fn non_static_collision_is_rejected_with_generic_error() {
    let dir = TempDir::new().unwrap();
    let (mut conductor, _counters) = conductor(&dir);

    add_static(&mut conductor, 1, 10, 0);
    conductor.drain_events();

    // A regular counter whose correlation id collides with the static
    // registration is refused.
    conductor.on_command(
        ClientCommand::AddCounter {
            client_id: 2,
            correlation_id: REGISTRATION_ID,
            type_id: TYPE_ID,
            key: Vec::new(),
            label: "clash".to_string(),
        },
        1,
    );
    let events = conductor.drain_events();
    assert!(events.iter().any(|event| matches!(
        event,
        ClientEvent::Error { code: ErrorCode::GenericError, .. }
    )));
}

#[test]
fn owned_counters_are_reclaimed_on_client_timeout() {
    let dir = TempDir::new().unwrap();
    let (mut conductor, counters) = conductor(&dir);

    conductor.on_command(
        ClientCommand::AddCounter {
            client_id: 7,
            correlation_id: 20,
            type_id: 9,
            key: Vec::new(),
            label: "owned".to_string(),
        },
        0,
    );
    let owned_id = counter_ready_id(&conductor.drain_events(), 20);
    add_static(&mut conductor, 7, 21, 0);
    let static_id = counter_ready_id(&conductor.drain_events(), 21);

    // No keepalives: the client ages out.
    let past_liveness = 10_000_000_001;
    conductor.do_work(past_liveness);
    let events = conductor.drain_events();
    assert!(events
        .iter()
        .any(|event| matches!(event, ClientEvent::ClientTimeout { client_id: 7 })));
    assert!(events.iter().any(|event| matches!(
        event,
        ClientEvent::UnavailableCounter { counter_id, .. } if *counter_id == owned_id
    )));
    assert_eq!(counters.table.state(owned_id), STATE_RECLAIMED);
    assert_eq!(counters.table.state(static_id), STATE_ALLOCATED);

    // After the reuse grace period the slot returns to the pool.
    conductor.do_work(past_liveness + 1_001);
    assert_eq!(counters.table.state(owned_id), aqueduct::counters::STATE_UNUSED);
}
