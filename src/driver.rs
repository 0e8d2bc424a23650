//! Media driver assembly.
//!
//! Composes the conductor, sender and receiver agents onto one, two or three
//! threads per the configured threading mode. Each agent is a `do_work`
//! function invoked in a duty cycle with an idle strategy between cycles;
//! no agent parks on a lock on its data path.

use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::channel::ChannelUri;
use crate::clock::{Clock, NanoClock};
use crate::cnc::{CncFile, ErrorLog};
use crate::conductor::{AgentCommand, DriverConductor};
use crate::config::{DriverConfig, ThreadingMode};
use crate::counters::{CounterTable, SystemCounters};
use crate::event::{ClientCommand, ClientEvent};
use crate::image::PublicationImage;
use crate::logbuffer::frame::{
    FrameHeader, HDR_TYPE_DATA, HDR_TYPE_ERR, HDR_TYPE_NAK, HDR_TYPE_PAD, HDR_TYPE_RTTM,
    HDR_TYPE_SETUP, HDR_TYPE_SM,
};
use crate::loss::LossReport;
use crate::protocol::{NakFrame, RttMeasurement, SetupFrame, StatusMessage};
use crate::publication::network::NetworkPublication;
use crate::ring::RingBuffer;
use crate::{Error, Result};

/// How an agent waits when a duty cycle found no work.
#[derive(Clone, Copy, Debug)]
pub enum IdleStrategy {
    /// Burn the core; lowest wake latency.
    BusySpin,
    /// Spin briefly, yield, then sleep up to a cap.
    Backoff { max_park: Duration },
    /// Fixed-period polling.
    Sleep(Duration),
}

impl Default for IdleStrategy {
    fn default() -> Self {
        IdleStrategy::Backoff { max_park: Duration::from_millis(1) }
    }
}

struct IdleState {
    strategy: IdleStrategy,
    spins: u32,
}

impl IdleState {
    fn new(strategy: IdleStrategy) -> Self {
        Self { strategy, spins: 0 }
    }

    fn idle(&mut self, work_count: usize) {
        if work_count > 0 {
            self.spins = 0;
            return;
        }
        match self.strategy {
            IdleStrategy::BusySpin => std::hint::spin_loop(),
            IdleStrategy::Sleep(duration) => std::thread::sleep(duration),
            IdleStrategy::Backoff { max_park } => {
                self.spins += 1;
                if self.spins < 64 {
                    std::hint::spin_loop();
                } else if self.spins < 128 {
                    std::thread::yield_now();
                } else {
                    let exponent = std::cmp::min(self.spins - 128, 10);
                    let park = Duration::from_micros(1 << exponent);
                    std::thread::sleep(std::cmp::min(park, max_park));
                }
            }
        }
    }
}

type WorkFn = Box<dyn FnMut(u64) -> usize + Send>;

fn run_agents(
    name: &str,
    mut agents: Vec<WorkFn>,
    idle: IdleStrategy,
    shutdown: Arc<AtomicBool>,
) -> JoinHandle<()> {
    let name = name.to_string();
    std::thread::Builder::new()
        .name(name.clone())
        .spawn(move || {
            let clock = NanoClock::new();
            let mut idle = IdleState::new(idle);
            while !shutdown.load(Ordering::Acquire) {
                let now_ns = clock.nano_time();
                let mut work_count = 0;
                for agent in agents.iter_mut() {
                    work_count += agent(now_ns);
                }
                idle.idle(work_count);
            }
        })
        .expect("spawn agent thread")
}

/// The sender agent: owns one connected socket per network publication.
struct SenderAgent {
    conductor: Arc<Mutex<DriverConductor>>,
    publications: Vec<(Arc<NetworkPublication>, UdpSocket)>,
    recv_buffer: Vec<u8>,
}

impl SenderAgent {
    fn new(conductor: Arc<Mutex<DriverConductor>>) -> Self {
        Self {
            conductor,
            publications: Vec::new(),
            recv_buffer: vec![0u8; 64 * 1024],
        }
    }

    fn endpoint_of(publication: &NetworkPublication) -> Result<SocketAddr> {
        let uri = ChannelUri::parse(publication.channel())?;
        let endpoint = uri
            .endpoint()
            .ok_or_else(|| Error::InvalidChannel("publication channel lacks endpoint".into()))?;
        endpoint
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::InvalidChannel(format!("unresolvable endpoint: {endpoint}")))
    }

    fn drain_commands(&mut self) {
        loop {
            let command = {
                let mut conductor = self.conductor.lock().expect("conductor lock");
                conductor.next_sender_command()
            };
            match command {
                Some(AgentCommand::AddNetworkPublication(publication)) => {
                    match Self::attach(&publication) {
                        Ok(socket) => self.publications.push((publication, socket)),
                        Err(err) => {
                            publication.sender_release();
                            log::warn!("sender attach failed: {err}");
                        }
                    }
                }
                Some(AgentCommand::RemoveNetworkPublication(publication)) => {
                    self.publications.retain(|(existing, _)| {
                        if Arc::ptr_eq(existing, &publication) {
                            existing.sender_release();
                            false
                        } else {
                            true
                        }
                    });
                    // Releasing an unattached publication keeps linger bounded.
                    publication.sender_release();
                }
                Some(_) | None => break,
            }
        }
    }

    fn do_work(&mut self, now_ns: u64) -> usize {
        self.drain_commands();
        let mut work_count = 0;
        for (publication, socket) in &self.publications {
            // Control frames from receivers arrive on the connected socket.
            while let Ok(length) = socket.recv(&mut self.recv_buffer) {
                if length < 8 {
                    continue;
                }
                let buf = &self.recv_buffer[..length];
                let frame_type = u16::from_le_bytes(buf[6..8].try_into().expect("slice length"));
                match frame_type {
                    HDR_TYPE_SM => {
                        if let Ok(sm) = StatusMessage::decode(buf) {
                            publication.on_status_message(&sm, now_ns);
                        }
                    }
                    HDR_TYPE_NAK => {
                        if let Ok(nak) = NakFrame::decode(buf) {
                            publication.on_nak(&nak, now_ns);
                        }
                    }
                    HDR_TYPE_RTTM => {
                        if let Ok(rttm) = RttMeasurement::decode(buf) {
                            if let Some(reply) = publication.on_rtt_measurement(&rttm, now_ns) {
                                let mut out = [0u8; RttMeasurement::LENGTH];
                                let reply_length = reply.encode(&mut out);
                                let _ = socket.send(&out[..reply_length]);
                            }
                        }
                    }
                    HDR_TYPE_ERR => {
                        log::warn!(
                            "error frame from receiver on stream {}",
                            publication.stream_id()
                        );
                    }
                    _ => {}
                }
                work_count += 1;
            }

            work_count += publication.send(now_ns, &mut |bytes| {
                let _ = socket.send(bytes);
            });
        }
        work_count
    }

    fn attach(publication: &NetworkPublication) -> Result<UdpSocket> {
        let endpoint = Self::endpoint_of(publication)?;
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        socket.connect(endpoint)?;
        Ok(socket)
    }
}

/// The receiver agent: owns one bound socket per UDP subscription endpoint
/// and routes datagrams to images.
struct ReceiverAgent {
    conductor: Arc<Mutex<DriverConductor>>,
    sockets: Vec<(i64, UdpSocket)>,
    images: HashMap<(i32, i32), (Arc<PublicationImage>, SocketAddr)>,
    recv_buffer: Vec<u8>,
}

impl ReceiverAgent {
    fn new(conductor: Arc<Mutex<DriverConductor>>) -> Self {
        Self {
            conductor,
            sockets: Vec::new(),
            images: HashMap::new(),
            recv_buffer: vec![0u8; 64 * 1024],
        }
    }

    fn drain_commands(&mut self) {
        loop {
            let command = {
                let mut conductor = self.conductor.lock().expect("conductor lock");
                conductor.next_receiver_command()
            };
            match command {
                Some(AgentCommand::AddSubscriptionEndpoint { registration_id, endpoint }) => {
                    match Self::bind(&endpoint) {
                        Ok(socket) => self.sockets.push((registration_id, socket)),
                        Err(err) => log::warn!("receiver bind {endpoint} failed: {err}"),
                    }
                }
                Some(AgentCommand::RemoveSubscriptionEndpoint { registration_id }) => {
                    self.sockets.retain(|(id, _)| *id != registration_id);
                }
                Some(AgentCommand::RemoveImage(image)) => {
                    self.images
                        .retain(|_, (existing, _)| !Arc::ptr_eq(existing, &image));
                }
                Some(_) | None => break,
            }
        }
    }

    fn bind(endpoint: &str) -> Result<UdpSocket> {
        let addr = endpoint
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::InvalidChannel(format!("unresolvable endpoint: {endpoint}")))?;
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    fn do_work(&mut self, now_ns: u64) -> usize {
        self.drain_commands();
        let mut work_count = 0;

        for index in 0..self.sockets.len() {
            loop {
                let (length, src) = match self.sockets[index].1.recv_from(&mut self.recv_buffer) {
                    Ok(received) => received,
                    Err(_) => break,
                };
                if length < 8 {
                    continue;
                }
                work_count += 1;
                let datagram = self.recv_buffer[..length].to_vec();
                let frame_type =
                    u16::from_le_bytes(datagram[6..8].try_into().expect("slice length"));
                match frame_type {
                    HDR_TYPE_SETUP => {
                        if let Ok(setup) = SetupFrame::decode(&datagram) {
                            self.on_setup(&setup, src, now_ns);
                        }
                    }
                    HDR_TYPE_DATA | HDR_TYPE_PAD => {
                        if let Ok(header) = FrameHeader::from_bytes(&datagram) {
                            let key = (header.session_id, header.stream_id);
                            if let Some((image, _)) = self.images.get(&key) {
                                image.insert_packet(
                                    header.term_id,
                                    header.term_offset,
                                    &datagram,
                                    now_ns,
                                );
                            }
                        }
                    }
                    _ => {}
                }
            }
        }

        work_count += self.pump_feedback(now_ns);
        work_count
    }

    fn on_setup(&mut self, setup: &SetupFrame, src: SocketAddr, now_ns: u64) {
        let key = (setup.session_id, setup.stream_id);
        if self.images.contains_key(&key) {
            return;
        }
        let created = {
            let mut conductor = self.conductor.lock().expect("conductor lock");
            conductor.on_create_publication_image(setup, &src.to_string(), now_ns)
        };
        match created {
            Ok(Some(image)) => {
                self.images.insert(key, (image, src));
            }
            Ok(None) => {}
            Err(err) => log::warn!("image create failed: {err}"),
        }
    }

    /// Status messages, NAKs and rejection errors flow back to each source.
    fn pump_feedback(&mut self, now_ns: u64) -> usize {
        let now_ms = (now_ns / 1_000_000) as i64;
        let mut work_count = 0;
        let mut buf = [0u8; 128];
        for (_, socket) in &self.sockets {
            for ((_, _), (image, control_addr)) in self.images.iter() {
                if let Some(sm) = image.poll_status_message(now_ns) {
                    let length = sm.encode(&mut buf);
                    let _ = socket.send_to(&buf[..length], control_addr);
                    work_count += 1;
                }
                if let Some(nak) = image.poll_nak(now_ns, now_ms) {
                    let length = nak.encode(&mut buf);
                    let _ = socket.send_to(&buf[..length], control_addr);
                    work_count += 1;
                }
                if let Some(error_frame) = image.take_pending_error() {
                    let mut err_buf = vec![0u8; 1200];
                    let length = error_frame.encode(&mut err_buf);
                    let _ = socket.send_to(&err_buf[..length], control_addr);
                    work_count += 1;
                }
            }
        }
        work_count
    }
}

/// A running media driver: cnc file, counters, conductor and agents.
pub struct MediaDriver {
    conductor: Arc<Mutex<DriverConductor>>,
    command_tx: Sender<ClientCommand>,
    events: Arc<Mutex<Vec<ClientEvent>>>,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
    _cnc: Arc<CncFile>,
}

impl MediaDriver {
    pub fn launch(config: DriverConfig) -> Result<Self> {
        config.validate()?;
        if config.dir_delete_on_start && config.dir.exists() {
            std::fs::remove_dir_all(&config.dir)?;
        }
        std::fs::create_dir_all(&config.dir)?;

        let clock = NanoClock::new();
        let now_ns = clock.nano_time();
        let cnc = Arc::new(CncFile::create(&config, (now_ns / 1_000_000) as i64)?);

        let counters = Arc::new(CounterTable::new(
            cnc.counters_values,
            cnc.counters_metadata,
            config.counter_free_to_reuse_timeout_ns,
        ));
        let system = Arc::new(SystemCounters::allocate(&counters)?);
        let error_log = ErrorLog::new(cnc.error_log);
        let loss_buffer = crate::buffer::AlignedBuffer::new(config.loss_report_buffer_length);
        let loss_report = Arc::new(Mutex::new(LossReport::new(loss_buffer.buffer())));
        // The to-driver ring exists for out-of-process clients; in-process
        // commands arrive typed through the channel below.
        let _command_ring = RingBuffer::new(cnc.to_driver)?;

        let conductor = Arc::new(Mutex::new(DriverConductor::new(
            config.clone(),
            Arc::clone(&counters),
            Arc::clone(&system),
            Some(error_log),
            Some(loss_report),
        )));

        let (command_tx, command_rx) = mpsc::channel::<ClientCommand>();
        let events = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let conductor_work = Self::conductor_work_fn(
            Arc::clone(&conductor),
            command_rx,
            Arc::clone(&events),
            Arc::clone(&cnc),
            Arc::clone(&shutdown),
            loss_buffer,
        );
        let mut sender = SenderAgent::new(Arc::clone(&conductor));
        let sender_work: WorkFn = Box::new(move |now_ns| sender.do_work(now_ns));
        let mut receiver = ReceiverAgent::new(Arc::clone(&conductor));
        let receiver_work: WorkFn = Box::new(move |now_ns| receiver.do_work(now_ns));

        let idle = IdleStrategy::default();
        let threads = match config.threading_mode {
            ThreadingMode::Shared => vec![run_agents(
                "aqueduct-driver",
                vec![conductor_work, sender_work, receiver_work],
                idle,
                Arc::clone(&shutdown),
            )],
            ThreadingMode::SharedNetwork => vec![
                run_agents("aqueduct-conductor", vec![conductor_work], idle, Arc::clone(&shutdown)),
                run_agents(
                    "aqueduct-network",
                    vec![sender_work, receiver_work],
                    idle,
                    Arc::clone(&shutdown),
                ),
            ],
            ThreadingMode::Dedicated => vec![
                run_agents("aqueduct-conductor", vec![conductor_work], idle, Arc::clone(&shutdown)),
                run_agents("aqueduct-sender", vec![sender_work], idle, Arc::clone(&shutdown)),
                run_agents("aqueduct-receiver", vec![receiver_work], idle, Arc::clone(&shutdown)),
            ],
        };

        Ok(Self {
            conductor,
            command_tx,
            events,
            shutdown,
            threads,
            _cnc: cnc,
        })
    }

    fn conductor_work_fn(
        conductor: Arc<Mutex<DriverConductor>>,
        command_rx: Receiver<ClientCommand>,
        events: Arc<Mutex<Vec<ClientEvent>>>,
        cnc: Arc<CncFile>,
        shutdown: Arc<AtomicBool>,
        loss_buffer: crate::buffer::AlignedBuffer,
    ) -> WorkFn {
        Box::new(move |now_ns| {
            // The loss report backing store must live as long as this agent.
            let _ = &loss_buffer;
            let mut work_count = 0;
            let mut conductor = conductor.lock().expect("conductor lock");
            loop {
                match command_rx.try_recv() {
                    Ok(command) => {
                        conductor.on_command(command, now_ns);
                        work_count += 1;
                    }
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
                }
            }
            work_count += conductor.do_work(now_ns);
            let new_events = conductor.drain_events();
            if !new_events.is_empty() {
                events.lock().expect("events lock").extend(new_events);
            }
            cnc.update_heartbeat((now_ns / 1_000_000) as i64);
            if conductor.is_terminate_requested() {
                shutdown.store(true, Ordering::Release);
            }
            work_count
        })
    }

    pub fn command_sender(&self) -> Sender<ClientCommand> {
        self.command_tx.clone()
    }

    /// Drains the events emitted to clients since the last poll.
    pub fn poll_events(&self) -> Vec<ClientEvent> {
        std::mem::take(&mut *self.events.lock().expect("events lock"))
    }

    pub fn conductor(&self) -> Arc<Mutex<DriverConductor>> {
        Arc::clone(&self.conductor)
    }

    pub fn close(mut self) {
        self.shutdown_and_join();
    }

    fn shutdown_and_join(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for MediaDriver {
    fn drop(&mut self) {
        self.shutdown_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> DriverConfig {
        let mut config = DriverConfig::default();
        config.dir = dir.path().join("driver");
        config.conductor_buffer_length = 64 * 1024;
        config.to_clients_buffer_length = 64 * 1024;
        config.counter_values_buffer_length = 64 * 1024;
        config.error_buffer_length = 64 * 1024;
        config.loss_report_buffer_length = 64 * 1024;
        config.ipc_term_buffer_length = 64 * 1024;
        config.term_buffer_length = 64 * 1024;
        config
    }

    #[test]
    fn launch_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let driver = MediaDriver::launch(test_config(&dir)).unwrap();
        assert!(CncFile::path(&dir.path().join("driver")).exists());
        driver.close();
    }

    #[test]
    fn add_publication_round_trip_through_agents() {
        let dir = TempDir::new().unwrap();
        let driver = MediaDriver::launch(test_config(&dir)).unwrap();
        let commands = driver.command_sender();
        commands
            .send(ClientCommand::AddPublication {
                client_id: 1,
                correlation_id: 100,
                stream_id: 1001,
                channel: "aqueduct:ipc".to_string(),
                is_exclusive: false,
            })
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut ready = None;
        while std::time::Instant::now() < deadline {
            for event in driver.poll_events() {
                if let ClientEvent::PublicationReady { correlation_id, .. } = &event {
                    assert_eq!(*correlation_id, 100);
                    ready = Some(event);
                }
            }
            if ready.is_some() {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(ready.is_some(), "publication ready event not observed");
        driver.close();
    }
}
