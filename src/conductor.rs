//! The driver conductor: a serial event loop owning every publication,
//! image, subscription, client and counter lifecycle.
//!
//! One `do_work` pass drains client commands, runs the time events of every
//! managed resource, ages out silent clients, sweeps reclaimed counters and
//! checks its own service interval. Nothing outside this module mutates
//! lifecycle state; the sender and receiver agents get their resources
//! handed over as `Arc`s through command queues.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crate::channel::{ChannelUri, Media, PublicationParams, SubscriptionParams};
use crate::cnc::ErrorLog;
use crate::config::DriverConfig;
use crate::counters::{
    CounterTable, SystemCounter, SystemCounters, NULL_OWNER_ID, PUBLISHER_LIMIT_TYPE_ID,
    PUBLISHER_POSITION_TYPE_ID, RECEIVER_HWM_TYPE_ID, RECEIVER_NAKS_SENT_TYPE_ID,
    RECEIVER_POSITION_TYPE_ID, SENDER_BPE_TYPE_ID, SENDER_LIMIT_TYPE_ID, SENDER_POSITION_TYPE_ID,
    SUBSCRIBER_POSITION_TYPE_ID,
};
use crate::event::{ClientCommand, ClientEvent, Notification};
use crate::flow_control::FlowControl;
use crate::image::{FeedbackDelayGenerator, ImageParams, PublicationImage};
use crate::logbuffer::meta::{LogMetaInit, RawLog};
use crate::logbuffer::position::position_bits_to_shift;
use crate::loss::LossReport;
use crate::protocol::SetupFrame;
use crate::publication::ipc::{IpcPublication, IpcPublicationParams};
use crate::publication::network::{NetworkPublication, NetworkPublicationParams};
use crate::publication::PublicationState;
use crate::subscribable::SubscriberPosition;
use crate::{Error, Result};

/// Resource handovers to the sender and receiver agents.
pub enum AgentCommand {
    AddNetworkPublication(Arc<NetworkPublication>),
    RemoveNetworkPublication(Arc<NetworkPublication>),
    AddImage(Arc<PublicationImage>),
    RemoveImage(Arc<PublicationImage>),
    AddSubscriptionEndpoint { registration_id: i64, endpoint: String },
    RemoveSubscriptionEndpoint { registration_id: i64 },
}

struct Client {
    client_id: i64,
    time_of_last_keepalive_ns: u64,
}

struct PublicationLink {
    registration_id: i64,
    client_id: i64,
}

pub struct SubscriptionLink {
    pub registration_id: i64,
    pub client_id: i64,
    pub stream_id: i32,
    pub channel: ChannelUri,
    pub params: SubscriptionParams,
}

pub struct DriverConductor {
    config: DriverConfig,
    counters: Arc<CounterTable>,
    system: Arc<SystemCounters>,
    error_log: Option<ErrorLog>,
    loss_report: Option<Arc<Mutex<LossReport>>>,

    ipc_publications: Vec<IpcPublication>,
    network_publications: Vec<Arc<NetworkPublication>>,
    images: Vec<Arc<PublicationImage>>,
    subscriptions: Vec<SubscriptionLink>,
    publication_links: Vec<PublicationLink>,
    clients: Vec<Client>,

    events: VecDeque<ClientEvent>,
    sender_commands: VecDeque<AgentCommand>,
    receiver_commands: VecDeque<AgentCommand>,

    next_registration_id: i64,
    next_session_id: i32,
    time_of_last_work_ns: u64,
    terminate_requested: bool,
}

impl DriverConductor {
    pub fn new(
        config: DriverConfig,
        counters: Arc<CounterTable>,
        system: Arc<SystemCounters>,
        error_log: Option<ErrorLog>,
        loss_report: Option<Arc<Mutex<LossReport>>>,
    ) -> Self {
        Self {
            config,
            counters,
            system,
            error_log,
            loss_report,
            ipc_publications: Vec::new(),
            network_publications: Vec::new(),
            images: Vec::new(),
            subscriptions: Vec::new(),
            publication_links: Vec::new(),
            clients: Vec::new(),
            events: VecDeque::new(),
            sender_commands: VecDeque::new(),
            receiver_commands: VecDeque::new(),
            next_registration_id: 1,
            next_session_id: 1,
            time_of_last_work_ns: 0,
            terminate_requested: false,
        }
    }

    pub fn is_terminate_requested(&self) -> bool {
        self.terminate_requested
    }

    pub fn drain_events(&mut self) -> Vec<ClientEvent> {
        self.events.drain(..).collect()
    }

    pub fn next_sender_command(&mut self) -> Option<AgentCommand> {
        self.sender_commands.pop_front()
    }

    pub fn next_receiver_command(&mut self) -> Option<AgentCommand> {
        self.receiver_commands.pop_front()
    }

    fn next_registration_id(&mut self) -> i64 {
        let id = self.next_registration_id;
        self.next_registration_id += 1;
        id
    }

    fn record_error(&mut self, err: &Error, now_ns: u64) {
        self.system.get(SystemCounter::Errors).increment();
        if let Some(error_log) = &self.error_log {
            error_log.record(&err.to_string(), (now_ns / 1_000_000) as i64);
        }
        log::warn!("driver error: {err}");
    }

    fn ensure_client(&mut self, client_id: i64, now_ns: u64) {
        match self.clients.iter_mut().find(|c| c.client_id == client_id) {
            Some(client) => client.time_of_last_keepalive_ns = now_ns,
            None => self.clients.push(Client {
                client_id,
                time_of_last_keepalive_ns: now_ns,
            }),
        }
    }

    /// Dispatches one decoded client command.
    pub fn on_command(&mut self, command: ClientCommand, now_ns: u64) {
        match command {
            ClientCommand::AddPublication {
                client_id,
                correlation_id,
                stream_id,
                channel,
                is_exclusive,
            } => {
                self.ensure_client(client_id, now_ns);
                if let Err(err) =
                    self.add_publication(client_id, correlation_id, stream_id, &channel, is_exclusive, now_ns)
                {
                    self.reply_error(correlation_id, &err, now_ns);
                }
            }
            ClientCommand::RemovePublication { client_id, correlation_id, registration_id } => {
                self.ensure_client(client_id, now_ns);
                match self.remove_publication_link(client_id, registration_id) {
                    Ok(()) => self.events.push_back(ClientEvent::OperationSuccess { correlation_id }),
                    Err(err) => self.reply_error(correlation_id, &err, now_ns),
                }
            }
            ClientCommand::AddSubscription { client_id, correlation_id, stream_id, channel } => {
                self.ensure_client(client_id, now_ns);
                if let Err(err) =
                    self.add_subscription(client_id, correlation_id, stream_id, &channel, now_ns)
                {
                    self.reply_error(correlation_id, &err, now_ns);
                }
            }
            ClientCommand::RemoveSubscription { client_id, correlation_id, registration_id } => {
                self.ensure_client(client_id, now_ns);
                match self.remove_subscription(registration_id, now_ns) {
                    Ok(()) => self.events.push_back(ClientEvent::OperationSuccess { correlation_id }),
                    Err(err) => self.reply_error(correlation_id, &err, now_ns),
                }
            }
            ClientCommand::AddCounter { client_id, correlation_id, type_id, key, label } => {
                self.ensure_client(client_id, now_ns);
                let result = self
                    .counters
                    .check_static_collision(type_id, correlation_id)
                    .and_then(|()| {
                        self.counters.allocate(type_id, &key, &label, correlation_id, client_id)
                    });
                match result {
                    Ok(counter) => self.events.push_back(ClientEvent::CounterReady {
                        correlation_id,
                        counter_id: counter.id(),
                    }),
                    Err(err) => self.reply_error(correlation_id, &err, now_ns),
                }
            }
            ClientCommand::AddStaticCounter {
                client_id,
                correlation_id,
                type_id,
                key,
                label,
                registration_id,
            } => {
                self.ensure_client(client_id, now_ns);
                match self.counters.allocate_static(type_id, &key, &label, registration_id) {
                    Ok(counter) => self.events.push_back(ClientEvent::CounterReady {
                        correlation_id,
                        counter_id: counter.id(),
                    }),
                    Err(err) => self.reply_error(correlation_id, &err, now_ns),
                }
            }
            ClientCommand::RemoveCounter { client_id, correlation_id, counter_id } => {
                self.ensure_client(client_id, now_ns);
                if counter_id < 0
                    || counter_id as usize >= self.counters.capacity()
                    || self.counters.state(counter_id) != crate::counters::STATE_ALLOCATED
                    || self.counters.owner_id(counter_id) != client_id
                {
                    self.reply_error(
                        correlation_id,
                        &Error::Generic(format!("unknown counter: {counter_id}")),
                        now_ns,
                    );
                } else {
                    let registration_id = self.counters.registration_id(counter_id);
                    self.counters.free(counter_id, now_ns);
                    self.events.push_back(ClientEvent::OperationSuccess { correlation_id });
                    self.events.push_back(ClientEvent::UnavailableCounter {
                        registration_id,
                        counter_id,
                    });
                }
            }
            ClientCommand::ClientKeepalive { client_id } => {
                self.ensure_client(client_id, now_ns);
            }
            ClientCommand::ClientClose { client_id } => {
                self.close_client(client_id, now_ns, false);
            }
            ClientCommand::RejectImage {
                client_id,
                correlation_id,
                image_correlation_id,
                position: _,
                reason,
            } => {
                self.ensure_client(client_id, now_ns);
                match self.reject_image(image_correlation_id, &reason, now_ns) {
                    Ok(()) => self.events.push_back(ClientEvent::OperationSuccess { correlation_id }),
                    Err(err) => self.reply_error(correlation_id, &err, now_ns),
                }
            }
            ClientCommand::AddDestination { client_id, correlation_id, .. }
            | ClientCommand::RemoveDestination { client_id, correlation_id, .. } => {
                self.ensure_client(client_id, now_ns);
                self.reply_error(
                    correlation_id,
                    &Error::Unsupported("manual destinations need control-mode=manual channels"),
                    now_ns,
                );
            }
            ClientCommand::TerminateDriver { client_id } => {
                self.ensure_client(client_id, now_ns);
                self.terminate_requested = true;
            }
        }
    }

    fn reply_error(&mut self, correlation_id: i64, err: &Error, now_ns: u64) {
        self.record_error(err, now_ns);
        self.events.push_back(ClientEvent::Error {
            correlation_id,
            code: err.error_code(),
            message: err.to_string(),
        });
    }

    fn add_publication(
        &mut self,
        client_id: i64,
        correlation_id: i64,
        stream_id: i32,
        channel: &str,
        is_exclusive: bool,
        now_ns: u64,
    ) -> Result<()> {
        let uri = ChannelUri::parse(channel)?;
        if uri.is_spy {
            return Err(Error::InvalidChannel("cannot publish on a spy channel".into()));
        }
        let params = PublicationParams::from_channel(&uri, &self.config)?;

        match uri.media {
            Media::Ipc => {
                self.add_ipc_publication(client_id, correlation_id, stream_id, uri, params, is_exclusive, now_ns)
            }
            Media::Udp => self.add_network_publication(
                client_id,
                correlation_id,
                stream_id,
                uri,
                params,
                is_exclusive,
                now_ns,
            ),
        }
    }

    fn add_ipc_publication(
        &mut self,
        client_id: i64,
        correlation_id: i64,
        stream_id: i32,
        uri: ChannelUri,
        params: PublicationParams,
        is_exclusive: bool,
        now_ns: u64,
    ) -> Result<()> {
        if !is_exclusive {
            if let Some(publication) = self.ipc_publications.iter_mut().find(|p| {
                p.stream_id() == stream_id && !p.is_exclusive() && p.is_accepting_subscriptions()
            }) {
                publication.inc_ref();
                let registration_id = publication.registration_id();
                let event = ClientEvent::PublicationReady {
                    correlation_id,
                    registration_id,
                    stream_id,
                    session_id: publication.session_id(),
                    position_limit_counter_id: publication.publisher_limit_id(),
                    log_file: publication.log_file().to_string(),
                    is_exclusive: false,
                };
                self.publication_links.push(PublicationLink { registration_id, client_id });
                self.events.push_back(event);
                return Ok(());
            }
        }

        let registration_id = self.next_registration_id();
        let session_id = params.session_id.unwrap_or_else(|| {
            let id = self.next_session_id;
            self.next_session_id += 1;
            id
        });

        let log_dir = self.config.dir.join("publications");
        std::fs::create_dir_all(&log_dir)?;
        let log_file: PathBuf = log_dir.join(format!("{registration_id}.logbuffer"));
        let log = RawLog::create(
            &log_file,
            self.log_meta_init(registration_id, session_id, stream_id, &params),
            params.term_length,
            params.sparse,
        )?;

        let label = format!("ipc session={session_id} stream={stream_id}");
        let pub_pos = self.counters.allocate(
            PUBLISHER_POSITION_TYPE_ID,
            &[],
            &format!("pub-pos: {label}"),
            registration_id,
            client_id,
        )?;
        let pub_lmt = self.counters.allocate(
            PUBLISHER_LIMIT_TYPE_ID,
            &[],
            &format!("pub-lmt: {label}"),
            registration_id,
            client_id,
        )?;

        let mut publication = IpcPublication::new(
            IpcPublicationParams {
                registration_id,
                session_id,
                stream_id,
                channel: uri.canonical().to_string(),
                log_file: log_file.display().to_string(),
                is_exclusive,
                term_window_length: params.publication_window_length,
                unblock_timeout_ns: self.config.publication_unblock_timeout_ns,
                image_liveness_timeout_ns: self.config.image_liveness_timeout_ns,
                linger_timeout_ns: params.linger_timeout_ns,
                untethered_window_limit_timeout_ns: params.untethered_window_limit_timeout_ns,
                untethered_linger_timeout_ns: params.untethered_linger_timeout_ns,
                untethered_resting_timeout_ns: params.untethered_resting_timeout_ns,
            },
            log,
            pub_pos,
            pub_lmt,
            *self.system.get(SystemCounter::UnblockedPublications),
            *self.system.get(SystemCounter::PublicationsRevoked),
            now_ns,
        );
        publication.inc_ref();

        self.events.push_back(ClientEvent::PublicationReady {
            correlation_id,
            registration_id,
            stream_id,
            session_id,
            position_limit_counter_id: publication.publisher_limit_id(),
            log_file: publication.log_file().to_string(),
            is_exclusive,
        });

        // Link already-registered matching subscriptions.
        let join_position = publication.joint_position();
        let matching: Vec<usize> = self
            .subscriptions
            .iter()
            .enumerate()
            .filter(|(_, link)| {
                link.stream_id == stream_id
                    && link.channel.media == Media::Ipc
                    && link.params.session_id.map_or(true, |sid| sid == session_id)
            })
            .map(|(index, _)| index)
            .collect();
        for index in matching {
            let (position, event) = self.link_subscriber(
                &self.subscriptions[index],
                publication.registration_id(),
                session_id,
                stream_id,
                join_position,
                publication.log_file().to_string(),
                "ipc".to_string(),
                now_ns,
            )?;
            publication.add_subscriber(position);
            self.events.push_back(event);
        }

        self.publication_links.push(PublicationLink { registration_id, client_id });
        self.ipc_publications.push(publication);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn add_network_publication(
        &mut self,
        client_id: i64,
        correlation_id: i64,
        stream_id: i32,
        uri: ChannelUri,
        params: PublicationParams,
        is_exclusive: bool,
        now_ns: u64,
    ) -> Result<()> {
        let endpoint = uri.endpoint().unwrap_or_default().to_string();
        if !is_exclusive {
            if let Some(publication) = self
                .network_publications
                .iter()
                .find(|p| {
                    p.stream_id() == stream_id
                        && !p.is_exclusive()
                        && p.channel() == uri.canonical()
                        && p.is_accepting_subscriptions()
                })
                .cloned()
            {
                publication.inc_ref();
                let registration_id = publication.registration_id();
                self.publication_links.push(PublicationLink { registration_id, client_id });
                self.events.push_back(ClientEvent::PublicationReady {
                    correlation_id,
                    registration_id,
                    stream_id,
                    session_id: publication.session_id(),
                    position_limit_counter_id: publication.publisher_limit_id(),
                    log_file: publication.log_file().to_string(),
                    is_exclusive: false,
                });
                return Ok(());
            }
        }

        let registration_id = self.next_registration_id();
        let session_id = params.session_id.unwrap_or_else(|| {
            let id = self.next_session_id;
            self.next_session_id += 1;
            id
        });

        let log_dir = self.config.dir.join("publications");
        std::fs::create_dir_all(&log_dir)?;
        let log_file: PathBuf = log_dir.join(format!("{registration_id}.logbuffer"));
        let log = RawLog::create(
            &log_file,
            self.log_meta_init(registration_id, session_id, stream_id, &params),
            params.term_length,
            params.sparse,
        )?;

        let bits = position_bits_to_shift(params.term_length);
        let flow_control = FlowControl::new(
            params.flow_control.as_deref(),
            self.config.receiver_liveness_timeout_ns,
            bits,
            params.initial_term_id,
            params.group_tag,
        )?;

        let label = format!("udp session={session_id} stream={stream_id} endpoint={endpoint}");
        let pub_pos = self.counters.allocate(
            PUBLISHER_POSITION_TYPE_ID,
            &[],
            &format!("pub-pos: {label}"),
            registration_id,
            client_id,
        )?;
        let pub_lmt = self.counters.allocate(
            PUBLISHER_LIMIT_TYPE_ID,
            &[],
            &format!("pub-lmt: {label}"),
            registration_id,
            client_id,
        )?;
        let snd_pos = self.counters.allocate(
            SENDER_POSITION_TYPE_ID,
            &[],
            &format!("snd-pos: {label}"),
            registration_id,
            client_id,
        )?;
        let snd_lmt = self.counters.allocate(
            SENDER_LIMIT_TYPE_ID,
            &[],
            &format!("snd-lmt: {label}"),
            registration_id,
            client_id,
        )?;
        let snd_bpe = self.counters.allocate(
            SENDER_BPE_TYPE_ID,
            &[],
            &format!("snd-bpe: {label}"),
            registration_id,
            client_id,
        )?;

        let publication = Arc::new(NetworkPublication::new(
            NetworkPublicationParams {
                registration_id,
                session_id,
                stream_id,
                channel: uri.canonical().to_string(),
                log_file: log_file.display().to_string(),
                is_exclusive,
                spies_simulate_connection: params.spies_simulate_connection,
                signal_eos: params.signal_eos,
                term_window_length: params.publication_window_length,
                mtu_length: params.mtu_length,
                linger_timeout_ns: params.linger_timeout_ns,
                unblock_timeout_ns: self.config.publication_unblock_timeout_ns,
                untethered_window_limit_timeout_ns: params.untethered_window_limit_timeout_ns,
                untethered_linger_timeout_ns: params.untethered_linger_timeout_ns,
                untethered_resting_timeout_ns: params.untethered_resting_timeout_ns,
                max_messages_per_send: self.config.max_messages_per_send,
                max_resend: params.max_resend,
            },
            log,
            pub_pos,
            pub_lmt,
            snd_pos,
            snd_lmt,
            snd_bpe,
            flow_control,
            Arc::clone(&self.system),
            now_ns,
        ));
        publication.inc_ref();

        self.events.push_back(ClientEvent::PublicationReady {
            correlation_id,
            registration_id,
            stream_id,
            session_id,
            position_limit_counter_id: publication.publisher_limit_id(),
            log_file: publication.log_file().to_string(),
            is_exclusive,
        });

        // Link existing spy subscriptions.
        let join_position = publication.join_position();
        let matching: Vec<usize> = self
            .subscriptions
            .iter()
            .enumerate()
            .filter(|(_, link)| {
                link.stream_id == stream_id
                    && link.params.is_spy
                    && link.params.session_id.map_or(true, |sid| sid == session_id)
            })
            .map(|(index, _)| index)
            .collect();
        for index in matching {
            let (position, event) = self.link_subscriber(
                &self.subscriptions[index],
                publication.registration_id(),
                session_id,
                stream_id,
                join_position,
                publication.log_file().to_string(),
                publication.channel().to_string(),
                now_ns,
            )?;
            publication.add_spy_subscriber(position);
            self.events.push_back(event);
        }

        self.publication_links.push(PublicationLink { registration_id, client_id });
        self.sender_commands
            .push_back(AgentCommand::AddNetworkPublication(Arc::clone(&publication)));
        self.network_publications.push(publication);
        Ok(())
    }

    fn log_meta_init(
        &self,
        registration_id: i64,
        session_id: i32,
        stream_id: i32,
        params: &PublicationParams,
    ) -> LogMetaInit {
        LogMetaInit {
            correlation_id: registration_id,
            session_id,
            stream_id,
            initial_term_id: params.initial_term_id,
            starting_term_id: params.term_id,
            starting_term_offset: params.term_offset,
            mtu_length: params.mtu_length,
            page_size: self.config.file_page_size,
            publication_window_length: params.publication_window_length,
            receiver_window_length: self.config.initial_window_length,
            max_resend: params.max_resend,
            linger_timeout_ns: params.linger_timeout_ns,
            untethered_window_limit_timeout_ns: params.untethered_window_limit_timeout_ns,
            untethered_linger_timeout_ns: params.untethered_linger_timeout_ns,
            untethered_resting_timeout_ns: params.untethered_resting_timeout_ns,
            signal_eos: params.signal_eos,
            spies_simulate_connection: params.spies_simulate_connection,
            tether: true,
            rejoin: true,
            reliable: true,
            sparse: params.sparse,
            group: false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn link_subscriber(
        &self,
        link: &SubscriptionLink,
        source_registration_id: i64,
        session_id: i32,
        stream_id: i32,
        join_position: i64,
        log_file: String,
        source_identity: String,
        now_ns: u64,
    ) -> Result<(SubscriberPosition, ClientEvent)> {
        let counter = self.counters.allocate(
            SUBSCRIBER_POSITION_TYPE_ID,
            &[],
            &format!("sub-pos: session={session_id} stream={stream_id}"),
            link.registration_id,
            link.client_id,
        )?;
        counter.set_release(join_position);
        let position = SubscriberPosition::new(
            link.registration_id,
            counter,
            link.params.is_tether,
            link.params.is_rejoin,
            now_ns,
        );
        let event = ClientEvent::AvailableImage {
            correlation_id: source_registration_id,
            subscription_registration_id: link.registration_id,
            session_id,
            stream_id,
            join_position,
            log_file,
            source_identity,
        };
        Ok((position, event))
    }

    fn remove_publication_link(&mut self, client_id: i64, registration_id: i64) -> Result<()> {
        let index = self
            .publication_links
            .iter()
            .position(|link| link.registration_id == registration_id && link.client_id == client_id)
            .ok_or(Error::UnknownRegistration(registration_id))?;
        self.publication_links.swap_remove(index);
        self.dec_ref_publication(registration_id)
    }

    fn dec_ref_publication(&mut self, registration_id: i64) -> Result<()> {
        if let Some(publication) = self
            .ipc_publications
            .iter_mut()
            .find(|p| p.registration_id() == registration_id)
        {
            publication.dec_ref();
            return Ok(());
        }
        if let Some(publication) = self
            .network_publications
            .iter()
            .find(|p| p.registration_id() == registration_id)
        {
            publication.dec_ref();
            return Ok(());
        }
        Err(Error::UnknownRegistration(registration_id))
    }

    fn add_subscription(
        &mut self,
        client_id: i64,
        correlation_id: i64,
        stream_id: i32,
        channel: &str,
        now_ns: u64,
    ) -> Result<()> {
        let uri = ChannelUri::parse(channel)?;
        let params = SubscriptionParams::from_channel(&uri, &self.config)?;
        let registration_id = self.next_registration_id();
        let link = SubscriptionLink {
            registration_id,
            client_id,
            stream_id,
            channel: uri,
            params,
        };

        self.events.push_back(ClientEvent::SubscriptionReady {
            correlation_id,
            registration_id,
        });

        // Link to live sources.
        let mut deferred_events = Vec::new();
        match (link.channel.media, link.params.is_spy) {
            (Media::Ipc, _) => {
                for index in 0..self.ipc_publications.len() {
                    let accepting = {
                        let publication = &self.ipc_publications[index];
                        publication.stream_id() == stream_id
                            && publication.is_accepting_subscriptions()
                            && link
                                .params
                                .session_id
                                .map_or(true, |sid| sid == publication.session_id())
                    };
                    if accepting {
                        let (session_id, join_position, log_file, source_registration_id) = {
                            let publication = &self.ipc_publications[index];
                            (
                                publication.session_id(),
                                publication.joint_position(),
                                publication.log_file().to_string(),
                                publication.registration_id(),
                            )
                        };
                        let (position, event) = self.link_subscriber(
                            &link,
                            source_registration_id,
                            session_id,
                            stream_id,
                            join_position,
                            log_file,
                            "ipc".to_string(),
                            now_ns,
                        )?;
                        self.ipc_publications[index].add_subscriber(position);
                        deferred_events.push(event);
                    }
                }
            }
            (Media::Udp, true) => {
                for publication in self.network_publications.clone() {
                    if publication.stream_id() == stream_id
                        && publication.is_accepting_subscriptions()
                        && link
                            .params
                            .session_id
                            .map_or(true, |sid| sid == publication.session_id())
                    {
                        let (position, event) = self.link_subscriber(
                            &link,
                            publication.registration_id(),
                            publication.session_id(),
                            stream_id,
                            publication.join_position(),
                            publication.log_file().to_string(),
                            publication.channel().to_string(),
                            now_ns,
                        )?;
                        publication.add_spy_subscriber(position);
                        deferred_events.push(event);
                    }
                }
            }
            (Media::Udp, false) => {
                for image in self.images.clone() {
                    if image.stream_id() == stream_id
                        && image.is_accepting_subscriptions()
                        && link
                            .params
                            .session_id
                            .map_or(true, |sid| sid == image.session_id())
                    {
                        let (position, event) = self.link_subscriber(
                            &link,
                            image.correlation_id(),
                            image.session_id(),
                            stream_id,
                            image.join_position(),
                            image.log_file().to_string(),
                            image.source_identity().to_string(),
                            now_ns,
                        )?;
                        image.add_subscriber(position);
                        deferred_events.push(event);
                    }
                }
            }
        }

        self.events.extend(deferred_events);
        if link.channel.media == Media::Udp && !link.params.is_spy {
            if let Some(endpoint) = link.channel.endpoint() {
                self.receiver_commands.push_back(AgentCommand::AddSubscriptionEndpoint {
                    registration_id,
                    endpoint: endpoint.to_string(),
                });
            }
        }
        self.subscriptions.push(link);
        Ok(())
    }

    fn remove_subscription(&mut self, registration_id: i64, now_ns: u64) -> Result<()> {
        let index = self
            .subscriptions
            .iter()
            .position(|link| link.registration_id == registration_id)
            .ok_or(Error::UnknownSubscription(registration_id))?;
        let link = self.subscriptions.swap_remove(index);
        if link.channel.media == Media::Udp && !link.params.is_spy {
            self.receiver_commands
                .push_back(AgentCommand::RemoveSubscriptionEndpoint { registration_id });
        }
        self.unlink_subscription(registration_id, now_ns);
        Ok(())
    }

    fn unlink_subscription(&mut self, registration_id: i64, now_ns: u64) {
        for publication in &mut self.ipc_publications {
            if let Some(position) = publication.remove_subscriber(registration_id) {
                self.counters.free(position.counter.id(), now_ns);
            }
        }
        for publication in &self.network_publications {
            if let Some(position) = publication.remove_spy_subscriber(registration_id) {
                self.counters.free(position.counter.id(), now_ns);
            }
        }
        for image in &self.images {
            if let Some(position) = image.remove_subscriber(registration_id) {
                self.counters.free(position.counter.id(), now_ns);
            }
        }
    }

    fn reject_image(&mut self, image_correlation_id: i64, reason: &str, now_ns: u64) -> Result<()> {
        let mut notifications = Vec::new();
        if let Some(image) = self
            .images
            .iter()
            .find(|image| image.correlation_id() == image_correlation_id)
            .cloned()
        {
            let freed = image.reject(reason, now_ns, &mut notifications);
            self.free_positions(freed, now_ns);
            self.apply_notifications(notifications);
            return Ok(());
        }

        if let Some(index) = self
            .ipc_publications
            .iter()
            .position(|p| p.registration_id() == image_correlation_id)
        {
            let freed = self.ipc_publications[index].reject(reason, now_ns, &mut notifications);
            self.free_positions(freed, now_ns);
            self.apply_notifications(notifications);
            return Ok(());
        }

        Err(Error::UnknownRegistration(image_correlation_id))
    }

    fn close_client(&mut self, client_id: i64, now_ns: u64, timed_out: bool) {
        self.clients.retain(|client| client.client_id != client_id);

        let links = std::mem::take(&mut self.publication_links);
        for link in links {
            if link.client_id == client_id {
                let _ = self.dec_ref_publication(link.registration_id);
            } else {
                self.publication_links.push(link);
            }
        }

        let owned_subscriptions: Vec<i64> = self
            .subscriptions
            .iter()
            .filter(|link| link.client_id == client_id)
            .map(|link| link.registration_id)
            .collect();
        for registration_id in owned_subscriptions {
            let _ = self.remove_subscription(registration_id, now_ns);
        }

        // Static counters survive; everything else the client owned goes.
        for counter_id in 0..self.counters.capacity() as i32 {
            if self.counters.state(counter_id) == crate::counters::STATE_ALLOCATED
                && self.counters.owner_id(counter_id) == client_id
            {
                let registration_id = self.counters.registration_id(counter_id);
                self.counters.free(counter_id, now_ns);
                self.events.push_back(ClientEvent::UnavailableCounter {
                    registration_id,
                    counter_id,
                });
            }
        }

        if timed_out {
            self.system.get(SystemCounter::ClientTimeouts).increment();
            self.events.push_back(ClientEvent::ClientTimeout { client_id });
            log::warn!("client {client_id} timed out");
        }
    }

    /// Creates an image for a SETUP frame observed by the receiver, provided
    /// a matching subscription exists. Returns the image for insertion.
    pub fn on_create_publication_image(
        &mut self,
        setup: &SetupFrame,
        source_identity: &str,
        now_ns: u64,
    ) -> Result<Option<Arc<PublicationImage>>> {
        if let Some(existing) = self
            .images
            .iter()
            .find(|image| {
                image.session_id() == setup.session_id && image.stream_id() == setup.stream_id
            })
            .cloned()
        {
            // In cooldown the stream stays torn down until liveness expires.
            return Ok(Some(existing));
        }

        let matching: Vec<usize> = self
            .subscriptions
            .iter()
            .enumerate()
            .filter(|(_, link)| {
                link.stream_id == setup.stream_id
                    && link.channel.media == Media::Udp
                    && !link.params.is_spy
                    && link.params.session_id.map_or(true, |sid| sid == setup.session_id)
            })
            .map(|(index, _)| index)
            .collect();
        if matching.is_empty() {
            return Ok(None);
        }

        let correlation_id = self.next_registration_id();
        let log_dir = self.config.dir.join("images");
        std::fs::create_dir_all(&log_dir)?;
        let log_file: PathBuf = log_dir.join(format!("{correlation_id}.logbuffer"));

        let term_length = setup.term_length as usize;
        let init = LogMetaInit {
            correlation_id,
            session_id: setup.session_id,
            stream_id: setup.stream_id,
            initial_term_id: setup.initial_term_id,
            starting_term_id: setup.active_term_id,
            starting_term_offset: setup.term_offset,
            mtu_length: setup.mtu_length as usize,
            page_size: self.config.file_page_size,
            publication_window_length: 0,
            receiver_window_length: self.config.initial_window_length,
            max_resend: self.config.max_resend,
            linger_timeout_ns: self.config.publication_linger_timeout_ns,
            untethered_window_limit_timeout_ns: self.config.untethered_window_limit_timeout_ns,
            untethered_linger_timeout_ns: self.config.untethered_linger_timeout_ns,
            untethered_resting_timeout_ns: self.config.untethered_resting_timeout_ns,
            signal_eos: true,
            spies_simulate_connection: false,
            tether: true,
            rejoin: true,
            reliable: self.subscriptions[matching[0]].params.is_reliable,
            sparse: false,
            group: false,
        };
        let log = RawLog::create(&log_file, init, term_length, false)?;

        let first = &self.subscriptions[matching[0]];
        let window_length =
            std::cmp::min(first.params.receiver_window_length, term_length / 2);
        let delay_generator = match first.params.nak_delay_ns {
            Some(0) => FeedbackDelayGenerator::Immediate,
            Some(delay_ns) => FeedbackDelayGenerator::Static {
                delay_ns,
                retry_ns: delay_ns * self.config.nak_unicast_retry_delay_ratio,
            },
            None => FeedbackDelayGenerator::Static {
                delay_ns: self.config.nak_unicast_delay_ns,
                retry_ns: self.config.nak_unicast_delay_ns
                    * self.config.nak_unicast_retry_delay_ratio,
            },
        };

        let label = format!(
            "image session={} stream={} source={source_identity}",
            setup.session_id, setup.stream_id
        );
        let hwm = self.counters.allocate(
            RECEIVER_HWM_TYPE_ID,
            &[],
            &format!("rcv-hwm: {label}"),
            correlation_id,
            NULL_OWNER_ID,
        )?;
        let rcv_pos = self.counters.allocate(
            RECEIVER_POSITION_TYPE_ID,
            &[],
            &format!("rcv-pos: {label}"),
            correlation_id,
            NULL_OWNER_ID,
        )?;
        let naks_sent = self.counters.allocate(
            RECEIVER_NAKS_SENT_TYPE_ID,
            &[],
            &format!("rcv-naks: {label}"),
            correlation_id,
            NULL_OWNER_ID,
        )?;

        let image = Arc::new(PublicationImage::new(
            ImageParams {
                correlation_id,
                session_id: setup.session_id,
                stream_id: setup.stream_id,
                initial_term_id: setup.initial_term_id,
                active_term_id: setup.active_term_id,
                initial_term_offset: setup.term_offset,
                source_identity: source_identity.to_string(),
                channel: first.channel.canonical().to_string(),
                log_file: log_file.display().to_string(),
                is_reliable: first.params.is_reliable,
                group_tag: first.params.group_tag,
                window_length,
                image_liveness_timeout_ns: self.config.image_liveness_timeout_ns,
                status_message_timeout_ns: self.config.status_message_timeout_ns,
                untethered_window_limit_timeout_ns: self.config.untethered_window_limit_timeout_ns,
                untethered_linger_timeout_ns: self.config.untethered_linger_timeout_ns,
                untethered_resting_timeout_ns: self.config.untethered_resting_timeout_ns,
            },
            log,
            hwm,
            rcv_pos,
            naks_sent,
            Arc::clone(&self.system),
            delay_generator,
            self.loss_report.clone(),
            now_ns,
        ));

        let join_position = image.join_position();
        for index in matching {
            let link = &self.subscriptions[index];
            let (position, event) = self.link_subscriber(
                link,
                image.correlation_id(),
                image.session_id(),
                image.stream_id(),
                join_position,
                image.log_file().to_string(),
                source_identity.to_string(),
                now_ns,
            )?;
            image.add_subscriber(position);
            self.events.push_back(event);
        }

        self.receiver_commands
            .push_back(AgentCommand::AddImage(Arc::clone(&image)));
        self.images.push(image.clone());
        Ok(Some(image))
    }

    fn apply_notifications(&mut self, notifications: Vec<Notification>) {
        for notification in notifications {
            self.events.push_back(notification.into());
        }
    }

    fn free_positions(&self, positions: Vec<SubscriberPosition>, now_ns: u64) {
        for position in positions {
            self.counters.free(position.counter.id(), now_ns);
        }
    }

    /// One duty cycle of the conductor.
    pub fn do_work(&mut self, now_ns: u64) -> usize {
        let mut work_count = 0;
        let mut notifications = Vec::new();

        if self.time_of_last_work_ns != 0 {
            let interval = now_ns.saturating_sub(self.time_of_last_work_ns);
            if interval > self.config.conductor_service_interval_ns {
                self.system
                    .get(SystemCounter::ConductorServiceTimeouts)
                    .increment();
                let err = Error::Generic(format!(
                    "conductor overshot service interval by {}ns",
                    interval - self.config.conductor_service_interval_ns
                ));
                self.record_error(&err, now_ns);
            }
        }
        self.time_of_last_work_ns = now_ns;

        for index in 0..self.ipc_publications.len() {
            let freed = self.ipc_publications[index].on_time_event(now_ns, &mut notifications);
            self.free_positions(freed, now_ns);
            work_count += self.ipc_publications[index].update_publisher_position_and_limit();
        }
        for publication in self.network_publications.clone() {
            let freed = publication.on_time_event(now_ns, &mut notifications);
            self.free_positions(freed, now_ns);
            work_count += publication.update_publisher_position_and_limit();
            if publication.state() == PublicationState::Linger && !publication.has_sender_released()
            {
                self.sender_commands
                    .push_back(AgentCommand::RemoveNetworkPublication(Arc::clone(&publication)));
            }
        }
        for image in self.images.clone() {
            let freed = image.on_time_event(now_ns, &mut notifications);
            self.free_positions(freed, now_ns);
        }

        self.apply_notifications(notifications);

        // Reap resources that reached end of life.
        self.ipc_publications.retain(|publication| {
            let done = publication.has_reached_end_of_life();
            if done {
                let _ = std::fs::remove_file(publication.log_file());
            }
            !done
        });
        let reaped: Vec<Arc<PublicationImage>> = self
            .images
            .iter()
            .filter(|image| image.has_reached_end_of_life())
            .cloned()
            .collect();
        for image in reaped {
            self.receiver_commands
                .push_back(AgentCommand::RemoveImage(Arc::clone(&image)));
            let _ = std::fs::remove_file(image.log_file());
        }
        self.images.retain(|image| !image.has_reached_end_of_life());
        self.network_publications.retain(|publication| {
            let done = publication.has_reached_end_of_life();
            if done {
                let _ = std::fs::remove_file(publication.log_file());
            }
            !done
        });

        // Age out silent clients.
        let timeout = self.config.client_liveness_timeout_ns;
        let expired: Vec<i64> = self
            .clients
            .iter()
            .filter(|client| now_ns.saturating_sub(client.time_of_last_keepalive_ns) > timeout)
            .map(|client| client.client_id)
            .collect();
        for client_id in expired {
            self.close_client(client_id, now_ns, true);
            work_count += 1;
        }

        self.counters.reclaim_sweep(now_ns);
        work_count
    }

    // --- introspection for the driver and tests ---

    pub fn ipc_publication(&mut self, registration_id: i64) -> Option<&mut IpcPublication> {
        self.ipc_publications
            .iter_mut()
            .find(|p| p.registration_id() == registration_id)
    }

    pub fn network_publication(&self, registration_id: i64) -> Option<&Arc<NetworkPublication>> {
        self.network_publications
            .iter()
            .find(|p| p.registration_id() == registration_id)
    }

    pub fn image(&self, correlation_id: i64) -> Option<&Arc<PublicationImage>> {
        self.images
            .iter()
            .find(|image| image.correlation_id() == correlation_id)
    }

    pub fn counters(&self) -> &Arc<CounterTable> {
        &self.counters
    }

    pub fn system_counters(&self) -> &Arc<SystemCounters> {
        &self.system
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }
}
