//! The association core: the state machine of RFC 4960 section 4 and the
//! orchestration of paths, congestion control, streams, the queue engine and
//! selective acknowledgement.
//!
//! An [`Association`] performs no I/O and keeps no clock. The driver hands it
//! packets, application commands and timer expirations together with the
//! current time, then drains the resulting [`Action`]s: packets to transmit,
//! timers to arm or cancel, messages to deliver and indications for the
//! application.

pub mod config;
pub mod congestion;
mod cookie;
pub mod modular_cmp;
pub mod path;
pub mod queue;
pub mod sack;
pub mod state;
pub mod streams;
pub mod timers;

#[cfg(test)]
mod tests;

pub use config::Config;
pub use state::{Event, State};
pub use streams::{InboundMessage, OutboundMessage};
pub use timers::{TimerRequest, TimerToken};

use self::{
    congestion::CongestionControl,
    cookie::{CookieJar, CookieRejection, StateCookie},
    modular_cmp::{tsn_ge, tsn_gt},
    path::{PathId, PathTable},
    queue::{AbandonedMessage, DataUnit, PrPolicy, QueueEngine},
    sack::{Arrival, ReceiveTracker, SackCheck, SackOutcome},
    streams::{OutboundFragment, ReceiveStreams, SendStreams, StreamScheduler},
    timers::{TimerKind, TimerTable},
};
use crate::{
    logging::{self, Direction},
    sctp::sctp_parsing::{
        Abort, Chunk, DataChunk, ErrorCause, ForwardTsn, Heartbeat, Init, Packet, Parameter,
        Sack, UnknownChunk, COMMON_HEADER_LENGTH, DATA_CHUNK_LENGTH,
    },
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    ops::ControlFlow,
    time::{Duration, Instant},
};
use thiserror::Error as ThisError;
use tracing::{debug, trace, warn};

const HEARTBEAT_INFO_LENGTH: usize = 20;

/// Identifies an association within its endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssocId(u32);

impl AssocId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn into_inner(self) -> u32 {
        self.0
    }
}

impl fmt::Display for AssocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "assoc#{}", self.0)
    }
}

/// A request from the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Start the four-way handshake
    Associate,
    /// Wait for the peer to start the handshake
    OpenPassive,
    Send(OutboundMessage),
    /// Take a ready message when not delivering on arrival. `None` takes
    /// the oldest message of any stream.
    Receive { stream: Option<u16> },
    /// Graceful shutdown once all queued data is acknowledged
    Close,
    Shutdown,
    Abort,
    Status,
    SetPrimary(IpAddr),
    /// Reset the sequence numbers of outbound streams. An empty list means
    /// every stream.
    ResetStreams(Vec<u16>),
    /// Send a HEARTBEAT to an address right away
    Heartbeat(IpAddr),
}

/// Work for the driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Transmit {
        destination: SocketAddr,
        packet: Packet,
    },
    Timer(TimerRequest),
    Deliver(InboundMessage),
    Indication(Indication),
}

/// Notifications for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Indication {
    Established {
        outbound_streams: u16,
        inbound_streams: u16,
    },
    /// The peer stopped answering. The association is gone.
    CommunicationLost(AssociationError),
    /// The association was aborted, by the peer or locally
    Aborted {
        causes: Vec<ErrorCause>,
        by_peer: bool,
    },
    ShutdownComplete,
    PathStatus {
        address: IpAddr,
        active: bool,
    },
    PrimaryChanged {
        address: IpAddr,
    },
    SendQueueFull,
    SendQueueAbated,
    /// Messages are waiting for a receive request
    DataArrived {
        messages: usize,
    },
    /// A message was given up on under its partial reliability policy.
    /// `ssn` is `None` for a message dropped before it was numbered.
    Abandoned {
        stream: u16,
        ssn: Option<u16>,
        unordered: bool,
    },
    StreamsReset {
        streams: Vec<u16>,
        outgoing: bool,
    },
    /// The peer reported errors in an ERROR chunk
    PeerError(Vec<ErrorCause>),
    Status(Box<Status>),
    Error(AssociationError),
}

/// A snapshot of the association for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub state: State,
    pub primary: IpAddr,
    pub paths: Vec<PathReport>,
    pub outbound_streams: u16,
    pub inbound_streams: u16,
    pub next_tsn: u32,
    /// Cumulative TSN acknowledged by the peer
    pub peer_cum_tsn_ack: u32,
    /// Highest in-order TSN received from the peer
    pub local_cum_tsn: u32,
    pub peer_rwnd: u32,
    pub local_rwnd: u32,
    pub queued_bytes: usize,
    pub queued_messages: usize,
    pub unacked_chunks: usize,
    pub ready_messages: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathReport {
    pub address: IpAddr,
    pub active: bool,
    pub confirmed: bool,
    pub cwnd: u32,
    pub ssthresh: u32,
    pub rto: Duration,
    pub srtt: Option<Duration>,
    pub outstanding_bytes: u32,
    pub error_count: u32,
}

/// An error reported to the application
#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum AssociationError {
    #[error("{event} is not allowed in state {state}")]
    InvalidState { state: State, event: Event },
    #[error("Stream {stream} is outside the {count} negotiated streams")]
    InvalidStream { stream: u16, count: u16 },
    #[error("Cannot send an empty message")]
    EmptyMessage,
    #[error("The send queue is full")]
    SendQueueFull,
    #[error("No message is ready for delivery")]
    NothingToReceive,
    #[error("{0} is not a destination of this association")]
    UnknownAddress(IpAddr),
    #[error("A stream reset is already in progress")]
    ResetInProgress,
    #[error("The peer denied the stream reset")]
    ResetDenied,
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("Verification tag {actual:#010x} does not match {expected:#010x}")]
    InvalidVerificationTag { expected: u32, actual: u32 },
    #[error("The peer did not complete the handshake")]
    HandshakeTimeout,
    #[error("The peer is unreachable")]
    PeerUnreachable,
    #[error("The shutdown did not complete in time")]
    ShutdownGuardExpired,
    #[error("The association is closed")]
    Closed,
}

/// How the state machine took an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Transition {
    Accepted,
    Tolerated,
    Rejected,
}

/// Retransmission state of INIT and COOKIE-ECHO.
#[derive(Debug, Clone)]
struct Handshake {
    chunk: Option<Chunk>,
    retransmissions: u32,
    rto: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ResetRequest {
    sequence: u32,
    streams: Vec<u16>,
    last_tsn: u32,
}

/// Stream reset bookkeeping (RFC 6525).
#[derive(Debug, Clone, Default)]
struct Reconfiguration {
    next_request: u32,
    pending: Option<ResetRequest>,
    /// The request sequence number expected from the peer
    peer_expected: u32,
}

/// Chunks gathered for one destination, split into packets that fit its MTU.
struct Bundler {
    limit: usize,
    packets: Vec<(usize, Vec<Chunk>)>,
}

impl Bundler {
    fn new(pmtu: u32) -> Self {
        Self {
            limit: (pmtu as usize).saturating_sub(COMMON_HEADER_LENGTH),
            packets: vec![],
        }
    }

    fn push(&mut self, chunk: Chunk) {
        let length = chunk.padded_length();
        match self.packets.last_mut() {
            Some((size, chunks)) if *size + length <= self.limit => {
                *size += length;
                chunks.push(chunk);
            }
            _ => self.packets.push((length, vec![chunk])),
        }
    }

    /// Puts a control chunk ahead of everything gathered so far.
    fn prepend(&mut self, chunk: Chunk) {
        let length = chunk.padded_length();
        match self.packets.first_mut() {
            Some((size, chunks)) if *size + length <= self.limit => {
                *size += length;
                chunks.insert(0, chunk);
            }
            _ => self.packets.insert(0, (length, vec![chunk])),
        }
    }

    fn has_data(&self) -> bool {
        self.packets
            .iter()
            .flat_map(|(_, chunks)| chunks)
            .any(|chunk| matches!(chunk, Chunk::Data(_)))
    }

    fn into_packets(self) -> impl Iterator<Item = Vec<Chunk>> {
        self.packets.into_iter().map(|(_, chunks)| chunks)
    }
}

/// One SCTP association.
#[derive(Debug)]
pub struct Association {
    id: AssocId,
    config: Config,
    state: State,
    local: SocketAddr,
    remote_port: u16,
    local_tag: u32,
    peer_tag: u32,
    local_initial_tsn: u32,
    epoch: Instant,
    rng: SmallRng,
    cookies: CookieJar,
    heartbeat_nonce: u64,
    paths: PathTable,
    timers: TimerTable,
    congestion: Box<dyn CongestionControl>,
    scheduler: Box<dyn StreamScheduler>,
    send_streams: SendStreams,
    inbound_streams: u16,
    receive_streams: ReceiveStreams,
    queue: QueueEngine,
    receive: ReceiveTracker,
    handshake: Handshake,
    reconfig: Reconfiguration,
    peer_rwnd: u32,
    /// Both ends support partial reliability
    pr_enabled: bool,
    /// Consecutive errors across all paths
    error_count: u32,
    last_sack_sequence: Option<u32>,
    sack_now: bool,
    last_data_source: Option<PathId>,
    forward_tsn_pending: bool,
    send_queue_full: bool,
    torn_down: bool,
    actions: Vec<Action>,
}

impl Association {
    /// Creates a closed association toward `remote`. Further peer addresses
    /// are learned from the handshake or added with
    /// [`Association::add_remote_address`].
    pub fn new(id: AssocId, config: Config, local: SocketAddr, remote: SocketAddr, now: Instant) -> Self {
        Self::with_rng(id, config, local, remote, now, SmallRng::from_entropy())
    }

    /// Like [`Association::new`] with a seeded random source, for
    /// reproducible tags and TSNs.
    pub fn with_seed(
        id: AssocId,
        config: Config,
        local: SocketAddr,
        remote: SocketAddr,
        now: Instant,
        seed: u64,
    ) -> Self {
        Self::with_rng(id, config, local, remote, now, SmallRng::seed_from_u64(seed))
    }

    fn with_rng(
        id: AssocId,
        config: Config,
        local: SocketAddr,
        remote: SocketAddr,
        now: Instant,
        mut rng: SmallRng,
    ) -> Self {
        let cookies = CookieJar::new(now, rng.gen(), config.valid_cookie_lifetime);
        let heartbeat_nonce = rng.gen();
        Self {
            id,
            state: State::Closed,
            local,
            remote_port: remote.port(),
            local_tag: 0,
            peer_tag: 0,
            local_initial_tsn: 0,
            epoch: now,
            rng,
            cookies,
            heartbeat_nonce,
            paths: PathTable::new([remote.ip()], &config),
            timers: TimerTable::default(),
            congestion: config.congestion.build(),
            scheduler: config.scheduler.build(),
            send_streams: SendStreams::new(config.outbound_streams),
            inbound_streams: config.inbound_streams,
            receive_streams: ReceiveStreams::default(),
            queue: QueueEngine::new(0),
            receive: ReceiveTracker::new(0),
            handshake: Handshake {
                chunk: None,
                retransmissions: 0,
                rto: config.rto_initial,
            },
            reconfig: Reconfiguration::default(),
            peer_rwnd: 0,
            pr_enabled: false,
            error_count: 0,
            last_sack_sequence: None,
            sack_now: false,
            last_data_source: None,
            forward_tsn_pending: false,
            send_queue_full: false,
            torn_down: false,
            actions: vec![],
            config,
        }
    }

    pub fn id(&self) -> AssocId {
        self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn local_address(&self) -> SocketAddr {
        self.local
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Every known address of the peer
    pub fn remote_addresses(&self) -> impl Iterator<Item = IpAddr> + '_ {
        self.paths.iter().map(|path| path.address)
    }

    pub fn add_remote_address(&mut self, address: IpAddr) {
        self.add_path(address);
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    pub fn paths(&self) -> &PathTable {
        &self.paths
    }

    /// Takes the work produced since the last call.
    pub fn poll_actions(&mut self) -> Vec<Action> {
        let mut actions = std::mem::take(&mut self.actions);
        actions.extend(self.timers.take_requests().into_iter().map(Action::Timer));
        actions
    }

    pub fn status(&self) -> Status {
        let (queued_bytes, queued_messages) = self.queue_usage();
        Status {
            state: self.state,
            primary: self.paths[self.paths.primary()].address,
            paths: self
                .paths
                .iter()
                .map(|path| PathReport {
                    address: path.address,
                    active: path.active,
                    confirmed: path.confirmed,
                    cwnd: path.cwnd(),
                    ssthresh: path.ssthresh,
                    rto: path.rto.rto(),
                    srtt: path.rto.srtt(),
                    outstanding_bytes: path.outstanding_bytes,
                    error_count: path.error_count,
                })
                .collect(),
            outbound_streams: self.send_streams.count(),
            inbound_streams: self.inbound_streams,
            next_tsn: self.queue.next_tsn(),
            peer_cum_tsn_ack: self.queue.cum_tsn_ack(),
            local_cum_tsn: self.receive.gaps.cum_tsn(),
            peer_rwnd: self.peer_rwnd,
            local_rwnd: self.local_rwnd(),
            queued_bytes,
            queued_messages,
            unacked_chunks: self.queue.unacked().count(),
            ready_messages: self.receive_streams.ready_count(),
        }
    }

    // ------------------------------------------------------------------
    // Inbound packets

    /// Processes a packet from `source`. Returns false when the association
    /// has ended and should be dropped.
    pub fn process_packet(&mut self, packet: Packet, source: IpAddr, now: Instant) -> bool {
        if self.torn_down {
            return false;
        }

        if let Err(error) = self.check_verification_tag(&packet) {
            // Never answer a stray ABORT or SHUTDOWN-COMPLETE
            if packet
                .chunks
                .iter()
                .any(|c| matches!(c, Chunk::Abort(_) | Chunk::ShutdownComplete { .. }))
            {
                trace!(assoc = %self.id, "discarding {error}");
                return true;
            }
            warn!(assoc = %self.id, "{error}");
            let reason = error.to_string();
            self.abort(ErrorCause::protocol_violation(&reason), Indication::Error(error));
            return false;
        }

        let mut carried_data = false;
        let mut reports = vec![];
        for chunk in packet.chunks {
            logging::chunk_event(self.id, Direction::Received, chunk.name(), source);
            let flow = match chunk {
                Chunk::Data(data) => {
                    carried_data = true;
                    self.handle_data(data, source, &mut reports)
                }
                Chunk::Init(init) => self.handle_init(init, source, now),
                Chunk::InitAck(init_ack) => self.handle_init_ack(init_ack, source),
                Chunk::Sack(sack) => self.handle_sack(sack, now),
                Chunk::Heartbeat(heartbeat) => self.handle_heartbeat(heartbeat, source),
                Chunk::HeartbeatAck(heartbeat) => self.handle_heartbeat_ack(heartbeat, now),
                Chunk::Abort(abort) => self.handle_abort(abort),
                Chunk::Shutdown { cum_tsn_ack } => self.handle_shutdown(cum_tsn_ack, now),
                Chunk::ShutdownAck => self.handle_shutdown_ack(source),
                Chunk::Error(causes) => self.handle_error(causes),
                Chunk::CookieEcho(cookie) => self.handle_cookie_echo(&cookie, source, now),
                Chunk::CookieAck => self.handle_cookie_ack(now),
                Chunk::ShutdownComplete { .. } => self.handle_shutdown_complete(),
                Chunk::ForwardTsn(forward) => {
                    carried_data = true;
                    self.handle_forward_tsn(forward)
                }
                Chunk::Reconfig(parameters) => self.handle_reconfig(parameters, source),
                Chunk::Unknown(unknown) => Self::handle_unknown(unknown, &mut reports),
            };
            if flow.is_break() || self.torn_down {
                break;
            }
        }

        if self.torn_down {
            return false;
        }
        if !reports.is_empty() {
            self.send_with_tag(source, self.peer_tag, vec![Chunk::Error(reports)]);
        }
        if carried_data {
            self.last_data_source = self.paths.by_address(source);
            self.receive.packets_since_sack += 1;
            self.schedule_sack();
        }
        self.transmit(now);
        !self.torn_down
    }

    fn check_verification_tag(&self, packet: &Packet) -> Result<(), AssociationError> {
        let has_init = packet.chunks.iter().any(|c| matches!(c, Chunk::Init(_)));
        if has_init && packet.chunks.len() > 1 {
            return Err(AssociationError::ProtocolViolation(
                "INIT bundled with other chunks".into(),
            ));
        }
        let expected = match packet.chunks.first() {
            Some(Chunk::Init(_)) => 0,
            Some(Chunk::Abort(Abort { reflected: true, .. }))
            | Some(Chunk::ShutdownComplete { reflected: true }) => self.peer_tag,
            _ => self.local_tag,
        };
        let actual = packet.header.verification_tag;
        if actual == expected {
            Ok(())
        } else {
            Err(AssociationError::InvalidVerificationTag { expected, actual })
        }
    }

    fn handle_data(
        &mut self,
        data: DataChunk,
        source: IpAddr,
        reports: &mut Vec<ErrorCause>,
    ) -> ControlFlow<()> {
        if !self.state.can_receive_data() {
            debug!(assoc = %self.id, tsn = data.tsn, "discarding DATA in {}", self.state);
            return ControlFlow::Continue(());
        }

        let duplicate = self.receive.gaps.contains(data.tsn);
        if !duplicate && data.payload.len() as u32 > self.local_rwnd() {
            debug!(assoc = %self.id, tsn = data.tsn, "receive window full, dropping DATA");
            return ControlFlow::Continue(());
        }
        if data.immediate {
            self.receive.immediate = true;
        }
        if self.receive.record(data.tsn) == Arrival::Duplicate {
            trace!(assoc = %self.id, tsn = data.tsn, %source, "duplicate DATA");
            return ControlFlow::Continue(());
        }

        if data.stream >= self.inbound_streams {
            // Acknowledged but never delivered
            reports.push(ErrorCause::invalid_stream(data.stream));
            return ControlFlow::Continue(());
        }
        let arrived = self.receive_streams.receive(data);
        self.deliver_ready(arrived);
        ControlFlow::Continue(())
    }

    fn handle_forward_tsn(&mut self, forward: ForwardTsn) -> ControlFlow<()> {
        if !self.state.can_receive_data() {
            return ControlFlow::Continue(());
        }
        if self.receive.gaps.forward(forward.new_cum_tsn) {
            debug!(assoc = %self.id, new_cum_tsn = forward.new_cum_tsn, "peer skipped abandoned data");
            let arrived = self
                .receive_streams
                .forward(forward.new_cum_tsn, &forward.streams);
            self.deliver_ready(arrived);
        }
        self.receive.immediate = true;
        ControlFlow::Continue(())
    }

    fn handle_init(&mut self, init: Init, source: IpAddr, now: Instant) -> ControlFlow<()> {
        if !matches!(
            self.state,
            State::Closed | State::CookieWait | State::CookieEchoed
        ) {
            // A restart of an established association is not supported
            debug!(assoc = %self.id, "ignoring INIT in {}", self.state);
            return ControlFlow::Break(());
        }
        if init.initiate_tag == 0 {
            return self.protocol_violation("INIT with a zero initiate tag");
        }

        if self.state == State::Closed {
            self.fire(Event::RcvInit);
            self.add_path(source);
            for address in init.addresses() {
                self.add_path(address);
            }
            self.timers
                .start(TimerKind::CookieLifetime, self.config.valid_cookie_lifetime);
        }
        if self.local_tag == 0 {
            self.choose_local_identity();
        }

        let cookie = StateCookie {
            local_tag: self.local_tag,
            peer_tag: init.initiate_tag,
            local_initial_tsn: self.local_initial_tsn,
            peer_initial_tsn: init.initial_tsn,
            outbound_streams: self.config.outbound_streams.min(init.inbound_streams),
            inbound_streams: self.config.inbound_streams.min(init.outbound_streams),
            peer_rwnd: init.a_rwnd,
            peer_forward_tsn: init.forward_tsn_supported(),
            created: self.cookies.stamp(now),
        };
        let mut parameters = vec![Parameter::StateCookie(self.cookies.bake(&cookie))];
        parameters.extend(self.local_parameters());
        parameters.extend(
            init.reportable_unknown_parameters()
                .map(|p| Parameter::UnrecognizedParameter(p.raw())),
        );
        let init_ack = Init {
            initiate_tag: self.local_tag,
            a_rwnd: self.local_rwnd(),
            outbound_streams: self.config.outbound_streams,
            inbound_streams: self.config.inbound_streams,
            initial_tsn: self.local_initial_tsn,
            parameters,
        };
        self.send_with_tag(source, init.initiate_tag, vec![Chunk::InitAck(init_ack)]);
        ControlFlow::Break(())
    }

    fn handle_init_ack(&mut self, init_ack: Init, source: IpAddr) -> ControlFlow<()> {
        match self.fire(Event::RcvInitAck) {
            Transition::Accepted => {}
            Transition::Tolerated => return ControlFlow::Continue(()),
            Transition::Rejected => return self.protocol_violation("unexpected INIT-ACK"),
        }
        if init_ack.initiate_tag == 0 {
            return self.protocol_violation("INIT-ACK with a zero initiate tag");
        }
        let Some(cookie) = init_ack.cookie().map(<[u8]>::to_vec) else {
            return self.protocol_violation("INIT-ACK without a state cookie");
        };

        self.peer_tag = init_ack.initiate_tag;
        for address in init_ack.addresses() {
            self.add_path(address);
        }
        if let Some(path) = self.paths.by_address(source) {
            self.paths[path].confirmed = true;
        }
        self.adopt_peer(
            init_ack.initial_tsn,
            self.config.outbound_streams.min(init_ack.inbound_streams),
            self.config.inbound_streams.min(init_ack.outbound_streams),
            init_ack.a_rwnd,
            init_ack.forward_tsn_supported(),
        );

        let mut chunks = vec![Chunk::CookieEcho(cookie.clone())];
        let unknown: Vec<&Parameter> = init_ack.reportable_unknown_parameters().collect();
        if !unknown.is_empty() {
            chunks.push(Chunk::Error(vec![ErrorCause::unrecognized_parameters(
                unknown,
            )]));
        }
        self.handshake = Handshake {
            chunk: Some(Chunk::CookieEcho(cookie)),
            retransmissions: 0,
            rto: self.config.rto_initial,
        };
        let primary = self.paths.primary();
        self.send_to(primary, chunks);
        self.timers.start(TimerKind::Init, self.handshake.rto);
        ControlFlow::Continue(())
    }

    fn handle_cookie_echo(&mut self, bytes: &[u8], source: IpAddr, now: Instant) -> ControlFlow<()> {
        let cookie = match self.cookies.open(bytes, now) {
            Ok(cookie) => cookie,
            Err(CookieRejection::Stale(staleness)) => {
                debug!(assoc = %self.id, ?staleness, "stale cookie");
                let micros = staleness.as_micros().min(u32::MAX as u128) as u32;
                self.send_with_tag(
                    source,
                    self.peer_tag,
                    vec![Chunk::Error(vec![ErrorCause::stale_cookie(micros)])],
                );
                return ControlFlow::Break(());
            }
            Err(rejection) => {
                debug!(assoc = %self.id, ?rejection, "discarding COOKIE-ECHO");
                return ControlFlow::Break(());
            }
        };
        if cookie.local_tag != self.local_tag {
            return ControlFlow::Break(());
        }

        match self.fire(Event::RcvValidCookieEcho) {
            Transition::Accepted => {}
            Transition::Tolerated => {
                // The COOKIE-ACK was lost
                if cookie.peer_tag == self.peer_tag {
                    self.send_with_tag(source, self.peer_tag, vec![Chunk::CookieAck]);
                }
                return ControlFlow::Continue(());
            }
            Transition::Rejected => return ControlFlow::Break(()),
        }

        self.peer_tag = cookie.peer_tag;
        let path = self.add_path(source);
        self.paths[path].confirmed = true;
        self.adopt_peer(
            cookie.peer_initial_tsn,
            cookie.outbound_streams,
            cookie.inbound_streams,
            cookie.peer_rwnd,
            cookie.peer_forward_tsn,
        );
        self.send_with_tag(source, self.peer_tag, vec![Chunk::CookieAck]);
        self.establish(now);
        ControlFlow::Continue(())
    }

    fn handle_cookie_ack(&mut self, now: Instant) -> ControlFlow<()> {
        match self.fire(Event::RcvCookieAck) {
            Transition::Accepted => {
                self.establish(now);
                ControlFlow::Continue(())
            }
            Transition::Tolerated => ControlFlow::Continue(()),
            Transition::Rejected => self.protocol_violation("unexpected COOKIE-ACK"),
        }
    }

    fn handle_sack(&mut self, sack: Sack, now: Instant) -> ControlFlow<()> {
        if !(self.state.can_send_data() || self.state.is_shutting_down()) {
            debug!(assoc = %self.id, "ignoring SACK in {}", self.state);
            return ControlFlow::Continue(());
        }
        let last = self
            .config
            .check_sack_seq_number
            .then_some(self.last_sack_sequence)
            .flatten();
        match sack::check(&self.queue, &sack, last) {
            SackCheck::Accept => {}
            SackCheck::Stale => {
                trace!(assoc = %self.id, cum_tsn_ack = sack.cum_tsn_ack, "stale SACK");
                return ControlFlow::Continue(());
            }
            SackCheck::AcksUnsent => {
                return self.protocol_violation("SACK acknowledges data never sent")
            }
        }
        if sack.sequence.is_some() {
            self.last_sack_sequence = sack.sequence;
        }

        let outcome = sack::apply(
            &mut self.queue,
            &sack,
            &mut self.paths,
            now,
            self.config.fast_retransmit_threshold,
        );
        self.after_sack(&outcome, sack.cum_tsn_ack, sack.a_rwnd);
        ControlFlow::Continue(())
    }

    fn after_sack(&mut self, outcome: &SackOutcome, cum_tsn_ack: u32, a_rwnd: u32) {
        for (id, rtt) in outcome.rtt_samples.iter() {
            self.paths[*id].rto.sample(*rtt);
        }
        let exit_point = self.queue.highest_sent();
        for id in outcome.fast_retransmit_paths.iter() {
            debug!(assoc = %self.id, path = %id, "fast retransmit");
            self.congestion
                .on_fast_retransmit(&mut self.paths[*id], exit_point);
        }
        if outcome.reneged > 0 {
            debug!(assoc = %self.id, chunks = outcome.reneged, "peer reneged on acknowledged data");
        }

        // The T3 timer of the primary also guards an unacked FORWARD-TSN
        let primary = self.paths.primary();
        let forward_unacked = self.forward_tsn_unacked();
        let ids: Vec<PathId> = self.paths.ids().collect();
        for id in ids {
            let acked = self.paths[id].newly_acked_bytes;
            if acked > 0 {
                self.congestion.on_bytes_acked(
                    &mut self.paths[id],
                    acked,
                    outcome.ctsna_advanced,
                    a_rwnd,
                );
                // Only a HEARTBEAT-ACK brings an inactive path back
                self.paths[id].record_ack();
            }
            self.congestion.on_cum_ack(&mut self.paths[id], cum_tsn_ack);

            let path = &self.paths[id];
            if path.outstanding_bytes == 0 && !(forward_unacked && id == primary) {
                self.timers.stop(TimerKind::Retransmission(id));
            } else if path.new_cum_ack {
                self.timers
                    .start(TimerKind::Retransmission(id), path.rto.rto());
            }
        }
        if outcome.newly_acked_bytes > 0 {
            self.error_count = 0;
        }
        self.peer_rwnd = a_rwnd.saturating_sub(self.paths.total_outstanding());
        if self.pr_enabled && self.queue.advance_peer_ack_point().is_some() {
            self.forward_tsn_pending = true;
        }
        if forward_unacked {
            let rto = self.paths[primary].rto.rto();
            self.timers
                .start_if_idle(TimerKind::Retransmission(primary), rto);
        }
        self.check_send_queue_abated();
        self.check_outstanding();
    }

    /// The peer has not acked up to the Forward-TSN point yet.
    fn forward_tsn_unacked(&self) -> bool {
        self.pr_enabled
            && tsn_gt(
                self.queue.advanced_peer_ack_point(),
                self.queue.cum_tsn_ack(),
            )
    }

    fn handle_heartbeat(&mut self, heartbeat: Heartbeat, source: IpAddr) -> ControlFlow<()> {
        if self.state == State::Closed {
            return ControlFlow::Continue(());
        }
        self.send_with_tag(source, self.peer_tag, vec![Chunk::HeartbeatAck(heartbeat)]);
        ControlFlow::Continue(())
    }

    fn handle_heartbeat_ack(&mut self, heartbeat: Heartbeat, now: Instant) -> ControlFlow<()> {
        let Some((id, sent)) = self.read_heartbeat_info(&heartbeat.info) else {
            debug!(assoc = %self.id, "HEARTBEAT-ACK with foreign information");
            return ControlFlow::Continue(());
        };
        self.timers.stop(TimerKind::Heartbeat(id));
        self.paths[id].rto.sample(now.saturating_duration_since(sent));
        self.error_count = 0;
        if self.paths[id].record_success() {
            self.path_up(id);
        }
        ControlFlow::Continue(())
    }

    fn handle_abort(&mut self, abort: Abort) -> ControlFlow<()> {
        debug!(assoc = %self.id, causes = ?abort.causes, "peer aborted");
        self.fire(Event::RcvAbort);
        self.push_indication(Indication::Aborted {
            causes: abort.causes,
            by_peer: true,
        });
        self.tear_down();
        ControlFlow::Break(())
    }

    fn handle_shutdown(&mut self, cum_tsn_ack: u32, now: Instant) -> ControlFlow<()> {
        if !(self.state == State::Established || self.state.is_shutting_down()) {
            debug!(assoc = %self.id, "ignoring SHUTDOWN in {}", self.state);
            return ControlFlow::Continue(());
        }

        // SHUTDOWN carries a cumulative ack
        let sack = Sack {
            cum_tsn_ack,
            a_rwnd: self.peer_rwnd.saturating_add(self.paths.total_outstanding()),
            ..Default::default()
        };
        if sack::check(&self.queue, &sack, None) == SackCheck::Accept {
            let outcome = sack::apply(
                &mut self.queue,
                &sack,
                &mut self.paths,
                now,
                self.config.fast_retransmit_threshold,
            );
            self.after_sack(&outcome, sack.cum_tsn_ack, sack.a_rwnd);
        }

        let before = self.state;
        match self.fire(Event::RcvShutdown) {
            Transition::Accepted => {}
            Transition::Tolerated => return ControlFlow::Continue(()),
            Transition::Rejected => return self.protocol_violation("unexpected SHUTDOWN"),
        }
        match (before, self.state) {
            (State::ShutdownSent, State::ShutdownAckSent) => {
                self.send_shutdown_chunk(self.paths.primary());
            }
            (_, State::ShutdownReceived) if before != State::ShutdownReceived => {
                self.timers
                    .start_if_idle(TimerKind::ShutdownGuard, self.config.shutdown_guard);
                self.check_outstanding();
            }
            _ => {}
        }
        ControlFlow::Continue(())
    }

    fn handle_shutdown_ack(&mut self, source: IpAddr) -> ControlFlow<()> {
        match self.state {
            State::ShutdownSent | State::ShutdownAckSent => {
                self.send_with_tag(
                    source,
                    self.peer_tag,
                    vec![Chunk::ShutdownComplete { reflected: false }],
                );
                self.fire(Event::RcvShutdownAck);
                self.push_indication(Indication::ShutdownComplete);
                self.tear_down();
                ControlFlow::Break(())
            }
            State::CookieWait | State::CookieEchoed => {
                // Out of the blue for an association still starting up
                self.send_with_tag(
                    source,
                    self.local_tag,
                    vec![Chunk::ShutdownComplete { reflected: true }],
                );
                ControlFlow::Break(())
            }
            _ => match self.fire(Event::RcvShutdownAck) {
                Transition::Rejected => self.protocol_violation("unexpected SHUTDOWN-ACK"),
                _ => ControlFlow::Continue(()),
            },
        }
    }

    fn handle_shutdown_complete(&mut self) -> ControlFlow<()> {
        match self.fire(Event::RcvShutdownComplete) {
            Transition::Accepted => {
                self.push_indication(Indication::ShutdownComplete);
                self.tear_down();
                ControlFlow::Break(())
            }
            Transition::Tolerated => ControlFlow::Continue(()),
            Transition::Rejected => self.protocol_violation("unexpected SHUTDOWN-COMPLETE"),
        }
    }

    fn handle_error(&mut self, causes: Vec<ErrorCause>) -> ControlFlow<()> {
        debug!(assoc = %self.id, ?causes, "peer reported errors");
        self.push_indication(Indication::PeerError(causes));
        ControlFlow::Continue(())
    }

    fn handle_reconfig(&mut self, parameters: Vec<Parameter>, source: IpAddr) -> ControlFlow<()> {
        if !(self.state == State::Established || self.state.is_shutting_down()) {
            return ControlFlow::Continue(());
        }
        let mut responses = vec![];
        for parameter in parameters {
            match parameter {
                Parameter::OutgoingSsnResetRequest {
                    request_sequence,
                    last_tsn,
                    streams,
                    ..
                } => {
                    let result = self.reset_incoming(request_sequence, last_tsn, streams);
                    responses.push(Parameter::ReconfigResponse {
                        response_sequence: request_sequence,
                        result,
                    });
                }
                Parameter::ReconfigResponse {
                    response_sequence,
                    result,
                } => self.reset_outgoing_answered(response_sequence, result),
                other => trace!(assoc = %self.id, ?other, "ignoring RE-CONFIG parameter"),
            }
        }
        if !responses.is_empty() {
            self.send_with_tag(source, self.peer_tag, vec![Chunk::Reconfig(responses)]);
        }
        ControlFlow::Continue(())
    }

    fn reset_incoming(&mut self, sequence: u32, last_tsn: u32, streams: Vec<u16>) -> u32 {
        if sequence == self.reconfig.peer_expected.wrapping_sub(1) {
            // A retransmission of a request already carried out
            return Parameter::RESULT_SUCCESS;
        }
        if sequence != self.reconfig.peer_expected {
            return Parameter::RESULT_DENIED;
        }
        if !tsn_ge(self.receive.gaps.cum_tsn(), last_tsn) {
            return Parameter::RESULT_IN_PROGRESS;
        }
        self.reconfig.peer_expected = sequence.wrapping_add(1);
        self.receive_streams.reset(&streams);
        self.push_indication(Indication::StreamsReset {
            streams,
            outgoing: false,
        });
        Parameter::RESULT_SUCCESS
    }

    fn reset_outgoing_answered(&mut self, sequence: u32, result: u32) {
        let Some(pending) = self.reconfig.pending.take() else {
            return;
        };
        if pending.sequence != sequence || result == Parameter::RESULT_IN_PROGRESS {
            self.reconfig.pending = Some(pending);
            return;
        }
        self.timers.stop(TimerKind::Reconfig);
        self.reconfig.next_request = self.reconfig.next_request.wrapping_add(1);
        if result == Parameter::RESULT_SUCCESS {
            self.send_streams.complete_reset(&pending.streams);
            self.push_indication(Indication::StreamsReset {
                streams: pending.streams,
                outgoing: true,
            });
        } else {
            self.send_streams.cancel_reset(&pending.streams);
            self.push_indication(Indication::Error(AssociationError::ResetDenied));
        }
    }

    fn handle_unknown(unknown: UnknownChunk, reports: &mut Vec<ErrorCause>) -> ControlFlow<()> {
        trace!(chunk_type = unknown.chunk_type, "unrecognized chunk");
        if unknown.wants_report() {
            reports.push(ErrorCause::unrecognized_chunk(&unknown));
        }
        if unknown.stops_processing() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    // ------------------------------------------------------------------
    // Application commands

    /// Carries out an application command. Returns false when the
    /// association has ended and should be dropped.
    pub fn process_command(&mut self, command: Command, now: Instant) -> bool {
        if self.torn_down {
            return false;
        }
        match command {
            Command::Associate => self.associate(),
            Command::OpenPassive => {
                if self.fire(Event::OpenPassive) != Transition::Accepted {
                    self.reject(Event::OpenPassive);
                }
            }
            Command::Send(message) => self.send(message, now),
            Command::Receive { stream } => self.receive(stream),
            Command::Close => self.shutdown(Event::Close),
            Command::Shutdown => self.shutdown(Event::Shutdown),
            Command::Abort => self.abort(
                ErrorCause::user_abort("aborted by the application"),
                Indication::Aborted {
                    causes: vec![],
                    by_peer: false,
                },
            ),
            Command::Status => {
                let status = self.status();
                self.push_indication(Indication::Status(Box::new(status)));
            }
            Command::SetPrimary(address) => match self.paths.by_address(address) {
                Some(id) => {
                    self.paths.set_primary(id);
                    logging::path_event(self.id, address, self.paths[id].active, true);
                    self.push_indication(Indication::PrimaryChanged { address });
                }
                None => self.push_error(AssociationError::UnknownAddress(address)),
            },
            Command::ResetStreams(streams) => self.reset_streams(streams),
            Command::Heartbeat(address) => match self.paths.by_address(address) {
                Some(id) if self.state != State::Closed => self.send_heartbeat(id, now),
                Some(_) => self.reject(Event::Send),
                None => self.push_error(AssociationError::UnknownAddress(address)),
            },
        }
        self.transmit(now);
        !self.torn_down
    }

    fn associate(&mut self) {
        if self.fire(Event::Associate) != Transition::Accepted {
            return self.reject(Event::Associate);
        }
        self.choose_local_identity();
        let init = Init {
            initiate_tag: self.local_tag,
            a_rwnd: self.config.a_rwnd,
            outbound_streams: self.config.outbound_streams,
            inbound_streams: self.config.inbound_streams,
            initial_tsn: self.local_initial_tsn,
            parameters: self.local_parameters(),
        };
        self.handshake = Handshake {
            chunk: Some(Chunk::Init(init.clone())),
            retransmissions: 0,
            rto: self.config.rto_initial,
        };
        let address = self.paths[self.paths.primary()].address;
        self.send_with_tag(address, 0, vec![Chunk::Init(init)]);
        self.timers.start(TimerKind::Init, self.handshake.rto);
    }

    fn send(&mut self, message: OutboundMessage, now: Instant) {
        if !matches!(
            self.state,
            State::CookieWait | State::CookieEchoed | State::Established
        ) {
            return self.reject(Event::Send);
        }
        if message.stream >= self.send_streams.count() {
            return self.push_error(AssociationError::InvalidStream {
                stream: message.stream,
                count: self.send_streams.count(),
            });
        }
        if message.payload.is_empty() {
            return self.push_error(AssociationError::EmptyMessage);
        }

        if self.exceeds_limits(message.payload.len(), 1) {
            if let PrPolicy::Priority(priority) = message.policy {
                self.evict_lower_priority(priority, message.payload.len());
            }
        }
        if self.exceeds_limits(message.payload.len(), 1) {
            if !self.send_queue_full {
                self.send_queue_full = true;
                self.push_indication(Indication::SendQueueFull);
            }
            return self.push_error(AssociationError::SendQueueFull);
        }

        let max_payload = self.max_payload(self.paths.primary());
        self.send_streams.enqueue(message, max_payload, now);
    }

    fn receive(&mut self, stream: Option<u16>) {
        let half = self.config.a_rwnd / 2;
        let before = self.local_rwnd();
        match self.receive_streams.take_ready(stream) {
            Some(message) => {
                self.actions.push(Action::Deliver(message));
                // Tell the peer about the reopened window
                if before < half && self.local_rwnd() >= half && self.state.can_receive_data() {
                    self.sack_now = true;
                }
            }
            None => self.push_error(AssociationError::NothingToReceive),
        }
    }

    fn shutdown(&mut self, event: Event) {
        let before = self.state;
        match self.fire(event) {
            Transition::Accepted if self.state == State::Closed => {
                debug!(assoc = %self.id, "closed during the handshake in {before}");
                self.push_indication(Indication::ShutdownComplete);
                self.tear_down();
            }
            Transition::Accepted => self.check_outstanding(),
            Transition::Tolerated => {}
            Transition::Rejected => self.reject(event),
        }
    }

    fn reset_streams(&mut self, streams: Vec<u16>) {
        if self.state != State::Established {
            return self.reject(Event::Send);
        }
        if self.reconfig.pending.is_some() {
            return self.push_error(AssociationError::ResetInProgress);
        }
        let count = self.send_streams.count();
        if let Some(&stream) = streams.iter().find(|s| **s >= count) {
            return self.push_error(AssociationError::InvalidStream { stream, count });
        }
        let streams = if streams.is_empty() {
            (0..count).collect()
        } else {
            streams
        };

        self.send_streams.begin_reset(&streams);
        if self.pr_enabled {
            let abandoned = self.queue.abandon_for_reset(&streams, &mut self.paths);
            self.report_abandoned(abandoned);
            let dropped = self.send_streams.abandon_where(|f| {
                f.policy == PrPolicy::StreamReset && streams.contains(&f.stream)
            });
            self.report_dropped(dropped);
            if self.queue.advance_peer_ack_point().is_some() {
                self.forward_tsn_pending = true;
            }
        }

        let request = ResetRequest {
            sequence: self.reconfig.next_request,
            streams,
            last_tsn: self.queue.next_tsn().wrapping_sub(1),
        };
        self.send_reset_request(&request);
        self.reconfig.pending = Some(request);
    }

    fn send_reset_request(&mut self, request: &ResetRequest) {
        let parameter = Parameter::OutgoingSsnResetRequest {
            request_sequence: request.sequence,
            response_sequence: self.reconfig.peer_expected.wrapping_sub(1),
            last_tsn: request.last_tsn,
            streams: request.streams.clone(),
        };
        let primary = self.paths.primary();
        self.send_to(primary, vec![Chunk::Reconfig(vec![parameter])]);
        self.timers
            .start(TimerKind::Reconfig, self.paths[primary].rto.rto());
    }

    // ------------------------------------------------------------------
    // Timers

    /// Handles an expired timer. Tokens that were canceled or replaced are
    /// ignored. Returns false when the association has ended.
    pub fn process_timer(&mut self, token: TimerToken, now: Instant) -> bool {
        if self.torn_down {
            return false;
        }
        let Some(kind) = self.timers.fire(token) else {
            trace!(assoc = %self.id, %token, "stale timer");
            return true;
        };
        trace!(assoc = %self.id, ?kind, "timer expired");

        match kind {
            TimerKind::Init => self.on_init_timeout(),
            TimerKind::CookieLifetime => {
                if self.state == State::Closed {
                    debug!(assoc = %self.id, "cookie never came back");
                    self.tear_down();
                }
            }
            TimerKind::Shutdown => self.on_shutdown_timeout(),
            TimerKind::ShutdownGuard => {
                self.fire(Event::ShutdownGuardTimeout);
                self.abort(
                    ErrorCause::user_abort("shutdown guard expired"),
                    Indication::CommunicationLost(AssociationError::ShutdownGuardExpired),
                );
            }
            TimerKind::DelayedSack => {
                if self.receive.owes_sack() {
                    self.sack_now = true;
                }
            }
            TimerKind::Reconfig => self.on_reconfig_timeout(),
            TimerKind::Heartbeat(id) => self.on_heartbeat_timeout(id, now),
            TimerKind::HeartbeatInterval(id) => self.on_heartbeat_interval(id, now),
            TimerKind::Cwnd(id) => {
                if self.paths[id].outstanding_bytes == 0 {
                    self.congestion.on_cwnd_timeout(&mut self.paths[id]);
                }
            }
            TimerKind::Retransmission(id) => self.on_rtx_timeout(id, now),
        }
        self.transmit(now);
        !self.torn_down
    }

    fn on_init_timeout(&mut self) {
        self.handshake.retransmissions += 1;
        if self.handshake.retransmissions > self.config.max_init_retrans {
            self.fire(Event::InitTimeout);
            self.push_indication(Indication::CommunicationLost(
                AssociationError::HandshakeTimeout,
            ));
            return self.tear_down();
        }
        self.handshake.rto =
            (self.handshake.rto * 2).clamp(self.config.rto_min, self.config.init_rto_max);
        let Some(chunk) = self.handshake.chunk.clone() else {
            return;
        };
        let address = self.paths[self.paths.primary()].address;
        let tag = match chunk {
            Chunk::Init(_) => 0,
            _ => self.peer_tag,
        };
        debug!(assoc = %self.id, chunk = chunk.name(), rto = ?self.handshake.rto, "retransmitting");
        self.send_with_tag(address, tag, vec![chunk]);
        self.timers.start(TimerKind::Init, self.handshake.rto);
    }

    fn on_shutdown_timeout(&mut self) {
        if !self.count_association_error() {
            return;
        }
        let primary = self.paths.primary();
        self.paths[primary].rto.back_off();
        let destination = self.paths.retransmission_destination(primary);
        self.send_shutdown_chunk(destination);
    }

    fn on_reconfig_timeout(&mut self) {
        if !self.count_association_error() {
            return;
        }
        let primary = self.paths.primary();
        self.paths[primary].rto.back_off();
        if let Some(request) = self.reconfig.pending.clone() {
            self.send_reset_request(&request);
        }
    }

    fn on_heartbeat_interval(&mut self, id: PathId, now: Instant) {
        if !self.config.heartbeats || self.state == State::Closed {
            return;
        }
        if !self.timers.is_armed(TimerKind::Heartbeat(id)) {
            self.send_heartbeat(id, now);
        }
        let after = self.config.heartbeat_interval + self.paths[id].rto.rto();
        self.timers.start(TimerKind::HeartbeatInterval(id), after);
    }

    fn on_heartbeat_timeout(&mut self, id: PathId, now: Instant) {
        debug!(assoc = %self.id, path = %id, "heartbeat unanswered");
        self.paths[id].rto.back_off();
        if self.paths[id].record_error() {
            self.path_down(id);
        }
        if self.paths.all_inactive() {
            self.fire(Event::HeartbeatTimeout);
            return self.abort(
                ErrorCause::user_abort("all destinations unreachable"),
                Indication::CommunicationLost(AssociationError::PeerUnreachable),
            );
        }
        if !self.count_association_error() {
            return;
        }
        self.send_heartbeat(id, now);
    }

    fn on_rtx_timeout(&mut self, id: PathId, now: Instant) {
        debug!(assoc = %self.id, path = %id, "retransmission timeout");
        if self.paths[id].record_error() {
            self.path_down(id);
        }
        if self.paths.all_inactive() || !self.count_association_error() {
            if !self.torn_down {
                self.fire(Event::RtxTimeout);
                self.abort(
                    ErrorCause::user_abort("retransmission limit reached"),
                    Indication::CommunicationLost(AssociationError::PeerUnreachable),
                );
            }
            return;
        }
        self.paths[id].rto.back_off();
        self.congestion.on_rtx_timeout(&mut self.paths[id]);

        let destination = self.paths.retransmission_destination(id);
        let marked = self
            .queue
            .mark_path_for_retransmission(id, destination, &mut self.paths);
        trace!(assoc = %self.id, marked, to = %destination, "marked for retransmission");
        self.abandon_expired(now);
        if self.pr_enabled && self.queue.forward_tsn().is_some() {
            self.forward_tsn_pending = true;
        }
    }

    /// Counts one error against the association. Returns false, after
    /// aborting, once the limit is passed.
    fn count_association_error(&mut self) -> bool {
        self.error_count += 1;
        if self.error_count <= self.config.assoc_max_retrans {
            return true;
        }
        let event = if self.state.is_shutting_down() {
            Event::ShutdownTimeout
        } else {
            Event::RtxTimeout
        };
        self.fire(event);
        self.abort(
            ErrorCause::user_abort("association retransmission limit reached"),
            Indication::CommunicationLost(AssociationError::PeerUnreachable),
        );
        false
    }

    // ------------------------------------------------------------------
    // Transmission

    /// Sends what is due: a SACK, a FORWARD-TSN, marked retransmissions and
    /// as much new data as the windows admit.
    fn transmit(&mut self, now: Instant) {
        if self.torn_down {
            return;
        }
        let primary = self.paths.primary();
        let sack_path = self.last_data_source.unwrap_or(primary);
        let mut sack = if self.sack_now {
            Some(self.build_sack())
        } else {
            None
        };

        if self.state.can_send_data() {
            self.abandon_expired(now);
            let mut forward = None;
            if self.forward_tsn_pending {
                self.forward_tsn_pending = false;
                forward = self.queue.forward_tsn().map(Chunk::ForwardTsn);
            }

            let ids: Vec<PathId> = self.paths.ids().collect();
            for id in ids {
                let mut bundler = Bundler::new(self.paths[id].pmtu);
                if id == sack_path {
                    if let Some(sack) = sack.take() {
                        bundler.push(sack);
                    }
                }
                if id == primary {
                    if let Some(forward) = forward.take() {
                        bundler.push(forward);
                        // Resent on expiry until the peer acks past it
                        let rto = self.paths[id].rto.rto();
                        self.timers
                            .start_if_idle(TimerKind::Retransmission(id), rto);
                    }
                }
                let mut sent_data = self.fill_retransmissions(id, &mut bundler, now);
                if id == primary {
                    sent_data |= self.fill_new_data(id, &mut bundler, now);
                }
                if sent_data {
                    // Piggyback a delayed SACK
                    if id == sack_path && self.receive.owes_sack() {
                        let sack = self.build_sack();
                        bundler.prepend(sack);
                    }
                    let rto = self.paths[id].rto.rto();
                    self.timers
                        .start_if_idle(TimerKind::Retransmission(id), rto);
                    self.timers.start(TimerKind::Cwnd(id), rto);
                }
                for packet in bundler.into_packets() {
                    self.send_to(id, packet);
                }
            }
        }

        if let Some(sack) = sack {
            self.send_to(sack_path, vec![sack]);
        }
        self.check_send_queue_abated();
    }

    fn fill_retransmissions(&mut self, id: PathId, bundler: &mut Bundler, now: Instant) -> bool {
        let tsns = self.queue.retransmissions_for(id);
        if tsns.is_empty() {
            return false;
        }
        let mut budget = self
            .congestion
            .admissible(&self.paths[id], self.config.max_burst);
        let mut sent = false;
        for tsn in tsns {
            let Some(length) = self.queue.unit(tsn).map(DataUnit::len) else {
                continue;
            };
            // The first retransmission always goes out
            if sent && length > budget {
                break;
            }
            if let Some(chunk) = self.queue.send_retransmission(tsn, &mut self.paths[id], now) {
                budget = budget.saturating_sub(length);
                bundler.push(Chunk::Data(chunk));
                sent = true;
            }
        }
        sent
    }

    fn fill_new_data(&mut self, id: PathId, bundler: &mut Bundler, now: Instant) -> bool {
        let mut budget = self
            .congestion
            .admissible(&self.paths[id], self.config.max_burst);
        let max_payload = self.max_payload(id);
        let mut sent = false;
        loop {
            let length = match self.queue.peek_new() {
                Some(unit) => unit.len(),
                None => {
                    let Some(stream) = self.send_streams.select(&mut *self.scheduler) else {
                        break;
                    };
                    let Some(fragment) = self.send_streams.pop(stream) else {
                        break;
                    };
                    self.queue.assign(fragment);
                    continue;
                }
            };

            let outstanding = self.paths.total_outstanding();
            // An idle path may always send one full chunk
            if self.paths[id].outstanding_bytes > 0 && length > budget {
                break;
            }
            // With nothing outstanding a closed window still admits one chunk
            if outstanding > 0 && length > self.peer_rwnd {
                break;
            }
            if self.config.nagle
                && outstanding > 0
                && !bundler.has_data()
                && (self.queue.queued_bytes() as usize + self.send_streams.sendable_bytes())
                    < max_payload
            {
                trace!(assoc = %self.id, "holding small data back");
                break;
            }

            let Some(chunk) = self.queue.send_new(&mut self.paths[id], now) else {
                break;
            };
            budget = budget.saturating_sub(length);
            self.peer_rwnd = self.peer_rwnd.saturating_sub(length);
            bundler.push(Chunk::Data(chunk));
            sent = true;
        }
        sent
    }

    fn build_sack(&mut self) -> Chunk {
        self.sack_now = false;
        self.timers.stop(TimerKind::DelayedSack);
        let sack = self.receive.build(
            self.local_rwnd(),
            self.config.nr_sack,
            self.config.check_sack_seq_number,
        );
        Chunk::Sack(sack)
    }

    /// Decides between an immediate and a delayed SACK after a packet with
    /// DATA arrived.
    fn schedule_sack(&mut self) {
        if self.receive.must_sack_now(self.config.sack_frequency)
            || self.state == State::ShutdownSent
        {
            self.sack_now = true;
        } else if self.receive.owes_sack() {
            self.timers
                .start_if_idle(TimerKind::DelayedSack, self.config.sack_delay);
        }
    }

    fn send_shutdown_chunk(&mut self, destination: PathId) {
        let chunk = match self.state {
            State::ShutdownSent => Chunk::Shutdown {
                cum_tsn_ack: self.receive.gaps.cum_tsn(),
            },
            State::ShutdownAckSent => Chunk::ShutdownAck,
            _ => return,
        };
        self.send_to(destination, vec![chunk]);
        let rto = self.paths[destination].rto.rto();
        self.timers.start(TimerKind::Shutdown, rto);
    }

    fn send_heartbeat(&mut self, id: PathId, now: Instant) {
        let info = self.heartbeat_info(id, now);
        self.send_to(id, vec![Chunk::Heartbeat(Heartbeat { info })]);
        let rto = self.paths[id].rto.rto();
        self.timers.start(TimerKind::Heartbeat(id), rto);
    }

    fn heartbeat_info(&self, id: PathId, now: Instant) -> Vec<u8> {
        let sent = now.saturating_duration_since(self.epoch).as_micros() as u64;
        let mut info = Vec::with_capacity(HEARTBEAT_INFO_LENGTH);
        info.extend_from_slice(&id.into_inner().to_be_bytes());
        info.extend_from_slice(&[0; 2]);
        info.extend_from_slice(&sent.to_be_bytes());
        info.extend_from_slice(&self.heartbeat_nonce.to_be_bytes());
        info
    }

    fn read_heartbeat_info(&self, info: &[u8]) -> Option<(PathId, Instant)> {
        if info.len() != HEARTBEAT_INFO_LENGTH {
            return None;
        }
        let mut word = [0; 8];
        word.copy_from_slice(&info[12..20]);
        if u64::from_be_bytes(word) != self.heartbeat_nonce {
            return None;
        }
        let id = PathId::new(u16::from_be_bytes([info[0], info[1]]));
        self.paths.get(id)?;
        word.copy_from_slice(&info[4..12]);
        let sent = self.epoch + Duration::from_micros(u64::from_be_bytes(word));
        Some((id, sent))
    }

    fn send_to(&mut self, id: PathId, chunks: Vec<Chunk>) {
        let address = self.paths[id].address;
        self.send_with_tag(address, self.peer_tag, chunks);
    }

    fn send_with_tag(&mut self, address: IpAddr, tag: u32, chunks: Vec<Chunk>) {
        for chunk in chunks.iter() {
            logging::chunk_event(self.id, Direction::Sent, chunk.name(), address);
        }
        let mut packet = Packet::new(self.local.port(), self.remote_port, tag);
        packet.chunks = chunks;
        self.actions.push(Action::Transmit {
            destination: SocketAddr::new(address, self.remote_port),
            packet,
        });
    }

    // ------------------------------------------------------------------
    // Helpers

    fn fire(&mut self, event: Event) -> Transition {
        match state::transition(self.state, event) {
            Some(next) => {
                if next != self.state {
                    debug!(assoc = %self.id, from = %self.state, to = %next, %event, "transition");
                    logging::state_event(self.id, self.state, next, event);
                    self.state = next;
                }
                Transition::Accepted
            }
            None if state::is_tolerated(self.state, event) => {
                trace!(assoc = %self.id, %event, "tolerated in {}", self.state);
                Transition::Tolerated
            }
            None => Transition::Rejected,
        }
    }

    fn reject(&mut self, event: Event) {
        self.push_error(AssociationError::InvalidState {
            state: self.state,
            event,
        });
    }

    fn protocol_violation(&mut self, reason: &str) -> ControlFlow<()> {
        warn!(assoc = %self.id, "protocol violation: {reason}");
        self.abort(
            ErrorCause::protocol_violation(reason),
            Indication::Error(AssociationError::ProtocolViolation(reason.into())),
        );
        ControlFlow::Break(())
    }

    /// Sends ABORT, closes and tells the application why.
    fn abort(&mut self, cause: ErrorCause, indication: Indication) {
        if self.local_tag != 0 {
            let address = self.paths[self.paths.primary()].address;
            let chunk = Chunk::Abort(Abort {
                // Without the peer's tag the chunk must carry our own
                reflected: self.peer_tag == 0,
                causes: vec![cause],
            });
            let tag = if self.peer_tag == 0 {
                self.local_tag
            } else {
                self.peer_tag
            };
            self.send_with_tag(address, tag, vec![chunk]);
        }
        self.fire(Event::Abort);
        self.push_indication(indication);
        self.tear_down();
    }

    fn tear_down(&mut self) {
        if self.state != State::Closed {
            self.fire(Event::Abort);
        }
        self.timers.stop_all();
        let discarded = self.queue.clear();
        if discarded > 0 {
            debug!(assoc = %self.id, discarded, "discarding unacknowledged data");
        }
        self.torn_down = true;
    }

    fn establish(&mut self, now: Instant) {
        self.timers.stop(TimerKind::Init);
        self.timers.stop(TimerKind::CookieLifetime);
        self.handshake.chunk = None;
        self.error_count = 0;

        let ids: Vec<PathId> = self.paths.ids().collect();
        for id in ids.iter().copied() {
            self.congestion.init_path(&mut self.paths[id], self.peer_rwnd);
        }
        if self.config.heartbeats {
            for id in ids {
                let after = self.config.heartbeat_interval + self.paths[id].rto.rto();
                self.timers.start(TimerKind::HeartbeatInterval(id), after);
                if !self.paths[id].confirmed {
                    self.send_heartbeat(id, now);
                }
            }
        }
        self.push_indication(Indication::Established {
            outbound_streams: self.send_streams.count(),
            inbound_streams: self.inbound_streams,
        });
    }

    fn adopt_peer(
        &mut self,
        peer_initial_tsn: u32,
        outbound_streams: u16,
        inbound_streams: u16,
        peer_rwnd: u32,
        peer_forward_tsn: bool,
    ) {
        self.receive = ReceiveTracker::new(peer_initial_tsn);
        self.reconfig = Reconfiguration {
            next_request: self.local_initial_tsn,
            pending: None,
            peer_expected: peer_initial_tsn,
        };
        self.send_streams.set_count(outbound_streams);
        self.inbound_streams = inbound_streams;
        self.peer_rwnd = peer_rwnd;
        self.pr_enabled = self.config.forward_tsn && peer_forward_tsn;
    }

    fn choose_local_identity(&mut self) {
        self.local_tag = loop {
            let tag: u32 = self.rng.gen();
            if tag != 0 {
                break tag;
            }
        };
        self.local_initial_tsn = self.rng.gen();
        self.queue = QueueEngine::new(self.local_initial_tsn);
    }

    fn local_parameters(&self) -> Vec<Parameter> {
        let mut parameters = vec![];
        if !self.local.ip().is_unspecified() {
            parameters.push(Parameter::address(self.local.ip()));
        }
        if self.config.forward_tsn {
            parameters.push(Parameter::ForwardTsnSupported);
        }
        parameters
    }

    fn add_path(&mut self, address: IpAddr) -> PathId {
        let known = self.paths.len();
        let id = self.paths.add(address, &self.config);
        if self.paths.len() > known && self.state == State::Established {
            self.congestion.init_path(&mut self.paths[id], self.peer_rwnd);
        }
        id
    }

    fn path_down(&mut self, id: PathId) {
        let address = self.paths[id].address;
        let was_primary = id == self.paths.primary();
        warn!(assoc = %self.id, %address, "path inactive");
        logging::path_event(self.id, address, false, was_primary);
        self.push_indication(Indication::PathStatus {
            address,
            active: false,
        });
        if was_primary {
            if let Some(next) = self.paths.fail_over() {
                let address = self.paths[next].address;
                logging::path_event(self.id, address, true, true);
                self.push_indication(Indication::PrimaryChanged { address });
            }
        }
        let destination = self.paths.retransmission_destination(id);
        self.queue.redirect_retransmissions(id, destination);
    }

    fn path_up(&mut self, id: PathId) {
        let address = self.paths[id].address;
        debug!(assoc = %self.id, %address, "path active again");
        logging::path_event(self.id, address, true, id == self.paths.primary());
        self.push_indication(Indication::PathStatus {
            address,
            active: true,
        });
        if self.config.reactivate_primary_path
            && id == self.paths.preferred()
            && id != self.paths.primary()
        {
            self.paths.switch_primary(id);
            self.push_indication(Indication::PrimaryChanged { address });
        }
    }

    /// Gives up on chunks whose partial reliability policy ran out.
    fn abandon_expired(&mut self, now: Instant) {
        if !self.pr_enabled {
            return;
        }
        let abandoned = self.queue.abandon_expired(now, &mut self.paths);
        let moved = !abandoned.is_empty();
        self.report_abandoned(abandoned);
        let dropped = self.send_streams.abandon_where(|f| {
            matches!(f.policy, PrPolicy::Ttl(_)) && f.expiry.map_or(false, |expiry| now > expiry)
        });
        self.report_dropped(dropped);
        if moved && self.queue.advance_peer_ack_point().is_some() {
            self.forward_tsn_pending = true;
        }
    }

    fn evict_lower_priority(&mut self, priority: u32, length: usize) {
        if !self.pr_enabled {
            return;
        }
        let (bytes, _) = self.queue_usage();
        let limit = self.config.send_queue_limit_bytes;
        let mut needed = if limit > 0 {
            (bytes + length).saturating_sub(limit)
        } else {
            length
        };
        let dropped = self.send_streams.abandon_where(|f| match f.policy {
            PrPolicy::Priority(p) if p > priority && needed > 0 => {
                needed = needed.saturating_sub(f.payload.len());
                true
            }
            _ => false,
        });
        self.report_dropped(dropped);
        if self.exceeds_limits(length, 1) {
            let (bytes, _) = self.queue_usage();
            let needed = (bytes + length).saturating_sub(limit) as u32;
            let abandoned = self
                .queue
                .abandon_lower_priority(priority, needed, &mut self.paths);
            self.report_abandoned(abandoned);
            if self.queue.advance_peer_ack_point().is_some() {
                self.forward_tsn_pending = true;
            }
        }
    }

    fn report_abandoned(&mut self, abandoned: Vec<AbandonedMessage>) {
        for message in abandoned {
            debug!(assoc = %self.id, stream = message.stream, ssn = message.ssn, "abandoned message");
            if message.incomplete {
                // The rest of the message never got a TSN
                self.send_streams
                    .abandon_continuing(message.stream, message.message_id);
            }
            self.push_indication(Indication::Abandoned {
                stream: message.stream,
                ssn: (!message.unordered).then_some(message.ssn),
                unordered: message.unordered,
            });
        }
    }

    fn report_dropped(&mut self, dropped: Vec<OutboundFragment>) {
        for fragment in dropped.into_iter().filter(|f| f.beginning) {
            self.push_indication(Indication::Abandoned {
                stream: fragment.stream,
                ssn: None,
                unordered: fragment.unordered,
            });
        }
    }

    fn deliver_ready(&mut self, arrived: usize) {
        if arrived == 0 {
            return;
        }
        if self.config.deliver_on_arrival {
            while let Some(message) = self.receive_streams.take_ready(None) {
                self.actions.push(Action::Deliver(message));
            }
        } else {
            self.push_indication(Indication::DataArrived { messages: arrived });
        }
    }

    /// Moves the shutdown along once everything sent has been acknowledged.
    fn check_outstanding(&mut self) {
        if !self.queue.is_empty() || self.send_streams.has_data() {
            return;
        }
        if !matches!(
            self.state,
            State::ShutdownPending | State::ShutdownReceived
        ) {
            return;
        }
        if self.fire(Event::NoMoreOutstanding) == Transition::Accepted {
            let primary = self.paths.primary();
            self.send_shutdown_chunk(primary);
            self.timers
                .start_if_idle(TimerKind::ShutdownGuard, self.config.shutdown_guard);
        }
    }

    fn queue_usage(&self) -> (usize, usize) {
        (
            self.send_streams.queued_bytes() + self.queue.queued_bytes() as usize,
            self.send_streams.queued_messages(),
        )
    }

    fn exceeds_limits(&self, extra_bytes: usize, extra_messages: usize) -> bool {
        let (bytes, messages) = self.queue_usage();
        let byte_limit = self.config.send_queue_limit_bytes;
        let message_limit = self.config.send_queue_limit_messages;
        (byte_limit > 0 && bytes + extra_bytes > byte_limit)
            || (message_limit > 0 && messages + extra_messages > message_limit)
    }

    /// Lifts a full send queue once it has drained to half of its limits.
    fn check_send_queue_abated(&mut self) {
        if !self.send_queue_full {
            return;
        }
        let (bytes, messages) = self.queue_usage();
        let byte_limit = self.config.send_queue_limit_bytes;
        let message_limit = self.config.send_queue_limit_messages;
        if (byte_limit == 0 || bytes <= byte_limit / 2)
            && (message_limit == 0 || messages <= message_limit / 2)
        {
            self.send_queue_full = false;
            self.push_indication(Indication::SendQueueAbated);
        }
    }

    fn local_rwnd(&self) -> u32 {
        self.config
            .a_rwnd
            .saturating_sub(self.receive_streams.buffered_bytes() as u32)
    }

    /// Largest DATA payload that fits one packet on a path
    fn max_payload(&self, id: PathId) -> usize {
        (self.paths[id].pmtu as usize).saturating_sub(COMMON_HEADER_LENGTH + DATA_CHUNK_LENGTH)
    }

    fn push_indication(&mut self, indication: Indication) {
        self.actions.push(Action::Indication(indication));
    }

    fn push_error(&mut self, error: AssociationError) {
        debug!(assoc = %self.id, "{error}");
        self.push_indication(Indication::Error(error));
    }
}
