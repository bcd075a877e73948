use super::*;
use crate::sctp::sctp_parsing::SkippedStream;
use std::{cell::RefCell, collections::HashMap, net::Ipv4Addr, rc::Rc};

fn client_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))
}

fn server_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2))
}

fn server_alternate_ip() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(10, 0, 1, 2))
}

fn quiet() -> Config {
    Config {
        heartbeats: false,
        ..Default::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Client,
    Server,
}

/// One association and everything its driver would hold for it.
struct Peer {
    assoc: Association,
    alive: bool,
    timers: HashMap<TimerToken, Instant>,
    outbox: Vec<(SocketAddr, Packet)>,
    delivered: Vec<InboundMessage>,
    indications: Vec<Indication>,
}

impl Peer {
    fn new(assoc: Association) -> Self {
        Self {
            assoc,
            alive: true,
            timers: HashMap::new(),
            outbox: vec![],
            delivered: vec![],
            indications: vec![],
        }
    }

    fn absorb(&mut self, now: Instant) {
        for action in self.assoc.poll_actions() {
            match action {
                Action::Transmit {
                    destination,
                    packet,
                } => self.outbox.push((destination, packet)),
                Action::Timer(TimerRequest::Start { token, after }) => {
                    self.timers.insert(token, now + after);
                }
                Action::Timer(TimerRequest::Cancel(token)) => {
                    self.timers.remove(&token);
                }
                Action::Deliver(message) => self.delivered.push(message),
                Action::Indication(indication) => self.indications.push(indication),
            }
        }
    }

    fn receive(&mut self, packet: Packet, source: IpAddr, now: Instant) {
        if self.alive {
            self.alive = self.assoc.process_packet(packet, source, now);
        }
        self.absorb(now);
    }

    fn command(&mut self, command: Command, now: Instant) {
        if self.alive {
            self.alive = self.assoc.process_command(command, now);
        }
        self.absorb(now);
    }

    fn payloads(&self) -> Vec<&[u8]> {
        self.delivered.iter().map(|m| m.payload.as_slice()).collect()
    }

    fn has(&self, indication: &Indication) -> bool {
        self.indications.contains(indication)
    }
}

type Filter = Box<dyn FnMut(Side, SocketAddr, &mut Packet) -> bool>;

/// Two associations wired back to back on a virtual clock.
struct Pair {
    now: Instant,
    client: Peer,
    server: Peer,
    /// Decides whether a packet reaches the other side and may edit it
    filter: Filter,
    /// Every packet that was delivered, in order
    wire: Vec<(Side, Packet)>,
    /// The address the server's packets appear to come from
    server_source: IpAddr,
}

impl Pair {
    fn new(client_config: Config, server_config: Config) -> Self {
        let now = Instant::now();
        let client = Association::with_seed(
            AssocId::new(1),
            client_config,
            SocketAddr::new(client_ip(), 5000),
            SocketAddr::new(server_ip(), 6000),
            now,
            1,
        );
        let server = Association::with_seed(
            AssocId::new(2),
            server_config,
            SocketAddr::new(server_ip(), 6000),
            SocketAddr::new(client_ip(), 5000),
            now,
            2,
        );
        let mut pair = Self {
            now,
            client: Peer::new(client),
            server: Peer::new(server),
            filter: Box::new(|_, _, _| true),
            wire: vec![],
            server_source: server_ip(),
        };
        pair.server.command(Command::OpenPassive, now);
        pair
    }

    fn connected(client_config: Config, server_config: Config) -> Self {
        let mut pair = Self::new(client_config, server_config);
        pair.client.command(Command::Associate, pair.now);
        pair.exchange();
        assert_eq!(pair.client.assoc.state(), State::Established);
        assert_eq!(pair.server.assoc.state(), State::Established);
        pair
    }

    /// Delivers packets back and forth until both sides fall silent.
    fn exchange(&mut self) {
        for _ in 0..1000 {
            self.client.absorb(self.now);
            self.server.absorb(self.now);
            if self.client.outbox.is_empty() && self.server.outbox.is_empty() {
                return;
            }
            let to_server = std::mem::take(&mut self.client.outbox);
            let to_client = std::mem::take(&mut self.server.outbox);
            for (destination, mut packet) in to_server {
                if !(self.filter)(Side::Client, destination, &mut packet) || packet.chunks.is_empty() {
                    continue;
                }
                self.wire.push((Side::Client, packet.clone()));
                self.server.receive(packet, client_ip(), self.now);
            }
            for (destination, mut packet) in to_client {
                if !(self.filter)(Side::Server, destination, &mut packet) || packet.chunks.is_empty() {
                    continue;
                }
                self.wire.push((Side::Server, packet.clone()));
                self.client.receive(packet, self.server_source, self.now);
            }
        }
        panic!("packets kept flowing");
    }

    /// Moves the clock forward, firing timers in order of expiry.
    fn advance(&mut self, by: Duration) {
        let until = self.now + by;
        loop {
            self.exchange();
            let next = [Side::Client, Side::Server]
                .into_iter()
                .filter_map(|side| {
                    self.peer(side)
                        .timers
                        .iter()
                        .filter(|(_, at)| **at <= until)
                        .map(|(token, at)| (*at, *token, side))
                        .min_by_key(|(at, token, _)| (*at, *token))
                })
                .min_by_key(|(at, token, _)| (*at, *token));
            let Some((at, token, side)) = next else {
                break;
            };
            self.now = at;
            let peer = self.peer_mut(side);
            peer.timers.remove(&token);
            if peer.alive {
                peer.alive = peer.assoc.process_timer(token, at);
            }
        }
        self.now = until;
    }

    fn peer(&self, side: Side) -> &Peer {
        match side {
            Side::Client => &self.client,
            Side::Server => &self.server,
        }
    }

    fn peer_mut(&mut self, side: Side) -> &mut Peer {
        match side {
            Side::Client => &mut self.client,
            Side::Server => &mut self.server,
        }
    }

    fn chunks_from(&self, side: Side) -> impl Iterator<Item = &Chunk> + '_ {
        self.wire
            .iter()
            .filter(move |(from, _)| *from == side)
            .flat_map(|(_, packet)| packet.chunks.iter())
    }

    fn data_tsns_from(&self, side: Side) -> Vec<u32> {
        self.chunks_from(side)
            .filter_map(|chunk| match chunk {
                Chunk::Data(data) => Some(data.tsn),
                _ => None,
            })
            .collect()
    }

    fn last_sack_from(&self, side: Side) -> Option<&Sack> {
        self.chunks_from(side)
            .filter_map(|chunk| match chunk {
                Chunk::Sack(sack) => Some(sack),
                _ => None,
            })
            .last()
    }

    /// The verification tag the server expects
    fn server_tag(&self) -> u32 {
        self.wire
            .iter()
            .rev()
            .find(|(side, _)| *side == Side::Client)
            .map(|(_, packet)| packet.header.verification_tag)
            .unwrap()
    }

    fn send(&mut self, stream: u16, payload: &[u8]) {
        self.client
            .command(Command::Send(OutboundMessage::new(stream, payload)), self.now);
    }
}

fn has_data(packet: &Packet) -> bool {
    packet.chunks.iter().any(|c| matches!(c, Chunk::Data(_)))
}

#[test]
fn four_way_handshake() {
    let pair = Pair::connected(quiet(), quiet());

    let names: Vec<&str> = pair
        .wire
        .iter()
        .flat_map(|(_, packet)| packet.chunks.iter().map(Chunk::name))
        .collect();
    assert_eq!(names, ["INIT", "INIT_ACK", "COOKIE_ECHO", "COOKIE_ACK"]);

    let established = Indication::Established {
        outbound_streams: 17,
        inbound_streams: 17,
    };
    assert!(pair.client.has(&established));
    assert!(pair.server.has(&established));
    // Only the INIT travels with a zero tag
    assert_eq!(pair.wire[0].1.header.verification_tag, 0);
    assert!(pair.wire[1..]
        .iter()
        .all(|(_, packet)| packet.header.verification_tag != 0));
}

#[test]
fn lost_init_is_retransmitted() {
    let mut pair = Pair::new(quiet(), quiet());
    let mut dropped = false;
    pair.filter = Box::new(move |side, _, packet| {
        let init = matches!(packet.chunks.first(), Some(Chunk::Init(_)));
        if side == Side::Client && init && !dropped {
            dropped = true;
            return false;
        }
        true
    });
    pair.client.command(Command::Associate, pair.now);
    pair.exchange();
    assert_eq!(pair.client.assoc.state(), State::CookieWait);

    pair.advance(Duration::from_secs(3));
    assert_eq!(pair.client.assoc.state(), State::Established);
    assert_eq!(pair.server.assoc.state(), State::Established);
}

#[test]
fn handshake_gives_up_after_max_init_retransmissions() {
    let mut pair = Pair::new(quiet(), quiet());
    pair.filter = Box::new(|side, _, _| side != Side::Client);
    pair.client.command(Command::Associate, pair.now);
    pair.advance(Duration::from_secs(1000));

    assert!(!pair.client.alive);
    assert_eq!(pair.client.assoc.state(), State::Closed);
    assert!(pair.client.has(&Indication::CommunicationLost(
        AssociationError::HandshakeTimeout
    )));
    assert!(pair.client.timers.is_empty());
}

#[test]
fn data_is_delivered_and_acknowledged() {
    let mut pair = Pair::connected(quiet(), quiet());
    pair.send(1, b"hello");
    pair.exchange();
    assert_eq!(pair.server.payloads(), [b"hello"]);
    assert_eq!(pair.server.delivered[0].stream, 1);
    assert_eq!(pair.client.assoc.status().unacked_chunks, 1);

    // A lone packet is acknowledged after the delay
    pair.advance(Duration::from_millis(200));
    assert_eq!(pair.client.assoc.status().unacked_chunks, 0);
    assert_eq!(pair.client.assoc.paths()[pair.client.assoc.paths().primary()].outstanding_bytes, 0);
}

#[test]
fn duplicate_tsn_is_delivered_once_and_reported() {
    let mut pair = Pair::connected(quiet(), quiet());
    pair.send(0, b"once");
    pair.exchange();
    let (_, packet) = pair
        .wire
        .iter()
        .find(|(side, packet)| *side == Side::Client && has_data(packet))
        .cloned()
        .unwrap();
    let tsn = pair.data_tsns_from(Side::Client)[0];

    pair.server.receive(packet, client_ip(), pair.now);
    pair.exchange();

    assert_eq!(pair.server.payloads(), [b"once"]);
    let sack = pair.last_sack_from(Side::Server).unwrap();
    assert_eq!(sack.duplicates, [tsn]);
    assert_eq!(sack.cum_tsn_ack, tsn);
}

#[test]
fn graceful_shutdown_releases_every_timer() {
    let mut pair = Pair::connected(Config::default(), Config::default());
    pair.send(0, b"last words");
    pair.client.command(Command::Shutdown, pair.now);
    pair.exchange();
    // The message is still unacknowledged
    assert_eq!(pair.client.assoc.state(), State::ShutdownPending);

    pair.advance(Duration::from_millis(200));
    assert_eq!(pair.server.payloads(), [b"last words"]);
    for peer in [&pair.client, &pair.server] {
        assert!(!peer.alive);
        assert_eq!(peer.assoc.state(), State::Closed);
        assert!(peer.has(&Indication::ShutdownComplete));
        assert!(peer.timers.is_empty(), "{:?}", peer.timers);
    }
    let names: Vec<&str> = pair
        .wire
        .iter()
        .flat_map(|(_, packet)| packet.chunks.iter().map(Chunk::name))
        .filter(|name| name.starts_with("SHUTDOWN"))
        .collect();
    assert_eq!(names, ["SHUTDOWN", "SHUTDOWN_ACK", "SHUTDOWN_COMPLETE"]);
}

#[test]
fn shutdown_acks_outstanding_data_under_a_huge_peer_window() {
    let mut pair = Pair::connected(quiet(), quiet());
    pair.filter = Box::new(|side, _, _| side == Side::Client);
    pair.send(0, b"unacked");
    pair.exchange();
    pair.client.assoc.peer_rwnd = u32::MAX;

    pair.filter = Box::new(|_, _, _| true);
    pair.server.command(Command::Shutdown, pair.now);
    pair.exchange();

    assert_eq!(pair.server.payloads(), [b"unacked"]);
    for peer in [&pair.client, &pair.server] {
        assert!(!peer.alive);
        assert!(peer.has(&Indication::ShutdownComplete));
    }
}

#[test]
fn primary_fails_over_after_five_heartbeat_failures() {
    let mut pair = Pair::new(Config::default(), Config::default());
    pair.client.assoc.add_remote_address(server_alternate_ip());
    pair.client.command(Command::Associate, pair.now);
    pair.exchange();
    assert_eq!(pair.client.assoc.state(), State::Established);
    // The second address is confirmed by a heartbeat right away
    assert!(pair.client.assoc.paths().iter().all(|path| path.confirmed));

    // The first address goes dark in both directions
    pair.filter = Box::new(|_, destination, _| destination.ip() != server_ip());
    pair.server_source = server_alternate_ip();
    pair.send(3, b"queued");
    pair.advance(Duration::from_secs(600));

    assert_eq!(pair.client.assoc.state(), State::Established);
    assert!(pair.client.has(&Indication::PathStatus {
        address: server_ip(),
        active: false,
    }));
    assert!(pair.client.has(&Indication::PrimaryChanged {
        address: server_alternate_ip(),
    }));
    assert_eq!(pair.client.assoc.status().primary, server_alternate_ip());
    assert_eq!(pair.server.payloads(), [b"queued"]);
    assert_eq!(pair.client.assoc.status().unacked_chunks, 0);

    pair.send(3, b"after failover");
    pair.advance(Duration::from_secs(1));
    assert_eq!(pair.server.payloads(), [&b"queued"[..], &b"after failover"[..]]);
}

#[test]
fn expired_message_is_skipped_with_forward_tsn() {
    let mut pair = Pair::connected(quiet(), quiet());
    pair.filter = Box::new(|side, _, packet| side == Side::Server || !has_data(packet));
    let message = OutboundMessage::new(1, &b"stale soon"[..])
        .policy(PrPolicy::Ttl(Duration::from_millis(100)));
    pair.client.command(Command::Send(message), pair.now);
    let tsn = pair.client.assoc.status().next_tsn.wrapping_sub(1);

    pair.advance(Duration::from_secs(4));

    let forward = pair
        .chunks_from(Side::Client)
        .find_map(|chunk| match chunk {
            Chunk::ForwardTsn(forward) => Some(forward.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(forward.new_cum_tsn, tsn);
    assert_eq!(forward.streams, [SkippedStream { stream: 1, ssn: 0 }]);
    assert!(pair.client.has(&Indication::Abandoned {
        stream: 1,
        ssn: Some(0),
        unordered: false,
    }));
    assert!(pair.server.delivered.is_empty());
    assert_eq!(pair.server.assoc.status().local_cum_tsn, tsn);
    assert!(pair.client.assoc.queue.is_empty());
}

#[test]
fn chunks_in_flight_move_to_the_alternate_address() {
    let mut pair = Pair::new(Config::default(), Config::default());
    pair.client.assoc.add_remote_address(server_alternate_ip());
    pair.client.command(Command::Associate, pair.now);
    pair.exchange();

    let sent = Rc::new(RefCell::new(vec![]));
    let record = sent.clone();
    pair.filter = Box::new(move |side, destination, packet| {
        if side == Side::Client {
            for chunk in packet.chunks.iter() {
                if let Chunk::Data(data) = chunk {
                    record.borrow_mut().push((destination.ip(), data.tsn));
                }
            }
        }
        destination.ip() != server_ip()
    });
    pair.server_source = server_alternate_ip();
    pair.send(2, b"in flight");
    let tsn = pair.client.assoc.status().next_tsn.wrapping_sub(1);
    pair.advance(Duration::from_secs(60));

    let sent = sent.borrow();
    assert_eq!(sent[0], (server_ip(), tsn));
    assert!(sent.contains(&(server_alternate_ip(), tsn)));
    assert_eq!(pair.server.payloads(), [b"in flight"]);
    assert_eq!(pair.client.assoc.status().unacked_chunks, 0);
}

#[test]
fn acked_data_does_not_revive_an_inactive_path() {
    let mut pair = Pair::connected(quiet(), quiet());
    pair.filter = Box::new(|side, _, _| side == Side::Client);
    pair.send(0, b"acked late");
    pair.exchange();
    assert_eq!(pair.server.payloads(), [b"acked late"]);

    let primary = pair.client.assoc.paths().primary();
    while pair.client.assoc.paths[primary].active {
        pair.client.assoc.paths[primary].record_error();
    }
    pair.filter = Box::new(|_, _, _| true);
    pair.advance(Duration::from_millis(200));

    let path = &pair.client.assoc.paths()[primary];
    assert_eq!(pair.client.assoc.status().unacked_chunks, 0);
    assert_eq!(path.error_count, 0);
    assert!(!path.active);
    assert!(!pair.client.has(&Indication::PathStatus {
        address: server_ip(),
        active: true,
    }));
}

#[test]
fn acknowledgements_wrap_around_the_tsn_space() {
    let start = u32::MAX - 1;
    let mut pair = Pair::new(quiet(), quiet());
    pair.client.command(Command::Associate, pair.now);
    for (_, packet) in pair.client.outbox.iter_mut() {
        for chunk in packet.chunks.iter_mut() {
            if let Chunk::Init(init) = chunk {
                init.initial_tsn = start;
            }
        }
    }
    pair.client.assoc.local_initial_tsn = start;
    pair.client.assoc.queue = QueueEngine::new(start);
    pair.exchange();
    assert_eq!(pair.client.assoc.state(), State::Established);

    for payload in [b"w", b"x", b"y", b"z"] {
        pair.send(0, payload);
        pair.exchange();
    }
    pair.advance(Duration::from_millis(200));

    assert_eq!(pair.data_tsns_from(Side::Client), [start, u32::MAX, 0, 1]);
    assert_eq!(pair.server.payloads(), [b"w", b"x", b"y", b"z"]);
    let status = pair.client.assoc.status();
    assert_eq!(status.peer_cum_tsn_ack, 1);
    assert_eq!(status.unacked_chunks, 0);
    assert!(pair.client.assoc.queue.is_empty());

    pair.client.command(Command::Shutdown, pair.now);
    pair.advance(Duration::from_secs(1));
    assert!(pair.client.has(&Indication::ShutdownComplete));
}

#[test]
fn three_missing_reports_trigger_fast_retransmit() {
    let mut pair = Pair::connected(quiet(), quiet());
    let mut dropped = false;
    pair.filter = Box::new(move |side, _, packet| {
        if side == Side::Client && has_data(packet) && !dropped {
            dropped = true;
            return false;
        }
        true
    });
    for payload in [b"one", b"two", b"thr", b"fou"] {
        pair.send(2, payload);
        pair.exchange();
    }

    // No time passed, so no T3 expired
    let first = pair.data_tsns_from(Side::Client)[0].wrapping_sub(1);
    assert_eq!(
        pair.data_tsns_from(Side::Client),
        [
            first.wrapping_add(1),
            first.wrapping_add(2),
            first.wrapping_add(3),
            first
        ]
    );
    assert_eq!(pair.server.payloads(), [b"one", b"two", b"thr", b"fou"]);
    let primary = pair.client.assoc.paths().primary();
    let path = &pair.client.assoc.paths()[primary];
    assert!(path.cwnd() >= path.pmtu);
    assert_eq!(path.ssthresh, 2 * path.pmtu);
}

#[test]
fn retransmission_timeout_counts_once_for_many_chunks() {
    let mut pair = Pair::connected(quiet(), quiet());
    pair.filter = Box::new(|side, _, packet| side == Side::Server || !has_data(packet));
    for payload in [b"a", b"b", b"c"] {
        pair.send(0, payload);
    }
    pair.exchange();
    pair.filter = Box::new(|_, _, _| true);

    pair.advance(Duration::from_secs(3));
    let status = pair.client.assoc.status();
    let path = &status.paths[0];
    assert_eq!(path.error_count, 1);
    assert_eq!(path.rto, Duration::from_secs(6));
    assert_eq!(path.cwnd, congestion::Rfc4960::initial_cwnd(1500));
    assert_eq!(path.ssthresh, 3000);
    assert_eq!(pair.client.assoc.error_count, 1);

    // All three went out again together
    let retransmitted = pair
        .wire
        .iter()
        .filter(|(side, packet)| *side == Side::Client && has_data(packet))
        .count();
    assert_eq!(retransmitted, 1);

    pair.advance(Duration::from_millis(200));
    assert_eq!(pair.server.payloads(), [b"a", b"b", b"c"]);
    assert_eq!(pair.client.assoc.status().paths[0].error_count, 0);
}

#[test]
fn lost_forward_tsn_is_sent_again() {
    let mut pair = Pair::connected(quiet(), quiet());
    pair.filter = Box::new(|side, _, packet| {
        side == Side::Server
            || !packet
                .chunks
                .iter()
                .any(|c| matches!(c, Chunk::Data(_) | Chunk::ForwardTsn(_)))
    });
    let message = OutboundMessage::new(1, &b"never arrives"[..])
        .policy(PrPolicy::Ttl(Duration::from_millis(100)));
    pair.client.command(Command::Send(message), pair.now);
    pair.advance(Duration::from_secs(4));
    assert!(pair.client.has(&Indication::Abandoned {
        stream: 1,
        ssn: Some(0),
        unordered: false,
    }));
    assert!(!pair.client.assoc.queue.is_empty());

    pair.filter = Box::new(|_, _, _| true);
    pair.client.command(Command::Shutdown, pair.now);
    pair.advance(Duration::from_secs(2000));

    assert!(pair
        .chunks_from(Side::Client)
        .any(|chunk| matches!(chunk, Chunk::ForwardTsn(_))));
    assert!(pair.server.delivered.is_empty());
    for peer in [&pair.client, &pair.server] {
        assert!(!peer.alive);
        assert!(peer.has(&Indication::ShutdownComplete));
    }
}

#[test]
fn message_dropped_before_sending_leaves_no_sequence_gap() {
    let mut pair = Pair::connected(quiet(), quiet());
    pair.filter = Box::new(|side, _, _| side == Side::Client);
    pair.send(1, &[9; 10_000]);
    let message = OutboundMessage::new(1, &b"short lived"[..])
        .policy(PrPolicy::Ttl(Duration::from_millis(1)));
    pair.client.command(Command::Send(message), pair.now);
    pair.send(1, b"tail");
    pair.advance(Duration::from_millis(10));

    pair.filter = Box::new(|_, _, _| true);
    pair.advance(Duration::from_secs(30));

    assert!(pair.client.has(&Indication::Abandoned {
        stream: 1,
        ssn: None,
        unordered: false,
    }));
    assert_eq!(pair.server.delivered.len(), 2);
    assert_eq!(pair.server.delivered[0].payload.len(), 10_000);
    let tail = &pair.server.delivered[1];
    assert_eq!(tail.payload, b"tail");
    assert_eq!(tail.ssn, 1);
    assert!(!pair
        .chunks_from(Side::Client)
        .any(|chunk| matches!(chunk, Chunk::ForwardTsn(_))));
}

#[test]
fn wrong_verification_tag_aborts() {
    let mut pair = Pair::connected(quiet(), quiet());
    let tag = pair.server_tag();
    let mut packet = Packet::new(5000, 6000, tag ^ 1);
    packet.chunks.push(Chunk::Data(DataChunk {
        tsn: 1,
        stream: 0,
        ssn: 0,
        ppid: 0,
        unordered: false,
        beginning: true,
        ending: true,
        immediate: false,
        payload: b"forged".to_vec(),
    }));
    pair.server.receive(packet, client_ip(), pair.now);

    assert!(!pair.server.alive);
    assert!(pair.server.indications.iter().any(|i| matches!(
        i,
        Indication::Error(AssociationError::InvalidVerificationTag { .. })
    )));
    assert!(pair
        .server
        .outbox
        .iter()
        .any(|(_, p)| matches!(p.chunks[0], Chunk::Abort(_))));
    assert!(pair.server.timers.is_empty());
}

#[test]
fn stray_abort_is_discarded() {
    let mut pair = Pair::connected(quiet(), quiet());
    let tag = pair.server_tag();
    let mut packet = Packet::new(5000, 6000, tag ^ 1);
    packet.chunks.push(Chunk::Abort(Abort::default()));
    pair.server.receive(packet, client_ip(), pair.now);

    assert!(pair.server.alive);
    assert_eq!(pair.server.assoc.state(), State::Established);
    assert!(pair.server.outbox.is_empty());
}

#[test]
fn peer_abort_tears_down() {
    let mut pair = Pair::connected(quiet(), quiet());
    pair.client.command(Command::Abort, pair.now);
    pair.exchange();

    assert!(!pair.client.alive);
    assert!(!pair.server.alive);
    assert!(pair.client.has(&Indication::Aborted {
        causes: vec![],
        by_peer: false,
    }));
    assert!(pair.server.indications.iter().any(|i| matches!(
        i,
        Indication::Aborted { by_peer: true, causes } if causes[0].code == ErrorCause::USER_INITIATED_ABORT
    )));
}

#[test]
fn unknown_chunk_is_reported_without_abort() {
    let mut pair = Pair::connected(quiet(), quiet());
    let tag = pair.server_tag();
    let mut packet = Packet::new(5000, 6000, tag);
    packet.chunks.push(Chunk::Unknown(UnknownChunk {
        chunk_type: 0xc7,
        flags: 0,
        value: vec![1, 2, 3, 4],
    }));
    pair.server.receive(packet, client_ip(), pair.now);
    pair.exchange();

    assert_eq!(pair.server.assoc.state(), State::Established);
    let reported = pair.client.indications.iter().any(|i| match i {
        Indication::PeerError(causes) => causes[0].code == ErrorCause::UNRECOGNIZED_CHUNK_TYPE,
        _ => false,
    });
    assert!(reported);
}

#[test]
fn invalid_commands_are_reported() {
    let mut pair = Pair::connected(quiet(), quiet());
    pair.send(17, b"nowhere");
    pair.send(0, b"");
    pair.client.command(Command::Associate, pair.now);

    assert!(pair.client.alive);
    assert!(pair.client.has(&Indication::Error(AssociationError::InvalidStream {
        stream: 17,
        count: 17,
    })));
    assert!(pair.client.has(&Indication::Error(AssociationError::EmptyMessage)));
    assert!(pair.client.has(&Indication::Error(AssociationError::InvalidState {
        state: State::Established,
        event: Event::Associate,
    })));
}

#[test]
fn full_send_queue_pushes_back() {
    let config = Config {
        send_queue_limit_messages: 2,
        ..quiet()
    };
    let mut pair = Pair::new(config, quiet());
    pair.client.command(Command::Associate, pair.now);
    for payload in [b"1", b"2", b"3"] {
        pair.send(0, payload);
    }
    assert!(pair.client.has(&Indication::SendQueueFull));
    assert!(pair.client.has(&Indication::Error(AssociationError::SendQueueFull)));

    pair.exchange();
    assert_eq!(pair.server.payloads(), [b"1", b"2"]);
    assert!(pair.client.has(&Indication::SendQueueAbated));
}

#[test]
fn receive_requests_when_not_delivering_on_arrival() {
    let server = Config {
        deliver_on_arrival: false,
        ..quiet()
    };
    let mut pair = Pair::connected(quiet(), server);
    pair.send(4, b"pull me");
    pair.exchange();
    assert!(pair.server.delivered.is_empty());
    assert!(pair.server.has(&Indication::DataArrived { messages: 1 }));

    pair.server.command(Command::Receive { stream: Some(4) }, pair.now);
    assert_eq!(pair.server.payloads(), [b"pull me"]);
    pair.server.command(Command::Receive { stream: None }, pair.now);
    assert!(pair.server.has(&Indication::Error(AssociationError::NothingToReceive)));
}

#[test]
fn stream_reset_restarts_sequence_numbers() {
    let mut pair = Pair::connected(quiet(), quiet());
    pair.send(1, b"before");
    pair.send(1, b"again");
    pair.exchange();
    assert_eq!(pair.server.delivered[1].ssn, 1);

    pair.client.command(Command::ResetStreams(vec![1]), pair.now);
    pair.exchange();
    assert!(pair.client.has(&Indication::StreamsReset {
        streams: vec![1],
        outgoing: true,
    }));
    assert!(pair.server.has(&Indication::StreamsReset {
        streams: vec![1],
        outgoing: false,
    }));

    pair.send(1, b"after");
    pair.exchange();
    let last = pair.server.delivered.last().unwrap();
    assert_eq!(last.payload, b"after");
    assert_eq!(last.ssn, 0);
}

#[test]
fn heartbeat_measures_round_trip() {
    let mut pair = Pair::connected(quiet(), quiet());
    pair.client.command(Command::Heartbeat(server_ip()), pair.now);
    pair.exchange();
    let status = pair.client.assoc.status();
    assert_eq!(status.paths[0].srtt, Some(Duration::ZERO));
    assert_eq!(status.paths[0].rto, Duration::from_secs(1));
    assert!(pair.client.timers.is_empty());

    pair.client
        .command(Command::Heartbeat(server_alternate_ip()), pair.now);
    assert!(pair.client.has(&Indication::Error(AssociationError::UnknownAddress(
        server_alternate_ip()
    ))));
}

#[test]
fn status_reports_negotiated_state() {
    let mut pair = Pair::connected(quiet(), quiet());
    pair.client.command(Command::Status, pair.now);
    let Some(Indication::Status(status)) = pair.client.indications.last() else {
        panic!("expected a status report");
    };
    assert_eq!(status.state, State::Established);
    assert_eq!(status.primary, server_ip());
    assert_eq!(status.outbound_streams, 17);
    assert_eq!(status.paths.len(), 1);
    assert!(status.paths[0].cwnd >= 1500);
    assert_eq!(status.peer_rwnd, 65536);
}
