//! An implementation of the
//! [Stream Control Transmission Protocol](https://www.rfc-editor.org/rfc/rfc4960).
//!
//! [`Sctp`] is the endpoint. It owns every association on the host, hands
//! inbound packets to the right one and answers packets that belong to no
//! association. The associations themselves live in [`association`] and do
//! no I/O; [`session`] drives an endpoint with tokio.

pub mod association;
pub mod sctp_parsing;
pub mod session;

use self::{
    association::{Action, AssocId, Association, Command, Config, TimerToken},
    sctp_parsing::{Abort, Chunk, ErrorCause, Packet, ParseError},
};
use dashmap::{mapref::entry::Entry, DashMap};
use std::{
    net::{IpAddr, SocketAddr},
    sync::atomic::{AtomicU32, Ordering},
    time::Instant,
};
use thiserror::Error as ThisError;
use tracing::{debug, trace};

/// The SCTP endpoint.
pub struct Sctp {
    config: Config,
    next_id: AtomicU32,
    /// Local addresses accepting new associations, keyed by port
    listen_bindings: DashMap<u16, SocketAddr>,
    associations: DashMap<AssocId, Association>,
    lookup: DashMap<SessionId, AssocId>,
}

impl Sctp {
    /// Creates an endpoint. Every association it creates starts from
    /// `config`.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            next_id: AtomicU32::new(1),
            listen_bindings: Default::default(),
            associations: Default::default(),
            lookup: Default::default(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Accept associations started by peers on `local`'s port.
    pub fn listen(&self, local: SocketAddr) -> Result<(), SctpError> {
        match self.listen_bindings.entry(local.port()) {
            Entry::Occupied(_) => Err(SctpError::AlreadyListening(local.port())),
            Entry::Vacant(entry) => {
                entry.insert(local);
                Ok(())
            }
        }
    }

    /// Stop accepting new associations on a port. Existing associations
    /// are left alone.
    pub fn unlisten(&self, port: u16) -> bool {
        self.listen_bindings.remove(&port).is_some()
    }

    /// Starts an association with `remote`. The INIT is among the actions
    /// of the returned association.
    pub fn associate(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        now: Instant,
    ) -> Result<AssocId, SctpError> {
        let session_id = SessionId::new(local.port(), remote);
        let id = match self.lookup.entry(session_id) {
            Entry::Occupied(_) => Err(SctpError::AssociationExists(remote))?,
            Entry::Vacant(entry) => {
                let id = self.allocate_id();
                entry.insert(id);
                id
            }
        };
        let mut association = Association::new(id, self.config.clone(), local, remote, now);
        association.process_command(Command::Associate, now);
        self.associations.insert(id, association);
        debug!(assoc = %id, remote = %remote, "associating");
        Ok(id)
    }

    /// Parses a datagram and hands it to its association.
    pub fn demux_bytes(
        &self,
        bytes: &[u8],
        source: IpAddr,
        now: Instant,
    ) -> Result<DemuxOutcome, SctpError> {
        let packet = Packet::from_bytes(bytes)?;
        Ok(self.demux(packet, source, now))
    }

    /// Hands a packet to the association it belongs to. A packet for an
    /// unknown association creates one when it carries an INIT for a
    /// listening port. Anything else is out of the blue.
    pub fn demux(&self, packet: Packet, source: IpAddr, now: Instant) -> DemuxOutcome {
        let remote = SocketAddr::new(source, packet.header.src_port);
        let session_id = SessionId::new(packet.header.dst_port, remote);

        let existing = self.lookup.get(&session_id).map(|id| *id);
        if let Some(id) = existing {
            self.process(id, |association| {
                association.process_packet(packet, source, now)
            });
            return DemuxOutcome::Processed(id);
        }

        let listening = self
            .listen_bindings
            .get(&packet.header.dst_port)
            .map(|local| *local);
        match listening {
            Some(local) if packet.chunks.iter().any(|c| matches!(c, Chunk::Init(_))) => {
                let id = match self.lookup.entry(session_id) {
                    // Raced with another INIT from the same peer
                    Entry::Occupied(entry) => *entry.get(),
                    Entry::Vacant(entry) => {
                        let id = self.allocate_id();
                        entry.insert(id);
                        let mut association =
                            Association::new(id, self.config.clone(), local, remote, now);
                        association.process_command(Command::OpenPassive, now);
                        self.associations.insert(id, association);
                        debug!(assoc = %id, remote = %remote, "accepting");
                        id
                    }
                };
                self.process(id, |association| {
                    association.process_packet(packet, source, now)
                });
                DemuxOutcome::Created(id)
            }
            _ => DemuxOutcome::OutOfTheBlue(out_of_the_blue(packet, remote)),
        }
    }

    /// Passes an application request to an association.
    pub fn command(&self, id: AssocId, command: Command, now: Instant) -> Result<bool, SctpError> {
        self.process(id, |association| association.process_command(command, now))
            .ok_or(SctpError::NoSuchAssociation(id))
    }

    /// Fires an expired timer.
    pub fn timeout(&self, id: AssocId, token: TimerToken, now: Instant) -> Result<bool, SctpError> {
        self.process(id, |association| association.process_timer(token, now))
            .ok_or(SctpError::NoSuchAssociation(id))
    }

    /// Drains the work an association has for the driver. An association
    /// that has been torn down is forgotten once its last actions are
    /// taken.
    pub fn poll_actions(&self, id: AssocId) -> Vec<Action> {
        let (actions, torn_down) = match self.associations.get_mut(&id) {
            Some(mut association) => (association.poll_actions(), association.is_torn_down()),
            None => return vec![],
        };
        if torn_down {
            self.remove(id);
        }
        actions
    }

    /// Runs `f` with an association, then records any peer addresses it
    /// learned so later packets from them find it.
    fn process<T>(&self, id: AssocId, f: impl FnOnce(&mut Association) -> T) -> Option<T> {
        let mut association = self.associations.get_mut(&id)?;
        let out = f(&mut association);
        let port = association.local_address().port();
        let remote_port = association.remote_port();
        for address in association.remote_addresses() {
            let session_id = SessionId::new(port, SocketAddr::new(address, remote_port));
            self.lookup.entry(session_id).or_insert(id);
        }
        Some(out)
    }

    fn remove(&self, id: AssocId) {
        if self.associations.remove(&id).is_some() {
            self.lookup.retain(|_, assoc| *assoc != id);
            debug!(assoc = %id, "association removed");
        }
    }

    fn allocate_id(&self) -> AssocId {
        AssocId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Ids of every association the endpoint holds
    pub fn association_ids(&self) -> Vec<AssocId> {
        let mut ids: Vec<_> = self.associations.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    pub fn find(&self, local_port: u16, remote: SocketAddr) -> Option<AssocId> {
        self.lookup
            .get(&SessionId::new(local_port, remote))
            .map(|id| *id)
    }

    /// Runs `f` with read access to an association.
    pub fn with_association<T>(&self, id: AssocId, f: impl FnOnce(&Association) -> T) -> Option<T> {
        self.associations.get(&id).map(|association| f(&association))
    }

    pub fn len(&self) -> usize {
        self.associations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.associations.is_empty()
    }
}

/// Builds the reply to a packet that matches no association, as laid out
/// in RFC 4960 section 8.4.
fn out_of_the_blue(packet: Packet, remote: SocketAddr) -> Option<(SocketAddr, Packet)> {
    let header = packet.header;
    let mut reply = Packet::new(header.dst_port, header.src_port, header.verification_tag);
    for chunk in packet.chunks.iter() {
        match chunk {
            Chunk::Abort(_) | Chunk::ShutdownComplete { .. } => {
                trace!(chunk = chunk.name(), remote = %remote, "discarding out of the blue");
                return None;
            }
            Chunk::ShutdownAck => {
                reply
                    .chunks
                    .push(Chunk::ShutdownComplete { reflected: true });
                return Some((remote, reply));
            }
            Chunk::Init(init) => {
                // The peer has no tag of ours yet, so answer with its own
                reply.header.verification_tag = init.initiate_tag;
                reply.chunks.push(Chunk::Abort(Abort {
                    reflected: false,
                    causes: vec![],
                }));
                return Some((remote, reply));
            }
            _ => {}
        }
    }
    reply.chunks.push(Chunk::Abort(Abort {
        reflected: true,
        causes: vec![ErrorCause::protocol_violation("no such association")],
    }));
    Some((remote, reply))
}

/// What became of a demultiplexed packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemuxOutcome {
    /// Handled by an existing association
    Processed(AssocId),
    /// Started a new association on a listening port
    Created(AssocId),
    /// No association wanted the packet. Holds the reply to send, if any.
    OutOfTheBlue(Option<(SocketAddr, Packet)>),
}

/// Keys an association by the local port and one of the peer's transport
/// addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId {
    pub local_port: u16,
    pub remote: SocketAddr,
}

impl SessionId {
    pub fn new(local_port: u16, remote: SocketAddr) -> Self {
        Self { local_port, remote }
    }
}

#[derive(Debug, ThisError, Clone, PartialEq, Eq)]
pub enum SctpError {
    #[error("Already listening on port {0}")]
    AlreadyListening(u16),
    #[error("An association with {0} already exists")]
    AssociationExists(SocketAddr),
    #[error("No association {0}")]
    NoSuchAssociation(AssocId),
    #[error("{0}")]
    Parse(#[from] ParseError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sctp::association::State;
    use tracing_test::traced_test;

    fn client_addr() -> SocketAddr {
        "10.0.0.1:5000".parse().unwrap()
    }

    fn server_addr() -> SocketAddr {
        "10.0.0.2:6000".parse().unwrap()
    }

    fn transmitted(actions: Vec<Action>) -> Vec<(SocketAddr, Packet)> {
        actions
            .into_iter()
            .filter_map(|action| match action {
                Action::Transmit {
                    destination,
                    packet,
                } => Some((destination, packet)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn endpoints_complete_a_handshake() {
        let now = Instant::now();
        let client = Sctp::new(Config::default());
        let server = Sctp::new(Config::default());
        server.listen(server_addr()).unwrap();

        let id = client.associate(client_addr(), server_addr(), now).unwrap();
        let mut server_id = None;
        let mut to_server = transmitted(client.poll_actions(id));
        for _ in 0..4 {
            let mut to_client = vec![];
            for (_, packet) in to_server.drain(..) {
                let outcome = server.demux(packet, client_addr().ip(), now);
                let sid = match outcome {
                    DemuxOutcome::Processed(sid) | DemuxOutcome::Created(sid) => sid,
                    other => panic!("unexpected {other:?}"),
                };
                server_id = Some(sid);
                to_client.extend(transmitted(server.poll_actions(sid)));
            }
            for (_, packet) in to_client {
                assert_eq!(
                    client.demux(packet, server_addr().ip(), now),
                    DemuxOutcome::Processed(id)
                );
                to_server.extend(transmitted(client.poll_actions(id)));
            }
        }

        let server_id = server_id.unwrap();
        assert_eq!(client.with_association(id, Association::state), Some(State::Established));
        assert_eq!(
            server.with_association(server_id, Association::state),
            Some(State::Established)
        );
        assert_eq!(server.find(6000, client_addr()), Some(server_id));
    }

    #[test]
    fn second_association_to_the_same_peer_is_refused() {
        let now = Instant::now();
        let client = Sctp::new(Config::default());
        client.associate(client_addr(), server_addr(), now).unwrap();
        assert_eq!(
            client.associate(client_addr(), server_addr(), now),
            Err(SctpError::AssociationExists(server_addr()))
        );
    }

    #[test]
    fn listening_twice_fails() {
        let server = Sctp::new(Config::default());
        server.listen(server_addr()).unwrap();
        assert_eq!(
            server.listen(server_addr()),
            Err(SctpError::AlreadyListening(6000))
        );
        assert!(server.unlisten(6000));
        server.listen(server_addr()).unwrap();
    }

    #[test]
    fn init_without_listener_is_aborted() {
        let now = Instant::now();
        let client = Sctp::new(Config::default());
        let server = Sctp::new(Config::default());
        let id = client.associate(client_addr(), server_addr(), now).unwrap();
        let (_, init) = transmitted(client.poll_actions(id)).remove(0);
        let initiate_tag = match &init.chunks[0] {
            Chunk::Init(init) => init.initiate_tag,
            other => panic!("unexpected {other:?}"),
        };

        let reply = match server.demux(init, client_addr().ip(), now) {
            DemuxOutcome::OutOfTheBlue(Some((destination, reply))) => {
                assert_eq!(destination, client_addr());
                reply
            }
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(reply.header.verification_tag, initiate_tag);
        assert!(matches!(
            reply.chunks[0],
            Chunk::Abort(Abort {
                reflected: false,
                ..
            })
        ));
        assert!(server.is_empty());

        // The client gives up on hearing the ABORT
        client.demux(reply, server_addr().ip(), now);
        client.poll_actions(id);
        assert!(client.is_empty());
    }

    #[test]
    fn out_of_the_blue_shutdown_ack_is_completed() {
        let server = Sctp::new(Config::default());
        let mut packet = Packet::new(5000, 6000, 0xfeed);
        packet.chunks.push(Chunk::ShutdownAck);
        match server.demux(packet, client_addr().ip(), Instant::now()) {
            DemuxOutcome::OutOfTheBlue(Some((_, reply))) => {
                assert_eq!(reply.header.verification_tag, 0xfeed);
                assert_eq!(reply.chunks, vec![Chunk::ShutdownComplete { reflected: true }]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn out_of_the_blue_abort_and_shutdown_complete_are_discarded() {
        let server = Sctp::new(Config::default());
        for chunk in [
            Chunk::Abort(Abort::default()),
            Chunk::ShutdownComplete { reflected: false },
        ] {
            let mut packet = Packet::new(5000, 6000, 1);
            packet.chunks.push(chunk);
            assert_eq!(
                server.demux(packet, client_addr().ip(), Instant::now()),
                DemuxOutcome::OutOfTheBlue(None)
            );
        }
    }

    #[test]
    fn out_of_the_blue_data_is_answered_with_reflected_abort() {
        let server = Sctp::new(Config::default());
        let mut packet = Packet::new(5000, 6000, 77);
        packet.chunks.push(Chunk::CookieAck);
        match server.demux(packet, client_addr().ip(), Instant::now()) {
            DemuxOutcome::OutOfTheBlue(Some((_, reply))) => {
                assert_eq!(reply.header.verification_tag, 77);
                assert!(matches!(
                    reply.chunks[0],
                    Chunk::Abort(Abort {
                        reflected: true,
                        ..
                    })
                ));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let server = Sctp::new(Config::default());
        assert!(matches!(
            server.demux_bytes(&[1, 2, 3], client_addr().ip(), Instant::now()),
            Err(SctpError::Parse(_))
        ));
    }

    #[test]
    #[traced_test]
    fn aborted_association_is_forgotten() -> anyhow::Result<()> {
        let now = Instant::now();
        let client = Sctp::new(Config::default());
        let id = client.associate(client_addr(), server_addr(), now)?;
        client.poll_actions(id);

        assert!(!client.command(id, Command::Abort, now)?);
        // Still held until its final actions are collected
        assert_eq!(client.association_ids(), vec![id]);
        let actions = client.poll_actions(id);
        assert!(actions.iter().any(|action| matches!(action, Action::Indication(_))));
        assert!(client.is_empty());
        assert_eq!(client.find(5000, server_addr()), None);
        assert!(logs_contain("association removed"));
        Ok(())
    }

    #[test]
    fn unknown_association_commands_fail() {
        let server = Sctp::new(Config::default());
        assert_eq!(
            server.command(AssocId::new(9), Command::Abort, Instant::now()),
            Err(SctpError::NoSuchAssociation(AssocId::new(9)))
        );
    }
}
