//! Drives an [`Sctp`] endpoint with tokio.
//!
//! An [`EndpointSession`] owns the endpoint and runs a single task that
//! reads datagrams from a [`Link`], application instructions from a
//! [`SessionHandle`] and expirations from a timer queue. Everything the
//! associations ask for goes back out through the link or the handle.

use super::{
    association::{
        Action, AssocId, AssociationError, Command, Config, InboundMessage, Indication, OutboundMessage,
        TimerRequest, TimerToken,
    },
    DemuxOutcome, Sctp, SctpError,
};
use futures::future::poll_fn;
use rustc_hash::FxHashMap;
use std::net::SocketAddr;
use thiserror::Error as ThisError;
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_util::time::{delay_queue, DelayQueue};

/// An SCTP packet in flight between two hosts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub source: SocketAddr,
    pub destination: SocketAddr,
    pub bytes: Vec<u8>,
}

/// One end of a datagram channel.
pub struct Link {
    pub inbound: mpsc::Receiver<Datagram>,
    pub outbound: mpsc::Sender<Datagram>,
}

impl Link {
    /// Two links wired back to back.
    pub fn pair(capacity: usize) -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::channel(capacity);
        let (b_tx, b_rx) = mpsc::channel(capacity);
        (
            Link {
                inbound: a_rx,
                outbound: b_tx,
            },
            Link {
                inbound: b_rx,
                outbound: a_tx,
            },
        )
    }
}

/// Requests from the application to the session task
#[derive(Debug)]
pub enum Instruction {
    Associate {
        remote: SocketAddr,
        reply: oneshot::Sender<Result<AssocId, SctpError>>,
    },
    Command {
        id: AssocId,
        command: Command,
    },
    Stop,
}

/// What the session reports to the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A peer started an association with a listening session
    Accepted(AssocId),
    Message {
        id: AssocId,
        message: InboundMessage,
    },
    Indication {
        id: AssocId,
        indication: Indication,
    },
}

#[derive(Debug, ThisError)]
pub enum SessionError {
    #[error("The session task has stopped")]
    Stopped,
    #[error("{0}")]
    Sctp(#[from] SctpError),
}

/// The application's side of a running session.
pub struct SessionHandle {
    instructions: mpsc::UnboundedSender<Instruction>,
    notifications: mpsc::UnboundedReceiver<Notification>,
}

impl SessionHandle {
    /// Starts an association and returns its id once the INIT is queued.
    pub async fn associate(&self, remote: SocketAddr) -> Result<AssocId, SessionError> {
        let (reply, receiver) = oneshot::channel();
        self.instruct(Instruction::Associate { remote, reply })?;
        Ok(receiver.await.map_err(|_| SessionError::Stopped)??)
    }

    pub fn command(&self, id: AssocId, command: Command) -> Result<(), SessionError> {
        self.instruct(Instruction::Command { id, command })
    }

    pub fn send(&self, id: AssocId, message: OutboundMessage) -> Result<(), SessionError> {
        self.command(id, Command::Send(message))
    }

    /// Waits for the next notification. `None` once the session is gone.
    pub async fn next(&mut self) -> Option<Notification> {
        self.notifications.recv().await
    }

    pub fn stop(&self) -> Result<(), SessionError> {
        self.instruct(Instruction::Stop)
    }

    fn instruct(&self, instruction: Instruction) -> Result<(), SessionError> {
        self.instructions
            .send(instruction)
            .map_err(|_| SessionError::Stopped)
    }
}

/// Runs an endpoint on one local transport address.
pub struct EndpointSession {
    sctp: Sctp,
    local: SocketAddr,
    link: Link,
    instructions: mpsc::UnboundedReceiver<Instruction>,
    notifications: mpsc::UnboundedSender<Notification>,
    timers: DelayQueue<(AssocId, TimerToken)>,
    timer_keys: FxHashMap<(AssocId, TimerToken), delay_queue::Key>,
    /// Associations with actions to collect
    pending: Vec<AssocId>,
    outbox: Vec<Datagram>,
}

impl EndpointSession {
    pub fn new(config: Config, local: SocketAddr, link: Link) -> (Self, SessionHandle) {
        let (instruction_tx, instruction_rx) = mpsc::unbounded_channel();
        let (notification_tx, notification_rx) = mpsc::unbounded_channel();
        let session = Self {
            sctp: Sctp::new(config),
            local,
            link,
            instructions: instruction_rx,
            notifications: notification_tx,
            timers: DelayQueue::new(),
            timer_keys: Default::default(),
            pending: vec![],
            outbox: vec![],
        };
        let handle = SessionHandle {
            instructions: instruction_tx,
            notifications: notification_rx,
        };
        (session, handle)
    }

    /// Accept associations from peers.
    pub fn listening(self) -> Result<Self, SctpError> {
        self.sctp.listen(self.local)?;
        Ok(self)
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    /// Runs until told to stop or until the handle is dropped.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                Some(datagram) = self.link.inbound.recv() => self.receive(datagram),
                instruction = self.instructions.recv() => match instruction {
                    Some(Instruction::Stop) | None => break,
                    Some(instruction) => self.instruct(instruction),
                },
                Some(expired) = poll_fn(|cx| self.timers.poll_expired(cx)) => {
                    let (id, token) = expired.into_inner();
                    self.timer_keys.remove(&(id, token));
                    match self.sctp.timeout(id, token, now()) {
                        Ok(_) => self.pending.push(id),
                        Err(e) => tracing::debug!("Timer for a finished association: {}", e),
                    }
                },
            }
            self.flush().await;
        }
        tracing::debug!(local = %self.local, "session stopped");
    }

    fn receive(&mut self, datagram: Datagram) {
        if datagram.destination != self.local {
            tracing::trace!(destination = %datagram.destination, "datagram for another host");
            return;
        }
        match self
            .sctp
            .demux_bytes(&datagram.bytes, datagram.source.ip(), now())
        {
            Ok(DemuxOutcome::Processed(id)) => self.pending.push(id),
            Ok(DemuxOutcome::Created(id)) => {
                self.notify(Notification::Accepted(id));
                self.pending.push(id);
            }
            Ok(DemuxOutcome::OutOfTheBlue(Some((destination, packet)))) => {
                self.outbox.push(Datagram {
                    source: self.local,
                    destination,
                    bytes: packet.serialize(),
                });
            }
            Ok(DemuxOutcome::OutOfTheBlue(None)) => {}
            Err(e) => tracing::warn!(source = %datagram.source, "Dropping datagram: {}", e),
        }
    }

    fn instruct(&mut self, instruction: Instruction) {
        match instruction {
            Instruction::Associate { remote, reply } => {
                let result = self.sctp.associate(self.local, remote, now());
                if let Ok(id) = result {
                    self.pending.push(id);
                }
                // The application may have stopped waiting
                let _ = reply.send(result);
            }
            Instruction::Command { id, command } => match self.sctp.command(id, command, now()) {
                Ok(_) => self.pending.push(id),
                Err(e) => {
                    tracing::debug!("Command dropped: {}", e);
                    self.notify(Notification::Indication {
                        id,
                        indication: Indication::Error(AssociationError::Closed),
                    });
                }
            },
            Instruction::Stop => {}
        }
    }

    /// Carries out the actions of every association touched since the
    /// last flush, then hands queued datagrams to the link.
    async fn flush(&mut self) {
        let mut pending = std::mem::take(&mut self.pending);
        pending.sort();
        pending.dedup();
        for id in pending {
            for action in self.sctp.poll_actions(id) {
                self.act(id, action);
            }
        }
        for datagram in self.outbox.drain(..) {
            if self.link.outbound.send(datagram).await.is_err() {
                tracing::warn!(local = %self.local, "link closed, dropping datagram");
            }
        }
    }

    fn act(&mut self, id: AssocId, action: Action) {
        match action {
            Action::Transmit {
                destination,
                packet,
            } => self.outbox.push(Datagram {
                source: self.local,
                destination,
                bytes: packet.serialize(),
            }),
            Action::Timer(TimerRequest::Start { token, after }) => {
                let key = self.timers.insert((id, token), after);
                if let Some(old) = self.timer_keys.insert((id, token), key) {
                    self.timers.remove(&old);
                }
            }
            Action::Timer(TimerRequest::Cancel(token)) => {
                if let Some(key) = self.timer_keys.remove(&(id, token)) {
                    self.timers.remove(&key);
                }
            }
            Action::Deliver(message) => self.notify(Notification::Message { id, message }),
            Action::Indication(indication) => {
                self.notify(Notification::Indication { id, indication })
            }
        }
    }

    fn notify(&self, notification: Notification) {
        if self.notifications.send(notification).is_err() {
            tracing::trace!("notification dropped, nobody is listening");
        }
    }
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}
