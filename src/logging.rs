//! Logging holds wrapper functions for the structured events of the
//! association core. Each function corresponds to one event target:
//! state transitions, chunk traffic and path status.

use crate::sctp::association::{AssocId, Event, State};
use std::{fs::OpenOptions, io, net::IpAddr, path::Path, sync::Arc};
use tracing::{event, Level};
use tracing_subscriber::FmtSubscriber;

/// Initializes event logging. Only should be called once when the program
/// starts. Writes JSON lines to a dated log file in `directory`.
pub fn init_events(directory: impl AsRef<Path>) -> io::Result<()> {
    let file_path = directory.as_ref().join(format!(
        "debug-{}.log",
        chrono::offset::Local::now().format("%y-%m-%d")
    ));
    let file = OpenOptions::new()
        .write(true)
        .append(true)
        .create(true)
        .open(file_path)?;
    let subscriber = FmtSubscriber::builder()
        .with_writer(Arc::new(file))
        .with_max_level(Level::TRACE)
        .json()
        .finish();
    // set the global default so all events go to the same file
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
}

/// State machine event handler.
/// Captures the association, the event and both ends of the transition.
pub fn state_event(assoc: AssocId, from: State, to: State, cause: Event) {
    event!(
        target: "STATE",
        Level::INFO,
        assoc = assoc.into_inner(),
        from = %from,
        to = %to,
        event = %cause
    );
}

/// Which way a chunk travelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sent,
    Received,
}

impl Direction {
    fn as_str(self) -> &'static str {
        match self {
            Direction::Sent => "sent",
            Direction::Received => "received",
        }
    }
}

/// Chunk event handler.
/// Used to log every chunk sent or received along with the peer address.
pub fn chunk_event(assoc: AssocId, direction: Direction, chunk: &'static str, address: IpAddr) {
    event!(
        target: "CHUNK",
        Level::DEBUG,
        assoc = assoc.into_inner(),
        direction = direction.as_str(),
        chunk = chunk,
        address = %address
    );
}

/// Path event handler.
/// Records reachability changes and primary path moves.
pub fn path_event(assoc: AssocId, address: IpAddr, active: bool, primary: bool) {
    event!(
        target: "PATH",
        Level::INFO,
        assoc = assoc.into_inner(),
        address = %address,
        active = active,
        primary = primary
    );
}
