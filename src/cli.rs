//! Parses the command line arguments and runs the demonstration: a client
//! and a server exchanging messages over a lossy in-memory link.
//!
//! Basic usage with logging on:
//!
//! ```cargo run -- --log --messages 500 --loss 0.1```

use crate::{
    logging::init_events,
    sctp::{
        association::{AssocId, Command, Config, Indication, OutboundMessage},
        session::{Datagram, EndpointSession, Link, Notification, SessionError, SessionHandle},
        SctpError,
    },
};
use clap::Parser;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use std::{
    fmt,
    fs::create_dir_all,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error as ThisError;

/// Stores the different command line arguments.
#[derive(Parser)]
struct Args {
    /// Logging flag. Used to turn logging on or off.
    #[arg(short, long)]
    log: bool,
    /// Messages the client sends
    #[arg(short, long, default_value_t = 100)]
    messages: u32,
    /// Chance of losing each datagram, from 0 up to but not including 1
    #[arg(long, default_value_t = 0.05)]
    loss: f64,
    /// Seed for the loss pattern
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

/// Parses command line arguments and runs the demonstration until it
/// finishes or ctrl-c is pressed.
pub async fn initialize_from_arguments() {
    let cli = Args::parse();
    if cli.log {
        initialize_logging();
    }
    if !(0.0..1.0).contains(&cli.loss) {
        eprintln!("Loss must be at least 0 and below 1, got {}", cli.loss);
        return;
    }
    tokio::select! {
        result = run_demo(cli.messages, cli.loss, cli.seed) => match result {
            Ok(report) => println!("{report}"),
            Err(e) => eprintln!("{e}"),
        },
        _ = tokio::signal::ctrl_c() => eprintln!("Interrupted"),
    }
}

/// Writes event logs under ./logs
fn initialize_logging() {
    let main_path = "./logs";
    if let Err(e) = create_dir_all(main_path).and_then(|_| init_events(main_path)) {
        eprintln!("Could not start logging: {e}");
    }
}

/// Timers short enough for an interactive run
fn demo_config() -> Config {
    Config {
        rto_initial: Duration::from_millis(300),
        rto_min: Duration::from_millis(100),
        rto_max: Duration::from_secs(2),
        init_rto_max: Duration::from_secs(2),
        heartbeat_interval: Duration::from_secs(1),
        ..Default::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoReport {
    pub messages: u32,
    pub bytes: usize,
    pub dropped: usize,
}

impl fmt::Display for DemoReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Delivered {} messages ({} bytes), the link dropped {} datagrams",
            self.messages, self.bytes, self.dropped
        )
    }
}

#[derive(Debug, ThisError)]
pub enum DemoError {
    #[error("{0}")]
    Session(#[from] SessionError),
    #[error("{0}")]
    Sctp(#[from] SctpError),
    #[error("The association failed: {0:?}")]
    Failed(Indication),
    #[error("A session ended early")]
    Ended,
}

/// Sends `messages` messages from a client to a server across a link that
/// loses datagrams with probability `loss`, then shuts the association
/// down.
pub async fn run_demo(messages: u32, loss: f64, seed: u64) -> Result<DemoReport, DemoError> {
    let client_address: SocketAddr = ([10, 0, 0, 1], 5000).into();
    let server_address: SocketAddr = ([10, 0, 0, 2], 6000).into();

    let (client_link, client_far) = Link::pair(256);
    let (server_link, server_far) = Link::pair(256);
    let (client, mut client_handle) =
        EndpointSession::new(demo_config(), client_address, client_link);
    let (server, mut server_handle) =
        EndpointSession::new(demo_config(), server_address, server_link);
    let server = server.listening()?;
    tokio::spawn(client.run());
    tokio::spawn(server.run());

    let dropped = Arc::new(AtomicUsize::new(0));
    let relay = tokio::spawn(relay(client_far, server_far, loss, seed, dropped.clone()));

    let id = client_handle.associate(server_address).await?;
    let streams = match wait_for_indication(&mut client_handle, |indication| {
        matches!(indication, Indication::Established { .. })
    })
    .await?
    {
        Indication::Established {
            outbound_streams, ..
        } => outbound_streams.max(1),
        _ => 1,
    };
    tracing::info!(assoc = %id, streams, "established");

    for i in 0..messages {
        let stream = (i % u32::from(streams)) as u16;
        let payload = format!("message {i}").into_bytes();
        client_handle.send(id, OutboundMessage::new(stream, payload))?;
    }

    let mut report = DemoReport {
        messages: 0,
        bytes: 0,
        dropped: 0,
    };
    while report.messages < messages {
        match server_handle.next().await.ok_or(DemoError::Ended)? {
            Notification::Message { message, .. } => {
                report.messages += 1;
                report.bytes += message.payload.len();
            }
            Notification::Indication { indication, .. } if is_failure(&indication) => {
                Err(DemoError::Failed(indication))?
            }
            _ => {}
        }
    }

    client_handle.command(id, Command::Close)?;
    wait_for_indication(&mut client_handle, |indication| {
        *indication == Indication::ShutdownComplete
    })
    .await?;
    finish(&client_handle, &server_handle, id);
    relay.abort();

    report.dropped = dropped.load(Ordering::Relaxed);
    Ok(report)
}

fn finish(client: &SessionHandle, server: &SessionHandle, id: AssocId) {
    tracing::info!(assoc = %id, "demo finished");
    // Either task may already be gone
    let _ = client.stop();
    let _ = server.stop();
}

fn is_failure(indication: &Indication) -> bool {
    matches!(
        indication,
        Indication::Aborted { .. } | Indication::CommunicationLost(_)
    )
}

async fn wait_for_indication(
    handle: &mut SessionHandle,
    wanted: impl Fn(&Indication) -> bool,
) -> Result<Indication, DemoError> {
    loop {
        if let Notification::Indication { indication, .. } =
            handle.next().await.ok_or(DemoError::Ended)?
        {
            if wanted(&indication) {
                return Ok(indication);
            }
            if is_failure(&indication) {
                Err(DemoError::Failed(indication))?
            }
        }
    }
}

/// Carries datagrams between two links, losing some on the way.
async fn relay(
    mut client: Link,
    mut server: Link,
    loss: f64,
    seed: u64,
    dropped: Arc<AtomicUsize>,
) {
    let mut rng = SmallRng::seed_from_u64(seed);
    loop {
        let (datagram, out): (Datagram, _) = tokio::select! {
            Some(datagram) = client.inbound.recv() => (datagram, &server.outbound),
            Some(datagram) = server.inbound.recv() => (datagram, &client.outbound),
            else => break,
        };
        if rng.gen_bool(loss) {
            dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(destination = %datagram.destination, "relay dropped a datagram");
            continue;
        }
        if out.send(datagram).await.is_err() {
            break;
        }
    }
}
