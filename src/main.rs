use elvis_sctp::cli::initialize_from_arguments;

/// Runs a client and a server over a lossy in-memory link
#[tokio::main]
async fn main() {
    println!("elvis-sctp v{}", env!("CARGO_PKG_VERSION"));
    initialize_from_arguments().await;
    println!("Done");
}
