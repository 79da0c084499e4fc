//! Worker bootstrap: `worker-bootstrap <app-root>`.
//!
//! stdin/stdout carry the handshake channel and nothing else; all logging
//! goes to stderr.

use worker_loader::bootstrap::{self, Launch};
use worker_loader::handshake::HandshakeChannel;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(false)
        .init();

    let channel = HandshakeChannel::new(tokio::io::stdin(), tokio::io::stdout());
    let code = bootstrap::run(Launch::from_env(), channel).await;

    // Exit without tearing down the runtime: a blocking stdin read still in
    // flight would keep the runtime's drop waiting.
    std::process::exit(code);
}
