//! Echo server: answers every request with its own payload.
//!
//! ```text
//! cargo run --example echo_server -- --address 127.0.0.1:2000
//! ```

use clap::Parser;
use tcpline::{handler_fn, Server};

#[derive(Parser)]
#[command(about = "tcpline echo server")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:2000")]
    address: String,
}

#[tokio::main]
async fn main() -> tcpline::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let server = Server::bind(
        &args.address,
        handler_fn(|req, span| {
            span.attr("command", "ECHO");
            Ok(req.to_vec())
        }),
    )
    .await?;
    server.serve().await
}
