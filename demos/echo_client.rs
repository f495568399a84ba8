//! Echo client: sends PINGs to an echo server and prints the replies.
//!
//! ```text
//! cargo run --example echo_client -- --address 127.0.0.1:2000
//! ```

use std::time::Duration;

use clap::Parser;
use tcpline::Client;

#[derive(Parser)]
#[command(about = "tcpline echo client")]
struct Args {
    /// Server address to connect to.
    #[arg(long, default_value = "127.0.0.1:2000")]
    address: String,

    /// Number of requests to send.
    #[arg(long, default_value_t = 10)]
    count: u32,
}

#[tokio::main]
async fn main() -> tcpline::Result<()> {
    tracing_subscriber::fmt().init();

    let args = Args::parse();
    let client = Client::connect(vec![args.address], 1, Duration::from_secs(3)).await?;

    for i in 0..args.count {
        let payload = format!("PING{i}");
        let resp = client.send_recv(payload.as_bytes()).await?;
        println!("{} -> {}", payload, String::from_utf8_lossy(&resp));
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    Ok(())
}
