//! Request/response client for the reqrep server demo.
//!
//! ```text
//! cargo run --example reqrep_client -- --address 127.0.0.1:2000
//! ```

use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};
use tcpline::codec::MsgPackCodec;
use tcpline::Client;

#[derive(Serialize, Default)]
struct Request {
    command: String,
    args: String,
}

#[derive(Deserialize, Default)]
struct Response {
    status: String,
    message: String,
}

#[derive(Parser)]
#[command(about = "tcpline request/response client")]
struct Args {
    /// Server address to connect to.
    #[arg(long, default_value = "127.0.0.1:2000")]
    address: String,

    /// Number of requests to send.
    #[arg(long, default_value_t = 10)]
    count: u32,
}

async fn send(client: &Client, request: &Request) -> tcpline::Result<Response> {
    let raw = MsgPackCodec::encode(request)?;
    let out = client.send_recv(&raw).await?;
    MsgPackCodec::decode(&out)
}

#[tokio::main]
async fn main() -> tcpline::Result<()> {
    tracing_subscriber::fmt().init();

    let args = Args::parse();
    let client = Client::connect(vec![args.address], 1, Duration::from_secs(3)).await?;

    for _ in 0..args.count {
        let response = send(
            &client,
            &Request {
                command: "SUCCEED".to_string(),
                args: "nil".to_string(),
            },
        )
        .await?;
        println!("{} {}", response.status, response.message);
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
    Ok(())
}
