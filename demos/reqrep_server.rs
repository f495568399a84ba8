//! Request/response server over the typed service adapter.
//!
//! The codec round trip is handled by [`TypedService`]; only the business
//! logic lives here.
//!
//! ```text
//! cargo run --example reqrep_server -- --address 127.0.0.1:2000
//! ```

use clap::Parser;
use serde::{Deserialize, Serialize};
use tcpline::{Server, Span, TypedService};

#[derive(Deserialize, Default)]
struct Request {
    command: String,
    args: String,
}

#[derive(Serialize, Default)]
struct Response {
    status: String,
    message: String,
}

#[derive(Parser)]
#[command(about = "tcpline request/response server")]
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
    let service = TypedService::new(|req: &Request, res: &mut Response, span: &mut Span| {
        span.attr("command", &req.command);
        if req.command == "SUCCEED" {
            res.status = "OK".to_string();
            res.message = "Request Succeeded".to_string();
        } else {
            res.status = "ERR".to_string();
            res.message = format!("Request Failed: {}", req.args);
        }
    });

    let server = Server::bind(&args.address, service).await?;
    server.serve().await
}
