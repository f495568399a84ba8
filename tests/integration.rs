//! End-to-end tests over real sockets: server, client, pipeline, and the
//! typed service adapter.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tcpline::codec::MsgPackCodec;
use tcpline::{
    handler_fn, wire, BoxFuture, Client, Handler, Result, Server, Span, TcplineError,
    TypedService,
};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

const DIAL_TIMEOUT: Duration = Duration::from_secs(3);

struct EchoHandler;

impl Handler for EchoHandler {
    fn respond<'a>(&'a self, req: &'a [u8], _span: &'a mut Span) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(std::future::ready(Ok(req.to_vec())))
    }
}

async fn spawn_server(handler: impl Handler) -> (Arc<Server>, String) {
    let server = Arc::new(Server::bind("127.0.0.1:0", handler).await.unwrap());
    let addr = server.local_addr().to_string();
    tokio::spawn({
        let server = server.clone();
        async move {
            let _ = server.serve().await;
        }
    });
    (server, addr)
}

#[tokio::test]
async fn test_echo_server() {
    let (server, addr) = spawn_server(EchoHandler).await;
    let client = Client::connect(vec![addr], 3, DIAL_TIMEOUT).await.unwrap();

    for _ in 0..100 {
        let resp = client.send_recv(b"PING").await.unwrap();
        assert_eq!(resp, b"PING");
    }
    server.close().unwrap();
}

#[tokio::test]
async fn test_echo_server_pipelined() {
    let (server, addr) = spawn_server(EchoHandler).await;
    let client = Client::connect(vec![addr], 3, DIAL_TIMEOUT).await.unwrap();

    let pipe = client.pipeline();
    for i in 0..10 {
        pipe.send(format!("PING{i}").as_bytes()).await.unwrap();
    }
    let returned = pipe.flush().await.unwrap();
    assert_eq!(returned.len(), 10);
    for (i, resp) in returned.iter().enumerate() {
        assert_eq!(resp, format!("PING{i}").as_bytes());
    }
    server.close().unwrap();
}

#[tokio::test]
async fn test_send_after_close_fails() {
    let (server, addr) = spawn_server(EchoHandler).await;
    let client = Client::connect(vec![addr], 3, DIAL_TIMEOUT).await.unwrap();
    assert_eq!(client.send_recv(b"PING").await.unwrap(), b"PING");

    server.close().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(client.send_recv(b"PING").await.is_err());
    assert_eq!(server.num_connections(), 0);
}

#[tokio::test]
async fn test_echo_server_reconnect() {
    let (server, addr) = spawn_server(EchoHandler).await;
    let client = Client::connect(vec![addr.clone()], 1, DIAL_TIMEOUT)
        .await
        .unwrap();
    for _ in 0..10 {
        assert_eq!(client.send_recv(b"PING").await.unwrap(), b"PING");
    }

    server.close().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    // The lone pooled connection is dead; this call drops it and fails.
    assert!(client.send_recv(b"PING").await.is_err());
    assert_eq!(server.num_connections(), 0);

    // Restart at the same address; the reused client dials fresh.
    let server = Arc::new(Server::bind(&addr, EchoHandler).await.unwrap());
    tokio::spawn({
        let server = server.clone();
        async move {
            let _ = server.serve().await;
        }
    });
    for _ in 0..10 {
        assert_eq!(client.send_recv(b"PING").await.unwrap(), b"PING");
    }
    server.close().unwrap();
}

#[derive(Serialize, Deserialize, Default)]
struct Request {
    command: String,
    args: String,
}

#[derive(Serialize, Deserialize, Default)]
struct Response {
    status: String,
    message: String,
}

#[tokio::test]
async fn test_typed_service() {
    let service = TypedService::new(|req: &Request, res: &mut Response, span: &mut Span| {
        span.increment("response");
        res.status = "OK".to_string();
        res.message = format!("Got command: {} args: {}", req.command, req.args);
    });
    let (server, addr) = spawn_server(service).await;
    let client = Client::connect(vec![addr], 3, DIAL_TIMEOUT).await.unwrap();

    for _ in 0..100 {
        let raw = MsgPackCodec::encode(&Request {
            command: "GET".to_string(),
            args: "/".to_string(),
        })
        .unwrap();
        let out = client.send_recv(&raw).await.unwrap();
        let response: Response = MsgPackCodec::decode(&out).unwrap();
        assert_eq!(response.status, "OK");
        assert_eq!(response.message, "Got command: GET args: /");
    }
    server.close().unwrap();
}

#[tokio::test]
async fn test_large_payload_round_trip() {
    let (server, addr) = spawn_server(EchoHandler).await;
    let client = Client::connect(vec![addr], 1, DIAL_TIMEOUT).await.unwrap();

    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
    let resp = client.send_recv(&payload).await.unwrap();
    assert_eq!(resp, payload);
    server.close().unwrap();
}

#[tokio::test]
async fn test_concurrent_clients() {
    let (server, addr) = spawn_server(EchoHandler).await;
    let client = Arc::new(Client::connect(vec![addr], 3, DIAL_TIMEOUT).await.unwrap());

    let mut tasks = Vec::new();
    for worker in 0..4u32 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            for i in 0..25u32 {
                let payload = format!("PING-{worker}-{i}");
                let resp = client.send_recv(payload.as_bytes()).await.unwrap();
                assert_eq!(resp, payload.as_bytes());
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }
    server.close().unwrap();
}

#[tokio::test]
async fn test_batched_requests_are_tagged_multi() {
    let handler = handler_fn(|req, span| {
        // Runs only for pipelined sub-requests in this test.
        assert_eq!(span.attrs().get("multi").map(String::as_str), Some("true"));
        assert!(span.counters()["num_connections"] >= 1);
        Ok(req.to_vec())
    });
    let (server, addr) = spawn_server(handler).await;
    let client = Client::connect(vec![addr], 1, DIAL_TIMEOUT).await.unwrap();

    let pipe = client.pipeline();
    for i in 0..3 {
        pipe.send(format!("P{i}").as_bytes()).await.unwrap();
    }
    // A failed assertion above would surface as an empty response here.
    let returned = pipe.flush().await.unwrap();
    assert_eq!(returned, vec![b"P0".to_vec(), b"P1".to_vec(), b"P2".to_vec()]);
    server.close().unwrap();
}

#[tokio::test]
async fn test_single_requests_are_not_tagged_multi() {
    let handler = handler_fn(|req, span| {
        if span.attrs().contains_key("multi") {
            return Err(TcplineError::Protocol("unexpected multi attr".into()));
        }
        Ok(req.to_vec())
    });
    let (server, addr) = spawn_server(handler).await;
    let client = Client::connect(vec![addr], 1, DIAL_TIMEOUT).await.unwrap();
    assert_eq!(client.send_recv(b"PING").await.unwrap(), b"PING");
    server.close().unwrap();
}

#[tokio::test]
async fn test_pipeline_count_mismatch_is_protocol_error() {
    // A rogue server that answers a two-element batch with a one-element
    // batch; the client must reject the flush.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut hdr = [0u8; 4];
        stream.read_exact(&mut hdr).await.unwrap();
        let count = (-i32::from_be_bytes(hdr)) as usize;
        for _ in 0..count {
            wire::read_frame(&mut stream).await.unwrap();
        }
        wire::write_header(&mut stream, -1).await.unwrap();
        wire::write_frame(&mut stream, b"").await.unwrap();
    });

    let client = Client::connect(vec![addr], 1, DIAL_TIMEOUT).await.unwrap();
    let pipe = client.pipeline();
    pipe.send(b"a").await.unwrap();
    pipe.send(b"b").await.unwrap();
    let err = pipe.flush().await.unwrap_err();
    assert!(matches!(
        err,
        TcplineError::BatchMismatch {
            expected: 2,
            got: 1
        }
    ));
}
