//! Server: accept loop, per-connection readers, and pipelined fan-out.
//!
//! The server parses the framed wire format and turns it into individual
//! request/responses. Each connection is handled on its own task; a
//! pipelined batch is first parsed off the wire, then farmed out to one
//! worker task per sub-request, and the responses are reassembled in
//! request order before anything is written back. Every request is
//! dispatched through the [`Handler`] with its own [`Span`].

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::error::{timed_out, Result, TcplineError};
use crate::span::{default_id_generator, IdGenerator, Span};
use crate::stats::{DebugStatsRecorder, StatsRecorder};
use crate::wire;

/// Read deadline per request cycle; expiry tears the connection down
/// quietly.
pub const READ_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Request handling logic of a server.
///
/// The server does all the request parsing and response encoding; a
/// handler only maps request bytes to response bytes, using the span to
/// track timings and metadata through the request. A returned error is
/// logged and counted as `operation.failure`; within a batch it yields a
/// zero-length response for that slot without aborting the siblings.
///
/// Plain closures work directly:
///
/// ```ignore
/// let server = Server::bind("127.0.0.1:2001", handler_fn(|req, span| {
///     span.attr("command", "PING");
///     Ok(req.to_vec())
/// })).await?;
/// ```
pub trait Handler: Send + Sync + 'static {
    /// Map a request payload to a response payload.
    fn respond<'a>(&'a self, req: &'a [u8], span: &'a mut Span) -> BoxFuture<'a, Result<Vec<u8>>>;
}

impl<F> Handler for F
where
    F: Fn(&[u8], &mut Span) -> Result<Vec<u8>> + Send + Sync + 'static,
{
    fn respond<'a>(&'a self, req: &'a [u8], span: &'a mut Span) -> BoxFuture<'a, Result<Vec<u8>>> {
        Box::pin(std::future::ready(self(req, span)))
    }
}

/// Identity helper pinning a closure's signature to the [`Handler`]
/// contract, so inline closures infer the right lifetimes.
pub fn handler_fn<F>(f: F) -> F
where
    F: Fn(&[u8], &mut Span) -> Result<Vec<u8>> + Send + Sync + 'static,
{
    f
}

/// State shared between the accept loop and the per-connection tasks.
struct Shared {
    handler: Arc<dyn Handler>,
    stats: Arc<dyn StatsRecorder>,
    id_gen: IdGenerator,
    cancel: CancellationToken,
    conns: parking_lot::Mutex<HashMap<u64, SocketAddr>>,
}

/// Configures and binds a [`Server`].
pub struct ServerBuilder {
    handler: Arc<dyn Handler>,
    stats: Arc<dyn StatsRecorder>,
    id_gen: IdGenerator,
}

impl ServerBuilder {
    /// Start building a server around `handler`.
    pub fn new(handler: impl Handler) -> Self {
        Self {
            handler: Arc::new(handler),
            stats: Arc::new(DebugStatsRecorder),
            id_gen: default_id_generator(),
        }
    }

    /// Set the stats sink passed to every span (default: debug sink).
    pub fn stats(mut self, stats: Arc<dyn StatsRecorder>) -> Self {
        self.stats = stats;
        self
    }

    /// Set the span id generator (default: time hash).
    pub fn id_generator(mut self, id_gen: IdGenerator) -> Self {
        self.id_gen = id_gen;
        self
    }

    /// Bind the TCP listener and return the server.
    ///
    /// The server does not accept connections until
    /// [`serve`](Server::serve) runs.
    pub async fn bind(self, address: &str) -> Result<Server> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        Ok(Server {
            local_addr,
            listener: Mutex::new(Some(listener)),
            closed: AtomicBool::new(false),
            next_conn_id: AtomicU64::new(0),
            shared: Arc::new(Shared {
                handler: self.handler,
                stats: self.stats,
                id_gen: self.id_gen,
                cancel: CancellationToken::new(),
                conns: parking_lot::Mutex::new(HashMap::new()),
            }),
        })
    }
}

/// Framed request/response TCP server.
pub struct Server {
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    closed: AtomicBool,
    next_conn_id: AtomicU64,
    shared: Arc<Shared>,
}

impl Server {
    /// Start building a server with a custom stats sink or id generator.
    pub fn builder(handler: impl Handler) -> ServerBuilder {
        ServerBuilder::new(handler)
    }

    /// Bind a server with the default stats sink and id generator.
    pub async fn bind(address: &str, handler: impl Handler) -> Result<Self> {
        ServerBuilder::new(handler).bind(address).await
    }

    /// The bound listener address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Best-effort count of active client connections.
    pub fn num_connections(&self) -> usize {
        self.shared.conns.lock().len()
    }

    /// Run the accept loop until the server is closed or the listener
    /// errors. Each accepted connection gets a fresh id and its own
    /// reader task. Usually spawned:
    ///
    /// ```ignore
    /// let server = Arc::new(Server::bind("127.0.0.1:2001", EchoHandler).await?);
    /// tokio::spawn({
    ///     let server = server.clone();
    ///     async move { server.serve().await }
    /// });
    /// ```
    pub async fn serve(&self) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or(TcplineError::NotListening)?;
        tracing::debug!(address = %self.local_addr, "listening");
        loop {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
                        tracing::debug!(%peer, id, "new client");
                        tokio::spawn(handle_conn(stream, id, peer, self.shared.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        break;
                    }
                },
            }
        }
        tracing::debug!(address = %self.local_addr, "listener closed");
        Ok(())
    }

    /// Close the listener and every active client connection.
    ///
    /// Fails with [`TcplineError::AlreadyClosed`] on a second call.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(TcplineError::AlreadyClosed);
        }
        self.shared.cancel.cancel();
        Ok(())
    }
}

/// Per-connection reader loop.
///
/// Registers the connection, then serves request cycles until an error or
/// server close. Closable errors (peer gone, deadline expired) exit
/// quietly; anything else is logged and counted before the teardown. The
/// connection is always evicted from the active map on exit.
async fn handle_conn(mut stream: TcpStream, id: u64, peer: SocketAddr, shared: Arc<Shared>) {
    shared.conns.lock().insert(id, peer);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            result = serve_cycle(&mut stream, &shared) => match result {
                Ok(()) => shared.stats.increment("operation.success"),
                Err(e) if e.is_closable() => break,
                Err(e) => {
                    tracing::error!(error = %e, conn = id, "request failed");
                    shared.stats.increment("operation.failure");
                    break;
                }
            },
        }
    }
    tracing::debug!(conn = id, %peer, "closing connection");
    shared.conns.lock().remove(&id);
}

/// One full request cycle: read, dispatch, write the response.
async fn serve_cycle(stream: &mut TcpStream, shared: &Arc<Shared>) -> Result<()> {
    let (header, body) = match timeout(READ_DEADLINE, read_and_handle(stream, shared)).await {
        Ok(result) => result?,
        Err(_) => return Err(timed_out("read deadline exceeded")),
    };
    wire::write_header(stream, header).await?;
    stream.write_all(&body).await?;
    Ok(())
}

/// Read one top-level frame and produce the response header and body.
///
/// A non-negative header is a single request. A negative header announces
/// a pipelined batch: the sub-frames are read sequentially (the wire is
/// serial), then handled by one worker task each. Awaiting the workers in
/// spawn order reassembles the responses in request order; a failed
/// worker's slot is encoded as a zero-length payload.
async fn read_and_handle(stream: &mut TcpStream, shared: &Arc<Shared>) -> Result<(i32, Vec<u8>)> {
    let header = wire::read_header(stream).await?;
    if header < 0 {
        let count = header.unsigned_abs() as usize;
        let mut workers = Vec::with_capacity(count);
        for _ in 0..count {
            let req = wire::read_frame(stream).await?;
            let shared = shared.clone();
            workers.push(tokio::spawn(async move {
                handle_request(&shared, &req, true).await
            }));
        }

        let mut body = BytesMut::new();
        for worker in workers {
            let response = match worker.await {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(e)) => {
                    tracing::error!(error = %e, "pipelined request failed");
                    shared.stats.increment("operation.failure");
                    Vec::new()
                }
                Err(e) => {
                    tracing::error!(error = %e, "pipelined worker panicked");
                    shared.stats.increment("operation.failure");
                    Vec::new()
                }
            };
            wire::put_frame(&mut body, &response)?;
        }
        // The response batch header mirrors the request's.
        Ok((header, body.to_vec()))
    } else {
        let mut req = vec![0u8; header as usize];
        stream.read_exact(&mut req).await?;
        let response = handle_request(shared, &req, false).await?;
        let len = wire::frame_len(&response)?;
        Ok((len, response))
    }
}

/// Dispatch one request through the handler with a fresh span.
async fn handle_request(shared: &Shared, req: &[u8], multi: bool) -> Result<Vec<u8>> {
    let mut span = Span::new((shared.id_gen)());
    span.set_stats(shared.stats.clone());
    if multi {
        span.attr("multi", "true");
    }
    span.start("duration");
    let connections = shared.conns.lock().len() as i64;
    span.add("num_connections", connections);
    let result = shared.handler.respond(req, &mut span).await;
    span.finish("duration");
    tracing::info!("{}", span.json());
    span.record();
    result
}
