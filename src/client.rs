//! Client with pooling, bounded retries, and pipelined requests.
//!
//! [`Client::send_recv`] is the basic request/response exchange. A
//! [`Pipeline`] buffers many sub-requests and flushes them as one batch
//! frame, reading the sub-responses back in request order. Message
//! encoding is a higher-level concern; both paths move raw bytes.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::{timed_out, Result, TcplineError};
use crate::pool::ConnectionPool;
use crate::wire;

/// Default attempts per request.
pub const DEFAULT_RETRIES: u32 = 3;

/// Default deadline covering one write + read exchange.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for a framed request/response service.
pub struct Client {
    pool: ConnectionPool,
    retries: u32,
    io_timeout: Duration,
}

impl Client {
    /// Connect a client load-balancing over `addresses` with a pool of
    /// `pool_size` eagerly-dialed connections.
    pub async fn connect(
        addresses: Vec<String>,
        pool_size: usize,
        dial_timeout: Duration,
    ) -> Result<Self> {
        let pool = ConnectionPool::new(addresses, pool_size, dial_timeout).await?;
        Ok(Self {
            pool,
            retries: DEFAULT_RETRIES,
            io_timeout: DEFAULT_IO_TIMEOUT,
        })
    }

    /// Set the number of attempts per request.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries.max(1);
        self
    }

    /// Set the per-request I/O deadline.
    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Create a pipeline for batched requests against this client.
    pub fn pipeline(&self) -> Pipeline<'_> {
        Pipeline::new(self)
    }

    /// Send one request and block until its response arrives.
    ///
    /// Makes up to the configured number of attempts. A failed pool take
    /// consumes an attempt without touching a connection. Transient
    /// transport errors (broken pipe, connection refused, connection
    /// reset) drop the connection and retry; everything else, including
    /// the I/O deadline expiring, fails immediately. A connection is only
    /// returned to the pool after a fully successful exchange.
    pub async fn send_recv(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let last = attempt >= self.retries;

            let mut conn = match self.pool.take().await {
                Ok(conn) => conn,
                Err(e) => {
                    if last {
                        return Err(e);
                    }
                    tracing::debug!(error = %e, attempt, "pool take failed, retrying");
                    continue;
                }
            };

            match self.exchange(&mut conn, payload).await {
                Ok(response) => {
                    self.pool.put(conn).await;
                    return Ok(response);
                }
                Err(e) => {
                    // Failed connections are dropped, never returned.
                    if last || !e.is_retryable() {
                        return Err(e);
                    }
                    tracing::debug!(error = %e, attempt, "transport error, retrying");
                }
            }
        }
    }

    async fn exchange(&self, conn: &mut TcpStream, payload: &[u8]) -> Result<Vec<u8>> {
        let io = async {
            wire::write_frame(conn, payload).await?;
            wire::read_frame(conn).await
        };
        match timeout(self.io_timeout, io).await {
            Ok(result) => result,
            Err(_) => Err(timed_out("request deadline exceeded")),
        }
    }
}

struct PipelineInner {
    buf: BytesMut,
    count: i32,
}

/// Buffer of sub-requests flushed as a single batch frame.
///
/// [`send`](Pipeline::send) only appends to an internal buffer; nothing
/// reaches the wire until [`flush`](Pipeline::flush), which returns the
/// sub-responses in the order the sub-requests were sent. The buffer is
/// kept after a flush; call [`reset`](Pipeline::reset) to reuse the
/// pipeline for a fresh batch.
pub struct Pipeline<'a> {
    client: &'a Client,
    inner: Mutex<PipelineInner>,
}

impl<'a> Pipeline<'a> {
    fn new(client: &'a Client) -> Self {
        Self {
            client,
            inner: Mutex::new(PipelineInner {
                buf: BytesMut::new(),
                count: 0,
            }),
        }
    }

    /// Append one sub-request to the batch buffer.
    pub async fn send(&self, payload: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock().await;
        wire::put_frame(&mut inner.buf, payload)?;
        inner.count += 1;
        Ok(())
    }

    /// Number of buffered sub-requests.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.count as usize
    }

    /// Whether the buffer holds no sub-requests.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Clear the buffer and counter for a fresh batch.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.buf.clear();
        inner.count = 0;
    }

    /// Deliver the buffered batch and collect the ordered sub-responses.
    ///
    /// Writes the batch header (the negated sub-request count) followed by
    /// the accumulated buffer, then reads the response header and exactly
    /// that many framed sub-responses. Fails with
    /// [`TcplineError::BatchMismatch`] if the peer announces a different
    /// count.
    pub async fn flush(&self) -> Result<Vec<Vec<u8>>> {
        let (buf, count) = {
            let inner = self.inner.lock().await;
            (Bytes::copy_from_slice(&inner.buf), inner.count)
        };
        if count == 0 {
            return Err(TcplineError::Protocol("flush of empty pipeline".into()));
        }

        let mut conn = self.client.pool.take().await?;
        let responses = Self::exchange(&mut conn, &buf, count).await?;
        self.client.pool.put(conn).await;
        Ok(responses)
    }

    async fn exchange(conn: &mut TcpStream, buf: &[u8], count: i32) -> Result<Vec<Vec<u8>>> {
        wire::write_header(conn, -count).await?;
        conn.write_all(buf).await?;

        let header = wire::read_header(conn).await?;
        if header >= 0 || -header != count {
            return Err(TcplineError::BatchMismatch {
                expected: count,
                got: -header,
            });
        }

        let mut responses = Vec::with_capacity(count as usize);
        for _ in 0..count {
            responses.push(wire::read_frame(conn).await?);
        }
        Ok(responses)
    }
}
