//! TCP connection pool.
//!
//! The pool owns an idle list of live connections and an address list to
//! dial when the list runs dry. A connection is either idle in the pool or
//! lent out, never both: [`take`](ConnectionPool::take) transfers ownership
//! to the caller, who must either [`put`](ConnectionPool::put) it back or
//! drop it. The pool never validates returned connections; callers only
//! return connections that just completed a successful request.

use std::io;
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::{Result, TcplineError};

/// Pool of idle TCP connections across a set of addresses.
#[derive(Debug)]
pub struct ConnectionPool {
    addresses: Vec<String>,
    dial_timeout: Duration,
    idle: Mutex<Vec<TcpStream>>,
}

impl ConnectionPool {
    /// Build a pool, attempting `initial` dials up front.
    ///
    /// Each dial targets a uniformly-random address from the list. Dial
    /// errors are recorded but tolerated; the constructor only fails if
    /// every attempted dial failed (returning the first error), or if the
    /// address list is empty.
    pub async fn new(
        addresses: Vec<String>,
        initial: usize,
        dial_timeout: Duration,
    ) -> Result<Self> {
        if addresses.is_empty() {
            return Err(TcplineError::NoAddresses);
        }
        let pool = Self {
            addresses,
            dial_timeout,
            idle: Mutex::new(Vec::with_capacity(initial)),
        };

        let mut first_err = None;
        let mut conns = Vec::with_capacity(initial);
        for _ in 0..initial {
            match pool.dial().await {
                Ok(conn) => conns.push(conn),
                Err(e) => {
                    tracing::debug!(error = %e, "initial dial failed");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        if conns.is_empty() {
            // Only errors, no real connections.
            if let Some(e) = first_err {
                return Err(e);
            }
        }
        *pool.idle.lock().await = conns;
        Ok(pool)
    }

    /// Take a connection: the head of the idle list, or a fresh dial if
    /// the list is empty. The dial happens with the lock released.
    pub async fn take(&self) -> Result<TcpStream> {
        {
            let mut idle = self.idle.lock().await;
            if !idle.is_empty() {
                return Ok(idle.remove(0));
            }
        }
        self.dial().await
    }

    /// Return a connection to the idle list.
    pub async fn put(&self, conn: TcpStream) {
        self.idle.lock().await.push(conn);
    }

    /// Number of idle connections currently in the pool.
    pub async fn idle_count(&self) -> usize {
        self.idle.lock().await.len()
    }

    /// The addresses this pool dials.
    pub fn addresses(&self) -> &[String] {
        &self.addresses
    }

    async fn dial(&self) -> Result<TcpStream> {
        let address = {
            let mut rng = rand::thread_rng();
            self.addresses[rng.gen_range(0..self.addresses.len())].clone()
        };
        tracing::debug!(%address, "dialing");
        match timeout(self.dial_timeout, TcpStream::connect(&address)).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(TcplineError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("dial to {address} timed out"),
            ))),
        }
    }
}
