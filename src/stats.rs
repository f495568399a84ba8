//! Statistics sinks.
//!
//! [`StatsRecorder`] is the capability the server and spans deliver
//! timings and counters to. The default [`DebugStatsRecorder`] only logs;
//! [`StatsdRecorder`] pushes to a StatsD agent over UDP through bounded
//! channels drained by a background task, so recording never blocks the
//! request path (stats are dropped under overflow).

use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::error::Result;

/// Capability consuming timers, gauges, and counters.
pub trait StatsRecorder: Send + Sync {
    /// Record a timer value in milliseconds.
    fn timer(&self, stat: &str, millis: i64);

    /// Record the elapsed time between two instants as a timer.
    fn duration_timer(&self, stat: &str, begin: Instant, end: Instant) {
        self.timer(stat, end.duration_since(begin).as_millis() as i64);
    }

    /// Record a gauge value.
    fn gauge(&self, stat: &str, value: i64);

    /// Record a counter delta.
    fn counter(&self, stat: &str, value: i64);

    /// Record a counter delta of 1.
    fn increment(&self, stat: &str) {
        self.counter(stat, 1);
    }
}

/// Stats sink that logs every stat at TRACE and records nothing.
///
/// The default sink for servers and spans.
#[derive(Debug, Default, Clone, Copy)]
pub struct DebugStatsRecorder;

impl StatsRecorder for DebugStatsRecorder {
    fn timer(&self, stat: &str, millis: i64) {
        tracing::trace!(stat, millis, "timer");
    }

    fn gauge(&self, stat: &str, value: i64) {
        tracing::trace!(stat, value, "gauge");
    }

    fn counter(&self, stat: &str, value: i64) {
        tracing::trace!(stat, value, "counter");
    }
}

/// Buffer size per stat kind; overflow drops the stat.
const CHANNEL_CAPACITY: usize = 100;

struct Stat {
    name: String,
    value: i64,
}

/// Stats sink pushing to a StatsD agent over UDP.
///
/// Trait methods enqueue onto bounded channels consumed by a background
/// task, yielding best-effort delivery: a full channel or a send error
/// drops the stat silently.
pub struct StatsdRecorder {
    timer_tx: mpsc::Sender<Stat>,
    gauge_tx: mpsc::Sender<Stat>,
    counter_tx: mpsc::Sender<Stat>,
}

impl StatsdRecorder {
    /// Connect to a StatsD agent and spawn the push task.
    ///
    /// `namespace` prefixes every stat name (`namespace.stat:...`).
    pub async fn connect(address: &str, namespace: &str) -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(address).await?;

        let (timer_tx, timer_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (gauge_tx, gauge_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (counter_tx, counter_rx) = mpsc::channel(CHANNEL_CAPACITY);

        tokio::spawn(push_loop(
            socket,
            namespace.to_string(),
            timer_rx,
            gauge_rx,
            counter_rx,
        ));

        Ok(Self {
            timer_tx,
            gauge_tx,
            counter_tx,
        })
    }
}

impl StatsRecorder for StatsdRecorder {
    fn timer(&self, stat: &str, millis: i64) {
        let _ = self.timer_tx.try_send(Stat {
            name: stat.to_string(),
            value: millis,
        });
    }

    fn gauge(&self, stat: &str, value: i64) {
        let _ = self.gauge_tx.try_send(Stat {
            name: stat.to_string(),
            value,
        });
    }

    fn counter(&self, stat: &str, value: i64) {
        let _ = self.counter_tx.try_send(Stat {
            name: stat.to_string(),
            value,
        });
    }
}

async fn push_loop(
    socket: UdpSocket,
    namespace: String,
    mut timers: mpsc::Receiver<Stat>,
    mut gauges: mpsc::Receiver<Stat>,
    mut counters: mpsc::Receiver<Stat>,
) {
    loop {
        let (stat, kind) = tokio::select! {
            Some(stat) = timers.recv() => (stat, "ms"),
            Some(stat) = gauges.recv() => (stat, "g"),
            Some(stat) = counters.recv() => (stat, "c"),
            else => break,
        };
        let line = format_line(&namespace, &stat, kind);
        if let Err(e) = socket.send(line.as_bytes()).await {
            tracing::debug!(error = %e, "statsd send failed");
        }
    }
}

fn format_line(namespace: &str, stat: &Stat, kind: &str) -> String {
    // Timers carry an explicit sample rate of 1.
    let rate = if kind == "ms" { "|@1" } else { "" };
    if namespace.is_empty() {
        format!("{}:{}|{}{}", stat.name, stat.value, kind, rate)
    } else {
        format!("{}.{}:{}|{}{}", namespace, stat.name, stat.value, kind, rate)
    }
}
