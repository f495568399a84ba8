//! Per-request tracing spans.
//!
//! A [`Span`] is created by the server for each inbound request (one per
//! sub-request for pipelined batches) and handed to the handler. It
//! accumulates timed sub-spans, signed counters, and string attributes,
//! and is finalized once the handler returns: logged in JSON form and
//! delivered to the configured [`StatsRecorder`].
//!
//! Sub-spans, counters, and attributes are all keyed by unique names;
//! repeated writes overwrite.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::stats::{DebugStatsRecorder, StatsRecorder};

/// Generates short string ids for spans.
///
/// Supplied at server construction; the default hashes the current time.
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// The default id generator: a hex hash of the current time and pid.
pub fn default_id_generator() -> IdGenerator {
    Arc::new(time_hash_id)
}

fn time_hash_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let pid = std::process::id() as u64;
    format!("{:016x}", nanos.wrapping_mul(0x517c_c1b7_2722_0a95) ^ pid)
}

/// A named interval within a span.
///
/// Its duration is defined iff the interval was finished or a duration was
/// supplied up front (timings merged from elsewhere).
#[derive(Debug, Clone)]
pub struct SubSpan {
    started: Instant,
    ended: Option<Instant>,
    preset_ms: Option<f64>,
}

impl SubSpan {
    fn open() -> Self {
        Self {
            started: Instant::now(),
            ended: None,
            preset_ms: None,
        }
    }

    fn closed_zero() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            ended: Some(now),
            preset_ms: None,
        }
    }

    fn with_duration(ms: f64) -> Self {
        Self {
            started: Instant::now(),
            ended: None,
            preset_ms: Some(ms),
        }
    }

    /// End the interval now (if still open) and return its duration.
    pub fn finish(&mut self) -> f64 {
        if self.ended.is_none() {
            self.ended = Some(Instant::now());
        }
        self.millis()
    }

    /// Whether the interval has an end timestamp.
    pub fn is_finished(&self) -> bool {
        self.ended.is_some()
    }

    /// Duration in fractional milliseconds, 0 if unknown.
    pub fn millis(&self) -> f64 {
        if let Some(ms) = self.preset_ms {
            return ms;
        }
        match self.ended {
            Some(end) => end.duration_since(self.started).as_secs_f64() * 1000.0,
            None => 0.0,
        }
    }

    fn bounds(&self) -> Option<(Instant, Instant)> {
        if self.preset_ms.is_some() {
            return None;
        }
        self.ended.map(|end| (self.started, end))
    }
}

/// JSON document form of a span, used for logging and merging.
#[derive(Debug, Default, Serialize, Deserialize)]
struct SpanDoc {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    subspans: BTreeMap<String, f64>,
    #[serde(default)]
    counters: BTreeMap<String, i64>,
    #[serde(default)]
    attrs: BTreeMap<String, String>,
}

/// A labeled per-request tracing record.
pub struct Span {
    id: String,
    sub_spans: BTreeMap<String, SubSpan>,
    counters: BTreeMap<String, i64>,
    attrs: BTreeMap<String, String>,
    stats: Arc<dyn StatsRecorder>,
}

impl Span {
    /// Create a span with the given id and a no-op stats sink.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            sub_spans: BTreeMap::new(),
            counters: BTreeMap::new(),
            attrs: BTreeMap::new(),
            stats: Arc::new(DebugStatsRecorder),
        }
    }

    /// Attach the stats sink that [`record`](Self::record) delivers to.
    pub fn set_stats(&mut self, stats: Arc<dyn StatsRecorder>) {
        self.stats = stats;
    }

    /// The span id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Start (or restart) the sub-span `name` at now.
    pub fn start(&mut self, name: &str) {
        self.sub_spans.insert(name.to_string(), SubSpan::open());
    }

    /// Finish the sub-span `name` and return its elapsed milliseconds.
    ///
    /// A finish without a prior start inserts a zero-duration sub-span and
    /// returns 0.
    pub fn finish(&mut self, name: &str) -> f64 {
        match self.sub_spans.get_mut(name) {
            Some(sub) => sub.finish(),
            None => {
                self.sub_spans
                    .insert(name.to_string(), SubSpan::closed_zero());
                0.0
            }
        }
    }

    /// The sub-span `name`, created (open, started now) if absent.
    pub fn sub_span(&mut self, name: &str) -> &mut SubSpan {
        self.sub_spans
            .entry(name.to_string())
            .or_insert_with(SubSpan::open)
    }

    /// Insert a sub-span with a preset duration, for timings measured
    /// elsewhere.
    pub fn sub_span_with_duration(&mut self, name: &str, ms: f64) {
        self.sub_spans
            .insert(name.to_string(), SubSpan::with_duration(ms));
    }

    /// Whole-millisecond duration of `name`, 0 if unknown.
    pub fn duration(&self, name: &str) -> i64 {
        self.millis(name) as i64
    }

    /// Fractional-millisecond duration of `name`, 0 if unknown.
    pub fn millis(&self, name: &str) -> f64 {
        self.sub_spans.get(name).map_or(0.0, SubSpan::millis)
    }

    /// Add 1 to counter `name` (creating it at 1) and return the new value.
    pub fn increment(&mut self, name: &str) -> i64 {
        self.add(name, 1)
    }

    /// Add `delta` to counter `name` (creating it at `delta`) and return
    /// the new value.
    pub fn add(&mut self, name: &str, delta: i64) -> i64 {
        let value = self.counters.entry(name.to_string()).or_insert(0);
        *value += delta;
        *value
    }

    /// Set attribute `name`; last write wins.
    pub fn attr(&mut self, name: &str, value: &str) {
        self.attrs.insert(name.to_string(), value.to_string());
    }

    /// Sub-spans by name.
    pub fn sub_spans(&self) -> &BTreeMap<String, SubSpan> {
        &self.sub_spans
    }

    /// Counters by name.
    pub fn counters(&self) -> &BTreeMap<String, i64> {
        &self.counters
    }

    /// Attributes by name.
    pub fn attrs(&self) -> &BTreeMap<String, String> {
        &self.attrs
    }

    /// Merge a JSON document of the form produced by [`json`](Self::json).
    ///
    /// All keys are optional; present entries merge into this span
    /// (sub-span durations as preset values, counter values added,
    /// attributes overwritten). Fails on malformed JSON.
    pub fn merge_json(&mut self, text: &str) -> Result<()> {
        let doc: SpanDoc = serde_json::from_str(text)?;
        if let Some(id) = doc.id {
            self.id = id;
        }
        for (name, ms) in doc.subspans {
            self.sub_span_with_duration(&name, ms);
        }
        for (name, value) in doc.counters {
            self.add(&name, value);
        }
        for (name, value) in doc.attrs {
            self.attr(&name, &value);
        }
        Ok(())
    }

    /// Serialize the span to its canonical JSON form.
    pub fn json(&self) -> String {
        let doc = SpanDoc {
            id: Some(self.id.clone()),
            subspans: self
                .sub_spans
                .iter()
                .map(|(name, sub)| (name.clone(), sub.millis()))
                .collect(),
            counters: self.counters.clone(),
            attrs: self.attrs.clone(),
        };
        serde_json::to_string(&doc).unwrap_or_default()
    }

    /// Deliver final timings and counters to the stats sink: one
    /// duration-timer (or timer, for preset durations) per sub-span, one
    /// counter call per counter.
    pub fn record(&self) {
        for (name, sub) in &self.sub_spans {
            match sub.bounds() {
                Some((begin, end)) => self.stats.duration_timer(name, begin, end),
                None => self.stats.timer(name, sub.millis() as i64),
            }
        }
        for (name, value) in &self.counters {
            self.stats.counter(name, *value);
        }
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("id", &self.id)
            .field("sub_spans", &self.sub_spans)
            .field("counters", &self.counters)
            .field("attrs", &self.attrs)
            .finish()
    }
}

/// Space-separated `key=value` form: attributes first, then sub-span
/// durations in milliseconds, then counters. Each entry appears exactly
/// once.
impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut sep = |f: &mut fmt::Formatter<'_>| -> fmt::Result {
            if first {
                first = false;
                Ok(())
            } else {
                write!(f, " ")
            }
        };
        for (name, value) in &self.attrs {
            sep(f)?;
            write!(f, "{name}={value}")?;
        }
        for (name, sub) in &self.sub_spans {
            sep(f)?;
            write!(f, "{name}={}", sub.millis())?;
        }
        for (name, value) in &self.counters {
            sep(f)?;
            write!(f, "{name}={value}")?;
        }
        Ok(())
    }
}
