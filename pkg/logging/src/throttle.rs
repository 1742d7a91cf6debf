use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use pkg_client::ApiClient;
use pkg_constants::logging::{PARTIAL_LINE_MARKER, THROTTLE_NOTICE_SUFFIX};
use regex::bytes::Regex;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::Duration;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::params::ThrottleParams;
use crate::sink::LogSink;
use crate::timestamp::rfc3339_nano;

/// Timestamp, then the message.
static TIMESTAMPED_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?-u)^\S+ (.*)").expect("static regex"));

fn stamp() -> String {
    rfc3339_nano(Utc::now())
}

// ─── Event log writer ───────────────────────────────────────────

/// Rate-limited event stream for one log.
///
/// Everything written goes to `inner` (the file in the log collection)
/// unconditionally. The control plane only sees what the throttle lets
/// through, batched into `logs` records of `bytes_per_event` or every
/// `seconds_between_events`.
pub struct EventLogWriter {
    api: Arc<dyn ApiClient>,
    object_uuid: String,
    stream: String,
    inner: Option<Arc<dyn LogSink>>,
    params: ThrottleParams,
    state: Mutex<RateState>,
}

#[derive(Default)]
struct RateState {
    buf: Vec<u8>,
    flushed_at: Option<Instant>,
    reset_at: Option<Instant>,
    open: bool,
    bytes_logged: u64,
    bytes_so_far: u64,
    lines_so_far: u64,
    bytes_skipped: u64,
    partial_seen: bool,
    partial_next_at: Option<Instant>,
    closing: bool,
}

impl EventLogWriter {
    pub fn new(
        api: Arc<dyn ApiClient>,
        object_uuid: &str,
        stream: &str,
        inner: Option<Arc<dyn LogSink>>,
        params: ThrottleParams,
    ) -> Self {
        Self {
            api,
            object_uuid: object_uuid.to_string(),
            stream: stream.to_string(),
            inner,
            params,
            state: Mutex::new(RateState::default()),
        }
    }

    fn absorb(&self, data: &[u8], closing: bool) -> Option<String> {
        let now = Instant::now();
        let p = &self.params;
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.closing |= closing;

        if st.reset_at.is_none_or(|t| now > t) {
            if st.bytes_skipped > 0 {
                let note = format!("{} Skipped {} bytes of log\n", stamp(), st.bytes_skipped);
                st.buf.extend_from_slice(note.as_bytes());
            }
            st.reset_at = Some(now + p.throttle_period);
            st.bytes_so_far = 0;
            st.lines_so_far = 0;
            st.bytes_skipped = 0;
            st.open = true;
        }

        for line in data.split(|b| *b == b'\n') {
            if !st.open {
                st.bytes_skipped += line.len() as u64;
                continue;
            }
            if line.is_empty() {
                continue;
            }
            if let Some(out) = st.rate_limit(line, now, p) {
                st.buf.extend_from_slice(&out);
                st.buf.push(b'\n');
            }
        }

        let due = st.buf.len() >= p.bytes_per_event
            || st
                .flushed_at
                .is_none_or(|t| now.duration_since(t) >= p.seconds_between_events)
            || st.closing;
        if due && !st.buf.is_empty() {
            st.flushed_at = Some(now);
            let text = std::mem::take(&mut st.buf);
            return Some(String::from_utf8_lossy(&text).into_owned());
        }
        None
    }

    async fn emit(&self, text: String) -> Result<()> {
        self.api
            .create(
                "logs",
                json!({"log": {
                    "object_uuid": self.object_uuid,
                    "event_type": self.stream,
                    "properties": {"text": text},
                }}),
            )
            .await
            .map(|_| ())
    }
}

impl RateState {
    /// `Some(text)` to pass through (the line itself or a notice replacing
    /// it), `None` to drop it.
    fn rate_limit(&mut self, line: &[u8], now: Instant, p: &ThrottleParams) -> Option<Vec<u8>> {
        let size = line.len() as u64;
        let mut notice = None;

        if self.open {
            let partial = TIMESTAMPED_LINE
                .captures(line)
                .and_then(|c| c.get(1))
                .map(|m| {
                    let msg = m.as_bytes();
                    msg.starts_with(PARTIAL_LINE_MARKER.as_bytes())
                        && msg.ends_with(PARTIAL_LINE_MARKER.as_bytes())
                })
                .unwrap_or(false);

            if partial {
                if !self.partial_seen {
                    self.partial_seen = true;
                    self.partial_next_at = Some(now + p.partial_line_period);
                    self.bytes_skipped += size;
                    return Some(
                        format!(
                            "{} Rate-limiting partial segments of long lines to one every {} seconds.",
                            stamp(),
                            p.partial_line_period.as_secs()
                        )
                        .into_bytes(),
                    );
                } else if self.partial_next_at.is_some_and(|t| now > t) {
                    self.partial_next_at = Some(now + p.partial_line_period);
                } else {
                    self.bytes_skipped += size;
                    return None;
                }
            } else {
                self.partial_next_at = None;
                self.partial_seen = false;
            }

            self.bytes_logged += size;
            self.bytes_so_far += size;
            self.lines_so_far += 1;

            let remaining = self
                .reset_at
                .map(|t| t.saturating_duration_since(now).as_secs())
                .unwrap_or(0);
            if self.bytes_logged > p.limit_bytes_per_job {
                notice = Some(format!(
                    "{} Exceeded log limit {} bytes (crunch_limit_log_bytes_per_job). Log will be truncated.",
                    stamp(),
                    p.limit_bytes_per_job
                ));
                self.reset_at = Some(now + Duration::from_secs(365 * 24 * 3600));
                self.open = false;
            } else if self.bytes_so_far > p.throttle_bytes {
                notice = Some(format!(
                    "{} Exceeded rate {} bytes per {} seconds (crunch_log_throttle_bytes). Logging will be silenced for the next {} seconds.",
                    stamp(),
                    p.throttle_bytes,
                    p.throttle_period.as_secs(),
                    remaining
                ));
                self.open = false;
            } else if self.lines_so_far > p.throttle_lines {
                notice = Some(format!(
                    "{} Exceeded rate {} lines per {} seconds (crunch_log_throttle_lines), logging will be silenced for the next {} seconds.",
                    stamp(),
                    p.throttle_lines,
                    p.throttle_period.as_secs(),
                    remaining
                ));
                self.open = false;
            }
        }

        if !self.open {
            self.bytes_skipped += size;
        }
        match notice {
            Some(n) => Some(format!("{}{}", n, THROTTLE_NOTICE_SUFFIX).into_bytes()),
            None if self.open => Some(line.to_vec()),
            None => None,
        }
    }
}

#[async_trait]
impl LogSink for EventLogWriter {
    async fn write(&self, data: &[u8]) -> Result<()> {
        let stored = match &self.inner {
            Some(inner) => inner.write(data).await,
            None => Ok(()),
        };
        let emitted = match self.absorb(data, false) {
            Some(text) => self.emit(text).await,
            None => Ok(()),
        };
        stored.and(emitted)
    }

    async fn close(&self) -> Result<()> {
        let emitted = match self.absorb(&[], true) {
            Some(text) => self.emit(text).await,
            None => Ok(()),
        };
        let closed = match &self.inner {
            Some(inner) => inner.close().await,
            None => Ok(()),
        };
        emitted.and(closed)
    }
}

// ─── Throttled logger ───────────────────────────────────────────

struct Shared {
    buf: Mutex<Vec<u8>>,
    sink: Mutex<Arc<dyn LogSink>>,
    flushing: tokio::sync::Mutex<()>,
    wake: Notify,
    bytes_per_event: usize,
    mirror: Option<String>,
}

impl Shared {
    fn sink(&self) -> Arc<dyn LogSink> {
        self.sink.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn take_buf(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buf.lock().unwrap_or_else(|e| e.into_inner()))
    }

    async fn drain(&self) -> Result<()> {
        let _guard = self.flushing.lock().await;
        let data = self.take_buf();
        if data.is_empty() {
            return Ok(());
        }
        self.sink().write(&data).await
    }
}

/// Timestamps each line written to it and hands the buffered text to its
/// sink in the background, at least once per event interval and sooner when
/// the buffer grows past an event's worth.
pub struct ThrottledLogger {
    shared: Arc<Shared>,
    stop: watch::Sender<bool>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl ThrottledLogger {
    pub fn new(sink: Arc<dyn LogSink>, params: &ThrottleParams) -> Arc<Self> {
        Self::build(sink, params, None)
    }

    /// Like `new`, also echoing every line to the process log prefixed with
    /// `prefix`.
    pub fn with_mirror(sink: Arc<dyn LogSink>, params: &ThrottleParams, prefix: &str) -> Arc<Self> {
        Self::build(sink, params, Some(prefix.to_string()))
    }

    fn build(sink: Arc<dyn LogSink>, params: &ThrottleParams, mirror: Option<String>) -> Arc<Self> {
        let shared = Arc::new(Shared {
            buf: Mutex::new(Vec::new()),
            sink: Mutex::new(sink),
            flushing: tokio::sync::Mutex::new(()),
            wake: Notify::new(),
            bytes_per_event: params.bytes_per_event,
            mirror,
        });
        let (stop, stop_rx) = watch::channel(false);
        let period = params.seconds_between_events.max(Duration::from_millis(10));
        let flusher = tokio::spawn(run_flusher(shared.clone(), period, stop_rx));
        Arc::new(Self {
            shared,
            stop,
            flusher: Mutex::new(Some(flusher)),
            closed: AtomicBool::new(false),
        })
    }

    /// Buffer `data`, one timestamp per call, one output line per input
    /// line. A missing final newline is supplied.
    pub fn write(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let now = stamp();
        let body = data.strip_suffix(b"\n").unwrap_or(data);
        let mut buf = self.shared.buf.lock().unwrap_or_else(|e| e.into_inner());
        for line in body.split(|b| *b == b'\n') {
            let mut out = Vec::with_capacity(now.len() + line.len() + 2);
            out.extend_from_slice(now.as_bytes());
            out.push(b' ');
            out.extend_from_slice(line);
            if let Some(prefix) = &self.shared.mirror {
                tracing::info!("{} {}", prefix, String::from_utf8_lossy(&out));
            }
            out.push(b'\n');
            buf.extend_from_slice(&out);
        }
        if buf.len() >= self.shared.bytes_per_event {
            self.shared.wake.notify_one();
        }
    }

    pub fn println(&self, msg: impl std::fmt::Display) {
        self.write(format!("{}\n", msg).as_bytes());
    }

    /// Hand everything buffered so far to the sink.
    pub async fn flush(&self) -> Result<()> {
        self.shared.drain().await
    }

    /// Flush and close the current sink, then continue with `sink`.
    pub async fn redirect(&self, sink: Arc<dyn LogSink>) -> Result<()> {
        let _guard = self.shared.flushing.lock().await;
        let data = self.shared.take_buf();
        let old = self.shared.sink();
        let written = if data.is_empty() {
            Ok(())
        } else {
            old.write(&data).await
        };
        let closed = old.close().await;
        *self.shared.sink.lock().unwrap_or_else(|e| e.into_inner()) = sink;
        written.and(closed)
    }

    /// Stop the background flusher, flush, and close the sink. Only the
    /// first call does anything.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.stop.send(true);
        let handle = self.flusher.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let flushed = self.shared.drain().await;
        let closed = self.shared.sink().close().await;
        flushed.and(closed)
    }
}

async fn run_flusher(shared: Arc<Shared>, period: Duration, mut stop: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shared.wake.notified() => {}
            _ = stop.changed() => break,
        }
        if let Err(e) = shared.drain().await {
            tracing::warn!("log flush failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_client::stub::StubApi;

    #[derive(Default)]
    struct Capture {
        data: Mutex<Vec<u8>>,
        closes: Mutex<usize>,
    }

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8(self.data.lock().unwrap().clone()).unwrap()
        }
    }

    #[async_trait]
    impl LogSink for Capture {
        async fn write(&self, data: &[u8]) -> Result<()> {
            self.data.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            *self.closes.lock().unwrap() += 1;
            Ok(())
        }
    }

    const UUID: &str = "zzzzz-dz642-000000000000000";

    fn writer(api: &Arc<StubApi>, inner: &Arc<Capture>, params: ThrottleParams) -> EventLogWriter {
        EventLogWriter::new(
            api.clone(),
            UUID,
            "crunch-run",
            Some(inner.clone() as Arc<dyn LogSink>),
            params,
        )
    }

    #[tokio::test]
    async fn test_logger_timestamps_each_line() {
        let cap = Arc::new(Capture::default());
        let logger = ThrottledLogger::new(cap.clone(), &ThrottleParams::default());
        logger.write(b"hello\nworld");
        logger.println("done");
        logger.close().await.unwrap();

        let text = cap.text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with(" hello"));
        assert!(lines[1].ends_with(" world"));
        assert!(lines[2].ends_with(" done"));
        // 2024-03-05T07:08:09.123456789Z
        let ts = lines[0].split(' ').next().unwrap();
        assert_eq!(ts.len(), 30);
        assert!(ts.ends_with('Z'));
        assert_eq!(*cap.closes.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_logger_close_twice() {
        let cap = Arc::new(Capture::default());
        let logger = ThrottledLogger::new(cap.clone(), &ThrottleParams::default());
        logger.println("x");
        logger.close().await.unwrap();
        logger.close().await.unwrap();
        assert_eq!(*cap.closes.lock().unwrap(), 1);
        assert_eq!(cap.text().lines().count(), 1);
    }

    #[tokio::test]
    async fn test_logger_background_flush() {
        let cap = Arc::new(Capture::default());
        let params = ThrottleParams {
            seconds_between_events: Duration::from_millis(20),
            ..Default::default()
        };
        let logger = ThrottledLogger::new(cap.clone(), &params);
        logger.println("tick");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(cap.text().ends_with(" tick\n"));
        logger.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_logger_redirect() {
        let first = Arc::new(Capture::default());
        let second = Arc::new(Capture::default());
        let logger = ThrottledLogger::new(first.clone(), &ThrottleParams::default());
        logger.println("before");
        logger.redirect(second.clone()).await.unwrap();
        logger.println("after");
        logger.close().await.unwrap();
        assert!(first.text().ends_with(" before\n"));
        assert_eq!(*first.closes.lock().unwrap(), 1);
        assert!(second.text().ends_with(" after\n"));
        assert!(!second.text().contains("before"));
    }

    #[tokio::test]
    async fn test_event_writer_line_limit() {
        let api = Arc::new(StubApi::new());
        let inner = Arc::new(Capture::default());
        let params = ThrottleParams {
            throttle_lines: 3,
            ..Default::default()
        };
        let w = writer(&api, &inner, params);
        let input = "t a\nt b\nt c\nt d\nt e\n";
        w.write(input.as_bytes()).await.unwrap();
        w.close().await.unwrap();

        // the collection file gets everything
        assert_eq!(inner.text(), input);
        let events = api.event_text(UUID, "crunch-run");
        assert!(events.starts_with("t a\nt b\nt c\n"), "{}", events);
        assert!(events.contains("Exceeded rate 3 lines per 60 seconds (crunch_log_throttle_lines)"));
        assert!(events.contains(THROTTLE_NOTICE_SUFFIX));
        assert!(!events.contains("t d\n"));
        assert!(!events.contains("t e\n"));
    }

    #[tokio::test]
    async fn test_event_writer_job_limit() {
        let api = Arc::new(StubApi::new());
        let inner = Arc::new(Capture::default());
        let params = ThrottleParams {
            limit_bytes_per_job: 10,
            ..Default::default()
        };
        let w = writer(&api, &inner, params);
        w.write(b"t 0123\nt 456789abc\nt later\n").await.unwrap();
        w.close().await.unwrap();
        let events = api.event_text(UUID, "crunch-run");
        assert!(events.starts_with("t 0123\n"));
        assert!(events.contains(
            "Exceeded log limit 10 bytes (crunch_limit_log_bytes_per_job). Log will be truncated."
        ));
        assert!(!events.contains("later"));
    }

    #[tokio::test]
    async fn test_event_writer_byte_rate() {
        let api = Arc::new(StubApi::new());
        let inner = Arc::new(Capture::default());
        let params = ThrottleParams {
            throttle_bytes: 8,
            ..Default::default()
        };
        let w = writer(&api, &inner, params);
        w.write(b"t 1234\nt 5678\n").await.unwrap();
        w.close().await.unwrap();
        let events = api.event_text(UUID, "crunch-run");
        assert!(events.contains("Exceeded rate 8 bytes per 60 seconds (crunch_log_throttle_bytes)"));
        assert!(!events.contains("5678"));
    }

    #[tokio::test]
    async fn test_event_writer_partial_lines() {
        let api = Arc::new(StubApi::new());
        let inner = Arc::new(Capture::default());
        let w = writer(&api, &inner, ThrottleParams::default());
        w.write(b"t [...]aaa[...]\nt [...]bbb[...]\nt [...]tail\nt whole\n")
            .await
            .unwrap();
        w.close().await.unwrap();
        let events = api.event_text(UUID, "crunch-run");
        assert!(events.contains("Rate-limiting partial segments of long lines to one every 5 seconds."));
        assert!(!events.contains("aaa"));
        assert!(!events.contains("bbb"));
        assert!(events.contains("t [...]tail\n"));
        assert!(events.contains("t whole\n"));
    }

    #[tokio::test]
    async fn test_event_writer_reports_skipped_after_reset() {
        let api = Arc::new(StubApi::new());
        let inner = Arc::new(Capture::default());
        let params = ThrottleParams {
            throttle_lines: 1,
            throttle_period: Duration::from_millis(50),
            ..Default::default()
        };
        let w = writer(&api, &inner, params);
        w.write(b"t a\nt b\nt c\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        w.write(b"t d\n").await.unwrap();
        w.close().await.unwrap();
        let events = api.event_text(UUID, "crunch-run");
        assert!(events.contains(" Skipped 6 bytes of log\n"), "{}", events);
        assert!(events.ends_with("t d\n"));
    }

    #[tokio::test]
    async fn test_event_writer_without_inner() {
        let api = Arc::new(StubApi::new());
        let w = EventLogWriter::new(api.clone(), UUID, "stderr", None, ThrottleParams::default());
        w.write(b"t only events\n").await.unwrap();
        w.close().await.unwrap();
        assert_eq!(api.event_text(UUID, "stderr"), "t only events\n");
    }
}
