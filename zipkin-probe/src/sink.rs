//! The asynchronous span sink: a bounded channel feeding a single writer
//! thread that batches completed spans and appends them to a rolling trace
//! file.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread;
use std::time::{Duration, Instant};

use crate::span::TraceSpan;

/// How many completed spans may queue between the hooks and the writer.
const CHANNEL_CAPACITY: usize = 1000;

/// The writer's local buffer size; reaching it forces a flush.
const BATCH_CAPACITY: usize = 1024;

/// The writer flushes whatever it holds at least this often.
const FLUSH_INTERVAL: Duration = Duration::from_secs(10);

/// The ability to accept completed spans for publication.
///
/// The probe hands every closed span to its sink exactly once; from that
/// point on the sink owns the span. Implementations must not block the
/// caller for longer than a bounded channel send.
pub trait SpanSink {
    /// Accepts a completed span.
    fn report_span(&self, span: TraceSpan);
}

/// Sink that discards every span without publishing it. For hosts that want
/// the probe compiled in but inert, and for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlackholeSink;

impl SpanSink for BlackholeSink {
    fn report_span(&self, _: TraceSpan) {}
}

/// Production sink: spans go over a bounded channel to a dedicated writer
/// thread, which serialises batches as JSON arrays and appends them to
/// `trace_<date>_<pid>.txt` in the target directory.
///
/// A full channel drops the span rather than stall the HTTP data path; drops
/// are counted and logged. An I/O failure in the writer aborts the process
/// by design: silently losing every trace from that point on would be worse
/// than a loud crash, and the host is expected to restart.
#[derive(Debug)]
pub struct FileSink {
    tx: SyncSender<TraceSpan>,
    dropped: AtomicU64,
}

impl FileSink {
    /// Creates a sink writing to the current working directory and starts
    /// its writer thread.
    pub fn new() -> Self {
        FileSink::with_dir(PathBuf::from("."))
    }

    /// Creates a sink writing to `dir` and starts its writer thread.
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let (tx, rx) = mpsc::sync_channel(CHANNEL_CAPACITY);
        thread::Builder::new()
            .name("trace-sink".to_string())
            .spawn(move || write_loop(rx, dir))
            .expect("failed to start trace sink thread");
        FileSink {
            tx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Number of spans dropped so far because the channel was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for FileSink {
    fn default() -> Self {
        FileSink::new()
    }
}

impl SpanSink for FileSink {
    fn report_span(&self, span: TraceSpan) {
        match self.tx.try_send(span) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(dropped, "trace sink channel full, span dropped");
            }
            Err(TrySendError::Disconnected(_)) => {
                // writer thread is gone; the process is already going down
                tracing::warn!("trace sink writer thread gone, span dropped");
            }
        }
    }
}

fn write_loop(rx: Receiver<TraceSpan>, dir: PathBuf) {
    let mut batch: Vec<TraceSpan> = Vec::with_capacity(BATCH_CAPACITY);
    let mut next_flush = Instant::now() + FLUSH_INTERVAL;

    loop {
        let timeout = next_flush.saturating_duration_since(Instant::now());
        match rx.recv_timeout(timeout) {
            Ok(span) => {
                if batch.len() >= BATCH_CAPACITY {
                    flush(&mut batch, &dir);
                }
                batch.push(span);
            }
            Err(RecvTimeoutError::Timeout) => {
                flush(&mut batch, &dir);
                next_flush = Instant::now() + FLUSH_INTERVAL;
            }
            Err(RecvTimeoutError::Disconnected) => {
                // all senders dropped: final flush, then retire
                flush(&mut batch, &dir);
                return;
            }
        }
    }
}

/// Appends the batch to the trace file as one JSON array. The file therefore
/// holds a *sequence* of concatenated arrays; readers must tolerate that.
fn flush(batch: &mut Vec<TraceSpan>, dir: &Path) {
    if batch.is_empty() {
        return;
    }

    let bytes = match serde_json::to_vec(&batch) {
        Ok(bytes) => bytes,
        Err(err) => {
            // fatal: a panic here would only kill this thread and leave the
            // process silently traceless
            tracing::error!(%err, "trace batch serialisation failed, aborting");
            std::process::abort();
        }
    };

    let path = dir.join(trace_file_name());
    let mut options = OpenOptions::new();
    options.append(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o755);
    }

    let result = options.open(&path).and_then(|mut file| file.write_all(&bytes));
    if let Err(err) = result {
        // fatal: a panic here would only kill this thread and leave the
        // process silently traceless
        tracing::error!(%err, path = %path.display(), "trace file append failed, aborting");
        std::process::abort();
    }

    batch.clear();
}

fn trace_file_name() -> String {
    format!(
        "trace_{}_{}.txt",
        chrono::Local::now().format("%Y-%m-%d"),
        std::process::id()
    )
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Sink that captures spans in memory so tests can assert on them.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct CaptureSink {
        spans: Arc<Mutex<Vec<TraceSpan>>>,
    }

    impl CaptureSink {
        pub(crate) fn new() -> Self {
            CaptureSink::default()
        }

        pub(crate) fn spans(&self) -> Vec<TraceSpan> {
            // succeed or die. failure is unrecoverable (mutex poisoned)
            self.spans.lock().unwrap().clone()
        }
    }

    impl SpanSink for CaptureSink {
        fn report_span(&self, span: TraceSpan) {
            self.spans.lock().unwrap().push(span);
        }
    }

    fn sample_span(name: &str) -> TraceSpan {
        let mut span = TraceSpan::new();
        span.trace_id = "t1".to_string();
        span.span_id = "s1".to_string();
        span.name = name.to_string();
        span
    }

    #[test]
    fn file_sink_flushes_batch_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::with_dir(dir.path());
        sink.report_span(sample_span("GET"));
        sink.report_span(sample_span("POST"));
        drop(sink); // disconnects the channel and forces a final flush

        // writer thread races the assertion; give it a moment
        let path = dir.path().join(trace_file_name());
        let mut content = String::new();
        for _ in 0..50 {
            std::thread::sleep(Duration::from_millis(20));
            if let Ok(text) = std::fs::read_to_string(&path) {
                content = text;
                if !content.is_empty() {
                    break;
                }
            }
        }

        let batch: Vec<TraceSpan> = serde_json::from_str(&content).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].name, "GET");
        assert_eq!(batch[1].name, "POST");
    }

    #[test]
    fn file_sink_appends_concatenated_arrays() {
        let dir = tempfile::tempdir().unwrap();

        for _ in 0..2 {
            let sink = FileSink::with_dir(dir.path());
            sink.report_span(sample_span("GET"));
            drop(sink);
            std::thread::sleep(Duration::from_millis(100));
        }

        let content = std::fs::read_to_string(dir.path().join(trace_file_name())).unwrap();
        assert_eq!(
            content.matches("][").count(),
            1,
            "each flush appends its own JSON array"
        );
    }

    #[test]
    fn blackhole_sink_accepts_spans() {
        BlackholeSink.report_span(sample_span("GET"));
    }
}
