//! The probe itself: the hook entry points the host HTTP stack calls, and
//! the state they drive.

use std::fmt::{self, Display};
use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::Lazy;

use crate::headers::{InboundRequest, InboundResponse, OutboundRequest};
use crate::host;
use crate::ids::{new_span_id, new_trace_id};
use crate::sink::{FileSink, SpanSink};
use crate::span::{
    now_micros, Endpoint, TraceSpan, CLIENT_ADDR, CLIENT_RECV, CLIENT_SEND, ERROR,
    HTTP_METHOD, HTTP_STATUS_CODE, HTTP_URL, SERVER_RECV, SERVER_SEND,
};
use crate::table::SpanTable;

/// Upper bound on the ancestor chain considered when looking for the server
/// span an outbound call belongs to.
const MAX_LINEAGE_DEPTH: usize = 100;

static GLOBAL_PROBE: Lazy<TraceProbe<FileSink>> = Lazy::new(|| TraceProbe::new(FileSink::new()));

/// The process-wide probe, created on first use with a [`FileSink`] writing
/// to the working directory.
pub fn probe() -> &'static TraceProbe<FileSink> {
    &GLOBAL_PROBE
}

/// Turns the process-wide probe on or off.
pub fn set_enabled(enabled: bool) {
    probe().set_enabled(enabled);
}

/// Errors from [`TraceProbe::current_trace_ctx`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TraceCtxError {
    /// The probe is disabled; no trace context is being tracked.
    ProbeDisabled,
    /// No ancestor of the calling task is handling an inbound request.
    NoAncestorSpan,
}

impl Display for TraceCtxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceCtxError::ProbeDisabled => write!(f, "trace probe is disabled"),
            TraceCtxError::NoAncestorSpan => {
                write!(f, "no ancestor task is handling an inbound request")
            }
        }
    }
}

impl std::error::Error for TraceCtxError {}

/// The tracing probe: reconstructs causal spans from the six points where
/// the host HTTP stack calls in, and hands completed spans to a sink.
///
/// All hook methods are cheap and non-blocking apart from short shard mutex
/// sections; they run on whatever task the HTTP stack already uses. Every
/// hook is a no-op while the probe is disabled.
#[derive(Debug)]
pub struct TraceProbe<S> {
    enabled: AtomicBool,
    service_name: String,
    ipv4: String,
    table: SpanTable,
    sink: S,
}

impl<S: SpanSink> TraceProbe<S> {
    /// Creates a probe identified by this host's executable name and local
    /// IPv4 address, reporting to `sink`. Starts enabled.
    pub fn new(sink: S) -> Self {
        TraceProbe::with_service(sink, host::exec_name(), host::local_ipv4())
    }

    /// Creates a probe with an explicit service identity. Starts enabled.
    pub fn with_service(sink: S, service_name: &str, ipv4: &str) -> Self {
        TraceProbe {
            enabled: AtomicBool::new(true),
            service_name: service_name.to_string(),
            ipv4: ipv4.to_string(),
            table: SpanTable::new(),
            sink,
        }
    }

    /// Turns the probe on or off. The flag is read without synchronisation
    /// by the hooks; a transition may leave a few in-flight spans skewed,
    /// which is acceptable.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether the probe is currently enabled.
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn local_endpoint(&self, port: u16) -> Endpoint {
        Endpoint {
            service_name: self.service_name.clone(),
            ipv4: self.ipv4.clone(),
            port,
        }
    }

    /// Server ingress: parses trace headers off the inbound request, opens a
    /// server span with its `sr` event, and indexes it under the current
    /// task id so descendant tasks can find it. Returns the span for the
    /// host to pass back at response time, or `None` while disabled.
    pub fn on_recv_req(&self, req: &impl InboundRequest) -> Option<TraceSpan> {
        if !self.enabled() {
            return None;
        }

        let mut span = TraceSpan::new();
        span.from_header(req);
        span.name = req.method().to_string();
        span.path = req.url().to_string();
        span.is_recv_req = true;
        span.local_port = req.local_port();
        span.task_id = task_lineage::current_task_id();

        let ep = self.local_endpoint(span.local_port);
        span.add_annotation(&ep, span.timestamp, SERVER_RECV);
        span.add_binary_annotation(&ep, HTTP_URL, req.url());
        span.add_binary_annotation(&ep, HTTP_METHOD, req.method());

        let (remote_ip, remote_port) = host::parse_addr(req.remote_addr());
        let caller = Endpoint {
            service_name: self.service_name.clone(),
            ipv4: remote_ip,
            port: remote_port,
        };
        span.add_binary_annotation(&caller, CLIENT_ADDR, "true");

        self.table.upsert(span.task_id, span.clone());
        Some(span)
    }

    /// Server egress: records `ss`, fills the duration, releases the span.
    pub fn on_send_resp(&self, span: TraceSpan) {
        if !self.enabled() {
            return;
        }
        self.close_server(span, None);
    }

    /// Server failure: same close sequence as a normal response, with the
    /// error message attached first.
    pub fn on_server_err(&self, span: TraceSpan, err: impl Display) {
        if !self.enabled() {
            return;
        }
        self.close_server(span, Some(err.to_string()));
    }

    /// Client egress: walks the task ancestry for the server span this call
    /// belongs to, opens a child span with its `cs` event (or a fresh root
    /// when no parent is discoverable), and injects the trace headers into
    /// the outbound request. Returns the span for the host to pass back when
    /// the response arrives, or `None` while disabled.
    pub fn on_send_req(&self, req: &mut impl OutboundRequest) -> Option<TraceSpan> {
        if !self.enabled() {
            return None;
        }

        let parent = self.find_recv_span();

        let mut span = TraceSpan::new();
        span.span_id = new_span_id();
        span.name = req.method().to_string();
        span.path = req.url().to_string();

        match &parent {
            Some(server) => {
                span.from_parent(server);
                span.local_port = server.local_port;
                self.table
                    .update(server.task_id, |s| s.add_child(&span.span_id));
            }
            None => {
                // nothing upstream: this call roots a brand-new trace
                span.trace_id = new_trace_id();
                span.local_port = 80;
            }
        }

        let ep = self.local_endpoint(span.local_port);
        span.add_annotation(&ep, span.timestamp, CLIENT_SEND);
        span.set_header(req);
        span.add_binary_annotation(&ep, HTTP_URL, req.url());
        span.add_binary_annotation(&ep, HTTP_METHOD, req.method());
        Some(span)
    }

    /// Client response: records `cr` and the status code, fills the
    /// duration, releases the span.
    pub fn on_recv_resp(&self, resp: &impl InboundResponse, mut span: TraceSpan) {
        if !self.enabled() {
            return;
        }
        let ep = self.local_endpoint(span.local_port);
        span.add_binary_annotation(&ep, HTTP_STATUS_CODE, resp.status_code().to_string());
        self.close_client(span, None);
    }

    /// Client failure: records the error message and `cr`, fills the
    /// duration, releases the span.
    pub fn on_client_err(&self, span: TraceSpan, err: impl Display) {
        if !self.enabled() {
            return;
        }
        self.close_client(span, Some(err.to_string()));
    }

    /// The trace and span id of the server span the calling task belongs to,
    /// for hosts that want to tag their own logs with trace context.
    pub fn current_trace_ctx(&self) -> Result<(String, String), TraceCtxError> {
        if !self.enabled() {
            return Err(TraceCtxError::ProbeDisabled);
        }
        let span = self
            .find_recv_span()
            .ok_or(TraceCtxError::NoAncestorSpan)?;
        Ok((span.trace_id, span.span_id))
    }

    /// Walks the ancestor chain of the current task until it finds a task
    /// with an in-flight server span.
    fn find_recv_span(&self) -> Option<TraceSpan> {
        let chain =
            task_lineage::registry().ancestors(task_lineage::current_task_id(), MAX_LINEAGE_DEPTH);
        chain
            .into_iter()
            .find_map(|id| self.table.lookup(id).filter(|span| span.is_recv_req))
    }

    fn close_server(&self, span: TraceSpan, err: Option<String>) {
        // the table copy is authoritative: it carries child links recorded
        // by descendant tasks after the span was handed to the host
        let mut span = self.table.remove(span.task_id).unwrap_or(span);
        if !span.opened() {
            debug_assert!(false, "server span closed without an sr event");
            tracing::warn!(task_id = span.task_id, "server span closed without an sr event");
            return;
        }
        if span.closed() {
            // CLOSED is terminal; never emit twice
            tracing::warn!(task_id = span.task_id, "server span closed twice");
            return;
        }

        let ep = self.local_endpoint(span.local_port);
        if let Some(message) = err {
            span.add_binary_annotation(&ep, ERROR, message);
        }
        let now = now_micros();
        span.add_annotation(&ep, now, SERVER_SEND);
        span.duration = (now - span.timestamp).max(0);
        self.sink.report_span(span);
    }

    fn close_client(&self, mut span: TraceSpan, err: Option<String>) {
        if !span.opened() {
            debug_assert!(false, "client span closed without a cs event");
            tracing::warn!("client span closed without a cs event");
            return;
        }
        if span.closed() {
            // CLOSED is terminal; never emit twice
            tracing::warn!("client span closed twice");
            return;
        }

        let ep = self.local_endpoint(span.local_port);
        if let Some(message) = err {
            span.add_binary_annotation(&ep, ERROR, message);
        }
        let now = now_micros();
        span.add_annotation(&ep, now, CLIENT_RECV);
        span.duration = (now - span.timestamp).max(0);
        self.sink.report_span(span);
    }
}
