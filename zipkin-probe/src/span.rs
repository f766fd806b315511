//! The span model: pure data in the Zipkin v1 JSON shape, plus header
//! (de)serialisation and parent linking.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::headers::{
    HeaderRead, HeaderWrite, FLAGS_HEADER, PARENT_ID_HEADER, SAMPLE_HEADER, SPAN_ID_HEADER,
    TRACE_ID_HEADER,
};

/// Annotation value for server-receive: the instant an inbound request was
/// picked up.
pub const SERVER_RECV: &str = "sr";

/// Annotation value for server-send: the instant the response left.
pub const SERVER_SEND: &str = "ss";

/// Annotation value for client-send: the instant an outbound request left.
pub const CLIENT_SEND: &str = "cs";

/// Annotation value for client-receive: the instant the outbound response
/// arrived.
pub const CLIENT_RECV: &str = "cr";

/// The entire request URL, including query parameters if available.
pub const HTTP_URL: &str = "http.url";

/// The HTTP method, or verb, such as "GET" or "POST".
pub const HTTP_METHOD: &str = "http.method";

/// The HTTP status code of a completed outbound call. Ex. "503"
pub const HTTP_STATUS_CODE: &str = "http.status_code";

/// Marks the caller's address on an inbound span. The interesting part is the
/// endpoint; the value is always "true".
pub const CLIENT_ADDR: &str = "ca";

/// A human-readable error message attached to a span that failed.
pub const ERROR: &str = "error";

/// Microsecond wall-clock time, the unit every span timestamp uses.
pub(crate) fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

/// A network endpoint participating in a trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Name of the service, by convention the executable basename.
    #[serde(rename = "serviceName")]
    pub service_name: String,
    /// Dotted-quad IPv4 address.
    pub ipv4: String,
    /// TCP port.
    pub port: u16,
}

/// A timestamped, endpoint-tagged span event. `value` is one of
/// [`SERVER_RECV`], [`SERVER_SEND`], [`CLIENT_SEND`], [`CLIENT_RECV`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    /// Where the event was observed.
    pub endpoint: Endpoint,
    /// Microsecond wall-clock time of the event.
    pub timestamp: i64,
    /// The event kind.
    pub value: String,
}

/// An endpoint-tagged key/value pair recorded on a span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryAnnotation {
    /// Where the value was observed.
    pub endpoint: Endpoint,
    /// Key, e.g. [`HTTP_URL`] or [`ERROR`].
    pub key: String,
    /// Free-form value.
    pub value: String,
}

/// A single timed operation: one inbound request's server side, or one
/// outbound call's client side.
///
/// The serialised form is the Zipkin v1 span shape. Fields the probe needs
/// only while the span is in flight are not emitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TraceSpan {
    /// Shared by every span of one end-to-end trace. Generated at the root,
    /// propagated via header.
    #[serde(rename = "traceId")]
    pub trace_id: String,
    /// The enclosing span within the same trace, empty on a root span.
    #[serde(rename = "parentId", default, skip_serializing_if = "String::is_empty")]
    pub parent_id: String,
    /// Unique within `trace_id`.
    #[serde(rename = "id")]
    pub span_id: String,
    /// The HTTP method.
    pub name: String,
    /// The request URL, when available.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    /// Microsecond wall-clock time the span opened.
    pub timestamp: i64,
    /// Microseconds between opening and closing. Filled at closure.
    pub duration: i64,
    /// Probe version that produced the span.
    pub version: String,
    /// Span events, appended in wall-clock order by the owning task.
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    /// Key/value pairs, append-only.
    #[serde(rename = "binaryAnnotations", default)]
    pub binary_annotations: Vec<BinaryAnnotation>,

    // In-flight state, never emitted.
    #[serde(skip)]
    pub(crate) is_sample: bool,
    #[serde(skip)]
    pub(crate) flags: String,
    #[serde(skip)]
    pub(crate) is_recv_req: bool,
    #[serde(skip)]
    pub(crate) task_id: u64,
    #[serde(skip)]
    pub(crate) local_port: u16,
    #[serde(skip)]
    pub(crate) child_spans: Vec<String>,
    #[serde(skip)]
    pub(crate) sample_header_flag: bool,
}

impl TraceSpan {
    /// Creates a blank span opened now. The sampling flag is decided at
    /// linkage, by [`from_header`](TraceSpan::from_header) or
    /// [`from_parent`](TraceSpan::from_parent); a span that never links
    /// propagates `false`.
    pub fn new() -> Self {
        TraceSpan {
            timestamp: now_micros(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            ..TraceSpan::default()
        }
    }

    /// Populates trace linkage from inbound headers. Absent headers produce
    /// empty strings; an absent or malformed sample header reads as `true`.
    pub fn from_header(&mut self, h: &impl HeaderRead) {
        self.trace_id = h.header(TRACE_ID_HEADER).unwrap_or_default().to_string();
        self.span_id = h.header(SPAN_ID_HEADER).unwrap_or_default().to_string();
        self.parent_id = h.header(PARENT_ID_HEADER).unwrap_or_default().to_string();
        let sample = h.header(SAMPLE_HEADER);
        self.sample_header_flag = sample.is_some();
        self.is_sample = sample != Some("false");
        self.flags = h.header(FLAGS_HEADER).unwrap_or_default().to_string();
    }

    /// Writes trace linkage into outbound headers, the inverse of
    /// [`from_header`](TraceSpan::from_header).
    pub fn set_header(&self, h: &mut impl HeaderWrite) {
        h.set_header(TRACE_ID_HEADER, &self.trace_id);
        h.set_header(SPAN_ID_HEADER, &self.span_id);
        h.set_header(PARENT_ID_HEADER, &self.parent_id);
        h.set_header(SAMPLE_HEADER, if self.is_sample { "true" } else { "false" });
        h.set_header(FLAGS_HEADER, &self.flags);
    }

    /// Links this span under `parent`: same trace, parent's span id as the
    /// parent reference, sampling and flags inherited. The caller assigns a
    /// fresh `span_id`; it is deliberately not copied.
    pub fn from_parent(&mut self, parent: &TraceSpan) {
        self.trace_id = parent.trace_id.clone();
        self.parent_id = parent.span_id.clone();
        self.is_sample = parent.is_sample;
        self.flags = parent.flags.clone();
    }

    /// Appends a span event.
    pub fn add_annotation(&mut self, endpoint: &Endpoint, timestamp: i64, value: &str) {
        self.annotations.push(Annotation {
            endpoint: endpoint.clone(),
            timestamp,
            value: value.to_string(),
        });
    }

    /// Appends a key/value pair.
    pub fn add_binary_annotation(
        &mut self,
        endpoint: &Endpoint,
        key: &str,
        value: impl Into<String>,
    ) {
        self.binary_annotations.push(BinaryAnnotation {
            endpoint: endpoint.clone(),
            key: key.to_string(),
            value: value.into(),
        });
    }

    /// Records a child span id on this span. Recording the same id twice is a
    /// no-op.
    pub(crate) fn add_child(&mut self, span_id: &str) {
        if self.child_spans.iter().any(|id| id == span_id) {
            return;
        }
        self.child_spans.push(span_id.to_string());
    }

    /// True once the span has its opening event (`sr` or `cs`).
    pub(crate) fn opened(&self) -> bool {
        self.annotations
            .iter()
            .any(|a| a.value == SERVER_RECV || a.value == CLIENT_SEND)
    }

    /// True once the span has its closing event (`ss` or `cr`).
    pub(crate) fn closed(&self) -> bool {
        self.annotations
            .iter()
            .any(|a| a.value == SERVER_SEND || a.value == CLIENT_RECV)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn endpoint() -> Endpoint {
        Endpoint {
            service_name: "svc".to_string(),
            ipv4: "10.1.2.3".to_string(),
            port: 8080,
        }
    }

    proptest! {
        #[test]
        fn header_round_trip(
            trace_id in "[0-9a-f]{1,32}",
            span_id in "[0-9a-f]{1,16}",
            parent_id in "[0-9a-f]{0,16}",
            is_sample in any::<bool>(),
            flags in "[ -~]{0,12}",
        ) {
            let mut original = TraceSpan::new();
            original.trace_id = trace_id;
            original.span_id = span_id;
            original.parent_id = parent_id;
            original.is_sample = is_sample;
            original.flags = flags;

            let mut headers = HashMap::new();
            original.set_header(&mut headers);

            let mut parsed = TraceSpan::new();
            parsed.from_header(&headers);

            prop_assert_eq!(&parsed.trace_id, &original.trace_id);
            prop_assert_eq!(&parsed.span_id, &original.span_id);
            prop_assert_eq!(&parsed.parent_id, &original.parent_id);
            prop_assert_eq!(parsed.is_sample, original.is_sample);
            prop_assert_eq!(&parsed.flags, &original.flags);
        }
    }

    #[test]
    fn absent_headers_parse_to_empty() {
        let headers = HashMap::new();
        let mut span = TraceSpan::new();
        span.from_header(&headers);

        assert_eq!(span.trace_id, "");
        assert_eq!(span.span_id, "");
        assert_eq!(span.parent_id, "");
        assert!(span.is_sample, "absent sample header reads as true");
        assert!(!span.sample_header_flag);
        assert_eq!(span.flags, "");
    }

    #[test]
    fn malformed_sample_header_reads_as_true() {
        let mut headers = HashMap::new();
        headers.set_header(crate::headers::SAMPLE_HEADER, "yes please");
        let mut span = TraceSpan::new();
        span.from_header(&headers);
        assert!(span.is_sample);
        assert!(span.sample_header_flag);

        headers.set_header(crate::headers::SAMPLE_HEADER, "false");
        span.from_header(&headers);
        assert!(!span.is_sample);
    }

    #[test]
    fn from_parent_links_without_copying_span_id() {
        let mut parent = TraceSpan::new();
        parent.trace_id = "aa".to_string();
        parent.span_id = "bb".to_string();
        parent.is_sample = false;
        parent.flags = "f1".to_string();

        let mut child = TraceSpan::new();
        child.span_id = "cc".to_string();
        child.from_parent(&parent);

        assert_eq!(child.trace_id, "aa");
        assert_eq!(child.parent_id, "bb");
        assert_eq!(child.span_id, "cc");
        assert!(!child.is_sample);
        assert_eq!(child.flags, "f1");
    }

    #[test]
    fn add_child_dedups_by_span_id() {
        let mut span = TraceSpan::new();
        span.add_child("s1");
        span.add_child("s2");
        span.add_child("s1");
        assert_eq!(span.child_spans, vec!["s1".to_string(), "s2".to_string()]);
    }

    #[test]
    fn json_shape_matches_zipkin_v1() {
        let mut span = TraceSpan::new();
        span.trace_id = "aa".to_string();
        span.span_id = "bb".to_string();
        span.name = "GET".to_string();
        span.path = "/foo".to_string();
        span.duration = 42;
        span.is_recv_req = true;
        span.task_id = 7;
        span.add_annotation(&endpoint(), span.timestamp, SERVER_RECV);
        span.add_binary_annotation(&endpoint(), HTTP_METHOD, "GET");

        let value: serde_json::Value = serde_json::to_value(&span).unwrap();
        let obj = value.as_object().unwrap();

        assert_eq!(obj["traceId"], "aa");
        assert_eq!(obj["id"], "bb");
        assert_eq!(obj["name"], "GET");
        assert_eq!(obj["path"], "/foo");
        assert_eq!(obj["duration"], 42);
        assert!(obj.contains_key("timestamp"));
        assert!(obj.contains_key("version"));
        assert_eq!(obj["annotations"][0]["value"], "sr");
        assert_eq!(obj["annotations"][0]["endpoint"]["serviceName"], "svc");
        assert_eq!(obj["binaryAnnotations"][0]["key"], "http.method");

        // parentId is omitted while empty, in-flight state is never emitted
        assert!(!obj.contains_key("parentId"));
        for transient in ["isSample", "is_sample", "isRecvReq", "taskId", "childSpans"] {
            assert!(!obj.contains_key(transient), "{transient} must not be emitted");
        }
    }

    #[test]
    fn json_round_trip_preserves_public_fields() {
        let mut span = TraceSpan::new();
        span.trace_id = "aa".to_string();
        span.parent_id = "pp".to_string();
        span.span_id = "bb".to_string();
        span.name = "POST".to_string();
        span.path = "/a".to_string();
        span.duration = 10;
        span.add_annotation(&endpoint(), span.timestamp, CLIENT_SEND);

        let text = serde_json::to_string(&span).unwrap();
        let parsed: TraceSpan = serde_json::from_str(&text).unwrap();

        assert_eq!(parsed.trace_id, span.trace_id);
        assert_eq!(parsed.parent_id, span.parent_id);
        assert_eq!(parsed.span_id, span.span_id);
        assert_eq!(parsed.name, span.name);
        assert_eq!(parsed.path, span.path);
        assert_eq!(parsed.timestamp, span.timestamp);
        assert_eq!(parsed.duration, span.duration);
        assert_eq!(parsed.version, span.version);
        assert_eq!(parsed.annotations, span.annotations);
        assert_eq!(parsed.binary_annotations, span.binary_annotations);
    }

    #[test]
    fn opened_and_closed_track_annotations() {
        let mut span = TraceSpan::new();
        assert!(!span.opened());
        span.add_annotation(&endpoint(), 1, SERVER_RECV);
        assert!(span.opened());
        assert!(!span.closed());
        span.add_annotation(&endpoint(), 2, SERVER_SEND);
        assert!(span.closed());
    }
}
