#![deny(missing_docs)]

//! A distributed-tracing probe for embedding inside an HTTP stack.
//!
//! The probe reconstructs causal parent/child relationships between inbound
//! requests and the outbound requests they provoke, without application code
//! threading any context around. It emits spans in the Zipkin v1 JSON shape
//! and persists them asynchronously to a rolling trace file.
//!
//! Two pieces do the heavy lifting:
//! - [`task_lineage`] records a `(child, parent)` edge for every task spawn,
//!   so an outbound call running arbitrarily deep in a spawn chain can walk
//!   its ancestry back to the task that accepted the inbound request.
//! - [`TraceProbe`] keeps an expiring, sharded table of in-flight server
//!   spans keyed by task id, drives each span through its
//!   receive/send/error events, propagates trace headers, and hands
//!   completed spans to a [`SpanSink`].
//!
//! The host HTTP stack calls in at six points: request received, response
//! sent, server error, request sent, response received, client error. Each
//! hook is cheap, non-blocking, and a no-op while the probe is disabled.
//!
//! ```
//! use std::collections::HashMap;
//! use zipkin_probe::{BlackholeSink, HeaderRead, InboundRequest, TraceProbe};
//!
//! struct Req(HashMap<String, String>);
//!
//! impl HeaderRead for Req {
//!     fn header(&self, name: &str) -> Option<&str> {
//!         self.0.get(name).map(String::as_str)
//!     }
//! }
//!
//! impl InboundRequest for Req {
//!     fn method(&self) -> &str {
//!         "GET"
//!     }
//!     fn url(&self) -> &str {
//!         "/health"
//!     }
//!     fn remote_addr(&self) -> &str {
//!         "10.0.0.1:4000"
//!     }
//! }
//!
//! let probe = TraceProbe::new(BlackholeSink);
//! let span = probe.on_recv_req(&Req(HashMap::new())).unwrap();
//! // ... handler runs, outbound calls pick this span up as their parent ...
//! probe.on_send_resp(span);
//! ```
//!
//! Production hosts use the process-wide instance behind [`probe`], which
//! reports through a [`FileSink`] into the working directory, and flip it
//! with [`set_enabled`].

mod headers;
mod host;
mod ids;
mod probe;
mod sink;
mod span;
mod table;

pub use crate::headers::{
    HeaderRead, HeaderWrite, InboundRequest, InboundResponse, OutboundRequest, FLAGS_HEADER,
    PARENT_ID_HEADER, SAMPLE_HEADER, SPAN_ID_HEADER, TRACE_ID_HEADER,
};
pub use crate::host::{exec_name, local_ipv4};
pub use crate::ids::{new_span_id, new_trace_id};
pub use crate::probe::{probe, set_enabled, TraceCtxError, TraceProbe};
pub use crate::sink::{BlackholeSink, FileSink, SpanSink};
pub use crate::span::{
    Annotation, BinaryAnnotation, Endpoint, TraceSpan, CLIENT_ADDR, CLIENT_RECV, CLIENT_SEND,
    ERROR, HTTP_METHOD, HTTP_STATUS_CODE, HTTP_URL, SERVER_RECV, SERVER_SEND,
};
#[doc(no_inline)]
pub use task_lineage::{current_task_id, spawn};
