//! The trace propagation headers and the thin traits the probe uses to see
//! the host's HTTP types.
//!
//! The probe never owns a request or response. Hosts implement these traits
//! on whatever request structs their HTTP stack uses; the probe reads and
//! writes only what the traits expose.

use std::collections::HashMap;

/// Carries the trace root id. Required for trace continuation.
pub const TRACE_ID_HEADER: &str = "X-W-TraceId";

/// Carries the sender's span id; becomes `parent_id` on the receiver.
pub const SPAN_ID_HEADER: &str = "X-W-SpanId";

/// Carries the grandparent span id, propagated verbatim.
pub const PARENT_ID_HEADER: &str = "X-W-ParentId";

/// Carries the sampling flag as `"true"` / `"false"`. Absent or malformed
/// values are read as `true`.
pub const SAMPLE_HEADER: &str = "X-W-Sample";

/// Carries an opaque propagation string.
pub const FLAGS_HEADER: &str = "X-W-Flags";

/// Read access to a request's headers.
pub trait HeaderRead {
    /// Returns the value of the header `name`, if present.
    fn header(&self, name: &str) -> Option<&str>;
}

/// Write access to a request's headers.
pub trait HeaderWrite {
    /// Sets the header `name` to `value`, replacing any existing value.
    fn set_header(&mut self, name: &str, value: &str);
}

/// The probe's view of an inbound request, consumed by
/// [`TraceProbe::on_recv_req`](crate::TraceProbe::on_recv_req).
pub trait InboundRequest: HeaderRead {
    /// The HTTP method.
    fn method(&self) -> &str;
    /// The request URL.
    fn url(&self) -> &str;
    /// The peer address, as `"ip:port"` or bare `"ip"`.
    fn remote_addr(&self) -> &str;
    /// The locally bound port the request arrived on.
    fn local_port(&self) -> u16 {
        80
    }
}

/// The probe's view of an outbound request, consumed by
/// [`TraceProbe::on_send_req`](crate::TraceProbe::on_send_req).
pub trait OutboundRequest: HeaderWrite {
    /// The HTTP method.
    fn method(&self) -> &str;
    /// The request URL.
    fn url(&self) -> &str;
}

/// The probe's view of a response to an outbound request, consumed by
/// [`TraceProbe::on_recv_resp`](crate::TraceProbe::on_recv_resp).
pub trait InboundResponse {
    /// The HTTP status code.
    fn status_code(&self) -> u16;
}

// Convenience impls so plain maps can stand in for header collections, e.g.
// when bridging a host stack that hands headers over as key/value pairs.
// Lookup is exact-match; canonicalize names before inserting if the source
// is case-insensitive.

impl HeaderRead for HashMap<String, String> {
    fn header(&self, name: &str) -> Option<&str> {
        self.get(name).map(String::as_str)
    }
}

impl HeaderWrite for HashMap<String, String> {
    fn set_header(&mut self, name: &str, value: &str) {
        self.insert(name.to_string(), value.to_string());
    }
}
