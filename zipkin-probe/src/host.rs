//! Process-level facts resolved once at startup: the local IPv4 address and
//! the executable name that together identify this process's endpoint.

use std::net::UdpSocket;
use std::path::Path;

use once_cell::sync::Lazy;

const UNKNOWN: &str = "unknown";

static LOCAL_IPV4: Lazy<String> = Lazy::new(resolve_local_ipv4);
static EXEC_NAME: Lazy<String> = Lazy::new(resolve_exec_name);

/// The first routable IPv4 address of this host, or `"unknown"` when none
/// can be determined.
pub fn local_ipv4() -> &'static str {
    &LOCAL_IPV4
}

/// The basename of the running executable, or `"unknown"`.
pub fn exec_name() -> &'static str {
    &EXEC_NAME
}

fn resolve_local_ipv4() -> String {
    // Routing-table trick: connecting a UDP socket picks the outbound
    // interface without sending a single packet.
    let resolved = UdpSocket::bind("0.0.0.0:0").and_then(|socket| {
        socket.connect("8.8.8.8:80")?;
        socket.local_addr()
    });
    match resolved {
        Ok(addr) => addr.ip().to_string(),
        Err(err) => {
            tracing::warn!(%err, "could not resolve local ipv4 address");
            UNKNOWN.to_string()
        }
    }
}

fn resolve_exec_name() -> String {
    std::env::args()
        .next()
        .and_then(|arg0| {
            Path::new(&arg0)
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
        })
        .unwrap_or_else(|| UNKNOWN.to_string())
}

/// Splits a peer address of the form `"ip:port"` into its parts. A missing or
/// unparsable port falls back to 80; a bare ip passes through untouched.
pub(crate) fn parse_addr(addr: &str) -> (String, u16) {
    match addr.rsplit_once(':') {
        Some((ip, port)) => (ip.to_string(), port.parse().unwrap_or(80)),
        None => (addr.to_string(), 80),
    }
}
