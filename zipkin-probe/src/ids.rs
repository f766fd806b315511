use std::num::NonZeroU64;

use rand::Rng;
use uuid::Uuid;

/// Generates a fresh trace id: 128 random bits as opaque lower hex.
///
/// Trace ids only need to be unique across cooperating processes, so a v4
/// UUID in simple form is plenty.
pub fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Generates a fresh span id: a nonzero random 64-bit value as opaque lower
/// hex. Span ids are scoped by trace id, so cross-process collisions are
/// tolerable; in-trace collisions are vanishingly unlikely.
pub fn new_span_id() -> String {
    let id: NonZeroU64 = rand::thread_rng().gen();
    format!("{:x}", id.get())
}

#[cfg(test)]
mod test {
    use super::*;

    fn is_lower_hex(s: &str) -> bool {
        !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    }

    #[test]
    fn trace_ids_are_opaque_lower_hex() {
        let id = new_trace_id();
        assert_eq!(id.len(), 32);
        assert!(is_lower_hex(&id));
    }

    #[test]
    fn span_ids_are_opaque_lower_hex() {
        for _ in 0..64 {
            let id = new_span_id();
            assert!(is_lower_hex(&id));
            assert!(id.len() <= 16);
            assert_ne!(id, "0");
        }
    }

    #[test]
    fn ids_do_not_repeat() {
        let a = new_trace_id();
        let b = new_trace_id();
        assert_ne!(a, b);

        let c = new_span_id();
        let d = new_span_id();
        assert_ne!(c, d);
    }
}
