//! Preview-port probing.
//!
//! Probing is a hint, not a reservation: the port can be taken between the
//! probe and the dev-server spawn, which is why the supervisor retries with
//! a fresh port on spawn failure.

use std::net::TcpListener;

/// Find a listenable port in `[floor, ceiling]`, skipping any in `taken`.
pub(crate) fn probe_free_port(floor: u16, ceiling: u16, taken: &[u16]) -> Option<u16> {
    for port in floor..=ceiling {
        if taken.contains(&port) {
            continue;
        }
        if TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Some(port);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn probe_skips_bound_ports() {
        // Bind an arbitrary port, then ask for a free one in a window that
        // starts at the bound port.
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let bound = listener.local_addr().unwrap().port();

        if let Some(free) = probe_free_port(bound, bound.saturating_add(20), &[]) {
            assert_ne!(free, bound);
        }
    }

    #[test]
    fn probe_respects_taken_list() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let bound = listener.local_addr().unwrap().port();
        drop(listener);

        // The port is free again, but explicitly marked taken.
        assert_ne!(probe_free_port(bound, bound, &[bound]), Some(bound));
    }
}
