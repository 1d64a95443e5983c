//! Network paths: address validation, anti-amplification and
//! PATH_CHALLENGE bookkeeping (RFC 9000 sections 8 and 9).

use core::net::SocketAddr;

use crate::transport::Instant;

/// Until a path is validated a server may send at most this many times the
/// bytes it received on it.
pub const AMPLIFICATION_FACTOR: u64 = 3;

#[derive(Debug, Clone)]
pub struct Path {
    pub remote: SocketAddr,
    pub validated: bool,
    /// Largest UDP payload we send on this path.
    pub mtu: usize,
    bytes_received: u64,
    bytes_sent: u64,
    /// Outstanding challenge and when it is given up on.
    challenge: Option<([u8; 8], Instant)>,
    challenge_pending: bool,
    /// Challenge data to echo in a PATH_RESPONSE.
    response_pending: Option<[u8; 8]>,
}

impl Path {
    pub fn new(remote: SocketAddr, validated: bool, mtu: usize) -> Self {
        Self {
            remote,
            validated,
            mtu,
            bytes_received: 0,
            bytes_sent: 0,
            challenge: None,
            challenge_pending: false,
            response_pending: None,
        }
    }

    pub fn on_received(&mut self, bytes: usize) {
        self.bytes_received = self.bytes_received.saturating_add(bytes as u64);
    }

    pub fn on_sent(&mut self, bytes: usize) {
        self.bytes_sent = self.bytes_sent.saturating_add(bytes as u64);
    }

    /// Bytes that may still be sent before the peer proves its address,
    /// or `None` once the path is validated.
    pub fn send_budget(&self) -> Option<usize> {
        if self.validated {
            return None;
        }
        let allowed = self.bytes_received.saturating_mul(AMPLIFICATION_FACTOR);
        Some(allowed.saturating_sub(self.bytes_sent) as usize)
    }

    /// Start validating the path with fresh challenge `data`.
    pub fn start_challenge(&mut self, data: [u8; 8], deadline: Instant) {
        self.challenge = Some((data, deadline));
        self.challenge_pending = true;
    }

    /// A PATH_CHALLENGE to put on the wire, if one is owed.
    pub fn pending_challenge(&self) -> Option<[u8; 8]> {
        match self.challenge {
            Some((data, _)) if self.challenge_pending => Some(data),
            _ => None,
        }
    }

    pub fn on_challenge_sent(&mut self) {
        self.challenge_pending = false;
    }

    /// When an outstanding challenge times out.
    pub fn challenge_deadline(&self) -> Option<Instant> {
        self.challenge.map(|(_, deadline)| deadline)
    }

    /// Check a PATH_RESPONSE. A match validates the path.
    pub fn on_response(&mut self, data: [u8; 8]) -> bool {
        match self.challenge {
            Some((expected, _)) if expected == data => {
                self.challenge = None;
                self.challenge_pending = false;
                self.validated = true;
                true
            }
            _ => false,
        }
    }

    /// Give up on an outstanding challenge.
    pub fn abandon_challenge(&mut self) {
        self.challenge = None;
        self.challenge_pending = false;
    }

    pub fn queue_response(&mut self, data: [u8; 8]) {
        self.response_pending = Some(data);
    }

    pub fn take_response(&mut self) -> Option<[u8; 8]> {
        self.response_pending.take()
    }

    pub fn has_response(&self) -> bool {
        self.response_pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn unvalidated_path_is_limited_to_three_times_received() {
        let mut path = Path::new(addr(4433), false, 1200);
        assert_eq!(path.send_budget(), Some(0));
        path.on_received(1200);
        assert_eq!(path.send_budget(), Some(3600));
        path.on_sent(3000);
        assert_eq!(path.send_budget(), Some(600));
        path.on_sent(1000);
        assert_eq!(path.send_budget(), Some(0));

        path.validated = true;
        assert_eq!(path.send_budget(), None);
    }

    #[test]
    fn matching_response_validates() {
        let mut path = Path::new(addr(1), false, 1200);
        path.start_challenge([7; 8], 5_000);
        assert_eq!(path.pending_challenge(), Some([7; 8]));
        path.on_challenge_sent();
        assert_eq!(path.pending_challenge(), None);
        assert_eq!(path.challenge_deadline(), Some(5_000));

        assert!(!path.on_response([8; 8]));
        assert!(!path.validated);
        assert!(path.on_response([7; 8]));
        assert!(path.validated);
        assert_eq!(path.challenge_deadline(), None);
    }

    #[test]
    fn responses_are_sent_once() {
        let mut path = Path::new(addr(1), true, 1200);
        path.queue_response([1; 8]);
        assert!(path.has_response());
        assert_eq!(path.take_response(), Some([1; 8]));
        assert_eq!(path.take_response(), None);
    }
}
