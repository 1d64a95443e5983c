//! Connection IDs and the demultiplexing table.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec;
use alloc::vec::Vec;
use core::cmp::Ordering;
use core::fmt;
use core::hash::{Hash, Hasher};
use core::ops::Deref;

use crate::error::{Error, TransportError};
use crate::packet::MAX_CID_LEN;
use crate::transport::Rng;

/// An opaque connection ID of 0 to 20 bytes, stored inline.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ConnectionId(heapless::Vec<u8, MAX_CID_LEN>);

impl ConnectionId {
    /// Copy `bytes` into a connection ID. Fails for more than 20 bytes.
    pub fn new(bytes: &[u8]) -> Result<Self, Error> {
        heapless::Vec::from_slice(bytes)
            .map(Self)
            .map_err(|_| Error::MalformedPacket)
    }

    /// A fresh random ID of `len` bytes (clamped to 20).
    pub fn random(rng: &mut dyn Rng, len: usize) -> Self {
        let mut bytes = [0u8; MAX_CID_LEN];
        let len = len.min(MAX_CID_LEN);
        rng.fill(&mut bytes[..len]);
        let mut id = heapless::Vec::new();
        // cannot fail: len <= capacity
        let _ = id.extend_from_slice(&bytes[..len]);
        Self(id)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Deref for ConnectionId {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl PartialOrd for ConnectionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ConnectionId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_bytes().cmp(other.as_bytes())
    }
}

impl Hash for ConnectionId {
    fn hash<S: Hasher>(&self, state: &mut S) {
        self.as_bytes().hash(state);
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.iter() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// A local connection ID handed to the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedConnectionId {
    pub sequence: u64,
    pub id: ConnectionId,
    pub reset_token: [u8; 16],
}

/// A connection ID the peer gave us to address it with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConnectionId {
    pub sequence: u64,
    pub id: ConnectionId,
    pub reset_token: Option<[u8; 16]>,
}

/// Process-wide map from connection ID to the connection that owns it.
///
/// Owned by the caller's endpoint loop. Several IDs may point to the same
/// handle, e.g. while a connection rotates IDs during migration. Feed it
/// from `Event::ConnectionIdIssued` / `Event::ConnectionIdRetired` and drop
/// a handle's entries with [`ConnectionIdTable::remove_handle`] once the
/// connection terminates.
#[derive(Debug, Clone)]
pub struct ConnectionIdTable<H> {
    entries: BTreeMap<ConnectionId, H>,
}

impl<H> Default for ConnectionIdTable<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> ConnectionIdTable<H> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Route `id` to `handle`. An ID already owned by another handle is
    /// rejected with `InvalidState`.
    pub fn insert(&mut self, id: ConnectionId, handle: H) -> Result<(), Error>
    where
        H: PartialEq,
    {
        match self.entries.get(&id) {
            Some(existing) if *existing != handle => Err(Error::InvalidState),
            _ => {
                self.entries.insert(id, handle);
                Ok(())
            }
        }
    }

    /// Look up the handle for the destination connection ID of a datagram.
    pub fn get(&self, id: &[u8]) -> Option<&H> {
        let id = ConnectionId::new(id).ok()?;
        self.entries.get(&id)
    }

    pub fn remove(&mut self, id: &ConnectionId) -> Option<H> {
        self.entries.remove(id)
    }

    /// Drop every ID routed to `handle`. Returns how many were removed.
    pub fn remove_handle(&mut self, handle: &H) -> usize
    where
        H: PartialEq,
    {
        let before = self.entries.len();
        self.entries.retain(|_, h| h != handle);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Per-connection ID sets
// ---------------------------------------------------------------------------

/// IDs we issued for the peer to address us with.
#[derive(Debug, Clone)]
pub struct LocalConnectionIds {
    issued: Vec<IssuedConnectionId>,
    next_sequence: u64,
    /// NEW_CONNECTION_ID frames waiting to be sent, by sequence.
    pending: VecDeque<u64>,
}

impl LocalConnectionIds {
    /// Start with the ID sent as the source of our first packets
    /// (sequence 0).
    pub fn new(initial: ConnectionId, reset_token: [u8; 16]) -> Self {
        Self {
            issued: vec![IssuedConnectionId {
                sequence: 0,
                id: initial,
                reset_token,
            }],
            next_sequence: 1,
            pending: VecDeque::new(),
        }
    }

    /// The ID with the lowest live sequence number.
    pub fn initial(&self) -> Option<&IssuedConnectionId> {
        self.issued.first()
    }

    pub fn active_count(&self) -> usize {
        self.issued.len()
    }

    pub fn contains(&self, id: &[u8]) -> bool {
        self.issued.iter().any(|c| c.id.as_bytes() == id)
    }

    pub fn get(&self, sequence: u64) -> Option<&IssuedConnectionId> {
        self.issued.iter().find(|c| c.sequence == sequence)
    }

    /// Mint a new ID and queue its NEW_CONNECTION_ID frame.
    pub fn issue(&mut self, rng: &mut dyn Rng, len: usize) -> IssuedConnectionId {
        let mut reset_token = [0u8; 16];
        rng.fill(&mut reset_token);
        let issued = IssuedConnectionId {
            sequence: self.next_sequence,
            id: ConnectionId::random(rng, len),
            reset_token,
        };
        self.next_sequence += 1;
        self.issued.push(issued.clone());
        self.pending.push_back(issued.sequence);
        issued
    }

    /// Peer sent RETIRE_CONNECTION_ID. Retiring a sequence never issued, or
    /// the ID the frame's own packet was addressed to, is a
    /// PROTOCOL_VIOLATION. Returns the retired ID the first time.
    pub fn retire(
        &mut self,
        sequence: u64,
        packet_dcid: &[u8],
    ) -> Result<Option<IssuedConnectionId>, Error> {
        if sequence >= self.next_sequence {
            return Err(TransportError::ProtocolViolation.into());
        }
        let Some(pos) = self.issued.iter().position(|c| c.sequence == sequence) else {
            return Ok(None);
        };
        if self.issued[pos].id.as_bytes() == packet_dcid {
            return Err(TransportError::ProtocolViolation.into());
        }
        self.pending.retain(|s| *s != sequence);
        Ok(Some(self.issued.remove(pos)))
    }

    /// Next NEW_CONNECTION_ID to send.
    pub fn next_pending(&self) -> Option<&IssuedConnectionId> {
        self.pending.front().and_then(|s| self.get(*s))
    }

    pub fn on_sent(&mut self, sequence: u64) {
        self.pending.retain(|s| *s != sequence);
    }

    /// A NEW_CONNECTION_ID frame was lost; resend it unless retired.
    pub fn on_lost(&mut self, sequence: u64) {
        if self.get(sequence).is_some() && !self.pending.contains(&sequence) {
            self.pending.push_back(sequence);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &IssuedConnectionId> {
        self.issued.iter()
    }
}

/// IDs the peer issued for us to address it with.
#[derive(Debug, Clone)]
pub struct PeerConnectionIds {
    /// Live IDs, the first being the one in use.
    active: Vec<PeerConnectionId>,
    retire_prior_to: u64,
    /// RETIRE_CONNECTION_ID frames waiting to be sent.
    retire_pending: VecDeque<u64>,
    /// Our active_connection_id_limit.
    limit: usize,
}

impl PeerConnectionIds {
    pub fn new(initial: ConnectionId, limit: usize) -> Self {
        Self {
            active: vec![PeerConnectionId {
                sequence: 0,
                id: initial,
                reset_token: None,
            }],
            retire_prior_to: 0,
            retire_pending: VecDeque::new(),
            limit: limit.max(2),
        }
    }

    /// Destination ID for outgoing packets.
    pub fn current(&self) -> &[u8] {
        self.active.first().map_or(&[][..], |c| c.id.as_bytes())
    }

    /// Replace the sequence 0 ID, once the peer's first packet reveals the
    /// ID it chose.
    pub fn set_initial(&mut self, id: ConnectionId) {
        if let Some(first) = self.active.first_mut() {
            first.id = id;
        }
    }

    /// Reset token carried in the peer's transport parameters for its
    /// sequence 0 ID.
    pub fn set_initial_reset_token(&mut self, token: [u8; 16]) {
        if let Some(first) = self.active.iter_mut().find(|c| c.sequence == 0) {
            first.reset_token = Some(token);
        }
    }

    /// Whether `token` matches any live stateless reset token.
    pub fn is_reset_token(&self, token: &[u8]) -> bool {
        self.active
            .iter()
            .filter_map(|c| c.reset_token.as_ref())
            .any(|t| t[..] == *token)
    }

    /// Process a NEW_CONNECTION_ID frame.
    pub fn on_new_connection_id(
        &mut self,
        sequence: u64,
        retire_prior_to: u64,
        id: &[u8],
        reset_token: [u8; 16],
    ) -> Result<(), Error> {
        if self.current().is_empty() {
            // peer chose zero-length IDs and cannot hand out more
            return Err(TransportError::ProtocolViolation.into());
        }
        if retire_prior_to > sequence || id.is_empty() {
            return Err(TransportError::FrameEncodingError.into());
        }
        if let Some(existing) = self.active.iter().find(|c| c.sequence == sequence) {
            if existing.id.as_bytes() != id || existing.reset_token != Some(reset_token) {
                return Err(TransportError::ProtocolViolation.into());
            }
            return Ok(());
        }

        if sequence < self.retire_prior_to {
            self.retire_pending.push_back(sequence);
        } else {
            self.active.push(PeerConnectionId {
                sequence,
                id: ConnectionId::new(id)?,
                reset_token: Some(reset_token),
            });
        }

        if retire_prior_to > self.retire_prior_to {
            self.retire_prior_to = retire_prior_to;
            let (retired, kept): (Vec<_>, Vec<_>) = self
                .active
                .drain(..)
                .partition(|c| c.sequence < retire_prior_to);
            self.active = kept;
            self.retire_pending.extend(retired.iter().map(|c| c.sequence));
        }
        // keep the ID in use first; new IDs only take over once it retires
        self.active.sort_by_key(|c| c.sequence);

        if self.active.len() > self.limit {
            return Err(TransportError::ConnectionIdLimitError.into());
        }
        if self.active.is_empty() {
            return Err(TransportError::ProtocolViolation.into());
        }
        Ok(())
    }

    pub fn next_retirement(&self) -> Option<u64> {
        self.retire_pending.front().copied()
    }

    pub fn on_retire_sent(&mut self, sequence: u64) {
        self.retire_pending.retain(|s| *s != sequence);
    }

    pub fn on_retire_lost(&mut self, sequence: u64) {
        if !self.retire_pending.contains(&sequence) {
            self.retire_pending.push_back(sequence);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingRng(u8);

    impl Rng for CountingRng {
        fn fill(&mut self, buf: &mut [u8]) {
            for b in buf {
                self.0 = self.0.wrapping_add(1);
                *b = self.0;
            }
        }
    }

    #[test]
    fn rejects_oversized_ids() {
        assert!(ConnectionId::new(&[0; 20]).is_ok());
        assert_eq!(ConnectionId::new(&[0; 21]), Err(Error::MalformedPacket));
    }

    #[test]
    fn random_ids_use_requested_length() {
        let mut rng = CountingRng(0);
        let id = ConnectionId::random(&mut rng, 4);
        assert_eq!(id.as_bytes(), &[1, 2, 3, 4]);
        assert_eq!(ConnectionId::random(&mut rng, 64).len(), MAX_CID_LEN);
        assert_eq!(alloc::format!("{id:?}"), "01020304");
    }

    #[test]
    fn table_maps_several_ids_to_one_handle() {
        let mut table = ConnectionIdTable::new();
        let a = ConnectionId::new(&[1; 8]).unwrap();
        let b = ConnectionId::new(&[2; 8]).unwrap();
        table.insert(a.clone(), 7u32).unwrap();
        table.insert(b.clone(), 7u32).unwrap();
        table.insert(ConnectionId::new(&[3; 8]).unwrap(), 9u32).unwrap();

        assert_eq!(table.get(&[1; 8]), Some(&7));
        assert_eq!(table.get(&[2; 8]), Some(&7));
        assert_eq!(table.insert(a, 9), Err(Error::InvalidState));

        assert_eq!(table.remove_handle(&7), 2);
        assert_eq!(table.get(&[2; 8]), None);
        assert_eq!(table.len(), 1);
        assert!(table.remove(&b).is_none());
    }

    // --- per-connection sets ---

    #[test]
    fn local_ids_issue_and_retire() {
        let mut rng = CountingRng(0);
        let mut local = LocalConnectionIds::new(ConnectionId::new(&[9; 8]).unwrap(), [0; 16]);
        let issued = local.issue(&mut rng, 8);
        assert_eq!(issued.sequence, 1);
        assert_eq!(local.next_pending().map(|c| c.sequence), Some(1));
        local.on_sent(1);
        assert!(local.next_pending().is_none());

        // cannot retire what was never issued, nor the ID in use
        assert!(local.retire(5, &[9; 8]).is_err());
        assert!(local.retire(1, issued.id.as_bytes()).is_err());

        let retired = local.retire(0, issued.id.as_bytes()).unwrap();
        assert_eq!(retired.map(|c| c.sequence), Some(0));
        assert_eq!(local.retire(0, issued.id.as_bytes()).unwrap(), None);
        assert_eq!(local.active_count(), 1);

        // a lost frame for a retired ID is not resent
        local.on_lost(0);
        assert!(local.next_pending().is_none());
        local.on_lost(1);
        assert_eq!(local.next_pending().map(|c| c.sequence), Some(1));
    }

    #[test]
    fn peer_ids_follow_retire_prior_to() {
        let mut peer = PeerConnectionIds::new(ConnectionId::new(&[1; 8]).unwrap(), 4);
        peer.on_new_connection_id(1, 0, &[2; 8], [2; 16]).unwrap();
        assert_eq!(peer.current(), &[1; 8]);
        // repeated frame is fine, a conflicting one is not
        peer.on_new_connection_id(1, 0, &[2; 8], [2; 16]).unwrap();
        assert!(peer.on_new_connection_id(1, 0, &[3; 8], [2; 16]).is_err());

        peer.on_new_connection_id(2, 2, &[3; 8], [3; 16]).unwrap();
        assert_eq!(peer.current(), &[3; 8]);
        assert_eq!(peer.next_retirement(), Some(0));
        peer.on_retire_sent(0);
        assert_eq!(peer.next_retirement(), Some(1));
        assert!(peer.is_reset_token(&[3; 16]));
        assert!(!peer.is_reset_token(&[2; 16]));
    }

    #[test]
    fn peer_ids_enforce_limit() {
        let mut peer = PeerConnectionIds::new(ConnectionId::new(&[1; 8]).unwrap(), 2);
        peer.on_new_connection_id(1, 0, &[2; 8], [2; 16]).unwrap();
        assert_eq!(
            peer.on_new_connection_id(2, 0, &[3; 8], [3; 16]),
            Err(Error::Transport(TransportError::ConnectionIdLimitError))
        );
    }

    #[test]
    fn zero_length_peer_cannot_issue_ids() {
        let mut peer = PeerConnectionIds::new(ConnectionId::default(), 4);
        assert!(peer.on_new_connection_id(1, 0, &[2; 8], [2; 16]).is_err());
    }
}
