//! Per-epoch packet protection state.
//!
//! One [`EpochManager`] lives inside every connection. It holds the seal and
//! open keys for each [`Epoch`], applies and removes header protection, runs
//! the AEAD, and rejects replayed packet numbers. For 1-RTT it also tracks
//! the key phase and rolls keys forward on a key update (RFC 9001 §6).

use alloc::vec::Vec;

use crate::crypto::key_schedule::{
    derive_keys, derive_packet_key, initial_secrets, next_generation_secret,
};
use crate::crypto::{
    Aead, CryptoProvider, Direction, Epoch, HeaderProtection, PacketKey, TrafficSecret,
};
use crate::error::Error;
use crate::packet::{decode_pn, HP_SAMPLE_LEN};

/// Number of packet numbers below the largest accepted one that are still
/// tracked individually. Anything older is treated as a replay.
pub const REPLAY_WINDOW: u64 = 128;

/// A packet with protection removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unprotected {
    pub packet_number: u64,
    /// First byte with header protection removed.
    pub first_byte: u8,
    /// Decrypted frames.
    pub payload: Vec<u8>,
}

/// Sliding bitmap of accepted packet numbers. Bit `i` is `largest - i`.
#[derive(Debug, Clone, Copy, Default)]
struct ReplayWindow {
    largest: Option<u64>,
    seen: u128,
}

impl ReplayWindow {
    fn check(&self, pn: u64) -> Result<(), Error> {
        let Some(largest) = self.largest else {
            return Ok(());
        };
        if pn > largest {
            return Ok(());
        }
        let age = largest - pn;
        if age >= REPLAY_WINDOW || self.seen & (1u128 << age) != 0 {
            return Err(Error::ReplayedPacket);
        }
        Ok(())
    }

    fn mark(&mut self, pn: u64) {
        match self.largest {
            Some(largest) if pn <= largest => {
                self.seen |= 1u128 << (largest - pn);
            }
            Some(largest) => {
                let shift = pn - largest;
                self.seen = if shift >= REPLAY_WINDOW { 0 } else { self.seen << shift };
                self.seen |= 1;
                self.largest = Some(pn);
            }
            None => {
                self.seen = 1;
                self.largest = Some(pn);
            }
        }
    }
}

struct Keys<C: CryptoProvider> {
    packet: PacketKey<C::Aead>,
    hp: C::HeaderProtection,
}

struct Context<C: CryptoProvider> {
    seal: Option<Keys<C>>,
    open: Option<Keys<C>>,
    replay: ReplayWindow,
}

impl<C: CryptoProvider> Default for Context<C> {
    fn default() -> Self {
        Self {
            seal: None,
            open: None,
            replay: ReplayWindow::default(),
        }
    }
}

/// 1-RTT key phase bookkeeping.
struct KeyPhase<C: CryptoProvider> {
    local_secret: Option<TrafficSecret>,
    remote_secret: Option<TrafficSecret>,
    /// Phase bit written into outgoing short headers.
    send_phase: bool,
    /// Phase of the packets the current open key accepts.
    recv_phase: bool,
    /// First packet number received in the current receive phase.
    recv_phase_start: u64,
    next_open: Option<PacketKey<C::Aead>>,
    prev_open: Option<PacketKey<C::Aead>>,
}

impl<C: CryptoProvider> Default for KeyPhase<C> {
    fn default() -> Self {
        Self {
            local_secret: None,
            remote_secret: None,
            send_phase: false,
            recv_phase: false,
            recv_phase_start: 0,
            next_open: None,
            prev_open: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenKey {
    Current,
    Next,
    Previous,
}

/// Seal/open keys for every epoch of one connection.
pub struct EpochManager<C: CryptoProvider> {
    provider: C,
    contexts: [Context<C>; 4],
    one_rtt: KeyPhase<C>,
    /// Used to compute a header protection mask when an epoch has no keys.
    placeholder_hp: C::HeaderProtection,
}

impl<C: CryptoProvider> EpochManager<C> {
    pub fn new(provider: C) -> Result<Self, Error> {
        let hp_len = provider.header_protection_key_len();
        let placeholder_hp = provider.header_protection(&[0u8; 32][..hp_len])?;
        Ok(Self {
            provider,
            contexts: core::array::from_fn(|_| Context::default()),
            one_rtt: KeyPhase::default(),
            placeholder_hp,
        })
    }

    /// Derive and install both directions of the Initial epoch from the
    /// client's first Destination Connection ID.
    pub fn install_initial(&mut self, dcid: &[u8], is_client: bool) -> Result<(), Error> {
        let (client, server) = initial_secrets(&self.provider.hkdf(), dcid)?;
        let (send, recv) = if is_client { (client, server) } else { (server, client) };
        self.install_keys(Epoch::Initial, Direction::Send, &send)?;
        self.install_keys(Epoch::Initial, Direction::Receive, &recv)?;
        // Re-deriving Initial keys (e.g. after a Retry) starts a fresh space.
        self.contexts[Epoch::Initial.index()].replay = ReplayWindow::default();
        Ok(())
    }

    /// Install (or replace) the key for one epoch and direction, expanded
    /// from a traffic secret.
    pub fn install_keys(
        &mut self,
        epoch: Epoch,
        direction: Direction,
        secret: &[u8],
    ) -> Result<(), Error> {
        let (packet, hp) = derive_keys(&self.provider, secret)?;
        let keys = Some(Keys { packet, hp });
        let ctx = &mut self.contexts[epoch.index()];
        match direction {
            Direction::Send => ctx.seal = keys,
            Direction::Receive => ctx.open = keys,
        }

        if epoch == Epoch::OneRtt {
            let stored = TrafficSecret::from_slice(secret).map_err(|_| Error::Crypto)?;
            match direction {
                Direction::Send => self.one_rtt.local_secret = Some(stored),
                Direction::Receive => {
                    let next = next_generation_secret(&self.provider.hkdf(), secret)?;
                    self.one_rtt.next_open = Some(derive_packet_key(&self.provider, &next)?);
                    self.one_rtt.prev_open = None;
                    self.one_rtt.remote_secret = Some(stored);
                }
            }
        }
        tracing::trace!(?epoch, ?direction, "installed packet keys");
        Ok(())
    }

    /// Drop both directions of an epoch's keys.
    pub fn discard(&mut self, epoch: Epoch) {
        self.contexts[epoch.index()] = Context::default();
        if epoch == Epoch::OneRtt {
            self.one_rtt = KeyPhase::default();
        }
        tracing::debug!(?epoch, "discarded packet keys");
    }

    pub fn has_keys(&self, epoch: Epoch, direction: Direction) -> bool {
        let ctx = &self.contexts[epoch.index()];
        match direction {
            Direction::Send => ctx.seal.is_some(),
            Direction::Receive => ctx.open.is_some(),
        }
    }

    /// Bytes the AEAD adds to every payload.
    pub fn tag_len(&self) -> usize {
        <C::Aead as Aead>::TAG_LEN
    }

    /// Key phase bit for outgoing 1-RTT packets.
    pub fn key_phase(&self) -> bool {
        self.one_rtt.send_phase
    }

    /// Start a 1-RTT key update: derive the next send key and flip the
    /// phase bit.
    ///
    /// Fails with `InvalidState` while a previous update has not been
    /// answered by the peer, or before 1-RTT keys exist.
    pub fn initiate_key_update(&mut self) -> Result<(), Error> {
        if self.one_rtt.send_phase != self.one_rtt.recv_phase {
            return Err(Error::InvalidState);
        }
        self.advance_send_key()?;
        tracing::debug!(phase = self.one_rtt.send_phase, "initiated key update");
        Ok(())
    }

    fn advance_send_key(&mut self) -> Result<(), Error> {
        let current = self.one_rtt.local_secret.as_ref().ok_or(Error::InvalidState)?;
        let next = next_generation_secret(&self.provider.hkdf(), current)?;
        let packet = derive_packet_key(&self.provider, &next)?;
        let seal = self.contexts[Epoch::OneRtt.index()]
            .seal
            .as_mut()
            .ok_or(Error::InvalidState)?;
        seal.packet = packet;
        self.one_rtt.local_secret = Some(next);
        self.one_rtt.send_phase = !self.one_rtt.send_phase;
        Ok(())
    }

    /// A packet in the next phase opened successfully: promote the next
    /// open key, and answer with our own update if the peer initiated it.
    fn rotate_receive_keys(&mut self, first_pn: u64) -> Result<(), Error> {
        let remote = self.one_rtt.remote_secret.as_ref().ok_or(Error::InvalidState)?;
        let next_remote = next_generation_secret(&self.provider.hkdf(), remote)?;
        let after_next = next_generation_secret(&self.provider.hkdf(), &next_remote)?;
        let next_open = derive_packet_key(&self.provider, &after_next)?;

        let promoted = self.one_rtt.next_open.replace(next_open).ok_or(Error::InvalidState)?;
        let open = self.contexts[Epoch::OneRtt.index()]
            .open
            .as_mut()
            .ok_or(Error::InvalidState)?;
        let retired = core::mem::replace(&mut open.packet, promoted);

        self.one_rtt.prev_open = Some(retired);
        self.one_rtt.remote_secret = Some(next_remote);
        self.one_rtt.recv_phase = !self.one_rtt.recv_phase;
        self.one_rtt.recv_phase_start = first_pn;

        if self.one_rtt.send_phase != self.one_rtt.recv_phase {
            self.advance_send_key()?;
        }
        tracing::debug!(phase = self.one_rtt.recv_phase, "peer key update");
        Ok(())
    }

    /// Seal `payload` and apply header protection.
    ///
    /// `header` runs up to and including the packet number; its first byte
    /// carries the packet number length. For short headers the key phase
    /// bit is filled in here. `payload` plus the packet number must be at
    /// least 4 bytes so the header protection sample is available.
    pub fn protect(
        &self,
        epoch: Epoch,
        packet_number: u64,
        header: &[u8],
        payload: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let first = *header.first().ok_or(Error::MalformedPacket)?;
        let is_long = first & 0x80 != 0;
        let pn_len = usize::from(first & 0x03) + 1;
        let pn_offset = header.len().checked_sub(pn_len).ok_or(Error::MalformedPacket)?;
        if pn_len + payload.len() < 4 {
            return Err(Error::BufferTooSmall {
                needed: 4 - pn_len,
            });
        }
        let keys = self.contexts[epoch.index()].seal.as_ref().ok_or(Error::Crypto)?;

        let mut out = Vec::with_capacity(header.len() + payload.len() + self.tag_len());
        out.extend_from_slice(header);
        if !is_long {
            out[0] = (first & !0x04) | (u8::from(self.one_rtt.send_phase) << 2);
        }

        let mut body = payload.to_vec();
        keys.packet.aead.seal(&keys.packet.nonce(packet_number), &out, &mut body)?;
        out.extend_from_slice(&body);

        let sample_offset = pn_offset + 4;
        let sample = out
            .get(sample_offset..sample_offset + HP_SAMPLE_LEN)
            .ok_or(Error::BufferTooSmall {
                needed: sample_offset + HP_SAMPLE_LEN,
            })?;
        let mask = keys.hp.mask(sample);
        out[0] ^= mask[0] & if is_long { 0x0f } else { 0x1f };
        for (i, m) in mask[1..=pn_len].iter().enumerate() {
            out[pn_offset + i] ^= m;
        }
        Ok(out)
    }

    /// Remove header protection, recover the packet number, check for
    /// replay and open the payload.
    ///
    /// `packet` is one packet (not a whole datagram), `pn_offset` the
    /// offset of its protected packet number and `largest_pn` the largest
    /// packet number processed in the epoch's space.
    pub fn unprotect(
        &mut self,
        epoch: Epoch,
        packet: &[u8],
        pn_offset: usize,
        largest_pn: Option<u64>,
    ) -> Result<Unprotected, Error> {
        let sample_offset = pn_offset + 4;
        let sample = packet
            .get(sample_offset..sample_offset + HP_SAMPLE_LEN)
            .ok_or(Error::DecryptionFailure)?;

        let ctx = &self.contexts[epoch.index()];
        let mask = match &ctx.open {
            Some(keys) => keys.hp.mask(sample),
            None => self.placeholder_hp.mask(sample),
        };
        let keys = ctx.open.as_ref().ok_or(Error::DecryptionFailure)?;

        let is_long = packet[0] & 0x80 != 0;
        let first_byte = packet[0] ^ (mask[0] & if is_long { 0x0f } else { 0x1f });
        let pn_len = usize::from(first_byte & 0x03) + 1;
        let payload_start = pn_offset + pn_len;

        let mut header = packet[..payload_start].to_vec();
        header[0] = first_byte;
        let mut truncated = 0u64;
        for (i, m) in mask[1..=pn_len].iter().enumerate() {
            header[pn_offset + i] ^= m;
            truncated = (truncated << 8) | u64::from(header[pn_offset + i]);
        }
        let packet_number = decode_pn(truncated, pn_len, largest_pn);
        ctx.replay.check(packet_number)?;

        let which = if epoch == Epoch::OneRtt {
            self.select_open_key(first_byte & 0x04 != 0, packet_number)
        } else {
            OpenKey::Current
        };
        let key = match which {
            OpenKey::Current => Some(&keys.packet),
            OpenKey::Next => self.one_rtt.next_open.as_ref(),
            OpenKey::Previous => self.one_rtt.prev_open.as_ref(),
        }
        .ok_or(Error::DecryptionFailure)?;

        let mut payload = packet[payload_start..].to_vec();
        key.aead
            .open(&key.nonce(packet_number), &header, &mut payload)
            .map_err(|_| Error::DecryptionFailure)?;

        if which == OpenKey::Next {
            self.rotate_receive_keys(packet_number)?;
        }
        self.contexts[epoch.index()].replay.mark(packet_number);

        Ok(Unprotected {
            packet_number,
            first_byte,
            payload,
        })
    }

    fn select_open_key(&self, key_phase: bool, packet_number: u64) -> OpenKey {
        let state = &self.one_rtt;
        if key_phase == state.recv_phase {
            OpenKey::Current
        } else if state.prev_open.is_some() && packet_number < state.recv_phase_start {
            OpenKey::Previous
        } else {
            OpenKey::Next
        }
    }
}
