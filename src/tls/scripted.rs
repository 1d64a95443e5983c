//! A deterministic, unauthenticated handshake engine.
//!
//! Plays the shape of a TLS 1.3 handshake (ClientHello in Initial;
//! ServerHello, EncryptedExtensions and Finished from the server; the
//! client's Finished in Handshake) with messages framed like TLS handshake
//! messages: one type byte, a 24-bit length and the body. Traffic secrets
//! are SHA-256 over a label and both randoms, so two sessions built with
//! known randoms always agree on their keys.
//!
//! There is no certificate or signature: this exists to drive the
//! transport in simulations and tests, never to protect real traffic.

use alloc::collections::VecDeque;
use alloc::string::ToString;
use alloc::vec::Vec;

use sha2::{Digest, Sha256};

use super::{KeyUpdate, TlsSession, TransportParams};
use crate::crypto::{Direction, Epoch, TrafficSecret};
use crate::error::Error;

const CLIENT_HELLO: u8 = 0x01;
const SERVER_HELLO: u8 = 0x02;
const ENCRYPTED_EXTENSIONS: u8 = 0x08;
const FINISHED: u8 = 0x14;

const RANDOM_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Client: ClientHello not yet written. Server: waiting for it.
    Start,
    WaitServerHello,
    WaitEncryptedExtensions,
    WaitServerFinished,
    WaitClientFinished,
    Complete,
}

#[derive(Debug)]
pub struct ScriptedSession {
    is_client: bool,
    state: State,
    local_random: [u8; RANDOM_LEN],
    peer_random: [u8; RANDOM_LEN],
    /// Client: protocols offered. Server: protocols accepted, in order of
    /// preference.
    alpns: Vec<Vec<u8>>,
    selected_alpn: Option<Vec<u8>>,
    local_params: Option<Vec<u8>>,
    peer_params: Option<TransportParams>,
    /// Received bytes per epoch not yet forming a whole message.
    inbound: [Vec<u8>; 4],
    outgoing: VecDeque<(Epoch, Vec<u8>)>,
    keys: VecDeque<KeyUpdate>,
}

impl ScriptedSession {
    pub fn client(alpns: &[&[u8]], random: [u8; RANDOM_LEN]) -> Self {
        Self::new(true, alpns, random)
    }

    pub fn server(alpns: &[&[u8]], random: [u8; RANDOM_LEN]) -> Self {
        Self::new(false, alpns, random)
    }

    fn new(is_client: bool, alpns: &[&[u8]], random: [u8; RANDOM_LEN]) -> Self {
        Self {
            is_client,
            state: State::Start,
            local_random: random,
            peer_random: [0; RANDOM_LEN],
            alpns: alpns.iter().map(|a| a.to_vec()).collect(),
            selected_alpn: None,
            local_params: None,
            peer_params: None,
            inbound: Default::default(),
            outgoing: VecDeque::new(),
            keys: VecDeque::new(),
        }
    }

    fn randoms(&self) -> ([u8; RANDOM_LEN], [u8; RANDOM_LEN]) {
        if self.is_client {
            (self.local_random, self.peer_random)
        } else {
            (self.peer_random, self.local_random)
        }
    }

    fn digest(&self, label: &[u8]) -> [u8; 32] {
        let (client, server) = self.randoms();
        Sha256::new()
            .chain_update(label)
            .chain_update(client)
            .chain_update(server)
            .finalize()
            .into()
    }

    fn secret(&self, label: &[u8]) -> Result<TrafficSecret, Error> {
        TrafficSecret::from_slice(&self.digest(label)).map_err(|_| Error::Crypto)
    }

    /// Queue both directions of `epoch`: `client_label` names the secret
    /// the client sends with.
    fn queue_keys(&mut self, epoch: Epoch, client_label: &[u8], server_label: &[u8]) -> Result<(), Error> {
        let (send, recv) = if self.is_client {
            (client_label, server_label)
        } else {
            (server_label, client_label)
        };
        let send = self.secret(send)?;
        let recv = self.secret(recv)?;
        self.keys.push_back(KeyUpdate {
            epoch,
            direction: Direction::Send,
            material: send,
        });
        self.keys.push_back(KeyUpdate {
            epoch,
            direction: Direction::Receive,
            material: recv,
        });
        Ok(())
    }

    fn send(&mut self, epoch: Epoch, msg_type: u8, body: &[u8]) {
        let mut msg = Vec::with_capacity(4 + body.len());
        msg.push(msg_type);
        msg.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        msg.extend_from_slice(body);
        self.outgoing.push_back((epoch, msg));
    }

    fn local_params(&self) -> Result<&[u8], Error> {
        self.local_params
            .as_deref()
            .ok_or_else(|| Error::Handshake("transport parameters not set".to_string()))
    }

    fn write_client_hello(&mut self) -> Result<(), Error> {
        let mut body = Vec::new();
        body.extend_from_slice(&self.local_random);
        body.push(self.alpns.len() as u8);
        for alpn in &self.alpns {
            body.push(alpn.len() as u8);
            body.extend_from_slice(alpn);
        }
        push_u16_prefixed(self.local_params()?, &mut body)?;
        self.send(Epoch::Initial, CLIENT_HELLO, &body);
        self.state = State::WaitServerHello;
        Ok(())
    }

    fn on_client_hello(&mut self, body: &[u8]) -> Result<(), Error> {
        let mut r = Reader(body);
        self.peer_random = r.array()?;
        let count = r.u8()?;
        let mut offered = Vec::new();
        for _ in 0..count {
            let len = r.u8()? as usize;
            offered.push(r.take(len)?);
        }
        let params = r.u16_prefixed()?;
        r.finish()?;

        let selected = self
            .alpns
            .iter()
            .find(|ours| offered.iter().any(|theirs| theirs == &ours.as_slice()))
            .cloned()
            .ok_or_else(|| Error::Handshake("no application protocol".to_string()))?;
        self.peer_params = Some(TransportParams::decode(params)?);

        let random = self.local_random;
        self.send(Epoch::Initial, SERVER_HELLO, &random);
        self.queue_keys(Epoch::Handshake, b"c hs", b"s hs")?;

        let mut ee = Vec::new();
        ee.push(selected.len() as u8);
        ee.extend_from_slice(&selected);
        push_u16_prefixed(self.local_params()?, &mut ee)?;
        self.selected_alpn = Some(selected);
        self.send(Epoch::Handshake, ENCRYPTED_EXTENSIONS, &ee);

        let verify = self.digest(b"server finished");
        self.send(Epoch::Handshake, FINISHED, &verify);
        self.queue_keys(Epoch::OneRtt, b"c ap", b"s ap")?;
        self.state = State::WaitClientFinished;
        Ok(())
    }

    fn on_server_hello(&mut self, body: &[u8]) -> Result<(), Error> {
        let mut r = Reader(body);
        self.peer_random = r.array()?;
        r.finish()?;
        self.queue_keys(Epoch::Handshake, b"c hs", b"s hs")?;
        self.state = State::WaitEncryptedExtensions;
        Ok(())
    }

    fn on_encrypted_extensions(&mut self, body: &[u8]) -> Result<(), Error> {
        let mut r = Reader(body);
        let len = r.u8()? as usize;
        let alpn = r.take(len)?;
        let params = r.u16_prefixed()?;
        r.finish()?;
        if !self.alpns.iter().any(|a| a.as_slice() == alpn) {
            return Err(Error::Handshake("server selected an unoffered protocol".to_string()));
        }
        self.selected_alpn = Some(alpn.to_vec());
        self.peer_params = Some(TransportParams::decode(params)?);
        self.state = State::WaitServerFinished;
        Ok(())
    }

    fn on_finished(&mut self, body: &[u8]) -> Result<(), Error> {
        let expected = if self.is_client {
            self.digest(b"server finished")
        } else {
            self.digest(b"client finished")
        };
        if body != expected {
            return Err(Error::Handshake("finished verification failed".to_string()));
        }
        if self.is_client {
            let verify = self.digest(b"client finished");
            self.send(Epoch::Handshake, FINISHED, &verify);
            self.queue_keys(Epoch::OneRtt, b"c ap", b"s ap")?;
        }
        self.state = State::Complete;
        tracing::debug!(client = self.is_client, "handshake complete");
        Ok(())
    }

    fn on_message(&mut self, epoch: Epoch, msg_type: u8, body: &[u8]) -> Result<(), Error> {
        match (self.is_client, self.state, epoch, msg_type) {
            (false, State::Start, Epoch::Initial, CLIENT_HELLO) => self.on_client_hello(body),
            (true, State::WaitServerHello, Epoch::Initial, SERVER_HELLO) => self.on_server_hello(body),
            (true, State::WaitEncryptedExtensions, Epoch::Handshake, ENCRYPTED_EXTENSIONS) => {
                self.on_encrypted_extensions(body)
            }
            (true, State::WaitServerFinished, Epoch::Handshake, FINISHED)
            | (false, State::WaitClientFinished, Epoch::Handshake, FINISHED) => self.on_finished(body),
            _ => Err(Error::Handshake("unexpected handshake message".to_string())),
        }
    }
}

impl TlsSession for ScriptedSession {
    fn read_handshake(&mut self, epoch: Epoch, data: &[u8]) -> Result<(), Error> {
        let i = epoch.index();
        self.inbound[i].extend_from_slice(data);
        loop {
            let buf = &self.inbound[i];
            if buf.len() < 4 {
                return Ok(());
            }
            let len = u32::from_be_bytes([0, buf[1], buf[2], buf[3]]) as usize;
            if buf.len() < 4 + len {
                return Ok(());
            }
            let msg_type = buf[0];
            let body: Vec<u8> = buf[4..4 + len].to_vec();
            self.inbound[i].drain(..4 + len);
            self.on_message(epoch, msg_type, &body)?;
        }
    }

    fn write_handshake(&mut self) -> Option<(Epoch, Vec<u8>)> {
        if self.is_client && self.state == State::Start && self.local_params.is_some() {
            // local params are present, so this cannot fail
            self.write_client_hello().ok()?;
        }
        self.outgoing.pop_front()
    }

    fn next_key_update(&mut self) -> Option<KeyUpdate> {
        self.keys.pop_front()
    }

    fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    fn alpn(&self) -> Option<&[u8]> {
        self.selected_alpn.as_deref()
    }

    fn set_local_transport_params(&mut self, params: &TransportParams) {
        let mut encoded = Vec::new();
        if params.encode(&mut encoded).is_ok() {
            self.local_params = Some(encoded);
        }
    }

    fn peer_transport_params(&self) -> Option<&TransportParams> {
        self.peer_params.as_ref()
    }
}

fn push_u16_prefixed(data: &[u8], out: &mut Vec<u8>) -> Result<(), Error> {
    let len = u16::try_from(data.len()).map_err(|_| Error::BufferTooSmall { needed: data.len() })?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(data);
    Ok(())
}

/// Bounds-checked cursor over a message body.
struct Reader<'a>(&'a [u8]);

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        if self.0.len() < len {
            return Err(Error::Handshake("truncated handshake message".to_string()));
        }
        let (head, rest) = self.0.split_at(len);
        self.0 = rest;
        Ok(head)
    }

    fn u8(&mut self) -> Result<u8, Error> {
        Ok(self.take(1)?[0])
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u16_prefixed(&mut self) -> Result<&'a [u8], Error> {
        let len = u16::from_be_bytes(self.array()?) as usize;
        self.take(len)
    }

    fn finish(&self) -> Result<(), Error> {
        if !self.0.is_empty() {
            return Err(Error::Handshake("trailing bytes in handshake message".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (ScriptedSession, ScriptedSession) {
        let mut client = ScriptedSession::client(&[b"hq-interop"], [1; 32]);
        let mut server = ScriptedSession::server(&[b"h3", b"hq-interop"], [2; 32]);
        client.set_local_transport_params(&TransportParams::default_params());
        server.set_local_transport_params(&TransportParams::default_params());
        (client, server)
    }

    /// Deliver everything `from` wants to send to `to`.
    fn flush(from: &mut ScriptedSession, to: &mut ScriptedSession) -> Result<usize, Error> {
        let mut n = 0;
        while let Some((epoch, bytes)) = from.write_handshake() {
            to.read_handshake(epoch, &bytes)?;
            n += 1;
        }
        Ok(n)
    }

    fn drain_keys(s: &mut ScriptedSession) -> Vec<KeyUpdate> {
        core::iter::from_fn(|| s.next_key_update()).collect()
    }

    #[test]
    fn full_handshake_agrees_on_keys() {
        let (mut client, mut server) = pair();
        assert_eq!(flush(&mut client, &mut server).unwrap(), 1);
        assert_eq!(flush(&mut server, &mut client).unwrap(), 3);
        assert!(client.is_complete());
        assert!(!server.is_complete());
        assert_eq!(flush(&mut client, &mut server).unwrap(), 1);
        assert!(server.is_complete());

        assert_eq!(client.alpn(), Some(&b"hq-interop"[..]));
        assert_eq!(server.alpn(), Some(&b"hq-interop"[..]));
        assert_eq!(
            client.peer_transport_params(),
            Some(&TransportParams::default_params())
        );

        let ck = drain_keys(&mut client);
        let sk = drain_keys(&mut server);
        assert_eq!(ck.len(), 4);
        assert_eq!(sk.len(), 4);
        for c in &ck {
            let opposite = match c.direction {
                Direction::Send => Direction::Receive,
                Direction::Receive => Direction::Send,
            };
            let s = sk
                .iter()
                .find(|s| s.epoch == c.epoch && s.direction == opposite)
                .unwrap();
            assert_eq!(c.material, s.material);
        }
        let material = |keys: &[KeyUpdate], epoch: Epoch, direction: Direction| {
            keys.iter()
                .find(|k| k.epoch == epoch && k.direction == direction)
                .map(|k| k.material.clone())
                .unwrap()
        };
        assert_ne!(
            material(&ck, Epoch::Handshake, Direction::Send),
            material(&ck, Epoch::OneRtt, Direction::Send)
        );
        assert_ne!(
            material(&ck, Epoch::OneRtt, Direction::Send),
            material(&ck, Epoch::OneRtt, Direction::Receive)
        );
    }

    #[test]
    fn handshake_keys_precede_one_rtt() {
        let (mut client, mut server) = pair();
        flush(&mut client, &mut server).unwrap();
        let epochs: Vec<Epoch> = drain_keys(&mut server).iter().map(|k| k.epoch).collect();
        assert_eq!(
            epochs,
            [Epoch::Handshake, Epoch::Handshake, Epoch::OneRtt, Epoch::OneRtt]
        );
    }

    #[test]
    fn messages_may_arrive_in_pieces() {
        let (mut client, mut server) = pair();
        let (epoch, hello) = client.write_handshake().unwrap();
        for byte in hello.chunks(3) {
            server.read_handshake(epoch, byte).unwrap();
        }
        assert!(server.write_handshake().is_some());
    }

    #[test]
    fn no_common_protocol_fails() {
        let mut client = ScriptedSession::client(&[b"smtp"], [1; 32]);
        let mut server = ScriptedSession::server(&[b"h3"], [2; 32]);
        client.set_local_transport_params(&TransportParams::default_params());
        server.set_local_transport_params(&TransportParams::default_params());
        assert!(matches!(
            flush(&mut client, &mut server),
            Err(Error::Handshake(_))
        ));
    }

    #[test]
    fn tampered_finished_is_rejected() {
        let (mut client, mut server) = pair();
        flush(&mut client, &mut server).unwrap();
        let mut msgs: Vec<_> = core::iter::from_fn(|| server.write_handshake()).collect();
        let last = msgs.last_mut().unwrap();
        let n = last.1.len();
        last.1[n - 1] ^= 1;
        let mut result = Ok(());
        for (epoch, bytes) in msgs {
            result = result.and_then(|_| client.read_handshake(epoch, &bytes));
        }
        assert!(matches!(result, Err(Error::Handshake(_))));
        assert!(!client.is_complete());
    }

    #[test]
    fn message_in_wrong_epoch_is_rejected() {
        let (mut client, mut server) = pair();
        let (_, hello) = client.write_handshake().unwrap();
        assert!(server.read_handshake(Epoch::Handshake, &hello).is_err());
    }
}
