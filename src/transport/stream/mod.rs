//! Stream multiplexing (RFC 9000 §2, §3).
//!
//! [`StreamMap`] owns every open stream together with the connection-level
//! flow control windows and stream count limits, so a single call can
//! check both levels before anything changes. Frames are validated here;
//! the connection turns the returned outcomes into events.

pub mod recv;
pub mod send;

pub use recv::{ReadChunks, RecvBuffer};
pub use send::{Chunk, SendBuffer};

use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;

use crate::error::{Error, TransportError};
use crate::transport::flow_control::{RecvWindow, SendWindow, StreamCount};
use crate::transport::recovery::SentFrame;

// ---------------------------------------------------------------------------
// Stream ID helpers
// ---------------------------------------------------------------------------

pub fn is_client_initiated(stream_id: u64) -> bool {
    stream_id & 0x01 == 0
}

pub fn is_bidirectional(stream_id: u64) -> bool {
    stream_id & 0x02 == 0
}

/// Position of the stream among those of its type.
pub fn stream_index(stream_id: u64) -> u64 {
    stream_id >> 2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    ClientBidi = 0x00,
    ServerBidi = 0x01,
    ClientUni = 0x02,
    ServerUni = 0x03,
}

impl StreamType {
    pub fn new(client: bool, bidirectional: bool) -> Self {
        match (client, bidirectional) {
            (true, true) => Self::ClientBidi,
            (false, true) => Self::ServerBidi,
            (true, false) => Self::ClientUni,
            (false, false) => Self::ServerUni,
        }
    }

    /// ID of the nth stream of this type.
    pub fn stream_id(self, n: u64) -> u64 {
        n * 4 + self as u64
    }
}

// ---------------------------------------------------------------------------
// Stream states (RFC 9000 §3.1, §3.2)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStreamState {
    Ready,
    Send,
    DataSent,
    ResetSent,
    DataRecvd,
    ResetRecvd,
}

impl SendStreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::DataRecvd | Self::ResetRecvd)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvStreamState {
    Recv,
    SizeKnown,
    DataRecvd,
    /// Resets are surfaced to the application as soon as they arrive, so
    /// there is no separate ResetRecvd.
    ResetRead,
    DataRead,
}

impl RecvStreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::DataRead | Self::ResetRead)
    }
}

// ---------------------------------------------------------------------------
// Per-stream state
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SendStream {
    pub state: SendStreamState,
    buf: SendBuffer,
    window: SendWindow,
    /// (error code, final size) once reset locally.
    reset: Option<(u64, u64)>,
    reset_pending: bool,
}

impl SendStream {
    fn new(max_data: u64) -> Self {
        Self {
            state: SendStreamState::Ready,
            buf: SendBuffer::new(),
            window: SendWindow::new(max_data),
            reset: None,
            reset_pending: false,
        }
    }

    pub fn window(&self) -> &SendWindow {
        &self.window
    }

    pub fn buffer(&self) -> &SendBuffer {
        &self.buf
    }
}

#[derive(Debug)]
pub struct RecvStream {
    pub state: RecvStreamState,
    buf: RecvBuffer,
    window: RecvWindow,
    resend_max_stream_data: bool,
    stop: Option<u64>,
    stop_pending: bool,
}

impl RecvStream {
    fn new(window: u64) -> Self {
        Self {
            state: RecvStreamState::Recv,
            buf: RecvBuffer::new(),
            window: RecvWindow::new(window),
            resend_max_stream_data: false,
            stop: None,
            stop_pending: false,
        }
    }

    pub fn window(&self) -> &RecvWindow {
        &self.window
    }

    fn update_state(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        if self.buf.is_fully_read() {
            self.state = RecvStreamState::DataRead;
        } else if self.buf.final_size().is_some() {
            self.state = if self.buf.is_complete() {
                RecvStreamState::DataRecvd
            } else {
                RecvStreamState::SizeKnown
            };
        }
    }
}

#[derive(Debug)]
pub struct Stream {
    pub id: u64,
    pub send: Option<SendStream>,
    pub recv: Option<RecvStream>,
}

impl Stream {
    fn is_reclaimable(&self) -> bool {
        self.send.as_ref().map_or(true, |s| s.state.is_terminal())
            && self.recv.as_ref().map_or(true, |r| r.state.is_terminal())
    }
}

// ---------------------------------------------------------------------------
// Limits
// ---------------------------------------------------------------------------

/// Flow control limits one endpoint grants the other, as carried in
/// transport parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamLimits {
    pub max_data: u64,
    /// For bidirectional streams opened by the endpoint granting the limit.
    pub max_stream_data_bidi_local: u64,
    /// For bidirectional streams opened by the other endpoint.
    pub max_stream_data_bidi_remote: u64,
    pub max_stream_data_uni: u64,
    pub max_streams_bidi: u64,
    pub max_streams_uni: u64,
}

/// What a received STREAM frame changed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecvOutcome {
    /// The frame carried new bytes or the final size.
    pub fresh: bool,
    /// Contiguous data is ready to read.
    pub readable: bool,
}

// ---------------------------------------------------------------------------
// StreamMap
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct StreamMap {
    streams: BTreeMap<u64, Stream>,
    is_client: bool,
    local: StreamLimits,
    peer: StreamLimits,
    bidi: StreamCount,
    uni: StreamCount,
    /// Count of peer streams of each kind implicitly opened so far.
    remote_opened_bidi: u64,
    remote_opened_uni: u64,
    conn_send: SendWindow,
    conn_recv: RecvWindow,
    resend_max_data: bool,
    resend_max_streams: [bool; 2],
    /// Peer streams opened since the last poll.
    opened: VecDeque<u64>,
    /// Stream the last chunk was taken from, for round-robin scheduling.
    last_sent: Option<u64>,
}

impl StreamMap {
    /// `local` are the limits we advertise. Nothing may be sent until the
    /// peer's limits arrive through [`apply_peer_limits`](Self::apply_peer_limits).
    pub fn new(is_client: bool, local: StreamLimits) -> Self {
        Self {
            streams: BTreeMap::new(),
            is_client,
            local,
            peer: StreamLimits::default(),
            bidi: StreamCount::new(local.max_streams_bidi),
            uni: StreamCount::new(local.max_streams_uni),
            remote_opened_bidi: 0,
            remote_opened_uni: 0,
            conn_send: SendWindow::new(0),
            conn_recv: RecvWindow::new(local.max_data),
            resend_max_data: false,
            resend_max_streams: [false; 2],
            opened: VecDeque::new(),
            last_sent: None,
        }
    }

    pub fn apply_peer_limits(&mut self, peer: StreamLimits) -> Result<(), Error> {
        self.peer = peer;
        self.conn_send.update_max(peer.max_data);
        self.bidi.update_local_max(peer.max_streams_bidi)?;
        self.uni.update_local_max(peer.max_streams_uni)?;
        let is_client = self.is_client;
        for stream in self.streams.values_mut() {
            let Some(send) = stream.send.as_mut() else {
                continue;
            };
            let max = if !is_bidirectional(stream.id) {
                peer.max_stream_data_uni
            } else if is_client_initiated(stream.id) == is_client {
                peer.max_stream_data_bidi_remote
            } else {
                peer.max_stream_data_bidi_local
            };
            send.window.update_max(max);
        }
        Ok(())
    }

    fn is_local(&self, stream_id: u64) -> bool {
        is_client_initiated(stream_id) == self.is_client
    }

    pub fn get(&self, stream_id: u64) -> Option<&Stream> {
        self.streams.get(&stream_id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    pub fn connection_send_window(&self) -> &SendWindow {
        &self.conn_send
    }

    pub fn connection_recv_window(&self) -> &RecvWindow {
        &self.conn_recv
    }

    /// Next peer-initiated stream that appeared since the last call.
    pub fn poll_opened(&mut self) -> Option<u64> {
        self.opened.pop_front()
    }

    // --- Opening ---

    /// Open a locally-initiated stream.
    pub fn open(&mut self, bidirectional: bool) -> Result<u64, Error> {
        let count = if bidirectional { &mut self.bidi } else { &mut self.uni };
        let index = count.open_local()?;
        let id = StreamType::new(self.is_client, bidirectional).stream_id(index);
        let (send_max, recv_window) = if bidirectional {
            (
                self.peer.max_stream_data_bidi_remote,
                Some(self.local.max_stream_data_bidi_local),
            )
        } else {
            (self.peer.max_stream_data_uni, None)
        };
        self.streams.insert(
            id,
            Stream {
                id,
                send: Some(SendStream::new(send_max)),
                recv: recv_window.map(RecvStream::new),
            },
        );
        tracing::trace!(stream_id = id, "opened stream");
        Ok(id)
    }

    /// Look up a stream the peer referenced, creating it (and every lower
    /// numbered stream of its type) if it is a new peer stream. `Ok(None)`
    /// means the stream existed and was already reclaimed.
    fn get_or_create(&mut self, stream_id: u64) -> Result<Option<&mut Stream>, Error> {
        let index = stream_index(stream_id);
        let bidi = is_bidirectional(stream_id);
        if self.is_local(stream_id) {
            let opened = if bidi {
                self.bidi.local_opened()
            } else {
                self.uni.local_opened()
            };
            if index >= opened {
                return Err(TransportError::StreamStateError.into());
            }
            return Ok(self.streams.get_mut(&stream_id));
        }

        let opened = if bidi {
            self.remote_opened_bidi
        } else {
            self.remote_opened_uni
        };
        if index >= opened {
            if bidi {
                self.bidi.check_remote(index)?;
            } else {
                self.uni.check_remote(index)?;
            }
            let ty = StreamType::new(!self.is_client, bidi);
            for n in opened..=index {
                let id = ty.stream_id(n);
                let (send, recv) = if bidi {
                    (
                        Some(SendStream::new(self.peer.max_stream_data_bidi_local)),
                        RecvStream::new(self.local.max_stream_data_bidi_remote),
                    )
                } else {
                    (None, RecvStream::new(self.local.max_stream_data_uni))
                };
                self.streams.insert(
                    id,
                    Stream {
                        id,
                        send,
                        recv: Some(recv),
                    },
                );
                self.opened.push_back(id);
            }
            if bidi {
                self.remote_opened_bidi = index + 1;
            } else {
                self.remote_opened_uni = index + 1;
            }
        }
        Ok(self.streams.get_mut(&stream_id))
    }

    fn local_stream(&mut self, stream_id: u64) -> Result<&mut Stream, Error> {
        self.streams.get_mut(&stream_id).ok_or(Error::UnknownStream)
    }

    // --- Application writes ---

    /// Buffer `data` for sending. Either all of it is accepted or nothing
    /// changes.
    pub fn write(&mut self, stream_id: u64, data: &[u8], fin: bool) -> Result<(), Error> {
        let conn_capacity = self.conn_send.capacity();
        let stream = self.streams.get_mut(&stream_id).ok_or(Error::UnknownStream)?;
        let send = stream
            .send
            .as_mut()
            .ok_or(Error::Transport(TransportError::StreamStateError))?;

        if send.reset.is_some() {
            return Err(Error::StreamFinished);
        }
        if let Some(size) = send.buf.final_size() {
            if fin && data.is_empty() && size == send.buf.written() {
                return Ok(());
            }
            if fin {
                return Err(TransportError::FinalSizeError.into());
            }
            return Err(Error::StreamFinished);
        }

        let len = data.len() as u64;
        send.window.check(len)?;
        if len > conn_capacity {
            return Err(TransportError::FlowControlError.into());
        }
        send.window.consume(len)?;
        send.buf.write(data);
        if fin {
            send.buf.finish();
            send.state = SendStreamState::DataSent;
        } else if send.state == SendStreamState::Ready {
            send.state = SendStreamState::Send;
        }
        self.conn_send.consume(len)
    }

    /// Abandon the send side with RESET_STREAM.
    pub fn reset(&mut self, stream_id: u64, error_code: u64) -> Result<(), Error> {
        let stream = self.local_stream(stream_id)?;
        let send = stream
            .send
            .as_mut()
            .ok_or(Error::Transport(TransportError::StreamStateError))?;
        if send.reset.is_some() || send.state == SendStreamState::DataRecvd {
            return Ok(());
        }
        send.reset = Some((error_code, send.buf.written()));
        send.reset_pending = true;
        send.state = SendStreamState::ResetSent;
        send.buf.clear();
        tracing::debug!(stream_id, error_code, "resetting stream");
        Ok(())
    }

    /// Ask the peer to stop sending with STOP_SENDING.
    pub fn stop_sending(&mut self, stream_id: u64, error_code: u64) -> Result<(), Error> {
        let stream = self.local_stream(stream_id)?;
        let recv = stream
            .recv
            .as_mut()
            .ok_or(Error::Transport(TransportError::StreamStateError))?;
        if recv.stop.is_some() || recv.state.is_terminal() || recv.state == RecvStreamState::DataRecvd {
            return Ok(());
        }
        recv.stop = Some(error_code);
        recv.stop_pending = true;
        Ok(())
    }

    // --- Application reads ---

    /// Lazily read contiguous data. Flow control credit is returned as
    /// chunks are taken.
    pub fn read(&mut self, stream_id: u64) -> Result<StreamRead<'_>, Error> {
        let stream = self.streams.get_mut(&stream_id).ok_or(Error::UnknownStream)?;
        let recv = stream
            .recv
            .as_mut()
            .ok_or(Error::Transport(TransportError::StreamStateError))?;
        Ok(StreamRead {
            chunks: recv.buf.read_chunks(),
            window: &mut recv.window,
            conn_window: &mut self.conn_recv,
        })
    }

    /// Whether the peer finished the stream and all data was read.
    pub fn is_read_finished(&self, stream_id: u64) -> bool {
        self.streams
            .get(&stream_id)
            .and_then(|s| s.recv.as_ref())
            .is_some_and(|r| r.buf.is_fully_read())
    }

    pub fn is_readable(&self, stream_id: u64) -> bool {
        self.streams
            .get(&stream_id)
            .and_then(|s| s.recv.as_ref())
            .is_some_and(|r| r.buf.is_readable() || r.buf.is_fully_read())
    }

    /// Refresh a stream's state after reads or acknowledgments and drop it
    /// once both sides are done. Returns whether it was reclaimed.
    pub fn maintain(&mut self, stream_id: u64) -> bool {
        let Some(stream) = self.streams.get_mut(&stream_id) else {
            return false;
        };
        if let Some(recv) = stream.recv.as_mut() {
            recv.update_state();
        }
        if !stream.is_reclaimable() || self.has_pending_control(stream_id) {
            return false;
        }
        self.streams.remove(&stream_id);
        if !self.is_local(stream_id) {
            if is_bidirectional(stream_id) {
                self.bidi.on_remote_reclaimed();
            } else {
                self.uni.on_remote_reclaimed();
            }
        }
        tracing::trace!(stream_id, "reclaimed stream");
        true
    }

    fn has_pending_control(&self, stream_id: u64) -> bool {
        self.streams.get(&stream_id).is_some_and(|s| {
            s.send.as_ref().is_some_and(|x| x.reset_pending)
                || s.recv.as_ref().is_some_and(|r| r.stop_pending)
        })
    }

    // --- Peer frames ---

    pub fn on_stream_frame(
        &mut self,
        stream_id: u64,
        offset: u64,
        data: &[u8],
        fin: bool,
    ) -> Result<RecvOutcome, Error> {
        let end = offset
            .checked_add(data.len() as u64)
            .filter(|e| *e <= crate::varint::MAX_VARINT)
            .ok_or(Error::Transport(TransportError::FrameEncodingError))?;
        let conn_room = self.conn_recv.max() - self.conn_recv.highest();
        let Some(stream) = self.get_or_create(stream_id)? else {
            return Ok(RecvOutcome::default());
        };
        let recv = stream
            .recv
            .as_mut()
            .ok_or(Error::Transport(TransportError::StreamStateError))?;
        if recv.state == RecvStreamState::ResetRead {
            return Ok(RecvOutcome::default());
        }

        recv.buf.check_final_size(end, fin)?;
        let grown = end.saturating_sub(recv.window.highest());
        if end > recv.window.max() || grown > conn_room {
            return Err(TransportError::FlowControlError.into());
        }
        recv.window.on_received(end)?;
        let fresh = recv.buf.insert(offset, data, fin)?;
        recv.update_state();
        let readable = recv.buf.is_readable() || (fresh && recv.buf.is_fully_read());
        self.conn_recv.on_received_bytes(grown)?;
        Ok(RecvOutcome { fresh, readable })
    }

    /// Peer reset its send side. Returns `true` the first time.
    pub fn on_reset_stream(
        &mut self,
        stream_id: u64,
        error_code: u64,
        final_size: u64,
    ) -> Result<bool, Error> {
        let conn_room = self.conn_recv.max() - self.conn_recv.highest();
        let Some(stream) = self.get_or_create(stream_id)? else {
            return Ok(false);
        };
        let recv = stream
            .recv
            .as_mut()
            .ok_or(Error::Transport(TransportError::StreamStateError))?;
        if recv.state == RecvStreamState::ResetRead {
            recv.buf.check_final_size(final_size, true)?;
            return Ok(false);
        }
        let grown = final_size.saturating_sub(recv.window.highest());
        if final_size > recv.window.max() || grown > conn_room {
            return Err(TransportError::FlowControlError.into());
        }
        recv.buf.reset(final_size)?;
        recv.window.on_received(final_size)?;
        let unread = final_size - recv.buf.read_offset();
        recv.state = RecvStreamState::ResetRead;
        recv.stop_pending = false;
        self.conn_recv.on_received_bytes(grown)?;
        // bytes that will never be read still count as consumed
        self.conn_recv.on_consumed(unread);
        tracing::debug!(stream_id, error_code, final_size, "peer reset stream");
        Ok(true)
    }

    /// Peer asked us to stop sending; answered with RESET_STREAM carrying
    /// the same code. Returns `true` the first time.
    pub fn on_stop_sending(&mut self, stream_id: u64, error_code: u64) -> Result<bool, Error> {
        let Some(stream) = self.get_or_create(stream_id)? else {
            return Ok(false);
        };
        if stream.send.is_none() {
            return Err(TransportError::StreamStateError.into());
        }
        let fresh = stream
            .send
            .as_ref()
            .is_some_and(|s| s.reset.is_none() && !s.state.is_terminal());
        if fresh {
            self.reset(stream_id, error_code)?;
        }
        Ok(fresh)
    }

    pub fn on_max_stream_data(&mut self, stream_id: u64, max: u64) -> Result<(), Error> {
        let Some(stream) = self.get_or_create(stream_id)? else {
            return Ok(());
        };
        let send = stream
            .send
            .as_mut()
            .ok_or(Error::Transport(TransportError::StreamStateError))?;
        send.window.update_max(max);
        Ok(())
    }

    /// STREAM_DATA_BLOCKED only has to reference a valid receiving stream.
    pub fn on_stream_data_blocked(&mut self, stream_id: u64) -> Result<(), Error> {
        let Some(stream) = self.get_or_create(stream_id)? else {
            return Ok(());
        };
        if stream.recv.is_none() {
            return Err(TransportError::StreamStateError.into());
        }
        Ok(())
    }

    pub fn on_max_data(&mut self, max: u64) {
        self.conn_send.update_max(max);
    }

    pub fn on_max_streams(&mut self, bidirectional: bool, max: u64) -> Result<(), Error> {
        if bidirectional {
            self.bidi.update_local_max(max)
        } else {
            self.uni.update_local_max(max)
        }
    }

    // --- Sending ---

    /// Whether any stream has data (or a bare FIN) waiting.
    pub fn has_pending_data(&self) -> bool {
        self.streams
            .values()
            .any(|s| s.send.as_ref().is_some_and(|x| x.reset.is_none() && x.buf.has_pending()))
    }

    /// Next stream to take data from, round-robin, with the offset its
    /// chunk would start at.
    pub fn next_pending(&self) -> Option<(u64, u64)> {
        let pending = |s: &Stream| {
            let send = s.send.as_ref()?;
            if send.reset.is_some() {
                return None;
            }
            send.buf.next_offset().map(|off| (s.id, off))
        };
        let after = self.last_sent.map_or(0, |id| id + 1);
        self.streams
            .range(after..)
            .find_map(|(_, s)| pending(s))
            .or_else(|| self.streams.values().find_map(pending))
    }

    /// Take up to `max_len` bytes from `stream_id`.
    pub fn take_chunk(&mut self, stream_id: u64, max_len: usize) -> Option<Chunk> {
        let send = self.streams.get_mut(&stream_id)?.send.as_mut()?;
        let chunk = send.buf.next_chunk(max_len)?;
        self.last_sent = Some(stream_id);
        Some(chunk)
    }

    /// A STREAM frame was acknowledged. Returns `true` when this completed
    /// the send side.
    pub fn on_stream_acked(&mut self, stream_id: u64, offset: u64, len: u64, fin: bool) -> bool {
        let Some(send) = self.streams.get_mut(&stream_id).and_then(|s| s.send.as_mut()) else {
            return false;
        };
        if send.reset.is_some() {
            return false;
        }
        send.buf.on_ack(offset..offset + len, fin);
        if send.state == SendStreamState::DataSent && send.buf.is_fully_acked() {
            send.state = SendStreamState::DataRecvd;
            return true;
        }
        false
    }

    pub fn on_stream_lost(&mut self, stream_id: u64, offset: u64, len: u64, fin: bool) {
        let Some(send) = self.streams.get_mut(&stream_id).and_then(|s| s.send.as_mut()) else {
            return;
        };
        if send.reset.is_none() {
            send.buf.on_lost(offset..offset + len, fin);
        }
    }

    // --- Control frames ---

    /// Most urgent control frame waiting to be sent, if any. Call
    /// [`on_control_sent`](Self::on_control_sent) once it is in a packet.
    pub fn next_control(&self) -> Option<SentFrame> {
        for stream in self.streams.values() {
            if let Some(send) = &stream.send {
                if let (true, Some((error_code, final_size))) = (send.reset_pending, send.reset) {
                    return Some(SentFrame::ResetStream {
                        stream_id: stream.id,
                        error_code,
                        final_size,
                    });
                }
            }
            if let Some(recv) = &stream.recv {
                if let (true, Some(error_code)) = (recv.stop_pending, recv.stop) {
                    return Some(SentFrame::StopSending {
                        stream_id: stream.id,
                        error_code,
                    });
                }
                if matches!(recv.state, RecvStreamState::Recv) {
                    let max = recv.window.pending_update().or(recv
                        .resend_max_stream_data
                        .then_some(recv.window.max()));
                    if let Some(max) = max {
                        return Some(SentFrame::MaxStreamData {
                            stream_id: stream.id,
                            max,
                        });
                    }
                }
            }
        }
        if let Some(max) = self
            .conn_recv
            .pending_update()
            .or(self.resend_max_data.then_some(self.conn_recv.max()))
        {
            return Some(SentFrame::MaxData(max));
        }
        for (i, count) in [&self.bidi, &self.uni].into_iter().enumerate() {
            if let Some(max) = count
                .pending_update()
                .or(self.resend_max_streams[i].then_some(count.remote_max()))
            {
                return Some(SentFrame::MaxStreams {
                    bidirectional: i == 0,
                    max,
                });
            }
        }
        if let Some(limit) = self.conn_send.blocked() {
            return Some(SentFrame::DataBlocked(limit));
        }
        None
    }

    pub fn on_control_sent(&mut self, frame: &SentFrame) {
        match *frame {
            SentFrame::ResetStream { stream_id, .. } => {
                if let Some(send) = self.streams.get_mut(&stream_id).and_then(|s| s.send.as_mut()) {
                    send.reset_pending = false;
                }
            }
            SentFrame::StopSending { stream_id, .. } => {
                if let Some(recv) = self.streams.get_mut(&stream_id).and_then(|s| s.recv.as_mut()) {
                    recv.stop_pending = false;
                }
            }
            SentFrame::MaxStreamData { stream_id, max } => {
                if let Some(recv) = self.streams.get_mut(&stream_id).and_then(|s| s.recv.as_mut()) {
                    recv.window.commit_update(max);
                    recv.resend_max_stream_data = false;
                }
            }
            SentFrame::MaxData(max) => {
                self.conn_recv.commit_update(max);
                self.resend_max_data = false;
            }
            SentFrame::MaxStreams { bidirectional, max } => {
                let count = if bidirectional { &mut self.bidi } else { &mut self.uni };
                count.commit_update(max);
                self.resend_max_streams[usize::from(!bidirectional)] = false;
            }
            SentFrame::DataBlocked(_) => self.conn_send.on_blocked_sent(),
            _ => {}
        }
    }

    /// A packet carrying `frame` was lost. The frame is queued again only
    /// if it still carries current information.
    pub fn on_control_lost(&mut self, frame: &SentFrame) {
        match *frame {
            SentFrame::ResetStream { stream_id, .. } => {
                if let Some(send) = self.streams.get_mut(&stream_id).and_then(|s| s.send.as_mut()) {
                    if send.state == SendStreamState::ResetSent {
                        send.reset_pending = true;
                    }
                }
            }
            SentFrame::StopSending { stream_id, .. } => {
                if let Some(recv) = self.streams.get_mut(&stream_id).and_then(|s| s.recv.as_mut()) {
                    if !recv.state.is_terminal() && recv.stop.is_some() {
                        recv.stop_pending = true;
                    }
                }
            }
            SentFrame::MaxStreamData { stream_id, max } => {
                if let Some(recv) = self.streams.get_mut(&stream_id).and_then(|s| s.recv.as_mut()) {
                    if recv.state == RecvStreamState::Recv && recv.window.is_current(max) {
                        recv.resend_max_stream_data = true;
                    }
                }
            }
            SentFrame::MaxData(max) => {
                if self.conn_recv.is_current(max) {
                    self.resend_max_data = true;
                }
            }
            SentFrame::MaxStreams { bidirectional, max } => {
                let count = if bidirectional { &self.bidi } else { &self.uni };
                if count.is_current(max) {
                    self.resend_max_streams[usize::from(!bidirectional)] = true;
                }
            }
            _ => {}
        }
    }

    /// The peer acknowledged our RESET_STREAM.
    pub fn on_reset_acked(&mut self, stream_id: u64) {
        if let Some(send) = self.streams.get_mut(&stream_id).and_then(|s| s.send.as_mut()) {
            send.state = SendStreamState::ResetRecvd;
        }
    }
}

/// Lazy reader returned by [`StreamMap::read`].
#[derive(Debug)]
pub struct StreamRead<'a> {
    chunks: ReadChunks<'a>,
    window: &'a mut RecvWindow,
    conn_window: &'a mut RecvWindow,
}

impl Iterator for StreamRead<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        let chunk = self.chunks.next()?;
        self.window.on_consumed(chunk.len() as u64);
        self.conn_window.on_consumed(chunk.len() as u64);
        Some(chunk)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
