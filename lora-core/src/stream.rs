//! Stream transfer state machine: announce, chunked sequences, missing-bitmap acks, completion.
//!
//! Host-driven like the rest of the core: every input returns the actions to perform.
//! Receiver sessions are keyed by (sender, stream_id); outbound streams by destination peer,
//! one at a time.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::chunk::{self, bitmap_indices, full_bitmap, Reassembly};
use crate::protocol::{
    Message, MessageKind, NodeId, Payload, SequenceStatus, StreamAnnounce, StreamAnnounceAck,
    StreamComplete, StreamRequest, StreamSequence, StreamSequenceAck, StreamType, MAX_CHUNK_SIZE,
    MAX_PACKETS_PER_SEQUENCE,
};
use crate::wire::StreamRef;

/// Default ticks to wait for an ack before retransmitting.
pub const DEFAULT_ACK_TIMEOUT_TICKS: u64 = 3;

/// Default retransmission rounds per sequence before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default ticks of silence before a receiver drops its session.
pub const DEFAULT_IDLE_TIMEOUT_TICKS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamConfig {
    /// Bytes per Stream-Sequence chunk, 1 ..= MAX_CHUNK_SIZE.
    pub chunk_size: usize,
    pub ack_timeout_ticks: u64,
    pub max_retries: u32,
    pub idle_timeout_ticks: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            chunk_size: MAX_CHUNK_SIZE,
            ack_timeout_ticks: DEFAULT_ACK_TIMEOUT_TICKS,
            max_retries: DEFAULT_MAX_RETRIES,
            idle_timeout_ticks: DEFAULT_IDLE_TIMEOUT_TICKS,
        }
    }
}

/// Why a stream frame was refused or a stream was aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum StreamAnomaly {
    #[error("no session for this stream")]
    UnknownSession,
    #[error("stream completed with packets missing ({missing:#010x})")]
    IncompleteOnComplete { missing: u32 },
    #[error("invalid or out-of-order announce")]
    InvalidAnnounce,
    #[error("packet does not match the announced sequence")]
    PacketMismatch,
    #[error("retries exhausted")]
    RetriesExhausted,
    #[error("idle timeout")]
    IdleTimeout,
    #[error("malformed stream frame")]
    Malformed,
    #[error("peer reported a stream error")]
    PeerReportedError,
    #[error("replaced by a new announce")]
    Superseded,
    #[error("an outbound stream to this peer is already active")]
    PeerBusy,
    #[error("streams need a unicast peer")]
    InvalidPeer,
    #[error("stream needs more sequences than the sequence number can count")]
    TooLarge,
}

/// What the host must do after feeding the stream manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamAction {
    /// Transmit this message (source unset; the engine stamps it).
    Send(Message),
    /// A received stream completed; `data` is every sequence in order.
    Delivered {
        peer: NodeId,
        stream_id: u8,
        stream_type: StreamType,
        data: Vec<u8>,
    },
    /// A stream in either direction was dropped.
    Aborted {
        peer: NodeId,
        stream_id: u8,
        reason: StreamAnomaly,
    },
    /// An outbound stream was fully acknowledged and Stream-Complete sent.
    Sent { peer: NodeId, stream_id: u8 },
}

/// Receiver session state. Completion and abort destroy the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Announced,
    Receiving,
    AwaitingNextSequence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundStatus {
    AwaitingAnnounceAck,
    AwaitingSequenceAck,
}

struct InboundSession {
    stream_type: StreamType,
    sequence_number: u16,
    status: SessionStatus,
    reassembly: Reassembly,
    data: Vec<u8>,
    retries: u32,
    last_activity: u64,
    last_progress: u64,
}

impl InboundSession {
    fn new(a: &StreamAnnounce, now: u64) -> Self {
        Self {
            stream_type: a.stream_type,
            sequence_number: a.sequence_number,
            status: SessionStatus::Announced,
            reassembly: Reassembly::new(a.packets_in_sequence),
            data: Vec::new(),
            retries: 0,
            last_activity: now,
            last_progress: now,
        }
    }

    fn begin_sequence(&mut self, a: &StreamAnnounce, now: u64) {
        self.sequence_number = a.sequence_number;
        self.status = SessionStatus::Announced;
        self.reassembly = Reassembly::new(a.packets_in_sequence);
        self.retries = 0;
        self.last_activity = now;
        self.last_progress = now;
    }

    fn is_same_announce(&self, a: &StreamAnnounce) -> bool {
        self.stream_type == a.stream_type
            && self.sequence_number == a.sequence_number
            && self.reassembly.packets_in_sequence() == a.packets_in_sequence
    }

    fn is_next_announce(&self, a: &StreamAnnounce) -> bool {
        self.status == SessionStatus::AwaitingNextSequence
            && self.stream_type == a.stream_type
            && Some(a.sequence_number) == self.sequence_number.checked_add(1)
    }

    fn ack(&self, peer: NodeId, stream_id: u8, status: SequenceStatus) -> Message {
        Message::new(
            peer,
            Payload::StreamSequenceAck(StreamSequenceAck {
                stream_id,
                sequence_number: self.sequence_number,
                status,
                missing_bitmap: self.reassembly.missing_bitmap(),
            }),
        )
    }
}

struct OutboundStream {
    stream_id: u8,
    stream_type: StreamType,
    sequences: Vec<Vec<Vec<u8>>>,
    current: usize,
    status: OutboundStatus,
    retries: u32,
    last_activity: u64,
}

impl OutboundStream {
    fn sequence_number(&self) -> u16 {
        // bounded by the TooLarge check in start_stream
        self.current as u16
    }

    fn packets_in_current(&self) -> u8 {
        self.sequences[self.current].len() as u8
    }

    fn announce(&self, peer: NodeId) -> Message {
        Message::new(
            peer,
            Payload::StreamAnnounce(StreamAnnounce {
                stream_type: self.stream_type,
                stream_id: self.stream_id,
                sequence_number: self.sequence_number(),
                packets_in_sequence: self.packets_in_current(),
            }),
        )
    }

    fn packet(&self, peer: NodeId, index: u8) -> Option<Message> {
        let chunk = self.sequences[self.current].get(index as usize)?;
        Some(Message::new(
            peer,
            Payload::StreamSequence(StreamSequence {
                stream_type: self.stream_type,
                stream_id: self.stream_id,
                sequence_number: self.sequence_number(),
                packet_index: index,
                packets_in_sequence: self.packets_in_current(),
                chunk: chunk.clone(),
            }),
        ))
    }

    fn packets(&self, peer: NodeId, bitmap: u32) -> Vec<StreamAction> {
        bitmap_indices(bitmap)
            .filter_map(|i| self.packet(peer, i))
            .map(StreamAction::Send)
            .collect()
    }
}

/// All stream state of one node.
pub struct StreamManager {
    config: StreamConfig,
    now: u64,
    inbound: BTreeMap<(NodeId, u8), InboundSession>,
    outbound: BTreeMap<NodeId, OutboundStream>,
    /// Stream-Requests we sent, by peer, with the tick they were sent.
    pending: BTreeMap<NodeId, u64>,
    next_stream_id: BTreeMap<NodeId, u8>,
}

impl StreamManager {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            now: 0,
            inbound: BTreeMap::new(),
            outbound: BTreeMap::new(),
            pending: BTreeMap::new(),
            next_stream_id: BTreeMap::new(),
        }
    }

    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Ticks elapsed since creation.
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn session_status(&self, peer: NodeId, stream_id: u8) -> Option<SessionStatus> {
        self.inbound.get(&(peer, stream_id)).map(|s| s.status)
    }

    /// Stream id and state of the outbound stream to `peer`, if any.
    pub fn outbound_status(&self, peer: NodeId) -> Option<(u8, OutboundStatus)> {
        self.outbound.get(&peer).map(|o| (o.stream_id, o.status))
    }

    pub fn has_pending_request(&self, peer: NodeId) -> bool {
        self.pending.contains_key(&peer)
    }

    pub fn inbound_count(&self) -> usize {
        self.inbound.len()
    }

    pub fn outbound_count(&self) -> usize {
        self.outbound.len()
    }

    /// Record a Stream-Request to `peer` and return the message to send.
    pub fn request_stream(&mut self, peer: NodeId, stream_type: StreamType) -> Message {
        self.pending.insert(peer, self.now);
        Message::new(peer, Payload::StreamRequest(StreamRequest { stream_type }))
    }

    /// Begin sending `data` to `peer`. Returns the allocated stream id and the announce to send.
    pub fn start_stream(
        &mut self,
        peer: NodeId,
        stream_type: StreamType,
        data: &[u8],
    ) -> Result<(u8, Vec<StreamAction>), StreamAnomaly> {
        if peer.is_broadcast() || peer.is_unset() {
            return Err(StreamAnomaly::InvalidPeer);
        }
        if self.outbound.contains_key(&peer) {
            return Err(StreamAnomaly::PeerBusy);
        }
        let sequences = chunk::split_into_sequences(data, self.config.chunk_size);
        if sequences.len() > u16::MAX as usize + 1 {
            return Err(StreamAnomaly::TooLarge);
        }

        let counter = self.next_stream_id.entry(peer).or_insert(0);
        *counter = counter.wrapping_add(1);
        let stream_id = *counter;

        let out = OutboundStream {
            stream_id,
            stream_type,
            sequences,
            current: 0,
            status: OutboundStatus::AwaitingAnnounceAck,
            retries: 0,
            last_activity: self.now,
        };
        tracing::debug!(
            peer = %peer,
            stream_id,
            bytes = data.len(),
            sequences = out.sequences.len(),
            "starting outbound stream"
        );
        let announce = out.announce(peer);
        self.outbound.insert(peer, out);
        Ok((stream_id, vec![StreamAction::Send(announce)]))
    }

    /// Feed a received stream-kind message (source = sending peer).
    /// `Err` means the frame was dropped without changing any state.
    pub fn on_message(&mut self, msg: &Message) -> Result<Vec<StreamAction>, StreamAnomaly> {
        let peer = msg.source;
        match &msg.payload {
            Payload::StreamAnnounce(a) => self.on_announce(peer, a),
            Payload::StreamSequence(p) => self.on_sequence(peer, p),
            Payload::StreamComplete(c) => self.on_complete(peer, c),
            Payload::StreamAnnounceAck(a) => self.on_announce_ack(peer, a),
            Payload::StreamSequenceAck(a) => self.on_sequence_ack(peer, a),
            _ => Ok(Vec::new()),
        }
    }

    /// A stream frame failed to decode; abort the session it belongs to, if any.
    pub fn on_malformed(&mut self, r: StreamRef) -> Vec<StreamAction> {
        match r.kind {
            MessageKind::StreamAnnounce
            | MessageKind::StreamSequence
            | MessageKind::StreamComplete => {
                self.abort_inbound(r.source, r.stream_id, StreamAnomaly::Malformed)
            }
            MessageKind::StreamAnnounceAck | MessageKind::StreamSequenceAck => {
                match self.outbound.get(&r.source) {
                    Some(o) if o.stream_id == r.stream_id => {
                        self.abort_outbound(r.source, StreamAnomaly::Malformed)
                    }
                    _ => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }

    fn on_announce(
        &mut self,
        peer: NodeId,
        a: &StreamAnnounce,
    ) -> Result<Vec<StreamAction>, StreamAnomaly> {
        if a.packets_in_sequence == 0 || a.packets_in_sequence as usize > MAX_PACKETS_PER_SEQUENCE
        {
            return Err(StreamAnomaly::InvalidAnnounce);
        }
        let key = (peer, a.stream_id);
        let ack = StreamAction::Send(Message::new(
            peer,
            Payload::StreamAnnounceAck(StreamAnnounceAck {
                stream_id: a.stream_id,
                sequence_number: a.sequence_number,
            }),
        ));
        let now = self.now;

        if let Some(s) = self.inbound.get_mut(&key) {
            if s.is_same_announce(a) {
                s.last_activity = now;
                return Ok(vec![ack]);
            }
            if s.is_next_announce(a) {
                tracing::trace!(peer = %peer, stream_id = a.stream_id, seq = a.sequence_number, "next sequence");
                s.begin_sequence(a, now);
                return Ok(vec![ack]);
            }
            if s.stream_type == a.stream_type
                && a.sequence_number != 0
                && a.sequence_number < s.sequence_number
            {
                // late duplicate of an announce we already moved past; seq 0 is a restart
                s.last_activity = now;
                return Ok(Vec::new());
            }
        }

        let mut actions = Vec::new();
        if self.inbound.contains_key(&key) {
            let reason = if a.sequence_number == 0 {
                StreamAnomaly::Superseded
            } else {
                StreamAnomaly::InvalidAnnounce
            };
            actions.extend(self.abort_inbound(peer, a.stream_id, reason));
        }
        if a.sequence_number != 0 {
            if actions.is_empty() {
                return Err(StreamAnomaly::InvalidAnnounce);
            }
            return Ok(actions);
        }

        self.pending.remove(&peer);
        tracing::debug!(
            peer = %peer,
            stream_id = a.stream_id,
            stream_type = ?a.stream_type,
            packets = a.packets_in_sequence,
            "stream announced"
        );
        self.inbound.insert(key, InboundSession::new(a, now));
        actions.push(ack);
        Ok(actions)
    }

    fn on_sequence(
        &mut self,
        peer: NodeId,
        p: &StreamSequence,
    ) -> Result<Vec<StreamAction>, StreamAnomaly> {
        let now = self.now;
        let Some(s) = self.inbound.get_mut(&(peer, p.stream_id)) else {
            return Err(StreamAnomaly::UnknownSession);
        };
        s.last_activity = now;

        if p.sequence_number < s.sequence_number {
            // late duplicate of an acknowledged sequence
            return Ok(Vec::new());
        }
        if p.sequence_number > s.sequence_number
            || p.stream_type != s.stream_type
            || p.packets_in_sequence != s.reassembly.packets_in_sequence()
            || p.packet_index >= p.packets_in_sequence
        {
            return Ok(self.abort_inbound(peer, p.stream_id, StreamAnomaly::PacketMismatch));
        }

        if s.status == SessionStatus::AwaitingNextSequence {
            // sender missed our ack for the sequence we just completed
            return Ok(vec![StreamAction::Send(s.ack(
                peer,
                p.stream_id,
                SequenceStatus::Ok,
            ))]);
        }

        s.status = SessionStatus::Receiving;
        if !s.reassembly.is_received(p.packet_index) {
            s.last_progress = now;
        }
        if s.reassembly.mark_received(p.packet_index, p.chunk.clone()) {
            s.reassembly.reassemble_into(&mut s.data);
            s.status = SessionStatus::AwaitingNextSequence;
            s.retries = 0;
            tracing::trace!(peer = %peer, stream_id = p.stream_id, seq = s.sequence_number, "sequence complete");
            return Ok(vec![StreamAction::Send(s.ack(
                peer,
                p.stream_id,
                SequenceStatus::Ok,
            ))]);
        }
        if p.packet_index == p.packets_in_sequence - 1 {
            return Ok(vec![StreamAction::Send(s.ack(
                peer,
                p.stream_id,
                SequenceStatus::Ok,
            ))]);
        }
        Ok(Vec::new())
    }

    fn on_complete(
        &mut self,
        peer: NodeId,
        c: &StreamComplete,
    ) -> Result<Vec<StreamAction>, StreamAnomaly> {
        let key = (peer, c.stream_id);
        let Some(s) = self.inbound.get(&key) else {
            return Err(StreamAnomaly::UnknownSession);
        };
        if s.status != SessionStatus::AwaitingNextSequence {
            let missing = s.reassembly.missing_bitmap();
            return Ok(self.abort_inbound(
                peer,
                c.stream_id,
                StreamAnomaly::IncompleteOnComplete { missing },
            ));
        }
        let Some(s) = self.inbound.remove(&key) else {
            return Err(StreamAnomaly::UnknownSession);
        };
        tracing::debug!(peer = %peer, stream_id = c.stream_id, bytes = s.data.len(), "stream delivered");
        Ok(vec![StreamAction::Delivered {
            peer,
            stream_id: c.stream_id,
            stream_type: s.stream_type,
            data: s.data,
        }])
    }

    fn on_announce_ack(
        &mut self,
        peer: NodeId,
        a: &StreamAnnounceAck,
    ) -> Result<Vec<StreamAction>, StreamAnomaly> {
        let now = self.now;
        let o = match self.outbound.get_mut(&peer) {
            Some(o) if o.stream_id == a.stream_id => o,
            _ => return Err(StreamAnomaly::UnknownSession),
        };
        if o.status != OutboundStatus::AwaitingAnnounceAck
            || a.sequence_number != o.sequence_number()
        {
            return Ok(Vec::new());
        }
        o.status = OutboundStatus::AwaitingSequenceAck;
        o.retries = 0;
        o.last_activity = now;
        Ok(o.packets(peer, full_bitmap(o.packets_in_current())))
    }

    fn on_sequence_ack(
        &mut self,
        peer: NodeId,
        a: &StreamSequenceAck,
    ) -> Result<Vec<StreamAction>, StreamAnomaly> {
        let now = self.now;
        let max_retries = self.config.max_retries;
        let o = match self.outbound.get_mut(&peer) {
            Some(o) if o.stream_id == a.stream_id => o,
            _ => return Err(StreamAnomaly::UnknownSession),
        };
        if a.status == SequenceStatus::Error {
            return Ok(self.abort_outbound(peer, StreamAnomaly::PeerReportedError));
        }
        if o.status != OutboundStatus::AwaitingSequenceAck
            || a.sequence_number != o.sequence_number()
        {
            return Ok(Vec::new());
        }
        o.last_activity = now;

        let missing = a.missing_bitmap & full_bitmap(o.packets_in_current());
        if missing != 0 {
            o.retries += 1;
            if o.retries > max_retries {
                return Ok(self.abort_outbound(peer, StreamAnomaly::RetriesExhausted));
            }
            tracing::debug!(
                peer = %peer,
                stream_id = a.stream_id,
                seq = a.sequence_number,
                missing = format_args!("{:#010x}", missing),
                "retransmitting missing packets"
            );
            return Ok(o.packets(peer, missing));
        }

        o.retries = 0;
        if o.current + 1 < o.sequences.len() {
            o.current += 1;
            o.status = OutboundStatus::AwaitingAnnounceAck;
            return Ok(vec![StreamAction::Send(o.announce(peer))]);
        }

        let stream_id = o.stream_id;
        self.outbound.remove(&peer);
        tracing::debug!(peer = %peer, stream_id, "outbound stream sent");
        Ok(vec![
            StreamAction::Send(Message::new(
                peer,
                Payload::StreamComplete(StreamComplete { stream_id }),
            )),
            StreamAction::Sent { peer, stream_id },
        ])
    }

    /// Advance the clock one tick and run every timeout that is due.
    pub fn tick(&mut self) -> Vec<StreamAction> {
        self.now = self.now.saturating_add(1);
        let now = self.now;
        let StreamConfig {
            ack_timeout_ticks,
            max_retries,
            idle_timeout_ticks,
            ..
        } = self.config;
        let mut actions = Vec::new();

        self.pending.retain(|peer, since| {
            let live = now.saturating_sub(*since) < idle_timeout_ticks;
            if !live {
                tracing::debug!(peer = %peer, "stream request unanswered");
            }
            live
        });

        let keys: Vec<(NodeId, u8)> = self.inbound.keys().copied().collect();
        for (peer, stream_id) in keys {
            let Some(s) = self.inbound.get_mut(&(peer, stream_id)) else {
                continue;
            };
            if now.saturating_sub(s.last_activity) >= idle_timeout_ticks {
                actions.extend(self.abort_inbound(peer, stream_id, StreamAnomaly::IdleTimeout));
                continue;
            }
            if s.status == SessionStatus::Receiving
                && now.saturating_sub(s.last_progress) >= ack_timeout_ticks
            {
                s.retries += 1;
                if s.retries > max_retries {
                    actions.extend(self.abort_inbound(
                        peer,
                        stream_id,
                        StreamAnomaly::RetriesExhausted,
                    ));
                    continue;
                }
                s.last_progress = now;
                actions.push(StreamAction::Send(s.ack(peer, stream_id, SequenceStatus::Ok)));
            }
        }

        let peers: Vec<NodeId> = self.outbound.keys().copied().collect();
        for peer in peers {
            let Some(o) = self.outbound.get_mut(&peer) else {
                continue;
            };
            if now.saturating_sub(o.last_activity) < ack_timeout_ticks {
                continue;
            }
            o.retries += 1;
            if o.retries > max_retries {
                actions.extend(self.abort_outbound(peer, StreamAnomaly::RetriesExhausted));
                continue;
            }
            o.last_activity = now;
            let resend = match o.status {
                OutboundStatus::AwaitingAnnounceAck => Some(o.announce(peer)),
                // the last packet provokes a fresh ack from the receiver
                OutboundStatus::AwaitingSequenceAck => {
                    o.packet(peer, o.packets_in_current().saturating_sub(1))
                }
            };
            actions.extend(resend.map(StreamAction::Send));
        }

        actions
    }

    /// Drop an inbound session, telling the sender with an error-status ack.
    fn abort_inbound(
        &mut self,
        peer: NodeId,
        stream_id: u8,
        reason: StreamAnomaly,
    ) -> Vec<StreamAction> {
        let Some(s) = self.inbound.remove(&(peer, stream_id)) else {
            return Vec::new();
        };
        tracing::warn!(peer = %peer, stream_id, %reason, "inbound stream aborted");
        let mut actions = Vec::with_capacity(2);
        // the peer started the replacement itself; an error ack would abort its new stream
        if reason != StreamAnomaly::Superseded {
            actions.push(StreamAction::Send(s.ack(peer, stream_id, SequenceStatus::Error)));
        }
        actions.push(StreamAction::Aborted {
            peer,
            stream_id,
            reason,
        });
        actions
    }

    fn abort_outbound(&mut self, peer: NodeId, reason: StreamAnomaly) -> Vec<StreamAction> {
        let Some(o) = self.outbound.remove(&peer) else {
            return Vec::new();
        };
        tracing::warn!(peer = %peer, stream_id = o.stream_id, %reason, "outbound stream aborted");
        vec![StreamAction::Aborted {
            peer,
            stream_id: o.stream_id,
            reason,
        }]
    }
}

impl Default for StreamManager {
    fn default() -> Self {
        Self::new(StreamConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    const A: NodeId = NodeId(1);
    const B: NodeId = NodeId(2);

    fn announce(stream_id: u8, seq: u16, packets: u8) -> Message {
        Message::from_source(
            A,
            B,
            Payload::StreamAnnounce(StreamAnnounce {
                stream_type: StreamType::Jpeg,
                stream_id,
                sequence_number: seq,
                packets_in_sequence: packets,
            }),
        )
    }

    fn packet(stream_id: u8, seq: u16, index: u8, packets: u8, chunk: &[u8]) -> Message {
        Message::from_source(
            A,
            B,
            Payload::StreamSequence(StreamSequence {
                stream_type: StreamType::Jpeg,
                stream_id,
                sequence_number: seq,
                packet_index: index,
                packets_in_sequence: packets,
                chunk: chunk.to_vec(),
            }),
        )
    }

    fn complete(stream_id: u8) -> Message {
        Message::from_source(A, B, Payload::StreamComplete(StreamComplete { stream_id }))
    }

    fn sent(actions: &[StreamAction]) -> Vec<&Message> {
        actions
            .iter()
            .filter_map(|a| match a {
                StreamAction::Send(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    fn only_ack(actions: &[StreamAction]) -> StreamSequenceAck {
        let msgs = sent(actions);
        assert_eq!(msgs.len(), 1, "{actions:?}");
        match &msgs[0].payload {
            Payload::StreamSequenceAck(a) => *a,
            other => panic!("expected sequence ack, got {other:?}"),
        }
    }

    fn aborted(actions: &[StreamAction]) -> Option<StreamAnomaly> {
        actions.iter().find_map(|a| match a {
            StreamAction::Aborted { reason, .. } => Some(*reason),
            _ => None,
        })
    }

    /// Run messages between a sender (A) and receiver (B) until quiet.
    /// `lose` decides per message (in send order) whether the air loses it.
    fn pump(
        sender: &mut StreamManager,
        receiver: &mut StreamManager,
        initial: Vec<StreamAction>,
        mut lose: impl FnMut(&Message) -> bool,
    ) -> (Vec<StreamAction>, Vec<StreamAction>) {
        let mut queue: VecDeque<(NodeId, Message)> = VecDeque::new();
        let mut sender_events = Vec::new();
        let mut receiver_events = Vec::new();
        let route = |from: NodeId,
                         actions: Vec<StreamAction>,
                         queue: &mut VecDeque<(NodeId, Message)>,
                         events: &mut Vec<StreamAction>| {
            for action in actions {
                match action {
                    StreamAction::Send(mut m) => {
                        m.source = from;
                        queue.push_back((from, m));
                    }
                    other => events.push(other),
                }
            }
        };
        route(A, initial, &mut queue, &mut sender_events);
        let mut rounds = 0;
        loop {
            while let Some((from, m)) = queue.pop_front() {
                if lose(&m) {
                    continue;
                }
                if from == A {
                    let out = receiver.on_message(&m).unwrap_or_default();
                    route(B, out, &mut queue, &mut receiver_events);
                } else {
                    let out = sender.on_message(&m).unwrap_or_default();
                    route(A, out, &mut queue, &mut sender_events);
                }
            }
            if sender.outbound_count() == 0 && receiver.inbound_count() == 0 {
                break;
            }
            rounds += 1;
            assert!(rounds < 1000, "transfer never settled");
            let out = sender.tick();
            route(A, out, &mut queue, &mut sender_events);
            let out = receiver.tick();
            route(B, out, &mut queue, &mut receiver_events);
        }
        (sender_events, receiver_events)
    }

    #[test]
    fn announce_creates_session_and_acks() {
        let mut rx = StreamManager::default();
        let actions = rx.on_message(&announce(7, 0, 4)).unwrap();
        let msgs = sent(&actions);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].dest, A);
        assert_eq!(
            msgs[0].payload,
            Payload::StreamAnnounceAck(StreamAnnounceAck {
                stream_id: 7,
                sequence_number: 0
            })
        );
        assert_eq!(rx.session_status(A, 7), Some(SessionStatus::Announced));
    }

    #[test]
    fn invalid_packet_count_creates_nothing() {
        let mut rx = StreamManager::default();
        assert_eq!(
            rx.on_message(&announce(7, 0, 0)),
            Err(StreamAnomaly::InvalidAnnounce)
        );
        assert_eq!(
            rx.on_message(&announce(7, 0, 33)),
            Err(StreamAnomaly::InvalidAnnounce)
        );
        assert_eq!(rx.inbound_count(), 0);
    }

    #[test]
    fn missing_bitmap_reports_gap() {
        let mut rx = StreamManager::default();
        rx.on_message(&announce(7, 0, 4)).unwrap();
        assert!(rx.on_message(&packet(7, 0, 0, 4, b"a")).unwrap().is_empty());
        assert!(rx.on_message(&packet(7, 0, 2, 4, b"c")).unwrap().is_empty());
        let ack = only_ack(&rx.on_message(&packet(7, 0, 3, 4, b"d")).unwrap());
        assert_eq!(ack.missing_bitmap, 0b0010);
        assert_eq!(ack.status, SequenceStatus::Ok);
        assert_eq!(rx.session_status(A, 7), Some(SessionStatus::Receiving));

        let ack = only_ack(&rx.on_message(&packet(7, 0, 1, 4, b"b")).unwrap());
        assert_eq!(ack.missing_bitmap, 0);
        assert_eq!(
            rx.session_status(A, 7),
            Some(SessionStatus::AwaitingNextSequence)
        );

        let actions = rx.on_message(&complete(7)).unwrap();
        assert_eq!(
            actions,
            vec![StreamAction::Delivered {
                peer: A,
                stream_id: 7,
                stream_type: StreamType::Jpeg,
                data: b"abcd".to_vec()
            }]
        );
        assert_eq!(rx.inbound_count(), 0);
    }

    #[test]
    fn packet_without_session_is_refused() {
        let mut rx = StreamManager::default();
        assert_eq!(
            rx.on_message(&packet(7, 0, 0, 4, b"a")),
            Err(StreamAnomaly::UnknownSession)
        );
        assert_eq!(rx.on_message(&complete(7)), Err(StreamAnomaly::UnknownSession));
        assert_eq!(rx.inbound_count(), 0);
    }

    #[test]
    fn mismatched_packet_aborts_with_error_ack() {
        let mut rx = StreamManager::default();
        rx.on_message(&announce(7, 0, 4)).unwrap();
        let actions = rx.on_message(&packet(7, 0, 0, 5, b"a")).unwrap();
        assert_eq!(aborted(&actions), Some(StreamAnomaly::PacketMismatch));
        assert_eq!(only_ack(&actions).status, SequenceStatus::Error);
        assert_eq!(rx.inbound_count(), 0);

        rx.on_message(&announce(8, 0, 4)).unwrap();
        let actions = rx.on_message(&packet(8, 0, 4, 4, b"a")).unwrap();
        assert_eq!(aborted(&actions), Some(StreamAnomaly::PacketMismatch));
    }

    #[test]
    fn complete_with_missing_packets_aborts() {
        let mut rx = StreamManager::default();
        rx.on_message(&announce(7, 0, 3)).unwrap();
        rx.on_message(&packet(7, 0, 0, 3, b"a")).unwrap();
        let actions = rx.on_message(&complete(7)).unwrap();
        assert_eq!(
            aborted(&actions),
            Some(StreamAnomaly::IncompleteOnComplete { missing: 0b110 })
        );
        assert!(!actions
            .iter()
            .any(|a| matches!(a, StreamAction::Delivered { .. })));
        assert_eq!(rx.inbound_count(), 0);
    }

    #[test]
    fn duplicate_of_completed_sequence_is_reacked() {
        let mut rx = StreamManager::default();
        rx.on_message(&announce(7, 0, 2)).unwrap();
        rx.on_message(&packet(7, 0, 0, 2, b"a")).unwrap();
        rx.on_message(&packet(7, 0, 1, 2, b"b")).unwrap();
        let ack = only_ack(&rx.on_message(&packet(7, 0, 1, 2, b"b")).unwrap());
        assert_eq!(ack.missing_bitmap, 0);
        assert_eq!(ack.sequence_number, 0);
    }

    #[test]
    fn late_packet_of_earlier_sequence_ignored() {
        let mut rx = StreamManager::default();
        rx.on_message(&announce(7, 0, 1)).unwrap();
        rx.on_message(&packet(7, 0, 0, 1, b"a")).unwrap();
        rx.on_message(&announce(7, 1, 2)).unwrap();
        assert_eq!(rx.session_status(A, 7), Some(SessionStatus::Announced));
        assert!(rx.on_message(&packet(7, 0, 0, 1, b"a")).unwrap().is_empty());
        assert_eq!(rx.session_status(A, 7), Some(SessionStatus::Announced));
    }

    #[test]
    fn stale_announce_is_ignored() {
        let mut rx = StreamManager::default();
        rx.on_message(&announce(7, 0, 1)).unwrap();
        rx.on_message(&packet(7, 0, 0, 1, b"a")).unwrap();
        rx.on_message(&announce(7, 1, 1)).unwrap();
        rx.on_message(&packet(7, 1, 0, 1, b"b")).unwrap();
        rx.on_message(&announce(7, 2, 1)).unwrap();
        assert!(rx.on_message(&announce(7, 1, 1)).unwrap().is_empty());
        assert_eq!(rx.session_status(A, 7), Some(SessionStatus::Announced));
    }

    #[test]
    fn restarted_stream_replaces_session_past_first_sequence() {
        let mut rx = StreamManager::default();
        rx.on_message(&announce(1, 0, 1)).unwrap();
        rx.on_message(&packet(1, 0, 0, 1, b"a")).unwrap();
        rx.on_message(&announce(1, 1, 2)).unwrap();
        rx.on_message(&packet(1, 1, 0, 2, b"b")).unwrap();
        assert_eq!(rx.session_status(A, 1), Some(SessionStatus::Receiving));

        let actions = rx.on_message(&announce(1, 0, 4)).unwrap();
        assert_eq!(aborted(&actions), Some(StreamAnomaly::Superseded));
        let msgs = sent(&actions);
        assert_eq!(msgs.len(), 1, "{actions:?}");
        assert_eq!(
            msgs[0].payload,
            Payload::StreamAnnounceAck(StreamAnnounceAck {
                stream_id: 1,
                sequence_number: 0,
            })
        );
        assert_eq!(rx.session_status(A, 1), Some(SessionStatus::Announced));

        for i in 0..3 {
            assert!(sent(&rx.on_message(&packet(1, 0, i, 4, b"c")).unwrap()).is_empty());
        }
        let ack = only_ack(&rx.on_message(&packet(1, 0, 3, 4, b"d")).unwrap());
        assert_eq!(ack.status, SequenceStatus::Ok);
        assert_eq!(ack.missing_bitmap, 0);
    }

    #[test]
    fn duplicate_announce_keeps_progress() {
        let mut rx = StreamManager::default();
        rx.on_message(&announce(7, 0, 2)).unwrap();
        rx.on_message(&packet(7, 0, 0, 2, b"a")).unwrap();
        let actions = rx.on_message(&announce(7, 0, 2)).unwrap();
        assert_eq!(sent(&actions).len(), 1);
        let ack = only_ack(&rx.on_message(&packet(7, 0, 1, 2, b"b")).unwrap());
        assert_eq!(ack.missing_bitmap, 0);
    }

    #[test]
    fn fresh_announce_supersedes_session() {
        let mut rx = StreamManager::default();
        rx.on_message(&announce(7, 0, 2)).unwrap();
        rx.on_message(&packet(7, 0, 0, 2, b"a")).unwrap();
        let actions = rx.on_message(&announce(7, 0, 5)).unwrap();
        assert_eq!(aborted(&actions), Some(StreamAnomaly::Superseded));
        assert!(sent(&actions)
            .iter()
            .any(|m| matches!(m.payload, Payload::StreamAnnounceAck(_))));
        assert!(!sent(&actions)
            .iter()
            .any(|m| matches!(m.payload, Payload::StreamSequenceAck(_))));
        assert_eq!(rx.session_status(A, 7), Some(SessionStatus::Announced));
    }

    #[test]
    fn out_of_order_announce_without_session_refused() {
        let mut rx = StreamManager::default();
        assert_eq!(
            rx.on_message(&announce(7, 3, 2)),
            Err(StreamAnomaly::InvalidAnnounce)
        );
        assert_eq!(rx.inbound_count(), 0);
    }

    #[test]
    fn announce_clears_pending_request() {
        let mut rx = StreamManager::default();
        let req = rx.request_stream(A, StreamType::Jpeg);
        assert_eq!(req.dest, A);
        assert_eq!(req.kind(), MessageKind::StreamRequest);
        assert!(rx.has_pending_request(A));
        rx.on_message(&announce(1, 0, 1)).unwrap();
        assert!(!rx.has_pending_request(A));
    }

    #[test]
    fn unanswered_request_expires() {
        let mut rx = StreamManager::default();
        rx.request_stream(A, StreamType::Raw);
        for _ in 0..DEFAULT_IDLE_TIMEOUT_TICKS {
            rx.tick();
        }
        assert!(!rx.has_pending_request(A));
    }

    #[test]
    fn receiver_acks_on_deadline_then_gives_up() {
        let mut rx = StreamManager::default();
        rx.on_message(&announce(7, 0, 4)).unwrap();
        rx.on_message(&packet(7, 0, 0, 4, b"a")).unwrap();
        assert!(rx.tick().is_empty());
        assert!(rx.tick().is_empty());
        let ack = only_ack(&rx.tick());
        assert_eq!(ack.missing_bitmap, 0b1110);

        let mut reason = None;
        for _ in 0..(DEFAULT_ACK_TIMEOUT_TICKS * DEFAULT_MAX_RETRIES as u64) {
            let actions = rx.tick();
            if let Some(r) = aborted(&actions) {
                reason = Some(r);
                break;
            }
        }
        assert_eq!(reason, Some(StreamAnomaly::RetriesExhausted));
        assert_eq!(rx.inbound_count(), 0);
    }

    #[test]
    fn announced_session_idles_out() {
        let mut rx = StreamManager::default();
        rx.on_message(&announce(7, 0, 4)).unwrap();
        for _ in 1..DEFAULT_IDLE_TIMEOUT_TICKS {
            assert!(rx.tick().is_empty());
        }
        let actions = rx.tick();
        assert_eq!(aborted(&actions), Some(StreamAnomaly::IdleTimeout));
        assert_eq!(rx.inbound_count(), 0);
    }

    #[test]
    fn malformed_frame_aborts_its_session() {
        let mut rx = StreamManager::default();
        rx.on_message(&announce(7, 0, 4)).unwrap();
        let actions = rx.on_malformed(StreamRef {
            kind: MessageKind::StreamSequence,
            source: A,
            dest: B,
            stream_id: 7,
        });
        assert_eq!(aborted(&actions), Some(StreamAnomaly::Malformed));
        assert_eq!(rx.inbound_count(), 0);
        assert!(rx
            .on_malformed(StreamRef {
                kind: MessageKind::StreamSequence,
                source: A,
                dest: B,
                stream_id: 9,
            })
            .is_empty());
    }

    #[test]
    fn start_stream_rejects_busy_and_broadcast() {
        let mut tx = StreamManager::default();
        let (id, actions) = tx.start_stream(B, StreamType::Jpeg, b"hello").unwrap();
        assert_eq!(id, 1);
        assert_eq!(
            sent(&actions)[0].payload,
            Payload::StreamAnnounce(StreamAnnounce {
                stream_type: StreamType::Jpeg,
                stream_id: 1,
                sequence_number: 0,
                packets_in_sequence: 1,
            })
        );
        assert_eq!(
            tx.start_stream(B, StreamType::Jpeg, b"x").unwrap_err(),
            StreamAnomaly::PeerBusy
        );
        assert_eq!(
            tx.start_stream(NodeId::BROADCAST, StreamType::Jpeg, b"x")
                .unwrap_err(),
            StreamAnomaly::InvalidPeer
        );
        let (other, _) = tx.start_stream(NodeId(3), StreamType::Raw, b"x").unwrap();
        assert_eq!(other, 1);
    }

    #[test]
    fn announce_ack_sends_whole_sequence_and_nack_resends_exact_packets() {
        let mut tx = StreamManager::new(StreamConfig {
            chunk_size: 2,
            ..StreamConfig::default()
        });
        let (id, _) = tx.start_stream(B, StreamType::Raw, b"abcdefg").unwrap();
        let ack = Message::from_source(
            B,
            A,
            Payload::StreamAnnounceAck(StreamAnnounceAck {
                stream_id: id,
                sequence_number: 0,
            }),
        );
        let actions = tx.on_message(&ack).unwrap();
        assert_eq!(sent(&actions).len(), 4);
        assert_eq!(
            tx.outbound_status(B),
            Some((id, OutboundStatus::AwaitingSequenceAck))
        );

        let nack = Message::from_source(
            B,
            A,
            Payload::StreamSequenceAck(StreamSequenceAck {
                stream_id: id,
                sequence_number: 0,
                status: SequenceStatus::Ok,
                missing_bitmap: 0b0101,
            }),
        );
        let resent: Vec<u8> = sent(&tx.on_message(&nack).unwrap())
            .iter()
            .map(|m| match &m.payload {
                Payload::StreamSequence(p) => p.packet_index,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(resent, vec![0, 2]);
    }

    #[test]
    fn error_ack_aborts_sender() {
        let mut tx = StreamManager::default();
        let (id, _) = tx.start_stream(B, StreamType::Raw, b"abc").unwrap();
        let err = Message::from_source(
            B,
            A,
            Payload::StreamSequenceAck(StreamSequenceAck {
                stream_id: id,
                sequence_number: 0,
                status: SequenceStatus::Error,
                missing_bitmap: 0,
            }),
        );
        let actions = tx.on_message(&err).unwrap();
        assert_eq!(aborted(&actions), Some(StreamAnomaly::PeerReportedError));
        assert_eq!(tx.outbound_count(), 0);
    }

    #[test]
    fn unacknowledged_announce_exhausts_retries() {
        let mut tx = StreamManager::default();
        tx.start_stream(B, StreamType::Jpeg, b"abc").unwrap();
        let mut resends = 0;
        let limit = DEFAULT_ACK_TIMEOUT_TICKS * (DEFAULT_MAX_RETRIES as u64 + 1);
        for t in 1..=limit {
            let actions = tx.tick();
            if t < limit {
                assert_eq!(aborted(&actions), None, "tick {t}");
            }
            resends += sent(&actions).len();
            if t == limit {
                assert_eq!(aborted(&actions), Some(StreamAnomaly::RetriesExhausted));
            }
        }
        assert_eq!(resends, DEFAULT_MAX_RETRIES as usize);
        assert_eq!(tx.outbound_count(), 0);
    }

    #[test]
    fn multi_sequence_transfer_is_lossless() {
        let config = StreamConfig {
            chunk_size: 4,
            ..StreamConfig::default()
        };
        let mut tx = StreamManager::new(config);
        let mut rx = StreamManager::new(config);
        let data: Vec<u8> = (0..300u32).map(|i| (i * 7) as u8).collect();
        let (id, initial) = tx.start_stream(B, StreamType::Jpeg, &data).unwrap();
        let (tx_events, rx_events) = pump(&mut tx, &mut rx, initial, |_| false);
        assert_eq!(tx_events, vec![StreamAction::Sent { peer: B, stream_id: id }]);
        assert_eq!(
            rx_events,
            vec![StreamAction::Delivered {
                peer: A,
                stream_id: id,
                stream_type: StreamType::Jpeg,
                data
            }]
        );
    }

    #[test]
    fn lossy_transfer_recovers() {
        let config = StreamConfig {
            chunk_size: 8,
            max_retries: 20,
            ..StreamConfig::default()
        };
        let mut tx = StreamManager::new(config);
        let mut rx = StreamManager::new(config);
        let data: Vec<u8> = (0..500u32).map(|i| i as u8).collect();
        let (_, initial) = tx.start_stream(B, StreamType::Raw, &data).unwrap();
        // lose every third frame in either direction; Stream-Complete is never acked
        let mut n = 0u32;
        let (_, rx_events) = pump(&mut tx, &mut rx, initial, |m| {
            if m.kind() == MessageKind::StreamComplete {
                return false;
            }
            n += 1;
            n % 3 == 0
        });
        match rx_events.as_slice() {
            [StreamAction::Delivered { data: got, .. }] => assert_eq!(got, &data),
            other => panic!("expected delivery, got {other:?}"),
        }
    }

    #[test]
    fn lost_complete_ends_in_idle_timeout() {
        let mut tx = StreamManager::default();
        let mut rx = StreamManager::default();
        let (_, initial) = tx.start_stream(B, StreamType::Raw, b"xyz").unwrap();
        let (tx_events, rx_events) = pump(&mut tx, &mut rx, initial, |m| {
            m.kind() == MessageKind::StreamComplete
        });
        assert!(matches!(tx_events.as_slice(), [StreamAction::Sent { .. }]));
        assert_eq!(aborted(&rx_events), Some(StreamAnomaly::IdleTimeout));
    }

    #[test]
    fn empty_stream_is_delivered() {
        let mut tx = StreamManager::default();
        let mut rx = StreamManager::default();
        let (_, initial) = tx.start_stream(B, StreamType::Raw, &[]).unwrap();
        let (_, rx_events) = pump(&mut tx, &mut rx, initial, |_| false);
        match rx_events.as_slice() {
            [StreamAction::Delivered { data, .. }] => assert!(data.is_empty()),
            other => panic!("expected delivery, got {other:?}"),
        }
    }
}
