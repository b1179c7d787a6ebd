//! Dispatch engine: owns the node identity, the radio and the stream state; routes inbound
//! messages to the application `Handler`.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::protocol::{
    CommandRequest, CommandResponse, CommandType, Data, DataRequest, DataType, FrameBuffer,
    Message, Metadata, NodeId, Payload, StreamAnnounce, StreamAnnounceAck, StreamComplete,
    StreamRequest, StreamSequence, StreamSequenceAck, StreamType, MAX_CHUNK_SIZE,
    MAX_DRIVER_FRAME, MAX_FRAME_SIZE,
};
use crate::radio::RadioDriver;
use crate::stream::{StreamAction, StreamAnomaly, StreamConfig, StreamManager};
use crate::wire;

/// Default time the driver may spend on one transmission.
pub const DEFAULT_TRANSMIT_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub transmit_timeout: Duration,
    pub stream: StreamConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transmit_timeout: DEFAULT_TRANSMIT_TIMEOUT,
            stream: StreamConfig::default(),
        }
    }
}

/// Application logic. One method per message kind plus stream lifecycle events;
/// every method defaults to ignoring the event.
///
/// Handlers run to completion inside the processing loop. Replies and follow-ups go
/// through the `Link`; never block waiting for a radio round trip.
#[allow(unused_variables)]
pub trait Handler {
    fn on_raw(&mut self, link: &mut Link<'_>, meta: &Metadata, data: &[u8; MAX_CHUNK_SIZE]) {}

    fn on_ping_request(&mut self, link: &mut Link<'_>, meta: &Metadata) {}

    fn on_ping_response(&mut self, link: &mut Link<'_>, meta: &Metadata) {}

    fn on_data_request(&mut self, link: &mut Link<'_>, meta: &Metadata, req: &DataRequest) {}

    fn on_data(&mut self, link: &mut Link<'_>, meta: &Metadata, data: &Data) {}

    fn on_command_request(&mut self, link: &mut Link<'_>, meta: &Metadata, req: &CommandRequest) {}

    fn on_command_response(
        &mut self,
        link: &mut Link<'_>,
        meta: &Metadata,
        resp: &CommandResponse,
    ) {
    }

    /// A peer asks us to stream; answer with `link.start_stream`.
    fn on_stream_request(&mut self, link: &mut Link<'_>, meta: &Metadata, req: &StreamRequest) {}

    fn on_stream_announce(&mut self, link: &mut Link<'_>, meta: &Metadata, a: &StreamAnnounce) {}

    fn on_stream_announce_ack(
        &mut self,
        link: &mut Link<'_>,
        meta: &Metadata,
        ack: &StreamAnnounceAck,
    ) {
    }

    fn on_stream_sequence(&mut self, link: &mut Link<'_>, meta: &Metadata, p: &StreamSequence) {}

    fn on_stream_sequence_ack(
        &mut self,
        link: &mut Link<'_>,
        meta: &Metadata,
        ack: &StreamSequenceAck,
    ) {
    }

    fn on_stream_complete(&mut self, link: &mut Link<'_>, meta: &Metadata, c: &StreamComplete) {}

    /// Every sequence of an inbound stream arrived and Stream-Complete was received.
    fn on_stream_received(
        &mut self,
        link: &mut Link<'_>,
        peer: NodeId,
        stream_id: u8,
        stream_type: StreamType,
        data: Vec<u8>,
    ) {
    }

    fn on_stream_aborted(
        &mut self,
        link: &mut Link<'_>,
        peer: NodeId,
        stream_id: u8,
        reason: StreamAnomaly,
    ) {
    }

    /// Our outbound stream was fully acknowledged.
    fn on_stream_sent(&mut self, link: &mut Link<'_>, peer: NodeId, stream_id: u8) {}
}

/// No handlers: every message is dropped after address filtering and stream accounting.
impl Handler for () {}

/// Send surface handed to handlers while the engine is dispatching.
pub struct Link<'a> {
    local_id: NodeId,
    radio: &'a mut dyn RadioDriver,
    streams: &'a mut StreamManager,
    timeout: Duration,
}

impl Link<'_> {
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn send(&mut self, msg: Message) -> Result<()> {
        transmit(self.local_id, self.radio, msg, self.timeout)
    }

    pub fn send_with_timeout(&mut self, msg: Message, timeout: Duration) -> Result<()> {
        transmit(self.local_id, self.radio, msg, timeout)
    }

    /// Send `payload` back to the sender of the message described by `meta`.
    pub fn reply(&mut self, meta: &Metadata, payload: Payload) -> Result<()> {
        self.send(Message::new(meta.source, payload))
    }

    pub fn send_ping(&mut self, dest: NodeId) -> Result<()> {
        self.send(Message::new(dest, Payload::PingRequest))
    }

    pub fn request_stream(&mut self, peer: NodeId, stream_type: StreamType) -> Result<()> {
        let msg = self.streams.request_stream(peer, stream_type);
        self.send(msg)
    }

    /// Start streaming `data` to `peer`; returns the stream id.
    pub fn start_stream(
        &mut self,
        peer: NodeId,
        stream_type: StreamType,
        data: &[u8],
    ) -> Result<u8> {
        let (stream_id, actions) = self.streams.start_stream(peer, stream_type, data)?;
        for action in actions {
            if let StreamAction::Send(msg) = action {
                self.send(msg)?;
            }
        }
        Ok(stream_id)
    }
}

/// Stamp, encode and hand one message to the driver.
fn transmit(
    local_id: NodeId,
    radio: &mut dyn RadioDriver,
    mut msg: Message,
    timeout: Duration,
) -> Result<()> {
    if msg.source.is_unset() {
        msg.source = local_id;
    }
    let needed = wire::encoded_len(&msg);
    if needed > MAX_DRIVER_FRAME {
        return Err(Error::FrameTooLong(needed));
    }
    let mut buf: FrameBuffer = [0u8; MAX_FRAME_SIZE];
    let n = wire::encode(&msg, &mut buf)?;
    radio.transmit(&buf[..n], timeout)?;
    tracing::trace!(kind = ?msg.kind(), dest = %msg.dest, len = n, "frame sent");
    Ok(())
}

pub struct Engine<D: RadioDriver, H: Handler> {
    local_id: NodeId,
    radio: D,
    handler: H,
    streams: StreamManager,
    config: EngineConfig,
}

impl<D: RadioDriver, H: Handler> Engine<D, H> {
    pub fn new(local_id: NodeId, radio: D, handler: H) -> Self {
        Self::with_config(local_id, radio, handler, EngineConfig::default())
    }

    pub fn with_config(local_id: NodeId, radio: D, handler: H, config: EngineConfig) -> Self {
        Self {
            local_id,
            radio,
            handler,
            streams: StreamManager::new(config.stream),
            config,
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn radio(&self) -> &D {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut D {
        &mut self.radio
    }

    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    /// Send with the configured transmit timeout. An unset source becomes the local id.
    pub fn send(&mut self, msg: Message) -> Result<()> {
        let timeout = self.config.transmit_timeout;
        self.send_with_timeout(msg, timeout)
    }

    pub fn send_with_timeout(&mut self, msg: Message, timeout: Duration) -> Result<()> {
        transmit(self.local_id, &mut self.radio, msg, timeout)
    }

    pub fn send_ping(&mut self, dest: NodeId) -> Result<()> {
        self.send(Message::new(dest, Payload::PingRequest))
    }

    pub fn send_data_request(&mut self, dest: NodeId, data_type: DataType) -> Result<()> {
        self.send(Message::new(
            dest,
            Payload::DataRequest(DataRequest { data_type }),
        ))
    }

    pub fn send_command(&mut self, dest: NodeId, command_type: CommandType, value: u8) -> Result<()> {
        self.send(Message::new(
            dest,
            Payload::CommandRequest(CommandRequest {
                command_type,
                value,
            }),
        ))
    }

    pub fn request_stream(&mut self, peer: NodeId, stream_type: StreamType) -> Result<()> {
        let (mut link, _) = self.split();
        link.request_stream(peer, stream_type)
    }

    pub fn start_stream(&mut self, peer: NodeId, stream_type: StreamType, data: &[u8]) -> Result<u8> {
        let (mut link, _) = self.split();
        link.start_stream(peer, stream_type, data)
    }

    fn split(&mut self) -> (Link<'_>, &mut H) {
        let link = Link {
            local_id: self.local_id,
            radio: &mut self.radio,
            streams: &mut self.streams,
            timeout: self.config.transmit_timeout,
        };
        (link, &mut self.handler)
    }

    /// Address-filter, account stream kinds, then dispatch to the handler.
    pub fn handle_message(&mut self, msg: Message) {
        if msg.dest != self.local_id && !msg.dest.is_broadcast() {
            tracing::trace!(kind = ?msg.kind(), source = %msg.source, dest = %msg.dest, "not for us");
            return;
        }
        if msg.kind().is_stream() {
            match self.streams.on_message(&msg) {
                Ok(actions) => self.execute(actions),
                Err(anomaly) => tracing::debug!(
                    kind = ?msg.kind(),
                    source = %msg.source,
                    %anomaly,
                    "stream frame dropped"
                ),
            }
        }

        let meta = msg.metadata();
        let (mut link, handler) = self.split();
        let link = &mut link;
        match &msg.payload {
            Payload::Raw(data) => handler.on_raw(link, &meta, data),
            Payload::PingRequest => handler.on_ping_request(link, &meta),
            Payload::PingResponse => handler.on_ping_response(link, &meta),
            Payload::DataRequest(r) => handler.on_data_request(link, &meta, r),
            Payload::Data(d) => handler.on_data(link, &meta, d),
            Payload::CommandRequest(r) => handler.on_command_request(link, &meta, r),
            Payload::CommandResponse(r) => handler.on_command_response(link, &meta, r),
            Payload::StreamRequest(r) => handler.on_stream_request(link, &meta, r),
            Payload::StreamAnnounce(a) => handler.on_stream_announce(link, &meta, a),
            Payload::StreamAnnounceAck(a) => handler.on_stream_announce_ack(link, &meta, a),
            Payload::StreamSequence(p) => handler.on_stream_sequence(link, &meta, p),
            Payload::StreamSequenceAck(a) => handler.on_stream_sequence_ack(link, &meta, a),
            Payload::StreamComplete(c) => handler.on_stream_complete(link, &meta, c),
        }
    }

    /// Decode and handle one received frame. Malformed frames are dropped after
    /// aborting the stream session they belong to.
    pub fn process_frame(&mut self, bytes: &[u8]) {
        match wire::decode(bytes) {
            Ok(msg) => self.handle_message(msg),
            Err(e) => {
                tracing::warn!(error = %e, len = bytes.len(), "dropping malformed frame");
                let Some(r) = wire::peek_stream(bytes) else {
                    return;
                };
                if r.dest == self.local_id || r.dest.is_broadcast() {
                    let actions = self.streams.on_malformed(r);
                    self.execute(actions);
                }
            }
        }
    }

    /// Drain every frame the driver has ready, in arrival order. Returns how many were processed.
    pub fn poll(&mut self) -> Result<usize> {
        let mut buf = [0u8; MAX_DRIVER_FRAME];
        let mut processed = 0;
        while let Some(n) = self.radio.receive(&mut buf)? {
            self.process_frame(&buf[..n]);
            processed += 1;
        }
        Ok(processed)
    }

    /// Advance the stream clock one tick: ack deadlines, retransmission, idle expiry.
    pub fn tick(&mut self) {
        let actions = self.streams.tick();
        self.execute(actions);
    }

    fn execute(&mut self, actions: Vec<StreamAction>) {
        for action in actions {
            let (mut link, handler) = self.split();
            match action {
                StreamAction::Send(msg) => {
                    if let Err(e) = link.send(msg) {
                        tracing::warn!(error = %e, "stream frame not sent");
                    }
                }
                StreamAction::Delivered {
                    peer,
                    stream_id,
                    stream_type,
                    data,
                } => {
                    tracing::info!(peer = %peer, stream_id, bytes = data.len(), "stream received");
                    handler.on_stream_received(&mut link, peer, stream_id, stream_type, data);
                }
                StreamAction::Aborted {
                    peer,
                    stream_id,
                    reason,
                } => handler.on_stream_aborted(&mut link, peer, stream_id, reason),
                StreamAction::Sent { peer, stream_id } => {
                    tracing::info!(peer = %peer, stream_id, "stream sent");
                    handler.on_stream_sent(&mut link, peer, stream_id);
                }
            }
        }
    }
}
