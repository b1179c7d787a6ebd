//! Link protocol: node addressing, message kinds and typed payloads.

use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

use crate::wire::DecodeError;

/// Protocol revision: 128-byte chunks, announce/ack/complete cycle with missing-bitmap acks.
/// Nodes running different revisions cannot talk to each other.
pub const PROTOCOL_VERSION: u8 = 2;

/// Largest chunk carried by one Stream-Sequence frame. Must match on every node.
pub const MAX_CHUNK_SIZE: usize = 128;

/// Packets per sequence; one bit each in the 32-bit missing bitmap.
pub const MAX_PACKETS_PER_SEQUENCE: usize = 32;

/// kind + source + dest.
pub const HEADER_SIZE: usize = 3;

/// stream_type, stream_id, sequence_number (2), packet_index, packets_in_sequence, chunk_len.
pub const SEQUENCE_HEADER_SIZE: usize = 7;

/// Worst-case encoded message: a Stream-Sequence carrying a full chunk.
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + SEQUENCE_HEADER_SIZE + MAX_CHUNK_SIZE;

/// The driver takes the frame length as a single byte.
pub const MAX_DRIVER_FRAME: usize = 255;

const_assert!(MAX_FRAME_SIZE <= MAX_DRIVER_FRAME);
const_assert!(MAX_PACKETS_PER_SEQUENCE <= u32::BITS as usize);

/// Stack buffer large enough for any encoded message.
pub type FrameBuffer = [u8; MAX_FRAME_SIZE];

/// Single-byte node address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u8);

impl NodeId {
    /// Delivered to every listening node.
    pub const BROADCAST: NodeId = NodeId(0xFF);
    /// "Fill with the local id at send time."
    pub const UNSET: NodeId = NodeId(0x00);

    pub fn as_u8(self) -> u8 {
        self.0
    }

    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }

    pub fn is_unset(self) -> bool {
        self == Self::UNSET
    }
}

impl From<u8> for NodeId {
    fn from(v: u8) -> Self {
        NodeId(v)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Declares a `#[repr(u8)]` field enum with checked conversion from its wire byte.
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident : $field:literal { $($variant:ident = $value:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($variant = $value),+
        }

        impl TryFrom<u8> for $name {
            type Error = DecodeError;

            fn try_from(value: u8) -> Result<Self, DecodeError> {
                match value {
                    $($value => Ok($name::$variant),)+
                    other => Err(DecodeError::InvalidField {
                        field: $field,
                        value: other,
                    }),
                }
            }
        }

        impl From<$name> for u8 {
            fn from(v: $name) -> u8 {
                v as u8
            }
        }
    };
}

wire_enum! {
    /// Kind of sensor reading carried by Data / requested by Data-Request.
    DataType: "data_type" { Climate = 1 }
}

wire_enum! {
    CommandType: "command_type" { Trigger = 0, SetValue = 1 }
}

wire_enum! {
    CommandStatus: "command_status" { Error = 0, Success = 1 }
}

wire_enum! {
    /// Content type of a stream, chosen by the requester.
    StreamType: "stream_type" { Jpeg = 0, Raw = 1 }
}

wire_enum! {
    /// Receiver verdict carried in a Stream-Sequence-Ack.
    SequenceStatus: "sequence_status" { Ok = 0, Error = 1 }
}

/// Wire discriminant of a message. The byte values are the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    Raw = 0,
    PingRequest = 1,
    PingResponse = 2,
    DataRequest = 3,
    Data = 4,
    CommandRequest = 5,
    CommandResponse = 6,
    StreamRequest = 7,
    StreamAnnounce = 8,
    StreamAnnounceAck = 9,
    StreamSequence = 10,
    StreamSequenceAck = 11,
    StreamComplete = 12,
}

impl MessageKind {
    /// Kinds consumed by the stream-transfer state machine.
    pub fn is_stream(self) -> bool {
        matches!(
            self,
            MessageKind::StreamAnnounce
                | MessageKind::StreamAnnounceAck
                | MessageKind::StreamSequence
                | MessageKind::StreamSequenceAck
                | MessageKind::StreamComplete
        )
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, DecodeError> {
        Ok(match value {
            0 => MessageKind::Raw,
            1 => MessageKind::PingRequest,
            2 => MessageKind::PingResponse,
            3 => MessageKind::DataRequest,
            4 => MessageKind::Data,
            5 => MessageKind::CommandRequest,
            6 => MessageKind::CommandResponse,
            7 => MessageKind::StreamRequest,
            8 => MessageKind::StreamAnnounce,
            9 => MessageKind::StreamAnnounceAck,
            10 => MessageKind::StreamSequence,
            11 => MessageKind::StreamSequenceAck,
            12 => MessageKind::StreamComplete,
            other => return Err(DecodeError::UnknownKind(other)),
        })
    }
}

impl From<MessageKind> for u8 {
    fn from(k: MessageKind) -> u8 {
        k as u8
    }
}

/// Temperature and relative humidity, both in tenths (253 = 25.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClimateData {
    pub temperature_tenths: i16,
    pub humidity_tenths: i16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataRequest {
    pub data_type: DataType,
}

/// Sensor reading. The variant selects the data type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Data {
    Climate(ClimateData),
}

impl Data {
    pub fn data_type(&self) -> DataType {
        match self {
            Data::Climate(_) => DataType::Climate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandRequest {
    pub command_type: CommandType,
    /// Argument for SetValue; carried but unused for Trigger.
    pub value: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandResponse {
    pub command_type: CommandType,
    pub status: CommandStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRequest {
    pub stream_type: StreamType,
}

/// Declares the next sequence of a stream. Sent in reply to a Stream-Request or unsolicited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamAnnounce {
    pub stream_type: StreamType,
    pub stream_id: u8,
    pub sequence_number: u16,
    pub packets_in_sequence: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamAnnounceAck {
    pub stream_id: u8,
    pub sequence_number: u16,
}

/// One chunk of a sequence. `chunk.len()` is the on-wire `chunk_len`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSequence {
    pub stream_type: StreamType,
    pub stream_id: u8,
    pub sequence_number: u16,
    /// 0 ..= packets_in_sequence - 1
    pub packet_index: u8,
    pub packets_in_sequence: u8,
    pub chunk: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamSequenceAck {
    pub stream_id: u8,
    pub sequence_number: u16,
    pub status: SequenceStatus,
    /// Bit i set: packet i of the sequence has not been received.
    pub missing_bitmap: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamComplete {
    pub stream_id: u8,
}

/// Kind-specific body of a message. The variant is the kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Untyped block, always `MAX_CHUNK_SIZE` bytes on the wire.
    Raw([u8; MAX_CHUNK_SIZE]),
    PingRequest,
    PingResponse,
    DataRequest(DataRequest),
    Data(Data),
    CommandRequest(CommandRequest),
    CommandResponse(CommandResponse),
    StreamRequest(StreamRequest),
    StreamAnnounce(StreamAnnounce),
    StreamAnnounceAck(StreamAnnounceAck),
    StreamSequence(StreamSequence),
    StreamSequenceAck(StreamSequenceAck),
    StreamComplete(StreamComplete),
}

impl Payload {
    pub fn kind(&self) -> MessageKind {
        match self {
            Payload::Raw(_) => MessageKind::Raw,
            Payload::PingRequest => MessageKind::PingRequest,
            Payload::PingResponse => MessageKind::PingResponse,
            Payload::DataRequest(_) => MessageKind::DataRequest,
            Payload::Data(_) => MessageKind::Data,
            Payload::CommandRequest(_) => MessageKind::CommandRequest,
            Payload::CommandResponse(_) => MessageKind::CommandResponse,
            Payload::StreamRequest(_) => MessageKind::StreamRequest,
            Payload::StreamAnnounce(_) => MessageKind::StreamAnnounce,
            Payload::StreamAnnounceAck(_) => MessageKind::StreamAnnounceAck,
            Payload::StreamSequence(_) => MessageKind::StreamSequence,
            Payload::StreamSequenceAck(_) => MessageKind::StreamSequenceAck,
            Payload::StreamComplete(_) => MessageKind::StreamComplete,
        }
    }
}

/// Sender and addressee of a message, handed to handlers alongside the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    pub source: NodeId,
    pub dest: NodeId,
}

/// One frame's worth of protocol data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub source: NodeId,
    pub dest: NodeId,
    pub payload: Payload,
}

impl Message {
    /// Message with an unset source; the engine stamps its own id when sending.
    pub fn new(dest: NodeId, payload: Payload) -> Self {
        Self {
            source: NodeId::UNSET,
            dest,
            payload,
        }
    }

    /// Message sent on behalf of `source` (e.g. a relay keeping the original sender).
    pub fn from_source(source: NodeId, dest: NodeId, payload: Payload) -> Self {
        Self {
            source,
            dest,
            payload,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    pub fn metadata(&self) -> Metadata {
        Metadata {
            source: self.source,
            dest: self.dest,
        }
    }
}
