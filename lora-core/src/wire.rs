//! Framing: 3-byte header (kind, source, dest) + fixed-layout payload per kind.
//! All multi-byte integers are little-endian. Every read is bounds-checked against the slice.

use crate::protocol::{
    ClimateData, CommandRequest, CommandResponse, Data, DataRequest, DataType, Message,
    MessageKind, NodeId, Payload, StreamAnnounce, StreamAnnounceAck, StreamComplete,
    StreamRequest, StreamSequence, StreamSequenceAck, HEADER_SIZE, MAX_CHUNK_SIZE,
    MAX_FRAME_SIZE, SEQUENCE_HEADER_SIZE,
};

/// Error decoding a frame. The frame is rejected whole; nothing is partially applied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("unknown message kind {0}")]
    UnknownKind(u8),
    #[error("chunk_len {0} exceeds maximum {MAX_CHUNK_SIZE}")]
    ChunkTooLarge(u8),
    #[error("invalid {field} value {value}")]
    InvalidField { field: &'static str, value: u8 },
}

/// Error encoding a message. Nothing is written when encoding fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("buffer too small: need {needed} bytes, capacity {capacity}")]
    BufferTooSmall { needed: usize, capacity: usize },
    #[error("chunk of {0} bytes exceeds maximum {MAX_CHUNK_SIZE}")]
    ChunkTooLarge(usize),
}

/// Exact number of bytes `encode` writes for `msg`.
pub fn encoded_len(msg: &Message) -> usize {
    HEADER_SIZE + payload_len(&msg.payload)
}

fn payload_len(payload: &Payload) -> usize {
    match payload {
        Payload::Raw(_) => MAX_CHUNK_SIZE,
        Payload::PingRequest | Payload::PingResponse => 0,
        Payload::DataRequest(_) => 1,
        Payload::Data(Data::Climate(_)) => 1 + 4,
        Payload::CommandRequest(_) | Payload::CommandResponse(_) => 2,
        Payload::StreamRequest(_) => 1,
        Payload::StreamAnnounce(_) => 1 + 1 + 2 + 1,
        Payload::StreamAnnounceAck(_) => 1 + 2,
        Payload::StreamSequence(s) => SEQUENCE_HEADER_SIZE + s.chunk.len(),
        Payload::StreamSequenceAck(_) => 1 + 2 + 1 + 4,
        Payload::StreamComplete(_) => 1,
    }
}

/// Encode `msg` into the front of `buf`. Returns the number of bytes written.
/// Fails without touching `buf` if the message does not fit.
pub fn encode(msg: &Message, buf: &mut [u8]) -> Result<usize, EncodeError> {
    if let Payload::StreamSequence(s) = &msg.payload {
        if s.chunk.len() > MAX_CHUNK_SIZE {
            return Err(EncodeError::ChunkTooLarge(s.chunk.len()));
        }
    }
    let needed = encoded_len(msg);
    if buf.len() < needed {
        return Err(EncodeError::BufferTooSmall {
            needed,
            capacity: buf.len(),
        });
    }

    let mut w = Writer::new(&mut buf[..needed]);
    w.u8(msg.kind().into());
    w.u8(msg.source.as_u8());
    w.u8(msg.dest.as_u8());

    match &msg.payload {
        Payload::Raw(raw) => w.bytes(raw),
        Payload::PingRequest | Payload::PingResponse => {}
        Payload::DataRequest(r) => w.u8(r.data_type.into()),
        Payload::Data(d) => {
            w.u8(d.data_type().into());
            match d {
                Data::Climate(c) => {
                    w.i16(c.temperature_tenths);
                    w.i16(c.humidity_tenths);
                }
            }
        }
        Payload::CommandRequest(c) => {
            w.u8(c.command_type.into());
            w.u8(c.value);
        }
        Payload::CommandResponse(c) => {
            w.u8(c.command_type.into());
            w.u8(c.status.into());
        }
        Payload::StreamRequest(r) => w.u8(r.stream_type.into()),
        Payload::StreamAnnounce(a) => {
            w.u8(a.stream_type.into());
            w.u8(a.stream_id);
            w.u16(a.sequence_number);
            w.u8(a.packets_in_sequence);
        }
        Payload::StreamAnnounceAck(a) => {
            w.u8(a.stream_id);
            w.u16(a.sequence_number);
        }
        Payload::StreamSequence(s) => {
            w.u8(s.stream_type.into());
            w.u8(s.stream_id);
            w.u16(s.sequence_number);
            w.u8(s.packet_index);
            w.u8(s.packets_in_sequence);
            // checked against MAX_CHUNK_SIZE above
            w.u8(s.chunk.len() as u8);
            w.bytes(&s.chunk);
        }
        Payload::StreamSequenceAck(a) => {
            w.u8(a.stream_id);
            w.u16(a.sequence_number);
            w.u8(a.status.into());
            w.u32(a.missing_bitmap);
        }
        Payload::StreamComplete(c) => w.u8(c.stream_id),
    }
    debug_assert_eq!(w.pos, needed);
    Ok(needed)
}

/// Encode into a fresh vector sized to the message.
pub fn encode_to_vec(msg: &Message) -> Result<Vec<u8>, EncodeError> {
    let mut buf = [0u8; MAX_FRAME_SIZE];
    let n = encode(msg, &mut buf)?;
    Ok(buf[..n].to_vec())
}

/// Decode one message from `bytes`. The slice length is the frame length; bytes past the
/// kind's layout are ignored.
pub fn decode(bytes: &[u8]) -> Result<Message, DecodeError> {
    let mut r = Reader::new(bytes);
    let kind = MessageKind::try_from(r.u8()?)?;
    let source = NodeId(r.u8()?);
    let dest = NodeId(r.u8()?);

    let payload = match kind {
        MessageKind::Raw => {
            let mut raw = [0u8; MAX_CHUNK_SIZE];
            raw.copy_from_slice(r.take(MAX_CHUNK_SIZE)?);
            Payload::Raw(raw)
        }
        MessageKind::PingRequest => Payload::PingRequest,
        MessageKind::PingResponse => Payload::PingResponse,
        MessageKind::DataRequest => Payload::DataRequest(DataRequest {
            data_type: r.u8()?.try_into()?,
        }),
        MessageKind::Data => {
            let data_type: DataType = r.u8()?.try_into()?;
            match data_type {
                DataType::Climate => Payload::Data(Data::Climate(ClimateData {
                    temperature_tenths: r.i16()?,
                    humidity_tenths: r.i16()?,
                })),
            }
        }
        MessageKind::CommandRequest => Payload::CommandRequest(CommandRequest {
            command_type: r.u8()?.try_into()?,
            value: r.u8()?,
        }),
        MessageKind::CommandResponse => Payload::CommandResponse(CommandResponse {
            command_type: r.u8()?.try_into()?,
            status: r.u8()?.try_into()?,
        }),
        MessageKind::StreamRequest => Payload::StreamRequest(StreamRequest {
            stream_type: r.u8()?.try_into()?,
        }),
        MessageKind::StreamAnnounce => Payload::StreamAnnounce(StreamAnnounce {
            stream_type: r.u8()?.try_into()?,
            stream_id: r.u8()?,
            sequence_number: r.u16()?,
            packets_in_sequence: r.u8()?,
        }),
        MessageKind::StreamAnnounceAck => Payload::StreamAnnounceAck(StreamAnnounceAck {
            stream_id: r.u8()?,
            sequence_number: r.u16()?,
        }),
        MessageKind::StreamSequence => {
            let stream_type = r.u8()?.try_into()?;
            let stream_id = r.u8()?;
            let sequence_number = r.u16()?;
            let packet_index = r.u8()?;
            let packets_in_sequence = r.u8()?;
            let chunk_len = r.u8()?;
            if chunk_len as usize > MAX_CHUNK_SIZE {
                return Err(DecodeError::ChunkTooLarge(chunk_len));
            }
            let chunk = r.take(chunk_len as usize)?.to_vec();
            Payload::StreamSequence(StreamSequence {
                stream_type,
                stream_id,
                sequence_number,
                packet_index,
                packets_in_sequence,
                chunk,
            })
        }
        MessageKind::StreamSequenceAck => Payload::StreamSequenceAck(StreamSequenceAck {
            stream_id: r.u8()?,
            sequence_number: r.u16()?,
            status: r.u8()?.try_into()?,
            missing_bitmap: r.u32()?,
        }),
        MessageKind::StreamComplete => Payload::StreamComplete(StreamComplete {
            stream_id: r.u8()?,
        }),
    };

    Ok(Message {
        source,
        dest,
        payload,
    })
}

/// Header fields and stream id of a stream-kind frame, read without decoding the rest.
/// Lets the engine attribute a malformed stream frame to its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRef {
    pub kind: MessageKind,
    pub source: NodeId,
    pub dest: NodeId,
    pub stream_id: u8,
}

pub fn peek_stream(bytes: &[u8]) -> Option<StreamRef> {
    let kind = MessageKind::try_from(*bytes.first()?).ok()?;
    let offset = match kind {
        // stream_type precedes stream_id
        MessageKind::StreamAnnounce | MessageKind::StreamSequence => HEADER_SIZE + 1,
        MessageKind::StreamAnnounceAck
        | MessageKind::StreamSequenceAck
        | MessageKind::StreamComplete => HEADER_SIZE,
        _ => return None,
    };
    Some(StreamRef {
        kind,
        source: NodeId(*bytes.get(1)?),
        dest: NodeId(*bytes.get(2)?),
        stream_id: *bytes.get(offset)?,
    })
}

/// Bounds-checked cursor over an input frame.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(DecodeError::Truncated {
                needed: end,
                available: self.buf.len(),
            });
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn i16(&mut self) -> Result<i16, DecodeError> {
        let b = self.take(2)?;
        Ok(i16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}

/// Cursor over an output slice already sized to the exact encoded length.
struct Writer<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> Writer<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, src: &[u8]) {
        self.buf[self.pos..self.pos + src.len()].copy_from_slice(src);
        self.pos += src.len();
    }

    fn u8(&mut self, v: u8) {
        self.bytes(&[v]);
    }

    fn u16(&mut self, v: u16) {
        self.bytes(&v.to_le_bytes());
    }

    fn i16(&mut self, v: i16) {
        self.bytes(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CommandStatus, CommandType, SequenceStatus, StreamType};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn msg(source: u8, dest: u8, payload: Payload) -> Message {
        Message::from_source(NodeId(source), NodeId(dest), payload)
    }

    fn sequence(chunk: Vec<u8>) -> Payload {
        Payload::StreamSequence(StreamSequence {
            stream_type: StreamType::Jpeg,
            stream_id: 7,
            sequence_number: 0x0c01,
            packet_index: 3,
            packets_in_sequence: 9,
            chunk,
        })
    }

    fn one_of_each_kind() -> Vec<Message> {
        let mut raw = [0u8; MAX_CHUNK_SIZE];
        for (i, b) in raw.iter_mut().enumerate() {
            *b = i as u8;
        }
        vec![
            msg(1, 2, Payload::Raw(raw)),
            msg(1, 2, Payload::PingRequest),
            msg(2, 1, Payload::PingResponse),
            msg(3, 4, Payload::DataRequest(DataRequest {
                data_type: DataType::Climate,
            })),
            msg(5, 6, Payload::Data(Data::Climate(ClimateData {
                temperature_tenths: -105,
                humidity_tenths: 999,
            }))),
            msg(3, 99, Payload::CommandRequest(CommandRequest {
                command_type: CommandType::SetValue,
                value: 42,
            })),
            msg(99, 3, Payload::CommandResponse(CommandResponse {
                command_type: CommandType::Trigger,
                status: CommandStatus::Success,
            })),
            msg(8, 9, Payload::StreamRequest(StreamRequest {
                stream_type: StreamType::Raw,
            })),
            msg(9, 8, Payload::StreamAnnounce(StreamAnnounce {
                stream_type: StreamType::Jpeg,
                stream_id: 7,
                sequence_number: 513,
                packets_in_sequence: 32,
            })),
            msg(8, 9, Payload::StreamAnnounceAck(StreamAnnounceAck {
                stream_id: 7,
                sequence_number: 513,
            })),
            msg(9, 8, sequence(vec![0xAB; MAX_CHUNK_SIZE])),
            msg(9, 8, sequence(Vec::new())),
            msg(8, 9, Payload::StreamSequenceAck(StreamSequenceAck {
                stream_id: 7,
                sequence_number: 513,
                status: SequenceStatus::Ok,
                missing_bitmap: 0x8000_0002,
            })),
            msg(9, 0xff, Payload::StreamComplete(StreamComplete { stream_id: 7 })),
        ]
    }

    #[test]
    fn roundtrip_every_kind() {
        for m in one_of_each_kind() {
            let mut buf = [0u8; MAX_FRAME_SIZE];
            let n = encode(&m, &mut buf).unwrap();
            assert_eq!(n, encoded_len(&m));
            let decoded = decode(&buf[..n]).unwrap();
            assert_eq!(decoded, m, "kind {:?}", m.kind());
        }
    }

    #[test]
    fn ping_is_header_only() {
        let m = msg(1, 2, Payload::PingRequest);
        let frame = encode_to_vec(&m).unwrap();
        assert_eq!(frame, vec![1, 1, 2]);
        let decoded = decode(&frame).unwrap();
        assert_eq!(decoded.kind(), MessageKind::PingRequest);
        assert_eq!(decoded.source, NodeId(1));
        assert_eq!(decoded.dest, NodeId(2));
    }

    #[test]
    fn climate_data_is_eight_bytes() {
        let m = msg(5, 6, Payload::Data(Data::Climate(ClimateData {
            temperature_tenths: 253,
            humidity_tenths: 512,
        })));
        let frame = encode_to_vec(&m).unwrap();
        assert_eq!(frame.len(), 8);
        assert_eq!(frame, vec![4, 5, 6, 1, 253, 0, 0, 2]);
        match decode(&frame).unwrap().payload {
            Payload::Data(Data::Climate(c)) => {
                assert_eq!(c.temperature_tenths, 253);
                assert_eq!(c.humidity_tenths, 512);
            }
            other => panic!("expected climate data, got {other:?}"),
        }
    }

    #[test]
    fn integers_are_little_endian() {
        let m = msg(1, 2, Payload::StreamSequenceAck(StreamSequenceAck {
            stream_id: 3,
            sequence_number: 0x0102,
            status: SequenceStatus::Error,
            missing_bitmap: 0x0A0B0C0D,
        }));
        let frame = encode_to_vec(&m).unwrap();
        assert_eq!(frame, vec![11, 1, 2, 3, 0x02, 0x01, 1, 0x0D, 0x0C, 0x0B, 0x0A]);
    }

    #[test]
    fn sequence_length_follows_chunk_len() {
        let m = msg(9, 8, sequence(vec![1, 2, 3, 4]));
        let frame = encode_to_vec(&m).unwrap();
        assert_eq!(frame.len(), HEADER_SIZE + SEQUENCE_HEADER_SIZE + 4);
        assert_eq!(frame[9], 4);
        let empty = encode_to_vec(&msg(9, 8, sequence(Vec::new()))).unwrap();
        assert_eq!(empty.len(), HEADER_SIZE + SEQUENCE_HEADER_SIZE);
    }

    #[test]
    fn encode_rejects_oversized_chunk() {
        let m = msg(9, 8, sequence(vec![0; MAX_CHUNK_SIZE + 1]));
        let mut buf = [0u8; 512];
        assert_eq!(
            encode(&m, &mut buf),
            Err(EncodeError::ChunkTooLarge(MAX_CHUNK_SIZE + 1))
        );
    }

    #[test]
    fn encode_into_short_buffer_writes_nothing() {
        for m in one_of_each_kind() {
            let needed = encoded_len(&m);
            for cap in 0..needed {
                let mut buf = vec![0xEEu8; cap];
                assert_eq!(
                    encode(&m, &mut buf),
                    Err(EncodeError::BufferTooSmall {
                        needed,
                        capacity: cap
                    })
                );
                assert!(buf.iter().all(|&b| b == 0xEE));
            }
        }
    }

    #[test]
    fn encode_never_writes_past_needed() {
        let m = msg(9, 8, sequence(vec![7; 10]));
        let mut buf = [0xEEu8; MAX_FRAME_SIZE];
        let n = encode(&m, &mut buf).unwrap();
        assert!(buf[n..].iter().all(|&b| b == 0xEE));
    }

    #[test]
    fn decode_rejects_short_header() {
        for len in 0..HEADER_SIZE {
            let buf = vec![1u8; len];
            assert!(matches!(
                decode(&buf),
                Err(DecodeError::Truncated { .. })
            ));
        }
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        assert_eq!(decode(&[13, 1, 2]), Err(DecodeError::UnknownKind(13)));
        assert_eq!(decode(&[200, 1, 2, 0, 0]), Err(DecodeError::UnknownKind(200)));
    }

    #[test]
    fn decode_rejects_oversized_chunk_len_even_with_room() {
        let mut frame = vec![10, 9, 8, 0, 7, 0, 0, 0, 1, (MAX_CHUNK_SIZE + 1) as u8];
        frame.resize(255, 0xAA);
        assert_eq!(
            decode(&frame),
            Err(DecodeError::ChunkTooLarge((MAX_CHUNK_SIZE + 1) as u8))
        );
    }

    #[test]
    fn decode_rejects_truncated_chunk() {
        let frame = encode_to_vec(&msg(9, 8, sequence(vec![5; 20]))).unwrap();
        let cut = &frame[..frame.len() - 1];
        assert_eq!(
            decode(cut),
            Err(DecodeError::Truncated {
                needed: frame.len(),
                available: frame.len() - 1
            })
        );
    }

    #[test]
    fn decode_rejects_invalid_enum_fields() {
        assert_eq!(
            decode(&[4, 5, 6, 9, 0, 0, 0, 0]),
            Err(DecodeError::InvalidField {
                field: "data_type",
                value: 9
            })
        );
        assert!(matches!(
            decode(&[6, 1, 2, 0, 5]),
            Err(DecodeError::InvalidField {
                field: "command_status",
                ..
            })
        ));
    }

    #[test]
    fn decode_ignores_trailing_bytes() {
        let mut frame = vec![1, 1, 2];
        frame.extend_from_slice(&[0u8; MAX_FRAME_SIZE - 3]);
        let m = decode(&frame).unwrap();
        assert_eq!(m.payload, Payload::PingRequest);
    }

    #[test]
    fn every_prefix_of_valid_frame_is_rejected_or_decoded() {
        for m in one_of_each_kind() {
            let frame = encode_to_vec(&m).unwrap();
            for len in 0..frame.len() {
                assert!(decode(&frame[..len]).is_err(), "{:?} len {len}", m.kind());
            }
            assert_eq!(decode(&frame).unwrap(), m);
        }
    }

    #[test]
    fn random_frames_never_read_past_slice() {
        // decode borrows a sub-slice, so an over-read would panic here.
        let mut rng = StdRng::seed_from_u64(0x10AA);
        let mut backing = [0u8; MAX_FRAME_SIZE];
        for _ in 0..20_000 {
            rng.fill(&mut backing[..]);
            backing[0] = rng.gen_range(0..=14);
            let len = rng.gen_range(0..=MAX_FRAME_SIZE);
            if let Ok(m) = decode(&backing[..len]) {
                assert!(encoded_len(&m) <= len);
                let again = encode_to_vec(&m).unwrap();
                assert_eq!(decode(&again).unwrap(), m);
            }
        }
    }

    #[test]
    fn peek_stream_reads_stream_id() {
        let frame = encode_to_vec(&msg(9, 8, sequence(vec![1]))).unwrap();
        let r = peek_stream(&frame).unwrap();
        assert_eq!(r.kind, MessageKind::StreamSequence);
        assert_eq!(r.source, NodeId(9));
        assert_eq!(r.dest, NodeId(8));
        assert_eq!(r.stream_id, 7);

        let ack = [11u8, 4, 5, 21];
        assert_eq!(peek_stream(&ack).unwrap().stream_id, 21);
        assert!(peek_stream(&[1, 1, 2]).is_none());
        assert!(peek_stream(&[10, 1, 2, 0]).is_none());
        assert!(peek_stream(&[]).is_none());
    }

    #[test]
    fn full_sequence_fits_frame_buffer() {
        let m = msg(9, 8, sequence(vec![0; MAX_CHUNK_SIZE]));
        assert_eq!(encoded_len(&m), MAX_FRAME_SIZE);
    }
}
