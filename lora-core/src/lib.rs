//! LoRa home-controller link protocol.
//! Host-driven: no I/O of its own; the host supplies a `RadioDriver` and drives `poll`/`tick`.

pub mod chunk;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod radio;
pub mod stream;
pub mod wire;

pub use engine::{Engine, EngineConfig, Handler, Link};
pub use error::{Error, Result};
pub use protocol::{Message, MessageKind, Metadata, NodeId, Payload, PROTOCOL_VERSION};
pub use radio::{DriverError, LoopbackRadio, RadioDriver};
pub use stream::{StreamAction, StreamAnomaly, StreamConfig, StreamManager};
pub use wire::{decode, encode, encode_to_vec, encoded_len, DecodeError, EncodeError};
