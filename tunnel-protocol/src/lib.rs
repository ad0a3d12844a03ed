//! Wire types for the duplex protocol between the tunnel edge and its
//! connected clients. See `frame` for the tagged-union frame shapes,
//! `codec` for the length-prefixed transport framing, `headers` for the
//! case-insensitive multi-valued header map carried by HTTP payloads, and
//! `registration` for the registration handshake grammar.

mod codec;
mod frame;
mod headers;
mod registration;

pub use codec::{decode, encode, read_frame, write_frame, CodecError};
pub use frame::{
    ControlFrame, ControlKind, ErrorCode, ErrorFrame, Frame, HeartbeatFrame, HttpPayload,
    Payload, RequestFrame, ResponseFrame, TcpChunk, MAX_FRAME_SIZE,
};
pub use headers::HeaderMultiMap;
pub use registration::{reply_frame, Registration, RegistrationError};
