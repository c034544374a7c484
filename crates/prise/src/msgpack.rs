//! MessagePack wire codec.
//!
//! Two surfaces: a byte-exact encoder/decoder for the dynamic [`Value`]
//! variant, and field-slot helpers for mapping wire maps (field-by-name) or
//! wire arrays (field-by-position) into typed containers.
//!
//! The decoder is streaming: it consumes exactly one top-level value and
//! reports the consumed byte count, so trailing bytes stay buffered for the
//! next message. A truncated value is reported as
//! [`DecodeError::UnexpectedEndOfInput`], which the transport treats as
//! "need more data" rather than a protocol violation.

pub mod decode;
pub mod encode;
pub mod value;

pub use decode::{DecodeError, Decoder, decode_fields, fields_from_value};
pub use encode::{encode, encode_to_vec};
pub use value::Value;
