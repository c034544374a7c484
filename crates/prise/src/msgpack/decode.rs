//! Streaming MessagePack decoder.
//!
//! [`Decoder`] walks a byte slice and consumes exactly one value per call,
//! tracking its position so the transport can frame concatenated messages
//! without a length prefix. Truncation is reported as
//! [`DecodeError::UnexpectedEndOfInput`] and is recoverable: the caller
//! buffers more bytes and retries from the same offset.

use crate::msgpack::value::Value;
use thiserror::Error;

/// Containers claiming more elements than this are treated as hostile.
/// A single frame never legitimately approaches it.
const MAX_ALLOC: usize = 1 << 28;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
  #[error("unexpected end of input")]
  UnexpectedEndOfInput,
  #[error("invalid format: {0}")]
  InvalidFormat(&'static str),
  #[error("integer overflow")]
  IntegerOverflow,
  #[error("invalid utf-8 in string")]
  InvalidUtf8,
  #[error("allocation limit exceeded")]
  OutOfMemory,
}

pub struct Decoder<'a> {
  buf: &'a [u8],
  pos: usize,
}

impl<'a> Decoder<'a> {
  #[must_use]
  pub fn new(buf: &'a [u8]) -> Self {
    Self { buf, pos: 0 }
  }

  /// Bytes consumed so far.
  #[must_use]
  pub fn position(&self) -> usize {
    self.pos
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.pos >= self.buf.len()
  }

  fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
    if self.buf.len() - self.pos < n {
      return Err(DecodeError::UnexpectedEndOfInput);
    }
    let slice = &self.buf[self.pos..self.pos + n];
    self.pos += n;
    Ok(slice)
  }

  fn take_u8(&mut self) -> Result<u8, DecodeError> {
    Ok(self.take(1)?[0])
  }

  fn take_u16(&mut self) -> Result<u16, DecodeError> {
    let b = self.take(2)?;
    Ok(u16::from_be_bytes([b[0], b[1]]))
  }

  fn take_u32(&mut self) -> Result<u32, DecodeError> {
    let b = self.take(4)?;
    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
  }

  fn take_u64(&mut self) -> Result<u64, DecodeError> {
    let b = self.take(8)?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(b);
    Ok(u64::from_be_bytes(arr))
  }

  fn checked_len(&self, len: usize) -> Result<usize, DecodeError> {
    if len > MAX_ALLOC {
      return Err(DecodeError::OutOfMemory);
    }
    Ok(len)
  }

  fn take_str(&mut self, len: usize) -> Result<String, DecodeError> {
    let len = self.checked_len(len)?;
    let bytes = self.take(len)?;
    std::str::from_utf8(bytes)
      .map(str::to_owned)
      .map_err(|_| DecodeError::InvalidUtf8)
  }

  fn take_bin(&mut self, len: usize) -> Result<Vec<u8>, DecodeError> {
    let len = self.checked_len(len)?;
    Ok(self.take(len)?.to_vec())
  }

  fn decode_array(&mut self, len: usize) -> Result<Value, DecodeError> {
    let len = self.checked_len(len)?;
    let mut items = Vec::with_capacity(len.min(self.buf.len() - self.pos));
    for _ in 0..len {
      items.push(self.decode_value()?);
    }
    Ok(Value::Array(items))
  }

  fn decode_map(&mut self, len: usize) -> Result<Value, DecodeError> {
    let len = self.checked_len(len)?;
    let mut pairs = Vec::with_capacity(len.min(self.buf.len() - self.pos));
    for _ in 0..len {
      let k = self.decode_value()?;
      let v = self.decode_value()?;
      pairs.push((k, v));
    }
    Ok(Value::Map(pairs))
  }

  /// Decodes one complete value.
  ///
  /// Ext types are not part of the protocol's value model and are rejected
  /// here; they are only tolerated under [`Decoder::skip`].
  pub fn decode_value(&mut self) -> Result<Value, DecodeError> {
    let prefix = self.take_u8()?;
    match prefix {
      0x00..=0x7f => Ok(Value::Uint(u64::from(prefix))),
      0xe0..=0xff => Ok(Value::Int(i64::from(prefix as i8))),
      0x80..=0x8f => self.decode_map(usize::from(prefix & 0x0f)),
      0x90..=0x9f => self.decode_array(usize::from(prefix & 0x0f)),
      0xa0..=0xbf => {
        let len = usize::from(prefix & 0x1f);
        Ok(Value::Str(self.take_str(len)?))
      }
      0xc0 => Ok(Value::Nil),
      0xc1 => Err(DecodeError::InvalidFormat("reserved prefix 0xc1")),
      0xc2 => Ok(Value::Bool(false)),
      0xc3 => Ok(Value::Bool(true)),
      0xc4 => {
        let len = usize::from(self.take_u8()?);
        Ok(Value::Bin(self.take_bin(len)?))
      }
      0xc5 => {
        let len = usize::from(self.take_u16()?);
        Ok(Value::Bin(self.take_bin(len)?))
      }
      0xc6 => {
        let len = self.take_u32()? as usize;
        Ok(Value::Bin(self.take_bin(len)?))
      }
      0xca => {
        let bits = self.take_u32()?;
        Ok(Value::Float(f64::from(f32::from_bits(bits))))
      }
      0xcb => {
        let bits = self.take_u64()?;
        Ok(Value::Float(f64::from_bits(bits)))
      }
      0xcc => Ok(Value::Uint(u64::from(self.take_u8()?))),
      0xcd => Ok(Value::Uint(u64::from(self.take_u16()?))),
      0xce => Ok(Value::Uint(u64::from(self.take_u32()?))),
      0xcf => Ok(Value::Uint(self.take_u64()?)),
      0xd0 => {
        let n = self.take_u8()? as i8;
        Ok(int_or_uint(i64::from(n)))
      }
      0xd1 => {
        let n = self.take_u16()? as i16;
        Ok(int_or_uint(i64::from(n)))
      }
      0xd2 => {
        let n = self.take_u32()? as i32;
        Ok(int_or_uint(i64::from(n)))
      }
      0xd3 => {
        let n = self.take_u64()? as i64;
        Ok(int_or_uint(n))
      }
      0xd9 => {
        let len = usize::from(self.take_u8()?);
        Ok(Value::Str(self.take_str(len)?))
      }
      0xda => {
        let len = usize::from(self.take_u16()?);
        Ok(Value::Str(self.take_str(len)?))
      }
      0xdb => {
        let len = self.take_u32()? as usize;
        Ok(Value::Str(self.take_str(len)?))
      }
      0xdc => {
        let len = usize::from(self.take_u16()?);
        self.decode_array(len)
      }
      0xdd => {
        let len = self.take_u32()? as usize;
        self.decode_array(len)
      }
      0xde => {
        let len = usize::from(self.take_u16()?);
        self.decode_map(len)
      }
      0xdf => {
        let len = self.take_u32()? as usize;
        self.decode_map(len)
      }
      0xc7..=0xc9 | 0xd4..=0xd8 => Err(DecodeError::InvalidFormat("ext type in value position")),
    }
  }

  /// Skips exactly one value, including ext types and nested containers.
  /// Used when a map key is not recognized by a typed container.
  pub fn skip(&mut self) -> Result<(), DecodeError> {
    let prefix = self.take_u8()?;
    match prefix {
      0x00..=0x7f | 0xe0..=0xff | 0xc0 | 0xc2 | 0xc3 => Ok(()),
      0x80..=0x8f => self.skip_n(2 * usize::from(prefix & 0x0f)),
      0x90..=0x9f => self.skip_n(usize::from(prefix & 0x0f)),
      0xa0..=0xbf => self.take(usize::from(prefix & 0x1f)).map(|_| ()),
      0xc1 => Err(DecodeError::InvalidFormat("reserved prefix 0xc1")),
      0xc4 | 0xd9 => {
        let len = usize::from(self.take_u8()?);
        self.take(len).map(|_| ())
      }
      0xc5 | 0xda => {
        let len = usize::from(self.take_u16()?);
        self.take(len).map(|_| ())
      }
      0xc6 | 0xdb => {
        let len = self.take_u32()? as usize;
        self.take(self.checked_len(len)?).map(|_| ())
      }
      0xc7 => {
        let len = usize::from(self.take_u8()?);
        self.take(len + 1).map(|_| ())
      }
      0xc8 => {
        let len = usize::from(self.take_u16()?);
        self.take(len + 1).map(|_| ())
      }
      0xc9 => {
        let len = self.take_u32()? as usize;
        self.take(self.checked_len(len)?.saturating_add(1)).map(|_| ())
      }
      0xca => self.take(4).map(|_| ()),
      0xcb => self.take(8).map(|_| ()),
      0xcc | 0xd0 => self.take(1).map(|_| ()),
      0xcd | 0xd1 => self.take(2).map(|_| ()),
      0xce | 0xd2 => self.take(4).map(|_| ()),
      0xcf | 0xd3 => self.take(8).map(|_| ()),
      0xd4 => self.take(2).map(|_| ()),
      0xd5 => self.take(3).map(|_| ()),
      0xd6 => self.take(5).map(|_| ()),
      0xd7 => self.take(9).map(|_| ()),
      0xd8 => self.take(17).map(|_| ()),
      0xdc => {
        let len = usize::from(self.take_u16()?);
        self.skip_n(len)
      }
      0xdd => {
        let len = self.take_u32()? as usize;
        self.skip_n(self.checked_len(len)?)
      }
      0xde => {
        let len = usize::from(self.take_u16()?);
        self.skip_n(2 * len)
      }
      0xdf => {
        let len = self.take_u32()? as usize;
        self.skip_n(self.checked_len(len)?.saturating_mul(2))
      }
    }
  }

  fn skip_n(&mut self, n: usize) -> Result<(), DecodeError> {
    for _ in 0..n {
      self.skip()?;
    }
    Ok(())
  }

  /// Reads an array header and returns the element count.
  pub fn read_array_len(&mut self) -> Result<usize, DecodeError> {
    let prefix = self.take_u8()?;
    match prefix {
      0x90..=0x9f => Ok(usize::from(prefix & 0x0f)),
      0xdc => Ok(usize::from(self.take_u16()?)),
      0xdd => {
        let len = self.take_u32()? as usize;
        self.checked_len(len)
      }
      _ => Err(DecodeError::InvalidFormat("expected array")),
    }
  }

  fn read_map_len(&mut self) -> Result<usize, DecodeError> {
    let prefix = self.take_u8()?;
    match prefix {
      0x80..=0x8f => Ok(usize::from(prefix & 0x0f)),
      0xde => Ok(usize::from(self.take_u16()?)),
      0xdf => {
        let len = self.take_u32()? as usize;
        self.checked_len(len)
      }
      _ => Err(DecodeError::InvalidFormat("expected map")),
    }
  }
}

fn int_or_uint(n: i64) -> Value {
  if n >= 0 {
    Value::Uint(n as u64)
  } else {
    Value::Int(n)
  }
}

/// Decodes a typed container into named field slots.
///
/// The wire value may be a map (fields matched by name, unknown keys skipped
/// via [`Decoder::skip`]) or an array (fields matched by position, extras
/// skipped). Missing fields are left as `None`; the caller decides which are
/// required.
pub fn decode_fields(
  d: &mut Decoder<'_>,
  names: &[&str],
) -> Result<Vec<Option<Value>>, DecodeError> {
  let mut slots: Vec<Option<Value>> = vec![None; names.len()];
  let prefix_pos = d.pos;
  let prefix = d.take_u8()?;
  match prefix {
    0x80..=0x8f | 0xde | 0xdf => {
      d.pos = prefix_pos;
      let len = d.read_map_len()?;
      for _ in 0..len {
        let key = d.decode_value()?;
        match key.as_str().and_then(|k| names.iter().position(|n| *n == k)) {
          Some(idx) => slots[idx] = Some(d.decode_value()?),
          None => d.skip()?,
        }
      }
    }
    0x90..=0x9f | 0xdc | 0xdd => {
      d.pos = prefix_pos;
      let len = d.read_array_len()?;
      for idx in 0..len {
        if idx < names.len() {
          slots[idx] = Some(d.decode_value()?);
        } else {
          d.skip()?;
        }
      }
    }
    _ => return Err(DecodeError::InvalidFormat("expected map or array container")),
  }
  Ok(slots)
}

/// [`decode_fields`] over an already-decoded [`Value`]. Used when the
/// container arrives embedded in RPC params.
pub fn fields_from_value(
  value: &Value,
  names: &[&str],
) -> Result<Vec<Option<Value>>, DecodeError> {
  let mut slots: Vec<Option<Value>> = vec![None; names.len()];
  match value {
    Value::Map(pairs) => {
      for (k, v) in pairs {
        if let Some(idx) = k.as_str().and_then(|k| names.iter().position(|n| *n == k)) {
          slots[idx] = Some(v.clone());
        }
      }
    }
    Value::Array(items) => {
      for (idx, item) in items.iter().take(names.len()).enumerate() {
        slots[idx] = Some(item.clone());
      }
    }
    _ => return Err(DecodeError::InvalidFormat("expected map or array container")),
  }
  Ok(slots)
}
