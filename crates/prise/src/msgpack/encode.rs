//! Shortest-prefix MessagePack encoder.
//!
//! Every value class picks the smallest legal wire prefix for its magnitude
//! or length. Floats always encode as float64. Multi-byte integers are
//! big-endian throughout.

use crate::msgpack::value::Value;

/// Appends the encoding of `value` to `out`.
pub fn encode(value: &Value, out: &mut Vec<u8>) {
  match value {
    Value::Nil => out.push(0xc0),
    Value::Bool(false) => out.push(0xc2),
    Value::Bool(true) => out.push(0xc3),
    Value::Uint(u) => encode_uint(*u, out),
    Value::Int(i) => {
      if *i >= 0 {
        encode_uint(*i as u64, out);
      } else {
        encode_negative(*i, out);
      }
    }
    Value::Float(f) => {
      out.push(0xcb);
      out.extend_from_slice(&f.to_bits().to_be_bytes());
    }
    Value::Str(s) => {
      let len = s.len();
      if len <= 31 {
        out.push(0xa0 | len as u8);
      } else if len <= 0xff {
        out.push(0xd9);
        out.push(len as u8);
      } else if len <= 0xffff {
        out.push(0xda);
        out.extend_from_slice(&(len as u16).to_be_bytes());
      } else {
        out.push(0xdb);
        out.extend_from_slice(&(len as u32).to_be_bytes());
      }
      out.extend_from_slice(s.as_bytes());
    }
    Value::Bin(b) => {
      let len = b.len();
      if len <= 0xff {
        out.push(0xc4);
        out.push(len as u8);
      } else if len <= 0xffff {
        out.push(0xc5);
        out.extend_from_slice(&(len as u16).to_be_bytes());
      } else {
        out.push(0xc6);
        out.extend_from_slice(&(len as u32).to_be_bytes());
      }
      out.extend_from_slice(b);
    }
    Value::Array(items) => {
      let len = items.len();
      if len <= 15 {
        out.push(0x90 | len as u8);
      } else if len <= 0xffff {
        out.push(0xdc);
        out.extend_from_slice(&(len as u16).to_be_bytes());
      } else {
        out.push(0xdd);
        out.extend_from_slice(&(len as u32).to_be_bytes());
      }
      for item in items {
        encode(item, out);
      }
    }
    Value::Map(pairs) => {
      let len = pairs.len();
      if len <= 15 {
        out.push(0x80 | len as u8);
      } else if len <= 0xffff {
        out.push(0xde);
        out.extend_from_slice(&(len as u16).to_be_bytes());
      } else {
        out.push(0xdf);
        out.extend_from_slice(&(len as u32).to_be_bytes());
      }
      for (k, v) in pairs {
        encode(k, out);
        encode(v, out);
      }
    }
  }
}

/// Encodes into a fresh buffer.
#[must_use]
pub fn encode_to_vec(value: &Value) -> Vec<u8> {
  let mut out = Vec::new();
  encode(value, &mut out);
  out
}

fn encode_uint(u: u64, out: &mut Vec<u8>) {
  if u <= 0x7f {
    out.push(u as u8);
  } else if u <= 0xff {
    out.push(0xcc);
    out.push(u as u8);
  } else if u <= 0xffff {
    out.push(0xcd);
    out.extend_from_slice(&(u as u16).to_be_bytes());
  } else if u <= 0xffff_ffff {
    out.push(0xce);
    out.extend_from_slice(&(u as u32).to_be_bytes());
  } else {
    out.push(0xcf);
    out.extend_from_slice(&u.to_be_bytes());
  }
}

fn encode_negative(i: i64, out: &mut Vec<u8>) {
  if i >= -32 {
    out.push(i as u8);
  } else if i >= -128 {
    out.push(0xd0);
    out.push(i as u8);
  } else if i >= -32768 {
    out.push(0xd1);
    out.extend_from_slice(&(i as i16).to_be_bytes());
  } else if i >= -(1i64 << 31) {
    out.push(0xd2);
    out.extend_from_slice(&(i as i32).to_be_bytes());
  } else {
    out.push(0xd3);
    out.extend_from_slice(&i.to_be_bytes());
  }
}
