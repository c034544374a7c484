//! The three MessagePack-RPC message kinds.

use crate::msgpack::{DecodeError, Decoder, Value, encode_to_vec};

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
  Request {
    id: u32,
    method: String,
    params: Vec<Value>,
  },
  /// Exactly one of `error`/`result` is non-nil.
  Response {
    id: u32,
    error: Value,
    result: Value,
  },
  Notification {
    method: String,
    params: Vec<Value>,
  },
}

impl Message {
  #[must_use]
  pub fn request(id: u32, method: &str, params: Vec<Value>) -> Self {
    Message::Request {
      id,
      method: method.to_string(),
      params,
    }
  }

  #[must_use]
  pub fn response_ok(id: u32, result: Value) -> Self {
    Message::Response {
      id,
      error: Value::Nil,
      result,
    }
  }

  #[must_use]
  pub fn response_err(id: u32, error: impl Into<String>) -> Self {
    Message::Response {
      id,
      error: Value::Str(error.into()),
      result: Value::Nil,
    }
  }

  #[must_use]
  pub fn notification(method: &str, params: Vec<Value>) -> Self {
    Message::Notification {
      method: method.to_string(),
      params,
    }
  }

  #[must_use]
  pub fn encode(&self) -> Vec<u8> {
    let value = match self {
      Message::Request { id, method, params } => Value::Array(vec![
        Value::Uint(0),
        Value::Uint(u64::from(*id)),
        Value::Str(method.clone()),
        Value::Array(params.clone()),
      ]),
      Message::Response { id, error, result } => Value::Array(vec![
        Value::Uint(1),
        Value::Uint(u64::from(*id)),
        error.clone(),
        result.clone(),
      ]),
      Message::Notification { method, params } => Value::Array(vec![
        Value::Uint(2),
        Value::Str(method.clone()),
        Value::Array(params.clone()),
      ]),
    };
    encode_to_vec(&value)
  }

  /// Decodes one message, advancing the decoder past it.
  pub fn decode(d: &mut Decoder<'_>) -> Result<Self, DecodeError> {
    let arity = d.read_array_len()?;
    let tag = d
      .decode_value()?
      .as_u64()
      .ok_or(DecodeError::InvalidFormat("message type tag"))?;
    match tag {
      0 => {
        if arity != 4 {
          return Err(DecodeError::InvalidFormat("request arity"));
        }
        let id = decode_msgid(d)?;
        let method = decode_method(d)?;
        let params = decode_params(d)?;
        Ok(Message::Request { id, method, params })
      }
      1 => {
        if arity != 4 {
          return Err(DecodeError::InvalidFormat("response arity"));
        }
        let id = decode_msgid(d)?;
        let error = d.decode_value()?;
        let result = d.decode_value()?;
        Ok(Message::Response { id, error, result })
      }
      2 => {
        if arity != 3 {
          return Err(DecodeError::InvalidFormat("notification arity"));
        }
        let method = decode_method(d)?;
        let params = decode_params(d)?;
        Ok(Message::Notification { method, params })
      }
      _ => Err(DecodeError::InvalidFormat("unknown message type tag")),
    }
  }
}

fn decode_msgid(d: &mut Decoder<'_>) -> Result<u32, DecodeError> {
  let v = d.decode_value()?;
  match v.as_u64() {
    Some(u) => u32::try_from(u).map_err(|_| DecodeError::IntegerOverflow),
    None => Err(DecodeError::InvalidFormat("message id")),
  }
}

fn decode_method(d: &mut Decoder<'_>) -> Result<String, DecodeError> {
  match d.decode_value()? {
    Value::Str(s) => Ok(s),
    _ => Err(DecodeError::InvalidFormat("method name")),
  }
}

fn decode_params(d: &mut Decoder<'_>) -> Result<Vec<Value>, DecodeError> {
  match d.decode_value()? {
    Value::Array(items) => Ok(items),
    _ => Err(DecodeError::InvalidFormat("params must be an array")),
  }
}

/// Streaming framer: decodes one message from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer holds only a truncated message, so the
/// transport re-arms its read and retries with more bytes.
pub fn decode_one(buf: &[u8]) -> Result<Option<(Message, usize)>, DecodeError> {
  if buf.is_empty() {
    return Ok(None);
  }
  let mut d = Decoder::new(buf);
  match Message::decode(&mut d) {
    Ok(msg) => Ok(Some((msg, d.position()))),
    Err(DecodeError::UnexpectedEndOfInput) => Ok(None),
    Err(err) => Err(err),
  }
}
