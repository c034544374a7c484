//! The dynamic MessagePack value.

/// A single MessagePack value.
///
/// Non-negative integers decode as [`Value::Uint`] regardless of the wire
/// family they arrived in; [`Value::Int`] always carries a negative number
/// after decoding, but may hold non-negative ones when built by hand (the
/// encoder normalizes).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
  Nil,
  Bool(bool),
  Int(i64),
  Uint(u64),
  Float(f64),
  Str(String),
  Bin(Vec<u8>),
  Array(Vec<Value>),
  Map(Vec<(Value, Value)>),
}

impl Value {
  #[must_use]
  pub fn is_nil(&self) -> bool {
    matches!(self, Value::Nil)
  }

  /// Integer view accepting both wire families.
  #[must_use]
  pub fn as_u64(&self) -> Option<u64> {
    match self {
      Value::Uint(u) => Some(*u),
      Value::Int(i) if *i >= 0 => Some(*i as u64),
      _ => None,
    }
  }

  #[must_use]
  pub fn as_i64(&self) -> Option<i64> {
    match self {
      Value::Int(i) => Some(*i),
      Value::Uint(u) => i64::try_from(*u).ok(),
      _ => None,
    }
  }

  #[must_use]
  pub fn as_u32(&self) -> Option<u32> {
    self.as_u64().and_then(|u| u32::try_from(u).ok())
  }

  #[must_use]
  pub fn as_u16(&self) -> Option<u16> {
    self.as_u64().and_then(|u| u16::try_from(u).ok())
  }

  #[must_use]
  pub fn as_bool(&self) -> Option<bool> {
    match self {
      Value::Bool(b) => Some(*b),
      _ => None,
    }
  }

  #[must_use]
  pub fn as_str(&self) -> Option<&str> {
    match self {
      Value::Str(s) => Some(s),
      _ => None,
    }
  }

  /// Byte view: accepts both `bin` and `str` payloads, since peers disagree
  /// on which family raw byte blobs travel in.
  #[must_use]
  pub fn as_bytes(&self) -> Option<&[u8]> {
    match self {
      Value::Bin(b) => Some(b),
      Value::Str(s) => Some(s.as_bytes()),
      _ => None,
    }
  }

  #[must_use]
  pub fn as_array(&self) -> Option<&[Value]> {
    match self {
      Value::Array(items) => Some(items),
      _ => None,
    }
  }

  #[must_use]
  pub fn as_map(&self) -> Option<&[(Value, Value)]> {
    match self {
      Value::Map(pairs) => Some(pairs),
      _ => None,
    }
  }

  /// Looks up a string key in a map value.
  #[must_use]
  pub fn get(&self, key: &str) -> Option<&Value> {
    self.as_map().and_then(|pairs| {
      pairs
        .iter()
        .find(|(k, _)| k.as_str() == Some(key))
        .map(|(_, v)| v)
    })
  }
}

impl From<bool> for Value {
  fn from(b: bool) -> Self {
    Value::Bool(b)
  }
}

impl From<u64> for Value {
  fn from(u: u64) -> Self {
    Value::Uint(u)
  }
}

impl From<u32> for Value {
  fn from(u: u32) -> Self {
    Value::Uint(u64::from(u))
  }
}

impl From<u16> for Value {
  fn from(u: u16) -> Self {
    Value::Uint(u64::from(u))
  }
}

impl From<i64> for Value {
  fn from(i: i64) -> Self {
    Value::Int(i)
  }
}

impl From<&str> for Value {
  fn from(s: &str) -> Self {
    Value::Str(s.to_string())
  }
}

impl From<String> for Value {
  fn from(s: String) -> Self {
    Value::Str(s)
  }
}

impl From<Vec<u8>> for Value {
  fn from(b: Vec<u8>) -> Self {
    Value::Bin(b)
  }
}

impl From<Vec<Value>> for Value {
  fn from(items: Vec<Value>) -> Self {
    Value::Array(items)
  }
}
