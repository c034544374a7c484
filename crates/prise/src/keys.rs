//! Structured key events and their terminal byte encodings.
//!
//! Key names follow the web Key convention (`"Enter"`, `"ArrowUp"`, `"a"`,
//! `" "`). Encoding folds ctrl into C0 controls, prefixes alt with ESC, and
//! attaches CSI modifier parameters to navigation keys. Unknown named keys
//! are treated as text when they are a single codepoint; otherwise they
//! carry no encoding and the raw name travels only in the event itself.

use crate::msgpack::{DecodeError, Value, fields_from_value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyEvent {
  pub key: String,
  pub ctrl: bool,
  pub shift: bool,
  pub alt: bool,
  pub meta: bool,
}

impl KeyEvent {
  #[must_use]
  pub fn plain(key: &str) -> Self {
    Self {
      key: key.to_string(),
      ctrl: false,
      shift: false,
      alt: false,
      meta: false,
    }
  }

  /// Decodes the wire map `{key, ctrlKey, shiftKey, altKey, metaKey}`.
  pub fn from_value(value: &Value) -> Result<Self, DecodeError> {
    let slots = fields_from_value(
      value,
      &["key", "ctrlKey", "shiftKey", "altKey", "metaKey"],
    )?;
    let key = slots[0]
      .as_ref()
      .and_then(Value::as_str)
      .ok_or(DecodeError::InvalidFormat("key event requires a key"))?
      .to_string();
    let flag = |slot: &Option<Value>| slot.as_ref().and_then(Value::as_bool).unwrap_or(false);
    Ok(Self {
      key,
      ctrl: flag(&slots[1]),
      shift: flag(&slots[2]),
      alt: flag(&slots[3]),
      meta: flag(&slots[4]),
    })
  }

  #[must_use]
  pub fn to_value(&self) -> Value {
    Value::Map(vec![
      ("key".into(), Value::Str(self.key.clone())),
      ("ctrlKey".into(), self.ctrl.into()),
      ("shiftKey".into(), self.shift.into()),
      ("altKey".into(), self.alt.into()),
      ("metaKey".into(), self.meta.into()),
    ])
  }
}

/// xterm-style CSI modifier parameter: 1 + shift(1) + alt(2) + ctrl(4).
fn csi_modifier(ev: &KeyEvent) -> u8 {
  1 + u8::from(ev.shift) + (u8::from(ev.alt) << 1) + (u8::from(ev.ctrl) << 2)
}

fn csi(final_byte: char, ev: &KeyEvent) -> Vec<u8> {
  let m = csi_modifier(ev);
  if m == 1 {
    format!("\x1b[{final_byte}").into_bytes()
  } else {
    format!("\x1b[1;{m}{final_byte}").into_bytes()
  }
}

fn csi_tilde(num: u8, ev: &KeyEvent) -> Vec<u8> {
  let m = csi_modifier(ev);
  if m == 1 {
    format!("\x1b[{num}~").into_bytes()
  } else {
    format!("\x1b[{num};{m}~").into_bytes()
  }
}

fn text_bytes(ev: &KeyEvent, ch: char) -> Vec<u8> {
  let mut bytes = Vec::new();
  if ev.alt {
    bytes.push(0x1b);
  }
  if ev.ctrl {
    // Fold into C0 where a fold exists, pass through otherwise.
    let folded = match ch.to_ascii_lowercase() {
      c @ 'a'..='z' => Some(c as u8 & 0x1f),
      '@' | ' ' => Some(0x00),
      '[' => Some(0x1b),
      '\\' => Some(0x1c),
      ']' => Some(0x1d),
      '^' => Some(0x1e),
      '_' | '-' => Some(0x1f),
      '?' => Some(0x7f),
      _ => None,
    };
    if let Some(c0) = folded {
      bytes.push(c0);
      return bytes;
    }
  }
  let mut utf8 = [0u8; 4];
  bytes.extend_from_slice(ch.encode_utf8(&mut utf8).as_bytes());
  bytes
}

/// Byte sequence to write into the PTY for one key event. Empty means the
/// key has no terminal representation.
#[must_use]
pub fn encode_key(ev: &KeyEvent) -> Vec<u8> {
  let mut single = ev.key.chars();
  let (first, rest) = (single.next(), single.next());
  if let (Some(ch), None) = (first, rest) {
    return text_bytes(ev, ch);
  }

  match ev.key.as_str() {
    "Enter" => {
      let mut b = Vec::new();
      if ev.alt {
        b.push(0x1b);
      }
      b.push(b'\r');
      b
    }
    "Tab" => {
      if ev.shift {
        b"\x1b[Z".to_vec()
      } else {
        vec![b'\t']
      }
    }
    "Backspace" => {
      let mut b = Vec::new();
      if ev.alt {
        b.push(0x1b);
      }
      b.push(if ev.ctrl { 0x08 } else { 0x7f });
      b
    }
    "Escape" => vec![0x1b],
    "ArrowUp" => csi('A', ev),
    "ArrowDown" => csi('B', ev),
    "ArrowRight" => csi('C', ev),
    "ArrowLeft" => csi('D', ev),
    "Home" => csi('H', ev),
    "End" => csi('F', ev),
    "Insert" => csi_tilde(2, ev),
    "Delete" => csi_tilde(3, ev),
    "PageUp" => csi_tilde(5, ev),
    "PageDown" => csi_tilde(6, ev),
    "F1" => b"\x1bOP".to_vec(),
    "F2" => b"\x1bOQ".to_vec(),
    "F3" => b"\x1bOR".to_vec(),
    "F4" => b"\x1bOS".to_vec(),
    "F5" => csi_tilde(15, ev),
    "F6" => csi_tilde(17, ev),
    "F7" => csi_tilde(18, ev),
    "F8" => csi_tilde(19, ev),
    "F9" => csi_tilde(20, ev),
    "F10" => csi_tilde(21, ev),
    "F11" => csi_tilde(23, ev),
    "F12" => csi_tilde(24, ev),
    // Unidentified named key: nothing to write.
    _ => Vec::new(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn key(name: &str) -> KeyEvent {
    KeyEvent::plain(name)
  }

  #[test]
  fn plain_text_keys() {
    assert_eq!(encode_key(&key("a")), b"a");
    assert_eq!(encode_key(&key("A")), b"A");
    assert_eq!(encode_key(&key(" ")), b" ");
    assert_eq!(encode_key(&key("é")), "é".as_bytes());
  }

  #[test]
  fn ctrl_folds_to_c0() {
    let mut ev = key("c");
    ev.ctrl = true;
    assert_eq!(encode_key(&ev), vec![0x03]);
    let mut ev = key("a");
    ev.ctrl = true;
    assert_eq!(encode_key(&ev), vec![0x01]);
    let mut ev = key("[");
    ev.ctrl = true;
    assert_eq!(encode_key(&ev), vec![0x1b]);
  }

  #[test]
  fn alt_prefixes_escape() {
    let mut ev = key("x");
    ev.alt = true;
    assert_eq!(encode_key(&ev), vec![0x1b, b'x']);
    let mut ev = key("Enter");
    ev.alt = true;
    assert_eq!(encode_key(&ev), vec![0x1b, b'\r']);
  }

  #[test]
  fn named_keys() {
    assert_eq!(encode_key(&key("Enter")), b"\r");
    assert_eq!(encode_key(&key("Tab")), b"\t");
    assert_eq!(encode_key(&key("Escape")), vec![0x1b]);
    assert_eq!(encode_key(&key("Backspace")), vec![0x7f]);
    assert_eq!(encode_key(&key("ArrowUp")), b"\x1b[A");
    assert_eq!(encode_key(&key("Delete")), b"\x1b[3~");
    assert_eq!(encode_key(&key("F5")), b"\x1b[15~");
  }

  #[test]
  fn modified_navigation_uses_csi_parameters() {
    let mut ev = key("ArrowRight");
    ev.ctrl = true;
    assert_eq!(encode_key(&ev), b"\x1b[1;5C");
    let mut ev = key("PageUp");
    ev.shift = true;
    assert_eq!(encode_key(&ev), b"\x1b[5;2~");
  }

  #[test]
  fn shift_tab_is_backtab() {
    let mut ev = key("Tab");
    ev.shift = true;
    assert_eq!(encode_key(&ev), b"\x1b[Z");
  }

  #[test]
  fn unknown_named_key_has_no_encoding() {
    assert_eq!(encode_key(&key("MediaPlayPause")), Vec::<u8>::new());
  }

  #[test]
  fn wire_roundtrip() {
    let mut ev = key("Enter");
    ev.ctrl = true;
    ev.meta = true;
    let back = KeyEvent::from_value(&ev.to_value()).unwrap();
    assert_eq!(back, ev);
  }

  #[test]
  fn from_value_accepts_positional_form() {
    let wire = Value::Array(vec![
      Value::Str("a".into()),
      Value::Bool(true),
      Value::Bool(false),
      Value::Bool(false),
      Value::Bool(false),
    ]);
    let ev = KeyEvent::from_value(&wire).unwrap();
    assert_eq!(ev.key, "a");
    assert!(ev.ctrl);
  }

  #[test]
  fn from_value_requires_key() {
    let wire = Value::Map(vec![("ctrlKey".into(), Value::Bool(true))]);
    assert!(KeyEvent::from_value(&wire).is_err());
  }
}
