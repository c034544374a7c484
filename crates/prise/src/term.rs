//! Screen model seam.
//!
//! The server core never talks to an escape-sequence parser directly; it
//! sees a [`Terminal`]: feed bytes in, take cell-grid snapshots out. The
//! production implementation wraps a `vt100::Parser`. The reply stream
//! returned by [`Terminal::advance`] exists for parsers that answer queries
//! (device attributes and friends); the vt100 parser answers none, so it
//! always returns empty.

use crate::msgpack::Value;

/// One rendered cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
  pub ch: String,
  pub fg: u32,
  pub bg: u32,
  pub attrs: u16,
}

pub const ATTR_BOLD: u16 = 0x1;
pub const ATTR_ITALIC: u16 = 0x2;
pub const ATTR_UNDERLINE: u16 = 0x4;
pub const ATTR_INVERSE: u16 = 0x8;

/// Color encoding on the wire: 0 is the terminal default, `0x01xx_xxxx`
/// carries a palette index, `0x02xx_xxxx` carries packed RGB.
pub const COLOR_DEFAULT: u32 = 0;
const COLOR_INDEXED: u32 = 0x0100_0000;
const COLOR_RGB: u32 = 0x0200_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
  pub row: u16,
  pub col: u16,
  pub visible: bool,
}

/// Full-frame screen snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
  pub cols: u16,
  pub rows: u16,
  pub cells: Vec<Vec<Cell>>,
  pub cursor: Cursor,
}

impl Frame {
  /// Wire form of the `redraw` payload. `full: true` self-describes the
  /// frame encoding; a delta-sending implementation would flip it.
  #[must_use]
  pub fn to_value(&self) -> Value {
    let cells = self
      .cells
      .iter()
      .map(|row| {
        Value::Array(
          row
            .iter()
            .map(|cell| {
              Value::Map(vec![
                ("ch".into(), Value::Str(cell.ch.clone())),
                ("fg".into(), cell.fg.into()),
                ("bg".into(), cell.bg.into()),
                ("attrs".into(), Value::Uint(u64::from(cell.attrs))),
              ])
            })
            .collect(),
        )
      })
      .collect();
    Value::Map(vec![
      ("full".into(), Value::Bool(true)),
      ("cols".into(), self.cols.into()),
      ("rows".into(), self.rows.into()),
      ("cells".into(), Value::Array(cells)),
      (
        "cursor".into(),
        Value::Map(vec![
          ("row".into(), self.cursor.row.into()),
          ("col".into(), self.cursor.col.into()),
          ("visible".into(), self.cursor.visible.into()),
        ]),
      ),
    ])
  }

  /// Concatenated text of one row, for tests and logs.
  #[must_use]
  pub fn row_text(&self, row: usize) -> String {
    self.cells.get(row).map_or_else(String::new, |cells| {
      cells.iter().map(|c| c.ch.as_str()).collect()
    })
  }
}

pub trait Terminal: Send {
  /// Consumes PTY output. Returns the reply stream to write back to the
  /// PTY master, if the parser produced one.
  fn advance(&mut self, bytes: &[u8]) -> Vec<u8>;
  fn resize(&mut self, cols: u16, rows: u16);
  fn frame(&self) -> Frame;
  fn title(&self) -> String;
  /// Monotonic count of BEL characters seen.
  fn bell_count(&self) -> usize;
  /// Current size as (cols, rows).
  fn size(&self) -> (u16, u16);
}

/// `vt100`-backed terminal.
pub struct VtScreen {
  parser: vt100::Parser,
}

impl VtScreen {
  #[must_use]
  pub fn new(cols: u16, rows: u16) -> Self {
    Self {
      parser: vt100::Parser::new(rows, cols, 0),
    }
  }
}

fn encode_color(color: vt100::Color) -> u32 {
  match color {
    vt100::Color::Default => COLOR_DEFAULT,
    vt100::Color::Idx(i) => COLOR_INDEXED | u32::from(i),
    vt100::Color::Rgb(r, g, b) => {
      COLOR_RGB | (u32::from(r) << 16) | (u32::from(g) << 8) | u32::from(b)
    }
  }
}

impl Terminal for VtScreen {
  fn advance(&mut self, bytes: &[u8]) -> Vec<u8> {
    self.parser.process(bytes);
    Vec::new()
  }

  fn resize(&mut self, cols: u16, rows: u16) {
    self.parser.screen_mut().set_size(rows, cols);
  }

  fn frame(&self) -> Frame {
    let screen = self.parser.screen();
    let (rows, cols) = screen.size();
    let mut grid = Vec::with_capacity(usize::from(rows));
    for row in 0..rows {
      let mut line = Vec::with_capacity(usize::from(cols));
      for col in 0..cols {
        let cell = screen.cell(row, col);
        line.push(match cell {
          Some(cell) => {
            let mut attrs = 0u16;
            if cell.bold() {
              attrs |= ATTR_BOLD;
            }
            if cell.italic() {
              attrs |= ATTR_ITALIC;
            }
            if cell.underline() {
              attrs |= ATTR_UNDERLINE;
            }
            if cell.inverse() {
              attrs |= ATTR_INVERSE;
            }
            Cell {
              ch: cell.contents().to_string(),
              fg: encode_color(cell.fgcolor()),
              bg: encode_color(cell.bgcolor()),
              attrs,
            }
          }
          None => Cell {
            ch: String::new(),
            fg: COLOR_DEFAULT,
            bg: COLOR_DEFAULT,
            attrs: 0,
          },
        });
      }
      grid.push(line);
    }
    let (cursor_row, cursor_col) = screen.cursor_position();
    Frame {
      cols,
      rows,
      cells: grid,
      cursor: Cursor {
        row: cursor_row,
        col: cursor_col,
        visible: !screen.hide_cursor(),
      },
    }
  }

  fn title(&self) -> String {
    self.parser.screen().title().to_string()
  }

  fn bell_count(&self) -> usize {
    self.parser.screen().audible_bell_count()
  }

  fn size(&self) -> (u16, u16) {
    let (rows, cols) = self.parser.screen().size();
    (cols, rows)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn plain_text_lands_in_the_grid() {
    let mut term = VtScreen::new(20, 4);
    term.advance(b"hi");
    let frame = term.frame();
    assert_eq!(frame.cols, 20);
    assert_eq!(frame.rows, 4);
    assert!(frame.row_text(0).starts_with("hi"));
    assert_eq!(frame.cursor.row, 0);
    assert_eq!(frame.cursor.col, 2);
    assert!(frame.cursor.visible);
  }

  #[test]
  fn sgr_attributes_are_captured() {
    let mut term = VtScreen::new(10, 2);
    term.advance(b"\x1b[1;4;7mX\x1b[0m");
    let frame = term.frame();
    let cell = &frame.cells[0][0];
    assert_eq!(cell.ch, "X");
    assert_eq!(
      cell.attrs,
      ATTR_BOLD | ATTR_UNDERLINE | ATTR_INVERSE
    );
  }

  #[test]
  fn indexed_and_rgb_colors_encode_distinctly() {
    let mut term = VtScreen::new(10, 2);
    term.advance(b"\x1b[31ma\x1b[38;2;10;20;30mb\x1b[0m");
    let frame = term.frame();
    assert_eq!(frame.cells[0][0].fg, COLOR_INDEXED | 1);
    assert_eq!(frame.cells[0][1].fg, COLOR_RGB | (10 << 16) | (20 << 8) | 30);
  }

  #[test]
  fn title_tracks_osc() {
    let mut term = VtScreen::new(10, 2);
    term.advance(b"\x1b]2;hello title\x07");
    assert_eq!(term.title(), "hello title");
  }

  #[test]
  fn bell_count_is_monotonic() {
    let mut term = VtScreen::new(10, 2);
    assert_eq!(term.bell_count(), 0);
    term.advance(b"\x07\x07");
    assert_eq!(term.bell_count(), 2);
  }

  #[test]
  fn resize_changes_reported_size() {
    let mut term = VtScreen::new(10, 2);
    term.resize(33, 11);
    assert_eq!(term.size(), (33, 11));
    assert_eq!(term.frame().cols, 33);
    assert_eq!(term.frame().rows, 11);
  }

  #[test]
  fn frame_wire_shape() {
    let mut term = VtScreen::new(3, 1);
    term.advance(b"a");
    let value = term.frame().to_value();
    assert_eq!(value.get("full"), Some(&Value::Bool(true)));
    assert_eq!(value.get("cols").and_then(Value::as_u16), Some(3));
    let cells = value.get("cells").and_then(Value::as_array).unwrap();
    let row = cells[0].as_array().unwrap();
    assert_eq!(row[0].get("ch").and_then(Value::as_str), Some("a"));
    let cursor = value.get("cursor").unwrap();
    assert_eq!(cursor.get("col").and_then(Value::as_u16), Some(1));
  }
}
