//! Binary cell buffer wire format (§4.E): a compact run-length-encoded
//! snapshot of a `vt100::Screen`, cheap enough to emit on every flush
//! without re-serializing the full grid as text.
//!
//! ```text
//! HEADER: magic[4]="VTCB" | version:u8 | flags:u8 | rows:u16 | cols:u16
//!         | cursorRow:u16 | cursorCol:u16 | reserved:u16
//! CELLS:  one run per (kind, ...) until the screen is exhausted
//!         kind=0 blank-run:  count:u16
//!         kind=1 cell-run:   count:u16, attr:u32, count x codepoint:u32
//!         kind=2 row-break:  (no body, emitted once per row)
//! ```
//!
//! `attr` packs `fg:11 | bg:11 | style:10` high-to-low. Each 11-bit color
//! is itself `is_rgb:1 | value:10`: a palette index is `value - 1` (0
//! means "terminal default"); an RGB color truncates to 4/3/3 bits.

use bytes::{BufMut, Bytes, BytesMut};

const MAGIC: &[u8; 4] = b"VTCB";
const VERSION: u8 = 1;

const KIND_BLANK_RUN: u8 = 0;
const KIND_CELL_RUN: u8 = 1;
const KIND_ROW_BREAK: u8 = 2;

const STYLE_BOLD: u16 = 1 << 0;
const STYLE_ITALIC: u16 = 1 << 1;
const STYLE_UNDERLINE: u16 = 1 << 2;
const STYLE_INVERSE: u16 = 1 << 3;
const STYLE_FAINT: u16 = 1 << 4;
const STYLE_STRIKE: u16 = 1 << 5;

fn pack_color(color: vt100::Color) -> u16 {
    match color {
        vt100::Color::Default => 0,
        vt100::Color::Idx(i) => 1 + i as u16,
        vt100::Color::Rgb(r, g, b) => {
            let tr = (r >> 4) as u16 & 0xF;
            let tg = (g >> 5) as u16 & 0x7;
            let tb = (b >> 5) as u16 & 0x7;
            (1 << 10) | (tr << 6) | (tg << 3) | tb
        }
    }
}

fn cell_attr(cell: &vt100::Cell) -> u32 {
    let fg = pack_color(cell.fgcolor()) as u32;
    let bg = pack_color(cell.bgcolor()) as u32;
    let mut style: u16 = 0;
    if cell.bold() {
        style |= STYLE_BOLD;
    }
    if cell.italic() {
        style |= STYLE_ITALIC;
    }
    if cell.underline() {
        style |= STYLE_UNDERLINE;
    }
    if cell.inverse() {
        style |= STYLE_INVERSE;
    }
    style &= 0x3FF;
    (fg << 21) | (bg << 10) | style as u32
}

fn is_blank(cell: &vt100::Cell) -> bool {
    cell.contents().is_empty()
        && matches!(cell.fgcolor(), vt100::Color::Default)
        && matches!(cell.bgcolor(), vt100::Color::Default)
        && !cell.bold()
        && !cell.italic()
        && !cell.underline()
        && !cell.inverse()
}

fn codepoint(cell: &vt100::Cell) -> u32 {
    cell.contents().chars().next().map(|c| c as u32).unwrap_or(0x20)
}

/// Encodes the current screen contents as a `VTCB` frame. `flags` bit 0
/// signals cursor visibility; the rest are reserved.
pub fn encode_snapshot(screen: &vt100::Screen) -> Bytes {
    let (rows, cols) = screen.size();
    let (cursor_row, cursor_col) = screen.cursor_position();
    let mut flags: u8 = 0;
    if !screen.hide_cursor() {
        flags |= 1;
    }

    let mut buf = BytesMut::with_capacity(16 + rows as usize * cols as usize);
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(flags);
    buf.put_u16_le(rows);
    buf.put_u16_le(cols);
    buf.put_u16_le(cursor_row);
    buf.put_u16_le(cursor_col);
    buf.put_u16_le(0);

    for row in 0..rows {
        let mut col = 0u16;
        while col < cols {
            let Some(cell) = screen.cell(row, col) else {
                break;
            };
            if is_blank(&cell) {
                let start = col;
                col += 1;
                while col < cols {
                    match screen.cell(row, col) {
                        Some(c) if is_blank(&c) => col += 1,
                        _ => break,
                    }
                }
                buf.put_u8(KIND_BLANK_RUN);
                buf.put_u16_le(col - start);
            } else {
                let attr = cell_attr(&cell);
                let start = col;
                let mut codepoints = vec![codepoint(&cell)];
                col += 1;
                while col < cols {
                    match screen.cell(row, col) {
                        Some(c) if !is_blank(&c) && cell_attr(&c) == attr => {
                            codepoints.push(codepoint(&c));
                            col += 1;
                        }
                        _ => break,
                    }
                }
                buf.put_u8(KIND_CELL_RUN);
                buf.put_u16_le(col - start);
                buf.put_u32_le(attr);
                for cp in codepoints {
                    buf.put_u32_le(cp);
                }
            }
        }
        buf.put_u8(KIND_ROW_BREAK);
    }

    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_screen_is_one_blank_run_per_row() {
        let parser = vt100::Parser::new(2, 4, 0);
        let frame = encode_snapshot(parser.screen());
        assert_eq!(&frame[0..4], MAGIC);
        assert_eq!(frame[4], VERSION);
    }

    #[test]
    fn written_text_yields_a_cell_run() {
        let mut parser = vt100::Parser::new(1, 10, 0);
        parser.process(b"hi");
        let frame = encode_snapshot(parser.screen());
        // magic+version+flags+rows+cols+cursorRow+cursorCol+reserved = 14 bytes
        assert_eq!(frame[14], KIND_CELL_RUN);
    }
}
