//! Symbolic key names accepted by `input {"key": "..."}` (§3 supplement),
//! mapped to the common xterm escape sequences.

use once_cell::sync::Lazy;
use std::collections::HashMap;

static KEY_TABLE: Lazy<HashMap<&'static str, &'static [u8]>> = Lazy::new(|| {
    let mut m = HashMap::new();
    m.insert("enter", b"\r".as_slice());
    m.insert("escape", b"\x1b".as_slice());
    m.insert("tab", b"\t".as_slice());
    m.insert("backspace", b"\x7f".as_slice());
    m.insert("space", b" ".as_slice());
    m.insert("arrow_up", b"\x1b[A".as_slice());
    m.insert("arrow_down", b"\x1b[B".as_slice());
    m.insert("arrow_right", b"\x1b[C".as_slice());
    m.insert("arrow_left", b"\x1b[D".as_slice());
    m.insert("home", b"\x1b[H".as_slice());
    m.insert("end", b"\x1b[F".as_slice());
    m.insert("page_up", b"\x1b[5~".as_slice());
    m.insert("page_down", b"\x1b[6~".as_slice());
    m.insert("delete", b"\x1b[3~".as_slice());
    m.insert("ctrl_a", b"\x01".as_slice());
    m.insert("ctrl_c", b"\x03".as_slice());
    m.insert("ctrl_d", b"\x04".as_slice());
    m.insert("ctrl_z", b"\x1a".as_slice());
    m
});

/// Resolves a symbolic key name to its byte sequence. Unknown names are
/// the caller's responsibility to reject (`InvalidRequest`).
pub fn lookup(name: &str) -> Option<&'static [u8]> {
    KEY_TABLE.get(name).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_keys() {
        assert_eq!(lookup("enter"), Some(b"\r".as_slice()));
        assert_eq!(lookup("ctrl_c"), Some(b"\x03".as_slice()));
    }

    #[test]
    fn rejects_unknown_keys() {
        assert_eq!(lookup("super_duper_key"), None);
    }
}
