use std::collections::HashMap;
use std::fmt;

use serde::de::{self, SeqAccess, Visitor};
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// First line of a recording file (§3 "Recording").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingHeader {
    pub version: u32,
    pub rows: u16,
    pub cols: u16,
    pub started_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl RecordingHeader {
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(rows: u16, cols: u16, env: HashMap<String, String>) -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            rows,
            cols,
            started_at: chrono::Utc::now(),
            env,
        }
    }
}

/// The discriminant of a recording event line, `kind` in §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Output,
    InputEcho,
    Resize,
}

impl EventKind {
    /// The single-character tag used on the wire (§3: `kind ∈ {"o","i","r"}`).
    pub fn tag(self) -> &'static str {
        self.as_tag()
    }

    fn as_tag(self) -> &'static str {
        match self {
            EventKind::Output => "o",
            EventKind::InputEcho => "i",
            EventKind::Resize => "r",
        }
    }

    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "o" => Some(EventKind::Output),
            "i" => Some(EventKind::InputEcho),
            "r" => Some(EventKind::Resize),
            _ => None,
        }
    }
}

/// One line of the recording: `[elapsedSeconds, kind, payload]`.
///
/// Payload is raw terminal bytes for output/input-echo events (kept as a
/// lossy UTF-8 string on the wire, matching the JSON-escaped newline
/// invariant in §4.A) or a `"COLSxROWS"` string for resize events.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingEvent {
    pub elapsed_seconds: f64,
    pub kind: EventKind,
    pub payload: String,
}

impl RecordingEvent {
    pub fn output(elapsed_seconds: f64, bytes: &[u8]) -> Self {
        Self {
            elapsed_seconds,
            kind: EventKind::Output,
            payload: String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    pub fn input_echo(elapsed_seconds: f64, bytes: &[u8]) -> Self {
        Self {
            elapsed_seconds,
            kind: EventKind::InputEcho,
            payload: String::from_utf8_lossy(bytes).into_owned(),
        }
    }

    pub fn resize(elapsed_seconds: f64, cols: u16, rows: u16) -> Self {
        Self {
            elapsed_seconds,
            kind: EventKind::Resize,
            payload: format!("{cols}x{rows}"),
        }
    }

    /// Parses a `"COLSxROWS"` resize payload. Only meaningful when
    /// `self.kind == EventKind::Resize`.
    pub fn parse_resize(&self) -> Option<(u16, u16)> {
        let (cols, rows) = self.payload.split_once('x')?;
        Some((cols.parse().ok()?, rows.parse().ok()?))
    }
}

impl Serialize for RecordingEvent {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(3))?;
        seq.serialize_element(&self.elapsed_seconds)?;
        seq.serialize_element(self.kind.as_tag())?;
        seq.serialize_element(&self.payload)?;
        seq.end()
    }
}

impl<'de> Deserialize<'de> for RecordingEvent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EventVisitor;

        impl<'de> Visitor<'de> for EventVisitor {
            type Value = RecordingEvent;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a 3-element [elapsed, kind, payload] array")
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let elapsed_seconds: f64 = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let tag: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let payload: String = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;
                let kind = EventKind::from_tag(&tag)
                    .ok_or_else(|| de::Error::custom(format!("unknown event kind {tag:?}")))?;
                Ok(RecordingEvent {
                    elapsed_seconds,
                    kind,
                    payload,
                })
            }
        }

        deserializer.deserialize_seq(EventVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_output_event() {
        let event = RecordingEvent::output(1.5, b"hello\n");
        let line = serde_json::to_string(&event).unwrap();
        assert_eq!(line, r#"[1.5,"o","hello\n"]"#);
        let back: RecordingEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn round_trips_resize_event() {
        let event = RecordingEvent::resize(0.2, 80, 24);
        let line = serde_json::to_string(&event).unwrap();
        let back: RecordingEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(back.parse_resize(), Some((80, 24)));
        assert_eq!(line, r#"[0.2,"r","80x24"]"#);
    }

    #[test]
    fn rejects_unknown_kind() {
        let err = serde_json::from_str::<RecordingEvent>(r#"[0.0,"x",""]"#).unwrap_err();
        assert!(err.to_string().contains("unknown event kind"));
    }
}
