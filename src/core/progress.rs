//! Progress wire format
//!
//! Stage children print one JSON object per line on stdout:
//!
//! ```text
//! {"type":"progress","message":"Writing","percent":42.5}
//! {"success":true,"message":"Image written"}
//! ```
//!
//! The relay parses these lines into [`WireMessage`], rescales them and
//! re-emits [`PipelineEvent`]s, which are serialized the same way (with
//! `stage`, `timestamp`, `kind`, `detail` and `run_id` added) and optionally
//! wrapped as push-event frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use uuid::Uuid;

use crate::core::pipeline::Stage;
use crate::error::{ErrorKind, PipelineError};

/// Discriminator for progress lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressTag {
    Progress,
}

/// A progress line as printed by a stage child
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressLine {
    #[serde(rename = "type")]
    pub tag: ProgressTag,
    pub message: String,
    /// Local percent (0-100), or null when the total is unknown
    #[serde(default)]
    pub percent: Option<f64>,
}

impl ProgressLine {
    pub fn new(message: impl Into<String>, percent: Option<f64>) -> Self {
        Self {
            tag: ProgressTag::Progress,
            message: message.into(),
            percent,
        }
    }
}

/// Terminal object closing a stage or a whole run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TerminalEvent {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
}

impl TerminalEvent {
    /// Successful outcome
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Failed outcome built from a pipeline error
    pub fn failure(err: &PipelineError) -> Self {
        Self {
            success: false,
            error: Some(err.user_message()),
            kind: Some(err.kind()),
            detail: err.detail(),
            ..Self::default()
        }
    }

    /// Attach the stage the outcome belongs to
    #[must_use]
    pub fn at_stage(mut self, stage: Stage) -> Self {
        self.stage = Some(stage);
        self
    }

    /// Attach the run identifier
    #[must_use]
    pub fn for_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

/// One line of child output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireMessage {
    Progress(ProgressLine),
    Terminal(TerminalEvent),
}

/// Parse one stdout line of a stage child
///
/// Returns `Ok(None)` for blank lines.
pub fn parse_line(line: &str) -> Result<Option<WireMessage>, serde_json::Error> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed).map(Some)
}

/// Normalized progress event forwarded to observers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    #[serde(rename = "type")]
    pub tag: ProgressTag,
    pub stage: Stage,
    pub message: String,
    /// Overall percent, or null when the stage reported none
    pub percent: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn new(stage: Stage, message: impl Into<String>, percent: Option<f64>) -> Self {
        Self {
            tag: ProgressTag::Progress,
            stage,
            message: message.into(),
            percent,
            timestamp: Utc::now(),
        }
    }
}

/// Event on the relay -> observer channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PipelineEvent {
    Progress(ProgressEvent),
    Finished(TerminalEvent),
}

impl PipelineEvent {
    /// Whether this event closes the stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished(_))
    }

    /// Overall percent carried by the event, if any
    pub fn percent(&self) -> Option<f64> {
        match self {
            Self::Progress(p) => p.percent,
            Self::Finished(_) => None,
        }
    }

    /// Serialize as one JSON line (without the trailing newline)
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"success":false,"error":"unserializable event: {e}"}}"#)
        })
    }

    /// Serialize as one push-event frame
    pub fn to_sse_frame(&self) -> String {
        sse_frame(&self.to_json())
    }
}

/// Wrap a JSON payload as a push-event frame
pub fn sse_frame(json: &str) -> String {
    format!("data: {json}\n\n")
}

/// Writes stage output as newline-delimited JSON
///
/// Each object is flushed immediately so the relay sees progress as it
/// happens.
pub struct LineEmitter<W: Write> {
    out: W,
}

impl<W: Write> LineEmitter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Emit a progress line
    pub fn progress(&mut self, message: &str, percent: Option<f64>) -> io::Result<()> {
        self.write(&ProgressLine::new(message, percent))
    }

    /// Emit the terminal line
    pub fn finish(&mut self, terminal: &TerminalEvent) -> io::Result<()> {
        self.write(terminal)
    }

    fn write<T: Serialize>(&mut self, value: &T) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, value)?;
        self.out.write_all(b"\n")?;
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_progress_line() {
        let msg = parse_line(r#"{"type":"progress","message":"Formatting","percent":40}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            msg,
            WireMessage::Progress(ProgressLine::new("Formatting", Some(40.0)))
        );
    }

    #[test]
    fn test_parse_null_percent() {
        let msg = parse_line(r#"{"type":"progress","message":"Downloading","percent":null}"#)
            .unwrap()
            .unwrap();
        match msg {
            WireMessage::Progress(p) => assert_eq!(p.percent, None),
            WireMessage::Terminal(_) => panic!("expected progress"),
        }
    }

    #[test]
    fn test_parse_terminal_line() {
        let msg = parse_line(
            r#"{"success":false,"error":"denied","kind":"PrivilegeError","detail":"dd: Permission denied"}"#,
        )
        .unwrap()
        .unwrap();
        match msg {
            WireMessage::Terminal(t) => {
                assert!(!t.success);
                assert_eq!(t.kind, Some(ErrorKind::PrivilegeError));
                assert_eq!(t.detail.as_deref(), Some("dd: Permission denied"));
            }
            WireMessage::Progress(_) => panic!("expected terminal"),
        }
    }

    #[test]
    fn test_parse_blank_and_malformed() {
        assert!(parse_line("   ").unwrap().is_none());
        assert!(parse_line("not json").is_err());
        assert!(parse_line(r#"{"type":"other","message":"x"}"#).is_err());
    }

    #[test]
    fn test_terminal_omits_empty_fields() {
        let json = serde_json::to_string(&TerminalEvent::success("done")).unwrap();
        assert_eq!(json, r#"{"success":true,"message":"done"}"#);
    }

    #[test]
    fn test_progress_event_serializes_null_percent() {
        let event = PipelineEvent::Progress(ProgressEvent::new(Stage::Downloading, "x", None));
        let json = event.to_json();
        assert!(json.contains(r#""type":"progress""#));
        assert!(json.contains(r#""stage":"downloading""#));
        assert!(json.contains(r#""percent":null"#));
    }

    #[test]
    fn test_sse_frame_format() {
        assert_eq!(sse_frame(r#"{"a":1}"#), "data: {\"a\":1}\n\n");
        let frame = PipelineEvent::Finished(TerminalEvent::success("ok")).to_sse_frame();
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("}\n\n"));
    }

    #[test]
    fn test_line_emitter_writes_ndjson() {
        let mut emitter = LineEmitter::new(Vec::new());
        emitter.progress("Start", Some(0.0)).unwrap();
        emitter.finish(&TerminalEvent::success("done")).unwrap();
        let text = String::from_utf8(emitter.into_inner()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(matches!(
            parse_line(lines[1]).unwrap(),
            Some(WireMessage::Terminal(_))
        ));
    }

    fn percent_strategy() -> impl Strategy<Value = Option<f64>> {
        prop::option::of((0u32..=10_000).prop_map(|n| f64::from(n) / 100.0))
    }

    proptest! {
        /// A progress line survives emit -> parse with identical message and percent
        #[test]
        fn prop_progress_roundtrip(message in "[ -~]{0,64}", percent in percent_strategy()) {
            let mut emitter = LineEmitter::new(Vec::new());
            emitter.progress(&message, percent).unwrap();
            let text = String::from_utf8(emitter.into_inner()).unwrap();
            match parse_line(&text).unwrap() {
                Some(WireMessage::Progress(line)) => {
                    prop_assert_eq!(line.message, message);
                    prop_assert_eq!(line.percent, percent);
                }
                other => prop_assert!(false, "unexpected parse result: {:?}", other),
            }
        }
    }
}
