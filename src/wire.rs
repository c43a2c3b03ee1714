//! C4: the line-oriented binary protocol a worker speaks to the parent over its pipe.
//!
//! There is no off-the-shelf crate for this in the Rust ecosystem, so unlike the upstream design
//! (which patches one entry point of a third-party subunit decoder) this module owns the whole
//! protocol. The one deliberately-preserved quirk from upstream is that the reader never requires
//! a directive's test to have been opened by a preceding `test:` line -- an `error:` directive can
//! arrive "outside" any open test (this happens when a worker's class-level setup fails before any
//! test of that class ever starts) and the reader synthesizes a remote test for it instead of
//! erroring out.
//!
//! Frame grammar, one frame per outcome:
//!
//! ```text
//! <directive> <test_id>\n
//! [exception <type_len> <message_len> <traceback_len>\n<type bytes><message bytes><traceback bytes>]
//! [attachment <name> <mime_type> <len>\n<len bytes>]*
//! end\n
//! ```
//!
//! `test_id`, directive names, attachment names and MIME types must not contain whitespace or
//! newlines; this is a constraint of the wire format, not of the data model.

use std::collections::{BTreeMap, HashSet};
use std::io::{self, BufRead, BufReader, Read, Write};

use thiserror::Error;

use crate::testcase::{Attachment, ExceptionInfo, Outcome, OutcomeKind};

#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error on wire stream")]
    Io(#[from] io::Error),
    #[error("malformed directive line: {0:?}")]
    MalformedLine(String),
    #[error("unknown directive {0:?}")]
    UnknownDirective(String),
    #[error("non-utf8 data on wire stream")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("frame for {test_id:?} was not terminated with an `end` line")]
    Unterminated { test_id: String },
}

fn directive_name(kind: OutcomeKind) -> &'static str {
    match kind {
        OutcomeKind::Success => "success",
        OutcomeKind::Failure => "failure",
        OutcomeKind::Error => "error",
        OutcomeKind::ExpectedFailure => "xfail",
        OutcomeKind::UnexpectedSuccess => "uxsuccess",
        OutcomeKind::Skipped => "skip",
        OutcomeKind::Unknown => "unknown",
    }
}

fn directive_kind(name: &str) -> Result<OutcomeKind, WireError> {
    Ok(match name {
        "success" => OutcomeKind::Success,
        "failure" => OutcomeKind::Failure,
        "error" => OutcomeKind::Error,
        "xfail" => OutcomeKind::ExpectedFailure,
        "uxsuccess" => OutcomeKind::UnexpectedSuccess,
        "skip" => OutcomeKind::Skipped,
        "unknown" => OutcomeKind::Unknown,
        other => return Err(WireError::UnknownDirective(other.to_string())),
    })
}

/// Writes outcomes to a pipe, child→parent. One frame per call, flushed immediately so a crash
/// mid-run never loses a completed frame.
pub struct WireWriter<W: Write> {
    out: W,
}

impl<W: Write> WireWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn write_start(&mut self, test_id: &str) -> Result<(), WireError> {
        writeln!(self.out, "test {test_id}")?;
        self.out.flush()?;
        Ok(())
    }

    pub fn write_outcome(&mut self, outcome: &Outcome) -> Result<(), WireError> {
        writeln!(
            self.out,
            "{} {}",
            directive_name(outcome.kind),
            outcome.test_id
        )?;
        if let Some(exc) = &outcome.exception {
            writeln!(
                self.out,
                "exception {} {} {}",
                exc.type_tag.len(),
                exc.message.len(),
                exc.traceback.len()
            )?;
            self.out.write_all(exc.type_tag.as_bytes())?;
            self.out.write_all(exc.message.as_bytes())?;
            self.out.write_all(exc.traceback.as_bytes())?;
        }
        for (name, attachment) in &outcome.attachments {
            writeln!(
                self.out,
                "attachment {name} {} {}",
                attachment.mime_type,
                attachment.bytes.len()
            )?;
            self.out.write_all(&attachment.bytes)?;
        }
        writeln!(self.out, "end")?;
        self.out.flush()?;
        Ok(())
    }

    /// The sandbox-setup-failure path: a single atomic write of an error outcome with no
    /// preceding `test:` line, used when things go wrong before any test ever ran. Unlike
    /// `write_outcome`, this renders the whole frame into one buffer first and commits it with a
    /// single `write_all` call, so a concurrent writer on the same fd can never interleave with it
    /// mid-frame.
    pub fn write_error_outside_test(&mut self, test_id: &str, message: &str) -> Result<(), WireError> {
        let type_tag = "BrokenRunner";
        let mut frame = Vec::new();
        frame.extend_from_slice(format!("{} {test_id}\n", directive_name(OutcomeKind::Error)).as_bytes());
        frame.extend_from_slice(
            format!(
                "exception {} {} {}\n",
                type_tag.len(),
                message.len(),
                message.len()
            )
            .as_bytes(),
        );
        frame.extend_from_slice(type_tag.as_bytes());
        frame.extend_from_slice(message.as_bytes());
        frame.extend_from_slice(message.as_bytes());
        frame.extend_from_slice(b"end\n");

        self.out.write_all(&frame)?;
        self.out.flush()?;
        Ok(())
    }
}

/// A parsed frame, with a flag marking whether its test was "open" (preceded by a `test:` line)
/// when it arrived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    pub outcome: Outcome,
    pub synthesized: bool,
}

/// Reads outcomes from a pipe, parent side. Tracks which test ids have been opened via `test:`
/// lines so it can flag (not reject) directives that arrive without one.
pub struct WireReader<R: Read> {
    lines: BufReader<R>,
    open_tests: HashSet<String>,
}

impl<R: Read> WireReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            lines: BufReader::new(inner),
            open_tests: HashSet::new(),
        }
    }

    fn read_line(&mut self) -> Result<Option<String>, WireError> {
        let mut buf = String::new();
        let n = self.lines.read_line(&mut buf)?;
        if n == 0 {
            return Ok(None);
        }
        if buf.ends_with('\n') {
            buf.pop();
        }
        Ok(Some(buf))
    }

    fn read_exact_bytes(&mut self, len: usize) -> Result<Vec<u8>, WireError> {
        let mut buf = vec![0u8; len];
        self.lines.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Reads the next frame, or `None` on clean EOF between frames.
    pub fn read_frame(&mut self) -> Result<Option<ParsedFrame>, WireError> {
        loop {
            let Some(line) = self.read_line()? else {
                return Ok(None);
            };
            if line.is_empty() {
                continue;
            }
            let mut parts = line.splitn(2, ' ');
            let directive = parts
                .next()
                .ok_or_else(|| WireError::MalformedLine(line.clone()))?;

            if directive == "test" {
                let test_id = parts
                    .next()
                    .ok_or_else(|| WireError::MalformedLine(line.clone()))?
                    .to_string();
                self.open_tests.insert(test_id);
                continue;
            }

            let test_id = parts
                .next()
                .ok_or_else(|| WireError::MalformedLine(line.clone()))?
                .to_string();
            let kind = directive_kind(directive)?;
            let synthesized = !self.open_tests.contains(&test_id);
            self.open_tests.insert(test_id.clone());

            let mut outcome = Outcome::new(test_id.clone(), kind);

            // Optional exception header.
            let maybe_exc_line = self.read_line()?.ok_or(WireError::Unterminated {
                test_id: test_id.clone(),
            })?;
            let mut next_line = Some(maybe_exc_line);

            if let Some(rest) = next_line.as_deref().and_then(|l| l.strip_prefix("exception ")) {
                let lens: Vec<usize> = rest
                    .split(' ')
                    .map(|s| s.parse().map_err(|_| WireError::MalformedLine(rest.to_string())))
                    .collect::<Result<_, _>>()?;
                let [type_len, msg_len, tb_len] = lens[..] else {
                    return Err(WireError::MalformedLine(rest.to_string()));
                };
                let type_tag = String::from_utf8(self.read_exact_bytes(type_len)?)?;
                let message = String::from_utf8(self.read_exact_bytes(msg_len)?)?;
                let traceback = String::from_utf8(self.read_exact_bytes(tb_len)?)?;
                outcome.exception = Some(ExceptionInfo {
                    type_tag,
                    message,
                    traceback,
                });
                next_line = self.read_line()?;
            }

            let mut attachments = BTreeMap::new();
            loop {
                let Some(l) = next_line.take() else {
                    return Err(WireError::Unterminated { test_id });
                };
                if l == "end" {
                    break;
                }
                let Some(rest) = l.strip_prefix("attachment ") else {
                    return Err(WireError::MalformedLine(l));
                };
                let mut fields = rest.splitn(3, ' ');
                let name = fields
                    .next()
                    .ok_or_else(|| WireError::MalformedLine(rest.to_string()))?
                    .to_string();
                let mime_type = fields
                    .next()
                    .ok_or_else(|| WireError::MalformedLine(rest.to_string()))?
                    .to_string();
                let len: usize = fields
                    .next()
                    .ok_or_else(|| WireError::MalformedLine(rest.to_string()))?
                    .parse()
                    .map_err(|_| WireError::MalformedLine(rest.to_string()))?;
                let bytes = self.read_exact_bytes(len)?;
                attachments.insert(name, Attachment { mime_type, bytes });
                next_line = self.read_line()?;
            }
            outcome.attachments = attachments;

            return Ok(Some(ParsedFrame {
                outcome,
                synthesized,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use serde_json::json;
    use test_case::test_case;

    use super::*;
    use crate::testcase::Attachment as Att;

    #[test_case(OutcomeKind::Success; "success")]
    #[test_case(OutcomeKind::Failure; "failure")]
    #[test_case(OutcomeKind::Error; "error")]
    #[test_case(OutcomeKind::ExpectedFailure; "xfail")]
    #[test_case(OutcomeKind::UnexpectedSuccess; "uxsuccess")]
    #[test_case(OutcomeKind::Skipped; "skip")]
    #[test_case(OutcomeKind::Unknown; "unknown")]
    fn every_outcome_kind_round_trips(kind: OutcomeKind) {
        let mut buf = Vec::new();
        WireWriter::new(&mut buf)
            .write_outcome(&Outcome::new("mod.Class.test_a", kind))
            .unwrap();
        let mut r = WireReader::new(Cursor::new(buf));
        let frame = r.read_frame().unwrap().expect("a frame");
        assert_eq!(frame.outcome.kind, kind);
    }

    #[test]
    fn round_trips_plain_success() {
        let mut buf = Vec::new();
        {
            let mut w = WireWriter::new(&mut buf);
            w.write_start("mod.Class.test_a").unwrap();
            w.write_outcome(&Outcome::new("mod.Class.test_a", OutcomeKind::Success))
                .unwrap();
        }
        let mut r = WireReader::new(Cursor::new(buf));
        let frame = r.read_frame().unwrap().expect("a frame");
        assert_eq!(frame.outcome.test_id, "mod.Class.test_a");
        assert_eq!(frame.outcome.kind, OutcomeKind::Success);
        assert!(!frame.synthesized);
        assert!(r.read_frame().unwrap().is_none());
    }

    #[test]
    fn round_trips_exception_and_attachments() {
        let mut outcome = Outcome::new("mod.Class.test_b", OutcomeKind::Failure).with_exception(
            ExceptionInfo {
                type_tag: "AssertionError".to_string(),
                message: "boom".to_string(),
                traceback: "line 1\nline 2".to_string(),
            },
        );
        outcome.attachments.insert(
            "extraresults".to_string(),
            Att::json(&json!({"k": [1, 2, 3]})),
        );

        let mut buf = Vec::new();
        WireWriter::new(&mut buf).write_outcome(&outcome).unwrap();
        let mut r = WireReader::new(Cursor::new(buf));
        let frame = r.read_frame().unwrap().expect("a frame");
        assert_eq!(frame.outcome, outcome);
    }

    #[test_log::test]
    fn error_outside_test_is_flagged_but_accepted() {
        let mut buf = Vec::new();
        // No preceding `test:` line for this id -- simulates a class-setup failure.
        WireWriter::new(&mut buf)
            .write_error_outside_test("mod.Class.setUpClass", "boom")
            .unwrap();
        let mut r = WireReader::new(Cursor::new(buf));
        let frame = r.read_frame().unwrap().expect("a frame");
        assert_eq!(frame.outcome.test_id, "mod.Class.setUpClass");
        assert_eq!(frame.outcome.kind, OutcomeKind::Error);
        assert!(frame.synthesized);
    }

    #[test]
    fn error_inside_opened_test_is_not_flagged() {
        let mut buf = Vec::new();
        {
            let mut w = WireWriter::new(&mut buf);
            w.write_start("mod.Class.test_c").unwrap();
            w.write_outcome(&Outcome::new("mod.Class.test_c", OutcomeKind::Error))
                .unwrap();
        }
        let mut r = WireReader::new(Cursor::new(buf));
        let frame = r.read_frame().unwrap().expect("a frame");
        assert!(!frame.synthesized);
    }

    #[test]
    fn multiple_frames_in_sequence() {
        let mut buf = Vec::new();
        {
            let mut w = WireWriter::new(&mut buf);
            for i in 0..5 {
                let id = format!("mod.Class.test_{i}");
                w.write_start(&id).unwrap();
                w.write_outcome(&Outcome::new(id.clone(), OutcomeKind::Success))
                    .unwrap();
            }
        }
        let mut r = WireReader::new(Cursor::new(buf));
        for i in 0..5 {
            let frame = r.read_frame().unwrap().unwrap();
            assert_eq!(frame.outcome.test_id, format!("mod.Class.test_{i}"));
        }
        assert!(r.read_frame().unwrap().is_none());
    }
}
