//! C3: the worker-side encoder. Wraps a [`WireWriter`] so that per-test auxiliary data (free-form
//! annotations, sub-test outcomes) gets folded into wire-protocol attachments instead of requiring
//! protocol changes.

use std::collections::HashMap;
use std::collections::HashSet;
use std::io::Write;

use serde_json::Value;

use crate::testcase::{
    Attachment, ExceptionInfo, Outcome, OutcomeSink, SubTestFailure, SubTestOutcome,
    ATTACHMENT_EXTRARESULTS, ATTACHMENT_FORCED_UNKNOWN, ATTACHMENT_SUBTESTS, ATTACHMENT_TRACEBACK,
};
use crate::wire::WireWriter;

/// Wraps a [`WireWriter`], multiplexing sub-test outcomes and free-form annotations through
/// reserved attachment keys before handing the outcome off to the wire.
pub struct Encoder<W: Write> {
    wire: WireWriter<W>,
    annotations: HashMap<String, HashMap<String, Value>>,
    subtests: HashMap<String, Vec<(String, Option<SubTestFailure>)>>,
    emitted: HashSet<String>,
}

impl<W: Write> Encoder<W> {
    pub fn new(wire: WireWriter<W>) -> Self {
        Self {
            wire,
            annotations: HashMap::new(),
            subtests: HashMap::new(),
            emitted: HashSet::new(),
        }
    }

    /// Called by the worker's test-running loop immediately before [`OutcomeSink::start_test`],
    /// since the annotations live on the `TestCase`, not on any `OutcomeSink` call.
    pub fn note_annotations(&mut self, test_id: &str, annotations: HashMap<String, Value>) {
        if !annotations.is_empty() {
            self.annotations.insert(test_id.to_string(), annotations);
        }
    }

    fn render_traceback(exc: &ExceptionInfo) -> String {
        format!("{}: {}\n{}", exc.type_tag, exc.message, exc.traceback)
    }

    fn finish(&mut self, mut outcome: Outcome) {
        self.emitted.insert(outcome.test_id.clone());

        if let Some(annotations) = self.annotations.remove(&outcome.test_id) {
            let value = Value::Object(annotations.into_iter().collect());
            outcome
                .attachments
                .insert(ATTACHMENT_EXTRARESULTS.to_string(), Attachment::json(&value));
        }

        if let Some(subtests) = self.subtests.remove(&outcome.test_id) {
            let mut obj = serde_json::Map::new();
            for (sub_id, failure) in subtests {
                let entry = match failure {
                    None => Value::Null,
                    Some(f) => {
                        let mut m = serde_json::Map::new();
                        m.insert("failure".to_string(), Value::Bool(f.is_failure));
                        m.insert("exception".to_string(), Value::String(f.traceback));
                        Value::Object(m)
                    }
                };
                obj.insert(sub_id, entry);
            }
            outcome.attachments.insert(
                ATTACHMENT_SUBTESTS.to_string(),
                Attachment::json(&Value::Object(obj)),
            );
        }

        // The downstream wire schema treats a structured exception and arbitrary attachments as
        // mutually exclusive in one frame: if we're about to attach anything, render the
        // exception as a traceback attachment instead of carrying it as a structured field.
        if !outcome.attachments.is_empty() {
            if let Some(exc) = outcome.exception.take() {
                outcome.attachments.insert(
                    ATTACHMENT_TRACEBACK.to_string(),
                    Attachment::text(Self::render_traceback(&exc)),
                );
            }
        }

        if let Err(e) = self.wire.write_outcome(&outcome) {
            log::error!("failed to write outcome for {}: {e}", outcome.test_id);
        }
    }
}

impl<W: Write> OutcomeSink for Encoder<W> {
    fn start_test(&mut self, test_id: &str) {
        if let Err(e) = self.wire.write_start(test_id) {
            log::error!("failed to write test-start for {test_id}: {e}");
        }
    }

    fn stop_test(&mut self, test_id: &str) {
        let has_real_outcome = self.subtests.get(test_id).map_or(true, |subtests| {
            !subtests.iter().any(|(_, f)| f.is_some())
        }) || self.emitted.contains(test_id);

        if !has_real_outcome {
            let mut outcome = Outcome::new(test_id, crate::testcase::OutcomeKind::Success);
            outcome
                .attachments
                .insert(ATTACHMENT_FORCED_UNKNOWN.to_string(), Attachment::empty());
            self.finish(outcome);
        }
    }

    fn add_success(&mut self, outcome: Outcome) {
        self.finish(outcome);
    }

    fn add_failure(&mut self, outcome: Outcome) {
        self.finish(outcome);
    }

    fn add_error(&mut self, outcome: Outcome) {
        self.finish(outcome);
    }

    fn add_expected_failure(&mut self, outcome: Outcome) {
        self.finish(outcome);
    }

    fn add_unexpected_success(&mut self, outcome: Outcome) {
        self.finish(outcome);
    }

    fn add_skipped(&mut self, outcome: Outcome) {
        self.finish(outcome);
    }

    fn add_sub_test(&mut self, parent_id: &str, sub: SubTestOutcome) {
        self.subtests
            .entry(parent_id.to_string())
            .or_default()
            .push((sub.subtest_id, sub.failure));
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testcase::OutcomeKind;
    use crate::wire::WireReader;

    fn roundtrip(buf: Vec<u8>) -> Vec<crate::wire::ParsedFrame> {
        let mut r = WireReader::new(std::io::Cursor::new(buf));
        let mut frames = Vec::new();
        while let Some(f) = r.read_frame().unwrap() {
            frames.push(f);
        }
        frames
    }

    #[test]
    fn attaches_extra_annotations() {
        let mut buf = Vec::new();
        {
            let mut enc = Encoder::new(WireWriter::new(&mut buf));
            let mut annotations = HashMap::new();
            annotations.insert("k".to_string(), json!([1, 2, 3]));
            enc.note_annotations("mod.Z.test_it", annotations);
            enc.start_test("mod.Z.test_it");
            enc.add_failure(
                Outcome::new("mod.Z.test_it", OutcomeKind::Failure).with_exception(
                    ExceptionInfo {
                        type_tag: "AssertionError".to_string(),
                        message: "nope".to_string(),
                        traceback: "tb".to_string(),
                    },
                ),
            );
            enc.stop_test("mod.Z.test_it");
        }
        let frames = roundtrip(buf);
        assert_eq!(frames.len(), 1);
        let outcome = &frames[0].outcome;
        assert_eq!(outcome.kind, OutcomeKind::Failure);
        assert!(outcome.exception.is_none(), "exception should be suppressed");
        let extraresults = outcome
            .attachments
            .get(ATTACHMENT_EXTRARESULTS)
            .expect("extraresults attachment");
        let decoded: Value = serde_json::from_slice(&extraresults.bytes).unwrap();
        assert_eq!(decoded, json!({"k": [1, 2, 3]}));
        assert!(outcome.attachments.contains_key(ATTACHMENT_TRACEBACK));
    }

    #[test]
    fn subtest_only_test_synthesizes_forced_unknown() {
        let mut buf = Vec::new();
        {
            let mut enc = Encoder::new(WireWriter::new(&mut buf));
            enc.start_test("mod.Y.test_it");
            enc.add_sub_test(
                "mod.Y.test_it",
                SubTestOutcome {
                    subtest_id: "y.a".to_string(),
                    failure: None,
                },
            );
            enc.add_sub_test(
                "mod.Y.test_it",
                SubTestOutcome {
                    subtest_id: "y.b".to_string(),
                    failure: Some(SubTestFailure {
                        is_failure: true,
                        traceback: "boom".to_string(),
                    }),
                },
            );
            enc.stop_test("mod.Y.test_it");
        }
        let frames = roundtrip(buf);
        assert_eq!(frames.len(), 1);
        let outcome = &frames[0].outcome;
        assert!(outcome.attachments.contains_key(ATTACHMENT_FORCED_UNKNOWN));
        let subtests_attachment = outcome.attachments.get(ATTACHMENT_SUBTESTS).unwrap();
        let decoded: Value = serde_json::from_slice(&subtests_attachment.bytes).unwrap();
        assert_eq!(decoded["y.a"], Value::Null);
        assert_eq!(decoded["y.b"]["failure"], Value::Bool(true));
    }

    #[test]
    fn top_level_outcome_with_subtests_does_not_force_unknown() {
        let mut buf = Vec::new();
        {
            let mut enc = Encoder::new(WireWriter::new(&mut buf));
            enc.start_test("mod.Y.test_it");
            enc.add_sub_test(
                "mod.Y.test_it",
                SubTestOutcome {
                    subtest_id: "y.a".to_string(),
                    failure: None,
                },
            );
            enc.add_success(Outcome::new("mod.Y.test_it", OutcomeKind::Success));
            enc.stop_test("mod.Y.test_it");
        }
        let frames = roundtrip(buf);
        assert_eq!(frames.len(), 1, "stop_test must not emit a second frame");
        assert!(!frames[0].outcome.attachments.contains_key(ATTACHMENT_FORCED_UNKNOWN));
    }
}
