//! C5: the parent-side inverse of [`crate::encode::Encoder`]. Reconstructs sub-test outcomes and
//! annotations from wire attachments and forwards the result to a sink.

use serde_json::Value;

use crate::testcase::{
    OutcomeKind, OutcomeSink, SubTestFailure, SubTestOutcome, ATTACHMENT_FORCED_UNKNOWN,
    ATTACHMENT_SUBTESTS,
};
use crate::wire::ParsedFrame;

/// Decodes one parsed wire frame and forwards it (and any sub-test outcomes nested inside it) to
/// `sink`. Drops the frame entirely (forwarding nothing) if it carries the `forced_unknown`
/// sentinel, since its sub-tests have already been forwarded by the time we get here.
pub fn decode_frame(frame: ParsedFrame, sink: &mut dyn OutcomeSink) {
    let ParsedFrame { mut outcome, .. } = frame;

    if let Some(subtests) = outcome.attachments.remove(ATTACHMENT_SUBTESTS) {
        match serde_json::from_slice::<Value>(&subtests.bytes) {
            Ok(Value::Object(map)) => {
                for (subtest_id, value) in map {
                    let failure = match value {
                        Value::Null => None,
                        Value::Object(obj) => {
                            let is_failure = obj.get("failure").and_then(Value::as_bool).unwrap_or(false);
                            let traceback = obj
                                .get("exception")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string();
                            Some(SubTestFailure {
                                is_failure,
                                traceback,
                            })
                        }
                        other => {
                            log::warn!("unexpected subtest outcome shape: {other:?}");
                            None
                        }
                    };
                    sink.add_sub_test(
                        &outcome.test_id,
                        SubTestOutcome {
                            subtest_id,
                            failure,
                        },
                    );
                }
            }
            Ok(other) => log::warn!("subtests attachment was not a JSON object: {other:?}"),
            Err(e) => log::warn!("failed to decode subtests attachment: {e}"),
        }
    }

    if outcome.attachments.remove(ATTACHMENT_FORCED_UNKNOWN).is_some() {
        // Sub-tests above have already been forwarded; the top-level outcome itself is a
        // bookkeeping artifact of the wire protocol requiring one directive per test.
        return;
    }

    match outcome.kind {
        OutcomeKind::Success => sink.add_success(outcome),
        OutcomeKind::Failure => sink.add_failure(outcome),
        OutcomeKind::Error => sink.add_error(outcome),
        OutcomeKind::ExpectedFailure => sink.add_expected_failure(outcome),
        OutcomeKind::UnexpectedSuccess => sink.add_unexpected_success(outcome),
        OutcomeKind::Skipped => sink.add_skipped(outcome),
        OutcomeKind::Unknown => sink.add_success(outcome),
    }
}
