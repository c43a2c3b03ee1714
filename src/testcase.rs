//! Core data model shared by every other module: the test cases the caller hands us, and the
//! outcomes we hand back.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;

use serde_json::Value;

/// A single test, opaque to the executor beyond the contract below.
///
/// Implementations are provided by the caller. The executor never inspects a `TestCase`'s
/// internals except through this trait.
pub trait TestCase: Send {
    /// Stable identifier for this test, e.g. `"mymodule.MyClass.test_something"`.
    fn id(&self) -> String;

    /// The module-qualified class that declared this test. Tests sharing a `class_key` are kept
    /// together by the partitioner so that class-level fixtures only run once per worker.
    fn class_key(&self) -> String;

    /// Free-form annotations the test wants attached to its outcome, e.g. structured performance
    /// numbers. Empty by default.
    fn extra_annotations(&self) -> HashMap<String, Value> {
        HashMap::new()
    }

    /// Give the sandbox a chance to rewrite paths embedded in this test's configuration after it
    /// relocates the build directory. `rewrite` maps an old path string to its replacement; tests
    /// that carry configured paths should apply it to each of their `config_paths` entries and
    /// write the results back. No-op by default.
    fn rewrite_config_paths(&mut self, _rewrite: &dyn Fn(&str) -> String) {}

    /// Run the test, reporting outcomes through `sink`. Runs entirely inside the worker process.
    fn run(&mut self, sink: &mut dyn OutcomeSink);
}

/// Ordered collection of tests; the executor's input. Partitioning consumes it by value so the
/// caller cannot keep using it afterwards (mirrors the upstream contract that the input suite is
/// drained).
pub struct TestSuite {
    pub(crate) cases: Vec<Box<dyn TestCase>>,
}

impl TestSuite {
    pub fn new(cases: Vec<Box<dyn TestCase>>) -> Self {
        Self { cases }
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

impl FromIterator<Box<dyn TestCase>> for TestSuite {
    fn from_iter<I: IntoIterator<Item = Box<dyn TestCase>>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// An exclusive subset of a [`TestSuite`] assigned to one worker.
pub struct Partition {
    pub cases: Vec<Box<dyn TestCase>>,
}

/// The kind of result a test (or synthesized remote test) produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    Failure,
    Error,
    ExpectedFailure,
    UnexpectedSuccess,
    Skipped,
    Unknown,
}

impl fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Error => "error",
            Self::ExpectedFailure => "xfail",
            Self::UnexpectedSuccess => "uxsuccess",
            Self::Skipped => "skip",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A structured exception/error, as reported by a failing or erroring test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionInfo {
    pub type_tag: String,
    pub message: String,
    pub traceback: String,
}

/// A named byte blob transported alongside an outcome, since the wire protocol only understands
/// opaque attachments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

impl Attachment {
    pub fn text(s: impl Into<String>) -> Self {
        Self {
            mime_type: "text/plain".to_string(),
            bytes: s.into().into_bytes(),
        }
    }

    pub fn json(value: &Value) -> Self {
        Self {
            mime_type: "application/json".to_string(),
            // serde_json::Value serialization of well-formed JSON never fails.
            bytes: serde_json::to_vec(value).expect("JSON attachment serialization failed"),
        }
    }

    pub fn empty() -> Self {
        Self {
            mime_type: "application/empty".to_string(),
            bytes: Vec::new(),
        }
    }
}

pub const ATTACHMENT_EXTRARESULTS: &str = "extraresults";
pub const ATTACHMENT_SUBTESTS: &str = "subtests";
pub const ATTACHMENT_TRACEBACK: &str = "traceback";
pub const ATTACHMENT_FORCED_UNKNOWN: &str = "forced_unknown";

/// A terminal (or synthetic) result for one test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub test_id: String,
    pub kind: OutcomeKind,
    pub exception: Option<ExceptionInfo>,
    pub attachments: BTreeMap<String, Attachment>,
}

impl Outcome {
    pub fn new(test_id: impl Into<String>, kind: OutcomeKind) -> Self {
        Self {
            test_id: test_id.into(),
            kind,
            exception: None,
            attachments: BTreeMap::new(),
        }
    }

    pub fn with_exception(mut self, exception: ExceptionInfo) -> Self {
        self.exception = Some(exception);
        self
    }
}

/// A sub-result reported from inside a parent test case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubTestOutcome {
    pub subtest_id: String,
    pub failure: Option<SubTestFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubTestFailure {
    pub is_failure: bool,
    pub traceback: String,
}

/// The consumer of test outcomes, implemented once in the worker (by [`crate::encode::Encoder`])
/// and once in the parent (by [`crate::forward::Forwarder`]). Both the raw wire-level calls and
/// the user-facing sink implement this trait, which is why it does not expose progress maps
/// directly -- those live only on the parent-side sink, see [`ProgressSink`].
pub trait OutcomeSink {
    fn start_test(&mut self, test_id: &str);
    fn stop_test(&mut self, test_id: &str);
    fn add_success(&mut self, outcome: Outcome);
    fn add_failure(&mut self, outcome: Outcome);
    fn add_error(&mut self, outcome: Outcome);
    fn add_expected_failure(&mut self, outcome: Outcome);
    fn add_unexpected_success(&mut self, outcome: Outcome);
    fn add_skipped(&mut self, outcome: Outcome);
    fn add_sub_test(&mut self, parent_id: &str, sub: SubTestOutcome);
}

/// Extra attributes the *parent's* user sink must expose, per the executor's contract. Kept as a
/// separate trait from [`OutcomeSink`] because worker-side sinks (the encoder chain) never need
/// them -- progress only makes sense once outcomes have been merged across workers.
pub trait ProgressSink: OutcomeSink {
    fn worker_progress(&mut self) -> &mut HashMap<usize, Vec<String>>;
    fn start_time(&mut self) -> &mut HashMap<String, f64>;
    fn progress_info(&mut self) -> &mut HashMap<String, String>;
}
