pub mod config;
pub mod decode;
pub mod encode;
pub mod executor;
pub mod forward;
pub mod partition;
pub mod process;
pub mod sandbox;
pub mod testcase;
pub mod wire;

pub use executor::Executor;
pub use forward::Forwarder;
pub use testcase::{
    Attachment, ExceptionInfo, Outcome, OutcomeKind, OutcomeSink, Partition, ProgressSink,
    SubTestFailure, SubTestOutcome, TestCase, TestSuite,
};
pub use wire::{WireError, WireReader, WireWriter};
