//! TOML test-list loading for the demonstration binary. Not part of the executor's own contract
//! (the executor only ever sees `Box<dyn TestCase>`) -- this is just one way to produce them.

use std::ffi::OsString;
use std::fs;
use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::process::OutputExt;
use crate::testcase::{
    Attachment, ExceptionInfo, Outcome, OutcomeKind, OutcomeSink, TestCase, ATTACHMENT_TRACEBACK,
};

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
#[serde(untagged)]
pub enum TestCommand {
    Shell(String),
    Raw(Vec<String>),
}

impl TestCommand {
    fn program(&self) -> OsString {
        match self {
            Self::Shell(_) => "sh".into(),
            Self::Raw(args) => args[0].clone().into(),
        }
    }

    fn args(&self) -> Vec<OsString> {
        match self {
            Self::Shell(cmd) => vec!["-c".into(), cmd.into()],
            Self::Raw(args) => args[1..].iter().map(OsString::from).collect(),
        }
    }
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct TestSpec {
    /// Stable id, e.g. `"smoke.NetworkSuite.test_ping"`.
    name: String,
    /// Tests sharing a class are kept on the same worker.
    class: String,
    command: TestCommand,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub workers: usize,
    tests: Vec<TestSpec>,
}

pub fn load(config_path: &Path) -> Result<Config> {
    let content = fs::read_to_string(config_path).context("couldn't read config")?;
    let config: Config = toml::from_str(&content).context("couldn't parse config")?;
    Ok(config)
}

impl Config {
    pub fn into_cases(self) -> Vec<Box<dyn TestCase>> {
        self.tests
            .into_iter()
            .map(|t| Box::new(CommandTestCase { spec: t }) as Box<dyn TestCase>)
            .collect()
    }
}

/// Runs one configured shell command as a test: zero exit is a success, anything else a failure
/// carrying captured stdout+stderr as the traceback.
struct CommandTestCase {
    spec: TestSpec,
}

impl TestCase for CommandTestCase {
    fn id(&self) -> String {
        self.spec.name.clone()
    }

    fn class_key(&self) -> String {
        self.spec.class.clone()
    }

    fn run(&mut self, sink: &mut dyn OutcomeSink) {
        let mut cmd = Command::new(self.spec.command.program());
        cmd.args(self.spec.command.args());

        let output = match cmd.output() {
            Ok(o) => o,
            Err(e) => {
                sink.add_error(Outcome::new(self.id(), OutcomeKind::Error).with_exception(
                    ExceptionInfo {
                        type_tag: "SpawnFailed".to_string(),
                        message: e.to_string(),
                        traceback: String::new(),
                    },
                ));
                return;
            }
        };

        if output.code_not_killed().ok() == Some(0) {
            sink.add_success(Outcome::new(self.id(), OutcomeKind::Success));
            return;
        }

        let code = output.code_not_killed().unwrap_or(-1);
        let mut outcome = Outcome::new(self.id(), OutcomeKind::Failure).with_exception(ExceptionInfo {
            type_tag: "CommandFailed".to_string(),
            message: format!("exited with code {code}"),
            traceback: String::new(),
        });
        let captured = format!(
            "stdout:\n{}\nstderr:\n{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        outcome
            .attachments
            .insert(ATTACHMENT_TRACEBACK.to_string(), Attachment::text(captured));
        sink.add_failure(outcome);
    }
}
