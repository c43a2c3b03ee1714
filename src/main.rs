use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use parallel_test_executor::{
    config, Executor, Outcome, OutcomeSink, ProgressSink, SubTestOutcome, TestSuite,
};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML file listing the tests to run.
    config: PathBuf,

    /// Override the worker count from the config file.
    #[arg(short, long)]
    workers: Option<usize>,
}

/// Prints each outcome to stdout as it arrives. Not meant as a serious reporter -- just enough to
/// demonstrate the executor's contract end to end.
struct ConsoleSink {
    failed: usize,
    worker_progress: HashMap<usize, Vec<String>>,
    start_time: HashMap<String, f64>,
    progress_info: HashMap<String, String>,
}

impl ConsoleSink {
    fn new() -> Self {
        Self {
            failed: 0,
            worker_progress: HashMap::new(),
            start_time: HashMap::new(),
            progress_info: HashMap::new(),
        }
    }

    fn report(&mut self, outcome: &Outcome) {
        if let Some(info) = self.progress_info.get(&outcome.test_id) {
            println!("{info} {}", outcome.kind);
        } else {
            println!("{}: {}", outcome.test_id, outcome.kind);
        }
        if let Some(exc) = &outcome.exception {
            println!("  {}: {}", exc.type_tag, exc.message);
        }
    }
}

impl OutcomeSink for ConsoleSink {
    fn start_test(&mut self, test_id: &str) {
        log::debug!("starting {test_id}");
    }

    fn stop_test(&mut self, test_id: &str) {
        log::debug!("finished {test_id}");
    }

    fn add_success(&mut self, outcome: Outcome) {
        self.report(&outcome);
    }

    fn add_failure(&mut self, outcome: Outcome) {
        self.failed += 1;
        self.report(&outcome);
    }

    fn add_error(&mut self, outcome: Outcome) {
        self.failed += 1;
        self.report(&outcome);
    }

    fn add_expected_failure(&mut self, outcome: Outcome) {
        self.report(&outcome);
    }

    fn add_unexpected_success(&mut self, outcome: Outcome) {
        self.failed += 1;
        self.report(&outcome);
    }

    fn add_skipped(&mut self, outcome: Outcome) {
        self.report(&outcome);
    }

    fn add_sub_test(&mut self, parent_id: &str, sub: SubTestOutcome) {
        match sub.failure {
            None => println!("{parent_id} :: {} ok", sub.subtest_id),
            Some(f) => {
                self.failed += 1;
                println!("{parent_id} :: {} failed\n  {}", sub.subtest_id, f.traceback);
            }
        }
    }
}

impl ProgressSink for ConsoleSink {
    fn worker_progress(&mut self) -> &mut HashMap<usize, Vec<String>> {
        &mut self.worker_progress
    }

    fn start_time(&mut self) -> &mut HashMap<String, f64> {
        &mut self.start_time
    }

    fn progress_info(&mut self) -> &mut HashMap<String, String> {
        &mut self.progress_info
    }
}

fn do_main() -> Result<()> {
    let args = Args::parse();

    let config = config::load(&args.config)?;
    let workers = args.workers.unwrap_or(config.workers);
    let suite = TestSuite::new(config.into_cases());

    if suite.is_empty() {
        log::warn!("no tests in {:?}, nothing to run", args.config);
        return Ok(());
    }

    let executor = Executor::new(suite, workers);
    let sink = ConsoleSink::new();
    executor
        .run(sink)
        .context("running test executor")?;

    Ok(())
}

fn main() {
    env_logger::init();
    if let Err(e) = do_main() {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
