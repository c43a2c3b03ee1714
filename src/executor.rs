//! C7: top-level orchestrator. Partitions the suite, forks one worker per non-empty partition,
//! spawns one parser thread per worker, and drains everything into the caller's sink.

use std::collections::HashMap;
use std::fs::File;
use std::os::fd::OwnedFd;
use std::os::unix::io::AsRawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;

use anyhow::{Context, Result};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, pipe, ForkResult, Pid};

use crate::encode::Encoder;
use crate::partition::partition;
use crate::sandbox::Sandbox;
use crate::testcase::{
    ExceptionInfo, Outcome, OutcomeKind, OutcomeSink, Partition, ProgressSink, TestSuite,
};
use crate::wire::{WireReader, WireWriter};
use crate::forward::Forwarder;

/// Consumes a [`TestSuite`], runs it across up to `workers` child processes, and dispatches every
/// outcome into a caller-supplied sink.
pub struct Executor {
    suite: TestSuite,
    workers: usize,
}

impl Executor {
    pub fn new(suite: TestSuite, workers: usize) -> Self {
        Self { suite, workers }
    }

    pub fn run<S>(self, sink: S) -> Result<()>
    where
        S: ProgressSink + Send + 'static,
    {
        let partitions = partition(self.suite, self.workers.max(1));
        if partitions.is_empty() {
            return Ok(());
        }

        let total_in_worker: HashMap<usize, usize> = partitions
            .iter()
            .enumerate()
            .map(|(i, p)| (i, p.cases.len()))
            .collect();
        let grand_total: usize = total_in_worker.values().sum();
        let forwarder = Forwarder::new(sink, total_in_worker, grand_total);

        let (done_tx, done_rx) = mpsc::channel::<usize>();
        let mut children: Vec<Pid> = Vec::with_capacity(partitions.len());

        let run_result = (|| -> Result<()> {
            // Pass 1: fork every worker while this process is still single-threaded. Forking a
            // multithreaded process is unsafe in general (a lock held by another thread at the
            // instant of `fork()` is inherited already-locked, and forever stuck, in the child,
            // since the thread that owns it doesn't exist there) -- so no parser thread may be
            // spawned until every child has been forked.
            let mut workers: Vec<(usize, File)> = Vec::with_capacity(partitions.len());
            for (worker_id, mut part) in partitions.into_iter().enumerate() {
                let (read_end, write_end) = pipe().context("creating worker pipe")?;

                // SAFETY: matches the upstream design's `os.fork()` call -- the process is
                // single-threaded at every fork call site, since this loop never spawns a thread
                // until all forking below is done.
                match unsafe { fork() }.context("forking worker")? {
                    ForkResult::Child => {
                        drop(read_end);
                        run_child(worker_id, &mut part, write_end);
                        unreachable!("run_child always exits the process");
                    }
                    ForkResult::Parent { child } => {
                        drop(write_end);
                        children.push(child);
                        workers.push((worker_id, File::from(read_end)));
                    }
                }
            }

            // Pass 2: now that every child exists, spawn one parser thread per worker.
            let mut threads = Vec::with_capacity(workers.len());
            for (worker_id, pipe_file) in workers {
                let fwd = forwarder.clone();
                let tx = done_tx.clone();
                threads.push(std::thread::spawn(move || {
                    parse_worker_stream(worker_id, pipe_file, &fwd);
                    let _ = tx.send(worker_id);
                }));
            }
            drop(done_tx);

            for _ in 0..threads.len() {
                done_rx.recv().ok();
            }
            for t in threads {
                let _ = t.join();
            }
            Ok(())
        })();

        if run_result.is_err() {
            forwarder.stop();
        }

        for pid in children {
            let _ = waitpid(pid, None);
        }

        run_result
    }
}

/// Runs inside the forked child. Never returns: always exits the process directly so that no
/// `Drop` implementation shared with the parent (e.g. anything captured by the closure before the
/// fork) runs twice.
fn run_child(worker_id: usize, partition: &mut Partition, write_end: OwnedFd) -> ! {
    redirect_stdin_to_devnull();

    let pipe_file = File::from(write_end);
    let mut wire = WireWriter::new(pipe_file);

    let pid = nix::unistd::getpid();
    match Sandbox::setup(pid) {
        Ok(sandbox) => {
            if let Some(sandbox) = &sandbox {
                sandbox.rewrite_partition(partition);
            }
            let mut encoder = Encoder::new(wire);
            run_partition(worker_id, partition, &mut encoder);
            if let Some(sandbox) = sandbox {
                sandbox.teardown();
            }
            std::process::exit(0);
        }
        Err(e) => {
            // `Sandbox::setup` tears its own partially-built directory down before returning an
            // error, so there is nothing left here to clean up -- only the failure to report.
            let _ = wire.write_error_outside_test(
                &format!("worker{worker_id}.sandbox_setup"),
                &e.to_string(),
            );
            std::process::exit(1);
        }
    }
}

fn redirect_stdin_to_devnull() {
    if let Ok(devnull) = File::open("/dev/null") {
        let _ = nix::unistd::dup2(devnull.as_raw_fd(), 0);
    }
}

fn run_partition(worker_id: usize, partition: &mut Partition, encoder: &mut Encoder<File>) {
    for case in &mut partition.cases {
        let test_id = case.id();
        let annotations = case.extra_annotations();
        encoder.note_annotations(&test_id, annotations);
        encoder.start_test(&test_id);

        let ran = panic::catch_unwind(AssertUnwindSafe(|| case.run(encoder)));
        if let Err(payload) = ran {
            let message = panic_message(&payload);
            log::error!("worker {worker_id}: test {test_id} panicked: {message}");
            encoder.add_error(Outcome::new(test_id.clone(), OutcomeKind::Error).with_exception(
                ExceptionInfo {
                    type_tag: "BrokenRunner".to_string(),
                    message,
                    traceback: String::new(),
                },
            ));
        }

        encoder.stop_test(&test_id);
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "test panicked with a non-string payload".to_string()
    }
}

/// Runs in a parent-side thread: reads wire frames off `pipe_file` until EOF, forwarding each to
/// `forwarder`. Read errors are logged and end the stream early rather than propagated, matching
/// the executor's policy that a torn pipe should drain what it can rather than abort the run.
fn parse_worker_stream(worker_id: usize, pipe_file: File, forwarder: &Forwarder<impl ProgressSink>) {
    let mut reader = WireReader::new(pipe_file);
    loop {
        match reader.read_frame() {
            Ok(Some(frame)) => forwarder.forward(worker_id, frame),
            Ok(None) => break,
            Err(e) => {
                log::warn!("worker {worker_id}: wire stream error: {e}");
                break;
            }
        }
    }
}
