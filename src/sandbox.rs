//! C2: the per-worker scratch build directory a child sets up before running its partition, and
//! tears down before it exits. Only engaged when `LOCAL_CI_BUILD_DIR` is set in the environment;
//! workers otherwise run directly in the caller's working directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::unistd::Pid;
use thiserror::Error;

use crate::process::CommandExt;
use crate::testcase::Partition;

const BUILD_DIR_VAR: &str = "LOCAL_CI_BUILD_DIR";
const CLOBBERDIR_HELPER: &str = "yocto-autobuilder-helper/janitor/clobberdir";
const BITBAKE_LOCK: &str = "bitbake.lock";
const LOCK_POLL_INTERVAL: Duration = Duration::from_secs(1);
const LOCK_POLL_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("copying {from} into {to}")]
    Copy {
        from: String,
        to: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("taking git snapshot of {0}")]
    Snapshot(String, #[source] anyhow::Error),
    #[error("rewriting {0}")]
    Rewrite(String, #[source] std::io::Error),
    #[error("changing directory to {0}")]
    Chdir(String, #[source] std::io::Error),
}

/// A live, set-up sandbox. Dropping this value does *not* tear the directory down -- see
/// `executor.rs` for why: the child must call `teardown` explicitly from its own code path, since
/// a forked child's copy of any `Drop` guard the parent held would double-delete a directory it
/// never owned.
pub struct Sandbox {
    old_build: PathBuf,
    new_build: PathBuf,
}

impl Sandbox {
    /// Sets up a sandbox for `pid` if `LOCAL_CI_BUILD_DIR` is present in the environment. Returns
    /// `Ok(None)` if the variable is unset -- the caller then runs unsandboxed.
    ///
    /// The `new_build` directory is created by the very first fallible step below, so `self` is
    /// built up front and torn back down on any later failure -- a half-built sandbox never leaks
    /// onto disk just because a later copy, snapshot, or rewrite failed.
    pub fn setup(pid: Pid) -> Result<Option<Self>, SandboxError> {
        let Ok(old_build) = std::env::var(BUILD_DIR_VAR) else {
            return Ok(None);
        };
        let old_build = PathBuf::from(old_build);
        let new_build = PathBuf::from(format!("{}-st-{}", old_build.display(), pid));
        let sandbox = Self {
            old_build,
            new_build,
        };

        if let Err(e) = sandbox.build() {
            sandbox.teardown();
            return Err(e);
        }

        Ok(Some(sandbox))
    }

    fn build(&self) -> Result<(), SandboxError> {
        Self::copy_tree(&self.old_build.join("conf"), &self.new_build.join("conf"))?;
        Self::copy_tree(&self.old_build.join("cache"), &self.new_build.join("cache"))?;
        let selftest_src = self
            .old_build
            .parent()
            .map(|p| p.join("meta-selftest"))
            .unwrap_or_else(|| PathBuf::from("meta-selftest"));
        let selftest_dst = self.new_build.join("meta-selftest");
        if selftest_src.exists() {
            Self::copy_tree(&selftest_src, &selftest_dst)?;
            Self::snapshot(&selftest_dst)?;
        }

        Self::rewrite_environment(&self.old_build, &self.new_build);
        Self::rewrite_bblayers(
            &self.new_build.join("conf").join("bblayers.conf"),
            &self.old_build,
            &self.new_build,
        )?;

        std::env::set_current_dir(&self.new_build)
            .map_err(|e| SandboxError::Chdir(self.new_build.display().to_string(), e))
    }

    pub fn new_build_dir(&self) -> &Path {
        &self.new_build
    }

    /// Gives every test case in `partition` a chance to rewrite config paths that embedded the
    /// old build directory.
    pub fn rewrite_partition(&self, partition: &mut Partition) {
        let old = self.old_build.display().to_string();
        let new = self.new_build.display().to_string();
        let rewrite = |s: &str| s.replace(&old, &new);
        for case in &mut partition.cases {
            case.rewrite_config_paths(&rewrite);
        }
    }

    fn copy_tree(from: &Path, to: &Path) -> Result<(), SandboxError> {
        if !from.exists() {
            return Ok(());
        }
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SandboxError::Copy {
                from: from.display().to_string(),
                to: to.display().to_string(),
                source: e.into(),
            })?;
        }
        std::process::Command::new("cp")
            .arg("-a")
            .arg(from)
            .arg(to)
            .run_checked()
            .map_err(|e| SandboxError::Copy {
                from: from.display().to_string(),
                to: to.display().to_string(),
                source: e,
            })?;
        Ok(())
    }

    fn snapshot(dir: &Path) -> Result<(), SandboxError> {
        let run = |args: &[&str]| {
            std::process::Command::new("git")
                .args(args)
                .current_dir(dir)
                .run_checked()
        };
        run(&["init"]).map_err(|e| SandboxError::Snapshot(dir.display().to_string(), e))?;
        run(&["add", "-A"]).map_err(|e| SandboxError::Snapshot(dir.display().to_string(), e))?;
        run(&["commit", "-m", "sandbox snapshot", "--allow-empty"])
            .map_err(|e| SandboxError::Snapshot(dir.display().to_string(), e))?;
        Ok(())
    }

    /// Substring replacement across every environment variable whose value mentions `old_build`.
    /// Deliberately not scoped to exact-prefix matches; see the design notes for why.
    fn rewrite_environment(old_build: &Path, new_build: &Path) {
        let old = old_build.display().to_string();
        let new = new_build.display().to_string();
        let to_rewrite: HashMap<String, String> = std::env::vars()
            .filter(|(_, v)| v.contains(&old))
            .map(|(k, v)| (k, v.replace(&old, &new)))
            .collect();
        for (key, value) in to_rewrite {
            std::env::set_var(key, value);
        }
    }

    fn rewrite_bblayers(path: &Path, old_build: &Path, new_build: &Path) -> Result<(), SandboxError> {
        if !path.exists() {
            return Ok(());
        }
        let old = old_build.display().to_string();
        let new = new_build.display().to_string();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SandboxError::Rewrite(path.display().to_string(), e))?;
        let rewritten = contents.replace(&old, &new);
        std::fs::write(path, rewritten).map_err(|e| SandboxError::Rewrite(path.display().to_string(), e))
    }

    /// Best-effort teardown. Never returns an error: failures are logged and swallowed, matching
    /// the crate's policy that sandbox cleanup is never allowed to mask a test result.
    pub fn teardown(&self) {
        for _ in 0..LOCK_POLL_ATTEMPTS {
            if !self.new_build.join(BITBAKE_LOCK).exists() {
                break;
            }
            std::thread::sleep(LOCK_POLL_INTERVAL);
        }

        let helper = dirs_home().map(|home| home.join(CLOBBERDIR_HELPER));
        if let Some(helper) = helper.filter(|h| h.exists()) {
            let result = std::process::Command::new(&helper)
                .arg(&self.new_build)
                .run_checked();
            if let Err(e) = result {
                log::warn!("clobberdir helper failed for {}: {e}", self.new_build.display());
            } else {
                return;
            }
        }

        if let Err(e) = std::fs::remove_dir_all(&self.new_build) {
            log::warn!("failed to remove sandbox dir {}: {e}", self.new_build.display());
        }
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use crate::testcase::{OutcomeSink, Partition, TestCase};

    struct RewritingCase {
        id: String,
        path: Arc<Mutex<String>>,
    }

    impl TestCase for RewritingCase {
        fn id(&self) -> String {
            self.id.clone()
        }
        fn class_key(&self) -> String {
            "C".to_string()
        }
        fn rewrite_config_paths(&mut self, rewrite: &dyn Fn(&str) -> String) {
            let mut guard = self.path.lock().unwrap();
            *guard = rewrite(&guard);
        }
        fn run(&mut self, _sink: &mut dyn OutcomeSink) {}
    }

    #[test]
    fn rewrite_partition_applies_substring_replacement() {
        let sandbox = super::Sandbox {
            old_build: "/build/tmp".into(),
            new_build: "/build/tmp-st-123".into(),
        };
        let path = Arc::new(Mutex::new("/build/tmp/conf/local.conf".to_string()));
        let mut partition = Partition {
            cases: vec![Box::new(RewritingCase {
                id: "t".to_string(),
                path: path.clone(),
            })],
        };
        sandbox.rewrite_partition(&mut partition);
        assert_eq!(*path.lock().unwrap(), "/build/tmp-st-123/conf/local.conf");
    }
}
