//! Periodic firewall ruleset reapplication
//!
//! Forwarding rules live only in the kernel, and some environments flush
//! tables out from under the agent (firewalld reloads and the like). When
//! the operator persists a ruleset file, the agent replays it through the
//! restore program on a fixed interval.

use anyhow::{bail, Context, Result};
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(300);

pub struct RuleSync {
    restore_program: PathBuf,
    ruleset_path: PathBuf,
    interval: Duration,
}

impl RuleSync {
    pub fn new(
        restore_program: impl Into<PathBuf>,
        ruleset_path: impl Into<PathBuf>,
        interval: Duration,
    ) -> Self {
        Self {
            restore_program: restore_program.into(),
            ruleset_path: ruleset_path.into(),
            interval,
        }
    }

    /// Feed the persisted ruleset to the restore program once. A missing
    /// file means the operator persists nothing and is skipped quietly.
    pub async fn apply_once(&self) -> Result<()> {
        let file = match std::fs::File::open(&self.ruleset_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %self.ruleset_path.display(), "no persisted ruleset");
                return Ok(());
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to open ruleset {}", self.ruleset_path.display())
                })
            }
        };

        let output = Command::new(&self.restore_program)
            .stdin(Stdio::from(file))
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .with_context(|| {
                format!("Failed to execute {}", self.restore_program.display())
            })?;
        if !output.status.success() {
            bail!(
                "{} failed: {}",
                self.restore_program.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    /// Reapply on a fixed interval until the task is aborted. The first
    /// tick fires immediately, restoring rules right after a restart.
    pub fn spawn(self) -> JoinHandle<()> {
        info!(
            ruleset = %self.ruleset_path.display(),
            interval = self.interval.as_secs(),
            "firewall ruleset sync running"
        );
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.apply_once().await {
                    warn!("ruleset reapply failed: {:#}", e);
                }
            }
        })
    }
}
