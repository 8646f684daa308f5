//! Command-label runners.
//!
//! Each label gets its own task: run once at start, then every period.
//! A run that fails to spawn, exits non-zero or outlives its period keeps
//! the previous result. Fresh results are published on a watch channel so
//! the heartbeat can advertise them right away.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use chrono::Utc;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use warden_core::CommandLabel;

/// Label commands never get less than this long to finish.
pub const MIN_RUN_TIMEOUT: Duration = Duration::from_secs(1);

pub type Labels = BTreeMap<String, CommandLabel>;

#[derive(Debug, thiserror::Error)]
enum RunError {
    #[error("empty command")]
    Empty,
    #[error("failed to spawn: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("exited with {0}")]
    Failed(std::process::ExitStatus),
}

/// Running evaluators for a node's command labels.
#[derive(Debug)]
pub struct LabelRunners {
    results: watch::Receiver<Labels>,
    tasks: Vec<JoinHandle<()>>,
}

impl LabelRunners {
    /// Start one task per label.
    pub fn spawn(labels: Labels, shutdown: CancellationToken) -> Self {
        let names: Vec<(String, CommandLabel)> = labels
            .iter()
            .map(|(name, label)| (name.clone(), label.clone()))
            .collect();
        let (tx, results) = watch::channel(labels);

        let tasks = names
            .into_iter()
            .map(|(name, label)| {
                tokio::spawn(label_loop(name, label, tx.clone(), shutdown.clone()))
            })
            .collect();
        Self { results, tasks }
    }

    /// Latest results; `changed()` fires on every new result.
    pub fn subscribe(&self) -> watch::Receiver<Labels> {
        self.results.clone()
    }

    pub fn snapshot(&self) -> Labels {
        self.results.borrow().clone()
    }
}

impl Drop for LabelRunners {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn label_loop(
    name: String,
    label: CommandLabel,
    results: watch::Sender<Labels>,
    shutdown: CancellationToken,
) {
    let timeout = label.period.max(MIN_RUN_TIMEOUT);
    let mut ticker = (!label.period.is_zero()).then(|| {
        let mut ticker = tokio::time::interval(label.period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker
    });

    loop {
        if let Some(ticker) = ticker.as_mut() {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.cancelled() => return,
            }
        }

        match evaluate(&label.command, timeout).await {
            Ok(output) => {
                debug!(label = %name, result = %output.trim(), "label evaluated");
                results.send_modify(|labels| {
                    if let Some(entry) = labels.get_mut(&name) {
                        entry.result = output;
                        entry.last_run = Some(Utc::now());
                    }
                });
            }
            Err(e) => warn!(label = %name, error = %e, "label command failed, keeping last result"),
        }

        // A zero period runs once.
        if ticker.is_none() {
            return;
        }
    }
}

async fn evaluate(command: &[String], timeout: Duration) -> Result<String, RunError> {
    let (program, args) = command.split_first().ok_or(RunError::Empty)?;
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| RunError::Timeout(timeout))??;
    if !output.status.success() {
        return Err(RunError::Failed(output.status));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
