//! Restore actions run in response to CPU alerts.
//!
//! Every action is logged before and after it runs. A failing action is
//! reported and skipped; the remaining actions and later alerts are still
//! handled.

use std::{
    fmt,
    path::{Path, PathBuf},
    process::ExitStatus,
    str::FromStr,
};

use serde::Deserialize;
use tokio::{process::Command, sync::mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::monitor::CpuAlert;

/// Copy of a known-good file over a live one, written `SOURCE:DESTINATION`.
///
/// A leading `~/` in either path is expanded from `$HOME`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct RestoreAction {
    pub source: PathBuf,
    pub destination: PathBuf,
}

impl FromStr for RestoreAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (source, destination) = s
            .split_once(':')
            .ok_or_else(|| format!("restore action `{s}` is not SOURCE:DESTINATION"))?;
        let (source, destination) = (source.trim(), destination.trim());
        if source.is_empty() || destination.is_empty() {
            return Err(format!("restore action `{s}` has an empty path"));
        }

        Ok(RestoreAction {
            source: expand_home(source),
            destination: expand_home(destination),
        })
    }
}

impl TryFrom<String> for RestoreAction {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for RestoreAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}",
            self.source.display(),
            self.destination.display()
        )
    }
}

fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => Path::new(&home).join(rest),
        _ => PathBuf::from(path),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RemediationError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` exited with {status}")]
    ExitStatus { command: String, status: ExitStatus },
}

#[derive(Debug, Clone)]
pub struct Remediator {
    use_sudo: bool,
    actions: Vec<RestoreAction>,
}

impl Remediator {
    pub fn new(use_sudo: bool, actions: Vec<RestoreAction>) -> Self {
        Self { use_sudo, actions }
    }

    pub fn actions(&self) -> &[RestoreAction] {
        &self.actions
    }

    /// Run every restore action in order. Returns the number of failures.
    pub async fn remediate(&self) -> usize {
        let mut failures = 0;
        for action in &self.actions {
            info!(%action, "restoring");
            match self.restore(action).await {
                Ok(()) => info!(%action, "restored"),
                Err(e) => {
                    warn!(%action, "restore failed: {e}");
                    failures += 1;
                }
            }
        }
        failures
    }

    pub async fn restore(&self, action: &RestoreAction) -> Result<(), RemediationError> {
        // sudo must fail rather than wait on a password prompt
        let mut command = if self.use_sudo {
            let mut command = Command::new("sudo");
            command.arg("-n").arg("cp");
            command
        } else {
            Command::new("cp")
        };
        command
            .arg(&action.source)
            .arg(&action.destination)
            .kill_on_drop(true);

        let rendered = format!(
            "{}cp {} {}",
            if self.use_sudo { "sudo -n " } else { "" },
            action.source.display(),
            action.destination.display()
        );

        let output = command
            .output()
            .await
            .map_err(|source| RemediationError::Spawn {
                command: rendered.clone(),
                source,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            debug!(
                stderr = %String::from_utf8_lossy(&output.stderr).trim_end(),
                "{rendered} failed"
            );
            Err(RemediationError::ExitStatus {
                command: rendered,
                status: output.status,
            })
        }
    }
}

/// Consume alerts until `token` is cancelled or every sender is gone.
///
/// A remediation still running when `token` is cancelled is abandoned and
/// its `cp` killed. With `remediator` set to `None` alerts are only logged.
pub async fn run_remediation(
    remediator: Option<Remediator>,
    mut alerts: mpsc::Receiver<CpuAlert>,
    token: CancellationToken,
) {
    loop {
        let alert = tokio::select! {
            _ = token.cancelled() => break,
            alert = alerts.recv() => match alert {
                Some(alert) => alert,
                None => break,
            },
        };

        match &remediator {
            Some(remediator) => {
                info!(
                    cpu_usage = alert.cpu_usage,
                    actions = remediator.actions().len(),
                    "running remediation"
                );
                let failures = tokio::select! {
                    _ = token.cancelled() => {
                        warn!("shutdown during remediation, remaining actions skipped");
                        break;
                    }
                    failures = remediator.remediate() => failures,
                };
                if failures > 0 {
                    warn!(failures, "remediation finished with failures");
                }
            }
            None => info!(
                cpu_usage = alert.cpu_usage,
                "remediation disabled, alert ignored"
            ),
        }
    }

    debug!("remediation handler stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn alert() -> CpuAlert {
        CpuAlert {
            cpu_usage: 90.0,
            consecutive: 3,
            threshold: 45.0,
        }
    }

    #[test]
    fn parse_restore_action() {
        let action: RestoreAction = "/backup/motd.backup:/etc/motd".parse().unwrap();
        assert_eq!(action.source, PathBuf::from("/backup/motd.backup"));
        assert_eq!(action.destination, PathBuf::from("/etc/motd"));

        assert!("/only/one/path".parse::<RestoreAction>().is_err());
        assert!(":/etc/motd".parse::<RestoreAction>().is_err());
    }

    #[test]
    fn home_is_expanded() {
        let Some(home) = std::env::var_os("HOME") else {
            return;
        };
        let action: RestoreAction = "/b/bashrc.backup:~/.bashrc".parse().unwrap();
        assert_eq!(action.destination, Path::new(&home).join(".bashrc"));
    }

    #[test]
    fn deserializes_from_string() {
        let actions: Vec<RestoreAction> =
            serde_json::from_str(r#"["/a:/b", "/c:/d"]"#).unwrap();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[1].destination, PathBuf::from("/d"));
    }

    #[tokio::test]
    async fn restore_copies_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("motd.backup");
        let destination = dir.path().join("motd");
        fs::write(&source, "welcome back").unwrap();
        fs::write(&destination, "tampered").unwrap();

        let remediator = Remediator::new(
            false,
            vec![RestoreAction {
                source,
                destination: destination.clone(),
            }],
        );

        assert_eq!(remediator.remediate().await, 0);
        assert_eq!(fs::read_to_string(destination).unwrap(), "welcome back");
    }

    #[tokio::test]
    async fn failing_action_does_not_stop_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("bashrc.backup");
        let destination = dir.path().join("bashrc");
        fs::write(&source, "alias ll='ls -l'").unwrap();

        let missing = RestoreAction {
            source: dir.path().join("does-not-exist"),
            destination: dir.path().join("nowhere"),
        };
        let remediator = Remediator::new(
            false,
            vec![
                missing.clone(),
                RestoreAction {
                    source,
                    destination: destination.clone(),
                },
            ],
        );

        assert!(matches!(
            remediator.restore(&missing).await,
            Err(RemediationError::ExitStatus { .. })
        ));
        assert_eq!(remediator.remediate().await, 1);
        assert!(destination.exists());
    }

    #[tokio::test]
    async fn handler_runs_on_alert_and_exits_when_senders_drop() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("motd.backup");
        let destination = dir.path().join("motd");
        fs::write(&source, "restored").unwrap();

        let (tx, rx) = mpsc::channel(1);
        let handler = tokio::spawn(run_remediation(
            Some(Remediator::new(
                false,
                vec![RestoreAction {
                    source,
                    destination: destination.clone(),
                }],
            )),
            rx,
            CancellationToken::new(),
        ));

        tx.send(alert()).await.unwrap();
        drop(tx);
        handler.await.unwrap();

        assert_eq!(fs::read_to_string(destination).unwrap(), "restored");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancel_interrupts_hanging_restore() {
        let dir = tempfile::tempdir().unwrap();
        // opening a fifo with no writer blocks `cp` indefinitely
        let fifo = dir.path().join("stalled");
        let status = std::process::Command::new("mkfifo")
            .arg(&fifo)
            .status()
            .unwrap();
        assert!(status.success());

        let (tx, rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        let handler = tokio::spawn(run_remediation(
            Some(Remediator::new(
                false,
                vec![RestoreAction {
                    source: fifo,
                    destination: dir.path().join("motd"),
                }],
            )),
            rx,
            token.clone(),
        ));

        tx.send(alert()).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        token.cancel();

        tokio::time::timeout(std::time::Duration::from_secs(3), handler)
            .await
            .expect("remediation handler ignored cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn disabled_handler_stops_on_cancel() {
        let (tx, rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        let handler = tokio::spawn(run_remediation(None, rx, token.clone()));

        tx.send(alert()).await.unwrap();
        token.cancel();
        handler.await.unwrap();
    }
}
