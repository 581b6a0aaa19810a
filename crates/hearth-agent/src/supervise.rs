use std::time::Duration;

use hearth_process::ExitReport;

use crate::environment::Environment;
use crate::error::EnvironmentError;

const DEFAULT_TERM_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    /// The process exited after the graceful console command.
    None,
    Term,
    Kill,
}

#[derive(Debug, Clone, Copy)]
pub struct StopOutcome {
    pub escalation: Escalation,
    pub exit: Option<ExitReport>,
}

async fn stopped_within(env: &Environment, limit: Duration) -> bool {
    tokio::time::timeout(limit, env.wait_for_stopped()).await.is_ok()
}

/// Stops a running server within `timeout`.
///
/// With `graceful_stdin` (e.g. `"stop\n"`) the command is written first and
/// the process gets all but the last few seconds to exit on its own; then
/// SIGTERM goes to the process group, and SIGKILL once `timeout` is spent.
pub async fn stop_with_timeout(
    env: &Environment,
    graceful_stdin: Option<&str>,
    timeout: Duration,
) -> Result<StopOutcome, EnvironmentError> {
    if !env.state().is_active() {
        return Err(EnvironmentError::NotRunning);
    }

    let start = tokio::time::Instant::now();
    let deadline = start + timeout;

    if let Some(cmd) = graceful_stdin {
        let sent = env.send_input(cmd).await;
        match sent {
            Ok(()) => {
                env.display_to_console("[hearth] stop: sent graceful command");
                let grace = timeout.saturating_sub(DEFAULT_TERM_GRACE.min(timeout / 2));
                if stopped_within(env, grace).await {
                    return Ok(StopOutcome {
                        escalation: Escalation::None,
                        exit: env.last_exit(),
                    });
                }
            }
            Err(err) => tracing::debug!(%err, "graceful stop command not delivered"),
        }
    }

    match env.stop() {
        Ok(()) => env.display_to_console("[hearth] stop: sent SIGTERM"),
        // Exited between checks.
        Err(EnvironmentError::NotRunning) => {
            env.wait_for_stopped().await;
            return Ok(StopOutcome {
                escalation: Escalation::None,
                exit: env.last_exit(),
            });
        }
        Err(e) => return Err(e),
    }

    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
    if stopped_within(env, remaining).await {
        return Ok(StopOutcome {
            escalation: Escalation::Term,
            exit: env.last_exit(),
        });
    }

    env.display_to_console("[hearth] stop: sent SIGKILL (timeout)");
    match env.kill() {
        Ok(()) | Err(EnvironmentError::NotRunning) => {}
        Err(e) => return Err(e),
    }
    env.wait_for_stopped().await;
    Ok(StopOutcome {
        escalation: Escalation::Kill,
        exit: env.last_exit(),
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::environment::EnvironmentOptions;
    use hearth_process::{EnvironmentId, EnvironmentKind};

    fn env_in(dir: &std::path::Path, kind: EnvironmentKind) -> Environment {
        Environment::new(EnvironmentId::new(), kind, dir, EnvironmentOptions::default()).unwrap()
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn graceful_command_is_enough() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_in(dir.path(), EnvironmentKind::Native);
        env.execute_async("/bin/sh", &sh("read cmd; [ \"$cmd\" = stop ] && exit 0; sleep 30"), None)
            .unwrap();

        let out = stop_with_timeout(&env, Some("stop\n"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.escalation, Escalation::None);
        assert!(out.exit.unwrap().graceful);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn sigterm_when_no_graceful_command() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_in(dir.path(), EnvironmentKind::Tty);
        env.execute_async("/bin/sh", &sh("sleep 30"), None).unwrap();

        let out = stop_with_timeout(&env, None, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.escalation, Escalation::Term);
        assert!(!out.exit.unwrap().graceful);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn escalates_to_kill_when_term_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_in(dir.path(), EnvironmentKind::Native);
        env.execute_async(
            "/bin/sh",
            &sh("trap '' TERM; while true; do sleep 1; done"),
            None,
        )
        .unwrap();

        let out = stop_with_timeout(&env, None, Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(out.escalation, Escalation::Kill);
        let exit = out.exit.unwrap();
        assert!(!exit.graceful);
        assert_eq!(exit.signal, Some(libc::SIGKILL));
    }

    #[tokio::test]
    async fn idle_environment_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_in(dir.path(), EnvironmentKind::Native);
        assert!(matches!(
            stop_with_timeout(&env, None, Duration::from_secs(1)).await,
            Err(EnvironmentError::NotRunning)
        ));
    }
}
