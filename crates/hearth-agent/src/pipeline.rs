use crate::environment::Environment;
use crate::error::{OperationError, PipelineError};
use crate::operations::Operation;

/// Runs `operations` in order on the caller's task, stopping at the first
/// failure. Completed steps are not rolled back.
pub async fn run(operations: &[Box<dyn Operation>], env: &Environment) -> Result<(), PipelineError> {
    let _guard = env.begin_provisioning().map_err(|e| PipelineError {
        index: 0,
        key: operations
            .first()
            .map(|op| op.key().to_string())
            .unwrap_or_default(),
        source: OperationError::Environment(e),
    })?;

    let total = operations.len();
    for (index, op) in operations.iter().enumerate() {
        let key = op.key();
        tracing::info!(environment = %env.id(), step = index + 1, total, key, "running operation");

        if let Err(source) = op.run(env).await {
            tracing::warn!(
                environment = %env.id(),
                step = index + 1,
                key,
                error = %source,
                "operation failed"
            );
            let err = PipelineError {
                index,
                key: key.to_string(),
                source,
            };
            env.display_to_console(format!("Provisioning {err}"));
            return Err(err);
        }
    }

    tracing::info!(environment = %env.id(), total, "provisioning complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::EnvironmentOptions;
    use hearth_process::{EnvironmentId, EnvironmentKind};
    use std::sync::{Arc, Mutex};

    #[derive(Debug)]
    struct Step {
        name: &'static str,
        fail: bool,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait::async_trait]
    impl Operation for Step {
        fn key(&self) -> &'static str {
            self.name
        }

        async fn run(&self, env: &Environment) -> Result<(), OperationError> {
            self.log.lock().unwrap().push(self.name);
            env.display_to_console(format!("step {}", self.name));
            if self.fail {
                return Err(OperationError::VersionNotLocated(self.name.to_string()));
            }
            Ok(())
        }
    }

    fn env_in(dir: &std::path::Path) -> Environment {
        Environment::new(
            EnvironmentId::new(),
            EnvironmentKind::Native,
            dir,
            EnvironmentOptions::default(),
        )
        .unwrap()
    }

    fn steps(spec: &[(&'static str, bool)]) -> (Vec<Box<dyn Operation>>, Arc<Mutex<Vec<&'static str>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let ops = spec
            .iter()
            .map(|(name, fail)| -> Box<dyn Operation> {
                Box::new(Step {
                    name: *name,
                    fail: *fail,
                    log: log.clone(),
                })
            })
            .collect();
        (ops, log)
    }

    #[tokio::test]
    async fn stops_at_first_failure() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_in(dir.path());
        let (ops, log) = steps(&[("a", false), ("b", true), ("c", false)]);

        let err = run(&ops, &env).await.unwrap_err();
        assert_eq!(err.index, 1);
        assert_eq!(err.key, "b");
        assert_eq!(err.source.to_string(), "version not located: b");
        assert_eq!(*log.lock().unwrap(), vec!["a", "b"]);

        assert_eq!(err.to_string(), "step 2 (b) failed: version not located: b");
        let lines = env.console().read_all();
        assert_eq!(
            lines.last().unwrap(),
            "Provisioning step 2 (b) failed: version not located: b"
        );
    }

    #[tokio::test]
    async fn runs_all_steps_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_in(dir.path());
        let (ops, log) = steps(&[("a", false), ("b", false), ("c", false)]);
        run(&ops, &env).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
        // Guard released.
        assert!(env.begin_provisioning().is_ok());
    }

    #[tokio::test]
    async fn refuses_environment_already_provisioning() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_in(dir.path());
        let _held = env.begin_provisioning().unwrap();
        let (ops, log) = steps(&[("a", false)]);
        let err = run(&ops, &env).await.unwrap_err();
        assert!(matches!(err.source, OperationError::Environment(_)));
        assert!(log.lock().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn refuses_running_environment() {
        let dir = tempfile::tempdir().unwrap();
        let env = env_in(dir.path());
        env.execute_async("/bin/sh", &["-c".to_string(), "sleep 30".to_string()], None)
            .unwrap();
        let (ops, log) = steps(&[("a", false)]);
        let err = run(&ops, &env).await.unwrap_err();
        assert!(matches!(err.source, OperationError::Environment(_)));
        assert!(log.lock().unwrap().is_empty());
        env.kill().unwrap();
        env.wait_for_stopped().await;
    }
}
