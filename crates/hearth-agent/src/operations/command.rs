use super::{CreateOperation, OneOrMany, Operation, OperationFactory};
use crate::environment::Environment;
use crate::error::OperationError;

pub const KEY: &str = "command";

#[derive(Debug, serde::Deserialize)]
struct Args {
    commands: OneOrMany,
}

/// Runs setup commands one after another inside the environment. Commands
/// are re-run on every pipeline run.
#[derive(Debug, Clone)]
pub struct RunCommands {
    commands: Vec<(String, Vec<String>)>,
}

#[async_trait::async_trait]
impl Operation for RunCommands {
    fn key(&self) -> &'static str {
        KEY
    }

    async fn run(&self, env: &Environment) -> Result<(), OperationError> {
        for (program, args) in &self.commands {
            let line = shell_words::join(std::iter::once(program).chain(args.iter()));
            env.display_to_console(format!("Executing: {line}"));
            let report = env.execute(program, args).await?;
            if !report.graceful {
                return Err(OperationError::CommandFailed {
                    command: line,
                    code: report.code,
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CommandFactory;

impl OperationFactory for CommandFactory {
    fn key(&self) -> &'static str {
        KEY
    }

    fn create(&self, op: CreateOperation) -> Result<Box<dyn Operation>, OperationError> {
        let args: Args = op.parse_args()?;
        let mut commands = Vec::new();
        for raw in args.commands.into_vec() {
            let words = shell_words::split(&raw)
                .map_err(|e| OperationError::invalid(KEY, format!("{raw}: {e}")))?;
            let mut words = words.into_iter();
            let Some(program) = words.next() else {
                continue;
            };
            commands.push((program, words.collect()));
        }
        if commands.is_empty() {
            return Err(OperationError::invalid(KEY, "commands must not be empty"));
        }
        Ok(Box::new(RunCommands { commands }))
    }
}
