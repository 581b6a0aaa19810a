use super::{CreateOperation, Operation, OperationFactory};
use crate::environment::Environment;
use crate::error::OperationError;

pub const KEY: &str = "writefile";

#[derive(Debug, serde::Deserialize)]
struct Args {
    target: String,
    text: String,
}

/// Writes text (already token-resolved) to a file, replacing it.
#[derive(Debug, Clone)]
pub struct WriteFile {
    target: String,
    text: String,
}

#[async_trait::async_trait]
impl Operation for WriteFile {
    fn key(&self) -> &'static str {
        KEY
    }

    async fn run(&self, env: &Environment) -> Result<(), OperationError> {
        let path = env.resolve_path(&self.target)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        env.display_to_console(format!("Writing file {}", self.target));
        tokio::fs::write(&path, self.text.as_bytes()).await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WriteFileFactory;

impl OperationFactory for WriteFileFactory {
    fn key(&self) -> &'static str {
        KEY
    }

    fn create(&self, op: CreateOperation) -> Result<Box<dyn Operation>, OperationError> {
        let args: Args = op.parse_args()?;
        if args.target.trim().is_empty() {
            return Err(OperationError::invalid(KEY, "target must be non-empty"));
        }
        Ok(Box::new(WriteFile {
            target: args.target,
            text: args.text,
        }))
    }
}
