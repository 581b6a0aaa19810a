use std::path::PathBuf;

use super::http::{self, Expected};
use super::{CreateOperation, OneOrMany, Operation, OperationFactory};
use crate::environment::Environment;
use crate::error::OperationError;

pub const KEY: &str = "download";

#[derive(Debug, serde::Deserialize)]
struct Args {
    files: OneOrMany,
    #[serde(default)]
    target: Option<String>,
}

/// Fetches one or more URLs into the environment. Existing files are
/// overwritten; there is no checksum to compare against.
#[derive(Debug, Clone)]
pub struct Download {
    files: Vec<String>,
    target: Option<String>,
}

impl Download {
    fn destination(&self, env: &Environment, url: &str) -> Result<PathBuf, OperationError> {
        let name = || {
            http::file_name_from_url(url).ok_or_else(|| {
                OperationError::invalid(KEY, format!("cannot derive a file name from {url}"))
            })
        };

        match self.target.as_deref() {
            None | Some("") => Ok(env.resolve_path(&name()?)?),
            // Several files, or an explicit directory, land inside the target dir.
            Some(t) if self.files.len() > 1 || t.ends_with('/') => {
                Ok(env.resolve_path(t)?.join(name()?))
            }
            Some(t) => {
                let p = env.resolve_path(t)?;
                if p.is_dir() {
                    Ok(p.join(name()?))
                } else {
                    Ok(p)
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Operation for Download {
    fn key(&self) -> &'static str {
        KEY
    }

    async fn run(&self, env: &Environment) -> Result<(), OperationError> {
        for url in &self.files {
            let path = self.destination(env, url)?;
            env.display_to_console(format!("Downloading file {url}"));
            let bytes = http::download_to(url, &path, &Expected::default()).await?;
            tracing::debug!(%url, path = %path.display(), bytes, "file downloaded");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DownloadFactory;

impl OperationFactory for DownloadFactory {
    fn key(&self) -> &'static str {
        KEY
    }

    fn create(&self, op: CreateOperation) -> Result<Box<dyn Operation>, OperationError> {
        let args: Args = op.parse_args()?;
        let files: Vec<String> = args
            .files
            .into_vec()
            .into_iter()
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty())
            .collect();
        if files.is_empty() {
            return Err(OperationError::invalid(KEY, "files must list at least one URL"));
        }
        for f in &files {
            if reqwest::Url::parse(f).is_err() {
                return Err(OperationError::invalid(KEY, format!("invalid URL: {f}")));
            }
        }
        Ok(Box::new(Download {
            files,
            target: args.target,
        }))
    }
}
