use std::{
    fs,
    path::{Path, PathBuf},
};

use super::{CreateOperation, Operation, OperationFactory};
use crate::environment::Environment;
use crate::error::OperationError;

pub const KEY: &str = "extract";

#[derive(Debug, serde::Deserialize)]
struct Args {
    source: String,
    #[serde(default)]
    destination: Option<String>,
}

/// Unpacks a zip archive that already sits inside the environment.
/// Entries are overwritten on re-run.
#[derive(Debug, Clone)]
pub struct Extract {
    source: String,
    destination: String,
}

fn archive_err(path: &Path) -> impl FnOnce(zip::result::ZipError) -> OperationError + '_ {
    move |e| OperationError::Archive {
        path: path.to_path_buf(),
        message: e.to_string(),
    }
}

fn unzip(source: &Path, dest: &Path) -> Result<usize, OperationError> {
    let f = fs::File::open(source)?;
    let mut archive = zip::ZipArchive::new(f).map_err(archive_err(source))?;
    fs::create_dir_all(dest)?;

    let mut written = 0usize;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(archive_err(source))?;
        // `enclosed_name` rejects absolute names and `..` components.
        let Some(rel) = entry.enclosed_name() else {
            return Err(OperationError::Archive {
                path: source.to_path_buf(),
                message: format!("entry escapes destination: {}", entry.name()),
            });
        };
        let out_path = dest.join(rel);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut tmp_name = out_path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = out_path.with_file_name(tmp_name);
        let mut out = fs::File::create(&tmp_path)?;
        std::io::copy(&mut entry, &mut out)?;
        out.sync_all().ok();
        fs::rename(&tmp_path, &out_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&out_path, fs::Permissions::from_mode(mode & 0o777))?;
            }
        }
        written += 1;
    }
    Ok(written)
}

#[async_trait::async_trait]
impl Operation for Extract {
    fn key(&self) -> &'static str {
        KEY
    }

    async fn run(&self, env: &Environment) -> Result<(), OperationError> {
        let source = env.resolve_path(&self.source)?;
        let dest: PathBuf = env.resolve_path(&self.destination)?;
        env.display_to_console(format!("Extracting {}", self.source));

        let files = tokio::task::spawn_blocking(move || unzip(&source, &dest))
            .await
            .map_err(|e| OperationError::Io(std::io::Error::other(e)))??;
        tracing::debug!(source = %self.source, files, "archive extracted");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractFactory;

impl OperationFactory for ExtractFactory {
    fn key(&self) -> &'static str {
        KEY
    }

    fn create(&self, op: CreateOperation) -> Result<Box<dyn Operation>, OperationError> {
        let args: Args = op.parse_args()?;
        if args.source.trim().is_empty() {
            return Err(OperationError::invalid(KEY, "source must be non-empty"));
        }
        Ok(Box::new(Extract {
            source: args.source,
            destination: args.destination.unwrap_or_default(),
        }))
    }
}
