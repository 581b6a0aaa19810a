use std::collections::BTreeMap;

use super::http::{self, Expected};
use super::{CreateOperation, Operation, OperationFactory};
use crate::environment::Environment;
use crate::error::OperationError;

pub const KEY: &str = "mojangdl";

#[derive(Debug, Clone, serde::Deserialize)]
pub struct VersionManifest {
    /// Alias (e.g. `release`, `snapshot`) to concrete version id.
    #[serde(default)]
    pub latest: BTreeMap<String, String>,
    pub versions: Vec<VersionRef>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct VersionRef {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct VersionDescriptor {
    downloads: BTreeMap<String, DownloadEntry>,
}

#[derive(Debug, Clone, serde::Deserialize)]
struct DownloadEntry {
    url: String,
    #[serde(default)]
    sha1: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

/// Maps an alias to its current target; anything else is taken as a
/// concrete version id. `latest_release` and `latest-release` also hit the
/// `release` alias.
pub fn resolve_version<'a>(manifest: &'a VersionManifest, requested: &'a str) -> &'a str {
    let requested = requested.trim();
    if let Some(id) = manifest.latest.get(requested) {
        return id;
    }
    let stripped = requested
        .strip_prefix("latest_")
        .or_else(|| requested.strip_prefix("latest-"));
    if let Some(id) = stripped.and_then(|alias| manifest.latest.get(alias)) {
        return id;
    }
    requested
}

#[derive(Debug, serde::Deserialize)]
struct Args {
    version: String,
    target: String,
}

/// Resolves a Minecraft server version through the launcher manifest and
/// downloads its server jar.
#[derive(Debug, Clone)]
pub struct MojangDl {
    version: String,
    target: String,
    manifest_url: String,
}

impl MojangDl {
    async fn fetch_descriptor(&self, env: &Environment) -> Result<(String, DownloadEntry), OperationError> {
        env.display_to_console(format!("Fetching version manifest from {}", self.manifest_url));
        let manifest: VersionManifest = http::get_json(&self.manifest_url).await?;

        let resolved = resolve_version(&manifest, &self.version).to_string();
        let Some(vref) = manifest.versions.iter().find(|v| v.id == resolved) else {
            env.display_to_console(format!("Could not locate version {}", self.version));
            return Err(OperationError::VersionNotLocated(self.version.clone()));
        };

        tracing::debug!(version = %vref.id, url = %vref.url, "version json located");
        env.display_to_console(format!(
            "Version {} json located, downloading from {}",
            vref.id, vref.url
        ));
        let descriptor: VersionDescriptor = http::get_json(&vref.url).await?;

        let server = descriptor
            .downloads
            .get("server")
            .cloned()
            .ok_or_else(|| OperationError::Malformed {
                url: vref.url.clone(),
                message: "no `server` entry in downloads".to_string(),
            })?;
        Ok((vref.id.clone(), server))
    }
}

#[async_trait::async_trait]
impl Operation for MojangDl {
    fn key(&self) -> &'static str {
        KEY
    }

    async fn run(&self, env: &Environment) -> Result<(), OperationError> {
        let target = env.resolve_path(&self.target)?;
        let (version_id, server) = self.fetch_descriptor(env).await?;

        if let Some(want) = &server.sha1
            && http::file_sha1(&target)
                .await?
                .is_some_and(|have| have.eq_ignore_ascii_case(want))
        {
            env.display_to_console(format!(
                "Server jar for {version_id} already present at {}",
                self.target
            ));
            return Ok(());
        }

        tracing::debug!(url = %server.url, "version jar located");
        env.display_to_console(format!(
            "Version jar located, downloading from {}",
            server.url
        ));
        let bytes = http::download_to(
            &server.url,
            &target,
            &Expected {
                size: server.size,
                sha1: server.sha1.clone(),
            },
        )
        .await?;
        env.display_to_console(format!("Downloaded {bytes} bytes to {}", self.target));
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MojangDlFactory {
    manifest_url: String,
}

impl MojangDlFactory {
    pub fn new(manifest_url: impl Into<String>) -> Self {
        Self {
            manifest_url: manifest_url.into(),
        }
    }
}

impl OperationFactory for MojangDlFactory {
    fn key(&self) -> &'static str {
        KEY
    }

    fn create(&self, op: CreateOperation) -> Result<Box<dyn Operation>, OperationError> {
        let args: Args = op.parse_args()?;
        if args.version.trim().is_empty() {
            return Err(OperationError::invalid(KEY, "version must be non-empty"));
        }
        if args.target.trim().is_empty() {
            return Err(OperationError::invalid(KEY, "target must be non-empty"));
        }
        Ok(Box::new(MojangDl {
            version: args.version.trim().to_string(),
            target: args.target,
            manifest_url: self.manifest_url.clone(),
        }))
    }
}
