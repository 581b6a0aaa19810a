use std::{collections::BTreeMap, path::Path};

use hearth_process::EnvironmentKind;

use crate::operations::OperationSpec;
use crate::tokens;

fn default_kind() -> EnvironmentKind {
    EnvironmentKind::Tty
}

/// A server as declared by a template: how to provision it and how to run it.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ServerDefinition {
    pub id: String,
    #[serde(default = "default_kind")]
    pub environment: EnvironmentKind,
    /// Template variables used for `${...}` substitution.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    #[serde(default)]
    pub install: Vec<OperationSpec>,
    pub run: RunSpec,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RunSpec {
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Console command that asks the server to shut down, e.g. `stop`.
    #[serde(default)]
    pub stop: Option<String>,
}

impl RunSpec {
    /// Command and arguments with `${...}` tokens filled from `data`.
    pub fn resolve(&self, data: &BTreeMap<String, String>) -> (String, Vec<String>) {
        let command = tokens::substitute(&self.command, data);
        let arguments = self
            .arguments
            .iter()
            .map(|arg| tokens::substitute(arg, data))
            .collect();
        (command, arguments)
    }
}

impl ServerDefinition {
    /// Template variables plus the agent-provided `rootDir` and `serverId`.
    pub fn data_map(&self, root: &Path) -> BTreeMap<String, String> {
        let mut out = self.data.clone();
        out.insert("rootDir".to_string(), root.display().to_string());
        out.insert("serverId".to_string(), self.id.clone());
        out
    }
}
