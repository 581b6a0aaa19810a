use std::fmt;

/// Stable identifier for one hosted server environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct EnvironmentId(pub String);

impl EnvironmentId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for EnvironmentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hosting strategy of an environment. Fixed for the lifetime of the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentKind {
    Tty,
    Native,
    Container,
}

impl EnvironmentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvironmentKind::Tty => "tty",
            EnvironmentKind::Native => "native",
            EnvironmentKind::Container => "container",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tty" => Some(EnvironmentKind::Tty),
            "native" | "standard" => Some(EnvironmentKind::Native),
            "container" | "docker" => Some(EnvironmentKind::Container),
            _ => None,
        }
    }
}

impl fmt::Display for EnvironmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process lifecycle. `Starting` and `Stopping` are transient; there is no
/// crashed state, abnormal exits show up in [`ExitReport::graceful`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RunState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl RunState {
    pub fn is_active(self) -> bool {
        !matches!(self, RunState::Stopped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ExitReport {
    pub graceful: bool,
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EnvironmentStatus {
    pub id: EnvironmentId,
    pub kind: EnvironmentKind,
    pub state: RunState,
    pub pid: Option<u32>,
    pub last_exit: Option<ExitReport>,
}
