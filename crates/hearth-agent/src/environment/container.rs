use std::path::Path;

use hearth_process::EnvironmentId;

#[derive(Debug, Clone)]
pub struct ContainerOptions {
    pub image: String,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            image: "eclipse-temurin:21-jre".to_string(),
        }
    }
}

fn sanitize_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

pub(crate) fn container_name(id: &EnvironmentId) -> String {
    format!("hearth-{}", sanitize_name(&id.0))
}

/// `docker run` arguments that execute `command` inside `options.image` with
/// the root directory bind-mounted at the same path and used as workdir.
pub(crate) fn docker_run_args(
    id: &EnvironmentId,
    options: &ContainerOptions,
    root: &Path,
    command: &str,
    args: &[String],
) -> Vec<String> {
    let root = root.display().to_string();
    let mut out = vec![
        "run".to_string(),
        "--rm".to_string(),
        "--init".to_string(),
        "--interactive".to_string(),
        "--name".to_string(),
        container_name(id),
        "--workdir".to_string(),
        root.clone(),
        "--mount".to_string(),
        format!("type=bind,source={root},target={root}"),
        "--env".to_string(),
        format!("HOME={root}"),
        "--label".to_string(),
        format!("hearth.environment_id={}", id.0),
        "--label".to_string(),
        "hearth.managed_by=hearth-agent".to_string(),
        "--entrypoint".to_string(),
        command.to_string(),
        options.image.clone(),
    ];
    out.extend(args.iter().cloned());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wraps_command_in_docker_run() {
        let id = EnvironmentId("srv/1".to_string());
        let opts = ContainerOptions {
            image: "example/java:21".to_string(),
        };
        let args = docker_run_args(
            &id,
            &opts,
            Path::new("/srv/servers/one"),
            "java",
            &["-jar".to_string(), "server.jar".to_string()],
        );

        assert_eq!(args[0], "run");
        let pos = |flag: &str| args.iter().position(|a| a == flag).unwrap();
        assert_eq!(args[pos("--name") + 1], "hearth-srv-1");
        assert_eq!(args[pos("--workdir") + 1], "/srv/servers/one");
        assert_eq!(
            args[pos("--mount") + 1],
            "type=bind,source=/srv/servers/one,target=/srv/servers/one"
        );
        assert_eq!(args[pos("--entrypoint") + 1], "java");
        // Image comes right before the command arguments.
        assert_eq!(&args[args.len() - 3..], ["example/java:21", "-jar", "server.jar"]);
        assert!(args.contains(&"HOME=/srv/servers/one".to_string()));
    }
}
