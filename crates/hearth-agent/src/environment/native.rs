use std::{path::Path, process::Stdio};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::Command,
    task::JoinHandle,
};

use super::{Launched, StdinWriter};
use crate::console::{ConsoleSink, LineAssembler};
use crate::error::EnvironmentError;

const READ_CHUNK: usize = 8192;

/// Copies one output stream into the console until EOF. Bytes are split into
/// lines here so stdout and stderr never share a partial line.
fn pump_lines<R>(mut stream: R, console: ConsoleSink) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = LineAssembler::default();
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    for line in lines.feed(&buf[..n]) {
                        console.push_line(line);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::debug!(%err, "output stream read failed");
                    break;
                }
            }
        }
        if let Some(rest) = lines.finish() {
            console.push_line(rest);
        }
    })
}

/// Spawns `command` with piped stdio; stdout and stderr are read line by line.
pub(crate) fn launch(
    root: &Path,
    command: &str,
    args: &[String],
    console: ConsoleSink,
) -> Result<Launched, EnvironmentError> {
    let mut cmd = Command::new(command);
    cmd.args(args)
        .current_dir(root)
        .env("HOME", root)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| super::detach_child(false));
    }

    let mut child = cmd.spawn().map_err(|source| EnvironmentError::Spawn {
        command: command.to_string(),
        cwd: root.to_path_buf(),
        source,
    })?;
    let pid = child.id().ok_or_else(|| EnvironmentError::Spawn {
        command: command.to_string(),
        cwd: root.to_path_buf(),
        source: std::io::Error::other("child exited before its pid was observed"),
    })?;

    let mut output = Vec::new();
    if let Some(out) = child.stdout.take() {
        output.push(pump_lines(out, console.clone()));
    }
    if let Some(err) = child.stderr.take() {
        output.push(pump_lines(err, console));
    }

    Ok(Launched {
        stdin: child.stdin.take().map(StdinWriter::Pipe),
        child,
        pid,
        output,
    })
}
