use std::{
    io::Read,
    os::fd::{FromRawFd, OwnedFd},
    path::Path,
    process::Stdio,
};

use tokio::process::Command;

use super::{Launched, StdinWriter, detach_child};
use crate::console::ConsoleSink;
use crate::error::EnvironmentError;

const READ_CHUNK: usize = 4096;

struct Pty {
    master: OwnedFd,
    slave: OwnedFd,
}

fn set_cloexec(fd: &OwnedFd) -> std::io::Result<()> {
    use std::os::fd::AsRawFd;

    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFD) };
    if flags == -1 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFD, flags | libc::FD_CLOEXEC) } == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn open_pty() -> std::io::Result<Pty> {
    let mut master: libc::c_int = -1;
    let mut slave: libc::c_int = -1;
    let rc = unsafe {
        libc::openpty(
            &mut master,
            &mut slave,
            std::ptr::null_mut(),
            std::ptr::null_mut(),
            std::ptr::null_mut(),
        )
    };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }

    // openpty hands back two fresh descriptors that nothing else owns.
    let pty = unsafe {
        Pty {
            master: OwnedFd::from_raw_fd(master),
            slave: OwnedFd::from_raw_fd(slave),
        }
    };
    set_cloexec(&pty.master)?;
    set_cloexec(&pty.slave)?;
    Ok(pty)
}

/// Spawns `command` with the slave side of a fresh pty as stdin/stdout/stderr
/// and controlling terminal. Output is copied from the master by a blocking
/// reader until the slave side is closed by every process holding it.
pub(crate) fn launch(
    root: &Path,
    command: &str,
    args: &[String],
    console: ConsoleSink,
) -> Result<Launched, EnvironmentError> {
    let Pty { master, slave } = open_pty().map_err(EnvironmentError::Pty)?;
    let stdout = slave.try_clone().map_err(EnvironmentError::Pty)?;
    let stderr = slave.try_clone().map_err(EnvironmentError::Pty)?;
    let writer = master.try_clone().map_err(EnvironmentError::Pty)?;

    let child = {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(root)
            .env("HOME", root)
            .env("TERM", "xterm")
            .stdin(Stdio::from(slave))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(false);

        unsafe {
            cmd.pre_exec(|| detach_child(true));
        }

        // `cmd` drops at the end of this block, closing our copies of the slave.
        cmd.spawn().map_err(|source| EnvironmentError::Spawn {
            command: command.to_string(),
            cwd: root.to_path_buf(),
            source,
        })?
    };

    let pid = child.id().ok_or_else(|| EnvironmentError::Spawn {
        command: command.to_string(),
        cwd: root.to_path_buf(),
        source: std::io::Error::other("child exited before its pid was observed"),
    })?;

    let mut reader = std::fs::File::from(master);
    let copier = tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => console.write(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                // Linux reports EIO once the last slave descriptor is closed.
                Err(_) => break,
            }
        }
        console.close();
    });

    Ok(Launched {
        child,
        pid,
        stdin: Some(StdinWriter::Pty(tokio::fs::File::from_std(
            std::fs::File::from(writer),
        ))),
        output: vec![copier],
    })
}
