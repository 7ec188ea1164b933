use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};

use crate::models::ProcessSpec;

/// A freshly spawned OS process
pub struct SpawnedProcess {
    pub pid: u32,
    pub child: Child,
}

/// Spawn `spec.command` as the leader of a new process group.
///
/// The command line is split shell-style and executed directly, so a missing
/// program surfaces here as a spawn error instead of a shell exit code.
pub fn spawn(spec: &ProcessSpec) -> Result<SpawnedProcess, String> {
    let argv = shell_words::split(&spec.command).map_err(|e| format!("unparsable command: {}", e))?;
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| "empty command".to_string())?;

    if !Path::new(&spec.working_dir).is_dir() {
        return Err(format!("working directory {} does not exist", spec.working_dir));
    }

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&spec.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .process_group(0)
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|e| format!("{}: {}", program, e))?;
    let pid = child
        .id()
        .ok_or_else(|| "process exited before its pid was read".to_string())?;

    Ok(SpawnedProcess { pid, child })
}

/// Wait for the child to terminate and translate its status
pub async fn wait(mut child: Child) -> Option<i32> {
    match child.wait().await {
        Ok(status) => exit_code(status),
        Err(e) => {
            log::warn!("Failed to wait for child: {}", e);
            None
        }
    }
}

/// Exit code, or 128 + signal number for signal deaths (shell convention)
pub fn exit_code(status: ExitStatus) -> Option<i32> {
    status.code().or_else(|| status.signal().map(|sig| 128 + sig))
}

/// Signal the whole process group led by `pid`, falling back to the pid alone
pub fn signal_group(pid: u32, sig: Signal) -> Result<(), Errno> {
    let pid = Pid::from_raw(pid as i32);
    match signal::killpg(pid, sig) {
        Ok(()) => Ok(()),
        Err(Errno::ESRCH) => signal::kill(pid, sig),
        Err(e) => Err(e),
    }
}

/// Whether any member of the process group led by `pid` still exists
pub fn group_alive(pid: u32) -> bool {
    match signal::killpg(Pid::from_raw(pid as i32), None) {
        Ok(()) | Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// SIGKILL whatever is left of a group whose leader is already gone.
/// Never falls back to the bare pid, which may have been reused.
pub fn kill_group(pid: u32) {
    match signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => log::warn!("Failed to kill process group {}: {}", pid, e),
    }
}

/// Live and not a zombie, judged from `/proc/<pid>/stat`
#[cfg(test)]
pub(crate) fn pid_running(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{}/stat", pid))
        .ok()
        .and_then(|stat| {
            stat.rsplit_once(") ")
                .map(|(_, rest)| !rest.starts_with('Z') && !rest.starts_with('X'))
        })
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) async fn wait_for_exit(pid: u32, limit: std::time::Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if !pid_running(pid) {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    !pid_running(pid)
}
