//! Spawning and terminating app processes.
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use std::{
    io,
    os::unix::process::CommandExt,
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, warn};

use crate::{config::LaunchPlan, error::ProcessManagerError};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Launches a plan as a child process in its own process group.
///
/// On **Linux** the child additionally receives `SIGTERM` through
/// `PR_SET_PDEATHSIG` when the thread that spawned it goes away, so callers
/// must spawn from a thread that outlives the child.
pub fn spawn(plan: &LaunchPlan) -> Result<Child, ProcessManagerError> {
    debug!(
        "Launching app '{}': `{}` {:?} in {}",
        plan.name,
        plan.program,
        plan.args,
        plan.cwd.display()
    );

    let mut cmd = Command::new(&plan.program);
    cmd.args(&plan.args)
        .current_dir(&plan.cwd)
        .envs(&plan.env)
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .process_group(0);

    if !plan.env.is_empty() {
        let keys: Vec<_> = plan.env.keys().collect();
        debug!("Setting environment variables: {:?}", keys);
    }

    #[cfg(target_os = "linux")]
    unsafe {
        cmd.pre_exec(|| {
            use libc::{PR_SET_PDEATHSIG, SIGTERM, prctl};
            if prctl(PR_SET_PDEATHSIG, SIGTERM, 0, 0, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    match cmd.spawn() {
        Ok(child) => {
            debug!("App '{}' started with PID: {}", plan.name, child.id());
            Ok(child)
        }
        Err(source) => {
            error!("Failed to start app '{}': {source}", plan.name);
            Err(ProcessManagerError::AppStartError {
                app: plan.name.clone(),
                source,
            })
        }
    }
}

fn stop_error(name: &str, source: io::Error) -> ProcessManagerError {
    ProcessManagerError::AppStopError {
        app: name.to_string(),
        source,
    }
}

fn errno_to_io(err: Errno) -> io::Error {
    io::Error::from_raw_os_error(err as i32)
}

/// Signals the process group led by `pid`, falling back to the leader alone.
fn signal_group(name: &str, pid: Pid, sig: Signal) -> Result<(), ProcessManagerError> {
    match signal::killpg(pid, sig) {
        Ok(()) => {
            debug!("Sent {sig} to process group {pid} for app '{name}'");
            return Ok(());
        }
        Err(Errno::ESRCH) => {
            debug!("Process group for app '{name}' missing; falling back to direct signal");
        }
        Err(Errno::EPERM) => {
            warn!(
                "Insufficient permissions to signal process group {pid} for '{name}'. Falling back to direct signal"
            );
        }
        Err(err) => {
            error!("Failed to signal process group {pid} of app '{name}': {err}");
            return Err(stop_error(name, errno_to_io(err)));
        }
    }

    match signal::kill(pid, sig) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => {
            error!("Failed to signal app '{name}' directly: {err}");
            Err(stop_error(name, errno_to_io(err)))
        }
    }
}

/// Sends `SIGTERM` to what is left of a group whose leader was already reaped.
///
/// Only the group is signalled: the leader's pid may have been reused.
fn signal_leftover_group(name: &str, pid: Pid) -> Result<(), ProcessManagerError> {
    match signal::killpg(pid, Signal::SIGTERM) {
        Ok(()) => {
            debug!("Sent SIGTERM to leftover process group {pid} of app '{name}'");
            Ok(())
        }
        Err(Errno::ESRCH) => Ok(()),
        Err(Errno::EPERM) => {
            warn!("Insufficient permissions to signal leftover process group {pid} of '{name}'");
            Ok(())
        }
        Err(err) => {
            error!("Failed to signal leftover process group {pid} of app '{name}': {err}");
            Err(stop_error(name, errno_to_io(err)))
        }
    }
}

/// Stops a child: `SIGTERM` to its group, then `SIGKILL` once `kill_timeout`
/// elapses. Always reaps the child before returning. A leader that already
/// exited still has its group signalled so background children go too.
pub fn terminate(
    name: &str,
    child: &mut Child,
    kill_timeout: Duration,
) -> Result<ExitStatus, ProcessManagerError> {
    let pid = Pid::from_raw(child.id() as i32);
    if let Some(status) = child.try_wait().map_err(|e| stop_error(name, e))? {
        debug!("App '{name}' had already exited with {status}");
        signal_leftover_group(name, pid)?;
        return Ok(status);
    }

    signal_group(name, pid, Signal::SIGTERM)?;

    let deadline = Instant::now() + kill_timeout;
    loop {
        if let Some(status) = child.try_wait().map_err(|e| stop_error(name, e))? {
            debug!("App '{name}' stopped with {status}");
            return Ok(status);
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }

    warn!("App '{name}' did not exit {kill_timeout:?} after SIGTERM; sending SIGKILL");
    signal_group(name, pid, Signal::SIGKILL)?;
    child.wait().map_err(|e| stop_error(name, e))
}

/// Whether a process with `pid` exists. Unreaped zombies count as alive.
pub fn is_alive(pid: u32) -> bool {
    match i32::try_from(pid) {
        Ok(raw) => signal::kill(Pid::from_raw(raw), None).is_ok(),
        Err(_) => false,
    }
}
