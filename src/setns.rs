use std::env;
use std::ffi::CString;
use std::fs::File;
use std::process::exit;

use log::debug;
use nix::sched::{setns, CloneFlags};
use nix::unistd::{close, execv, fork, ForkResult};

use crate::container::Container;
use crate::errors::{Error, Result};
use crate::ipc;
use crate::lock;
use crate::namespace::SETNS_ORDER;
use crate::proto::ExecRequest;

/// Environment contract between the master and the setns re-exec.
pub const ENV_INIT_PID: &str = "INIT_PID";
pub const ENV_COMMAND: &str = "COMMAND";
pub const ENV_PIPE: &str = "PIPE";

/// Body of the `setns` role: join a running container's namespaces and run
/// a one-off command there. Single-threaded for the same reason as init:
/// setns binds the calling kernel task, not the process.
pub fn run(name: &str) -> Result<()> {
    let init_pid: i32 = env_var(ENV_INIT_PID)?
        .parse()
        .map_err(|_| Error::InvalidOption(format!("{ENV_INIT_PID} is not a pid")))?;
    let pipe_fd: i32 = env_var(ENV_PIPE)?
        .parse()
        .map_err(|_| Error::InvalidOption(format!("{ENV_PIPE} is not an fd number")))?;
    let request: ExecRequest = serde_json::from_str(&env_var(ENV_COMMAND)?)
        .map_err(|e| Error::RequestMalformed(e.to_string()))?;

    // Block until the master has finished its spawn window, then release
    // immediately so the next exec can take its turn.
    drop(lock::acquire(&Container::dir_of(name).join("lock"))?);

    enter_namespaces(init_pid)?;

    // Joining a pid namespace only affects children, hence the fork. The
    // parent reports the container-side pid on the inherited pipe and gets
    // out of the way; the child becomes the user command.
    match unsafe { fork() }.map_err(|e| Error::sys("fork", e))? {
        ForkResult::Parent { child } => {
            ipc::report_pid(pipe_fd, child.as_raw())?;
            exit(0);
        }
        ForkResult::Child => {
            // The pipe end is not close-on-exec (the parent needs it across
            // its own execve), so drop it here or the user command would
            // inherit a stray fd.
            let _ = close(pipe_fd);
            exec(&request)
        }
    }
}

/// Join the target namespaces in fixed order; mount last so the earlier
/// /proc opens still resolve against the old mount namespace.
fn enter_namespaces(pid: i32) -> Result<()> {
    for kind in SETNS_ORDER {
        let path = format!("/proc/{}/ns/{}", pid, kind.proc_name());
        let file = File::open(&path)?;
        setns(&file, CloneFlags::empty()).map_err(|e| Error::sys("setns", e))?;
        debug!("[setns] entered {path}");
    }
    Ok(())
}

fn exec(request: &ExecRequest) -> Result<()> {
    let path_c = CString::new(request.path.as_str())
        .map_err(|_| Error::InvalidOption(format!("command path {:?}", request.path)))?;
    let mut argv_c = Vec::with_capacity(request.argv.len());
    for arg in &request.argv {
        argv_c.push(
            CString::new(arg.as_str())
                .map_err(|_| Error::InvalidOption(format!("argument {arg:?}")))?,
        );
    }

    // execv keeps the inherited environment.
    execv(&path_c, &argv_c).map_err(|e| Error::ExecFailed {
        path: request.path.clone(),
        errno: e,
    })?;
    Ok(())
}

fn env_var(key: &str) -> Result<String> {
    env::var(key).map_err(|_| Error::InvalidOption(format!("missing environment variable {key}")))
}
