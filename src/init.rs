use std::ffi::CString;
use std::path::Path;

use log::{debug, info};
use nix::unistd::{execv, sethostname};

use crate::container::Container;
use crate::errors::{Error, Result};
use crate::rootfs;

/// Body of the `init` role: the first process inside the fresh namespaces,
/// pid 1 of the new pid namespace whenever one was requested. Everything
/// here is single-threaded plain code so the mount, hostname, and exec
/// calls all happen on the one kernel task the clone created.
pub fn run(name: &str) -> Result<()> {
    // Blocks until the master opens the write side, which it only does
    // once cgroup placement is finished; resource limits are therefore in
    // force before the first user-code instruction.
    let container = Container::read_pipe(name)?;
    debug!("[init] container record: {:?}", container);

    if !container.rootfs.is_empty() {
        rootfs::setup(Path::new(&container.rootfs))?;
    }

    if !container.hostname.is_empty() {
        sethostname(&container.hostname).map_err(|e| Error::sys("sethostname", e))?;
    }

    info!("[init] exec {} {:?}", container.path, container.argv);
    exec(&container.path, &container.argv)
}

fn exec(path: &str, argv: &[String]) -> Result<()> {
    let path_c = CString::new(path)
        .map_err(|_| Error::InvalidOption(format!("command path {path:?}")))?;
    let mut argv_c = Vec::with_capacity(argv.len());
    for arg in argv {
        argv_c.push(
            CString::new(arg.as_str())
                .map_err(|_| Error::InvalidOption(format!("argument {arg:?}")))?,
        );
    }

    execv(&path_c, &argv_c).map_err(|e| Error::ExecFailed {
        path: path.to_string(),
        errno: e,
    })?;
    Ok(())
}
