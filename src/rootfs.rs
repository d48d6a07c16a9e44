use std::fs;
use std::path::Path;

use log::debug;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::unistd::{chdir, chroot};

use crate::errors::{Error, Result};

const NONE: Option<&str> = None;

/// Re-plumb the mount tree and swing the root. Runs in the init role after
/// the record has arrived and before exec; the caller skips the whole
/// sequence when the container shares the host root.
pub fn setup(rootfs: &Path) -> Result<()> {
    // Mount events must stay inside the new namespace.
    mount(NONE, "/", NONE, MsFlags::MS_SLAVE | MsFlags::MS_REC, NONE).map_err(|e| {
        Error::MountFailed {
            target: "/".into(),
            errno: e,
        }
    })?;

    // The new root has to be a mount point before it can be moved.
    mount(
        Some(rootfs),
        rootfs,
        NONE,
        MsFlags::MS_BIND | MsFlags::MS_REC,
        NONE,
    )
    .map_err(|e| Error::MountFailed {
        target: rootfs.to_path_buf(),
        errno: e,
    })?;

    let proc_dir = rootfs.join("proc");
    if !proc_dir.exists() {
        fs::create_dir_all(&proc_dir)?;
    }
    mount(
        Some("proc"),
        &proc_dir,
        Some("proc"),
        MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        NONE,
    )
    .map_err(|e| Error::MountFailed {
        target: proc_dir.clone(),
        errno: e,
    })?;

    switch_root(rootfs)
}

fn switch_root(rootfs: &Path) -> Result<()> {
    let fail = |errno| Error::ChrootFailed {
        root: rootfs.to_path_buf(),
        errno,
    };

    chdir(rootfs).map_err(fail)?;
    mount(Some(rootfs), "/", NONE, MsFlags::MS_MOVE, NONE).map_err(fail)?;
    chroot(".").map_err(fail)?;
    chdir("/").map_err(fail)?;

    debug!("[init] switched root to {}", rootfs.display());
    Ok(())
}

/// Best-effort detach of the container rootfs during master cleanup.
pub fn unmount(rootfs: &Path) {
    let _ = umount2(rootfs, MntFlags::MNT_DETACH);
}
