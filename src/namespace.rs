use nix::sched::CloneFlags;

/// Namespace kinds the runtime knows about. Network and user stay in the
/// table but contribute no clone flag: a fresh net namespace without any
/// plumbing has no connectivity, and user namespaces need uid/gid maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsKind {
    Mount,
    Uts,
    Pid,
    Net,
    User,
    Ipc,
}

/// Every kind considered when building the clone mask.
pub const ALL: [NsKind; 6] = [
    NsKind::Mount,
    NsKind::Uts,
    NsKind::Pid,
    NsKind::Net,
    NsKind::User,
    NsKind::Ipc,
];

/// Entry order when joining an existing container. Mount must come last so
/// the earlier /proc/<pid>/ns lookups still resolve against the host tree;
/// user is never entered.
pub const SETNS_ORDER: [NsKind; 5] = [
    NsKind::Ipc,
    NsKind::Uts,
    NsKind::Net,
    NsKind::Pid,
    NsKind::Mount,
];

impl NsKind {
    /// Contribution to the clone mask.
    pub fn clone_flag(self) -> CloneFlags {
        match self {
            NsKind::Mount => CloneFlags::CLONE_NEWNS,
            NsKind::Uts => CloneFlags::CLONE_NEWUTS,
            NsKind::Pid => CloneFlags::CLONE_NEWPID,
            NsKind::Ipc => CloneFlags::CLONE_NEWIPC,
            NsKind::Net | NsKind::User => CloneFlags::empty(),
        }
    }

    /// Name of the /proc/<pid>/ns entry.
    pub fn proc_name(self) -> &'static str {
        match self {
            NsKind::Mount => "mnt",
            NsKind::Uts => "uts",
            NsKind::Pid => "pid",
            NsKind::Net => "net",
            NsKind::User => "user",
            NsKind::Ipc => "ipc",
        }
    }
}

/// Clone-flag mask for a container. An empty rootfs means the child shares
/// every host namespace, so the mask is empty.
pub fn clone_flags(rootfs: &str) -> CloneFlags {
    if rootfs.is_empty() {
        return CloneFlags::empty();
    }
    ALL.iter()
        .fold(CloneFlags::empty(), |acc, kind| acc | kind.clone_flag())
}
