use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::container::Container;
use crate::errors::{Error, Result};

mod setters;
pub use setters::{CgroupOpts, Setter, SetterRegistry};

pub const MEMORY: &str = "memory";
pub const CPU: &str = "cpu";
pub const CPUACCT: &str = "cpuacct";
pub const CPUSET: &str = "cpuset";
pub const DEVICES: &str = "devices";
pub const FREEZER: &str = "freezer";
pub const BLKIO: &str = "blkio";
pub const HUGETLB: &str = "hugetlb";

pub const SUBSYSTEMS: [&str; 8] = [
    MEMORY, CPU, CPUACCT, CPUSET, DEVICES, FREEZER, BLKIO, HUGETLB,
];

/// Subsystems a container joins, in application order.
pub const APPLY_ORDER: [&str; 4] = [MEMORY, CPUSET, CPUACCT, CPU];

/// Host-side view of the v1 cgroup hierarchies: where each subsystem is
/// mounted and which root path pid 1 runs under.
pub struct CgroupHost {
    mounts: HashMap<String, PathBuf>,
    roots: HashMap<String, PathBuf>,
    registry: SetterRegistry,
}

impl CgroupHost {
    /// Read the kernel's view from /proc/1/cgroup and /proc/mounts.
    pub fn discover(registry: SetterRegistry) -> Result<Self> {
        let roots = parse_proc_cgroup(&fs::read_to_string("/proc/1/cgroup")?);
        let mounts = parse_proc_mounts(&fs::read_to_string("/proc/mounts")?);
        Ok(CgroupHost {
            mounts,
            roots,
            registry,
        })
    }

    /// Place the container's init pid into every subsystem in APPLY_ORDER
    /// and apply the knobs. Each leaf lands in `cgroup_paths` the moment it
    /// exists, so when a stage fails partway the caller kills the init pid
    /// and teardown still finds every directory this run created.
    pub fn apply(&self, container: &mut Container) -> Result<()> {
        for subsys in APPLY_ORDER {
            let dir = self.leaf_dir(subsys, container)?;
            container
                .cgroup_paths
                .insert(subsys.to_string(), dir.clone());
            if subsys == CPUSET {
                inherit_if_empty(&dir, "cpuset.cpus")?;
                inherit_if_empty(&dir, "cpuset.mems")?;
            }
            attach_pid(&dir, container.pid)?;
            self.registry
                .write(subsys, &container.cgroup_opts, &dir)?;
        }
        Ok(())
    }

    /// Leaf directory `<mount>/<root>/<prefix>/<name>` for one subsystem,
    /// created if missing.
    fn leaf_dir(&self, subsys: &str, container: &Container) -> Result<PathBuf> {
        let mount = self
            .mounts
            .get(subsys)
            .filter(|p| !p.as_os_str().is_empty());
        let root = self.roots.get(subsys).filter(|p| !p.as_os_str().is_empty());
        let (mount, root) = match (mount, root) {
            (Some(mount), Some(root)) => (mount, root),
            _ => return Err(Error::NotMounted(subsys.to_string())),
        };

        let rel = root.strip_prefix("/").unwrap_or(root);
        let dir = mount
            .join(rel)
            .join(&container.cgroup_prefix)
            .join(&container.name);
        debug!(
            "[cgroup] {}: mount {}, root {}, leaf {}",
            subsys,
            mount.display(),
            root.display(),
            dir.display()
        );
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

fn attach_pid(dir: &Path, pid: i32) -> Result<()> {
    fs::write(dir.join("cgroup.procs"), pid.to_string())?;
    Ok(())
}

/// Fresh cpuset leaves inherit nothing, yet tasks may only join once
/// `cpus`/`mems` are non-empty. Walk up until an ancestor holds a value,
/// then copy it back down parent-to-child into every empty level including
/// the leaf.
fn inherit_if_empty(leaf: &Path, file: &str) -> Result<()> {
    let mut empties: Vec<PathBuf> = Vec::new();
    let mut dir = leaf.to_path_buf();
    loop {
        let path = dir.join(file);
        let content = fs::read_to_string(&path)?;
        let value = content.trim();
        if !value.is_empty() {
            for path in empties.iter().rev() {
                fs::write(path, value)?;
            }
            return Ok(());
        }
        empties.push(path);
        dir = match dir.parent() {
            Some(parent) => parent.to_path_buf(),
            None => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no ancestor of {} has a non-empty {file}", leaf.display()),
                )))
            }
        };
    }
}

/// Remove the leaf directories created for a container. Already-missing
/// leaves are fine, so running this twice is a no-op.
pub fn teardown(paths: &HashMap<String, PathBuf>) {
    for (subsys, dir) in paths {
        match fs::remove_dir(dir) {
            Ok(()) => debug!("[cgroup] removed {} leaf {}", subsys, dir.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("[cgroup] remove {}: {e}", dir.display()),
        }
    }
}

/// Map subsystem name to the path pid 1 runs under. Lines look like
/// `4:memory:/some/path`; the controllers field may hold several names
/// joined by commas.
fn parse_proc_cgroup(text: &str) -> HashMap<String, PathBuf> {
    let mut roots = HashMap::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split(':').collect();
        if fields.len() != 3 {
            continue;
        }
        for token in fields[1].split(',') {
            if SUBSYSTEMS.contains(&token) {
                roots.insert(token.to_string(), PathBuf::from(fields[2]));
            }
        }
    }
    roots
}

/// Map subsystem name to its cgroupfs mountpoint. Kernel mount names join
/// co-mounted controllers with commas in the basename, e.g.
/// `/sys/fs/cgroup/cpu,cpuacct`.
fn parse_proc_mounts(text: &str) -> HashMap<String, PathBuf> {
    let mut mounts = HashMap::new();
    for line in text.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() != 6 {
            continue;
        }
        if fields[2] != "cgroup" {
            continue;
        }
        let mountpoint = Path::new(fields[1]);
        let base = match mountpoint.file_name().and_then(|n| n.to_str()) {
            Some(base) => base,
            None => continue,
        };
        for token in base.split(',') {
            if SUBSYSTEMS.contains(&token) {
                mounts.insert(token.to_string(), mountpoint.to_path_buf());
            }
        }
    }
    mounts
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const PROC_CGROUP: &str = "\
12:pids:/init.scope
11:cpu,cpuacct:/
10:memory:/machine
5:cpuset:/
4:devices:/init.scope
1:name=systemd:/init.scope
0::/init.scope";

    const PROC_MOUNTS: &str = "\
sysfs /sys sysfs rw,nosuid,nodev,noexec,relatime 0 0
cgroup2 /sys/fs/cgroup/unified cgroup2 rw,nosuid,nodev,noexec,relatime 0 0
cgroup /sys/fs/cgroup/cpu,cpuacct cgroup rw,nosuid,cpu,cpuacct 0 0
cgroup /sys/fs/cgroup/memory cgroup rw,nosuid,memory 0 0
cgroup /sys/fs/cgroup/cpuset cgroup rw,nosuid,cpuset 0 0
cgroup /sys/fs/cgroup/devices cgroup rw,nosuid,devices 0 0
tmpfs /run tmpfs rw,nosuid,nodev 0 0";

    #[test]
    fn proc_cgroup_splits_controllers() {
        let roots = parse_proc_cgroup(PROC_CGROUP);
        assert_eq!(roots.get(CPU), Some(&PathBuf::from("/")));
        assert_eq!(roots.get(CPUACCT), Some(&PathBuf::from("/")));
        assert_eq!(roots.get(MEMORY), Some(&PathBuf::from("/machine")));
        assert_eq!(roots.get(CPUSET), Some(&PathBuf::from("/")));
        // pids is not a known subsystem, the v2 line has no controllers.
        assert!(!roots.contains_key("pids"));
        assert_eq!(roots.len(), 5);
    }

    #[test]
    fn proc_mounts_matches_fstype_and_basename() {
        let mounts = parse_proc_mounts(PROC_MOUNTS);
        assert_eq!(
            mounts.get(CPU),
            Some(&PathBuf::from("/sys/fs/cgroup/cpu,cpuacct"))
        );
        assert_eq!(
            mounts.get(CPUACCT),
            Some(&PathBuf::from("/sys/fs/cgroup/cpu,cpuacct"))
        );
        assert_eq!(
            mounts.get(MEMORY),
            Some(&PathBuf::from("/sys/fs/cgroup/memory"))
        );
        // cgroup2 mounts must not be picked up.
        assert!(!mounts.contains_key("unified"));
    }

    fn host_in(dir: &Path) -> CgroupHost {
        let mut mounts = HashMap::new();
        let mut roots = HashMap::new();
        for subsys in APPLY_ORDER {
            mounts.insert(subsys.to_string(), dir.join(subsys));
            roots.insert(subsys.to_string(), PathBuf::from("/"));
        }
        CgroupHost {
            mounts,
            roots,
            registry: SetterRegistry::default(),
        }
    }

    fn container_in(dir: &Path) -> Container {
        Container {
            name: "demo".to_string(),
            dir: dir.to_path_buf(),
            cgroup_prefix: "minibox".to_string(),
            pid: 12345,
            ..Container::default()
        }
    }

    #[test]
    fn missing_subsystem_is_not_mounted() {
        let tmp = tempfile::tempdir().unwrap();
        let mut host = host_in(tmp.path());
        host.mounts.remove(MEMORY);

        let mut container = container_in(tmp.path());
        let err = host.apply(&mut container).unwrap_err();
        assert!(matches!(err, Error::NotMounted(ref s) if s == MEMORY));
    }

    #[test]
    fn apply_attaches_pid_and_inherits_cpuset() {
        let tmp = tempfile::tempdir().unwrap();
        let host = host_in(tmp.path());

        // Fake hierarchy: values at the mount root, empty files below, the
        // way the kernel pre-creates them in fresh directories.
        let cpuset = tmp.path().join(CPUSET);
        let leaf = cpuset.join("minibox/demo");
        fs::create_dir_all(&leaf).unwrap();
        fs::write(cpuset.join("cpuset.cpus"), "0-3\n").unwrap();
        fs::write(cpuset.join("cpuset.mems"), "0\n").unwrap();
        for level in [&cpuset.join("minibox"), &leaf] {
            fs::write(level.join("cpuset.cpus"), "").unwrap();
            fs::write(level.join("cpuset.mems"), "").unwrap();
        }

        let mut container = container_in(tmp.path());
        container.cgroup_opts.limit_in_bytes = "1048576".to_string();
        host.apply(&mut container).unwrap();

        // Every stage attached the pid and landed in cgroup_paths.
        for subsys in APPLY_ORDER {
            let dir = container.cgroup_paths.get(subsys).unwrap();
            assert_eq!(
                fs::read_to_string(dir.join("cgroup.procs")).unwrap(),
                "12345"
            );
        }

        // The cpuset leaf and the intermediate level got the root's value.
        assert_eq!(fs::read_to_string(leaf.join("cpuset.cpus")).unwrap(), "0-3");
        assert_eq!(
            fs::read_to_string(cpuset.join("minibox/cpuset.cpus")).unwrap(),
            "0-3"
        );
        assert_eq!(fs::read_to_string(leaf.join("cpuset.mems")).unwrap(), "0");

        // The memory knob was applied to the memory leaf.
        let memory_leaf = container.cgroup_paths.get(MEMORY).unwrap();
        assert_eq!(
            fs::read_to_string(memory_leaf.join("memory.limit_in_bytes")).unwrap(),
            "1048576"
        );
    }

    #[test]
    fn failed_stage_still_records_created_leaves() {
        let tmp = tempfile::tempdir().unwrap();
        let host = host_in(tmp.path());

        // No cpuset.cpus anywhere, so the cpuset stage fails after its
        // leaf directory has already been created.
        let mut container = container_in(tmp.path());
        let err = host.apply(&mut container).unwrap_err();
        assert!(matches!(err, Error::Io(_)));

        // Both the finished memory stage and the failed cpuset stage left
        // their leaves where teardown can find them.
        assert!(container.cgroup_paths.contains_key(MEMORY));
        assert!(container.cgroup_paths.contains_key(CPUSET));

        let cpuset_leaf = container.cgroup_paths[CPUSET].clone();
        teardown(&container.cgroup_paths);
        assert!(!cpuset_leaf.exists());
    }

    #[test]
    fn cpuset_without_any_ancestor_value_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let leaf = tmp.path().join("cpuset/minibox/demo");
        fs::create_dir_all(&leaf).unwrap();
        fs::write(leaf.join("cpuset.cpus"), "").unwrap();

        // The walk keeps going up, runs out of files, and reports the I/O
        // error instead of hanging.
        assert!(matches!(
            inherit_if_empty(&leaf, "cpuset.cpus").unwrap_err(),
            Error::Io(_)
        ));
    }

    #[test]
    fn teardown_twice_is_quiet() {
        let tmp = tempfile::tempdir().unwrap();
        let leaf = tmp.path().join("memory/minibox/demo");
        fs::create_dir_all(&leaf).unwrap();

        let mut paths = HashMap::new();
        paths.insert(MEMORY.to_string(), leaf.clone());

        teardown(&paths);
        assert!(!leaf.exists());
        teardown(&paths);
    }
}
