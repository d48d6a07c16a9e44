use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cgroup::CgroupOpts;
use crate::errors::Result;
use crate::ipc;

/// Host directory every container lives under.
pub const WORK_ROOT: &str = "/var/run/minibox";
/// Default subtree name under each cgroup mount.
pub const CGROUP_PREFIX: &str = "minibox";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Run,
    Exec,
}

/// The one persistent entity. Created and mutated only by the master; the
/// init role gets a one-shot copy over the FIFO, an exec-mode client loads
/// a transient copy from the persisted JSON and never writes it back.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Container {
    pub name: String,
    pub dir: PathBuf,
    pub rootfs: String,
    pub path: String,
    pub argv: Vec<String>,
    pub hostname: String,
    pub pid: i32,
    pub cgroup_prefix: String,
    pub cgroup_opts: CgroupOpts,
    pub cgroup_paths: HashMap<String, PathBuf>,
    pub mode: Mode,
}

impl Container {
    /// Host directory for a container of this name.
    pub fn dir_of(name: &str) -> PathBuf {
        Path::new(WORK_ROOT).join(name)
    }

    pub fn pipe_file(&self) -> PathBuf {
        self.dir.join("pipe")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.dir.join("lock")
    }

    pub fn socket_file(&self) -> PathBuf {
        self.dir.join("unix.sock")
    }

    pub fn json_file(&self) -> PathBuf {
        self.dir.join("container.json")
    }

    pub fn log_file(&self) -> PathBuf {
        self.dir.join("log")
    }

    /// Persist the record. Only called once cgroup placement succeeded.
    pub fn save(&self) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(self.json_file(), data)?;
        Ok(())
    }

    /// Load the record persisted by a running master.
    pub fn load(name: &str) -> Result<Self> {
        Self::load_from(&Self::dir_of(name))
    }

    pub fn load_from(dir: &Path) -> Result<Self> {
        let data = fs::read(dir.join("container.json"))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Master side of the FIFO rendezvous: blocks until the init role has
    /// opened the read side, then hands over the full record.
    pub fn write_pipe(&self) -> Result<()> {
        ipc::send_json(&self.pipe_file(), self)
    }

    /// Init side of the FIFO rendezvous.
    pub fn read_pipe(name: &str) -> Result<Self> {
        ipc::recv_json(&Self::dir_of(name).join("pipe"))
    }
}
