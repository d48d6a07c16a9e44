use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("cgroup subsystem {0}: mount or root path not found")]
    NotMounted(String),

    #[error("invalid cgroup option {name}: {value:?}")]
    InvalidOpt { name: &'static str, value: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{op}: {errno}")]
    Sys {
        op: &'static str,
        #[source]
        errno: nix::errno::Errno,
    },

    #[error("mount {}: {errno}", .target.display())]
    MountFailed {
        target: PathBuf,
        #[source]
        errno: nix::errno::Errno,
    },

    #[error("switch root to {}: {errno}", .root.display())]
    ChrootFailed {
        root: PathBuf,
        #[source]
        errno: nix::errno::Errno,
    },

    #[error("exec {path}: {errno}")]
    ExecFailed {
        path: String,
        #[source]
        errno: nix::errno::Errno,
    },

    #[error("{role} process exited abnormally: {detail}")]
    ChildAbnormalExit { role: &'static str, detail: String },

    #[error("malformed request: {0}")]
    RequestMalformed(String),

    #[error("control api: {0}")]
    Http(String),

    #[error("encode/decode: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("event channel send timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    pub fn sys(op: &'static str, errno: nix::errno::Errno) -> Self {
        Error::Sys { op, errno }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Sys {
            op: "syscall",
            errno,
        }
    }
}
