use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{Error, Result};
use crate::proto::PidMessage;

/// Create the named rendezvous pipe if it does not exist yet. Mode 0: only
/// the two ends this binary opens ever touch it.
pub fn create_fifo(path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }
    mkfifo(path, Mode::empty()).map_err(|e| Error::sys("mkfifo", e))?;
    Ok(())
}

/// Open the write side of the FIFO and push one JSON-encoded value. The
/// open blocks until the peer has opened the read side, which is exactly
/// the rendezvous the startup ordering relies on.
pub fn send_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut pipe = OpenOptions::new().write(true).open(path)?;
    serde_json::to_writer(&mut pipe, value)?;
    pipe.flush()?;
    Ok(())
}

/// Open the read side of the FIFO and decode one JSON value. A short read
/// or malformed payload is fatal to the caller.
pub fn recv_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let pipe = File::open(path)?;
    Ok(serde_json::from_reader(pipe)?)
}

/// Anonymous pipe carrying the setns grandchild pid back to the master.
/// The write end is plain (not close-on-exec) so the spawned process keeps
/// it across its execve; the master passes the fd number in the
/// environment.
pub struct PidPipe {
    read: OwnedFd,
    write: Option<OwnedFd>,
}

impl PidPipe {
    pub fn new() -> Result<Self> {
        let (read, write) = nix::unistd::pipe().map_err(|e| Error::sys("pipe", e))?;
        Ok(PidPipe {
            read,
            write: Some(write),
        })
    }

    /// Fd number the spawned process inherits.
    pub fn remote_fd(&self) -> RawFd {
        self.write
            .as_ref()
            .map(|fd| fd.as_raw_fd())
            .unwrap_or(-1)
    }

    /// Drop the parent's copy of the write end so EOF becomes observable
    /// once every child-side copy is gone.
    pub fn close_remote(&mut self) {
        self.write.take();
    }

    /// Read one pid message. EOF before a full line means the peer died
    /// without reporting.
    pub fn recv_pid(self) -> Result<PidMessage> {
        let mut reader = BufReader::new(File::from(self.read));
        let mut line = String::new();
        reader.read_line(&mut line)?;
        let line = line.trim();
        if line.is_empty() {
            return Err(Error::ChildAbnormalExit {
                role: "setns",
                detail: "no pid reported".to_string(),
            });
        }
        Ok(serde_json::from_str(line)?)
    }
}

/// Setns side: adopt the inherited write end and report the forked pid.
pub fn report_pid(fd: RawFd, pid: i32) -> Result<()> {
    // The fd comes from the environment contract with the master; taking
    // ownership here closes it once the line is flushed.
    let mut file = unsafe { File::from_raw_fd(fd) };
    let mut line = serde_json::to_string(&PidMessage { pid })?;
    line.push('\n');
    file.write_all(line.as_bytes())?;
    Ok(())
}
