use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::{BLKIO, CPU, CPUSET, DEVICES, FREEZER, HUGETLB, MEMORY};
use crate::errors::{Error, Result};

/// Per-subsystem resource knobs carried in the container record. Values
/// mirror the cgroup file contents verbatim; "0" for the numeric knobs and
/// "" for the cpuset ones mean "leave the kernel value alone".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CgroupOpts {
    pub cpu_shares: String,
    pub cfs_period: String,
    pub cfs_quota: String,
    pub cpus: String,
    pub mems: String,
    pub limit_in_bytes: String,
}

impl Default for CgroupOpts {
    fn default() -> Self {
        CgroupOpts {
            cpu_shares: "0".to_string(),
            cfs_period: "0".to_string(),
            cfs_quota: "0".to_string(),
            cpus: String::new(),
            mems: String::new(),
            limit_in_bytes: "0".to_string(),
        }
    }
}

/// Known setters. One tag per subsystem with real knobs, plus reserved
/// slots for the hierarchies nothing writes to yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setter {
    Cpu,
    CpuSet,
    Memory,
    Reserved(&'static str),
}

impl Setter {
    pub fn subsystem(&self) -> &'static str {
        match self {
            Setter::Cpu => CPU,
            Setter::CpuSet => CPUSET,
            Setter::Memory => MEMORY,
            Setter::Reserved(name) => name,
        }
    }

    /// Check the knob values before any file is written.
    pub fn validate(&self, opts: &CgroupOpts) -> Result<()> {
        match self {
            Setter::Cpu => {
                decimal("cpu_shares", &opts.cpu_shares)?;
                decimal("cfs_period", &opts.cfs_period)?;
                decimal("cfs_quota", &opts.cfs_quota)?;
                Ok(())
            }
            Setter::Memory => {
                decimal("limit_in_bytes", &opts.limit_in_bytes)?;
                Ok(())
            }
            Setter::CpuSet | Setter::Reserved(_) => Ok(()),
        }
    }

    /// Apply the knobs to a leaf directory. Writing the same options to the
    /// same leaf twice leaves identical file contents.
    pub fn write(&self, opts: &CgroupOpts, dir: &Path) -> Result<()> {
        match self {
            Setter::Cpu => {
                write_unless(dir, "cpu.shares", &opts.cpu_shares, "0")?;
                write_unless(dir, "cpu.cfs_period_us", &opts.cfs_period, "0")?;
                write_unless(dir, "cpu.cfs_quota_us", &opts.cfs_quota, "0")
            }
            Setter::CpuSet => {
                write_unless(dir, "cpuset.cpus", &opts.cpus, "")?;
                write_unless(dir, "cpuset.mems", &opts.mems, "")
            }
            Setter::Memory => write_unless(dir, "memory.limit_in_bytes", &opts.limit_in_bytes, "0"),
            Setter::Reserved(_) => Ok(()),
        }
    }
}

fn decimal(name: &'static str, value: &str) -> Result<i64> {
    value.parse::<i64>().map_err(|_| Error::InvalidOpt {
        name,
        value: value.to_string(),
    })
}

fn write_unless(dir: &Path, file: &str, value: &str, skip: &str) -> Result<()> {
    if value == skip {
        return Ok(());
    }
    fs::write(dir.join(file), value)?;
    Ok(())
}

/// All setters, applied in registration order within a subsystem. Built
/// once by the master and handed to the controller; there is no global
/// registry.
#[derive(Debug, Clone)]
pub struct SetterRegistry {
    setters: Vec<Setter>,
}

impl Default for SetterRegistry {
    fn default() -> Self {
        SetterRegistry {
            setters: vec![
                Setter::Cpu,
                Setter::CpuSet,
                Setter::Memory,
                Setter::Reserved(DEVICES),
                Setter::Reserved(FREEZER),
                Setter::Reserved(BLKIO),
                Setter::Reserved(HUGETLB),
            ],
        }
    }
}

impl SetterRegistry {
    pub fn validate(&self, opts: &CgroupOpts) -> Result<()> {
        for setter in &self.setters {
            setter.validate(opts)?;
        }
        Ok(())
    }

    pub fn write(&self, subsys: &str, opts: &CgroupOpts, dir: &Path) -> Result<()> {
        for setter in self.setters.iter().filter(|s| s.subsystem() == subsys) {
            setter.write(opts, dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_non_decimal() {
        let mut opts = CgroupOpts::default();
        opts.cpu_shares = "abc".to_string();

        let err = SetterRegistry::default().validate(&opts).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidOpt {
                name: "cpu_shares",
                ..
            }
        ));
    }

    #[test]
    fn validate_accepts_defaults() {
        SetterRegistry::default()
            .validate(&CgroupOpts::default())
            .unwrap();
    }

    #[test]
    fn skip_values_write_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SetterRegistry::default();
        let opts = CgroupOpts::default();

        registry.write(CPU, &opts, dir.path()).unwrap();
        registry.write(CPUSET, &opts, dir.path()).unwrap();
        registry.write(MEMORY, &opts, dir.path()).unwrap();

        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn writes_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = SetterRegistry::default();
        let opts = CgroupOpts {
            cpu_shares: "512".to_string(),
            limit_in_bytes: "1048576".to_string(),
            cpus: "0-3".to_string(),
            ..CgroupOpts::default()
        };

        for _ in 0..2 {
            registry.write(CPU, &opts, dir.path()).unwrap();
            registry.write(CPUSET, &opts, dir.path()).unwrap();
            registry.write(MEMORY, &opts, dir.path()).unwrap();
        }

        let read = |file: &str| fs::read_to_string(dir.path().join(file)).unwrap();
        assert_eq!(read("cpu.shares"), "512");
        assert_eq!(read("cpuset.cpus"), "0-3");
        assert_eq!(read("memory.limit_in_bytes"), "1048576");
        assert!(!dir.path().join("cpu.cfs_period_us").exists());
        assert!(!dir.path().join("cpuset.mems").exists());
    }

    #[test]
    fn reserved_setters_are_inert() {
        let dir = tempfile::tempdir().unwrap();
        let opts = CgroupOpts {
            cpu_shares: "512".to_string(),
            ..CgroupOpts::default()
        };
        Setter::Reserved(DEVICES).write(&opts, dir.path()).unwrap();
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
