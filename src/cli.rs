use std::path::Path;

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::container::CGROUP_PREFIX;
use crate::errors::{Error, Result};

#[derive(Parser, Debug, Serialize, Deserialize, Clone)]
#[command(name = "minibox")]
#[command(about = "minibox is a minimal Linux container runtime.")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug, Serialize, Deserialize, Clone)]
pub enum Commands {
    /// Run a command inside a freshly created container.
    Run(RunArgs),
    /// Run a one-off command inside a running container.
    Exec(ExecArgs),
}

#[derive(Args, Debug, Serialize, Deserialize, Clone)]
pub struct RunArgs {
    /// Name of the container.
    #[arg(required = true)]
    pub name: String,

    /// Command to run in the container, as one quoted string.
    #[arg(long = "run", value_name = "CMD")]
    pub run: String,

    /// Absolute path of the container rootfs; empty shares the host root
    /// and all host namespaces.
    #[arg(long = "root", default_value = "")]
    pub root: String,

    /// Hostname inside the container's UTS namespace.
    #[arg(long, default_value = "")]
    pub hostname: String,

    /// Subtree name under each cgroup mount.
    #[arg(long, default_value = CGROUP_PREFIX)]
    pub cgroup_prefix: String,

    /// cpu.shares; "0" keeps the kernel default.
    #[arg(long, default_value = "0")]
    pub cpu_shares: String,

    /// cpu.cfs_period_us; "0" keeps the kernel default.
    #[arg(long, default_value = "0")]
    pub cfs_period: String,

    /// cpu.cfs_quota_us; "0" keeps the kernel default.
    #[arg(long, default_value = "0")]
    pub cfs_quota: String,

    /// cpuset.cpus; empty inherits from the parent cgroup.
    #[arg(long, default_value = "")]
    pub cpus: String,

    /// cpuset.mems; empty inherits from the parent cgroup.
    #[arg(long, default_value = "")]
    pub mems: String,

    /// memory.limit_in_bytes; "0" leaves the container unlimited.
    #[arg(long, default_value = "0")]
    pub memory: String,
}

#[derive(Args, Debug, Serialize, Deserialize, Clone)]
pub struct ExecArgs {
    /// Name of the container.
    #[arg(required = true)]
    pub name: String,

    /// Command to run in the container, as one quoted string.
    #[arg(long = "exec", value_name = "CMD")]
    pub exec: String,
}

impl RunArgs {
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        if !self.root.is_empty() && !Path::new(&self.root).is_absolute() {
            return Err(Error::InvalidOption(format!(
                "root is not an absolute path: {}",
                self.root
            )));
        }
        Ok(())
    }
}

/// Container names become directory and cgroup path components, so only
/// accept names that are safe there.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidOption("container name is empty".to_string()));
    }
    if name == "." || name == ".." {
        return Err(Error::InvalidOption(format!(
            "container name {name:?} is not filesystem-safe"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err(Error::InvalidOption(format!(
            "container name {name:?} is not filesystem-safe"
        )));
    }
    Ok(())
}

/// Split a --run/--exec command string into an execv path and argv.
pub fn split_command(cmd: &str) -> Result<(String, Vec<String>)> {
    let argv: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
    match argv.first() {
        Some(path) => Ok((path.clone(), argv.clone())),
        None => Err(Error::InvalidOption(format!("invalid command {cmd:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_command_fields() {
        let (path, argv) = split_command("/bin/echo hello world").unwrap();
        assert_eq!(path, "/bin/echo");
        assert_eq!(argv, vec!["/bin/echo", "hello", "world"]);
    }

    #[test]
    fn split_command_rejects_blank() {
        assert!(split_command("").is_err());
        assert!(split_command("   ").is_err());
    }

    #[test]
    fn name_validation() {
        assert!(validate_name("demo-1_a.b").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("white space").is_err());
    }

    #[test]
    fn run_args_require_absolute_root() {
        let cli = Cli::parse_from([
            "minibox",
            "run",
            "demo",
            "--run",
            "/bin/echo hi",
            "--root",
            "rootfs",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run subcommand");
        };
        assert!(args.validate().is_err());
    }

    #[test]
    fn run_args_defaults() {
        let cli = Cli::parse_from(["minibox", "run", "demo", "--run", "/bin/true"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run subcommand");
        };
        args.validate().unwrap();
        assert_eq!(args.root, "");
        assert_eq!(args.cgroup_prefix, CGROUP_PREFIX);
        assert_eq!(args.cpu_shares, "0");
        assert_eq!(args.cpus, "");
    }

    #[test]
    fn exec_args_parse() {
        let cli = Cli::parse_from(["minibox", "exec", "demo", "--exec", "/bin/ls -l"]);
        let Commands::Exec(args) = cli.command else {
            panic!("expected exec subcommand");
        };
        assert_eq!(args.name, "demo");
        assert_eq!(args.exec, "/bin/ls -l");
    }
}
