use std::env;
use std::process::exit;

use anyhow::Context;
use clap::Parser;
use log::error;

use minibox::cli::{Cli, Commands};
use minibox::errors::Result;
use minibox::{client, init, master, setns};

fn main() {
    // The master re-execs this binary with argv[0] set to a role name;
    // those literals are the contract between the processes.
    let argv0 = env::args().next().unwrap_or_default();
    match argv0.as_str() {
        "init" => run_role("init", init::run),
        "setns" => run_role("setns", setns::run),
        _ => run_cli(),
    }
}

/// Child roles are plain synchronous code: no runtime, one thread, so the
/// namespace syscalls and the final exec stay on the same kernel task.
fn run_role(role: &str, body: fn(&str) -> Result<()>) -> ! {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let name = match env::args().nth(1) {
        Some(name) => name,
        None => {
            eprintln!("{role}: missing container name");
            exit(1);
        }
    };

    match body(&name) {
        // A successful role body ends in exec and never gets here.
        Ok(()) => exit(0),
        Err(e) => {
            error!("[{role}] {e}");
            eprintln!("{role}: {e}");
            exit(1);
        }
    }
}

fn run_cli() -> ! {
    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            exit(1);
        }
    };

    let result: anyhow::Result<i32> = match cli.command {
        Commands::Run(args) => runtime
            .block_on(master::run(args))
            .map(|()| 0)
            .context("failed to run container"),
        Commands::Exec(args) => {
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
                .init();
            runtime
                .block_on(client::exec(args))
                .map(|ok| if ok { 0 } else { 1 })
                .context("failed to exec in container")
        }
    };

    match result {
        Ok(code) => exit(code),
        Err(e) => {
            eprintln!("{e:#}");
            exit(1);
        }
    }
}
