use std::collections::HashMap;
use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::libc::SIGCHLD;
use nix::sched::clone;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{dup2, execv, Pid};
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task;

use crate::cgroup::{self, CgroupHost, CgroupOpts, SetterRegistry};
use crate::cli::{self, RunArgs};
use crate::container::{Container, Mode, WORK_ROOT};
use crate::errors::{Error, Result};
use crate::ipc::PidPipe;
use crate::namespace;
use crate::proto::{ExecRequest, ExecResponse};
use crate::rootfs;
use crate::server;
use crate::setns::{ENV_COMMAND, ENV_INIT_PID, ENV_PIPE};
use crate::{ipc, lock};

/// Re-exec target for the child roles.
const SELF_EXE: &str = "/proc/self/exe";
/// Stack for the cloned init child.
const STACK_SIZE: usize = 1024 * 1024;
/// Bound on producers waiting for space on the event channel.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of one supervised container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    Spawning,
    Running,
    Stopping,
    Terminated,
}

/// Events multiplexed onto the master loop. The channel is bounded and
/// single-consumer; producers give up after SEND_TIMEOUT.
pub enum Event {
    /// Shut the container down.
    Stop,
    /// A child exited; the dedicated waiter does the actual reaping.
    Child,
    /// Control-API exec request with its single-use reply slot.
    Exec {
        request: ExecRequest,
        reply: oneshot::Sender<ExecResponse>,
    },
    /// Liveness round-trip.
    Hello { reply: oneshot::Sender<String> },
}

/// Host-side supervisor of one container.
pub struct Master {
    container: Container,
    state: State,
}

/// Entry point of the `run` subcommand: build the record, then supervise
/// it until the init process is gone and the directory is cleaned up.
pub async fn run(args: RunArgs) -> Result<()> {
    let registry = SetterRegistry::default();
    let container = build_container(&args, &registry)?;

    let master = Master {
        container,
        state: State::Init,
    };
    master.start(registry).await
}

/// Turn parsed options into a container record. Everything is validated
/// here, before a single directory or file exists.
fn build_container(args: &RunArgs, registry: &SetterRegistry) -> Result<Container> {
    args.validate()?;

    let opts = CgroupOpts {
        cpu_shares: args.cpu_shares.clone(),
        cfs_period: args.cfs_period.clone(),
        cfs_quota: args.cfs_quota.clone(),
        cpus: args.cpus.clone(),
        mems: args.mems.clone(),
        limit_in_bytes: args.memory.clone(),
    };
    registry.validate(&opts)?;

    let (path, argv) = cli::split_command(&args.run)?;

    Ok(Container {
        name: args.name.clone(),
        dir: Container::dir_of(&args.name),
        rootfs: args.root.clone(),
        path,
        argv,
        // Sharing the host namespaces means sharing its UTS name too.
        hostname: if args.root.is_empty() {
            String::new()
        } else {
            args.hostname.clone()
        },
        pid: 0,
        cgroup_prefix: args.cgroup_prefix.clone(),
        cgroup_opts: opts,
        cgroup_paths: HashMap::new(),
        mode: Mode::Run,
    })
}

impl Master {
    async fn start(mut self, registry: SetterRegistry) -> Result<()> {
        mkdir_if_missing(Path::new(WORK_ROOT))?;
        mkdir_if_missing(&self.container.dir)?;

        init_logging(&self.container.log_file());
        info!("[master] starting container {}", self.container.name);

        ipc::create_fifo(&self.container.pipe_file())?;
        lock::create(&self.container.lock_file())?;

        // A crashed previous run may have left its socket behind.
        remove_if_present(&self.container.socket_file());
        let listener = UnixListener::bind(self.container.socket_file())?;

        self.transition(State::Spawning);

        let (event_tx, event_rx) = mpsc::channel(10);
        let (term_tx, term_rx) = watch::channel(false);

        let pump = tokio::spawn(signal_pump(event_tx.clone(), term_rx.clone()));
        let srv = tokio::spawn(server::serve(listener, event_tx, term_rx.clone()));

        let child = match self.spawn_init() {
            Ok(child) => child,
            Err(e) => {
                let _ = term_tx.send(true);
                cleanup(&self.container);
                let _ = srv.await;
                let _ = pump.await;
                return Err(e);
            }
        };
        self.container.pid = child.as_raw();
        info!("[master] init pid {}", self.container.pid);

        // Cgroup placement strictly precedes the FIFO write, which is what
        // keeps the limits in force from init's first user instruction; the
        // JSON lands only after both.
        if let Err(e) = self.finish_startup(registry) {
            error!("[master] startup failed: {e}");
            let _ = kill(child, Signal::SIGKILL);
            let _ = waitpid(child, None);
            let _ = term_tx.send(true);
            cleanup(&self.container);
            let _ = srv.await;
            let _ = pump.await;
            return Err(e);
        }

        self.transition(State::Running);

        // The only reaper of the init pid; closing the watch channel is the
        // termination signal every loop selects on.
        let waiter = task::spawn_blocking(move || {
            let status = waitpid(child, None);
            let _ = term_tx.send(true);
            status
        });

        self.event_loop(event_rx, term_rx).await;

        self.transition(State::Stopping);
        match kill(child, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("[master] kill init: {e}"),
        }
        match waiter.await {
            Ok(Ok(status)) => info!("[master] init reaped: {status:?}"),
            Ok(Err(e)) => warn!("[master] wait init: {e}"),
            Err(e) => warn!("[master] waiter task: {e}"),
        }

        cleanup(&self.container);
        self.transition(State::Terminated);

        let _ = srv.await;
        let _ = pump.await;

        info!("[master] container {} terminated", self.container.name);
        Ok(())
    }

    /// Re-exec this binary as the init role inside fresh namespaces. The
    /// clone callback only wires stdio to the log file and execs, so the
    /// post-clone child never touches the parent's runtime state.
    fn spawn_init(&self) -> Result<Pid> {
        let flags = namespace::clone_flags(&self.container.rootfs);
        debug!("[master] clone flags: {flags:?}");

        let log = open_log(&self.container.log_file())?;
        let log_fd = log.as_raw_fd();

        let exe = CString::new(SELF_EXE).map_err(|_| Error::InvalidOption(SELF_EXE.into()))?;
        let argv = [
            CString::new("init").map_err(|_| Error::InvalidOption("init".into()))?,
            CString::new(self.container.name.as_str())
                .map_err(|_| Error::InvalidOption(self.container.name.clone()))?,
        ];

        let mut stack = vec![0u8; STACK_SIZE];
        let child_main = || {
            if dup2(log_fd, 1).is_err() || dup2(log_fd, 2).is_err() {
                return -1;
            }
            match execv(&exe, &argv) {
                Ok(_) => 0,
                Err(_) => -1,
            }
        };

        let child = unsafe { clone(Box::new(child_main), &mut stack, flags, Some(SIGCHLD)) }
            .map_err(|e| Error::sys("clone", e))?;
        Ok(child)
    }

    fn finish_startup(&mut self, registry: SetterRegistry) -> Result<()> {
        let host = CgroupHost::discover(registry)?;
        host.apply(&mut self.container)?;
        self.container.write_pipe()?;
        self.container.save()?;
        Ok(())
    }

    async fn event_loop(
        &mut self,
        mut events: mpsc::Receiver<Event>,
        mut term: watch::Receiver<bool>,
    ) {
        // Serialises whole exec sequences against each other; the file
        // lock only covers the spawn window inside one sequence.
        let exec_serial = Arc::new(Mutex::new(()));
        let pid = Pid::from_raw(self.container.pid);

        loop {
            tokio::select! {
                _ = term.changed() => {
                    debug!("[master] init exited");
                    return;
                }
                event = events.recv() => match event {
                    None => return,
                    Some(Event::Stop) => {
                        info!("[master] stop requested, killing init {pid}");
                        match kill(pid, Signal::SIGKILL) {
                            Ok(()) | Err(Errno::ESRCH) => {}
                            Err(e) => warn!("[master] kill init: {e}"),
                        }
                        // The waiter observes the exit and closes term.
                    }
                    Some(Event::Child) => {
                        // Reaping happens on the dedicated waiter task.
                        debug!("[master] child event");
                    }
                    Some(Event::Hello { reply }) => {
                        let _ = reply.send("hello, world".to_string());
                    }
                    Some(Event::Exec { request, reply }) => {
                        info!("[master] exec request: {} {:?}", request.path, request.argv);
                        let container = self.container.clone();
                        let serial = exec_serial.clone();
                        tokio::spawn(async move {
                            let _guard = serial.lock().await;
                            let response =
                                task::spawn_blocking(move || supervise_exec(&container, &request))
                                    .await
                                    .unwrap_or_else(|e| {
                                        ExecResponse::failed(&format!("exec task failed: {e}"))
                                    });
                            let _ = reply.send(response);
                        });
                    }
                }
            }
        }
    }

    fn transition(&mut self, next: State) {
        debug!("[master] state {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// Feed OS signals into the event channel. SIGHUP gets a registered
/// handler and nothing else, which is what ignoring it means here.
async fn signal_pump(events: mpsc::Sender<Event>, mut term: watch::Receiver<bool>) {
    let streams = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::child()),
        signal(SignalKind::hangup()),
    );
    let (mut interrupt, mut terminate, mut child, mut hangup) = match streams {
        (Ok(a), Ok(b), Ok(c), Ok(d)) => (a, b, c, d),
        _ => {
            error!("[master] failed to install signal handlers");
            return;
        }
    };

    loop {
        let event = tokio::select! {
            _ = term.changed() => return,
            _ = interrupt.recv() => {
                info!("[master] trap signal: SIGINT");
                Some(Event::Stop)
            }
            _ = terminate.recv() => {
                info!("[master] trap signal: SIGTERM");
                Some(Event::Stop)
            }
            _ = child.recv() => {
                debug!("[master] trap signal: SIGCHLD");
                Some(Event::Child)
            }
            _ = hangup.recv() => {
                debug!("[master] ignoring SIGHUP");
                None
            }
        };

        if let Some(event) = event {
            if events.send_timeout(event, SEND_TIMEOUT).await.is_err() {
                // The signal was still observed; only the event is lost.
                warn!("[master] send event timeout: {SEND_TIMEOUT:?}");
            }
        }
    }
}

/// Master side of one exec request. Runs on a blocking thread: everything
/// in here is lock-and-wait syscall territory.
fn supervise_exec(container: &Container, request: &ExecRequest) -> ExecResponse {
    match try_exec(container, request) {
        Ok((stdout, stderr)) => ExecResponse::success(stdout, stderr),
        Err(e) => {
            error!("[master] exec failed: {e}");
            ExecResponse::failed(&e.to_string())
        }
    }
}

fn try_exec(container: &Container, request: &ExecRequest) -> Result<(String, String)> {
    let guard = lock::acquire(&container.lock_file())?;

    let mut pipe = PidPipe::new()?;
    let command_json = serde_json::to_string(request)?;

    let child = Command::new(SELF_EXE)
        .arg0("setns")
        .arg(&container.name)
        .current_dir("/tmp")
        .env(ENV_INIT_PID, container.pid.to_string())
        .env(ENV_COMMAND, &command_json)
        .env(ENV_PIPE, pipe.remote_fd().to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    pipe.close_remote();

    // Spawn window over: the setns side is blocked on this lock and may
    // now take its turn.
    drop(guard);

    let pid_msg = match pipe.recv_pid() {
        Ok(msg) => msg,
        Err(e) => {
            // Reap the failed re-exec and surface what it said.
            let output = child.wait_with_output()?;
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::ChildAbnormalExit {
                role: "setns",
                detail: format!("{e}; stderr: {}", stderr.trim()),
            });
        }
    };
    debug!("[master] exec grandchild pid {}", pid_msg.pid);

    // Draining the capture pipes to EOF also waits out the grandchild,
    // which holds their write ends until it exits.
    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(Error::ChildAbnormalExit {
            role: "setns",
            detail: output.status.to_string(),
        });
    }

    await_proc_exit(pid_msg.pid);

    Ok((
        String::from_utf8_lossy(&output.stdout).into_owned(),
        String::from_utf8_lossy(&output.stderr).into_owned(),
    ))
}

/// The grandchild was re-parented to host init, so its exit is observed
/// through /proc rather than waitpid. A zombie entry counts as exited; the
/// reaping is init's business.
fn await_proc_exit(pid: i32) {
    let stat = PathBuf::from(format!("/proc/{pid}/stat"));
    loop {
        // The state field sits right after the parenthesised comm, which
        // may itself contain spaces.
        let state = match fs::read_to_string(&stat) {
            Ok(line) => line
                .rfind(')')
                .and_then(|i| line[i + 1..].split_whitespace().next().map(str::to_string)),
            Err(_) => return,
        };
        match state.as_deref() {
            Some("Z") | None => return,
            Some(_) => std::thread::sleep(Duration::from_millis(10)),
        }
    }
}

/// Remove everything the run created under the container directory and in
/// the cgroup hierarchies. Tolerates already-missing entries, so running
/// it twice is a no-op; the log file stays for post-mortem reading.
pub fn cleanup(container: &Container) {
    info!("[master] cleaning up {}", container.name);

    if !container.rootfs.is_empty() {
        rootfs::unmount(Path::new(&container.rootfs));
    }

    for path in [
        container.json_file(),
        container.pipe_file(),
        container.socket_file(),
        container.lock_file(),
    ] {
        remove_if_present(&path);
    }

    cgroup::teardown(&container.cgroup_paths);
}

fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!("[master] remove {}: {e}", path.display()),
    }
}

fn mkdir_if_missing(path: &Path) -> Result<()> {
    if !path.exists() {
        fs::create_dir_all(path)?;
    }
    Ok(())
}

fn open_log(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

/// Point the master's own log output at the container log file. Falls back
/// to stderr when the file cannot be opened.
fn init_logging(log_path: &Path) {
    let env = env_logger::Env::default().default_filter_or("info");
    let mut builder = env_logger::Builder::from_env(env);
    if let Ok(file) = OpenOptions::new().create(true).append(true).open(log_path) {
        builder.target(env_logger::Target::Pipe(Box::new(file)));
    }
    let _ = builder.try_init();
}
