//! Runs edge commands, potentially in parallel.  Unaware of the build graph
//! and pools; just command execution: each started command gets a worker
//! thread that spawns the subprocess, captures output, and reports back over
//! a channel.

use crate::graph::EdgeId;
use crate::signal;
use crate::status::format_target_name;
use crate::terminal;
use std::collections::{HashSet, VecDeque};
use std::io::Write;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    Success,
    Interrupted,
    Failure,
}

/// The result of executing an edge's command.
pub struct CommandResult {
    pub edge: EdgeId,
    pub status: Termination,
    /// Console output; captured only when bufferization is on.
    pub output: Vec<u8>,
}

/// Everything the runner needs to know to start one command.
pub struct CommandSpec {
    pub edge: EdgeId,
    pub cmdline: String,
    /// Rule name, munged into the log file name and watcher banner label.
    pub rule: String,
}

#[derive(Clone)]
pub struct RunnerOptions {
    pub parallelism: usize,
    /// <= 0 disables load shedding.
    pub max_load_average: f64,
    /// Capture subprocess output into the result instead of streaming it.
    pub enable_bufferization: bool,
    /// When set, write `<dir>/<target>.log` per edge.
    pub logs_dir: Option<String>,
    pub verbose: bool,
}

/// Command runner in its two flavors.  The driver only sees this enum.
pub enum CommandRunner {
    DryRun(DryRunRunner),
    Real(RealRunner),
}

impl CommandRunner {
    pub fn can_run_more(&self) -> usize {
        match self {
            CommandRunner::DryRun(r) => r.can_run_more(),
            CommandRunner::Real(r) => r.can_run_more(),
        }
    }

    pub fn start_command(&mut self, spec: CommandSpec) -> anyhow::Result<()> {
        match self {
            CommandRunner::DryRun(r) => r.start_command(spec),
            CommandRunner::Real(r) => r.start_command(spec),
        }
    }

    /// Block until some started command finishes.  None means we were
    /// interrupted (or have nothing to wait for).
    pub fn wait_for_command(&mut self) -> Option<CommandResult> {
        match self {
            CommandRunner::DryRun(r) => r.wait_for_command(),
            CommandRunner::Real(r) => r.wait_for_command(),
        }
    }

    pub fn get_active_edges(&self) -> Vec<EdgeId> {
        match self {
            CommandRunner::DryRun(_) => Vec::new(),
            CommandRunner::Real(r) => r.get_active_edges(),
        }
    }

    pub fn abort(&mut self) {
        match self {
            CommandRunner::DryRun(_) => {}
            CommandRunner::Real(r) => r.abort(),
        }
    }

    pub fn run_logger_process(&mut self) {
        if let CommandRunner::Real(r) = self {
            r.run_logger_process();
        }
    }

    pub fn stop_watcher_process(&mut self) {
        if let CommandRunner::Real(r) = self {
            r.stop_watcher_process();
        }
    }
}

/// Runner that doesn't actually run anything: every started command
/// completes instantly with success.
#[derive(Default)]
pub struct DryRunRunner {
    finished: VecDeque<EdgeId>,
}

impl DryRunRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn can_run_more(&self) -> usize {
        usize::MAX
    }

    fn start_command(&mut self, spec: CommandSpec) -> anyhow::Result<()> {
        self.finished.push_back(spec.edge);
        Ok(())
    }

    fn wait_for_command(&mut self) -> Option<CommandResult> {
        self.finished.pop_front().map(|edge| CommandResult {
            edge,
            status: Termination::Success,
            output: Vec::new(),
        })
    }
}

/// One running subprocess, as tracked for the watcher banner.
struct TaskInfo {
    edge: EdgeId,
    pid: i32,
    name: String,
    last_line: String,
    last_change: Instant,
}

type TaskTable = Arc<Mutex<Vec<TaskInfo>>>;

struct Watcher {
    // (done, condvar) pair; setting done and notifying stops the thread.
    state: Arc<(Mutex<bool>, Condvar)>,
    thread: std::thread::JoinHandle<()>,
}

pub struct RealRunner {
    options: RunnerOptions,
    finished_send: mpsc::Sender<CommandResult>,
    finished_recv: mpsc::Receiver<CommandResult>,
    /// Edges started and not yet reaped.
    running: HashSet<EdgeId>,
    tasks: TaskTable,
    watcher: Option<Watcher>,
}

impl RealRunner {
    pub fn new(options: RunnerOptions) -> Self {
        signal::register_sigint();
        let (tx, rx) = mpsc::channel();
        RealRunner {
            options,
            finished_send: tx,
            finished_recv: rx,
            running: HashSet::new(),
            tasks: Arc::new(Mutex::new(Vec::new())),
            watcher: None,
        }
    }

    fn can_run_more(&self) -> usize {
        let mut capacity = self.options.parallelism as i64 - self.running.len() as i64;

        if self.options.max_load_average > 0.0 {
            let load_capacity =
                (self.options.max_load_average - get_load_average()).floor() as i64;
            if load_capacity < capacity {
                capacity = load_capacity;
            }
        }

        if capacity < 0 {
            capacity = 0;
        }
        if capacity == 0 && self.running.is_empty() {
            // Ensure that we make progress.
            capacity = 1;
        }
        capacity as usize
    }

    fn start_command(&mut self, spec: CommandSpec) -> anyhow::Result<()> {
        let name = format_target_name(&spec.rule);
        let logfile = match &self.options.logs_dir {
            Some(dir) => {
                let path = format!("{}/{}.log", dir, name);
                std::fs::write(&path, format!("Command: {}\n\n", spec.cmdline))
                    .map_err(|err| anyhow::anyhow!("write {}: {}", path, err))?;
                Some(path)
            }
            None => None,
        };

        self.running.insert(spec.edge);
        self.tasks.lock().unwrap().push(TaskInfo {
            edge: spec.edge,
            pid: 0,
            name,
            last_line: String::new(),
            last_change: Instant::now(),
        });

        let tx = self.finished_send.clone();
        let tasks = self.tasks.clone();
        let bufferize = self.options.enable_bufferization;
        std::thread::spawn(move || {
            let result = run_task(spec.edge, &spec.cmdline, bufferize, logfile, &tasks);
            tasks.lock().unwrap().retain(|t| t.edge != spec.edge);
            // The send only fails if the receiver disappeared, e.g. due to
            // shutting down.
            let _ = tx.send(result);
        });
        Ok(())
    }

    fn wait_for_command(&mut self) -> Option<CommandResult> {
        loop {
            if signal::was_interrupted() {
                return None;
            }
            match self.finished_recv.recv_timeout(Duration::from_millis(100)) {
                Ok(result) => {
                    self.running.remove(&result.edge);
                    return Some(result);
                }
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn get_active_edges(&self) -> Vec<EdgeId> {
        let mut edges: Vec<EdgeId> = self.running.iter().copied().collect();
        edges.sort();
        edges
    }

    fn abort(&mut self) {
        self.stop_watcher_process();
        #[cfg(unix)]
        for task in self.tasks.lock().unwrap().iter() {
            if task.pid > 0 {
                // Safety: sending a signal to a child we spawned.
                unsafe {
                    libc::kill(task.pid, libc::SIGINT);
                }
            }
        }
    }

    /// Start the background banner thread, if configured: verbose output,
    /// bufferization on, stdout is a terminal, and not explicitly disabled
    /// via NO_TTY=1 (remote builds).
    fn run_logger_process(&mut self) {
        let no_tty = std::env::var("NO_TTY").unwrap_or_default();
        if !(self.options.verbose
            && self.options.enable_bufferization
            && no_tty != "1"
            && terminal::is_tty())
        {
            return;
        }
        if self.watcher.is_some() {
            return;
        }
        let state = Arc::new((Mutex::new(false), Condvar::new()));
        let thread_state = state.clone();
        let tasks = self.tasks.clone();
        let thread = std::thread::spawn(move || {
            let (lock, cvar) = &*thread_state;
            loop {
                {
                    let (done, _) = cvar
                        .wait_timeout_while(
                            lock.lock().unwrap(),
                            Duration::from_secs(1),
                            |done| !*done,
                        )
                        .unwrap();
                    if *done {
                        break;
                    }
                }
                if let Some(banner) = progress_banner(&tasks) {
                    print!("{}", banner);
                    let _ = std::io::stdout().flush();
                }
            }
        });
        self.watcher = Some(Watcher { state, thread });
    }

    fn stop_watcher_process(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            let (lock, cvar) = &*watcher.state;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
            let _ = watcher.thread.join();
        }
    }
}

impl Drop for RealRunner {
    fn drop(&mut self) {
        self.stop_watcher_process();
    }
}

/// Truncate the middle of a string so it fits in width columns.
fn elide_middle(text: &str, width: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= width {
        return text.to_string();
    }
    const MARGIN: usize = 3; // Space for "...".
    if width <= MARGIN {
        return chars[..width].iter().collect();
    }
    let elide = (width - MARGIN) / 2;
    let mut out: String = chars[..elide].iter().collect();
    out.push_str("...");
    out.extend(&chars[chars.len() - elide..]);
    out
}

/// Render the `#`-framed banner of running tasks, ready for overprinting,
/// or None when there's nothing to show (no tasks, or no terminal).
fn progress_banner(tasks: &TaskTable) -> Option<String> {
    let cols = terminal::get_cols()?;
    let tasks = tasks.lock().unwrap();
    if tasks.is_empty() {
        return None;
    }

    let decorate: String = "#".repeat(cols);
    let mut banner = String::new();
    banner.push_str(&decorate);
    banner.push('\n');
    let mut rows = 2;
    for task in tasks.iter() {
        if task.pid <= 0 {
            continue;
        }
        let message = if task.last_change.elapsed() > Duration::from_secs(300) {
            "Process kept silence more than 5 minutes. You can kill it manually or keep waiting."
        } else if task.last_line.is_empty() {
            "Is starting..."
        } else {
            &task.last_line
        };
        let line = format!("# {} {}: {}", task.pid, task.name, message);
        banner.push_str(&elide_middle(&line, cols));
        // Clear to end of line so shorter updates overwrite longer ones.
        banner.push_str("\x1b[K\n");
        rows += 1;
    }
    banner.push_str(&decorate);
    banner.push('\n');
    // Clear below, then move the cursor back up for the next overprint.
    banner.push_str("\x1b[J");
    banner.push_str(&format!("\x1b[{}A", rows));
    Some(banner)
}

/// The last nonempty line of the output so far, after any \r overprints.
fn last_nonempty_line(output: &[u8]) -> String {
    for line in output.split(|&c| c == b'\n').rev() {
        let line = match line.split(|&c| c == b'\r').next_back() {
            Some(l) => l,
            None => line,
        };
        if !line.is_empty() {
            return String::from_utf8_lossy(line).into_owned();
        }
    }
    String::new()
}

// The posix_spawn family returns the error number directly; pipe and close
// return -1 and set errno.  Either way a nonzero return is a failure.
#[cfg(unix)]
fn check_posix(func: &str, ret: libc::c_int) -> anyhow::Result<()> {
    if ret == 0 {
        return Ok(());
    }
    let err = if ret > 0 {
        std::io::Error::from_raw_os_error(ret)
    } else {
        std::io::Error::last_os_error()
    };
    anyhow::bail!("{}: {}", func, err)
}

#[cfg(unix)]
struct PosixSpawnFileActions(libc::posix_spawn_file_actions_t);

#[cfg(unix)]
impl PosixSpawnFileActions {
    fn new() -> anyhow::Result<Self> {
        unsafe {
            let mut actions: libc::posix_spawn_file_actions_t = std::mem::zeroed();
            check_posix(
                "posix_spawn_file_actions_init",
                libc::posix_spawn_file_actions_init(&mut actions),
            )?;
            Ok(Self(actions))
        }
    }

    fn as_ptr(&mut self) -> *mut libc::posix_spawn_file_actions_t {
        &mut self.0
    }

    fn adddup2(&mut self, fd: i32, newfd: i32) -> anyhow::Result<()> {
        unsafe {
            check_posix(
                "posix_spawn_file_actions_adddup2",
                libc::posix_spawn_file_actions_adddup2(&mut self.0, fd, newfd),
            )
        }
    }

    fn addclose(&mut self, fd: i32) -> anyhow::Result<()> {
        unsafe {
            check_posix(
                "posix_spawn_file_actions_addclose",
                libc::posix_spawn_file_actions_addclose(&mut self.0, fd),
            )
        }
    }
}

#[cfg(unix)]
impl Drop for PosixSpawnFileActions {
    fn drop(&mut self) {
        unsafe { libc::posix_spawn_file_actions_destroy(&mut self.0) };
    }
}

#[cfg(unix)]
extern "C" {
    static environ: *const *mut libc::c_char;
}

/// Spawn the command under /bin/sh, optionally with stdout and stderr
/// routed into one pipe.  We don't use std::process because we want both
/// streams interleaved in a single pipe, which its API cannot express.
#[cfg(unix)]
fn spawn_command(
    cmdline: &str,
    capture: bool,
) -> anyhow::Result<(libc::pid_t, Option<std::fs::File>)> {
    use std::os::fd::FromRawFd;

    unsafe {
        let mut actions = PosixSpawnFileActions::new()?;
        let mut pipe: [libc::c_int; 2] = [0; 2];
        if capture {
            check_posix("pipe", libc::pipe(pipe.as_mut_ptr()))?;
            // stdout/stderr => pipe
            actions.adddup2(pipe[1], 1)?;
            actions.adddup2(pipe[1], 2)?;
            // close pipe fds in the child
            actions.addclose(pipe[0])?;
            actions.addclose(pipe[1])?;
        }

        let mut pid: libc::pid_t = 0;
        let path = b"/bin/sh\0".as_ptr() as *const libc::c_char;
        let cmdline_nul = std::ffi::CString::new(cmdline)?;
        let argv: [*const libc::c_char; 4] = [
            path,
            b"-c\0".as_ptr() as *const libc::c_char,
            cmdline_nul.as_ptr(),
            std::ptr::null(),
        ];

        check_posix(
            "posix_spawn",
            libc::posix_spawn(
                &mut pid,
                path,
                actions.as_ptr(),
                std::ptr::null(),
                argv.as_ptr() as *const *mut libc::c_char,
                environ,
            ),
        )?;

        let read_end = if capture {
            check_posix("close", libc::close(pipe[1]))?;
            Some(std::fs::File::from_raw_fd(pipe[0]))
        } else {
            None
        };
        Ok((pid, read_end))
    }
}

#[cfg(unix)]
fn wait_for_exit(pid: libc::pid_t, output: &mut Vec<u8>) -> Termination {
    use std::os::unix::process::ExitStatusExt;

    let status = unsafe {
        let mut status: libc::c_int = 0;
        if libc::waitpid(pid, &mut status, 0) < 0 {
            output.extend_from_slice(b"waitpid failed");
            return Termination::Failure;
        }
        std::process::ExitStatus::from_raw(status)
    };

    if status.success() {
        return Termination::Success;
    }
    match status.signal() {
        Some(libc::SIGINT) => {
            output.extend_from_slice(b"interrupted");
            Termination::Interrupted
        }
        Some(sig) => {
            output.extend_from_slice(format!("signal {}", sig).as_bytes());
            Termination::Failure
        }
        None => Termination::Failure,
    }
}

/// Executes one command on a worker thread.  Output handling: with
/// bufferization the output travels back in the result; with a log file the
/// output is captured for the file and echoed to stdout when done; with
/// neither the child streams directly to our stdout/stderr.
#[cfg(unix)]
fn run_task(
    edge: EdgeId,
    cmdline: &str,
    bufferize: bool,
    logfile: Option<String>,
    tasks: &Mutex<Vec<TaskInfo>>,
) -> CommandResult {
    use std::io::Read;

    let capture = bufferize || logfile.is_some();
    let mut output = Vec::new();
    let status = match spawn_command(cmdline, capture) {
        Err(err) => {
            output.extend(err.to_string().into_bytes());
            Termination::Failure
        }
        Ok((pid, pipe)) => {
            if let Some(task) = tasks.lock().unwrap().iter_mut().find(|t| t.edge == edge) {
                task.pid = pid as i32;
            }
            if let Some(mut pipe) = pipe {
                let mut buf = [0u8; 4096];
                loop {
                    match pipe.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            output.extend_from_slice(&buf[..n]);
                            let line = last_nonempty_line(&output);
                            if let Some(task) =
                                tasks.lock().unwrap().iter_mut().find(|t| t.edge == edge)
                            {
                                task.last_line = line;
                                task.last_change = Instant::now();
                            }
                        }
                    }
                }
            }
            wait_for_exit(pid, &mut output)
        }
    };

    if let Some(logfile) = &logfile {
        if let Ok(mut f) = std::fs::OpenOptions::new().append(true).open(logfile) {
            let _ = f.write_all(&output);
        }
        if !bufferize && !output.is_empty() {
            // The log file forced capture; preserve streaming behavior.
            let _ = std::io::stdout().write_all(&output);
        }
    }

    CommandResult {
        edge,
        status,
        output: if bufferize { output } else { Vec::new() },
    }
}

#[cfg(not(unix))]
fn run_task(
    edge: EdgeId,
    _cmdline: &str,
    _bufferize: bool,
    _logfile: Option<String>,
    _tasks: &Mutex<Vec<TaskInfo>>,
) -> CommandResult {
    CommandResult {
        edge,
        status: Termination::Failure,
        output: b"this platform cannot run commands".to_vec(),
    }
}

#[cfg(unix)]
fn get_load_average() -> f64 {
    let mut avg: [f64; 3] = [0.0; 3];
    // Safety: getloadavg fills the array we hand it.
    let n = unsafe { libc::getloadavg(avg.as_mut_ptr(), 3) };
    if n < 1 {
        return 0.0;
    }
    avg[0]
}

#[cfg(not(unix))]
fn get_load_average() -> f64 {
    0.0
}
