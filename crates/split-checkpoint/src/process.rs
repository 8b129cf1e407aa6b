use std::ffi::OsStr;
use std::io::{BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Output, Stdio};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::log_sanitize::clean_output_line;

/// Exit code reported when a supervised child was stopped because its time
/// budget ran out (same convention as coreutils `timeout`).
pub const TIMED_OUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub cwd: Option<PathBuf>,
    pub treat_nonzero_as_error: bool,
}

impl RunOptions {
    pub fn in_dir(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            treat_nonzero_as_error: false,
        }
    }

    pub fn checked(mut self) -> Self {
        self.treat_nonzero_as_error = true;
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    pub fn run<S: AsRef<OsStr>>(&self, program: &str, args: &[S], opts: &RunOptions) -> Result<i32> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        self.run_command(cmd, opts)
    }

    // Output is streamed line by line into the log while the child runs.
    pub fn run_command(&self, mut cmd: Command, opts: &RunOptions) -> Result<i32> {
        if let Some(cwd) = opts.cwd.as_ref() {
            cmd.current_dir(cwd);
        }
        let label = program_label(&cmd);
        tracing::debug!(command = ?cmd, "spawning");

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("failed to spawn {label}: {e}")))?;

        let readers = forward_child_output(&mut child, &label);
        let status = child
            .wait()
            .map_err(|e| Error::msg(format!("failed to wait for {label}: {e}")))?;
        for r in readers {
            let _ = r.join();
        }

        let code = exit_code(status);
        if code != 0 && opts.treat_nonzero_as_error {
            return Err(Error::msg(format!("{label} failed with exit code {code}")));
        }
        Ok(code)
    }

    pub fn capture(&self, cmd: &mut Command) -> Result<Output> {
        tracing::debug!(command = ?cmd, "running");
        cmd.stdin(Stdio::null())
            .output()
            .map_err(|e| Error::msg(format!("failed to run command {:?}: {e}", cmd)))
    }

    /// Fails with a precondition error unless `program` runs and (optionally)
    /// prints `expect` in its version banner.
    pub fn require_tool(&self, program: &str, version_arg: &str, expect: Option<&str>) -> Result<String> {
        let out = Command::new(program)
            .arg(version_arg)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| Error::precondition(format!("required tool '{program}' is not available: {e}")))?;
        if !out.status.success() {
            return Err(Error::precondition(format!(
                "required tool '{program}' failed its version check ({})",
                out.status
            )));
        }
        let banner = String::from_utf8_lossy(&out.stdout).into_owned()
            + String::from_utf8_lossy(&out.stderr).as_ref();
        let first = banner.lines().next().unwrap_or_default().trim().to_string();
        if let Some(needle) = expect
            && !banner.contains(needle)
        {
            return Err(Error::precondition(format!(
                "'{program}' is not {needle} (reported: {first})"
            )));
        }
        Ok(first)
    }

    /// Like `require_tool`, but only insists that `program` can be started.
    /// For tools such as `scp` that have no version flag.
    pub fn require_present(&self, program: &str) -> Result<()> {
        Command::new(program)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .map(|_| ())
            .map_err(|e| Error::precondition(format!("required tool '{program}' is not available: {e}")))
    }
}

pub fn command_summary(out: &Output) -> String {
    let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
    if !stderr.is_empty() {
        return clean_output_line(&stderr);
    }
    let stdout = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if !stdout.is_empty() {
        return clean_output_line(&stdout);
    }
    format!("status {}", out.status)
}

pub fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    -1
}

fn program_label(cmd: &Command) -> String {
    std::path::Path::new(cmd.get_program())
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| cmd.get_program().to_string_lossy().into_owned())
}

/// Takes whichever of the child's stdout/stderr are piped and logs them on
/// background threads. Join the handles after `wait()`.
pub fn forward_child_output(child: &mut Child, label: &str) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    if let Some(out) = child.stdout.take() {
        handles.push(forward_output(out, label.to_string()));
    }
    if let Some(err) = child.stderr.take() {
        handles.push(forward_output(err, label.to_string()));
    }
    handles
}

pub fn forward_output<R: Read + Send + 'static>(reader: R, label: String) -> JoinHandle<()> {
    std::thread::spawn(move || {
        read_lines(reader, |line| {
            let line = clean_output_line(line);
            if !line.is_empty() {
                tracing::info!(target: "splitck::child", program = %label, "{line}");
            }
        })
    })
}

fn read_lines<R: Read>(reader: R, mut emit: impl FnMut(&str)) {
    const MAX_PENDING_BYTES: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending = Vec::with_capacity(1024);

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            if b == b'\n' || b == b'\r' {
                if !pending.is_empty() {
                    emit(&String::from_utf8_lossy(&pending));
                    pending.clear();
                }
                continue;
            }
            pending.push(b);
            if pending.len() >= MAX_PENDING_BYTES {
                emit(&String::from_utf8_lossy(&pending));
                pending.clear();
            }
        }
    }
    if !pending.is_empty() {
        emit(&String::from_utf8_lossy(&pending));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    SignaledGraceful { at: Instant },
    SignaledForced,
    Exited { code: i32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisedExit {
    pub code: i32,
    pub timed_out: bool,
    pub forced: bool,
}

impl SupervisedExit {
    /// Exit code to hand to the caller: a budget expiry always reports
    /// `TIMED_OUT_EXIT_CODE` so the stage layer can tell it from a failure.
    pub fn reported_code(&self) -> i32 {
        if self.timed_out {
            TIMED_OUT_EXIT_CODE
        } else {
            self.code
        }
    }
}

/// Runs `cmd` in its own process group. When `budget` elapses the group gets
/// SIGTERM, and SIGKILL once `grace` has also passed.
pub fn supervise(mut cmd: Command, budget: Duration, grace: Duration) -> Result<SupervisedExit> {
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let label = program_label(&cmd);
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::msg(format!("failed to spawn {label}: {e}")))?;
    let pgid = child.id();
    let readers = forward_child_output(&mut child, &label);

    let started = Instant::now();
    let mut state = RunState::Running;
    let mut timed_out = false;
    let mut forced = false;

    let code = loop {
        if let Some(status) = child
            .try_wait()
            .map_err(|e| Error::msg(format!("failed to poll {label}: {e}")))?
        {
            state = RunState::Exited {
                code: exit_code(status),
            };
        }

        state = match state {
            RunState::Exited { code } => break code,
            RunState::Running if started.elapsed() >= budget => {
                tracing::warn!(program = %label, budget_secs = budget.as_secs(), "time budget exhausted, sending SIGTERM");
                signal_group(pgid, false);
                timed_out = true;
                RunState::SignaledGraceful { at: Instant::now() }
            }
            RunState::SignaledGraceful { at } if at.elapsed() >= grace => {
                tracing::warn!(program = %label, "still running after grace period, sending SIGKILL");
                signal_group(pgid, true);
                forced = true;
                RunState::SignaledForced
            }
            other => other,
        };
        std::thread::sleep(Duration::from_millis(100));
    };

    for r in readers {
        let _ = r.join();
    }
    Ok(SupervisedExit {
        code,
        timed_out,
        forced,
    })
}

fn signal_group(pgid: u32, force: bool) {
    #[cfg(unix)]
    {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        unsafe {
            libc::kill(-(pgid as i32), sig);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, force);
    }
}
