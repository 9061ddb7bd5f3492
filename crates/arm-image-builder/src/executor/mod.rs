use std::collections::{BTreeMap, VecDeque};
use std::io::{BufReader, Read};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::log_sanitize::sanitize_line;
use crate::ui::Ui;

const PLACEHOLDER: &str = "{command}";
const STDERR_TAIL_LINES: usize = 12;
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Template every host shell command is passed through, e.g.
/// `ssh builder sudo sh -c '{command}'`. The default runs commands as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandWrapper {
    template: String,
}

impl Default for CommandWrapper {
    fn default() -> Self {
        Self {
            template: PLACEHOLDER.into(),
        }
    }
}

impl CommandWrapper {
    pub fn new(template: impl Into<String>) -> Result<Self> {
        let template = template.into();
        if !template.contains(PLACEHOLDER) {
            return Err(Error::msg(format!(
                "command_wrapper '{template}' must contain {PLACEHOLDER}"
            )));
        }
        Ok(Self { template })
    }

    pub fn wrap(&self, command: &str) -> String {
        self.template.replace(PLACEHOLDER, command)
    }
}

#[derive(Default)]
struct SharedExecState {
    // Process group id -> command line, for killing on interrupt.
    child_pgroups: Mutex<BTreeMap<u32, String>>,
}

/// Everything a step needs to touch the host: the cancellation flag, the ui,
/// and a process runner that honours both.
#[derive(Clone)]
pub struct ExecCtx {
    pub cancel: Arc<AtomicBool>,
    pub ui: Arc<dyn Ui>,
    wrapper: CommandWrapper,
    deadline: Option<Instant>,
    honor_cancel: bool,
    shared: Arc<SharedExecState>,
}

#[derive(Clone, Copy)]
enum Stream {
    Out,
    Err,
}

impl ExecCtx {
    pub fn new(ui: Arc<dyn Ui>) -> Self {
        Self {
            cancel: Arc::new(AtomicBool::new(false)),
            ui,
            wrapper: CommandWrapper::default(),
            deadline: None,
            honor_cancel: true,
            shared: Arc::new(SharedExecState::default()),
        }
    }

    pub fn with_wrapper(mut self, wrapper: CommandWrapper) -> Self {
        self.wrapper = wrapper;
        self
    }

    pub fn wrapper(&self) -> &CommandWrapper {
        &self.wrapper
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    pub fn check_cancelled(&self) -> Result<()> {
        if self.honor_cancel && self.cancelled() {
            return Err(Error::cancelled());
        }
        Ok(())
    }

    /// Context for cleanup work: it keeps running after an interrupt, since
    /// the interrupt is usually why cleanup is happening.
    pub fn for_cleanup(&self) -> Self {
        let mut ctx = self.clone();
        ctx.honor_cancel = false;
        ctx
    }

    /// Commands started through the returned context are killed once `limit`
    /// has elapsed from now.
    pub fn with_time_limit(&self, limit: Duration) -> Self {
        let mut ctx = self.clone();
        ctx.deadline = Some(Instant::now() + limit);
        ctx
    }

    fn register_child_pgroup(&self, pgid: u32, label: &str) {
        if let Ok(mut g) = self.shared.child_pgroups.lock() {
            g.insert(pgid, label.to_string());
        }
    }

    fn unregister_child_pgroup(&self, pgid: u32) {
        if let Ok(mut g) = self.shared.child_pgroups.lock() {
            g.remove(&pgid);
        }
    }

    pub fn kill_running_children(&self) {
        let groups: Vec<(u32, String)> = self
            .shared
            .child_pgroups
            .lock()
            .ok()
            .map(|g| g.iter().map(|(k, v)| (*k, v.clone())).collect())
            .unwrap_or_default();
        for (pgid, label) in groups {
            tracing::debug!(pgid, command = %label, "killing process group");
            kill_pgroup(pgid, false);
        }
    }

    /// Runs `command` with `/bin/sh -c` after passing it through the wrapper.
    /// Non-zero exit is an error carrying the tail of stderr.
    pub fn run_shell(&self, command: &str) -> Result<()> {
        let wrapped = self.wrapper.wrap(command);
        let (status, tail) = self.exec(shell(&wrapped), &wrapped)?;
        if !status.success() {
            return Err(command_failed(&wrapped, status, &tail));
        }
        Ok(())
    }

    /// Like [`run_shell`](Self::run_shell) but returns the exit code instead
    /// of failing on non-zero exit.
    pub fn shell_status(&self, command: &str) -> Result<i32> {
        let wrapped = self.wrapper.wrap(command);
        let (status, _) = self.exec(shell(&wrapped), &wrapped)?;
        status
            .code()
            .ok_or_else(|| Error::msg(format!("`{wrapped}` was killed by a signal")))
    }

    /// Runs a host command directly (no wrapper) with output streamed to the log.
    pub fn run(&self, cmd: Command) -> Result<()> {
        let label = describe(&cmd);
        let (status, tail) = self.exec(cmd, &label)?;
        if !status.success() {
            return Err(command_failed(&label, status, &tail));
        }
        Ok(())
    }

    /// Runs a host command and returns its stdout.
    pub fn output(&self, mut cmd: Command) -> Result<String> {
        self.check_cancelled()?;
        let label = describe(&cmd);
        set_own_pgroup(&mut cmd);
        let child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("failed to spawn `{label}`: {e}")))?;
        let pgid = child.id();
        self.register_child_pgroup(pgid, &label);
        let out = child.wait_with_output();
        self.unregister_child_pgroup(pgid);
        let out = out.map_err(|e| Error::msg(format!("failed to wait for `{label}`: {e}")))?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            let tail: VecDeque<String> = stderr
                .lines()
                .map(sanitize_line)
                .filter(|l| !l.is_empty())
                .collect();
            return Err(command_failed(&label, out.status, &tail));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    fn exec(&self, mut cmd: Command, label: &str) -> Result<(ExitStatus, VecDeque<String>)> {
        self.check_cancelled()?;
        tracing::debug!(command = %label, "exec");
        set_own_pgroup(&mut cmd);

        let mut child: Child = cmd
            // Children live in their own process group; a read from the tty would stop them.
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::msg(format!("failed to spawn `{label}`: {e}")))?;
        let pgid = child.id();
        self.register_child_pgroup(pgid, label);

        let (tx, rx) = mpsc::channel::<(Stream, String)>();
        if let Some(out) = child.stdout.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_lines(out, Stream::Out, tx));
        }
        if let Some(err) = child.stderr.take() {
            let tx = tx.clone();
            std::thread::spawn(move || read_lines(err, Stream::Err, tx));
        }
        drop(tx);

        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut stopped: Option<Error> = None;
        loop {
            match rx.recv_timeout(POLL_INTERVAL) {
                Ok((stream, raw)) => {
                    let line = sanitize_line(&raw);
                    if line.is_empty() {
                        continue;
                    }
                    match stream {
                        Stream::Out => tracing::info!(command = %label, "{line}"),
                        Stream::Err => {
                            tracing::warn!(command = %label, "{line}");
                            if tail.len() == STDERR_TAIL_LINES {
                                tail.pop_front();
                            }
                            tail.push_back(line);
                        }
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
            if stopped.is_some() {
                continue;
            }
            if self.honor_cancel && self.cancelled() {
                kill_pgroup(pgid, false);
                stopped = Some(Error::cancelled());
            } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
                kill_pgroup(pgid, true);
                stopped = Some(Error::msg(format!("`{label}` timed out")));
            }
        }

        let status = child.wait();
        self.unregister_child_pgroup(pgid);
        let status = status.map_err(|e| Error::msg(format!("failed to wait for `{label}`: {e}")))?;
        if let Some(e) = stopped {
            return Err(e);
        }
        Ok((status, tail))
    }
}

fn shell(command: &str) -> Command {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(command);
    cmd
}

fn describe(cmd: &Command) -> String {
    let mut s = cmd.get_program().to_string_lossy().into_owned();
    for a in cmd.get_args() {
        s.push(' ');
        s.push_str(&a.to_string_lossy());
    }
    s
}

fn command_failed(label: &str, status: ExitStatus, tail: &VecDeque<String>) -> Error {
    let mut msg = format!("`{label}` failed ({status})");
    if !tail.is_empty() {
        msg.push_str(": ");
        msg.push_str(&tail.iter().cloned().collect::<Vec<_>>().join(" | "));
    }
    Error::msg(msg)
}

fn set_own_pgroup(cmd: &mut Command) {
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
    #[cfg(not(unix))]
    {
        let _ = cmd;
    }
}

fn kill_pgroup(pgid: u32, force: bool) {
    #[cfg(unix)]
    {
        let sig = if force { libc::SIGKILL } else { libc::SIGTERM };
        // Negative pid addresses the whole group.
        let _ = unsafe { libc::kill(-(pgid as i32), sig) };
    }
    #[cfg(not(unix))]
    {
        let _ = (pgid, force);
    }
}

// Splits on '\n' only; carriage-return redraws stay inside the line for the sanitizer.
fn read_lines<R: Read>(reader: R, stream: Stream, tx: mpsc::Sender<(Stream, String)>) {
    const MAX_PENDING: usize = 16 * 1024;
    let mut r = BufReader::new(reader);
    let mut buf = [0u8; 8192];
    let mut pending: Vec<u8> = Vec::with_capacity(512);
    let send = |pending: &mut Vec<u8>| {
        let line = String::from_utf8_lossy(pending).into_owned();
        pending.clear();
        tx.send((stream, line)).is_ok()
    };

    loop {
        let n = match r.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for &b in &buf[..n] {
            if b == b'\n' {
                if !send(&mut pending) {
                    return;
                }
            } else {
                pending.push(b);
                if pending.len() >= MAX_PENDING && !send(&mut pending) {
                    return;
                }
            }
        }
    }
    if !pending.is_empty() {
        let _ = send(&mut pending);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ui::NullUi;

    fn ctx() -> ExecCtx {
        ExecCtx::new(Arc::new(NullUi))
    }

    #[test]
    fn wrapper_substitutes_every_placeholder() {
        let w = CommandWrapper::new("ssh host sudo sh -c '{command}'").unwrap();
        assert_eq!(w.wrap("losetup -D"), "ssh host sudo sh -c 'losetup -D'");
        assert_eq!(CommandWrapper::default().wrap("true"), "true");
    }

    #[test]
    fn wrapper_without_placeholder_is_rejected() {
        let err = CommandWrapper::new("sudo").unwrap_err().to_string();
        assert!(err.contains("{command}"), "unexpected err: {err}");
    }

    #[test]
    fn run_shell_reports_stderr_tail() {
        let err = ctx()
            .run_shell("echo first >&2; echo boom >&2; exit 3")
            .unwrap_err()
            .to_string();
        assert!(err.contains("boom"), "unexpected err: {err}");
    }

    #[test]
    fn shell_status_returns_exit_code() {
        assert_eq!(ctx().shell_status("exit 1").unwrap(), 1);
        assert_eq!(ctx().shell_status("true").unwrap(), 0);
    }

    #[test]
    fn wrapper_applies_to_shell_commands() {
        let ctx = ctx().with_wrapper(CommandWrapper::new("exit 7; {command}").unwrap());
        assert_eq!(ctx.shell_status("true").unwrap(), 7);
    }

    #[test]
    fn cancelled_ctx_refuses_to_spawn_but_cleanup_ctx_runs() {
        let ctx = ctx();
        ctx.request_cancel();
        let err = ctx.run_shell("true").unwrap_err();
        assert!(err.is_cancelled());
        ctx.for_cleanup().run_shell("true").unwrap();
    }

    #[test]
    fn time_limit_kills_slow_commands() {
        let started = Instant::now();
        let err = ctx()
            .with_time_limit(Duration::from_millis(300))
            .run_shell("sleep 5")
            .unwrap_err()
            .to_string();
        assert!(err.contains("timed out"), "unexpected err: {err}");
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn output_captures_stdout() {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg("printf 'a\\nb'");
        assert_eq!(ctx().output(cmd).unwrap(), "a\nb");
    }
}
