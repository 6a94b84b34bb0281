//! Running the agent process with a timeout, live echo and bounded capture.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
///
/// stdout and stderr share one buffer, interleaved line by line in arrival order.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub output: Vec<u8>,
    /// Bytes dropped after `output_limit_bytes` was reached.
    pub truncated: usize,
    pub timed_out: bool,
    /// Whether any line contained `CaptureOptions::watch_for`.
    ///
    /// Checked on every line, including lines dropped by the output limit.
    pub watched_seen: bool,
}

impl CommandOutput {
    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }

    pub fn truncated_notice(&self) -> String {
        if self.truncated > 0 {
            format!("\n[output truncated {} bytes]\n", self.truncated)
        } else {
            String::new()
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CaptureOptions<'a> {
    /// Keep at most this many bytes in memory. The pipes are always fully drained.
    pub output_limit_bytes: usize,
    /// Copy every line to our stderr as it arrives.
    pub echo: bool,
    /// Also stream every line to this file, flushed per line.
    pub log_path: Option<&'a Path>,
    /// Literal text to look for in each line.
    pub watch_for: Option<&'a str>,
}

struct Capture {
    buf: Vec<u8>,
    truncated: usize,
    limit: usize,
}

impl Capture {
    fn push(&mut self, line: &[u8]) {
        let remaining = self.limit.saturating_sub(self.buf.len());
        let keep = line.len().min(remaining);
        self.buf.extend_from_slice(&line[..keep]);
        self.truncated += line.len() - keep;
    }
}

type SharedLog = Arc<Option<Mutex<BufWriter<File>>>>;

/// Run a command with a timeout, capturing stdout and stderr without risking pipe deadlocks.
///
/// Both streams are read concurrently while the child runs. `stdin` is written
/// from its own thread so a child that never reads it cannot stall the timeout.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes = options.output_limit_bytes, echo = options.echo))]
pub fn run_command_captured(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    options: &CaptureOptions<'_>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        // Own group so a timeout can reach every descendant holding our pipes.
        cmd.process_group(0);
    }

    let log: SharedLog = Arc::new(match options.log_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create log dir {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("create output log {}", path.display()))?;
            Some(Mutex::new(BufWriter::new(file)))
        }
        None => None,
    });

    debug!(program = ?cmd.get_program(), "spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let capture = Arc::new(Mutex::new(Capture {
        buf: Vec::new(),
        truncated: 0,
        limit: options.output_limit_bytes,
    }));
    let seen = Arc::new(AtomicBool::new(false));
    let watch_for = options.watch_for.map(|needle| needle.as_bytes().to_vec());

    let stdout_handle = spawn_reader(
        stdout,
        ReaderShared {
            capture: Arc::clone(&capture),
            log: Arc::clone(&log),
            seen: Arc::clone(&seen),
            watch_for: watch_for.clone(),
            echo: options.echo,
        },
    );
    let stderr_handle = spawn_reader(
        stderr,
        ReaderShared {
            capture: Arc::clone(&capture),
            log: Arc::clone(&log),
            seen: Arc::clone(&seen),
            watch_for,
            echo: options.echo,
        },
    );

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || {
                if let Err(e) = child_stdin.write_all(&input) {
                    // The child may exit without reading its input.
                    warn!(err = %e, "failed to write child stdin");
                }
            }))
        }
        None => None,
    };

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            kill_process_group(child.id());
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    // After a timeout, descendants that escaped the group kill may still hold the
    // pipes open. Stop waiting on the readers instead of hanging on them.
    let deadline = timed_out.then(|| Instant::now() + READER_GRACE);
    if let Some(handle) = stdin_handle
        && wait_finished(&handle, deadline)
        && handle.join().is_err()
    {
        warn!("stdin writer thread panicked");
    }
    for (name, handle) in [("stdout", stdout_handle), ("stderr", stderr_handle)] {
        if wait_finished(&handle, deadline) {
            join_reader(handle).with_context(|| format!("join {name}"))?;
        } else {
            warn!(stream = name, "reader still blocked after timeout, detaching");
        }
    }

    if let Some(ref mutex) = *log
        && let Ok(mut writer) = mutex.lock()
        && let Err(e) = writer.flush()
    {
        warn!(err = %e, "failed to flush output log");
    }

    let (output, truncated) = {
        let mut guard = capture
            .lock()
            .map_err(|_| anyhow!("output capture lock poisoned"))?;
        (std::mem::take(&mut guard.buf), guard.truncated)
    };
    if truncated > 0 {
        warn!(truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        output,
        truncated,
        timed_out,
        watched_seen: seen.load(Ordering::SeqCst),
    })
}

struct ReaderShared {
    capture: Arc<Mutex<Capture>>,
    log: SharedLog,
    seen: Arc<AtomicBool>,
    watch_for: Option<Vec<u8>>,
    echo: bool,
}

fn spawn_reader<R: Read + Send + 'static>(
    reader: R,
    shared: ReaderShared,
) -> thread::JoinHandle<Result<()>> {
    thread::spawn(move || read_lines(reader, &shared))
}

fn read_lines<R: Read>(reader: R, shared: &ReaderShared) -> Result<()> {
    let mut buf_reader = BufReader::new(reader);
    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(needle) = &shared.watch_for
            && contains_bytes(&line, needle)
        {
            shared.seen.store(true, Ordering::SeqCst);
        }

        if shared.echo {
            let mut err = std::io::stderr().lock();
            if let Err(e) = err.write_all(&line).and_then(|()| err.flush()) {
                debug!(err = %e, "failed to echo output");
            }
        }

        if let Some(ref mutex) = *shared.log
            && let Ok(mut writer) = mutex.lock()
        {
            if let Err(e) = writer.write_all(&line) {
                warn!(err = %e, "failed to write output log");
            } else if let Err(e) = writer.flush() {
                warn!(err = %e, "failed to flush output log");
            }
        }

        shared
            .capture
            .lock()
            .map_err(|_| anyhow!("output capture lock poisoned"))?
            .push(&line);
    }
    Ok(())
}

/// How long reader threads may keep draining after a timeout kill.
const READER_GRACE: Duration = Duration::from_secs(2);

/// Wait for `handle` to finish, giving up at `deadline`. No deadline means wait forever.
fn wait_finished<T>(handle: &thread::JoinHandle<T>, deadline: Option<Instant>) -> bool {
    let Some(deadline) = deadline else {
        return true;
    };
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(20));
    }
    true
}

/// SIGKILL the whole process group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    let result = Command::new("kill")
        .arg("-KILL")
        .arg(format!("-{pid}"))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match result {
        Ok(status) if !status.success() => {
            debug!(pid, code = ?status.code(), "process group kill reported failure");
        }
        Err(e) => warn!(pid, err = %e, "failed to kill process group"),
        Ok(_) => {}
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

fn join_reader(handle: thread::JoinHandle<Result<()>>) -> Result<()> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|window| window == needle)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    fn options(limit: usize) -> CaptureOptions<'static> {
        CaptureOptions {
            output_limit_bytes: limit,
            ..CaptureOptions::default()
        }
    }

    #[test]
    fn captures_stdout_and_stderr_with_exit_code() {
        let output = run_command_captured(
            sh("echo out; echo err >&2; exit 3"),
            None,
            Duration::from_secs(10),
            &options(1024),
        )
        .expect("run");

        let text = output.output_lossy();
        assert!(text.contains("out\n"));
        assert!(text.contains("err\n"));
        assert_eq!(output.status.code(), Some(3));
        assert!(!output.timed_out);
    }

    #[test]
    fn feeds_stdin_to_child() {
        let output = run_command_captured(
            Command::new("cat"),
            Some(b"the prompt\n"),
            Duration::from_secs(10),
            &options(1024),
        )
        .expect("run");
        assert_eq!(output.output_lossy(), "the prompt\n");
        assert!(output.status.success());
    }

    #[test]
    fn kills_child_on_timeout() {
        let output = run_command_captured(
            sh("sleep 5"),
            None,
            Duration::from_millis(200),
            &options(1024),
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(!output.status.success());
    }

    /// A background grandchild keeps the pipes open; the timeout must still
    /// return promptly instead of waiting for it to exit.
    #[test]
    fn timeout_does_not_wait_for_grandchildren() {
        let started = Instant::now();
        let output = run_command_captured(
            sh("sleep 6; echo late"),
            None,
            Duration::from_millis(300),
            &options(1024),
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "took {:?}",
            started.elapsed()
        );
        assert!(!output.output_lossy().contains("late"));
    }

    #[test]
    fn timeout_reaches_backgrounded_descendants() {
        let started = Instant::now();
        let output = run_command_captured(
            sh("(sleep 6; echo bg) & echo started; wait"),
            None,
            Duration::from_millis(300),
            &options(1024),
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(output.output_lossy().contains("started"));
    }

    /// The watched marker is still detected when the line holding it is past the limit.
    #[test]
    fn watch_survives_truncation() {
        let output = run_command_captured(
            sh("printf 'aaaaaaaaaaaaaaaa\\n<promise>COMPLETE</promise>\\n'"),
            None,
            Duration::from_secs(10),
            &CaptureOptions {
                output_limit_bytes: 4,
                watch_for: Some("<promise>COMPLETE</promise>"),
                ..CaptureOptions::default()
            },
        )
        .expect("run");
        assert_eq!(output.output, b"aaaa");
        assert!(output.truncated > 0);
        assert!(output.watched_seen);
        assert!(output.truncated_notice().contains("truncated"));
    }

    #[test]
    fn streams_every_line_to_log_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log_path = temp.path().join("iter").join("output.log");
        let output = run_command_captured(
            sh("echo one; echo two"),
            None,
            Duration::from_secs(10),
            &CaptureOptions {
                output_limit_bytes: 3,
                log_path: Some(&log_path),
                ..CaptureOptions::default()
            },
        )
        .expect("run");
        assert_eq!(output.output, b"one");
        assert_eq!(
            std::fs::read_to_string(&log_path).expect("read log"),
            "one\ntwo\n"
        );
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let err = run_command_captured(
            Command::new("/definitely/not/a/real/binary"),
            None,
            Duration::from_secs(1),
            &options(16),
        )
        .unwrap_err();
        assert!(err.to_string().contains("spawn command"));
    }
}
