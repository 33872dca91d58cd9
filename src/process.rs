//! External command execution shared by the negotiation helper and hooks

use std::env;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

/// How long pipe readers may keep draining once the process is gone.
/// Background children of the command can hold the pipes open indefinitely.
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// How a finished (or abandoned) command ended
#[derive(Debug)]
pub enum CommandOutcome {
    /// Process exited on its own
    Exited { status: ExitStatus, output: String },

    /// Process was killed after the timeout elapsed
    TimedOut { output: String },
}

/// Split a command line into program and arguments
///
/// Commands are whitespace separated; quoting is not interpreted.
pub fn split_command(command: &str) -> Option<(&str, Vec<&str>)> {
    let mut parts = command.split_whitespace();
    let program = parts.next()?;
    Some((program, parts.collect()))
}

/// Run `program` with `args`, capturing stdout and stderr into one string.
///
/// Both pipes feed one buffer in arrival order. With a timeout the command
/// and everything it spawned is killed once it elapses, and whatever it
/// printed so far is returned as [`CommandOutcome::TimedOut`].
pub async fn run_with_timeout(
    program: &str,
    args: &[String],
    timeout: Option<Duration>,
) -> io::Result<CommandOutcome> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command.spawn()?;

    let output = Arc::new(Mutex::new(Vec::new()));
    let readers = [
        spawn_reader(child.stdout.take(), output.clone()),
        spawn_reader(child.stderr.take(), output.clone()),
    ];

    let status = match timeout {
        Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
            Ok(status) => Some(status?),
            Err(_) => {
                tracing::debug!("{} exceeded {:?}, killing it", program, limit);
                kill_tree(&mut child, program).await;
                None
            }
        },
        None => Some(child.wait().await?),
    };

    for reader in readers.into_iter().flatten() {
        drain(reader).await;
    }

    let output = String::from_utf8_lossy(&output.lock()).into_owned();
    Ok(match status {
        Some(status) => CommandOutcome::Exited { status, output },
        None => CommandOutcome::TimedOut { output },
    })
}

/// Kill the child's process group, then the child itself
async fn kill_tree(child: &mut Child, program: &str) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            // The child leads its own group, see `process_group(0)`
            // SAFETY: kill(2) with a negative pid only signals that group
            if unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) } != 0 {
                tracing::debug!(
                    "Failed to kill process group of {}: {}",
                    program,
                    io::Error::last_os_error()
                );
            }
        }
    }

    if let Err(e) = child.kill().await {
        tracing::warn!("Failed to kill {}: {}", program, e);
    }
}

fn spawn_reader<R>(pipe: Option<R>, output: Arc<Mutex<Vec<u8>>>) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pipe.map(|mut pipe| {
        tokio::spawn(async move {
            let mut chunk = [0u8; 1024];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => output.lock().extend_from_slice(&chunk[..n]),
                }
            }
        })
    })
}

/// Wait for a reader to hit EOF, abandoning it after [`DRAIN_GRACE`]
async fn drain(mut reader: JoinHandle<()>) {
    if tokio::time::timeout(DRAIN_GRACE, &mut reader).await.is_err() {
        tracing::debug!("Pipe still held open after exit, dropping the rest of the output");
        reader.abort();
    }
}

/// Check that a command line names something runnable.
///
/// Only the first whitespace separated token is checked. Paths starting with
/// `/` or `.` must exist; bare names must be an executable file in `PATH`.
pub fn is_executable_valid(command: &str) -> bool {
    let Some((program, _)) = split_command(command.trim()) else {
        return false;
    };

    if program.starts_with('/') || program.starts_with('.') {
        return Path::new(program).exists();
    }

    env::var_os("PATH")
        .map(|paths| env::split_paths(&paths).any(|dir| is_executable_file(&dir.join(program))))
        .unwrap_or(false)
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    path.is_file()
}
