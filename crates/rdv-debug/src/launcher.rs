//! Backend process supervision.
//! - DebugLauncher: spawns `python -m debugpy` for the target program
//! - forwards combined stdout/stderr lines for the diagnostics pane
//! - stop(): graceful bounded wait, then kill

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::LaunchError;

/// Default port debugpy listens on.
pub const DEFAULT_DAP_PORT: u16 = 5678;

const STOP_GRACE: Duration = Duration::from_secs(3);
const STOP_POLL: Duration = Duration::from_millis(50);

fn interpreter() -> String {
    std::env::var("RDV_DEBUG_PYTHON").unwrap_or_else(|_| "python".to_string())
}

/// Supervises the external debug backend process. Process-level
/// failures (missing executable, unexpected exit) are reported here,
/// independent of anything that happens on the protocol socket.
pub struct DebugLauncher {
    child: Child,
    program: PathBuf,
    readers: Vec<JoinHandle<()>>,
}

impl DebugLauncher {
    /// Spawn `python -m debugpy --listen <port> --wait-for-client
    /// <program>`. Output lines from both process streams are
    /// forwarded through `output` for diagnostics.
    ///
    /// # Errors
    ///
    /// Fails when the program file is missing or the interpreter
    /// cannot be spawned; no connection is attempted in either case.
    pub fn start(
        program: &Path,
        port: u16,
        output: Sender<String>,
    ) -> Result<Self, LaunchError> {
        if !program.exists() {
            return Err(LaunchError::MissingProgram(program.to_path_buf()));
        }

        let command = interpreter();
        let mut child = Command::new(&command)
            .arg("-m")
            .arg("debugpy")
            .arg("--listen")
            .arg(port.to_string())
            .arg("--wait-for-client")
            .arg(program)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| LaunchError::Spawn { command, source })?;

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_forwarder(stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_forwarder(stderr, output));
        }

        debug!(program = %program.display(), port, "debug backend spawned");
        Ok(Self {
            child,
            program: program.to_path_buf(),
            readers,
        })
    }

    /// Target program this backend is debugging.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    #[must_use]
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Request termination: wait up to the grace period for the
    /// process to exit on its own (the protocol-level disconnect
    /// usually gets it there), then force-kill.
    pub fn stop(&mut self) {
        let deadline = Instant::now() + STOP_GRACE;
        while Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(%status, "debug backend exited");
                    self.join_readers();
                    return;
                }
                Ok(None) => thread::sleep(STOP_POLL),
                Err(err) => {
                    warn!(error = %err, "failed to poll debug backend");
                    break;
                }
            }
        }

        if let Err(err) = self.child.kill() {
            warn!(error = %err, "failed to kill debug backend");
        }
        let _ = self.child.wait();
        self.join_readers();
    }

    fn join_readers(&mut self) {
        for handle in self.readers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn spawn_forwarder<R: Read + Send + 'static>(stream: R, output: Sender<String>) -> JoinHandle<()> {
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for line in reader.lines() {
            let Ok(line) = line else { break };
            let trimmed = line.trim_end();
            if trimmed.is_empty() {
                continue;
            }
            if output.send(trimmed.to_string()).is_err() {
                break;
            }
        }
    })
}
