//! PTY processes using portable-pty.
//!
//! A [`PtyProcess`] owns one pseudo-terminal and the program running in it.
//! Output is delivered to a listener registered at spawn time: every chunk as
//! [`PtyEvent::Data`], then exactly one [`PtyEvent::Exit`].

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Context;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use ptyhub_core::protocol::TerminalOptions;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Terminal size in columns and rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl From<TermSize> for PtySize {
    fn from(size: TermSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// The process could not be started.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to open PTY: {0:#}")]
    OpenPty(anyhow::Error),
    #[error("failed to spawn '{shell}': {error:#}")]
    Command { shell: String, error: anyhow::Error },
    #[error("failed to attach PTY I/O: {0:#}")]
    Io(anyhow::Error),
}

/// The process could not be terminated.
#[derive(Debug, Error)]
#[error("failed to kill process {pid}: {source}")]
pub struct KillError {
    pub pid: u32,
    #[source]
    pub source: std::io::Error,
}

/// Something the PTY produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PtyEvent {
    Data(Vec<u8>),
    /// Final event; `exit_code` is `None` when the status could not be collected.
    Exit { exit_code: Option<u32> },
}

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// How long the reader waits for the exit status after output reaches EOF.
const EXIT_STATUS_TIMEOUT: Duration = Duration::from_secs(5);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

type SharedChild = Arc<Mutex<Box<dyn Child + Send + Sync>>>;

/// Shell used when the caller does not name one.
pub fn default_shell() -> String {
    #[cfg(windows)]
    {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
    }
    #[cfg(not(windows))]
    {
        std::env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string())
    }
}

/// One pseudo-terminal and the process running in it.
pub struct PtyProcess {
    bin: String,
    pid: Option<u32>,
    size: TermSize,
    /// Master PTY for resize operations (sends SIGWINCH).
    master: Box<dyn MasterPty + Send>,
    /// Shared with the reader thread, which collects the exit status.
    child: SharedChild,
    /// Sender for the writer thread.
    write_tx: mpsc::UnboundedSender<Vec<u8>>,
    killed: bool,
}

impl PtyProcess {
    /// Spawn `options.shell` (or the default shell) in a new PTY.
    ///
    /// `listener` is called from a background thread, in order, for every
    /// output chunk and finally once with [`PtyEvent::Exit`].
    pub fn spawn<F>(
        size: TermSize,
        options: &TerminalOptions,
        listener: F,
    ) -> Result<Self, SpawnError>
    where
        F: FnMut(PtyEvent) + Send + 'static,
    {
        let bin = options
            .shell
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(default_shell);

        let pair = native_pty_system()
            .openpty(size.into())
            .map_err(SpawnError::OpenPty)?;

        let mut cmd = CommandBuilder::new(&bin);
        cmd.args(&options.args);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &options.env {
            cmd.env(key, value);
        }
        if let Some(cwd) = &options.cwd {
            cmd.cwd(cwd);
        }

        let mut child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|error| SpawnError::Command {
                shell: bin.clone(),
                error,
            })?;
        // Only the child keeps the slave open, so the reader sees EOF when it exits.
        drop(pair.slave);

        let io = pair
            .master
            .try_clone_reader()
            .context("Failed to clone PTY reader")
            .and_then(|reader| {
                pair.master
                    .take_writer()
                    .context("Failed to take PTY writer")
                    .map(|writer| (reader, writer))
            });
        let (reader, writer) = match io {
            Ok(io) => io,
            Err(e) => {
                let _ = child.kill();
                return Err(SpawnError::Io(e));
            }
        };

        let pid = child.process_id();
        let child: SharedChild = Arc::new(Mutex::new(child));
        let (write_tx, write_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        let reader_child = child.clone();
        std::thread::Builder::new()
            .name(format!("pty-reader-{}", pid.unwrap_or_default()))
            .spawn(move || Self::reader_loop(reader, reader_child, listener))
            .map_err(|e| SpawnError::Io(e.into()))?;

        std::thread::Builder::new()
            .name(format!("pty-writer-{}", pid.unwrap_or_default()))
            .spawn(move || Self::writer_loop(writer, write_rx))
            .map_err(|e| SpawnError::Io(e.into()))?;

        debug!("Spawned '{}' (pid {:?}) at {}x{}", bin, pid, size.cols, size.rows);

        Ok(Self {
            bin,
            pid,
            size,
            master: pair.master,
            child,
            write_tx,
            killed: false,
        })
    }

    /// Path of the launched binary.
    pub fn bin(&self) -> &str {
        &self.bin
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn size(&self) -> TermSize {
        self.size
    }

    /// Queue bytes for the PTY stdin.
    pub fn write(&self, data: &[u8]) -> anyhow::Result<()> {
        self.write_tx
            .send(data.to_vec())
            .map_err(|_| anyhow::anyhow!("PTY input channel closed"))
    }

    /// Resize the PTY and send SIGWINCH to the child process.
    pub fn resize(&mut self, size: TermSize) -> anyhow::Result<()> {
        self.master
            .resize(size.into())
            .context("Failed to resize PTY")?;
        self.size = size;
        Ok(())
    }

    /// Whether the child process is still running.
    pub fn is_alive(&self) -> bool {
        matches!(lock_child(&self.child).try_wait(), Ok(None))
    }

    /// Terminate the process and its descendants.
    ///
    /// Only the first call does anything; killing a process that has already
    /// exited is a no-op.
    pub fn kill(&mut self) -> Result<(), KillError> {
        if self.killed {
            return Ok(());
        }
        self.killed = true;

        let mut child = lock_child(&self.child);
        if let Ok(Some(status)) = child.try_wait() {
            debug!(
                "Process {:?} already exited with {}, nothing to kill",
                self.pid,
                status.exit_code()
            );
            return Ok(());
        }

        let result = match self.pid {
            #[cfg(unix)]
            Some(pid) => kill_process_group(pid),
            _ => child.kill().map_err(|source| KillError {
                pid: self.pid.unwrap_or_default(),
                source,
            }),
        };

        // Reap to avoid zombie accumulation; non-blocking after SIGKILL.
        if let Err(e) = child.try_wait() {
            debug!("Failed to collect child exit status: {}", e);
        }
        result
    }

    /// Reader loop running in a background thread.
    fn reader_loop<F>(mut reader: Box<dyn Read + Send>, child: SharedChild, mut listener: F)
    where
        F: FnMut(PtyEvent),
    {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    debug!("PTY reader EOF");
                    break;
                }
                Ok(n) => listener(PtyEvent::Data(buf[..n].to_vec())),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => {
                    // Linux reports EIO once the slave side is gone.
                    debug!("PTY reader stopped: {}", e);
                    break;
                }
            }
        }

        let exit_code = wait_for_exit(&child);
        listener(PtyEvent::Exit { exit_code });
    }

    /// Writer loop running in a background thread.
    fn writer_loop(mut writer: Box<dyn Write + Send>, mut write_rx: mpsc::UnboundedReceiver<Vec<u8>>) {
        while let Some(data) = write_rx.blocking_recv() {
            if let Err(e) = writer.write_all(&data) {
                error!("PTY write error: {}", e);
                break;
            }
            if let Err(e) = writer.flush() {
                error!("PTY flush error: {}", e);
                break;
            }
        }
        debug!("PTY writer exiting");
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if let Err(e) = self.kill() {
            warn!("Failed to kill '{}' on drop: {}", self.bin, e);
        }
    }
}

fn lock_child(child: &SharedChild) -> MutexGuard<'_, Box<dyn Child + Send + Sync>> {
    child.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Poll for the exit status without holding the lock between attempts.
fn wait_for_exit(child: &SharedChild) -> Option<u32> {
    let attempts = EXIT_STATUS_TIMEOUT.as_millis() / EXIT_POLL_INTERVAL.as_millis();
    for _ in 0..attempts {
        match lock_child(child).try_wait() {
            Ok(Some(status)) => return Some(status.exit_code()),
            Ok(None) => std::thread::sleep(EXIT_POLL_INTERVAL),
            Err(e) => {
                debug!("Failed to collect exit status: {}", e);
                return None;
            }
        }
    }
    warn!("Timed out waiting for PTY child exit status");
    None
}

/// SIGKILL the child's process group; the child leads its own session.
#[cfg(unix)]
fn kill_process_group(pid: u32) -> Result<(), KillError> {
    let pgid = pid as libc::pid_t;
    // SAFETY: killpg only sends a signal; pgid comes from a child we spawned.
    if unsafe { libc::killpg(pgid, libc::SIGKILL) } == 0 {
        return Ok(());
    }
    let source = std::io::Error::last_os_error();
    if source.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(KillError { pid, source })
}
