//! PTY adapter built on portable-pty.
//!
//! Starts a child process attached to a pseudo-terminal and exposes write,
//! resize, and kill plus an output pump feeding the session manager. The
//! child is an opaque byte pipe; output is never interpreted here.

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use shmux_core::{ShmuxError, ShmuxResult};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Output chunk size for the PTY read pump.
const READ_BUF_SIZE: usize = 8192;

/// How to start the child process: one of the three spawn profiles.
#[derive(Debug, Clone)]
pub struct SpawnProfile {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub env: HashMap<String, String>,
}

impl SpawnProfile {
    /// A local shell: the resolved shell path with no arguments.
    pub fn local_shell(
        shell: &str,
        cwd: Option<&str>,
        env: Option<&HashMap<String, String>>,
    ) -> Self {
        Self {
            command: shell.to_string(),
            args: Vec::new(),
            cwd: cwd.map(|s| s.to_string()),
            env: env.cloned().unwrap_or_default(),
        }
    }

    /// `<runtime> exec -it [-u USER] [-w CWD] [-e K=V]… CONTAINER SHELL`.
    pub fn container_exec(
        runtime: &str,
        container: &str,
        shell: &str,
        user: Option<&str>,
        cwd: Option<&str>,
        env: Option<&HashMap<String, String>>,
    ) -> Self {
        let mut args = vec!["exec".to_string(), "-it".to_string()];
        if let Some(user) = user {
            args.push("-u".to_string());
            args.push(user.to_string());
        }
        if let Some(cwd) = cwd {
            args.push("-w".to_string());
            args.push(cwd.to_string());
        }
        if let Some(env) = env {
            for (k, v) in env {
                args.push("-e".to_string());
                args.push(format!("{k}={v}"));
            }
        }
        args.push(container.to_string());
        args.push(shell.to_string());
        Self {
            command: runtime.to_string(),
            args,
            cwd: None,
            env: HashMap::new(),
        }
    }

    /// `<runtime> attach --sig-proxy=false --detach-keys=ctrl-p,ctrl-q CONTAINER`.
    ///
    /// The attach flags keep a client detach from killing the container's
    /// main process.
    pub fn container_attach(runtime: &str, container: &str) -> Self {
        Self {
            command: runtime.to_string(),
            args: vec![
                "attach".to_string(),
                "--sig-proxy=false".to_string(),
                "--detach-keys=ctrl-p,ctrl-q".to_string(),
                container.to_string(),
            ],
            cwd: None,
            env: HashMap::new(),
        }
    }
}

/// A managed PTY with its child process.
pub struct PtyHandle {
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    child: Arc<Mutex<Box<dyn portable_pty::Child + Send + Sync>>>,
    killer: Arc<Mutex<Box<dyn ChildKiller + Send + Sync>>>,
}

impl PtyHandle {
    /// Open a PTY and spawn the child described by `profile` at the given
    /// geometry. Returns the handle plus the output stream; the stream
    /// closes when the child's output side reaches EOF.
    ///
    /// `TERM=xterm-256color` is set unless the profile overrides it.
    pub fn spawn(
        profile: &SpawnProfile,
        cols: u16,
        rows: u16,
    ) -> ShmuxResult<(Self, mpsc::Receiver<Vec<u8>>)> {
        let pty_system = native_pty_system();

        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system
            .openpty(size)
            .map_err(|e| ShmuxError::Spawn(format!("failed to open PTY: {e}")))?;

        let mut cmd = CommandBuilder::new(&profile.command);
        for arg in &profile.args {
            cmd.arg(arg);
        }
        if let Some(ref cwd) = profile.cwd {
            cmd.cwd(cwd);
        }
        for (k, v) in &profile.env {
            cmd.env(k, v);
        }
        if !profile.env.contains_key("TERM") {
            cmd.env("TERM", "xterm-256color");
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| ShmuxError::Spawn(format!("failed to spawn {}: {e}", profile.command)))?;

        info!(command = %profile.command, cols, rows, "pty spawned");

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| ShmuxError::Spawn(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| ShmuxError::Spawn(format!("failed to take PTY writer: {e}")))?;
        let killer = child.clone_killer();

        // Output pump: a blocking reader thread feeding an async channel.
        // The channel closing is the EOF signal for the consumer. A
        // multibyte UTF-8 sequence split across reads is held back until
        // its remaining bytes arrive, so every emitted chunk ends on a
        // codepoint boundary.
        let (out_tx, out_rx) = mpsc::channel::<Vec<u8>>(64);
        tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; READ_BUF_SIZE];
            let mut pending: Vec<u8> = Vec::new();
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        pending.extend_from_slice(&buf[..n]);
                        let complete = utf8_split_point(&pending);
                        if complete == 0 {
                            continue;
                        }
                        let chunk: Vec<u8> = pending.drain(..complete).collect();
                        if out_tx.blocking_send(chunk).is_err() {
                            return;
                        }
                    }
                }
            }
            // Flush any truncated sequence left at EOF.
            if !pending.is_empty() {
                let _ = out_tx.blocking_send(pending);
            }
            debug!("pty read pump finished");
        });

        Ok((
            Self {
                writer: Arc::new(Mutex::new(writer)),
                master: Arc::new(Mutex::new(pair.master)),
                child: Arc::new(Mutex::new(child)),
                killer: Arc::new(Mutex::new(killer)),
            },
            out_rx,
        ))
    }

    /// Write bytes to the child's input. Runs on the blocking pool so a
    /// slow PTY cannot stall the async runtime.
    pub async fn write(&self, data: Vec<u8>) -> ShmuxResult<()> {
        let writer = self.writer.clone();
        tokio::task::spawn_blocking(move || {
            let mut writer = writer
                .lock()
                .map_err(|_| ShmuxError::Pty("PTY writer lock poisoned".into()))?;
            writer.write_all(&data).map_err(ShmuxError::Io)?;
            writer.flush().map_err(ShmuxError::Io)?;
            Ok(())
        })
        .await
        .map_err(|e| ShmuxError::Pty(format!("join error: {e}")))?
    }

    /// Resize the PTY.
    pub fn resize(&self, cols: u16, rows: u16) -> ShmuxResult<()> {
        let size = PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        };
        let master = self
            .master
            .lock()
            .map_err(|_| ShmuxError::Pty("PTY master lock poisoned".into()))?;
        master
            .resize(size)
            .map_err(|e| ShmuxError::Pty(format!("PTY resize failed: {e}")))?;
        debug!(cols, rows, "pty resized");
        Ok(())
    }

    /// Terminate the child. The exit is reaped by [`PtyHandle::wait`].
    pub fn kill(&self) -> ShmuxResult<()> {
        let mut killer = self
            .killer
            .lock()
            .map_err(|_| ShmuxError::Pty("PTY killer lock poisoned".into()))?;
        killer
            .kill()
            .map_err(|e| ShmuxError::Pty(format!("kill failed: {e}")))?;
        Ok(())
    }

    /// Wait for the child to exit and return its exit code.
    pub async fn wait(&self) -> ShmuxResult<i32> {
        let child = self.child.clone();
        let status = tokio::task::spawn_blocking(move || {
            let mut child = child
                .lock()
                .map_err(|_| ShmuxError::Pty("child lock poisoned".into()))?;
            child
                .wait()
                .map_err(|e| ShmuxError::Pty(format!("wait failed: {e}")))
        })
        .await
        .map_err(|e| ShmuxError::Pty(format!("join error: {e}")))??;

        let code = i32::try_from(status.exit_code()).unwrap_or(-1);
        info!(code, "pty child exited");
        Ok(code)
    }
}

/// Length of the prefix of `bytes` that ends on a UTF-8 codepoint
/// boundary. Only an incomplete trailing multibyte sequence is held back
/// (at most three bytes); invalid sequences pass through unchanged.
fn utf8_split_point(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for i in (len.saturating_sub(3)..len).rev() {
        let b = bytes[i];
        if b < 0x80 {
            return len;
        }
        if b >= 0xC0 {
            let need = if b >= 0xF0 {
                4
            } else if b >= 0xE0 {
                3
            } else {
                2
            };
            return if len - i < need { i } else { len };
        }
        // continuation byte, keep scanning backwards
    }
    len
}
