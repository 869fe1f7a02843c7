use std::io::{Read, Write};
use std::path::Path;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};

const READ_CHUNK: usize = 4096;
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// A debugger process bound to a pseudo-terminal pair.
///
/// The debugger's line editor assumes a terminal; anonymous pipes make it
/// buffer or block indefinitely, so the child is spawned on the PTY slave
/// and all I/O goes through the master side. A blocking reader task feeds
/// raw chunks into an mpsc channel the session loop consumes.
pub struct TransportHandle {
    writer: Option<Box<dyn Write + Send>>,
    output: Option<mpsc::Receiver<Vec<u8>>>,
    child: Option<Box<dyn Child + Send + Sync>>,
    _master: Option<Box<dyn MasterPty + Send>>,
    closed: bool,
}

impl TransportHandle {
    /// Allocates a PTY pair and spawns the debugger attached to its slave
    /// side. Fails with `Spawn` if the binary is missing or the terminal
    /// allocation fails.
    pub fn spawn(debugger_path: &Path, args: &[String]) -> Result<Self> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| EngineError::Spawn(format!("PTY allocation failed: {e}")))?;

        let mut cmd = CommandBuilder::new(debugger_path);
        cmd.args(args);
        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| {
                EngineError::Spawn(format!(
                    "failed to spawn '{}': {e}",
                    debugger_path.display()
                ))
            })?;
        // The slave descriptor lives on in the child.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| EngineError::Spawn(format!("failed to clone PTY reader: {e}")))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| EngineError::Spawn(format!("failed to take PTY writer: {e}")))?;

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        debug!("PTY read ended: {err}");
                        break;
                    }
                }
            }
        });

        debug!("spawned debugger '{}'", debugger_path.display());

        Ok(Self {
            writer: Some(writer),
            output: Some(rx),
            child: Some(child),
            _master: Some(pair.master),
            closed: false,
        })
    }

    /// The raw byte source; taken exactly once by the session loop.
    pub fn take_output(&mut self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.output.take()
    }

    /// Process id of the debugger child itself (not the debugged target).
    pub fn debugger_pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.process_id())
    }

    /// Writes one line followed by a newline. Fails with `Closed` once the
    /// handle has been torn down.
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        if self.closed {
            return Err(EngineError::Closed("transport already closed".to_string()));
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| EngineError::Closed("transport writer released".to_string()))?;
        writer
            .write_all(line.as_bytes())
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush())
            .map_err(|e| EngineError::Closed(format!("PTY write failed: {e}")))
    }

    /// Idempotent teardown: releases both terminal descriptors and reaps
    /// the child. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.writer.take();
        if let Some(mut child) = self.child.take() {
            if let Err(err) = child.kill() {
                debug!("debugger child kill: {err}");
            }
            if let Err(err) = child.wait() {
                warn!("debugger child reap failed: {err}");
            }
        }
        self._master.take();
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl std::fmt::Debug for TransportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportHandle")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use std::sync::mpsc as std_mpsc;

    /// Test-side controls for a scripted transport: inject bytes the
    /// session will read, observe lines the session wrote.
    pub struct ScriptedPeer {
        pub feed: mpsc::Sender<Vec<u8>>,
        written: std::sync::Mutex<std_mpsc::Receiver<Vec<u8>>>,
    }

    impl ScriptedPeer {
        pub async fn feed_str(&self, text: &str) {
            self.feed
                .send(text.as_bytes().to_vec())
                .await
                .expect("session loop should still be reading");
        }

        /// Drains everything written so far, as lines.
        pub fn take_written(&self) -> Vec<String> {
            let mut all = Vec::new();
            for chunk in self.written.lock().unwrap().try_iter() {
                all.extend_from_slice(&chunk);
            }
            String::from_utf8_lossy(&all)
                .lines()
                .map(str::to_string)
                .collect()
        }
    }

    struct ChannelWriter(std_mpsc::Sender<Vec<u8>>);

    impl Write for ChannelWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let _ = self.0.send(buf.to_vec());
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl TransportHandle {
        /// An in-memory transport with no subprocess behind it.
        pub(crate) fn scripted() -> (Self, ScriptedPeer) {
            let (feed_tx, feed_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
            let (written_tx, written_rx) = std_mpsc::channel();
            let handle = Self {
                writer: Some(Box::new(ChannelWriter(written_tx))),
                output: Some(feed_rx),
                child: None,
                _master: None,
                closed: false,
            };
            let peer = ScriptedPeer {
                feed: feed_tx,
                written: std::sync::Mutex::new(written_rx),
            };
            (handle, peer)
        }
    }
}
