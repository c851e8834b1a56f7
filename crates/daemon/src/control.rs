//! Local control channel over a Unix stream socket.
//!
//! Each accepted connection carries a single newline-terminated command.
//! The endpoint reads the line, hands it (without the terminator) to the
//! registered handler, and closes the connection. Connections are served
//! as independent tasks so a slow client cannot starve the others. The
//! endpoint never interprets the command; parsing belongs to the
//! supervisor.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

use crate::error::Result;

/// Longest accepted command line, terminator included.
const MAX_COMMAND_BYTES: u64 = 4096;

/// Callback invoked with each received command line.
pub type CommandHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Stream-oriented local control endpoint.
pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlServer {
    /// Bind the control socket at `path`, unlinking any stale file first.
    pub fn bind<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        info!("control endpoint listening on {}", path.display());
        Ok(Self { listener, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept and serve connections until shutdown is signalled.
    pub async fn run(self, handler: CommandHandler, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let handler = Arc::clone(&handler);
                        tokio::spawn(async move {
                            if let Err(e) = serve_connection(stream, handler).await {
                                warn!("control connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => error!("control accept failed: {}", e),
                }
            }
        }
    }
}

impl Drop for ControlServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Read one command line (up to newline or EOF) and invoke the handler.
async fn serve_connection(stream: UnixStream, handler: CommandHandler) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.take(MAX_COMMAND_BYTES));
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let command = line.trim_end_matches('\n');
    if !command.is_empty() {
        handler(command);
    }
    Ok(())
}
