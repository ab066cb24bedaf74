use std::path::{Path, PathBuf};
use std::time::Duration;

use fcrunner_protocol::{connect_line, is_connect_ack, LogTag};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Errors from the guest command channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to connect to {}: {source}", path.display())]
    Dial {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to send {what}: {source}")]
    Handshake {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read guest output: {0}")]
    Read(#[source] std::io::Error),

    #[error("failed to write guest output to log: {0}")]
    Log(#[source] std::io::Error),

    #[error("guest command did not finish within {0:?}")]
    TimedOut(Duration),
}

/// How long the host keeps reading guest output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// Read until the guest closes the connection. Short-lived commands.
    WaitForCompletion,
    /// Read until canceled. Long-running guest servers.
    RunUntilCanceled,
}

/// Why a stream ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The guest closed the connection.
    Closed,
    /// The caller canceled.
    Canceled,
}

/// One command invocation over a VM's hybrid vsock socket.
///
/// The host writes `CONNECT <port>\n` followed by the command line; the guest
/// agent then streams output lines until it closes the connection.
#[derive(Debug)]
pub struct CommandChannel {
    reader: BufReader<UnixStream>,
    socket: PathBuf,
}

impl CommandChannel {
    /// Dial the socket and send the handshake and command.
    pub async fn open(socket: &Path, port: u32, command: &str) -> Result<Self, ChannelError> {
        let mut stream = UnixStream::connect(socket)
            .await
            .map_err(|source| ChannelError::Dial {
                path: socket.to_path_buf(),
                source,
            })?;

        stream
            .write_all(connect_line(port).as_bytes())
            .await
            .map_err(|source| ChannelError::Handshake {
                what: "CONNECT",
                source,
            })?;

        let mut line = command.trim_end_matches('\n').to_string();
        line.push('\n');
        stream
            .write_all(line.as_bytes())
            .await
            .map_err(|source| ChannelError::Handshake {
                what: "command",
                source,
            })?;

        debug!(socket = %socket.display(), port, "command sent to guest");
        Ok(Self {
            reader: BufReader::new(stream),
            socket: socket.to_path_buf(),
        })
    }

    /// Copy guest output into `out` as `[OUTPUT]` lines.
    ///
    /// Cancellation ends the stream in either mode and is not an error.
    /// `deadline` bounds [`ChannelMode::WaitForCompletion`] only.
    pub async fn stream<W>(
        mut self,
        cancel: &CancellationToken,
        mode: ChannelMode,
        deadline: Option<Duration>,
        out: &mut W,
    ) -> Result<StreamEnd, ChannelError>
    where
        W: AsyncWrite + Unpin,
    {
        let deadline = match mode {
            ChannelMode::WaitForCompletion => deadline,
            ChannelMode::RunUntilCanceled => None,
        };
        let expiry = async {
            match deadline {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending().await,
            }
        };
        tokio::pin!(expiry);

        let mut buf = Vec::new();
        let mut first = true;
        let end = loop {
            buf.clear();
            let n = tokio::select! {
                _ = cancel.cancelled() => break StreamEnd::Canceled,
                _ = &mut expiry => {
                    out.flush().await.map_err(ChannelError::Log)?;
                    return Err(ChannelError::TimedOut(deadline.unwrap_or_default()));
                }
                read = self.reader.read_until(b'\n', &mut buf) => read.map_err(ChannelError::Read)?,
            };
            if n == 0 {
                break StreamEnd::Closed;
            }

            let line = String::from_utf8_lossy(&buf);
            if std::mem::take(&mut first) && is_connect_ack(&line) {
                debug!(ack = %line.trim_end(), "guest connection acknowledged");
                continue;
            }
            out.write_all(LogTag::Output.format_line(&line).as_bytes())
                .await
                .map_err(ChannelError::Log)?;
        };

        out.flush().await.map_err(ChannelError::Log)?;
        debug!(socket = %self.socket.display(), ?end, "guest stream ended");
        Ok(end)
    }
}
