use crate::error::{AgentError, Result};
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UnixStream;

/// Where to reach the in-guest agent. Vsock is the production path; the
/// Unix socket variant backs every local dev setup and this repository's
/// own test double.
#[derive(Debug, Clone)]
pub enum AgentEndpoint {
    #[cfg(target_os = "linux")]
    Vsock { cid: u32, port: u32 },
    Unix { path: std::path::PathBuf },
}

impl AgentEndpoint {
    pub fn unix(path: impl Into<std::path::PathBuf>) -> Self {
        AgentEndpoint::Unix { path: path.into() }
    }
}

pub enum AgentStream {
    Unix(UnixStream),
    #[cfg(target_os = "linux")]
    Vsock(tokio_vsock::VsockStream),
}

/// Connects a fresh stream for a single request. The agent client
/// reconnects per call rather than multiplexing over a persistent
/// stream; multiplexed streaming is a known follow-up (see DESIGN.md).
pub async fn connect(endpoint: &AgentEndpoint) -> Result<AgentStream> {
    match endpoint {
        #[cfg(target_os = "linux")]
        AgentEndpoint::Vsock { cid, port } => {
            match tokio_vsock::VsockStream::connect(tokio_vsock::VsockAddr::new(*cid, *port)).await
            {
                Ok(stream) => Ok(AgentStream::Vsock(stream)),
                Err(e) => Err(AgentError::unavailable(format!(
                    "vsock connect to cid={cid} port={port} failed: {e}"
                ))),
            }
        }
        AgentEndpoint::Unix { path } => {
            let stream = UnixStream::connect(path).await.map_err(|e| {
                AgentError::unavailable(format!(
                    "unix socket connect to {} failed: {e}",
                    path.display()
                ))
            })?;
            Ok(AgentStream::Unix(stream))
        }
    }
}

impl AsyncRead for AgentStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AgentStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(target_os = "linux")]
            AgentStream::Vsock(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AgentStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            AgentStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(target_os = "linux")]
            AgentStream::Vsock(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AgentStream::Unix(s) => Pin::new(s).poll_flush(cx),
            #[cfg(target_os = "linux")]
            AgentStream::Vsock(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            AgentStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(target_os = "linux")]
            AgentStream::Vsock(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}
