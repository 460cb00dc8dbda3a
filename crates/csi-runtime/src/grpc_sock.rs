//! Unix socket plumbing for tonic. Socket support is not built in to tonic,
//! so the server side wraps a `UnixListener` in a connection stream and the
//! client side dials through a custom connector. CSI endpoints are almost
//! always unix sockets, which is why this lives here rather than behind a
//! transport abstraction.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tonic::transport::server::Connected;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

#[derive(Debug)]
pub struct UnixStream(tokio::net::UnixStream);

/// A bound unix socket usable with
/// `tonic::transport::Server::serve_with_incoming`. The socket file is
/// removed again when the value is dropped.
pub struct Socket {
    listener: tokio::net::UnixListener,
    path: PathBuf,
}

impl Socket {
    /// Binds the socket at the given path. The parent directory must exist;
    /// a stale socket file from a previous process must have been removed by
    /// the caller.
    pub fn bind<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let listener = tokio::net::UnixListener::bind(&path)?;
        Ok(Socket {
            listener,
            path: path.as_ref().to_owned(),
        })
    }

    /// The path the socket is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "unable to clean up endpoint socket"
                );
            }
        }
    }
}

impl Stream for Socket {
    type Item = Result<UnixStream, std::io::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.listener).poll_accept(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(res) => Poll::Ready(Some(res.map(|(stream, _)| UnixStream(stream)))),
        }
    }
}

impl Connected for UnixStream {
    type ConnectInfo = ();

    fn connect_info(&self) -> Self::ConnectInfo {}
}

impl AsyncRead for UnixStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for UnixStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

/// Returns a channel connected to the unix socket at the given path,
/// suitable for use with the tonic generated CSI clients. Pass the channel
/// to `YourClient::new` instead of using `YourClient::connect`.
pub async fn socket_channel<P: AsRef<Path>>(path: P) -> Result<Channel, tonic::transport::Error> {
    let p = path.as_ref().to_owned();

    // The http endpoint is required by the Endpoint constructor but ignored
    // by the connector.
    Endpoint::from_static("http://[::]:50051")
        .connect_with_connector(service_fn(move |_: Uri| {
            tokio::net::UnixStream::connect(p.clone())
        }))
        .await
}
