//! Unix socket front end.
//!
//! A client asks for a secret simply by connecting.  The name is taken from
//! the client's own bound address, which follows the convention systemd uses
//! for `LoadCredential=`:
//!
//! ```text
//! @<random>/unit/<unit-name>/<secret-name>
//! ```
//!
//! The address is split on `/`; exactly four parts are required and the last
//! one names the secret.  The broker answers with the raw value bytes and
//! closes.  On any failure the connection is closed without writing.

use std::fs::DirBuilder;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, info, warn};

use crate::error::{ConnectionError, StartupError};
use crate::gateway::SecretsGateway;
use crate::secrets::SecretsApi;

/// Secret name encoded in a peer address.
pub fn secret_name_from_peer(peer: &str) -> Result<&str, ConnectionError> {
    let parts: Vec<&str> = peer.split('/').collect();
    match parts.as_slice() {
        &[_, _, _, name] if !name.is_empty() => Ok(name),
        _ => Err(ConnectionError::UnexpectedPeer(peer.to_string())),
    }
}

/// Text form of a Unix socket address.
///
/// Pathname sockets render as their path, Linux abstract sockets as `@`
/// followed by the name, unnamed sockets as the empty string.
pub fn render_peer(addr: &SocketAddr) -> String {
    if let Some(path) = addr.as_pathname() {
        return path.to_string_lossy().into_owned();
    }

    #[cfg(target_os = "linux")]
    {
        use std::os::linux::net::SocketAddrExt;

        if let Some(name) = addr.as_abstract_name() {
            return format!("@{}", String::from_utf8_lossy(name));
        }
    }

    String::new()
}

/// Peer address of `stream`, rendered with [`render_peer`].
///
/// Tokio's address type does not expose abstract names, so the stream takes
/// a round trip through its std counterpart.
pub fn split_peer(stream: UnixStream) -> io::Result<(UnixStream, String)> {
    let std_stream = stream.into_std()?;
    let peer = render_peer(&std_stream.peer_addr()?);
    Ok((UnixStream::from_std(std_stream)?, peer))
}

/// Serve one connection: resolve the secret named by `peer` and write its
/// value to `stream`.
///
/// Returns the number of bytes written.  On error nothing has been written.
pub async fn handle_connection<A, S>(
    gateway: &SecretsGateway<A>,
    mut stream: S,
    peer: &str,
) -> Result<usize, ConnectionError>
where
    A: SecretsApi,
    S: AsyncWrite + Unpin,
{
    let name = secret_name_from_peer(peer)?;
    debug!(%peer, secret = %name, "secret requested");

    let record = gateway.resolve(name).await?;
    stream.write_all(record.value.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(record.value.len())
}

/// Accept loop handing every connection to its own task.
pub struct Dispatcher<A> {
    gateway: Arc<SecretsGateway<A>>,
}

impl<A> Clone for Dispatcher<A> {
    fn clone(&self) -> Self {
        Self {
            gateway: Arc::clone(&self.gateway),
        }
    }
}

impl<A: SecretsApi + 'static> Dispatcher<A> {
    pub fn new(gateway: SecretsGateway<A>) -> Self {
        Self {
            gateway: Arc::new(gateway),
        }
    }

    /// Accept connections until accepting fails.
    ///
    /// Failures of individual connections are logged and never end the loop.
    pub async fn serve(&self, listener: UnixListener) -> Result<(), StartupError> {
        if let Ok(addr) = listener.local_addr() {
            info!(socket = ?addr.as_pathname(), organization = %self.gateway.organization(), "listening");
        }

        loop {
            let (stream, _) = listener.accept().await.map_err(StartupError::Accept)?;
            let gateway = Arc::clone(&self.gateway);

            tokio::spawn(async move {
                let (stream, peer) = match split_peer(stream) {
                    Ok(split) => split,
                    Err(e) => {
                        warn!("failed to read peer address: {e}");
                        return;
                    }
                };

                match handle_connection(&gateway, stream, &peer).await {
                    Ok(bytes) => info!(%peer, bytes, "secret served"),
                    Err(e) => warn!(%peer, "connection failed: {e}"),
                }
            });
        }
    }
}

/// Bind the listening socket at `path`.
///
/// The parent directory is created (mode 0755) and a stale socket file from
/// a previous run is removed first.
pub fn bind_listener(path: &Path) -> Result<UnixListener, StartupError> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(dir)
            .map_err(|source| StartupError::RuntimeDirectory {
                path: dir.to_path_buf(),
                source,
            })?;
    }

    remove_stale_socket(path);

    UnixListener::bind(path).map_err(|source| StartupError::Listener {
        path: path.to_path_buf(),
        source,
    })
}

fn remove_stale_socket(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "failed to remove stale socket: {e}"),
    }
}
