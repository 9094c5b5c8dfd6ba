//! The loopback TCP listener a session hands to the test.

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::error::SnapError;

pub struct SnapListener {
    inner: TcpListener,
    addr: std::net::SocketAddr,
}

impl SnapListener {
    pub async fn bind() -> Result<Self, SnapError> {
        let inner = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| SnapError::Setup(format!("can't open port: {e}")))?;
        let addr = inner
            .local_addr()
            .map_err(|e| SnapError::Setup(format!("can't read listener address: {e}")))?;
        Ok(SnapListener { inner, addr })
    }

    /// `postgres://user@127.0.0.1:<port>/?sslmode=disable`.
    pub fn connection_url(&self) -> String {
        format!("postgres://user@{}/?sslmode=disable", self.addr)
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        self.addr
    }

    /// Accept the one connection a session expects. Any further accept is
    /// not part of the protocol this harness speaks -- callers
    /// that keep accepting after this (there are none in this crate) must
    /// close additional connections without doing I/O on them.
    pub async fn accept(&self) -> Result<TcpStream, SnapError> {
        let (stream, _) = self.inner.accept().await?;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }

    /// Accept the one connection a session expects, or give up and return
    /// `None` the moment `done` flips to `true` -- this is what lets the
    /// timeout watcher unblock an engine task that's stuck waiting for a
    /// client that never shows up (§5: the session must never join an
    /// accept that can block forever).
    pub async fn accept_until_done(
        &self,
        done: &mut watch::Receiver<bool>,
    ) -> Result<Option<TcpStream>, SnapError> {
        if *done.borrow() {
            return Ok(None);
        }
        tokio::select! {
            biased;
            _ = done.changed() => Ok(None),
            accepted = self.inner.accept() => {
                let (stream, _) = accepted?;
                stream.set_nodelay(true).ok();
                Ok(Some(stream))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connection_url_has_expected_shape() {
        let listener = SnapListener::bind().await.unwrap();
        let url = listener.connection_url();
        assert!(url.starts_with("postgres://user@127.0.0.1:"));
        assert!(url.ends_with("/?sslmode=disable"));
    }
}
