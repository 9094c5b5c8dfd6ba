//! Record Proxy: authenticate one inbound client, dial the
//! upstream PostgreSQL, then splice the two sockets while writing every
//! message to the snapshot file in line form.
//!
//! `tokio_postgres` is used only to parse the upstream DSN -- this harness
//! never uses its connection/client machinery, because it needs the raw
//! socket to forward bytes it has not otherwise decoded. Past the DSN
//! parse, the upstream's own startup and every subsequent message is done
//! with `pq_proto`, exactly as the inbound side is.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use pq_proto::{
    flush, read_backend_message, read_frontend_message, write_backend_message,
    write_frontend_message, write_startup_message, BackendMessage, StartupMessage,
};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

use crate::error::SnapError;
use crate::preamble::run_forged_preamble;
use crate::reporter::Reporter;
use crate::snapshot::{encode_line, Step};

const STARTUP_PROTOCOL_VERSION_3_0: u32 = 0x0003_0000;
const SNAPSHOT_CHANNEL_DEPTH: usize = 64;

pub async fn run_proxy<C>(
    mut client_stream: C,
    upstream_dsn: &str,
    snapshot_path: &Path,
    reporter: Arc<dyn Reporter>,
    done: watch::Receiver<bool>,
) -> Result<(), SnapError>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    run_forged_preamble(&mut client_stream).await?;
    let upstream = dial_upstream(upstream_dsn).await?;

    let (client_read, client_write) = tokio::io::split(client_stream);
    let (upstream_read, upstream_write) = tokio::io::split(upstream);

    let (tx, rx) = mpsc::channel::<String>(SNAPSHOT_CHANNEL_DEPTH);
    let writer_task = tokio::spawn(run_snapshot_writer(snapshot_path.to_path_buf(), rx));

    let c2u = splice_client_to_upstream(
        client_read,
        upstream_write,
        tx.clone(),
        reporter.clone(),
        done.clone(),
    );
    let u2c = splice_upstream_to_client(upstream_read, client_write, tx.clone(), reporter, done);
    drop(tx);

    let (client_result, upstream_result) = tokio::join!(c2u, u2c);

    writer_task
        .await
        .map_err(|e| SnapError::Teardown(format!("snapshot writer task panicked: {e}")))??;

    client_result.and(upstream_result)
}

async fn dial_upstream(dsn: &str) -> Result<TcpStream, SnapError> {
    let config = tokio_postgres::config::Config::from_str(dsn)
        .map_err(|e| SnapError::Setup(format!("bad upstream dsn: {e}")))?;
    let host = config
        .get_hosts()
        .first()
        .ok_or_else(|| SnapError::Setup("upstream dsn has no host".into()))?;
    let host = match host {
        tokio_postgres::config::Host::Tcp(h) => h.clone(),
        #[cfg(unix)]
        _ => {
            return Err(SnapError::Setup(
                "unix-socket upstreams are not supported".into(),
            ))
        }
    };
    let port = config.get_ports().first().copied().unwrap_or(5432);
    let mut stream = TcpStream::connect((host.as_str(), port)).await?;

    let mut parameters = BTreeMap::new();
    parameters.insert(
        "user".to_string(),
        config.get_user().unwrap_or("postgres").to_string(),
    );
    if let Some(dbname) = config.get_dbname() {
        parameters.insert("database".to_string(), dbname.to_string());
    }
    write_startup_message(
        &mut stream,
        &StartupMessage {
            protocol_version: STARTUP_PROTOCOL_VERSION_3_0,
            parameters,
        },
    )
    .await?;

    loop {
        match read_backend_message(&mut stream)
            .await?
            .ok_or(SnapError::UpstreamEof)?
        {
            BackendMessage::ReadyForQuery(_) => break,
            _ => continue,
        }
    }
    Ok(stream)
}

async fn run_snapshot_writer(path: PathBuf, mut rx: mpsc::Receiver<String>) -> Result<(), SnapError> {
    let mut file = tokio::fs::File::create(&path).await?;
    while let Some(line) = rx.recv().await {
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
    }
    Ok(())
}

async fn splice_client_to_upstream<R, W>(
    mut read: R,
    mut write: W,
    tx: mpsc::Sender<String>,
    reporter: Arc<dyn Reporter>,
    mut done: watch::Receiver<bool>,
) -> Result<(), SnapError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            changed = done.changed() => {
                if changed.is_err() || *done.borrow() {
                    return Ok(());
                }
            }
            msg = read_frontend_message(&mut read) => {
                match msg {
                    Ok(Some(m)) => {
                        let line = encode_line(&Step::ExpectFrontend(m.clone()))?;
                        let _ = tx.send(line).await;
                        write_frontend_message(&mut write, &m).await?;
                        flush(&mut write).await?;
                    }
                    Ok(None) => {
                        if *done.borrow() {
                            return Ok(());
                        }
                        reporter.error("pgsnap: client exited early");
                        return Err(SnapError::ClientEof);
                    }
                    Err(e) => {
                        reporter.error(&format!("pgsnap: {e}"));
                    }
                }
            }
        }
    }
}

async fn splice_upstream_to_client<R, W>(
    mut read: R,
    mut write: W,
    tx: mpsc::Sender<String>,
    reporter: Arc<dyn Reporter>,
    mut done: watch::Receiver<bool>,
) -> Result<(), SnapError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            changed = done.changed() => {
                if changed.is_err() || *done.borrow() {
                    return Ok(());
                }
            }
            msg = read_backend_message(&mut read) => {
                match msg {
                    Ok(Some(m)) => {
                        let line = encode_line(&Step::SendBackend(m.clone()))?;
                        let _ = tx.send(line).await;
                        write_backend_message(&mut write, &m).await?;
                        flush(&mut write).await?;
                    }
                    Ok(None) => {
                        if *done.borrow() {
                            return Ok(());
                        }
                        reporter.error("pgsnap: upstream exited early");
                        return Err(SnapError::UpstreamEof);
                    }
                    Err(e) => {
                        reporter.error(&format!("pgsnap: {e}"));
                    }
                }
            }
        }
    }
}
