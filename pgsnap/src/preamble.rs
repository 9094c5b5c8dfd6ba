//! The forged startup handshake shared by the Replay Engine and the Record
//! Proxy: read one real `StartupMessage`, answer with a
//! trust-auth triple, never negotiate SCRAM or TLS.

use pq_proto::{
    read_startup_packet, write_backend_message, BackendKeyData, BackendMessage, ReadyForQuery,
    StartupPacket,
};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::SnapError;

/// Consume the client's `StartupMessage` and answer `AuthenticationOk`,
/// `BackendKeyData(0, 0)`, `ReadyForQuery('I')`. A `CancelRequest` here is
/// rejected: cancel side-channels are out of scope.
pub async fn run_forged_preamble<S>(stream: &mut S) -> Result<(), SnapError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match read_startup_packet(stream).await? {
        StartupPacket::Startup(_) => {}
        StartupPacket::Cancel(_) => {
            return Err(SnapError::Setup(
                "cancel request received in place of a startup message".into(),
            ))
        }
    }

    write_backend_message(stream, &BackendMessage::AuthenticationOk).await?;
    write_backend_message(
        stream,
        &BackendMessage::BackendKeyData(BackendKeyData {
            process_id: 0,
            secret_key: 0,
        }),
    )
    .await?;
    write_backend_message(
        stream,
        &BackendMessage::ReadyForQuery(ReadyForQuery {
            tx_status: ReadyForQuery::IDLE,
        }),
    )
    .await?;
    pq_proto::flush(stream).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pq_proto::{write_startup_message, StartupMessage};
    use std::collections::BTreeMap;
    use tokio::io::duplex;

    #[tokio::test]
    async fn preamble_answers_with_trust_auth_triple() {
        let (mut client, mut server) = duplex(4096);

        let client_task = tokio::spawn(async move {
            let startup = StartupMessage {
                protocol_version: 0x0003_0000,
                parameters: BTreeMap::from([("user".to_string(), "alice".to_string())]),
            };
            write_startup_message(&mut client, &startup).await.unwrap();

            let auth = pq_proto::read_backend_message(&mut client)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(auth, BackendMessage::AuthenticationOk);
            let key = pq_proto::read_backend_message(&mut client)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(
                key,
                BackendMessage::BackendKeyData(BackendKeyData {
                    process_id: 0,
                    secret_key: 0
                })
            );
            let ready = pq_proto::read_backend_message(&mut client)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(
                ready,
                BackendMessage::ReadyForQuery(ReadyForQuery {
                    tx_status: ReadyForQuery::IDLE
                })
            );
        });

        run_forged_preamble(&mut server).await.unwrap();
        client_task.await.unwrap();
    }
}
