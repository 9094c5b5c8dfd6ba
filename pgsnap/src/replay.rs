//! Replay Engine: run a recorded script against one
//! accepted connection, reporting the first mismatch.
//!
//! States `INIT → AUTH → READY → STEPPING → (DONE | ERROR)` map onto this
//! function directly: AUTH is [`crate::preamble::run_forged_preamble`],
//! READY/STEPPING is the loop over `steps`, ERROR is [`handle_mismatch`].

use pq_proto::{
    flush, read_frontend_message, write_backend_message, BackendMessage, ErrorFields,
    FrontendMessage, ReadyForQuery,
};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::SnapError;
use crate::matcher::match_step;
use crate::preamble::run_forged_preamble;
use crate::reporter::Reporter;
use crate::snapshot::Step;

/// Frontend messages read and discarded while hunting for the next `Sync`
/// boundary after a mismatch.
const DRAIN_BUDGET: usize = 10;

pub async fn run_replay<S>(
    stream: &mut S,
    steps: Vec<Step>,
    reporter: &dyn Reporter,
) -> Result<(), SnapError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    run_forged_preamble(stream).await?;

    for step in steps {
        match step {
            Step::SendBackend(msg) => {
                write_backend_message(stream, &msg).await?;
                flush(stream).await?;
            }
            Step::ExpectFrontend(want) => {
                let got = match read_frontend_message(stream).await? {
                    Some(got) => got,
                    None => {
                        reporter.error("pgsnap: client exited early");
                        return Err(SnapError::ClientEof);
                    }
                };
                if let Err(diagnostic) = match_step(&got, &want) {
                    return handle_mismatch(stream, reporter, diagnostic).await;
                }
            }
        }
    }

    Ok(())
}

/// Bring the client's extended-query state back to a clean point, inject
/// the diagnostic as an ordinary SQL error, and report the test failure.
async fn handle_mismatch<S>(
    stream: &mut S,
    reporter: &dyn Reporter,
    diagnostic: String,
) -> Result<(), SnapError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    reporter.error(&format!("pgsnap: step mismatch: {diagnostic}"));

    for _ in 0..DRAIN_BUDGET {
        match read_frontend_message(stream).await {
            Ok(Some(FrontendMessage::Sync)) => break,
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => break,
        }
    }

    let message = format!("pgsnap:\n{diagnostic}");
    write_backend_message(
        stream,
        &BackendMessage::ErrorResponse(ErrorFields::simple("ERROR", "99999", message)),
    )
    .await?;
    write_backend_message(
        stream,
        &BackendMessage::ReadyForQuery(ReadyForQuery {
            tx_status: ReadyForQuery::IDLE,
        }),
    )
    .await?;
    flush(stream).await?;

    Err(SnapError::StepMismatch(diagnostic))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::CollectingReporter;
    use pq_proto::{read_backend_message, write_startup_message, Parse, Query, StartupMessage};
    use std::collections::BTreeMap;
    use tokio::io::duplex;

    async fn client_startup<S: AsyncRead + AsyncWrite + Unpin>(client: &mut S) {
        write_startup_message(
            client,
            &StartupMessage {
                protocol_version: 0x0003_0000,
                parameters: BTreeMap::from([("user".to_string(), "alice".to_string())]),
            },
        )
        .await
        .unwrap();
        // AuthenticationOk, BackendKeyData, ReadyForQuery
        read_backend_message(client).await.unwrap().unwrap();
        read_backend_message(client).await.unwrap().unwrap();
        read_backend_message(client).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn s1_replay_happy_path() {
        let (mut client, mut server) = duplex(8192);
        let steps = vec![
            Step::SendBackend(BackendMessage::ReadyForQuery(ReadyForQuery {
                tx_status: ReadyForQuery::IDLE,
            })),
            Step::ExpectFrontend(FrontendMessage::Terminate),
        ];
        let reporter = CollectingReporter::new();

        let client_task = tokio::spawn(async move {
            client_startup(&mut client).await;
            let extra_ready = read_backend_message(&mut client).await.unwrap().unwrap();
            assert_eq!(
                extra_ready,
                BackendMessage::ReadyForQuery(ReadyForQuery {
                    tx_status: ReadyForQuery::IDLE
                })
            );
            pq_proto::write_frontend_message(&mut client, &FrontendMessage::Terminate)
                .await
                .unwrap();
        });

        run_replay(&mut server, steps, &reporter).await.unwrap();
        client_task.await.unwrap();
        assert!(!reporter.failed());
    }

    #[tokio::test]
    async fn s2_relaxed_parse_match_does_not_fail() {
        let (mut client, mut server) = duplex(8192);
        let steps = vec![Step::ExpectFrontend(FrontendMessage::Parse(Parse {
            name: "lrupsc_1".into(),
            query: "select id from mytable limit $1".into(),
            parameter_oids: vec![23],
        }))];
        let reporter = CollectingReporter::new();

        let client_task = tokio::spawn(async move {
            client_startup(&mut client).await;
            pq_proto::write_frontend_message(
                &mut client,
                &FrontendMessage::Parse(Parse {
                    name: "lrupsc_42".into(),
                    query: "select id from mytable limit $1".into(),
                    parameter_oids: vec![23],
                }),
            )
            .await
            .unwrap();
        });

        run_replay(&mut server, steps, &reporter).await.unwrap();
        client_task.await.unwrap();
        assert!(!reporter.failed());
    }

    #[tokio::test]
    async fn s3_query_mismatch_injects_error_and_fails_test() {
        let (mut client, mut server) = duplex(8192);
        let steps = vec![Step::ExpectFrontend(FrontendMessage::Parse(Parse {
            name: "lrupsc_1".into(),
            query: "select id from mytable limit $1".into(),
            parameter_oids: vec![23],
        }))];
        let reporter = CollectingReporter::new();

        let client_task = tokio::spawn(async move {
            client_startup(&mut client).await;
            pq_proto::write_frontend_message(
                &mut client,
                &FrontendMessage::Parse(Parse {
                    name: "lrupsc_1".into(),
                    query: "select id from mytable limit 7".into(),
                    parameter_oids: vec![23],
                }),
            )
            .await
            .unwrap();
            pq_proto::write_frontend_message(&mut client, &FrontendMessage::Sync)
                .await
                .unwrap();

            let err = read_backend_message(&mut client).await.unwrap().unwrap();
            match err {
                BackendMessage::ErrorResponse(fields) => {
                    assert_eq!(fields.code.as_deref(), Some("99999"));
                    assert!(fields
                        .message
                        .as_deref()
                        .unwrap()
                        .starts_with("pgsnap:\nmsg => query:"));
                }
                other => panic!("expected ErrorResponse, got {other:?}"),
            }
            let ready = read_backend_message(&mut client).await.unwrap().unwrap();
            assert_eq!(
                ready,
                BackendMessage::ReadyForQuery(ReadyForQuery {
                    tx_status: ReadyForQuery::IDLE
                })
            );
        });

        let result = run_replay(&mut server, steps, &reporter).await;
        assert!(matches!(result, Err(SnapError::StepMismatch(_))));
        client_task.await.unwrap();
        assert!(reporter.failed());
    }

    #[tokio::test]
    async fn client_eof_before_expected_message_is_reported() {
        let (client, mut server) = duplex(8192);
        let steps = vec![Step::ExpectFrontend(FrontendMessage::Query(Query {
            query: "select 1".into(),
        }))];
        let reporter = CollectingReporter::new();

        let client_task = tokio::spawn(async move {
            let mut client = client;
            client_startup(&mut client).await;
            drop(client);
        });

        let result = run_replay(&mut server, steps, &reporter).await;
        assert!(matches!(result, Err(SnapError::ClientEof)));
        client_task.await.unwrap();
        assert_eq!(reporter.first_message(), Some("pgsnap: client exited early".to_string()));
    }
}
