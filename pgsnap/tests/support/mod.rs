//! A minimal fake upstream PostgreSQL server for exercising the Record
//! Proxy without a real database.
//!
//! It accepts exactly one connection, completes a trust-auth startup, then
//! answers any extended-query `select 1` conversation with the same shape
//! of responses a real server gives: `ParseComplete`, `BindComplete`, a
//! one-column `RowDescription` on `Describe`, one `DataRow` plus
//! `CommandComplete` on `Execute`, and `ReadyForQuery('I')` on `Sync`.
//! `Terminate` or a clean EOF ends the connection.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use pq_proto::{
    flush, read_backend_message, read_frontend_message, read_startup_packet,
    write_backend_message, write_frontend_message, write_startup_message, BackendKeyData,
    BackendMessage, Bind, CommandComplete, DataRow, Describe, Execute, FieldDescription,
    FrontendMessage, ObjectType, Parse, ReadyForQuery, RowDescription, StartupMessage,
    StartupPacket,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

pub struct FakeUpstream {
    pub addr: SocketAddr,
    pub dsn: String,
    task: JoinHandle<()>,
}

impl FakeUpstream {
    pub async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let dsn = format!("postgres://postgres@{addr}/postgres");
        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            serve_one(stream).await;
        });
        FakeUpstream { addr, dsn, task }
    }

    pub async fn join(self) {
        let _ = self.task.await;
    }
}

async fn serve_one(mut stream: TcpStream) {
    match read_startup_packet(&mut stream).await.unwrap() {
        StartupPacket::Startup(_) => {}
        StartupPacket::Cancel(_) => return,
    }
    write_backend_message(&mut stream, &BackendMessage::AuthenticationOk)
        .await
        .unwrap();
    write_backend_message(
        &mut stream,
        &BackendMessage::BackendKeyData(BackendKeyData {
            process_id: 4242,
            secret_key: 1,
        }),
    )
    .await
    .unwrap();
    write_backend_message(
        &mut stream,
        &BackendMessage::ReadyForQuery(ReadyForQuery {
            tx_status: ReadyForQuery::IDLE,
        }),
    )
    .await
    .unwrap();
    flush(&mut stream).await.unwrap();

    loop {
        match read_frontend_message(&mut stream).await.unwrap() {
            None | Some(FrontendMessage::Terminate) => return,
            Some(FrontendMessage::Parse(_)) => {
                write_backend_message(&mut stream, &BackendMessage::ParseComplete)
                    .await
                    .unwrap();
            }
            Some(FrontendMessage::Bind(_)) => {
                write_backend_message(&mut stream, &BackendMessage::BindComplete)
                    .await
                    .unwrap();
            }
            Some(FrontendMessage::Describe(_)) => {
                write_backend_message(
                    &mut stream,
                    &BackendMessage::RowDescription(RowDescription {
                        fields: vec![FieldDescription {
                            name: "id".into(),
                            table_oid: 0,
                            table_attribute_number: 0,
                            data_type_oid: 23,
                            data_type_size: 4,
                            type_modifier: -1,
                            format: 0,
                        }],
                    }),
                )
                .await
                .unwrap();
            }
            Some(FrontendMessage::Execute(_)) => {
                write_backend_message(
                    &mut stream,
                    &BackendMessage::DataRow(DataRow {
                        values: vec![Some(b"1".to_vec())],
                    }),
                )
                .await
                .unwrap();
                write_backend_message(
                    &mut stream,
                    &BackendMessage::CommandComplete(CommandComplete {
                        command_tag: "SELECT 1".into(),
                    }),
                )
                .await
                .unwrap();
            }
            Some(FrontendMessage::Sync) => {
                write_backend_message(
                    &mut stream,
                    &BackendMessage::ReadyForQuery(ReadyForQuery {
                        tx_status: ReadyForQuery::IDLE,
                    }),
                )
                .await
                .unwrap();
                flush(&mut stream).await.unwrap();
            }
            Some(_) => {}
        }
    }
}

/// Pull the `host:port` back out of the `postgres://user@host:port/
/// ?sslmode=disable` URL a session hands to the test without
/// pulling in a URL-parsing dependency just for tests.
pub fn addr_from_connection_url(url: &str) -> SocketAddr {
    let rest = url.strip_prefix("postgres://").unwrap();
    let (_user, rest) = rest.split_once('@').unwrap();
    let (hostport, _) = rest.split_once('/').unwrap();
    hostport.parse().unwrap()
}

/// Drive one extended-query `select id from t limit $1` conversation
/// against whatever is listening at `addr`, returning every backend
/// message observed after the startup handshake (in order) plus the still-
/// open connection, so a test can assert that a record pass and a replay
/// pass produce identical output. The connection is left open rather than
/// closed with `Terminate` here: the Record Proxy's splice loops only stop
/// on the session's `done` signal, so a test must call
/// `SnapSession::finish` while the client connection is still alive to
/// avoid racing an unexpected-EOF classification against teardown.
pub async fn run_client_select(addr: SocketAddr, limit_param: i32) -> (Vec<BackendMessage>, TcpStream) {
    let mut stream = TcpStream::connect(addr).await.unwrap();

    write_startup_message(
        &mut stream,
        &StartupMessage {
            protocol_version: 0x0003_0000,
            parameters: BTreeMap::from([
                ("user".to_string(), "test".to_string()),
                ("database".to_string(), "test".to_string()),
            ]),
        },
    )
    .await
    .unwrap();
    // AuthenticationOk, BackendKeyData, ReadyForQuery: the forged preamble,
    // not part of what the test compares (it's never persisted either).
    read_backend_message(&mut stream).await.unwrap().unwrap();
    read_backend_message(&mut stream).await.unwrap().unwrap();
    read_backend_message(&mut stream).await.unwrap().unwrap();

    write_frontend_message(
        &mut stream,
        &FrontendMessage::Parse(Parse {
            name: "".into(),
            query: "select id from t limit $1".into(),
            parameter_oids: vec![23],
        }),
    )
    .await
    .unwrap();
    write_frontend_message(
        &mut stream,
        &FrontendMessage::Bind(Bind {
            destination_portal: "".into(),
            prepared_statement: "".into(),
            parameter_format_codes: vec![0],
            parameters: vec![Some(limit_param.to_string().into_bytes())],
            result_format_codes: vec![0],
        }),
    )
    .await
    .unwrap();
    write_frontend_message(
        &mut stream,
        &FrontendMessage::Describe(Describe {
            object_type: ObjectType::Portal,
            name: "".into(),
        }),
    )
    .await
    .unwrap();
    write_frontend_message(
        &mut stream,
        &FrontendMessage::Execute(Execute {
            portal: "".into(),
            max_rows: 0,
        }),
    )
    .await
    .unwrap();
    write_frontend_message(&mut stream, &FrontendMessage::Sync)
        .await
        .unwrap();
    flush(&mut stream).await.unwrap();

    let mut observed = Vec::new();
    loop {
        let msg = read_backend_message(&mut stream).await.unwrap().unwrap();
        let is_ready = matches!(msg, BackendMessage::ReadyForQuery(_));
        observed.push(msg);
        if is_ready {
            break;
        }
    }

    (observed, stream)
}
