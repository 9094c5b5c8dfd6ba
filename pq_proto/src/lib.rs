//! Typed PostgreSQL v3 wire-protocol messages and their async wire codec.
//!
//! A small, dependency-light type library that both the harness's replay
//! engine and its record proxy build on, kept separate so the message
//! types (and their `serde` round trip) can be unit tested in isolation
//! from any socket.

pub mod framed;
pub mod message;

pub use framed::{
    read_backend_message, read_frontend_message, read_startup_packet, write_backend_message,
    write_frontend_message, write_startup_message, ConnectionError, StartupPacket,
};
pub use message::{
    BackendKeyData, BackendMessage, Bind, CancelRequest, Close, CommandComplete, CopyData,
    CopyFail, CopyResponse, DataRow, Describe, ErrorFields, Execute, FieldDescription,
    FrontendMessage, FunctionCallResponse, NotificationResponse, ObjectType, Oid, Parse,
    ParameterDescription, ParameterStatus, Query, ReadyForQuery, RowDescription, StartupMessage,
};
