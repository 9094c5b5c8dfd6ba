//! Typed representation of the PostgreSQL v3 wire messages this harness
//! needs to understand. Every variant carries exactly the fields the wire
//! format defines for it; message *lengths* are never stored here, they are
//! a framing artifact the codec recomputes on encode.
//!
//! Each enum is tagged by a `Type` discriminator so the very same derive
//! that gives us `serde_json` persistence (the Snapshot Codec, §4.5) also
//! gives us the in-memory equality the Step Matcher (§4.6) starts from.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub type Oid = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectType {
    #[serde(rename = "S")]
    Statement,
    #[serde(rename = "P")]
    Portal,
}

impl ObjectType {
    pub fn from_wire_byte(b: u8) -> Option<Self> {
        match b {
            b'S' => Some(ObjectType::Statement),
            b'P' => Some(ObjectType::Portal),
            _ => None,
        }
    }

    pub fn wire_byte(self) -> u8 {
        match self {
            ObjectType::Statement => b'S',
            ObjectType::Portal => b'P',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartupMessage {
    pub protocol_version: u32,
    pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub process_id: i32,
    pub secret_key: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Query {
    #[serde(rename = "Query")]
    pub query: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parse {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Query")]
    pub query: String,
    #[serde(rename = "ParameterOIDs")]
    pub parameter_oids: Vec<Oid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Describe {
    #[serde(rename = "ObjectType")]
    pub object_type: ObjectType,
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bind {
    #[serde(rename = "DestinationPortal")]
    pub destination_portal: String,
    #[serde(rename = "PreparedStatement")]
    pub prepared_statement: String,
    #[serde(rename = "ParameterFormatCodes")]
    pub parameter_format_codes: Vec<i16>,
    #[serde(rename = "Parameters")]
    pub parameters: Vec<Option<Vec<u8>>>,
    #[serde(rename = "ResultFormatCodes")]
    pub result_format_codes: Vec<i16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execute {
    #[serde(rename = "Portal")]
    pub portal: String,
    #[serde(rename = "MaxRows")]
    pub max_rows: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Close {
    #[serde(rename = "ObjectType")]
    pub object_type: ObjectType,
    #[serde(rename = "Name")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyData {
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyFail {
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum FrontendMessage {
    StartupMessage(StartupMessage),
    CancelRequest(CancelRequest),
    Query(Query),
    Parse(Parse),
    Bind(Bind),
    Describe(Describe),
    Execute(Execute),
    Sync,
    Flush,
    Close(Close),
    Terminate,
    CopyData(CopyData),
    CopyDone,
    CopyFail(CopyFail),
}

impl FrontendMessage {
    /// Name used in diagnostics when the Step Matcher has to report that the
    /// observed message isn't even the expected *variant*.
    pub fn type_name(&self) -> &'static str {
        match self {
            FrontendMessage::StartupMessage(_) => "StartupMessage",
            FrontendMessage::CancelRequest(_) => "CancelRequest",
            FrontendMessage::Query(_) => "Query",
            FrontendMessage::Parse(_) => "Parse",
            FrontendMessage::Bind(_) => "Bind",
            FrontendMessage::Describe(_) => "Describe",
            FrontendMessage::Execute(_) => "Execute",
            FrontendMessage::Sync => "Sync",
            FrontendMessage::Flush => "Flush",
            FrontendMessage::Close(_) => "Close",
            FrontendMessage::Terminate => "Terminate",
            FrontendMessage::CopyData(_) => "CopyData",
            FrontendMessage::CopyDone => "CopyDone",
            FrontendMessage::CopyFail(_) => "CopyFail",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendKeyData {
    #[serde(rename = "ProcessID")]
    pub process_id: i32,
    #[serde(rename = "SecretKey")]
    pub secret_key: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterStatus {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDescription {
    #[serde(rename = "ParameterOIDs")]
    pub parameter_oids: Vec<Oid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: Oid,
    pub table_attribute_number: i16,
    pub data_type_oid: Oid,
    pub data_type_size: i16,
    pub type_modifier: i32,
    pub format: i16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowDescription {
    pub fields: Vec<FieldDescription>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataRow {
    pub values: Vec<Option<Vec<u8>>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandComplete {
    pub command_tag: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyForQuery {
    #[serde(rename = "TxStatus")]
    pub tx_status: u8,
}

impl ReadyForQuery {
    pub const IDLE: u8 = b'I';
    pub const IN_TRANSACTION: u8 = b'T';
    pub const FAILED_TRANSACTION: u8 = b'E';
}

/// Every textual field the wire format defines for `ErrorResponse` and
/// `NoticeResponse`. PostgreSQL sends these as a sequence of
/// `(field-type-byte, nul-terminated-string)` pairs terminated by a nul
/// byte; the named fields here cover the ones a client or this harness's
/// diagnostics ever inspect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFields {
    #[serde(rename = "Severity", default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(
        rename = "SeverityUnlocalized",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub severity_unlocalized: Option<String>,
    #[serde(rename = "Code", default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(rename = "Message", default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "Detail", default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(rename = "Hint", default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(rename = "Position", default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(
        rename = "InternalPosition",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub internal_position: Option<String>,
    #[serde(
        rename = "InternalQuery",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub internal_query: Option<String>,
    #[serde(rename = "Where", default, skip_serializing_if = "Option::is_none")]
    pub where_: Option<String>,
    #[serde(rename = "SchemaName", default, skip_serializing_if = "Option::is_none")]
    pub schema_name: Option<String>,
    #[serde(rename = "TableName", default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    #[serde(rename = "ColumnName", default, skip_serializing_if = "Option::is_none")]
    pub column_name: Option<String>,
    #[serde(
        rename = "DataTypeName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub data_type_name: Option<String>,
    #[serde(
        rename = "ConstraintName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub constraint_name: Option<String>,
    #[serde(rename = "File", default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(rename = "Line", default, skip_serializing_if = "Option::is_none")]
    pub line: Option<String>,
    #[serde(rename = "Routine", default, skip_serializing_if = "Option::is_none")]
    pub routine: Option<String>,
}

impl ErrorFields {
    pub fn simple(severity: &str, code: &str, message: impl Into<String>) -> Self {
        ErrorFields {
            severity: Some(severity.to_string()),
            severity_unlocalized: Some(severity.to_string()),
            code: Some(code.to_string()),
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationResponse {
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyResponse {
    pub format: i8,
    pub column_formats: Option<u16>, // count only; per-column codes are rarely asserted on
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionCallResponse {
    pub result: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum BackendMessage {
    AuthenticationOk,
    BackendKeyData(BackendKeyData),
    ParameterStatus(ParameterStatus),
    ParseComplete,
    BindComplete,
    ParameterDescription(ParameterDescription),
    RowDescription(RowDescription),
    DataRow(DataRow),
    CommandComplete(CommandComplete),
    ReadyForQuery(ReadyForQuery),
    EmptyQueryResponse,
    NoData,
    CloseComplete,
    ErrorResponse(ErrorFields),
    NoticeResponse(ErrorFields),
    NotificationResponse(NotificationResponse),
    PortalSuspended,
    CopyInResponse(CopyResponse),
    CopyOutResponse(CopyResponse),
    CopyBothResponse(CopyResponse),
    CopyData(CopyData),
    CopyDone,
    FunctionCallResponse(FunctionCallResponse),
}

impl BackendMessage {
    pub fn type_name(&self) -> &'static str {
        match self {
            BackendMessage::AuthenticationOk => "AuthenticationOk",
            BackendMessage::BackendKeyData(_) => "BackendKeyData",
            BackendMessage::ParameterStatus(_) => "ParameterStatus",
            BackendMessage::ParseComplete => "ParseComplete",
            BackendMessage::BindComplete => "BindComplete",
            BackendMessage::ParameterDescription(_) => "ParameterDescription",
            BackendMessage::RowDescription(_) => "RowDescription",
            BackendMessage::DataRow(_) => "DataRow",
            BackendMessage::CommandComplete(_) => "CommandComplete",
            BackendMessage::ReadyForQuery(_) => "ReadyForQuery",
            BackendMessage::EmptyQueryResponse => "EmptyQueryResponse",
            BackendMessage::NoData => "NoData",
            BackendMessage::CloseComplete => "CloseComplete",
            BackendMessage::ErrorResponse(_) => "ErrorResponse",
            BackendMessage::NoticeResponse(_) => "NoticeResponse",
            BackendMessage::NotificationResponse(_) => "NotificationResponse",
            BackendMessage::PortalSuspended => "PortalSuspended",
            BackendMessage::CopyInResponse(_) => "CopyInResponse",
            BackendMessage::CopyOutResponse(_) => "CopyOutResponse",
            BackendMessage::CopyBothResponse(_) => "CopyBothResponse",
            BackendMessage::CopyData(_) => "CopyData",
            BackendMessage::CopyDone => "CopyDone",
            BackendMessage::FunctionCallResponse(_) => "FunctionCallResponse",
        }
    }
}
