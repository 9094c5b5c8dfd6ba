//! Async read/write of the PostgreSQL v3 wire format over any
//! `AsyncRead`/`AsyncWrite` stream, plus the connection-layer error type.
//!
//! Keeps the usual split between a connection-layer error (io or protocol
//! violation, surfaced here as [`ConnectionError`]) and a session/query-layer
//! error built on top of it elsewhere (`send_wal.rs`, `receive_wal.rs` wrap
//! this in their own `QueryError`).

use std::collections::BTreeMap;
use std::io;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::{
    BackendKeyData, BackendMessage, Bind, CancelRequest, Close, CommandComplete, CopyData,
    CopyFail, CopyResponse, DataRow, Describe, ErrorFields, Execute, FieldDescription,
    FrontendMessage, FunctionCallResponse, NotificationResponse, ObjectType, Parse,
    ParameterDescription, ParameterStatus, Query, ReadyForQuery, RowDescription, StartupMessage,
};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl ConnectionError {
    fn protocol(msg: impl Into<String>) -> Self {
        ConnectionError::Protocol(msg.into())
    }
}

const STARTUP_PROTOCOL_VERSION_3_0: u32 = 0x0003_0000;
const SSL_REQUEST_CODE: u32 = 80_877_103;
const GSS_ENC_REQUEST_CODE: u32 = 80_877_104;
const CANCEL_REQUEST_CODE: u32 = 80_877_102;

/// What a client sends before the tagged message stream begins.
pub enum StartupPacket {
    Startup(StartupMessage),
    Cancel(CancelRequest),
}

/// Read the untagged length-prefixed packet that opens every connection.
/// SSL/GSS negotiation requests are rejected with a protocol error: this
/// harness forges a trust-auth session and never negotiates encryption.
pub async fn read_startup_packet<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<StartupPacket, ConnectionError> {
    let len = stream.read_u32().await? as usize;
    if len < 8 {
        return Err(ConnectionError::protocol(format!(
            "startup packet too short: {len}"
        )));
    }
    let mut body = vec![0u8; len - 4];
    stream.read_exact(&mut body).await?;
    let mut buf = &body[..];
    let code = buf.get_u32();

    match code {
        STARTUP_PROTOCOL_VERSION_3_0 => {
            let mut parameters = BTreeMap::new();
            loop {
                let key = read_cstr(&mut buf)?;
                if key.is_empty() {
                    break;
                }
                let value = read_cstr(&mut buf)?;
                parameters.insert(key, value);
            }
            Ok(StartupPacket::Startup(StartupMessage {
                protocol_version: code,
                parameters,
            }))
        }
        CANCEL_REQUEST_CODE => {
            if buf.remaining() < 8 {
                return Err(ConnectionError::protocol("truncated CancelRequest"));
            }
            let process_id = buf.get_i32();
            let secret_key = buf.get_i32();
            Ok(StartupPacket::Cancel(CancelRequest {
                process_id,
                secret_key,
            }))
        }
        SSL_REQUEST_CODE => Err(ConnectionError::protocol(
            "SSL negotiation is not supported by this harness",
        )),
        GSS_ENC_REQUEST_CODE => Err(ConnectionError::protocol(
            "GSS encryption negotiation is not supported by this harness",
        )),
        other => Err(ConnectionError::protocol(format!(
            "unsupported startup code {other}"
        ))),
    }
}

/// Write a real `StartupMessage` to a stream, used when the Record Proxy
/// dials the upstream server and performs its own startup.
pub async fn write_startup_message<W: AsyncWrite + Unpin>(
    stream: &mut W,
    msg: &StartupMessage,
) -> Result<(), ConnectionError> {
    let mut payload = BytesMut::new();
    payload.put_u32(msg.protocol_version);
    for (k, v) in &msg.parameters {
        payload.put_slice(k.as_bytes());
        payload.put_u8(0);
        payload.put_slice(v.as_bytes());
        payload.put_u8(0);
    }
    payload.put_u8(0);

    let mut out = BytesMut::with_capacity(payload.len() + 4);
    out.put_u32((payload.len() + 4) as u32);
    out.extend_from_slice(&payload);
    stream.write_all(&out).await?;
    stream.flush().await?;
    Ok(())
}

fn read_cstr(buf: &mut &[u8]) -> Result<String, ConnectionError> {
    let nul = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ConnectionError::protocol("missing NUL terminator"))?;
    let s = String::from_utf8_lossy(&buf[..nul]).into_owned();
    buf.advance(nul + 1);
    Ok(s)
}

fn put_cstr(out: &mut BytesMut, s: &str) {
    out.put_slice(s.as_bytes());
    out.put_u8(0);
}

fn put_bytes_with_len(out: &mut BytesMut, data: &Option<Vec<u8>>) {
    match data {
        None => out.put_i32(-1),
        Some(d) => {
            out.put_i32(d.len() as i32);
            out.put_slice(d);
        }
    }
}

async fn read_tagged_header<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<Option<(u8, BytesMut)>, ConnectionError> {
    let mut tag = [0u8; 1];
    match stream.read_exact(&mut tag).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = stream.read_u32().await?;
    if len < 4 {
        return Err(ConnectionError::protocol(format!(
            "message length {len} below minimum"
        )));
    }
    let mut body = BytesMut::with_capacity(len as usize - 4);
    body.resize(len as usize - 4, 0);
    stream.read_exact(&mut body).await?;
    Ok(Some((tag[0], body)))
}

/// Read one message from the client. `Ok(None)` means the peer closed the
/// connection cleanly at a message boundary.
pub async fn read_frontend_message<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<Option<FrontendMessage>, ConnectionError> {
    let Some((tag, mut body)) = read_tagged_header(stream).await? else {
        return Ok(None);
    };

    let msg = match tag {
        b'Q' => FrontendMessage::Query(Query {
            query: read_cstr(&mut &body[..])?,
        }),
        b'P' => {
            let mut b = &body[..];
            let name = read_cstr(&mut b)?;
            let query = read_cstr(&mut b)?;
            let nparams = b.get_i16() as usize;
            let mut parameter_oids = Vec::with_capacity(nparams);
            for _ in 0..nparams {
                parameter_oids.push(b.get_u32());
            }
            FrontendMessage::Parse(Parse {
                name,
                query,
                parameter_oids,
            })
        }
        b'B' => {
            let mut b = &body[..];
            let destination_portal = read_cstr(&mut b)?;
            let prepared_statement = read_cstr(&mut b)?;
            let n_format_codes = b.get_i16() as usize;
            let mut parameter_format_codes = Vec::with_capacity(n_format_codes);
            for _ in 0..n_format_codes {
                parameter_format_codes.push(b.get_i16());
            }
            let n_params = b.get_i16() as usize;
            let mut parameters = Vec::with_capacity(n_params);
            for _ in 0..n_params {
                let len = b.get_i32();
                if len < 0 {
                    parameters.push(None);
                } else {
                    let mut v = vec![0u8; len as usize];
                    v.copy_from_slice(&b[..len as usize]);
                    b.advance(len as usize);
                    parameters.push(Some(v));
                }
            }
            let n_result_codes = b.get_i16() as usize;
            let mut result_format_codes = Vec::with_capacity(n_result_codes);
            for _ in 0..n_result_codes {
                result_format_codes.push(b.get_i16());
            }
            FrontendMessage::Bind(Bind {
                destination_portal,
                prepared_statement,
                parameter_format_codes,
                parameters,
                result_format_codes,
            })
        }
        b'D' => {
            let mut b = &body[..];
            let object_type_byte = b.get_u8();
            let object_type = ObjectType::from_wire_byte(object_type_byte)
                .ok_or_else(|| ConnectionError::protocol("bad Describe object type"))?;
            let name = read_cstr(&mut b)?;
            FrontendMessage::Describe(Describe { object_type, name })
        }
        b'E' => {
            let mut b = &body[..];
            let portal = read_cstr(&mut b)?;
            let max_rows = b.get_i32();
            FrontendMessage::Execute(Execute { portal, max_rows })
        }
        b'H' => FrontendMessage::Flush,
        b'S' => FrontendMessage::Sync,
        b'C' => {
            let mut b = &body[..];
            let object_type_byte = b.get_u8();
            let object_type = ObjectType::from_wire_byte(object_type_byte)
                .ok_or_else(|| ConnectionError::protocol("bad Close object type"))?;
            let name = read_cstr(&mut b)?;
            FrontendMessage::Close(Close { object_type, name })
        }
        b'X' => FrontendMessage::Terminate,
        b'd' => FrontendMessage::CopyData(CopyData {
            data: body.to_vec(),
        }),
        b'c' => FrontendMessage::CopyDone,
        b'f' => FrontendMessage::CopyFail(CopyFail {
            message: read_cstr(&mut &body[..])?,
        }),
        other => {
            return Err(ConnectionError::protocol(format!(
                "unknown frontend message tag '{}'",
                other as char
            )))
        }
    };
    Ok(Some(msg))
}

/// Read one message from the server (or a real upstream PostgreSQL).
pub async fn read_backend_message<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<Option<BackendMessage>, ConnectionError> {
    let Some((tag, mut body)) = read_tagged_header(stream).await? else {
        return Ok(None);
    };

    let msg = match tag {
        b'R' => {
            let mut b = &body[..];
            let auth_type = b.get_i32();
            if auth_type != 0 {
                return Err(ConnectionError::protocol(format!(
                    "unsupported authentication type {auth_type}, only trust (0) is supported"
                )));
            }
            BackendMessage::AuthenticationOk
        }
        b'K' => {
            let mut b = &body[..];
            BackendMessage::BackendKeyData(BackendKeyData {
                process_id: b.get_i32(),
                secret_key: b.get_i32(),
            })
        }
        b'S' => {
            let mut b = &body[..];
            let name = read_cstr(&mut b)?;
            let value = read_cstr(&mut b)?;
            BackendMessage::ParameterStatus(ParameterStatus { name, value })
        }
        b'1' => BackendMessage::ParseComplete,
        b'2' => BackendMessage::BindComplete,
        b't' => {
            let mut b = &body[..];
            let n = b.get_i16() as usize;
            let mut parameter_oids = Vec::with_capacity(n);
            for _ in 0..n {
                parameter_oids.push(b.get_u32());
            }
            BackendMessage::ParameterDescription(ParameterDescription { parameter_oids })
        }
        b'T' => {
            let mut b = &body[..];
            let n = b.get_i16() as usize;
            let mut fields = Vec::with_capacity(n);
            for _ in 0..n {
                let name = read_cstr(&mut b)?;
                let table_oid = b.get_u32();
                let table_attribute_number = b.get_i16();
                let data_type_oid = b.get_u32();
                let data_type_size = b.get_i16();
                let type_modifier = b.get_i32();
                let format = b.get_i16();
                fields.push(FieldDescription {
                    name,
                    table_oid,
                    table_attribute_number,
                    data_type_oid,
                    data_type_size,
                    type_modifier,
                    format,
                });
            }
            BackendMessage::RowDescription(RowDescription { fields })
        }
        b'D' => {
            let mut b = &body[..];
            let n = b.get_i16() as usize;
            let mut values = Vec::with_capacity(n);
            for _ in 0..n {
                let len = b.get_i32();
                if len < 0 {
                    values.push(None);
                } else {
                    let mut v = vec![0u8; len as usize];
                    v.copy_from_slice(&b[..len as usize]);
                    b.advance(len as usize);
                    values.push(Some(v));
                }
            }
            BackendMessage::DataRow(DataRow { values })
        }
        b'C' => BackendMessage::CommandComplete(CommandComplete {
            command_tag: read_cstr(&mut &body[..])?,
        }),
        b'Z' => {
            let mut b = &body[..];
            BackendMessage::ReadyForQuery(ReadyForQuery {
                tx_status: b.get_u8(),
            })
        }
        b'I' => BackendMessage::EmptyQueryResponse,
        b'n' => BackendMessage::NoData,
        b'3' => BackendMessage::CloseComplete,
        b'E' => BackendMessage::ErrorResponse(read_error_fields(&body)?),
        b'N' => BackendMessage::NoticeResponse(read_error_fields(&body)?),
        b'A' => {
            let mut b = &body[..];
            let process_id = b.get_i32();
            let channel = read_cstr(&mut b)?;
            let payload = read_cstr(&mut b)?;
            BackendMessage::NotificationResponse(NotificationResponse {
                process_id,
                channel,
                payload,
            })
        }
        b's' => BackendMessage::PortalSuspended,
        b'G' => BackendMessage::CopyInResponse(read_copy_response(&body)?),
        b'H' => BackendMessage::CopyOutResponse(read_copy_response(&body)?),
        b'W' => BackendMessage::CopyBothResponse(read_copy_response(&body)?),
        b'd' => BackendMessage::CopyData(CopyData {
            data: body.to_vec(),
        }),
        b'c' => BackendMessage::CopyDone,
        b'V' => {
            let mut b = &body[..];
            let len = b.get_i32();
            let result = if len < 0 {
                None
            } else {
                Some(b[..len as usize].to_vec())
            };
            BackendMessage::FunctionCallResponse(FunctionCallResponse { result })
        }
        other => {
            return Err(ConnectionError::protocol(format!(
                "unknown backend message tag '{}'",
                other as char
            )))
        }
    };
    Ok(Some(msg))
}

fn read_copy_response(body: &BytesMut) -> Result<CopyResponse, ConnectionError> {
    let mut b = &body[..];
    let format = b.get_i8();
    let n = b.get_i16();
    // Per-column format codes are consumed but not retained: no known
    // client driver distinguishes on them for matching purposes.
    for _ in 0..n {
        let _ = b.get_i16();
    }
    Ok(CopyResponse {
        format,
        column_formats: Some(n as u16),
    })
}

fn read_error_fields(body: &BytesMut) -> Result<ErrorFields, ConnectionError> {
    let mut b = &body[..];
    let mut fields = ErrorFields::default();
    loop {
        if b.is_empty() {
            break;
        }
        let code = b.get_u8();
        if code == 0 {
            break;
        }
        let value = read_cstr(&mut b)?;
        match code {
            b'S' => fields.severity = Some(value),
            b'V' => fields.severity_unlocalized = Some(value),
            b'C' => fields.code = Some(value),
            b'M' => fields.message = Some(value),
            b'D' => fields.detail = Some(value),
            b'H' => fields.hint = Some(value),
            b'P' => fields.position = Some(value),
            b'p' => fields.internal_position = Some(value),
            b'q' => fields.internal_query = Some(value),
            b'W' => fields.where_ = Some(value),
            b's' => fields.schema_name = Some(value),
            b't' => fields.table_name = Some(value),
            b'c' => fields.column_name = Some(value),
            b'd' => fields.data_type_name = Some(value),
            b'n' => fields.constraint_name = Some(value),
            b'F' => fields.file = Some(value),
            b'L' => fields.line = Some(value),
            b'R' => fields.routine = Some(value),
            _ => {} // unknown field code, ignore per §4.5 reader relaxation
        }
    }
    Ok(fields)
}

fn put_error_fields(out: &mut BytesMut, fields: &ErrorFields) {
    let mut push = |code: u8, v: &Option<String>| {
        if let Some(v) = v {
            out.put_u8(code);
            put_cstr(out, v);
        }
    };
    push(b'S', &fields.severity);
    push(b'V', &fields.severity_unlocalized);
    push(b'C', &fields.code);
    push(b'M', &fields.message);
    push(b'D', &fields.detail);
    push(b'H', &fields.hint);
    push(b'P', &fields.position);
    push(b'p', &fields.internal_position);
    push(b'q', &fields.internal_query);
    push(b'W', &fields.where_);
    push(b's', &fields.schema_name);
    push(b't', &fields.table_name);
    push(b'c', &fields.column_name);
    push(b'd', &fields.data_type_name);
    push(b'n', &fields.constraint_name);
    push(b'F', &fields.file);
    push(b'L', &fields.line);
    push(b'R', &fields.routine);
    out.put_u8(0);
}

fn encode_frontend_message(msg: &FrontendMessage) -> (u8, BytesMut) {
    let mut body = BytesMut::new();
    let tag = match msg {
        FrontendMessage::StartupMessage(_) | FrontendMessage::CancelRequest(_) => {
            unreachable!("startup-phase messages have no tag byte, use write_startup_message")
        }
        FrontendMessage::Query(q) => {
            put_cstr(&mut body, &q.query);
            b'Q'
        }
        FrontendMessage::Parse(p) => {
            put_cstr(&mut body, &p.name);
            put_cstr(&mut body, &p.query);
            body.put_i16(p.parameter_oids.len() as i16);
            for oid in &p.parameter_oids {
                body.put_u32(*oid);
            }
            b'P'
        }
        FrontendMessage::Bind(bnd) => {
            put_cstr(&mut body, &bnd.destination_portal);
            put_cstr(&mut body, &bnd.prepared_statement);
            body.put_i16(bnd.parameter_format_codes.len() as i16);
            for c in &bnd.parameter_format_codes {
                body.put_i16(*c);
            }
            body.put_i16(bnd.parameters.len() as i16);
            for p in &bnd.parameters {
                put_bytes_with_len(&mut body, p);
            }
            body.put_i16(bnd.result_format_codes.len() as i16);
            for c in &bnd.result_format_codes {
                body.put_i16(*c);
            }
            b'B'
        }
        FrontendMessage::Describe(d) => {
            body.put_u8(d.object_type.wire_byte());
            put_cstr(&mut body, &d.name);
            b'D'
        }
        FrontendMessage::Execute(e) => {
            put_cstr(&mut body, &e.portal);
            body.put_i32(e.max_rows);
            b'E'
        }
        FrontendMessage::Flush => b'H',
        FrontendMessage::Sync => b'S',
        FrontendMessage::Close(c) => {
            body.put_u8(c.object_type.wire_byte());
            put_cstr(&mut body, &c.name);
            b'C'
        }
        FrontendMessage::Terminate => b'X',
        FrontendMessage::CopyData(d) => {
            body.put_slice(&d.data);
            b'd'
        }
        FrontendMessage::CopyDone => b'c',
        FrontendMessage::CopyFail(f) => {
            put_cstr(&mut body, &f.message);
            b'f'
        }
    };
    (tag, body)
}

fn encode_backend_message(msg: &BackendMessage) -> (u8, BytesMut) {
    let mut body = BytesMut::new();
    let tag = match msg {
        BackendMessage::AuthenticationOk => {
            body.put_i32(0);
            b'R'
        }
        BackendMessage::BackendKeyData(k) => {
            body.put_i32(k.process_id);
            body.put_i32(k.secret_key);
            b'K'
        }
        BackendMessage::ParameterStatus(p) => {
            put_cstr(&mut body, &p.name);
            put_cstr(&mut body, &p.value);
            b'S'
        }
        BackendMessage::ParseComplete => b'1',
        BackendMessage::BindComplete => b'2',
        BackendMessage::ParameterDescription(p) => {
            body.put_i16(p.parameter_oids.len() as i16);
            for oid in &p.parameter_oids {
                body.put_u32(*oid);
            }
            b't'
        }
        BackendMessage::RowDescription(r) => {
            body.put_i16(r.fields.len() as i16);
            for f in &r.fields {
                put_cstr(&mut body, &f.name);
                body.put_u32(f.table_oid);
                body.put_i16(f.table_attribute_number);
                body.put_u32(f.data_type_oid);
                body.put_i16(f.data_type_size);
                body.put_i32(f.type_modifier);
                body.put_i16(f.format);
            }
            b'T'
        }
        BackendMessage::DataRow(r) => {
            body.put_i16(r.values.len() as i16);
            for v in &r.values {
                put_bytes_with_len(&mut body, v);
            }
            b'D'
        }
        BackendMessage::CommandComplete(c) => {
            put_cstr(&mut body, &c.command_tag);
            b'C'
        }
        BackendMessage::ReadyForQuery(r) => {
            body.put_u8(r.tx_status);
            b'Z'
        }
        BackendMessage::EmptyQueryResponse => b'I',
        BackendMessage::NoData => b'n',
        BackendMessage::CloseComplete => b'3',
        BackendMessage::ErrorResponse(f) => {
            put_error_fields(&mut body, f);
            b'E'
        }
        BackendMessage::NoticeResponse(f) => {
            put_error_fields(&mut body, f);
            b'N'
        }
        BackendMessage::NotificationResponse(n) => {
            body.put_i32(n.process_id);
            put_cstr(&mut body, &n.channel);
            put_cstr(&mut body, &n.payload);
            b'A'
        }
        BackendMessage::PortalSuspended => b's',
        BackendMessage::CopyInResponse(c) => {
            put_copy_response(&mut body, c);
            b'G'
        }
        BackendMessage::CopyOutResponse(c) => {
            put_copy_response(&mut body, c);
            b'H'
        }
        BackendMessage::CopyBothResponse(c) => {
            put_copy_response(&mut body, c);
            b'W'
        }
        BackendMessage::CopyData(d) => {
            body.put_slice(&d.data);
            b'd'
        }
        BackendMessage::CopyDone => b'c',
        BackendMessage::FunctionCallResponse(f) => {
            put_bytes_with_len(&mut body, &f.result);
            b'V'
        }
    };
    (tag, body)
}

fn put_copy_response(body: &mut BytesMut, c: &CopyResponse) {
    body.put_i8(c.format);
    let n = c.column_formats.unwrap_or(0);
    body.put_i16(n as i16);
    for _ in 0..n {
        body.put_i16(c.format as i16);
    }
}

async fn write_tagged<W: AsyncWrite + Unpin>(
    stream: &mut W,
    tag: u8,
    body: BytesMut,
) -> Result<(), ConnectionError> {
    let mut out = BytesMut::with_capacity(body.len() + 5);
    out.put_u8(tag);
    out.put_u32((body.len() + 4) as u32);
    out.extend_from_slice(&body);
    stream.write_all(&out).await?;
    Ok(())
}

pub async fn write_frontend_message<W: AsyncWrite + Unpin>(
    stream: &mut W,
    msg: &FrontendMessage,
) -> Result<(), ConnectionError> {
    if matches!(
        msg,
        FrontendMessage::StartupMessage(_) | FrontendMessage::CancelRequest(_)
    ) {
        return Err(ConnectionError::protocol(
            "StartupMessage/CancelRequest must be sent with write_startup_message",
        ));
    }
    let (tag, body) = encode_frontend_message(msg);
    write_tagged(stream, tag, body).await
}

pub async fn write_backend_message<W: AsyncWrite + Unpin>(
    stream: &mut W,
    msg: &BackendMessage,
) -> Result<(), ConnectionError> {
    let (tag, body) = encode_backend_message(msg);
    write_tagged(stream, tag, body).await
}

pub async fn flush<W: AsyncWrite + Unpin>(stream: &mut W) -> Result<(), ConnectionError> {
    stream.flush().await?;
    Ok(())
}
