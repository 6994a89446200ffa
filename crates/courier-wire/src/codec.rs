// Line-oriented text codec: a control line, optionally followed by a sized body.
//
// Decoding never consumes a partial operation. A control line is re-parsed
// until its announced body has fully arrived, then line and body are split
// off together.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::op::{ClientOp, ConnectInfo, HeaderList, ServerInfo, ServerOp};
use crate::{Error, Result};

pub const MAX_CONTROL_LINE: usize = 4096;
pub const HEADER_VERSION_LINE: &str = "NATS/1.0";
const CRLF: &[u8] = b"\r\n";

/// Broker side: decodes client operations, encodes server operations.
#[derive(Debug, Clone)]
pub struct ServerCodec {
    max_payload: usize,
}

impl ServerCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Decoder for ServerCodec {
    type Item = ClientOp;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ClientOp>> {
        decode_client_op(src, self.max_payload)
    }
}

impl Encoder<ServerOp> for ServerCodec {
    type Error = Error;

    fn encode(&mut self, item: ServerOp, dst: &mut BytesMut) -> Result<()> {
        encode_server_op(&item, dst)
    }
}

/// Client side: decodes server operations, encodes client operations.
#[derive(Debug, Clone)]
pub struct ClientCodec {
    max_payload: usize,
}

impl ClientCodec {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Decoder for ClientCodec {
    type Item = ServerOp;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<ServerOp>> {
        decode_server_op(src, self.max_payload)
    }
}

impl Encoder<ClientOp> for ClientCodec {
    type Error = Error;

    fn encode(&mut self, item: ClientOp, dst: &mut BytesMut) -> Result<()> {
        encode_client_op(&item, dst)
    }
}

// Returns the control line (without CR/LF) and the bytes it occupies.
fn control_line(buf: &BytesMut) -> Result<Option<(usize, String)>> {
    let Some(newline) = buf.iter().position(|byte| *byte == b'\n') else {
        if buf.len() > MAX_CONTROL_LINE {
            return Err(Error::LineTooLong(MAX_CONTROL_LINE));
        }
        return Ok(None);
    };
    if newline > MAX_CONTROL_LINE {
        return Err(Error::LineTooLong(MAX_CONTROL_LINE));
    }
    let mut line = &buf[..newline];
    if let Some(stripped) = line.strip_suffix(b"\r") {
        line = stripped;
    }
    let line = std::str::from_utf8(line).map_err(|_| Error::InvalidUtf8)?;
    Ok(Some((newline + 1, line.to_string())))
}

fn split_op(line: &str) -> (String, &str) {
    let line = line.trim_start();
    match line.find(|c: char| c.is_ascii_whitespace()) {
        Some(index) => (line[..index].to_ascii_uppercase(), line[index..].trim()),
        None => (line.to_ascii_uppercase(), ""),
    }
}

fn parse_size(op: &'static str, value: &str) -> Result<usize> {
    value.parse().map_err(|_| Error::InvalidArguments {
        op,
        reason: format!("invalid size {value:?}"),
    })
}

fn check_payload(size: usize, max: usize) -> Result<()> {
    if size > max {
        return Err(Error::PayloadTooLarge { size, max });
    }
    Ok(())
}

// Split `line_len + body_len + CRLF` off the buffer once it is all there.
fn take_body(src: &mut BytesMut, line_len: usize, body_len: usize) -> Result<Option<Bytes>> {
    let needed = line_len + body_len + CRLF.len();
    if src.len() < needed {
        src.reserve(needed - src.len());
        return Ok(None);
    }
    if &src[line_len + body_len..needed] != CRLF {
        return Err(Error::MissingTerminator);
    }
    let mut frame = src.split_to(needed);
    frame.advance(line_len);
    frame.truncate(body_len);
    Ok(Some(frame.freeze()))
}

struct Sized<'a> {
    subject: &'a str,
    sid: Option<&'a str>,
    reply: Option<&'a str>,
    header_len: usize,
    total_len: usize,
}

// Arguments of PUB/HPUB/MSG/HMSG: `subject [sid] [reply] [#hdr] #total`.
fn parse_sized<'a>(
    op: &'static str,
    args: &'a str,
    with_sid: bool,
    with_headers: bool,
) -> Result<Sized<'a>> {
    let parts: Vec<&str> = args.split_ascii_whitespace().collect();
    let fixed = 1 + usize::from(with_sid) + usize::from(with_headers) + 1;
    if parts.len() != fixed && parts.len() != fixed + 1 {
        return Err(Error::InvalidArguments {
            op,
            reason: format!("expected {fixed} or {} arguments", fixed + 1),
        });
    }
    let has_reply = parts.len() == fixed + 1;
    let mut iter = parts.into_iter();
    let subject = iter.next().unwrap_or_default();
    let sid = if with_sid { iter.next() } else { None };
    let reply = if has_reply { iter.next() } else { None };
    let header_len = if with_headers {
        parse_size(op, iter.next().unwrap_or_default())?
    } else {
        0
    };
    let total_len = parse_size(op, iter.next().unwrap_or_default())?;
    if header_len > total_len {
        return Err(Error::InvalidArguments {
            op,
            reason: format!("header size {header_len} exceeds total size {total_len}"),
        });
    }
    Ok(Sized {
        subject,
        sid,
        reply,
        header_len,
        total_len,
    })
}

pub fn decode_client_op(src: &mut BytesMut, max_payload: usize) -> Result<Option<ClientOp>> {
    let Some((line_len, line)) = control_line(src)? else {
        return Ok(None);
    };
    let (op, args) = split_op(&line);
    let decoded = match op.as_str() {
        "PING" => ClientOp::Ping,
        "PONG" => ClientOp::Pong,
        "CONNECT" => {
            let info: ConnectInfo = serde_json::from_str(args).map_err(Error::Json)?;
            ClientOp::Connect(info)
        }
        "SUB" => {
            let parts: Vec<&str> = args.split_ascii_whitespace().collect();
            match parts.as_slice() {
                [subject, sid] => ClientOp::Sub {
                    subject: subject.to_string(),
                    queue: None,
                    sid: sid.to_string(),
                },
                [subject, queue, sid] => ClientOp::Sub {
                    subject: subject.to_string(),
                    queue: Some(queue.to_string()),
                    sid: sid.to_string(),
                },
                _ => {
                    return Err(Error::InvalidArguments {
                        op: "SUB",
                        reason: "expected subject [queue] sid".to_string(),
                    });
                }
            }
        }
        "UNSUB" => {
            let parts: Vec<&str> = args.split_ascii_whitespace().collect();
            match parts.as_slice() {
                [sid] => ClientOp::Unsub {
                    sid: sid.to_string(),
                    max: None,
                },
                [sid, max] => ClientOp::Unsub {
                    sid: sid.to_string(),
                    max: Some(max.parse().map_err(|_| Error::InvalidArguments {
                        op: "UNSUB",
                        reason: format!("invalid max {max:?}"),
                    })?),
                },
                _ => {
                    return Err(Error::InvalidArguments {
                        op: "UNSUB",
                        reason: "expected sid [max]".to_string(),
                    });
                }
            }
        }
        "PUB" => {
            let sized = parse_sized("PUB", args, false, false)?;
            check_payload(sized.total_len, max_payload)?;
            let (subject, reply) = (sized.subject.to_string(), sized.reply.map(str::to_string));
            let Some(payload) = take_body(src, line_len, sized.total_len)? else {
                return Ok(None);
            };
            return Ok(Some(ClientOp::Pub {
                subject,
                reply,
                payload,
            }));
        }
        "HPUB" => {
            let sized = parse_sized("HPUB", args, false, true)?;
            check_payload(sized.total_len, max_payload)?;
            let (subject, reply) = (sized.subject.to_string(), sized.reply.map(str::to_string));
            let header_len = sized.header_len;
            let Some(mut body) = take_body(src, line_len, sized.total_len)? else {
                return Ok(None);
            };
            let headers = decode_headers(&body[..header_len])?;
            body.advance(header_len);
            return Ok(Some(ClientOp::HPub {
                subject,
                reply,
                headers,
                payload: body,
            }));
        }
        _ => return Err(Error::UnknownOperation(op.clone())),
    };
    src.advance(line_len);
    Ok(Some(decoded))
}

pub fn decode_server_op(src: &mut BytesMut, max_payload: usize) -> Result<Option<ServerOp>> {
    let Some((line_len, line)) = control_line(src)? else {
        return Ok(None);
    };
    let (op, args) = split_op(&line);
    let decoded = match op.as_str() {
        "PING" => ServerOp::Ping,
        "PONG" => ServerOp::Pong,
        "+OK" => ServerOp::Ok,
        "-ERR" => ServerOp::Err(args.trim_matches('\'').to_string()),
        "INFO" => {
            let info: ServerInfo = serde_json::from_str(args).map_err(Error::Json)?;
            ServerOp::Info(Box::new(info))
        }
        "MSG" => {
            let sized = parse_sized("MSG", args, true, false)?;
            check_payload(sized.total_len, max_payload)?;
            let subject = sized.subject.to_string();
            let sid = sized.sid.unwrap_or_default().to_string();
            let reply = sized.reply.map(str::to_string);
            let Some(payload) = take_body(src, line_len, sized.total_len)? else {
                return Ok(None);
            };
            return Ok(Some(ServerOp::Msg {
                subject,
                sid,
                reply,
                payload,
            }));
        }
        "HMSG" => {
            let sized = parse_sized("HMSG", args, true, true)?;
            check_payload(sized.total_len, max_payload)?;
            let subject = sized.subject.to_string();
            let sid = sized.sid.unwrap_or_default().to_string();
            let reply = sized.reply.map(str::to_string);
            let header_len = sized.header_len;
            let Some(mut body) = take_body(src, line_len, sized.total_len)? else {
                return Ok(None);
            };
            let headers = decode_headers(&body[..header_len])?;
            body.advance(header_len);
            return Ok(Some(ServerOp::HMsg {
                subject,
                sid,
                reply,
                headers,
                payload: body,
            }));
        }
        _ => return Err(Error::UnknownOperation(op.clone())),
    };
    src.advance(line_len);
    Ok(Some(decoded))
}

pub fn encode_client_op(op: &ClientOp, dst: &mut BytesMut) -> Result<()> {
    match op {
        ClientOp::Connect(info) => {
            let body = serde_json::to_string(info).map_err(Error::Json)?;
            put_line(dst, &["CONNECT", &body]);
        }
        ClientOp::Pub {
            subject,
            reply,
            payload,
        } => {
            let size = payload.len().to_string();
            put_line(dst, &with_reply(&["PUB", subject], reply.as_deref(), &[&size]));
            put_body(dst, None, payload);
        }
        ClientOp::HPub {
            subject,
            reply,
            headers,
            payload,
        } => {
            let header_len = encoded_headers_len(headers);
            let sizes = [
                header_len.to_string(),
                (header_len + payload.len()).to_string(),
            ];
            put_line(
                dst,
                &with_reply(&["HPUB", subject], reply.as_deref(), &[&sizes[0], &sizes[1]]),
            );
            put_body(dst, Some(headers), payload);
        }
        ClientOp::Sub {
            subject,
            queue,
            sid,
        } => match queue {
            Some(queue) => put_line(dst, &["SUB", subject, queue, sid]),
            None => put_line(dst, &["SUB", subject, sid]),
        },
        ClientOp::Unsub { sid, max } => match max {
            Some(max) => put_line(dst, &["UNSUB", sid, &max.to_string()]),
            None => put_line(dst, &["UNSUB", sid]),
        },
        ClientOp::Ping => put_line(dst, &["PING"]),
        ClientOp::Pong => put_line(dst, &["PONG"]),
    }
    Ok(())
}

pub fn encode_server_op(op: &ServerOp, dst: &mut BytesMut) -> Result<()> {
    match op {
        ServerOp::Info(info) => {
            let body = serde_json::to_string(info).map_err(Error::Json)?;
            put_line(dst, &["INFO", &body]);
        }
        ServerOp::Msg {
            subject,
            sid,
            reply,
            payload,
        } => {
            let size = payload.len().to_string();
            put_line(
                dst,
                &with_reply(&["MSG", subject, sid], reply.as_deref(), &[&size]),
            );
            put_body(dst, None, payload);
        }
        ServerOp::HMsg {
            subject,
            sid,
            reply,
            headers,
            payload,
        } => {
            let header_len = encoded_headers_len(headers);
            let sizes = [
                header_len.to_string(),
                (header_len + payload.len()).to_string(),
            ];
            put_line(
                dst,
                &with_reply(
                    &["HMSG", subject, sid],
                    reply.as_deref(),
                    &[&sizes[0], &sizes[1]],
                ),
            );
            put_body(dst, Some(headers), payload);
        }
        ServerOp::Ping => put_line(dst, &["PING"]),
        ServerOp::Pong => put_line(dst, &["PONG"]),
        ServerOp::Ok => put_line(dst, &["+OK"]),
        ServerOp::Err(text) => {
            let quoted = format!("'{text}'");
            put_line(dst, &["-ERR", &quoted]);
        }
    }
    Ok(())
}

fn with_reply<'a>(head: &[&'a str], reply: Option<&'a str>, tail: &[&'a str]) -> Vec<&'a str> {
    let mut parts = head.to_vec();
    parts.extend(reply);
    parts.extend_from_slice(tail);
    parts
}

fn put_line(dst: &mut BytesMut, parts: &[&str]) {
    let len = parts.iter().map(|part| part.len() + 1).sum::<usize>() + 1;
    dst.reserve(len);
    for (index, part) in parts.iter().enumerate() {
        if index > 0 {
            dst.put_u8(b' ');
        }
        dst.put_slice(part.as_bytes());
    }
    dst.put_slice(CRLF);
}

fn put_body(dst: &mut BytesMut, headers: Option<&HeaderList>, payload: &Bytes) {
    if let Some(headers) = headers {
        encode_headers(headers, dst);
    }
    dst.reserve(payload.len() + CRLF.len());
    dst.put_slice(payload);
    dst.put_slice(CRLF);
}

pub fn encoded_headers_len(headers: &HeaderList) -> usize {
    let entries: usize = headers
        .iter()
        .map(|(name, value)| name.len() + 2 + value.len() + 2)
        .sum();
    HEADER_VERSION_LINE.len() + 2 + entries + 2
}

pub fn encode_headers(headers: &HeaderList, dst: &mut BytesMut) {
    dst.reserve(encoded_headers_len(headers));
    dst.put_slice(HEADER_VERSION_LINE.as_bytes());
    dst.put_slice(CRLF);
    for (name, value) in headers {
        dst.put_slice(name.as_bytes());
        dst.put_slice(b": ");
        dst.put_slice(value.as_bytes());
        dst.put_slice(CRLF);
    }
    dst.put_slice(CRLF);
}

pub fn decode_headers(block: &[u8]) -> Result<HeaderList> {
    let text = std::str::from_utf8(block).map_err(|_| Error::InvalidHeaders)?;
    let mut lines = text.split("\r\n");
    let version = lines.next().unwrap_or_default();
    if !version.starts_with(HEADER_VERSION_LINE) {
        return Err(Error::InvalidHeaders);
    }
    let mut headers = HeaderList::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or(Error::InvalidHeaders)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidHeaders);
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }
    Ok(headers)
}
