//! The `http-stream1`/`http-stream2` channel: one HTTP request and
//! response relayed over a channel, with keep-alive pooling.

use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::{ChannelInput, ChannelIo, Context};
use crate::{json as opt, Error, Result};

pub mod connect;
pub(crate) mod decode;
pub(crate) mod parse;
pub mod pool;

use connect::Connectable;
use decode::{Buffered, Decoder};

/// Blocks larger than this are split when relayed to the peer.
const SPLIT_THRESHOLD: usize = 8192;
/// The frame size used when splitting.
const SPLIT_BLOCK: usize = 4096;

/// Headers the caller may never supply.
const BAD_HEADERS: &[&str] = &[
    "Content-Length",
    "Content-MD5",
    "TE",
    "Trailer",
    "Transfer-Encoding",
    "Upgrade",
];

/// Additional headers rejected in text mode, where the agent controls
/// the encoding of the relayed body.
const BAD_TEXT_HEADERS: &[&str] = &[
    "Accept-Encoding",
    "Content-Encoding",
    "Accept-Charset",
    "Accept-Ranges",
    "Content-Range",
    "Range",
];

pub async fn run(mut io: ChannelIo, ctx: Rc<Context>) {
    let connection = match opt::get_str(io.options(), "connection") {
        Ok(connection) => connection.map(str::to_owned),
        Err(_) => {
            warn!("{}: bad \"connection\" field in HTTP stream request", io.id());
            return io.close(Some("protocol-error")).await;
        }
    };
    let binary = !matches!(io.options().get("binary"), None | Some(Value::Null));

    if io.ready().await.is_err() {
        return io.close(Some("terminated")).await;
    }

    // Buffer the request body until the peer's done.
    let mut body: Vec<Bytes> = Vec::new();
    loop {
        match io.next().await {
            Some(ChannelInput::Data(bytes)) => body.push(bytes),
            Some(ChannelInput::Done) => break,
            Some(ChannelInput::Control(message)) => {
                debug!("{}: ignoring control {}", io.id(), message.command);
            }
            None => return io.close(None).await,
        }
    }

    match serve(&mut io, &ctx, connection, binary, body).await {
        Ok(()) => io.close(None).await,
        Err(err) => {
            debug!("{}: {}", io.id(), err);
            io.close(Some(err.problem())).await;
        }
    }
}

#[derive(Serialize)]
struct HeadFrame<'a> {
    status: u16,
    reason: &'a str,
    headers: serde_json::Map<String, Value>,
}

async fn serve(
    io: &mut ChannelIo,
    ctx: &Context,
    connection: Option<String>,
    binary: bool,
    body: Vec<Bytes>,
) -> Result<()> {
    // A pooled stream is preferred; the pooling key is the
    // caller-supplied connection name.
    let mut pooled = None;
    if let Some(ref name) = connection {
        pooled = ctx.pool.checkout(name).await;
    }

    let (name, mut upstream) = match pooled {
        Some(idle) => (
            connection.clone().expect("pooled implies a name"),
            Buffered::new(idle.stream, idle.leftover),
        ),
        None => {
            let connectable = Connectable::parse(io.options(), ctx)?;
            let name = connection
                .clone()
                .unwrap_or_else(|| connectable.name().to_string());
            let stream = connectable.connect().await?;
            (name, Buffered::new(stream, BytesMut::new()))
        }
    };

    let head = build_request(io.options(), &name, binary, &body)?;
    upstream.io.write_all(&head).await.map_err(Error::new_io)?;
    for block in &body {
        upstream.io.write_all(block).await.map_err(Error::new_io)?;
    }
    upstream.io.flush().await.map_err(Error::new_io)?;

    // Read and parse the response head.
    let head = loop {
        if let Some(head) = parse::parse_head(&mut upstream.buf)? {
            break head;
        }
        let n = upstream.fill().await.map_err(Error::new_io)?;
        if n == 0 {
            warn!("{}: received truncated HTTP response", name);
            return Err(Error::new_protocol());
        }
    };

    let chunked = parse_transfer_encoding(&head)?;
    let length = parse_content_length(&head)?;
    let mut keep_alive = parse_keep_alive(&head);

    io.send_data(head_frame(&head, binary)?).await?;

    let mut decoder = if chunked {
        Decoder::chunked()
    } else if let Some(length) = length {
        Decoder::length(length)
    } else {
        Decoder::eof()
    };

    // Relay the body, watching for the channel being closed under us.
    loop {
        tokio::select! {
            biased;

            input = io.next() => match input {
                Some(ChannelInput::Control(message)) => {
                    debug!("{}: ignoring control {}", name, message.command);
                }
                Some(_) => {
                    debug!("{}: ignoring frame after done", name);
                }
                None => return Ok(()),
            },

            block = decoder.decode_fut(&mut upstream) => {
                let block = block.map_err(relay_error)?;
                if block.is_empty() {
                    break;
                }
                relay_block(io, block).await?;
            }
        }
    }

    debug_assert!(decoder.is_eof());
    if decoder.is_close_delimited() {
        // The stream is exhausted; nothing worth pooling.
        keep_alive = false;
    }

    io.send_done().await?;

    if keep_alive {
        if let Some(ref name) = connection {
            let (stream, leftover) = upstream.into_parts();
            ctx.pool.checkin(name, stream, leftover);
        }
    }

    Ok(())
}

fn relay_error(err: std::io::Error) -> Error {
    match err.kind() {
        std::io::ErrorKind::InvalidInput
        | std::io::ErrorKind::InvalidData
        | std::io::ErrorKind::UnexpectedEof => Error::new_protocol().with(err),
        _ => Error::new_io(err),
    }
}

/// Send a body block, splitting large blocks to bound per-frame size.
async fn relay_block(io: &ChannelIo, block: Bytes) -> Result<()> {
    if block.len() < SPLIT_THRESHOLD {
        return io.send_data(block).await;
    }

    let mut rest = block;
    while !rest.is_empty() {
        let take = std::cmp::min(SPLIT_BLOCK, rest.len());
        io.send_data(rest.split_to(take)).await?;
    }
    Ok(())
}

fn head_frame(head: &parse::Head, binary: bool) -> Result<Bytes> {
    let mut headers = serde_json::Map::new();
    for (name, value) in &head.headers {
        if name.eq_ignore_ascii_case("Connection")
            || name.eq_ignore_ascii_case("Transfer-Encoding")
        {
            continue;
        }
        if !binary
            && (name.eq_ignore_ascii_case("Content-Length")
                || name.eq_ignore_ascii_case("Range"))
        {
            continue;
        }
        headers.insert(name.clone(), Value::String(value.clone()));
    }

    let frame = HeadFrame {
        status: head.status,
        reason: &head.reason,
        headers,
    };
    let bytes = serde_json::to_vec(&frame).map_err(|e| Error::new_internal().with(e))?;
    Ok(Bytes::from(bytes))
}

fn parse_transfer_encoding(head: &parse::Head) -> Result<bool> {
    match head.header("Transfer-Encoding") {
        None => Ok(false),
        Some("chunked") => Ok(true),
        Some(other) => {
            warn!("unsupported Transfer-Encoding in HTTP response: {}", other);
            Err(Error::new_protocol())
        }
    }
}

fn parse_content_length(head: &parse::Head) -> Result<Option<u64>> {
    if head.status == 204 {
        return Ok(Some(0));
    }

    let header = match head.header("Content-Length") {
        Some(header) => header,
        None => return Ok(None),
    };

    let value: u64 = header.parse().map_err(|_| {
        warn!("received invalid Content-Length in HTTP response");
        Error::new_protocol()
    })?;
    if value > i64::MAX as u64 {
        warn!("received Content-Length that was too big");
        return Err(Error::new_protocol());
    }

    Ok(Some(value))
}

fn parse_keep_alive(head: &parse::Head) -> bool {
    let header = match head.header("Connection") {
        Some(header) => Some(header.to_string()),
        None if head.version_minor == 1 => Some("keep-alive".to_string()),
        None => None,
    };

    // Conservative: a Connection header without "keep-alive" in it
    // means either the connection is meant to close, or we have no
    // idea what the server is trying to tell us.
    match header {
        Some(header) => header.to_ascii_lowercase().contains("keep-alive"),
        None => false,
    }
}

fn simple_token(value: &str) -> bool {
    !value.is_empty()
        && !value
            .bytes()
            .any(|b| matches!(b, b' ' | b'\t' | b'\r' | b'\n' | 0x0b))
}

fn single_line(value: &str) -> bool {
    !value.bytes().any(|b| matches!(b, b'\r' | b'\n' | 0x0b))
}

fn disallowed_header(name: &str, value: &str, binary: bool) -> bool {
    if BAD_HEADERS.iter().any(|bad| bad.eq_ignore_ascii_case(name)) {
        return true;
    }

    if !binary
        && BAD_TEXT_HEADERS
            .iter()
            .any(|bad| bad.eq_ignore_ascii_case(name))
    {
        return true;
    }

    // Connection is only allowed to ask for close.
    if name.eq_ignore_ascii_case("Connection") && value != "close" {
        return true;
    }

    false
}

fn build_request(
    options: &Value,
    name: &str,
    binary: bool,
    body: &[Bytes],
) -> Result<Vec<u8>> {
    let path = match opt::get_str(options, "path")? {
        Some(path) if simple_token(path) => path,
        Some(_) | None => {
            warn!("bad \"path\" field in HTTP stream request");
            return Err(Error::new_protocol());
        }
    };

    let method = match opt::get_str(options, "method")? {
        Some(method) if simple_token(method) => method,
        Some(_) | None => {
            warn!("bad \"method\" field in HTTP stream request");
            return Err(Error::new_protocol());
        }
    };

    let mut head = String::with_capacity(128);
    head.push_str(method);
    head.push(' ');
    head.push_str(path);
    head.push_str(" HTTP/1.1\r\n");

    let mut had_host = false;
    let mut had_encoding = false;

    if let Some(headers) = opt::get_object(options, "headers")? {
        for (header, value) in headers {
            if !simple_token(header)
                || http::header::HeaderName::from_bytes(header.as_bytes()).is_err()
            {
                warn!("invalid header in HTTP stream request: {}", header);
                return Err(Error::new_protocol());
            }
            let value = match value {
                Value::String(value) => value,
                _ => {
                    warn!("invalid header value in HTTP stream request: {}", header);
                    return Err(Error::new_protocol());
                }
            };
            if disallowed_header(header, value, binary) {
                warn!("disallowed header in HTTP stream request: {}", header);
                return Err(Error::new_protocol());
            }
            if !single_line(value) {
                warn!("invalid header value in HTTP stream request: {}", header);
                return Err(Error::new_protocol());
            }

            head.push_str(header);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");

            if header.eq_ignore_ascii_case("Host") {
                had_host = true;
            }
            if header.eq_ignore_ascii_case("Accept-Encoding") {
                had_encoding = true;
            }
        }
    }

    if !had_host {
        head.push_str("Host: ");
        head.push_str(name);
        head.push_str("\r\n");
    }
    if !had_encoding {
        head.push_str("Accept-Encoding: identity\r\n");
    }
    if !binary {
        head.push_str("Accept-Charset: UTF-8\r\n");
    }

    let total: usize = body.iter().map(Bytes::len).sum();
    if !body.is_empty() || method.eq_ignore_ascii_case("POST") {
        let mut itoa_buf = itoa::Buffer::new();
        head.push_str("Content-Length: ");
        head.push_str(itoa_buf.format(total));
        head.push_str("\r\n");
    }
    head.push_str("\r\n");

    Ok(head.into_bytes())
}
