//! Length-prefixed message framing.
//!
//! Frames on the wire are an ASCII decimal length, a newline, and then
//! exactly that many bytes of body. The body is itself partitioned at
//! its first newline into a channel id (possibly empty) and a payload.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Error, Result};

/// The length prefix is at most 8 digits, so a frame body is at most
/// 10^8 - 1 bytes.
const MAX_SIZE_DIGITS: usize = 8;

/// Parse a framing length prefix from the start of `input`.
///
/// Returns `Ok(Some((size, consumed)))` when a complete prefix was
/// found, `Ok(None)` when more data is needed, and `bad-message` when
/// the prefix is improperly formatted: no digits, digits not followed
/// by a newline, a leading zero, or a zero size.
pub fn parse_length(input: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut size: usize = 0;
    let mut i = 0;

    while i < input.len() {
        let b = input[i];
        if i >= MAX_SIZE_DIGITS || !b.is_ascii_digit() {
            break;
        }
        size = size * 10 + (b - b'0') as usize;
        i += 1;
    }

    if i == input.len() {
        return Ok(None);
    }

    if size == 0 || input[i] != b'\n' || input[0] == b'0' {
        return Err(Error::new_bad_message());
    }

    Ok(Some((size, i + 1)))
}

/// Read exactly `buf.len()` bytes.
///
/// `ECONNRESET` is treated as EOF. When `eof_ok` is set, EOF before the
/// first byte is reported as `Ok(false)`; in every other case a short
/// read is `bad-message`.
async fn read_exactly<R>(reader: &mut R, buf: &mut [u8], eof_ok: bool) -> Result<bool>
where
    R: AsyncRead + Unpin,
{
    let mut offset = 0;

    while offset < buf.len() {
        let n = match reader.read(&mut buf[offset..]).await {
            Ok(n) => n,
            Err(ref err) if err.kind() == io::ErrorKind::ConnectionReset => 0,
            Err(err) => return Err(Error::new_io(err)),
        };

        if n == 0 {
            if eof_ok && offset == 0 {
                return Ok(false);
            }
            return Err(Error::new_bad_message());
        }

        offset += n;
    }

    Ok(true)
}

/// Read one frame body from `reader`.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary. Never reads
/// past the end of the frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    // The smallest valid frame is "1\n" plus a single body byte, so an
    // initial read of 3 bytes is always safe. If all three bytes are
    // digits the body is at least 100 bytes long, which means the full
    // 9-byte header (8 digits plus newline) may also be read safely.
    let mut header = [0u8; MAX_SIZE_DIGITS + 1];
    let mut n_read = 3;

    if !read_exactly(reader, &mut header[..n_read], true).await? {
        return Ok(None);
    }

    let (size, consumed) = match parse_length(&header[..n_read])? {
        Some(parsed) => parsed,
        None => {
            read_exactly(reader, &mut header[n_read..], false).await?;
            n_read = header.len();
            match parse_length(&header[..n_read])? {
                Some(parsed) => parsed,
                None => return Err(Error::new_bad_message()),
            }
        }
    };

    let mut body = vec![0u8; size];
    let from_header = n_read - consumed;
    body[..from_header].copy_from_slice(&header[consumed..n_read]);

    if from_header < size {
        read_exactly(reader, &mut body[from_header..], false).await?;
    }

    Ok(Some(body))
}

/// Write one frame: the length prefix, the channel id, a newline, and
/// the payload. A zero-length payload is a caller error.
pub async fn write_frame<W>(writer: &mut W, channel: Option<&str>, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    debug_assert!(!payload.is_empty(), "refusing to write an empty frame");
    if payload.is_empty() {
        return Err(Error::new_internal());
    }

    let channel = channel.unwrap_or("");
    let size = channel.len() + 1 + payload.len();

    let mut itoa_buf = itoa::Buffer::new();
    let prefix = itoa_buf.format(size);

    let mut head = BytesMut::with_capacity(prefix.len() + 1 + channel.len() + 1);
    head.put_slice(prefix.as_bytes());
    head.put_u8(b'\n');
    head.put_slice(channel.as_bytes());
    head.put_u8(b'\n');

    writer.write_all(&head).await.map_err(Error::new_io)?;
    writer.write_all(payload).await.map_err(Error::new_io)?;
    writer.flush().await.map_err(Error::new_io)?;

    Ok(())
}

/// Encode a frame into a buffer, length prefix included.
pub fn encode(channel: Option<&str>, payload: &[u8]) -> Vec<u8> {
    let channel = channel.unwrap_or("");
    let size = channel.len() + 1 + payload.len();

    let mut itoa_buf = itoa::Buffer::new();
    let prefix = itoa_buf.format(size);

    let mut out = Vec::with_capacity(prefix.len() + 1 + size);
    out.extend_from_slice(prefix.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(channel.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(payload);
    out
}

/// Split a frame body at its first newline into a channel id and a
/// payload. An empty channel id means a control message.
pub fn split_frame(body: Bytes) -> Result<(Option<String>, Bytes)> {
    let pos = match body.iter().position(|&b| b == b'\n') {
        Some(pos) => pos,
        None => return Err(Error::new_bad_message()),
    };

    let channel = if pos == 0 {
        None
    } else {
        match std::str::from_utf8(&body[..pos]) {
            Ok(id) => Some(id.to_string()),
            Err(_) => return Err(Error::new_bad_message()),
        }
    };

    let mut payload = body;
    let payload = payload.split_off(pos + 1);
    Ok((channel, payload))
}

/// Synchronous variants for paths that run on a blocking fd, such as
/// the askpass socketpair. The framing rules are identical.
pub mod blocking {
    use std::io::{Read, Write};

    use crate::{Error, Result};

    fn read_exactly<R: Read>(reader: &mut R, buf: &mut [u8], eof_ok: bool) -> Result<bool> {
        let mut offset = 0;
        while offset < buf.len() {
            let n = match reader.read(&mut buf[offset..]) {
                Ok(n) => n,
                Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(ref err) if err.kind() == std::io::ErrorKind::ConnectionReset => 0,
                Err(err) => return Err(Error::new_io(err)),
            };
            if n == 0 {
                if eof_ok && offset == 0 {
                    return Ok(false);
                }
                return Err(Error::new_bad_message());
            }
            offset += n;
        }
        Ok(true)
    }

    /// Read one frame body; `Ok(None)` on EOF at a frame boundary.
    pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
        let mut header = [0u8; super::MAX_SIZE_DIGITS + 1];
        let mut n_read = 3;

        if !read_exactly(reader, &mut header[..n_read], true)? {
            return Ok(None);
        }

        let (size, consumed) = match super::parse_length(&header[..n_read])? {
            Some(parsed) => parsed,
            None => {
                read_exactly(reader, &mut header[n_read..], false)?;
                n_read = header.len();
                match super::parse_length(&header[..n_read])? {
                    Some(parsed) => parsed,
                    None => return Err(Error::new_bad_message()),
                }
            }
        };

        let mut body = vec![0u8; size];
        let from_header = n_read - consumed;
        body[..from_header].copy_from_slice(&header[consumed..n_read]);
        if from_header < size {
            read_exactly(reader, &mut body[from_header..], false)?;
        }

        Ok(Some(body))
    }

    /// Write one frame, retrying partial writes to completion.
    pub fn write_frame<W: Write>(
        writer: &mut W,
        channel: Option<&str>,
        payload: &[u8],
    ) -> Result<()> {
        if payload.is_empty() {
            return Err(Error::new_internal());
        }
        let encoded = super::encode(channel, payload);
        writer.write_all(&encoded).map_err(Error::new_io)?;
        writer.flush().map_err(Error::new_io)?;
        Ok(())
    }

}
