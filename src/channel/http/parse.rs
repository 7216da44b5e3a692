//! Response head parsing.

use bytes::BytesMut;
use tracing::{debug, trace};

use crate::{Error, Result};

const MAX_HEADERS: usize = 100;

/// A parsed response head. Headers keep their original case and order.
#[derive(Debug)]
pub(crate) struct Head {
    pub(crate) status: u16,
    pub(crate) reason: String,
    pub(crate) version_minor: u8,
    pub(crate) headers: Vec<(String, String)>,
}

impl Head {
    /// The first header with the given name, ASCII case-insensitive.
    pub(crate) fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// Try to parse a response head from the front of `buf`. Returns
/// `Ok(None)` when more data is needed; on success the head bytes are
/// consumed from the buffer.
pub(crate) fn parse_head(buf: &mut BytesMut) -> Result<Option<Head>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);

    let status = response
        .parse(buf)
        .map_err(|e| {
            debug!("response head parse error: {}", e);
            Error::new_protocol().with(e)
        })?;

    let len = match status {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return Ok(None),
    };

    trace!("parsed response head, {} bytes", len);

    let code = response.code.ok_or_else(Error::new_protocol)?;
    http::StatusCode::from_u16(code).map_err(|e| Error::new_protocol().with(e))?;
    let reason = response.reason.unwrap_or("").to_string();
    let version_minor = response.version.ok_or_else(Error::new_protocol)?;

    let mut parsed = Vec::with_capacity(response.headers.len());
    for header in response.headers.iter() {
        let value = std::str::from_utf8(header.value)
            .map_err(|e| Error::new_protocol().with(e))?
            .to_string();
        parsed.push((header.name.to_string(), value));
    }

    let _ = buf.split_to(len);

    Ok(Some(Head {
        status: code,
        reason,
        version_minor,
        headers: parsed,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_complete() {
        let mut buf = BytesMut::from(
            &b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Extra: yes\r\n\r\nhello"[..],
        );
        let head = parse_head(&mut buf).unwrap().unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.reason, "OK");
        assert_eq!(head.version_minor, 1);
        assert_eq!(head.header("content-length"), Some("5"));
        assert_eq!(head.header("x-extra"), Some("yes"));
        assert_eq!(&buf[..], b"hello");
    }

    #[test]
    fn parse_partial() {
        let mut buf = BytesMut::from(&b"HTTP/1.1 200 OK\r\nContent-"[..]);
        assert!(parse_head(&mut buf).unwrap().is_none());
        // Nothing consumed.
        assert!(buf.starts_with(b"HTTP/1.1"));
    }

    #[test]
    fn parse_garbage() {
        let mut buf = BytesMut::from(&b"NOT HTTP AT ALL\r\n\r\n"[..]);
        let err = parse_head(&mut buf).unwrap_err();
        assert_eq!(err.problem(), "protocol-error");
    }

    #[test]
    fn parse_http10() {
        let mut buf = BytesMut::from(&b"HTTP/1.0 204 No Content\r\n\r\n"[..]);
        let head = parse_head(&mut buf).unwrap().unwrap();
        assert_eq!(head.status, 204);
        assert_eq!(head.version_minor, 0);
    }
}
