//! The internal loopback HTTP server exposing the package listing.

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use super::{negotiate, Packages};

const MAX_HEADERS: usize = 64;

/// The AMD/global loader wrapped around `manifests.js`.
const MANIFESTS_WRAPPER: &str = concat!(
    "(function (root, data) { if (typeof define === 'function' && define.amd) { define(data); }",
    " if(typeof cockpit === 'object') { cockpit.manifests = data; }",
    " else { root.manifests = data; } }(this, "
);

const CHECKSUM_HEADER: &str = "X-Cockpit-Pkg-Checksum";

pub(super) async fn serve(listener: TcpListener, packages: Packages) {
    loop {
        match listener.accept().await {
            Ok((stream, _)) => {
                tokio::task::spawn_local(handle_connection(stream, packages.clone()));
            }
            Err(err) => {
                warn!("couldn't accept internal connection: {}", err);
                break;
            }
        }
    }
}

struct Request {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
}

impl Request {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

struct Response {
    status: u16,
    reason: &'static str,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    fn new(status: u16, reason: &'static str) -> Response {
        Response {
            status,
            reason,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    fn error(status: u16, reason: &'static str, message: &str) -> Response {
        let mut response = Response::new(status, reason);
        response.header("Content-Type", "text/plain");
        response.body = format!("{}\n", message).into_bytes();
        response
    }

    fn header(&mut self, name: &str, value: &str) {
        self.headers.push((name.to_string(), value.to_string()));
    }

    fn render(&self, head_only: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.body.len() + 512);
        out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", self.status, self.reason).as_bytes());

        let date = httpdate::fmt_http_date(std::time::SystemTime::now());
        out.extend_from_slice(format!("Date: {}\r\n", date).as_bytes());
        out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        out.extend_from_slice(b"Connection: keep-alive\r\n");

        // Static hardening headers on every response.
        out.extend_from_slice(b"X-DNS-Prefetch-Control: off\r\n");
        out.extend_from_slice(b"Referrer-Policy: no-referrer\r\n");
        out.extend_from_slice(b"X-Content-Type-Options: nosniff\r\n");
        out.extend_from_slice(b"Cross-Origin-Resource-Policy: same-origin\r\n");
        out.extend_from_slice(b"X-Frame-Options: sameorigin\r\n");

        for (name, value) in &self.headers {
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");

        if !head_only {
            out.extend_from_slice(&self.body);
        }
        out
    }
}

async fn handle_connection(mut stream: TcpStream, packages: Packages) {
    let mut buf = BytesMut::with_capacity(4096);

    loop {
        let request = match read_request(&mut stream, &mut buf).await {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(err) => {
                debug!("bad internal request: {}", err);
                return;
            }
        };

        let head_only = request.method == "HEAD";
        let response = if request.method == "GET" || head_only {
            route(&packages, &request)
        } else {
            Response::error(405, "Method Not Allowed", "Method not allowed")
        };

        if stream.write_all(&response.render(head_only)).await.is_err() {
            return;
        }

        if request
            .header("Connection")
            .map(|value| value.eq_ignore_ascii_case("close"))
            .unwrap_or(false)
        {
            return;
        }
    }
}

async fn read_request(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
) -> std::io::Result<Option<Request>> {
    loop {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut parsed = httparse::Request::new(&mut headers);

        match parsed.parse(buf) {
            Ok(httparse::Status::Complete(len)) => {
                let method = parsed.method.unwrap_or("").to_string();
                let path = parsed.path.unwrap_or("").to_string();
                let headers: Vec<(String, String)> = parsed
                    .headers
                    .iter()
                    .map(|header| {
                        (
                            header.name.to_string(),
                            String::from_utf8_lossy(header.value).into_owned(),
                        )
                    })
                    .collect();
                let _ = buf.split_to(len);

                let request = Request {
                    method,
                    path,
                    headers,
                };

                // Requests here never carry interesting bodies; skip one
                // if the client sent it anyway.
                if let Some(length) = request
                    .header("Content-Length")
                    .and_then(|value| value.parse::<usize>().ok())
                {
                    let mut remaining = length.saturating_sub(buf.len());
                    let _ = buf.split_to(std::cmp::min(length, buf.len()));
                    let mut scratch = [0u8; 4096];
                    while remaining > 0 {
                        let take = std::cmp::min(remaining, scratch.len());
                        let n = stream.read(&mut scratch[..take]).await?;
                        if n == 0 {
                            break;
                        }
                        remaining -= n;
                    }
                }

                return Ok(Some(request));
            }
            Ok(httparse::Status::Partial) => {}
            Err(err) => {
                return Err(std::io::Error::new(std::io::ErrorKind::InvalidData, err));
            }
        }

        if stream.read_buf(buf).await? == 0 {
            return Ok(None);
        }
    }
}

fn route(packages: &Packages, request: &Request) -> Response {
    let path = request.path.split('?').next().unwrap_or("");

    match path {
        "/checksum" => handle_checksum(packages),
        "/manifests.json" => handle_manifests(packages, false),
        "/manifests.js" => handle_manifests(packages, true),
        _ => {
            let mut segments = path.strip_prefix('/').unwrap_or("").splitn(2, '/');
            let name = segments.next().unwrap_or("");
            let rest = segments.next().unwrap_or("");
            if name.is_empty() || rest.is_empty() {
                Response::error(404, "Not Found", "Not found")
            } else {
                handle_package_content(packages, request, name, rest)
            }
        }
    }
}

fn handle_checksum(packages: &Packages) -> Response {
    let mut response = Response::new(200, "OK");
    response.header("Content-Type", "text/plain");
    if let Some(checksum) = packages.checksum() {
        response.header(CHECKSUM_HEADER, &checksum);
        response.body = checksum.into_bytes();
    }
    response
}

fn handle_manifests(packages: &Packages, wrapped: bool) -> Response {
    let mut response = Response::new(200, "OK");

    match packages.checksum() {
        Some(checksum) => {
            response.header(CHECKSUM_HEADER, &checksum);
            response.header("ETag", &format!("\"${}\"", checksum));
        }
        None => response.header("Cache-Control", "no-cache"),
    }

    let content = serde_json::to_vec(&packages.manifests()).expect("manifests serialize");
    if wrapped {
        response.header("Content-Type", "text/javascript");
        response.body.extend_from_slice(MANIFESTS_WRAPPER.as_bytes());
        response.body.extend_from_slice(&content);
        response.body.extend_from_slice(b"));");
    } else {
        response.header("Content-Type", "application/json");
        response.body = content;
    }
    response
}

fn security_policy(policy: Option<&str>, origin: Option<&str>) -> String {
    let policy = policy.unwrap_or(
        "connect-src 'self'; form-action 'self'; base-uri 'self'; object-src 'none'; \
         font-src 'self' data:; img-src 'self' data:; default-src 'self'",
    );
    match origin {
        Some(origin) => policy.replace("'self'", &format!("'self' {}", origin)),
        None => policy.to_string(),
    }
}

fn handle_package_content(
    packages: &Packages,
    request: &Request,
    name: &str,
    path: &str,
) -> Response {
    let languages = negotiate::parse_accept_language(request.header("Accept-Language"));
    let language = languages.first().map(String::as_str);

    let origin = match (
        request.header("X-Forwarded-Proto"),
        request.header("X-Forwarded-Host"),
    ) {
        (Some(proto), Some(host)) => Some(format!("{}://{}", proto, host)),
        _ => None,
    };

    let globbing = name == "*";
    let names = if globbing {
        packages.all_names()
    } else {
        vec![name.to_string()]
    };

    // When globbing files together no gzip encoding is possible.
    let allow_gzipped = !globbing && negotiate::accepts_gzip(request.header("Accept-Encoding"));

    let mut body = Vec::new();
    let mut no_cache = globbing;
    let mut content_encoding_gzip = false;
    let mut policy_package = None;

    for (index, name) in names.iter().enumerate() {
        let first = index == 0;

        let (package, filename) = match packages.resolve(name, path) {
            Some(resolved) => resolved,
            None => {
                if first {
                    // The entire package is missing; give the common
                    // case a more helpful message.
                    if name == "shell" || name == "systemd" {
                        return Response::error(
                            404,
                            "Not Found",
                            "Server is missing the cockpit-system package",
                        );
                    }
                    return Response::error(404, "Not Found", "Not found");
                }
                continue;
            }
        };

        if !globbing {
            if let Some(ref unavailable) = package.unavailable {
                return Response::error(503, "Service Unavailable", unavailable);
            }
        }

        let negotiated = negotiate::negotiate(&filename, package.paths.as_deref(), language);

        let (bytes, gzipped, language_specific) = match negotiated {
            Some(hit) => match std::fs::read(&hit.path) {
                Ok(bytes) => (bytes, hit.gzipped, hit.language_specific),
                Err(err) if globbing => {
                    debug!("{}: {}", hit.path.display(), err);
                    (Vec::new(), false, false)
                }
                Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                    debug!("{}: {}", hit.path.display(), err);
                    return Response::error(403, "Forbidden", "Forbidden");
                }
                Err(err) => {
                    warn!("{}: {}", hit.path.display(), err);
                    return Response::error(500, "Internal Server Error", "Internal error");
                }
            },
            None => {
                // Missing translation files yield empty content rather
                // than a stream of 404s in the developer console.
                if filename.to_string_lossy().ends_with("/po.js") {
                    (Vec::new(), false, true)
                } else if globbing {
                    (Vec::new(), false, false)
                } else {
                    return Response::error(404, "Not Found", "Not found");
                }
            }
        };

        if language_specific {
            no_cache = true;
        }

        let mut bytes = bytes;
        let mut gzipped = gzipped;
        if gzipped && !allow_gzipped {
            bytes = match negotiate::gunzip(&bytes) {
                Ok(bytes) => bytes,
                Err(err) => {
                    debug!("couldn't decompress: {}: {}", filename.display(), err);
                    Vec::new()
                }
            };
            gzipped = false;
        }

        if first {
            content_encoding_gzip = gzipped;
            policy_package = Some(package);
        }

        body.extend_from_slice(&bytes);
    }

    let mut response = Response::new(200, "OK");
    response.body = body;

    if content_encoding_gzip {
        response.header("Content-Encoding", "gzip");
    }

    if let Some(kind) = negotiate::content_type(path) {
        response.header("Content-Type", kind);
        if kind.starts_with("text/html") {
            if let Some(ref package) = policy_package {
                let policy = security_policy(
                    package.content_security_policy.as_deref(),
                    origin.as_deref(),
                );
                response.header("Content-Security-Policy", &policy);
            }
        }
    }

    if let Some(ref origin) = origin {
        response.header("Access-Control-Allow-Origin", origin);
    }

    match packages.checksum() {
        Some(checksum) if !no_cache => {
            response.header(CHECKSUM_HEADER, &checksum);
            response.header("ETag", &format!("\"${}\"", checksum));
        }
        _ => response.header("Cache-Control", "no-cache"),
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_fills_origin() {
        let policy = security_policy(Some("default-src 'self'"), Some("https://host:9090"));
        assert_eq!(policy, "default-src 'self' https://host:9090");

        let policy = security_policy(Some("default-src 'self'"), None);
        assert_eq!(policy, "default-src 'self'");

        let default = security_policy(None, None);
        assert!(default.contains("default-src 'self'"));
    }
}
