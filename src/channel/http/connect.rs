//! Parsing and opening of upstream connectables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

use crate::channel::Context;
use crate::{json as opt, Error, Result};

/// The upstream byte stream of an HTTP or stream channel.
pub trait Io: AsyncRead + AsyncWrite + Unpin {}
impl<T: AsyncRead + AsyncWrite + Unpin> Io for T {}

pub type Upstream = Box<dyn Io>;

/// Where a channel connects to, parsed from its open options.
#[derive(Debug, Clone)]
pub struct Connectable {
    kind: Kind,
    name: String,
}

#[derive(Debug, Clone)]
enum Kind {
    Tcp { host: String, port: u16 },
    Tls { host: String, port: u16, validate: bool },
    Unix(PathBuf),
    Internal(SocketAddr),
}

impl Connectable {
    /// Parse the connectable options: `unix`, `internal`, or
    /// `address`/`port` with an optional `tls` object.
    pub fn parse(options: &serde_json::Value, ctx: &Context) -> Result<Connectable> {
        if let Some(path) = opt::get_str(options, "unix")? {
            return Ok(Connectable {
                kind: Kind::Unix(PathBuf::from(path)),
                name: path.to_string(),
            });
        }

        if let Some(internal) = opt::get_str(options, "internal")? {
            let address = match internal {
                "packages" => ctx
                    .packages
                    .as_ref()
                    .map(|packages| packages.address()),
                _ => None,
            };
            return match address {
                Some(address) => Ok(Connectable {
                    kind: Kind::Internal(address),
                    name: internal.to_string(),
                }),
                None => {
                    debug!("couldn't find internal address for {:?}", internal);
                    Err(Error::new_not_found())
                }
            };
        }

        let port = match opt::get_int(options, "port")? {
            Some(port) if (1..=65535).contains(&port) => port as u16,
            Some(_) => return Err(Error::new_protocol()),
            None => return Err(Error::new_protocol()),
        };
        let host = opt::get_str(options, "address")?
            .unwrap_or("127.0.0.1")
            .to_string();
        let name = format!("{}:{}", host, port);

        match options.get("tls") {
            None | Some(serde_json::Value::Null) => Ok(Connectable {
                kind: Kind::Tcp { host, port },
                name,
            }),
            Some(tls) if tls.is_object() => {
                let validate = opt::get_bool(tls, "validate")?.unwrap_or(true);
                Ok(Connectable {
                    kind: Kind::Tls {
                        host,
                        port,
                        validate,
                    },
                    name,
                })
            }
            Some(_) => Err(Error::new_protocol()),
        }
    }

    /// The display name: the unix path, `host:port`, or the internal
    /// target. Used for logging and the synthesised `Host` header.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Open a stream to the connectable.
    pub async fn connect(&self) -> Result<Upstream> {
        match self.kind {
            Kind::Tcp { ref host, port } => {
                let stream = TcpStream::connect((host.as_str(), port))
                    .await
                    .map_err(connect_error)?;
                Ok(Box::new(stream))
            }
            Kind::Unix(ref path) => {
                let stream = UnixStream::connect(path).await.map_err(connect_error)?;
                Ok(Box::new(stream))
            }
            Kind::Internal(address) => {
                let stream = TcpStream::connect(address).await.map_err(connect_error)?;
                Ok(Box::new(stream))
            }
            Kind::Tls {
                ref host,
                port,
                validate,
            } => {
                let stream = TcpStream::connect((host.as_str(), port))
                    .await
                    .map_err(connect_error)?;

                let config = tls_config(validate)?;
                let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
                let server_name = rustls::pki_types::ServerName::try_from(host.clone())
                    .map_err(|e| Error::new_protocol().with(e))?;
                let stream = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| Error::new_io(e))?;
                Ok(Box::new(stream))
            }
        }
    }
}

fn connect_error(err: std::io::Error) -> Error {
    match err.kind() {
        std::io::ErrorKind::NotFound | std::io::ErrorKind::ConnectionRefused => {
            Error::new_not_found().with(err)
        }
        _ => Error::new_io(err),
    }
}

fn tls_config(validate: bool) -> Result<rustls::ClientConfig> {
    if validate {
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_native_certs::load_native_certs().certs {
            let _ = roots.add(cert);
        }
        Ok(rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth())
    } else {
        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(rustls::RootCertStore::empty())
            .with_no_client_auth();
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(DisabledVerification));
        Ok(config)
    }
}

/// Accepts any server certificate; used for `tls: {"validate": false}`.
#[derive(Debug)]
struct DisabledVerification;

impl rustls::client::danger::ServerCertVerifier for DisabledVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Pool;
    use serde_json::json;

    fn test_ctx() -> Context {
        Context {
            pool: Pool::new(),
            packages: None,
        }
    }

    #[test]
    fn parse_tcp() {
        let ctx = test_ctx();
        let connectable =
            Connectable::parse(&json!({"port": 8080, "address": "example.com"}), &ctx).unwrap();
        assert_eq!(connectable.name(), "example.com:8080");

        let connectable = Connectable::parse(&json!({"port": 80}), &ctx).unwrap();
        assert_eq!(connectable.name(), "127.0.0.1:80");
    }

    #[test]
    fn parse_unix() {
        let ctx = test_ctx();
        let connectable =
            Connectable::parse(&json!({"unix": "/run/test.sock"}), &ctx).unwrap();
        assert_eq!(connectable.name(), "/run/test.sock");
    }

    #[test]
    fn parse_rejects_bad_options() {
        let ctx = test_ctx();
        assert!(Connectable::parse(&json!({}), &ctx).is_err());
        assert!(Connectable::parse(&json!({"port": 0}), &ctx).is_err());
        assert!(Connectable::parse(&json!({"port": 70000}), &ctx).is_err());
        assert!(Connectable::parse(&json!({"port": "80"}), &ctx).is_err());
        assert!(Connectable::parse(&json!({"port": 80, "tls": 5}), &ctx).is_err());
        assert!(
            Connectable::parse(&json!({"internal": "unknown"}), &ctx)
                .unwrap_err()
                .is_not_found()
        );
    }

    #[test]
    fn parse_tls() {
        let ctx = test_ctx();
        let connectable =
            Connectable::parse(&json!({"port": 443, "tls": {}}), &ctx).unwrap();
        assert!(matches!(
            connectable.kind,
            Kind::Tls { validate: true, .. }
        ));

        let connectable = Connectable::parse(
            &json!({"port": 443, "tls": {"validate": false}}),
            &ctx,
        )
        .unwrap();
        assert!(matches!(
            connectable.kind,
            Kind::Tls {
                validate: false,
                ..
            }
        ));
    }
}
