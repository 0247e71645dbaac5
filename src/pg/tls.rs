//! TLS support for PostgreSQL connections (feature-gated).
//!
//! TLS is negotiated by sending an `SSLRequest` and, when the server answers
//! `S`, wrapping the socket transport in a rustls client session. The wrapped
//! transport stays non-blocking: handshake progress happens inside
//! `try_read`/`try_write` as bytes become available.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use rustls::pki_types::ServerName;
use rustls::ClientConnection;

use super::error::{PgError, PgResult};
use super::transport::{Interest, ShutdownHandle, Transport};
use crate::config::SslMode;

fn tls_error(message: impl Into<String>) -> PgError {
    PgError::Tls(message.into())
}

pub(crate) fn server_name(host: &str) -> PgResult<ServerName<'static>> {
    host.to_string()
        .try_into()
        .map_err(|e| tls_error(format!("Invalid server name '{host}': {e}")))
}

/// Build a rustls ClientConfig based on the SSL mode.
///
/// - Allow/Prefer/Require: encrypt, do not verify certificates
/// - VerifyCa/VerifyFull: verify against the webpki-roots CA bundle
pub(crate) fn build_client_config(ssl_mode: SslMode) -> PgResult<rustls::ClientConfig> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    match ssl_mode {
        SslMode::Disable => Err(tls_error("TLS config requested with sslmode=disable")),
        SslMode::Allow | SslMode::Prefer | SslMode::Require => build_no_verify_config(&provider),
        SslMode::VerifyCa | SslMode::VerifyFull => build_webpki_config(&provider),
    }
}

fn build_no_verify_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
) -> PgResult<rustls::ClientConfig> {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, UnixTime};
    use rustls::{DigitallySignedStruct, Error as RustlsError, SignatureScheme};

    #[derive(Debug)]
    struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, RustlsError> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, RustlsError> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PKCS1_SHA384,
                SignatureScheme::RSA_PKCS1_SHA512,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ECDSA_NISTP521_SHA512,
                SignatureScheme::RSA_PSS_SHA256,
                SignatureScheme::RSA_PSS_SHA384,
                SignatureScheme::RSA_PSS_SHA512,
                SignatureScheme::ED25519,
            ]
        }
    }

    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| tls_error(format!("Failed to set TLS versions: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerifier))
        .with_no_client_auth();

    Ok(config)
}

fn build_webpki_config(
    provider: &Arc<rustls::crypto::CryptoProvider>,
) -> PgResult<rustls::ClientConfig> {
    use rustls::RootCertStore;

    let mut root_store = RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
        .map_err(|e| tls_error(format!("Failed to set TLS versions: {e}")))?
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(config)
}

/// `io::Read`/`io::Write` view of a transport, for rustls record I/O.
struct Raw<'a>(&'a mut dyn Transport);

impl Read for Raw<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.try_read(buf)
    }
}

impl Write for Raw<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.try_write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A transport carrying a rustls client session over another transport.
pub struct TlsTransport {
    inner: Box<dyn Transport>,
    session: ClientConnection,
}

impl TlsTransport {
    /// Wrap `inner` after the server accepted the SSLRequest.
    pub fn new(inner: Box<dyn Transport>, host: &str, mode: SslMode) -> PgResult<Self> {
        let config = Arc::new(build_client_config(mode)?);
        let session = ClientConnection::new(config, server_name(host)?)
            .map_err(|e| tls_error(format!("Failed to start TLS session: {e}")))?;
        Ok(Self { inner, session })
    }

    fn pump_output(&mut self) -> io::Result<()> {
        while self.session.wants_write() {
            self.session.write_tls(&mut Raw(self.inner.as_mut()))?;
        }
        Ok(())
    }
}

fn would_block(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
        other => other,
    }
}

impl Transport for TlsTransport {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.session.reader().read(buf) {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            would_block(self.pump_output())?;
            if self.session.read_tls(&mut Raw(self.inner.as_mut()))? == 0 {
                return Ok(0);
            }
            self.session
                .process_new_packets()
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.session.writer().write(buf)?;
        would_block(self.pump_output())?;
        if n == 0 && !buf.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        Ok(n)
    }

    fn wait(&mut self, interest: Interest, timeout: Option<Duration>) -> io::Result<()> {
        self.inner.wait(interest, timeout)
    }

    fn has_pending_output(&self) -> bool {
        self.session.wants_write()
    }

    fn flush_output(&mut self) -> io::Result<()> {
        self.pump_output()
    }

    fn shutdown(&mut self) -> io::Result<()> {
        self.session.send_close_notify();
        let _ = self.pump_output();
        self.inner.shutdown()
    }

    fn raw_fd(&self) -> Option<i64> {
        self.inner.raw_fd()
    }

    fn shutdown_handle(&self) -> Option<ShutdownHandle> {
        self.inner.shutdown_handle()
    }
}
