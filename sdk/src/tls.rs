use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig as RustlsClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::config::ClientConfig;
use crate::error::ClientError;

/// Verifier used when `skip_verify` is set: every certificate passes.
#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        tokio_rustls::rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

pub(crate) async fn connect_tls(
    stream: TcpStream,
    config: &ClientConfig,
) -> Result<TlsStream<TcpStream>, ClientError> {
    let mut roots = RootCertStore::empty();
    if let Some(ca_path) = &config.tls.ca_path {
        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(File::open(ca_path)?))
                .collect::<Result<Vec<_>, _>>()?;
        for cert in certs {
            roots
                .add(cert)
                .map_err(|err| ClientError::Tls(err.to_string()))?;
        }
    } else {
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let mut tls_config = RustlsClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    if config.tls.skip_verify {
        tls_config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoVerification));
    }

    let host = config.tls.server_name.clone().unwrap_or_else(|| {
        config
            .address
            .split(':')
            .next()
            .unwrap_or("localhost")
            .to_string()
    });
    let server_name =
        ServerName::try_from(host).map_err(|err| ClientError::Tls(err.to_string()))?;

    let connector = TlsConnector::from(Arc::new(tls_config));
    connector
        .connect(server_name, stream)
        .await
        .map_err(|err| ClientError::Tls(err.to_string()))
}
