//! TLS transport: dialing, deadline-guarded reads and writer-lock writes.
//!
//! The write side is shared between the session's fibers through a single
//! async mutex, so control frames and tunnelled voice packets never
//! interleave bytes on the wire. There is no retry and no reconnection:
//! any fault here ends the session.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpSocket, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_rustls::rustls::{
    self,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    DigitallySignedStruct, SignatureScheme,
};
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::error::Error;
use crate::messages::{self, MessageEnvelope};

/// Client certificate presented during the TLS handshake.
pub struct TlsIdentity {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for TlsIdentity {
    fn clone(&self) -> Self {
        Self {
            cert_chain: self.cert_chain.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("cert_chain", &self.cert_chain.len())
            .finish_non_exhaustive()
    }
}

/// TLS options for the control connection.
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    /// Override for SNI and certificate matching; defaults to the host.
    pub server_name: Option<String>,
    /// Skip certificate verification entirely.
    pub accept_invalid_certs: bool,
    /// Trust anchors used when verification is on.
    pub root_certs: Vec<CertificateDer<'static>>,
    /// Optional client certificate.
    pub identity: Option<TlsIdentity>,
}

/// Dial the server and complete the TLS handshake.
pub(crate) async fn dial(
    host: &str,
    port: u16,
    connect_timeout: Duration,
    local_bind: Option<SocketAddr>,
    tls: &TlsSettings,
) -> Result<TlsStream<TcpStream>, Error> {
    let addr = format!("{host}:{port}");
    let tcp_stream = match timeout(connect_timeout, tcp_connect(addr, local_bind)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => return Err(Error::Transport(err)),
        Err(_) => return Err(Error::Timeout("tcp connect")),
    };
    tcp_stream.set_nodelay(true)?;

    let server_name_str = tls.server_name.as_deref().unwrap_or(host);
    let server_name = ServerName::try_from(server_name_str.to_string())
        .map_err(|_| Error::InvalidConfig("invalid TLS server name".into()))?;

    let connector = tls_connector(tls)?;
    match timeout(connect_timeout, connector.connect(server_name, tcp_stream)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(Error::Transport(err)),
        Err(_) => Err(Error::Timeout("tls handshake")),
    }
}

async fn tcp_connect(addr: String, local_bind: Option<SocketAddr>) -> io::Result<TcpStream> {
    let Some(local) = local_bind else {
        return TcpStream::connect(&addr).await;
    };
    let mut last_err = None;
    for remote in lookup_host(&addr).await? {
        if remote.is_ipv4() != local.is_ipv4() {
            continue;
        }
        let socket = if remote.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.bind(local)?;
        match socket.connect(remote).await {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no resolved address matches the local bind family",
        )
    }))
}

fn tls_connector(tls: &TlsSettings) -> Result<TlsConnector, Error> {
    let builder = rustls::ClientConfig::builder();

    let builder = if tls.accept_invalid_certs {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
    } else {
        let mut roots = rustls::RootCertStore::empty();
        for cert in &tls.root_certs {
            roots.add(cert.clone()).map_err(Error::Tls)?;
        }
        builder.with_root_certificates(roots)
    };

    let mut config = match &tls.identity {
        Some(identity) => builder
            .with_client_auth_cert(identity.cert_chain.clone(), identity.key.clone_key())
            .map_err(Error::Tls)?,
        None => builder.with_no_client_auth(),
    };

    config.alpn_protocols.push(b"mumble".to_vec());

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Framed read half with the session's liveness deadline applied to every
/// packet.
pub(crate) struct FrameReader<R> {
    reader: R,
    deadline: Duration,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub(crate) fn new(reader: R, deadline: Duration) -> Self {
        Self { reader, deadline }
    }

    pub(crate) async fn read_frame(&mut self) -> Result<MessageEnvelope, Error> {
        match timeout(self.deadline, messages::read_envelope(&mut self.reader)).await {
            Err(_) => Err(Error::Timeout("read deadline exceeded")),
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::InvalidData => {
                Err(Error::Protocol(err.to_string()))
            }
            Ok(Err(err)) => Err(Error::Transport(err)),
            Ok(Ok(envelope)) => Ok(envelope),
        }
    }
}

/// The session's shared write half. `None` once the session closed.
pub(crate) type SharedWriter<W> = Arc<Mutex<Option<W>>>;

/// Serialize a frame under the writer lock. Wire order equals the order in
/// which calls acquire the lock.
pub(crate) async fn write_frame<W>(
    writer: &SharedWriter<W>,
    envelope: &MessageEnvelope,
) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
{
    let mut guard = writer.lock().await;
    let stream = guard
        .as_mut()
        .ok_or(Error::InvalidState("session is not connected"))?;
    envelope.write_to(stream).await.map_err(Error::Transport)
}

#[derive(Debug)]
struct InsecureVerifier;

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{MessageKind, PREAMBLE_SIZE};
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn write_frame_requires_a_connection() {
        let writer: SharedWriter<tokio::io::DuplexStream> = Arc::new(Mutex::new(None));
        let envelope = MessageEnvelope::new(MessageKind::Ping, Vec::new());
        let err = write_frame(&writer, &envelope).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn read_frame_times_out_without_data() {
        let (_tx, rx) = duplex(16);
        let mut reader = FrameReader::new(rx, Duration::from_millis(50));
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn oversize_frame_is_a_protocol_violation() {
        let (mut tx, rx) = duplex(64);
        let mut header = [0u8; PREAMBLE_SIZE];
        header[2..].copy_from_slice(&(11 * 1024 * 1024u32).to_be_bytes());
        tx.write_all(&header).await.unwrap();

        let mut reader = FrameReader::new(rx, Duration::from_secs(1));
        let err = reader.read_frame().await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn frames_written_under_the_lock_arrive_in_order() {
        let (tx, mut rx) = duplex(4096);
        let writer: SharedWriter<_> = Arc::new(Mutex::new(Some(tx)));

        for index in 0..8u8 {
            let envelope = MessageEnvelope::new(MessageKind::Ping, vec![index]);
            write_frame(&writer, &envelope).await.unwrap();
        }
        for index in 0..8u8 {
            let received = messages::read_envelope(&mut rx).await.unwrap();
            assert_eq!(received.payload, vec![index]);
        }
    }
}
