//! Connection functions used by the replicated driver to reach peers.
//!
//! Without TLS material the driver dials plain TCP. With a certificate and
//! key, every connection presents the certificate as a client identity and
//! checks the peer against a trust pool built from that same certificate
//! file. A peer presenting a certificate from the pool is accepted as is,
//! which covers clusters sharing one self-signed certificate; anything else
//! must chain to a certificate in the pool.
//!
//! Connecting and the TLS handshake both watch the cancellation token, so a
//! cancelled dial returns promptly even when the peer never answers.

use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{
    CryptoProvider, WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature,
};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{
    ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme,
    StreamOwned,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use replistore_config::TlsConfig;

/// How long a blocked connect or handshake waits before rechecking the token.
const CANCEL_POLL: Duration = Duration::from_millis(50);

/// Byte stream to a peer.
pub trait PeerStream: Read + Write + Send {}

impl<T> PeerStream for T where T: Read + Write + Send {}

/// Opens a stream to `address` (`host:port`).
pub type DialFn =
    dyn Fn(&CancellationToken, &str) -> io::Result<Box<dyn PeerStream>> + Send + Sync;

/// Dial function handed to the driver builder.
#[derive(Clone)]
pub struct DialOption {
    dial: Arc<DialFn>,
    tls: bool,
}

impl DialOption {
    /// Plain TCP dialling.
    #[must_use]
    pub fn plain() -> Self {
        Self {
            dial: Arc::new(|ctx: &CancellationToken, address: &str| default_dial(ctx, address)),
            tls: false,
        }
    }

    /// Opens a connection to `address`.
    pub fn dial(&self, ctx: &CancellationToken, address: &str) -> io::Result<Box<dyn PeerStream>> {
        (self.dial)(ctx, address)
    }

    /// Returns `true` when connections are wrapped in TLS.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        self.tls
    }
}

impl Default for DialOption {
    fn default() -> Self {
        Self::plain()
    }
}

impl fmt::Debug for DialOption {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("DialOption")
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

fn cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, "dial cancelled")
}

/// Connects over TCP, giving up as soon as `ctx` is cancelled.
pub fn default_dial(ctx: &CancellationToken, address: &str) -> io::Result<Box<dyn PeerStream>> {
    Ok(Box::new(connect(ctx, address)?))
}

fn connect(ctx: &CancellationToken, address: &str) -> io::Result<TcpStream> {
    if ctx.is_cancelled() {
        return Err(cancelled());
    }

    let (sender, receiver) = mpsc::channel();
    let target = address.to_owned();
    let _connector = thread::Builder::new()
        .name("replistore-dial".to_owned())
        .spawn(move || {
            // A cancelled caller has stopped listening; the stream is dropped here.
            drop(sender.send(TcpStream::connect(target.as_str())));
        })?;

    loop {
        match receiver.recv_timeout(CANCEL_POLL) {
            Ok(result) => {
                let stream = result?;
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(RecvTimeoutError::Timeout) if ctx.is_cancelled() => return Err(cancelled()),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                return Err(io::Error::other("connect thread exited without a result"));
            }
        }
    }
}

/// Errors raised while building the dial function.
#[derive(Debug, Error)]
pub enum DialerError {
    /// Only one half of the certificate/key pair was configured.
    #[error("both TLS certificate and key must be given")]
    IncompletePair,
    /// The certificate chain or private key could not be loaded or paired.
    #[error("bad certificate pair: {reason}")]
    BadCertificatePair {
        /// Description of the loading failure.
        reason: String,
    },
    /// The certificate file could not be read for the trust pool.
    #[error("could not read certificate '{path}': {source}")]
    ReadCertificate {
        /// Certificate path.
        path: Utf8PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// No usable certificate could be added to the trust pool.
    #[error("bad certificate")]
    BadCertificate,
}

impl DialerError {
    fn bad_pair(reason: impl fmt::Display) -> Self {
        Self::BadCertificatePair {
            reason: reason.to_string(),
        }
    }
}

/// Builds the dial option for `tls`.
///
/// Neither path set yields plain TCP; exactly one set is an error. The name
/// checked against peer certificates is `tls.server_name`, else the first DNS
/// name of the local certificate, else the host of the dialled address.
pub fn dialer_for(tls: &TlsConfig) -> Result<DialOption, DialerError> {
    match (tls.cert_file(), tls.key_file()) {
        (None, None) => Ok(DialOption::plain()),
        (Some(cert), Some(key)) => {
            let chain = load_chain(cert)?;
            let server_name = tls
                .server_name
                .clone()
                .or_else(|| chain.first().and_then(first_dns_name));
            let config = client_config(cert, chain, key)?;
            Ok(DialOption {
                dial: dial_with_tls(config, server_name),
                tls: true,
            })
        }
        _ => Err(DialerError::IncompletePair),
    }
}

fn load_chain(cert: &Utf8Path) -> Result<Vec<CertificateDer<'static>>, DialerError> {
    let chain = CertificateDer::pem_file_iter(cert)
        .map_err(DialerError::bad_pair)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(DialerError::bad_pair)?;
    if chain.is_empty() {
        return Err(DialerError::bad_pair(format!("no certificate in '{cert}'")));
    }
    Ok(chain)
}

fn first_dns_name(cert: &CertificateDer<'_>) -> Option<String> {
    let parsed = webpki::EndEntityCert::try_from(cert).ok()?;
    parsed.valid_dns_names().next().map(str::to_owned)
}

fn client_config(
    cert: &Utf8Path,
    chain: Vec<CertificateDer<'static>>,
    key: &Utf8Path,
) -> Result<Arc<ClientConfig>, DialerError> {
    let private_key = PrivateKeyDer::from_pem_file(key).map_err(DialerError::bad_pair)?;

    let raw = fs::read(cert).map_err(|source| DialerError::ReadCertificate {
        path: cert.to_path_buf(),
        source,
    })?;
    let pool = CertificateDer::pem_slice_iter(&raw)
        .filter_map(Result::ok)
        .collect::<Vec<_>>();
    let mut roots = RootCertStore::empty();
    let (added, _ignored) = roots.add_parsable_certificates(pool.iter().cloned());
    if added == 0 {
        return Err(DialerError::BadCertificate);
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let verifier = ClusterCertVerifier::new(pool, roots, &provider)?;
    let config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(DialerError::bad_pair)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_auth_cert(chain, private_key)
        .map_err(DialerError::bad_pair)?;
    Ok(Arc::new(config))
}

/// Accepts peers presenting a certificate from the trust pool verbatim, and
/// otherwise requires a chain to one of the pool's certificates.
#[derive(Debug)]
struct ClusterCertVerifier {
    pool: Vec<CertificateDer<'static>>,
    chained: Arc<WebPkiServerVerifier>,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClusterCertVerifier {
    fn new(
        pool: Vec<CertificateDer<'static>>,
        roots: RootCertStore,
        provider: &Arc<CryptoProvider>,
    ) -> Result<Self, DialerError> {
        let chained =
            WebPkiServerVerifier::builder_with_provider(Arc::new(roots), Arc::clone(provider))
                .build()
                .map_err(DialerError::bad_pair)?;
        Ok(Self {
            pool,
            chained,
            algorithms: provider.signature_verification_algorithms,
        })
    }

    fn is_pooled(&self, end_entity: &CertificateDer<'_>) -> bool {
        self.pool
            .iter()
            .any(|trusted| trusted.as_ref() == end_entity.as_ref())
    }
}

impl ServerCertVerifier for ClusterCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if self.is_pooled(end_entity) {
            return Ok(ServerCertVerified::assertion());
        }
        self.chained
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

fn dial_with_tls(config: Arc<ClientConfig>, server_name: Option<String>) -> Arc<DialFn> {
    Arc::new(
        move |ctx: &CancellationToken, address: &str| -> io::Result<Box<dyn PeerStream>> {
            let name = resolve_server_name(server_name.as_deref(), address)?;
            let mut socket = connect(ctx, address)?;
            let mut connection =
                ClientConnection::new(Arc::clone(&config), name).map_err(io::Error::other)?;
            handshake(ctx, &mut connection, &mut socket)?;
            Ok(Box::new(StreamOwned::new(connection, socket)))
        },
    )
}

/// Drives the handshake in short socket timeouts so `ctx` is rechecked while
/// the peer is silent. Timeouts are cleared again before returning.
fn handshake(
    ctx: &CancellationToken,
    connection: &mut ClientConnection,
    socket: &mut TcpStream,
) -> io::Result<()> {
    socket.set_read_timeout(Some(CANCEL_POLL))?;
    socket.set_write_timeout(Some(CANCEL_POLL))?;
    while connection.is_handshaking() {
        if ctx.is_cancelled() {
            return Err(cancelled());
        }
        match connection.complete_io(socket) {
            Ok(_) => {}
            Err(error) if is_poll_timeout(&error) => {}
            Err(error) => return Err(error),
        }
    }
    socket.set_read_timeout(None)?;
    socket.set_write_timeout(None)
}

fn is_poll_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn resolve_server_name(
    configured: Option<&str>,
    address: &str,
) -> io::Result<ServerName<'static>> {
    let host = configured.unwrap_or_else(|| host_of(address));
    ServerName::try_from(host.to_owned())
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidInput, error))
}

fn host_of(address: &str) -> &str {
    let host = address
        .rsplit_once(':')
        .map_or(address, |(host, _port)| host);
    host.trim_start_matches('[').trim_end_matches(']')
}
