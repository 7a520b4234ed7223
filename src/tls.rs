//! TLS facade over a stream socket.
//!
//! Wrapping claims the socket's still-pending stream; the handshake is
//! driven on the reactor like any other one-shot future, after which the
//! negotiated TLS stream is installed as the channel's I/O and the normal
//! reader/writer tasks take over. Application-data methods force the
//! handshake to completion first (respecting the socket timeout) instead of
//! failing.

use crate::error::{SockError, TlsErrorKind};
use crate::ready::Notice;
use crate::runtime::{self, Completion, SharedCompletion};
use crate::socket::core::SocketCore;
use crate::socket::{ConnectStatus, SockType, Socket};
use crate::transport::stream;
use crate::addr::ToEndpoint;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, ProtocolVersion, RootCertStore, ServerConfig};
use std::fs::File;
use std::io::{self, BufReader};
use std::net::{Shutdown, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

/// Handshake progress of a wrapped socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
  NotStarted,
  InProgress,
  Complete,
  Failed,
}

/// Facts captured when the handshake completed.
#[derive(Debug, Clone)]
pub struct HandshakeSummary {
  /// Peer certificate chain, leaf first, in DER form.
  pub peer_certs: Vec<Vec<u8>>,
  pub cipher: Option<String>,
  pub protocol: Option<&'static str>,
}

#[derive(Clone)]
enum Role {
  Client(Arc<ClientConfig>),
  Server(Arc<ServerConfig>),
}

/// Shared TLS configuration, wrapping sockets client- or server-side.
#[derive(Clone)]
pub struct TlsContext {
  role: Role,
}

/// How a client context validates peers.
enum Verify {
  WebPkiRoots,
  CaFile(PathBuf),
  Disabled,
}

pub struct ClientBuilder {
  verify: Verify,
}

/// Per-wrap options.
#[derive(Debug, Clone)]
pub struct WrapOptions {
  /// Name presented for SNI and certificate validation. Falls back to the
  /// peer IP address when absent.
  pub server_name: Option<String>,
  /// Drive the handshake as part of connect/accept. When false the
  /// handshake is deferred to `do_handshake` or the first data operation.
  pub handshake_on_connect: bool,
}

impl Default for WrapOptions {
  fn default() -> Self {
    Self {
      server_name: None,
      handshake_on_connect: true,
    }
  }
}

impl TlsContext {
  /// Starts a client-side context builder validating against the WebPKI
  /// root set by default.
  pub fn client() -> ClientBuilder {
    ClientBuilder {
      verify: Verify::WebPkiRoots,
    }
  }

  /// Builds a server-side context from a PEM certificate chain and key.
  pub fn server(cert_chain_pem: &Path, key_pem: &Path) -> Result<TlsContext, SockError> {
    let certs = load_certs(cert_chain_pem)?;
    let key = rustls_pemfile::private_key(&mut pem_reader(key_pem)?)
      .map_err(|e| SockError::InvalidArgument(format!("unreadable key file: {}", e)))?
      .ok_or_else(|| SockError::InvalidArgument("no private key found in key file".into()))?;
    let config = ServerConfig::builder()
      .with_no_client_auth()
      .with_single_cert(certs, key)
      .map_err(|e| tls_error(TlsErrorKind::HandshakeFailure, e.to_string()))?;
    Ok(TlsContext {
      role: Role::Server(Arc::new(config)),
    })
  }

  pub fn is_server(&self) -> bool {
    matches!(self.role, Role::Server(_))
  }

  /// Wraps a stream socket. The socket's channel must not have started I/O
  /// tasks yet: wrap clients before connect and children at accept.
  pub fn wrap_socket(&self, sock: Socket, opts: WrapOptions) -> Result<TlsSocket, SockError> {
    if sock.sock_type() != SockType::Stream {
      return Err(SockError::InvalidState("only stream sockets can be wrapped"));
    }
    if let Some(channel) = sock.core_ref()?.channel_ref() {
      if channel.kind == crate::transport::ChannelKind::Stream && !channel.is_pending() {
        return Err(SockError::InvalidState("cannot wrap an active socket"));
      }
    }
    Ok(TlsSocket {
      inner: Arc::new(TlsInner {
        sock,
        role: self.role.clone(),
        server_name: opts.server_name,
        handshake_on_connect: opts.handshake_on_connect,
        machine: Mutex::new(Machine {
          state: HandshakeState::NotStarted,
          gate: None,
          error: None,
        }),
        summary: RwLock::new(None),
      }),
    })
  }
}

impl ClientBuilder {
  /// Validates peers against a PEM bundle instead of the WebPKI roots.
  pub fn with_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
    self.verify = Verify::CaFile(path.into());
    self
  }

  /// Disables certificate validation entirely. Test use only.
  pub fn danger_accept_invalid_certs(mut self) -> Self {
    self.verify = Verify::Disabled;
    self
  }

  pub fn build(self) -> Result<TlsContext, SockError> {
    let config = match self.verify {
      Verify::WebPkiRoots => {
        let roots = RootCertStore {
          roots: webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect(),
        };
        ClientConfig::builder()
          .with_root_certificates(roots)
          .with_no_client_auth()
      }
      Verify::CaFile(path) => {
        let mut roots = RootCertStore::empty();
        for cert in load_certs(&path)? {
          roots
            .add(cert)
            .map_err(|e| SockError::InvalidArgument(format!("bad CA certificate: {}", e)))?;
        }
        ClientConfig::builder()
          .with_root_certificates(roots)
          .with_no_client_auth()
      }
      Verify::Disabled => ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth(),
    };
    Ok(TlsContext {
      role: Role::Client(Arc::new(config)),
    })
  }
}

struct Machine {
  state: HandshakeState,
  gate: Option<SharedCompletion<Result<(), SockError>>>,
  error: Option<SockError>,
}

struct TlsInner {
  sock: Socket,
  role: Role,
  server_name: Option<String>,
  handshake_on_connect: bool,
  machine: Mutex<Machine>,
  summary: RwLock<Option<HandshakeSummary>>,
}

/// A stream socket speaking TLS. Exposes the same blocking/non-blocking
/// contract as [`Socket`] with an additional handshake gate.
pub struct TlsSocket {
  inner: Arc<TlsInner>,
}

impl std::fmt::Debug for TlsSocket {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TlsSocket")
      .field("sock", &self.inner.sock)
      .field("state", &self.handshake_state())
      .finish()
  }
}

impl TlsSocket {
  /// The wrapped plain socket, e.g. for readiness registration.
  pub fn socket(&self) -> &Socket {
    &self.inner.sock
  }

  pub fn handshake_state(&self) -> HandshakeState {
    self.inner.machine.lock().state
  }

  pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<(), SockError> {
    self.inner.sock.set_timeout(timeout)
  }

  pub fn timeout(&self) -> Result<Option<Duration>, SockError> {
    self.inner.sock.timeout()
  }

  pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), SockError> {
    self.inner.sock.set_nonblocking(nonblocking)
  }

  /// Connects the wrapped socket, then drives the handshake when
  /// `handshake_on_connect` is set.
  pub fn connect<E: ToEndpoint>(&self, endpoint: E) -> Result<(), SockError> {
    if matches!(self.inner.role, Role::Server(_)) {
      return Err(SockError::InvalidState("cannot connect in server-side mode"));
    }
    self.inner.sock.connect(endpoint)?;
    if self.inner.handshake_on_connect {
      self.do_handshake()?;
    }
    Ok(())
  }

  /// Non-raising connect progress; a handshake failure after transport
  /// connect reports as a failed status code.
  pub fn connect_ex<E: ToEndpoint>(&self, endpoint: E) -> ConnectStatus {
    if matches!(self.inner.role, Role::Server(_)) {
      return ConnectStatus::Failed(SockError::InvalidState("server-side mode").code());
    }
    let status = self.inner.sock.connect_ex(endpoint);
    if status.is_connected() && self.inner.handshake_on_connect {
      if let Err(e) = self.do_handshake() {
        if e == SockError::WouldBlock {
          return ConnectStatus::InProgress;
        }
        return ConnectStatus::Failed(e.code());
      }
    }
    status
  }

  /// Accepts a child and wraps it with this socket's context and policy.
  /// The child's handshake starts only once its channel is initialized.
  pub fn accept(&self) -> Result<(TlsSocket, SocketAddr), SockError> {
    if !matches!(self.inner.role, Role::Server(_)) {
      return Err(SockError::InvalidState("cannot accept in client-side mode"));
    }
    let (child, peer) = self.inner.sock.accept()?;
    let context = TlsContext {
      role: self.inner.role.clone(),
    };
    let wrapped = context.wrap_socket(
      child,
      WrapOptions {
        server_name: None,
        handshake_on_connect: self.inner.handshake_on_connect,
      },
    )?;
    if self.inner.handshake_on_connect {
      wrapped.do_handshake()?;
    }
    Ok((wrapped, peer))
  }

  /// Drives the handshake under the three-way timeout contract: a
  /// non-blocking socket kicks it off and reports `WouldBlock` until it
  /// completes; a bounded socket waits up to its timeout.
  pub fn do_handshake(&self) -> Result<(), SockError> {
    let timeout = self.inner.sock.timeout()?;
    let nonblocking = matches!(timeout, Some(d) if d.is_zero());

    let gate = {
      let mut machine = self.inner.machine.lock();
      match machine.state {
        HandshakeState::Complete => return Ok(()),
        HandshakeState::Failed => {
          return Err(
            machine
              .error
              .clone()
              .unwrap_or_else(|| tls_error(TlsErrorKind::HandshakeFailure, "handshake failed".into())),
          )
        }
        HandshakeState::InProgress => machine.gate.clone().expect("gate set while in progress"),
        HandshakeState::NotStarted => {
          let core = self.inner.sock.core_ref()?.clone();
          let stream = core.take_pending_stream()?;
          let gate = Completion::new();
          machine.state = HandshakeState::InProgress;
          machine.gate = Some(gate.clone());
          drop(machine);
          self.spawn_handshake(core, stream, gate.clone())?;
          gate
        }
      }
    };

    match gate.wait(timeout) {
      Some(Ok(())) => Ok(()),
      Some(Err(e)) => Err(e),
      None => {
        if nonblocking {
          Err(SockError::WouldBlock)
        } else {
          Err(SockError::Timeout)
        }
      }
    }
  }

  fn spawn_handshake(
    &self,
    core: Arc<SocketCore>,
    stream: TcpStream,
    gate: SharedCompletion<Result<(), SockError>>,
  ) -> Result<(), SockError> {
    let reactor = match runtime::reactor() {
      Ok(reactor) => reactor,
      Err(e) => {
        self.finish_handshake(&core, &gate, Err(e.clone()));
        return Err(e);
      }
    };
    let inner = self.inner.clone();
    let this = TlsSocket {
      inner: inner.clone(),
    };
    reactor.spawn(async move {
      let result = run_handshake(&inner, &core, stream).await;
      this.finish_handshake(&core, &gate, result);
    });
    Ok(())
  }

  fn finish_handshake(
    &self,
    core: &Arc<SocketCore>,
    gate: &SharedCompletion<Result<(), SockError>>,
    result: Result<(), SockError>,
  ) {
    {
      let mut machine = self.inner.machine.lock();
      match &result {
        Ok(()) => machine.state = HandshakeState::Complete,
        Err(e) => {
          machine.state = HandshakeState::Failed;
          machine.error = Some(e.clone());
          core.latch_code(e.code());
        }
      }
    }
    gate.set(result.clone());
    match result {
      Ok(()) => core.notify_selectors(Notice::default()),
      Err(_) => core.notify_selectors(Notice::exception()),
    }
  }

  fn ensure_handshake(&self) -> Result<(), SockError> {
    self.do_handshake()
  }

  // --- application data; never touches the wire before COMPLETE ---

  pub fn send(&self, data: &[u8]) -> Result<usize, SockError> {
    self.ensure_handshake()?;
    self.inner.sock.send(data)
  }

  pub fn sendall(&self, data: &[u8]) -> Result<(), SockError> {
    self.ensure_handshake()?;
    self.inner.sock.sendall(data)
  }

  pub fn recv(&self, bufsize: usize) -> Result<Bytes, SockError> {
    self.ensure_handshake()?;
    self.inner.sock.recv(bufsize)
  }

  pub fn recv_into(&self, buf: &mut [u8]) -> Result<usize, SockError> {
    self.ensure_handshake()?;
    self.inner.sock.recv_into(buf)
  }

  pub fn shutdown(&self, how: Shutdown) -> Result<(), SockError> {
    self.inner.sock.shutdown(how)
  }

  pub fn close(&self) {
    self.inner.sock.close()
  }

  pub fn local_addr(&self) -> Result<SocketAddr, SockError> {
    self.inner.sock.local_addr()
  }

  pub fn peer_addr(&self) -> Result<SocketAddr, SockError> {
    self.inner.sock.peer_addr()
  }

  // --- negotiated session facts ---

  /// Peer certificate chain (DER, leaf first) once the handshake is
  /// complete.
  pub fn peer_certificates(&self) -> Option<Vec<Vec<u8>>> {
    self.inner.summary.read().as_ref().map(|s| s.peer_certs.clone())
  }

  pub fn cipher(&self) -> Option<String> {
    self.inner.summary.read().as_ref().and_then(|s| s.cipher.clone())
  }

  pub fn protocol_version(&self) -> Option<&'static str> {
    self.inner.summary.read().as_ref().and_then(|s| s.protocol)
  }
}

async fn run_handshake(
  inner: &Arc<TlsInner>,
  core: &Arc<SocketCore>,
  stream: TcpStream,
) -> Result<(), SockError> {
  let channel = core
    .channel_ref()
    .ok_or(SockError::NotConnected)?;
  match &inner.role {
    Role::Client(config) => {
      let name: ServerName<'static> = match &inner.server_name {
        Some(name) => ServerName::try_from(name.clone())
          .map_err(|_| SockError::InvalidArgument(format!("invalid server name: {}", name)))?,
        None => {
          let peer = channel.peer().ok_or(SockError::NotConnected)?;
          ServerName::from(peer.ip())
        }
      };
      tracing::debug!(sock_id = core.id, "Starting client TLS handshake");
      let tls = TlsConnector::from(config.clone())
        .connect(name, stream)
        .await
        .map_err(map_tls_io_error)?;
      {
        let (_, conn) = tls.get_ref();
        *inner.summary.write() = Some(summarize(conn));
      }
      stream::install_io(core, &channel, tls)
    }
    Role::Server(config) => {
      tracing::debug!(sock_id = core.id, "Starting server TLS handshake");
      let tls = TlsAcceptor::from(config.clone())
        .accept(stream)
        .await
        .map_err(map_tls_io_error)?;
      {
        let (_, conn) = tls.get_ref();
        *inner.summary.write() = Some(summarize(conn));
      }
      stream::install_io(core, &channel, tls)
    }
  }
}

fn summarize<T>(conn: &rustls::ConnectionCommon<T>) -> HandshakeSummary {
  let peer_certs = conn
    .peer_certificates()
    .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
    .unwrap_or_default();
  let cipher = conn
    .negotiated_cipher_suite()
    .map(|suite| format!("{:?}", suite.suite()));
  let protocol = conn.protocol_version().map(protocol_name);
  HandshakeSummary {
    peer_certs,
    cipher,
    protocol,
  }
}

fn protocol_name(version: ProtocolVersion) -> &'static str {
  match version {
    ProtocolVersion::TLSv1_2 => "TLSv1.2",
    ProtocolVersion::TLSv1_3 => "TLSv1.3",
    _ => "unknown",
  }
}

pub(crate) fn tls_error(kind: TlsErrorKind, detail: String) -> SockError {
  SockError::Tls { kind, detail }
}

fn tls_error_kind(e: &rustls::Error) -> TlsErrorKind {
  match e {
    rustls::Error::InvalidCertificate(_) => TlsErrorKind::PeerUnverified,
    rustls::Error::NoCertificatesPresented => TlsErrorKind::PeerUnverified,
    rustls::Error::InvalidMessage(_) => TlsErrorKind::BadRecord,
    rustls::Error::PeerIncompatible(_) => TlsErrorKind::ProtocolMismatch,
    _ => TlsErrorKind::HandshakeFailure,
  }
}

/// Maps a handshake I/O failure to exactly one taxonomy kind: rustls
/// errors become `Tls`, plain transport failures keep their connection
/// kind.
fn map_tls_io_error(e: io::Error) -> SockError {
  if let Some(inner) = e.get_ref() {
    if let Some(tls) = inner.downcast_ref::<rustls::Error>() {
      return tls_error(tls_error_kind(tls), tls.to_string());
    }
  }
  SockError::from_io(e)
}

fn pem_reader(path: &Path) -> Result<BufReader<File>, SockError> {
  File::open(path)
    .map(BufReader::new)
    .map_err(|e| SockError::InvalidArgument(format!("cannot open {}: {}", path.display(), e)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, SockError> {
  rustls_pemfile::certs(&mut pem_reader(path)?)
    .collect::<Result<Vec<_>, _>>()
    .map_err(|e| SockError::InvalidArgument(format!("bad certificate file {}: {}", path.display(), e)))
}

/// Certificate verifier that accepts anything; used only when the builder
/// explicitly opted out of validation.
#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer<'_>,
    _intermediates: &[CertificateDer<'_>],
    _server_name: &ServerName<'_>,
    _ocsp_response: &[u8],
    _now: rustls::pki_types::UnixTime,
  ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
    Ok(rustls::client::danger::ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer<'_>,
    _dss: &rustls::DigitallySignedStruct,
  ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
    Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer<'_>,
    _dss: &rustls::DigitallySignedStruct,
  ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
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
      rustls::SignatureScheme::ED25519,
    ]
  }
}
