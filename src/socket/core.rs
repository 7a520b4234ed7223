//! The per-socket state machine bridging blocking callers onto the reactor.

use crate::addr::{resolve_one, Endpoint, Family};
use crate::error::SockError;
use crate::options::{self, OptEntry, OptionTable, OptValue, Proto};
use crate::ready::{Notice, SelectorList};
use crate::runtime::{self, Completion, PopError, SharedCompletion, WaitQueue};
use crate::transport::{datagram, listener, stream, Channel, ChannelKind};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Socket type, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SockType {
  Stream,
  Datagram,
}

impl SockType {
  pub(crate) fn proto(&self) -> Proto {
    match self {
      SockType::Stream => Proto::Tcp,
      SockType::Datagram => Proto::Udp,
    }
  }
}

/// Lifecycle role of a socket: unassigned until connect/listen/first
/// datagram I/O commits it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketKind {
  Unassigned,
  Client,
  Server,
  Datagram,
}

/// Progress report from `connect_ex`, mirroring POSIX status codes rather
/// than surfacing errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStatus {
  /// First observation of a connect still in flight (EINPROGRESS).
  InProgress,
  /// Connect was already in flight on an earlier call (EALREADY).
  Already,
  /// The connect future resolved successfully (EISCONN).
  Connected,
  /// The connect future resolved with a failure (ENOTCONN).
  NotConnected,
  /// Starting the connect failed outright; carries the errno analogue.
  Failed(i32),
}

impl ConnectStatus {
  pub fn errno(&self) -> i32 {
    match self {
      ConnectStatus::InProgress => libc::EINPROGRESS,
      ConnectStatus::Already => libc::EALREADY,
      ConnectStatus::Connected => libc::EISCONN,
      ConnectStatus::NotConnected => libc::ENOTCONN,
      ConnectStatus::Failed(code) => *code,
    }
  }

  pub fn is_connected(&self) -> bool {
    matches!(self, ConnectStatus::Connected)
  }
}

/// Message delivered by a channel's reader task.
#[derive(Debug)]
pub(crate) enum InboundMsg {
  Data(Bytes),
  DatagramFrom { data: Bytes, from: SocketAddr },
  /// Sentinel: the peer closed the channel. Converted to a single empty
  /// read, after which `peer_closed` latches.
  PeerClosed,
}

/// A not-yet-accepted child produced by the listener's accept loop.
pub(crate) struct AcceptedChild {
  pub core: Arc<SocketCore>,
  pub peer: SocketAddr,
}

/// State shared between a listening parent and its accepted children.
///
/// `accepted_children` starts at one, counting the parent itself, so the
/// listener's resources are released only when the parent and every
/// accepted child have closed (composition replacing the original
/// parent/child inheritance coupling).
pub(crate) struct ServerShared {
  pub backlog: WaitQueue<AcceptedChild>,
  pub accepted_children: Mutex<i64>,
  pub local_addr: SocketAddr,
}

impl ServerShared {
  /// Called whenever a member (parent or accepted child) closes. The group
  /// is released only when the count reaches zero.
  pub fn child_closed(&self) {
    let mut count = self.accepted_children.lock();
    *count -= 1;
    if *count <= 0 {
      tracing::debug!(local_addr = %self.local_addr, "Last member of server group closed, group released");
    }
  }
}

/// Partially consumed inbound buffer carried across reads so the stream is
/// never reordered or duplicated. Holding this lock also serializes
/// concurrent `recv` calls.
#[derive(Debug, Default)]
struct RecvHead {
  head: Option<(Bytes, Option<SocketAddr>)>,
}

#[derive(Debug)]
struct OpenState {
  count: usize,
}

pub(crate) struct SocketCore {
  pub id: u64,
  pub family: Family,
  pub stype: SockType,
  pub kind: RwLock<SocketKind>,
  /// None = block forever, Some(ZERO) = never block, Some(d) = bounded.
  /// Read at call time by every blocking operation, never cached.
  timeout: RwLock<Option<Duration>>,
  /// The requested bind address; None is the wildcard ephemeral placeholder.
  pub bind_addr: RwLock<Option<SocketAddr>>,
  pub channel: RwLock<Option<Arc<Channel>>>,
  connect_done: RwLock<Option<SharedCompletion<Result<(), SockError>>>>,
  connect_started: AtomicBool,
  pub incoming: WaitQueue<InboundMsg>,
  recv_head: Mutex<RecvHead>,
  /// Mirrors `recv_head` occupancy. Readiness checks read this instead of
  /// the head mutex, which a blocked `recv` holds for its whole wait.
  head_present: AtomicBool,
  pub peer_closed: AtomicBool,
  pub channel_closed: AtomicBool,
  can_write: AtomicBool,
  pub options: OptionTable,
  pub selectors: SelectorList,
  last_error: AtomicI32,
  open: Mutex<OpenState>,
  /// Set when this socket is a listening parent.
  pub server: RwLock<Option<Arc<ServerShared>>>,
  /// Set when this socket was produced by a listener.
  parent_server: RwLock<Option<Arc<ServerShared>>>,
  /// Whether an accept() call has handed this child to the application.
  accepted: AtomicBool,
}

impl std::fmt::Debug for SocketCore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SocketCore")
      .field("id", &self.id)
      .field("kind", &*self.kind.read())
      .field("timeout", &*self.timeout.read())
      .finish_non_exhaustive()
  }
}

impl SocketCore {
  pub fn new(family: Family, stype: SockType, timeout: Option<Duration>) -> Arc<Self> {
    Arc::new(Self {
      id: runtime::next_sock_id(),
      family,
      stype,
      kind: RwLock::new(SocketKind::Unassigned),
      timeout: RwLock::new(timeout),
      bind_addr: RwLock::new(None),
      channel: RwLock::new(None),
      connect_done: RwLock::new(None),
      connect_started: AtomicBool::new(false),
      incoming: WaitQueue::unbounded(),
      recv_head: Mutex::new(RecvHead::default()),
      head_present: AtomicBool::new(false),
      peer_closed: AtomicBool::new(false),
      channel_closed: AtomicBool::new(false),
      can_write: AtomicBool::new(true),
      options: OptionTable::new(stype.proto()),
      selectors: SelectorList::new(),
      last_error: AtomicI32::new(0),
      open: Mutex::new(OpenState { count: 1 }),
      server: RwLock::new(None),
      parent_server: RwLock::new(None),
      accepted: AtomicBool::new(false),
    })
  }

  /// Builds an accepted child: client kind, pending channel, options copied
  /// from the parent so subsequent divergence is independent, timeout
  /// inherited.
  pub(crate) fn new_child(
    parent: &SocketCore,
    channel: Arc<Channel>,
    server: Arc<ServerShared>,
  ) -> Arc<Self> {
    let child = Arc::new(Self {
      id: runtime::next_sock_id(),
      family: parent.family,
      stype: SockType::Stream,
      kind: RwLock::new(SocketKind::Client),
      timeout: RwLock::new(*parent.timeout.read()),
      bind_addr: RwLock::new(None),
      channel: RwLock::new(Some(channel)),
      connect_done: RwLock::new(None),
      connect_started: AtomicBool::new(true),
      incoming: WaitQueue::unbounded(),
      recv_head: Mutex::new(RecvHead::default()),
      head_present: AtomicBool::new(false),
      peer_closed: AtomicBool::new(false),
      channel_closed: AtomicBool::new(false),
      can_write: AtomicBool::new(true),
      options: parent.options.snapshot(),
      selectors: SelectorList::new(),
      last_error: AtomicI32::new(0),
      open: Mutex::new(OpenState { count: 1 }),
      server: RwLock::new(None),
      parent_server: RwLock::new(Some(server)),
      accepted: AtomicBool::new(false),
    });
    let done = Completion::new();
    done.set(Ok(()));
    *child.connect_done.write() = Some(done);
    child
  }

  // --- Small accessors ---

  pub fn timeout(&self) -> Option<Duration> {
    *self.timeout.read()
  }

  pub fn set_timeout(&self, timeout: Option<Duration>) {
    *self.timeout.write() = timeout;
  }

  pub fn kind(&self) -> SocketKind {
    *self.kind.read()
  }

  fn nonblocking(timeout: Option<Duration>) -> bool {
    matches!(timeout, Some(d) if d.is_zero())
  }

  pub(crate) fn channel_ref(&self) -> Option<Arc<Channel>> {
    self.channel.read().clone()
  }

  fn require_channel(&self) -> Result<Arc<Channel>, SockError> {
    self.channel_ref().ok_or(SockError::NotConnected)
  }

  /// Latches the errno analogue of a failed operation for SO_ERROR.
  pub(crate) fn latch<T>(&self, result: Result<T, SockError>) -> Result<T, SockError> {
    if let Err(e) = &result {
      self.last_error.store(e.code(), Ordering::SeqCst);
    }
    result
  }

  pub(crate) fn latch_code(&self, code: i32) {
    self.last_error.store(code, Ordering::SeqCst);
  }

  pub(crate) fn notify_selectors(self: &Arc<Self>, notice: Notice) {
    for sink in self.selectors.snapshot() {
      sink.notify(self, notice);
    }
  }

  /// Starts the channel's I/O tasks if the stream is still pending.
  /// Registering with the readiness registry, reading, writing, and
  /// shutdown all activate; a TLS wrap claims the stream instead.
  pub(crate) fn ensure_active(self: &Arc<Self>) -> Result<(), SockError> {
    if let Some(channel) = self.channel_ref() {
      if channel.kind == ChannelKind::Stream {
        stream::activate(self, &channel)?;
      }
    }
    Ok(())
  }

  // --- bind / connect ---

  pub fn bind(self: &Arc<Self>, endpoint: &Endpoint) -> Result<(), SockError> {
    let result = self.bind_inner(endpoint);
    self.latch(result)
  }

  fn bind_inner(self: &Arc<Self>, endpoint: &Endpoint) -> Result<(), SockError> {
    if self.channel.read().is_some() {
      return Err(SockError::InvalidState("cannot bind after the channel exists"));
    }
    let addr = resolve_one(endpoint, self.family, true)?;
    tracing::debug!(sock_id = self.id, %addr, "Binding socket");
    *self.bind_addr.write() = Some(addr);
    if self.stype == SockType::Datagram {
      datagram::ensure_channel(self)?;
    }
    Ok(())
  }

  pub fn connect(self: &Arc<Self>, endpoint: &Endpoint) -> Result<(), SockError> {
    let result = self.connect_inner(endpoint);
    self.latch(result)
  }

  fn connect_inner(self: &Arc<Self>, endpoint: &Endpoint) -> Result<(), SockError> {
    match self.stype {
      SockType::Datagram => {
        let addr = resolve_one(endpoint, self.family, false)?;
        let result = datagram::connect(self, addr);
        // connect_ex observes datagram connects through the same latch as
        // stream connects.
        let done = Completion::new();
        done.set(result.clone());
        self.connect_started.store(true, Ordering::SeqCst);
        *self.connect_done.write() = Some(done);
        result
      }
      SockType::Stream => {
        if self.kind() == SocketKind::Server {
          return Err(SockError::InvalidState("cannot connect a listening socket"));
        }
        if self.connect_started.swap(true, Ordering::SeqCst) {
          return Err(SockError::AlreadyConnected);
        }
        let addr = resolve_one(endpoint, self.family, false)?;
        *self.kind.write() = SocketKind::Client;
        let done = stream::start_connect(self, addr);
        *self.connect_done.write() = Some(done.clone());

        let timeout = self.timeout();
        if Self::nonblocking(timeout) {
          // Non-blocking connect only initiates; progress is observed
          // through connect_ex.
          return Ok(());
        }
        match done.wait(timeout) {
          Some(result) => result,
          None => Err(SockError::Timeout),
        }
      }
    }
  }

  /// Non-raising connect progress probe (POSIX `connect_ex`).
  pub fn connect_ex(self: &Arc<Self>, endpoint: &Endpoint) -> ConnectStatus {
    let was_connecting = self.connect_started.load(Ordering::SeqCst);
    if !was_connecting {
      if let Err(e) = self.connect(endpoint) {
        self.latch_code(e.code());
        return ConnectStatus::Failed(e.code());
      }
    }
    let done = match self.connect_done.read().clone() {
      Some(done) => done,
      None => return ConnectStatus::Failed(libc::ENOTCONN),
    };
    if !done.is_done() && was_connecting {
      // Callers in non-blocking mode poll this; a tiny bounded wait keeps
      // them from busy-spinning without turning the probe into a real wait.
      done.wait(Some(Duration::from_micros(1500)));
    }
    match done.try_get() {
      None => {
        if was_connecting {
          ConnectStatus::Already
        } else {
          ConnectStatus::InProgress
        }
      }
      Some(Ok(())) => ConnectStatus::Connected,
      Some(Err(e)) => {
        self.latch_code(e.code());
        ConnectStatus::NotConnected
      }
    }
  }

  // --- listen / accept ---

  pub fn listen(self: &Arc<Self>, backlog: usize) -> Result<(), SockError> {
    let result = self.listen_inner(backlog);
    self.latch(result)
  }

  fn listen_inner(self: &Arc<Self>, backlog: usize) -> Result<(), SockError> {
    if self.stype != SockType::Stream {
      return Err(SockError::InvalidState("listen requires a stream socket"));
    }
    match self.kind() {
      SocketKind::Unassigned => {}
      SocketKind::Server => return Err(SockError::InvalidState("socket is already listening")),
      _ => return Err(SockError::InvalidState("cannot listen on a connected socket")),
    }
    let server = listener::start(self, backlog)?;
    *self.server.write() = Some(server);
    *self.kind.write() = SocketKind::Server;
    Ok(())
  }

  pub fn accept(self: &Arc<Self>) -> Result<(Arc<SocketCore>, SocketAddr), SockError> {
    let result = self.accept_inner();
    self.latch(result)
  }

  fn accept_inner(self: &Arc<Self>) -> Result<(Arc<SocketCore>, SocketAddr), SockError> {
    let server = self
      .server
      .read()
      .clone()
      .ok_or(SockError::InvalidState("socket is not listening"))?;
    let timeout = self.timeout();
    let child = match server.backlog.pop(timeout) {
      Ok(child) => child,
      Err(PopError::Empty) => return Err(SockError::WouldBlock),
      Err(PopError::TimedOut) => return Err(SockError::Timeout),
    };
    child.core.accepted.store(true, Ordering::SeqCst);
    *server.accepted_children.lock() += 1;
    tracing::debug!(sock_id = self.id, child_id = child.core.id, peer = %child.peer, "Accepted child socket");
    Ok((child.core, child.peer))
  }

  // --- send path ---

  pub fn send(self: &Arc<Self>, data: &[u8]) -> Result<usize, SockError> {
    let result = self.send_inner(data);
    self.latch(result)
  }

  fn send_inner(self: &Arc<Self>, data: &[u8]) -> Result<usize, SockError> {
    match self.stype {
      SockType::Datagram => {
        let channel = datagram::ensure_channel(self)?;
        let peer = channel.peer().ok_or(SockError::NotConnected)?;
        datagram::send_to(self, &channel, data, peer)
      }
      SockType::Stream => {
        let channel = self.require_channel()?;
        self.ensure_active()?;
        if !self.can_write.load(Ordering::SeqCst) {
          return Err(SockError::NotConnected);
        }
        stream::send(self, &channel, data)
      }
    }
  }

  /// Loops `send` until every byte is written. Each round is subject to the
  /// socket timeout independently, like the underlying write futures.
  pub fn sendall(self: &Arc<Self>, data: &[u8]) -> Result<(), SockError> {
    let mut offset = 0;
    while offset < data.len() {
      offset += self.send(&data[offset..])?;
    }
    Ok(())
  }

  pub fn sendto(self: &Arc<Self>, data: &[u8], endpoint: &Endpoint) -> Result<usize, SockError> {
    let result = self.sendto_inner(data, endpoint);
    self.latch(result)
  }

  fn sendto_inner(self: &Arc<Self>, data: &[u8], endpoint: &Endpoint) -> Result<usize, SockError> {
    if self.stype != SockType::Datagram {
      return Err(SockError::InvalidState("sendto requires a datagram socket"));
    }
    let addr = resolve_one(endpoint, self.family, false)?;
    let channel = datagram::ensure_channel(self)?;
    datagram::send_to(self, &channel, data, addr)
  }

  // --- receive path ---

  /// Pops the next message under the timeout contract, honoring the
  /// partially consumed head. Returns `None` exactly at EOF; `peer_closed`
  /// latches so later calls return `None` immediately without waiting.
  fn pop_incoming(
    &self,
    bufsize: usize,
  ) -> Result<Option<(Bytes, Option<SocketAddr>)>, SockError> {
    let mut guard = self.recv_head.lock();
    if guard.head.is_none() {
      if self.peer_closed.load(Ordering::SeqCst) {
        return Ok(None);
      }
      let timeout = self.timeout();
      let msg = match self.incoming.pop(timeout) {
        Ok(msg) => msg,
        Err(PopError::Empty) => return Err(SockError::WouldBlock),
        Err(PopError::TimedOut) => return Err(SockError::Timeout),
      };
      guard.head = match msg {
        InboundMsg::PeerClosed => {
          self.peer_closed.store(true, Ordering::SeqCst);
          return Ok(None);
        }
        InboundMsg::Data(data) => Some((data, None)),
        InboundMsg::DatagramFrom { data, from } => Some((data, Some(from))),
      };
      self.head_present.store(true, Ordering::SeqCst);
    }

    let (buf, from) = guard.head.as_mut().expect("head populated above");
    let take = buf.len().min(bufsize.max(1));
    let chunk = buf.split_to(take);
    let from = *from;
    if buf.is_empty() {
      guard.head = None;
      self.head_present.store(false, Ordering::SeqCst);
    }
    Ok(Some((chunk, from)))
  }

  pub fn recv(self: &Arc<Self>, bufsize: usize) -> Result<Bytes, SockError> {
    let result = self.recvfrom_inner(bufsize).map(|(data, _)| data);
    self.latch(result)
  }

  pub fn recvfrom(self: &Arc<Self>, bufsize: usize) -> Result<(Bytes, SocketAddr), SockError> {
    let result = self.recvfrom_inner(bufsize).and_then(|(data, from)| {
      let from = match from {
        Some(addr) => addr,
        None => self.require_channel()?.peer().ok_or(SockError::NotConnected)?,
      };
      Ok((data, from))
    });
    self.latch(result)
  }

  fn recvfrom_inner(
    self: &Arc<Self>,
    bufsize: usize,
  ) -> Result<(Bytes, Option<SocketAddr>), SockError> {
    if self.stype == SockType::Datagram {
      datagram::ensure_channel(self)?;
    } else {
      self.require_channel()?;
      self.ensure_active()?;
    }
    match self.pop_incoming(bufsize)? {
      Some((data, from)) => Ok((data, from)),
      // EOF: exactly one empty read was produced when the sentinel was
      // consumed; every later call lands here without waiting.
      None => Ok((Bytes::new(), None)),
    }
  }

  pub fn recv_into(self: &Arc<Self>, buf: &mut [u8]) -> Result<usize, SockError> {
    let data = self.recv(buf.len())?;
    buf[..data.len()].copy_from_slice(&data);
    Ok(data.len())
  }

  pub fn recvfrom_into(self: &Arc<Self>, buf: &mut [u8]) -> Result<(usize, SocketAddr), SockError> {
    let (data, from) = self.recvfrom(buf.len())?;
    buf[..data.len()].copy_from_slice(&data);
    Ok((data.len(), from))
  }

  // --- shutdown / close ---

  pub fn shutdown(self: &Arc<Self>, how: Shutdown) -> Result<(), SockError> {
    let result = self.shutdown_inner(how);
    self.latch(result)
  }

  fn shutdown_inner(self: &Arc<Self>, how: Shutdown) -> Result<(), SockError> {
    let channel = self.require_channel()?;
    self.ensure_active()?;
    if matches!(how, Shutdown::Read | Shutdown::Both) {
      // Detach the inbound handler: the reader task stops, already queued
      // data stays readable.
      stream::cancel_reader(&channel);
    }
    if matches!(how, Shutdown::Write | Shutdown::Both) {
      self.can_write.store(false, Ordering::SeqCst);
    }
    Ok(())
  }

  /// Increments the open count for `dup`.
  pub fn incr_open(&self) {
    self.open.lock().count += 1;
  }

  /// Decrements the open count; the last close releases the channel.
  pub fn close(self: &Arc<Self>) {
    {
      let mut open = self.open.lock();
      open.count -= 1;
      if open.count > 0 {
        tracing::debug!(sock_id = self.id, open_count = open.count, "Open count still positive, not closing channel");
        return;
      }
    }
    self.teardown();
  }

  fn teardown(self: &Arc<Self>) {
    tracing::debug!(sock_id = self.id, "Closing socket");
    self.channel_closed.store(true, Ordering::SeqCst);

    if let Some(server) = self.server.write().take() {
      // Unaccepted children are closed, not leaked, and the parent gives up
      // its own membership in the group.
      for child in server.backlog.drain() {
        child.core.close();
      }
      server.child_closed();
    }

    if let Some(channel) = self.channel.write().take() {
      channel.close();
    }
    for _ in self.incoming.drain() {}
    // Wake any reader blocked on the queue so it observes EOF.
    self.incoming.push(InboundMsg::PeerClosed);

    if self.accepted.load(Ordering::SeqCst) {
      if let Some(server) = self.parent_server.read().clone() {
        server.child_closed();
      }
    }

    self.notify_selectors(Notice::hangup());
  }

  // --- readiness predicates (level-triggered re-evaluation) ---

  pub(crate) fn readable(&self) -> bool {
    match self.kind() {
      SocketKind::Client | SocketKind::Datagram => {
        self.head_present.load(Ordering::SeqCst) || !self.incoming.is_empty()
      }
      SocketKind::Server => self
        .server
        .read()
        .as_ref()
        .map(|s| !s.backlog.is_empty())
        .unwrap_or(false),
      SocketKind::Unassigned => false,
    }
  }

  pub(crate) fn writable(&self) -> bool {
    if self.channel_closed.load(Ordering::SeqCst) {
      return true;
    }
    match self.channel_ref() {
      None => false,
      Some(channel) => match channel.kind {
        ChannelKind::Stream => channel.write_budget.load(Ordering::SeqCst) > 0,
        ChannelKind::Datagram => true,
        ChannelKind::Listener => false,
      },
    }
  }

  // --- addresses ---

  pub fn local_addr(&self) -> Result<SocketAddr, SockError> {
    let channel = self.channel_ref();
    match channel {
      None => self.bind_addr.read().ok_or(SockError::NotConnected),
      Some(channel) => {
        let reported = channel.local_addr.ok_or(SockError::NotConnected)?;
        // The reactor may report a wildcard of the wrong family for a
        // dual-stack bind; prefer the known bind request to keep the
        // address family unambiguous.
        if reported.ip().is_unspecified() {
          if let Some(requested) = *self.bind_addr.read() {
            if requested.is_ipv4() != reported.is_ipv4() {
              return Ok(SocketAddr::new(requested.ip(), reported.port()));
            }
          }
        }
        Ok(reported)
      }
    }
  }

  pub fn peer_addr(&self) -> Result<SocketAddr, SockError> {
    self.require_channel()?.peer().ok_or(SockError::NotConnected)
  }

  // --- options ---

  pub fn set_option(
    self: &Arc<Self>,
    level: i32,
    name: i32,
    value: OptValue,
  ) -> Result<(), SockError> {
    let result = self.set_option_inner(level, name, value);
    self.latch(result)
  }

  fn set_option_inner(
    self: &Arc<Self>,
    level: i32,
    name: i32,
    value: OptValue,
  ) -> Result<(), SockError> {
    match options::lookup(self.options.proto(), level, name)? {
      OptEntry::Timeout => {
        let ms = match value {
          OptValue::Int(ms) if ms >= 0 => ms,
          other => {
            return Err(SockError::InvalidArgument(format!(
              "timeout option expects a non-negative int of milliseconds, got {:?}",
              other
            )))
          }
        };
        self.set_timeout(if ms == 0 {
          None
        } else {
          Some(Duration::from_millis(ms as u64))
        });
        Ok(())
      }
      OptEntry::Channel(_) => {
        let channel = self.channel_ref();
        let fd = channel.as_ref().map(|c| &c.fd);
        self.options.set(level, name, value, fd)
      }
    }
  }

  pub fn get_option(self: &Arc<Self>, level: i32, name: i32) -> Result<OptValue, SockError> {
    // Pseudo-options are computed, not stored.
    if level == options::SOL_SOCKET {
      if name == options::SO_ACCEPTCONN {
        return match (self.kind(), self.stype) {
          (SocketKind::Server, _) => Ok(OptValue::Bool(true)),
          (_, SockType::Stream) => Ok(OptValue::Bool(false)),
          _ => Err(SockError::ProtocolNotAvailable(level, name)),
        };
      }
      if name == options::SO_TYPE {
        return Ok(OptValue::Int(match self.stype {
          SockType::Stream => libc::SOCK_STREAM,
          SockType::Datagram => libc::SOCK_DGRAM,
        }));
      }
      if name == options::SO_ERROR {
        // SO_ERROR semantics: read once, then cleared.
        return Ok(OptValue::Int(self.last_error.swap(0, Ordering::SeqCst)));
      }
    }
    match options::lookup(self.options.proto(), level, name)? {
      OptEntry::Timeout => Ok(OptValue::Int(
        self.timeout().map(|d| d.as_millis() as i32).unwrap_or(0),
      )),
      OptEntry::Channel(_) => self.options.get(level, name),
    }
  }

  // --- channel installation (used by transports and the TLS facade) ---

  pub(crate) fn install_channel(self: &Arc<Self>, channel: Arc<Channel>) {
    *self.channel.write() = Some(channel);
  }

  /// Claims the pending stream for a TLS handshake. Fails if I/O tasks have
  /// already started: mid-stream wrapping is not supported.
  #[cfg(feature = "tls")]
  pub(crate) fn take_pending_stream(&self) -> Result<tokio::net::TcpStream, SockError> {
    let channel = self.require_channel()?;
    stream::take_pending(&channel)
  }
}
