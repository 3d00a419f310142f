//! One client session, from raw handshake to disconnect.
//!
//! The transport produces its accept/reject decision from a listener-side
//! callback, before the connection object exists, while the decision itself
//! depends on blocking authentication. The two rendezvous channels below
//! resolve that: the listener offers the raw request on the first (and gets
//! a continue/decline reply), then hands over the established connection on
//! the second once it has finalized the accept.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Conf;
use crate::error::SessionError;
use crate::hooks::{self, CmdPool};
use crate::path::{AccessRequest, PathManager, PROTOCOL};
use crate::publish;
use crate::read;
use crate::stream_id::{Mode, StreamId};
use crate::transport::{Conn, ConnRequest};

/// Pause applied after an authentication failure, to slow down brute force
/// probing.
pub const PAUSE_AFTER_AUTH_ERROR: Duration = Duration::from_secs(2);

fn check_passphrase(request: &dyn ConnRequest, passphrase: Option<&str>) -> Result<(), SessionError> {
	let passphrase = match passphrase {
		Some(passphrase) if !passphrase.is_empty() => passphrase,
		_ => return Ok(()),
	};

	if !request.is_encrypted() {
		return Err(SessionError::NotEncrypted);
	}

	request
		.set_passphrase(passphrase)
		.map_err(|_| SessionError::InvalidPassphrase)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
	Idle,
	Publish,
	Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DescriptorKind {
	Source,
	Reader,
}

impl fmt::Display for DescriptorKind {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Source => f.write_str("source"),
			Self::Reader => f.write_str("reader"),
		}
	}
}

/// Stable identity descriptor consumed by the routing authority and hooks.
#[derive(Debug, Clone, Serialize)]
pub struct Descriptor {
	pub kind: DescriptorKind,
	pub id: String,
}

/// Read-only status projection for introspection APIs.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
	pub id: Uuid,
	pub created: SystemTime,
	pub remote_addr: SocketAddr,
	pub state: SessionState,
	pub path: String,
	pub query: String,
	pub bytes_received: u64,
	pub bytes_sent: u64,
}

struct Status {
	state: SessionState,
	path: String,
	query: String,
	conn: Option<Arc<Conn>>,
}

struct Shared {
	id: Uuid,
	created: SystemTime,
	remote_addr: SocketAddr,
	token: CancellationToken,
	status: RwLock<Status>,
}

/// The listener's rendezvous with the session task; used exactly once.
struct Handoff {
	request: Arc<dyn ConnRequest>,
	reply: oneshot::Sender<bool>,
}

pub struct SessionParams {
	pub conf: Conf,
	pub remote_addr: SocketAddr,
	pub path_manager: Arc<dyn PathManager>,
	pub cmd_pool: Arc<CmdPool>,
	pub parent: CancellationToken,
	pub on_close: mpsc::UnboundedSender<Uuid>,
}

/// Cheap handle to a session. The run loop owns the channel receivers, so
/// the handoff and connection channels each have exactly one consumer.
#[derive(Clone)]
pub struct Session {
	shared: Arc<Shared>,
	ch_new: mpsc::Sender<Handoff>,
	ch_set_conn: mpsc::Sender<Conn>,
}

impl Session {
	/// Create a session; the caller spawns the returned runner.
	pub fn new(params: SessionParams) -> (Session, SessionRunner) {
		let shared = Arc::new(Shared {
			id: Uuid::new_v4(),
			created: SystemTime::now(),
			remote_addr: params.remote_addr,
			token: params.parent.child_token(),
			status: RwLock::new(Status {
				state: SessionState::Idle,
				path: String::new(),
				query: String::new(),
				conn: None,
			}),
		});

		let (new_tx, new_rx) = mpsc::channel(1);
		let (conn_tx, conn_rx) = mpsc::channel(1);

		log::info!("session opened: id={} addr={}", shared.id, shared.remote_addr);

		let session = Session {
			shared: shared.clone(),
			ch_new: new_tx,
			ch_set_conn: conn_tx,
		};

		let runner = SessionRunner {
			shared,
			conf: params.conf,
			path_manager: params.path_manager,
			cmd_pool: params.cmd_pool,
			ch_new: new_rx,
			ch_set_conn: conn_rx,
			on_close: params.on_close,
		};

		(session, runner)
	}

	pub fn id(&self) -> Uuid {
		self.shared.id
	}

	pub fn created(&self) -> SystemTime {
		self.shared.created
	}

	pub fn remote_addr(&self) -> SocketAddr {
		self.shared.remote_addr
	}

	/// Offer a raw handshake to the session.
	///
	/// Returns false when the session declines or is already gone; the
	/// listener then synthesizes the rejection. The reply arrives only
	/// after authentication ran on the session's own task.
	pub async fn offer(&self, request: Arc<dyn ConnRequest>) -> bool {
		let (reply_tx, reply_rx) = oneshot::channel();

		let handoff = Handoff {
			request,
			reply: reply_tx,
		};

		tokio::select! {
			res = self.ch_new.send(handoff) => match res {
				Ok(()) => reply_rx.await.unwrap_or(false),
				Err(_) => false,
			},
			_ = self.shared.token.cancelled() => false,
		}
	}

	/// Hand the established connection to the session. Only meaningful once,
	/// after [Session::offer] returned true; a second call is never observed
	/// by the run loop.
	pub async fn supply_conn(&self, conn: Conn) {
		tokio::select! {
			res = self.ch_set_conn.send(conn) => {
				res.ok();
			}
			_ = self.shared.token.cancelled() => {}
		}
	}

	/// Cancel the session. Idempotent; unblocks every wait, closes any live
	/// connection and lets the run loop tear down.
	pub fn close(&self) {
		self.shared.token.cancel();
	}

	pub fn describe_as_source(&self) -> Descriptor {
		Descriptor {
			kind: DescriptorKind::Source,
			id: self.shared.id.to_string(),
		}
	}

	pub fn describe_as_reader(&self) -> Descriptor {
		Descriptor {
			kind: DescriptorKind::Reader,
			id: self.shared.id.to_string(),
		}
	}

	pub fn snapshot(&self) -> SessionInfo {
		let status = self.shared.status.read().unwrap();
		let stats = status.conn.as_ref().map(|c| c.stats()).unwrap_or_default();

		SessionInfo {
			id: self.shared.id,
			created: self.shared.created,
			remote_addr: self.shared.remote_addr,
			state: status.state,
			path: status.path.clone(),
			query: status.query.clone(),
			bytes_received: stats.bytes_received,
			bytes_sent: stats.bytes_sent,
		}
	}
}

pub struct SessionRunner {
	shared: Arc<Shared>,
	conf: Conf,
	path_manager: Arc<dyn PathManager>,
	cmd_pool: Arc<CmdPool>,
	ch_new: mpsc::Receiver<Handoff>,
	ch_set_conn: mpsc::Receiver<Conn>,
	on_close: mpsc::UnboundedSender<Uuid>,
}

impl SessionRunner {
	pub async fn run(mut self) {
		let on_disconnect = hooks::on_connect(hooks::OnConnectParams {
			pool: self.cmd_pool.clone(),
			run_on_connect: self.conf.run_on_connect.clone(),
			run_on_connect_restart: self.conf.run_on_connect_restart,
			run_on_disconnect: self.conf.run_on_disconnect.clone(),
			remote_addr: self.shared.remote_addr,
			desc: Descriptor {
				kind: DescriptorKind::Reader,
				id: self.shared.id.to_string(),
			},
		});

		let res = self.run_inner().await;

		self.shared.token.cancel();
		self.on_close.send(self.shared.id).ok();

		match res {
			Ok(()) => log::info!("session closed: id={}", self.shared.id),
			Err(err) => log::info!("session closed: id={} err={}", self.shared.id, err),
		}

		drop(on_disconnect);
	}

	async fn run_inner(&mut self) -> Result<(), SessionError> {
		let handoff = tokio::select! {
			handoff = self.ch_new.recv() => match handoff {
				Some(handoff) => handoff,
				None => return Err(SessionError::Terminated),
			},
			_ = self.shared.token.cancelled() => return Err(SessionError::Terminated),
		};

		let Handoff { request, reply } = handoff;
		let mut reply = Some(reply);

		let res = self.serve(request, &mut reply).await;

		// every observed handoff gets exactly one reply
		if let Some(reply) = reply.take() {
			reply.send(false).ok();
		}

		res
	}

	async fn serve(
		&mut self,
		request: Arc<dyn ConnRequest>,
		reply: &mut Option<oneshot::Sender<bool>>,
	) -> Result<(), SessionError> {
		let raw = request.stream_id().to_string();

		let stream_id: StreamId = match raw.parse() {
			Ok(stream_id) => stream_id,
			Err(source) => return Err(SessionError::StreamId { id: raw, source }),
		};

		match stream_id.mode {
			Mode::Publish => self.run_publish(request, stream_id, reply).await,
			Mode::Read => self.run_read(request, stream_id, reply).await,
		}
	}

	fn access_request(&self, stream_id: &StreamId, publish: bool) -> AccessRequest {
		AccessRequest {
			name: stream_id.path.clone(),
			ip: self.shared.remote_addr.ip(),
			publish,
			user: stream_id.user.clone(),
			pass: stream_id.pass.clone(),
			proto: PROTOCOL,
			id: self.shared.id,
			query: stream_id.query.clone(),
		}
	}

	fn record(&self, state: SessionState, stream_id: &StreamId, conn: &Arc<Conn>) {
		let mut status = self.shared.status.write().unwrap();
		status.state = state;
		status.path = stream_id.path.clone();
		status.query = stream_id.query.clone();
		status.conn = Some(conn.clone());
	}

	async fn run_publish(
		&mut self,
		request: Arc<dyn ConnRequest>,
		stream_id: StreamId,
		reply: &mut Option<oneshot::Sender<bool>>,
	) -> Result<(), SessionError> {
		let path = match self.path_manager.add_publisher(self.access_request(&stream_id, true)).await {
			Ok(path) => path,
			Err(err) => {
				if err.is_authentication() {
					tokio::time::sleep(PAUSE_AFTER_AUTH_ERROR).await;
				}
				return Err(err.into());
			}
		};

		check_passphrase(request.as_ref(), path.conf().publish_passphrase.as_deref())?;

		let conn = Arc::new(self.exchange_request_with_conn(reply).await?);
		self.record(SessionState::Publish, &stream_id, &conn);

		let pump = publish::Pump {
			read_timeout: self.conf.read_timeout,
			conn: conn.clone(),
			path,
			session_id: self.shared.id,
		};

		let mut task = tokio::spawn(pump.run());

		let finished = tokio::select! {
			res = &mut task => Some(res),
			_ = self.shared.token.cancelled() => None,
		};

		conn.close();

		match finished {
			Some(res) => res.unwrap_or(Err(SessionError::Terminated)),
			None => {
				// the close above unblocks the pump; join it before
				// releasing anything
				task.await.ok();
				Err(SessionError::Terminated)
			}
		}
	}

	async fn run_read(
		&mut self,
		request: Arc<dyn ConnRequest>,
		stream_id: StreamId,
		reply: &mut Option<oneshot::Sender<bool>>,
	) -> Result<(), SessionError> {
		let (path, stream) = match self.path_manager.add_reader(self.access_request(&stream_id, false)).await {
			Ok(res) => res,
			Err(err) => {
				if err.is_authentication() {
					tokio::time::sleep(PAUSE_AFTER_AUTH_ERROR).await;
				}
				return Err(err.into());
			}
		};

		check_passphrase(request.as_ref(), path.conf().read_passphrase.as_deref())?;

		let conn = Arc::new(self.exchange_request_with_conn(reply).await?);
		self.record(SessionState::Read, &stream_id, &conn);

		let pump = read::Pump {
			write_timeout: self.conf.write_timeout,
			queue_size: self.conf.write_queue_size,
			max_payload_size: self.conf.max_payload_size(),
			run_on_read: self.conf.run_on_read.clone(),
			run_on_unread: self.conf.run_on_unread.clone(),
			conn: conn.clone(),
			path,
			stream,
			pool: self.cmd_pool.clone(),
			session_id: self.shared.id,
			desc: Descriptor {
				kind: DescriptorKind::Reader,
				id: self.shared.id.to_string(),
			},
			query: stream_id.query.clone(),
			token: self.shared.token.clone(),
		};

		let res = pump.run().await;
		conn.close();

		res
	}

	/// Confirm interest on the handoff, then wait for the listener to hand
	/// over the established connection.
	async fn exchange_request_with_conn(
		&mut self,
		reply: &mut Option<oneshot::Sender<bool>>,
	) -> Result<Conn, SessionError> {
		if let Some(reply) = reply.take() {
			reply.send(true).ok();
		}

		tokio::select! {
			conn = self.ch_set_conn.recv() => conn.ok_or(SessionError::Terminated),
			_ = self.shared.token.cancelled() => Err(SessionError::Terminated),
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;

	use std::sync::Mutex;

	use bytes::Bytes;
	use tokio::io::{AsyncWriteExt, DuplexStream};

	use crate::container::{Muxer, TrackInfo, TrackKind, Unit};
	use crate::path::{PathConf, Registry};
	use crate::transport::{self, mem};

	struct Harness {
		conf: Conf,
		registry: Registry,
		parent: CancellationToken,
		cmd_pool: Arc<CmdPool>,
		closed_tx: mpsc::UnboundedSender<Uuid>,
		closed_rx: mpsc::UnboundedReceiver<Uuid>,
	}

	impl Harness {
		fn new() -> Self {
			let registry = Registry::new();
			registry.insert("cam1", PathConf::default());

			let (closed_tx, closed_rx) = mpsc::unbounded_channel();

			Self {
				conf: Conf {
					// keep deadlines out of the way of slow CI
					read_timeout: Duration::from_secs(3600),
					write_timeout: Duration::from_secs(3600),
					..Conf::default()
				},
				registry,
				parent: CancellationToken::new(),
				cmd_pool: Arc::new(CmdPool::new()),
				closed_tx,
				closed_rx,
			}
		}

		fn spawn(&self) -> Session {
			let (session, runner) = Session::new(SessionParams {
				conf: self.conf.clone(),
				remote_addr: addr(),
				path_manager: Arc::new(self.registry.clone()),
				cmd_pool: self.cmd_pool.clone(),
				parent: self.parent.clone(),
				on_close: self.closed_tx.clone(),
			});

			tokio::spawn(runner.run());
			session
		}

		async fn closed(&mut self) -> Uuid {
			self.closed_rx.recv().await.expect("closed channel dropped")
		}
	}

	fn addr() -> SocketAddr {
		"10.1.2.3:5000".parse().unwrap()
	}

	fn tracks() -> Vec<TrackInfo> {
		vec![TrackInfo {
			kind: TrackKind::Video,
			codec: "H264".to_string(),
		}]
	}

	fn unit(pts: u64, payload: &[u8]) -> Unit {
		Unit {
			track: 0,
			pts: Some(pts),
			payload: Bytes::copy_from_slice(payload),
		}
	}

	async fn send(io: &mut DuplexStream, muxer: &mut Muxer) {
		for chunk in muxer.flush() {
			io.write_all(&chunk).await.unwrap();
		}
	}

	async fn wait_for<T>(mut f: impl FnMut() -> Option<T>) -> T {
		for _ in 0..500 {
			if let Some(v) = f() {
				return v;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		panic!("condition never became true");
	}

	/// Accepted publisher with a flowing stream: the decode-error packet in
	/// the middle is skipped without killing the pump.
	#[tokio::test]
	async fn publish_flow() {
		let mut h = Harness::new();
		let session = h.spawn();

		let (incoming, client) = mem::pair("publish:cam1", addr(), None);
		assert!(session.offer(incoming.request.clone()).await);

		session.supply_conn(incoming.acceptor.accept().unwrap()).await;
		let mut io = client.established().await.unwrap();

		let mut muxer = Muxer::new(&tracks(), 1316);
		muxer.write_unit(&unit(1, b"first"));
		send(&mut io, &mut muxer).await;

		let registry = h.registry.clone();
		let stream = wait_for(move || registry.stream("cam1")).await;

		let seen = Arc::new(Mutex::new(Vec::new()));
		let sink = seen.clone();
		stream.add_reader(
			Uuid::new_v4(),
			Box::new(move |unit: &Unit| sink.lock().unwrap().push(unit.clone())),
		);

		// garbage with an unknown tag, then a valid unit
		io.write_all(&[0x7f, 0, 0, 0, 1, 0xaa]).await.unwrap();
		muxer.write_unit(&unit(2, b"second"));
		send(&mut io, &mut muxer).await;

		let observer = seen.clone();
		wait_for(move || (!observer.lock().unwrap().is_empty()).then_some(())).await;
		assert_eq!(seen.lock().unwrap()[0], unit(2, b"second"));

		let info = session.snapshot();
		assert_eq!(info.state, SessionState::Publish);
		assert_eq!(info.path, "cam1");
		assert!(info.bytes_received > 0);

		// EOF ends the pump; teardown releases the admission
		drop(io);
		assert_eq!(h.closed().await, session.id());
		assert!(h.registry.stream("cam1").is_none());
	}

	#[tokio::test]
	async fn malformed_stream_id_declines() {
		let mut h = Harness::new();
		let session = h.spawn();

		let (incoming, client) = mem::pair("bogus:cam1", addr(), None);
		assert!(!session.offer(incoming.request.clone()).await);

		incoming.acceptor.reject();
		assert!(matches!(client.established().await, Err(transport::Error::Rejected)));

		assert_eq!(h.closed().await, session.id());
	}

	#[tokio::test]
	async fn cancel_before_handoff() {
		let mut h = Harness::new();
		let session = h.spawn();

		session.close();
		assert_eq!(h.closed().await, session.id());

		let (incoming, _client) = mem::pair("publish:cam1", addr(), None);
		assert!(!session.offer(incoming.request.clone()).await);
	}

	#[tokio::test(start_paused = true)]
	async fn auth_failure_is_delayed() {
		let mut h = Harness::new();
		h.registry.insert(
			"cam1",
			PathConf {
				read_user: Some("admin".to_string()),
				read_pass: Some("secret".to_string()),
				..Default::default()
			},
		);

		let session = h.spawn();
		let (incoming, client) = mem::pair("read:cam1?token=abc", addr(), None);

		let start = tokio::time::Instant::now();
		assert!(!session.offer(incoming.request.clone()).await);
		assert!(start.elapsed() >= PAUSE_AFTER_AUTH_ERROR);

		incoming.acceptor.reject();
		assert!(matches!(client.established().await, Err(transport::Error::Rejected)));

		assert_eq!(h.closed().await, session.id());
		assert_eq!(h.registry.readers("cam1"), 0);
	}

	#[tokio::test(start_paused = true)]
	async fn other_failures_are_not_delayed() {
		let mut h = Harness::new();
		let session = h.spawn();

		// unknown path: rejected, but not an authentication failure
		let (incoming, _client) = mem::pair("read:nowhere", addr(), None);

		let start = tokio::time::Instant::now();
		assert!(!session.offer(incoming.request.clone()).await);
		assert!(start.elapsed() < PAUSE_AFTER_AUTH_ERROR);

		assert_eq!(h.closed().await, session.id());
	}

	#[tokio::test]
	async fn read_passphrase_requires_encryption() {
		let mut h = Harness::new();
		h.registry.insert(
			"cam1",
			PathConf {
				read_passphrase: Some("opensesame".to_string()),
				..Default::default()
			},
		);

		// an active publisher, so admission itself succeeds
		let publisher = h
			.registry
			.add_publisher(AccessRequest {
				name: "cam1".to_string(),
				ip: addr().ip(),
				publish: true,
				user: None,
				pass: None,
				proto: PROTOCOL,
				id: Uuid::new_v4(),
				query: String::new(),
			})
			.await
			.unwrap();
		publisher.start_publisher(tracks(), true).unwrap();

		let session = h.spawn();

		// unencrypted handshake: declined before any connection exchange
		let (incoming, _client) = mem::pair("read:cam1", addr(), None);
		assert!(!session.offer(incoming.request.clone()).await);

		assert_eq!(h.closed().await, session.id());
		assert_eq!(h.registry.readers("cam1"), 0);
	}

	#[tokio::test]
	async fn publish_passphrase_accepted() {
		let mut h = Harness::new();
		h.registry.insert(
			"cam1",
			PathConf {
				publish_passphrase: Some("opensesame".to_string()),
				..Default::default()
			},
		);

		let session = h.spawn();

		let (incoming, _client) = mem::pair("publish:cam1", addr(), Some("opensesame"));
		assert!(session.offer(incoming.request.clone()).await);

		session.close();
		assert_eq!(h.closed().await, session.id());
	}

	#[tokio::test]
	async fn publish_wrong_passphrase_declines() {
		let mut h = Harness::new();
		h.registry.insert(
			"cam1",
			PathConf {
				publish_passphrase: Some("opensesame".to_string()),
				..Default::default()
			},
		);

		let session = h.spawn();

		let (incoming, _client) = mem::pair("publish:cam1", addr(), Some("wrong"));
		assert!(!session.offer(incoming.request.clone()).await);

		assert_eq!(h.closed().await, session.id());
		assert!(h.registry.stream("cam1").is_none());
	}

	/// Cancelling mid-pump must unblock the blocked read and still release
	/// the admission exactly once.
	#[tokio::test]
	async fn cancel_during_pump() {
		let mut h = Harness::new();
		let session = h.spawn();

		let (incoming, client) = mem::pair("publish:cam1", addr(), None);
		assert!(session.offer(incoming.request.clone()).await);
		session.supply_conn(incoming.acceptor.accept().unwrap()).await;

		let mut io = client.established().await.unwrap();
		let mut muxer = Muxer::new(&tracks(), 1316);
		muxer.write_unit(&unit(1, b"data"));
		send(&mut io, &mut muxer).await;

		let registry = h.registry.clone();
		wait_for(move || registry.stream("cam1")).await;

		// the pump is now blocked reading; close must force it out
		session.close();
		assert_eq!(h.closed().await, session.id());
		assert!(h.registry.stream("cam1").is_none());
	}

	#[tokio::test]
	async fn snapshot_projection() {
		let h = Harness::new();
		let session = h.spawn();

		let info = session.snapshot();
		assert_eq!(info.state, SessionState::Idle);
		assert_eq!(info.remote_addr, addr());
		assert_eq!(info.bytes_received, 0);

		let json = serde_json::to_value(&info).unwrap();
		assert_eq!(json["state"], "idle");
		assert_eq!(json["path"], "");
		assert_eq!(json["bytesReceived"], 0);

		session.close();
	}

	#[tokio::test]
	async fn second_conn_is_never_observed() {
		let mut h = Harness::new();
		let session = h.spawn();

		let (incoming, client) = mem::pair("publish:cam1", addr(), None);
		assert!(session.offer(incoming.request.clone()).await);
		session.supply_conn(incoming.acceptor.accept().unwrap()).await;

		let mut io = client.established().await.unwrap();
		let mut muxer = Muxer::new(&tracks(), 1316);
		muxer.write_unit(&unit(1, b"first"));
		send(&mut io, &mut muxer).await;

		let registry = h.registry.clone();
		wait_for(move || registry.stream("cam1")).await;

		// a stray second connection: buffered, never consumed
		let (other, _other_client) = mem::pair("publish:cam1", addr(), None);
		session.supply_conn(other.acceptor.accept().unwrap()).await;

		// the first connection keeps flowing
		muxer.write_unit(&unit(2, b"second"));
		send(&mut io, &mut muxer).await;

		let session2 = session.clone();
		wait_for(move || (session2.snapshot().bytes_received > 0).then_some(())).await;
		assert_eq!(session.snapshot().state, SessionState::Publish);

		session.close();
		assert_eq!(h.closed().await, session.id());
	}
}
