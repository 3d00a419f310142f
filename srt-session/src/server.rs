//! Listener: accepts raw handshakes, spawns sessions, and finalizes the
//! transport-level accept/reject once a session has decided.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::Conf;
use crate::hooks::CmdPool;
use crate::path::PathManager;
use crate::session::{Session, SessionInfo, SessionParams};
use crate::transport::Incoming;

pub struct Server {
	conf: Conf,
	path_manager: Arc<dyn PathManager>,
	cmd_pool: Arc<CmdPool>,
	token: CancellationToken,
	tracker: TaskTracker,
	sessions: Arc<Mutex<HashMap<Uuid, Session>>>,
	closed_tx: mpsc::UnboundedSender<Uuid>,
	closed_rx: Option<mpsc::UnboundedReceiver<Uuid>>,
}

/// Introspection and shutdown handle, usable while the server runs.
#[derive(Clone)]
pub struct ServerHandle {
	sessions: Arc<Mutex<HashMap<Uuid, Session>>>,
	token: CancellationToken,
}

impl ServerHandle {
	pub fn sessions(&self) -> Vec<SessionInfo> {
		self.sessions.lock().unwrap().values().map(|s| s.snapshot()).collect()
	}

	pub fn close(&self) {
		self.token.cancel();
	}
}

impl Server {
	pub fn new(conf: Conf, path_manager: Arc<dyn PathManager>) -> Self {
		let (closed_tx, closed_rx) = mpsc::unbounded_channel();

		Self {
			conf,
			path_manager,
			cmd_pool: Arc::new(CmdPool::new()),
			token: CancellationToken::new(),
			tracker: TaskTracker::new(),
			sessions: Arc::new(Mutex::new(HashMap::new())),
			closed_tx,
			closed_rx: Some(closed_rx),
		}
	}

	pub fn handle(&self) -> ServerHandle {
		ServerHandle {
			sessions: self.sessions.clone(),
			token: self.token.clone(),
		}
	}

	/// Accept loop. Returns once the server is closed and every session and
	/// hook command has terminated.
	pub async fn run(mut self, mut incoming: mpsc::Receiver<Incoming>) {
		let mut closed_rx = self.closed_rx.take().expect("already running");
		let token = self.token.clone();

		loop {
			tokio::select! {
				req = incoming.recv() => match req {
					Some(req) => self.handle_request(req),
					None => break,
				},
				res = closed_rx.recv() => {
					if let Some(id) = res {
						self.sessions.lock().unwrap().remove(&id);
					}
				}
				_ = token.cancelled() => break,
			}
		}

		// sessions hold child tokens, so this unblocks all of them
		self.token.cancel();
		self.tracker.close();
		self.tracker.wait().await;
		self.cmd_pool.close().await;

		log::info!("server closed");
	}

	fn handle_request(&self, incoming: Incoming) {
		let remote_addr = incoming.request.remote_addr();

		let (session, runner) = Session::new(SessionParams {
			conf: self.conf.clone(),
			remote_addr,
			path_manager: self.path_manager.clone(),
			cmd_pool: self.cmd_pool.clone(),
			parent: self.token.clone(),
			on_close: self.closed_tx.clone(),
		});

		self.sessions.lock().unwrap().insert(session.id(), session.clone());
		self.tracker.spawn(runner.run());

		// the accept decision can block on authentication; keep the accept
		// loop free while this one deliberates
		let Incoming { request, acceptor } = incoming;

		self.tracker.spawn(async move {
			if session.offer(request).await {
				match acceptor.accept() {
					Ok(conn) => session.supply_conn(conn).await,
					Err(err) => {
						log::warn!("accept failed: addr={} err={}", remote_addr, err);
						session.close();
					}
				}
			} else {
				acceptor.reject();
			}
		});
	}
}
