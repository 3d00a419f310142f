//! Lifecycle hooks: external commands attached to session events.
//!
//! Hook handles are drop guards, so the matching teardown command fires
//! exactly once no matter which path the session exits through.

use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::session::Descriptor;

const RESTART_PAUSE: Duration = Duration::from_secs(5);

/// Runs and supervises external commands for the whole server.
pub struct CmdPool {
	tracker: TaskTracker,
	closed: CancellationToken,
}

impl Default for CmdPool {
	fn default() -> Self {
		Self::new()
	}
}

impl CmdPool {
	pub fn new() -> Self {
		Self {
			tracker: TaskTracker::new(),
			closed: CancellationToken::new(),
		}
	}

	/// Spawn a command tied to the returned handle; restart it on exit when
	/// `restart` is set.
	pub fn spawn(&self, cmdline: &str, env: Vec<(String, String)>, restart: bool) -> Cmd {
		let token = self.closed.child_token();
		self.tracker.spawn(run_cmd(cmdline.to_string(), env, restart, token.clone()));

		Cmd { token }
	}

	/// Fire-and-forget command for one-shot events.
	pub fn run_once(&self, cmdline: &str, env: Vec<(String, String)>) {
		self.tracker
			.spawn(run_cmd(cmdline.to_string(), env, false, self.closed.child_token()));
	}

	/// Stop every running command and wait for them to exit.
	pub async fn close(&self) {
		self.closed.cancel();
		self.tracker.close();
		self.tracker.wait().await;
	}
}

/// A running command; closing it kills the process.
pub struct Cmd {
	token: CancellationToken,
}

impl Cmd {
	pub fn close(&self) {
		self.token.cancel();
	}
}

async fn run_cmd(cmdline: String, env: Vec<(String, String)>, restart: bool, token: CancellationToken) {
	loop {
		let mut cmd = Command::new("sh");
		cmd.arg("-c").arg(&cmdline).stdin(Stdio::null());

		for (key, value) in &env {
			cmd.env(key, value);
		}

		let mut child = match cmd.spawn() {
			Ok(child) => child,
			Err(err) => {
				log::warn!("command failed to start: cmd={:?} err={}", cmdline, err);
				return;
			}
		};

		log::debug!("command started: cmd={:?}", cmdline);

		let status = tokio::select! {
			_ = token.cancelled() => None,
			status = child.wait() => Some(status),
		};

		match status {
			None => {
				child.kill().await.ok();
				return;
			}
			Some(status) => {
				log::debug!("command exited: cmd={:?} status={:?}", cmdline, status.ok());

				if !restart || token.is_cancelled() {
					return;
				}

				tokio::time::sleep(RESTART_PAUSE).await;
			}
		}
	}
}

pub struct OnConnectParams {
	pub pool: Arc<CmdPool>,
	pub run_on_connect: String,
	pub run_on_connect_restart: bool,
	pub run_on_disconnect: String,
	pub remote_addr: SocketAddr,
	pub desc: Descriptor,
}

/// Fires the connect command; the returned guard fires the disconnect
/// command when dropped.
pub fn on_connect(params: OnConnectParams) -> OnConnectHandle {
	let env = vec![
		("SRT_CONN_TYPE".to_string(), params.desc.kind.to_string()),
		("SRT_CONN_ID".to_string(), params.desc.id.clone()),
		("SRT_REMOTE_ADDR".to_string(), params.remote_addr.to_string()),
	];

	let cmd = if !params.run_on_connect.is_empty() {
		log::info!("runOnConnect command started: id={}", params.desc.id);
		Some(
			params
				.pool
				.spawn(&params.run_on_connect, env.clone(), params.run_on_connect_restart),
		)
	} else {
		None
	};

	OnConnectHandle {
		pool: params.pool,
		cmd,
		run_on_disconnect: params.run_on_disconnect,
		env,
	}
}

pub struct OnConnectHandle {
	pool: Arc<CmdPool>,
	cmd: Option<Cmd>,
	run_on_disconnect: String,
	env: Vec<(String, String)>,
}

impl Drop for OnConnectHandle {
	fn drop(&mut self) {
		if let Some(cmd) = self.cmd.take() {
			cmd.close();
		}

		if !self.run_on_disconnect.is_empty() {
			self.pool.run_once(&self.run_on_disconnect, self.env.clone());
		}
	}
}

pub struct OnReadParams {
	pub pool: Arc<CmdPool>,
	pub run_on_read: String,
	pub run_on_unread: String,
	pub remote_addr: SocketAddr,
	pub desc: Descriptor,
	pub path: String,
	pub query: String,
}

/// Fires the read command; the returned guard fires the unread command when
/// dropped.
pub fn on_read(params: OnReadParams) -> OnReadHandle {
	let env = vec![
		("SRT_READER_TYPE".to_string(), params.desc.kind.to_string()),
		("SRT_READER_ID".to_string(), params.desc.id.clone()),
		("SRT_REMOTE_ADDR".to_string(), params.remote_addr.to_string()),
		("SRT_PATH".to_string(), params.path),
		("SRT_QUERY".to_string(), params.query),
	];

	let cmd = if !params.run_on_read.is_empty() {
		log::info!("runOnRead command started: id={}", params.desc.id);
		Some(params.pool.spawn(&params.run_on_read, env.clone(), false))
	} else {
		None
	};

	OnReadHandle {
		pool: params.pool,
		cmd,
		run_on_unread: params.run_on_unread,
		env,
	}
}

pub struct OnReadHandle {
	pool: Arc<CmdPool>,
	cmd: Option<Cmd>,
	run_on_unread: String,
	env: Vec<(String, String)>,
}

impl Drop for OnReadHandle {
	fn drop(&mut self) {
		if let Some(cmd) = self.cmd.take() {
			cmd.close();
		}

		if !self.run_on_unread.is_empty() {
			self.pool.run_once(&self.run_on_unread, self.env.clone());
		}
	}
}
