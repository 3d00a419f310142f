//! Routing authority seam: who may publish or read a path, and the
//! releasable admission handles proving it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use uuid::Uuid;

use crate::container::TrackInfo;
use crate::stream::Stream;

/// Protocol tag carried in access requests.
pub const PROTOCOL: &str = "srt";

/// Everything the authority needs to decide one admission.
#[derive(Debug, Clone)]
pub struct AccessRequest {
	pub name: String,
	pub ip: IpAddr,
	pub publish: bool,
	pub user: Option<String>,
	pub pass: Option<String>,
	pub proto: &'static str,
	pub id: Uuid,
	pub query: String,
}

#[derive(thiserror::Error, Debug)]
pub enum PathError {
	/// Credentials or path policy rejected the request. The only kind that
	/// triggers the brute-force mitigation pause.
	#[error("authentication failed: {0}")]
	Authentication(String),

	#[error("path '{0}' is not configured")]
	NotFound(String),

	#[error("path '{0}' is busy, another publisher is connected")]
	Busy(String),

	#[error("no one is publishing to path '{0}'")]
	NoPublisher(String),

	#[error("{0}")]
	Other(String),
}

impl PathError {
	pub fn is_authentication(&self) -> bool {
		matches!(self, Self::Authentication(_))
	}
}

/// Per-path configuration, snapshotted at admission time.
#[derive(Debug, Clone, Default)]
pub struct PathConf {
	pub publish_user: Option<String>,
	pub publish_pass: Option<String>,
	pub read_user: Option<String>,
	pub read_pass: Option<String>,

	/// When set, publishers must arrive encrypted with this passphrase.
	pub publish_passphrase: Option<String>,

	/// When set, readers must arrive encrypted with this passphrase.
	pub read_passphrase: Option<String>,
}

/// Releasable proof of publish admission; the slot is returned on drop.
pub trait PublisherHandle: Send + Sync {
	fn name(&self) -> &str;

	fn conf(&self) -> PathConf;

	/// Register the track set and activate the stream for readers.
	fn start_publisher(&self, tracks: Vec<TrackInfo>, generate_timing: bool) -> Result<Arc<Stream>, PathError>;
}

/// Releasable proof of read admission; the registration is dropped with it.
pub trait ReaderHandle: Send + Sync {
	fn name(&self) -> &str;

	fn conf(&self) -> PathConf;
}

impl std::fmt::Debug for dyn PublisherHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PublisherHandle").field("name", &self.name()).finish_non_exhaustive()
	}
}

impl std::fmt::Debug for dyn ReaderHandle {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ReaderHandle").field("name", &self.name()).finish_non_exhaustive()
	}
}

#[async_trait]
pub trait PathManager: Send + Sync {
	async fn add_publisher(&self, req: AccessRequest) -> Result<Box<dyn PublisherHandle>, PathError>;

	async fn add_reader(&self, req: AccessRequest) -> Result<(Box<dyn ReaderHandle>, Arc<Stream>), PathError>;
}

#[derive(Default)]
struct PathState {
	conf: PathConf,
	publisher: Option<Uuid>,
	stream: Option<Arc<Stream>>,
	readers: usize,
}

/// In-memory path table with static configuration and credential checks.
#[derive(Clone, Default)]
pub struct Registry {
	paths: Arc<Mutex<HashMap<String, PathState>>>,
}

impl Registry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&self, name: &str, conf: PathConf) {
		self.paths.lock().unwrap().insert(
			name.to_string(),
			PathState {
				conf,
				..Default::default()
			},
		);
	}

	/// The currently active stream for a path, if anyone is publishing.
	pub fn stream(&self, name: &str) -> Option<Arc<Stream>> {
		self.paths.lock().unwrap().get(name)?.stream.clone()
	}

	/// Number of admitted readers on a path.
	pub fn readers(&self, name: &str) -> usize {
		self.paths.lock().unwrap().get(name).map_or(0, |s| s.readers)
	}
}

fn check_credentials(user: &Option<String>, pass: &Option<String>, req: &AccessRequest) -> Result<(), PathError> {
	let user_ok = user.as_deref().map_or(true, |u| req.user.as_deref() == Some(u));
	let pass_ok = pass.as_deref().map_or(true, |p| req.pass.as_deref() == Some(p));

	if user_ok && pass_ok {
		Ok(())
	} else {
		Err(PathError::Authentication(format!(
			"invalid credentials for path '{}'",
			req.name
		)))
	}
}

#[async_trait]
impl PathManager for Registry {
	async fn add_publisher(&self, req: AccessRequest) -> Result<Box<dyn PublisherHandle>, PathError> {
		let mut paths = self.paths.lock().unwrap();

		let state = paths
			.get_mut(&req.name)
			.ok_or_else(|| PathError::NotFound(req.name.clone()))?;

		check_credentials(&state.conf.publish_user, &state.conf.publish_pass, &req)?;

		if state.publisher.is_some() {
			return Err(PathError::Busy(req.name.clone()));
		}

		state.publisher = Some(req.id);

		Ok(Box::new(RegistryPublisher {
			name: req.name,
			id: req.id,
			conf: state.conf.clone(),
			paths: self.paths.clone(),
		}))
	}

	async fn add_reader(&self, req: AccessRequest) -> Result<(Box<dyn ReaderHandle>, Arc<Stream>), PathError> {
		let mut paths = self.paths.lock().unwrap();

		let state = paths
			.get_mut(&req.name)
			.ok_or_else(|| PathError::NotFound(req.name.clone()))?;

		check_credentials(&state.conf.read_user, &state.conf.read_pass, &req)?;

		let stream = state
			.stream
			.clone()
			.ok_or_else(|| PathError::NoPublisher(req.name.clone()))?;

		state.readers += 1;

		let handle = RegistryReader {
			name: req.name,
			conf: state.conf.clone(),
			paths: self.paths.clone(),
		};

		Ok((Box::new(handle), stream))
	}
}

struct RegistryPublisher {
	name: String,
	id: Uuid,
	conf: PathConf,
	paths: Arc<Mutex<HashMap<String, PathState>>>,
}

impl PublisherHandle for RegistryPublisher {
	fn name(&self) -> &str {
		&self.name
	}

	fn conf(&self) -> PathConf {
		self.conf.clone()
	}

	fn start_publisher(&self, tracks: Vec<TrackInfo>, generate_timing: bool) -> Result<Arc<Stream>, PathError> {
		let mut paths = self.paths.lock().unwrap();

		let state = paths
			.get_mut(&self.name)
			.ok_or_else(|| PathError::NotFound(self.name.clone()))?;

		let stream = Arc::new(Stream::new(tracks, generate_timing));
		state.stream = Some(stream.clone());

		Ok(stream)
	}
}

impl Drop for RegistryPublisher {
	fn drop(&mut self) {
		let mut paths = self.paths.lock().unwrap();

		if let Some(state) = paths.get_mut(&self.name) {
			if state.publisher == Some(self.id) {
				state.publisher = None;
				state.stream = None;
			}
		}
	}
}

struct RegistryReader {
	name: String,
	conf: PathConf,
	paths: Arc<Mutex<HashMap<String, PathState>>>,
}

impl ReaderHandle for RegistryReader {
	fn name(&self) -> &str {
		&self.name
	}

	fn conf(&self) -> PathConf {
		self.conf.clone()
	}
}

impl Drop for RegistryReader {
	fn drop(&mut self) {
		let mut paths = self.paths.lock().unwrap();

		if let Some(state) = paths.get_mut(&self.name) {
			state.readers = state.readers.saturating_sub(1);
		}
	}
}
