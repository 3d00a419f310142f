//! Publish data pump: demuxes the inbound container stream and feeds the
//! path's stream.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::BufReader;
use tokio::time::timeout;
use uuid::Uuid;

use crate::container::{ContainerError, Demuxer};
use crate::error::SessionError;
use crate::path::PublisherHandle;
use crate::transport::Conn;

/// Logs at most one message per second; decode errors can arrive per packet.
struct LimitedLog {
	last: Mutex<Option<Instant>>,
}

impl LimitedLog {
	fn new() -> Self {
		Self { last: Mutex::new(None) }
	}

	fn warn(&self, msg: String) {
		let mut last = self.last.lock().unwrap();
		let now = Instant::now();

		if last.map_or(true, |t| now.duration_since(t) >= Duration::from_secs(1)) {
			*last = Some(now);
			log::warn!("{}", msg);
		}
	}
}

/// Bound a demuxer read by the configured deadline, and abort it the moment
/// the connection is closed from outside.
async fn with_deadline<T>(
	conn: &Conn,
	deadline: Duration,
	fut: impl Future<Output = Result<T, ContainerError>>,
) -> Result<T, SessionError> {
	tokio::select! {
		res = timeout(deadline, fut) => match res {
			Ok(Ok(v)) => Ok(v),
			Ok(Err(err)) => Err(err.into()),
			Err(_) => Err(SessionError::timed_out()),
		},
		_ = conn.closed() => Err(SessionError::Terminated),
	}
}

pub(crate) struct Pump {
	pub read_timeout: Duration,
	pub conn: Arc<Conn>,
	pub path: Box<dyn PublisherHandle>,
	pub session_id: Uuid,
}

impl Pump {
	pub async fn run(self) -> Result<(), SessionError> {
		let Pump {
			read_timeout,
			conn,
			path,
			session_id,
		} = self;

		let io = conn.take_io().ok_or(SessionError::Terminated)?;
		let mut demuxer = Demuxer::new(BufReader::new(io));

		let errlog = LimitedLog::new();
		demuxer.on_decode_error(move |err| {
			errlog.warn(format!("decode error: session={} err={}", session_id, err));
		});

		let tracks = with_deadline(&conn, read_timeout, demuxer.probe()).await?;
		let stream = path.start_publisher(tracks, true)?;

		log::info!(
			"session is publishing to path: session={} path={} {}",
			session_id,
			path.name(),
			stream.describe()
		);

		loop {
			let unit = with_deadline(&conn, read_timeout, demuxer.read()).await?;
			stream.write_unit(unit);
		}
	}
}
