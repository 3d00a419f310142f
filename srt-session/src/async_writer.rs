//! Bounded asynchronous writer: a producer/consumer queue decoupling the
//! stream's fan-out rate from one connection's socket-write rate.

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::SessionError;

/// A queued write, executed in order by the drain task.
pub type Job = BoxFuture<'static, Result<(), SessionError>>;

/// Producer handle; cheap to clone into fan-out callbacks.
#[derive(Clone)]
pub struct Pusher {
	tx: mpsc::Sender<Job>,
	err_tx: mpsc::Sender<SessionError>,
}

impl Pusher {
	/// Queue a job without blocking. A full queue means the consumer has
	/// fallen fatally behind and surfaces as the terminal error.
	pub fn push(&self, job: Job) {
		match self.tx.try_send(job) {
			Ok(()) => {}
			Err(mpsc::error::TrySendError::Full(_)) => {
				self.err_tx.try_send(SessionError::TooSlow).ok();
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {}
		}
	}
}

pub struct AsyncWriter {
	tx: mpsc::Sender<Job>,
	rx: Option<mpsc::Receiver<Job>>,
	err_tx: mpsc::Sender<SessionError>,
	err_rx: Option<mpsc::Receiver<SessionError>>,
	stop: CancellationToken,
	handle: Option<JoinHandle<()>>,
}

impl AsyncWriter {
	pub fn new(queue_size: usize) -> Self {
		let (tx, rx) = mpsc::channel(queue_size.max(1));
		let (err_tx, err_rx) = mpsc::channel(1);

		Self {
			tx,
			rx: Some(rx),
			err_tx,
			err_rx: Some(err_rx),
			stop: CancellationToken::new(),
			handle: None,
		}
	}

	pub fn pusher(&self) -> Pusher {
		Pusher {
			tx: self.tx.clone(),
			err_tx: self.err_tx.clone(),
		}
	}

	/// The terminal-error signal; fires at most once.
	pub fn error(&mut self) -> mpsc::Receiver<SessionError> {
		self.err_rx.take().expect("error channel already taken")
	}

	/// Spawn the drain task.
	pub fn start(&mut self) {
		let mut rx = self.rx.take().expect("already started");
		let err_tx = self.err_tx.clone();
		let stop = self.stop.clone();

		self.handle = Some(tokio::spawn(async move {
			loop {
				let job = tokio::select! {
					_ = stop.cancelled() => return,
					job = rx.recv() => match job {
						Some(job) => job,
						None => return,
					},
				};

				if let Err(err) = job.await {
					err_tx.try_send(err).ok();
					return;
				}
			}
		}));
	}

	/// Stop the drain task and wait for it to exit.
	pub async fn stop(&mut self) {
		self.stop.cancel();

		if let Some(handle) = self.handle.take() {
			handle.await.ok();
		}
	}
}
