use std::time::Duration;

/// Server-level tunables, applied to every session.
#[derive(Clone, Debug)]
pub struct Conf {
	/// Deadline for reads performed by the publish pump.
	pub read_timeout: Duration,

	/// Deadline for each write performed by the read pump.
	pub write_timeout: Duration,

	/// Capacity of the per-reader write queue.
	pub write_queue_size: usize,

	/// Maximum UDP payload the transport will put on the wire.
	pub udp_max_payload_size: usize,

	/// Command executed when a session is opened.
	pub run_on_connect: String,

	/// Restart the connect command if it exits while the session is alive.
	pub run_on_connect_restart: bool,

	/// Command executed once when a session closes.
	pub run_on_disconnect: String,

	/// Command executed when a reader starts consuming a path.
	pub run_on_read: String,

	/// Command executed once when a reader stops.
	pub run_on_unread: String,
}

impl Default for Conf {
	fn default() -> Self {
		Self {
			read_timeout: Duration::from_secs(10),
			write_timeout: Duration::from_secs(10),
			write_queue_size: 512,
			udp_max_payload_size: 1472,
			run_on_connect: String::new(),
			run_on_connect_restart: false,
			run_on_disconnect: String::new(),
			run_on_read: String::new(),
			run_on_unread: String::new(),
		}
	}
}

impl Conf {
	/// Largest container flush that still fits a single transport packet,
	/// rounded down to whole 188-byte cells.
	pub fn max_payload_size(&self) -> usize {
		(self.udp_max_payload_size.saturating_sub(16) / 188).max(1) * 188
	}
}
