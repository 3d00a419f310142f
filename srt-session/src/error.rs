use std::io;

use crate::container::ContainerError;
use crate::path::PathError;
use crate::stream_id::ParseError;

/// Terminal outcome of a session. Every error below the session boundary is
/// propagated here, logged once, and never retried.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
	#[error("invalid stream ID '{id}': {source}")]
	StreamId {
		id: String,
		#[source]
		source: ParseError,
	},

	#[error(transparent)]
	Path(#[from] PathError),

	#[error("connection is not encrypted, but a passphrase is configured")]
	NotEncrypted,

	#[error("invalid passphrase")]
	InvalidPassphrase,

	/// External cancellation, or the handoff aborted before a connection
	/// existed. Always reported as "terminated" rather than as a failure.
	#[error("terminated")]
	Terminated,

	/// The bounded write queue overflowed.
	#[error("reader is too slow")]
	TooSlow,

	#[error(transparent)]
	Transport(#[from] io::Error),

	#[error(transparent)]
	Container(#[from] ContainerError),
}

impl SessionError {
	pub fn timed_out() -> Self {
		Self::Transport(io::ErrorKind::TimedOut.into())
	}
}
