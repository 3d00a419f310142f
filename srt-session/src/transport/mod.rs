//! Seam between the session layer and the SRT transport library.
//!
//! The transport owns the wire: retransmission, congestion control and key
//! exchange all happen below this boundary. The session layer only ever sees
//! a pending [ConnRequest] (before the accept/reject decision), an
//! [Acceptor] to finalize that decision, and the established [Conn].

use std::{
	io,
	net::SocketAddr,
	pin::Pin,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc, Mutex,
	},
	task::{Context, Poll},
};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;

pub mod mem;

#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
	#[error("invalid passphrase")]
	InvalidPassphrase,

	#[error("connection rejected")]
	Rejected,

	#[error("connection closed")]
	Closed,
}

/// A raw handshake attempt, pending an accept/reject decision.
pub trait ConnRequest: Send + Sync {
	fn remote_addr(&self) -> SocketAddr;

	/// The application-data field carrying the stream identifier.
	fn stream_id(&self) -> &str;

	fn is_encrypted(&self) -> bool;

	/// Arm the handshake with the configured passphrase. Fails when the
	/// client's key material does not match.
	fn set_passphrase(&self, passphrase: &str) -> Result<(), Error>;
}

/// Listener-side finalization of a pending handshake. Only the listener may
/// complete or reject the low-level connection.
pub trait Acceptor: Send {
	fn accept(self: Box<Self>) -> Result<Conn, Error>;

	fn reject(self: Box<Self>);
}

/// One incoming handshake as delivered to the listener.
pub struct Incoming {
	pub request: Arc<dyn ConnRequest>,
	pub acceptor: Box<dyn Acceptor>,
}

/// Byte stream plumbing the transport hands us once established.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// Accumulated counters, snapshotted for introspection.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnStats {
	pub bytes_received: u64,
	pub bytes_sent: u64,
}

#[derive(Default)]
struct Counters {
	received: AtomicU64,
	sent: AtomicU64,
}

/// An established transport connection.
///
/// Exactly one task (the data pump) performs I/O on it, via [Conn::take_io];
/// every other owner only ever closes or snapshots the connection.
pub struct Conn {
	addr: SocketAddr,
	io: Mutex<Option<Box<dyn Io>>>,
	closed: CancellationToken,
	counters: Arc<Counters>,
}

impl Conn {
	pub fn new(io: impl Io + 'static, addr: SocketAddr) -> Self {
		Self {
			addr,
			io: Mutex::new(Some(Box::new(io))),
			closed: CancellationToken::new(),
			counters: Default::default(),
		}
	}

	pub fn remote_addr(&self) -> SocketAddr {
		self.addr
	}

	/// Take the byte stream. Returns None after the first call.
	pub fn take_io(&self) -> Option<CountedIo> {
		let io = self.io.lock().unwrap().take()?;

		Some(CountedIo {
			io,
			counters: self.counters.clone(),
		})
	}

	/// Idempotent; unblocks any in-flight pump I/O racing [Conn::closed].
	pub fn close(&self) {
		self.closed.cancel();
	}

	pub fn is_closed(&self) -> bool {
		self.closed.is_cancelled()
	}

	/// Resolves once the connection has been closed.
	pub async fn closed(&self) {
		self.closed.cancelled().await
	}

	pub fn stats(&self) -> ConnStats {
		ConnStats {
			bytes_received: self.counters.received.load(Ordering::Relaxed),
			bytes_sent: self.counters.sent.load(Ordering::Relaxed),
		}
	}
}

/// The connection's byte stream, counting traffic for [Conn::stats].
pub struct CountedIo {
	io: Box<dyn Io>,
	counters: Arc<Counters>,
}

impl AsyncRead for CountedIo {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		let before = buf.filled().len();
		let res = Pin::new(&mut this.io).poll_read(cx, buf);

		if let Poll::Ready(Ok(())) = &res {
			let n = buf.filled().len() - before;
			this.counters.received.fetch_add(n as u64, Ordering::Relaxed);
		}

		res
	}
}

impl AsyncWrite for CountedIo {
	fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		let this = self.get_mut();
		let res = Pin::new(&mut this.io).poll_write(cx, buf);

		if let Poll::Ready(Ok(n)) = &res {
			this.counters.sent.fetch_add(*n as u64, Ordering::Relaxed);
		}

		res
	}

	fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().io).poll_flush(cx)
	}

	fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
	}
}
