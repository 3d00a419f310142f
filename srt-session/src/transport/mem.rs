//! In-memory transport, used by tests and in-process wiring.
//!
//! Encryption is modeled as a passphrase presented by the client and checked
//! by [ConnRequest::set_passphrase], which is what the real handshake does
//! with its key material.

use std::{net::SocketAddr, sync::Arc};

use tokio::io::DuplexStream;
use tokio::sync::oneshot;

use super::{Acceptor, Conn, ConnRequest, Error, Incoming};

struct MemRequest {
	addr: SocketAddr,
	stream_id: String,
	passphrase: Option<String>,
}

impl ConnRequest for MemRequest {
	fn remote_addr(&self) -> SocketAddr {
		self.addr
	}

	fn stream_id(&self) -> &str {
		&self.stream_id
	}

	fn is_encrypted(&self) -> bool {
		self.passphrase.is_some()
	}

	fn set_passphrase(&self, passphrase: &str) -> Result<(), Error> {
		match &self.passphrase {
			Some(expected) if expected == passphrase => Ok(()),
			_ => Err(Error::InvalidPassphrase),
		}
	}
}

struct MemAcceptor {
	addr: SocketAddr,
	client: DuplexStream,
	server: DuplexStream,
	reply: oneshot::Sender<Result<DuplexStream, Error>>,
}

impl Acceptor for MemAcceptor {
	fn accept(self: Box<Self>) -> Result<Conn, Error> {
		let this = *self;
		this.reply.send(Ok(this.client)).ok();
		Ok(Conn::new(this.server, this.addr))
	}

	fn reject(self: Box<Self>) {
		self.reply.send(Err(Error::Rejected)).ok();
	}
}

/// Client half of an in-memory handshake.
pub struct Client {
	reply: oneshot::Receiver<Result<DuplexStream, Error>>,
}

impl Client {
	/// Wait for the server's accept/reject decision.
	pub async fn established(self) -> Result<DuplexStream, Error> {
		self.reply.await.map_err(|_| Error::Closed)?
	}
}

/// Create a pending handshake: the [Incoming] side goes to the listener, the
/// [Client] side resolves once the listener finalizes the decision.
pub fn pair(stream_id: &str, addr: SocketAddr, passphrase: Option<&str>) -> (Incoming, Client) {
	let (client_io, server_io) = tokio::io::duplex(64 * 1024);
	let (reply_tx, reply_rx) = oneshot::channel();

	let request = Arc::new(MemRequest {
		addr,
		stream_id: stream_id.to_string(),
		passphrase: passphrase.map(|p| p.to_string()),
	});

	let incoming = Incoming {
		request,
		acceptor: Box::new(MemAcceptor {
			addr,
			client: client_io,
			server: server_io,
			reply: reply_tx,
		}),
	};

	(incoming, Client { reply: reply_rx })
}
