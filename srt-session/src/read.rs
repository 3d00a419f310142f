//! Read data pump: subscribes to the path's stream and drains muxed units
//! to the socket through the bounded writer.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::FutureExt;
use tokio::io::{AsyncWrite, AsyncWriteExt, WriteHalf};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::async_writer::AsyncWriter;
use crate::container::{Muxer, Unit};
use crate::error::SessionError;
use crate::hooks::{self, CmdPool};
use crate::path::ReaderHandle;
use crate::session::Descriptor;
use crate::stream::Stream;
use crate::transport::{Conn, CountedIo};

async fn write_chunk<W: AsyncWrite + Unpin>(
	conn: &Conn,
	deadline: Duration,
	sink: &mut W,
	chunk: Bytes,
) -> Result<(), SessionError> {
	tokio::select! {
		res = timeout(deadline, sink.write_all(&chunk)) => match res {
			Ok(Ok(())) => Ok(()),
			Ok(Err(err)) => Err(err.into()),
			Err(_) => Err(SessionError::timed_out()),
		},
		_ = conn.closed() => Err(SessionError::Terminated),
	}
}

pub(crate) struct Pump {
	pub write_timeout: Duration,
	pub queue_size: usize,
	pub max_payload_size: usize,
	pub run_on_read: String,
	pub run_on_unread: String,
	pub conn: Arc<Conn>,
	pub path: Box<dyn ReaderHandle>,
	pub stream: Arc<Stream>,
	pub pool: Arc<CmdPool>,
	pub session_id: Uuid,
	pub desc: Descriptor,
	pub query: String,
	pub token: CancellationToken,
}

impl Pump {
	pub async fn run(self) -> Result<(), SessionError> {
		let Pump {
			write_timeout,
			queue_size,
			max_payload_size,
			run_on_read,
			run_on_unread,
			conn,
			path,
			stream,
			pool,
			session_id,
			desc,
			query,
			token,
		} = self;

		let io = conn.take_io().ok_or(SessionError::Terminated)?;

		// a read-only session never reads once setup succeeded
		let (_read_half, write_half) = tokio::io::split(io);

		let mut writer = AsyncWriter::new(queue_size);
		let mut err_rx = writer.error();

		let muxer = Arc::new(std::sync::Mutex::new(Muxer::new(stream.tracks(), max_payload_size)));
		let sink: Arc<tokio::sync::Mutex<WriteHalf<CountedIo>>> = Arc::new(tokio::sync::Mutex::new(write_half));

		{
			let pusher = writer.pusher();
			let muxer = muxer.clone();
			let sink = sink.clone();
			let conn = conn.clone();

			stream.add_reader(
				session_id,
				Box::new(move |unit: &Unit| {
					let chunks = {
						let mut muxer = muxer.lock().unwrap();
						muxer.write_unit(unit);
						muxer.flush()
					};

					if chunks.is_empty() {
						return;
					}

					let sink = sink.clone();
					let conn = conn.clone();

					pusher.push(
						async move {
							let mut sink = sink.lock().await;
							for chunk in chunks {
								write_chunk(&conn, write_timeout, &mut *sink, chunk).await?;
							}
							Ok(())
						}
						.boxed(),
					);
				}),
			);
		}

		log::info!(
			"session is reading from path: session={} path={} {}",
			desc.id,
			path.name(),
			stream.describe()
		);

		let on_unread = hooks::on_read(hooks::OnReadParams {
			pool,
			run_on_read,
			run_on_unread,
			remote_addr: conn.remote_addr(),
			desc,
			path: path.name().to_string(),
			query,
		});

		writer.start();

		let res = tokio::select! {
			_ = token.cancelled() => {
				writer.stop().await;
				Err(SessionError::Terminated)
			}
			err = err_rx.recv() => {
				Err(err.unwrap_or(SessionError::Terminated))
			}
		};

		stream.remove_reader(&session_id);
		drop(on_unread);

		res
	}
}
