//! Container framing bridging the transport byte stream and the internal
//! stream model.
//!
//! The format is a tag-length framing: a header packet carrying the track
//! table, followed by unit packets. Isolated corruption (an unknown tag, a
//! reference to a missing track, a short body) is skipped and reported to
//! the decode-error observer; only I/O failures and a broken stream setup
//! are fatal.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

const TAG_HEADER: u8 = 0x01;
const TAG_UNIT: u8 = 0x02;

const FLAG_PTS: u8 = 0x01;

// Backstop against a corrupt length field.
const MAX_PACKET_SIZE: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackKind {
	Video,
	Audio,
	Data,
}

impl TrackKind {
	fn encode(&self) -> u8 {
		match self {
			Self::Video => 0,
			Self::Audio => 1,
			Self::Data => 2,
		}
	}

	fn decode(v: u8) -> Result<Self, DecodeError> {
		match v {
			0 => Ok(Self::Video),
			1 => Ok(Self::Audio),
			2 => Ok(Self::Data),
			other => Err(DecodeError::InvalidTrackKind(other)),
		}
	}
}

/// One elementary track described by the stream header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
	pub kind: TrackKind,
	pub codec: String,
}

/// One demuxed unit of an elementary track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
	pub track: usize,
	pub pts: Option<u64>,
	pub payload: Bytes,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
	#[error("missing stream header")]
	MissingHeader,

	#[error("unexpected stream header")]
	UnexpectedHeader,

	#[error("no tracks in stream header")]
	NoTracks,

	#[error("invalid track kind {0}")]
	InvalidTrackKind(u8),

	#[error("unknown packet tag {0:#04x}")]
	UnknownTag(u8),

	#[error("unknown track {0}")]
	UnknownTrack(usize),

	#[error("truncated packet body")]
	Truncated,

	#[error("oversized packet: {0} bytes")]
	OversizedPacket(usize),
}

/// A failure that tears the pipeline down. Recoverable decode errors never
/// surface here; they go to the observer instead.
#[derive(thiserror::Error, Debug)]
pub enum ContainerError {
	#[error("i/o error: {0}")]
	Io(#[from] io::Error),

	#[error("decode error: {0}")]
	Decode(#[from] DecodeError),
}

type DecodeErrorObserver = Box<dyn Fn(DecodeError) + Send>;

/// Reads container packets off the connection's byte stream.
pub struct Demuxer<R> {
	io: R,
	tracks: Vec<TrackInfo>,
	on_decode_error: Option<DecodeErrorObserver>,
}

impl<R: AsyncRead + Unpin> Demuxer<R> {
	pub fn new(io: R) -> Self {
		Self {
			io,
			tracks: Vec::new(),
			on_decode_error: None,
		}
	}

	/// Observer for recoverable decode errors.
	pub fn on_decode_error(&mut self, f: impl Fn(DecodeError) + Send + 'static) {
		self.on_decode_error = Some(Box::new(f));
	}

	/// Read the stream header and return the track table.
	pub async fn probe(&mut self) -> Result<Vec<TrackInfo>, ContainerError> {
		let (tag, body) = self.next_packet().await?;

		if tag != TAG_HEADER {
			return Err(DecodeError::MissingHeader.into());
		}

		let tracks = parse_header(&body)?;

		if tracks.is_empty() {
			return Err(DecodeError::NoTracks.into());
		}

		self.tracks = tracks.clone();

		Ok(tracks)
	}

	/// Next unit. Recoverable decode errors are reported and skipped.
	pub async fn read(&mut self) -> Result<Unit, ContainerError> {
		loop {
			let (tag, body) = self.next_packet().await?;

			match tag {
				TAG_UNIT => match parse_unit(&body, self.tracks.len()) {
					Ok(unit) => return Ok(unit),
					Err(err) => self.report(err),
				},
				TAG_HEADER => self.report(DecodeError::UnexpectedHeader),
				other => self.report(DecodeError::UnknownTag(other)),
			}
		}
	}

	fn report(&self, err: DecodeError) {
		if let Some(observer) = &self.on_decode_error {
			observer(err);
		}
	}

	async fn next_packet(&mut self) -> Result<(u8, Vec<u8>), ContainerError> {
		let mut head = [0u8; 5];
		self.io.read_exact(&mut head).await?;

		let tag = head[0];
		let size = u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;

		if size > MAX_PACKET_SIZE {
			return Err(DecodeError::OversizedPacket(size).into());
		}

		let mut body = vec![0u8; size];
		self.io.read_exact(&mut body).await?;

		Ok((tag, body))
	}
}

fn parse_header(mut body: &[u8]) -> Result<Vec<TrackInfo>, DecodeError> {
	if body.remaining() < 1 {
		return Err(DecodeError::Truncated);
	}

	let count = body.get_u8() as usize;
	let mut tracks = Vec::with_capacity(count);

	for _ in 0..count {
		if body.remaining() < 2 {
			return Err(DecodeError::Truncated);
		}

		let kind = TrackKind::decode(body.get_u8())?;
		let codec_len = body.get_u8() as usize;

		if body.remaining() < codec_len {
			return Err(DecodeError::Truncated);
		}

		let codec = String::from_utf8_lossy(&body[..codec_len]).into_owned();
		body.advance(codec_len);

		tracks.push(TrackInfo { kind, codec });
	}

	Ok(tracks)
}

fn parse_unit(mut body: &[u8], track_count: usize) -> Result<Unit, DecodeError> {
	if body.remaining() < 2 {
		return Err(DecodeError::Truncated);
	}

	let track = body.get_u8() as usize;
	let flags = body.get_u8();

	if track >= track_count {
		return Err(DecodeError::UnknownTrack(track));
	}

	let pts = if flags & FLAG_PTS != 0 {
		if body.remaining() < 8 {
			return Err(DecodeError::Truncated);
		}
		Some(body.get_u64())
	} else {
		None
	};

	Ok(Unit {
		track,
		pts,
		payload: Bytes::copy_from_slice(body),
	})
}

/// Writes container packets, flushing in chunks that respect the transport's
/// payload budget.
pub struct Muxer {
	buf: BytesMut,
	budget: usize,
}

impl Muxer {
	/// The header packet is buffered immediately and goes out with the
	/// first flush.
	pub fn new(tracks: &[TrackInfo], budget: usize) -> Self {
		let mut muxer = Self {
			buf: BytesMut::new(),
			budget: budget.max(188),
		};

		muxer.write_header(tracks);
		muxer
	}

	fn write_header(&mut self, tracks: &[TrackInfo]) {
		let mut body = BytesMut::new();
		body.put_u8(tracks.len().min(u8::MAX as usize) as u8);

		for track in tracks.iter().take(u8::MAX as usize) {
			let codec = &track.codec.as_bytes()[..track.codec.len().min(u8::MAX as usize)];
			body.put_u8(track.kind.encode());
			body.put_u8(codec.len() as u8);
			body.put_slice(codec);
		}

		self.write_packet(TAG_HEADER, &body);
	}

	pub fn write_unit(&mut self, unit: &Unit) {
		let mut body = BytesMut::with_capacity(unit.payload.len() + 10);
		body.put_u8(unit.track.min(u8::MAX as usize) as u8);

		match unit.pts {
			Some(pts) => {
				body.put_u8(FLAG_PTS);
				body.put_u64(pts);
			}
			None => body.put_u8(0),
		}

		body.put_slice(&unit.payload);
		self.write_packet(TAG_UNIT, &body);
	}

	fn write_packet(&mut self, tag: u8, body: &[u8]) {
		self.buf.put_u8(tag);
		self.buf.put_u32(body.len() as u32);
		self.buf.put_slice(body);
	}

	/// Drain the buffered packets as chunks no larger than the budget.
	pub fn flush(&mut self) -> Vec<Bytes> {
		let mut chunks = Vec::new();

		while !self.buf.is_empty() {
			let n = self.buf.len().min(self.budget);
			chunks.push(self.buf.split_to(n).freeze());
		}

		chunks
	}
}

#[cfg(test)]
mod test {
	use super::*;

	use std::sync::{Arc, Mutex};

	fn tracks() -> Vec<TrackInfo> {
		vec![
			TrackInfo {
				kind: TrackKind::Video,
				codec: "H264".to_string(),
			},
			TrackInfo {
				kind: TrackKind::Audio,
				codec: "MPEG-4 Audio".to_string(),
			},
		]
	}

	fn unit(track: usize, pts: Option<u64>, payload: &[u8]) -> Unit {
		Unit {
			track,
			pts,
			payload: Bytes::copy_from_slice(payload),
		}
	}

	fn concat(chunks: Vec<Bytes>) -> Vec<u8> {
		chunks.iter().flat_map(|c| c.iter().copied()).collect()
	}

	#[tokio::test]
	async fn roundtrip() {
		let mut muxer = Muxer::new(&tracks(), 1316);
		muxer.write_unit(&unit(0, Some(90000), b"keyframe"));
		muxer.write_unit(&unit(1, None, b"aac"));

		let wire = concat(muxer.flush());

		let mut demuxer = Demuxer::new(&wire[..]);
		assert_eq!(demuxer.probe().await.unwrap(), tracks());
		assert_eq!(demuxer.read().await.unwrap(), unit(0, Some(90000), b"keyframe"));
		assert_eq!(demuxer.read().await.unwrap(), unit(1, None, b"aac"));
	}

	#[tokio::test]
	async fn budget_chunking() {
		let mut muxer = Muxer::new(&tracks(), 188);
		muxer.write_unit(&unit(0, None, &[0u8; 600]));

		let chunks = muxer.flush();
		assert!(chunks.len() > 1);
		assert!(chunks.iter().all(|c| c.len() <= 188));

		// a later flush with nothing buffered is empty
		assert!(muxer.flush().is_empty());
	}

	#[tokio::test]
	async fn corruption_is_skipped() {
		let mut muxer = Muxer::new(&tracks(), 1316);
		muxer.write_unit(&unit(0, None, b"first"));
		let mut wire = concat(muxer.flush());

		// an unknown tag, then a unit referencing a missing track
		wire.extend_from_slice(&[0x7f, 0, 0, 0, 1, 0xaa]);
		wire.extend_from_slice(&[TAG_UNIT, 0, 0, 0, 2, 9, 0]);

		let mut muxer = Muxer::new(&tracks(), 1316);
		muxer.write_unit(&unit(1, Some(7), b"second"));
		// skip the duplicate header packet too
		wire.extend_from_slice(&concat(muxer.flush()));

		let seen = Arc::new(Mutex::new(Vec::new()));
		let mut demuxer = Demuxer::new(&wire[..]);

		let observer = seen.clone();
		demuxer.on_decode_error(move |err| observer.lock().unwrap().push(err));

		demuxer.probe().await.unwrap();
		assert_eq!(demuxer.read().await.unwrap(), unit(0, None, b"first"));
		assert_eq!(demuxer.read().await.unwrap(), unit(1, Some(7), b"second"));

		let seen = seen.lock().unwrap();
		assert_eq!(
			*seen,
			vec![
				DecodeError::UnknownTag(0x7f),
				DecodeError::UnknownTrack(9),
				DecodeError::UnexpectedHeader,
			]
		);
	}

	#[tokio::test]
	async fn truncated_stream_is_fatal() {
		let mut muxer = Muxer::new(&tracks(), 1316);
		muxer.write_unit(&unit(0, None, b"data"));

		let wire = concat(muxer.flush());
		let mut demuxer = Demuxer::new(&wire[..wire.len() - 2]);

		demuxer.probe().await.unwrap();
		assert!(matches!(
			demuxer.read().await,
			Err(ContainerError::Io(err)) if err.kind() == io::ErrorKind::UnexpectedEof
		));
	}

	#[tokio::test]
	async fn missing_header_is_fatal() {
		let wire = [TAG_UNIT, 0, 0, 0, 2, 0, 0];
		let mut demuxer = Demuxer::new(&wire[..]);

		assert!(matches!(
			demuxer.probe().await,
			Err(ContainerError::Decode(DecodeError::MissingHeader))
		));
	}
}
