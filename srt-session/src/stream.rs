//! In-process fan-out from one publisher to any number of readers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use uuid::Uuid;

use crate::container::{TrackInfo, Unit};

/// Callback invoked for every unit written to the stream.
pub type OnUnit = Box<dyn Fn(&Unit) + Send + Sync>;

pub struct Stream {
	tracks: Vec<TrackInfo>,
	generate_timing: bool,
	epoch: Instant,
	readers: Mutex<HashMap<Uuid, OnUnit>>,
}

impl std::fmt::Debug for Stream {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Stream")
			.field("tracks", &self.tracks)
			.field("generate_timing", &self.generate_timing)
			.finish_non_exhaustive()
	}
}

impl Stream {
	pub fn new(tracks: Vec<TrackInfo>, generate_timing: bool) -> Self {
		Self {
			tracks,
			generate_timing,
			epoch: Instant::now(),
			readers: Mutex::new(HashMap::new()),
		}
	}

	pub fn tracks(&self) -> &[TrackInfo] {
		&self.tracks
	}

	/// Fan a unit out to every registered reader, stamping a timestamp when
	/// timing generation is enabled and the unit has none.
	pub fn write_unit(&self, mut unit: Unit) {
		if self.generate_timing && unit.pts.is_none() {
			unit.pts = Some(self.epoch.elapsed().as_micros() as u64);
		}

		for on_unit in self.readers.lock().unwrap().values() {
			on_unit(&unit);
		}
	}

	pub fn add_reader(&self, id: Uuid, on_unit: OnUnit) {
		self.readers.lock().unwrap().insert(id, on_unit);
	}

	pub fn remove_reader(&self, id: &Uuid) {
		self.readers.lock().unwrap().remove(id);
	}

	pub fn reader_count(&self) -> usize {
		self.readers.lock().unwrap().len()
	}

	/// Track summary for log lines, e.g. `2 tracks (H264, MPEG-4 Audio)`.
	pub fn describe(&self) -> String {
		let codecs = self
			.tracks
			.iter()
			.map(|t| t.codec.as_str())
			.collect::<Vec<_>>()
			.join(", ");

		format!(
			"{} track{} ({})",
			self.tracks.len(),
			if self.tracks.len() == 1 { "" } else { "s" },
			codecs
		)
	}
}
