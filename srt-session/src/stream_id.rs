use std::{fmt, str::FromStr};

use url::form_urlencoded;

/// What the client intends to do with the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
	Publish,
	Read,
}

impl fmt::Display for Mode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Publish => f.write_str("publish"),
			Self::Read => f.write_str("read"),
		}
	}
}

/// The compact identifier a client presents at handshake time.
///
/// Wire format: `<mode>[:<path>][?<query>]`. Credentials travel in the
/// reserved query keys `user` and `pass`; the query itself is preserved
/// verbatim so it can be forwarded to the routing authority and hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamId {
	pub mode: Mode,
	pub path: String,
	pub user: Option<String>,
	pub pass: Option<String>,
	pub query: String,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
	#[error("missing mode")]
	MissingMode,

	#[error("unknown mode '{0}'")]
	InvalidMode(String),

	#[error("empty path")]
	EmptyPath,
}

impl FromStr for StreamId {
	type Err = ParseError;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		let (head, query) = match raw.split_once('?') {
			Some((head, query)) => (head, query),
			None => (raw, ""),
		};

		let (mode, path) = match head.split_once(':') {
			Some((mode, path)) => (mode, path),
			None => (head, ""),
		};

		let mode = match mode {
			"publish" => Mode::Publish,
			"read" => Mode::Read,
			"" => return Err(ParseError::MissingMode),
			other => return Err(ParseError::InvalidMode(other.to_string())),
		};

		if path.is_empty() {
			return Err(ParseError::EmptyPath);
		}

		let mut user = None;
		let mut pass = None;

		for (key, value) in form_urlencoded::parse(query.as_bytes()) {
			match key.as_ref() {
				"user" => user = Some(value.into_owned()),
				"pass" => pass = Some(value.into_owned()),
				_ => {}
			}
		}

		Ok(Self {
			mode,
			path: path.to_string(),
			user,
			pass,
			query: query.to_string(),
		})
	}
}

impl fmt::Display for StreamId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.mode, self.path)?;

		if !self.query.is_empty() {
			write!(f, "?{}", self.query)?;
		}

		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	fn roundtrip(raw: &str) -> StreamId {
		let id: StreamId = raw.parse().unwrap();
		assert_eq!(id.to_string(), raw);
		id
	}

	#[test]
	fn publish() {
		let id = roundtrip("publish:cam1");
		assert_eq!(id.mode, Mode::Publish);
		assert_eq!(id.path, "cam1");
		assert_eq!(id.user, None);
		assert_eq!(id.pass, None);
		assert_eq!(id.query, "");
	}

	#[test]
	fn read_with_query() {
		let id = roundtrip("read:cam1?token=abc");
		assert_eq!(id.mode, Mode::Read);
		assert_eq!(id.path, "cam1");
		assert_eq!(id.query, "token=abc");
	}

	#[test]
	fn credentials_in_query() {
		let id = roundtrip("publish:cam1?user=admin&pass=secret&vhost=live");
		assert_eq!(id.user.as_deref(), Some("admin"));
		assert_eq!(id.pass.as_deref(), Some("secret"));

		// the query survives untouched, credentials included
		assert_eq!(id.query, "user=admin&pass=secret&vhost=live");
	}

	#[test]
	fn nested_path() {
		let id = roundtrip("publish:live/cam1");
		assert_eq!(id.path, "live/cam1");
	}

	#[test]
	fn missing_mode() {
		assert_eq!("".parse::<StreamId>(), Err(ParseError::MissingMode));
		assert_eq!(":cam1".parse::<StreamId>(), Err(ParseError::MissingMode));
	}

	#[test]
	fn invalid_mode() {
		assert_eq!(
			"stream:cam1".parse::<StreamId>(),
			Err(ParseError::InvalidMode("stream".to_string()))
		);
	}

	#[test]
	fn empty_path() {
		assert_eq!("publish".parse::<StreamId>(), Err(ParseError::EmptyPath));
		assert_eq!("publish:".parse::<StreamId>(), Err(ParseError::EmptyPath));
		assert_eq!("read?token=abc".parse::<StreamId>(), Err(ParseError::EmptyPath));
	}
}
