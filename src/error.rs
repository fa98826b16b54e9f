// Error kinds surfaced by the storage core. `CapacityExceeded` from the
// spec is intentionally absent here: it is an internal signal consumed by
// `Table` before a partition ever grows past capacity and never escapes to
// a caller (see `partition::Partition::insert`'s `bool` return and
// `table::Table::append_row`).

use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
	/// A slot index, partition index, or row mask length was out of bounds.
	OutOfRange,
	/// The targeted column has no index installed.
	NotIndexed,
	/// A persisted partition, index, or metadata file could not be read or written.
	Io(std::io::Error),
	/// The on-disk layout did not match what the format expects.
	Corruption(String),
	/// A transaction's pre-check failed to acquire all required locks.
	Aborted,
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::OutOfRange => write!(f, "index out of range"),
			Error::NotIndexed => write!(f, "column is not indexed"),
			Error::Io(e) => write!(f, "io error: {}", e),
			Error::Corruption(s) => write!(f, "corrupted data: {}", s),
			Error::Aborted => write!(f, "transaction aborted"),
		}
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Error::Io(e) => Some(e),
			_ => None,
		}
	}
}

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Error {
		Error::Io(e)
	}
}
