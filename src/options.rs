// Layout constants and runtime-tunable options.
//
// The layout constants (page size, slots per page, meta-column indices) are
// fixed by the on-disk format and kept as plain `const`s. `Options` wraps the
// handful of knobs an embedder actually chooses: the buffer pool size and
// the database root.

use std::path::{Path, PathBuf};

/// Size in bytes of a single `Page`.
pub const PAGE_SIZE: usize = 4096;
/// Size in bytes of a single slot.
pub const SLOT_SIZE: usize = 8;
/// Number of slots (records) a `Page`, and hence a base `ColumnGroup`, holds.
pub const MAX_RECORDS: usize = PAGE_SIZE / SLOT_SIZE;

/// Number of meta columns prefixed to every user column set.
pub const N_META_COLS: usize = 4;
pub const COL_INDIRECTION: usize = 0;
pub const COL_RID: usize = 1;
pub const COL_TIMESTAMP: usize = 2;
pub const COL_SCHEMA_ENCODING: usize = 3;

/// High bit of a 64-bit slot, used as a back-pointer marker on a tail
/// record's Indirection column when it points at the base record rather
/// than a previous tail record.
pub const MARK_1ST_BIT: u64 = 1u64 << 63;

/// Default number of partitions the buffer pool keeps resident.
pub const DEFAULT_BUFFER_CAPACITY: usize = 4;

#[derive(Debug, Clone)]
pub struct Options {
	/// Root directory under which every table gets its own subdirectory.
	pub path: PathBuf,
	/// Maximum number of partitions kept resident per table.
	pub buffer_capacity: usize,
}

impl Options {
	pub fn new(path: impl AsRef<Path>) -> Options {
		Options {
			path: path.as_ref().to_path_buf(),
			buffer_capacity: DEFAULT_BUFFER_CAPACITY,
		}
	}

	pub fn with_buffer_capacity(mut self, capacity: usize) -> Options {
		assert!(capacity >= 1, "buffer pool capacity must be at least 1");
		self.buffer_capacity = capacity;
		self
	}
}
