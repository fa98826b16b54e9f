// Directory of tables with an open/close lifecycle.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::options::Options;
use crate::table::Table;

pub struct Database {
	options: Options,
	tables: HashMap<String, Table>,
}

impl Database {
	/// Opens (creating if absent) the database directory at `path`. No
	/// tables are loaded eagerly; `create_table` both creates a fresh table
	/// and reopens one that already has data on disk under `path`.
	pub fn open(path: impl AsRef<Path>) -> Result<Database> {
		let options = Options::new(path.as_ref());
		std::fs::create_dir_all(&options.path)?;
		Ok(Database { options, tables: HashMap::new() })
	}

	pub fn with_buffer_capacity(mut self, capacity: usize) -> Database {
		self.options = self.options.with_buffer_capacity(capacity);
		self
	}

	/// Opens (or creates) a table rooted at `<path>/<name>` with `num_columns`
	/// user columns and key column index `key`. Calling this again for a
	/// table that already exists in the directory reopens it from disk; the
	/// `num_columns`/`key` the caller supplies must match what was used at
	/// creation, since the core does not persist a schema beyond those two
	/// values (see `Table::open`, which trusts its caller for this reason).
	pub fn create_table(&mut self, name: &str, num_columns: usize, key: usize) -> Result<&Table> {
		if !self.tables.contains_key(name) {
			let table = Table::open(&self.options, name, num_columns, key)?;
			self.tables.insert(name.to_string(), table);
		}
		Ok(self.tables.get(name).expect("just inserted"))
	}

	pub fn get_table(&self, name: &str) -> Option<&Table> {
		self.tables.get(name)
	}

	/// Drops `name` from the in-memory directory. On-disk cleanup is left to
	/// the caller: the table's directory under `<path>` is not removed, only
	/// the in-memory table object is forgotten.
	pub fn drop_table(&mut self, name: &str) -> Result<()> {
		if let Some(table) = self.tables.remove(name) {
			table.close()?;
		}
		Ok(())
	}

	/// Closes every open table, flushing its buffer pool and persisting its
	/// index and metadata.
	pub fn close(&mut self) -> Result<()> {
		for table in self.tables.values() {
			table.close()?;
		}
		self.tables.clear();
		Ok(())
	}
}
