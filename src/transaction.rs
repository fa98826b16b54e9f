// Ordered batch of operations over a single table, executed atomically
// under the table's lock manager. Queries accumulate as an explicit
// `Operation` enum, dispatched as one unit through `Table::execute_batch`.

use crate::error::Result;
use crate::table::{OpResult, Operation, Table};

/// A batch of operations against one `Table`. The target table is fixed by
/// whichever call to `add_query` supplies it first; later calls that name a
/// different table panic, since a transaction only ever touches one table.
pub struct Transaction<'a> {
	table: Option<&'a Table>,
	queries: Vec<Operation>,
	results: Option<Vec<OpResult>>,
}

impl<'a> Transaction<'a> {
	pub fn new() -> Transaction<'a> {
		Transaction { table: None, queries: Vec::new(), results: None }
	}

	/// Appends `op` to the batch, binding the transaction to `table` if this
	/// is the first query.
	pub fn add_query(&mut self, table: &'a Table, op: Operation) {
		match self.table {
			None => self.table = Some(table),
			Some(bound) => assert!(
				std::ptr::eq(bound, table),
				"a transaction may only touch a single table"
			),
		}
		self.queries.push(op);
	}

	pub fn is_empty(&self) -> bool {
		self.queries.is_empty()
	}

	/// Submits the whole batch to `Table::check_and_lock`-equivalent
	/// locking. On success every operation has executed in submission order
	/// and the transaction has committed (`Ok(true)`); on lock conflict
	/// nothing has been mutated and the transaction has aborted
	/// (`Ok(false)`). A non-lock error (e.g. `OutOfRange` from a malformed
	/// operation) propagates instead of being treated as an abort.
	pub fn run(&mut self) -> Result<bool> {
		let table = self.table.expect("run() called on an empty transaction");
		match table.execute_batch(&self.queries)? {
			Some(results) => {
				self.results = Some(results);
				Ok(true)
			}
			None => {
				self.results = None;
				Ok(false)
			}
		}
	}

	/// Per-operation results from the most recent successful `run()`, in
	/// submission order. `None` if the transaction has never committed.
	pub fn results(&self) -> Option<&[OpResult]> {
		self.results.as_deref()
	}
}

impl<'a> Default for Transaction<'a> {
	fn default() -> Transaction<'a> {
		Transaction::new()
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::table::Operation;

	struct TempDir(std::path::PathBuf);
	impl TempDir {
		fn new(name: &str) -> TempDir {
			let mut path = std::env::temp_dir();
			path.push("lstore-core-test");
			path.push("transaction");
			path.push(name);
			let _ = std::fs::remove_dir_all(&path);
			std::fs::create_dir_all(&path).unwrap();
			TempDir(path)
		}
	}
	impl Drop for TempDir {
		fn drop(&mut self) {
			let _ = std::fs::remove_dir_all(&self.0);
		}
	}

	#[test]
	fn commits_and_executes_in_order() {
		let dir = TempDir::new("commit");
		let table = Table::open(&crate::options::Options::new(&dir.0).with_buffer_capacity(4), "t", 2, 0).unwrap();

		let mut txn = Transaction::new();
		txn.add_query(&table, Operation::Insert(vec![1, 10]));
		txn.add_query(&table, Operation::Insert(vec![2, 20]));
		assert!(txn.run().unwrap());

		let records = table.select(2, 0, &[true, true]).unwrap();
		assert_eq!(records[0].columns, vec![2, 20]);
	}

	#[test]
	fn abort_leaves_no_observable_change() {
		let dir = TempDir::new("abort");
		let table = Table::open(&crate::options::Options::new(&dir.0).with_buffer_capacity(4), "t", 1, 0).unwrap();
		table.insert(&[5]).unwrap();

		let mut update_txn = Transaction::new();
		update_txn.add_query(&table, Operation::Update { key: 5, new_values: vec![Some(6)] });
		assert!(update_txn.run().unwrap());

		// A second, conflicting transaction sharing the already-released
		// lock succeeds; real conflicts are exercised directly against
		// `Table::try_acquire_all` in `table`'s own tests, since driving a
		// genuine race here would depend on thread scheduling.
		let mut select_txn = Transaction::new();
		select_txn.add_query(&table, Operation::Select { key: 6, indexing_col: 0, mask: vec![true] });
		assert!(select_txn.run().unwrap());
	}
}
