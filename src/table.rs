// Owns a table's BufferPool and Index, maps RID -> (partition, slot), and
// implements insert/select/update/delete/increment/sum plus the per-RID
// lock manager used by `Transaction`.
//
// Every record-shaped operation is validated for column arity and range
// before it ever touches the lock manager, since `Operation` and
// `Transaction::add_query` are both public: a hand-built `Operation` has to
// be rejected with an ordinary `Error`, not a panic, the same way a bad
// slot index is rejected by `Page`/`ColumnGroup`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use crate::buffer_pool::BufferPool;
use crate::error::{Error, Result};
use crate::index::Index;
use crate::options::{Options, MAX_RECORDS, N_META_COLS};
use crate::Rid;

type TxnId = u64;

#[derive(Clone, Debug)]
pub struct Record {
	pub rid: Rid,
	pub key: i64,
	pub columns: Vec<i64>,
}

/// A single operation within a `Transaction` batch. `key`-bearing variants
/// other than `Select` always resolve against the table's key column;
/// `Select` lets the caller choose any indexed column instead.
#[derive(Clone, Debug)]
pub enum Operation {
	Insert(Vec<i64>),
	Select { key: i64, indexing_col: usize, mask: Vec<bool> },
	Update { key: i64, new_values: Vec<Option<i64>> },
	Delete { key: i64 },
	Increment { key: i64, column: usize },
	Sum { lo: i64, hi: i64, column: usize },
}

pub enum OpResult {
	Inserted(Rid),
	Selected(Vec<Record>),
	Updated,
	Deleted,
	Incremented(bool),
	Summed(i64),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum LockMode {
	Shared,
	Exclusive,
}

#[derive(Clone)]
enum LockEntry {
	Shared(HashMap<TxnId, u32>),
	Exclusive(TxnId),
}

fn now_secs() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn rid_to_pos(rid: Rid) -> (usize, usize) {
	let zero_based = rid - 1;
	((zero_based / MAX_RECORDS as u64) as usize, (zero_based % MAX_RECORDS as u64) as usize)
}

pub struct Table {
	pub name: String,
	path: PathBuf,
	num_user_columns: usize,
	key_column: usize,
	buffer_pool: BufferPool,
	index: Mutex<Index>,
	next_rid: Mutex<Rid>,
	current_partition: Mutex<usize>,
	glb_locks: Mutex<HashMap<Rid, LockEntry>>,
	/// Serialises the speculative-RID-peek-plus-lock-acquisition sequence
	/// for any batch containing an `Insert`: RID allocation and lock
	/// acquisition use separate mutexes, so without this, two concurrent
	/// inserting transactions could peek the same not-yet-consumed RID and
	/// race. Batches without an insert never touch this.
	insert_order: Mutex<()>,
	next_txn_id: AtomicU64,
}

impl Table {
	pub fn open(options: &Options, name: &str, num_user_columns: usize, key_column: usize) -> Result<Table> {
		assert!(key_column < num_user_columns, "key column out of range");
		let path = options.path.join(name);
		std::fs::create_dir_all(&path)?;
		let buffer_pool = BufferPool::open(&path, options.buffer_capacity, num_user_columns)?;

		let meta = read_meta(&path)?;
		let (next_rid, current_partition) = meta.unwrap_or((1, 0));
		if buffer_pool.partition_count() == 0 {
			let idx = buffer_pool.new_partition()?;
			assert_eq!(idx, 0);
		}

		let index = match read_index(&path, num_user_columns)? {
			Some(index) => index,
			None => Index::new(num_user_columns, key_column),
		};

		Ok(Table {
			name: name.to_string(),
			path,
			num_user_columns,
			key_column,
			buffer_pool,
			index: Mutex::new(index),
			next_rid: Mutex::new(next_rid),
			current_partition: Mutex::new(current_partition),
			glb_locks: Mutex::new(HashMap::new()),
			insert_order: Mutex::new(()),
			next_txn_id: AtomicU64::new(1),
		})
	}

	pub fn num_user_columns(&self) -> usize {
		self.num_user_columns
	}

	pub fn key_column(&self) -> usize {
		self.key_column
	}

	fn alloc_txn_id(&self) -> TxnId {
		self.next_txn_id.fetch_add(1, Ordering::Relaxed)
	}

	fn peek_next_rid(&self) -> Rid {
		*self.next_rid.lock()
	}

	fn alloc_rid(&self) -> Rid {
		let mut guard = self.next_rid.lock();
		let rid = *guard;
		*guard += 1;
		rid
	}

	fn full_mask(&self, user_mask: &[bool]) -> Vec<bool> {
		let mut mask = vec![false; N_META_COLS + self.num_user_columns];
		mask[N_META_COLS..].copy_from_slice(user_mask);
		mask
	}

	/// Resolves, for each op in `ops`, the RIDs it needs locked.
	fn resolve(&self, ops: &[Operation]) -> Vec<Vec<Rid>> {
		let index = self.index.lock();
		ops.iter()
			.map(|op| match op {
				Operation::Insert(_) => vec![self.peek_next_rid()],
				Operation::Select { key, indexing_col, .. } => index.locate(*indexing_col, *key),
				Operation::Update { key, .. } | Operation::Delete { key } | Operation::Increment { key, .. } => {
					index.locate(self.key_column, *key)
				}
				Operation::Sum { lo, hi, .. } => {
					index.locate_range(self.key_column, *lo, hi.checked_add(1).unwrap_or(i64::MAX))
				}
			})
			.collect()
	}

	fn lock_mode(op: &Operation) -> LockMode {
		match op {
			Operation::Select { .. } => LockMode::Shared,
			_ => LockMode::Exclusive,
		}
	}

	/// Checks an operation's column-shaped arguments against the table's
	/// arity before it ever reaches the lock manager or a partition. Called
	/// once per operation at the top of `execute_batch`, so both the
	/// self-locking convenience methods below and a hand-built `Operation`
	/// submitted through a public `Transaction` get the same check: a bad
	/// arity fails here with `Error::OutOfRange` rather than panicking
	/// deeper in `append_row`/`do_select`/`do_update`/`do_increment`/`do_sum`.
	fn validate_op(&self, op: &Operation) -> Result<()> {
		let check_column = |col: usize| if col < self.num_user_columns { Ok(()) } else { Err(Error::OutOfRange) };
		match op {
			Operation::Insert(values) => {
				if values.len() != self.num_user_columns {
					return Err(Error::OutOfRange);
				}
			}
			Operation::Select { indexing_col, mask, .. } => {
				check_column(*indexing_col)?;
				if mask.len() != self.num_user_columns {
					return Err(Error::OutOfRange);
				}
			}
			Operation::Update { new_values, .. } => {
				if new_values.len() != self.num_user_columns {
					return Err(Error::OutOfRange);
				}
			}
			Operation::Delete { .. } => {}
			Operation::Increment { column, .. } => check_column(*column)?,
			Operation::Sum { column, .. } => check_column(*column)?,
		}
		Ok(())
	}

	fn try_acquire_all(&self, txn: TxnId, ops: &[Operation], resolved: &[Vec<Rid>]) -> bool {
		let mut glb = self.glb_locks.lock();
		let mut overlay: HashMap<Rid, LockEntry> = HashMap::new();
		for (op, rids) in ops.iter().zip(resolved) {
			let mode = Self::lock_mode(op);
			for &rid in rids {
				let entry = overlay
					.entry(rid)
					.or_insert_with(|| glb.get(&rid).cloned().unwrap_or_else(|| LockEntry::Shared(HashMap::new())));
				if !merge_lock(entry, txn, mode) {
					return false;
				}
			}
		}
		for (rid, entry) in overlay {
			glb.insert(rid, entry);
		}
		true
	}

	fn release_all(&self, txn: TxnId, resolved: &[Vec<Rid>]) {
		let mut glb = self.glb_locks.lock();
		for rids in resolved {
			for &rid in rids {
				let remove_entry = match glb.get_mut(&rid) {
					Some(LockEntry::Exclusive(holder)) if *holder == txn => true,
					Some(LockEntry::Shared(holders)) => {
						holders.remove(&txn);
						holders.is_empty()
					}
					_ => false,
				};
				if remove_entry {
					glb.remove(&rid);
				}
			}
		}
	}

	/// Attempts to acquire every lock the batch needs, and on success
	/// executes each operation in order and releases the locks. Returns
	/// `None` on abort (no state mutated); `Some(results)` on commit, one
	/// result per operation.
	pub fn execute_batch(&self, ops: &[Operation]) -> Result<Option<Vec<OpResult>>> {
		for op in ops {
			self.validate_op(op)?;
		}

		let has_insert = ops.iter().any(|op| matches!(op, Operation::Insert(_)));
		let _insert_guard = if has_insert { Some(self.insert_order.lock()) } else { None };

		let txn = self.alloc_txn_id();
		let resolved = self.resolve(ops);
		if !self.try_acquire_all(txn, ops, &resolved) {
			log::debug!(target: "lstore", "txn {} aborted: lock conflict", txn);
			return Ok(None);
		}

		let mut results = Vec::with_capacity(ops.len());
		let mut failed = None;
		for (op, rids) in ops.iter().zip(&resolved) {
			match self.execute_op(op, rids) {
				Ok(r) => results.push(r),
				Err(e) => {
					failed = Some(e);
					break;
				}
			}
		}
		self.release_all(txn, &resolved);
		match failed {
			Some(e) => Err(e),
			None => Ok(Some(results)),
		}
	}

	fn execute_op(&self, op: &Operation, rids: &[Rid]) -> Result<OpResult> {
		match op {
			Operation::Insert(values) => Ok(OpResult::Inserted(self.append_row(values)?)),
			Operation::Select { key, mask, .. } => Ok(OpResult::Selected(self.do_select(*key, rids, mask)?)),
			Operation::Update { key, new_values } => {
				self.do_update(*key, rids, new_values)?;
				Ok(OpResult::Updated)
			}
			Operation::Delete { .. } => {
				self.do_delete(rids)?;
				Ok(OpResult::Deleted)
			}
			Operation::Increment { column, .. } => Ok(OpResult::Incremented(self.do_increment(rids, *column)?)),
			Operation::Sum { column, .. } => Ok(OpResult::Summed(self.do_sum(rids, *column)?)),
		}
	}

	fn run_single(&self, op: Operation) -> Result<OpResult> {
		match self.execute_batch(std::slice::from_ref(&op))? {
			Some(mut results) => Ok(results.remove(0)),
			None => Err(Error::Aborted),
		}
	}

	// ---- public, self-locking convenience API -----------------------

	pub fn insert(&self, user_columns: &[i64]) -> Result<Rid> {
		match self.run_single(Operation::Insert(user_columns.to_vec()))? {
			OpResult::Inserted(rid) => Ok(rid),
			_ => unreachable!(),
		}
	}

	pub fn select(&self, key: i64, indexing_col: usize, mask: &[bool]) -> Result<Vec<Record>> {
		match self.run_single(Operation::Select { key, indexing_col, mask: mask.to_vec() })? {
			OpResult::Selected(records) => Ok(records),
			_ => unreachable!(),
		}
	}

	pub fn update(&self, key: i64, new_values: &[Option<i64>]) -> Result<()> {
		self.run_single(Operation::Update { key, new_values: new_values.to_vec() }).map(|_| ())
	}

	pub fn delete(&self, key: i64) -> Result<()> {
		self.run_single(Operation::Delete { key }).map(|_| ())
	}

	pub fn increment(&self, key: i64, column: usize) -> Result<bool> {
		match self.run_single(Operation::Increment { key, column })? {
			OpResult::Incremented(found) => Ok(found),
			_ => unreachable!(),
		}
	}

	pub fn sum(&self, lo: i64, hi: i64, column: usize) -> Result<i64> {
		match self.run_single(Operation::Sum { lo, hi, column })? {
			OpResult::Summed(total) => Ok(total),
			_ => unreachable!(),
		}
	}

	pub fn create_index(&self, column: usize) {
		self.index.lock().create_index(column);
	}

	pub fn drop_index(&self, column: usize) {
		self.index.lock().drop_index(column);
	}

	/// Consolidates partition `idx`'s tail deltas back into its base,
	/// discarding tail history; merge is opportunistic and does not preserve
	/// time-travel reads. Not called automatically on any path; callers that
	/// want to bound tail growth on a hot partition invoke it directly.
	pub fn merge_partition(&self, idx: usize) -> Result<()> {
		self.buffer_pool.merge(idx)
	}

	pub fn partition_count(&self) -> usize {
		self.buffer_pool.partition_count()
	}

	pub fn close(&self) -> Result<()> {
		self.buffer_pool.flush()?;
		write_meta(&self.path, self.peek_next_rid(), *self.current_partition.lock())?;
		write_index(&self.path, &self.index.lock())?;
		Ok(())
	}

	// ---- algorithms, executed only while the caller's locks are held --

	fn append_row(&self, user_columns: &[i64]) -> Result<Rid> {
		let rid = self.alloc_rid();
		let ts = now_secs();
		let mut row = vec![0u64; N_META_COLS + self.num_user_columns];
		row[crate::options::COL_RID] = rid;
		row[crate::options::COL_TIMESTAMP] = ts;
		for (j, &v) in user_columns.iter().enumerate() {
			row[N_META_COLS + j] = v as u64;
		}

		let mut current = self.current_partition.lock();
		let written = self.buffer_pool.with(*current, |p| p.insert(&row))?;
		if !written {
			log::debug!(target: "lstore", "partition {} full, creating a new one", *current);
			let new_idx = self.buffer_pool.new_partition()?;
			*current = new_idx;
			let ok = self.buffer_pool.with(*current, |p| p.insert(&row))?;
			assert!(ok, "fresh partition must have capacity");
		}
		drop(current);

		let mut index = self.index.lock();
		for (j, &v) in user_columns.iter().enumerate() {
			if index.is_indexed(j) {
				index.insert(j, v, rid)?;
			}
		}
		Ok(rid)
	}

	fn backfill_if_needed(&self, index: &mut Index) -> Result<()> {
		if index.pending_backfill().is_empty() {
			return Ok(());
		}
		let next_rid = self.peek_next_rid();
		let mut rows = Vec::new();
		for rid in 1..next_rid {
			let (partition, slot) = rid_to_pos(rid);
			if partition >= self.buffer_pool.partition_count() {
				break;
			}
			let values = self.buffer_pool.with(partition, |p| {
				if slot >= p.count_base() || !p.is_live(slot)? {
					return Ok(None);
				}
				let mask = vec![true; N_META_COLS + self.num_user_columns];
				let row = p.read(slot, &mask)?;
				Ok(Some(row[N_META_COLS..].iter().map(|&v| v as i64).collect::<Vec<_>>()))
			})?;
			if let Some(values) = values {
				rows.push((rid, values));
			}
		}
		index.backfill(rows.into_iter());
		Ok(())
	}

	fn do_select(&self, key: i64, rids: &[Rid], user_mask: &[bool]) -> Result<Vec<Record>> {
		{
			let mut index = self.index.lock();
			self.backfill_if_needed(&mut index)?;
		}
		let mask = self.full_mask(user_mask);
		let mut out = Vec::with_capacity(rids.len());
		for &rid in rids {
			let (partition, slot) = rid_to_pos(rid);
			let row = self.buffer_pool.with(partition, |p| {
				if !p.is_live(slot)? {
					return Ok(None);
				}
				p.read(slot, &mask).map(Some)
			})?;
			if let Some(row) = row {
				let columns = row.iter().map(|&v| v as i64).collect();
				out.push(Record { rid, key, columns });
			}
		}
		Ok(out)
	}

	fn do_update(&self, key: i64, rids: &[Rid], new_values: &[Option<i64>]) -> Result<()> {
		let raw: Vec<Option<u64>> = new_values.iter().map(|v| v.map(|v| v as u64)).collect();
		let key_change = new_values[self.key_column];
		for &rid in rids {
			let (partition, slot) = rid_to_pos(rid);
			self.buffer_pool.with(partition, |p| p.update(slot, rid, &raw))?;
			if let Some(new_key) = key_change {
				self.index.lock().update(self.key_column, key, new_key, rid)?;
			}
		}
		Ok(())
	}

	fn do_delete(&self, rids: &[Rid]) -> Result<()> {
		for &rid in rids {
			let (partition, slot) = rid_to_pos(rid);
			let key_value = self.buffer_pool.with(partition, |p| {
				let mut mask = vec![false; N_META_COLS + self.num_user_columns];
				mask[N_META_COLS + self.key_column] = true;
				p.read(slot, &mask).map(|row| row[0] as i64)
			})?;
			self.index.lock().delete(self.key_column, key_value, rid);
			self.buffer_pool.with(partition, |p| p.delete(slot))?;
		}
		Ok(())
	}

	fn do_increment(&self, rids: &[Rid], column: usize) -> Result<bool> {
		if rids.is_empty() {
			return Ok(false);
		}
		for &rid in rids {
			let (partition, slot) = rid_to_pos(rid);
			self.buffer_pool.with(partition, |p| {
				let mut mask = vec![false; N_META_COLS + self.num_user_columns];
				mask[N_META_COLS + column] = true;
				let current = p.read(slot, &mask)?[0] as i64;
				let mut values = vec![None; self.num_user_columns];
				values[column] = Some(current.wrapping_add(1) as u64);
				p.update(slot, rid, &values)
			})?;
		}
		Ok(true)
	}

	fn do_sum(&self, rids: &[Rid], column: usize) -> Result<i64> {
		let mut total: i64 = 0;
		let mut mask = vec![false; N_META_COLS + self.num_user_columns];
		mask[N_META_COLS + column] = true;
		for &rid in rids {
			let (partition, slot) = rid_to_pos(rid);
			let value = self.buffer_pool.with(partition, |p| {
				if !p.is_live(slot)? {
					return Ok(None);
				}
				p.read(slot, &mask).map(|row| Some(row[0] as i64))
			})?;
			if let Some(v) = value {
				total = total.wrapping_add(v);
			}
		}
		Ok(total)
	}
}

fn merge_lock(entry: &mut LockEntry, txn: TxnId, mode: LockMode) -> bool {
	match (entry.clone(), mode) {
		(LockEntry::Shared(mut holders), LockMode::Shared) => {
			*holders.entry(txn).or_insert(0) += 1;
			*entry = LockEntry::Shared(holders);
			true
		}
		(LockEntry::Shared(holders), LockMode::Exclusive) => {
			if holders.is_empty() || (holders.len() == 1 && holders.contains_key(&txn)) {
				*entry = LockEntry::Exclusive(txn);
				true
			} else {
				false
			}
		}
		(LockEntry::Exclusive(holder), _) => holder == txn,
	}
}

const META_FILE: &str = "meta";
const INDEX_FILE: &str = "index";

fn read_meta(path: &Path) -> Result<Option<(Rid, usize)>> {
	let file = path.join(META_FILE);
	if !file.exists() {
		return Ok(None);
	}
	let bytes = std::fs::read(file)?;
	if bytes.len() < 16 {
		return Err(Error::Corruption("truncated meta file".into()));
	}
	let next_rid = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
	let current_partition = u64::from_le_bytes(bytes[8..16].try_into().unwrap()) as usize;
	Ok(Some((next_rid, current_partition)))
}

fn write_meta(path: &Path, next_rid: Rid, current_partition: usize) -> Result<()> {
	let mut buf = Vec::with_capacity(16);
	buf.extend_from_slice(&next_rid.to_le_bytes());
	buf.extend_from_slice(&(current_partition as u64).to_le_bytes());
	std::fs::write(path.join(META_FILE), buf)?;
	Ok(())
}

fn read_index(path: &Path, num_user_columns: usize) -> Result<Option<Index>> {
	let file = path.join(INDEX_FILE);
	if !file.exists() {
		return Ok(None);
	}
	let bytes = std::fs::read(file)?;
	Ok(Some(Index::from_bytes(&bytes, num_user_columns)?))
}

fn write_index(path: &Path, index: &Index) -> Result<()> {
	std::fs::write(path.join(INDEX_FILE), index.to_bytes())?;
	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;

	struct TempDir(PathBuf);
	impl TempDir {
		fn new(name: &str) -> TempDir {
			env_logger::try_init().ok();
			let mut path = std::env::temp_dir();
			path.push("lstore-core-test");
			path.push("table");
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

	fn mask_all(n: usize) -> Vec<bool> {
		vec![true; n]
	}

	#[test]
	fn insert_and_select_scenario_1() {
		let dir = TempDir::new("scenario1");
		let table = Table::open(&Options::new(&dir.0).with_buffer_capacity(4), "grades", 5, 0).unwrap();
		for k in 2000..2005i64 {
			table.insert(&[k, 4, 3, 2, -1]).unwrap();
		}
		let records = table.select(2003, 0, &mask_all(5)).unwrap();
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].rid, 4);
		assert_eq!(records[0].columns, vec![2003, 4, 3, 2, -1]);
	}

	#[test]
	fn update_scenario_2_and_3() {
		let dir = TempDir::new("scenario23");
		let table = Table::open(&Options::new(&dir.0).with_buffer_capacity(4), "grades", 5, 0).unwrap();
		for k in 2000..2005i64 {
			table.insert(&[k, 4, 3, 2, -1]).unwrap();
		}
		table.update(2001, &[None, Some(1), None, None, Some(1)]).unwrap();
		let rec = table.select(2001, 0, &mask_all(5)).unwrap();
		assert_eq!(rec[0].columns, vec![2001, 1, 3, 2, 1]);

		table.update(2001, &[Some(10), Some(11), Some(12), Some(13), Some(14)]).unwrap();
		let rec = table.select(10, 0, &mask_all(5)).unwrap();
		assert_eq!(rec[0].columns, vec![10, 11, 12, 13, 14]);
		assert!(table.select(2001, 0, &mask_all(5)).unwrap().is_empty());
	}

	#[test]
	fn insert_past_partition_capacity_rolls_over() {
		let dir = TempDir::new("partition_rollover");
		let table = Table::open(&Options::new(&dir.0).with_buffer_capacity(4), "t", 1, 0).unwrap();
		for k in 0..MAX_RECORDS as i64 {
			table.insert(&[k]).unwrap();
		}
		let rid = table.insert(&[999]).unwrap();
		assert_eq!(rid, (MAX_RECORDS + 1) as u64);
	}

	#[test]
	fn delete_then_select_returns_nothing() {
		let dir = TempDir::new("delete");
		let table = Table::open(&Options::new(&dir.0).with_buffer_capacity(4), "t", 2, 0).unwrap();
		table.insert(&[1, 100]).unwrap();
		table.delete(1).unwrap();
		assert!(table.select(1, 0, &mask_all(2)).unwrap().is_empty());
	}

	#[test]
	fn increment_and_sum() {
		let dir = TempDir::new("increment_sum");
		let table = Table::open(&Options::new(&dir.0).with_buffer_capacity(4), "t", 2, 0).unwrap();
		for k in 0..5i64 {
			table.insert(&[k, 10]).unwrap();
		}
		assert!(table.increment(2, 1).unwrap());
		assert!(!table.increment(999, 1).unwrap());
		let total = table.sum(0, 4, 1).unwrap();
		assert_eq!(total, 10 * 4 + 11);
	}

	#[test]
	fn lazy_index_backfill() {
		let dir = TempDir::new("backfill");
		let table = Table::open(&Options::new(&dir.0).with_buffer_capacity(4), "t", 2, 0).unwrap();
		for k in 0..3i64 {
			table.insert(&[k, k * 100]).unwrap();
		}
		table.create_index(1);
		let records = table.select(200, 1, &mask_all(2)).unwrap();
		assert_eq!(records.len(), 1);
		assert_eq!(records[0].columns, vec![2, 200]);
	}

	#[test]
	fn merge_partition_preserves_reads_and_resets_chain_state() {
		let dir = TempDir::new("merge");
		let table = Table::open(&Options::new(&dir.0).with_buffer_capacity(4), "t", 2, 0).unwrap();
		table.insert(&[1, 10]).unwrap();
		table.update(1, &[None, Some(20)]).unwrap();
		table.update(1, &[None, Some(30)]).unwrap();
		let before = table.select(1, 0, &mask_all(2)).unwrap()[0].columns.clone();

		table.merge_partition(0).unwrap();

		let after = table.select(1, 0, &mask_all(2)).unwrap()[0].columns.clone();
		assert_eq!(before, after);
		// a further update still works against the merged base.
		table.update(1, &[None, Some(40)]).unwrap();
		assert_eq!(table.select(1, 0, &mask_all(2)).unwrap()[0].columns, vec![1, 40]);
	}

	#[test]
	fn close_and_reopen_round_trips() {
		let dir = TempDir::new("reopen");
		{
			let table = Table::open(&Options::new(&dir.0).with_buffer_capacity(4), "t", 2, 0).unwrap();
			for k in 0..5i64 {
				table.insert(&[k, k * 10]).unwrap();
			}
			table.update(2, &[None, Some(999)]).unwrap();
			table.close().unwrap();
		}
		let table = Table::open(&Options::new(&dir.0).with_buffer_capacity(4), "t", 2, 0).unwrap();
		let rec = table.select(2, 0, &mask_all(2)).unwrap();
		assert_eq!(rec[0].columns, vec![2, 999]);
		let rid = table.insert(&[5, 50]).unwrap();
		assert_eq!(rid, 6);
	}

	#[test]
	fn conflicting_update_then_select_aborts_the_second() {
		let dir = TempDir::new("concurrency");
		let table = Table::open(&Options::new(&dir.0).with_buffer_capacity(4), "t", 1, 0).unwrap();
		table.insert(&[5]).unwrap();

		// Drives the lock manager directly the way `execute_batch` does, to
		// exercise the abort path deterministically instead of relying on
		// thread scheduling.
		let ops_update = [Operation::Update { key: 5, new_values: vec![Some(6)] }];
		let resolved_update = table.resolve(&ops_update);
		assert!(table.try_acquire_all(1, &ops_update, &resolved_update));

		let ops_select = [Operation::Select { key: 5, indexing_col: 0, mask: vec![true] }];
		let resolved_select = table.resolve(&ops_select);
		assert!(!table.try_acquire_all(2, &ops_select, &resolved_select));

		table.release_all(1, &resolved_update);
		assert!(table.try_acquire_all(2, &ops_select, &resolved_select));
		table.release_all(2, &resolved_select);
	}

	/// Exercises the real `std::thread` scheduling model: many threads
	/// hammering a shared table with random increments and reads never
	/// deadlock (every `execute_batch` call returns), and a `sum` over the
	/// whole key range afterwards accounts for exactly the increments that
	/// committed.
	#[test]
	fn concurrent_transactions_never_deadlock_and_stay_consistent() {
		use rand::Rng;
		use std::sync::Arc;
		use std::thread;

		let dir = TempDir::new("concurrent_increments");
		let table = Arc::new(Table::open(&Options::new(&dir.0).with_buffer_capacity(4), "t", 2, 0).unwrap());
		let n_keys = 20i64;
		for k in 0..n_keys {
			table.insert(&[k, 0]).unwrap();
		}

		let committed = Arc::new(std::sync::atomic::AtomicI64::new(0));
		let mut handles = Vec::new();
		for _ in 0..8 {
			let table = Arc::clone(&table);
			let committed = Arc::clone(&committed);
			handles.push(thread::spawn(move || {
				let mut rng = rand::thread_rng();
				for _ in 0..50 {
					let key = rng.gen_range(0..n_keys);
					if table.increment(key, 1).unwrap() {
						committed.fetch_add(1, Ordering::Relaxed);
					}
				}
			}));
		}
		for h in handles {
			h.join().unwrap();
		}

		let total: i64 = table.sum(0, n_keys - 1, 1).unwrap();
		assert_eq!(total, committed.load(Ordering::Relaxed));
	}
}
