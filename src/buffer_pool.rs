// Per-table LRU-bounded cache of in-memory partitions, with dirty
// write-back and on-disk persistence.
//
// A single `parking_lot::Mutex` guards the resident directory and LRU
// list; a partition handed to a caller through `with` stays resident for
// the entire closure call because the mutex is held for that duration,
// which pins it against eviction without needing a separate pin-count
// table.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::column_group::ColumnGroup;
use crate::error::{Error, Result};
use crate::page::Page;
use crate::partition::Partition;

struct Inner {
	resident: HashMap<usize, Partition>,
	/// Front = least recently used, back = most recently used.
	lru: VecDeque<usize>,
	total: usize,
}

pub struct BufferPool {
	path: PathBuf,
	capacity: usize,
	num_user_cols: usize,
	inner: Mutex<Inner>,
}

impl BufferPool {
	pub fn open(path: impl Into<PathBuf>, capacity: usize, num_user_cols: usize) -> Result<BufferPool> {
		let path = path.into();
		std::fs::create_dir_all(&path)?;
		let existing = count_existing_partitions(&path)?;
		Ok(BufferPool {
			path,
			capacity,
			num_user_cols,
			inner: Mutex::new(Inner { resident: HashMap::new(), lru: VecDeque::new(), total: existing }),
		})
	}

	pub fn partition_count(&self) -> usize {
		self.inner.lock().total
	}

	/// Reserves a fresh partition index, evicting if necessary, and
	/// returns it.
	pub fn new_partition(&self) -> Result<usize> {
		let mut inner = self.inner.lock();
		let idx = inner.total;
		inner.total += 1;
		if inner.resident.len() >= self.capacity {
			self.evict_one(&mut inner)?;
		}
		log::debug!(target: "lstore", "creating partition {}", idx);
		inner.resident.insert(idx, Partition::new(self.num_user_cols));
		inner.lru.push_back(idx);
		Ok(idx)
	}

	/// Runs `f` against partition `idx`, loading it from disk on miss and
	/// moving it to the MRU end of the LRU list first.
	pub fn with<F, R>(&self, idx: usize, f: F) -> Result<R>
	where
		F: FnOnce(&mut Partition) -> Result<R>,
	{
		let mut inner = self.inner.lock();
		self.touch(&mut inner, idx)?;
		let partition = inner.resident.get_mut(&idx).expect("just touched");
		f(partition)
	}

	fn touch(&self, inner: &mut Inner, idx: usize) -> Result<()> {
		if inner.resident.contains_key(&idx) {
			inner.lru.retain(|&i| i != idx);
			inner.lru.push_back(idx);
			return Ok(());
		}
		if idx >= inner.total {
			return Err(Error::OutOfRange);
		}
		if inner.resident.len() >= self.capacity {
			self.evict_one(inner)?;
		}
		log::trace!(target: "lstore", "loading partition {} from disk", idx);
		let partition = self.load(idx)?;
		inner.resident.insert(idx, partition);
		inner.lru.push_back(idx);
		Ok(())
	}

	fn evict_one(&self, inner: &mut Inner) -> Result<()> {
		if let Some(victim) = inner.lru.pop_front() {
			if let Some(partition) = inner.resident.remove(&victim) {
				if partition.is_dirty() {
					log::debug!(target: "lstore", "evicting dirty partition {}, writing back", victim);
					self.save(victim, &partition)?;
				} else {
					log::trace!(target: "lstore", "evicting clean partition {}", victim);
				}
			}
		}
		Ok(())
	}

	/// Runs `Partition::merge` against partition `idx`, consolidating its
	/// tail deltas back into the base and marking it dirty so the
	/// consolidated state is what the next eviction or flush persists. Used
	/// opportunistically by callers that want to bound a hot partition's
	/// tail growth without waiting for a natural eviction.
	pub fn merge(&self, idx: usize) -> Result<()> {
		self.with(idx, |p| p.merge())
	}

	/// Persists every resident dirty partition. Used at table close.
	pub fn flush(&self) -> Result<()> {
		let mut inner = self.inner.lock();
		let ids: Vec<usize> = inner.resident.keys().copied().collect();
		for id in ids {
			let dirty = inner.resident.get(&id).map(|p| p.is_dirty()).unwrap_or(false);
			if dirty {
				{
					let partition = inner.resident.get(&id).unwrap();
					self.save(id, partition)?;
				}
				inner.resident.get_mut(&id).unwrap().set_clean();
			}
		}
		Ok(())
	}

	fn partition_path(&self, idx: usize) -> PathBuf {
		self.path.join(idx.to_string())
	}

	fn save(&self, idx: usize, partition: &Partition) -> Result<()> {
		let mut buf = Vec::new();
		buf.extend_from_slice(&(partition.count_base() as u64).to_le_bytes());
		buf.extend_from_slice(&partition.count_tail().to_le_bytes());
		buf.extend_from_slice(&(partition.tail_groups().len() as u64).to_le_bytes());
		let updated: Vec<u64> = partition.updated_slots().iter().map(|&s| s as u64).collect();
		buf.extend_from_slice(&(updated.len() as u64).to_le_bytes());
		for slot in updated {
			buf.extend_from_slice(&slot.to_le_bytes());
		}
		write_column_group(&mut buf, partition.base_group());
		for group in partition.tail_groups() {
			write_column_group(&mut buf, group);
		}
		let mut file = std::fs::File::create(self.partition_path(idx))?;
		file.write_all(&buf)?;
		Ok(())
	}

	fn load(&self, idx: usize) -> Result<Partition> {
		let path = self.partition_path(idx);
		if !path.exists() {
			// Never persisted (e.g. a partition created but not yet
			// evicted, recovered after process restart): treat as a
			// fresh, empty partition.
			return Ok(Partition::new(self.num_user_cols));
		}
		let mut file = std::fs::File::open(path)?;
		let mut buf = Vec::new();
		file.read_to_end(&mut buf)?;
		let mut cursor = 0usize;
		let count_base = read_u64(&buf, &mut cursor)? as usize;
		let count_tail = read_u64(&buf, &mut cursor)?;
		let num_tail_groups = read_u64(&buf, &mut cursor)? as usize;
		let updated_len = read_u64(&buf, &mut cursor)? as usize;
		let mut updated_slots = std::collections::BTreeSet::new();
		for _ in 0..updated_len {
			updated_slots.insert(read_u64(&buf, &mut cursor)? as usize);
		}
		let col_count = self.num_user_cols + crate::options::N_META_COLS;
		let base = read_column_group(&buf, &mut cursor, col_count)?;
		let mut tail = Vec::with_capacity(num_tail_groups);
		for _ in 0..num_tail_groups {
			tail.push(read_column_group(&buf, &mut cursor, col_count)?);
		}
		Ok(Partition::from_parts(self.num_user_cols, count_base, count_tail, updated_slots, base, tail))
	}
}

fn write_column_group(buf: &mut Vec<u8>, group: &ColumnGroup) {
	for page in group.pages() {
		buf.extend_from_slice(page.as_bytes());
	}
}

fn read_column_group(buf: &[u8], cursor: &mut usize, col_count: usize) -> Result<ColumnGroup> {
	let mut pages = Vec::with_capacity(col_count);
	for _ in 0..col_count {
		if *cursor + crate::options::PAGE_SIZE > buf.len() {
			return Err(Error::Corruption("truncated partition file".into()));
		}
		let mut bytes = [0u8; crate::options::PAGE_SIZE];
		bytes.copy_from_slice(&buf[*cursor..*cursor + crate::options::PAGE_SIZE]);
		*cursor += crate::options::PAGE_SIZE;
		pages.push(Page::from_bytes(bytes));
	}
	Ok(ColumnGroup::from_pages(pages))
}

fn read_u64(buf: &[u8], cursor: &mut usize) -> Result<u64> {
	if *cursor + 8 > buf.len() {
		return Err(Error::Corruption("truncated partition file".into()));
	}
	let v = u64::from_le_bytes(buf[*cursor..*cursor + 8].try_into().unwrap());
	*cursor += 8;
	Ok(v)
}

fn count_existing_partitions(path: &std::path::Path) -> Result<usize> {
	let mut max_seen: Option<usize> = None;
	for entry in std::fs::read_dir(path)? {
		let entry = entry?;
		if let Some(name) = entry.file_name().to_str() {
			if let Ok(idx) = name.parse::<usize>() {
				max_seen = Some(max_seen.map_or(idx, |m| m.max(idx)));
			}
		}
	}
	Ok(max_seen.map_or(0, |m| m + 1))
}

#[cfg(test)]
mod test {
	use super::*;

	struct TempDir(PathBuf);
	impl TempDir {
		fn new(name: &str) -> TempDir {
			let mut path = std::env::temp_dir();
			path.push("lstore-core-test");
			path.push("buffer-pool");
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

	fn full_row(rid: u64, value: u64) -> Vec<u64> {
		vec![0, rid, 0, 0, value]
	}

	#[test]
	fn new_partition_then_write_and_read() {
		let dir = TempDir::new("basic");
		let pool = BufferPool::open(&dir.0, 2, 1).unwrap();
		let idx = pool.new_partition().unwrap();
		pool.with(idx, |p| p.insert(&full_row(1, 42)).map(|_| ())).unwrap();
		let value = pool.with(idx, |p| p.read(0, &[true, true, true, true, true])).unwrap();
		assert_eq!(value, vec![0, 1, 0, 0, 42]);
	}

	#[test]
	fn eviction_round_trips_through_disk() {
		let dir = TempDir::new("evict");
		let pool = BufferPool::open(&dir.0, 1, 1).unwrap();
		let a = pool.new_partition().unwrap();
		pool.with(a, |p| p.insert(&full_row(1, 11)).map(|_| ())).unwrap();
		// capacity is 1: creating a second partition evicts `a` to disk.
		let b = pool.new_partition().unwrap();
		pool.with(b, |p| p.insert(&full_row(2, 22)).map(|_| ())).unwrap();
		// touching `a` again evicts `b` and reloads `a` from disk.
		let value = pool.with(a, |p| p.read(0, &[true, true, true, true, true])).unwrap();
		assert_eq!(value, vec![0, 1, 0, 0, 11]);
	}

	#[test]
	fn flush_clears_dirty_flag() {
		let dir = TempDir::new("flush");
		let pool = BufferPool::open(&dir.0, 2, 1).unwrap();
		let idx = pool.new_partition().unwrap();
		pool.with(idx, |p| p.insert(&full_row(1, 5)).map(|_| ())).unwrap();
		pool.flush().unwrap();
		assert!(pool.with(idx, |p| Ok(!p.is_dirty())).unwrap());
		assert!(dir.0.join(idx.to_string()).exists());
	}
}
