// Per-column ordered secondary index: integer-keyed insert/delete plus an
// in-order range lookup with an exclusive upper bound, backed by
// `BTreeMap`, the idiomatic in-process ordered map.

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::Rid;

pub struct Index {
	num_columns: usize,
	maps: Vec<Option<BTreeMap<i64, Vec<Rid>>>>,
	counts: Vec<usize>,
	to_be_indexed: Vec<usize>,
}

impl Index {
	pub fn new(num_columns: usize, key_column: usize) -> Index {
		let mut index = Index {
			num_columns,
			maps: (0..num_columns).map(|_| None).collect(),
			counts: vec![0; num_columns],
			to_be_indexed: Vec::new(),
		};
		index.create_index(key_column);
		index
	}

	pub fn is_indexed(&self, column: usize) -> bool {
		self.maps[column].is_some()
	}

	pub fn create_index(&mut self, column: usize) {
		if self.maps[column].is_none() {
			self.maps[column] = Some(BTreeMap::new());
			if self.counts.iter().any(|&c| c != 0) && !self.to_be_indexed.contains(&column) {
				log::debug!(target: "lstore", "queuing column {} for backfill", column);
				self.to_be_indexed.push(column);
			}
		}
	}

	pub fn drop_index(&mut self, column: usize) {
		self.maps[column] = None;
		self.to_be_indexed.retain(|&c| c != column);
	}

	pub fn insert(&mut self, column: usize, value: i64, rid: Rid) -> Result<()> {
		match self.maps[column].as_mut() {
			Some(map) => {
				self.counts[column] += 1;
				map.entry(value).or_insert_with(Vec::new).push(rid);
				Ok(())
			}
			None => Err(Error::NotIndexed),
		}
	}

	pub fn delete(&mut self, column: usize, value: i64, rid: Rid) {
		if let Some(map) = self.maps[column].as_mut() {
			if let Some(rids) = map.get_mut(&value) {
				if let Some(pos) = rids.iter().position(|&r| r == rid) {
					rids.remove(pos);
				}
				if rids.is_empty() {
					map.remove(&value);
				}
			}
		}
	}

	pub fn update(&mut self, column: usize, old_value: i64, new_value: i64, rid: Rid) -> Result<()> {
		self.delete(column, old_value, rid);
		self.insert(column, new_value, rid)
	}

	pub fn locate(&self, column: usize, value: i64) -> Vec<Rid> {
		self.maps[column].as_ref().and_then(|m| m.get(&value)).cloned().unwrap_or_default()
	}

	/// `lo` inclusive, `hi` exclusive, ascending order.
	pub fn locate_range(&self, column: usize, lo: i64, hi: i64) -> Vec<Rid> {
		match self.maps[column].as_ref() {
			Some(map) => map.range(lo..hi).flat_map(|(_, rids)| rids.iter().copied()).collect(),
			None => Vec::new(),
		}
	}

	pub fn num_columns(&self) -> usize {
		self.num_columns
	}

	pub fn pending_backfill(&self) -> &[usize] {
		&self.to_be_indexed
	}

	/// Backfills every queued column from `rows`, an iterator over
	/// `(rid, values)` where `values` has one entry per user column.
	/// Mirrors `Index.__index_from_db`'s read-then-insert pass. Only rids
	/// with `is_live(rid) == true` should be passed in by the caller.
	pub fn backfill<I: Iterator<Item = (Rid, Vec<i64>)>>(&mut self, rows: I) {
		if self.to_be_indexed.is_empty() {
			return;
		}
		self.to_be_indexed.sort_unstable();
		let columns = std::mem::take(&mut self.to_be_indexed);
		for (rid, values) in rows {
			for &column in &columns {
				let value = values[column];
				self.counts[column] += 1;
				self.maps[column].as_mut().unwrap().entry(value).or_insert_with(Vec::new).push(rid);
			}
		}
	}

	pub fn counts(&self) -> &[usize] {
		&self.counts
	}

	/// Flat binary encoding used by `Table::close` to persist the index
	/// alongside a table's partitions: one flag byte per column, then for
	/// indexed columns a count-prefixed list of `(value, rid_count, rids)`.
	pub fn to_bytes(&self) -> Vec<u8> {
		let mut buf = Vec::new();
		buf.extend_from_slice(&(self.num_columns as u64).to_le_bytes());
		for map in &self.maps {
			match map {
				Some(m) => {
					buf.push(1);
					buf.extend_from_slice(&(m.len() as u64).to_le_bytes());
					for (&value, rids) in m {
						buf.extend_from_slice(&value.to_le_bytes());
						buf.extend_from_slice(&(rids.len() as u64).to_le_bytes());
						for &rid in rids {
							buf.extend_from_slice(&rid.to_le_bytes());
						}
					}
				}
				None => buf.push(0),
			}
		}
		buf
	}

	pub fn from_bytes(bytes: &[u8], num_columns: usize) -> Result<Index> {
		let mut cursor = 0usize;
		let persisted_columns = read_u64(bytes, &mut cursor)? as usize;
		if persisted_columns != num_columns {
			return Err(Error::Corruption("index column count mismatch".into()));
		}
		let mut maps = Vec::with_capacity(num_columns);
		let mut counts = vec![0usize; num_columns];
		for counts_slot in counts.iter_mut() {
			if cursor >= bytes.len() {
				return Err(Error::Corruption("truncated index file".into()));
			}
			let flag = bytes[cursor];
			cursor += 1;
			if flag == 0 {
				maps.push(None);
				continue;
			}
			let entry_count = read_u64(bytes, &mut cursor)?;
			let mut map = BTreeMap::new();
			let mut total = 0usize;
			for _ in 0..entry_count {
				let value = read_i64(bytes, &mut cursor)?;
				let rid_count = read_u64(bytes, &mut cursor)?;
				let mut rids = Vec::with_capacity(rid_count as usize);
				for _ in 0..rid_count {
					rids.push(read_u64(bytes, &mut cursor)?);
				}
				total += rids.len();
				map.insert(value, rids);
			}
			*counts_slot = total;
			maps.push(Some(map));
		}
		Ok(Index { num_columns, maps, counts, to_be_indexed: Vec::new() })
	}
}

fn read_u64(bytes: &[u8], cursor: &mut usize) -> Result<u64> {
	if *cursor + 8 > bytes.len() {
		return Err(Error::Corruption("truncated index file".into()));
	}
	let v = u64::from_le_bytes(bytes[*cursor..*cursor + 8].try_into().unwrap());
	*cursor += 8;
	Ok(v)
}

fn read_i64(bytes: &[u8], cursor: &mut usize) -> Result<i64> {
	read_u64(bytes, cursor).map(|v| v as i64)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn key_column_indexed_on_construction() {
		let index = Index::new(3, 0);
		assert!(index.is_indexed(0));
		assert!(!index.is_indexed(1));
	}

	#[test]
	fn insert_locate_delete() {
		let mut index = Index::new(1, 0);
		index.insert(0, 100, 1).unwrap();
		index.insert(0, 100, 2).unwrap();
		assert_eq!(index.locate(0, 100), vec![1, 2]);
		index.delete(0, 100, 1);
		assert_eq!(index.locate(0, 100), vec![2]);
	}

	#[test]
	fn locate_range_half_open() {
		let mut index = Index::new(1, 0);
		for (v, rid) in [(10, 1), (20, 2), (30, 3)] {
			index.insert(0, v, rid).unwrap();
		}
		assert_eq!(index.locate_range(0, 10, 30), vec![1, 2]);
		assert_eq!(index.locate_range(0, 10, 31), vec![1, 2, 3]);
	}

	#[test]
	fn not_indexed_errors() {
		let mut index = Index::new(2, 0);
		assert!(matches!(index.insert(1, 1, 1), Err(Error::NotIndexed)));
	}

	#[test]
	fn create_index_queues_backfill_when_data_exists() {
		let mut index = Index::new(2, 0);
		index.insert(0, 1, 1).unwrap();
		index.create_index(1);
		assert_eq!(index.pending_backfill(), &[1]);
		index.backfill(vec![(1, vec![1, 99])].into_iter());
		assert!(index.pending_backfill().is_empty());
		assert_eq!(index.locate(1, 99), vec![1]);
	}

	#[test]
	fn to_bytes_from_bytes_round_trip() {
		let mut index = Index::new(3, 0);
		index.insert(0, 10, 1).unwrap();
		index.insert(0, 10, 2).unwrap();
		index.create_index(2);
		index.insert(2, -5, 1).unwrap();
		let bytes = index.to_bytes();
		let restored = Index::from_bytes(&bytes, 3).unwrap();
		assert!(restored.is_indexed(0));
		assert!(!restored.is_indexed(1));
		assert!(restored.is_indexed(2));
		assert_eq!(restored.locate(0, 10), vec![1, 2]);
		assert_eq!(restored.locate(2, -5), vec![1]);
	}
}
