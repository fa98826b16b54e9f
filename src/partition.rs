// Base/tail partition layout: the update-in-place-vs-delta algorithm.
//
// All columns (meta and user) are carried internally as raw `u64`; callers
// above this layer (`Table`) are responsible for reinterpreting user-column
// values as signed `i64` where that matters to a caller.

use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::column_group::ColumnGroup;
use crate::error::{Error, Result};
use crate::options::{
	COL_INDIRECTION, COL_RID, COL_SCHEMA_ENCODING, COL_TIMESTAMP, MARK_1ST_BIT, MAX_RECORDS,
	N_META_COLS,
};
use crate::Rid;

pub struct Partition {
	num_user_cols: usize,
	col_count: usize,
	base: ColumnGroup,
	tail: Vec<ColumnGroup>,
	count_base: usize,
	count_tail: u64,
	dirty: bool,
	updated_slots: BTreeSet<usize>,
}

fn now_secs() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

/// `(tail_group_index, offset_within_group)` for 1-based tid `tid`.
fn tail_position(tid: u64) -> (usize, usize) {
	let zero_based = tid - 1;
	((zero_based / MAX_RECORDS as u64) as usize, (zero_based % MAX_RECORDS as u64) as usize)
}

impl Partition {
	pub fn new(num_user_cols: usize) -> Partition {
		let col_count = num_user_cols + N_META_COLS;
		Partition {
			num_user_cols,
			col_count,
			base: ColumnGroup::new(col_count),
			tail: vec![ColumnGroup::new(col_count)],
			count_base: 0,
			count_tail: 0,
			dirty: true,
			updated_slots: BTreeSet::new(),
		}
	}

	pub fn has_capacity(&self) -> bool {
		self.count_base < MAX_RECORDS
	}

	pub fn count_base(&self) -> usize {
		self.count_base
	}

	pub fn is_dirty(&self) -> bool {
		self.dirty
	}

	pub fn set_clean(&mut self) {
		self.dirty = false;
	}

	/// Writes `row` (full width: meta + user columns) to the next free base
	/// slot. Returns `false` (not an error) when the base is full; `Table`
	/// treats that as the internal `CapacityExceeded` signal and creates a
	/// new partition instead.
	pub fn insert(&mut self, row: &[u64]) -> Result<bool> {
		if row.len() != self.col_count {
			return Err(Error::OutOfRange);
		}
		if !self.has_capacity() {
			return Ok(false);
		}
		let slot = self.count_base;
		let boxed: Vec<Option<u64>> = row.iter().map(|&v| Some(v)).collect();
		self.base.write_row(slot, &boxed)?;
		self.count_base += 1;
		self.dirty = true;
		Ok(true)
	}

	fn schema_bit(&self, encoding: u64, user_col: usize) -> bool {
		(encoding >> (self.num_user_cols - 1 - user_col)) & 1 == 1
	}

	/// Reconstructs the values for the columns selected by `mask` (length
	/// `col_count`, meta + user) at base slot `slot`.
	pub fn read(&self, slot: usize, mask: &[bool]) -> Result<Vec<u64>> {
		if slot >= self.count_base {
			return Err(Error::OutOfRange);
		}
		if mask.len() != self.col_count {
			return Err(Error::OutOfRange);
		}
		let indirection = self.base.read_cell(slot, COL_INDIRECTION)?;
		if indirection == 0 {
			let mut out = Vec::with_capacity(mask.len());
			for (col, &want) in mask.iter().enumerate() {
				if want {
					out.push(self.base.read_cell(slot, col)?);
				}
			}
			return Ok(out);
		}

		let (group, offset) = tail_position(indirection);
		let tail = self.tail.get(group).ok_or(Error::Corruption("dangling indirection".into()))?;
		let encoding = tail.read_cell(offset, COL_SCHEMA_ENCODING)?;

		let mut out = Vec::with_capacity(mask.len());
		for (col, &want) in mask.iter().enumerate() {
			if !want {
				continue;
			}
			if col < N_META_COLS {
				out.push(self.base.read_cell(slot, col)?);
			} else {
				let user_col = col - N_META_COLS;
				if self.schema_bit(encoding, user_col) {
					out.push(tail.read_cell(offset, col)?);
				} else {
					out.push(self.base.read_cell(slot, col)?);
				}
			}
		}
		Ok(out)
	}

	fn grow_tail_if_needed(&mut self) {
		if self.count_tail as usize >= self.tail.len() * MAX_RECORDS {
			self.tail.push(ColumnGroup::new(self.col_count));
		}
	}

	/// Applies a partial update to base slot `slot`, appending a new tail
	/// version. `new_values` has one entry per user column; `None` leaves
	/// that column unchanged.
	pub fn update(&mut self, slot: usize, rid: Rid, new_values: &[Option<u64>]) -> Result<()> {
		if slot >= self.count_base {
			return Err(Error::OutOfRange);
		}
		if new_values.len() != self.num_user_cols {
			return Err(Error::OutOfRange);
		}

		let mut enc: u64 = 0;
		for (j, v) in new_values.iter().enumerate() {
			if v.is_some() {
				enc |= 1 << (self.num_user_cols - 1 - j);
			}
		}

		self.grow_tail_if_needed();
		let old_indirection = self.base.read_cell(slot, COL_INDIRECTION)?;
		let new_tid = self.count_tail + 1;
		let ts = now_secs();

		if old_indirection == 0 {
			// First update for this record: base.enc becomes `enc`, and
			// the tail row's back-pointer marks the base RID with the high
			// bit set.
			let mut base_row = vec![None; self.col_count];
			base_row[COL_INDIRECTION] = Some(new_tid);
			base_row[COL_SCHEMA_ENCODING] = Some(enc);
			self.base.write_row(slot, &base_row)?;

			let (group, offset) = tail_position(new_tid);
			let mut tail_row = vec![None; self.col_count];
			tail_row[COL_INDIRECTION] = Some(rid | MARK_1ST_BIT);
			tail_row[COL_RID] = Some(new_tid);
			tail_row[COL_TIMESTAMP] = Some(ts);
			tail_row[COL_SCHEMA_ENCODING] = Some(enc);
			for (j, v) in new_values.iter().enumerate() {
				tail_row[N_META_COLS + j] = *v;
			}
			self.tail[group].write_row(offset, &tail_row)?;
		} else {
			let old_enc = self.base.read_cell(slot, COL_SCHEMA_ENCODING)?;
			let new_enc = enc | old_enc;

			let mut base_row = vec![None; self.col_count];
			base_row[COL_INDIRECTION] = Some(new_tid);
			base_row[COL_SCHEMA_ENCODING] = Some(new_enc);
			self.base.write_row(slot, &base_row)?;

			let (old_group, old_offset) = tail_position(old_indirection);
			let (new_group, new_offset) = tail_position(new_tid);
			let mut tail_row = vec![None; self.col_count];
			tail_row[COL_INDIRECTION] = Some(old_indirection);
			tail_row[COL_RID] = Some(new_tid);
			tail_row[COL_TIMESTAMP] = Some(ts);
			tail_row[COL_SCHEMA_ENCODING] = Some(new_enc);
			for (j, v) in new_values.iter().enumerate() {
				let value = match v {
					Some(v) => *v,
					// Keep-previous-tail semantics: an untouched column
					// materialises from the previous tail version, never
					// the base, so prior updates are never lost.
					None => self.tail[old_group].read_cell(old_offset, N_META_COLS + j)?,
				};
				tail_row[N_META_COLS + j] = Some(value);
			}
			self.tail[new_group].write_row(new_offset, &tail_row)?;
		}

		self.count_tail += 1;
		self.updated_slots.insert(slot);
		self.dirty = true;
		Ok(())
	}

	/// Logically deletes the record at `slot`: zeroes the Indirection
	/// column and clears the rest of the base row. The slot is not
	/// reclaimed.
	pub fn delete(&mut self, slot: usize) -> Result<()> {
		if slot >= self.count_base {
			return Err(Error::OutOfRange);
		}
		let mut row = vec![Some(0u64); self.col_count];
		row[COL_INDIRECTION] = Some(0);
		for v in row.iter_mut().skip(1) {
			*v = None;
		}
		// RID and the user columns are left as-is by the wire layout
		// (writing `None` skips them), but the record is dead: readers
		// gate liveness on the RID meta column being nonzero, so clear it.
		row[COL_RID] = Some(0);
		row[COL_SCHEMA_ENCODING] = Some(0);
		self.base.write_row(slot, &row)?;
		self.updated_slots.remove(&slot);
		self.dirty = true;
		Ok(())
	}

	pub fn is_live(&self, slot: usize) -> Result<bool> {
		if slot >= self.count_base {
			return Err(Error::OutOfRange);
		}
		Ok(self.base.read_cell(slot, COL_RID)? != 0)
	}

	/// Consolidates every updated slot's latest tail version back into the
	/// base, then discards all tail history.
	pub fn merge(&mut self) -> Result<()> {
		for &slot in &self.updated_slots {
			let indirection = self.base.read_cell(slot, COL_INDIRECTION)?;
			if indirection == 0 {
				continue;
			}
			let (group, offset) = tail_position(indirection);
			let encoding = self.tail[group].read_cell(offset, COL_SCHEMA_ENCODING)?;

			let mut merged = vec![None; self.col_count];
			merged[COL_INDIRECTION] = Some(0);
			merged[COL_SCHEMA_ENCODING] = Some(0);
			for j in 0..self.num_user_cols {
				if self.schema_bit(encoding, j) {
					merged[N_META_COLS + j] = Some(self.tail[group].read_cell(offset, N_META_COLS + j)?);
				}
			}
			self.base.write_row(slot, &merged)?;
		}
		self.updated_slots.clear();
		self.count_tail = 0;
		self.tail = vec![ColumnGroup::new(self.col_count)];
		self.dirty = true;
		Ok(())
	}

	pub fn col_count(&self) -> usize {
		self.col_count
	}

	pub fn count_tail(&self) -> u64 {
		self.count_tail
	}

	pub fn updated_slots(&self) -> &BTreeSet<usize> {
		&self.updated_slots
	}

	pub fn base_group(&self) -> &ColumnGroup {
		&self.base
	}

	pub fn tail_groups(&self) -> &[ColumnGroup] {
		&self.tail
	}

	/// Reassembles a `Partition` from its persisted parts (used by
	/// `BufferPool::load`). Not part of the public storage-core API.
	pub(crate) fn from_parts(
		num_user_cols: usize,
		count_base: usize,
		count_tail: u64,
		updated_slots: BTreeSet<usize>,
		base: ColumnGroup,
		tail: Vec<ColumnGroup>,
	) -> Partition {
		Partition {
			num_user_cols,
			col_count: num_user_cols + N_META_COLS,
			base,
			tail,
			count_base,
			count_tail,
			dirty: false,
			updated_slots,
		}
	}
}
