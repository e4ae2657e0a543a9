use crate::{
	pages::{radix_page_slots, MetricPage, PageType, Pgno, RadixSlots},
	store::{apply::radix_slots_for, DbData, DbError, DbTxn, StoreState},
	wal::records::Record,
};

// Digit layout for a radix of page references keyed by a small integer
// position. The most significant digit selects a slot in the root, whose
// capacity differs from interior nodes when the root is embedded in a metric
// descriptor; every digit below is base `node_entries`.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RadixDigits {
	root_entries: usize,
	node_entries: usize,
}

impl RadixDigits {
	pub fn for_radix_root(page_size: usize) -> Self {
		let node_entries = radix_page_slots().capacity(page_size);
		Self {
			root_entries: node_entries,
			node_entries,
		}
	}

	pub fn for_metric_root(page_size: usize) -> Self {
		Self {
			root_entries: MetricPage::slots().capacity(page_size),
			node_entries: radix_page_slots().capacity(page_size),
		}
	}

	// Positions per slot of a node at `height` levels above the leaves.
	pub fn unit(&self, height: u16) -> u64 {
		(self.node_entries as u64).saturating_pow(u32::from(height))
	}

	pub fn capacity(&self, height: u16) -> u64 {
		(self.root_entries as u64).saturating_mul(self.unit(height))
	}

	// Most significant digit first; `height + 1` digits in total.
	pub fn digits(&self, pos: u64, height: u16) -> Vec<usize> {
		debug_assert!(pos < self.capacity(height));
		let mut digits = Vec::with_capacity(usize::from(height) + 1);
		let mut rest = pos;
		for level in (0..=height).rev() {
			let unit = self.unit(level);
			digits.push((rest / unit) as usize);
			rest %= unit;
		}
		digits
	}
}

// Reads pages through the transaction's own writes when one is active, or
// straight from the cache for queries.
pub(crate) trait PageSource {
	fn with_page<T>(&mut self, pgno: Pgno, f: impl FnOnce(&[u8]) -> T) -> Result<T, DbError>;
	fn digits_for(&self, root_type: PageType) -> RadixDigits;
}

pub(crate) struct CacheSource<'a>(pub &'a DbData);

impl PageSource for CacheSource<'_> {
	fn with_page<T>(&mut self, pgno: Pgno, f: impl FnOnce(&[u8]) -> T) -> Result<T, DbError> {
		let guard = self.0.cache().read(pgno)?;
		Ok(f(&guard))
	}

	fn digits_for(&self, root_type: PageType) -> RadixDigits {
		match root_type {
			PageType::Metric => *self.0.rd_metric(),
			_ => *self.0.rd_index(),
		}
	}
}

impl PageSource for DbTxn<'_> {
	fn with_page<T>(&mut self, pgno: Pgno, f: impl FnOnce(&[u8]) -> T) -> Result<T, DbError> {
		DbTxn::with_page(self, pgno, f)
	}

	fn digits_for(&self, root_type: PageType) -> RadixDigits {
		match root_type {
			PageType::Metric => *self.data().rd_metric(),
			_ => *self.data().rd_index(),
		}
	}
}

struct NodeMeta {
	slots: RadixSlots,
	height: u16,
	ptype: PageType,
}

fn node_meta(source: &mut impl PageSource, pgno: Pgno) -> Result<NodeMeta, DbError> {
	let meta = source.with_page(pgno, |page| -> Result<NodeMeta, crate::files::FileError> {
		let slots = radix_slots_for(page)?;
		Ok(NodeMeta {
			slots,
			height: slots.height(page),
			ptype: crate::pages::page_type(page)?,
		})
	})?;
	Ok(meta?)
}

fn entry_at(
	source: &mut impl PageSource,
	pgno: Pgno,
	slots: RadixSlots,
	pos: usize,
) -> Result<Option<Pgno>, DbError> {
	source.with_page(pgno, |page| slots.entry(page, pos))
}

// Walks the tree; None if any slot on the way is empty or the position is
// beyond the tree's current capacity.
pub(crate) fn find(
	source: &mut impl PageSource,
	root: Pgno,
	pos: u64,
) -> Result<Option<Pgno>, DbError> {
	let meta = node_meta(source, root)?;
	let rd = source.digits_for(meta.ptype);
	if pos >= rd.capacity(meta.height) {
		return Ok(None);
	}
	let digits = rd.digits(pos, meta.height);
	let mut cur = root;
	let mut slots = meta.slots;
	for digit in digits {
		let Some(child) = entry_at(source, cur, slots, digit)? else {
			return Ok(None);
		};
		cur = child;
		slots = radix_page_slots();
	}
	Ok(Some(cur))
}

// Sets `pos -> target`, allocating interior nodes as needed and growing the
// tree's height by promoting the root whenever `pos` is beyond its current
// capacity.
pub(crate) fn insert(
	txn: &mut DbTxn<'_>,
	state: &mut StoreState,
	root: Pgno,
	node_id: u32,
	pos: u64,
	target: Pgno,
) -> Result<(), DbError> {
	let meta = node_meta(txn, root)?;
	let rd = txn.digits_for(meta.ptype);
	let mut height = meta.height;
	let root_slots = meta.slots;

	while pos >= rd.capacity(height) {
		// Promote: the root's content moves into a fresh child, and the root
		// gains a level with that child at slot 0.
		let mut list: Vec<Pgno> =
			txn.with_page(root, |page| {
				(0..rd.root_entries)
					.map(|slot| root_slots.entry(page, slot).unwrap_or(0))
					.collect()
			})?;
		while list.last() == Some(&0) {
			list.pop();
		}
		let child = txn.alloc_pgno(state)?;
		txn.wal_and_apply(Record::RadixInitList {
			pgno: child,
			id: node_id,
			height,
			pages: list,
		})?;
		txn.wal_and_apply(Record::RadixPromote {
			pgno: root,
			ref_page: child,
		})?;
		height += 1;
	}

	let digits = rd.digits(pos, height);
	let mut cur = root;
	let mut slots = root_slots;
	for (level, digit) in digits.iter().enumerate() {
		if level == digits.len() - 1 {
			txn.wal_and_apply(Record::RadixUpdate {
				pgno: cur,
				pos: *digit as u16,
				ref_page: target,
			})?;
			break;
		}
		let child = match entry_at(txn, cur, slots, *digit)? {
			Some(child) => child,
			None => {
				let node = txn.alloc_pgno(state)?;
				txn.wal_and_apply(Record::RadixInit {
					pgno: node,
					id: node_id,
					height: height - level as u16 - 1,
				})?;
				txn.wal_and_apply(Record::RadixUpdate {
					pgno: cur,
					pos: *digit as u16,
					ref_page: node,
				})?;
				node
			}
		};
		cur = child;
		slots = radix_page_slots();
	}
	Ok(())
}

// Clears every position in [first, last], freeing the referenced pages and
// any interior node left empty. The root page itself is never freed.
pub(crate) fn erase(
	txn: &mut DbTxn<'_>,
	state: &mut StoreState,
	root: Pgno,
	first: u64,
	last: u64,
) -> Result<(), DbError> {
	if first > last {
		return Ok(());
	}
	erase_node(txn, state, root, first, last)?;
	Ok(())
}

// Frees every page referenced by the tree and leaves the root empty.
pub(crate) fn clear(
	txn: &mut DbTxn<'_>,
	state: &mut StoreState,
	root: Pgno,
) -> Result<(), DbError> {
	let meta = node_meta(txn, root)?;
	let rd = txn.digits_for(meta.ptype);
	let cap = rd.capacity(meta.height);
	erase(txn, state, root, 0, cap - 1)
}

// Returns whether the node is empty after the erase.
fn erase_node(
	txn: &mut DbTxn<'_>,
	state: &mut StoreState,
	pgno: Pgno,
	first: u64,
	last: u64,
) -> Result<bool, DbError> {
	let meta = node_meta(txn, pgno)?;
	let rd = txn.digits_for(meta.ptype);
	let entries = if meta.ptype == PageType::Metric {
		rd.root_entries
	} else {
		rd.node_entries
	};
	let unit = rd.unit(meta.height);
	let slot_first = ((first / unit) as usize).min(entries - 1);
	let slot_last = ((last / unit) as usize).min(entries - 1);

	let mut cleared: Vec<usize> = Vec::new();
	for slot in slot_first..=slot_last {
		let Some(child) = entry_at(txn, pgno, meta.slots, slot)? else {
			continue;
		};
		if meta.height == 0 {
			txn.free_pgno(state, child)?;
			cleared.push(slot);
			continue;
		}
		let base = slot as u64 * unit;
		let sub_first = first.saturating_sub(base);
		let sub_last = (last - base).min(unit - 1);
		if erase_node(txn, state, child, sub_first, sub_last)? {
			txn.free_pgno(state, child)?;
			cleared.push(slot);
		}
	}

	// One erase record per contiguous run of cleared slots.
	let mut run_start: Option<(usize, usize)> = None;
	let mut runs = Vec::new();
	for slot in cleared {
		match run_start {
			Some((start, end)) if end + 1 == slot => run_start = Some((start, slot)),
			Some(run) => {
				runs.push(run);
				run_start = Some((slot, slot));
			}
			None => run_start = Some((slot, slot)),
		}
	}
	if let Some(run) = run_start {
		runs.push(run);
	}
	for (start, end) in runs {
		txn.wal_and_apply(Record::RadixErase {
			pgno,
			first: start as u16,
			last: end as u16,
		})?;
	}

	let empty = txn.with_page(pgno, |page| {
		(0..entries).all(|slot| meta.slots.entry(page, slot).is_none())
	})?;
	Ok(empty)
}

// Lists every `(position, page)` pair in the tree, in position order.
pub(crate) fn walk(data: &DbData, root: Pgno) -> Result<Vec<(u64, Pgno)>, DbError> {
	let mut source = CacheSource(data);
	let mut out = Vec::new();
	walk_node(&mut source, root, 0, &mut out)?;
	Ok(out)
}

fn walk_node(
	source: &mut CacheSource<'_>,
	pgno: Pgno,
	base: u64,
	out: &mut Vec<(u64, Pgno)>,
) -> Result<(), DbError> {
	let meta = node_meta(source, pgno)?;
	let rd = source.digits_for(meta.ptype);
	let entries = if meta.ptype == PageType::Metric {
		rd.root_entries
	} else {
		rd.node_entries
	};
	let unit = rd.unit(meta.height);
	for slot in 0..entries {
		let Some(child) = entry_at(source, pgno, meta.slots, slot)? else {
			continue;
		};
		let pos = base + slot as u64 * unit;
		if meta.height == 0 {
			out.push((pos, child));
		} else {
			walk_node(source, child, pos, out)?;
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use crate::consts::METRIC_INDEX_ROOT_PGNO;
	use crate::store::test_helpers::test_data;

	use super::*;

	#[test]
	fn digit_math() {
		let rd = RadixDigits {
			root_entries: 10,
			node_entries: 16,
		};

		assert_eq!(rd.capacity(0), 10);
		assert_eq!(rd.capacity(1), 160);
		assert_eq!(rd.digits(7, 0), vec![7]);
		assert_eq!(rd.digits(35, 1), vec![2, 3]);
		assert_eq!(rd.digits(9 * 256 + 5 * 16 + 11, 2), vec![9, 5, 11]);
	}

	#[test]
	fn insert_and_find_low_positions() {
		let dir = tempfile::tempdir().unwrap();
		let data = test_data(dir.path());

		let mut state = data.state.write();
		let mut txn = data.begin();
		insert(&mut txn, &mut state, METRIC_INDEX_ROOT_PGNO, 0, 3, 77).unwrap();
		insert(&mut txn, &mut state, METRIC_INDEX_ROOT_PGNO, 0, 9, 78).unwrap();
		txn.commit();
		drop(state);

		let mut source = CacheSource(&data);
		assert_eq!(find(&mut source, METRIC_INDEX_ROOT_PGNO, 3).unwrap(), Some(77));
		assert_eq!(find(&mut source, METRIC_INDEX_ROOT_PGNO, 9).unwrap(), Some(78));
		assert_eq!(find(&mut source, METRIC_INDEX_ROOT_PGNO, 4).unwrap(), None);
	}

	#[test]
	fn insert_beyond_capacity_promotes_root() {
		let dir = tempfile::tempdir().unwrap();
		let data = test_data(dir.path());
		// With 4 KiB pages the root holds 1017 entries at height 0.
		let big_pos = 5000;

		let mut state = data.state.write();
		let mut txn = data.begin();
		insert(&mut txn, &mut state, METRIC_INDEX_ROOT_PGNO, 0, 2, 70).unwrap();
		insert(&mut txn, &mut state, METRIC_INDEX_ROOT_PGNO, 0, big_pos, 71).unwrap();
		txn.commit();
		drop(state);

		let mut source = CacheSource(&data);
		assert_eq!(find(&mut source, METRIC_INDEX_ROOT_PGNO, 2).unwrap(), Some(70));
		assert_eq!(
			find(&mut source, METRIC_INDEX_ROOT_PGNO, big_pos).unwrap(),
			Some(71)
		);
		let walked = walk(&data, METRIC_INDEX_ROOT_PGNO).unwrap();
		assert_eq!(walked, vec![(2, 70), (big_pos, 71)]);
	}

	#[test]
	fn erase_frees_referenced_and_empty_nodes() {
		let dir = tempfile::tempdir().unwrap();
		let data = test_data(dir.path());

		let mut state = data.state.write();
		let mut txn = data.begin();
		// Fake data pages to reference: allocate real ones so freeing is
		// coherent with the bitmap.
		let a = txn.alloc_pgno(&mut state).unwrap();
		let b = txn.alloc_pgno(&mut state).unwrap();
		insert(&mut txn, &mut state, METRIC_INDEX_ROOT_PGNO, 0, 2000, a).unwrap();
		insert(&mut txn, &mut state, METRIC_INDEX_ROOT_PGNO, 0, 2001, b).unwrap();
		let free_before = state.free_pages.len();

		erase(&mut txn, &mut state, METRIC_INDEX_ROOT_PGNO, 2000, 2001).unwrap();
		txn.commit();

		// Both data pages and the now-empty interior node come back.
		assert_eq!(state.free_pages.len(), free_before + 3);
		drop(state);
		let mut source = CacheSource(&data);
		assert_eq!(
			find(&mut source, METRIC_INDEX_ROOT_PGNO, 2000).unwrap(),
			None
		);
	}

	#[test]
	fn clear_empties_the_tree() {
		let dir = tempfile::tempdir().unwrap();
		let data = test_data(dir.path());

		let mut state = data.state.write();
		let mut txn = data.begin();
		let a = txn.alloc_pgno(&mut state).unwrap();
		insert(&mut txn, &mut state, METRIC_INDEX_ROOT_PGNO, 0, 5, a).unwrap();
		clear(&mut txn, &mut state, METRIC_INDEX_ROOT_PGNO).unwrap();
		txn.commit();
		drop(state);

		assert!(walk(&data, METRIC_INDEX_ROOT_PGNO).unwrap().is_empty());
	}
}
