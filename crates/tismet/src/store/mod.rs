use std::{
	collections::HashMap,
	sync::{
		atomic::{AtomicBool, AtomicU64, Ordering},
		Arc,
	},
};

use log::{error, info};
use parking_lot::RwLock;
use static_assertions::assert_impl_all;
use thiserror::Error;

use crate::{
	cache::{PageCache, PageWriteGuard},
	consts::{MASTER_PGNO, METRIC_INDEX_ROOT_PGNO, SEGMENT_SIZE},
	files::FileError,
	index::NameIndex,
	pages::{
		self, bits_per_page, BitmapPage, MasterPage, MetricPage, Pgno, SampleType, NO_PAGE,
	},
	radix::{self, RadixDigits},
	utils::id_set::IdSet,
	wal::{
		records::{Record, RootTag},
		recovery::ApplyRecord,
		Lsn, Wal,
	},
	MetricId, TimePoint,
};

pub(crate) mod apply;
pub(crate) mod metric;

pub use metric::MetricConfig;

#[derive(Debug, Error)]
pub enum DbError {
	#[error("Invalid metric name '{0}'")]
	InvalidMetricName(String),

	#[error("Unknown metric id {0}")]
	UnknownMetric(u32),

	#[error("The database is out of pages")]
	OutOfPages,

	#[error("The database is in a failed state and refuses further writes")]
	Broken,

	#[error(transparent)]
	File(#[from] FileError),
}

// Per-process performance counters, snapshotted into the stats query.
#[derive(Debug, Default)]
pub(crate) struct DbPerf {
	pub samples_added: AtomicU64,
	pub samples_old: AtomicU64,
	pub samples_dup: AtomicU64,
	pub samples_changed: AtomicU64,
	pub metrics_created: AtomicU64,
	pub metrics_deleted: AtomicU64,
}

impl DbPerf {
	pub fn bump(counter: &AtomicU64) {
		counter.fetch_add(1, Ordering::Relaxed);
	}
}

// In-memory descriptor of one metric, mirroring its descriptor page plus the
// live last-sample position read from the last sample page.
#[derive(Debug, Clone)]
pub(crate) struct MetricState {
	pub info_page: Pgno,
	pub stype: SampleType,
	pub interval: u64,
	pub retention: u64,
	pub creation: TimePoint,
	pub last_page: Pgno,
	// Ring position (sample-page index) of the last page.
	pub last_page_index: u32,
	pub page_first_time: TimePoint,
	pub last_sample: u16,
}

pub(crate) struct StoreState {
	pub free_pages: IdSet,
	// Bitmap sections in use; section i covers page numbers
	// [i * bits_per_page, (i + 1) * bits_per_page).
	pub bitmap_sections: u32,
	pub metrics: HashMap<MetricId, MetricState>,
	pub index: NameIndex,
}

pub(crate) struct DbData {
	cache: Arc<PageCache>,
	wal: Arc<Wal>,
	pub(crate) state: RwLock<StoreState>,
	pub(crate) perf: DbPerf,
	broken: AtomicBool,
	// Digit layouts for the two radix root kinds.
	rd_index: RadixDigits,
	rd_metric: RadixDigits,
}

assert_impl_all!(DbData: Send, Sync);

impl DbData {
	pub fn new(cache: Arc<PageCache>, wal: Arc<Wal>) -> Self {
		let page_size = cache.data().page_size();
		Self {
			rd_index: RadixDigits::for_radix_root(page_size),
			rd_metric: RadixDigits::for_metric_root(page_size),
			cache,
			wal,
			state: RwLock::new(StoreState {
				free_pages: IdSet::new(),
				bitmap_sections: 0,
				metrics: HashMap::new(),
				index: NameIndex::new(),
			}),
			perf: DbPerf::default(),
			broken: AtomicBool::new(false),
		}
	}

	pub fn cache(&self) -> &Arc<PageCache> {
		&self.cache
	}

	pub fn wal(&self) -> &Arc<Wal> {
		&self.wal
	}

	pub fn page_size(&self) -> usize {
		self.cache.data().page_size()
	}

	pub fn rd_index(&self) -> &RadixDigits {
		&self.rd_index
	}

	pub fn rd_metric(&self) -> &RadixDigits {
		&self.rd_metric
	}

	pub fn check_writable(&self) -> Result<(), DbError> {
		if self.broken.load(Ordering::Acquire) {
			return Err(DbError::Broken);
		}
		Ok(())
	}

	pub fn is_broken(&self) -> bool {
		self.broken.load(Ordering::Acquire)
	}

	pub fn mark_broken(&self, why: &str) {
		if !self.broken.swap(true, Ordering::AcqRel) {
			error!("Entering failed state, writes disabled: {why}");
		}
	}

	pub fn begin(&self) -> DbTxn<'_> {
		DbTxn {
			data: self,
			txn_id: self.wal.begin_txn(),
			logged: false,
			committed: false,
			locks: HashMap::new(),
		}
	}

	// A stand-alone one-record transaction, used for single-sample updates.
	pub fn apply_implicit(&self, rec: &Record) -> Result<Lsn, DbError> {
		let pgno = rec.pgno().expect("Implicit records target a page");
		let _apply = self.wal.begin_apply();
		let lsn = self.wal.log_implicit(rec);
		let mut guard = self.cache.edit(pgno, lsn)?;
		if let Err(err) = apply::apply_record(&mut guard, lsn, rec) {
			self.mark_broken(&err.to_string());
			return Err(err.into());
		}
		Ok(lsn)
	}

	/************************************************************************
	 * Fresh database bootstrap
	 ***/

	// Lays out the master page, the metric index root, the bitmap root and
	// the first bitmap section, then flushes so the file is recognizable on
	// reopen.
	pub fn init_fresh(&self) -> Result<(), DbError> {
		let page_size = self.page_size();
		let pages_now = self.cache.data().num_pages();
		let bitmap_root: Pgno = 2;
		let first_bitmap: Pgno = 3;

		let mut state = self.state.write();
		let mut txn = self.begin();
		txn.wal_and_apply(Record::ZeroInit {
			pgno: MASTER_PGNO,
			page_size: page_size as u32,
			segment_size: SEGMENT_SIZE as u32,
		})?;
		txn.wal_and_apply(Record::TagRootUpdate {
			pgno: MASTER_PGNO,
			tag: RootTag::Bitmap,
			root: bitmap_root,
		})?;
		txn.wal_and_apply(Record::RadixInit {
			pgno: METRIC_INDEX_ROOT_PGNO,
			id: 0,
			height: 0,
		})?;
		txn.wal_and_apply(Record::RadixInit {
			pgno: bitmap_root,
			id: 0,
			height: 0,
		})?;
		txn.wal_and_apply(Record::BitInit {
			pgno: first_bitmap,
			pos: 0,
		})?;
		txn.wal_and_apply(Record::RadixUpdate {
			pgno: bitmap_root,
			pos: 0,
			ref_page: first_bitmap,
		})?;
		let covered = bits_per_page(page_size).min(pages_now as usize) as u32;
		txn.wal_and_apply(Record::BitUpdateRange {
			pgno: first_bitmap,
			first: 4,
			last: covered - 1,
			value: true,
		})?;
		let lsn = txn.commit();
		self.wal.wait_durable(lsn);
		self.cache.flush(lsn)?;

		state.free_pages.insert_range(4, covered - 1);
		state.bitmap_sections = 1;
		drop(state);
		info!("Created fresh database: {page_size} byte pages, {pages_now} pages");
		Ok(())
	}

	/************************************************************************
	 * Open-time loading
	 ***/

	// Rebuilds the in-memory mirrors from the recovered pages: the free set
	// from the bitmap and the metric table plus name index from the metric
	// radix.
	pub fn load(&self) -> Result<(), DbError> {
		let mut state = self.state.write();
		self.load_free_pages(&mut state)?;
		self.load_metrics(&mut state)?;
		info!(
			"Loaded {} metrics, {} free pages",
			state.metrics.len(),
			state.free_pages.len()
		);
		Ok(())
	}

	fn load_free_pages(&self, state: &mut StoreState) -> Result<(), DbError> {
		let master = MasterPage::read(&self.cache.read(MASTER_PGNO)?)?;
		if master.bitmap_root == NO_PAGE {
			return Err(FileError::Corrupted("Master page has no bitmap root".into()).into());
		}
		let page_size = self.page_size();
		let bits = bits_per_page(page_size);
		let root = self.cache.read(master.bitmap_root)?;
		let slots = pages::radix_page_slots();
		let mut sections = 0;
		let mut section_pages = Vec::new();
		for pos in 0..slots.capacity(page_size) {
			if let Some(pgno) = slots.entry(&root, pos) {
				section_pages.push((pos, pgno));
				sections = sections.max(pos as u32 + 1);
			}
		}
		drop(root);
		state.free_pages.clear();
		for (section, pgno) in section_pages {
			let page = self.cache.read(pgno)?;
			if pages::page_type(&page)? != pages::PageType::Bitmap {
				return Err(FileError::Corrupted(format!(
					"Bitmap section {section} points at a non-bitmap page"
				))
				.into());
			}
			let base = section * bits;
			for bit in BitmapPage::iter_set_bits(&page, page_size) {
				state.free_pages.insert((base + bit) as u32);
			}
		}
		state.bitmap_sections = sections;
		Ok(())
	}

	fn load_metrics(&self, state: &mut StoreState) -> Result<(), DbError> {
		state.metrics.clear();
		let entries = radix::walk(self, METRIC_INDEX_ROOT_PGNO)?;
		let mut names = Vec::with_capacity(entries.len());
		for (pos, pgno) in entries {
			let id = pos as MetricId;
			let metric = self.load_metric_state(id, pgno)?;
			let page = self.cache.read(pgno)?;
			names.push((id, MetricPage::name(&page).to_string()));
			drop(page);
			state.metrics.insert(id, metric);
		}
		state.index.rebuild(&names);
		Ok(())
	}

	// The descriptor's copy of the last-sample position is only refreshed on
	// page changes; the sample page header is authoritative.
	pub(crate) fn load_metric_state(&self, id: MetricId, pgno: Pgno) -> Result<MetricState, DbError> {
		let page = self.cache.read(pgno)?;
		if pages::page_type(&page)? != pages::PageType::Metric || pages::page_id(&page) != id {
			return Err(FileError::Corrupted(format!(
				"Metric {id} descriptor page {pgno} is not its descriptor"
			))
			.into());
		}
		let repr = MetricPage::view(&page);
		let mut metric = MetricState {
			info_page: pgno,
			stype: SampleType::try_from(repr.sample_type)?,
			interval: repr.interval_secs.max(1),
			retention: repr.retention_secs,
			creation: repr.creation,
			last_page: repr.last_page,
			last_page_index: repr.last_page_pos,
			page_first_time: repr.last_page_first_time,
			last_sample: repr.last_page_sample,
		};
		drop(page);
		if metric.last_page != NO_PAGE {
			let sample_page = self.cache.read(metric.last_page)?;
			let sp = pages::SamplePage::view(&sample_page);
			metric.page_first_time = sp.page_first_time;
			metric.last_sample = sp.last_sample;
		}
		Ok(metric)
	}
}

// Redo-side apply: route each recovered record to its page through the
// cache, skipping records the page already carries.
pub(crate) struct RedoApply<'a> {
	pub data: &'a DbData,
}

impl ApplyRecord for RedoApply<'_> {
	fn apply(&self, lsn: Lsn, rec: &Record) -> Result<(), FileError> {
		let Some(pgno) = rec.pgno() else {
			return Ok(());
		};
		let Some(mut guard) = self.data.cache.edit_if_newer(pgno, lsn)? else {
			return Ok(());
		};
		apply::apply_record(&mut guard, lsn, rec)
	}
}

/****************************************************************************
 * Transactions
 ***/

// A write transaction: every mutation logs a WAL record and applies it to
// the page's cache copy, holding the page guard until commit.
pub(crate) struct DbTxn<'a> {
	data: &'a DbData,
	txn_id: u64,
	logged: bool,
	committed: bool,
	locks: HashMap<Pgno, PageWriteGuard>,
}

impl<'a> DbTxn<'a> {
	pub fn data(&self) -> &'a DbData {
		self.data
	}

	pub fn wal_and_apply(&mut self, rec: Record) -> Result<Lsn, DbError> {
		self.data.check_writable()?;
		let pgno = rec.pgno().expect("Transaction records target a page");
		let _apply = self.data.wal.begin_apply();
		let lsn = self.data.wal.append(self.txn_id, &rec);
		self.logged = true;
		if !self.locks.contains_key(&pgno) {
			let guard = self.data.cache.edit(pgno, lsn)?;
			self.locks.insert(pgno, guard);
		} else {
			self.data.cache.mark_dirty(pgno, lsn);
		}
		let guard = self.locks.get_mut(&pgno).expect("Just inserted");
		if let Err(err) = apply::apply_record(guard, lsn, &rec) {
			self.data.mark_broken(&err.to_string());
			return Err(err.into());
		}
		Ok(lsn)
	}

	// Reads through the transaction's own writes.
	pub fn with_page<T>(
		&mut self,
		pgno: Pgno,
		f: impl FnOnce(&[u8]) -> T,
	) -> Result<T, DbError> {
		if let Some(guard) = self.locks.get(&pgno) {
			return Ok(f(guard));
		}
		let guard = self.data.cache.read(pgno)?;
		Ok(f(&guard))
	}

	pub fn commit(mut self) -> Lsn {
		self.committed = true;
		self.data.wal.commit(self.txn_id)
	}

	/************************************************************************
	 * Page allocation
	 ***/

	// Allocates the lowest free page, growing the file by a segment when the
	// free set runs dry.
	pub fn alloc_pgno(&mut self, state: &mut StoreState) -> Result<Pgno, DbError> {
		loop {
			if let Some(pgno) = state.free_pages.first() {
				state.free_pages.remove(pgno);
				let (bm_page, rel) = self.bitmap_location(state, pgno)?;
				self.wal_and_apply(Record::BitReset {
					pgno: bm_page,
					pos: rel,
				})?;
				return Ok(pgno);
			}
			self.grow(state)?;
		}
	}

	pub fn free_pgno(&mut self, state: &mut StoreState, pgno: Pgno) -> Result<(), DbError> {
		self.wal_and_apply(Record::PageFree { pgno })?;
		let (bm_page, rel) = self.bitmap_location(state, pgno)?;
		self.wal_and_apply(Record::BitSet {
			pgno: bm_page,
			pos: rel,
		})?;
		state.free_pages.insert(pgno);
		self.data.cache.free(pgno);
		Ok(())
	}

	fn bitmap_location(
		&mut self,
		state: &StoreState,
		pgno: Pgno,
	) -> Result<(Pgno, u32), DbError> {
		let page_size = self.data.page_size();
		let bits = bits_per_page(page_size) as u32;
		let section = pgno / bits;
		if section >= state.bitmap_sections {
			return Err(FileError::Corrupted(format!(
				"Page {pgno} is beyond the bitmap coverage"
			))
			.into());
		}
		let master = self.with_page(MASTER_PGNO, MasterPage::read)??;
		let slots = pages::radix_page_slots();
		let bm_page = self
			.with_page(master.bitmap_root, |page| {
				slots.entry(page, section as usize)
			})?
			.ok_or_else(|| {
				FileError::Corrupted(format!("Bitmap section {section} has no page"))
			})?;
		Ok((bm_page, pgno % bits))
	}

	fn grow(&mut self, state: &mut StoreState) -> Result<(), DbError> {
		let data_file = self.data.cache.data();
		let page_size = self.data.page_size();
		let bits = bits_per_page(page_size) as u32;
		let old_cap = data_file.num_pages();
		let new_cap = data_file
			.grow_to_fit(old_cap)?
			.ok_or(DbError::OutOfPages)?;

		let master = self.with_page(MASTER_PGNO, MasterPage::read)??;
		let slots = pages::radix_page_slots();
		let mut first_free = old_cap;
		// New sections are carved out of the pages being added. The bitmap
		// root is a single radix level; it covers more pages than a data
		// file can reach in practice.
		while state.bitmap_sections * bits < new_cap {
			let section = state.bitmap_sections;
			if section as usize >= slots.capacity(page_size) {
				return Err(DbError::OutOfPages);
			}
			let bm_pgno = first_free;
			first_free += 1;
			self.wal_and_apply(Record::BitInit {
				pgno: bm_pgno,
				pos: section,
			})?;
			self.wal_and_apply(Record::RadixUpdate {
				pgno: master.bitmap_root,
				pos: section as u16,
				ref_page: bm_pgno,
			})?;
			state.bitmap_sections += 1;
		}
		// Mark the remaining new pages free, one bitmap section at a time.
		let mut pgno = first_free;
		while pgno < new_cap {
			let section = pgno / bits;
			let last_in_section = ((section + 1) * bits - 1).min(new_cap - 1);
			let (bm_page, rel_first) = self.bitmap_location(state, pgno)?;
			self.wal_and_apply(Record::BitUpdateRange {
				pgno: bm_page,
				first: rel_first,
				last: last_in_section % bits,
				value: true,
			})?;
			pgno = last_in_section + 1;
		}
		state.free_pages.insert_range(first_free, new_cap - 1);
		Ok(())
	}
}

impl Drop for DbTxn<'_> {
	fn drop(&mut self) {
		// There is no undo log; a transaction abandoned after logging
		// records leaves the cache ahead of any commit and the engine can
		// no longer trust its in-memory state.
		if self.logged && !self.committed {
			self.data
				.mark_broken("A write transaction was abandoned before commit");
		}
	}
}

#[cfg(test)]
pub(crate) mod test_helpers {
	use std::sync::Arc;

	use crate::{
		cache::{PageCache, PageCacheConfig},
		consts::DEFAULT_PAGE_SIZE,
		files::{data::DataFile, wal::WalFile},
		tasks::TaskRunner,
		wal::Wal,
	};

	use super::DbData;

	// A fully bootstrapped engine on a temp directory, as `Db::open` with
	// the create flag would build it.
	pub(crate) fn test_data(dir: &std::path::Path) -> Arc<DbData> {
		let data_file = Arc::new(
			DataFile::create(dir.join("metrics.tsd"), DEFAULT_PAGE_SIZE).unwrap(),
		);
		let cache = Arc::new(PageCache::new(data_file, PageCacheConfig::default()));
		let wal_file =
			WalFile::create(dir.join("metrics.tsw"), DEFAULT_PAGE_SIZE, DEFAULT_PAGE_SIZE)
				.unwrap();
		let runner = Arc::new(TaskRunner::new().unwrap());
		let wal = Arc::new(Wal::new(wal_file, runner, Arc::clone(&cache) as _));
		let data = Arc::new(DbData::new(cache, wal));
		data.init_fresh().unwrap();
		data
	}
}
