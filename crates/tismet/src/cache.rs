use std::{
	collections::HashMap,
	ops::{Deref, DerefMut},
	sync::Arc,
	time::{Duration, Instant},
};

use log::debug;
use parking_lot::{
	lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
	Mutex, RawRwLock, RwLock,
};
use static_assertions::assert_impl_all;

use crate::{
	consts::{DEFAULT_PAGE_MAX_AGE, DEFAULT_PAGE_SCAN_INTERVAL},
	files::{
		data::{DataFile, PageView},
		FileError,
	},
	pages::{self, Pgno},
	utils::buf::PageBuf,
	wal::{CheckpointPages, Lsn},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PageCacheConfig {
	pub max_age: Duration,
	pub scan_interval: Duration,
}

impl Default for PageCacheConfig {
	fn default() -> Self {
		Self {
			max_age: DEFAULT_PAGE_MAX_AGE,
			scan_interval: DEFAULT_PAGE_SCAN_INTERVAL,
		}
	}
}

struct SlotMeta {
	dirty: bool,
	// LSN of the first edit since the page was last clean; a flush covering
	// this LSN must write the page even if later edits pushed the page LSN
	// past the flush point.
	first_dirty_lsn: Lsn,
	lsn: Lsn,
	last_access: Instant,
	// Freed pages skip the age check at the next eviction scan.
	evict_now: bool,
}

struct Slot {
	buf: Arc<RwLock<PageBuf>>,
	meta: Mutex<SlotMeta>,
}

// Working copies of recently touched pages. Reads fall through to the file
// view when a page is not resident; edits copy the page in first. Dirty pages
// are written back by `flush` and only clean pages are ever evicted.
pub(crate) struct PageCache {
	data: Arc<DataFile>,
	slots: Mutex<HashMap<Pgno, Arc<Slot>>>,
	config: Mutex<PageCacheConfig>,
}

assert_impl_all!(PageCache: Send, Sync);

pub(crate) enum PageReadGuard {
	Cached(ArcRwLockReadGuard<RawRwLock, PageBuf>),
	View(PageView),
}

impl Deref for PageReadGuard {
	type Target = [u8];

	#[inline]
	fn deref(&self) -> &[u8] {
		match self {
			Self::Cached(guard) => guard,
			Self::View(view) => view,
		}
	}
}

pub(crate) struct PageWriteGuard {
	guard: ArcRwLockWriteGuard<RawRwLock, PageBuf>,
}

impl Deref for PageWriteGuard {
	type Target = [u8];

	#[inline]
	fn deref(&self) -> &[u8] {
		&self.guard
	}
}

impl DerefMut for PageWriteGuard {
	#[inline]
	fn deref_mut(&mut self) -> &mut [u8] {
		&mut self.guard
	}
}

impl PageCache {
	pub fn new(data: Arc<DataFile>, config: PageCacheConfig) -> Self {
		Self {
			data,
			slots: Mutex::new(HashMap::new()),
			config: Mutex::new(config),
		}
	}

	pub fn configure(&self, config: PageCacheConfig) {
		*self.config.lock() = config;
	}

	pub fn config(&self) -> PageCacheConfig {
		self.config.lock().clone()
	}

	pub fn data(&self) -> &Arc<DataFile> {
		&self.data
	}

	// Current content of the page: the cache copy if resident, the file view
	// otherwise.
	pub fn read(&self, pgno: Pgno) -> Result<PageReadGuard, FileError> {
		let slot = {
			let slots = self.slots.lock();
			slots.get(&pgno).cloned()
		};
		if let Some(slot) = slot {
			slot.meta.lock().last_access = Instant::now();
			return Ok(PageReadGuard::Cached(slot.buf.read_arc()));
		}
		let view = self.data.view_page(pgno)?;
		verify_from_view(pgno, &view)?;
		Ok(PageReadGuard::View(view))
	}

	// Mutable working copy; the caller applies one WAL record at `lsn` and
	// holds the guard, exclusive, for the duration of its transaction.
	pub fn edit(&self, pgno: Pgno, lsn: Lsn) -> Result<PageWriteGuard, FileError> {
		let slot = self.slot_for_edit(pgno)?;
		let guard = slot.buf.write_arc();
		let mut meta = slot.meta.lock();
		if !meta.dirty {
			meta.dirty = true;
			meta.first_dirty_lsn = lsn;
		}
		meta.lsn = lsn;
		meta.last_access = Instant::now();
		drop(meta);
		Ok(PageWriteGuard { guard })
	}

	// Redo-time edit: returns None when the page already carries `lsn` or
	// newer, meaning the record was applied before the crash and flushed.
	pub fn edit_if_newer(&self, pgno: Pgno, lsn: Lsn) -> Result<Option<PageWriteGuard>, FileError> {
		let current = match self.read(pgno) {
			Ok(page) => pages::page_lsn(&page),
			// The allocation's file growth never became durable; the edit
			// below regrows and starts from a zeroed page.
			Err(FileError::PageOutOfBounds(..)) => 0,
			Err(err) => return Err(err),
		};
		if current >= lsn {
			return Ok(None);
		}
		Ok(Some(self.edit(pgno, lsn)?))
	}

	// Dirty-set bookkeeping for a page whose guard the caller already holds;
	// a transaction edits each page through one guard but applies many
	// records to it.
	pub fn mark_dirty(&self, pgno: Pgno, lsn: Lsn) {
		let slots = self.slots.lock();
		if let Some(slot) = slots.get(&pgno) {
			let mut meta = slot.meta.lock();
			if !meta.dirty {
				meta.dirty = true;
				meta.first_dirty_lsn = lsn;
			}
			meta.lsn = lsn;
			meta.last_access = Instant::now();
		}
	}

	// Marks a freed page immediately evictable.
	pub fn free(&self, pgno: Pgno) {
		let slots = self.slots.lock();
		if let Some(slot) = slots.get(&pgno) {
			slot.meta.lock().evict_now = true;
		}
	}

	// Writes back every dirty page whose first dirty LSN is at or below
	// `upto_lsn`, then syncs the data file. Returns once the writes are
	// durable.
	pub fn flush(&self, upto_lsn: Lsn) -> Result<(), FileError> {
		let mut targets: Vec<(Pgno, Arc<Slot>)> = {
			let slots = self.slots.lock();
			slots
				.iter()
				.filter(|(_, slot)| {
					let meta = slot.meta.lock();
					meta.dirty && meta.first_dirty_lsn <= upto_lsn
				})
				.map(|(pgno, slot)| (*pgno, Arc::clone(slot)))
				.collect()
		};
		if targets.is_empty() {
			return Ok(());
		}
		targets.sort_by_key(|(pgno, _)| *pgno);
		let count = targets.len();
		for (pgno, slot) in targets {
			let mut buf = slot.buf.write_arc();
			self.data.grow_to_fit(pgno)?;
			pages::stamp_page_checksum(&mut buf);
			self.data.write_page(pgno, &buf)?;
			slot.meta.lock().dirty = false;
		}
		self.data.sync()?;
		debug!("Flushed {count} pages upto lsn {upto_lsn}");
		Ok(())
	}

	// Background scan: evicts clean pages untouched for longer than the
	// configured max age, skipping any page currently held.
	pub fn evict_scan(&self) {
		let max_age = self.config.lock().max_age;
		debug!(
			"Page scan: {} resident, {} dirty",
			self.resident_pages(),
			self.dirty_pages()
		);
		let now = Instant::now();
		let mut slots = self.slots.lock();
		slots.retain(|_, slot| {
			let Some(meta) = slot.meta.try_lock() else {
				return true;
			};
			if meta.dirty {
				return true;
			}
			if !meta.evict_now && now.duration_since(meta.last_access) < max_age {
				return true;
			}
			// A held page is in use no matter what its age says.
			slot.buf.try_write().is_none()
		});
	}

	pub fn resident_pages(&self) -> usize {
		self.slots.lock().len()
	}

	pub fn dirty_pages(&self) -> usize {
		let slots = self.slots.lock();
		slots
			.values()
			.filter(|slot| slot.meta.lock().dirty)
			.count()
	}

	fn slot_for_edit(&self, pgno: Pgno) -> Result<Arc<Slot>, FileError> {
		{
			let slots = self.slots.lock();
			if let Some(slot) = slots.get(&pgno) {
				return Ok(Arc::clone(slot));
			}
		}
		// Copy-on-first-edit. The copy comes from the view when the page
		// exists on disk; pages past the end of the file (allocation racing
		// a lost set_len) start zeroed.
		let buf = match self.data.view_page(pgno) {
			Ok(view) => {
				verify_from_view(pgno, &view)?;
				PageBuf::from_slice(&view)
			}
			Err(FileError::PageOutOfBounds(..)) => {
				self.data.grow_to_fit(pgno)?;
				PageBuf::new_zeroed(self.data.page_size())
			}
			Err(err) => return Err(err),
		};
		let slot = Arc::new(Slot {
			buf: Arc::new(RwLock::new(buf)),
			meta: Mutex::new(SlotMeta {
				dirty: false,
				first_dirty_lsn: 0,
				lsn: 0,
				last_access: Instant::now(),
				evict_now: false,
			}),
		});
		let mut slots = self.slots.lock();
		Ok(Arc::clone(slots.entry(pgno).or_insert(slot)))
	}
}

// An all-zero page has never been written; anything else must carry a valid
// type tag and checksum.
fn verify_from_view(pgno: Pgno, page: &[u8]) -> Result<(), FileError> {
	if page[0] == 0 {
		return Ok(());
	}
	pages::page_type(page)?;
	if !pages::verify_page_checksum(page) {
		log::error!("Checksum mismatch on page {pgno}");
		return Err(FileError::ChecksumMismatch);
	}
	Ok(())
}

impl CheckpointPages for PageCache {
	fn flush_upto(&self, lsn: Lsn) -> Result<(), FileError> {
		self.flush(lsn)
	}
}
