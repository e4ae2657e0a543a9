use std::{
	cmp::Reverse,
	collections::{BinaryHeap, VecDeque},
	sync::Arc,
	time::Duration,
};

use log::debug;
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock, RwLockReadGuard};
use static_assertions::assert_impl_all;

use crate::{
	consts::{
		DEFAULT_MAX_CHECKPOINT_DATA, DEFAULT_MAX_CHECKPOINT_INTERVAL, LSN_MASK, MAX_LOCAL_TXNS,
		NUM_WAL_BUFFERS,
	},
	files::{
		wal::{
			stamp_page_checksum, WalFile, WalPageHeader, WalPageHeaderRepr, WalPageType,
			WAL_PAGE_HDR_SIZE,
		},
		FileError,
	},
	pages::Pgno,
	repr::PageRepr as _,
	tasks::TaskRunner,
	utils::{buf::PageBuf, id_set::IdSet},
};

pub(crate) mod records;
pub(crate) mod recovery;

use records::Record;

pub(crate) type Lsn = u64;

#[inline]
pub(crate) fn txn_lsn(txn_id: u64) -> Lsn {
	txn_id & LSN_MASK
}

#[inline]
pub(crate) fn txn_local(txn_id: u64) -> u16 {
	(txn_id >> 48) as u16
}

#[inline]
pub(crate) fn make_txn_id(lsn: Lsn, local_txn: u16) -> u64 {
	lsn | (u64::from(local_txn) << 48)
}

// Pages the WAL needs flushed ahead of a checkpoint; implemented by the page
// cache.
#[cfg_attr(test, mockall::automock)]
pub(crate) trait CheckpointPages: Send + Sync {
	fn flush_upto(&self, lsn: Lsn) -> Result<(), FileError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WalConfig {
	pub max_checkpoint_data: usize,
	pub max_checkpoint_interval: Duration,
}

impl Default for WalConfig {
	fn default() -> Self {
		Self {
			max_checkpoint_data: DEFAULT_MAX_CHECKPOINT_DATA,
			max_checkpoint_interval: DEFAULT_MAX_CHECKPOINT_INTERVAL,
		}
	}
}

// Only the current buffer can be in one of the partial states; buffers the
// write position has moved past are either full and in flight or empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
	Empty,
	PartialDirty,
	PartialWriting,
	PartialClean,
	FullWriting,
}

struct Buffer {
	buf: PageBuf,
	state: BufferState,
	pgno: Pgno,
	first_lsn: Lsn,
	num_recs: u16,
	first_pos: u16,
	// Content changed while a snapshot write was in flight.
	rewrite_needed: bool,
	// The page filled while a partial write was in flight; retire on
	// completion.
	full: bool,
}

impl Buffer {
	fn new(page_size: usize) -> Self {
		Self {
			buf: PageBuf::new_zeroed(page_size),
			state: BufferState::Empty,
			pgno: 0,
			first_lsn: 0,
			num_recs: 0,
			first_pos: 0,
			rewrite_needed: false,
			full: false,
		}
	}

	fn header(&self, last_pos: u16) -> WalPageHeader {
		WalPageHeader {
			ptype: WalPageType::Log,
			num_recs: self.num_recs,
			pgno: self.pgno,
			checksum: 0,
			first_pos: self.first_pos,
			last_pos,
			first_lsn: self.first_lsn,
		}
	}
}

// Accounting for one live page of the WAL file, kept in LSN order.
struct WalPageInfo {
	pgno: Pgno,
	// First and last record (by LSN) with any bytes on this page.
	min_lsn: Lsn,
	last_lsn: Lsn,
	// Highest record LSN covered by a completed write of this page.
	durable_snap_lsn: Lsn,
	retired: bool,
}

struct WalState {
	last_lsn: Lsn,
	durable_lsn: Lsn,
	local_txns: IdSet,
	free_pages: IdSet,
	num_pages: u32,
	pages: VecDeque<WalPageInfo>,
	bufs: Vec<Buffer>,
	cur_buf: usize,
	buf_pos: usize,
	checkpoint_data: usize,
	lsn_tasks: BinaryHeap<Reverse<LsnTask>>,
}

struct LsnTask {
	wait_lsn: Lsn,
	task: Box<dyn FnOnce() + Send>,
}

impl PartialEq for LsnTask {
	fn eq(&self, other: &Self) -> bool {
		self.wait_lsn == other.wait_lsn
	}
}
impl Eq for LsnTask {}
impl PartialOrd for LsnTask {
	fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
		Some(self.cmp(other))
	}
}
impl Ord for LsnTask {
	fn cmp(&self, other: &Self) -> std::cmp::Ordering {
		self.wait_lsn.cmp(&other.wait_lsn)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CheckpointPhase {
	Idle,
	Flushing,
	WaitingDurable,
}

struct CheckpointState {
	phase: CheckpointPhase,
	// A background checkpoint is queued but has not started; stops the
	// bytes trigger from queueing one per record.
	pending: bool,
	// Backup holds block the next checkpoint from starting.
	blockers: usize,
	waiting: Vec<Box<dyn FnOnce() + Send>>,
	start_lsn: Lsn,
}

pub(crate) struct Wal {
	file: WalFile,
	runner: Arc<TaskRunner>,
	pages_notify: Arc<dyn CheckpointPages>,
	// Serializes record appends so a buffer rotation wait cannot interleave
	// two half-written records.
	log_lock: Mutex<()>,
	// Held (shared) across each log-record-then-apply-to-cache pair; a
	// checkpoint drains it before scanning the dirty set, so no record below
	// its start LSN can still be on the way to a page.
	apply_barrier: RwLock<()>,
	state: Mutex<WalState>,
	buf_avail: Condvar,
	durable_cv: Condvar,
	checkpoint: Mutex<CheckpointState>,
	config: Mutex<WalConfig>,
}

assert_impl_all!(Wal: Send, Sync);

impl Wal {
	pub fn new(
		file: WalFile,
		runner: Arc<TaskRunner>,
		pages_notify: Arc<dyn CheckpointPages>,
	) -> Self {
		let page_size = file.page_size();
		let state = WalState {
			last_lsn: 0,
			durable_lsn: 0,
			local_txns: IdSet::new(),
			free_pages: IdSet::new(),
			num_pages: 1,
			pages: VecDeque::new(),
			bufs: (0..NUM_WAL_BUFFERS)
				.map(|_| Buffer::new(page_size))
				.collect(),
			cur_buf: 0,
			buf_pos: 0,
			checkpoint_data: 0,
			lsn_tasks: BinaryHeap::new(),
		};
		Self {
			file,
			runner,
			pages_notify,
			log_lock: Mutex::new(()),
			apply_barrier: RwLock::new(()),
			state: Mutex::new(state),
			buf_avail: Condvar::new(),
			durable_cv: Condvar::new(),
			checkpoint: Mutex::new(CheckpointState {
				phase: CheckpointPhase::Idle,
				pending: false,
				blockers: 0,
				waiting: Vec::new(),
				start_lsn: 0,
			}),
			config: Mutex::new(WalConfig::default()),
		}
	}

	pub fn file(&self) -> &WalFile {
		&self.file
	}

	pub fn configure(&self, conf: &WalConfig) {
		*self.config.lock() = conf.clone();
	}

	pub fn config(&self) -> WalConfig {
		self.config.lock().clone()
	}

	pub fn last_lsn(&self) -> Lsn {
		self.state.lock().last_lsn
	}

	pub fn durable_lsn(&self) -> Lsn {
		self.state.lock().durable_lsn
	}

	pub fn checkpoint_lsn(&self) -> Lsn {
		self.checkpoint.lock().start_lsn
	}

	pub fn begin_apply(&self) -> RwLockReadGuard<'_, ()> {
		self.apply_barrier.read()
	}

	// Installs the recovered tail position: records resume after `last_lsn`
	// on a fresh page, and everything recovered counts as durable.
	pub(super) fn install_recovered_state(
		&self,
		last_lsn: Lsn,
		pages: VecDeque<WalPageInfo>,
		free_pages: IdSet,
		num_pages: u32,
	) {
		let mut state = self.state.lock();
		state.last_lsn = last_lsn;
		state.durable_lsn = last_lsn;
		state.pages = pages;
		state.free_pages = free_pages;
		state.num_pages = num_pages;
	}

	/************************************************************************
	 * Transactions
	 ***/

	// Returns a transaction id combining the begin LSN with a 16-bit local
	// txn nonce unique among concurrently active transactions.
	pub fn begin_txn(self: &Arc<Self>) -> u64 {
		let local_txn = {
			let mut state = self.state.lock();
			let local_txn = state.local_txns.first_unused(1);
			assert!(local_txn <= u32::from(MAX_LOCAL_TXNS));
			state.local_txns.insert(local_txn);
			local_txn as u16
		};
		let lsn = self.log(&Record::TxnBegin, local_txn);
		make_txn_id(lsn, local_txn)
	}

	pub fn append(self: &Arc<Self>, txn_id: u64, rec: &Record) -> Lsn {
		debug_assert!(rec.pgno().is_some());
		self.log(rec, txn_local(txn_id))
	}

	// Logs the commit record and releases the local txn nonce. The returned
	// LSN can be awaited for durability.
	pub fn commit(self: &Arc<Self>, txn_id: u64) -> Lsn {
		debug_assert!(txn_lsn(txn_id) <= self.last_lsn());
		let local_txn = txn_local(txn_id);
		let lsn = self.log(&Record::TxnCommit, local_txn);
		self.state.lock().local_txns.remove(u32::from(local_txn));
		lsn
	}

	// A single self-contained record forming an implicit transaction.
	pub fn log_implicit(self: &Arc<Self>, rec: &Record) -> Lsn {
		debug_assert!(rec.is_implicit_txn());
		self.log(rec, 0)
	}

	pub fn wait_durable(self: &Arc<Self>, lsn: Lsn) {
		self.flush_buffers();
		let mut state = self.state.lock();
		while state.durable_lsn < lsn {
			self.durable_cv.wait(&mut state);
		}
	}

	// Runs `task` once `wait_lsn` is durable; immediately if it already is.
	pub fn queue_task(&self, wait_lsn: Lsn, task: impl FnOnce() + Send + 'static) {
		let mut state = self.state.lock();
		if state.durable_lsn >= wait_lsn {
			drop(state);
			self.runner.run(task);
			return;
		}
		state.lsn_tasks.push(Reverse(LsnTask {
			wait_lsn,
			task: Box::new(task),
		}));
	}

	/************************************************************************
	 * Record writing
	 ***/

	fn log(self: &Arc<Self>, rec: &Record, local_txn: u16) -> Lsn {
		let _log_guard = self.log_lock.lock();
		let bytes = rec.encoded(local_txn);
		let max_checkpoint_data = self.config.lock().max_checkpoint_data;
		let page_size = self.file.page_size();

		let mut state = self.state.lock();
		let lsn = state.last_lsn + 1;
		state.last_lsn = lsn;
		state.checkpoint_data += bytes.len();
		let over_checkpoint_limit = state.checkpoint_data >= max_checkpoint_data;

		let mut off = 0;
		while off < bytes.len() {
			self.ensure_open_buffer(&mut state, lsn);
			let cur = state.cur_buf;
			let pos = state.buf_pos;
			let take = (page_size - pos).min(bytes.len() - off);
			state.bufs[cur].buf[pos..pos + take].copy_from_slice(&bytes[off..off + take]);
			state.buf_pos = pos + take;

			if off == 0 {
				// The record starts on this page. first_lsn was fixed when
				// the page opened (it may belong to a record straddling in);
				// first_pos marks the first record that starts here.
				let buf = &mut state.bufs[cur];
				if buf.num_recs == 0 {
					buf.first_pos = pos as u16;
				}
				buf.num_recs += 1;
			}
			let info = state
				.pages
				.back_mut()
				.expect("An open buffer always has a page info entry");
			info.last_lsn = lsn;

			off += take;
			if state.buf_pos == page_size {
				self.rotate_buffer(&mut state);
			}
		}
		drop(state);

		if over_checkpoint_limit {
			self.checkpoint_if_idle();
		}
		lsn
	}

	// Opens a fresh WAL page in the current buffer if it has none, and marks
	// a clean partial buffer dirty again when more records arrive.
	fn ensure_open_buffer(self: &Arc<Self>, state: &mut WalState, lsn: Lsn) {
		let cur = state.cur_buf;
		match state.bufs[cur].state {
			BufferState::PartialClean => {
				state.bufs[cur].state = BufferState::PartialDirty;
				return;
			}
			BufferState::Empty => (),
			_ => return,
		}
		let pgno = match state.free_pages.pop_first() {
			Some(pgno) => pgno,
			None => {
				let pgno = state.num_pages;
				state.num_pages += 1;
				pgno
			}
		};
		let buf = &mut state.bufs[cur];
		buf.state = BufferState::PartialDirty;
		buf.pgno = pgno;
		// The record being written when the page opens is the first record
		// with bytes on it; first_pos stays 0 until a record *starts* here.
		buf.first_lsn = lsn;
		buf.num_recs = 0;
		buf.first_pos = 0;
		buf.rewrite_needed = false;
		buf.full = false;
		buf.buf.fill(0);
		state.buf_pos = WAL_PAGE_HDR_SIZE;
		state.pages.push_back(WalPageInfo {
			pgno,
			min_lsn: lsn,
			last_lsn: lsn,
			durable_snap_lsn: 0,
			retired: false,
		});
	}

	// The current buffer's page is full: submit its final write and advance
	// to the next buffer, waiting for one to come free if all are in flight.
	fn rotate_buffer(self: &Arc<Self>, state: &mut MutexGuard<'_, WalState>) {
		let cur = state.cur_buf;
		match state.bufs[cur].state {
			BufferState::PartialDirty | BufferState::PartialClean => {
				self.submit_full(state, cur);
			}
			BufferState::PartialWriting => {
				let buf = &mut state.bufs[cur];
				buf.rewrite_needed = true;
				buf.full = true;
			}
			BufferState::Empty | BufferState::FullWriting => {
				unreachable!("The current buffer holds an open page")
			}
		}
		let next = (cur + 1) % state.bufs.len();
		state.cur_buf = next;
		state.buf_pos = 0;
		while state.bufs[state.cur_buf].state != BufferState::Empty {
			self.buf_avail.wait_for(state, Duration::from_secs(1));
		}
	}

	fn submit_full(self: &Arc<Self>, state: &mut WalState, index: usize) {
		let snap_lsn = state.last_lsn;
		let page_size = self.file.page_size();
		let buf = &mut state.bufs[index];
		buf.state = BufferState::FullWriting;
		buf.full = true;
		let header = buf.header(page_size as u16);
		let mut snap = buf.buf.clone();
		WalPageHeaderRepr::stamp(header, &mut snap);
		stamp_page_checksum(&mut snap);
		self.submit_write(buf.pgno, snap, snap_lsn);
	}

	// Writes the current partial buffer if it has unwritten records. Called
	// by the idle flush timer and ahead of durability waits.
	pub fn flush_buffers(self: &Arc<Self>) {
		let mut state = self.state.lock();
		let cur = state.cur_buf;
		if state.bufs[cur].state != BufferState::PartialDirty {
			return;
		}
		let snap_lsn = state.last_lsn;
		let last_pos = state.buf_pos as u16;
		let buf = &mut state.bufs[cur];
		buf.state = BufferState::PartialWriting;
		buf.rewrite_needed = false;
		let header = buf.header(last_pos);
		let mut snap = buf.buf.clone();
		WalPageHeaderRepr::stamp(header, &mut snap);
		stamp_page_checksum(&mut snap);
		self.submit_write(buf.pgno, snap, snap_lsn);
	}

	// Submits one page write to the runner; the completion callback advances
	// buffer states and the durable LSN.
	fn submit_write(self: &Arc<Self>, pgno: Pgno, snap: PageBuf, snap_lsn: Lsn) {
		let wal = Arc::clone(self);
		self.runner.run(move || {
			let result = wal
				.file
				.write_page(pgno, &snap)
				.and_then(|()| wal.file.sync());
			match result {
				Ok(()) => wal.on_file_write(pgno, snap_lsn),
				Err(err) => {
					// A failed WAL write leaves durability stuck; that is
					// preferable to claiming durability falsely.
					log::error!("WAL write of page {pgno} failed: {err}");
				}
			}
		});
	}

	fn on_file_write(self: &Arc<Self>, pgno: Pgno, snap_lsn: Lsn) {
		let mut state = self.state.lock();
		if let Some(info) = state.pages.iter_mut().find(|p| p.pgno == pgno) {
			info.durable_snap_lsn = info.durable_snap_lsn.max(snap_lsn);
		}
		if let Some(index) = (0..state.bufs.len()).find(|i| {
			state.bufs[*i].pgno == pgno && state.bufs[*i].state != BufferState::Empty
		}) {
			match state.bufs[index].state {
				BufferState::FullWriting => {
					if let Some(info) = state.pages.iter_mut().find(|p| p.pgno == pgno) {
						info.retired = true;
					}
					let buf = &mut state.bufs[index];
					buf.state = BufferState::Empty;
					buf.pgno = 0;
					self.buf_avail.notify_all();
				}
				BufferState::PartialWriting => {
					let full = state.bufs[index].full;
					let rewrite = state.bufs[index].rewrite_needed;
					if full {
						self.submit_full(&mut state, index);
					} else if rewrite {
						// Keep durability waits moving: resnapshot at once.
						let snap_lsn = state.last_lsn;
						let last_pos = if state.cur_buf == index {
							state.buf_pos as u16
						} else {
							self.file.page_size() as u16
						};
						let buf = &mut state.bufs[index];
						buf.rewrite_needed = false;
						let header = buf.header(last_pos);
						let mut snap = buf.buf.clone();
						WalPageHeaderRepr::stamp(header, &mut snap);
						stamp_page_checksum(&mut snap);
						self.submit_write(buf.pgno, snap, snap_lsn);
					} else {
						state.bufs[index].state = BufferState::PartialClean;
					}
				}
				_ => (),
			}
		}
		self.advance_durable(&mut state);
	}

	fn advance_durable(&self, state: &mut WalState) {
		let mut durable = state.last_lsn;
		for info in &state.pages {
			if info.retired && info.durable_snap_lsn >= info.last_lsn {
				continue;
			}
			let covering = info.durable_snap_lsn.max(info.min_lsn.saturating_sub(1));
			durable = durable.min(covering);
		}
		if durable <= state.durable_lsn {
			return;
		}
		state.durable_lsn = durable;
		self.durable_cv.notify_all();
		let mut ready = Vec::new();
		loop {
			let hit = matches!(state.lsn_tasks.peek(), Some(Reverse(t)) if t.wait_lsn <= durable);
			if !hit {
				break;
			}
			let Reverse(task) = state.lsn_tasks.pop().unwrap();
			ready.push(task.task);
		}
		for task in ready {
			self.runner.run(task);
		}
	}

	/************************************************************************
	 * Checkpoints
	 ***/

	// Backups install a blocker to hold checkpoints off; `ready` runs once
	// no checkpoint is in progress.
	pub fn block_checkpoint(&self, enable: bool, ready: impl FnOnce() + Send + 'static) {
		let mut cp = self.checkpoint.lock();
		if enable {
			cp.blockers += 1;
			if cp.phase == CheckpointPhase::Idle {
				drop(cp);
				ready();
			} else {
				cp.waiting.push(Box::new(ready));
			}
		} else {
			cp.blockers = cp.blockers.saturating_sub(1);
			drop(cp);
			ready();
		}
	}

	// Kicks off a background checkpoint once the current tail is durable;
	// the checkpoint would wait for that durability anyway.
	pub fn checkpoint_if_idle(self: &Arc<Self>) {
		{
			let mut cp = self.checkpoint.lock();
			if cp.phase != CheckpointPhase::Idle || cp.blockers > 0 || cp.pending {
				return;
			}
			cp.pending = true;
		}
		let tail = self.last_lsn();
		self.flush_buffers();
		let wal = Arc::clone(self);
		self.queue_task(tail, move || {
			if let Err(err) = wal.checkpoint_blocking() {
				log::warn!("Background checkpoint failed: {err}");
			}
		});
	}

	// Runs a full checkpoint cycle; blocks the calling thread through the
	// flush and durability waits. Returns false if skipped.
	pub fn checkpoint_blocking(self: &Arc<Self>) -> Result<bool, FileError> {
		{
			let mut cp = self.checkpoint.lock();
			cp.pending = false;
			if cp.phase != CheckpointPhase::Idle || cp.blockers > 0 {
				return Ok(false);
			}
			cp.phase = CheckpointPhase::Flushing;
		}
		let start_lsn = {
			let mut state = self.state.lock();
			state.checkpoint_data = 0;
			state.last_lsn
		};
		debug!("Checkpoint starting at lsn {start_lsn}");

		// Drain in-flight appliers so every record below start_lsn has
		// reached its page's cache copy, then make those pages durable.
		drop(self.apply_barrier.write());
		self.wait_durable(start_lsn);
		let flush_result = self.pages_notify.flush_upto(start_lsn);
		if let Err(err) = flush_result {
			self.checkpoint.lock().phase = CheckpointPhase::Idle;
			return Err(err);
		}

		self.checkpoint.lock().phase = CheckpointPhase::WaitingDurable;
		let commit_lsn = self.log(&Record::CheckpointCommit { start_lsn }, 0);
		self.wait_durable(commit_lsn);

		self.truncate_upto(start_lsn)?;

		let waiting = {
			let mut cp = self.checkpoint.lock();
			cp.phase = CheckpointPhase::Idle;
			cp.start_lsn = start_lsn;
			std::mem::take(&mut cp.waiting)
		};
		for ready in waiting {
			ready();
		}
		debug!("Checkpoint complete at lsn {start_lsn}");
		Ok(true)
	}

	// Free-lists WAL pages wholly older than the checkpoint.
	fn truncate_upto(&self, start_lsn: Lsn) -> Result<(), FileError> {
		let mut freed = Vec::new();
		{
			let mut state = self.state.lock();
			while let Some(front) = state.pages.front() {
				if !front.retired || front.last_lsn >= start_lsn {
					break;
				}
				let info = state.pages.pop_front().unwrap();
				state.free_pages.insert(info.pgno);
				freed.push(info.pgno);
			}
		}
		// Mark the pages free on disk; correctness does not depend on when
		// these writes land.
		let page_size = self.file.page_size();
		for pgno in freed {
			let mut page = vec![0; page_size];
			WalPageHeaderRepr::stamp(
				WalPageHeader {
					ptype: WalPageType::Free,
					num_recs: 0,
					pgno,
					checksum: 0,
					first_pos: WAL_PAGE_HDR_SIZE as u16,
					last_pos: WAL_PAGE_HDR_SIZE as u16,
					first_lsn: 0,
				},
				&mut page,
			);
			stamp_page_checksum(&mut page);
			self.file.write_page(pgno, &page)?;
		}
		Ok(())
	}

	pub fn close(self: &Arc<Self>) {
		let last = self.last_lsn();
		self.wait_durable(last);
	}
}
