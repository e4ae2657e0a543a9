use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::{
	files::{
		wal::{verify_page_checksum, WalPageHeader, WalPageHeaderRepr, WalPageType,
			WAL_PAGE_HDR_SIZE},
		FileError,
	},
	repr::PageRepr as _,
	utils::id_set::IdSet,
};

use super::{records::Record, Lsn, Wal, WalPageInfo};

// Applies one redo record to its target page; implemented by the store.
pub(crate) trait ApplyRecord {
	fn apply(&self, lsn: Lsn, rec: &Record) -> Result<(), FileError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RecoverFlags {
	// Redo incomplete transactions; only for the WAL dump tooling, which
	// replaces the normal apply logic.
	pub incomplete_txns: bool,
	// Include records from before the last checkpoint, also only for dump
	// tooling.
	pub before_checkpoint: bool,
}

#[derive(Debug, Default)]
pub(crate) struct RecoveredInfo {
	pub last_lsn: Lsn,
	pub checkpoint_lsn: Lsn,
	pub records_applied: usize,
	pub records_skipped: usize,
}

struct LoadedPage {
	header: WalPageHeader,
	payload: Vec<u8>,
}

impl LoadedPage {
	// 1 when the first record with bytes on this page started on an earlier
	// page.
	fn straddle_in(&self) -> u64 {
		u64::from(self.header.first_pos != WAL_PAGE_HDR_SIZE as u16)
	}
}

// Scans the WAL forward from the earliest retained page, re-applies every
// record of a committed transaction since the last checkpoint, and leaves the
// WAL positioned to append after the recovered tail.
pub(crate) fn recover(
	wal: &Arc<Wal>,
	apply: &dyn ApplyRecord,
	flags: RecoverFlags,
) -> Result<RecoveredInfo, FileError> {
	let page_size = wal.file.page_size();
	let num_pages = wal.file.num_pages()?;

	// Load every intact log page. Pages that fail to parse or checksum are
	// treated as free: either they were free-listed, or they are the torn
	// end of the final in-flight write.
	let mut pages: Vec<LoadedPage> = Vec::new();
	let mut free_pages = IdSet::new();
	let mut buf = vec![0; page_size];
	for pgno in 1..num_pages {
		wal.file.read_page(pgno, &mut buf)?;
		let header = match WalPageHeaderRepr::read_from(&buf) {
			Ok(header) => header,
			Err(_) => {
				free_pages.insert(pgno);
				continue;
			}
		};
		if header.ptype == WalPageType::Free || !verify_page_checksum(&buf) {
			free_pages.insert(pgno);
			continue;
		}
		if header.pgno != pgno {
			warn!("WAL page {pgno} claims to be page {}; ignored", header.pgno);
			free_pages.insert(pgno);
			continue;
		}
		// Positions outside the page mean the header itself is damaged even
		// though the checksum held up; treat the page as absent.
		let last_pos = header.last_pos as usize;
		let first_pos = header.first_pos as usize;
		if last_pos < WAL_PAGE_HDR_SIZE
			|| last_pos > page_size
			|| (first_pos == 0 && header.num_recs > 0)
			|| (first_pos != 0 && (first_pos < WAL_PAGE_HDR_SIZE || first_pos > last_pos))
		{
			warn!("WAL page {pgno} has inconsistent record positions; ignored");
			free_pages.insert(pgno);
			continue;
		}
		pages.push(LoadedPage {
			payload: buf[WAL_PAGE_HDR_SIZE..last_pos].to_vec(),
			header,
		});
	}

	if pages.is_empty() {
		wal.install_recovered_state(0, VecDeque::new(), free_pages, num_pages.max(1));
		return Ok(RecoveredInfo::default());
	}

	pages.sort_by_key(|p| p.header.first_lsn);

	// Keep the contiguous prefix. Pages left unmarked by an interrupted
	// truncation chain seamlessly into the live tail (their records predate
	// the checkpoint and redo skips them); a genuine break in the chain
	// means everything after it is a fragment that never became durable.
	let mut run_end = 1;
	while run_end < pages.len() {
		let prev = &pages[run_end - 1];
		let cur = &pages[run_end];
		let expected =
			prev.header.first_lsn + prev.straddle_in() + u64::from(prev.header.num_recs);
		if cur.header.first_lsn + cur.straddle_in() != expected
			|| prev.header.last_pos as usize != page_size
		{
			break;
		}
		run_end += 1;
	}
	if run_end < pages.len() {
		debug!(
			"Dropping {} WAL pages after a sequence break; they were never durable",
			pages.len() - run_end
		);
		for page in &pages[run_end..] {
			free_pages.insert(page.header.pgno);
		}
		pages.truncate(run_end);
	}

	// Reconstruct the record byte stream. The head of the first page may be
	// the tail of a record whose beginning was truncated away; skip it.
	let mut stream = Vec::new();
	let mut page_ends = Vec::new(); // stream offset where each page's bytes end
	for page in &pages {
		stream.extend_from_slice(&page.payload);
		page_ends.push(stream.len());
	}
	let first = &pages[0];
	let skip = if first.straddle_in() == 1 {
		if first.header.num_recs == 0 {
			stream.len()
		} else {
			first.header.first_pos as usize - WAL_PAGE_HDR_SIZE
		}
	} else {
		0
	};
	let first_lsn = first.header.first_lsn + first.straddle_in();

	// Decode the stream once, remembering which pages each record touches.
	let mut records: Vec<(Lsn, u16, Record)> = Vec::new();
	let mut page_last_lsn: Vec<Lsn> = pages.iter().map(|p| p.header.first_lsn).collect();
	let mut at = skip;
	let mut lsn = first_lsn;
	while at < stream.len() {
		let (rec, local_txn, consumed) = match Record::decode(&stream[at..]) {
			Ok(decoded) => decoded,
			Err(err) => {
				warn!("WAL truncated at lsn {lsn}: {err}");
				break;
			}
		};
		let end = at + consumed;
		for (index, page_end) in page_ends.iter().enumerate() {
			let page_start = if index == 0 { 0 } else { page_ends[index - 1] };
			if end > page_start && at < *page_end {
				page_last_lsn[index] = page_last_lsn[index].max(lsn);
			}
		}
		records.push((lsn, local_txn, rec));
		at = end;
		lsn += 1;
	}
	let last_lsn = lsn.saturating_sub(1);

	// Analyse pass: find the most recent committed checkpoint and the set of
	// transactions that eventually commit.
	let mut checkpoint_lsn = 0;
	let mut begun: HashMap<u16, Lsn> = HashMap::new();
	let mut committed: HashSet<(u16, Lsn)> = HashSet::new();
	for (lsn, local_txn, rec) in &records {
		match rec {
			Record::CheckpointCommit { start_lsn } => checkpoint_lsn = *start_lsn,
			Record::TxnBegin => {
				begun.insert(*local_txn, *lsn);
			}
			Record::TxnCommit => {
				if let Some(begin) = begun.remove(local_txn) {
					committed.insert((*local_txn, begin));
				}
			}
			_ => (),
		}
	}
	let incomplete = begun.len();

	// Redo pass from the checkpoint's start lsn. Records of transactions
	// that never committed are skipped; the pages they touched were never
	// flushed ahead of the missing commit.
	let mut active: HashMap<u16, Lsn> = HashMap::new();
	let mut applied = 0;
	let mut skipped = 0;
	for (lsn, local_txn, rec) in &records {
		match rec {
			Record::TxnBegin => {
				active.insert(*local_txn, *lsn);
				continue;
			}
			Record::TxnCommit => {
				active.remove(local_txn);
				continue;
			}
			Record::CheckpointCommit { .. } => continue,
			_ => (),
		}
		if *lsn < checkpoint_lsn && !flags.before_checkpoint {
			continue;
		}
		let in_committed_txn = *local_txn == 0
			|| active
				.get(local_txn)
				.is_some_and(|begin| committed.contains(&(*local_txn, *begin)));
		if !in_committed_txn && !flags.incomplete_txns {
			skipped += 1;
			continue;
		}
		apply.apply(*lsn, rec)?;
		applied += 1;
	}

	// Everything read back is durable by definition; appending resumes on a
	// fresh page.
	let infos: VecDeque<WalPageInfo> = pages
		.iter()
		.zip(page_last_lsn.iter())
		.map(|(page, last)| WalPageInfo {
			pgno: page.header.pgno,
			min_lsn: page.header.first_lsn,
			last_lsn: *last,
			durable_snap_lsn: *last,
			retired: true,
		})
		.collect();
	wal.install_recovered_state(last_lsn, infos, free_pages, num_pages);
	wal.checkpoint.lock().start_lsn = checkpoint_lsn;

	info!(
		"WAL recovery: {applied} records applied, {skipped} skipped, \
		 {incomplete} incomplete txns, tail lsn {last_lsn}"
	);
	Ok(RecoveredInfo {
		last_lsn,
		checkpoint_lsn,
		records_applied: applied,
		records_skipped: skipped,
	})
}

#[cfg(test)]
mod tests {
	use parking_lot::Mutex;
	use tempfile::tempdir;

	use crate::{
		files::wal::WalFile,
		tasks::TaskRunner,
		wal::{records::Record, CheckpointPages},
	};

	use super::*;

	struct NoopPages;

	impl CheckpointPages for NoopPages {
		fn flush_upto(&self, _lsn: Lsn) -> Result<(), FileError> {
			Ok(())
		}
	}

	#[derive(Default)]
	struct CollectApply {
		applied: Mutex<Vec<(Lsn, Record)>>,
	}

	impl ApplyRecord for CollectApply {
		fn apply(&self, lsn: Lsn, rec: &Record) -> Result<(), FileError> {
			self.applied.lock().push((lsn, rec.clone()));
			Ok(())
		}
	}

	fn new_wal(path: &std::path::Path) -> Arc<Wal> {
		let file = WalFile::create(path, 4096, 4096).unwrap();
		let runner = Arc::new(TaskRunner::new().unwrap());
		Arc::new(Wal::new(file, runner, Arc::new(NoopPages)))
	}

	fn reopen_wal(path: &std::path::Path) -> Arc<Wal> {
		let file = WalFile::open(path, 4096).unwrap();
		let runner = Arc::new(TaskRunner::new().unwrap());
		Arc::new(Wal::new(file, runner, Arc::new(NoopPages)))
	}

	#[test]
	fn committed_txn_replays_and_incomplete_is_skipped() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("wal");
		{
			let wal = new_wal(&path);
			let committed = wal.begin_txn();
			wal.append(committed, &Record::PageFree { pgno: 7 });
			let commit_lsn = wal.commit(committed);

			let incomplete = wal.begin_txn();
			wal.append(incomplete, &Record::PageFree { pgno: 8 });
			// No commit for the second txn; crash here.
			wal.wait_durable(wal.last_lsn());
			let _ = commit_lsn;
		}

		let wal = reopen_wal(&path);
		let apply = CollectApply::default();
		let recovered = recover(&wal, &apply, RecoverFlags::default()).unwrap();

		let applied = apply.applied.lock();
		assert_eq!(applied.len(), 1);
		assert_eq!(applied[0], (2, Record::PageFree { pgno: 7 }));
		assert_eq!(recovered.records_applied, 1);
		assert_eq!(recovered.records_skipped, 1);
		assert_eq!(recovered.last_lsn, 5);
	}

	#[test]
	fn incomplete_txns_replayed_for_dump_tooling() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("wal");
		{
			let wal = new_wal(&path);
			let txn = wal.begin_txn();
			wal.append(txn, &Record::PageFree { pgno: 8 });
			wal.wait_durable(wal.last_lsn());
		}

		let wal = reopen_wal(&path);
		let apply = CollectApply::default();
		let flags = RecoverFlags {
			incomplete_txns: true,
			before_checkpoint: false,
		};
		recover(&wal, &apply, flags).unwrap();

		assert_eq!(apply.applied.lock().len(), 1);
	}

	#[test]
	fn recovery_resumes_lsn_sequence() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("wal");
		{
			let wal = new_wal(&path);
			let txn = wal.begin_txn();
			wal.append(txn, &Record::PageFree { pgno: 7 });
			let lsn = wal.commit(txn);
			wal.wait_durable(lsn);
		}

		let wal = reopen_wal(&path);
		recover(&wal, &CollectApply::default(), RecoverFlags::default()).unwrap();

		let txn = wal.begin_txn();
		assert_eq!(super::super::txn_lsn(txn), 4);
	}

	#[test]
	fn records_spanning_pages_replay() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("wal");
		let expected: usize = 3000;
		{
			let wal = new_wal(&path);
			let txn = wal.begin_txn();
			for pos in 0..expected {
				wal.append(
					txn,
					&Record::SampleUpdate {
						pgno: 12,
						first: pos as u16,
						last: pos as u16,
						value: pos as f64,
						update_last: true,
					},
				);
			}
			let lsn = wal.commit(txn);
			wal.wait_durable(lsn);
		}

		let wal = reopen_wal(&path);
		let apply = CollectApply::default();
		let recovered = recover(&wal, &apply, RecoverFlags::default()).unwrap();

		assert_eq!(recovered.records_applied, expected);
		let applied = apply.applied.lock();
		assert_eq!(applied[0].0, 2);
		assert_eq!(applied[expected - 1].0, expected as u64 + 1);
	}

	#[test]
	fn fresh_wal_recovers_empty() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("wal");
		new_wal(&path);

		let wal = reopen_wal(&path);
		let recovered =
			recover(&wal, &CollectApply::default(), RecoverFlags::default()).unwrap();

		assert_eq!(recovered.last_lsn, 0);
		assert_eq!(recovered.records_applied, 0);
	}

	#[test]
	fn torn_tail_page_truncates_recovery() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("wal");
		{
			let wal = new_wal(&path);
			let txn = wal.begin_txn();
			wal.append(txn, &Record::PageFree { pgno: 7 });
			let lsn = wal.commit(txn);
			wal.wait_durable(lsn);
		}
		// Corrupt the log page body; its checksum no longer matches, as if
		// the final write tore.
		{
			use std::io::{Seek, SeekFrom, Write};
			let mut file = std::fs::OpenOptions::new()
				.write(true)
				.open(&path)
				.unwrap();
			file.seek(SeekFrom::Start(4096 + 100)).unwrap();
			file.write_all(&[0xff; 8]).unwrap();
		}

		let wal = reopen_wal(&path);
		let apply = CollectApply::default();
		let recovered = recover(&wal, &apply, RecoverFlags::default()).unwrap();

		assert_eq!(recovered.records_applied, 0);
		assert_eq!(recovered.last_lsn, 0);
	}
}
