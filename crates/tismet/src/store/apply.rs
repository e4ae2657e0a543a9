use log::warn;

use crate::{
	consts::{DATA_FILE_SIG, METRIC_INDEX_ROOT_PGNO},
	files::FileError,
	pages::{
		self, init_radix_page, radix_page_slots, BitmapPage, MasterPage, MetricPage, PageType,
		RadixSlots, SamplePage, SampleType,
	},
	wal::{records::Record, records::RootTag, Lsn},
};

// Applies one WAL record to its target page. Every mutation of a data page
// funnels through here, both on the forward path and during recovery redo,
// so the two cannot disagree. The page LSN is stamped last.
pub(crate) fn apply_record(page: &mut [u8], lsn: Lsn, rec: &Record) -> Result<(), FileError> {
	match rec {
		Record::ZeroInit {
			page_size,
			segment_size,
			..
		} => {
			page.fill(0);
			MasterPage {
				signature: DATA_FILE_SIG,
				page_size: *page_size,
				segment_size: *segment_size,
				metric_root: METRIC_INDEX_ROOT_PGNO,
				bitmap_root: 0,
			}
			.write(page);
		}
		Record::TagRootUpdate { tag, root, .. } => {
			let mut master = MasterPage::read(page)?;
			match tag {
				RootTag::Metric => master.metric_root = *root,
				RootTag::Bitmap => master.bitmap_root = *root,
			}
			master.write(page);
		}
		Record::PageFree { pgno } => {
			page.fill(0);
			pages::init_page_header(page, PageType::Free, *pgno, 0, lsn);
		}
		Record::BitInit { pgno, pos } => {
			// `pos` is the section of the page-number space this bitmap page
			// covers; it is recorded in the header id.
			BitmapPage::init(page, *pgno, lsn);
			let hdr_id = pos;
			page[4..8].copy_from_slice(&hdr_id.to_ne_bytes());
		}
		Record::BitSet { pos, .. } => {
			expect_type(page, PageType::Bitmap)?;
			BitmapPage::set_bit(page, *pos as usize, true);
		}
		Record::BitReset { pos, .. } => {
			expect_type(page, PageType::Bitmap)?;
			BitmapPage::set_bit(page, *pos as usize, false);
		}
		Record::BitUpdateRange {
			first, last, value, ..
		} => {
			expect_type(page, PageType::Bitmap)?;
			BitmapPage::set_range(page, *first as usize, *last as usize, *value);
		}
		Record::RadixInit { pgno, id, height } => {
			init_radix_page(page, *pgno, *id, *height, lsn);
		}
		Record::RadixInitList {
			pgno,
			id,
			height,
			pages: list,
		} => {
			init_radix_page(page, *pgno, *id, *height, lsn);
			let slots = radix_page_slots();
			for (pos, target) in list.iter().enumerate() {
				slots.set_entry(page, pos, *target);
			}
		}
		Record::RadixErase { first, last, .. } => {
			let slots = radix_slots_for(page)?;
			slots.clear_range(page, *first as usize, *last as usize);
		}
		Record::RadixPromote { ref_page, .. } => {
			// The root's content moved into `ref_page`; the root now holds
			// one more level with the old tree at slot 0.
			let page_size = page.len();
			let slots = radix_slots_for(page)?;
			let height = slots.height(page);
			slots.set_height(page, height + 1);
			slots.clear(page, page_size);
			slots.set_entry(page, 0, *ref_page);
		}
		Record::RadixUpdate { pos, ref_page, .. } => {
			let slots = radix_slots_for(page)?;
			slots.set_entry(page, *pos as usize, *ref_page);
		}
		Record::MetricInit {
			pgno,
			id,
			stype,
			interval_secs,
			retention_secs,
			creation,
			name,
		} => {
			page.fill(0);
			pages::init_page_header(page, PageType::Metric, *pgno, *id, lsn);
			let repr = MetricPage::view_mut(page);
			repr.creation = *creation;
			repr.interval_secs = *interval_secs;
			repr.retention_secs = *retention_secs;
			repr.sample_type = *stype as u8;
			repr.name[..name.len()].copy_from_slice(name.as_bytes());
		}
		Record::MetricUpdate {
			stype,
			interval_secs,
			retention_secs,
			..
		} => {
			expect_type(page, PageType::Metric)?;
			let repr = MetricPage::view_mut(page);
			repr.interval_secs = *interval_secs;
			repr.retention_secs = *retention_secs;
			repr.sample_type = *stype as u8;
		}
		Record::MetricClearSamples { .. } => {
			expect_type(page, PageType::Metric)?;
			{
				let repr = MetricPage::view_mut(page);
				repr.last_page = 0;
				repr.last_page_pos = 0;
				repr.last_page_sample = 0;
				repr.last_page_first_time = 0;
			}
			let page_size = page.len();
			let slots = MetricPage::slots();
			slots.set_height(page, 0);
			slots.clear(page, page_size);
		}
		Record::MetricUpdatePos {
			last_page,
			last_page_pos,
			last_page_first_time,
			last_page_sample,
			..
		} => {
			expect_type(page, PageType::Metric)?;
			let repr = MetricPage::view_mut(page);
			repr.last_page = *last_page;
			repr.last_page_pos = *last_page_pos;
			repr.last_page_first_time = *last_page_first_time;
			repr.last_page_sample = *last_page_sample;
		}
		Record::SampleInit {
			pgno,
			id,
			stype,
			page_time,
			last_sample,
		} => {
			SamplePage::init(page, *pgno, *id, *stype, *page_time, lsn);
			SamplePage::view_mut(page).last_sample = *last_sample;
		}
		Record::SampleInitFill {
			pgno,
			id,
			stype,
			page_time,
			last_sample,
			value,
		} => {
			SamplePage::init(page, *pgno, *id, *stype, *page_time, lsn);
			SamplePage::view_mut(page).last_sample = *last_sample;
			SamplePage::set_sample(page, *stype, *last_sample as usize, *value);
		}
		Record::SampleUpdate {
			first,
			last,
			value,
			update_last,
			..
		} => {
			expect_type(page, PageType::Sample)?;
			let stype = sample_type_of(page)?;
			for pos in *first..*last {
				SamplePage::set_sample(page, stype, pos as usize, f64::NAN);
			}
			SamplePage::set_sample(page, stype, *last as usize, *value);
			if *update_last {
				SamplePage::view_mut(page).last_sample = *last;
			}
		}
		Record::SampleUpdateTime { page_time, .. } => {
			// The page is recycled for a new time window; its old samples
			// are all stale.
			expect_type(page, PageType::Sample)?;
			let stype = sample_type_of(page)?;
			{
				let repr = SamplePage::view_mut(page);
				repr.page_first_time = *page_time;
				repr.last_sample = 0;
			}
			SamplePage::set_sample(page, stype, 0, f64::NAN);
		}
		Record::SampleTxn {
			stype,
			pos,
			value,
			update_last,
			..
		} => {
			expect_type(page, PageType::Sample)?;
			SamplePage::set_sample(page, *stype, *pos as usize, *value);
			if *update_last {
				SamplePage::view_mut(page).last_sample = *pos;
			}
		}
		Record::FullPage { data, .. } => {
			page[..data.len()].copy_from_slice(data);
		}
		Record::Deprecated { tag, pgno } => {
			warn!("Ignoring deprecated WAL record type {tag} for page {pgno}");
			return Ok(());
		}
		Record::CheckpointCommit { .. } | Record::TxnBegin | Record::TxnCommit => {
			return Err(FileError::Corrupted(
				"Transactional WAL record applied to a page".to_string(),
			));
		}
	}
	pages::set_page_lsn(page, lsn);
	Ok(())
}

// Radix slot layout depends on whether the node is a plain radix page or the
// root embedded in a metric descriptor.
pub(crate) fn radix_slots_for(page: &[u8]) -> Result<RadixSlots, FileError> {
	match pages::page_type(page)? {
		PageType::Radix => Ok(radix_page_slots()),
		PageType::Metric => Ok(MetricPage::slots()),
		other => Err(FileError::Corrupted(format!(
			"Radix operation on {other:?} page"
		))),
	}
}

pub(crate) fn sample_type_of(page: &[u8]) -> Result<SampleType, FileError> {
	SampleType::try_from(SamplePage::view(page).sample_type)
}

fn expect_type(page: &[u8], expected: PageType) -> Result<(), FileError> {
	let actual = pages::page_type(page)?;
	if actual != expected {
		return Err(FileError::Corrupted(format!(
			"WAL record for a {expected:?} page applied to a {actual:?} page"
		)));
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use crate::utils::buf::PageBuf;

	use super::*;

	const PAGE_SIZE: usize = 4096;

	#[test]
	fn zero_init_then_tag_root() {
		let mut page = PageBuf::new_zeroed(PAGE_SIZE);

		apply_record(
			&mut page,
			1,
			&Record::ZeroInit {
				pgno: 0,
				page_size: PAGE_SIZE as u32,
				segment_size: 1 << 24,
			},
		)
		.unwrap();
		apply_record(
			&mut page,
			2,
			&Record::TagRootUpdate {
				pgno: 0,
				tag: RootTag::Bitmap,
				root: 2,
			},
		)
		.unwrap();

		let master = MasterPage::read(&page).unwrap();
		assert_eq!(master.metric_root, METRIC_INDEX_ROOT_PGNO);
		assert_eq!(master.bitmap_root, 2);
		assert_eq!(pages::page_lsn(&page), 2);
	}

	#[test]
	fn sample_update_fills_nan_gap() {
		let mut page = PageBuf::new_zeroed(PAGE_SIZE);
		apply_record(
			&mut page,
			1,
			&Record::SampleInitFill {
				pgno: 9,
				id: 1,
				stype: SampleType::Float32,
				page_time: 0,
				last_sample: 0,
				value: 1.0,
			},
		)
		.unwrap();

		apply_record(
			&mut page,
			2,
			&Record::SampleUpdate {
				pgno: 9,
				first: 1,
				last: 4,
				value: 5.0,
				update_last: true,
			},
		)
		.unwrap();

		assert_eq!(SamplePage::sample(&page, SampleType::Float32, 0), 1.0);
		assert!(SamplePage::sample(&page, SampleType::Float32, 1).is_nan());
		assert!(SamplePage::sample(&page, SampleType::Float32, 3).is_nan());
		assert_eq!(SamplePage::sample(&page, SampleType::Float32, 4), 5.0);
		assert_eq!(SamplePage::view(&page).last_sample, 4);
	}

	#[test]
	fn radix_promote_moves_root_content_down() {
		let mut page = PageBuf::new_zeroed(PAGE_SIZE);
		apply_record(
			&mut page,
			1,
			&Record::RadixInit {
				pgno: 5,
				id: 3,
				height: 0,
			},
		)
		.unwrap();
		apply_record(
			&mut page,
			2,
			&Record::RadixUpdate {
				pgno: 5,
				pos: 7,
				ref_page: 40,
			},
		)
		.unwrap();

		apply_record(
			&mut page,
			3,
			&Record::RadixPromote {
				pgno: 5,
				ref_page: 41,
			},
		)
		.unwrap();

		let slots = radix_page_slots();
		assert_eq!(slots.height(&page), 1);
		assert_eq!(slots.entry(&page, 0), Some(41));
		assert_eq!(slots.entry(&page, 7), None);
	}

	#[test]
	fn record_type_page_type_mismatch_is_fatal() {
		let mut page = PageBuf::new_zeroed(PAGE_SIZE);
		apply_record(
			&mut page,
			1,
			&Record::RadixInit {
				pgno: 5,
				id: 3,
				height: 0,
			},
		)
		.unwrap();

		let result = apply_record(
			&mut page,
			2,
			&Record::BitSet { pgno: 5, pos: 1 },
		);

		assert!(matches!(result, Err(FileError::Corrupted(..))));
	}
}
