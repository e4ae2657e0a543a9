use std::mem::size_of;

use static_assertions::const_assert;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
	consts::{MAX_METRIC_NAME_LEN, MIN_PAGE_SIZE},
	files::{wal::CRC32, FileError},
	repr::PageRepr,
	TimePoint,
};

pub(crate) type Pgno = u32;

pub(crate) const NO_PAGE: Pgno = 0;

pub(crate) const PAGE_HDR_SIZE: usize = size_of::<PageHeaderRepr>();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum PageType {
	Master = b'M',
	Free = b'F',
	Bitmap = b'B',
	Radix = b'r',
	Metric = b'm',
	Sample = b's',
}

impl TryFrom<u8> for PageType {
	type Error = FileError;

	fn try_from(value: u8) -> Result<Self, FileError> {
		match value {
			b'M' => Ok(Self::Master),
			b'F' => Ok(Self::Free),
			b'B' => Ok(Self::Bitmap),
			b'r' => Ok(Self::Radix),
			b'm' => Ok(Self::Metric),
			b's' => Ok(Self::Sample),
			_ => Err(FileError::Corrupted(format!(
				"Unknown page type {value:#x}"
			))),
		}
	}
}

// Every data-file page starts with this header. The lsn is the LSN of the
// last WAL record applied to the page.
#[derive(Debug, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub(crate) struct PageHeaderRepr {
	pub ptype: u8,
	pub _reserved: [u8; 3],
	pub id: u32,
	pub pgno: u32,
	pub checksum: u32,
	pub lsn: u64,
}

const_assert!(size_of::<PageHeaderRepr>() == 24);

const CHECKSUM_RANGE: std::ops::Range<usize> = 12..16;

pub(crate) fn page_type(page: &[u8]) -> Result<PageType, FileError> {
	PageType::try_from(page[0])
}

pub(crate) fn page_lsn(page: &[u8]) -> u64 {
	u64::from_ne_bytes(page[16..24].try_into().unwrap())
}

pub(crate) fn set_page_lsn(page: &mut [u8], lsn: u64) {
	page[16..24].copy_from_slice(&lsn.to_ne_bytes());
}

pub(crate) fn page_id(page: &[u8]) -> u32 {
	u32::from_ne_bytes(page[4..8].try_into().unwrap())
}

pub(crate) fn init_page_header(page: &mut [u8], ptype: PageType, pgno: Pgno, id: u32, lsn: u64) {
	let hdr = PageHeaderRepr {
		ptype: ptype as u8,
		_reserved: [0; 3],
		id,
		pgno,
		checksum: 0,
		lsn,
	};
	page[0..PAGE_HDR_SIZE].copy_from_slice(hdr.as_bytes());
}

// The checksum covers the whole page with the checksum field zeroed. It is
// stamped when a dirty page is flushed and verified when a page is first
// pulled from the file view.
pub(crate) fn page_checksum(page: &[u8]) -> u32 {
	let mut digest = CRC32.digest();
	digest.update(&page[..CHECKSUM_RANGE.start]);
	digest.update(&[0; 4]);
	digest.update(&page[CHECKSUM_RANGE.end..]);
	digest.finalize()
}

pub(crate) fn stamp_page_checksum(page: &mut [u8]) {
	let checksum = page_checksum(page);
	page[CHECKSUM_RANGE].copy_from_slice(&checksum.to_ne_bytes());
}

pub(crate) fn verify_page_checksum(page: &[u8]) -> bool {
	let stored = u32::from_ne_bytes(page[CHECKSUM_RANGE].try_into().unwrap());
	stored == page_checksum(page)
}

/****************************************************************************
 * Master page
 ***/

#[derive(Debug, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub(crate) struct MasterPageRepr {
	hdr: PageHeaderRepr,
	signature: [u8; 16],
	page_size: u32,
	segment_size: u32,
	metric_root: u32,
	bitmap_root: u32,
}

const_assert!(size_of::<MasterPageRepr>() <= MIN_PAGE_SIZE);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MasterPage {
	pub signature: [u8; 16],
	pub page_size: u32,
	pub segment_size: u32,
	pub metric_root: Pgno,
	pub bitmap_root: Pgno,
}

impl From<MasterPage> for MasterPageRepr {
	fn from(value: MasterPage) -> Self {
		Self {
			hdr: PageHeaderRepr {
				ptype: PageType::Master as u8,
				_reserved: [0; 3],
				id: 0,
				pgno: 0,
				checksum: 0,
				lsn: 0,
			},
			signature: value.signature,
			page_size: value.page_size,
			segment_size: value.segment_size,
			metric_root: value.metric_root,
			bitmap_root: value.bitmap_root,
		}
	}
}

impl TryFrom<MasterPageRepr> for MasterPage {
	type Error = FileError;

	fn try_from(value: MasterPageRepr) -> Result<Self, FileError> {
		if value.hdr.ptype != PageType::Master as u8 {
			return Err(FileError::MissingSignature);
		}
		Ok(Self {
			signature: value.signature,
			page_size: value.page_size,
			segment_size: value.segment_size,
			metric_root: value.metric_root,
			bitmap_root: value.bitmap_root,
		})
	}
}

impl PageRepr<MasterPage> for MasterPageRepr {
	type Error = FileError;
}

impl MasterPage {
	pub fn read(page: &[u8]) -> Result<Self, FileError> {
		<MasterPageRepr as PageRepr<_>>::read_from(page)
	}

	// Writes the master page body without touching the header's lsn, which
	// the WAL apply path owns.
	pub fn write(self, page: &mut [u8]) {
		let lsn = page_lsn(page);
		MasterPageRepr::stamp(self, page);
		set_page_lsn(page, lsn);
	}
}

/****************************************************************************
 * Sample type
 ***/

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum SampleType {
	#[default]
	Float32 = 1,
	Float64 = 2,
	Int8 = 3,
	Int16 = 4,
	Int32 = 5,
}

impl SampleType {
	pub(crate) fn size(self) -> usize {
		match self {
			Self::Float32 | Self::Int32 => 4,
			Self::Float64 => 8,
			Self::Int8 => 1,
			Self::Int16 => 2,
		}
	}
}

impl TryFrom<u8> for SampleType {
	type Error = FileError;

	fn try_from(value: u8) -> Result<Self, FileError> {
		match value {
			1 => Ok(Self::Float32),
			2 => Ok(Self::Float64),
			3 => Ok(Self::Int8),
			4 => Ok(Self::Int16),
			5 => Ok(Self::Int32),
			_ => Err(FileError::Corrupted(format!(
				"Unknown sample type {value}"
			))),
		}
	}
}

// Missing integer samples are stored as the type's minimum; floats use NaN.
const MISSING_I8: i8 = i8::MIN;
const MISSING_I16: i16 = i16::MIN;
const MISSING_I32: i32 = i32::MIN;

/****************************************************************************
 * Sample page
 ***/

#[derive(Debug, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub(crate) struct SamplePageRepr {
	pub hdr: PageHeaderRepr,
	// Time of the sample at index 0; always a multiple of the metric's
	// interval from the epoch.
	pub page_first_time: i64,
	// Position of the most recent sample. Samples after this position are
	// either in the not yet populated future or, because the pages form a
	// giant discontinuous ring buffer, in the distant past.
	pub last_sample: u16,
	pub sample_type: u8,
	pub _pad: [u8; 5],
}

pub(crate) const SAMPLE_ARRAY_OFFSET: usize = size_of::<SamplePageRepr>();

const_assert!(SAMPLE_ARRAY_OFFSET == 40);
const_assert!(SAMPLE_ARRAY_OFFSET % 8 == 0);

pub(crate) fn samples_per_page(page_size: usize, stype: SampleType) -> usize {
	(page_size - SAMPLE_ARRAY_OFFSET) / stype.size()
}

pub(crate) struct SamplePage;

impl SamplePage {
	pub fn view(page: &[u8]) -> &SamplePageRepr {
		SamplePageRepr::ref_from_prefix(page)
			.expect("Page buffers are 8-byte aligned")
			.0
	}

	pub fn view_mut(page: &mut [u8]) -> &mut SamplePageRepr {
		SamplePageRepr::mut_from_prefix(page)
			.expect("Page buffers are 8-byte aligned")
			.0
	}

	pub fn init(page: &mut [u8], pgno: Pgno, id: u32, stype: SampleType, time: TimePoint, lsn: u64) {
		page.fill(0);
		init_page_header(page, PageType::Sample, pgno, id, lsn);
		let repr = Self::view_mut(page);
		repr.page_first_time = time;
		repr.last_sample = 0;
		repr.sample_type = stype as u8;
		let count = samples_per_page(page.len(), stype);
		for pos in 0..count {
			Self::set_sample(page, stype, pos, f64::NAN);
		}
	}

	pub fn sample(page: &[u8], stype: SampleType, pos: usize) -> f64 {
		let at = SAMPLE_ARRAY_OFFSET + pos * stype.size();
		match stype {
			SampleType::Float32 => {
				f64::from(f32::from_ne_bytes(page[at..at + 4].try_into().unwrap()))
			}
			SampleType::Float64 => f64::from_ne_bytes(page[at..at + 8].try_into().unwrap()),
			SampleType::Int8 => {
				let v = i8::from_ne_bytes(page[at..at + 1].try_into().unwrap());
				if v == MISSING_I8 {
					f64::NAN
				} else {
					f64::from(v)
				}
			}
			SampleType::Int16 => {
				let v = i16::from_ne_bytes(page[at..at + 2].try_into().unwrap());
				if v == MISSING_I16 {
					f64::NAN
				} else {
					f64::from(v)
				}
			}
			SampleType::Int32 => {
				let v = i32::from_ne_bytes(page[at..at + 4].try_into().unwrap());
				if v == MISSING_I32 {
					f64::NAN
				} else {
					f64::from(v)
				}
			}
		}
	}

	pub fn set_sample(page: &mut [u8], stype: SampleType, pos: usize, value: f64) {
		let at = SAMPLE_ARRAY_OFFSET + pos * stype.size();
		match stype {
			SampleType::Float32 => {
				page[at..at + 4].copy_from_slice(&(value as f32).to_ne_bytes())
			}
			SampleType::Float64 => page[at..at + 8].copy_from_slice(&value.to_ne_bytes()),
			SampleType::Int8 => {
				let v = if value.is_nan() { MISSING_I8 } else { value as i8 };
				page[at..at + 1].copy_from_slice(&v.to_ne_bytes())
			}
			SampleType::Int16 => {
				let v = if value.is_nan() {
					MISSING_I16
				} else {
					value as i16
				};
				page[at..at + 2].copy_from_slice(&v.to_ne_bytes())
			}
			SampleType::Int32 => {
				let v = if value.is_nan() {
					MISSING_I32
				} else {
					value as i32
				};
				page[at..at + 4].copy_from_slice(&v.to_ne_bytes())
			}
		}
	}
}

/****************************************************************************
 * Radix data
 ***/

// A radix node's slot array. It lives at a fixed offset inside radix pages
// and at a larger offset inside metric pages (after the descriptor fields),
// so the accessors take the offset explicitly.
pub(crate) const RADIX_DATA_HDR_SIZE: usize = 4;

pub(crate) const RADIX_PAGE_DATA_OFFSET: usize = PAGE_HDR_SIZE;

#[derive(Clone, Copy)]
pub(crate) struct RadixSlots {
	offset: usize,
}

impl RadixSlots {
	pub fn new(offset: usize) -> Self {
		Self { offset }
	}

	pub fn capacity(self, page_size: usize) -> usize {
		(page_size - self.offset - RADIX_DATA_HDR_SIZE) / size_of::<u32>()
	}

	pub fn height(self, page: &[u8]) -> u16 {
		u16::from_ne_bytes(page[self.offset..self.offset + 2].try_into().unwrap())
	}

	pub fn set_height(self, page: &mut [u8], height: u16) {
		page[self.offset..self.offset + 2].copy_from_slice(&height.to_ne_bytes());
	}

	pub fn entry(self, page: &[u8], pos: usize) -> Option<Pgno> {
		let at = self.offset + RADIX_DATA_HDR_SIZE + pos * size_of::<u32>();
		let pgno = u32::from_ne_bytes(page[at..at + 4].try_into().unwrap());
		(pgno != NO_PAGE).then_some(pgno)
	}

	pub fn set_entry(self, page: &mut [u8], pos: usize, pgno: Pgno) {
		let at = self.offset + RADIX_DATA_HDR_SIZE + pos * size_of::<u32>();
		page[at..at + 4].copy_from_slice(&pgno.to_ne_bytes());
	}

	pub fn clear_range(self, page: &mut [u8], first: usize, last: usize) {
		for pos in first..=last {
			self.set_entry(page, pos, NO_PAGE);
		}
	}

	pub fn clear(self, page: &mut [u8], page_size: usize) {
		self.clear_range(page, 0, self.capacity(page_size) - 1);
	}

	pub fn is_empty(self, page: &[u8], page_size: usize) -> bool {
		(0..self.capacity(page_size)).all(|pos| self.entry(page, pos).is_none())
	}
}

pub(crate) fn radix_page_slots() -> RadixSlots {
	RadixSlots::new(RADIX_PAGE_DATA_OFFSET)
}

pub(crate) fn init_radix_page(page: &mut [u8], pgno: Pgno, id: u32, height: u16, lsn: u64) {
	page.fill(0);
	init_page_header(page, PageType::Radix, pgno, id, lsn);
	radix_page_slots().set_height(page, height);
}

/****************************************************************************
 * Metric page
 ***/

#[derive(Debug, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub(crate) struct MetricPageRepr {
	pub hdr: PageHeaderRepr,
	pub creation: i64,
	pub interval_secs: u64,
	pub retention_secs: u64,
	// Reference to the page holding the most recent samples. The live
	// last-sample position is on the sample page itself; the copy here is
	// only refreshed when the last page changes.
	pub last_page_first_time: i64,
	pub last_page: u32,
	pub last_page_pos: u32,
	pub last_page_sample: u16,
	pub sample_type: u8,
	pub _pad: u8,
	pub name: [u8; MAX_METRIC_NAME_LEN],
	pub _pad2: [u8; 4],
}

pub(crate) const METRIC_RADIX_OFFSET: usize = size_of::<MetricPageRepr>();

const_assert!(METRIC_RADIX_OFFSET % 8 == 0);

pub(crate) struct MetricPage;

impl MetricPage {
	pub fn view(page: &[u8]) -> &MetricPageRepr {
		MetricPageRepr::ref_from_prefix(page)
			.expect("Page buffers are 8-byte aligned")
			.0
	}

	pub fn view_mut(page: &mut [u8]) -> &mut MetricPageRepr {
		MetricPageRepr::mut_from_prefix(page)
			.expect("Page buffers are 8-byte aligned")
			.0
	}

	pub fn slots() -> RadixSlots {
		RadixSlots::new(METRIC_RADIX_OFFSET)
	}

	pub fn name(page: &[u8]) -> &str {
		let repr = Self::view(page);
		let len = repr
			.name
			.iter()
			.position(|b| *b == 0)
			.unwrap_or(repr.name.len());
		std::str::from_utf8(&repr.name[..len]).unwrap_or("")
	}
}

/****************************************************************************
 * Bitmap page
 ***/

pub(crate) const BITMAP_DATA_OFFSET: usize = PAGE_HDR_SIZE;

pub(crate) fn bits_per_page(page_size: usize) -> usize {
	(page_size - BITMAP_DATA_OFFSET) * 8
}

pub(crate) struct BitmapPage;

impl BitmapPage {
	pub fn init(page: &mut [u8], pgno: Pgno, lsn: u64) {
		page.fill(0);
		init_page_header(page, PageType::Bitmap, pgno, 0, lsn);
	}

	pub fn bit(page: &[u8], pos: usize) -> bool {
		let byte = page[BITMAP_DATA_OFFSET + pos / 8];
		byte & (1 << (pos % 8)) != 0
	}

	pub fn set_bit(page: &mut [u8], pos: usize, value: bool) {
		let byte = &mut page[BITMAP_DATA_OFFSET + pos / 8];
		if value {
			*byte |= 1 << (pos % 8);
		} else {
			*byte &= !(1 << (pos % 8));
		}
	}

	pub fn set_range(page: &mut [u8], first: usize, last: usize, value: bool) {
		for pos in first..=last {
			Self::set_bit(page, pos, value);
		}
	}

	pub fn iter_set_bits(page: &[u8], page_size: usize) -> impl Iterator<Item = usize> + '_ {
		(0..bits_per_page(page_size)).filter(|pos| Self::bit(page, *pos))
	}
}

#[cfg(test)]
pub(crate) mod test_helpers {
	use crate::consts::{DATA_FILE_SIG, SEGMENT_SIZE};

	use super::*;

	pub(crate) fn write_master_page(page: &mut [u8], page_size: u32, segment_size: u32) {
		MasterPage {
			signature: DATA_FILE_SIG,
			page_size,
			segment_size,
			metric_root: crate::consts::METRIC_INDEX_ROOT_PGNO,
			bitmap_root: 2,
		}
		.write(page);
	}

	pub(crate) fn empty_master() -> MasterPage {
		MasterPage {
			signature: DATA_FILE_SIG,
			page_size: crate::consts::DEFAULT_PAGE_SIZE as u32,
			segment_size: SEGMENT_SIZE as u32,
			metric_root: crate::consts::METRIC_INDEX_ROOT_PGNO,
			bitmap_root: 2,
		}
	}
}
