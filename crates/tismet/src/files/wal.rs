use std::{
	fs::{File, OpenOptions},
	path::Path,
};

use crc::Crc;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{consts::WAL_FILE_SIG, repr::PageRepr};

use super::{io_ext, FileError};

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

pub(crate) const WAL_PAGE_HDR_SIZE: usize = 24;

// Page 0 of the WAL file; never holds records.
#[derive(Debug, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub(crate) struct ZeroPageRepr {
	signature: [u8; 16],
	wal_page_size: u32,
	data_page_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ZeroPage {
	pub wal_page_size: u32,
	pub data_page_size: u32,
}

impl From<ZeroPage> for ZeroPageRepr {
	fn from(value: ZeroPage) -> Self {
		Self {
			signature: WAL_FILE_SIG,
			wal_page_size: value.wal_page_size,
			data_page_size: value.data_page_size,
		}
	}
}

impl TryFrom<ZeroPageRepr> for ZeroPage {
	type Error = FileError;

	fn try_from(value: ZeroPageRepr) -> Result<Self, FileError> {
		if value.signature != WAL_FILE_SIG {
			return Err(FileError::MissingWalSignature);
		}
		Ok(Self {
			wal_page_size: value.wal_page_size,
			data_page_size: value.data_page_size,
		})
	}
}

impl PageRepr<ZeroPage> for ZeroPageRepr {
	type Error = FileError;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum WalPageType {
	Log = b'l',
	Free = b'F',
}

impl TryFrom<u8> for WalPageType {
	type Error = FileError;

	fn try_from(value: u8) -> Result<Self, FileError> {
		match value {
			b'l' => Ok(Self::Log),
			b'F' => Ok(Self::Free),
			_ => Err(FileError::Corrupted(format!(
				"Unknown WAL page type {value:#x}"
			))),
		}
	}
}

#[derive(Debug, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
pub(crate) struct WalPageHeaderRepr {
	ptype: u8,
	_reserved: u8,
	num_recs: u16,
	pgno: u32,
	checksum: u32,
	first_pos: u16,
	last_pos: u16,
	first_lsn: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WalPageHeader {
	pub ptype: WalPageType,
	// Records *started* on this page; a record straddling in from the
	// previous page does not count.
	pub num_recs: u16,
	pub pgno: u32,
	pub checksum: u32,
	// Offset of the first record that starts on this page (a straddling tail
	// from the previous page ends there), and the position after the last
	// byte of record data.
	pub first_pos: u16,
	pub last_pos: u16,
	// LSN of the first record started on this page.
	pub first_lsn: u64,
}

impl From<WalPageHeader> for WalPageHeaderRepr {
	fn from(value: WalPageHeader) -> Self {
		Self {
			ptype: value.ptype as u8,
			_reserved: 0,
			num_recs: value.num_recs,
			pgno: value.pgno,
			checksum: value.checksum,
			first_pos: value.first_pos,
			last_pos: value.last_pos,
			first_lsn: value.first_lsn,
		}
	}
}

impl TryFrom<WalPageHeaderRepr> for WalPageHeader {
	type Error = FileError;

	fn try_from(value: WalPageHeaderRepr) -> Result<Self, FileError> {
		Ok(Self {
			ptype: value.ptype.try_into()?,
			num_recs: value.num_recs,
			pgno: value.pgno,
			checksum: value.checksum,
			first_pos: value.first_pos,
			last_pos: value.last_pos,
			first_lsn: value.first_lsn,
		})
	}
}

impl PageRepr<WalPageHeader> for WalPageHeaderRepr {
	type Error = FileError;
}

const CHECKSUM_RANGE: std::ops::Range<usize> = 8..12;

// The page checksum covers the whole page with the checksum field zeroed.
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

pub(crate) struct WalFile {
	file: File,
	page_size: usize,
	data_page_size: usize,
}

impl WalFile {
	pub fn create(
		path: impl AsRef<Path>,
		page_size: usize,
		data_page_size: usize,
	) -> Result<Self, FileError> {
		let file = OpenOptions::new()
			.create_new(true)
			.read(true)
			.write(true)
			.open(path)?;
		let mut zero = vec![0; page_size];
		ZeroPageRepr::stamp(
			ZeroPage {
				wal_page_size: page_size as u32,
				data_page_size: data_page_size as u32,
			},
			&mut zero,
		);
		io_ext::write_all_at(&file, &zero, 0)?;
		file.sync_data()?;
		Ok(Self {
			file,
			page_size,
			data_page_size,
		})
	}

	pub fn open(path: impl AsRef<Path>, page_size: usize) -> Result<Self, FileError> {
		let file = OpenOptions::new().read(true).write(true).open(path)?;
		let mut zero = vec![0; ZeroPageRepr::SIZE];
		io_ext::read_exact_at(&file, &mut zero, 0)?;
		let header = <ZeroPageRepr as PageRepr<_>>::read_from(&zero)?;
		if header.wal_page_size as usize != page_size {
			return Err(FileError::PageSizeMismatch(
				header.wal_page_size,
				page_size as u32,
			));
		}
		Ok(Self {
			file,
			page_size,
			data_page_size: header.data_page_size as usize,
		})
	}

	#[inline]
	pub fn page_size(&self) -> usize {
		self.page_size
	}

	#[inline]
	pub fn data_page_size(&self) -> usize {
		self.data_page_size
	}

	pub fn num_pages(&self) -> Result<u32, FileError> {
		let len = self.file.metadata()?.len();
		Ok((len / self.page_size as u64) as u32)
	}

	pub fn read_page(&self, pgno: u32, buf: &mut [u8]) -> Result<(), FileError> {
		debug_assert_eq!(buf.len(), self.page_size);
		io_ext::read_exact_at(&self.file, buf, u64::from(pgno) * self.page_size as u64)?;
		Ok(())
	}

	pub fn write_page(&self, pgno: u32, buf: &[u8]) -> Result<(), FileError> {
		debug_assert_eq!(buf.len(), self.page_size);
		io_ext::write_all_at(&self.file, buf, u64::from(pgno) * self.page_size as u64)?;
		Ok(())
	}

	pub fn sync(&self) -> Result<(), FileError> {
		self.file.sync_data()?;
		Ok(())
	}
}
