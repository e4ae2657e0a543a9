use std::{
	fs::{File, OpenOptions},
	ops::Deref,
	path::Path,
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
};

use memmap2::{Mmap, MmapOptions};
use parking_lot::RwLock;
use static_assertions::assert_impl_all;

use crate::{
	consts::{DATA_FILE_SIG, MAX_PAGE_SIZE, MIN_PAGE_SIZE, SEGMENT_SIZE},
	pages::MasterPage,
};

use super::{io_ext, FileError};

// The data file is grown in whole segments and mapped read-only one segment
// at a time. Mappings are append-only for the life of the handle, so page
// views stay valid across growth.
pub(crate) struct DataFile {
	file: Arc<File>,
	page_size: usize,
	segment_size: usize,
	len: AtomicU64,
	maps: RwLock<Vec<Arc<Mmap>>>,
}

assert_impl_all!(DataFile: Send, Sync);

impl DataFile {
	pub fn create(path: impl AsRef<Path>, page_size: usize) -> Result<Self, FileError> {
		if !valid_page_size(page_size) {
			return Err(FileError::InvalidPageSize(page_size as u32));
		}
		let file = OpenOptions::new()
			.create_new(true)
			.read(true)
			.write(true)
			.open(path)?;
		file.set_len(SEGMENT_SIZE as u64)?;
		Ok(Self {
			file: Arc::new(file),
			page_size,
			segment_size: SEGMENT_SIZE,
			len: AtomicU64::new(SEGMENT_SIZE as u64),
			maps: RwLock::new(Vec::new()),
		})
	}

	pub fn open(
		path: impl AsRef<Path>,
		expected_page_size: Option<usize>,
	) -> Result<Self, FileError> {
		let file = OpenOptions::new().read(true).write(true).open(path)?;

		let mut first = vec![0; MIN_PAGE_SIZE];
		io_ext::read_exact_at(&file, &mut first, 0)?;
		let master = MasterPage::read(&first)?;
		if master.signature != DATA_FILE_SIG {
			return Err(FileError::MissingSignature);
		}
		let page_size = master.page_size as usize;
		if !valid_page_size(page_size) {
			return Err(FileError::InvalidPageSize(master.page_size));
		}
		if let Some(expected) = expected_page_size {
			if expected != page_size {
				return Err(FileError::PageSizeMismatch(
					master.page_size,
					expected as u32,
				));
			}
		}

		let len = file.metadata()?.len();
		Ok(Self {
			file: Arc::new(file),
			page_size,
			segment_size: master.segment_size as usize,
			len: AtomicU64::new(len),
			maps: RwLock::new(Vec::new()),
		})
	}

	#[inline]
	pub fn page_size(&self) -> usize {
		self.page_size
	}

	#[inline]
	pub fn segment_size(&self) -> usize {
		self.segment_size
	}

	pub fn num_pages(&self) -> u32 {
		(self.len.load(Ordering::Acquire) / self.page_size as u64) as u32
	}

	pub fn file(&self) -> Arc<File> {
		Arc::clone(&self.file)
	}

	// Extends the file by whole segments until `pgno` fits. Returns the new
	// page capacity if the file grew.
	pub fn grow_to_fit(&self, pgno: u32) -> Result<Option<u32>, FileError> {
		let needed = (u64::from(pgno) + 1) * self.page_size as u64;
		let len = self.len.load(Ordering::Acquire);
		if needed <= len {
			return Ok(None);
		}
		let seg = self.segment_size as u64;
		let new_len = needed.div_ceil(seg) * seg;
		self.file.set_len(new_len)?;
		self.len.store(new_len, Ordering::Release);
		Ok(Some((new_len / self.page_size as u64) as u32))
	}

	pub fn view_page(&self, pgno: u32) -> Result<PageView, FileError> {
		let offset = u64::from(pgno) * self.page_size as u64;
		if offset + self.page_size as u64 > self.len.load(Ordering::Acquire) {
			return Err(FileError::PageOutOfBounds(pgno));
		}
		let segment = (offset / self.segment_size as u64) as usize;
		let map = self.segment_map(segment)?;
		let in_segment = (offset % self.segment_size as u64) as usize;
		Ok(PageView {
			map,
			offset: in_segment,
			len: self.page_size,
		})
	}

	pub fn write_page(&self, pgno: u32, data: &[u8]) -> Result<(), FileError> {
		debug_assert_eq!(data.len(), self.page_size);
		let offset = u64::from(pgno) * self.page_size as u64;
		io_ext::write_all_at(&self.file, data, offset)?;
		Ok(())
	}

	pub fn sync(&self) -> Result<(), FileError> {
		self.file.sync_data()?;
		Ok(())
	}

	fn segment_map(&self, segment: usize) -> Result<Arc<Mmap>, FileError> {
		{
			let maps = self.maps.read();
			if let Some(map) = maps.get(segment) {
				return Ok(Arc::clone(map));
			}
		}
		let mut maps = self.maps.write();
		let len = self.len.load(Ordering::Acquire);
		while maps.len() <= segment {
			let offset = maps.len() as u64 * self.segment_size as u64;
			if offset + self.segment_size as u64 > len {
				return Err(FileError::PageOutOfBounds(
					(offset / self.page_size as u64) as u32,
				));
			}
			let map = unsafe {
				MmapOptions::new()
					.offset(offset)
					.len(self.segment_size)
					.map(&*self.file)?
			};
			maps.push(Arc::new(map));
		}
		Ok(Arc::clone(&maps[segment]))
	}
}

fn valid_page_size(page_size: usize) -> bool {
	page_size.is_power_of_two() && (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size)
}

// A borrowed read-only page backed by a segment mapping.
pub(crate) struct PageView {
	map: Arc<Mmap>,
	offset: usize,
	len: usize,
}

impl Deref for PageView {
	type Target = [u8];

	#[inline]
	fn deref(&self) -> &[u8] {
		&self.map[self.offset..self.offset + self.len]
	}
}

#[cfg(test)]
mod tests {
	use tempfile::tempdir;

	use crate::consts::DEFAULT_PAGE_SIZE;
	use crate::pages::test_helpers::write_master_page;

	use super::*;

	#[test]
	fn create_and_reopen() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("data");

		let data = DataFile::create(&path, DEFAULT_PAGE_SIZE).unwrap();
		let mut master = vec![0; DEFAULT_PAGE_SIZE];
		write_master_page(&mut master, DEFAULT_PAGE_SIZE as u32, SEGMENT_SIZE as u32);
		data.write_page(0, &master).unwrap();
		data.sync().unwrap();
		drop(data);

		let data = DataFile::open(&path, Some(DEFAULT_PAGE_SIZE)).unwrap();
		assert_eq!(data.page_size(), DEFAULT_PAGE_SIZE);
		assert_eq!(data.num_pages() as usize, SEGMENT_SIZE / DEFAULT_PAGE_SIZE);
	}

	#[test]
	fn try_open_with_wrong_signature() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("data");

		let data = DataFile::create(&path, DEFAULT_PAGE_SIZE).unwrap();
		let mut master = vec![0; DEFAULT_PAGE_SIZE];
		write_master_page(&mut master, DEFAULT_PAGE_SIZE as u32, SEGMENT_SIZE as u32);
		master[24..40].copy_from_slice(b"definitely wrong");
		data.write_page(0, &master).unwrap();
		drop(data);

		let result = DataFile::open(&path, None);
		assert!(matches!(result, Err(FileError::MissingSignature)));
	}

	#[test]
	fn try_open_with_wrong_page_size() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("data");

		let data = DataFile::create(&path, DEFAULT_PAGE_SIZE).unwrap();
		let mut master = vec![0; DEFAULT_PAGE_SIZE];
		write_master_page(&mut master, DEFAULT_PAGE_SIZE as u32, SEGMENT_SIZE as u32);
		data.write_page(0, &master).unwrap();
		drop(data);

		let result = DataFile::open(&path, Some(8192));
		assert!(matches!(result, Err(FileError::PageSizeMismatch(4096, 8192))));
	}

	#[test]
	fn view_written_page() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("data");
		let data = DataFile::create(&path, DEFAULT_PAGE_SIZE).unwrap();

		let page = vec![0x5a; DEFAULT_PAGE_SIZE];
		data.write_page(17, &page).unwrap();

		let view = data.view_page(17).unwrap();
		assert!(view.iter().all(|b| *b == 0x5a));
	}

	#[test]
	fn grow_extends_by_whole_segments() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("data");
		let data = DataFile::create(&path, DEFAULT_PAGE_SIZE).unwrap();
		let pages_per_segment = (SEGMENT_SIZE / DEFAULT_PAGE_SIZE) as u32;

		assert_eq!(data.grow_to_fit(pages_per_segment - 1).unwrap(), None);
		assert_eq!(
			data.grow_to_fit(pages_per_segment).unwrap(),
			Some(2 * pages_per_segment)
		);
		assert_eq!(data.num_pages(), 2 * pages_per_segment);
	}

	#[test]
	fn try_view_page_out_of_bounds() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("data");
		let data = DataFile::create(&path, DEFAULT_PAGE_SIZE).unwrap();

		let result = data.view_page(data.num_pages());
		assert!(matches!(result, Err(FileError::PageOutOfBounds(..))));
	}
}
