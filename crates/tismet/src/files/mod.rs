use std::{convert::Infallible, io, path::PathBuf};

use thiserror::Error;

pub(crate) mod data;
pub(crate) mod io_ext;
pub(crate) mod wal;

#[derive(Debug, Error)]
pub enum FileError {
	#[error("The file is not a tismet database file")]
	MissingSignature,

	#[error("The file is not a tismet WAL file")]
	MissingWalSignature,

	#[error("The file is corrupted: {0}")]
	Corrupted(String),

	#[error("Page size mismatch; the file was created with page size {0}, not {1}")]
	PageSizeMismatch(u32, u32),

	#[error("Page size {0} is not a power of two in [{min}, {max}]", min = crate::consts::MIN_PAGE_SIZE, max = crate::consts::MAX_PAGE_SIZE)]
	InvalidPageSize(u32),

	#[error("The file is corrupted; a checksum mismatch occurred")]
	ChecksumMismatch,

	#[error("Page {0} is beyond the end of the data file")]
	PageOutOfBounds(u32),

	#[error("Unexpected end of file")]
	UnexpectedEof,

	#[error(transparent)]
	Io(io::Error),
}

impl From<io::Error> for FileError {
	fn from(value: io::Error) -> Self {
		match value.kind() {
			io::ErrorKind::UnexpectedEof => Self::UnexpectedEof,
			_ => Self::Io(value),
		}
	}
}

impl From<Infallible> for FileError {
	fn from(value: Infallible) -> Self {
		match value {}
	}
}

pub(crate) struct DatabaseDir {
	path: PathBuf,
}

impl DatabaseDir {
	pub fn open(path: PathBuf) -> Self {
		Self { path }
	}

	pub fn data_file_path(&self) -> PathBuf {
		self.path.join(crate::consts::DATA_FILE_NAME)
	}

	pub fn wal_file_path(&self) -> PathBuf {
		self.path.join(crate::consts::WAL_FILE_NAME)
	}

	pub fn create_dirs(&self) -> Result<(), FileError> {
		std::fs::create_dir_all(&self.path)?;
		Ok(())
	}
}
