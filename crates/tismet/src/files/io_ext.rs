use std::{fs::File, io};

// Positioned I/O: the data and WAL files are only ever accessed at explicit
// page offsets, never through a shared cursor.

#[cfg(unix)]
pub(crate) fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
	use std::os::unix::fs::FileExt;
	file.read_exact_at(buf, offset)
}

#[cfg(unix)]
pub(crate) fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
	use std::os::unix::fs::FileExt;
	file.write_all_at(buf, offset)
}

#[cfg(windows)]
pub(crate) fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
	use std::os::windows::fs::FileExt;
	while !buf.is_empty() {
		let n = file.seek_read(buf, offset)?;
		if n == 0 {
			return Err(io::ErrorKind::UnexpectedEof.into());
		}
		buf = &mut buf[n..];
		offset += n as u64;
	}
	Ok(())
}

#[cfg(windows)]
pub(crate) fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> io::Result<()> {
	use std::os::windows::fs::FileExt;
	while !buf.is_empty() {
		let n = file.seek_write(buf, offset)?;
		buf = &buf[n..];
		offset += n as u64;
	}
	Ok(())
}
