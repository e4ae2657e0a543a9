use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::{
	files::FileError,
	pages::{Pgno, SampleType},
	TimePoint,
};

// Record type tags are part of the on-disk format and must stay stable.
// Tags 33..36 belong to the retired metric-inline-sample family; recovery
// still knows their sizes and fields so old WAL files remain readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RecType {
	CheckpointCommit = 1,
	TxnBegin = 2,
	TxnCommit = 3,
	ZeroInit = 4,
	PageFree = 5,
	BitUpdateRange = 6,
	TagRootUpdate = 7,
	RadixInit = 8,
	RadixInitList = 9,
	RadixErase = 10,
	RadixPromote = 11,
	RadixUpdate = 12,
	MetricInit = 13,
	MetricUpdate = 14,
	MetricClearSamples = 15,
	FullPage = 16,
	BitInit = 17,
	SampleInit = 18,
	SampleUpdate = 19,
	SampleUpdateLast = 20,
	SampleUpdateTime = 21,
	SampleUpdateFloat32Txn = 22,
	SampleUpdateFloat32LastTxn = 23,
	SampleUpdateFloat64Txn = 24,
	SampleUpdateFloat64LastTxn = 25,
	SampleUpdateInt8Txn = 26,
	SampleUpdateInt8LastTxn = 27,
	SampleUpdateInt16Txn = 28,
	SampleUpdateInt16LastTxn = 29,
	SampleUpdateInt32Txn = 30,
	SampleUpdateInt32LastTxn = 31,
	MetricUpdatePos = 32,
	MetricUpdatePosAndIndex = 33,
	MetricUpdateSample = 34,
	MetricUpdateSampleAndIndex = 35,
	MetricUpdateSampleTxn = 36,
	SampleInitFill = 37,
	BitSet = 38,
	BitReset = 39,
}

impl TryFrom<u8> for RecType {
	type Error = FileError;

	fn try_from(value: u8) -> Result<Self, FileError> {
		use RecType::*;
		Ok(match value {
			1 => CheckpointCommit,
			2 => TxnBegin,
			3 => TxnCommit,
			4 => ZeroInit,
			5 => PageFree,
			6 => BitUpdateRange,
			7 => TagRootUpdate,
			8 => RadixInit,
			9 => RadixInitList,
			10 => RadixErase,
			11 => RadixPromote,
			12 => RadixUpdate,
			13 => MetricInit,
			14 => MetricUpdate,
			15 => MetricClearSamples,
			16 => FullPage,
			17 => BitInit,
			18 => SampleInit,
			19 => SampleUpdate,
			20 => SampleUpdateLast,
			21 => SampleUpdateTime,
			22 => SampleUpdateFloat32Txn,
			23 => SampleUpdateFloat32LastTxn,
			24 => SampleUpdateFloat64Txn,
			25 => SampleUpdateFloat64LastTxn,
			26 => SampleUpdateInt8Txn,
			27 => SampleUpdateInt8LastTxn,
			28 => SampleUpdateInt16Txn,
			29 => SampleUpdateInt16LastTxn,
			30 => SampleUpdateInt32Txn,
			31 => SampleUpdateInt32LastTxn,
			32 => MetricUpdatePos,
			33 => MetricUpdatePosAndIndex,
			34 => MetricUpdateSample,
			35 => MetricUpdateSampleAndIndex,
			36 => MetricUpdateSampleTxn,
			37 => SampleInitFill,
			38 => BitSet,
			39 => BitReset,
			_ => {
				return Err(FileError::Corrupted(format!(
					"Unknown WAL record type {value}"
				)))
			}
		})
	}
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Record {
	CheckpointCommit {
		start_lsn: u64,
	},
	TxnBegin,
	TxnCommit,
	// Initializes the master page of a fresh database.
	ZeroInit {
		pgno: Pgno,
		page_size: u32,
		segment_size: u32,
	},
	PageFree {
		pgno: Pgno,
	},
	TagRootUpdate {
		pgno: Pgno,
		tag: RootTag,
		root: Pgno,
	},
	BitInit {
		pgno: Pgno,
		pos: u32,
	},
	BitSet {
		pgno: Pgno,
		pos: u32,
	},
	BitReset {
		pgno: Pgno,
		pos: u32,
	},
	BitUpdateRange {
		pgno: Pgno,
		first: u32,
		last: u32,
		value: bool,
	},
	RadixInit {
		pgno: Pgno,
		id: u32,
		height: u16,
	},
	RadixInitList {
		pgno: Pgno,
		id: u32,
		height: u16,
		pages: Vec<Pgno>,
	},
	RadixErase {
		pgno: Pgno,
		first: u16,
		last: u16,
	},
	RadixPromote {
		pgno: Pgno,
		ref_page: Pgno,
	},
	RadixUpdate {
		pgno: Pgno,
		pos: u16,
		ref_page: Pgno,
	},
	MetricInit {
		pgno: Pgno,
		id: u32,
		stype: SampleType,
		interval_secs: u64,
		retention_secs: u64,
		creation: TimePoint,
		name: String,
	},
	MetricUpdate {
		pgno: Pgno,
		stype: SampleType,
		interval_secs: u64,
		retention_secs: u64,
	},
	MetricClearSamples {
		pgno: Pgno,
	},
	MetricUpdatePos {
		pgno: Pgno,
		last_page: Pgno,
		last_page_pos: u32,
		last_page_first_time: TimePoint,
		last_page_sample: u16,
	},
	SampleInit {
		pgno: Pgno,
		id: u32,
		stype: SampleType,
		page_time: TimePoint,
		last_sample: u16,
	},
	SampleInitFill {
		pgno: Pgno,
		id: u32,
		stype: SampleType,
		page_time: TimePoint,
		last_sample: u16,
		value: f64,
	},
	// Sets samples [first, last) to NaN and samples[last] to value; the
	// `Last` form also advances the page's last-sample position.
	SampleUpdate {
		pgno: Pgno,
		first: u16,
		last: u16,
		value: f64,
		update_last: bool,
	},
	SampleUpdateTime {
		pgno: Pgno,
		page_time: TimePoint,
	},
	// One-record implicit transaction writing a single sample.
	SampleTxn {
		pgno: Pgno,
		stype: SampleType,
		pos: u16,
		value: f64,
		update_last: bool,
	},
	FullPage {
		pgno: Pgno,
		data: Vec<u8>,
	},
	// Retired record families kept readable; apply ignores them.
	Deprecated {
		tag: u8,
		pgno: Pgno,
	},
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum RootTag {
	Metric = 0,
	Bitmap = 1,
}

impl TryFrom<u8> for RootTag {
	type Error = FileError;

	fn try_from(value: u8) -> Result<Self, FileError> {
		match value {
			0 => Ok(Self::Metric),
			1 => Ok(Self::Bitmap),
			_ => Err(FileError::Corrupted(format!("Unknown root tag {value}"))),
		}
	}
}

/****************************************************************************
 * Wire reprs
 ***/

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
struct RecHdrRepr {
	rtype: u8,
	_pad: u8,
	local_txn: u16,
	pgno: u32,
}

const REC_HDR_SIZE: usize = size_of::<RecHdrRepr>();

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
struct TxnRepr {
	rtype: u8,
	_pad: u8,
	local_txn: u16,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
struct CheckpointRepr {
	rtype: u8,
	_pad: u8,
	local_txn: u16,
	start_lsn: u64,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
struct ZeroInitRepr {
	hdr: RecHdrRepr,
	page_size: u32,
	segment_size: u32,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
struct TagRootRepr {
	hdr: RecHdrRepr,
	tag: u8,
	root: u32,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
struct BitPosRepr {
	hdr: RecHdrRepr,
	pos: u32,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
struct BitRangeRepr {
	hdr: RecHdrRepr,
	first: u32,
	last: u32,
	value: u8,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
struct RadixInitRepr {
	hdr: RecHdrRepr,
	id: u32,
	height: u16,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
struct RadixInitListRepr {
	hdr: RecHdrRepr,
	id: u32,
	height: u16,
	num_pages: u16,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
struct RadixEraseRepr {
	hdr: RecHdrRepr,
	first: u16,
	last: u16,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
struct RadixPromoteRepr {
	hdr: RecHdrRepr,
	ref_page: u32,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
struct RadixUpdateRepr {
	hdr: RecHdrRepr,
	pos: u16,
	ref_page: u32,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
struct MetricInitRepr {
	hdr: RecHdrRepr,
	id: u32,
	interval_secs: u64,
	retention_secs: u64,
	creation: i64,
	stype: u8,
	name_len: u8,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
struct MetricUpdateRepr {
	hdr: RecHdrRepr,
	interval_secs: u64,
	retention_secs: u64,
	stype: u8,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
struct MetricUpdatePosRepr {
	hdr: RecHdrRepr,
	last_page_first_time: i64,
	last_page: u32,
	last_page_pos: u32,
	last_page_sample: u16,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
struct SampleInitRepr {
	hdr: RecHdrRepr,
	id: u32,
	page_time: i64,
	last_sample: u16,
	stype: u8,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
struct SampleInitFillRepr {
	hdr: RecHdrRepr,
	id: u32,
	page_time: i64,
	last_sample: u16,
	stype: u8,
	value: f64,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
struct SampleUpdateRepr {
	hdr: RecHdrRepr,
	first: u16,
	last: u16,
	value: f64,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
struct SampleTimeRepr {
	hdr: RecHdrRepr,
	page_time: i64,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
struct SampleTxnRepr {
	hdr: RecHdrRepr,
	pos: u16,
}

#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C, packed)]
struct FullPageRepr {
	hdr: RecHdrRepr,
	len: u16,
}

use std::mem::size_of;

fn sample_txn_tag(stype: SampleType, update_last: bool) -> RecType {
	match (stype, update_last) {
		(SampleType::Float32, false) => RecType::SampleUpdateFloat32Txn,
		(SampleType::Float32, true) => RecType::SampleUpdateFloat32LastTxn,
		(SampleType::Float64, false) => RecType::SampleUpdateFloat64Txn,
		(SampleType::Float64, true) => RecType::SampleUpdateFloat64LastTxn,
		(SampleType::Int8, false) => RecType::SampleUpdateInt8Txn,
		(SampleType::Int8, true) => RecType::SampleUpdateInt8LastTxn,
		(SampleType::Int16, false) => RecType::SampleUpdateInt16Txn,
		(SampleType::Int16, true) => RecType::SampleUpdateInt16LastTxn,
		(SampleType::Int32, false) => RecType::SampleUpdateInt32Txn,
		(SampleType::Int32, true) => RecType::SampleUpdateInt32LastTxn,
	}
}

fn sample_txn_params(tag: RecType) -> Option<(SampleType, bool)> {
	use RecType::*;
	Some(match tag {
		SampleUpdateFloat32Txn => (SampleType::Float32, false),
		SampleUpdateFloat32LastTxn => (SampleType::Float32, true),
		SampleUpdateFloat64Txn => (SampleType::Float64, false),
		SampleUpdateFloat64LastTxn => (SampleType::Float64, true),
		SampleUpdateInt8Txn => (SampleType::Int8, false),
		SampleUpdateInt8LastTxn => (SampleType::Int8, true),
		SampleUpdateInt16Txn => (SampleType::Int16, false),
		SampleUpdateInt16LastTxn => (SampleType::Int16, true),
		SampleUpdateInt32Txn => (SampleType::Int32, false),
		SampleUpdateInt32LastTxn => (SampleType::Int32, true),
		_ => return None,
	})
}

impl Record {
	pub fn pgno(&self) -> Option<Pgno> {
		use Record::*;
		match self {
			CheckpointCommit { .. } | TxnBegin | TxnCommit => None,
			ZeroInit { pgno, .. }
			| PageFree { pgno }
			| TagRootUpdate { pgno, .. }
			| BitInit { pgno, .. }
			| BitSet { pgno, .. }
			| BitReset { pgno, .. }
			| BitUpdateRange { pgno, .. }
			| RadixInit { pgno, .. }
			| RadixInitList { pgno, .. }
			| RadixErase { pgno, .. }
			| RadixPromote { pgno, .. }
			| RadixUpdate { pgno, .. }
			| MetricInit { pgno, .. }
			| MetricUpdate { pgno, .. }
			| MetricClearSamples { pgno }
			| MetricUpdatePos { pgno, .. }
			| SampleInit { pgno, .. }
			| SampleInitFill { pgno, .. }
			| SampleUpdate { pgno, .. }
			| SampleUpdateTime { pgno, .. }
			| SampleTxn { pgno, .. }
			| FullPage { pgno, .. }
			| Deprecated { pgno, .. } => Some(*pgno),
		}
	}

	// True for records that form a complete one-record transaction on their
	// own and therefore carry no local-txn tag.
	pub fn is_implicit_txn(&self) -> bool {
		matches!(self, Record::SampleTxn { .. })
	}

	pub fn encode(&self, local_txn: u16, out: &mut Vec<u8>) {
		use Record::*;
		match self {
			CheckpointCommit { start_lsn } => out.extend_from_slice(
				CheckpointRepr {
					rtype: RecType::CheckpointCommit as u8,
					_pad: 0,
					local_txn,
					start_lsn: *start_lsn,
				}
				.as_bytes(),
			),
			TxnBegin => out.extend_from_slice(
				TxnRepr {
					rtype: RecType::TxnBegin as u8,
					_pad: 0,
					local_txn,
				}
				.as_bytes(),
			),
			TxnCommit => out.extend_from_slice(
				TxnRepr {
					rtype: RecType::TxnCommit as u8,
					_pad: 0,
					local_txn,
				}
				.as_bytes(),
			),
			ZeroInit {
				pgno,
				page_size,
				segment_size,
			} => out.extend_from_slice(
				ZeroInitRepr {
					hdr: rec_hdr(RecType::ZeroInit, local_txn, *pgno),
					page_size: *page_size,
					segment_size: *segment_size,
				}
				.as_bytes(),
			),
			PageFree { pgno } => {
				out.extend_from_slice(rec_hdr(RecType::PageFree, local_txn, *pgno).as_bytes())
			}
			TagRootUpdate { pgno, tag, root } => out.extend_from_slice(
				TagRootRepr {
					hdr: rec_hdr(RecType::TagRootUpdate, local_txn, *pgno),
					tag: *tag as u8,
					root: *root,
				}
				.as_bytes(),
			),
			BitInit { pgno, pos } => out.extend_from_slice(
				BitPosRepr {
					hdr: rec_hdr(RecType::BitInit, local_txn, *pgno),
					pos: *pos,
				}
				.as_bytes(),
			),
			BitSet { pgno, pos } => out.extend_from_slice(
				BitPosRepr {
					hdr: rec_hdr(RecType::BitSet, local_txn, *pgno),
					pos: *pos,
				}
				.as_bytes(),
			),
			BitReset { pgno, pos } => out.extend_from_slice(
				BitPosRepr {
					hdr: rec_hdr(RecType::BitReset, local_txn, *pgno),
					pos: *pos,
				}
				.as_bytes(),
			),
			BitUpdateRange {
				pgno,
				first,
				last,
				value,
			} => out.extend_from_slice(
				BitRangeRepr {
					hdr: rec_hdr(RecType::BitUpdateRange, local_txn, *pgno),
					first: *first,
					last: *last,
					value: u8::from(*value),
				}
				.as_bytes(),
			),
			RadixInit { pgno, id, height } => out.extend_from_slice(
				RadixInitRepr {
					hdr: rec_hdr(RecType::RadixInit, local_txn, *pgno),
					id: *id,
					height: *height,
				}
				.as_bytes(),
			),
			RadixInitList {
				pgno,
				id,
				height,
				pages,
			} => {
				out.extend_from_slice(
					RadixInitListRepr {
						hdr: rec_hdr(RecType::RadixInitList, local_txn, *pgno),
						id: *id,
						height: *height,
						num_pages: pages.len() as u16,
					}
					.as_bytes(),
				);
				for page in pages {
					out.extend_from_slice(&page.to_ne_bytes());
				}
			}
			RadixErase { pgno, first, last } => out.extend_from_slice(
				RadixEraseRepr {
					hdr: rec_hdr(RecType::RadixErase, local_txn, *pgno),
					first: *first,
					last: *last,
				}
				.as_bytes(),
			),
			RadixPromote { pgno, ref_page } => out.extend_from_slice(
				RadixPromoteRepr {
					hdr: rec_hdr(RecType::RadixPromote, local_txn, *pgno),
					ref_page: *ref_page,
				}
				.as_bytes(),
			),
			RadixUpdate {
				pgno,
				pos,
				ref_page,
			} => out.extend_from_slice(
				RadixUpdateRepr {
					hdr: rec_hdr(RecType::RadixUpdate, local_txn, *pgno),
					pos: *pos,
					ref_page: *ref_page,
				}
				.as_bytes(),
			),
			MetricInit {
				pgno,
				id,
				stype,
				interval_secs,
				retention_secs,
				creation,
				name,
			} => {
				out.extend_from_slice(
					MetricInitRepr {
						hdr: rec_hdr(RecType::MetricInit, local_txn, *pgno),
						id: *id,
						interval_secs: *interval_secs,
						retention_secs: *retention_secs,
						creation: *creation,
						stype: *stype as u8,
						name_len: name.len() as u8,
					}
					.as_bytes(),
				);
				out.extend_from_slice(name.as_bytes());
			}
			MetricUpdate {
				pgno,
				stype,
				interval_secs,
				retention_secs,
			} => out.extend_from_slice(
				MetricUpdateRepr {
					hdr: rec_hdr(RecType::MetricUpdate, local_txn, *pgno),
					interval_secs: *interval_secs,
					retention_secs: *retention_secs,
					stype: *stype as u8,
				}
				.as_bytes(),
			),
			MetricClearSamples { pgno } => out
				.extend_from_slice(rec_hdr(RecType::MetricClearSamples, local_txn, *pgno).as_bytes()),
			MetricUpdatePos {
				pgno,
				last_page,
				last_page_pos,
				last_page_first_time,
				last_page_sample,
			} => out.extend_from_slice(
				MetricUpdatePosRepr {
					hdr: rec_hdr(RecType::MetricUpdatePos, local_txn, *pgno),
					last_page_first_time: *last_page_first_time,
					last_page: *last_page,
					last_page_pos: *last_page_pos,
					last_page_sample: *last_page_sample,
				}
				.as_bytes(),
			),
			SampleInit {
				pgno,
				id,
				stype,
				page_time,
				last_sample,
			} => out.extend_from_slice(
				SampleInitRepr {
					hdr: rec_hdr(RecType::SampleInit, local_txn, *pgno),
					id: *id,
					page_time: *page_time,
					last_sample: *last_sample,
					stype: *stype as u8,
				}
				.as_bytes(),
			),
			SampleInitFill {
				pgno,
				id,
				stype,
				page_time,
				last_sample,
				value,
			} => out.extend_from_slice(
				SampleInitFillRepr {
					hdr: rec_hdr(RecType::SampleInitFill, local_txn, *pgno),
					id: *id,
					page_time: *page_time,
					last_sample: *last_sample,
					stype: *stype as u8,
					value: *value,
				}
				.as_bytes(),
			),
			SampleUpdate {
				pgno,
				first,
				last,
				value,
				update_last,
			} => {
				let rtype = if *update_last {
					RecType::SampleUpdateLast
				} else {
					RecType::SampleUpdate
				};
				out.extend_from_slice(
					SampleUpdateRepr {
						hdr: rec_hdr(rtype, local_txn, *pgno),
						first: *first,
						last: *last,
						value: *value,
					}
					.as_bytes(),
				)
			}
			SampleUpdateTime { pgno, page_time } => out.extend_from_slice(
				SampleTimeRepr {
					hdr: rec_hdr(RecType::SampleUpdateTime, local_txn, *pgno),
					page_time: *page_time,
				}
				.as_bytes(),
			),
			SampleTxn {
				pgno,
				stype,
				pos,
				value,
				update_last,
			} => {
				let rtype = sample_txn_tag(*stype, *update_last);
				out.extend_from_slice(
					SampleTxnRepr {
						hdr: rec_hdr(rtype, local_txn, *pgno),
						pos: *pos,
					}
					.as_bytes(),
				);
				match stype {
					SampleType::Float32 => out.extend_from_slice(&(*value as f32).to_ne_bytes()),
					SampleType::Float64 => out.extend_from_slice(&value.to_ne_bytes()),
					SampleType::Int8 => out.extend_from_slice(&(*value as i8).to_ne_bytes()),
					SampleType::Int16 => out.extend_from_slice(&(*value as i16).to_ne_bytes()),
					SampleType::Int32 => out.extend_from_slice(&(*value as i32).to_ne_bytes()),
				}
			}
			FullPage { pgno, data } => {
				out.extend_from_slice(
					FullPageRepr {
						hdr: rec_hdr(RecType::FullPage, local_txn, *pgno),
						len: data.len() as u16,
					}
					.as_bytes(),
				);
				out.extend_from_slice(data);
			}
			Deprecated { .. } => {
				unreachable!("Deprecated records are never written")
			}
		}
	}

	pub fn encoded(&self, local_txn: u16) -> Vec<u8> {
		let mut out = Vec::new();
		self.encode(local_txn, &mut out);
		out
	}

	// Decodes one record from the head of `bytes`; returns the record, its
	// local-txn tag and the number of bytes consumed.
	pub fn decode(bytes: &[u8]) -> Result<(Record, u16, usize), FileError> {
		if bytes.is_empty() {
			return Err(FileError::UnexpectedEof);
		}
		let rtype = RecType::try_from(bytes[0])?;
		use RecType::*;
		match rtype {
			CheckpointCommit => {
				let repr = read::<CheckpointRepr>(bytes)?;
				Ok((
					Record::CheckpointCommit {
						start_lsn: repr.start_lsn,
					},
					repr.local_txn,
					size_of::<CheckpointRepr>(),
				))
			}
			TxnBegin | TxnCommit => {
				let repr = read::<TxnRepr>(bytes)?;
				let rec = if rtype == TxnBegin {
					Record::TxnBegin
				} else {
					Record::TxnCommit
				};
				Ok((rec, repr.local_txn, size_of::<TxnRepr>()))
			}
			ZeroInit => {
				let repr = read::<ZeroInitRepr>(bytes)?;
				Ok((
					Record::ZeroInit {
						pgno: repr.hdr.pgno,
						page_size: repr.page_size,
						segment_size: repr.segment_size,
					},
					repr.hdr.local_txn,
					size_of::<ZeroInitRepr>(),
				))
			}
			PageFree => {
				let repr = read::<RecHdrRepr>(bytes)?;
				Ok((
					Record::PageFree { pgno: repr.pgno },
					repr.local_txn,
					REC_HDR_SIZE,
				))
			}
			TagRootUpdate => {
				let repr = read::<TagRootRepr>(bytes)?;
				Ok((
					Record::TagRootUpdate {
						pgno: repr.hdr.pgno,
						tag: RootTag::try_from(repr.tag)?,
						root: repr.root,
					},
					repr.hdr.local_txn,
					size_of::<TagRootRepr>(),
				))
			}
			BitInit | BitSet | BitReset => {
				let repr = read::<BitPosRepr>(bytes)?;
				let rec = match rtype {
					BitInit => Record::BitInit {
						pgno: repr.hdr.pgno,
						pos: repr.pos,
					},
					BitSet => Record::BitSet {
						pgno: repr.hdr.pgno,
						pos: repr.pos,
					},
					_ => Record::BitReset {
						pgno: repr.hdr.pgno,
						pos: repr.pos,
					},
				};
				Ok((rec, repr.hdr.local_txn, size_of::<BitPosRepr>()))
			}
			BitUpdateRange => {
				let repr = read::<BitRangeRepr>(bytes)?;
				Ok((
					Record::BitUpdateRange {
						pgno: repr.hdr.pgno,
						first: repr.first,
						last: repr.last,
						value: repr.value != 0,
					},
					repr.hdr.local_txn,
					size_of::<BitRangeRepr>(),
				))
			}
			RadixInit => {
				let repr = read::<RadixInitRepr>(bytes)?;
				Ok((
					Record::RadixInit {
						pgno: repr.hdr.pgno,
						id: repr.id,
						height: repr.height,
					},
					repr.hdr.local_txn,
					size_of::<RadixInitRepr>(),
				))
			}
			RadixInitList => {
				let repr = read::<RadixInitListRepr>(bytes)?;
				let mut at = size_of::<RadixInitListRepr>();
				let mut pages = Vec::with_capacity(repr.num_pages as usize);
				for _ in 0..repr.num_pages {
					if bytes.len() < at + 4 {
						return Err(FileError::UnexpectedEof);
					}
					pages.push(u32::from_ne_bytes(bytes[at..at + 4].try_into().unwrap()));
					at += 4;
				}
				Ok((
					Record::RadixInitList {
						pgno: repr.hdr.pgno,
						id: repr.id,
						height: repr.height,
						pages,
					},
					repr.hdr.local_txn,
					at,
				))
			}
			RadixErase => {
				let repr = read::<RadixEraseRepr>(bytes)?;
				Ok((
					Record::RadixErase {
						pgno: repr.hdr.pgno,
						first: repr.first,
						last: repr.last,
					},
					repr.hdr.local_txn,
					size_of::<RadixEraseRepr>(),
				))
			}
			RadixPromote => {
				let repr = read::<RadixPromoteRepr>(bytes)?;
				Ok((
					Record::RadixPromote {
						pgno: repr.hdr.pgno,
						ref_page: repr.ref_page,
					},
					repr.hdr.local_txn,
					size_of::<RadixPromoteRepr>(),
				))
			}
			RadixUpdate => {
				let repr = read::<RadixUpdateRepr>(bytes)?;
				Ok((
					Record::RadixUpdate {
						pgno: repr.hdr.pgno,
						pos: repr.pos,
						ref_page: repr.ref_page,
					},
					repr.hdr.local_txn,
					size_of::<RadixUpdateRepr>(),
				))
			}
			MetricInit => {
				let repr = read::<MetricInitRepr>(bytes)?;
				let at = size_of::<MetricInitRepr>();
				let name_len = repr.name_len as usize;
				if bytes.len() < at + name_len {
					return Err(FileError::UnexpectedEof);
				}
				let name = std::str::from_utf8(&bytes[at..at + name_len])
					.map_err(|_| {
						FileError::Corrupted("Metric name is not valid UTF-8".to_string())
					})?
					.to_string();
				Ok((
					Record::MetricInit {
						pgno: repr.hdr.pgno,
						id: repr.id,
						stype: SampleType::try_from(repr.stype)?,
						interval_secs: repr.interval_secs,
						retention_secs: repr.retention_secs,
						creation: repr.creation,
						name,
					},
					repr.hdr.local_txn,
					at + name_len,
				))
			}
			MetricUpdate => {
				let repr = read::<MetricUpdateRepr>(bytes)?;
				Ok((
					Record::MetricUpdate {
						pgno: repr.hdr.pgno,
						stype: SampleType::try_from(repr.stype)?,
						interval_secs: repr.interval_secs,
						retention_secs: repr.retention_secs,
					},
					repr.hdr.local_txn,
					size_of::<MetricUpdateRepr>(),
				))
			}
			MetricClearSamples => {
				let repr = read::<RecHdrRepr>(bytes)?;
				Ok((
					Record::MetricClearSamples { pgno: repr.pgno },
					repr.local_txn,
					REC_HDR_SIZE,
				))
			}
			MetricUpdatePos => {
				let repr = read::<MetricUpdatePosRepr>(bytes)?;
				Ok((
					Record::MetricUpdatePos {
						pgno: repr.hdr.pgno,
						last_page: repr.last_page,
						last_page_pos: repr.last_page_pos,
						last_page_first_time: repr.last_page_first_time,
						last_page_sample: repr.last_page_sample,
					},
					repr.hdr.local_txn,
					size_of::<MetricUpdatePosRepr>(),
				))
			}
			SampleInit => {
				let repr = read::<SampleInitRepr>(bytes)?;
				Ok((
					Record::SampleInit {
						pgno: repr.hdr.pgno,
						id: repr.id,
						stype: SampleType::try_from(repr.stype)?,
						page_time: repr.page_time,
						last_sample: repr.last_sample,
					},
					repr.hdr.local_txn,
					size_of::<SampleInitRepr>(),
				))
			}
			SampleInitFill => {
				let repr = read::<SampleInitFillRepr>(bytes)?;
				Ok((
					Record::SampleInitFill {
						pgno: repr.hdr.pgno,
						id: repr.id,
						stype: SampleType::try_from(repr.stype)?,
						page_time: repr.page_time,
						last_sample: repr.last_sample,
						value: repr.value,
					},
					repr.hdr.local_txn,
					size_of::<SampleInitFillRepr>(),
				))
			}
			SampleUpdate | SampleUpdateLast => {
				let repr = read::<SampleUpdateRepr>(bytes)?;
				Ok((
					Record::SampleUpdate {
						pgno: repr.hdr.pgno,
						first: repr.first,
						last: repr.last,
						value: repr.value,
						update_last: rtype == SampleUpdateLast,
					},
					repr.hdr.local_txn,
					size_of::<SampleUpdateRepr>(),
				))
			}
			SampleUpdateTime => {
				let repr = read::<SampleTimeRepr>(bytes)?;
				Ok((
					Record::SampleUpdateTime {
						pgno: repr.hdr.pgno,
						page_time: repr.page_time,
					},
					repr.hdr.local_txn,
					size_of::<SampleTimeRepr>(),
				))
			}
			SampleUpdateFloat32Txn | SampleUpdateFloat32LastTxn | SampleUpdateFloat64Txn
			| SampleUpdateFloat64LastTxn | SampleUpdateInt8Txn | SampleUpdateInt8LastTxn
			| SampleUpdateInt16Txn | SampleUpdateInt16LastTxn | SampleUpdateInt32Txn
			| SampleUpdateInt32LastTxn => {
				let (stype, update_last) =
					sample_txn_params(rtype).expect("Covered by the match arm");
				let repr = read::<SampleTxnRepr>(bytes)?;
				let at = size_of::<SampleTxnRepr>();
				if bytes.len() < at + stype.size() {
					return Err(FileError::UnexpectedEof);
				}
				let value = match stype {
					SampleType::Float32 => {
						f64::from(f32::from_ne_bytes(bytes[at..at + 4].try_into().unwrap()))
					}
					SampleType::Float64 => {
						f64::from_ne_bytes(bytes[at..at + 8].try_into().unwrap())
					}
					SampleType::Int8 => {
						f64::from(i8::from_ne_bytes(bytes[at..at + 1].try_into().unwrap()))
					}
					SampleType::Int16 => {
						f64::from(i16::from_ne_bytes(bytes[at..at + 2].try_into().unwrap()))
					}
					SampleType::Int32 => {
						f64::from(i32::from_ne_bytes(bytes[at..at + 4].try_into().unwrap()))
					}
				};
				Ok((
					Record::SampleTxn {
						pgno: repr.hdr.pgno,
						stype,
						pos: repr.pos,
						value,
						update_last,
					},
					repr.hdr.local_txn,
					at + stype.size(),
				))
			}
			FullPage => {
				let repr = read::<FullPageRepr>(bytes)?;
				let at = size_of::<FullPageRepr>();
				let len = repr.len as usize;
				if bytes.len() < at + len {
					return Err(FileError::UnexpectedEof);
				}
				Ok((
					Record::FullPage {
						pgno: repr.hdr.pgno,
						data: bytes[at..at + len].to_vec(),
					},
					repr.hdr.local_txn,
					at + len,
				))
			}
			MetricUpdatePosAndIndex | MetricUpdateSample | MetricUpdateSampleAndIndex
			| MetricUpdateSampleTxn => {
				// Field layouts of the retired metric-inline-sample family;
				// only the sizes matter now.
				let body = match rtype {
					MetricUpdatePosAndIndex => 18,
					MetricUpdateSample => 10,
					MetricUpdateSampleAndIndex => 22,
					_ => 14,
				};
				let repr = read::<RecHdrRepr>(bytes)?;
				if bytes.len() < REC_HDR_SIZE + body {
					return Err(FileError::UnexpectedEof);
				}
				Ok((
					Record::Deprecated {
						tag: rtype as u8,
						pgno: repr.pgno,
					},
					repr.local_txn,
					REC_HDR_SIZE + body,
				))
			}
		}
	}
}

fn rec_hdr(rtype: RecType, local_txn: u16, pgno: Pgno) -> RecHdrRepr {
	RecHdrRepr {
		rtype: rtype as u8,
		_pad: 0,
		local_txn,
		pgno,
	}
}

fn read<T: FromBytes>(bytes: &[u8]) -> Result<T, FileError> {
	T::read_from_prefix(bytes)
		.map(|(repr, _)| repr)
		.map_err(|_| FileError::UnexpectedEof)
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	fn roundtrip(rec: Record, local_txn: u16) {
		let bytes = rec.encoded(local_txn);
		let (decoded, txn, consumed) = Record::decode(&bytes).unwrap();
		assert_eq!(decoded, rec);
		assert_eq!(txn, local_txn);
		assert_eq!(consumed, bytes.len());
	}

	#[test]
	fn roundtrip_transactional_records() {
		roundtrip(Record::TxnBegin, 7);
		roundtrip(Record::TxnCommit, 7);
		roundtrip(Record::CheckpointCommit { start_lsn: 123456 }, 0);
	}

	#[test]
	fn roundtrip_page_records() {
		roundtrip(
			Record::ZeroInit {
				pgno: 0,
				page_size: 4096,
				segment_size: 1 << 24,
			},
			0,
		);
		roundtrip(Record::PageFree { pgno: 17 }, 3);
		roundtrip(
			Record::TagRootUpdate {
				pgno: 0,
				tag: RootTag::Bitmap,
				root: 2,
			},
			1,
		);
		roundtrip(Record::BitInit { pgno: 3, pos: 12 }, 1);
		roundtrip(Record::BitSet { pgno: 3, pos: 40 }, 1);
		roundtrip(Record::BitReset { pgno: 3, pos: 41 }, 1);
		roundtrip(
			Record::BitUpdateRange {
				pgno: 3,
				first: 4,
				last: 4095,
				value: true,
			},
			1,
		);
	}

	#[test]
	fn roundtrip_radix_records() {
		roundtrip(
			Record::RadixInit {
				pgno: 5,
				id: 2,
				height: 1,
			},
			2,
		);
		roundtrip(
			Record::RadixInitList {
				pgno: 5,
				id: 2,
				height: 1,
				pages: vec![7, 8, 9],
			},
			2,
		);
		roundtrip(
			Record::RadixErase {
				pgno: 5,
				first: 0,
				last: 10,
			},
			2,
		);
		roundtrip(Record::RadixPromote { pgno: 5, ref_page: 6 }, 2);
		roundtrip(
			Record::RadixUpdate {
				pgno: 5,
				pos: 3,
				ref_page: 11,
			},
			2,
		);
	}

	#[test]
	fn roundtrip_metric_and_sample_records() {
		roundtrip(
			Record::MetricInit {
				pgno: 9,
				id: 1,
				stype: SampleType::Float32,
				interval_secs: 60,
				retention_secs: 604800,
				creation: 1000000000,
				name: "a.b.c".to_string(),
			},
			4,
		);
		roundtrip(
			Record::MetricUpdate {
				pgno: 9,
				stype: SampleType::Float64,
				interval_secs: 10,
				retention_secs: 86400,
			},
			4,
		);
		roundtrip(Record::MetricClearSamples { pgno: 9 }, 4);
		roundtrip(
			Record::MetricUpdatePos {
				pgno: 9,
				last_page: 12,
				last_page_pos: 2,
				last_page_first_time: 1000060800,
				last_page_sample: 55,
			},
			4,
		);
		roundtrip(
			Record::SampleInit {
				pgno: 12,
				id: 1,
				stype: SampleType::Float32,
				page_time: 1000060800,
				last_sample: 0,
			},
			4,
		);
		roundtrip(
			Record::SampleInitFill {
				pgno: 12,
				id: 1,
				stype: SampleType::Float32,
				page_time: 1000060800,
				last_sample: 3,
				value: 2.5,
			},
			4,
		);
		roundtrip(
			Record::SampleUpdate {
				pgno: 12,
				first: 4,
				last: 7,
				value: 1.25,
				update_last: true,
			},
			4,
		);
		roundtrip(
			Record::SampleUpdate {
				pgno: 12,
				first: 4,
				last: 4,
				value: 1.25,
				update_last: false,
			},
			4,
		);
		roundtrip(
			Record::SampleUpdateTime {
				pgno: 12,
				page_time: 1000121600,
			},
			4,
		);
		roundtrip(
			Record::FullPage {
				pgno: 12,
				data: vec![1, 2, 3, 4],
			},
			4,
		);
	}

	#[test]
	fn roundtrip_sample_txn_records() {
		for stype in [
			SampleType::Float32,
			SampleType::Float64,
			SampleType::Int8,
			SampleType::Int16,
			SampleType::Int32,
		] {
			for update_last in [false, true] {
				roundtrip(
					Record::SampleTxn {
						pgno: 12,
						stype,
						pos: 9,
						value: 17.0,
						update_last,
					},
					0,
				);
			}
		}
	}

	#[test]
	fn decode_unknown_tag_fails() {
		let result = Record::decode(&[200, 0, 0, 0, 0, 0, 0, 0]);
		assert!(matches!(result, Err(FileError::Corrupted(..))));
	}

	#[test]
	fn decode_truncated_record_fails() {
		let bytes = Record::SampleUpdateTime {
			pgno: 12,
			page_time: 1,
		}
		.encoded(0);
		let result = Record::decode(&bytes[..bytes.len() - 1]);
		assert!(matches!(result, Err(FileError::UnexpectedEof)));
	}

	#[test]
	fn deprecated_tags_remain_readable() {
		// A retired metric-update-sample record: header plus a 10-byte body.
		let mut bytes = vec![34, 0, 5, 0, 9, 0, 0, 0];
		bytes.extend_from_slice(&[0; 10]);
		let (rec, local_txn, consumed) = Record::decode(&bytes).unwrap();
		assert_eq!(rec, Record::Deprecated { tag: 34, pgno: 9 });
		assert_eq!(local_txn, 5);
		assert_eq!(consumed, 18);
	}
}
