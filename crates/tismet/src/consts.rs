use std::time::Duration;

use crate::utils::{KIB, MIB};

pub(crate) const DEFAULT_PAGE_SIZE: usize = 4 * KIB;
pub(crate) const MIN_PAGE_SIZE: usize = 128;
// Positions within a page are 16-bit.
pub(crate) const MAX_PAGE_SIZE: usize = 32 * KIB;

// Must be a multiple of the OS view alignment.
pub(crate) const SEGMENT_SIZE: usize = 16 * MIB;

pub(crate) const DATA_FILE_SIG: [u8; 16] = [
	0x39, 0x51, 0x57, 0x28, 0x48, 0x73, 0x45, 0x6d, 0xa1, 0xd8, 0xbf, 0xf6, 0xa2, 0x3b, 0x3f, 0xa3,
];

// GUID b45d8e5a-851d-42f5-ac31-9ca00158597b
pub(crate) const WAL_FILE_SIG: [u8; 16] = [
	0xb4, 0x5d, 0x8e, 0x5a, 0x85, 0x1d, 0x42, 0xf5, 0xac, 0x31, 0x9c, 0xa0, 0x01, 0x58, 0x59, 0x7b,
];

pub(crate) const DATA_FILE_NAME: &str = "metrics.tsd";
pub(crate) const WAL_FILE_NAME: &str = "metrics.tsw";

pub(crate) const MASTER_PGNO: u32 = 0;
pub(crate) const METRIC_INDEX_ROOT_PGNO: u32 = 1;

// Includes the terminating NUL of the on-page name field.
pub(crate) const MAX_METRIC_NAME_LEN: usize = 128;

pub(crate) const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub(crate) const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);

pub(crate) const DEFAULT_MAX_CHECKPOINT_DATA: usize = MIB;
pub(crate) const DEFAULT_MAX_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub(crate) const DEFAULT_PAGE_MAX_AGE: Duration = Duration::from_secs(30 * 60);
pub(crate) const DEFAULT_PAGE_SCAN_INTERVAL: Duration = Duration::from_secs(60);

pub(crate) const NUM_WAL_BUFFERS: usize = 10;
pub(crate) const WAL_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

// Local transaction nonces are 16-bit; LSNs use the low 48 bits of a txn id.
pub(crate) const MAX_LOCAL_TXNS: u16 = u16::MAX;
pub(crate) const LSN_MASK: u64 = (1 << 48) - 1;
