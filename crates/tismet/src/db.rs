use std::{
	path::Path,
	sync::Arc,
	time::{Duration, SystemTime},
};

use log::info;
use parking_lot::Mutex;
use static_assertions::assert_impl_all;

use crate::{
	cache::{PageCache, PageCacheConfig},
	consts::{MAX_METRIC_NAME_LEN, WAL_FLUSH_INTERVAL},
	files::{data::DataFile, wal::WalFile, DatabaseDir, FileError},
	pages::{samples_per_page, SampleType},
	store::{DbData, MetricConfig, RedoApply},
	tasks::{ScheduledTaskHandle, TaskRunner},
	wal::{
		recovery::{self, RecoverFlags},
		Wal, WalConfig,
	},
	MetricId, TimePoint,
};

pub use crate::store::DbError;

#[derive(Debug, Clone, Copy, Default)]
pub struct DbOpenFlags {
	// Create the database files when missing; without it a missing data
	// file fails the open.
	pub create: bool,
	// Log database status messages on open.
	pub verbose: bool,
}

// Reconfigurable tuning; `None` leaves a parameter unchanged.
#[derive(Debug, Clone, Default)]
pub struct DbConfig {
	pub page_max_age: Option<Duration>,
	pub page_scan_interval: Option<Duration>,
	pub checkpoint_max_interval: Option<Duration>,
	pub checkpoint_max_data: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbStats {
	// Constant for the life of the database.
	pub page_size: usize,
	pub segment_size: usize,
	pub metric_name_size: usize,
	pub samples_per_page: usize,

	// Change as data is modified.
	pub num_pages: u32,
	pub free_pages: usize,
	pub metrics: usize,
	pub broken: bool,

	pub samples_added: u64,
	pub samples_old: u64,
	pub samples_dup: u64,
	pub samples_changed: u64,
	pub metrics_created: u64,
	pub metrics_deleted: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricInfo {
	pub name: String,
	pub stype: SampleType,
	pub interval: Duration,
	pub retention: Duration,
	pub creation: TimePoint,
}

// Push iteration over a sample range: start, many samples, end. Returning
// false from `on_sample` aborts the walk.
pub trait EnumNotify {
	fn on_series_start(
		&mut self,
		_id: MetricId,
		_name: &str,
		_stype: SampleType,
		_first: TimePoint,
		_last: TimePoint,
		_interval: Duration,
	) {
	}

	fn on_sample(&mut self, id: MetricId, time: TimePoint, value: f64) -> bool;

	fn on_series_end(&mut self) {}
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressInfo {
	pub metrics: usize,
	pub samples: usize,
	pub bytes: usize,
}

// Long-running maintenance operations report progress through this; return
// false to abort.
pub trait ProgressNotify {
	fn on_progress(&mut self, complete: bool, info: &ProgressInfo) -> bool;
}

pub(crate) fn unix_now() -> TimePoint {
	SystemTime::now()
		.duration_since(SystemTime::UNIX_EPOCH)
		.map(|d| d.as_secs() as TimePoint)
		.unwrap_or(0)
}

// A tismet database: the storage engine facade. Every mutation routes
// through the WAL; every read goes through the page cache.
pub struct Db {
	data: Arc<DbData>,
	runner: Arc<TaskRunner>,
	timers: Mutex<Vec<ScheduledTaskHandle>>,
	timer_config: Mutex<TimerConfig>,
}

assert_impl_all!(Db: Send, Sync);

#[derive(Debug, Clone)]
struct TimerConfig {
	scan_interval: Duration,
	checkpoint_interval: Duration,
}

impl Db {
	pub fn open(
		dir: impl AsRef<Path>,
		page_size: Option<usize>,
		flags: DbOpenFlags,
	) -> Result<Self, DbError> {
		let dir = DatabaseDir::open(dir.as_ref().to_path_buf());
		let data_path = dir.data_file_path();
		let fresh = !data_path.exists();
		if fresh && !flags.create {
			return Err(FileError::Io(std::io::Error::new(
				std::io::ErrorKind::NotFound,
				format!("No database at {}", data_path.display()),
			))
			.into());
		}

		let data_file = if fresh {
			dir.create_dirs()?;
			// A WAL left behind by a deleted data file is meaningless.
			let _ = std::fs::remove_file(dir.wal_file_path());
			DataFile::create(
				&data_path,
				page_size.unwrap_or(crate::consts::DEFAULT_PAGE_SIZE),
			)?
		} else {
			DataFile::open(&data_path, page_size)?
		};
		let page_size = data_file.page_size();

		let cache = Arc::new(PageCache::new(
			Arc::new(data_file),
			PageCacheConfig::default(),
		));
		let wal_path = dir.wal_file_path();
		let wal_file = if wal_path.exists() {
			let wal_file = WalFile::open(&wal_path, page_size)?;
			if wal_file.data_page_size() != page_size {
				return Err(FileError::PageSizeMismatch(
					wal_file.data_page_size() as u32,
					page_size as u32,
				)
				.into());
			}
			wal_file
		} else {
			WalFile::create(&wal_path, page_size, page_size)?
		};
		let runner = Arc::new(TaskRunner::new().map_err(FileError::Io)?);
		let wal = Arc::new(Wal::new(
			wal_file,
			Arc::clone(&runner),
			Arc::clone(&cache) as _,
		));
		let data = Arc::new(DbData::new(cache, wal));

		let recovered = recovery::recover(
			data.wal(),
			&RedoApply { data: &data },
			RecoverFlags::default(),
		)?;
		if fresh {
			data.init_fresh()?;
		} else {
			data.load()?;
		}
		if flags.verbose {
			info!(
				"Opened database ({} byte pages, recovered {} records)",
				page_size, recovered.records_applied
			);
		}

		let db = Self {
			data,
			runner,
			timers: Mutex::new(Vec::new()),
			timer_config: Mutex::new(TimerConfig {
				scan_interval: PageCacheConfig::default().scan_interval,
				checkpoint_interval: WalConfig::default().max_checkpoint_interval,
			}),
		};
		db.start_timers();
		Ok(db)
	}

	fn start_timers(&self) {
		let config = self.timer_config.lock().clone();
		let mut timers = self.timers.lock();
		timers.clear();
		let wal = Arc::clone(self.data.wal());
		timers.push(
			self.runner
				.schedule(move || wal.flush_buffers(), WAL_FLUSH_INTERVAL),
		);
		let cache = Arc::clone(self.data.cache());
		timers.push(
			self.runner
				.schedule(move || cache.evict_scan(), config.scan_interval),
		);
		let wal = Arc::clone(self.data.wal());
		timers.push(
			self.runner
				.schedule(move || wal.checkpoint_if_idle(), config.checkpoint_interval),
		);
	}

	// Flushes, checkpoints and truncates; the handle is inert afterwards.
	// Dropping a Db without closing it abandons the in-memory state, which
	// recovery then rebuilds from the WAL.
	pub fn close(&self) {
		self.timers.lock().clear();
		let wal = self.data.wal();
		wal.flush_buffers();
		wal.wait_durable(wal.last_lsn());
		let _ = wal.checkpoint_blocking();
		wal.close();
		log::debug!(
			"Closed database at checkpoint lsn {}, durable lsn {}",
			wal.checkpoint_lsn(),
			wal.durable_lsn()
		);
	}

	pub fn configure(&self, conf: &DbConfig) {
		let cache = self.data.cache();
		let mut cache_config = cache.config();
		if let Some(age) = conf.page_max_age {
			cache_config.max_age = age;
		}
		if let Some(interval) = conf.page_scan_interval {
			cache_config.scan_interval = interval;
		}
		cache.configure(cache_config.clone());

		let wal = self.data.wal();
		let mut wal_config = wal.config();
		if let Some(interval) = conf.checkpoint_max_interval {
			wal_config.max_checkpoint_interval = interval;
		}
		if let Some(data) = conf.checkpoint_max_data {
			wal_config.max_checkpoint_data = data;
		}
		wal.configure(&wal_config);

		*self.timer_config.lock() = TimerConfig {
			scan_interval: cache_config.scan_interval,
			checkpoint_interval: wal_config.max_checkpoint_interval,
		};
		self.start_timers();
	}

	pub fn query_stats(&self) -> DbStats {
		use std::sync::atomic::Ordering;
		let data_file = self.data.cache().data();
		let state = self.data.state.read();
		let perf = &self.data.perf;
		DbStats {
			page_size: data_file.page_size(),
			segment_size: data_file.segment_size(),
			metric_name_size: MAX_METRIC_NAME_LEN,
			samples_per_page: samples_per_page(data_file.page_size(), SampleType::Float32),
			num_pages: data_file.num_pages(),
			free_pages: state.free_pages.len(),
			metrics: state.index.len(),
			broken: self.data.is_broken(),
			samples_added: perf.samples_added.load(Ordering::Relaxed),
			samples_old: perf.samples_old.load(Ordering::Relaxed),
			samples_dup: perf.samples_dup.load(Ordering::Relaxed),
			samples_changed: perf.samples_changed.load(Ordering::Relaxed),
			metrics_created: perf.metrics_created.load(Ordering::Relaxed),
			metrics_deleted: perf.metrics_deleted.load(Ordering::Relaxed),
		}
	}

	/************************************************************************
	 * Metrics
	 ***/

	// Returns the id and whether the metric was created; inserting an
	// existing name returns its id.
	pub fn insert_metric(&self, name: &str) -> Result<(MetricId, bool), DbError> {
		self.data
			.insert_metric(name, &MetricConfig::default(), unix_now())
	}

	pub fn insert_metric_with(
		&self,
		name: &str,
		config: &MetricConfig,
	) -> Result<(MetricId, bool), DbError> {
		self.data.insert_metric(name, config, unix_now())
	}

	pub fn erase_metric(&self, id: MetricId) -> Result<(), DbError> {
		self.data.erase_metric(id)
	}

	pub fn update_metric(&self, id: MetricId, config: &MetricConfig) -> Result<(), DbError> {
		self.data.update_metric(id, config)
	}

	pub fn find_metric(&self, name: &str) -> Option<MetricId> {
		self.data.state.read().index.find(name)
	}

	pub fn find_metrics(&self, pattern: &str) -> Vec<MetricId> {
		self.data
			.state
			.read()
			.index
			.find_metrics(pattern)
			.iter()
			.collect()
	}

	// Branches prefixing at least one metric matching the pattern.
	pub fn find_branches(&self, pattern: &str) -> Vec<MetricId> {
		self.data
			.state
			.read()
			.index
			.find_branches(pattern)
			.iter()
			.collect()
	}

	pub fn get_metric_name(&self, id: MetricId) -> Option<String> {
		let state = self.data.state.read();
		let name = state.index.name(id)?;
		(state.index.find(name) == Some(id)).then(|| name.to_string())
	}

	pub fn get_branch_name(&self, id: MetricId) -> Option<String> {
		let state = self.data.state.read();
		let name = state.index.name(id)?;
		state
			.index
			.find_branch(name)
			.map(|_| name.to_string())
	}

	pub fn get_metric_info(&self, id: MetricId) -> Result<MetricInfo, DbError> {
		let metric = self.data.metric_state(id)?;
		let state = self.data.state.read();
		Ok(MetricInfo {
			name: state.index.name(id).unwrap_or_default().to_string(),
			stype: metric.stype,
			interval: Duration::from_secs(metric.interval),
			retention: Duration::from_secs(metric.retention),
			creation: metric.creation,
		})
	}

	/************************************************************************
	 * Samples
	 ***/

	pub fn update_sample(
		&self,
		id: MetricId,
		time: TimePoint,
		value: f64,
	) -> Result<(), DbError> {
		self.data.update_sample(id, time, value)
	}

	pub fn enum_samples(
		&self,
		id: MetricId,
		first: TimePoint,
		last: TimePoint,
		notify: &mut dyn EnumNotify,
	) -> Result<usize, DbError> {
		self.data.enum_samples(id, first, last, notify)
	}

	/************************************************************************
	 * Maintenance
	 ***/

	// Backups block checkpoints so the file pair stays copyable; `ready`
	// runs once no checkpoint is in flight.
	pub fn block_checkpoint(&self, enable: bool, ready: impl FnOnce() + Send + 'static) {
		self.data.wal().block_checkpoint(enable, ready);
	}

	// Explicitly requested checkpoint; returns false when one was already
	// running or blocked.
	pub fn checkpoint(&self) -> Result<bool, DbError> {
		Ok(self.data.wal().checkpoint_blocking()?)
	}

	pub(crate) fn data(&self) -> &Arc<DbData> {
		&self.data
	}
}

#[cfg(test)]
pub(crate) mod test_helpers {
	use super::*;

	// Collects enumerated samples, optionally aborting after a limit.
	pub(crate) struct Collect {
		pub samples: Vec<(TimePoint, f64)>,
		pub limit: usize,
		pub series: usize,
		pub ended: usize,
	}

	impl Collect {
		pub fn new() -> Self {
			Self {
				samples: Vec::new(),
				limit: usize::MAX,
				series: 0,
				ended: 0,
			}
		}
	}

	impl EnumNotify for Collect {
		fn on_series_start(
			&mut self,
			_id: MetricId,
			_name: &str,
			_stype: SampleType,
			_first: TimePoint,
			_last: TimePoint,
			_interval: Duration,
		) {
			self.series += 1;
		}

		fn on_sample(&mut self, _id: MetricId, time: TimePoint, value: f64) -> bool {
			self.samples.push((time, value));
			self.samples.len() < self.limit
		}

		fn on_series_end(&mut self) {
			self.ended += 1;
		}
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;
	use tempfile::tempdir;

	use crate::store::MetricConfig;

	use super::test_helpers::Collect;
	use super::*;

	fn minute_metric(db: &Db, name: &str) -> MetricId {
		db.insert_metric_with(
			name,
			&MetricConfig {
				stype: SampleType::Float32,
				interval: Duration::from_secs(60),
				retention: Duration::from_secs(7 * 86400),
			},
		)
		.unwrap()
		.0
	}

	#[test]
	fn insert_then_read_float32() {
		let dir = tempdir().unwrap();
		let db = Db::open(dir.path(), None, DbOpenFlags { create: true, verbose: false }).unwrap();
		let id = minute_metric(&db, "a.b");

		db.update_sample(id, 1000000800, 1.0).unwrap();
		db.update_sample(id, 1000000860, 2.0).unwrap();
		db.update_sample(id, 1000000920, 3.0).unwrap();

		let mut collect = Collect::new();
		let count = db.enum_samples(id, 1000000800, 1000000920, &mut collect).unwrap();
		assert_eq!(count, 3);
		assert_eq!(
			collect.samples,
			vec![(1000000800, 1.0), (1000000860, 2.0), (1000000920, 3.0)]
		);
		assert_eq!((collect.series, collect.ended), (1, 1));
	}

	#[test]
	fn duplicate_sample_is_dropped() {
		let dir = tempdir().unwrap();
		let db = Db::open(dir.path(), None, DbOpenFlags { create: true, verbose: false }).unwrap();
		let id = minute_metric(&db, "a.b");
		db.update_sample(id, 1000000800, 1.0).unwrap();
		db.update_sample(id, 1000000860, 2.0).unwrap();
		db.update_sample(id, 1000000920, 3.0).unwrap();

		db.update_sample(id, 1000000860, 2.0).unwrap();

		assert_eq!(db.query_stats().samples_dup, 1);
		let mut collect = Collect::new();
		db.enum_samples(id, 1000000800, 1000000920, &mut collect).unwrap();
		assert_eq!(
			collect.samples,
			vec![(1000000800, 1.0), (1000000860, 2.0), (1000000920, 3.0)]
		);
	}

	#[test]
	fn old_sample_is_dropped() {
		let dir = tempdir().unwrap();
		let db = Db::open(dir.path(), None, DbOpenFlags { create: true, verbose: false }).unwrap();
		let id = minute_metric(&db, "a.b");
		db.update_sample(id, 1000000800, 1.0).unwrap();
		db.update_sample(id, 1000000860, 2.0).unwrap();
		db.update_sample(id, 1000000920, 3.0).unwrap();

		db.update_sample(id, 1000000800 - 7 * 86400 - 60, 9.0).unwrap();

		assert_eq!(db.query_stats().samples_old, 1);
		let mut collect = Collect::new();
		db.enum_samples(id, 0, 2000000000, &mut collect).unwrap();
		assert_eq!(collect.samples.len(), 3);
	}

	#[test]
	fn retention_boundary_is_kept_one_interval_older_dropped() {
		let dir = tempdir().unwrap();
		let db = Db::open(dir.path(), None, DbOpenFlags { create: true, verbose: false }).unwrap();
		let id = minute_metric(&db, "a.b");
		let newest: TimePoint = 1000000020 - 1000000020 % 60;
		db.update_sample(id, newest, 1.0).unwrap();

		let boundary = newest - 7 * 86400;
		db.update_sample(id, boundary, 2.0).unwrap();
		db.update_sample(id, boundary - 60, 3.0).unwrap();

		let stats = db.query_stats();
		assert_eq!(stats.samples_old, 1);
		assert_eq!(stats.samples_added, 2);
		let mut collect = Collect::new();
		db.enum_samples(id, boundary - 120, newest, &mut collect).unwrap();
		assert_eq!(collect.samples, vec![(boundary, 2.0), (newest, 1.0)]);
	}

	#[test]
	fn crash_replay_restores_samples() {
		let dir = tempdir().unwrap();
		{
			let db =
				Db::open(dir.path(), None, DbOpenFlags { create: true, verbose: false }).unwrap();
			let id = minute_metric(&db, "a.b");
			db.update_sample(id, 1000000800, 1.0).unwrap();
			db.update_sample(id, 1000000860, 2.0).unwrap();
			db.update_sample(id, 1000000920, 3.0).unwrap();
			// Make the WAL durable, then drop without a clean close: the
			// data pages were never flushed.
			let wal = db.data().wal();
			wal.wait_durable(wal.last_lsn());
		}

		let db = Db::open(dir.path(), None, DbOpenFlags::default()).unwrap();
		let id = db.find_metric("a.b").unwrap();
		let mut collect = Collect::new();
		db.enum_samples(id, 1000000800, 1000000920, &mut collect).unwrap();
		assert_eq!(
			collect.samples,
			vec![(1000000800, 1.0), (1000000860, 2.0), (1000000920, 3.0)]
		);
	}

	#[test]
	fn clean_close_then_reopen() {
		let dir = tempdir().unwrap();
		{
			let db =
				Db::open(dir.path(), None, DbOpenFlags { create: true, verbose: false }).unwrap();
			let id = minute_metric(&db, "a.b");
			db.update_sample(id, 1000000800, 1.0).unwrap();
			db.close();
		}

		let db = Db::open(dir.path(), None, DbOpenFlags::default()).unwrap();
		let id = db.find_metric("a.b").unwrap();
		let mut collect = Collect::new();
		db.enum_samples(id, 0, 2000000000, &mut collect).unwrap();
		assert_eq!(collect.samples, vec![(1000000800, 1.0)]);
		assert_eq!(db.get_metric_name(id), Some("a.b".to_string()));
	}

	#[test]
	fn open_without_create_fails_on_missing_db() {
		let dir = tempdir().unwrap();

		let result = Db::open(dir.path(), None, DbOpenFlags::default());

		assert!(result.is_err());
	}

	#[test]
	fn open_with_wrong_page_size_fails() {
		let dir = tempdir().unwrap();
		Db::open(dir.path(), Some(4096), DbOpenFlags { create: true, verbose: false })
			.unwrap()
			.close();

		let result = Db::open(dir.path(), Some(8192), DbOpenFlags::default());

		assert!(matches!(
			result,
			Err(DbError::File(FileError::PageSizeMismatch(4096, 8192)))
		));
	}

	#[test]
	fn wildcard_match() {
		let dir = tempdir().unwrap();
		let db = Db::open(dir.path(), None, DbOpenFlags { create: true, verbose: false }).unwrap();
		let red1 = db.insert_metric("a.red.1").unwrap().0;
		let _red2 = db.insert_metric("a.red.2").unwrap().0;
		let blue1 = db.insert_metric("a.blue.1").unwrap().0;

		let mut found = db.find_metrics("a.*.1");
		found.sort_unstable();
		let mut expected = vec![red1, blue1];
		expected.sort_unstable();
		assert_eq!(found, expected);
	}

	#[test]
	fn name_index_consistency_across_erase() {
		let dir = tempdir().unwrap();
		let db = Db::open(dir.path(), None, DbOpenFlags { create: true, verbose: false }).unwrap();

		let (id, created) = db.insert_metric("x.y").unwrap();
		assert!(created);
		assert_eq!(db.insert_metric("x.y").unwrap(), (id, false));
		assert_eq!(db.find_metric("x.y"), Some(id));
		assert_eq!(db.get_metric_name(id), Some("x.y".to_string()));

		db.erase_metric(id).unwrap();
		assert_eq!(db.find_metric("x.y"), None);
		assert_eq!(db.get_metric_name(id), None);
	}

	#[test]
	fn erase_metric_returns_its_pages() {
		let dir = tempdir().unwrap();
		let db = Db::open(dir.path(), None, DbOpenFlags { create: true, verbose: false }).unwrap();
		let free_before = db.query_stats().free_pages;
		let id = minute_metric(&db, "a.b");
		for n in 0..3000 {
			db.update_sample(id, 1000000800 + n * 60, n as f64).unwrap();
		}
		assert!(db.query_stats().free_pages < free_before);

		db.erase_metric(id).unwrap();

		assert_eq!(db.query_stats().free_pages, free_before);
	}

	#[test]
	fn metric_name_length_bounds() {
		let dir = tempdir().unwrap();
		let db = Db::open(dir.path(), None, DbOpenFlags { create: true, verbose: false }).unwrap();

		let ok = "a".repeat(MAX_METRIC_NAME_LEN - 1);
		assert!(db.insert_metric(&ok).is_ok());

		let too_long = "a".repeat(MAX_METRIC_NAME_LEN);
		assert!(matches!(
			db.insert_metric(&too_long),
			Err(DbError::InvalidMetricName(..))
		));
		assert!(matches!(
			db.insert_metric("bad name"),
			Err(DbError::InvalidMetricName(..))
		));
		assert!(matches!(
			db.insert_metric("trailing."),
			Err(DbError::InvalidMetricName(..))
		));
	}

	#[test]
	fn incompatible_update_clears_samples() {
		let dir = tempdir().unwrap();
		let db = Db::open(dir.path(), None, DbOpenFlags { create: true, verbose: false }).unwrap();
		let id = minute_metric(&db, "a.b");
		db.update_sample(id, 1000000800, 1.0).unwrap();

		db.update_metric(
			id,
			&MetricConfig {
				stype: SampleType::Float32,
				interval: Duration::from_secs(10),
				retention: Duration::from_secs(86400),
			},
		)
		.unwrap();

		let mut collect = Collect::new();
		let count = db.enum_samples(id, 0, 2000000000, &mut collect).unwrap();
		assert_eq!(count, 0);
		let info = db.get_metric_info(id).unwrap();
		assert_eq!(info.interval, Duration::from_secs(10));

		// A retention-only change keeps the data.
		db.update_sample(id, 1000000800, 1.0).unwrap();
		db.update_metric(
			id,
			&MetricConfig {
				stype: SampleType::Float32,
				interval: Duration::from_secs(10),
				retention: Duration::from_secs(2 * 86400),
			},
		)
		.unwrap();
		let mut collect = Collect::new();
		assert_eq!(db.enum_samples(id, 0, 2000000000, &mut collect).unwrap(), 1);
	}

	#[test]
	fn enum_aborts_on_false() {
		let dir = tempdir().unwrap();
		let db = Db::open(dir.path(), None, DbOpenFlags { create: true, verbose: false }).unwrap();
		let id = minute_metric(&db, "a.b");
		for n in 0..10 {
			db.update_sample(id, 1000000800 + n * 60, n as f64).unwrap();
		}

		let mut collect = Collect::new();
		collect.limit = 4;
		let count = db.enum_samples(id, 0, 2000000000, &mut collect).unwrap();

		assert_eq!(count, 4);
		assert_eq!(collect.samples.len(), 4);
		assert_eq!(collect.ended, 1);
	}

	#[test]
	fn samples_ring_across_pages() {
		let dir = tempdir().unwrap();
		let db = Db::open(dir.path(), None, DbOpenFlags { create: true, verbose: false }).unwrap();
		// Small retention so the ring recycles quickly: 1014 samples per
		// page, retention of two pages' worth.
		let id = db
			.insert_metric_with(
				"ring.m",
				&MetricConfig {
					stype: SampleType::Float32,
					interval: Duration::from_secs(1),
					retention: Duration::from_secs(2000),
				},
			)
			.unwrap()
			.0;

		let pages_before = db.query_stats().free_pages;
		for t in 0..6000_i64 {
			db.update_sample(id, t, t as f64).unwrap();
		}

		// Old pages were recycled: the metric holds at most three pages.
		let used = pages_before - db.query_stats().free_pages;
		assert!(used <= 4, "{used} pages still allocated");

		let mut collect = Collect::new();
		db.enum_samples(id, 0, 6000, &mut collect).unwrap();
		assert_eq!(collect.samples.last(), Some(&(5999, 5999.0)));
		assert!(collect.samples.first().unwrap().0 >= 5999 - 2000);
		// Contiguous coverage inside the window.
		assert_eq!(
			collect.samples.len() as i64,
			5999 - collect.samples.first().unwrap().0 + 1
		);
	}

	#[test]
	fn historical_backfill_and_overwrite() {
		let dir = tempdir().unwrap();
		let db = Db::open(dir.path(), None, DbOpenFlags { create: true, verbose: false }).unwrap();
		let id = db
			.insert_metric_with(
				"hist.m",
				&MetricConfig {
					stype: SampleType::Float32,
					interval: Duration::from_secs(1),
					retention: Duration::from_secs(100000),
				},
			)
			.unwrap()
			.0;

		// Newest first, then backfill a slot three pages earlier.
		db.update_sample(id, 50000, 5.0).unwrap();
		db.update_sample(id, 10000, 1.0).unwrap();
		// Overwrite it (last writer wins), then write the same value again.
		db.update_sample(id, 10000, 2.0).unwrap();
		db.update_sample(id, 10000, 2.0).unwrap();

		let stats = db.query_stats();
		assert_eq!(stats.samples_changed, 1);
		assert_eq!(stats.samples_dup, 1);
		let mut collect = Collect::new();
		db.enum_samples(id, 0, 60000, &mut collect).unwrap();
		assert_eq!(collect.samples, vec![(10000, 2.0), (50000, 5.0)]);
	}

	#[test]
	fn checkpoint_truncates_wal_prefix() {
		let dir = tempdir().unwrap();
		let db = Db::open(dir.path(), None, DbOpenFlags { create: true, verbose: false }).unwrap();
		let id = db
			.insert_metric_with(
				"cp.m",
				&MetricConfig {
					stype: SampleType::Float32,
					interval: Duration::from_secs(1),
					retention: Duration::from_secs(1000000),
				},
			)
			.unwrap()
			.0;
		for t in 0..5000_i64 {
			db.update_sample(id, t, 1.0).unwrap();
		}

		assert!(db.checkpoint().unwrap());

		// Truncation is page-granular: everything before the page holding
		// the checkpoint's start lsn is free-listed, so only a short tail of
		// log pages survives.
		let wal = db.data().wal();
		let start_lsn = wal.checkpoint_lsn();
		assert!(start_lsn > 0);
		let file = wal.file();
		let mut live_pages = 0;
		let mut buf = vec![0; file.page_size()];
		for pgno in 1..file.num_pages().unwrap() {
			file.read_page(pgno, &mut buf).unwrap();
			use crate::repr::PageRepr as _;
			let Ok(header) = crate::files::wal::WalPageHeaderRepr::read_from(&buf) else {
				continue;
			};
			if header.ptype == crate::files::wal::WalPageType::Log {
				live_pages += 1;
				// No surviving page lies wholly before the checkpoint.
				let payload = (file.page_size() - crate::files::wal::WAL_PAGE_HDR_SIZE) as u64;
				assert!(header.first_lsn + payload >= start_lsn);
			}
		}
		assert!(live_pages >= 1);
		assert!(live_pages <= 3, "{live_pages} log pages survived");
	}

	#[test]
	fn checkpoint_with_no_dirty_pages_still_advances() {
		let dir = tempdir().unwrap();
		let db = Db::open(dir.path(), None, DbOpenFlags { create: true, verbose: false }).unwrap();
		assert!(db.checkpoint().unwrap());
		let first = db.data().wal().checkpoint_lsn();

		let id = minute_metric(&db, "a.b");
		db.update_sample(id, 1000000800, 1.0).unwrap();
		assert!(db.checkpoint().unwrap());
		// No new writes: the second checkpoint still advances the start lsn.
		assert!(db.checkpoint().unwrap());

		assert!(db.data().wal().checkpoint_lsn() > first);
	}

	#[test]
	fn checkpoint_triggers_on_logged_bytes() {
		let dir = tempdir().unwrap();
		let db = Db::open(dir.path(), None, DbOpenFlags { create: true, verbose: false }).unwrap();
		db.configure(&DbConfig {
			checkpoint_max_data: Some(64 * 1024),
			..DbConfig::default()
		});
		let id = db
			.insert_metric_with(
				"trig.m",
				&MetricConfig {
					stype: SampleType::Float32,
					interval: Duration::from_secs(1),
					retention: Duration::from_secs(1000000),
				},
			)
			.unwrap()
			.0;

		// Roughly twice the threshold in record bytes.
		for t in 0..8000_i64 {
			db.update_sample(id, t, 1.0).unwrap();
		}

		let deadline = std::time::Instant::now() + Duration::from_secs(30);
		while db.data().wal().checkpoint_lsn() == 0 {
			assert!(
				std::time::Instant::now() < deadline,
				"No checkpoint completed within the deadline"
			);
			std::thread::sleep(Duration::from_millis(20));
		}
	}

	#[test]
	fn branches_and_branch_names() {
		let dir = tempdir().unwrap();
		let db = Db::open(dir.path(), None, DbOpenFlags { create: true, verbose: false }).unwrap();
		db.insert_metric("a.red.1").unwrap();
		db.insert_metric("a.blue.1").unwrap();

		let branches = db.find_branches("a.*.1");
		let mut names: Vec<String> = branches
			.iter()
			.filter_map(|id| db.get_branch_name(*id))
			.collect();
		names.sort_unstable();
		assert_eq!(names, vec!["a", "a.blue", "a.red"]);
	}
}
