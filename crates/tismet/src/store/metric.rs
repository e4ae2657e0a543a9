use std::time::Duration;

use log::warn;

use crate::{
	consts::{DEFAULT_INTERVAL, DEFAULT_RETENTION, MAX_METRIC_NAME_LEN, METRIC_INDEX_ROOT_PGNO},
	db::EnumNotify,
	pages::{samples_per_page, SamplePage, SampleType, NO_PAGE},
	radix::{self, CacheSource},
	store::{apply::sample_type_of, DbData, DbError, DbPerf, MetricState},
	wal::records::Record,
	MetricId, TimePoint,
};

// Creation-time and reconfiguration parameters of a metric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricConfig {
	pub stype: SampleType,
	pub interval: Duration,
	pub retention: Duration,
}

impl Default for MetricConfig {
	fn default() -> Self {
		Self {
			stype: SampleType::Float32,
			interval: DEFAULT_INTERVAL,
			retention: DEFAULT_RETENTION,
		}
	}
}

// ASCII names, dot-separated non-empty segments, bounded length including
// the on-page NUL terminator.
pub(crate) fn valid_metric_name(name: &str) -> bool {
	if name.is_empty() || name.len() > MAX_METRIC_NAME_LEN - 1 {
		return false;
	}
	name.split('.').all(|segment| {
		!segment.is_empty()
			&& segment.bytes().all(|b| {
				b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'+' | b':' | b'=' | b'#' | b'@')
			})
	})
}

impl DbData {
	/************************************************************************
	 * Metric lifecycle
	 ***/

	// Returns the id and whether the metric was created; an existing name
	// returns its id unchanged.
	pub fn insert_metric(
		&self,
		name: &str,
		config: &MetricConfig,
		now: TimePoint,
	) -> Result<(MetricId, bool), DbError> {
		self.check_writable()?;
		if !valid_metric_name(name) {
			return Err(DbError::InvalidMetricName(name.to_string()));
		}
		let mut state = self.state.write();
		if let Some(id) = state.index.find(name) {
			return Ok((id, false));
		}
		// A name that already exists as a pure branch keeps its id.
		let id = state.index.id_for_insert(name);
		let interval_secs = config.interval.as_secs().max(1);
		let retention_secs = config.retention.as_secs().max(interval_secs);

		let mut txn = self.begin();
		let pgno = txn.alloc_pgno(&mut state)?;
		txn.wal_and_apply(Record::MetricInit {
			pgno,
			id,
			stype: config.stype,
			interval_secs,
			retention_secs,
			creation: now,
			name: name.to_string(),
		})?;
		radix::insert(&mut txn, &mut state, METRIC_INDEX_ROOT_PGNO, 0, u64::from(id), pgno)?;
		txn.commit();

		state.metrics.insert(
			id,
			MetricState {
				info_page: pgno,
				stype: config.stype,
				interval: interval_secs,
				retention: retention_secs,
				creation: now,
				last_page: NO_PAGE,
				last_page_index: 0,
				page_first_time: 0,
				last_sample: 0,
			},
		);
		state.index.insert_metric(id, name);
		DbPerf::bump(&self.perf.metrics_created);
		Ok((id, true))
	}

	// Frees every sample page, the descriptor and the index slot, and
	// returns the id to the reusable pool.
	pub fn erase_metric(&self, id: MetricId) -> Result<(), DbError> {
		self.check_writable()?;
		let mut state = self.state.write();
		let metric = state
			.metrics
			.get(&id)
			.cloned()
			.ok_or(DbError::UnknownMetric(id))?;

		let mut txn = self.begin();
		radix::clear(&mut txn, &mut state, metric.info_page)?;
		// Erasing the index slot frees the descriptor page itself.
		radix::erase(
			&mut txn,
			&mut state,
			METRIC_INDEX_ROOT_PGNO,
			u64::from(id),
			u64::from(id),
		)?;
		txn.commit();

		state.metrics.remove(&id);
		state.index.erase_metric(id);
		DbPerf::bump(&self.perf.metrics_deleted);
		Ok(())
	}

	// Changing the sample type or interval invalidates every stored sample;
	// those reconfigurations clear the metric first.
	pub fn update_metric(&self, id: MetricId, config: &MetricConfig) -> Result<(), DbError> {
		self.check_writable()?;
		let mut state = self.state.write();
		let metric = state
			.metrics
			.get(&id)
			.cloned()
			.ok_or(DbError::UnknownMetric(id))?;
		let interval_secs = config.interval.as_secs().max(1);
		let retention_secs = config.retention.as_secs().max(interval_secs);
		let incompatible =
			config.stype != metric.stype || interval_secs != metric.interval;

		let mut txn = self.begin();
		if incompatible && metric.last_page != NO_PAGE {
			radix::clear(&mut txn, &mut state, metric.info_page)?;
			txn.wal_and_apply(Record::MetricClearSamples {
				pgno: metric.info_page,
			})?;
		}
		txn.wal_and_apply(Record::MetricUpdate {
			pgno: metric.info_page,
			stype: config.stype,
			interval_secs,
			retention_secs,
		})?;
		txn.commit();

		let entry = state.metrics.get_mut(&id).expect("Checked above");
		entry.stype = config.stype;
		entry.interval = interval_secs;
		entry.retention = retention_secs;
		if incompatible {
			entry.last_page = NO_PAGE;
			entry.last_page_index = 0;
			entry.page_first_time = 0;
			entry.last_sample = 0;
		}
		Ok(())
	}

	pub fn metric_state(&self, id: MetricId) -> Result<MetricState, DbError> {
		self.state
			.read()
			.metrics
			.get(&id)
			.cloned()
			.ok_or(DbError::UnknownMetric(id))
	}

	/************************************************************************
	 * Sample writes
	 ***/

	pub fn update_sample(&self, id: MetricId, time: TimePoint, value: f64) -> Result<(), DbError> {
		self.check_writable()?;
		let mut state = self.state.write();
		let metric = state
			.metrics
			.get(&id)
			.cloned()
			.ok_or(DbError::UnknownMetric(id))?;
		let interval = metric.interval as i64;
		let time = time - time.rem_euclid(interval);
		if time < 0 {
			DbPerf::bump(&self.perf.samples_old);
			return Ok(());
		}
		let spp = samples_per_page(self.page_size(), metric.stype) as i64;
		let slot = time / interval;
		let page_index = (slot / spp) as u32;
		let offset = (slot % spp) as u16;
		let page_time = i64::from(page_index) * spp * interval;

		// First sample of the metric.
		if metric.last_page == NO_PAGE {
			let mut txn = self.begin();
			let pgno = txn.alloc_pgno(&mut state)?;
			txn.wal_and_apply(Record::SampleInitFill {
				pgno,
				id,
				stype: metric.stype,
				page_time,
				last_sample: offset,
				value,
			})?;
			radix::insert(
				&mut txn,
				&mut state,
				metric.info_page,
				id,
				u64::from(page_index),
				pgno,
			)?;
			txn.wal_and_apply(Record::MetricUpdatePos {
				pgno: metric.info_page,
				last_page: pgno,
				last_page_pos: page_index,
				last_page_first_time: page_time,
				last_page_sample: offset,
			})?;
			txn.commit();
			let entry = state.metrics.get_mut(&id).expect("Checked above");
			entry.last_page = pgno;
			entry.last_page_index = page_index;
			entry.page_first_time = page_time;
			entry.last_sample = offset;
			DbPerf::bump(&self.perf.samples_added);
			return Ok(());
		}

		let last_time = metric.page_first_time + i64::from(metric.last_sample) * interval;

		// Writes older than the retention window measured from the most
		// recent sample are silently dropped; the boundary itself is kept.
		if time < last_time - metric.retention as i64 {
			DbPerf::bump(&self.perf.samples_old);
			return Ok(());
		}

		if time > last_time {
			if page_index == metric.last_page_index {
				self.append_on_last_page(&mut state, id, &metric, offset, value)?;
			} else {
				self.advance_to_new_page(
					&mut state,
					id,
					&metric,
					page_index,
					page_time,
					offset,
					value,
					spp,
					time,
				)?;
			}
			DbPerf::bump(&self.perf.samples_added);
			return Ok(());
		}

		// Overwrite of an existing slot, on the last page or a historical
		// one.
		let pgno = if page_index == metric.last_page_index {
			Some(metric.last_page)
		} else {
			radix::find(
				&mut CacheSource(self),
				metric.info_page,
				u64::from(page_index),
			)?
		};
		match pgno {
			Some(pgno) => self.overwrite_sample(id, &metric, pgno, offset, value),
			None => self.backfill_page(&mut state, id, &metric, page_index, page_time, offset, value),
		}
	}

	// Appending within the current last page: NaN-fill any gap and advance
	// the last-sample position.
	fn append_on_last_page(
		&self,
		state: &mut super::StoreState,
		id: MetricId,
		metric: &MetricState,
		offset: u16,
		value: f64,
	) -> Result<(), DbError> {
		if offset == metric.last_sample + 1 {
			self.apply_implicit(&Record::SampleTxn {
				pgno: metric.last_page,
				stype: metric.stype,
				pos: offset,
				value,
				update_last: true,
			})?;
		} else {
			let mut txn = self.begin();
			txn.wal_and_apply(Record::SampleUpdate {
				pgno: metric.last_page,
				first: metric.last_sample + 1,
				last: offset,
				value,
				update_last: true,
			})?;
			txn.commit();
		}
		state.metrics.get_mut(&id).expect("Present").last_sample = offset;
		Ok(())
	}

	// The write moved past the current page: close out its tail, allocate
	// the new last page and recycle pages that fell out of retention.
	#[allow(clippy::too_many_arguments)]
	fn advance_to_new_page(
		&self,
		state: &mut super::StoreState,
		id: MetricId,
		metric: &MetricState,
		page_index: u32,
		page_time: TimePoint,
		offset: u16,
		value: f64,
		spp: i64,
		time: TimePoint,
	) -> Result<(), DbError> {
		let interval = metric.interval as i64;
		let mut txn = self.begin();
		if i64::from(metric.last_sample) + 1 < spp {
			txn.wal_and_apply(Record::SampleUpdate {
				pgno: metric.last_page,
				first: metric.last_sample + 1,
				last: spp as u16 - 1,
				value: f64::NAN,
				update_last: false,
			})?;
		}

		let pgno = txn.alloc_pgno(state)?;
		txn.wal_and_apply(Record::SampleInitFill {
			pgno,
			id,
			stype: metric.stype,
			page_time,
			last_sample: offset,
			value,
		})?;
		radix::insert(&mut txn, state, metric.info_page, id, u64::from(page_index), pgno)?;
		txn.wal_and_apply(Record::MetricUpdatePos {
			pgno: metric.info_page,
			last_page: pgno,
			last_page_pos: page_index,
			last_page_first_time: page_time,
			last_page_sample: offset,
		})?;

		// Pages whose entire time range is now beyond retention go back to
		// the free pool.
		let last_time = metric.page_first_time + i64::from(metric.last_sample) * interval;
		let oldest_keep = page_index_of(time - metric.retention as i64, interval, spp);
		let prev_oldest = page_index_of(last_time - metric.retention as i64, interval, spp);
		if oldest_keep > prev_oldest {
			radix::erase(
				&mut txn,
				state,
				metric.info_page,
				prev_oldest,
				oldest_keep - 1,
			)?;
		}
		txn.commit();

		let entry = state.metrics.get_mut(&id).expect("Present");
		entry.last_page = pgno;
		entry.last_page_index = page_index;
		entry.page_first_time = page_time;
		entry.last_sample = offset;
		Ok(())
	}

	// Overwrite in place, with duplicate and no-change detection.
	fn overwrite_sample(
		&self,
		_id: MetricId,
		metric: &MetricState,
		pgno: u32,
		offset: u16,
		value: f64,
	) -> Result<(), DbError> {
		let stored = {
			let page = self.cache().read(pgno)?;
			SamplePage::sample(&page, sample_type_of(&page)?, offset as usize)
		};
		let canon = canonical_value(metric.stype, value);
		if stored == canon || (stored.is_nan() && canon.is_nan()) {
			DbPerf::bump(&self.perf.samples_dup);
			return Ok(());
		}
		if stored.is_nan() {
			DbPerf::bump(&self.perf.samples_added);
		} else {
			DbPerf::bump(&self.perf.samples_changed);
		}
		self.apply_implicit(&Record::SampleTxn {
			pgno,
			stype: metric.stype,
			pos: offset,
			value,
			update_last: false,
		})?;
		Ok(())
	}

	// A historical write whose page is no longer (or not yet) indexed gets a
	// fresh page.
	fn backfill_page(
		&self,
		state: &mut super::StoreState,
		id: MetricId,
		metric: &MetricState,
		page_index: u32,
		page_time: TimePoint,
		offset: u16,
		value: f64,
	) -> Result<(), DbError> {
		let mut txn = self.begin();
		let pgno = txn.alloc_pgno(state)?;
		txn.wal_and_apply(Record::SampleInitFill {
			pgno,
			id,
			stype: metric.stype,
			page_time,
			last_sample: offset,
			value,
		})?;
		radix::insert(&mut txn, state, metric.info_page, id, u64::from(page_index), pgno)?;
		txn.commit();
		DbPerf::bump(&self.perf.samples_added);
		Ok(())
	}

	/************************************************************************
	 * Enumeration
	 ***/

	// Pushes every stored sample in [first, last] to the notify callbacks in
	// time order; missing pages and NaN slots are skipped silently. Returns
	// the number of samples delivered.
	pub fn enum_samples(
		&self,
		id: MetricId,
		first: TimePoint,
		last: TimePoint,
		notify: &mut dyn EnumNotify,
	) -> Result<usize, DbError> {
		let (metric, name) = {
			let state = self.state.read();
			let metric = state
				.metrics
				.get(&id)
				.cloned()
				.ok_or(DbError::UnknownMetric(id))?;
			let name = state.index.name(id).unwrap_or_default().to_string();
			(metric, name)
		};
		let interval = metric.interval as i64;
		notify.on_series_start(
			id,
			&name,
			metric.stype,
			first,
			last,
			Duration::from_secs(metric.interval),
		);
		if metric.last_page == NO_PAGE {
			notify.on_series_end();
			return Ok(0);
		}
		let spp = samples_per_page(self.page_size(), metric.stype) as i64;
		let last_time = metric.page_first_time + i64::from(metric.last_sample) * interval;

		// Clamp to what can exist: nothing newer than the most recent sample
		// and nothing older than its retention window.
		let first = first.max(last_time - metric.retention as i64).max(0);
		let last = last.min(last_time);
		if first > last {
			notify.on_series_end();
			return Ok(0);
		}
		let first_slot = first.div_euclid(interval) + i64::from(first.rem_euclid(interval) != 0);
		let last_slot = last.div_euclid(interval);
		let first_index = (first_slot / spp) as u32;
		let last_index = (last_slot / spp) as u32;

		let mut count = 0;
		for page_index in first_index..=last_index {
			let Some(pgno) = radix::find(
				&mut CacheSource(self),
				metric.info_page,
				u64::from(page_index),
			)?
			else {
				continue;
			};
			let page = self.cache().read(pgno)?;
			let header = SamplePage::view(&page);
			let expected_time = i64::from(page_index) * spp * interval;
			if header.page_first_time != expected_time {
				warn!(
					"Metric {id} page {pgno} carries time {} instead of {expected_time}; skipped",
					header.page_first_time
				);
				continue;
			}
			let stype = sample_type_of(&page)?;
			let end_pos = if pgno == metric.last_page {
				i64::from(metric.last_sample)
			} else {
				spp - 1
			};
			for pos in 0..=end_pos {
				let t = expected_time + pos * interval;
				if t < first || t > last {
					continue;
				}
				let v = SamplePage::sample(&page, stype, pos as usize);
				if v.is_nan() {
					continue;
				}
				count += 1;
				if !notify.on_sample(id, t, v) {
					notify.on_series_end();
					return Ok(count);
				}
			}
		}
		notify.on_series_end();
		Ok(count)
	}
}

fn canonical_value(stype: SampleType, value: f64) -> f64 {
	match stype {
		SampleType::Float32 => f64::from(value as f32),
		SampleType::Float64 => value,
		SampleType::Int8 => {
			if value.is_nan() {
				f64::NAN
			} else {
				f64::from(value as i8)
			}
		}
		SampleType::Int16 => {
			if value.is_nan() {
				f64::NAN
			} else {
				f64::from(value as i16)
			}
		}
		SampleType::Int32 => {
			if value.is_nan() {
				f64::NAN
			} else {
				f64::from(value as i32)
			}
		}
	}
}

// Index of the first page whose range could still hold live samples at
// `cutoff`; pages strictly before it are wholly expired.
fn page_index_of(cutoff: TimePoint, interval: i64, spp: i64) -> u64 {
	if cutoff <= 0 {
		return 0;
	}
	(cutoff / (interval * spp)) as u64
}
