use std::io::{BufRead, Write};

use log::warn;

use crate::{
	db::{unix_now, Db, EnumNotify, ProgressInfo, ProgressNotify},
	files::FileError,
	store::DbError,
	MetricId, TimePoint,
};

// Text dump format, shared with the import/export tooling: a version line,
// then one `<name> <value> <epoch-seconds>` line per sample. A timestamp of
// -1 means "now" on load.
pub(crate) const DUMP_VERSION_LINE: &str = "Tismet Dump Version 2017.1";

struct DumpSeries<'a> {
	out: &'a mut dyn Write,
	name: String,
	info: &'a mut ProgressInfo,
	failed: Option<std::io::Error>,
}

impl EnumNotify for DumpSeries<'_> {
	fn on_sample(&mut self, _id: MetricId, time: TimePoint, value: f64) -> bool {
		let line = format!("{} {} {}\n", self.name, value, time);
		if let Err(err) = self.out.write_all(line.as_bytes()) {
			self.failed = Some(err);
			return false;
		}
		self.info.samples += 1;
		self.info.bytes += line.len();
		true
	}
}

impl Db {
	// Writes every sample of every metric matching `pattern` (all metrics
	// when empty), in name order.
	pub fn write_dump(
		&self,
		out: &mut dyn Write,
		pattern: &str,
		mut notify: Option<&mut dyn ProgressNotify>,
	) -> Result<ProgressInfo, DbError> {
		let mut info = ProgressInfo::default();
		writeln!(out, "{DUMP_VERSION_LINE}").map_err(FileError::from)?;
		info.bytes += DUMP_VERSION_LINE.len() + 1;

		let mut metrics: Vec<(String, MetricId)> = self
			.find_metrics(pattern)
			.into_iter()
			.filter_map(|id| Some((self.get_metric_name(id)?, id)))
			.collect();
		metrics.sort();

		for (name, id) in metrics {
			let mut series = DumpSeries {
				out: &mut *out,
				name,
				info: &mut info,
				failed: None,
			};
			self.enum_samples(id, 0, TimePoint::MAX, &mut series)?;
			if let Some(err) = series.failed {
				return Err(FileError::from(err).into());
			}
			info.metrics += 1;
			if let Some(notify) = notify.as_deref_mut() {
				if !notify.on_progress(false, &info) {
					return Ok(info);
				}
			}
		}
		if let Some(notify) = notify.as_deref_mut() {
			notify.on_progress(true, &info);
		}
		Ok(info)
	}

	// Reads a dump back in, creating metrics as needed. Malformed lines are
	// skipped with a warning; a missing version header fails the load.
	pub fn load_dump(
		&self,
		input: &mut dyn BufRead,
		mut notify: Option<&mut dyn ProgressNotify>,
	) -> Result<ProgressInfo, DbError> {
		let mut info = ProgressInfo::default();
		let mut line = String::new();
		input.read_line(&mut line).map_err(FileError::from)?;
		if line.trim_end() != DUMP_VERSION_LINE {
			return Err(FileError::Corrupted(
				"Not a tismet dump: missing version header".to_string(),
			)
			.into());
		}
		info.bytes += line.len();

		let mut seen = std::collections::HashSet::new();
		loop {
			line.clear();
			if input.read_line(&mut line).map_err(FileError::from)? == 0 {
				break;
			}
			info.bytes += line.len();
			let text = line.trim_end();
			if text.is_empty() {
				continue;
			}
			let mut fields = text.split_whitespace();
			let parsed = (|| {
				let name = fields.next()?;
				let value: f64 = fields.next()?.parse().ok()?;
				let time: TimePoint = fields.next()?.parse().ok()?;
				fields.next().is_none().then_some((name, value, time))
			})();
			let Some((name, value, time)) = parsed else {
				warn!("Skipping malformed dump line: {text}");
				continue;
			};
			let time = if time == -1 { unix_now() } else { time };
			let (id, _) = self.insert_metric(name)?;
			if seen.insert(id) {
				info.metrics += 1;
			}
			self.update_sample(id, time, value)?;
			info.samples += 1;
			if info.samples % 1024 == 0 {
				if let Some(notify) = notify.as_deref_mut() {
					if !notify.on_progress(false, &info) {
						return Ok(info);
					}
				}
			}
		}
		if let Some(notify) = notify.as_deref_mut() {
			notify.on_progress(true, &info);
		}
		Ok(info)
	}
}

#[cfg(test)]
mod tests {
	use std::io::Cursor;

	use pretty_assertions::assert_eq;
	use tempfile::tempdir;

	use crate::db::DbOpenFlags;

	use super::*;

	fn open_db(dir: &std::path::Path) -> Db {
		Db::open(
			dir,
			None,
			DbOpenFlags {
				create: true,
				verbose: false,
			},
		)
		.unwrap()
	}

	#[test]
	fn dump_then_load_roundtrip() {
		let dir_a = tempdir().unwrap();
		let db_a = open_db(dir_a.path());
		let a = db_a.insert_metric("dump.a").unwrap().0;
		let b = db_a.insert_metric("dump.b").unwrap().0;
		db_a.update_sample(a, 1000000800, 1.5).unwrap();
		db_a.update_sample(a, 1000000860, 2.5).unwrap();
		db_a.update_sample(b, 1000000800, -3.0).unwrap();

		let mut text = Vec::new();
		let info = db_a.write_dump(&mut text, "", None).unwrap();
		assert_eq!(info.metrics, 2);
		assert_eq!(info.samples, 3);

		let dir_b = tempdir().unwrap();
		let db_b = open_db(dir_b.path());
		let loaded = db_b.load_dump(&mut Cursor::new(&text), None).unwrap();
		assert_eq!(loaded.samples, 3);

		let id = db_b.find_metric("dump.a").unwrap();
		let mut collect = crate::db::test_helpers::Collect::new();
		db_b.enum_samples(id, 0, 2000000000, &mut collect).unwrap();
		assert_eq!(collect.samples, vec![(1000000800, 1.5), (1000000860, 2.5)]);
	}

	#[test]
	fn dump_header_and_line_format() {
		let dir = tempdir().unwrap();
		let db = open_db(dir.path());
		let id = db.insert_metric("fmt.m").unwrap().0;
		db.update_sample(id, 1000000800, 2.0).unwrap();

		let mut text = Vec::new();
		db.write_dump(&mut text, "", None).unwrap();

		let text = String::from_utf8(text).unwrap();
		let mut lines = text.lines();
		assert_eq!(lines.next(), Some("Tismet Dump Version 2017.1"));
		assert_eq!(lines.next(), Some("fmt.m 2 1000000800"));
		assert_eq!(lines.next(), None);
	}

	#[test]
	fn dump_filters_by_pattern() {
		let dir = tempdir().unwrap();
		let db = open_db(dir.path());
		let a = db.insert_metric("keep.a").unwrap().0;
		let b = db.insert_metric("drop.b").unwrap().0;
		db.update_sample(a, 1000000800, 1.0).unwrap();
		db.update_sample(b, 1000000800, 2.0).unwrap();

		let mut text = Vec::new();
		let info = db.write_dump(&mut text, "keep.*", None).unwrap();

		assert_eq!(info.metrics, 1);
		assert!(String::from_utf8(text).unwrap().contains("keep.a"));
	}

	#[test]
	fn load_rejects_wrong_header() {
		let dir = tempdir().unwrap();
		let db = open_db(dir.path());

		let result = db.load_dump(&mut Cursor::new(b"Something else\n"), None);

		assert!(result.is_err());
	}

	#[test]
	fn load_resolves_now_timestamps() {
		let dir = tempdir().unwrap();
		let db = open_db(dir.path());
		let text = format!("{DUMP_VERSION_LINE}\nnow.m 5 -1\n");

		db.load_dump(&mut Cursor::new(text.as_bytes()), None).unwrap();

		let id = db.find_metric("now.m").unwrap();
		let mut collect = crate::db::test_helpers::Collect::new();
		db.enum_samples(id, 0, TimePoint::MAX, &mut collect).unwrap();
		assert_eq!(collect.samples.len(), 1);
		assert!((collect.samples[0].0 - unix_now()).abs() < 120);
	}

	#[test]
	fn load_skips_malformed_lines() {
		let dir = tempdir().unwrap();
		let db = open_db(dir.path());
		let text = format!(
			"{DUMP_VERSION_LINE}\nok.m 1 1000000800\nnot enough\nok.m bad 1000000860\n"
		);

		let info = db
			.load_dump(&mut Cursor::new(text.as_bytes()), None)
			.unwrap();

		assert_eq!(info.samples, 1);
	}

	#[test]
	fn progress_callback_can_abort_dump() {
		let dir = tempdir().unwrap();
		let db = open_db(dir.path());
		for n in 0..4 {
			let id = db.insert_metric(&format!("p.m{n}")).unwrap().0;
			db.update_sample(id, 1000000800, 1.0).unwrap();
		}

		struct StopAfterTwo;
		impl ProgressNotify for StopAfterTwo {
			fn on_progress(&mut self, _complete: bool, info: &ProgressInfo) -> bool {
				info.metrics < 2
			}
		}

		let mut text = Vec::new();
		let info = db
			.write_dump(&mut text, "", Some(&mut StopAfterTwo))
			.unwrap();

		assert_eq!(info.metrics, 2);
	}
}
