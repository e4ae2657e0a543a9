use std::collections::HashMap;

use crate::{utils::id_set::IdSet, MetricId};

pub(crate) mod pattern;

use pattern::Seg;

// Patterns support a bounded number of `**` segments; the permutations over
// name lengths grow combinatorially past that.
const MAX_DYNAMIC_ANY: usize = 3;

#[derive(Debug)]
struct Entry {
	name: Box<str>,
	is_metric: bool,
	// How many metrics this name prefixes; a name with both samples and
	// children is a metric and a branch at once.
	branch_refs: usize,
}

// In-memory index over metric names, rebuilt at open by scanning descriptor
// pages. Holds name <-> id both ways, ids grouped by segment count, and ids
// grouped by (segment position, literal) so wildcard lookups intersect
// candidate sets instead of scanning every name.
#[derive(Debug, Default)]
pub(crate) struct NameIndex {
	by_name: HashMap<Box<str>, MetricId>,
	by_id: HashMap<MetricId, Entry>,
	all_ids: IdSet,
	metric_ids: IdSet,
	// Ids of names with exactly `k` segments, at index k.
	len_ids: Vec<IdSet>,
	// For each segment position, ids of names with that literal there.
	seg_ids: Vec<HashMap<Box<str>, IdSet>>,
}

impl NameIndex {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn clear(&mut self) {
		*self = Self::default();
	}

	pub fn len(&self) -> usize {
		self.metric_ids.len()
	}

	pub fn next_id(&self) -> MetricId {
		self.all_ids.first_unused(1)
	}

	pub fn find(&self, name: &str) -> Option<MetricId> {
		let id = *self.by_name.get(name)?;
		self.by_id[&id].is_metric.then_some(id)
	}

	// The id a new metric with this name must use: an existing pure-branch
	// entry keeps its id, otherwise the lowest unused one.
	pub fn id_for_insert(&self, name: &str) -> MetricId {
		match self.by_name.get(name) {
			Some(id) => *id,
			None => self.next_id(),
		}
	}

	pub fn find_branch(&self, name: &str) -> Option<MetricId> {
		let id = *self.by_name.get(name)?;
		(self.by_id[&id].branch_refs > 0).then_some(id)
	}

	pub fn name(&self, id: MetricId) -> Option<&str> {
		self.by_id.get(&id).map(|entry| &*entry.name)
	}

	pub fn insert_metric(&mut self, id: MetricId, name: &str) {
		match self.by_name.get(name) {
			// The name already exists as a pure branch; it keeps its id and
			// becomes a metric as well (the caller allocates ids through
			// `id_for_insert`, which accounts for branch ids).
			Some(existing) => {
				debug_assert_eq!(*existing, id);
				self.by_id
					.get_mut(existing)
					.expect("by_name and by_id stay in step")
					.is_metric = true;
				self.metric_ids.insert(*existing);
			}
			None => self.insert(id, name, true),
		}
		self.add_branches(name);
	}

	// Rebuild from descriptor pages at open. Every persisted metric claims
	// its id before any branch id is handed out, so branches can never
	// collide with a metric loaded later in the scan.
	pub fn rebuild(&mut self, metrics: &[(MetricId, String)]) {
		self.clear();
		for (id, name) in metrics {
			self.insert(*id, name, true);
		}
		for (_, name) in metrics {
			self.add_branches(name);
		}
	}

	fn add_branches(&mut self, name: &str) {
		for prefix in branch_prefixes(name) {
			match self.by_name.get(prefix) {
				Some(branch_id) => {
					self.by_id
						.get_mut(branch_id)
						.expect("by_name and by_id stay in step")
						.branch_refs += 1;
				}
				None => {
					let branch_id = self.next_id();
					self.insert(branch_id, prefix, false);
					self.by_id.get_mut(&branch_id).expect("Just inserted").branch_refs = 1;
				}
			}
		}
	}

	pub fn erase_metric(&mut self, id: MetricId) {
		let Some(entry) = self.by_id.get_mut(&id) else {
			return;
		};
		let name = entry.name.to_string();
		entry.is_metric = false;
		self.metric_ids.remove(id);
		if entry.branch_refs == 0 {
			self.remove(id);
		}
		for prefix in branch_prefixes(&name) {
			let Some(branch_id) = self.by_name.get(prefix).copied() else {
				continue;
			};
			let entry = self
				.by_id
				.get_mut(&branch_id)
				.expect("by_name and by_id stay in step");
			entry.branch_refs -= 1;
			if entry.branch_refs == 0 && !entry.is_metric {
				self.remove(branch_id);
			}
		}
	}

	fn insert(&mut self, id: MetricId, name: &str, is_metric: bool) {
		debug_assert!(!self.by_name.contains_key(name));
		self.by_name.insert(name.into(), id);
		self.by_id.insert(
			id,
			Entry {
				name: name.into(),
				is_metric,
				branch_refs: 0,
			},
		);
		self.all_ids.insert(id);
		if is_metric {
			self.metric_ids.insert(id);
		}
		let segments: Vec<&str> = name.split('.').collect();
		if self.len_ids.len() <= segments.len() {
			self.len_ids.resize_with(segments.len() + 1, IdSet::new);
		}
		self.len_ids[segments.len()].insert(id);
		if self.seg_ids.len() < segments.len() {
			self.seg_ids.resize_with(segments.len(), HashMap::new);
		}
		for (pos, segment) in segments.iter().enumerate() {
			self.seg_ids[pos]
				.entry((*segment).into())
				.or_default()
				.insert(id);
		}
	}

	fn remove(&mut self, id: MetricId) {
		let Some(entry) = self.by_id.remove(&id) else {
			return;
		};
		self.by_name.remove(&entry.name);
		self.all_ids.remove(id);
		self.metric_ids.remove(id);
		let segments: Vec<&str> = entry.name.split('.').collect();
		self.len_ids[segments.len()].remove(id);
		for (pos, segment) in segments.iter().enumerate() {
			if let Some(set) = self.seg_ids[pos].get_mut(*segment) {
				set.remove(id);
				if set.is_empty() {
					self.seg_ids[pos].remove(*segment);
				}
			}
		}
	}

	/************************************************************************
	 * Pattern search
	 ***/

	// Every metric whose name matches the glob pattern; an empty pattern
	// matches everything.
	pub fn find_metrics(&self, pattern: &str) -> IdSet {
		if pattern.is_empty() {
			return self.metric_ids.clone();
		}
		let Some(segs) = pattern::parse(pattern) else {
			return IdSet::new();
		};
		let dynamic = segs.iter().filter(|s| matches!(s, Seg::DynamicAny)).count();
		if dynamic > MAX_DYNAMIC_ANY {
			return IdSet::new();
		}
		let fixed = segs.len() - dynamic;
		let max_len = self.len_ids.len().saturating_sub(1);
		let mut out = IdSet::new();
		if fixed > max_len {
			return out;
		}
		let mut spans = vec![0_usize; dynamic];
		for total in fixed..=max_len {
			distribute_spans(&mut spans, 0, total - fixed, &mut |spans| {
				if let Some(found) = self.find_concrete(&segs, spans, total) {
					out.union_with(&found);
				}
			});
		}
		out
	}

	// Ids of branches prefixing at least one metric matched by the pattern.
	pub fn find_branches(&self, pattern: &str) -> IdSet {
		let metrics = self.find_metrics(pattern);
		let mut out = IdSet::new();
		for id in metrics.iter() {
			let Some(name) = self.name(id) else { continue };
			for prefix in branch_prefixes(name) {
				if let Some(branch_id) = self.find_branch(prefix) {
					out.insert(branch_id);
				}
			}
		}
		out
	}

	// One concrete layout: each `**` pinned to a span, so every remaining
	// segment sits at a fixed position.
	fn find_concrete(&self, segs: &[Seg], spans: &[usize], total: usize) -> Option<IdSet> {
		let mut candidates = self.len_ids.get(total)?.clone();
		candidates.retain_intersection(&self.metric_ids);
		let mut pos = 0;
		let mut span_at = 0;
		for seg in segs {
			match seg {
				Seg::DynamicAny => {
					pos += spans[span_at];
					span_at += 1;
					continue;
				}
				Seg::Any => {}
				Seg::Exact(lit) => {
					let set = self.seg_ids.get(pos)?.get(lit.as_str())?;
					candidates.retain_intersection(set);
				}
				Seg::Condition(matcher) => {
					let by_literal = self.seg_ids.get(pos)?;
					let mut matched = IdSet::new();
					for (literal, set) in by_literal {
						if matcher.matches(literal) {
							matched.union_with(set);
						}
					}
					candidates.retain_intersection(&matched);
				}
			}
			pos += 1;
			if candidates.is_empty() {
				return None;
			}
		}
		Some(candidates)
	}
}

// Proper dot-delimited prefixes, shortest first: "a.b.c" -> "a", "a.b".
fn branch_prefixes(name: &str) -> impl Iterator<Item = &str> {
	name.char_indices()
		.filter(|(_, c)| *c == '.')
		.map(|(at, _)| &name[..at])
}

fn distribute_spans(
	spans: &mut Vec<usize>,
	from: usize,
	remaining: usize,
	visit: &mut impl FnMut(&[usize]),
) {
	if from == spans.len() {
		if remaining == 0 {
			visit(spans);
		}
		return;
	}
	if from == spans.len() - 1 {
		spans[from] = remaining;
		let snapshot = spans.clone();
		visit(&snapshot);
		return;
	}
	for take in 0..=remaining {
		spans[from] = take;
		distribute_spans(spans, from + 1, remaining - take, visit);
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	fn ids(values: &[u32]) -> IdSet {
		values.iter().copied().collect()
	}

	fn index_with(names: &[&str]) -> (NameIndex, Vec<MetricId>) {
		let mut index = NameIndex::new();
		let mut assigned = Vec::new();
		for name in names {
			let id = index.next_id();
			index.insert_metric(id, name);
			assigned.push(id);
		}
		(index, assigned)
	}

	#[test]
	fn insert_then_find_roundtrip() {
		let (index, ids) = index_with(&["a.b"]);

		assert_eq!(index.find("a.b"), Some(ids[0]));
		assert_eq!(index.name(ids[0]), Some("a.b"));
		assert_eq!(index.find("a.c"), None);
		// "a" is a branch, not a metric.
		assert_eq!(index.find("a"), None);
		assert!(index.find_branch("a").is_some());
	}

	#[test]
	fn erase_removes_both_directions() {
		let (mut index, ids) = index_with(&["a.b"]);

		index.erase_metric(ids[0]);

		assert_eq!(index.find("a.b"), None);
		assert_eq!(index.name(ids[0]), None);
		assert_eq!(index.find_branch("a"), None);
		assert_eq!(index.len(), 0);
	}

	#[test]
	fn erased_ids_are_reused_lowest_first() {
		let (mut index, metric_ids) = index_with(&["a.b", "a.c"]);

		index.erase_metric(metric_ids[0]);
		assert_eq!(index.next_id(), metric_ids[0]);
	}

	#[test]
	fn single_wildcard_position() {
		// One wild position between two exact segments.
		let (index, metric_ids) = index_with(&["a.red.1", "a.red.2", "a.blue.1"]);

		let found = index.find_metrics("a.*.1");
		assert_eq!(found, ids(&[metric_ids[0], metric_ids[2]]));
	}

	#[test]
	fn exact_and_condition_segments() {
		let (index, metric_ids) = index_with(&["a.red.1", "a.red.2", "a.blue.1"]);

		assert_eq!(index.find_metrics("a.red.2"), ids(&[metric_ids[1]]));
		assert_eq!(
			index.find_metrics("a.{red,blue}.1"),
			ids(&[metric_ids[0], metric_ids[2]])
		);
		assert_eq!(
			index.find_metrics("a.red.[12]"),
			ids(&[metric_ids[0], metric_ids[1]])
		);
		assert_eq!(index.find_metrics("a.r*.2"), ids(&[metric_ids[1]]));
		assert_eq!(index.find_metrics("b.red.1"), IdSet::new());
	}

	#[test]
	fn dynamic_any_spans_whole_segments() {
		let (index, metric_ids) =
			index_with(&["sys.cpu.0.user", "sys.cpu.1.user", "sys.disk.user"]);

		assert_eq!(
			index.find_metrics("sys.**.user"),
			ids(&[metric_ids[0], metric_ids[1], metric_ids[2]])
		);
		assert_eq!(
			index.find_metrics("sys.cpu.**"),
			ids(&[metric_ids[0], metric_ids[1]])
		);
	}

	#[test]
	fn empty_pattern_matches_all() {
		let (index, metric_ids) = index_with(&["a.b", "c.d"]);

		assert_eq!(index.find_metrics(""), ids(&[metric_ids[0], metric_ids[1]]));
	}

	#[test]
	fn branches_of_matching_metrics() {
		let (index, _) = index_with(&["a.red.1", "a.blue.1"]);

		let branches = index.find_branches("a.*.1");
		let mut names: Vec<&str> = branches.iter().map(|id| index.name(id).unwrap()).collect();
		names.sort_unstable();
		assert_eq!(names, vec!["a", "a.blue", "a.red"]);
	}

	#[test]
	fn metric_that_is_also_a_branch() {
		let (mut index, metric_ids) = index_with(&["a.b", "a.b.c"]);

		// "a.b" is both a metric and a branch of "a.b.c"; one id serves
		// both roles.
		assert_eq!(index.find("a.b"), Some(metric_ids[0]));
		assert_eq!(index.find_branch("a.b"), Some(metric_ids[0]));

		index.erase_metric(metric_ids[0]);
		// Still a branch afterwards.
		assert_eq!(index.find("a.b"), None);
		assert_eq!(index.find_branch("a.b"), Some(metric_ids[0]));
	}
}
