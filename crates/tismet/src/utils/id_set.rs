use std::collections::BTreeSet;

// Ordered set of small unsigned ids: metric ids, page numbers and local
// transaction nonces all live in one of these.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct IdSet(BTreeSet<u32>);

impl IdSet {
	pub fn new() -> Self {
		Self::default()
	}

	#[inline]
	pub fn len(&self) -> usize {
		self.0.len()
	}

	#[inline]
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	#[inline]
	pub fn contains(&self, id: u32) -> bool {
		self.0.contains(&id)
	}

	#[inline]
	pub fn insert(&mut self, id: u32) -> bool {
		self.0.insert(id)
	}

	#[inline]
	pub fn remove(&mut self, id: u32) -> bool {
		self.0.remove(&id)
	}

	#[inline]
	pub fn first(&self) -> Option<u32> {
		self.0.first().copied()
	}

	#[inline]
	pub fn pop_first(&mut self) -> Option<u32> {
		self.0.pop_first()
	}

	pub fn clear(&mut self) {
		self.0.clear()
	}

	// Smallest value not in the set, starting the scan at `from`.
	pub fn first_unused(&self, from: u32) -> u32 {
		let mut candidate = from;
		for id in self.0.range(from..) {
			if *id != candidate {
				break;
			}
			candidate += 1;
		}
		candidate
	}

	pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
		self.0.iter().copied()
	}

	pub fn retain_intersection(&mut self, other: &IdSet) {
		self.0.retain(|id| other.contains(*id));
	}

	pub fn union_with(&mut self, other: &IdSet) {
		self.0.extend(other.iter());
	}

	pub fn insert_range(&mut self, first: u32, last: u32) {
		for id in first..=last {
			self.0.insert(id);
		}
	}
}

impl FromIterator<u32> for IdSet {
	fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
		Self(iter.into_iter().collect())
	}
}
