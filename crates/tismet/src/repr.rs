use std::mem;

use zerocopy::{FromBytes, Immutable, IntoBytes};

// Every on-disk structure lives at the head of a fixed-size block: the
// master page, WAL page headers, the WAL zero page. Each rich type has a
// `#[repr(C)]` zerocopy twin, and this seam moves values between the two
// through the block's leading bytes, validating on the way in via TryFrom.
pub(crate) trait PageRepr<T>: Sized + FromBytes + IntoBytes + Immutable
where
	T: TryFrom<Self> + Into<Self>,
{
	type Error: From<T::Error>;

	const SIZE: usize = mem::size_of::<Self>();

	fn read_from(page: &[u8]) -> Result<T, Self::Error> {
		let mut repr = Self::new_zeroed();
		repr.as_mut_bytes().copy_from_slice(&page[..Self::SIZE]);
		Ok(T::try_from(repr)?)
	}

	fn stamp(value: T, page: &mut [u8]) {
		let repr: Self = value.into();
		page[..Self::SIZE].copy_from_slice(repr.as_bytes());
	}
}

#[cfg(test)]
mod tests {
	use std::convert::Infallible;

	use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

	use crate::files::FileError;

	use super::*;

	#[derive(Debug, Clone, PartialEq, Eq)]
	struct Marker {
		kind: u8,
		count: u32,
	}

	#[derive(FromBytes, IntoBytes, Immutable, KnownLayout)]
	#[repr(C)]
	struct MarkerRepr {
		kind: u8,
		_pad: [u8; 3],
		count: u32,
	}

	impl From<Marker> for MarkerRepr {
		fn from(value: Marker) -> Self {
			Self {
				kind: value.kind,
				_pad: [0; 3],
				count: value.count,
			}
		}
	}

	impl TryFrom<MarkerRepr> for Marker {
		type Error = Infallible;

		fn try_from(value: MarkerRepr) -> Result<Self, Infallible> {
			Ok(Self {
				kind: value.kind,
				count: value.count,
			})
		}
	}

	impl PageRepr<Marker> for MarkerRepr {
		type Error = FileError;
	}

	#[test]
	fn stamp_then_read_prefix() {
		// The repr only owns the block's head; trailing bytes are untouched.
		let mut block = [0xee_u8; 16];

		MarkerRepr::stamp(
			Marker {
				kind: 7,
				count: 900,
			},
			&mut block,
		);

		assert_eq!(
			<MarkerRepr as PageRepr<_>>::read_from(&block).unwrap(),
			Marker {
				kind: 7,
				count: 900
			}
		);
		assert_eq!(&block[MarkerRepr::SIZE..], &[0xee; 8]);
	}
}
