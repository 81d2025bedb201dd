use std::collections::BTreeMap;

use crate::{
	consts::{PAGE_SHIFT, PAGE_SIZE},
	error::{Result, VduseError},
};

/// First-fit allocator of page-aligned IOVA ranges within `[start_pfn, limit_pfn]`.
#[derive(Debug)]
pub struct IovaAllocator {
	/// Free ranges by first page frame, values are lengths in pages.
	free: BTreeMap<u64, u64>,
	/// Handed out ranges by first page frame, values are lengths in pages.
	allocated: BTreeMap<u64, u64>,
}

impl IovaAllocator {
	pub fn new(start_pfn: u64, limit_pfn: u64) -> Self {
		let mut free = BTreeMap::new();
		if limit_pfn >= start_pfn {
			free.insert(start_pfn, limit_pfn - start_pfn + 1);
		}
		Self {
			free,
			allocated: BTreeMap::new(),
		}
	}

	fn pages(size: u64) -> u64 {
		size.div_ceil(PAGE_SIZE as u64)
	}

	/// Allocates `size` bytes rounded up to whole pages. Returns the IOVA.
	pub fn alloc(&mut self, size: u64) -> Result<u64> {
		let npages = Self::pages(size);
		if npages == 0 {
			return Err(VduseError::invalid("zero sized IOVA allocation"));
		}
		let (&pfn, &len) = self
			.free
			.iter()
			.find(|(_, len)| **len >= npages)
			.ok_or(VduseError::IovaExhausted)?;
		self.free.remove(&pfn);
		if len > npages {
			self.free.insert(pfn + npages, len - npages);
		}
		self.allocated.insert(pfn, npages);
		Ok(pfn << PAGE_SHIFT)
	}

	/// Releases a range. It must match an allocation exactly.
	pub fn free(&mut self, iova: u64, size: u64) -> Result<()> {
		let pfn = iova >> PAGE_SHIFT;
		let npages = Self::pages(size);
		if iova % PAGE_SIZE as u64 != 0 || self.allocated.get(&pfn) != Some(&npages) {
			return Err(VduseError::invalid(format!(
				"no IOVA allocation at {iova:#x} of {size:#x} bytes"
			)));
		}
		self.allocated.remove(&pfn);

		let mut start = pfn;
		let mut len = npages;
		if let Some((&prev, &prev_len)) = self.free.range(..pfn).next_back() {
			if prev + prev_len == pfn {
				self.free.remove(&prev);
				start = prev;
				len += prev_len;
			}
		}
		if let Some(next_len) = self.free.remove(&(pfn + npages)) {
			len += next_len;
		}
		self.free.insert(start, len);
		Ok(())
	}

	/// Whether `iova` falls into an allocated range.
	pub fn is_allocated(&self, iova: u64) -> bool {
		let pfn = iova >> PAGE_SHIFT;
		self.allocated
			.range(..=pfn)
			.next_back()
			.is_some_and(|(start, len)| pfn < start + len)
	}

	pub fn allocated_pages(&self) -> u64 {
		self.allocated.values().sum()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const PAGE: u64 = PAGE_SIZE as u64;

	#[test]
	fn test_alloc_free_coalesce() {
		let mut alloc = IovaAllocator::new(1, 4);
		let a = alloc.alloc(1).unwrap();
		let b = alloc.alloc(2 * PAGE).unwrap();
		let c = alloc.alloc(PAGE).unwrap();
		assert_eq!((a, b, c), (PAGE, 2 * PAGE, 4 * PAGE));
		assert!(matches!(alloc.alloc(1), Err(VduseError::IovaExhausted)));
		assert!(alloc.is_allocated(3 * PAGE + 5));

		alloc.free(a, 1).unwrap();
		alloc.free(b, 2 * PAGE).unwrap();
		assert!(!alloc.is_allocated(3 * PAGE));
		// The two freed ranges merged back into one.
		assert_eq!(alloc.alloc(3 * PAGE).unwrap(), PAGE);
		assert_eq!(alloc.allocated_pages(), 4);
	}

	#[test]
	fn test_free_must_match() {
		let mut alloc = IovaAllocator::new(1, 16);
		let iova = alloc.alloc(2 * PAGE).unwrap();
		assert!(alloc.free(iova, PAGE).is_err());
		assert!(alloc.free(iova + PAGE, PAGE).is_err());
		assert!(alloc.free(iova + 1, 2 * PAGE).is_err());
		alloc.free(iova, 2 * PAGE).unwrap();
		assert!(alloc.free(iova, 2 * PAGE).is_err());
	}

	#[test]
	fn test_zero_size() {
		let mut alloc = IovaAllocator::new(1, 16);
		assert!(matches!(alloc.alloc(0), Err(VduseError::InvalidArgument(_))));
	}
}
