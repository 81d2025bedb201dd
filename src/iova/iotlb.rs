use std::{collections::BTreeMap, fs::File, sync::Arc};

use vduse_interface::AccessFlags;

use crate::error::{Result, VduseError};

/// File backing a translation, mmappable by userspace at `offset`.
#[derive(Debug, Clone)]
pub struct MapFile {
	pub file: Arc<File>,
	pub offset: u64,
}

/// One translation. `start` and `last` are inclusive.
#[derive(Debug, Clone)]
pub struct IotlbEntry {
	pub start: u64,
	pub last: u64,
	/// Translated address, e.g. a host virtual address.
	pub addr: u64,
	pub perm: AccessFlags,
	pub file: Option<MapFile>,
}

impl IotlbEntry {
	fn overlaps(&self, start: u64, last: u64) -> bool {
		self.start <= last && start <= self.last
	}
}

/// Non-overlapping translations ordered by start address.
#[derive(Debug, Default)]
pub struct IntervalMap {
	entries: BTreeMap<u64, IotlbEntry>,
}

impl IntervalMap {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn len(&self) -> usize {
		self.entries.len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.is_empty()
	}

	pub fn insert(&mut self, entry: IotlbEntry) -> Result<()> {
		if entry.last < entry.start {
			return Err(VduseError::invalid(format!(
				"empty range {:#x}-{:#x}",
				entry.start, entry.last
			)));
		}
		if self.first(entry.start, entry.last).is_some() {
			return Err(VduseError::invalid(format!(
				"range {:#x}-{:#x} overlaps an existing mapping",
				entry.start, entry.last
			)));
		}
		self.entries.insert(entry.start, entry);
		Ok(())
	}

	/// Removes every entry overlapping `[start, last]`.
	pub fn remove_range(&mut self, start: u64, last: u64) -> Vec<IotlbEntry> {
		let keys: Vec<u64> = self
			.iter_range(start, last)
			.map(|entry| entry.start)
			.collect();
		keys.into_iter()
			.filter_map(|key| self.entries.remove(&key))
			.collect()
	}

	/// Removes the entry starting at `start`.
	pub fn remove(&mut self, start: u64) -> Option<IotlbEntry> {
		self.entries.remove(&start)
	}

	pub fn clear(&mut self) {
		self.entries.clear();
	}

	/// The lowest entry overlapping `[start, last]`.
	pub fn first(&self, start: u64, last: u64) -> Option<&IotlbEntry> {
		self.iter_range(start, last).next()
	}

	/// Entries overlapping `[start, last]` in ascending order.
	pub fn iter_range(&self, start: u64, last: u64) -> impl Iterator<Item = &IotlbEntry> {
		let containing = self
			.entries
			.range(..start)
			.next_back()
			.map(|(_, entry)| entry)
			.filter(|entry| entry.overlaps(start, last));
		containing.into_iter().chain(
			self.entries
				.range(start..)
				.map(|(_, entry)| entry)
				.take_while(move |entry| entry.start <= last),
		)
	}

	/// The entry containing `addr`.
	pub fn lookup(&self, addr: u64) -> Option<&IotlbEntry> {
		self.first(addr, addr)
	}
}
