//! The IOVA domain: translation between device-visible I/O addresses and backing memory.
//!
//! The low part of the IOVA space, `[0, bounce_size)`, is the bounce area. Streaming DMA mappings
//! copy data between the caller's memory and a bounce page at the same offset. The bounce pages
//! are allocated on demand, or replaced wholesale by pinned user memory. Above the bounce area live
//! coherent allocations, which need no copying.

pub mod allocator;
pub mod iotlb;

use std::{
	collections::BTreeMap,
	fs::File,
	sync::{Arc, Mutex, MutexGuard, RwLock},
};

use vduse_interface::AccessFlags;

use self::{
	allocator::IovaAllocator,
	iotlb::{IntervalMap, IotlbEntry, MapFile},
};
use crate::{
	consts::*,
	error::{Result, VduseError},
	mem::{MemoryError, PageBuffer, PinnedRegion},
};

/// Direction of a streaming DMA mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDirection {
	ToDevice,
	FromDevice,
	Bidirectional,
}

impl DmaDirection {
	fn to_device(self) -> bool {
		matches!(self, Self::ToDevice | Self::Bidirectional)
	}

	fn from_device(self) -> bool {
		matches!(self, Self::FromDevice | Self::Bidirectional)
	}
}

/// The result of a [`IovaDomain::query`].
#[derive(Debug, Clone)]
pub struct IotlbRange {
	pub start: u64,
	pub last: u64,
	pub file: Arc<File>,
	pub offset: u64,
	pub perm: AccessFlags,
}

#[derive(Debug, Default)]
struct BouncePage {
	/// Lazily allocated kernel-side storage.
	page: Option<PageBuffer>,
	/// Address of the caller's memory this page currently shadows.
	orig: Option<usize>,
}

impl BouncePage {
	fn in_use(&self) -> bool {
		self.orig.is_some()
	}
}

#[derive(Debug)]
struct BounceArea {
	pages: Vec<Mutex<BouncePage>>,
	user: Option<PinnedRegion>,
}

impl BounceArea {
	/// Runs `f` on the storage currently backing page `idx`.
	fn with_storage<R>(
		&self,
		page: &mut BouncePage,
		idx: usize,
		f: impl FnOnce(&mut [u8]) -> R,
	) -> std::result::Result<R, MemoryError> {
		match &self.user {
			// SAFETY: the page's mutex is held, so this is the only reference.
			Some(user) => Ok(f(unsafe { user.page_mut(idx)? })),
			None => {
				let storage = page.page.as_mut().ok_or(MemoryError::BoundsViolation)?;
				Ok(f(storage.as_mut_slice()))
			}
		}
	}
}

/// Live streaming mappings. Pages come from `alloc`, `sizes` keeps the exact byte length.
#[derive(Debug)]
struct StreamMappings {
	alloc: IovaAllocator,
	sizes: BTreeMap<u64, usize>,
}

impl StreamMappings {
	/// Whether `[iova, iova + size)` lies within a single live mapping.
	fn contains(&self, iova: u64, size: usize) -> bool {
		let Some(end) = iova.checked_add(size as u64) else {
			return false;
		};
		self.sizes
			.range(..=iova)
			.next_back()
			.is_some_and(|(&start, &len)| end <= start + len as u64)
	}
}

/// Translation state of one device.
#[derive(Debug)]
pub struct IovaDomain {
	bounce_size: u64,
	iova_size: u64,
	file: Arc<File>,
	bounce: RwLock<BounceArea>,
	/// Set while the bounce area is present in the interval map.
	bounce_map: Mutex<bool>,
	iotlb: Mutex<IntervalMap>,
	stream: Mutex<StreamMappings>,
	consistent: Mutex<IovaAllocator>,
	coherent: Mutex<BTreeMap<u64, PageBuffer>>,
}

impl IovaDomain {
	pub fn new(bounce_size: u64) -> Result<Self> {
		if bounce_size == 0
			|| bounce_size % PAGE_SIZE as u64 != 0
			|| bounce_size > VDUSE_MAX_BOUNCE_SIZE
		{
			return Err(VduseError::invalid(format!(
				"invalid bounce size {bounce_size:#x}"
			)));
		}
		let npages = (bounce_size >> PAGE_SHIFT) as usize;
		let iova_size = VDUSE_IOVA_SIZE;
		debug!("Creating IOVA domain with {npages} bounce pages");
		Ok(Self {
			bounce_size,
			iova_size,
			file: Arc::new(tempfile::tempfile()?),
			bounce: RwLock::new(BounceArea {
				pages: (0..npages).map(|_| Mutex::default()).collect(),
				user: None,
			}),
			bounce_map: Mutex::new(false),
			iotlb: Mutex::new(IntervalMap::new()),
			stream: Mutex::new(StreamMappings {
				alloc: IovaAllocator::new(
					IOVA_START_PFN,
					(bounce_size >> PAGE_SHIFT).saturating_sub(1),
				),
				sizes: BTreeMap::new(),
			}),
			consistent: Mutex::new(IovaAllocator::new(
				bounce_size >> PAGE_SHIFT,
				(iova_size - 1) >> PAGE_SHIFT,
			)),
			coherent: Mutex::new(BTreeMap::new()),
		})
	}

	pub fn bounce_size(&self) -> u64 {
		self.bounce_size
	}

	pub fn iova_size(&self) -> u64 {
		self.iova_size
	}

	/// The file userspace maps to reach domain memory.
	pub fn file(&self) -> &Arc<File> {
		&self.file
	}

	fn iotlb(&self) -> MutexGuard<'_, IntervalMap> {
		self.iotlb.lock().unwrap()
	}

	pub fn has_bounce_map(&self) -> bool {
		*self.bounce_map.lock().unwrap()
	}

	pub fn has_user_bounce_pages(&self) -> bool {
		self.bounce.read().unwrap().user.is_some()
	}

	fn bounce_entry(&self) -> IotlbEntry {
		IotlbEntry {
			start: 0,
			last: self.bounce_size - 1,
			addr: 0,
			perm: AccessFlags::RW,
			file: Some(MapFile {
				file: self.file.clone(),
				offset: 0,
			}),
		}
	}

	fn coherent_entry(&self, iova: u64, buffer: &PageBuffer) -> IotlbEntry {
		IotlbEntry {
			start: iova,
			last: iova + buffer.len() as u64 - 1,
			addr: buffer.as_ptr() as u64,
			perm: AccessFlags::RW,
			file: Some(MapFile {
				file: self.file.clone(),
				offset: iova,
			}),
		}
	}

	/// Re-inserts the translations the domain owns itself within `[start, last]`: the bounce area
	/// while published and every coherent allocation.
	fn restore_owned(
		&self,
		iotlb: &mut IntervalMap,
		bounce_map: bool,
		coherent: &BTreeMap<u64, PageBuffer>,
		start: u64,
		last: u64,
	) {
		let owned = bounce_map
			.then(|| self.bounce_entry())
			.into_iter()
			.chain(
				coherent
					.iter()
					.map(|(&iova, buffer)| self.coherent_entry(iova, buffer)),
			)
			.filter(|entry| entry.start <= last && start <= entry.last);
		for entry in owned {
			if let Err(err) = iotlb.insert(entry) {
				warn!("Lost a domain translation: {err}");
			}
		}
	}

	/// Publishes the bounce area in the interval map, once.
	fn init_bounce_map(&self) -> Result<()> {
		let mut bounce_map = self.bounce_map.lock().unwrap();
		if *bounce_map {
			return Ok(());
		}
		self.iotlb().insert(self.bounce_entry())?;
		*bounce_map = true;
		Ok(())
	}

	/// Drops the bounce area from the interval map. The next mapping re-creates it.
	pub fn reset_bounce_map(&self) {
		let mut bounce_map = self.bounce_map.lock().unwrap();
		if !*bounce_map {
			return;
		}
		self.iotlb().remove(0);
		*bounce_map = false;
	}

	fn check_bounce_range(&self, iova: u64, size: usize) -> Result<()> {
		match iova.checked_add(size as u64) {
			Some(end) if size > 0 && end <= self.bounce_size => Ok(()),
			_ => Err(MemoryError::BoundsViolation.into()),
		}
	}

	/// Copies between the shadowed memory and the bounce pages of `[iova, iova + size)`.
	fn bounce(&self, area: &BounceArea, iova: u64, size: usize, to_device: bool) -> Result<()> {
		let mut iova = iova;
		let mut remaining = size;
		while remaining > 0 {
			let idx = (iova >> PAGE_SHIFT) as usize;
			let offset = iova as usize % PAGE_SIZE;
			let len = remaining.min(PAGE_SIZE - offset);

			let mut page = area.pages[idx].lock().unwrap();
			let orig = page.orig.ok_or(MemoryError::BoundsViolation)?;
			area.with_storage(&mut page, idx, |storage| {
				let orig = (orig + offset) as *mut u8;
				let bounce = storage[offset..offset + len].as_mut_ptr();
				// SAFETY: the caller of `map_page` guarantees `orig` stays valid while mapped.
				unsafe {
					if to_device {
						std::ptr::copy_nonoverlapping(orig, bounce, len);
					} else {
						std::ptr::copy_nonoverlapping(bounce, orig, len);
					}
				}
			})?;

			iova += len as u64;
			remaining -= len;
		}
		Ok(())
	}

	/// Maps `size` bytes at `orig` for streaming DMA and returns the IOVA.
	///
	/// # Safety
	///
	/// `orig..orig + size` must stay valid for reads and writes until the mapping is removed with
	/// [`unmap_page`](Self::unmap_page).
	pub unsafe fn map_page(&self, orig: *mut u8, size: usize, dir: DmaDirection) -> Result<u64> {
		if size == 0 {
			return Err(VduseError::invalid("zero sized mapping"));
		}
		let iova = {
			let mut stream = self.stream.lock().unwrap();
			let iova = stream.alloc.alloc(size as u64)?;
			stream.sizes.insert(iova, size);
			iova
		};
		let res = self.init_bounce_map().and_then(|()| {
			let area = self.bounce.read().unwrap();
			let first = (iova >> PAGE_SHIFT) as usize;
			let npages = size.div_ceil(PAGE_SIZE);
			for (i, page) in area.pages[first..first + npages].iter().enumerate() {
				let mut page = page.lock().unwrap();
				if page.page.is_none() {
					page.page = Some(PageBuffer::new(PAGE_SIZE)?);
				}
				page.orig = Some(orig as usize + i * PAGE_SIZE);
			}
			if dir.to_device() {
				self.bounce(&area, iova, size, true)?;
			}
			Ok(())
		});
		if let Err(err) = res {
			self.release_pages(iova, size);
			let mut stream = self.stream.lock().unwrap();
			stream.sizes.remove(&iova);
			stream.alloc.free(iova, size as u64)?;
			return Err(err);
		}
		trace!("Mapped {size:#x} bytes at {orig:p} to IOVA {iova:#x}");
		Ok(iova)
	}

	fn release_pages(&self, iova: u64, size: usize) {
		let area = self.bounce.read().unwrap();
		let first = (iova >> PAGE_SHIFT) as usize;
		let npages = size.div_ceil(PAGE_SIZE);
		for page in &area.pages[first..first + npages] {
			page.lock().unwrap().orig = None;
		}
	}

	/// Removes a streaming mapping. `iova` and `size` must match the mapping exactly.
	pub fn unmap_page(&self, iova: u64, size: usize, dir: DmaDirection) -> Result<()> {
		self.check_bounce_range(iova, size)?;
		// Holding the allocator keeps the range from being handed out again until released.
		let mut stream = self.stream.lock().unwrap();
		if stream.sizes.get(&iova) != Some(&size) {
			return Err(VduseError::invalid(format!(
				"no mapping at IOVA {iova:#x} of {size:#x} bytes"
			)));
		}
		stream.alloc.free(iova, size as u64)?;
		stream.sizes.remove(&iova);
		let res = if dir.from_device() {
			let area = self.bounce.read().unwrap();
			self.bounce(&area, iova, size, false)
		} else {
			Ok(())
		};
		self.release_pages(iova, size);
		drop(stream);
		trace!("Unmapped IOVA {iova:#x}");
		res
	}

	/// Copies `[iova, iova + size)`, which must lie within one live mapping.
	fn sync(&self, iova: u64, size: usize, to_device: bool) -> Result<()> {
		self.check_bounce_range(iova, size)?;
		let stream = self.stream.lock().unwrap();
		if !stream.contains(iova, size) {
			return Err(VduseError::invalid(format!(
				"IOVA {iova:#x}+{size:#x} is not within a mapping"
			)));
		}
		let area = self.bounce.read().unwrap();
		let res = self.bounce(&area, iova, size, to_device);
		drop(stream);
		res
	}

	/// Makes CPU writes to a mapping visible to the device.
	pub fn sync_for_device(&self, iova: u64, size: usize) -> Result<()> {
		self.sync(iova, size, true)
	}

	/// Makes device writes to a mapping visible to the CPU.
	pub fn sync_for_cpu(&self, iova: u64, size: usize) -> Result<()> {
		self.sync(iova, size, false)
	}

	/// Allocates zeroed memory mapped at the returned IOVA for device and CPU alike.
	pub fn alloc_coherent(&self, size: usize) -> Result<u64> {
		let mut consistent = self.consistent.lock().unwrap();
		let iova = consistent.alloc(size as u64)?;
		let mut coherent = self.coherent.lock().unwrap();
		let res = PageBuffer::new(size).and_then(|buffer| {
			self.iotlb().insert(self.coherent_entry(iova, &buffer))?;
			Ok(buffer)
		});
		match res {
			Ok(buffer) => {
				coherent.insert(iova, buffer);
				Ok(iova)
			}
			Err(err) => {
				consistent.free(iova, size as u64)?;
				Err(err)
			}
		}
	}

	pub fn free_coherent(&self, iova: u64, size: usize) -> Result<()> {
		let mut consistent = self.consistent.lock().unwrap();
		let mut coherent = self.coherent.lock().unwrap();
		match coherent.get(&iova) {
			Some(buffer) if buffer.len() == size.div_ceil(PAGE_SIZE) * PAGE_SIZE => {}
			_ => {
				return Err(VduseError::invalid(format!(
					"no coherent allocation at {iova:#x} of {size:#x} bytes"
				)));
			}
		}
		self.iotlb().remove_range(iova, iova + size as u64 - 1);
		consistent.free(iova, size as u64)?;
		coherent.remove(&iova);
		Ok(())
	}

	/// Backs the bounce area with pinned user memory. Pages in use are copied over.
	pub fn register_user_bounce_pages(&self, region: PinnedRegion) -> Result<()> {
		if region.len() as u64 != self.bounce_size {
			return Err(VduseError::invalid(format!(
				"bounce memory must be {:#x} bytes",
				self.bounce_size
			)));
		}
		let mut area = self.bounce.write().unwrap();
		if area.user.is_some() {
			return Err(VduseError::AlreadyExists("user bounce pages".into()));
		}
		for (idx, page) in area.pages.iter().enumerate() {
			let page = page.lock().unwrap();
			if let (Some(kernel), true) = (&page.page, page.in_use()) {
				// SAFETY: the area is locked for writing, nobody else accesses the region.
				unsafe { region.page_mut(idx)? }.copy_from_slice(kernel.as_slice());
			}
		}
		area.user = Some(region);
		debug!("Registered user bounce pages");
		Ok(())
	}

	/// Returns the bounce area to kernel pages, copying pages in use back.
	pub fn deregister_user_bounce_pages(&self) -> Result<PinnedRegion> {
		let mut area = self.bounce.write().unwrap();
		let region = area
			.user
			.take()
			.ok_or_else(|| VduseError::invalid("no user bounce pages registered"))?;
		let copied = area.pages.iter().enumerate().try_for_each(|(idx, page)| {
			let mut page = page.lock().unwrap();
			if !page.in_use() {
				return Ok(());
			}
			let kernel = match &mut page.page {
				Some(kernel) => kernel,
				slot => slot.insert(PageBuffer::new(PAGE_SIZE)?),
			};
			// SAFETY: the area is locked for writing, nobody else accesses the region.
			kernel
				.as_mut_slice()
				.copy_from_slice(unsafe { region.page_mut(idx)? });
			Ok::<_, VduseError>(())
		});
		if let Err(err) = copied {
			area.user = Some(region);
			return Err(err);
		}
		debug!("Deregistered user bounce pages");
		Ok(region)
	}

	/// Replaces the translations installed from outside with `entries`. The bounce area and
	/// coherent allocations stay mapped. On error only those remain.
	pub fn set_map(&self, entries: impl IntoIterator<Item = IotlbEntry>) -> Result<()> {
		let bounce_map = self.bounce_map.lock().unwrap();
		let coherent = self.coherent.lock().unwrap();
		let mut iotlb = self.iotlb();
		iotlb.clear();
		self.restore_owned(&mut iotlb, *bounce_map, &coherent, 0, u64::MAX);
		for entry in entries {
			let res = if entry.last >= self.iova_size {
				Err(VduseError::invalid(format!(
					"mapping {:#x}-{:#x} exceeds the IOVA space",
					entry.start, entry.last
				)))
			} else {
				iotlb.insert(entry)
			};
			if let Err(err) = res {
				iotlb.clear();
				self.restore_owned(&mut iotlb, *bounce_map, &coherent, 0, u64::MAX);
				return Err(err);
			}
		}
		Ok(())
	}

	/// Removes translations in `[start, last]`, except the ones the domain owns.
	pub fn clear_map(&self, start: u64, last: u64) {
		let bounce_map = self.bounce_map.lock().unwrap();
		let coherent = self.coherent.lock().unwrap();
		let mut iotlb = self.iotlb();
		iotlb.remove_range(start, last);
		self.restore_owned(&mut iotlb, *bounce_map, &coherent, start, last);
	}

	/// The first file-backed translation overlapping `[start, last]`, clamped to that range.
	pub fn query(&self, start: u64, last: u64) -> Result<IotlbRange> {
		if last < start {
			return Err(VduseError::invalid("empty IOTLB query"));
		}
		let iotlb = self.iotlb();
		let entry = iotlb
			.first(start, last)
			.ok_or_else(|| VduseError::invalid(format!("no mapping in {start:#x}-{last:#x}")))?;
		let map_file = entry
			.file
			.as_ref()
			.ok_or_else(|| VduseError::invalid("mapping is not backed by a file"))?;
		let clamped_start = entry.start.max(start);
		Ok(IotlbRange {
			start: clamped_start,
			last: entry.last.min(last),
			file: map_file.file.clone(),
			offset: map_file.offset + (clamped_start - entry.start),
			perm: entry.perm,
		})
	}

	/// The translation containing `iova`.
	pub fn lookup(&self, iova: u64) -> Option<IotlbEntry> {
		self.iotlb().lookup(iova).cloned()
	}

	/// Walks `[iova, iova + len)` page by page.
	fn access(
		&self,
		iova: u64,
		len: usize,
		mut f: impl FnMut(&mut [u8], usize),
	) -> Result<()> {
		let end = iova
			.checked_add(len as u64)
			.ok_or(MemoryError::BoundsViolation)?;
		if end <= self.bounce_size {
			let area = self.bounce.read().unwrap();
			let mut cur = iova;
			while cur < end {
				let idx = (cur >> PAGE_SHIFT) as usize;
				let offset = cur as usize % PAGE_SIZE;
				let chunk = ((end - cur) as usize).min(PAGE_SIZE - offset);
				let mut page = area.pages[idx].lock().unwrap();
				let done = (cur - iova) as usize;
				area.with_storage(&mut page, idx, |storage| {
					f(&mut storage[offset..offset + chunk], done)
				})?;
				cur += chunk as u64;
			}
			return Ok(());
		}

		let mut coherent = self.coherent.lock().unwrap();
		let (&base, buffer) = coherent
			.range_mut(..=iova)
			.next_back()
			.ok_or(MemoryError::BoundsViolation)?;
		let offset = (iova - base) as usize;
		if offset + len > buffer.len() {
			return Err(MemoryError::BoundsViolation.into());
		}
		f(&mut buffer.as_mut_slice()[offset..offset + len], 0);
		Ok(())
	}

	/// Reads domain memory the way the userspace device sees it.
	pub fn read(&self, iova: u64, buf: &mut [u8]) -> Result<()> {
		self.access(iova, buf.len(), |mem, done| {
			buf[done..done + mem.len()].copy_from_slice(mem)
		})
	}

	/// Writes domain memory the way the userspace device sees it.
	pub fn write(&self, iova: u64, data: &[u8]) -> Result<()> {
		self.access(iova, data.len(), |mem, done| {
			mem.copy_from_slice(&data[done..done + mem.len()])
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	const BOUNCE: u64 = VDUSE_MIN_BOUNCE_SIZE;

	fn domain() -> IovaDomain {
		IovaDomain::new(BOUNCE).unwrap()
	}

	#[test]
	fn test_map_bounces_to_device() {
		let domain = domain();
		let mut data = vec![0u8; 2 * PAGE_SIZE];
		data[..4].copy_from_slice(b"vdus");
		data[PAGE_SIZE + 1] = 0x42;

		assert!(!domain.has_bounce_map());
		let iova = unsafe {
			domain.map_page(data.as_mut_ptr(), data.len(), DmaDirection::ToDevice)
		}
		.unwrap();
		assert!(iova >= PAGE_SIZE as u64 && iova < BOUNCE);
		assert!(domain.has_bounce_map());

		let mut seen = [0u8; 4];
		domain.read(iova, &mut seen).unwrap();
		assert_eq!(&seen, b"vdus");
		let mut byte = [0u8];
		domain.read(iova + PAGE_SIZE as u64 + 1, &mut byte).unwrap();
		assert_eq!(byte[0], 0x42);

		domain
			.unmap_page(iova, data.len(), DmaDirection::ToDevice)
			.unwrap();
		assert!(
			domain
				.unmap_page(iova, data.len(), DmaDirection::ToDevice)
				.is_err()
		);
	}

	#[test]
	fn test_device_writes_reach_cpu() {
		let domain = domain();
		let mut data = vec![0u8; 64];
		let iova = unsafe {
			domain.map_page(data.as_mut_ptr(), data.len(), DmaDirection::FromDevice)
		}
		.unwrap();

		domain.write(iova + 8, b"response").unwrap();
		domain.sync_for_cpu(iova, 64).unwrap();
		assert_eq!(&data[8..16], b"response");

		data[0] = 1;
		domain.write(iova + 1, &[2]).unwrap();
		domain.unmap_page(iova, 64, DmaDirection::FromDevice).unwrap();
		assert_eq!(&data[..2], &[0, 2]);
	}

	#[test]
	fn test_unmap_and_sync_are_byte_exact() {
		let domain = domain();
		let mut data = vec![0u8; 64];
		let iova =
			unsafe { domain.map_page(data.as_mut_ptr(), 16, DmaDirection::FromDevice) }.unwrap();
		domain.write(iova, &[0xee; 64]).unwrap();

		// Same page count, different length.
		assert!(domain.unmap_page(iova, 64, DmaDirection::FromDevice).is_err());
		assert!(domain.unmap_page(iova, 15, DmaDirection::FromDevice).is_err());
		assert!(domain.sync_for_cpu(iova, 64).is_err());
		assert!(domain.sync_for_cpu(iova + 8, 9).is_err());
		assert!(domain.sync_for_device(iova, 17).is_err());
		assert!(data.iter().all(|byte| *byte == 0));

		domain.sync_for_cpu(iova + 8, 8).unwrap();
		assert_eq!(data[..8], [0; 8]);
		assert_eq!(data[8..16], [0xee; 8]);

		domain.unmap_page(iova, 16, DmaDirection::FromDevice).unwrap();
		assert_eq!(data[..16], [0xee; 16]);
		assert!(data[16..].iter().all(|byte| *byte == 0));
		assert!(domain.sync_for_cpu(iova, 16).is_err());
	}

	#[test]
	fn test_set_map_keeps_domain_translations() {
		let domain = domain();
		let mut data = [0u8; 16];
		let iova =
			unsafe { domain.map_page(data.as_mut_ptr(), 16, DmaDirection::ToDevice) }.unwrap();
		let coherent = domain.alloc_coherent(100).unwrap();
		let user = |start| IotlbEntry {
			start,
			last: start + 0xfff,
			addr: 0x7f00_0000_0000,
			perm: AccessFlags::RO,
			file: Some(MapFile {
				file: domain.file().clone(),
				offset: 0,
			}),
		};

		domain.set_map([]).unwrap();
		assert!(domain.has_bounce_map());
		assert_eq!(domain.query(iova, iova).unwrap().offset, iova);
		assert_eq!(domain.query(coherent, coherent).unwrap().offset, coherent);

		let outside = coherent + 0x10_0000;
		domain.set_map([user(outside)]).unwrap();
		assert_eq!(domain.query(outside, outside).unwrap().perm, AccessFlags::RO);

		// Overlapping a domain translation fails and leaves only the domain's own.
		assert!(domain.set_map([user(outside), user(0x1000)]).is_err());
		assert!(domain.lookup(outside).is_none());
		assert!(domain.lookup(0x1000).is_some());
		assert!(domain.lookup(coherent).is_some());

		domain.set_map([user(outside)]).unwrap();
		domain.clear_map(0, u64::MAX);
		assert!(domain.lookup(outside).is_none());
		assert!(domain.query(iova, iova).is_ok());
		assert!(domain.query(coherent, coherent).is_ok());

		domain.unmap_page(iova, 16, DmaDirection::ToDevice).unwrap();
		let again =
			unsafe { domain.map_page(data.as_mut_ptr(), 16, DmaDirection::ToDevice) }.unwrap();
		assert!(domain.query(again, again).is_ok());
		domain.free_coherent(coherent, 100).unwrap();
		assert!(domain.query(coherent, coherent).is_err());
	}

	#[test]
	fn test_coherent() {
		let domain = domain();
		let iova = domain.alloc_coherent(100).unwrap();
		assert!(iova >= BOUNCE);

		domain.write(iova + 10, b"ring").unwrap();
		let mut buf = [0u8; 4];
		domain.read(iova + 10, &mut buf).unwrap();
		assert_eq!(&buf, b"ring");
		assert!(domain.read(iova + PAGE_SIZE as u64, &mut buf).is_err());

		let range = domain.query(iova, iova).unwrap();
		assert_eq!(range.offset, iova);
		assert_eq!(range.perm, AccessFlags::RW);

		assert!(domain.free_coherent(iova, 2 * PAGE_SIZE).is_err());
		domain.free_coherent(iova, 100).unwrap();
		assert!(domain.query(iova, iova).is_err());
	}

	#[test]
	fn test_query_clamps() {
		let domain = domain();
		domain
			.set_map([IotlbEntry {
				start: 0x10000,
				last: 0x1ffff,
				addr: 0x7f00_0000_0000,
				perm: AccessFlags::RO,
				file: Some(MapFile {
					file: domain.file().clone(),
					offset: 0x4000,
				}),
			}])
			.unwrap();

		let range = domain.query(0x18000, 0x30000).unwrap();
		assert_eq!((range.start, range.last), (0x18000, 0x1ffff));
		assert_eq!(range.offset, 0x4000 + 0x8000);
		assert_eq!(range.perm, AccessFlags::RO);

		let range = domain.query(0, u64::MAX).unwrap();
		assert_eq!((range.start, range.last), (0x10000, 0x1ffff));
		assert_eq!(range.offset, 0x4000);

		domain.clear_map(0, u64::MAX);
		assert!(domain.query(0, u64::MAX).is_err());
	}

	#[test]
	fn test_set_map_rejects_overlap() {
		let domain = domain();
		let entry = |start, last| IotlbEntry {
			start,
			last,
			addr: 0,
			perm: AccessFlags::RW,
			file: None,
		};
		assert!(
			domain
				.set_map([entry(0, 0xfff), entry(0x800, 0x1fff)])
				.is_err()
		);
		assert!(domain.lookup(0).is_none());
		assert!(domain.set_map([entry(0, VDUSE_IOVA_SIZE)]).is_err());
	}

	#[test]
	fn test_reset_bounce_map() {
		let domain = domain();
		let mut data = [0u8; 16];
		let iova =
			unsafe { domain.map_page(data.as_mut_ptr(), 16, DmaDirection::ToDevice) }.unwrap();
		assert!(domain.lookup(0).is_some());
		domain.reset_bounce_map();
		assert!(!domain.has_bounce_map());
		assert!(domain.lookup(0).is_none());
		domain.unmap_page(iova, 16, DmaDirection::ToDevice).unwrap();
	}

	#[test]
	fn test_user_bounce_pages() {
		let domain = domain();
		let mut data = vec![0xabu8; 32];
		let iova = unsafe {
			domain.map_page(data.as_mut_ptr(), data.len(), DmaDirection::Bidirectional)
		}
		.unwrap();

		let user = PageBuffer::new(BOUNCE as usize).unwrap();
		let Ok(region) = (unsafe { PinnedRegion::pin(user.as_ptr() as u64, user.len()) }) else {
			// Locked memory limit too low on this host.
			return;
		};
		domain.register_user_bounce_pages(region).unwrap();
		assert!(domain.has_user_bounce_pages());
		// The page in use moved over to user memory.
		assert_eq!(user.as_slice()[iova as usize], 0xab);

		domain.write(iova, &[0x11]).unwrap();
		assert_eq!(user.as_slice()[iova as usize], 0x11);

		let region = domain.deregister_user_bounce_pages().unwrap();
		drop(region);
		assert!(!domain.has_user_bounce_pages());
		domain
			.unmap_page(iova, data.len(), DmaDirection::Bidirectional)
			.unwrap();
		assert_eq!(data[0], 0x11);
		assert_eq!(data[1], 0xab);
	}

	#[test]
	fn test_user_bounce_size_mismatch() {
		let domain = domain();
		let user = PageBuffer::new(PAGE_SIZE).unwrap();
		let Ok(region) = (unsafe { PinnedRegion::pin(user.as_ptr() as u64, user.len()) }) else {
			return;
		};
		assert!(matches!(
			domain.register_user_bounce_pages(region),
			Err(VduseError::InvalidArgument(_))
		));
		assert!(!domain.has_user_bounce_pages());
	}
}
