//! Page-granular memory used as bounce storage: anonymous kernel-side pages and pinned user memory.

use std::{
	num::NonZeroUsize,
	os::raw::c_void,
	ptr::NonNull,
	sync::atomic::{AtomicU64, Ordering},
};

use align_address::Align;
use nix::{
	sys::{
		mman::{MapFlags, ProtFlags, mlock, mmap_anonymous, munlock, munmap},
		resource::{Resource, getrlimit},
	},
	unistd::geteuid,
};
use thiserror::Error;

use crate::{
	consts::PAGE_SIZE,
	error::{Result, VduseError},
};

/// Pages currently locked through [`PinnedRegion`] by this process.
static PINNED_PAGES: AtomicU64 = AtomicU64::new(0);

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
	#[error("Memory bounds exceeded")]
	BoundsViolation,
	#[error("Address {0:#x} is not page aligned")]
	Unaligned(u64),
	#[error("Zero sized region")]
	Empty,
}

/// Checks that `offset..offset + len` lies within `size`.
fn check_range(offset: usize, len: usize, size: usize) -> std::result::Result<(), MemoryError> {
	match offset.checked_add(len) {
		Some(end) if end <= size => Ok(()),
		_ => Err(MemoryError::BoundsViolation),
	}
}

/// Zero-initialized anonymous memory, a whole number of pages long.
#[derive(Debug)]
pub struct PageBuffer {
	ptr: NonNull<c_void>,
	size: usize,
}

// SAFETY: the mapping is owned exclusively by this struct, access goes through `&self`/`&mut self`.
unsafe impl Send for PageBuffer {}
unsafe impl Sync for PageBuffer {}

impl PageBuffer {
	/// Allocates `size` bytes, rounded up to the page size.
	pub fn new(size: usize) -> Result<Self> {
		let size = size.align_up(PAGE_SIZE);
		let length = NonZeroUsize::new(size).ok_or(MemoryError::Empty)?;
		let ptr = unsafe {
			mmap_anonymous(
				None,
				length,
				ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
				MapFlags::MAP_PRIVATE | MapFlags::MAP_NORESERVE,
			)?
		};
		Ok(Self { ptr, size })
	}

	pub fn len(&self) -> usize {
		self.size
	}

	pub fn is_empty(&self) -> bool {
		self.size == 0
	}

	pub fn as_ptr(&self) -> *mut u8 {
		self.ptr.as_ptr().cast()
	}

	pub fn as_slice(&self) -> &[u8] {
		unsafe { std::slice::from_raw_parts(self.as_ptr(), self.size) }
	}

	pub fn as_mut_slice(&mut self) -> &mut [u8] {
		unsafe { std::slice::from_raw_parts_mut(self.as_ptr(), self.size) }
	}

	/// Copies `buf.len()` bytes starting at `offset` into `buf`.
	pub fn read(&self, offset: usize, buf: &mut [u8]) -> std::result::Result<(), MemoryError> {
		check_range(offset, buf.len(), self.size)?;
		buf.copy_from_slice(&self.as_slice()[offset..offset + buf.len()]);
		Ok(())
	}

	/// Copies `data` into the buffer starting at `offset`.
	pub fn write(&mut self, offset: usize, data: &[u8]) -> std::result::Result<(), MemoryError> {
		check_range(offset, data.len(), self.size)?;
		self.as_mut_slice()[offset..offset + data.len()].copy_from_slice(data);
		Ok(())
	}
}

impl Drop for PageBuffer {
	fn drop(&mut self) {
		if let Err(err) = unsafe { munmap(self.ptr, self.size) } {
			error!("Could not unmap page buffer: {err}");
		}
	}
}

/// Number of pages the calling process may lock, `None` when unlimited.
fn memlock_limit_pages() -> Result<Option<u64>> {
	if geteuid().is_root() {
		return Ok(None);
	}
	let (soft, _hard) = getrlimit(Resource::RLIMIT_MEMLOCK)?;
	if soft == libc::RLIM_INFINITY {
		return Ok(None);
	}
	Ok(Some(soft / PAGE_SIZE as u64))
}

/// Pages locked by all live [`PinnedRegion`]s of this process.
pub fn pinned_pages() -> u64 {
	PINNED_PAGES.load(Ordering::Relaxed)
}

/// User memory locked into RAM for the lifetime of this handle.
///
/// The memory itself stays owned by whoever mapped it. Pinning is accounted against
/// `RLIMIT_MEMLOCK` unless the process is privileged.
#[derive(Debug)]
pub struct PinnedRegion {
	ptr: NonNull<c_void>,
	size: usize,
}

unsafe impl Send for PinnedRegion {}
unsafe impl Sync for PinnedRegion {}

impl PinnedRegion {
	/// Locks `size` bytes at `addr`.
	///
	/// # Safety
	///
	/// `addr..addr + size` must be a readable and writable mapping that outlives the returned
	/// handle and is not accessed through other references while pinned.
	pub unsafe fn pin(addr: u64, size: usize) -> Result<Self> {
		if addr.align_down(PAGE_SIZE as u64) != addr {
			return Err(MemoryError::Unaligned(addr).into());
		}
		if size == 0 || size % PAGE_SIZE != 0 {
			return Err(VduseError::invalid("pinned size must be a nonzero multiple of the page size"));
		}
		let ptr = NonNull::new(addr as *mut c_void)
			.ok_or_else(|| VduseError::invalid("cannot pin the null page"))?;

		let npages = (size / PAGE_SIZE) as u64;
		let limit = memlock_limit_pages()?;
		let locked = PINNED_PAGES.fetch_add(npages, Ordering::AcqRel) + npages;
		if limit.is_some_and(|limit| locked > limit) {
			PINNED_PAGES.fetch_sub(npages, Ordering::AcqRel);
			return Err(VduseError::LockLimit);
		}

		if let Err(err) = unsafe { mlock(ptr, size) } {
			PINNED_PAGES.fetch_sub(npages, Ordering::AcqRel);
			return Err(err.into());
		}
		debug!("Pinned {npages} pages at {addr:#x}");
		Ok(Self { ptr, size })
	}

	pub fn len(&self) -> usize {
		self.size
	}

	pub fn is_empty(&self) -> bool {
		self.size == 0
	}

	pub fn addr(&self) -> u64 {
		self.ptr.as_ptr() as u64
	}

	/// Mutable view of the page with index `page`.
	///
	/// # Safety
	///
	/// No other reference to this page may exist while the returned slice is alive.
	#[expect(clippy::mut_from_ref)]
	pub unsafe fn page_mut(&self, page: usize) -> std::result::Result<&mut [u8], MemoryError> {
		check_range(page * PAGE_SIZE, PAGE_SIZE, self.size)?;
		Ok(unsafe {
			std::slice::from_raw_parts_mut(
				self.ptr.as_ptr().cast::<u8>().add(page * PAGE_SIZE),
				PAGE_SIZE,
			)
		})
	}
}

impl Drop for PinnedRegion {
	fn drop(&mut self) {
		if let Err(err) = unsafe { munlock(self.ptr, self.size) } {
			warn!("Could not unlock pinned region at {:#x}: {err}", self.addr());
		}
		PINNED_PAGES.fetch_sub((self.size / PAGE_SIZE) as u64, Ordering::AcqRel);
	}
}
