//! The userspace device's connection to a [`Device`].

use std::{
	io::Write,
	sync::{
		Arc,
		atomic::{AtomicBool, Ordering},
	},
	time::Duration,
};

use vduse_interface::{REQUEST_SIZE, RawRequest, RawResponse};
use zerocopy::IntoBytes;

use crate::{
	device::{Device, IotlbInfo},
	error::{Result, VduseError},
	iova::IotlbRange,
	notify::Notifier,
	virtqueue::VqInfo,
};

/// An open connection of the userspace device. Dropping it disconnects.
///
/// Requests are read and responses written one fixed-size record at a time.
#[derive(Debug)]
pub struct DeviceChannel {
	device: Arc<Device>,
	nonblocking: AtomicBool,
}

impl DeviceChannel {
	pub(crate) fn new(device: Arc<Device>) -> Self {
		Self {
			device,
			nonblocking: AtomicBool::new(false),
		}
	}

	pub fn device(&self) -> &Arc<Device> {
		&self.device
	}

	pub fn set_nonblocking(&self, nonblocking: bool) {
		self.nonblocking.store(nonblocking, Ordering::Relaxed);
	}

	fn nonblocking(&self) -> bool {
		self.nonblocking.load(Ordering::Relaxed)
	}

	/// Reads one request record into `buf`, which must hold exactly [`REQUEST_SIZE`] bytes.
	pub fn read_request(&self, buf: &mut [u8]) -> Result<usize> {
		if buf.len() != REQUEST_SIZE {
			return Err(vduse_interface::DecodeError::Size {
				expected: REQUEST_SIZE,
				actual: buf.len(),
			}
			.into());
		}
		self.device
			.messages()
			.dequeue_request(self.nonblocking(), |req| {
				buf.copy_from_slice(req.as_bytes());
				Ok(())
			})?;
		Ok(REQUEST_SIZE)
	}

	/// Writes one request record to `out`. A failed write leaves the request queued.
	pub fn read_request_into<W: Write>(&self, out: &mut W) -> Result<RawRequest> {
		self.device
			.messages()
			.dequeue_request(self.nonblocking(), |req| out.write_all(req.as_bytes()))
	}

	/// Takes the next request record.
	pub fn next_request(&self) -> Result<RawRequest> {
		self.device
			.messages()
			.dequeue_request(self.nonblocking(), |_| Ok(()))
	}

	/// Accepts one response record. Partial or dirty records are rejected.
	pub fn write_response(&self, record: &[u8]) -> Result<usize> {
		let resp = RawResponse::from_record(record)?;
		self.device.messages().complete(resp)?;
		Ok(record.len())
	}

	pub fn respond(&self, resp: RawResponse) -> Result<()> {
		self.write_response(resp.as_bytes()).map(drop)
	}

	/// Waits until a request is readable. `None` waits forever.
	pub fn poll(&self, timeout: Option<Duration>) -> bool {
		self.device.messages().poll(timeout)
	}

	/// Features the driver accepted.
	pub fn get_features(&self) -> u64 {
		self.device.driver_features()
	}

	/// Updates part of the configuration space.
	pub fn set_config(&self, offset: usize, data: &[u8]) -> Result<()> {
		self.device.set_config(offset, data)
	}

	pub fn inject_config_irq(&self) -> Result<()> {
		self.device.inject_config_irq()
	}

	pub fn setup_queue(&self, index: u32, max_size: u32) -> Result<()> {
		self.device.setup_queue(index, max_size)
	}

	pub fn queue_info(&self, index: u32) -> Result<VqInfo> {
		self.device.queue_info(index)
	}

	/// Registers where kicks of queue `index` go. `None` removes the kick source.
	pub fn setup_kick(&self, index: u32, kickfd: Option<Arc<dyn Notifier>>) -> Result<()> {
		self.device.setup_kick(index, kickfd)
	}

	/// Registers a handler that is invoked synchronously on every kick of queue `index`.
	pub fn set_kick_handler(&self, index: u32, handler: Option<Arc<dyn Notifier>>) -> Result<()> {
		self.device.set_kick_handler(index, handler)
	}

	pub fn inject_vq_irq(&self, index: u32) -> Result<()> {
		self.device.inject_vq_irq(index)
	}

	/// Uses `size` bytes of memory at `uaddr` as bounce buffer, mapped at `iova`.
	///
	/// # Safety
	///
	/// The memory must stay mapped until [`deregister_bounce_memory`](Self::deregister_bounce_memory)
	/// or until the device is unbound, and must not be freed while registered.
	pub unsafe fn register_bounce_memory(&self, uaddr: u64, iova: u64, size: u64) -> Result<()> {
		unsafe { self.device.register_bounce_memory(uaddr, iova, size) }
	}

	pub fn deregister_bounce_memory(&self, iova: u64, size: u64) -> Result<()> {
		self.device.deregister_bounce_memory(iova, size)
	}

	pub fn query_iotlb(&self, start: u64, last: u64) -> Result<IotlbRange> {
		self.device.query_iotlb(start, last)
	}

	pub fn iotlb_info(&self) -> Result<IotlbInfo> {
		self.device.iotlb_info()
	}

	/// Reads DMA memory of the device's IOVA domain.
	pub fn read_iova(&self, iova: u64, buf: &mut [u8]) -> Result<()> {
		self.domain()?.read(iova, buf)
	}

	/// Writes DMA memory of the device's IOVA domain.
	pub fn write_iova(&self, iova: u64, data: &[u8]) -> Result<()> {
		self.domain()?.write(iova, data)
	}

	fn domain(&self) -> Result<Arc<crate::iova::IovaDomain>> {
		self.device
			.domain()
			.ok_or_else(|| VduseError::invalid("device is not bound"))
	}
}

impl Drop for DeviceChannel {
	fn drop(&mut self) {
		self.device.release();
	}
}
