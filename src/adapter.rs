//! The guest-facing side of a bound device.

use std::sync::{Arc, Mutex, Weak};

use crate::{
	device::Device,
	error::{Result, VduseError},
	iova::{IovaDomain, iotlb::IotlbEntry},
	virtqueue::VqState,
};

/// Handle the virtio transport uses to drive a device.
///
/// The adapter only holds a weak reference. Once the device is unbound or destroyed every operation
/// fails with [`VduseError::NoDevice`].
#[derive(Debug)]
pub struct Adapter {
	name: String,
	device: Mutex<Weak<Device>>,
}

impl Adapter {
	pub(crate) fn new(name: String, device: Weak<Device>) -> Self {
		Self {
			name,
			device: Mutex::new(device),
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// Breaks the link to the device.
	pub(crate) fn detach(&self) {
		*self.device.lock().unwrap() = Weak::new();
	}

	pub fn device(&self) -> Result<Arc<Device>> {
		self.device
			.lock()
			.unwrap()
			.upgrade()
			.ok_or_else(|| VduseError::NoDevice(self.name.clone()))
	}

	pub fn domain(&self) -> Result<Arc<IovaDomain>> {
		self.device()?
			.domain()
			.ok_or_else(|| VduseError::NoDevice(self.name.clone()))
	}

	pub fn set_status(&self, status: u8) -> Result<()> {
		self.device()?.set_status(status)
	}

	pub fn reset(&self) -> Result<()> {
		self.device()?.reset();
		Ok(())
	}

	pub fn kick_vq(&self, index: u32) -> Result<()> {
		self.device()?.kick_vq(index)
	}

	pub fn get_vq_state(&self, index: u32) -> Result<VqState> {
		self.device()?.get_vq_state(index)
	}

	pub fn set_map(&self, entries: Vec<IotlbEntry>) -> Result<()> {
		self.device()?.set_map(entries)
	}
}
