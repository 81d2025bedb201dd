//! The registry of devices and the management commands operating on it.

use std::{
	collections::{BTreeMap, HashMap},
	sync::{Arc, Mutex, MutexGuard, Weak},
};

use crate::{
	adapter::Adapter,
	consts::VDUSE_DEV_MAX,
	device::Device,
	error::{Result, VduseError},
	irq::IrqWorkers,
	params::{DeviceConfig, Params},
};

#[derive(Debug, Default)]
struct Registry {
	by_name: HashMap<String, Arc<Device>>,
	by_minor: BTreeMap<u32, Weak<Device>>,
}

impl Registry {
	/// Smallest minor number not in use.
	fn free_minor(&self) -> Option<u32> {
		let mut candidate = 0;
		for &minor in self.by_minor.keys() {
			if minor != candidate {
				break;
			}
			candidate += 1;
		}
		(candidate < VDUSE_DEV_MAX).then_some(candidate)
	}
}

/// Owns all devices and the IRQ workers they share.
#[derive(Debug)]
pub struct DeviceManager {
	registry: Mutex<Registry>,
	workers: Arc<IrqWorkers>,
	params: Params,
}

impl DeviceManager {
	pub fn new(params: Params) -> Result<Self> {
		let workers = IrqWorkers::new(params.irq_cpus.as_deref())?;
		Ok(Self {
			registry: Mutex::default(),
			workers: Arc::new(workers),
			params,
		})
	}

	fn registry(&self) -> MutexGuard<'_, Registry> {
		self.registry.lock().unwrap()
	}

	pub fn params(&self) -> &Params {
		&self.params
	}

	/// Validates `config` and registers a new device.
	pub fn create_device(&self, config: DeviceConfig) -> Result<Arc<Device>> {
		config.validate()?;

		let mut registry = self.registry();
		if registry.by_name.contains_key(&config.name) {
			return Err(VduseError::AlreadyExists(config.name));
		}
		let minor = registry
			.free_minor()
			.ok_or(VduseError::Os(nix::errno::Errno::ENOSPC))?;

		let name = config.name.clone();
		let device = Device::new(
			config,
			minor,
			self.params.bounce_size,
			self.params.msg_timeout,
			self.workers.clone(),
		);
		registry.by_name.insert(name.clone(), device.clone());
		registry.by_minor.insert(minor, Arc::downgrade(&device));
		info!("Created device {name} (minor {minor})");
		Ok(device)
	}

	/// Removes a device. It must be neither connected nor bound.
	pub fn destroy_device(&self, name: &str) -> Result<()> {
		let mut registry = self.registry();
		let device = registry
			.by_name
			.get(name)
			.ok_or_else(|| VduseError::NoDevice(name.to_owned()))?;
		if device.is_connected() || device.is_bound() {
			return Err(VduseError::Busy);
		}
		let minor = device.minor();
		registry.by_name.remove(name);
		registry.by_minor.remove(&minor);
		info!("Destroyed device {name}");
		Ok(())
	}

	/// Attaches the virtio transport to a device, creating its IOVA domain.
	pub fn bind_adapter(&self, name: &str) -> Result<Arc<Adapter>> {
		self.get(name)?.bind()
	}

	/// Detaches the virtio transport, resetting the device and destroying its IOVA domain.
	pub fn unbind_adapter(&self, name: &str) -> Result<()> {
		self.get(name)?.unbind()
	}

	pub fn get(&self, name: &str) -> Result<Arc<Device>> {
		self.registry()
			.by_name
			.get(name)
			.cloned()
			.ok_or_else(|| VduseError::NoDevice(name.to_owned()))
	}

	pub fn by_minor(&self, minor: u32) -> Result<Arc<Device>> {
		self.registry()
			.by_minor
			.get(&minor)
			.and_then(Weak::upgrade)
			.ok_or_else(|| VduseError::NoDevice(format!("minor {minor}")))
	}

	/// Names of all devices.
	pub fn devices(&self) -> Vec<String> {
		let mut names: Vec<_> = self.registry().by_name.keys().cloned().collect();
		names.sort();
		names
	}
}
