//! The device control state machine.
//!
//! A [`Device`] is driven from two sides: the adapter (the guest-facing virtio transport) and the
//! userspace device implementation, which talks to it through a [`DeviceChannel`]. Requests from
//! the adapter that need userspace go through the [`MessageQueue`]. Kicks, interrupts and DMA
//! mappings never do.

use std::sync::{
	Arc, Mutex, MutexGuard, RwLock, Weak,
	atomic::{AtomicU8, AtomicU32, AtomicU64, Ordering},
};

use vduse_interface::{IovaCapability, Request};

use crate::{
	adapter::Adapter,
	channel::DeviceChannel,
	error::{Result, VduseError},
	iova::{IotlbRange, IovaDomain, iotlb::IotlbEntry},
	irq::{CpuMask, IrqWorkers, Work},
	mem::PinnedRegion,
	message::{CancelToken, MessageQueue},
	notify::Notifier,
	params::{BounceSize, DeviceConfig, MessageTimeout},
	stats::{DeviceEvent, DeviceStats, StatsSnapshot},
	virtio::{DeviceStatus, features},
	virtqueue::{IrqCallback, PackedState, VqAddresses, VqInfo, VqState, Virtqueue},
};

/// Driver status. Readers of `gate` may queue interrupts, status transitions hold it exclusively.
#[derive(Debug, Default)]
struct DriverState {
	status: AtomicU8,
	gate: RwLock<()>,
}

/// User memory registered as bounce buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Umem {
	/// Being pinned or copied, with the slot unlocked.
	Pending,
	Registered { iova: u64, size: u64 },
}

#[derive(Debug)]
struct DomainSlot {
	domain: Option<Arc<IovaDomain>>,
	bounce_size: u64,
	umem: Option<Umem>,
}

/// What [`DeviceChannel::iotlb_info`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IotlbInfo {
	pub capability: IovaCapability,
	pub bounce_size: u64,
}

pub struct Device {
	name: String,
	minor: u32,
	device_id: u32,
	vendor_id: u32,
	features: u64,
	config: Mutex<Vec<u8>>,
	vq_align: u32,
	driver: DriverState,
	driver_features: AtomicU64,
	generation: AtomicU32,
	vqs: Vec<Arc<Virtqueue>>,
	msgs: MessageQueue,
	connected: Mutex<bool>,
	adapter: Mutex<Option<Arc<Adapter>>>,
	domain: Mutex<DomainSlot>,
	config_cb: Mutex<Option<IrqCallback>>,
	config_inject: Arc<Work>,
	workers: Arc<IrqWorkers>,
	stats: Arc<DeviceStats>,
}

impl std::fmt::Debug for Device {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Device")
			.field("name", &self.name)
			.field("minor", &self.minor)
			.field("device_id", &self.device_id)
			.field("status", &self.status())
			.finish_non_exhaustive()
	}
}

impl Device {
	/// Creates a device from a validated configuration.
	pub(crate) fn new(
		config: DeviceConfig,
		minor: u32,
		bounce_size: BounceSize,
		timeout: MessageTimeout,
		workers: Arc<IrqWorkers>,
	) -> Arc<Self> {
		let stats = Arc::new(DeviceStats::new());
		let affinity = workers.cpus();
		Arc::new_cyclic(|weak: &Weak<Device>| {
			let vqs = (0..config.vq_num)
				.map(|index| {
					let dev = weak.clone();
					let inject = Work::new(format!("{}-vq{index}-irq", config.name), move || {
						if let Some(dev) = dev.upgrade() {
							dev.vq_irq_work(index);
						}
					});
					let dev = weak.clone();
					let kick = Work::new(format!("{}-vq{index}-kick", config.name), move || {
						if let Some(vq) = dev.upgrade().and_then(|dev| dev.vqs.get(index as usize).cloned()) {
							vq.kick_now();
						}
					});
					Arc::new(Virtqueue::new(
						index,
						affinity.clone(),
						inject,
						kick,
						stats.clone(),
					))
				})
				.collect();

			let dev = weak.clone();
			let config_inject = Work::new(format!("{}-config-irq", config.name), move || {
				if let Some(dev) = dev.upgrade() {
					dev.config_irq_work();
				}
			});

			Self {
				name: config.name,
				minor,
				device_id: config.device_id,
				vendor_id: config.vendor_id,
				features: config.features,
				config: Mutex::new(config.config),
				vq_align: config.vq_align,
				driver: DriverState::default(),
				driver_features: AtomicU64::new(0),
				generation: AtomicU32::new(0),
				vqs,
				msgs: MessageQueue::new(timeout, stats.clone()),
				connected: Mutex::new(false),
				adapter: Mutex::new(None),
				domain: Mutex::new(DomainSlot {
					domain: None,
					bounce_size: bounce_size.get(),
					umem: None,
				}),
				config_cb: Mutex::new(None),
				config_inject,
				workers,
				stats,
			}
		})
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn minor(&self) -> u32 {
		self.minor
	}

	pub fn device_id(&self) -> u32 {
		self.device_id
	}

	pub fn vendor_id(&self) -> u32 {
		self.vendor_id
	}

	pub fn vq_align(&self) -> u32 {
		self.vq_align
	}

	pub fn vq_num(&self) -> u32 {
		self.vqs.len() as u32
	}

	pub fn vq(&self, index: u32) -> Result<&Arc<Virtqueue>> {
		self.vqs
			.get(index as usize)
			.ok_or_else(|| VduseError::invalid(format!("invalid queue index {index}")))
	}

	pub fn stats(&self) -> StatsSnapshot {
		self.stats.snapshot(&self.name)
	}

	pub fn is_broken(&self) -> bool {
		self.msgs.is_broken()
	}

	pub fn is_connected(&self) -> bool {
		*self.connected.lock().unwrap()
	}

	pub fn is_bound(&self) -> bool {
		self.adapter.lock().unwrap().is_some()
	}

	pub(crate) fn messages(&self) -> &MessageQueue {
		&self.msgs
	}

	pub fn msg_timeout(&self) -> MessageTimeout {
		self.msgs.timeout()
	}

	pub fn set_msg_timeout(&self, timeout: MessageTimeout) {
		self.msgs.set_timeout(timeout);
	}

	fn domain_slot(&self) -> MutexGuard<'_, DomainSlot> {
		self.domain.lock().unwrap()
	}

	pub fn domain(&self) -> Option<Arc<IovaDomain>> {
		self.domain_slot().domain.clone()
	}

	fn require_domain(&self) -> Result<Arc<IovaDomain>> {
		self.domain()
			.ok_or_else(|| VduseError::invalid(format!("device {} is not bound", self.name)))
	}

	pub fn bounce_size(&self) -> u64 {
		self.domain_slot().bounce_size
	}

	/// Changes the bounce size of the domain created on the next bind.
	pub fn set_bounce_size(&self, bounce_size: BounceSize) -> Result<()> {
		let mut slot = self.domain_slot();
		if slot.domain.is_some() {
			return Err(VduseError::NotPermitted("IOVA domain already exists"));
		}
		slot.bounce_size = bounce_size.get();
		Ok(())
	}

	/// Connects the userspace device. Only one connection may exist at a time.
	pub fn open(self: &Arc<Self>) -> Result<DeviceChannel> {
		let mut connected = self.connected.lock().unwrap();
		if *connected {
			return Err(VduseError::Busy);
		}
		*connected = true;
		self.msgs.clear_broken();
		debug!("Device {} connected", self.name);
		Ok(DeviceChannel::new(self.clone()))
	}

	/// Disconnects the userspace device. Unanswered requests are kept for the next connection.
	pub(crate) fn release(&self) {
		let mut connected = self.connected.lock().unwrap();
		self.msgs.release();
		*connected = false;
		debug!("Device {} disconnected", self.name);
	}

	/// Sends `request` to userspace and waits for the answer.
	pub fn request(
		&self,
		request: Request,
		cancel: Option<&CancelToken>,
	) -> Result<vduse_interface::RawResponse> {
		self.msgs.send_and_wait(request, cancel)
	}

	// Adapter side

	pub fn device_features(&self) -> u64 {
		self.features
	}

	pub fn driver_features(&self) -> u64 {
		self.driver_features.load(Ordering::Acquire)
	}

	pub fn set_driver_features(&self, features: u64) {
		self.driver_features.store(features, Ordering::Release);
	}

	fn packed(&self) -> bool {
		features::has(self.driver_features(), features::VIRTIO_F_RING_PACKED)
	}

	pub fn status(&self) -> DeviceStatus {
		DeviceStatus::from_bits_retain(self.driver.status.load(Ordering::Acquire))
	}

	pub fn generation(&self) -> u32 {
		self.generation.load(Ordering::Acquire)
	}

	/// Propagates a new status to userspace and adopts it if userspace accepts.
	///
	/// Status 0 resets the device. Otherwise bits that are already set must stay set.
	pub fn set_status(&self, status: u8) -> Result<()> {
		if status == 0 {
			self.reset();
			return Ok(());
		}
		let current = self.status().bits();
		if status & current != current {
			return Err(VduseError::invalid(format!(
				"status {status:#x} drops bits of {current:#x}"
			)));
		}
		self.msgs
			.send_and_wait(Request::SetStatus { status }, None)?;
		let _gate = self.driver.gate.write().unwrap();
		self.driver.status.store(status, Ordering::Release);
		debug!("Device {} status {:?}", self.name, self.status());
		Ok(())
	}

	/// Returns the device to its initial state. Never fails.
	pub fn reset(&self) {
		if let Err(err) = self
			.msgs
			.send_and_wait(Request::SetStatus { status: 0 }, None)
		{
			warn!("Device {} did not acknowledge reset: {err}", self.name);
		}

		{
			let _gate = self.driver.gate.write().unwrap();
			self.driver.status.store(0, Ordering::Release);
			self.driver_features.store(0, Ordering::Release);
			self.generation.fetch_add(1, Ordering::AcqRel);

			*self.config_cb.lock().unwrap() = None;
			self.config_inject.flush();

			for vq in &self.vqs {
				vq.reset();
				vq.inject.flush();
				vq.kick_work.flush();
			}
		}

		if let Some(domain) = self.domain() {
			domain.reset_bounce_map();
		}
		debug!(
			"Device {} reset, generation {}",
			self.name,
			self.generation()
		);
	}

	/// Reads the configuration space, clamped to its size.
	pub fn get_config(&self, offset: usize, buf: &mut [u8]) -> usize {
		let config = self.config.lock().unwrap();
		if offset >= config.len() {
			return 0;
		}
		let len = buf.len().min(config.len() - offset);
		buf[..len].copy_from_slice(&config[offset..offset + len]);
		len
	}

	/// Configuration writes from the driver are ignored, the space is read-only.
	pub fn set_config_from_driver(&self, offset: usize, data: &[u8]) {
		trace!(
			"Ignoring driver write of {} bytes at config offset {offset}",
			data.len()
		);
	}

	pub fn config_size(&self) -> usize {
		self.config.lock().unwrap().len()
	}

	pub fn set_config_cb(&self, callback: Option<IrqCallback>) {
		*self.config_cb.lock().unwrap() = callback;
	}

	/// Largest queue size userspace set up.
	pub fn vq_num_max(&self) -> u32 {
		self.vqs.iter().map(|vq| vq.num_max()).max().unwrap_or(0)
	}

	pub fn set_vq_address(&self, index: u32, addresses: VqAddresses) -> Result<()> {
		self.vq(index)?.set_addresses(addresses);
		Ok(())
	}

	pub fn set_vq_num(&self, index: u32, num: u32) -> Result<()> {
		self.vq(index)?.set_num(num);
		Ok(())
	}

	pub fn set_vq_ready(&self, index: u32, ready: bool) -> Result<()> {
		self.vq(index)?.set_ready(ready);
		Ok(())
	}

	pub fn vq_ready(&self, index: u32) -> Result<bool> {
		Ok(self.vq(index)?.ready())
	}

	pub fn set_vq_state(&self, index: u32, state: VqState) -> Result<()> {
		self.vq(index)?.set_state(state);
		Ok(())
	}

	/// Fetches the live ring state from userspace.
	pub fn get_vq_state(&self, index: u32) -> Result<VqState> {
		self.vq(index)?;
		let resp = self
			.msgs
			.send_and_wait(Request::GetVqState { index }, None)?;
		Ok(if self.packed() {
			VqState::Packed(PackedState::from(resp.packed()).masked())
		} else {
			VqState::Split(resp.split().into())
		})
	}

	pub fn set_vq_cb(
		&self,
		index: u32,
		callback: Option<IrqCallback>,
		trigger: Option<Arc<dyn Notifier>>,
	) -> Result<()> {
		self.vq(index)?.set_callback(callback, trigger);
		Ok(())
	}

	pub fn set_vq_affinity(&self, index: u32, mask: CpuMask) -> Result<()> {
		self.vq(index)?.set_affinity(mask);
		Ok(())
	}

	pub fn vq_affinity(&self, index: u32) -> Result<CpuMask> {
		Ok(self.vq(index)?.affinity())
	}

	pub fn kick_vq(&self, index: u32) -> Result<()> {
		let vq = self.vq(index)?;
		if !vq.kick() {
			self.workers.queue(&vq.kick_work, None);
		}
		Ok(())
	}

	/// Replaces the translations and tells userspace. Rolled back if userspace cannot be told.
	pub fn set_map(&self, entries: Vec<IotlbEntry>) -> Result<()> {
		let domain = self.require_domain()?;
		domain.set_map(entries.iter().cloned())?;
		if let Err(err) = self.msgs.send_and_wait(
			Request::UpdateIotlb {
				start: 0,
				last: u64::MAX,
			},
			None,
		) {
			for entry in &entries {
				domain.clear_map(entry.start, entry.last);
			}
			return Err(err);
		}
		Ok(())
	}

	// Interrupt injection

	fn vq_irq_work(&self, index: u32) {
		let Some(vq) = self.vqs.get(index as usize) else {
			return;
		};
		if self.status().contains(DeviceStatus::DRIVER_OK) {
			vq.run_callback();
		} else {
			self.stats.increment_val(DeviceEvent::IrqDropped);
		}
	}

	fn config_irq_work(&self) {
		if !self.status().contains(DeviceStatus::DRIVER_OK) {
			self.stats.increment_val(DeviceEvent::IrqDropped);
			return;
		}
		let config_cb = self.config_cb.lock().unwrap();
		if let Some(callback) = config_cb.as_ref() {
			callback();
		}
	}

	fn queue_irq_work(&self, work: &Arc<Work>, cpu: Option<usize>) -> Result<()> {
		let _gate = self.driver.gate.read().unwrap();
		if !self.status().contains(DeviceStatus::DRIVER_OK) {
			return Err(VduseError::invalid("driver is not ready"));
		}
		if self.workers.queue(work, cpu) {
			self.stats.increment_val(DeviceEvent::IrqQueued);
		}
		Ok(())
	}

	// Userspace side

	pub(crate) fn set_config(&self, offset: usize, data: &[u8]) -> Result<()> {
		let mut config = self.config.lock().unwrap();
		if data.is_empty() || offset > config.len() || data.len() > config.len() - offset {
			return Err(VduseError::invalid(format!(
				"config write of {} bytes at {offset} out of bounds",
				data.len()
			)));
		}
		config[offset..offset + data.len()].copy_from_slice(data);
		Ok(())
	}

	pub(crate) fn inject_config_irq(&self) -> Result<()> {
		self.queue_irq_work(&self.config_inject, None)
	}

	pub(crate) fn setup_queue(&self, index: u32, max_size: u32) -> Result<()> {
		self.vq(index)?.set_num_max(max_size);
		Ok(())
	}

	pub(crate) fn queue_info(&self, index: u32) -> Result<VqInfo> {
		Ok(self.vq(index)?.info())
	}

	pub(crate) fn setup_kick(&self, index: u32, kickfd: Option<Arc<dyn Notifier>>) -> Result<()> {
		self.vq(index)?.set_kickfd(kickfd);
		Ok(())
	}

	pub(crate) fn set_kick_handler(
		&self,
		index: u32,
		handler: Option<Arc<dyn Notifier>>,
	) -> Result<()> {
		self.vq(index)?.set_immediate_kick(handler);
		Ok(())
	}

	pub(crate) fn inject_vq_irq(&self, index: u32) -> Result<()> {
		let vq = self.vq(index)?;
		if vq.signal_trigger() {
			return Ok(());
		}
		let cpu = vq.update_effective_cpu(|cpu| self.workers.is_online(cpu));
		self.queue_irq_work(&vq.inject, cpu)
	}

	/// Replaces the bounce pages with `size` bytes of user memory at `uaddr`.
	///
	/// # Safety
	///
	/// `uaddr..uaddr + size` must be a writable mapping that stays valid until it is deregistered
	/// or the device is unbound.
	pub(crate) unsafe fn register_bounce_memory(&self, uaddr: u64, iova: u64, size: u64) -> Result<()> {
		let domain = {
			let mut slot = self.domain_slot();
			let domain = slot
				.domain
				.clone()
				.filter(|domain| domain.has_bounce_map())
				.ok_or_else(|| VduseError::invalid("no bounce map to register memory for"))?;
			if size != domain.bounce_size()
				|| iova != 0
				|| uaddr % crate::consts::PAGE_SIZE as u64 != 0
			{
				return Err(VduseError::invalid(format!(
					"bounce memory must be {:#x} page aligned bytes at IOVA 0",
					domain.bounce_size()
				)));
			}
			if slot.umem.is_some() {
				return Err(VduseError::AlreadyExists("bounce memory".into()));
			}
			slot.umem = Some(Umem::Pending);
			domain
		};

		// Pinning may take long, the slot stays unlocked meanwhile.
		let res = unsafe { PinnedRegion::pin(uaddr, size as usize) }
			.and_then(|region| domain.register_user_bounce_pages(region));

		let mut slot = self.domain_slot();
		let current = slot
			.domain
			.as_ref()
			.is_some_and(|bound| Arc::ptr_eq(bound, &domain))
			&& slot.umem == Some(Umem::Pending);
		if !current {
			// Unbound while pinning.
			drop(slot);
			if res.is_ok() {
				drop(domain.deregister_user_bounce_pages()?);
			}
			return Err(VduseError::NoDevice(self.name.clone()));
		}
		if let Err(err) = res {
			slot.umem = None;
			return Err(err);
		}
		slot.umem = Some(Umem::Registered { iova, size });
		debug!("Device {} registered {size:#x} bytes of bounce memory", self.name);
		Ok(())
	}

	pub(crate) fn deregister_bounce_memory(&self, iova: u64, size: u64) -> Result<()> {
		let domain = {
			let mut slot = self.domain_slot();
			let domain = slot
				.domain
				.clone()
				.ok_or_else(|| VduseError::invalid("device is not bound"))?;
			if slot.umem != Some(Umem::Registered { iova, size }) {
				return Err(VduseError::invalid("no such bounce memory"));
			}
			slot.umem = Some(Umem::Pending);
			domain
		};

		let res = domain.deregister_user_bounce_pages();

		let mut slot = self.domain_slot();
		let current = slot
			.domain
			.as_ref()
			.is_some_and(|bound| Arc::ptr_eq(bound, &domain))
			&& slot.umem == Some(Umem::Pending);
		match res {
			Ok(region) => {
				if current {
					slot.umem = None;
				}
				drop(slot);
				drop(region);
				debug!("Device {} deregistered bounce memory", self.name);
				Ok(())
			}
			Err(err) => {
				if current {
					slot.umem = Some(Umem::Registered { iova, size });
				}
				Err(err)
			}
		}
	}

	pub(crate) fn query_iotlb(&self, start: u64, last: u64) -> Result<IotlbRange> {
		if last < start {
			return Err(VduseError::invalid("empty IOTLB range"));
		}
		self.require_domain()?.query(start, last)
	}

	pub(crate) fn iotlb_info(&self) -> Result<IotlbInfo> {
		let slot = self.domain_slot();
		let domain = slot
			.domain
			.as_ref()
			.ok_or_else(|| VduseError::invalid("device is not bound"))?;
		let mut capability = IovaCapability::empty();
		if domain.has_bounce_map() {
			capability |= IovaCapability::UMEM;
		}
		Ok(IotlbInfo {
			capability,
			bounce_size: slot.bounce_size,
		})
	}

	// Binding

	/// Attaches the adapter. Every queue must have been set up.
	pub(crate) fn bind(self: &Arc<Self>) -> Result<Arc<Adapter>> {
		let mut adapter = self.adapter.lock().unwrap();
		if adapter.is_some() {
			return Err(VduseError::AlreadyExists(format!(
				"adapter of {}",
				self.name
			)));
		}
		if let Some(vq) = self.vqs.iter().find(|vq| vq.num_max() == 0) {
			return Err(VduseError::invalid(format!(
				"queue {} of {} is not set up",
				vq.index(),
				self.name
			)));
		}

		{
			let mut slot = self.domain_slot();
			if slot.domain.is_none() {
				slot.domain = Some(Arc::new(IovaDomain::new(slot.bounce_size)?));
			}
		}

		let bound = Arc::new(Adapter::new(self.name.clone(), Arc::downgrade(self)));
		*adapter = Some(bound.clone());
		debug!("Device {} bound", self.name);
		Ok(bound)
	}

	/// Detaches the adapter, resets the device and destroys the IOVA domain.
	pub(crate) fn unbind(&self) -> Result<()> {
		let adapter = self
			.adapter
			.lock()
			.unwrap()
			.take()
			.ok_or_else(|| VduseError::invalid(format!("device {} is not bound", self.name)))?;
		self.reset();
		adapter.detach();

		let mut slot = self.domain_slot();
		let domain = slot.domain.take();
		// A pending registration notices the domain is gone and cleans up itself.
		let registered = matches!(slot.umem.take(), Some(Umem::Registered { .. }));
		drop(slot);
		if let (Some(domain), true) = (domain, registered) {
			if let Err(err) = domain.deregister_user_bounce_pages() {
				warn!("Could not return bounce pages of {}: {err}", self.name);
			}
		}
		debug!("Device {} unbound", self.name);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use std::{sync::atomic::AtomicUsize, time::Duration};

	use super::*;
	use crate::{consts::PAGE_SIZE, iova::DmaDirection, virtio::VIRTIO_ID_BLOCK};

	fn device(vq_num: u32) -> Arc<Device> {
		let config = DeviceConfig {
			name: "test".into(),
			device_id: VIRTIO_ID_BLOCK,
			vendor_id: 0,
			features: 1 << features::VIRTIO_F_ACCESS_PLATFORM,
			config: vec![1, 2, 3, 4],
			config_size: 4,
			vq_num,
			vq_align: PAGE_SIZE as u32,
		};
		Device::new(
			config,
			0,
			BounceSize::default(),
			MessageTimeout::new(Duration::from_millis(50)),
			Arc::new(IrqWorkers::new(Some(&[][..])).unwrap()),
		)
	}

	#[test]
	fn test_bind_requires_setup() {
		let dev = device(2);
		dev.setup_queue(0, 256).unwrap();
		assert!(matches!(dev.bind(), Err(VduseError::InvalidArgument(_))));
		assert!(dev.domain().is_none());

		dev.setup_queue(1, 128).unwrap();
		assert_eq!(dev.vq_num_max(), 256);
		let adapter = dev.bind().unwrap();
		assert!(dev.domain().is_some());
		assert!(matches!(dev.bind(), Err(VduseError::AlreadyExists(_))));

		assert!(matches!(
			dev.set_bounce_size(BounceSize::default()),
			Err(VduseError::NotPermitted(_))
		));

		dev.unbind().unwrap();
		assert!(dev.domain().is_none());
		assert!(matches!(adapter.device(), Err(VduseError::NoDevice(_))));
	}

	#[test]
	fn test_pending_bounce_registration() {
		let dev = device(1);
		dev.setup_queue(0, 8).unwrap();
		dev.bind().unwrap();
		let domain = dev.domain().unwrap();
		let mut data = [0u8; 8];
		let iova =
			unsafe { domain.map_page(data.as_mut_ptr(), 8, DmaDirection::ToDevice) }.unwrap();
		let size = domain.bounce_size();

		// Left behind by a registration that is still pinning.
		dev.domain_slot().umem = Some(Umem::Pending);
		assert!(dev.iotlb_info().is_ok());
		assert!(dev.query_iotlb(iova, iova).is_ok());
		assert!(matches!(
			unsafe { dev.register_bounce_memory(PAGE_SIZE as u64, 0, size) },
			Err(VduseError::AlreadyExists(_))
		));
		assert!(matches!(
			dev.deregister_bounce_memory(0, size),
			Err(VduseError::InvalidArgument(_))
		));

		domain.unmap_page(iova, 8, DmaDirection::ToDevice).unwrap();
		dev.unbind().unwrap();
		assert!(dev.domain_slot().umem.is_none());
		assert!(!domain.has_user_bounce_pages());
	}

	#[test]
	fn test_config_space() {
		let dev = device(1);
		let mut buf = [0u8; 8];
		assert_eq!(dev.get_config(1, &mut buf), 3);
		assert_eq!(&buf[..3], &[2, 3, 4]);
		assert_eq!(dev.get_config(4, &mut buf), 0);

		dev.set_config(2, &[9, 9]).unwrap();
		assert!(dev.set_config(3, &[9, 9]).is_err());
		assert!(dev.set_config(0, &[]).is_err());
		assert!(dev.set_config(5, &[1]).is_err());
		dev.set_config_from_driver(0, &[0xff]);
		assert_eq!(dev.get_config(0, &mut buf), 4);
		assert_eq!(&buf[..4], &[1, 2, 9, 9]);
		assert_eq!(dev.config_size(), 4);
	}

	#[test]
	fn test_irq_requires_driver_ok() {
		let dev = device(1);
		dev.setup_queue(0, 8).unwrap();
		assert!(matches!(
			dev.inject_config_irq(),
			Err(VduseError::InvalidArgument(_))
		));
		assert!(matches!(
			dev.inject_vq_irq(0),
			Err(VduseError::InvalidArgument(_))
		));
		assert!(dev.inject_vq_irq(1).is_err());
	}

	#[test]
	fn test_irq_delivery() {
		let dev = device(1);
		dev.setup_queue(0, 8).unwrap();
		dev.driver
			.status
			.store(DeviceStatus::DRIVER_OK.bits(), Ordering::Release);

		let calls = Arc::new(AtomicUsize::new(0));
		let c = calls.clone();
		dev.set_config_cb(Some(Arc::new(move || {
			c.fetch_add(1, Ordering::SeqCst);
		})));
		dev.inject_config_irq().unwrap();
		dev.config_inject.flush();
		assert_eq!(calls.load(Ordering::SeqCst), 1);

		let c = calls.clone();
		dev.set_vq_cb(
			0,
			Some(Arc::new(move || {
				c.fetch_add(10, Ordering::SeqCst);
			})),
			None,
		)
		.unwrap();
		dev.inject_vq_irq(0).unwrap();
		dev.vq(0).unwrap().inject.flush();
		// Queue not ready: the callback is skipped.
		assert_eq!(calls.load(Ordering::SeqCst), 1);

		dev.set_vq_ready(0, true).unwrap();
		dev.inject_vq_irq(0).unwrap();
		dev.vq(0).unwrap().inject.flush();
		assert_eq!(calls.load(Ordering::SeqCst), 11);
		assert_eq!(dev.stats().get(DeviceEvent::IrqQueued), 3);
	}

	#[test]
	fn test_status_cannot_drop_bits() {
		let dev = device(1);
		dev.driver.status.store(
			(DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER).bits(),
			Ordering::Release,
		);
		assert!(matches!(
			dev.set_status(DeviceStatus::ACKNOWLEDGE.bits()),
			Err(VduseError::InvalidArgument(_))
		));
		assert_eq!(dev.messages().pending(), (0, 0));
	}

	#[test]
	fn test_reset_without_userspace() {
		let dev = device(1);
		dev.setup_queue(0, 8).unwrap();
		dev.set_vq_ready(0, true).unwrap();
		dev.set_driver_features(1 << features::VIRTIO_F_VERSION_1);

		// Nobody answers: the reset request times out, the reset still happens.
		dev.reset();
		assert_eq!(dev.generation(), 1);
		assert_eq!(dev.driver_features(), 0);
		assert!(!dev.vq_ready(0).unwrap());
		assert!(dev.is_broken());
	}
}
