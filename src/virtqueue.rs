//! Per-queue state shared by the adapter and the userspace device.
//!
//! The kick path and the interrupt path are guarded by separate locks so kicking never waits for
//! callback reconfiguration.

use std::{
	fmt,
	sync::{
		Arc, Mutex,
		atomic::{AtomicBool, Ordering},
	},
};

use vduse_interface::parameters::{VqStatePackedParams, VqStateSplitParams};

use crate::{
	consts::{PACKED_IDX_MASK, WRAP_COUNTER_MASK},
	irq::{CpuMask, Work},
	notify::{self, Notifier},
	stats::{DeviceEvent, DeviceStats},
};

/// Interrupt callback registered by the adapter. Captures its own context.
pub type IrqCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SplitState {
	pub avail_index: u16,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PackedState {
	pub last_avail_counter: u16,
	pub last_avail_idx: u16,
	pub last_used_counter: u16,
	pub last_used_idx: u16,
}

impl PackedState {
	/// Drops bits outside the valid widths: 15 bit indices and 1 bit wrap counters.
	pub fn masked(self) -> Self {
		Self {
			last_avail_counter: self.last_avail_counter & WRAP_COUNTER_MASK,
			last_avail_idx: self.last_avail_idx & PACKED_IDX_MASK,
			last_used_counter: self.last_used_counter & WRAP_COUNTER_MASK,
			last_used_idx: self.last_used_idx & PACKED_IDX_MASK,
		}
	}
}

impl From<VqStatePackedParams> for PackedState {
	fn from(params: VqStatePackedParams) -> Self {
		Self {
			last_avail_counter: params.last_avail_counter,
			last_avail_idx: params.last_avail_idx,
			last_used_counter: params.last_used_counter,
			last_used_idx: params.last_used_idx,
		}
	}
}

impl From<VqStateSplitParams> for SplitState {
	fn from(params: VqStateSplitParams) -> Self {
		Self {
			avail_index: params.avail_index,
		}
	}
}

/// Ring progress, interpreted according to the negotiated ring layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VqState {
	Split(SplitState),
	Packed(PackedState),
}

impl Default for VqState {
	fn default() -> Self {
		Self::Split(SplitState::default())
	}
}

/// Ring addresses as seen by the device, all IOVAs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VqAddresses {
	pub desc_addr: u64,
	pub driver_addr: u64,
	pub device_addr: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct RingConfig {
	num_max: u32,
	num: u32,
	addresses: VqAddresses,
	state: VqState,
}

/// Snapshot returned by [`Virtqueue::info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VqInfo {
	pub index: u32,
	pub num_max: u32,
	pub num: u32,
	pub addresses: VqAddresses,
	pub state: VqState,
	pub ready: bool,
}

#[derive(Default)]
struct KickState {
	/// Invoked synchronously on every kick, bypassing the eventfd path.
	immediate: Option<Arc<dyn Notifier>>,
	kickfd: Option<Arc<dyn Notifier>>,
	/// A kick arrived while no kickfd was registered.
	kicked: bool,
}

#[derive(Default)]
struct CallbackConfig {
	callback: Option<IrqCallback>,
	trigger: Option<Arc<dyn Notifier>>,
}

#[derive(Debug, Default)]
struct Affinity {
	mask: CpuMask,
	effective: Option<usize>,
}

pub struct Virtqueue {
	index: u32,
	ring: Mutex<RingConfig>,
	ready: AtomicBool,
	kick: Mutex<KickState>,
	irq: Mutex<CallbackConfig>,
	affinity: Mutex<Affinity>,
	pub(crate) inject: Arc<Work>,
	pub(crate) kick_work: Arc<Work>,
	stats: Arc<DeviceStats>,
}

impl fmt::Debug for Virtqueue {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("Virtqueue")
			.field("index", &self.index)
			.field("ready", &self.ready())
			.finish_non_exhaustive()
	}
}

impl Virtqueue {
	pub(crate) fn new(
		index: u32,
		affinity: CpuMask,
		inject: Arc<Work>,
		kick_work: Arc<Work>,
		stats: Arc<DeviceStats>,
	) -> Self {
		Self {
			index,
			ring: Default::default(),
			ready: AtomicBool::new(false),
			kick: Default::default(),
			irq: Default::default(),
			affinity: Mutex::new(Affinity {
				mask: affinity,
				effective: None,
			}),
			inject,
			kick_work,
			stats,
		}
	}

	pub fn index(&self) -> u32 {
		self.index
	}

	pub fn num_max(&self) -> u32 {
		self.ring.lock().unwrap().num_max
	}

	pub(crate) fn set_num_max(&self, num_max: u32) {
		self.ring.lock().unwrap().num_max = num_max;
	}

	pub fn set_num(&self, num: u32) {
		self.ring.lock().unwrap().num = num;
	}

	pub fn set_addresses(&self, addresses: VqAddresses) {
		self.ring.lock().unwrap().addresses = addresses;
	}

	pub fn addresses(&self) -> VqAddresses {
		self.ring.lock().unwrap().addresses
	}

	/// Only queues with a nonzero maximum size can become ready.
	pub fn set_ready(&self, ready: bool) {
		if ready && self.num_max() == 0 {
			warn!("Queue {} has not been set up, ignoring ready", self.index);
			return;
		}
		self.ready.store(ready, Ordering::Release);
	}

	pub fn ready(&self) -> bool {
		self.ready.load(Ordering::Acquire)
	}

	/// Sets the locally cached ring state. No message is exchanged.
	pub fn set_state(&self, state: VqState) {
		self.ring.lock().unwrap().state = state;
	}

	pub fn info(&self) -> VqInfo {
		let ring = *self.ring.lock().unwrap();
		VqInfo {
			index: self.index,
			num_max: ring.num_max,
			num: ring.num,
			addresses: ring.addresses,
			state: ring.state,
			ready: self.ready(),
		}
	}

	/// Notifies the device that the driver made buffers available.
	///
	/// Returns `false` if the kick has to be deferred because the current context may not signal.
	pub(crate) fn kick(&self) -> bool {
		let immediate = self.kick.lock().unwrap().immediate.clone();
		if let Some(immediate) = immediate {
			if let Err(err) = immediate.notify() {
				warn!("Immediate kick of queue {} failed: {err}", self.index);
			}
			return true;
		}
		if !notify::signal_allowed() {
			self.stats.increment_val(DeviceEvent::KickDeferred);
			return false;
		}
		self.kick_now();
		true
	}

	/// Signals the kickfd, or remembers the kick until one is registered.
	pub(crate) fn kick_now(&self) {
		let mut guard = self.kick.lock().unwrap();
		let kick = &mut *guard;
		if !self.ready() {
			return;
		}
		match &kick.kickfd {
			Some(kickfd) => {
				if let Err(err) = notify::signal(kickfd.as_ref()) {
					warn!("Kick of queue {} failed: {err}", self.index);
				}
				self.stats.increment_val(DeviceEvent::KickSignalled);
			}
			None => {
				kick.kicked = true;
				self.stats.increment_val(DeviceEvent::KickCoalesced);
			}
		}
	}

	/// Replaces the kickfd. A kick that arrived without one is delivered to the new kickfd.
	pub fn set_kickfd(&self, kickfd: Option<Arc<dyn Notifier>>) {
		let mut guard = self.kick.lock().unwrap();
		let kick = &mut *guard;
		kick.kickfd = kickfd;
		if let Some(kickfd) = &kick.kickfd {
			if self.ready() && kick.kicked {
				debug!("Delivering pending kick of queue {}", self.index);
				if let Err(err) = notify::signal(kickfd.as_ref()) {
					warn!("Kick of queue {} failed: {err}", self.index);
				}
				kick.kicked = false;
			}
		}
	}

	pub fn set_immediate_kick(&self, notifier: Option<Arc<dyn Notifier>>) {
		self.kick.lock().unwrap().immediate = notifier;
	}

	pub fn kicked(&self) -> bool {
		self.kick.lock().unwrap().kicked
	}

	/// Swaps callback and trigger. Never invokes either.
	pub fn set_callback(&self, callback: Option<IrqCallback>, trigger: Option<Arc<dyn Notifier>>) {
		let mut irq = self.irq.lock().unwrap();
		irq.callback = callback;
		irq.trigger = trigger;
	}

	/// Signals the trigger of a ready queue directly. Returns `false` if there is none.
	pub(crate) fn signal_trigger(&self) -> bool {
		let irq = self.irq.lock().unwrap();
		match &irq.trigger {
			Some(trigger) if self.ready() => {
				if let Err(err) = notify::signal(trigger.as_ref()) {
					warn!("IRQ trigger of queue {} failed: {err}", self.index);
				}
				self.stats.increment_val(DeviceEvent::IrqSignalled);
				true
			}
			_ => false,
		}
	}

	/// Runs the callback if the queue is still ready. Called from injection work.
	pub(crate) fn run_callback(&self) {
		let irq = self.irq.lock().unwrap();
		match &irq.callback {
			Some(callback) if self.ready() => callback(),
			_ => self.stats.increment_val(DeviceEvent::IrqDropped),
		}
	}

	pub fn set_affinity(&self, mask: CpuMask) {
		self.affinity.lock().unwrap().mask = mask;
	}

	pub fn affinity(&self) -> CpuMask {
		self.affinity.lock().unwrap().mask.clone()
	}

	pub fn effective_cpu(&self) -> Option<usize> {
		self.affinity.lock().unwrap().effective
	}

	/// Advances the effective CPU to the next online CPU of the mask.
	pub(crate) fn update_effective_cpu(&self, online: impl Fn(usize) -> bool) -> Option<usize> {
		let mut affinity = self.affinity.lock().unwrap();
		affinity.effective = affinity.mask.next_after(affinity.effective, online);
		affinity.effective
	}

	/// Clears everything the driver configured. Pending work must be flushed by the caller.
	pub(crate) fn reset(&self) {
		self.ready.store(false, Ordering::Release);
		{
			let mut ring = self.ring.lock().unwrap();
			ring.num = 0;
			ring.addresses = VqAddresses::default();
			ring.state = VqState::default();
		}
		{
			let mut kick = self.kick.lock().unwrap();
			kick.kickfd = None;
			kick.kicked = false;
		}
		self.set_callback(None, None);
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::AtomicUsize;

	use super::*;
	use crate::notify::FnNotifier;

	fn vq() -> Virtqueue {
		let noop = || Work::new("noop", || {});
		Virtqueue::new(
			0,
			CpuMask::new([0, 1]),
			noop(),
			noop(),
			Arc::new(DeviceStats::new()),
		)
	}

	fn counter() -> (Arc<AtomicUsize>, Arc<dyn Notifier>) {
		let count = Arc::new(AtomicUsize::new(0));
		let c = count.clone();
		(
			count,
			Arc::new(FnNotifier(move || {
				c.fetch_add(1, Ordering::SeqCst);
			})),
		)
	}

	#[test]
	fn test_ready_requires_num_max() {
		let vq = vq();
		vq.set_ready(true);
		assert!(!vq.ready());
		vq.set_num_max(256);
		vq.set_ready(true);
		assert!(vq.ready());
		assert_eq!(vq.info().num_max, 256);
	}

	#[test]
	fn test_kick_coalescing() {
		let vq = vq();
		vq.set_num_max(8);

		// Not ready: kick is dropped.
		assert!(vq.kick());
		assert!(!vq.kicked());

		vq.set_ready(true);
		assert!(vq.kick());
		assert!(vq.kick());
		assert!(vq.kicked());

		let (count, kickfd) = counter();
		vq.set_kickfd(Some(kickfd));
		assert_eq!(count.load(Ordering::SeqCst), 1);
		assert!(!vq.kicked());

		vq.kick();
		assert_eq!(count.load(Ordering::SeqCst), 2);
	}

	#[test]
	fn test_immediate_kick_bypasses_ready() {
		let vq = vq();
		let (count, notifier) = counter();
		vq.set_immediate_kick(Some(notifier));
		assert!(vq.kick());
		assert_eq!(count.load(Ordering::SeqCst), 1);
		assert!(!vq.kicked());
	}

	#[test]
	fn test_trigger_and_callback() {
		let vq = vq();
		let (triggered, trigger) = counter();
		let called = Arc::new(AtomicUsize::new(0));
		let c = called.clone();
		vq.set_callback(
			Some(Arc::new(move || {
				c.fetch_add(1, Ordering::SeqCst);
			})),
			Some(trigger),
		);

		// Not ready: nothing is delivered.
		assert!(!vq.signal_trigger());
		vq.run_callback();
		assert_eq!(called.load(Ordering::SeqCst), 0);

		vq.set_num_max(8);
		vq.set_ready(true);
		assert!(vq.signal_trigger());
		assert_eq!(triggered.load(Ordering::SeqCst), 1);
		vq.run_callback();
		assert_eq!(called.load(Ordering::SeqCst), 1);
	}

	#[test]
	fn test_effective_cpu_round_robin() {
		let vq = vq();
		assert_eq!(vq.effective_cpu(), None);
		assert_eq!(vq.update_effective_cpu(|_| true), Some(0));
		assert_eq!(vq.update_effective_cpu(|_| true), Some(1));
		assert_eq!(vq.update_effective_cpu(|_| true), Some(0));
		assert_eq!(vq.update_effective_cpu(|cpu| cpu != 1), Some(0));

		vq.set_affinity(CpuMask::new([7]));
		assert_eq!(vq.update_effective_cpu(|cpu| cpu < 4), None);
	}

	#[test]
	fn test_packed_masking() {
		let state = PackedState {
			last_avail_counter: 0xffff,
			last_avail_idx: 0xffff,
			last_used_counter: 2,
			last_used_idx: 0x8001,
		}
		.masked();
		assert_eq!(state.last_avail_counter, 1);
		assert_eq!(state.last_avail_idx, 0x7fff);
		assert_eq!(state.last_used_counter, 0);
		assert_eq!(state.last_used_idx, 1);
	}

	#[test]
	fn test_reset_clears_driver_state() {
		let vq = vq();
		vq.set_num_max(16);
		vq.set_num(16);
		vq.set_addresses(VqAddresses {
			desc_addr: 0x1000,
			driver_addr: 0x2000,
			device_addr: 0x3000,
		});
		vq.set_state(VqState::Split(SplitState { avail_index: 3 }));
		vq.set_ready(true);

		vq.reset();
		let info = vq.info();
		assert!(!info.ready);
		assert_eq!(info.num, 0);
		assert_eq!(info.num_max, 16);
		assert_eq!(info.addresses, VqAddresses::default());
		assert_eq!(info.state, VqState::default());
	}
}
