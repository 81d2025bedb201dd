use std::{
	fmt::Display,
	sync::atomic::{AtomicU64, Ordering},
};

use vduse_interface::RequestType;

/// Events counted per device.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub enum DeviceEvent {
	Request(RequestType),
	RequestTimeout,
	RequestFailed,
	StaleResponse,
	KickSignalled,
	KickDeferred,
	KickCoalesced,
	IrqQueued,
	IrqSignalled,
	IrqDropped,
}

impl DeviceEvent {
	const ALL: [Self; 12] = [
		Self::Request(RequestType::GetVqState),
		Self::Request(RequestType::SetStatus),
		Self::Request(RequestType::UpdateIotlb),
		Self::RequestTimeout,
		Self::RequestFailed,
		Self::StaleResponse,
		Self::KickSignalled,
		Self::KickDeferred,
		Self::KickCoalesced,
		Self::IrqQueued,
		Self::IrqSignalled,
		Self::IrqDropped,
	];

	fn slot(self) -> usize {
		match self {
			Self::Request(RequestType::GetVqState) => 0,
			Self::Request(RequestType::SetStatus) => 1,
			Self::Request(RequestType::UpdateIotlb) => 2,
			Self::RequestTimeout => 3,
			Self::RequestFailed => 4,
			Self::StaleResponse => 5,
			Self::KickSignalled => 6,
			Self::KickDeferred => 7,
			Self::KickCoalesced => 8,
			Self::IrqQueued => 9,
			Self::IrqSignalled => 10,
			Self::IrqDropped => 11,
		}
	}
}

/// Lock-free event counters of one device.
#[derive(Debug, Default)]
pub struct DeviceStats {
	counters: [AtomicU64; DeviceEvent::ALL.len()],
}

impl DeviceStats {
	pub(crate) fn new() -> Self {
		Self::default()
	}

	#[inline]
	pub(crate) fn increment_val(&self, event: DeviceEvent) {
		self.counters[event.slot()].fetch_add(1, Ordering::Relaxed);
	}

	pub fn get(&self, event: DeviceEvent) -> u64 {
		self.counters[event.slot()].load(Ordering::Relaxed)
	}

	pub fn snapshot(&self, device: &str) -> StatsSnapshot {
		StatsSnapshot {
			device: device.to_owned(),
			events: DeviceEvent::ALL
				.iter()
				.map(|event| (*event, self.get(*event)))
				.collect(),
		}
	}
}

/// Point-in-time copy of a device's counters.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
	pub device: String,
	pub events: Vec<(DeviceEvent, u64)>,
}

impl StatsSnapshot {
	pub fn get(&self, event: DeviceEvent) -> u64 {
		self.events
			.iter()
			.find(|(e, _)| *e == event)
			.map_or(0, |(_, count)| *count)
	}
}

impl Display for StatsSnapshot {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		writeln!(f, "Device {}:", self.device)?;
		writeln!(f, "Events:                         total")?;
		for (event, count) in self.events.iter() {
			let name = match event {
				DeviceEvent::Request(ty) => format!("Request({ty:?}):"),
				event => format!("{event:?}:"),
			};
			writeln!(f, "  {name:<28} {count:>6.}")?;
		}
		Ok(())
	}
}
