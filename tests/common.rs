#![allow(dead_code)]

use std::{
	io,
	sync::{
		Arc, Mutex,
		atomic::{AtomicBool, Ordering},
	},
	thread::{self, JoinHandle},
	time::{Duration, Instant},
};

use vduselib::{
	Device, DeviceChannel, DeviceManager,
	backend::{self, RequestHandler},
	params::{DeviceConfig, MessageTimeout, Params},
	virtio::{VIRTIO_ID_BLOCK, features},
	virtqueue::VqState,
};

pub const QUEUE_SIZE: u32 = 256;

/// A manager whose interrupt work runs on a single unbound worker.
pub fn manager(timeout: Duration) -> DeviceManager {
	env_logger::try_init().ok();
	DeviceManager::new(Params {
		msg_timeout: MessageTimeout::new(timeout),
		irq_cpus: Some(Vec::new()),
		..Default::default()
	})
	.unwrap()
}

/// A block device with a 512 sector capacity.
pub fn blk_config(name: &str, vq_num: u32) -> DeviceConfig {
	DeviceConfig {
		name: name.into(),
		device_id: VIRTIO_ID_BLOCK,
		vendor_id: 0x1af4,
		features: 1 << features::VIRTIO_F_ACCESS_PLATFORM | 1 << features::VIRTIO_F_VERSION_1,
		config: 512u64.to_le_bytes().to_vec(),
		config_size: 8,
		vq_num,
		vq_align: 4096,
	}
}

/// What the responder saw, shared with the test.
#[derive(Debug, Default)]
pub struct Log {
	pub statuses: Vec<u8>,
	pub iotlb_updates: Vec<(u64, u64)>,
}

/// Answers every request like a well-behaved userspace device.
#[derive(Debug)]
pub struct TestBackend {
	pub log: Arc<Mutex<Log>>,
	pub state: VqState,
	pub fail_iotlb: bool,
}

impl RequestHandler for TestBackend {
	fn get_vq_state(&mut self, _index: u32) -> io::Result<VqState> {
		Ok(self.state)
	}

	fn set_status(&mut self, status: u8) -> io::Result<()> {
		self.log.lock().unwrap().statuses.push(status);
		Ok(())
	}

	fn update_iotlb(&mut self, start: u64, last: u64) -> io::Result<()> {
		if self.fail_iotlb {
			return Err(io::Error::other("cannot remap"));
		}
		self.log.lock().unwrap().iotlb_updates.push((start, last));
		Ok(())
	}
}

/// Serves a device channel on a background thread until dropped.
pub struct Responder {
	pub channel: Arc<DeviceChannel>,
	pub log: Arc<Mutex<Log>>,
	stop: Arc<AtomicBool>,
	handle: Option<JoinHandle<()>>,
}

impl Responder {
	pub fn start(device: &Arc<Device>) -> Self {
		Self::with_backend(device, VqState::default(), false)
	}

	pub fn with_backend(device: &Arc<Device>, state: VqState, fail_iotlb: bool) -> Self {
		let channel = Arc::new(device.open().unwrap());
		let log = Arc::new(Mutex::new(Log::default()));
		let stop = Arc::new(AtomicBool::new(false));
		let handle = {
			let channel = channel.clone();
			let stop = stop.clone();
			let mut backend = TestBackend {
				log: log.clone(),
				state,
				fail_iotlb,
			};
			thread::spawn(move || backend::serve(&channel, &mut backend, &stop).unwrap())
		};
		Self {
			channel,
			log,
			stop,
			handle: Some(handle),
		}
	}

	pub fn statuses(&self) -> Vec<u8> {
		self.log.lock().unwrap().statuses.clone()
	}

	pub fn iotlb_updates(&self) -> Vec<(u64, u64)> {
		self.log.lock().unwrap().iotlb_updates.clone()
	}
}

impl Drop for Responder {
	fn drop(&mut self) {
		self.stop.store(true, Ordering::Release);
		if let Some(handle) = self.handle.take() {
			let res = handle.join();
			if !thread::panicking() {
				res.unwrap();
			}
		}
	}
}

/// Polls `cond` for up to a second.
pub fn eventually(mut cond: impl FnMut() -> bool) -> bool {
	let deadline = Instant::now() + Duration::from_secs(1);
	loop {
		if cond() {
			return true;
		}
		if Instant::now() >= deadline {
			return false;
		}
		thread::sleep(Duration::from_millis(1));
	}
}
