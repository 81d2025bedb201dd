#![warn(rust_2018_idioms)]

#[macro_use]
extern crate log;

use std::{
	io, process,
	sync::{
		Arc,
		atomic::{AtomicBool, AtomicU64, Ordering},
	},
	thread,
	time::{Duration, Instant},
};

use clap::{CommandFactory, Parser, ValueEnum, error::ErrorKind};
use vduselib::{
	DeviceChannel, DeviceManager, Result,
	backend::{self, RequestHandler},
	consts::PAGE_SIZE,
	iova::DmaDirection,
	notify::FnNotifier,
	params::{BounceSize, DeviceConfig, MessageTimeout, Params},
	stats::StatsSnapshot,
	utils::parse_cpu_list,
	virtio::{DeviceStatus, VIRTIO_ID_BLOCK, VIRTIO_ID_NET, features},
	virtqueue::{SplitState, VqAddresses, VqState},
};

#[derive(ValueEnum, Debug, Clone, Copy)]
enum DeviceType {
	Net,
	Block,
}

/// Used by clap to derive CLI parameters.
#[derive(Parser, Debug)]
#[clap(version, author, about)]
struct Args {
	/// Name of the device
	#[clap(default_value = "vduse0")]
	name: String,

	/// Virtio device type
	#[clap(short = 't', long = "type", value_enum, default_value_t = DeviceType::Block)]
	device_type: DeviceType,

	/// Display statistics after the session
	#[clap(long)]
	stats: bool,

	#[clap(flatten, next_help_heading = "Queue OPTIONS")]
	queue_args: QueueArgs,

	#[clap(flatten, next_help_heading = "Control OPTIONS")]
	control_args: ControlArgs,
}

#[derive(Parser, Debug)]
struct QueueArgs {
	/// Number of virtqueues
	#[clap(short, long, default_value_t = 1)]
	queues: u32,

	/// Maximum size of each virtqueue
	#[clap(long, default_value_t = 256)]
	queue_size: u32,
}

#[derive(Parser, Debug)]
struct ControlArgs {
	/// Size of the bounce buffer
	#[clap(short, long, default_value_t, env = "VDUSE_BOUNCE_SIZE")]
	bounce_size: BounceSize,

	/// Seconds to wait for userspace to answer a request, 0 waits forever
	#[clap(long, default_value_t, env = "VDUSE_MSG_TIMEOUT")]
	timeout: MessageTimeout,

	/// Run interrupt injection on these host CPUs
	///
	/// List items may be single numbers or inclusive ranges.
	/// List items may be separated with commas or spaces.
	///
	/// # Examples
	///
	/// * `--affinity "0 1 2"`
	///
	/// * `--affinity 0-1,2`
	#[clap(short, long, value_name = "CPUs")]
	affinity: Option<String>,
}

impl ControlArgs {
	fn get_affinity(&self) -> Option<Vec<usize>> {
		let affinity = self.affinity.as_deref()?;
		let available = core_affinity::get_core_ids()
			.unwrap_or_default()
			.into_iter()
			.map(|core_id| core_id.id)
			.collect::<Vec<_>>();
		match parse_cpu_list(affinity, &available) {
			Ok(cpus) => Some(cpus),
			Err(err) => Args::command()
				.error(ErrorKind::InvalidValue, format!("--affinity: {err}"))
				.exit(),
		}
	}
}

impl Args {
	fn params(&self) -> Params {
		Params {
			bounce_size: self.control_args.bounce_size,
			msg_timeout: self.control_args.timeout,
			irq_cpus: self.control_args.get_affinity(),
		}
	}

	fn device_config(&self) -> DeviceConfig {
		let (device_id, config) = match self.device_type {
			// mac, status, max_virtqueue_pairs
			DeviceType::Net => (VIRTIO_ID_NET, vec![0x52, 0x54, 0, 0x12, 0x34, 0x56, 1, 0, 1, 0]),
			// capacity in sectors
			DeviceType::Block => (VIRTIO_ID_BLOCK, 2048u64.to_le_bytes().to_vec()),
		};
		DeviceConfig {
			name: self.name.clone(),
			device_id,
			vendor_id: 0,
			features: 1 << features::VIRTIO_F_VERSION_1 | 1 << features::VIRTIO_F_ACCESS_PLATFORM,
			config_size: config.len() as u32,
			config,
			vq_num: self.queue_args.queues,
			vq_align: PAGE_SIZE as u32,
		}
	}
}

/// Userspace device that keeps just enough state to answer requests.
#[derive(Debug, Default)]
struct DemoBackend {
	/// Requests served since the last reset.
	served: u16,
}

impl RequestHandler for DemoBackend {
	fn get_vq_state(&mut self, _index: u32) -> io::Result<VqState> {
		self.served = self.served.wrapping_add(1);
		Ok(VqState::Split(SplitState {
			avail_index: self.served,
		}))
	}

	fn set_status(&mut self, status: u8) -> io::Result<()> {
		info!(
			"Backend: status {:?}",
			DeviceStatus::from_bits_retain(status)
		);
		if status == 0 {
			self.served = 0;
		}
		Ok(())
	}

	fn update_iotlb(&mut self, start: u64, last: u64) -> io::Result<()> {
		info!("Backend: IOTLB changed in {start:#x}-{last:#x}");
		Ok(())
	}
}

fn wait_for(counter: &AtomicU64, value: u64) -> bool {
	let deadline = Instant::now() + Duration::from_secs(1);
	while counter.load(Ordering::Acquire) < value {
		if Instant::now() >= deadline {
			return false;
		}
		thread::sleep(Duration::from_millis(1));
	}
	true
}

/// Drives the driver side of a device through one full session.
fn drive(manager: &DeviceManager, channel: &DeviceChannel, args: &Args) -> Result<()> {
	let name = args.name.as_str();
	let device = channel.device();
	let adapter = manager.bind_adapter(name)?;

	device.set_driver_features(device.device_features());
	let mut status = DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER;
	adapter.set_status(status.bits())?;
	status |= DeviceStatus::FEATURES_OK;
	adapter.set_status(status.bits())?;

	let kicks = Arc::new(AtomicU64::new(0));
	let irqs = Arc::new(AtomicU64::new(0));
	for index in 0..device.vq_num() {
		let base = u64::from(index) << 20;
		device.set_vq_num(index, args.queue_args.queue_size)?;
		device.set_vq_address(
			index,
			VqAddresses {
				desc_addr: base,
				driver_addr: base + 0x4000,
				device_addr: base + 0x8000,
			},
		)?;
		let irqs = irqs.clone();
		device.set_vq_cb(
			index,
			Some(Arc::new(move || {
				irqs.fetch_add(1, Ordering::AcqRel);
			})),
			None,
		)?;
		device.set_vq_ready(index, true)?;

		let kicks = kicks.clone();
		channel.setup_kick(
			index,
			Some(Arc::new(FnNotifier(move || {
				kicks.fetch_add(1, Ordering::AcqRel);
			}))),
		)?;
	}
	status |= DeviceStatus::DRIVER_OK;
	adapter.set_status(status.bits())?;

	// Stream one page through the bounce buffer.
	let domain = adapter.domain()?;
	let mut buffer = vec![0xa5u8; PAGE_SIZE];
	let iova = unsafe { domain.map_page(buffer.as_mut_ptr(), buffer.len(), DmaDirection::Bidirectional)? };
	let range = channel.query_iotlb(iova, iova)?;
	info!(
		"IOVA {iova:#x} is backed at offset {:#x} ({:?})",
		range.offset, range.perm
	);
	let mut seen = [0u8; 16];
	channel.read_iova(iova, &mut seen)?;
	if seen != [0xa5; 16] {
		warn!("Bounce page does not mirror the mapped buffer: {seen:02x?}");
	}
	channel.write_iova(iova, b"response")?;
	domain.unmap_page(iova, buffer.len(), DmaDirection::Bidirectional)?;
	info!("Device answered {:?}", String::from_utf8_lossy(&buffer[..8]));

	for index in 0..device.vq_num() {
		adapter.kick_vq(index)?;
		channel.inject_vq_irq(index)?;
		info!("Queue {index}: {:?}", adapter.get_vq_state(index)?);
	}
	let queues = u64::from(device.vq_num());
	if !wait_for(&kicks, queues) || !wait_for(&irqs, queues) {
		warn!(
			"Expected {queues} kicks and interrupts, saw {} and {}",
			kicks.load(Ordering::Acquire),
			irqs.load(Ordering::Acquire)
		);
	}

	adapter.reset()?;
	info!("Device reset, generation {}", device.generation());
	manager.unbind_adapter(name)
}

fn run_session(args: &Args) -> Result<StatsSnapshot> {
	let manager = DeviceManager::new(args.params())?;
	let device = manager.create_device(args.device_config())?;
	let channel = device.open()?;
	for index in 0..device.vq_num() {
		channel.setup_queue(index, args.queue_args.queue_size)?;
	}

	let stop = AtomicBool::new(false);
	let res = thread::scope(|s| {
		let server = s.spawn(|| {
			let mut backend = DemoBackend::default();
			backend::serve(&channel, &mut backend, &stop)
		});
		let mut res = drive(&manager, &channel, args);
		if res.is_err() && device.is_bound() {
			res = res.and(manager.unbind_adapter(&args.name));
		}
		stop.store(true, Ordering::Release);
		match server.join() {
			Ok(served) => res.and(served),
			Err(_) => {
				error!("Backend thread panicked");
				res
			}
		}
	});
	res?;

	let stats = device.stats();
	drop(channel);
	manager.destroy_device(&args.name)?;
	Ok(stats)
}

fn main() {
	env_logger::init();

	let args = Args::parse();
	match run_session(&args) {
		Ok(stats) => {
			if args.stats {
				println!("{stats}");
			}
		}
		Err(err) => {
			error!("Session failed: {err}");
			process::exit(err.errno())
		}
	}
}
