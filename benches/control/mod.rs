use std::{
	hint::black_box,
	sync::{
		Arc,
		atomic::{AtomicBool, Ordering},
	},
	thread,
	time::Duration,
};

use criterion::{Criterion, criterion_group};
use vduse_interface::{RawResponse, Request, ResponseResult};
use vduselib::{
	DeviceManager,
	consts::{PAGE_SIZE, VDUSE_MIN_BOUNCE_SIZE},
	iova::{DmaDirection, IovaDomain},
	params::{DeviceConfig, MessageTimeout, Params},
	virtio::{VIRTIO_ID_BLOCK, features},
};

fn manager() -> DeviceManager {
	DeviceManager::new(Params {
		msg_timeout: MessageTimeout::new(Duration::from_secs(5)),
		irq_cpus: Some(Vec::new()),
		..Default::default()
	})
	.expect("Unable to create device manager")
}

fn blk_config() -> DeviceConfig {
	DeviceConfig {
		name: "bench0".into(),
		device_id: VIRTIO_ID_BLOCK,
		vendor_id: 0,
		features: 1 << features::VIRTIO_F_ACCESS_PLATFORM | 1 << features::VIRTIO_F_VERSION_1,
		config: vec![0; 8],
		config_size: 8,
		vq_num: 1,
		vq_align: PAGE_SIZE as u32,
	}
}

pub fn request_roundtrip(c: &mut Criterion) {
	let manager = manager();
	let device = manager.create_device(blk_config()).unwrap();
	let channel = Arc::new(device.open().unwrap());
	let stop = Arc::new(AtomicBool::new(false));

	let responder = {
		let channel = channel.clone();
		let stop = stop.clone();
		thread::spawn(move || {
			channel.set_nonblocking(true);
			while !stop.load(Ordering::Acquire) {
				if !channel.poll(Some(Duration::from_millis(10))) {
					continue;
				}
				if let Ok(req) = channel.next_request() {
					channel
						.respond(RawResponse::new(req.request_id, ResponseResult::Ok))
						.unwrap();
				}
			}
		})
	};

	c.bench_function("message::send_and_wait(SetStatus)", |b| {
		b.iter(|| {
			device
				.request(black_box(Request::SetStatus { status: 1 }), None)
				.unwrap()
		})
	});

	stop.store(true, Ordering::Release);
	responder.join().unwrap();
}

pub fn bounce_map_unmap(c: &mut Criterion) {
	let domain = IovaDomain::new(VDUSE_MIN_BOUNCE_SIZE).unwrap();
	let mut buffer = vec![0u8; 4 * PAGE_SIZE];

	let mut group = c.benchmark_group("iova::bounce");
	for pages in [1, 4] {
		let size = pages * PAGE_SIZE;
		group.bench_function(format!("map_unmap({pages} pages)"), |b| {
			b.iter(|| {
				let iova = unsafe {
					domain.map_page(buffer.as_mut_ptr(), size, DmaDirection::Bidirectional)
				}
				.unwrap();
				domain
					.unmap_page(black_box(iova), size, DmaDirection::Bidirectional)
					.unwrap();
			})
		});
	}
	group.finish();
}

criterion_group!(message_benchmark_group, request_roundtrip);
criterion_group!(bounce_benchmark_group, bounce_map_unmap);
