//! Userspace request handling on top of a [`DeviceChannel`].

use std::{
	io,
	sync::atomic::{AtomicBool, Ordering},
	time::Duration,
};

use vduse_interface::{
	RawRequest, RawResponse, Request, ResponseResult,
	parameters::{VqStatePackedParams, VqStateSplitParams},
};

use crate::{
	channel::DeviceChannel,
	error::{Result, VduseError},
	virtqueue::VqState,
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The userspace half of a device: answers the requests of the control plane.
pub trait RequestHandler {
	fn get_vq_state(&mut self, index: u32) -> io::Result<VqState>;

	fn set_status(&mut self, status: u8) -> io::Result<()>;

	/// The mappings in `start..=last` changed and must be queried again.
	fn update_iotlb(&mut self, start: u64, last: u64) -> io::Result<()>;
}

fn dispatch(req: &RawRequest, handler: &mut impl RequestHandler) -> io::Result<RawResponse> {
	let id = req.request_id;
	let resp = match req.decode().map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))? {
		Request::GetVqState { index } => match handler.get_vq_state(index)? {
			VqState::Split(state) => RawResponse::split_state(
				id,
				VqStateSplitParams {
					index,
					avail_index: state.avail_index,
					..Default::default()
				},
			),
			VqState::Packed(state) => RawResponse::packed_state(
				id,
				VqStatePackedParams {
					index,
					last_avail_counter: state.last_avail_counter,
					last_avail_idx: state.last_avail_idx,
					last_used_counter: state.last_used_counter,
					last_used_idx: state.last_used_idx,
				},
			),
		},
		Request::SetStatus { status } => {
			handler.set_status(status)?;
			RawResponse::new(id, ResponseResult::Ok)
		}
		Request::UpdateIotlb { start, last } => {
			handler.update_iotlb(start, last)?;
			RawResponse::new(id, ResponseResult::Ok)
		}
	};
	Ok(resp)
}

/// Takes one request, lets `handler` process it and writes the answer.
///
/// Handler errors are reported to the control plane as a failed response.
pub fn handle_one(channel: &DeviceChannel, handler: &mut impl RequestHandler) -> Result<()> {
	let req = channel.next_request()?;
	let resp = dispatch(&req, handler).unwrap_or_else(|err| {
		warn!(
			"{}: request {} failed: {err}",
			channel.device().name(),
			req.request_id
		);
		RawResponse::new(req.request_id, ResponseResult::Failed)
	});
	match channel.respond(resp) {
		// The requester gave up in the meantime.
		Err(VduseError::UnknownRequest(id)) => {
			debug!("{}: dropped late response {id}", channel.device().name());
			Ok(())
		}
		res => res,
	}
}

/// Serves requests until `stop` is set. Switches the channel to nonblocking mode.
pub fn serve(
	channel: &DeviceChannel,
	handler: &mut impl RequestHandler,
	stop: &AtomicBool,
) -> Result<()> {
	channel.set_nonblocking(true);
	while !stop.load(Ordering::Acquire) {
		if !channel.poll(Some(POLL_INTERVAL)) {
			continue;
		}
		match handle_one(channel, handler) {
			Ok(()) | Err(VduseError::WouldBlock) => {}
			Err(err) => return Err(err),
		}
	}
	Ok(())
}

#[cfg(test)]
mod tests {
	use std::{sync::Arc, thread};

	use super::*;
	use crate::{
		device::Device,
		irq::IrqWorkers,
		params::{BounceSize, DeviceConfig, MessageTimeout},
		virtio::{VIRTIO_ID_BLOCK, features},
		virtqueue::PackedState,
	};

	#[derive(Default)]
	struct Recorder {
		statuses: Vec<u8>,
		fail_status: bool,
	}

	impl RequestHandler for Recorder {
		fn get_vq_state(&mut self, _index: u32) -> io::Result<VqState> {
			Ok(VqState::Packed(PackedState {
				last_avail_counter: 3,
				last_avail_idx: 0xffff,
				last_used_counter: 1,
				last_used_idx: 7,
			}))
		}

		fn set_status(&mut self, status: u8) -> io::Result<()> {
			if self.fail_status {
				return Err(io::Error::other("refused"));
			}
			self.statuses.push(status);
			Ok(())
		}

		fn update_iotlb(&mut self, _start: u64, _last: u64) -> io::Result<()> {
			Ok(())
		}
	}

	fn device() -> Arc<Device> {
		let config = DeviceConfig {
			name: "backend".into(),
			device_id: VIRTIO_ID_BLOCK,
			vendor_id: 0,
			features: 1 << features::VIRTIO_F_ACCESS_PLATFORM | 1 << features::VIRTIO_F_VERSION_1,
			config: Vec::new(),
			config_size: 0,
			vq_num: 1,
			vq_align: 4096,
		};
		let workers = Arc::new(IrqWorkers::new(Some(&[][..])).unwrap());
		Device::new(
			config,
			0,
			BounceSize::default(),
			MessageTimeout::default(),
			workers,
		)
	}

	#[test]
	fn test_failed_handler() {
		let device = device();
		let channel = device.open().unwrap();
		thread::scope(|s| {
			let requester = s.spawn(|| device.request(Request::SetStatus { status: 1 }, None));
			let mut handler = Recorder {
				fail_status: true,
				..Default::default()
			};
			handle_one(&channel, &mut handler).unwrap();
			assert!(matches!(
				requester.join().unwrap(),
				Err(VduseError::RequestFailed(_))
			));
		});
	}

	#[test]
	fn test_serve_until_stopped() {
		let device = device();
		device.set_driver_features(1 << features::VIRTIO_F_RING_PACKED);
		let channel = device.open().unwrap();
		let stop = AtomicBool::new(false);
		thread::scope(|s| {
			let server = s.spawn(|| {
				let mut handler = Recorder::default();
				serve(&channel, &mut handler, &stop).map(|()| handler.statuses)
			});

			device.set_status(1).unwrap();
			let state = device.get_vq_state(0).unwrap();
			assert_eq!(
				state,
				VqState::Packed(PackedState {
					last_avail_counter: 1,
					last_avail_idx: 0x7fff,
					last_used_counter: 1,
					last_used_idx: 7,
				})
			);

			stop.store(true, Ordering::Release);
			assert_eq!(server.join().unwrap().unwrap(), [1]);
		});
	}
}
