//! Virtio constants and the device status field.

use bitflags::bitflags;

pub mod features {
	pub use virtio_bindings::{
		virtio_blk::VIRTIO_BLK_F_CONFIG_WCE,
		virtio_config::{VIRTIO_F_ACCESS_PLATFORM, VIRTIO_F_RING_PACKED, VIRTIO_F_VERSION_1},
		virtio_net::VIRTIO_NET_F_CTRL_VQ,
	};

	/// Returns `true` if feature bit `bit` is set in `features`.
	#[inline]
	pub fn has(features: u64, bit: u32) -> bool {
		features & (1 << bit) != 0
	}
}

// Virtio device IDs, section 5 virtio v1.2
pub const VIRTIO_ID_NET: u32 = 1;
pub const VIRTIO_ID_BLOCK: u32 = 2;

/// Device types userspace may implement.
pub const ALLOWED_DEVICE_IDS: &[u32] = &[VIRTIO_ID_BLOCK, VIRTIO_ID_NET];

/// Virtio device status field. See section 2.1 virtio v1.2
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceStatus(u8);
bitflags! {
	impl DeviceStatus: u8 {
		/// Indicates the guest has found the device and recognises it as valid.
		const ACKNOWLEDGE = 1;

		/// Indicates the guest knows how to drive the device.
		const DRIVER = 2;

		/// Indicates the driver is set up and ready to drive the device.
		const DRIVER_OK = 4;

		/// indicates the driver has acknowledged the features it understands and negotiation is
		/// complete.
		const FEATURES_OK = 8;

		/// Indicates that the device has experienced an error from which it can't recover.
		const DEVICE_NEEDS_RESET = 64;

		/// Failed to initialize.
		const FAILED = 128;
	}
}
