use std::{fmt, num::ParseIntError, str::FromStr, time::Duration};

use byte_unit::{Byte, Unit};
use thiserror::Error;

use crate::{
	consts::*,
	virtio::{ALLOWED_DEVICE_IDS, VIRTIO_ID_BLOCK, VIRTIO_ID_NET, features},
};

/// Defaults applied to every device a [`DeviceManager`](crate::manager::DeviceManager) creates.
#[derive(Debug, Clone, Default)]
pub struct Params {
	/// Bounce buffer size of new devices
	pub bounce_size: BounceSize,

	/// How long a control message may stay unanswered
	pub msg_timeout: MessageTimeout,

	/// Host CPUs that run bound IRQ injection work. Defaults to all online CPUs.
	pub irq_cpus: Option<Vec<usize>>,
}

/// Arguments of a device creation request.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
	pub name: String,
	/// Virtio device id
	pub device_id: u32,
	pub vendor_id: u32,
	/// Features offered by the device
	pub features: u64,
	/// Initial content of the configuration space
	pub config: Vec<u8>,
	/// Length of the configuration space, must match `config`
	pub config_size: u32,
	pub vq_num: u32,
	pub vq_align: u32,
}

impl DeviceConfig {
	/// Checks the configuration without touching any state.
	pub fn validate(&self) -> Result<(), InvalidDeviceConfigError> {
		if self.name.is_empty() {
			return Err(InvalidDeviceConfigError::EmptyName);
		}
		if self.name.len() >= VDUSE_NAME_MAX {
			return Err(InvalidDeviceConfigError::NameTooLong(self.name.len()));
		}
		if self.name.contains(['/', '\0']) {
			return Err(InvalidDeviceConfigError::InvalidName(self.name.clone()));
		}
		if self.vq_align > VDUSE_MAX_VQ_ALIGN {
			return Err(InvalidDeviceConfigError::VqAlignTooLarge(self.vq_align));
		}
		if self.config_size > VDUSE_MAX_CONFIG_SIZE {
			return Err(InvalidDeviceConfigError::ConfigTooLarge(self.config_size));
		}
		if self.config.len() != self.config_size as usize {
			return Err(InvalidDeviceConfigError::ConfigSizeMismatch {
				config_size: self.config_size,
				len: self.config.len(),
			});
		}
		if self.vq_num > VDUSE_MAX_VQ_NUM {
			return Err(InvalidDeviceConfigError::TooManyQueues(self.vq_num));
		}
		if !ALLOWED_DEVICE_IDS.contains(&self.device_id) {
			return Err(InvalidDeviceConfigError::UnsupportedDevice(self.device_id));
		}
		self.validate_features()
	}

	fn validate_features(&self) -> Result<(), InvalidDeviceConfigError> {
		use features::*;

		if !has(self.features, VIRTIO_F_ACCESS_PLATFORM) {
			return Err(InvalidDeviceConfigError::MissingAccessPlatform);
		}
		// The configuration space is read-only for the driver.
		match self.device_id {
			VIRTIO_ID_BLOCK if has(self.features, VIRTIO_BLK_F_CONFIG_WCE) => {
				Err(InvalidDeviceConfigError::IncompatibleFeature("VIRTIO_BLK_F_CONFIG_WCE"))
			}
			VIRTIO_ID_NET if has(self.features, VIRTIO_NET_F_CTRL_VQ) => {
				Err(InvalidDeviceConfigError::IncompatibleFeature("VIRTIO_NET_F_CTRL_VQ"))
			}
			VIRTIO_ID_NET if !has(self.features, VIRTIO_F_VERSION_1) => {
				Err(InvalidDeviceConfigError::MissingVersion1)
			}
			_ => Ok(()),
		}
	}
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidDeviceConfigError {
	#[error("Device name must not be empty")]
	EmptyName,
	#[error("Device name is too long ({0} bytes)")]
	NameTooLong(usize),
	#[error("Device name {0:?} contains invalid characters")]
	InvalidName(String),
	#[error("Device id {0} is not supported")]
	UnsupportedDevice(u32),
	#[error("Devices must offer VIRTIO_F_ACCESS_PLATFORM")]
	MissingAccessPlatform,
	#[error("Net devices must offer VIRTIO_F_VERSION_1")]
	MissingVersion1,
	#[error("Feature {0} is not supported for this device type")]
	IncompatibleFeature(&'static str),
	#[error("Configuration space too large ({0} bytes, at most {VDUSE_MAX_CONFIG_SIZE})")]
	ConfigTooLarge(u32),
	#[error("Configuration size {config_size} does not match the {len} bytes supplied")]
	ConfigSizeMismatch { config_size: u32, len: usize },
	#[error("Virtqueue alignment {0} exceeds the page size")]
	VqAlignTooLarge(u32),
	#[error("Too many virtqueues ({0})")]
	TooManyQueues(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BounceSize(Byte);

impl BounceSize {
	const fn minimum() -> Byte {
		Byte::from_u64(VDUSE_MIN_BOUNCE_SIZE)
	}

	const fn maximum() -> Byte {
		Byte::from_u64(VDUSE_MAX_BOUNCE_SIZE)
	}

	pub fn get(self) -> u64 {
		self.0.as_u64()
	}
}

impl Default for BounceSize {
	fn default() -> Self {
		Self(Byte::from_u64(VDUSE_BOUNCE_SIZE))
	}
}

impl fmt::Display for BounceSize {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.get_appropriate_unit(byte_unit::UnitType::Binary).fmt(f)
	}
}

#[derive(Error, Debug)]
pub enum InvalidBounceSizeError {
	#[error(
		"Bounce buffer too small. Must be at least {min:#} (is {cur:#.3})",
		min = BounceSize::minimum().get_adjusted_unit(Unit::MiB),
		cur = .0.get_adjusted_unit(Unit::MiB),
	)]
	TooSmall(Byte),
	#[error(
		"Bounce buffer too large. Must be at most {max:#} (is {cur:#.3})",
		max = BounceSize::maximum().get_adjusted_unit(Unit::MiB),
		cur = .0.get_adjusted_unit(Unit::MiB),
	)]
	TooLarge(Byte),
	#[error("Bounce buffer size must be a multiple of the page size (is {0})")]
	Unaligned(Byte),
}

impl TryFrom<Byte> for BounceSize {
	type Error = InvalidBounceSizeError;

	fn try_from(value: Byte) -> Result<Self, Self::Error> {
		if value < Self::minimum() {
			Err(InvalidBounceSizeError::TooSmall(value))
		} else if value > Self::maximum() {
			Err(InvalidBounceSizeError::TooLarge(value))
		} else if value.as_u64() % PAGE_SIZE as u64 != 0 {
			Err(InvalidBounceSizeError::Unaligned(value))
		} else {
			Ok(Self(value))
		}
	}
}

impl TryFrom<u64> for BounceSize {
	type Error = InvalidBounceSizeError;

	fn try_from(value: u64) -> Result<Self, Self::Error> {
		Byte::from_u64(value).try_into()
	}
}

#[derive(Error, Debug)]
pub enum ParseBounceSizeError {
	#[error(transparent)]
	Parse(#[from] byte_unit::ParseError),

	#[error(transparent)]
	InvalidBounceSize(#[from] InvalidBounceSizeError),
}

impl FromStr for BounceSize {
	type Err = ParseBounceSizeError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let requested = Byte::from_str(s)?;
		let bounce_size = requested.try_into()?;
		Ok(bounce_size)
	}
}

/// Time a control message may stay unanswered before the device is considered broken.
///
/// A zero timeout waits forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageTimeout(Duration);

impl MessageTimeout {
	pub const fn new(timeout: Duration) -> Self {
		Self(timeout)
	}

	pub fn get(self) -> Option<Duration> {
		(!self.0.is_zero()).then_some(self.0)
	}
}

impl Default for MessageTimeout {
	fn default() -> Self {
		Self(VDUSE_MSG_DEFAULT_TIMEOUT)
	}
}

impl fmt::Display for MessageTimeout {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		self.0.as_secs().fmt(f)
	}
}

impl From<Duration> for MessageTimeout {
	fn from(timeout: Duration) -> Self {
		Self(timeout)
	}
}

impl FromStr for MessageTimeout {
	type Err = ParseIntError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let secs = s.parse()?;
		Ok(Self(Duration::from_secs(secs)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::virtio::features::*;

	fn blk_config() -> DeviceConfig {
		DeviceConfig {
			name: "blk0".into(),
			device_id: VIRTIO_ID_BLOCK,
			vendor_id: 0,
			features: 1 << VIRTIO_F_ACCESS_PLATFORM | 1 << VIRTIO_F_VERSION_1,
			config: vec![0; 8],
			config_size: 8,
			vq_num: 2,
			vq_align: PAGE_SIZE as u32,
		}
	}

	#[test]
	fn test_device_config_validation() {
		assert_eq!(blk_config().validate(), Ok(()));

		let mut config = blk_config();
		config.features &= !(1 << VIRTIO_F_ACCESS_PLATFORM);
		assert_eq!(
			config.validate(),
			Err(InvalidDeviceConfigError::MissingAccessPlatform)
		);

		let mut config = blk_config();
		config.features |= 1 << VIRTIO_BLK_F_CONFIG_WCE;
		assert!(matches!(
			config.validate(),
			Err(InvalidDeviceConfigError::IncompatibleFeature(_))
		));

		let mut config = blk_config();
		config.device_id = VIRTIO_ID_NET;
		config.features &= !(1 << VIRTIO_F_VERSION_1);
		assert_eq!(
			config.validate(),
			Err(InvalidDeviceConfigError::MissingVersion1)
		);

		let mut config = blk_config();
		config.device_id = VIRTIO_ID_NET;
		config.features |= 1 << VIRTIO_NET_F_CTRL_VQ;
		assert!(config.validate().is_err());

		let mut config = blk_config();
		config.device_id = 3;
		assert_eq!(
			config.validate(),
			Err(InvalidDeviceConfigError::UnsupportedDevice(3))
		);

		let mut config = blk_config();
		config.config_size = 16;
		assert!(matches!(
			config.validate(),
			Err(InvalidDeviceConfigError::ConfigSizeMismatch { .. })
		));

		let mut config = blk_config();
		config.vq_num = 0x10000;
		assert_eq!(
			config.validate(),
			Err(InvalidDeviceConfigError::TooManyQueues(0x10000))
		);

		let mut config = blk_config();
		config.name = "a/b".into();
		assert!(config.validate().is_err());
	}

	#[test]
	fn test_bounce_size() {
		assert_eq!(BounceSize::default().get(), VDUSE_BOUNCE_SIZE);
		assert_eq!(BounceSize::from_str("2 MiB").unwrap().get(), 2 * 1024 * 1024);
		assert!(matches!(
			BounceSize::from_str("512 KiB"),
			Err(ParseBounceSizeError::InvalidBounceSize(
				InvalidBounceSizeError::TooSmall(_)
			))
		));
		assert!(matches!(
			BounceSize::from_str("2 GiB"),
			Err(ParseBounceSizeError::InvalidBounceSize(
				InvalidBounceSizeError::TooLarge(_)
			))
		));
		assert!(matches!(
			BounceSize::try_from(VDUSE_MIN_BOUNCE_SIZE + 1),
			Err(InvalidBounceSizeError::Unaligned(_))
		));
	}

	#[test]
	fn test_message_timeout() {
		assert_eq!(
			MessageTimeout::default().get(),
			Some(VDUSE_MSG_DEFAULT_TIMEOUT)
		);
		assert_eq!(MessageTimeout::from_str("0").unwrap().get(), None);
		assert_eq!(
			MessageTimeout::from_str("5").unwrap().get(),
			Some(Duration::from_secs(5))
		);
	}
}
