use std::io;

use thiserror::Error;
use vduse_interface::DecodeError;

use crate::{mem::MemoryError, params::InvalidDeviceConfigError};

pub type Result<T> = std::result::Result<T, VduseError>;

#[derive(Error, Debug)]
pub enum VduseError {
	#[error("Invalid argument: {0}")]
	InvalidArgument(String),
	#[error(transparent)]
	InvalidConfig(#[from] InvalidDeviceConfigError),
	#[error("Device {0:?} already exists")]
	AlreadyExists(String),
	#[error("No such device {0:?}")]
	NoDevice(String),
	#[error("Device is busy")]
	Busy,
	#[error("Operation not permitted: {0}")]
	NotPermitted(&'static str),

	#[error("Malformed record: {0}")]
	Malformed(#[from] DecodeError),
	#[error("No pending request with id {0}")]
	UnknownRequest(u64),
	#[error("No request available")]
	WouldBlock,

	#[error("Request {0} timed out")]
	Timeout(u64),
	#[error("Device is broken")]
	Broken,
	#[error("Request {0} failed")]
	RequestFailed(u64),
	#[error("Wait for request {0} was interrupted")]
	Interrupted(u64),

	#[error("Pinning exceeds the locked memory limit")]
	LockLimit,
	#[error("Out of IOVA space")]
	IovaExhausted,
	#[error(transparent)]
	Memory(#[from] MemoryError),

	#[error(transparent)]
	Io(#[from] io::Error),
	#[error(transparent)]
	Os(#[from] nix::errno::Errno),
}

impl VduseError {
	pub(crate) fn invalid(msg: impl Into<String>) -> Self {
		Self::InvalidArgument(msg.into())
	}

	/// The errno the equivalent kernel interface reports for this error.
	pub fn errno(&self) -> i32 {
		match self {
			Self::InvalidArgument(_) | Self::InvalidConfig(_) | Self::Malformed(_) => libc::EINVAL,
			Self::AlreadyExists(_) => libc::EEXIST,
			Self::NoDevice(_) => libc::ENODEV,
			Self::Busy => libc::EBUSY,
			Self::NotPermitted(_) => libc::EPERM,
			Self::UnknownRequest(_) => libc::ENOENT,
			Self::WouldBlock => libc::EAGAIN,
			Self::Timeout(_) | Self::Broken | Self::RequestFailed(_) => libc::EIO,
			Self::Interrupted(_) => libc::EINTR,
			Self::LockLimit | Self::IovaExhausted => libc::ENOMEM,
			Self::Memory(MemoryError::BoundsViolation) => libc::EFAULT,
			Self::Memory(_) => libc::EINVAL,
			Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
			Self::Os(errno) => *errno as i32,
		}
	}

	/// Errors that stem from a malformed or stale record. They never break the device.
	pub fn is_transport(&self) -> bool {
		matches!(self, Self::Malformed(_) | Self::UnknownRequest(_))
	}
}

impl From<VduseError> for io::Error {
	fn from(err: VduseError) -> Self {
		match err {
			VduseError::Io(err) => err,
			err => io::Error::from_raw_os_error(err.errno()),
		}
	}
}
