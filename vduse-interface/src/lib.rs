//! # VDUSE Message Interface
//!
//! This crate specifies the records exchanged between the vduse control plane and a userspace
//! device implementation. Both sides of the message channel depend on it so the fixed-size
//! layout stays coherent.
//!
//! - The control plane queues a [`RawRequest`]. Userspace reads exactly one record of
//!   [`REQUEST_SIZE`] bytes per read.
//! - Userspace answers with exactly one [`RawResponse`] of [`RESPONSE_SIZE`] bytes per write. The
//!   response is matched to its request by `request_id`, never by position.

#![cfg_attr(not(feature = "std"), no_std)]

use core::fmt;

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Command-specific payloads.
pub mod parameters;

use crate::parameters::*;

/// The version of the message interface. Bumped on every change of the record layout.
pub const VDUSE_API_VERSION: u64 = 0;

/// Size in bytes of a serialized [`RawRequest`].
pub const REQUEST_SIZE: usize = size_of::<RawRequest>();
/// Size in bytes of a serialized [`RawResponse`].
pub const RESPONSE_SIZE: usize = size_of::<RawResponse>();

/// Commands the control plane sends to userspace.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum RequestType {
	/// Fetch the live state of a virtqueue.
	GetVqState = 0,
	/// Propagate a new device status.
	SetStatus = 1,
	/// Tell userspace that the IOTLB changed in the given range.
	UpdateIotlb = 2,
}

/// Result code carried by a [`RawResponse`].
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum ResponseResult {
	Ok = 0,
	Failed = 1,
}

bitflags! {
	/// Access permissions of an IOTLB entry.
	#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
	pub struct AccessFlags: u8 {
		const RO = 1;
		const WO = 2;
		const RW = Self::RO.bits() | Self::WO.bits();
	}
}

bitflags! {
	/// Capabilities of the IOVA domain reported to userspace.
	#[derive(Debug, Copy, Clone, PartialEq, Eq)]
	pub struct IovaCapability: u64 {
		/// User memory may be registered as bounce buffer.
		const UMEM = 1 << 0;
	}
}

/// A request record as it travels over the message channel.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RawRequest {
	/// A [`RequestType`] discriminant.
	pub ty: u32,
	/// Must be zero.
	pub flags: u32,
	pub request_id: u64,
	pub payload: [u8; 48],
}

/// A response record as it travels over the message channel.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct RawResponse {
	pub request_id: u64,
	/// A [`ResponseResult`] discriminant.
	pub result: u32,
	/// Must be zero, responses carrying anything else are rejected.
	pub reserved: [u32; 9],
	pub payload: [u8; 32],
}

/// Errors raised while decoding records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
	/// The buffer is not exactly one record long.
	Size { expected: usize, actual: usize },
	/// Unknown request type.
	RequestType(u32),
	/// Unknown result code.
	Result(u32),
	/// A reserved field is nonzero.
	Reserved,
}

impl fmt::Display for DecodeError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Size { expected, actual } => {
				write!(f, "record must be {expected} bytes (got {actual})")
			}
			Self::RequestType(ty) => write!(f, "unknown request type {ty}"),
			Self::Result(res) => write!(f, "unknown result code {res}"),
			Self::Reserved => write!(f, "reserved field is not zero"),
		}
	}
}

#[cfg(feature = "std")]
impl std::error::Error for DecodeError {}

/// Reads a payload type from the front of a record's payload area.
fn read_payload<T: FromBytes + IntoBytes, const N: usize>(payload: &[u8; N]) -> T {
	const { assert!(size_of::<T>() <= N, "payload type does not fit into the record") };
	let mut value = T::new_zeroed();
	value
		.as_mut_bytes()
		.copy_from_slice(&payload[..size_of::<T>()]);
	value
}

fn write_payload<T: IntoBytes + Immutable, const N: usize>(payload: &mut [u8; N], value: &T) {
	const { assert!(size_of::<T>() <= N, "payload type does not fit into the record") };
	payload[..size_of::<T>()].copy_from_slice(value.as_bytes());
}

/// A decoded request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Request {
	GetVqState { index: u32 },
	SetStatus { status: u8 },
	UpdateIotlb { start: u64, last: u64 },
}

impl Request {
	pub fn request_type(&self) -> RequestType {
		match self {
			Self::GetVqState { .. } => RequestType::GetVqState,
			Self::SetStatus { .. } => RequestType::SetStatus,
			Self::UpdateIotlb { .. } => RequestType::UpdateIotlb,
		}
	}

	/// Serializes the request with the given id.
	pub fn encode(&self, request_id: u64) -> RawRequest {
		let mut raw = RawRequest {
			ty: self.request_type().into(),
			flags: 0,
			request_id,
			payload: [0; 48],
		};
		match *self {
			Self::GetVqState { index } => write_payload(&mut raw.payload, &VqIndexParams { index }),
			Self::SetStatus { status } => write_payload(&mut raw.payload, &StatusParams { status }),
			Self::UpdateIotlb { start, last } => {
				write_payload(&mut raw.payload, &IovaRangeParams { start, last })
			}
		}
		raw
	}
}

impl TryFrom<&RawRequest> for Request {
	type Error = DecodeError;

	fn try_from(raw: &RawRequest) -> Result<Self, Self::Error> {
		let ty = RequestType::try_from(raw.ty).map_err(|_| DecodeError::RequestType(raw.ty))?;
		Ok(match ty {
			RequestType::GetVqState => {
				let params: VqIndexParams = read_payload(&raw.payload);
				Self::GetVqState {
					index: params.index,
				}
			}
			RequestType::SetStatus => {
				let params: StatusParams = read_payload(&raw.payload);
				Self::SetStatus {
					status: params.status,
				}
			}
			RequestType::UpdateIotlb => {
				let range: IovaRangeParams = read_payload(&raw.payload);
				Self::UpdateIotlb {
					start: range.start,
					last: range.last,
				}
			}
		})
	}
}

impl RawRequest {
	/// Parses exactly one record.
	pub fn from_record(bytes: &[u8]) -> Result<Self, DecodeError> {
		Self::read_from_bytes(bytes).map_err(|_| DecodeError::Size {
			expected: REQUEST_SIZE,
			actual: bytes.len(),
		})
	}

	pub fn decode(&self) -> Result<Request, DecodeError> {
		Request::try_from(self)
	}
}

impl RawResponse {
	pub fn new(request_id: u64, result: ResponseResult) -> Self {
		Self {
			request_id,
			result: result.into(),
			reserved: [0; 9],
			payload: [0; 32],
		}
	}

	/// A successful response to a [`RequestType::GetVqState`] request on a split ring.
	pub fn split_state(request_id: u64, state: VqStateSplitParams) -> Self {
		let mut resp = Self::new(request_id, ResponseResult::Ok);
		write_payload(&mut resp.payload, &state);
		resp
	}

	/// A successful response to a [`RequestType::GetVqState`] request on a packed ring.
	pub fn packed_state(request_id: u64, state: VqStatePackedParams) -> Self {
		let mut resp = Self::new(request_id, ResponseResult::Ok);
		write_payload(&mut resp.payload, &state);
		resp
	}

	/// Parses exactly one record and rejects nonzero reserved fields.
	pub fn from_record(bytes: &[u8]) -> Result<Self, DecodeError> {
		let resp = Self::read_from_bytes(bytes).map_err(|_| DecodeError::Size {
			expected: RESPONSE_SIZE,
			actual: bytes.len(),
		})?;
		if resp.reserved.iter().any(|word| *word != 0) {
			return Err(DecodeError::Reserved);
		}
		Ok(resp)
	}

	pub fn result(&self) -> Result<ResponseResult, DecodeError> {
		ResponseResult::try_from(self.result).map_err(|_| DecodeError::Result(self.result))
	}

	pub fn split(&self) -> VqStateSplitParams {
		read_payload(&self.payload)
	}

	pub fn packed(&self) -> VqStatePackedParams {
		read_payload(&self.payload)
	}
}
