//! Command-specific payloads carried inside [`RawRequest`](crate::RawRequest) and
//! [`RawResponse`](crate::RawResponse) records.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Payload of a [`GetVqState`](crate::RequestType::GetVqState) request.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct VqIndexParams {
	/// Index of the virtqueue.
	pub index: u32,
}

/// Payload of a [`SetStatus`](crate::RequestType::SetStatus) request.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct StatusParams {
	/// Virtio device status bits.
	pub status: u8,
}

/// Payload of an [`UpdateIotlb`](crate::RequestType::UpdateIotlb) request.
///
/// Both bounds are inclusive.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IovaRangeParams {
	pub start: u64,
	pub last: u64,
}

/// Split ring state returned for a [`GetVqState`](crate::RequestType::GetVqState) request.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct VqStateSplitParams {
	pub index: u32,
	/// Next available ring index the device will consume.
	pub avail_index: u16,
	pub _pad: u16,
}

/// Packed ring state returned for a [`GetVqState`](crate::RequestType::GetVqState) request.
///
/// Only the low 15 bits of the indices and the low bit of the wrap counters are meaningful.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct VqStatePackedParams {
	pub index: u32,
	pub last_avail_counter: u16,
	pub last_avail_idx: u16,
	pub last_used_counter: u16,
	pub last_used_idx: u16,
}
