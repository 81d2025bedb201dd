#![warn(rust_2018_idioms)]
#![allow(clippy::missing_safety_doc)]

#[macro_use]
extern crate log;

pub mod adapter;
pub mod backend;
pub mod channel;
pub mod consts;
pub mod device;
pub mod error;
pub mod iova;
pub mod irq;
pub mod manager;
pub mod mem;
pub mod message;
pub mod notify;
pub mod params;
pub mod stats;
pub mod utils;
pub mod virtio;
pub mod virtqueue;

pub use adapter::Adapter;
pub use channel::DeviceChannel;
pub use device::Device;
pub use error::{Result, VduseError};
pub use manager::DeviceManager;
