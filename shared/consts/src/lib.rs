//! Identifiers and wire constants shared by the host tools and the loopback firmware

#![no_std]

/// Default Vendor ID of the loopback device
pub const VID: u16 = 0x0403;

/// Default Product ID of the loopback device
pub const PID: u16 = 0x6010;

/// Default substring matched against the manufacturer string descriptor
pub const MANUFACTURER: &str = "Tractor";

/// Default substring matched against the product string descriptor
pub const PRODUCT: &str = "js2232";

/// Interface that carries the bulk endpoints
pub const INTERFACE: u8 = 0;

/// Bulk OUT endpoint (host -> device)
pub const EPOUT1: u8 = 0x01;

/// Bulk IN endpoint (device -> host)
pub const EPIN1: u8 = 0x81;

/// Max packet size of the bulk endpoints at full speed
pub const BULK_MPS: u16 = 64;

/// Direction bit of an endpoint address
pub const EP_DIR_IN: u8 = 0x80;

/// Vendor request: select the device-side test mode (`wValue` = one of the `TEST_MODE_*`)
pub const REQ_SET_TEST_MODE: u8 = 0x10;

/// Vendor request: set the packet size used by the device (`wValue` = size in bytes)
pub const REQ_SET_PACKET_SIZE: u8 = 0x11;

/// Device inverts every byte received on `EPOUT1` and sends it back on `EPIN1`
pub const TEST_MODE_LOOPBACK: u16 = 0;

/// Device sinks everything received on `EPOUT1`
pub const TEST_MODE_OUT_ONLY: u16 = 1;

/// Device continuously sources data on `EPIN1`
pub const TEST_MODE_IN_ONLY: u16 = 2;
