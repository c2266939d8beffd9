//! Device discovery and setup

use core::{convert::TryFrom, time::Duration};

use anyhow::{bail, format_err};
use log::{debug, info, warn};
use loopback::Mode;
use rusb::{Context, DeviceHandle, Direction, Recipient, RequestType, UsbContext as _};

const CONTROL_TIMEOUT: Duration = Duration::from_millis(1_000);
const FLUSH_TIMEOUT: Duration = Duration::from_millis(10);
// a loopback device has at most a few packets queued; anything beyond this is a source
const MAX_FLUSH_READS: usize = 1_024;

/// Which device to open
pub struct Target {
    pub vid: u16,
    pub pid: u16,
    pub manufacturer: String,
    pub product: String,
    pub interface: u8,
}

/// Opens the first device that matches `target` and claims its interface
pub fn open(target: &Target) -> Result<DeviceHandle<Context>, anyhow::Error> {
    let context = Context::new()?;

    for device in context.devices()?.iter() {
        let desc = device.device_descriptor()?;
        if desc.vendor_id() != target.vid || desc.product_id() != target.pid {
            continue;
        }

        let handle = match device.open() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(
                    "{:03}:{:03}: could not open the device: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                continue;
            }
        };

        let manufacturer = handle
            .read_manufacturer_string_ascii(&desc)
            .unwrap_or_default();
        let product = handle.read_product_string_ascii(&desc).unwrap_or_default();
        if !manufacturer.contains(&target.manufacturer) || !product.contains(&target.product) {
            debug!(
                "{:03}:{:03}: skipping {:?} / {:?}",
                device.bus_number(),
                device.address(),
                manufacturer,
                product
            );
            continue;
        }

        info!(
            "using {} {} ({:04x}:{:04x}) at {:03}:{:03}",
            manufacturer,
            product,
            target.vid,
            target.pid,
            device.bus_number(),
            device.address()
        );

        match handle.set_auto_detach_kernel_driver(true) {
            Ok(()) | Err(rusb::Error::NotSupported) => {}
            Err(e) => return Err(e.into()),
        }
        handle.claim_interface(target.interface)?;

        return Ok(handle);
    }

    Err(format_err!(
        "device {:04x}:{:04x} ({:?} / {:?}) not found or cannot be opened",
        target.vid,
        target.pid,
        target.manufacturer,
        target.product
    ))
}

/// Clears any stall left on the bulk endpoints by a previous run
pub fn clear_halts(
    handle: &mut DeviceHandle<Context>,
    endpoints: &[u8],
) -> Result<(), anyhow::Error> {
    for &endpoint in endpoints {
        handle.clear_halt(endpoint)?;
    }

    Ok(())
}

/// Puts the firmware in `mode` with the given packet size
pub fn configure(
    handle: &DeviceHandle<Context>,
    interface: u8,
    mode: Mode,
    packet_size: usize,
) -> Result<(), anyhow::Error> {
    let packet_size = u16::try_from(packet_size)
        .map_err(|_| format_err!("packet size ({}) does not fit in `wValue`", packet_size))?;
    let request_type = rusb::request_type(Direction::Out, RequestType::Vendor, Recipient::Device);

    debug!("SET_TEST_MODE {:?}, SET_PACKET_SIZE {}", mode, packet_size);
    handle.write_control(
        request_type,
        consts::REQ_SET_TEST_MODE,
        mode.wire_value(),
        interface.into(),
        &[],
        CONTROL_TIMEOUT,
    )?;
    handle.write_control(
        request_type,
        consts::REQ_SET_PACKET_SIZE,
        packet_size,
        interface.into(),
        &[],
        CONTROL_TIMEOUT,
    )?;

    Ok(())
}

/// Drops echoes a previous, interrupted run left queued on the device
pub fn flush(handle: &DeviceHandle<Context>, endpoint: u8) -> Result<usize, anyhow::Error> {
    let mut buf = [0; 512];
    let mut total = 0;

    for _ in 0..MAX_FLUSH_READS {
        match handle.read_bulk(endpoint, &mut buf, FLUSH_TIMEOUT) {
            Ok(n) => total += n,
            Err(rusb::Error::Timeout) => {
                if total != 0 {
                    info!("flushed {} stale bytes from endpoint {:#04x}", total, endpoint);
                }
                return Ok(total);
            }
            Err(e) => return Err(e.into()),
        }
    }

    bail!(
        "endpoint {:#04x} is still producing data after {} bytes; is the device in loopback mode?",
        endpoint,
        total
    )
}
