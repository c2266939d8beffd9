//! `Transport` backed by libusb's asynchronous API

use core::{
    cell::RefCell,
    cmp,
    convert::TryFrom,
    mem,
    ptr::{self, NonNull},
};
use std::collections::{HashMap, VecDeque};

use libc::{c_int, c_uint, c_void};
use log::{debug, trace, warn};
use rusb::{ffi, ffi::constants::*, Context, DeviceHandle, UsbContext as _};

use crate::transfer::{Handle, Status, Transfer, Transport};

/// Upper bound on how long one `handle_events` call blocks
const POLL_INTERVAL_US: i64 = 100_000;

/// `handle_events` calls spent reaping cancelled transfers on drop
const TEARDOWN_POLLS: usize = 64;

type Completions = RefCell<VecDeque<*mut ffi::libusb_transfer>>;

struct InFlight {
    raw: NonNull<ffi::libusb_transfer>,
    // owns the buffer libusb reads from / writes into
    transfer: Transfer,
}

/// Asynchronous bulk transfers on an open device
///
/// Dropping this cancels whatever is still in flight and waits (briefly) for libusb to hand the
/// transfers back
pub struct Libusb<'d> {
    handle: &'d DeviceHandle<Context>,
    // boxed: libusb keeps a pointer to it in every transfer's `user_data`
    completions: Box<Completions>,
    in_flight: HashMap<Handle, InFlight>,
}

impl<'d> Libusb<'d> {
    /// Uses an open (and claimed) device handle
    pub fn new(handle: &'d DeviceHandle<Context>) -> Self {
        Self {
            handle,
            completions: Box::new(RefCell::new(VecDeque::new())),
            in_flight: HashMap::new(),
        }
    }

    fn reap(&mut self, completed: &mut Vec<Transfer>) {
        loop {
            let raw = match self.completions.borrow_mut().pop_front() {
                Some(raw) => raw,
                None => break,
            };

            let handle = Handle(raw as usize as u64);
            let (status, actual_length) = unsafe { (status_of(&*raw), (*raw).actual_length) };
            unsafe { ffi::libusb_free_transfer(raw) }

            if let Some(InFlight { mut transfer, .. }) = self.in_flight.remove(&handle) {
                let actual_length = cmp::min(cmp::max(actual_length, 0) as usize, transfer.len());
                trace!(
                    "libusb: {} chunk {} -> {:?}",
                    transfer.direction(),
                    transfer.chunk(),
                    status
                );
                transfer.complete(status, actual_length);
                completed.push(transfer);
            } else {
                warn!("libusb: completion of unknown transfer {:?}", handle);
            }
        }
    }
}

extern "system" fn on_complete(transfer: *mut ffi::libusb_transfer) {
    unsafe {
        let completions = &*((*transfer).user_data as *const Completions);
        completions.borrow_mut().push_back(transfer);
    }
}

impl Transport for Libusb<'_> {
    fn submit(&mut self, mut transfer: Transfer) -> Result<Handle, rusb::Error> {
        let len = c_int::try_from(transfer.len()).map_err(|_| rusb::Error::InvalidParam)?;
        let timeout =
            cmp::min(transfer.timeout().as_millis(), c_uint::max_value().into()) as c_uint;

        let raw =
            NonNull::new(unsafe { ffi::libusb_alloc_transfer(0) }).ok_or(rusb::Error::NoMem)?;
        unsafe {
            ffi::libusb_fill_bulk_transfer(
                raw.as_ptr(),
                self.handle.as_raw(),
                transfer.endpoint(),
                transfer.buffer_mut().as_mut_ptr(),
                len,
                on_complete,
                &*self.completions as *const Completions as *mut c_void,
                timeout,
            );
        }

        let rc = unsafe { ffi::libusb_submit_transfer(raw.as_ptr()) };
        if rc != 0 {
            unsafe { ffi::libusb_free_transfer(raw.as_ptr()) }
            return Err(error_from(rc));
        }

        let handle = Handle(raw.as_ptr() as usize as u64);
        self.in_flight.insert(handle, InFlight { raw, transfer });
        Ok(handle)
    }

    fn cancel(&mut self, handle: Handle) -> Result<(), rusb::Error> {
        let raw = self
            .in_flight
            .get(&handle)
            .map(|in_flight| in_flight.raw)
            .ok_or(rusb::Error::NotFound)?;

        match unsafe { ffi::libusb_cancel_transfer(raw.as_ptr()) } {
            0 => Ok(()),
            rc => Err(error_from(rc)),
        }
    }

    fn handle_events(&mut self, completed: &mut Vec<Transfer>) -> Result<(), rusb::Error> {
        if self.completions.borrow().is_empty() {
            let tv = libc::timeval {
                tv_sec: 0,
                tv_usec: POLL_INTERVAL_US as _,
            };
            let rc = unsafe {
                ffi::libusb_handle_events_timeout_completed(
                    self.handle.context().as_raw(),
                    &tv,
                    ptr::null_mut(),
                )
            };

            if rc != 0 {
                // completions delivered before the failure are still handed back
                self.reap(completed);
                return Err(error_from(rc));
            }
        }

        self.reap(completed);
        Ok(())
    }

    fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}

impl Drop for Libusb<'_> {
    fn drop(&mut self) {
        if self.in_flight.is_empty() {
            return;
        }

        debug!(
            "libusb: cancelling {} transfer(s) left in flight",
            self.in_flight.len()
        );
        let handles = self.in_flight.keys().copied().collect::<Vec<_>>();
        for handle in handles {
            let _ = self.cancel(handle);
        }

        let mut scratch = vec![];
        for _ in 0..TEARDOWN_POLLS {
            if self.in_flight.is_empty() {
                return;
            }

            let _ = self.handle_events(&mut scratch);
            scratch.clear();
        }

        // libusb may still write into these buffers; leak them rather than free them
        warn!(
            "libusb: {} transfer(s) could not be reaped; leaking their buffers",
            self.in_flight.len()
        );
        for (_, in_flight) in self.in_flight.drain() {
            mem::forget(in_flight);
        }
        mem::forget(mem::replace(
            &mut self.completions,
            Box::new(RefCell::new(VecDeque::new())),
        ));
    }
}

fn status_of(transfer: &ffi::libusb_transfer) -> Status {
    match transfer.status {
        LIBUSB_TRANSFER_COMPLETED => Status::Completed,
        LIBUSB_TRANSFER_CANCELLED => Status::Cancelled,
        status => Status::Error(transfer_error(status)),
    }
}

fn transfer_error(status: c_int) -> rusb::Error {
    match status {
        LIBUSB_TRANSFER_TIMED_OUT => rusb::Error::Timeout,
        LIBUSB_TRANSFER_STALL => rusb::Error::Pipe,
        LIBUSB_TRANSFER_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => rusb::Error::Overflow,
        _ => rusb::Error::Io,
    }
}

fn error_from(rc: c_int) -> rusb::Error {
    match rc {
        LIBUSB_ERROR_IO => rusb::Error::Io,
        LIBUSB_ERROR_INVALID_PARAM => rusb::Error::InvalidParam,
        LIBUSB_ERROR_ACCESS => rusb::Error::Access,
        LIBUSB_ERROR_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => rusb::Error::NotFound,
        LIBUSB_ERROR_BUSY => rusb::Error::Busy,
        LIBUSB_ERROR_TIMEOUT => rusb::Error::Timeout,
        LIBUSB_ERROR_OVERFLOW => rusb::Error::Overflow,
        LIBUSB_ERROR_PIPE => rusb::Error::Pipe,
        LIBUSB_ERROR_INTERRUPTED => rusb::Error::Interrupted,
        LIBUSB_ERROR_NO_MEM => rusb::Error::NoMem,
        LIBUSB_ERROR_NOT_SUPPORTED => rusb::Error::NotSupported,
        _ => rusb::Error::Other,
    }
}

#[cfg(test)]
mod tests {
    use rusb::ffi::constants::*;

    use super::{error_from, transfer_error};

    #[test]
    fn transfer_statuses() {
        assert_eq!(transfer_error(LIBUSB_TRANSFER_TIMED_OUT), rusb::Error::Timeout);
        assert_eq!(transfer_error(LIBUSB_TRANSFER_STALL), rusb::Error::Pipe);
        assert_eq!(transfer_error(LIBUSB_TRANSFER_NO_DEVICE), rusb::Error::NoDevice);
        assert_eq!(transfer_error(LIBUSB_TRANSFER_ERROR), rusb::Error::Io);
    }

    #[test]
    fn error_codes() {
        assert_eq!(error_from(LIBUSB_ERROR_NOT_FOUND), rusb::Error::NotFound);
        assert_eq!(error_from(LIBUSB_ERROR_INTERRUPTED), rusb::Error::Interrupted);
        assert_eq!(error_from(-1_000), rusb::Error::Other);
    }
}
