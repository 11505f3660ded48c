//! USB transport
//!
//! The session talks to the adapter through the [`Transport`] trait: control
//! transfers in both directions, bulk OUT with a timeout, and one bulk IN
//! read that waits without timeout until data arrives or
//! [`Transport::cancel_reads`] is called. [`UsbTransport`] implements it on
//! libusb through `rusb`.

use std::ffi::c_void;
use std::os::raw::c_int;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};

use rusb::constants::{
    LIBUSB_ERROR_ACCESS, LIBUSB_ERROR_BUSY, LIBUSB_ERROR_INTERRUPTED, LIBUSB_ERROR_INVALID_PARAM,
    LIBUSB_ERROR_IO, LIBUSB_ERROR_NOT_FOUND, LIBUSB_ERROR_NOT_SUPPORTED, LIBUSB_ERROR_NO_DEVICE,
    LIBUSB_ERROR_NO_MEM, LIBUSB_ERROR_OVERFLOW, LIBUSB_ERROR_PIPE, LIBUSB_ERROR_TIMEOUT,
    LIBUSB_TRANSFER_CANCELLED, LIBUSB_TRANSFER_COMPLETED, LIBUSB_TRANSFER_NO_DEVICE,
    LIBUSB_TRANSFER_OVERFLOW, LIBUSB_TRANSFER_STALL, LIBUSB_TRANSFER_TIMED_OUT,
    LIBUSB_TRANSFER_TYPE_BULK,
};
use rusb::{ffi, DeviceHandle, GlobalContext, TransferType, UsbContext};

use crate::constants::is_candle_device;
use crate::error::{CandleError, Result};

/// Event loop tick while a bulk IN transfer is pending
const EVENT_TICK_US: i64 = 50_000;
/// How long a cancelled transfer may take to report back
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// One endpoint of the claimed interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointInfo {
    /// Endpoint address including the direction bit
    pub address: u8,
    pub max_packet_size: u16,
    /// Bulk endpoint
    pub bulk: bool,
}

impl EndpointInfo {
    /// Device to host endpoint
    pub fn is_in(&self) -> bool {
        self.address & 0x80 != 0
    }
}

/// Descriptor data of an opened device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsbInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice as text
    pub device_version: String,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
    /// Max packet size of endpoint 0
    pub max_packet_size0: u8,
    /// Number of the claimed interface
    pub interface_number: u8,
    /// Interface string descriptor
    pub interface_name: String,
    /// Endpoints of alternate setting 0
    pub endpoints: Vec<EndpointInfo>,
}

/// Platform USB primitives used by the session
///
/// Implementations must allow `read_bulk` on one thread while the other
/// methods are called from another.
pub trait Transport: Send + Sync {
    /// Descriptor data read when the device was opened
    fn info(&self) -> &UsbInfo;

    /// Control transfer device to host
    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    /// Control transfer host to device
    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize>;

    /// Bulk OUT transfer
    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize>;

    /// Bulk IN transfer without timeout
    ///
    /// Returns when data arrived, the transfer failed, or reads were
    /// cancelled (`rusb::Error::Interrupted`).
    fn read_bulk(&self, endpoint: u8, buf: &mut [u8]) -> rusb::Result<usize>;

    /// Abort the pending and all future bulk IN reads
    fn cancel_reads(&self);
}

/// Translate a libusb error code
pub fn map_libusb_error(rc: c_int) -> rusb::Error {
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

/// Translate the status of a finished asynchronous transfer
fn map_transfer_status(status: c_int) -> rusb::Error {
    match status {
        LIBUSB_TRANSFER_TIMED_OUT => rusb::Error::Timeout,
        LIBUSB_TRANSFER_CANCELLED => rusb::Error::Interrupted,
        LIBUSB_TRANSFER_STALL => rusb::Error::Pipe,
        LIBUSB_TRANSFER_NO_DEVICE => rusb::Error::NoDevice,
        LIBUSB_TRANSFER_OVERFLOW => rusb::Error::Overflow,
        _ => rusb::Error::Io,
    }
}

extern "system" fn on_transfer_done(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: user_data is the completion flag of the submitting read_bulk
    // call, which stays alive until this callback has run (or is leaked).
    unsafe {
        let done = (*transfer).user_data as *const AtomicI32;
        (*done).store(1, Ordering::Release);
    }
}

/// A connectable adapter found by [`enumerate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEntry {
    /// Display name for user selection
    pub name: String,
    /// Path accepted by `Candlelight::open`
    pub path: String,
}

/// Build the path string for a device interface
pub fn format_path(bus: u8, address: u8, interface: u8) -> String {
    format!("{:03}:{:03}:{}", bus, address, interface)
}

/// Split a path string into bus, address and interface
pub fn parse_path(path: &str) -> Result<(u8, u8, u8)> {
    let invalid = || CandleError::InvalidPath(path.to_string());
    let mut parts = path.trim().split(':');
    let mut next = || -> Result<u8> {
        parts
            .next()
            .and_then(|p| p.parse::<u8>().ok())
            .ok_or_else(invalid)
    };
    let parsed = (next()?, next()?, next()?);
    if parts.next().is_some() {
        return Err(invalid());
    }
    Ok(parsed)
}

/// List attached Candlelight adapters that expose `interface`
pub fn enumerate(interface: u8) -> Result<Vec<DeviceEntry>> {
    let mut entries = Vec::new();

    for device in rusb::devices()?.iter() {
        let desc = match device.device_descriptor() {
            Ok(desc) => desc,
            Err(_) => continue,
        };
        if !is_candle_device(desc.vendor_id(), desc.product_id()) {
            continue;
        }

        let has_interface = device
            .active_config_descriptor()
            .map(|config| config.interfaces().any(|i| i.number() == interface))
            .unwrap_or(false);
        if !has_interface {
            continue;
        }

        // strings need an open handle, which may be denied
        let label = device.open().ok().and_then(|handle| {
            let product = handle.read_product_string_ascii(&desc).ok()?;
            match handle.read_serial_number_string_ascii(&desc) {
                Ok(serial) if !serial.is_empty() => Some(format!("{} ({})", product, serial)),
                _ => Some(product),
            }
        });
        let name = label.unwrap_or_else(|| {
            format!(
                "Candlelight {:04X}:{:04X}",
                desc.vendor_id(),
                desc.product_id()
            )
        });

        entries.push(DeviceEntry {
            name,
            path: format_path(device.bus_number(), device.address(), interface),
        });
    }

    log::debug!("found {} adapter(s) on interface {}", entries.len(), interface);
    Ok(entries)
}

/// libusb backed transport for one claimed interface
pub struct UsbTransport {
    handle: DeviceHandle<GlobalContext>,
    info: UsbInfo,
    cancelled: AtomicBool,
}

impl UsbTransport {
    /// Open the device at `path` and claim its interface
    pub fn open(path: &str) -> Result<Self> {
        let (bus, address, interface) = parse_path(path)?;

        let device = rusb::devices()?
            .iter()
            .find(|d| d.bus_number() == bus && d.address() == address)
            .ok_or_else(|| CandleError::DeviceNotFound(path.to_string()))?;

        let handle = device.open()?;

        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            if handle.kernel_driver_active(interface).unwrap_or(false) {
                handle
                    .detach_kernel_driver(interface)
                    .map_err(CandleError::DetachKernelDriver)?;
            }
        }

        handle
            .claim_interface(interface)
            .map_err(CandleError::ClaimInterface)?;

        let info = Self::read_info(&handle, interface)?;
        log::debug!(
            "opened {:04X}:{:04X} interface {} with {} endpoint(s)",
            info.vendor_id,
            info.product_id,
            interface,
            info.endpoints.len()
        );

        Ok(Self {
            handle,
            info,
            cancelled: AtomicBool::new(false),
        })
    }

    fn read_info(handle: &DeviceHandle<GlobalContext>, interface: u8) -> Result<UsbInfo> {
        let device = handle.device();
        let desc = device.device_descriptor()?;
        let config = device.active_config_descriptor()?;

        let version = desc.device_version();
        let mut info = UsbInfo {
            vendor_id: desc.vendor_id(),
            product_id: desc.product_id(),
            device_version: format!(
                "{}.{}.{}",
                version.major(),
                version.minor(),
                version.sub_minor()
            ),
            manufacturer: handle.read_manufacturer_string_ascii(&desc).unwrap_or_default(),
            product: handle.read_product_string_ascii(&desc).unwrap_or_default(),
            serial_number: handle
                .read_serial_number_string_ascii(&desc)
                .unwrap_or_default(),
            max_packet_size0: desc.max_packet_size(),
            interface_number: interface,
            ..UsbInfo::default()
        };

        let setting = config
            .interfaces()
            .filter(|i| i.number() == interface)
            .flat_map(|i| i.descriptors())
            .find(|d| d.setting_number() == 0)
            .ok_or(CandleError::InvalidDevice("interface not present"))?;

        if let Some(index) = setting.description_string_index() {
            info.interface_name = handle.read_string_descriptor_ascii(index).unwrap_or_default();
        }
        info.endpoints = setting
            .endpoint_descriptors()
            .map(|ep| EndpointInfo {
                address: ep.address(),
                max_packet_size: ep.max_packet_size(),
                bulk: ep.transfer_type() == TransferType::Bulk,
            })
            .collect();

        Ok(info)
    }
}

impl Transport for UsbTransport {
    fn info(&self) -> &UsbInfo {
        &self.info
    }

    fn read_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.handle
            .read_control(request_type, request, value, index, buf, timeout)
    }

    fn write_control(
        &self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> rusb::Result<usize> {
        self.handle
            .write_control(request_type, request, value, index, data, timeout)
    }

    fn write_bulk(&self, endpoint: u8, data: &[u8], timeout: Duration) -> rusb::Result<usize> {
        self.handle.write_bulk(endpoint, data, timeout)
    }

    fn read_bulk(&self, endpoint: u8, buf: &mut [u8]) -> rusb::Result<usize> {
        if self.cancelled.load(Ordering::Acquire) {
            return Err(rusb::Error::Interrupted);
        }

        // buffer and flag are heap allocated so they can be leaked together
        // with a transfer that never reports back after cancellation
        let mut buffer = vec![0u8; buf.len()].into_boxed_slice();
        let done = Box::new(AtomicI32::new(0));

        // SAFETY: plain allocation, checked for null below
        let transfer = unsafe { ffi::libusb_alloc_transfer(0) };
        if transfer.is_null() {
            return Err(rusb::Error::NoMem);
        }

        // SAFETY: transfer is a valid allocation owned by this call; buffer
        // and done outlive the transfer (freed after completion or leaked).
        let rc = unsafe {
            let t = &mut *transfer;
            t.dev_handle = self.handle.as_raw();
            t.endpoint = endpoint;
            t.transfer_type = LIBUSB_TRANSFER_TYPE_BULK;
            t.timeout = 0;
            t.flags = 0;
            t.buffer = buffer.as_mut_ptr();
            t.length = buffer.len() as c_int;
            t.callback = on_transfer_done;
            t.user_data = &*done as *const AtomicI32 as *mut c_void;
            ffi::libusb_submit_transfer(transfer)
        };
        if rc != 0 {
            // SAFETY: never submitted
            unsafe { ffi::libusb_free_transfer(transfer) };
            return Err(map_libusb_error(rc));
        }

        let context = self.handle.context().as_raw();
        let mut cancel_deadline: Option<Instant> = None;

        while done.load(Ordering::Acquire) == 0 {
            if cancel_deadline.is_none() && self.cancelled.load(Ordering::Acquire) {
                // SAFETY: transfer is submitted and not yet completed
                unsafe { ffi::libusb_cancel_transfer(transfer) };
                cancel_deadline = Some(Instant::now() + CANCEL_GRACE);
            }

            if let Some(deadline) = cancel_deadline {
                if Instant::now() >= deadline {
                    log::warn!("bulk IN transfer on 0x{:02X} ignored cancellation", endpoint);
                    std::mem::forget(buffer);
                    std::mem::forget(done);
                    return Err(rusb::Error::Interrupted);
                }
            }

            let tick = libc::timeval {
                tv_sec: 0,
                tv_usec: EVENT_TICK_US as _,
            };
            // SAFETY: context belongs to the open handle; done is a valid c_int
            let rc = unsafe {
                ffi::libusb_handle_events_timeout_completed(context, &tick, done.as_ptr())
            };
            if rc < 0 && rc != LIBUSB_ERROR_INTERRUPTED && cancel_deadline.is_none() {
                log::warn!("libusb event handling failed: {}", map_libusb_error(rc));
                // SAFETY: as above
                unsafe { ffi::libusb_cancel_transfer(transfer) };
                cancel_deadline = Some(Instant::now() + CANCEL_GRACE);
            }
        }

        // SAFETY: the callback has run, libusb no longer touches the transfer
        let (status, actual) = unsafe { ((*transfer).status, (*transfer).actual_length) };
        unsafe { ffi::libusb_free_transfer(transfer) };

        if status != LIBUSB_TRANSFER_COMPLETED {
            return Err(map_transfer_status(status));
        }
        let len = (actual.max(0) as usize).min(buf.len());
        buf[..len].copy_from_slice(&buffer[..len]);
        log::trace!("bulk IN 0x{:02X}: {:02X?}", endpoint, &buf[..len]);
        Ok(len)
    }

    fn cancel_reads(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}
