//! USB transport: endpoint discovery, control transfers, and the bulk
//! write/read staging that the MPSSE adapter and shift chunker sit on top of.
//!
//! Product matching is explicit-or-fallback, exactly one bulk IN/OUT
//! endpoint pair is claimed per interface, every bulk IN transfer has its
//! 2-byte FTDI modem-status prefix stripped, and runt (sub-status-byte)
//! transfers are retried rather than treated as errors.

use std::time::Duration;

use futures_lite::future::{block_on, or};
use nusb::transfer::{Control, ControlType, Recipient, RequestBuffer};
use nusb::{Device, Interface as UsbInterface};

use crate::error::{Result, XvcdError};

/// Fallback FT2232H/FT4232H/FT232H product codes tried when no explicit
/// product id was given on the command line.
const KNOWN_PRODUCT_IDS: &[u16] = &[0x6010, 0x6011, 0x6014];

const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Vendor control-request codes used by the FTDI SIO interface.
pub mod request {
    pub const RESET: u8 = 0x00;
    pub const SET_LATENCY: u8 = 0x09;
    pub const SET_BITMODE: u8 = 0x0B;
}

/// `wValue` selectors for the `RESET` request.
pub mod reset {
    pub const SIO: u16 = 0;
    pub const PURGE_RX: u16 = 1;
    pub const PURGE_TX: u16 = 2;
}

/// Running counters surfaced for `-S` statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct UsbStats {
    pub largest_write_request: usize,
    pub largest_write_sent: usize,
    pub largest_read_request: usize,
    pub runt_count: u64,
}

/// A claimed bulk IN/OUT endpoint pair on one FTDI MPSSE interface.
pub struct UsbTransport {
    _device: Device,
    interface: UsbInterface,
    interface_index: u8,
    bulk_in_addr: u8,
    bulk_out_addr: u8,
    bulk_in_packet_size: usize,
    bulk_out_packet_size: usize,
    report_runts: bool,
    trace: bool,
    pub stats: UsbStats,
}

/// Dumps up to 40 bytes of `buf` as hex at `debug` level, gated on `-U`.
fn trace_bytes(label: &str, buf: &[u8]) {
    let shown = &buf[..buf.len().min(40)];
    let ellipsis = if buf.len() > 40 { " ..." } else { "" };
    log::debug!("{label} ({} bytes): {shown:02x?}{ellipsis}", buf.len());
}

impl UsbTransport {
    /// Opens a device matching `vendor_id` and either `product_id` or, if
    /// none was given, one of the known FT*H product codes. Claims interface
    /// `interface_index - 1` (so 1 = channel A, 2 = channel B) and resolves
    /// exactly one bulk IN and one bulk OUT endpoint on it.
    pub fn open(
        vendor_id: u16,
        product_id: Option<u16>,
        serial: Option<&str>,
        interface_index: u8,
    ) -> Result<Self> {
        let candidate = nusb::list_devices()?.find(|info| {
            if info.vendor_id() != vendor_id {
                return false;
            }
            let product_matches = match product_id {
                Some(pid) => info.product_id() == pid,
                None => KNOWN_PRODUCT_IDS.contains(&info.product_id()),
            };
            if !product_matches {
                return false;
            }
            match serial {
                Some(want) => info.serial_number() == Some(want),
                None => true,
            }
        });
        let info = candidate.ok_or(XvcdError::NoDevice)?;

        let device = info
            .open()
            .map_err(|e| XvcdError::OpenRefused(e.to_string()))?;

        let config = device
            .active_configuration()
            .map_err(|e| XvcdError::OpenRefused(e.to_string()))?;
        let alt_settings: Vec<_> = config.interface_alt_settings().collect();
        let alt = alt_settings
            .get(interface_index as usize - 1)
            .ok_or_else(|| XvcdError::OpenRefused(format!("no interface {interface_index}")))?;

        let mut bulk_in = None;
        let mut bulk_out = None;
        for endpoint in alt.endpoints() {
            use nusb::transfer::{Direction, EndpointType};
            if endpoint.transfer_type() != EndpointType::Bulk {
                continue;
            }
            match endpoint.direction() {
                Direction::In => {
                    if bulk_in.is_some() {
                        return Err(XvcdError::AmbiguousEndpoints("IN"));
                    }
                    bulk_in = Some((endpoint.address(), endpoint.max_packet_size()));
                }
                Direction::Out => {
                    if bulk_out.is_some() {
                        return Err(XvcdError::AmbiguousEndpoints("OUT"));
                    }
                    bulk_out = Some((endpoint.address(), endpoint.max_packet_size()));
                }
            }
        }
        let (bulk_in_addr, bulk_in_packet_size) = bulk_in.ok_or(XvcdError::NoDevice)?;
        let (bulk_out_addr, bulk_out_packet_size) = bulk_out.ok_or(XvcdError::NoDevice)?;

        let interface = device
            .detach_and_claim_interface(interface_index - 1)
            .map_err(|e| XvcdError::ClaimFailed(e.to_string()))?;

        Ok(Self {
            _device: device,
            interface,
            interface_index,
            bulk_in_addr,
            bulk_out_addr,
            bulk_in_packet_size,
            bulk_out_packet_size,
            report_runts: false,
            trace: false,
            stats: UsbStats::default(),
        })
    }

    pub fn set_report_runts(&mut self, report: bool) {
        self.report_runts = report;
    }

    pub fn set_trace(&mut self, trace: bool) {
        self.trace = trace;
    }

    pub fn bulk_out_packet_size(&self) -> usize {
        self.bulk_out_packet_size
    }

    pub fn bulk_in_packet_size(&self) -> usize {
        self.bulk_in_packet_size
    }

    /// Issues a vendor OUT control transfer with no data phase.
    pub fn control_out(&self, b_request: u8, w_value: u16) -> Result<()> {
        block_on(self.interface.control_out_blocking(
            Control {
                control_type: ControlType::Vendor,
                recipient: Recipient::Device,
                request: b_request,
                value: w_value,
                index: self.interface_index as u16,
            },
            &[],
            CONTROL_TIMEOUT,
        ))
        .map_err(|e| XvcdError::ControlFailed(e.to_string()))?;
        Ok(())
    }

    /// Writes `buf` to the bulk OUT endpoint, looping on short transfers.
    pub fn bulk_write(&mut self, buf: &[u8]) -> Result<()> {
        self.stats.largest_write_request = self.stats.largest_write_request.max(buf.len());
        if self.trace {
            trace_bytes("usb out", buf);
        }

        let mut sent = 0;
        while sent < buf.len() {
            let chunk = &buf[sent..(sent + self.bulk_out_packet_size.min(buf.len() - sent))];
            let transfer = self.interface.bulk_out(self.bulk_out_addr, chunk.to_vec());
            let timed = or(async { Some(transfer.await) }, async {
                async_io::Timer::after(WRITE_TIMEOUT).await;
                None
            });
            let result = block_on(timed).ok_or_else(|| XvcdError::WriteFailed("timed out".into()))?;
            result
                .into_result()
                .map_err(|e| XvcdError::WriteFailed(e.to_string()))?;
            self.stats.largest_write_sent = self.stats.largest_write_sent.max(chunk.len());
            sent += chunk.len();
        }
        Ok(())
    }

    /// Reads exactly `n_wanted` payload bytes, stripping the 2-byte FTDI
    /// modem-status prefix from every transfer and retrying runt (<2-byte)
    /// transfers without error.
    pub fn bulk_read(&mut self, n_wanted: usize) -> Result<Vec<u8>> {
        if n_wanted + 2 > self.bulk_in_packet_size {
            return Err(XvcdError::Invariant(format!(
                "requested read of {n_wanted} bytes (+2 status) exceeds {}-byte bulk-in packet",
                self.bulk_in_packet_size
            )));
        }
        self.stats.largest_read_request = self.stats.largest_read_request.max(n_wanted);

        let mut out = Vec::with_capacity(n_wanted);
        while out.len() < n_wanted {
            let transfer = self
                .interface
                .bulk_in(self.bulk_in_addr, RequestBuffer::new(self.bulk_in_packet_size));
            let timed = or(async { Some(transfer.await) }, async {
                async_io::Timer::after(READ_TIMEOUT).await;
                None
            });
            let result = block_on(timed).ok_or_else(|| XvcdError::ReadFailed("timed out".into()))?;
            let data = result
                .into_result()
                .map_err(|e| XvcdError::ReadFailed(e.to_string()))?;

            if data.len() < 2 {
                self.stats.runt_count += 1;
                if self.report_runts {
                    log::warn!("runt bulk-in transfer of {} bytes", data.len());
                }
                continue;
            }
            let payload = &data[2..];
            let take = payload.len().min(n_wanted - out.len());
            out.extend_from_slice(&payload[..take]);
            if self.trace {
                trace_bytes("usb in", &payload[..take]);
            }
        }
        Ok(out)
    }
}
