//! MPSSE command-byte constants and the adapter operations built on top of
//! them: chip init, clock-divisor programming, and GPIO sideband writes.
//!
//! Opcodes are restated here as plain constants (rather than built through a
//! generic bitfield command builder) since the shift chunker assembles
//! command bytes directly.

use std::time::Duration;

use crate::error::Result;
use crate::usb::{request, reset, UsbTransport};

pub const FTDI_MPSSE_BIT_WRITE_TMS: u8 = 0x40;
pub const FTDI_MPSSE_BIT_READ_DATA: u8 = 0x20;
pub const FTDI_MPSSE_BIT_WRITE_DATA: u8 = 0x10;
pub const FTDI_MPSSE_BIT_LSB_FIRST: u8 = 0x08;
pub const FTDI_MPSSE_BIT_BIT_MODE: u8 = 0x02;
pub const FTDI_MPSSE_BIT_WRITE_FALLING: u8 = 0x01;

pub const XFER_TDI_BYTES: u8 = FTDI_MPSSE_BIT_WRITE_DATA
    | FTDI_MPSSE_BIT_READ_DATA
    | FTDI_MPSSE_BIT_LSB_FIRST
    | FTDI_MPSSE_BIT_WRITE_FALLING;
pub const XFER_TDI_BITS: u8 = XFER_TDI_BYTES | FTDI_MPSSE_BIT_BIT_MODE;
pub const XFER_TMS_BITS: u8 = FTDI_MPSSE_BIT_WRITE_TMS
    | FTDI_MPSSE_BIT_READ_DATA
    | FTDI_MPSSE_BIT_LSB_FIRST
    | FTDI_MPSSE_BIT_BIT_MODE
    | FTDI_MPSSE_BIT_WRITE_FALLING;

pub const ENABLE_LOOPBACK: u8 = 0x84;
pub const DISABLE_LOOPBACK: u8 = 0x85;
const DISABLE_3_PHASE_CLOCK: u8 = 0x8D;
const SET_LOW_BYTE: u8 = 0x80;
const DISABLE_TCK_PRESCALER: u8 = 0x8A;
const SET_TCK_DIVISOR: u8 = 0x86;

const PIN_TCK: u8 = 0x01;
const PIN_TDI: u8 = 0x02;
#[allow(dead_code)]
const PIN_TDO: u8 = 0x04;
const PIN_TMS: u8 = 0x08;
const PINS_OUTPUT: u8 = PIN_TMS | PIN_TDI | PIN_TCK;

const GPIO_SLEEP: Duration = Duration::from_millis(100);

/// Tracks the TCK divisor state and the "already warned about this rate"
/// memo. Scoped to one session's MPSSE adapter, never a module-level
/// singleton.
#[derive(Debug, Default)]
pub struct ClockConfig {
    pub requested_hz: u32,
    pub actual_hz: u32,
    pub divisor: u32,
    last_warned_actual: Option<u32>,
}

pub struct MpsseAdapter {
    pub clock: ClockConfig,
    pub loopback: bool,
    /// Frequency forced by `-c`, overriding whatever `settck:` requests.
    pub locked_frequency: Option<u32>,
}

impl MpsseAdapter {
    pub fn new(locked_frequency: Option<u32>) -> Self {
        Self {
            clock: ClockConfig::default(),
            loopback: false,
            locked_frequency,
        }
    }

    /// Runs the FTDI reset/purge/bitmode sequence and the MPSSE startup byte
    /// string, then programs the default 10 MHz clock.
    pub fn init(&mut self, usb: &mut UsbTransport) -> Result<()> {
        usb.control_out(request::RESET, reset::SIO)?;
        let bitmode_mask = PINS_OUTPUT;
        usb.control_out(request::SET_BITMODE, u16::from_le_bytes([bitmode_mask, 0x02]))?;
        usb.control_out(request::SET_LATENCY, 2)?;
        usb.control_out(request::RESET, reset::PURGE_TX)?;
        usb.control_out(request::RESET, reset::PURGE_RX)?;

        let startup = [DISABLE_LOOPBACK, DISABLE_3_PHASE_CLOCK, SET_LOW_BYTE, PIN_TMS, PINS_OUTPUT];
        usb.bulk_write(&startup)?;

        self.set_clock(usb, 10_000_000)
    }

    /// Programs the TCK divisor for `freq_hz` (or the locked frequency, if
    /// one was configured): `divisor = clamp(ceil(30MHz / freq), 1, 65536)`.
    pub fn set_clock(&mut self, usb: &mut UsbTransport, freq_hz: u32) -> Result<()> {
        let requested = self.locked_frequency.unwrap_or(freq_hz).max(1);
        let divisor = (30_000_000u32.div_ceil(requested)).clamp(1, 0x10000);
        let actual = 30_000_000 / divisor;

        self.clock = ClockConfig {
            requested_hz: requested,
            actual_hz: actual,
            divisor,
            last_warned_actual: self.clock.last_warned_actual,
        };

        if self.clock.last_warned_actual != Some(actual) {
            let off_by = (requested as f64 / actual as f64 - 1.0).abs();
            if off_by > 0.001 {
                log::warn!("requested clock {requested} Hz rounds to {actual} Hz");
            }
            if actual < 500_000 {
                log::warn!("clock rate {actual} Hz is unusually slow");
            }
            self.clock.last_warned_actual = Some(actual);
        }

        let div_minus_one = (divisor - 1) as u16;
        let cmd = [
            DISABLE_TCK_PRESCALER,
            SET_TCK_DIVISOR,
            (div_minus_one & 0xFF) as u8,
            (div_minus_one >> 8) as u8,
        ];
        usb.bulk_write(&cmd)
    }

    /// Parses a colon-separated list of `(direction<<4)|value` hex bytes and
    /// writes each to the low GPIO byte in turn, sleeping 100 ms in between.
    pub fn set_gpio(&mut self, usb: &mut UsbTransport, spec: &str) -> Result<()> {
        use crate::error::XvcdError;

        for (index, token) in spec.split(':').enumerate() {
            let byte = u32::from_str_radix(token.trim(), 16)
                .map_err(|_| XvcdError::BadArgument(format!("bad gpio byte \"{token}\"")))?;
            if byte > 0xFF {
                return Err(XvcdError::BadArgument(format!("gpio byte {byte:#x} out of range")));
            }
            let direction = ((byte >> 4) & 0x0F) as u8;
            let value = (byte & 0x0F) as u8;
            let cmd = [SET_LOW_BYTE, (value << 4) | PIN_TMS, (direction << 4) | PINS_OUTPUT];

            if index > 0 {
                std::thread::sleep(GPIO_SLEEP);
            }
            usb.bulk_write(&cmd)?;
        }
        Ok(())
    }
}
