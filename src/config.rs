//! Runtime configuration and command-line argument handling.
//!
//! Both `-u`/`-U` and `-x`/`-X` toggle USB and XVC tracing respectively;
//! older option tables disagreed on which case did which, so both letters
//! are accepted for both rather than breaking either convention.

use clap::Parser;

use crate::error::{Result, XvcdError};

/// Diagnostic toggles that don't affect protocol behavior, only logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiagnosticFlags {
    pub quiet: bool,
    pub runt: bool,
    pub show_usb: bool,
    pub show_xvc: bool,
    pub statistics: bool,
    pub loopback: bool,
}

/// Fully resolved daemon configuration, built from `Args`.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub port: u16,
    pub vendor_id: u16,
    /// Explicit product id from `-d`; `None` falls back to the known
    /// FT2232H/FT4232H/FT232H codes at device-open time.
    pub product_id: Option<u16>,
    pub serial: Option<String>,
    /// 1-based MPSSE interface index: 1 for channel A, 2 for channel B (`-B`).
    pub interface_index: u8,
    pub locked_frequency: Option<u32>,
    pub gpio_spec: Option<String>,
    pub flags: DiagnosticFlags,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1".to_string(),
            port: 2542,
            vendor_id: 0x0403,
            product_id: None,
            serial: None,
            interface_index: 1,
            locked_frequency: None,
            gpio_spec: None,
            flags: DiagnosticFlags::default(),
        }
    }
}

/// Command-line arguments accepted by the daemon.
#[derive(Parser, Debug)]
#[command(name = "xvcd-ftdi", version, about = "XVC-over-TCP bridge for FTDI MPSSE JTAG adapters")]
pub struct Args {
    /// Bind address
    #[arg(short = 'a', default_value = "127.0.0.1")]
    pub address: String,

    /// Listen port
    #[arg(short = 'p', default_value_t = 2542)]
    pub port: u16,

    /// vendor:product[:serial] in hex, e.g. 0403:6014
    #[arg(short = 'd')]
    pub device: Option<String>,

    /// Lock the TCK frequency; accepts a `k` or `M` suffix
    #[arg(short = 'c')]
    pub clock: Option<String>,

    /// GPIO direction:value[:direction:value...] bytes, in hex
    #[arg(short = 'g')]
    pub gpio: Option<String>,

    /// Use interface B (JTAG index 2) instead of A
    #[arg(short = 'B')]
    pub interface_b: bool,

    /// Loopback self-test: TDI is looped back to TDO on-chip
    #[arg(short = 'L')]
    pub loopback: bool,

    /// Report runt (sub-status-byte) bulk-IN transfers
    #[arg(short = 'R')]
    pub report_runts: bool,

    /// Print per-session statistics on disconnect
    #[arg(short = 'S')]
    pub statistics: bool,

    /// Log USB traffic
    #[arg(short = 'u')]
    pub show_usb_lower: bool,
    /// Log USB traffic (alias of -u, kept for compatibility with the
    /// older option table)
    #[arg(short = 'U')]
    pub show_usb_upper: bool,

    /// Log XVC traffic
    #[arg(short = 'x')]
    pub show_xvc_lower: bool,
    /// Log XVC traffic (alias of -x)
    #[arg(short = 'X')]
    pub show_xvc_upper: bool,

    /// Quiet: suppress connect/disconnect lines
    #[arg(short = 'q')]
    pub quiet: bool,
}

fn parse_hex_u16(token: &str, what: &str) -> Result<u16> {
    let value = u32::from_str_radix(token.trim(), 16)
        .map_err(|_| XvcdError::BadArgument(format!("bad {what} \"{token}\"")))?;
    u16::try_from(value).map_err(|_| XvcdError::BadArgument(format!("{what} \"{token}\" out of range")))
}

/// Parses `-d vendor:product[:serial]`.
fn parse_device(spec: &str) -> Result<(u16, u16, Option<String>)> {
    let mut parts = spec.splitn(3, ':');
    let vendor = parts
        .next()
        .ok_or_else(|| XvcdError::BadArgument("missing vendor in -d".into()))?;
    let product = parts
        .next()
        .ok_or_else(|| XvcdError::BadArgument("missing product in -d".into()))?;
    let serial = parts.next().map(|s| s.to_string());
    Ok((parse_hex_u16(vendor, "vendor id")?, parse_hex_u16(product, "product id")?, serial))
}

/// Parses `-c frequency[k|M]`.
fn parse_frequency(spec: &str) -> Result<u32> {
    let spec = spec.trim();
    let (number, multiplier) = if let Some(stripped) = spec.strip_suffix('M') {
        (stripped, 1_000_000.0)
    } else if let Some(stripped) = spec.strip_suffix('k') {
        (stripped, 1_000.0)
    } else {
        (spec, 1.0)
    };
    let value: f64 = number
        .parse()
        .map_err(|_| XvcdError::BadArgument(format!("bad clock frequency \"{spec}\"")))?;
    let hz = (value * multiplier).clamp(1.0, i32::MAX as f64);
    Ok(hz as u32)
}

impl Config {
    /// Builds a `Config` from parsed CLI arguments, applying validation and
    /// defaulting rules.
    pub fn from_args(args: Args) -> Result<Self> {
        let mut config = Config {
            bind_address: args.address,
            port: args.port,
            interface_index: if args.interface_b { 2 } else { 1 },
            ..Config::default()
        };

        if let Some(device) = args.device {
            let (vendor, product, serial) = parse_device(&device)?;
            config.vendor_id = vendor;
            config.product_id = Some(product);
            config.serial = serial;
        }

        if let Some(clock) = args.clock {
            config.locked_frequency = Some(parse_frequency(&clock)?);
        }

        config.gpio_spec = args.gpio;

        config.flags = DiagnosticFlags {
            quiet: args.quiet,
            runt: args.report_runts,
            show_usb: args.show_usb_lower || args.show_usb_upper,
            show_xvc: args.show_xvc_lower || args.show_xvc_upper,
            statistics: args.statistics,
            loopback: args.loopback,
        };

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_device_with_serial() {
        let (vendor, product, serial) = parse_device("0403:6014:AB12").unwrap();
        assert_eq!(vendor, 0x0403);
        assert_eq!(product, 0x6014);
        assert_eq!(serial.as_deref(), Some("AB12"));
    }

    #[test]
    fn parses_device_without_serial() {
        let (vendor, product, serial) = parse_device("403:6010").unwrap();
        assert_eq!(vendor, 0x0403);
        assert_eq!(product, 0x6010);
        assert_eq!(serial, None);
    }

    #[test]
    fn rejects_bad_device() {
        assert!(parse_device("not-hex:6010").is_err());
        assert!(parse_device("0403").is_err());
    }

    #[test]
    fn parses_frequency_suffixes() {
        assert_eq!(parse_frequency("10").unwrap(), 10);
        assert_eq!(parse_frequency("10k").unwrap(), 10_000);
        assert_eq!(parse_frequency("1.5M").unwrap(), 1_500_000);
    }

    #[test]
    fn rejects_bad_frequency() {
        assert!(parse_frequency("abc").is_err());
    }
}
