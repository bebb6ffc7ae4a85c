//! Per-connection session glue: runs the XVC command loop over one TCP
//! stream until EOF or a protocol/USB error, then reports statistics.

use std::io::Write;
use std::net::TcpStream;

use crate::chunker;
use crate::config::DiagnosticFlags;
use crate::error::Result;
use crate::mpsse::MpsseAdapter;
use crate::usb::UsbTransport;
use crate::xvc::{self, Command};

/// Per-session counters surfaced by `-S`.
#[derive(Debug, Default)]
pub struct SessionStats {
    pub shift_count: u64,
    pub chunk_count: u64,
    pub bit_count: u64,
    pub largest_shift: u32,
}

pub struct Session<'a> {
    stream: TcpStream,
    usb: &'a mut UsbTransport,
    mpsse: MpsseAdapter,
    flags: DiagnosticFlags,
    stats: SessionStats,
}

impl<'a> Session<'a> {
    pub fn new(stream: TcpStream, usb: &'a mut UsbTransport, mpsse: MpsseAdapter, flags: DiagnosticFlags) -> Self {
        Self {
            stream,
            usb,
            mpsse,
            flags,
            stats: SessionStats::default(),
        }
    }

    fn trace_xvc(&self, label: &str, buf: &[u8]) {
        if !self.flags.show_xvc {
            return;
        }
        let shown = &buf[..buf.len().min(40)];
        let ellipsis = if buf.len() > 40 { " ..." } else { "" };
        log::debug!("{label} ({} bytes): {shown:02x?}{ellipsis}", buf.len());
    }

    /// Runs the XVC command loop to completion. Returns `Ok(())` on a clean
    /// client disconnect; an `Err` indicates a USB I/O failure, which the
    /// caller should log and treat as session-terminating.
    pub fn run(&mut self) -> Result<()> {
        loop {
            let command = match xvc::read_command(&mut self.stream) {
                Ok(Some(command)) => command,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("protocol error, closing connection: {e}");
                    break;
                }
            };

            match command {
                Command::GetInfo => {
                    let reply = xvc::getinfo_reply();
                    self.trace_xvc("xvc getinfo reply", &reply);
                    self.stream.write_all(&reply)?;
                }
                Command::SetTck { period_ns } => {
                    let freq_hz = if period_ns == 0 {
                        1
                    } else {
                        (1_000_000_000u64 / period_ns as u64).clamp(1, u32::MAX as u64) as u32
                    };
                    self.mpsse.set_clock(self.usb, freq_hz)?;
                    let reply = period_ns.to_le_bytes();
                    self.trace_xvc("xvc settck reply", &reply);
                    self.stream.write_all(&reply)?;
                }
                Command::Shift { n_bits, tms, tdi } => {
                    self.trace_xvc("xvc shift tms", &tms);
                    self.trace_xvc("xvc shift tdi", &tdi);
                    let result = chunker::shift(self.usb, &self.mpsse, n_bits as usize, &tms, &tdi)?;
                    self.stats.shift_count += 1;
                    self.stats.chunk_count += result.chunks as u64;
                    self.stats.bit_count += n_bits as u64;
                    self.stats.largest_shift = self.stats.largest_shift.max(n_bits);
                    self.trace_xvc("xvc shift tdo", &result.tdo);
                    self.stream.write_all(&result.tdo)?;
                }
            }
        }

        if self.flags.statistics {
            self.print_statistics();
        }
        Ok(())
    }

    fn print_statistics(&self) {
        log::info!(
            "session stats: shifts={} chunks={} bits={} largest_shift={} usb(largest_write_req={} largest_write_sent={} largest_read_req={} runts={})",
            self.stats.shift_count,
            self.stats.chunk_count,
            self.stats.bit_count,
            self.stats.largest_shift,
            self.usb.stats.largest_write_request,
            self.usb.stats.largest_write_sent,
            self.usb.stats.largest_read_request,
            self.usb.stats.runt_count,
        );
    }
}
