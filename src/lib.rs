//! xvcd-ftdi: bridges Xilinx Virtual Cable (XVC) clients over TCP to a
//! JTAG adapter built on an FTDI MPSSE-capable USB chip.
//!
//! The USB transport, MPSSE adapter, and shift chunker are plain value
//! types with no virtual dispatch: callers pass handles explicitly rather
//! than going through trait objects.

#![forbid(unsafe_code)]

pub mod chunker;
pub mod config;
pub mod error;
pub mod mpsse;
pub mod server;
pub mod session;
pub mod usb;
pub mod xvc;
