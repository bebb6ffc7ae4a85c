//! TCP accept loop and server-lifetime USB state.
//!
//! A single listening socket, one connection handled at a time, the device
//! opened once and MPSSE re-initialized on every accept rather than
//! reopened. No hotplug watcher; the device is opened synchronously on
//! first connection instead.

use std::net::{TcpListener, TcpStream};

use crate::config::Config;
use crate::error::Result;
use crate::mpsse::MpsseAdapter;
use crate::session::Session;
use crate::usb::UsbTransport;

pub struct Server {
    config: Config,
    listener: TcpListener,
    usb: Option<UsbTransport>,
}

impl Server {
    /// Binds the listening socket. A genuine `listen(2)` backlog of 1 isn't
    /// reachable through `std::net::TcpListener` alone; the single-session
    /// model is still enforced in practice because `run` never calls
    /// `accept` again until the current connection's `Session` has
    /// returned.
    pub fn bind(config: Config) -> Result<Self> {
        let addr = format!("{}:{}", config.bind_address, config.port);
        let listener = TcpListener::bind(&addr)?;
        log::info!("listening on {addr}");
        Ok(Self { config, listener, usb: None })
    }

    /// Accepts connections forever, handling exactly one at a time.
    pub fn run(mut self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept()?;
            if !self.config.flags.quiet {
                log::info!("connection from {peer}");
            }

            if let Err(e) = self.handle_connection(stream) {
                log::error!("session for {peer} ended with error: {e}");
                // USB errors terminate the session but not the daemon; the
                // next accept re-runs MPSSE init on the same handle.
            } else if !self.config.flags.quiet {
                log::info!("connection from {peer} closed");
            }
        }
    }

    fn handle_connection(&mut self, stream: TcpStream) -> Result<()> {
        if self.usb.is_none() {
            let mut usb = UsbTransport::open(
                self.config.vendor_id,
                self.config.product_id,
                self.config.serial.as_deref(),
                self.config.interface_index,
            )?;
            usb.set_report_runts(self.config.flags.runt);
            usb.set_trace(self.config.flags.show_usb);
            self.usb = Some(usb);
        }
        let usb = self.usb.as_mut().expect("just established above");

        let mut mpsse = MpsseAdapter::new(self.config.locked_frequency);
        mpsse.loopback = self.config.flags.loopback;
        mpsse.init(usb)?;
        if let Some(gpio_spec) = self.config.gpio_spec.clone() {
            mpsse.set_gpio(usb, &gpio_spec)?;
        }

        let mut session = Session::new(stream, usb, mpsse, self.config.flags);
        session.run()
    }
}
