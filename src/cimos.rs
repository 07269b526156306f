//! CIMOS device driver.
//!
//! Wraps a [`Transport`] and speaks the command set from [`crate::protocol`].
//! Each configuration command is answered by one acknowledgement frame that
//! must be consumed before the next command goes out; the driver does that
//! so callers only see one blocking call per command.
//!
//! # Read readiness
//!
//! The board starts streaming a read reply some time after `R` is sent. The
//! driver spins on `bytes_available()` until the first byte shows up and only
//! then blocks in `read_until`. The spin has no back-off: it burns a core
//! for as long as the conversion takes. It can be bounded with
//! [`Cimos::with_ready_timeout`] and abandoned early through the `halted`
//! predicate passed to [`Cimos::trigger_read`].

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::errors::{DriverError, Result};
use crate::protocol::{self, ChannelTag, Command, Resolution, MAX_ADDRESS, TERMINATOR};
use crate::transport::Transport;

/// Number of polls between two deadline checks while spinning.
const POLLS_PER_DEADLINE_CHECK: u32 = 1024;

/// How long a cancelled read waits for the reply it already triggered.
pub const REPLY_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

const DRAIN_POLL: Duration = Duration::from_millis(1);

pub struct Cimos {
    transport: Box<dyn Transport>,
    ready_timeout: Option<Duration>,
}

impl Cimos {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            ready_timeout: None,
        }
    }

    /// Bound the wait for a read reply. `None` waits forever.
    pub fn with_ready_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Hand the transport back, e.g. to reuse it for the next run.
    pub fn into_transport(self) -> Box<dyn Transport> {
        self.transport
    }

    // ------------------------------------------------------------------------
    // Device Commands
    // ------------------------------------------------------------------------

    pub fn set_resolution(&mut self, resolution: Resolution) -> Result<()> {
        self.send_command(Command::SetResolution(resolution))?;
        self.await_ack()
    }

    pub fn set_sample_count(&mut self, count: u16) -> Result<()> {
        self.send_command(Command::SetSampleCount(count))?;
        self.await_ack()
    }

    /// Select `address` on `channel` for the next read.
    pub fn write_address(&mut self, address: u8, channel: ChannelTag) -> Result<()> {
        debug_assert!(address <= MAX_ADDRESS);
        self.send_command(Command::WriteAddress { address, channel })?;
        self.await_ack()
    }

    /// Trigger a conversion and return the mean of the reported samples.
    ///
    /// Returns `Ok(None)` if `halted` turned true before the reply started.
    /// The reply of an abandoned read is still consumed, waiting up to
    /// [`REPLY_DRAIN_TIMEOUT`] for it, so it cannot be taken for the answer
    /// to a later command.
    pub fn trigger_read(&mut self, halted: impl Fn() -> bool) -> Result<Option<i64>> {
        self.send_command(Command::TriggerRead)?;
        if !self.wait_ready(halted)? {
            self.drain_reply();
            return Ok(None);
        }
        let frame = self.transport.read_until(TERMINATOR)?;
        trace!("read reply: {:?}", String::from_utf8_lossy(&frame));
        protocol::decode_mean(&frame).map(Some)
    }

    /// Drop unread input, e.g. a reply left behind by a cancelled read.
    pub fn interrupt(&mut self) {
        if let Err(e) = self.transport.interrupt() {
            warn!("failed to clear pending input: error={}", e);
        }
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    fn send_command(&mut self, cmd: Command) -> Result<()> {
        if !self.transport.is_connected() {
            return Err(DriverError::NotConnected);
        }
        let bytes = cmd.encode();
        trace!("send: {:?}", String::from_utf8_lossy(&bytes));
        self.transport.send(&bytes)
    }

    fn await_ack(&mut self) -> Result<()> {
        let ack = self.transport.read_until(TERMINATOR)?;
        trace!("ack: {:?}", String::from_utf8_lossy(&ack));
        Ok(())
    }

    fn drain_reply(&mut self) {
        let deadline = Instant::now() + REPLY_DRAIN_TIMEOUT;
        loop {
            match self.transport.bytes_available() {
                Ok(0) if Instant::now() < deadline => thread::sleep(DRAIN_POLL),
                Ok(0) => {
                    warn!(
                        "no reply to abandoned read within {:?}",
                        REPLY_DRAIN_TIMEOUT
                    );
                    return;
                }
                Ok(_) => break,
                Err(e) => {
                    warn!("failed to drain abandoned read: error={}", e);
                    return;
                }
            }
        }
        match self.transport.read_until(TERMINATOR) {
            Ok(frame) => debug!(
                "discarded reply of abandoned read: {:?}",
                String::from_utf8_lossy(&frame)
            ),
            Err(e) => warn!("failed to drain abandoned read: error={}", e),
        }
    }

    fn wait_ready(&mut self, halted: impl Fn() -> bool) -> Result<bool> {
        let deadline = self.ready_timeout.map(|t| Instant::now() + t);
        let mut polls = 0u32;
        loop {
            if self.transport.bytes_available()? > 0 {
                return Ok(true);
            }
            if halted() {
                debug!("halt observed while waiting for read reply");
                return Ok(false);
            }
            polls = polls.wrapping_add(1);
            if polls % POLLS_PER_DEADLINE_CHECK == 0 {
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        let waited = self.ready_timeout.unwrap_or_default();
                        warn!("device did not answer read trigger within {:?}", waited);
                        return Err(DriverError::Timeout(format!(
                            "no read reply within {waited:?}"
                        )));
                    }
                }
            }
            std::hint::spin_loop();
        }
    }
}
