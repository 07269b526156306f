//! In-process CIMOS simulator.
//!
//! [`SimulatedCimos`] implements [`Transport`] by interpreting the command
//! stream the way the board firmware does: configuration commands are
//! acknowledged, `W` latches an address and channel, `R` queues a reply
//! produced by a caller-supplied responder. Failure modes (a board that
//! stops answering, a corrupted reply, a dropped link) can be scripted.
//!
//! Every command is recorded in a shared [`WireLog`] that stays readable after
//! the simulator has been moved into the engine.

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::errors::{DriverError, Result};
use crate::protocol::{ChannelTag, TERMINATOR};
use crate::transport::{ConnectionStatus, Transport};

type Responder = Box<dyn FnMut(u8, ChannelTag) -> Vec<i64> + Send>;

/// Entry in a [`WireLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireEvent {
    /// A command received by the simulator, lossily decoded as text.
    Sent(String),
    /// A marker pushed by some other observer, e.g. a CSV sink in a test.
    Note(String),
}

/// Shared, append-only record of what crossed the simulated wire.
#[derive(Debug, Clone, Default)]
pub struct WireLog {
    events: Arc<Mutex<Vec<WireEvent>>>,
    stalled: Arc<AtomicBool>,
}

impl WireLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note(&self, text: impl Into<String>) {
        self.push(WireEvent::Note(text.into()));
    }

    pub fn events(&self) -> Vec<WireEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Commands only, in the order they were sent.
    pub fn commands(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                WireEvent::Sent(cmd) => Some(cmd),
                WireEvent::Note(_) => None,
            })
            .collect()
    }

    /// True once the simulator has swallowed a read trigger without replying.
    pub fn stalled(&self) -> bool {
        self.stalled.load(Ordering::SeqCst)
    }

    fn push(&self, event: WireEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

pub struct SimulatedCimos {
    responder: Responder,
    status: ConnectionStatus,
    pending: VecDeque<u8>,
    /// Replies still "on the wire", released once their instant has passed.
    in_flight: VecDeque<(Instant, String)>,
    reply_delay: Duration,
    address: u8,
    channel: ChannelTag,
    reads_served: usize,
    stall_after: Option<usize>,
    corrupt_read: Option<usize>,
    drop_after: Option<usize>,
    log: WireLog,
}

impl SimulatedCimos {
    /// A connected simulator whose read replies are `responder(address, channel)`.
    pub fn new<F>(responder: F) -> Self
    where
        F: FnMut(u8, ChannelTag) -> Vec<i64> + Send + 'static,
    {
        Self {
            responder: Box::new(responder),
            status: ConnectionStatus::Connected,
            pending: VecDeque::new(),
            in_flight: VecDeque::new(),
            reply_delay: Duration::ZERO,
            address: 0,
            channel: ChannelTag::Left,
            reads_served: 0,
            stall_after: None,
            corrupt_read: None,
            drop_after: None,
            log: WireLog::new(),
        }
    }

    /// A board whose reading at an address is `address * 10 + channel offset`,
    /// repeated `samples` times with a small spread around it.
    pub fn linear(samples: usize) -> Self {
        Self::new(move |address, channel| {
            let base = address as i64 * 10
                + match channel {
                    ChannelTag::Left => 0,
                    ChannelTag::Right => 3,
                    ChannelTag::InternalCap => 7,
                };
            (0..samples.max(1))
                .map(|i| base + (i as i64 % 3) - 1)
                .collect()
        })
    }

    /// Record into an existing log instead of a fresh one.
    pub fn with_log(mut self, log: WireLog) -> Self {
        self.log = log;
        self
    }

    /// Stop answering read triggers once `reads` replies have been served.
    pub fn stall_after_reads(mut self, reads: usize) -> Self {
        self.stall_after = Some(reads);
        self
    }

    /// Send a non-numeric reply for the read with this zero-based index.
    pub fn corrupt_read(mut self, index: usize) -> Self {
        self.corrupt_read = Some(index);
        self
    }

    /// Drop the link on the first command after `reads` replies.
    pub fn drop_link_after_reads(mut self, reads: usize) -> Self {
        self.drop_after = Some(reads);
        self
    }

    /// Every reply, acknowledgements included, starts arriving `delay` after
    /// its command.
    pub fn reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = delay;
        self
    }

    pub fn command_log(&self) -> WireLog {
        self.log.clone()
    }

    fn queue(&mut self, frame: &str) {
        if self.reply_delay.is_zero() {
            self.pending.extend(frame.bytes());
        } else {
            self.in_flight
                .push_back((Instant::now() + self.reply_delay, frame.to_string()));
        }
    }

    fn release_arrived(&mut self) {
        let now = Instant::now();
        while self.in_flight.front().is_some_and(|(at, _)| *at <= now) {
            if let Some((_, frame)) = self.in_flight.pop_front() {
                self.pending.extend(frame.bytes());
            }
        }
    }

    fn handle(&mut self, bytes: &[u8]) {
        match bytes.first() {
            Some(b'W') if bytes.len() >= 9 => {
                let bits = String::from_utf8_lossy(&bytes[1..8]);
                self.address = u8::from_str_radix(&bits, 2).unwrap_or(0);
                self.channel = match bytes[8] {
                    b'1' => ChannelTag::Right,
                    b'0' => ChannelTag::InternalCap,
                    _ => ChannelTag::Left,
                };
                self.queue("ok#");
            }
            Some(b'R') => {
                let index = self.reads_served;
                if self.stall_after.is_some_and(|n| index >= n) {
                    debug!("simulator stalled: reads_served={}", index);
                    self.log.stalled.store(true, Ordering::SeqCst);
                    return;
                }
                self.reads_served += 1;
                if self.corrupt_read == Some(index) {
                    self.queue("12,ab,#");
                    return;
                }
                let samples = (self.responder)(self.address, self.channel);
                let mut frame = samples
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                frame.push(',');
                frame.push(TERMINATOR as char);
                self.queue(&frame);
            }
            Some(_) => self.queue("ok#"),
            None => {}
        }
    }
}

impl Transport for SimulatedCimos {
    fn open(&mut self) -> Result<()> {
        self.status = ConnectionStatus::Connected;
        Ok(())
    }

    fn close(&mut self) {
        self.status = ConnectionStatus::Disconnected;
        self.pending.clear();
        self.in_flight.clear();
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        if self.status != ConnectionStatus::Connected {
            return Err(DriverError::NotConnected);
        }
        if self.drop_after.is_some_and(|n| self.reads_served >= n) {
            self.status = ConnectionStatus::Disconnected;
            return Err(DriverError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "simulated link dropped",
            )));
        }
        self.log
            .push(WireEvent::Sent(String::from_utf8_lossy(bytes).into_owned()));
        self.handle(bytes);
        Ok(())
    }

    fn read_until(&mut self, terminator: u8) -> Result<Vec<u8>> {
        let mut frame = Vec::new();
        loop {
            self.release_arrived();
            while let Some(byte) = self.pending.pop_front() {
                frame.push(byte);
                if byte == terminator {
                    return Ok(frame);
                }
            }
            // Block like a serial read until the next reply lands
            match self.in_flight.front() {
                Some((at, _)) => thread::sleep(at.saturating_duration_since(Instant::now())),
                None => {
                    return Err(DriverError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "simulator has no reply pending",
                    )))
                }
            }
        }
    }

    fn bytes_available(&mut self) -> Result<usize> {
        self.release_arrived();
        Ok(self.pending.len())
    }

    /// Clears what has arrived; replies still in flight land later.
    fn interrupt(&mut self) -> Result<()> {
        self.pending.clear();
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        self.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_uses_latched_address() {
        let mut sim = SimulatedCimos::new(|addr, ch| vec![addr as i64, ch.suffix() as i64]);
        sim.send(b"W00000111").unwrap();
        assert_eq!(sim.read_until(b'#').unwrap(), b"ok#");
        sim.send(b"R").unwrap();
        assert_eq!(sim.read_until(b'#').unwrap(), b"3,49,#");
    }

    #[test]
    fn delayed_reply_arrives_after_the_delay() {
        let mut sim = SimulatedCimos::new(|_, _| vec![5, 5]).reply_delay(Duration::from_millis(30));
        sim.send(b"R").unwrap();
        assert_eq!(sim.bytes_available().unwrap(), 0);
        sim.interrupt().unwrap();
        assert_eq!(sim.read_until(b'#').unwrap(), b"5,5,#");
    }

    #[test]
    fn stalled_simulator_has_nothing_to_read() {
        let mut sim = SimulatedCimos::linear(1).stall_after_reads(1);
        let log = sim.command_log();
        sim.send(b"R").unwrap();
        sim.read_until(b'#').unwrap();
        sim.send(b"R").unwrap();
        assert_eq!(sim.bytes_available().unwrap(), 0);
        assert!(log.stalled());
    }
}
