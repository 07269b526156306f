//! CIMOS ASCII line protocol.
//!
//! Every command is a short ASCII string; every reply is a frame terminated
//! by [`TERMINATOR`]. Replies to configuration commands are acknowledgements
//! whose content is ignored. Replies to a read trigger carry comma-separated
//! signed integers, optionally with a trailing comma.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};

/// Sentinel closing every response frame.
pub const TERMINATOR: u8 = b'#';

/// Number of sweep addresses (7-bit).
pub const ADDRESS_COUNT: usize = 128;

/// Highest address accepted by the write command.
pub const MAX_ADDRESS: u8 = 127;

/// Current-controlled oscillator resolution setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Resolution {
    #[default]
    #[serde(rename = "000")]
    R000,
    #[serde(rename = "001")]
    R001,
    #[serde(rename = "011")]
    R011,
    #[serde(rename = "111")]
    R111,
}

impl Resolution {
    pub const ALL: [Resolution; 4] = [
        Resolution::R000,
        Resolution::R001,
        Resolution::R011,
        Resolution::R111,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::R000 => "000",
            Resolution::R001 => "001",
            Resolution::R011 => "011",
            Resolution::R111 => "111",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Resolution::ALL
            .into_iter()
            .find(|r| r.as_str() == s.trim())
            .ok_or_else(|| format!("unknown resolution {s:?} (expected 000, 001, 011 or 111)"))
    }
}

/// A physical measurement channel as addressed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelTag {
    Left,
    Right,
    InternalCap,
}

impl ChannelTag {
    /// Suffix byte appended to every write-address command.
    pub fn suffix(self) -> u8 {
        match self {
            ChannelTag::Left => b' ',
            ChannelTag::Right => b'1',
            ChannelTag::InternalCap => b'0',
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ChannelTag::Left => "left",
            ChannelTag::Right => "right",
            ChannelTag::InternalCap => "internal",
        }
    }
}

impl fmt::Display for ChannelTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A device command, in the order the engine issues them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetResolution(Resolution),
    SetSampleCount(u16),
    WriteAddress { address: u8, channel: ChannelTag },
    TriggerRead,
}

impl Command {
    /// Wire bytes for this command.
    pub fn encode(&self) -> Vec<u8> {
        match *self {
            Command::SetResolution(res) => format!("G{res}").into_bytes(),
            Command::SetSampleCount(n) => {
                let mut out = format!("S{n}").into_bytes();
                out.push(0);
                out
            }
            Command::WriteAddress { address, channel } => {
                let mut out = Vec::with_capacity(9);
                out.push(b'W');
                out.extend_from_slice(encode_address(address).as_bytes());
                out.push(channel.suffix());
                out
            }
            Command::TriggerRead => vec![b'R'],
        }
    }
}

/// Seven-character, zero-padded binary form of a sweep address.
pub fn encode_address(address: u8) -> String {
    format!("{:07b}", address & MAX_ADDRESS)
}

/// Parse a read reply into its samples.
///
/// The terminator and one trailing comma are stripped; every remaining token
/// must be a signed integer.
pub fn decode_samples(frame: &[u8]) -> Result<Vec<i64>> {
    let text = std::str::from_utf8(frame).map_err(|_| DriverError::decode(frame, "not ASCII"))?;
    let body = text.strip_suffix(TERMINATOR as char).unwrap_or(text).trim();
    let body = body.strip_suffix(',').unwrap_or(body);
    if body.trim().is_empty() {
        return Err(DriverError::decode(frame, "no samples"));
    }

    body.split(',')
        .map(|token| {
            token.trim().parse::<i64>().map_err(|_| {
                DriverError::decode(frame, format!("non-numeric token {:?}", token.trim()))
            })
        })
        .collect()
}

/// Arithmetic mean of the samples, truncated toward zero.
pub fn mean(samples: &[i64]) -> Option<i64> {
    if samples.is_empty() {
        return None;
    }
    // The mean of i64 values always fits in i64, their sum may not
    let sum: i128 = samples.iter().map(|&v| i128::from(v)).sum();
    i64::try_from(sum / samples.len() as i128).ok()
}

/// Decode a read reply straight to its mean value.
pub fn decode_mean(frame: &[u8]) -> Result<i64> {
    let samples = decode_samples(frame)?;
    mean(&samples).ok_or_else(|| DriverError::decode(frame, "no samples"))
}
