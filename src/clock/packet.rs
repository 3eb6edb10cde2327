//! NTP datagram layout (RFC 5905 header, no extensions)

use thiserror::Error;

use super::timestamp::NtpTimestamp;

/// NTP association mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum NtpMode {
    /// Unspecified
    Unspecified = 0,
    /// Symmetric active
    SymmetricActive = 1,
    /// Symmetric passive
    SymmetricPassive = 2,
    /// Client request
    Client = 3,
    /// Server response
    Server = 4,
    /// Broadcast
    Broadcast = 5,
    /// NTP control message
    Control = 6,
    /// Reserved for private use
    Private = 7,
}

impl NtpMode {
    /// Parse from the low three bits of the first header byte
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            1 => Self::SymmetricActive,
            2 => Self::SymmetricPassive,
            3 => Self::Client,
            4 => Self::Server,
            5 => Self::Broadcast,
            6 => Self::Control,
            7 => Self::Private,
            _ => Self::Unspecified,
        }
    }
}

/// Errors decoding an NTP datagram
#[derive(Debug, Error)]
pub enum NtpDecodeError {
    /// Datagram shorter than the fixed header
    #[error("buffer too small: need {needed}, have {have}")]
    BufferTooSmall {
        /// Bytes needed
        needed: usize,
        /// Bytes available
        have: usize,
    },
}

/// NTP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtpPacket {
    /// Leap indicator (2 bits)
    pub leap: u8,
    /// Protocol version (3 bits)
    pub version: u8,
    /// Association mode
    pub mode: NtpMode,
    /// Stratum
    pub stratum: u8,
    /// Poll interval (log2 seconds)
    pub poll: i8,
    /// Clock precision (log2 seconds)
    pub precision: i8,
    /// Root delay (16.16 fixed point)
    pub root_delay: u32,
    /// Root dispersion (16.16 fixed point)
    pub root_dispersion: u32,
    /// Reference identifier
    pub ref_id: u32,
    /// Time the server clock was last set
    pub reference_time: NtpTimestamp,
    /// Client transmit time echoed by the server
    pub origin_time: NtpTimestamp,
    /// Time the server received the request
    pub receive_time: NtpTimestamp,
    /// Time the packet left its sender
    pub transmit_time: NtpTimestamp,
}

impl NtpPacket {
    /// Packet size
    pub const SIZE: usize = 48;

    /// Protocol version spoken by this crate
    pub const VERSION: u8 = 4;

    /// Build a client request stamped with `transmit_time`
    #[must_use]
    pub fn request(transmit_time: NtpTimestamp) -> Self {
        Self {
            leap: 0,
            version: Self::VERSION,
            mode: NtpMode::Client,
            stratum: 0,
            poll: 0,
            precision: 0,
            root_delay: 0,
            root_dispersion: 0,
            ref_id: 0,
            reference_time: NtpTimestamp::ZERO,
            origin_time: NtpTimestamp::ZERO,
            receive_time: NtpTimestamp::ZERO,
            transmit_time,
        }
    }

    /// Build the server response to `request`
    ///
    /// The request's transmit field is echoed bit-for-bit as the origin.
    #[must_use]
    pub fn response(
        request: &Self,
        receive_time: NtpTimestamp,
        transmit_time: NtpTimestamp,
    ) -> Self {
        Self {
            leap: 0,
            version: Self::VERSION,
            mode: NtpMode::Server,
            stratum: 2,
            poll: 10,
            precision: 0,
            root_delay: 0,
            root_dispersion: 0,
            ref_id: 0,
            reference_time: receive_time,
            origin_time: request.transmit_time,
            receive_time,
            transmit_time,
        }
    }

    /// Encode to bytes
    #[must_use]
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];

        // Byte 0: LI(2) | VN(3) | Mode(3)
        buf[0] = ((self.leap & 0x03) << 6) | ((self.version & 0x07) << 3) | (self.mode as u8);
        buf[1] = self.stratum;
        buf[2] = self.poll.to_be_bytes()[0];
        buf[3] = self.precision.to_be_bytes()[0];
        buf[4..8].copy_from_slice(&self.root_delay.to_be_bytes());
        buf[8..12].copy_from_slice(&self.root_dispersion.to_be_bytes());
        buf[12..16].copy_from_slice(&self.ref_id.to_be_bytes());
        buf[16..24].copy_from_slice(&self.reference_time.encode());
        buf[24..32].copy_from_slice(&self.origin_time.encode());
        buf[32..40].copy_from_slice(&self.receive_time.encode());
        buf[40..48].copy_from_slice(&self.transmit_time.encode());

        buf
    }

    /// Decode from bytes
    ///
    /// Bytes past the fixed header (extension fields, MAC) are ignored.
    ///
    /// # Errors
    ///
    /// Returns `NtpDecodeError::BufferTooSmall` for short datagrams.
    pub fn decode(buf: &[u8]) -> Result<Self, NtpDecodeError> {
        if buf.len() < Self::SIZE {
            return Err(NtpDecodeError::BufferTooSmall {
                needed: Self::SIZE,
                have: buf.len(),
            });
        }

        let u32_at = |i: usize| u32::from_be_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        let ts_at = |i: usize| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[i..i + 8]);
            NtpTimestamp::decode(raw)
        };

        Ok(Self {
            leap: buf[0] >> 6,
            version: (buf[0] >> 3) & 0x07,
            mode: NtpMode::from_bits(buf[0]),
            stratum: buf[1],
            poll: i8::from_be_bytes([buf[2]]),
            precision: i8::from_be_bytes([buf[3]]),
            root_delay: u32_at(4),
            root_dispersion: u32_at(8),
            ref_id: u32_at(12),
            reference_time: ts_at(16),
            origin_time: ts_at(24),
            receive_time: ts_at(32),
            transmit_time: ts_at(40),
        })
    }
}
