//! Signal messages: synchronized playback actions

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};

use super::{ProtocolError, wire};

/// Playback action carried by a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum SignalAction {
    /// Load the named file and start playing it
    Play = 1,
    /// Stop playback
    Stop = 2,
    /// Pause playback
    Pause = 3,
    /// Resume paused playback
    Resume = 4,
}

impl SignalAction {
    /// Parse from wire value
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::UnknownSignalAction` for unassigned codes.
    pub fn from_code(code: u32) -> Result<Self, ProtocolError> {
        match code {
            1 => Ok(Self::Play),
            2 => Ok(Self::Stop),
            3 => Ok(Self::Pause),
            4 => Ok(Self::Resume),
            other => Err(ProtocolError::UnknownSignalAction(other)),
        }
    }

    /// Wire value
    #[must_use]
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Play => "PLAY",
            Self::Stop => "STOP",
            Self::Pause => "PAUSE",
            Self::Resume => "RESUME",
        };
        f.write_str(name)
    }
}

/// A playback action to execute at `sent_at + delay_seconds`
///
/// `sent_at` is a timestamp on the authoritative clock, in seconds since the
/// Unix epoch. `file_name` is present exactly when the action is
/// [`SignalAction::Play`].
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMessage {
    /// Action to perform
    pub action: SignalAction,
    /// Authoritative time the signal was issued (seconds since Unix epoch)
    pub sent_at: f64,
    /// Seconds to wait after `sent_at` before executing
    pub delay_seconds: u32,
    /// File to play (only for `Play`)
    pub file_name: Option<String>,
}

impl SignalMessage {
    /// Build a `Play` signal
    pub fn play(file_name: impl Into<String>, sent_at: SystemTime, delay_seconds: u32) -> Self {
        Self {
            action: SignalAction::Play,
            sent_at: unix_secs(sent_at),
            delay_seconds,
            file_name: Some(file_name.into()),
        }
    }

    /// Build a signal for an action that carries no file
    #[must_use]
    pub fn control(action: SignalAction, sent_at: SystemTime, delay_seconds: u32) -> Self {
        Self {
            action,
            sent_at: unix_secs(sent_at),
            delay_seconds,
            file_name: None,
        }
    }

    /// Instant at which the action must run, on the authoritative clock
    ///
    /// Decoded messages always have a representable target. For a message
    /// built by hand whose target overflows `SystemTime`, this falls back to
    /// the Unix epoch; use [`SignalMessage::checked_target_instant`] to detect
    /// that case.
    #[must_use]
    pub fn target_instant(&self) -> SystemTime {
        self.checked_target_instant().unwrap_or(UNIX_EPOCH)
    }

    /// Instant at which the action must run, or `None` if `sent_at` is not a
    /// valid timestamp or `sent_at + delay_seconds` cannot be represented
    #[must_use]
    pub fn checked_target_instant(&self) -> Option<SystemTime> {
        target_of(self.sent_at, self.delay_seconds)
    }

    /// Append the wire encoding of this message
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::Malformed` if a `Play` signal has no file name
    /// or the name does not fit its length prefix.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let file_name = match (self.action, self.file_name.as_deref()) {
            (SignalAction::Play, Some(name)) if !name.is_empty() => name,
            (SignalAction::Play, _) => {
                return Err(ProtocolError::malformed("play signal without a file name"));
            }
            _ => "",
        };

        buf.put_u32(self.action.code());
        buf.put_f64(self.sent_at);
        buf.put_u32(self.delay_seconds);
        wire::put_str(buf, "file name", file_name)
    }

    /// Decode a message body (without the envelope discriminant)
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::UnknownSignalAction` for unassigned action codes
    /// and `ProtocolError::Malformed` for truncated or inconsistent fields.
    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtocolError> {
        let code = wire::get_u32(&mut buf, "signal action")?;
        let sent_at = wire::get_f64(&mut buf, "sent_at")?;
        let delay_seconds = wire::get_u32(&mut buf, "delay_seconds")?;
        let file_name = wire::get_str(&mut buf, "file name")?;
        wire::finish(buf, "signal message")?;

        let action = SignalAction::from_code(code)?;

        if target_of(sent_at, delay_seconds).is_none() {
            return Err(ProtocolError::malformed(format!(
                "sent_at {sent_at} with delay {delay_seconds}s is not a valid timestamp"
            )));
        }

        let file_name = match action {
            SignalAction::Play if file_name.is_empty() => {
                return Err(ProtocolError::malformed("play signal without a file name"));
            }
            SignalAction::Play => Some(file_name),
            _ => None,
        };

        Ok(Self {
            action,
            sent_at,
            delay_seconds,
            file_name,
        })
    }
}

fn target_of(sent_at: f64, delay_seconds: u32) -> Option<SystemTime> {
    if !sent_at.is_finite() || sent_at < 0.0 {
        return None;
    }
    let sent = Duration::try_from_secs_f64(sent_at).ok()?;
    let total = sent.checked_add(Duration::from_secs(u64::from(delay_seconds)))?;
    UNIX_EPOCH.checked_add(total)
}

fn unix_secs(at: SystemTime) -> f64 {
    at.duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}
