//! Shared clock: an NTP-style service, a client that queries it, and
//! helpers that wait for an instant measured on it

mod client;
mod packet;
mod schedule;
mod service;
mod timestamp;

#[cfg(test)]
mod tests;

pub use client::{ClockClient, ClockSample, query};
pub use packet::{NtpDecodeError, NtpMode, NtpPacket};
pub use schedule::{AuthoritativeClock, SystemClock, remaining_wait, wait_until};
pub use service::{ClockService, ServiceState};
pub use timestamp::{NTP_EPOCH_OFFSET, NtpTimestamp};
