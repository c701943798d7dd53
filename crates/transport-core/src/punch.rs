//! NAT hole-punching over a connected UDP socket.
//!
//! The client sends probe frames carrying its device id. The device (or the
//! NAT mapping the broker opened for it) answers with a single status byte.
//! Probes are spaced `probe_interval` apart and capped both by count and by
//! the overall deadline, whichever is reached first.

use std::time::Duration;

use bytes::{Bytes, BytesMut, BufMut};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace, warn};

use crate::config::TransportConfig;
use crate::error::Error;
use crate::frame::{Frame, PacketType};
use crate::link::{Link, UdpLink};
use crate::Result;

/// Probe answer status bytes
pub const PROBE_ACCEPTED: u8 = 0;
pub const PROBE_AUTH_REJECTED: u8 = 1;

/// Build a probe frame for `device_id`
pub fn probe_frame(device_id: &str) -> Frame {
    Frame::new(PacketType::HolePunch, Bytes::copy_from_slice(device_id.as_bytes()))
}

/// Build the answer a device sends back to a probe
pub fn probe_answer(status: u8) -> Frame {
    let mut body = BytesMut::with_capacity(1);
    body.put_u8(status);
    Frame::from_device(PacketType::HolePunch, body.freeze())
}

/// Outcome of a single probe window
enum ProbeResult {
    Accepted,
    Rejected,
    Silent,
}

/// Punch through to the device behind `link`.
///
/// Returns the number of probes sent on success. Fails with
/// [`Error::P2PAuthFailed`] when the device rejects us and with
/// [`Error::HandshakeTimeout`] when the budget runs out.
pub async fn hole_punch(link: &UdpLink, device_id: &str, config: &TransportConfig) -> Result<u32> {
    let deadline = Instant::now() + config.p2p_timeout();
    let probe = probe_frame(device_id).encode()?;
    let mut sent = 0u32;

    while sent < config.max_probes && Instant::now() < deadline {
        if let Err(e) = link.send_raw(&probe).await {
            // ICMP unreachable on a connected socket surfaces here; keep probing.
            trace!(device_id, error = %e, "probe send failed");
        }
        sent += 1;

        let window_end = (Instant::now() + config.probe_interval()).min(deadline);
        match await_answer(link, window_end).await {
            ProbeResult::Accepted => {
                debug!(device_id, probes = sent, "hole punched");
                return Ok(sent);
            }
            ProbeResult::Rejected => {
                warn!(device_id, "device rejected P2P authentication");
                return Err(Error::P2PAuthFailed);
            }
            ProbeResult::Silent => {}
        }
    }

    debug!(device_id, probes = sent, "hole punch exhausted");
    Err(Error::HandshakeTimeout(config.p2p_timeout()))
}

async fn await_answer(link: &UdpLink, until: Instant) -> ProbeResult {
    loop {
        let raw = match timeout_at(until, link.recv_raw()).await {
            Err(_) => return ProbeResult::Silent,
            Ok(Err(e)) => {
                trace!(error = %e, "probe receive error");
                // Avoid spinning on a socket that keeps erroring.
                tokio::time::sleep_until(until.min(Instant::now() + Duration::from_millis(10))).await;
                if Instant::now() >= until {
                    return ProbeResult::Silent;
                }
                continue;
            }
            Ok(Ok(raw)) => raw,
        };

        let frame = match Frame::decode(raw) {
            Ok(frame) => frame,
            Err(e) => {
                trace!(error = %e, "ignoring undecodable datagram while punching");
                continue;
            }
        };
        if frame.packet_type() != PacketType::HolePunch {
            continue;
        }
        return match frame.body.first() {
            Some(&PROBE_ACCEPTED) => ProbeResult::Accepted,
            Some(&PROBE_AUTH_REJECTED) => ProbeResult::Rejected,
            _ => continue,
        };
    }
}
