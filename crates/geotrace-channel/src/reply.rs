//! Classification of captured ICMP replies.

use pnet_packet::icmp::echo_reply::EchoReplyPacket;
use pnet_packet::icmp::time_exceeded::TimeExceededPacket;
use pnet_packet::icmp::{IcmpPacket, IcmpTypes};
use pnet_packet::ip::IpNextHeaderProtocols;
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::Packet;
use std::net::{IpAddr, Ipv4Addr};
use tracing::trace;

/// A reply matched to one of our outstanding probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeReply {
    /// TTL expired at an intermediate router.
    TimeExceeded { from: IpAddr },
    /// The destination answered; the route is complete.
    EchoReply { from: IpAddr },
}

/// Classifies a captured IPv4 frame against our probe identity.
///
/// Returns `None` for traffic that is not a reply to our echoes (the
/// capture channel sees everything ICMP on the interface).
pub fn classify_reply(
    frame: &[u8],
    echo_id: u16,
    target: Ipv4Addr,
) -> Option<ProbeReply> {
    let ip = Ipv4Packet::new(frame)?;
    if ip.get_next_level_protocol() != IpNextHeaderProtocols::Icmp {
        return None;
    }
    let from = ip.get_source();

    let icmp = IcmpPacket::new(ip.payload())?;
    match icmp.get_icmp_type() {
        t if t == IcmpTypes::TimeExceeded => {
            let exceeded = TimeExceededPacket::new(ip.payload())?;
            classify_time_exceeded(exceeded.payload(), echo_id, target)
                .map(|()| ProbeReply::TimeExceeded {
                    from: IpAddr::V4(from),
                })
        }
        t if t == IcmpTypes::EchoReply => {
            let reply = EchoReplyPacket::new(ip.payload())?;
            if reply.get_identifier() != echo_id {
                trace!(
                    expected = echo_id,
                    actual = reply.get_identifier(),
                    "Ignored echo reply with different echo id"
                );
                return None;
            }
            Some(ProbeReply::EchoReply {
                from: IpAddr::V4(from),
            })
        }
        _ => None,
    }
}

/// Validates the original datagram embedded in a Time Exceeded message:
/// it must be our ICMP echo request (type 8, our echo id) headed for our
/// target.
fn classify_time_exceeded(original: &[u8], echo_id: u16, target: Ipv4Addr) -> Option<()> {
    let inner_ip = Ipv4Packet::new(original)?;
    if inner_ip.get_next_level_protocol() != IpNextHeaderProtocols::Icmp {
        return None;
    }
    if inner_ip.get_destination() != target {
        trace!(
            expected = %target,
            actual = %inner_ip.get_destination(),
            "Ignored time exceeded for different destination"
        );
        return None;
    }

    // Routers quote at least the first 8 bytes of the expired datagram's
    // payload: type(1) code(1) checksum(2) id(2) seq(2).
    let quoted = inner_ip.payload();
    if quoted.len() < 8 {
        return None;
    }
    if quoted[0] != 8 {
        return None;
    }
    let id = u16::from_be_bytes([quoted[4], quoted[5]]);
    if id != echo_id {
        trace!(
            expected = echo_id,
            actual = id,
            "Ignored time exceeded with different echo id"
        );
        return None;
    }

    Some(())
}
