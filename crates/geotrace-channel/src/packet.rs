//! ICMP echo request construction using pnet.

use geotrace_core::TraceError;
use pnet_packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet_packet::icmp::{IcmpCode, IcmpPacket, IcmpTypes};

/// Echo request length: 8 byte ICMP header plus a 1 byte payload.
const ECHO_REQUEST_LEN: usize = 9;

/// Creates an ICMP Echo Request (header only, no IP layer; the kernel
/// fills in the IP header and the TTL comes from a socket option).
///
/// The sequence number identifies which TTL the probe was sent with.
pub fn create_echo_request(echo_id: u16, seq: u16) -> Result<Vec<u8>, TraceError> {
    let mut buffer = vec![0u8; ECHO_REQUEST_LEN];

    {
        let mut echo = MutableEchoRequestPacket::new(&mut buffer).ok_or_else(|| {
            TraceError::Internal("Failed to create ICMP echo packet".to_string())
        })?;
        echo.set_icmp_type(IcmpTypes::EchoRequest);
        echo.set_icmp_code(IcmpCode::new(0));
        echo.set_identifier(echo_id);
        echo.set_sequence_number(seq);
        echo.set_payload(&[seq as u8]);
    }

    {
        let view = IcmpPacket::new(&buffer)
            .ok_or_else(|| TraceError::Internal("Failed to create ICMP view".to_string()))?;
        let checksum = pnet_packet::icmp::checksum(&view);
        buffer[2] = (checksum >> 8) as u8;
        buffer[3] = (checksum & 0xff) as u8;
    }

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_echo_request() {
        let packet = create_echo_request(0xABCD, 7).unwrap();

        assert_eq!(packet.len(), ECHO_REQUEST_LEN);
        // Type 8 = Echo Request, code 0.
        assert_eq!(packet[0], 8);
        assert_eq!(packet[1], 0);

        let id = u16::from_be_bytes([packet[4], packet[5]]);
        assert_eq!(id, 0xABCD);
        let seq = u16::from_be_bytes([packet[6], packet[7]]);
        assert_eq!(seq, 7);
    }

    #[test]
    fn test_checksum_is_set() {
        let packet = create_echo_request(1, 1).unwrap();
        let checksum = u16::from_be_bytes([packet[2], packet[3]]);
        assert_ne!(checksum, 0);
    }
}
