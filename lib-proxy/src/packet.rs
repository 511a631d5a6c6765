//! Packet-type bands and flag-byte obfuscation.
//!
//! Every frame is `length(be16) || flag(u8) || body`. The flag's low seven
//! bits land somewhere inside the sender's type band - a fresh random pick
//! per packet, so a passive observer never sees a constant type byte. The
//! high bit marks the ACK direction. Receivers classify by band only.

use lib_crypto::random;

pub const PACKET_HEADER_BYTES: usize = 3;

/// Frames above this are a protocol violation.
pub const MAX_DATA_PACKET_SIZE: usize = 0x7FFF;

/// Control frames stay small.
pub const MAX_CONTROL_PACKET_SIZE: usize = 0x1000;

const AUTH_MIN: u8 = 0x00;
const AUTH_MAX: u8 = 0x07;
const ATTACH_MIN: u8 = 0x08;
const ATTACH_MAX: u8 = 0x0F;
const PING_MIN: u8 = 0x10;
const PING_MAX: u8 = 0x1F;
const CONNECT_MIN: u8 = 0x20;
const CONNECT_MAX: u8 = 0x2F;
const DISCONNECT_MIN: u8 = 0x30;
const DISCONNECT_MAX: u8 = 0x3F;
const DATA_MIN: u8 = 0x40;
const DATA_MAX: u8 = 0x6F;
const ERROR_MIN: u8 = 0x70;
const ERROR_MAX: u8 = 0x7F;

const ACK_MASK: u8 = 0x80;
const TYPE_MASK: u8 = 0x7F;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PacketType {
    Auth,
    AuthAck,
    Attach,
    AttachAck,
    Ping,
    PingAck,
    Connect,
    ConnectAck,
    Disconnect,
    DisconnectAck,
    Data,
    Error,
}

impl PacketType {
    /// A random flag byte within this type's band.
    pub fn flag(&self) -> u8 {
        fn pick(min: u8, max: u8) -> u8 {
            min + random::u8_below(max - min + 1)
        }
        match self {
            PacketType::Auth => pick(AUTH_MIN, AUTH_MAX),
            PacketType::AuthAck => pick(AUTH_MIN, AUTH_MAX) | ACK_MASK,
            PacketType::Attach => pick(ATTACH_MIN, ATTACH_MAX),
            PacketType::AttachAck => pick(ATTACH_MIN, ATTACH_MAX) | ACK_MASK,
            PacketType::Ping => pick(PING_MIN, PING_MAX),
            PacketType::PingAck => pick(PING_MIN, PING_MAX) | ACK_MASK,
            PacketType::Connect => pick(CONNECT_MIN, CONNECT_MAX),
            PacketType::ConnectAck => pick(CONNECT_MIN, CONNECT_MAX) | ACK_MASK,
            PacketType::Disconnect => pick(DISCONNECT_MIN, DISCONNECT_MAX),
            PacketType::DisconnectAck => pick(DISCONNECT_MIN, DISCONNECT_MAX) | ACK_MASK,
            PacketType::Data => pick(DATA_MIN, DATA_MAX),
            PacketType::Error => pick(ERROR_MIN, ERROR_MAX) | ACK_MASK,
        }
    }

    /// Classify a received flag byte by its band.
    pub fn of(flag: u8) -> Option<PacketType> {
        let ack = flag & ACK_MASK != 0;
        let band = flag & TYPE_MASK;
        Some(match band {
            AUTH_MIN..=AUTH_MAX => {
                if ack {
                    PacketType::AuthAck
                } else {
                    PacketType::Auth
                }
            }
            ATTACH_MIN..=ATTACH_MAX => {
                if ack {
                    PacketType::AttachAck
                } else {
                    PacketType::Attach
                }
            }
            PING_MIN..=PING_MAX => {
                if ack {
                    PacketType::PingAck
                } else {
                    PacketType::Ping
                }
            }
            CONNECT_MIN..=CONNECT_MAX => {
                if ack {
                    PacketType::ConnectAck
                } else {
                    PacketType::Connect
                }
            }
            DISCONNECT_MIN..=DISCONNECT_MAX => {
                if ack {
                    PacketType::DisconnectAck
                } else {
                    PacketType::Disconnect
                }
            }
            DATA_MIN..=DATA_MAX => {
                if ack {
                    return None;
                }
                PacketType::Data
            }
            ERROR_MIN..=ERROR_MAX => PacketType::Error,
            _ => return None,
        })
    }

    pub fn is_ack(flag: u8) -> bool {
        flag & ACK_MASK != 0
    }

    /// Control packets pad with random bytes; AUTH pads inside its sealed
    /// payload, DATA and ERROR carry exact payloads.
    pub fn takes_padding(&self) -> bool {
        !matches!(self, PacketType::Auth | PacketType::Data | PacketType::Error)
    }

    pub fn name(&self) -> &'static str {
        match self {
            PacketType::Auth => "AUTH",
            PacketType::AuthAck => "AUTH_ACK",
            PacketType::Attach => "ATTACH",
            PacketType::AttachAck => "ATTACH_ACK",
            PacketType::Ping => "PING",
            PacketType::PingAck => "PING_ACK",
            PacketType::Connect => "CONNECT",
            PacketType::ConnectAck => "CONNECT_ACK",
            PacketType::Disconnect => "DISCONNECT",
            PacketType::DisconnectAck => "DISCONNECT_ACK",
            PacketType::Data => "DATA",
            PacketType::Error => "ERROR",
        }
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Assemble a complete frame: length, disguised flag, body, padding.
pub fn build_frame(packet_type: PacketType, body: &[u8]) -> Vec<u8> {
    let padding = if packet_type.takes_padding() {
        random::u8_below(255) as usize + 1
    } else {
        0
    };
    let size = PACKET_HEADER_BYTES + body.len() + padding;
    debug_assert!(size <= MAX_DATA_PACKET_SIZE);

    let mut frame = Vec::with_capacity(size);
    frame.extend_from_slice(&(size as u16).to_be_bytes());
    frame.push(packet_type.flag());
    frame.extend_from_slice(body);
    if padding > 0 {
        let mut pad = vec![0u8; padding];
        random::fill(&mut pad);
        frame.extend_from_slice(&pad);
    }
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_band_round_trips() {
        let types = [
            PacketType::Auth,
            PacketType::AuthAck,
            PacketType::Attach,
            PacketType::AttachAck,
            PacketType::Ping,
            PacketType::PingAck,
            PacketType::Connect,
            PacketType::ConnectAck,
            PacketType::Disconnect,
            PacketType::DisconnectAck,
            PacketType::Data,
            PacketType::Error,
        ];
        for t in types {
            for _ in 0..64 {
                assert_eq!(PacketType::of(t.flag()), Some(t), "band for {}", t);
            }
        }
    }

    #[test]
    fn acked_data_is_invalid() {
        assert_eq!(PacketType::of(DATA_MIN | ACK_MASK), None);
    }

    #[test]
    fn flags_vary_within_the_band() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..256 {
            seen.insert(PacketType::Data.flag());
        }
        assert!(seen.len() > 8, "flag bytes should be spread over the band");
    }

    #[test]
    fn frame_length_includes_header_and_padding() {
        let frame = build_frame(PacketType::Data, b"payload");
        let declared = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        assert_eq!(declared, frame.len());
        assert_eq!(declared, PACKET_HEADER_BYTES + b"payload".len());

        let padded = build_frame(PacketType::Ping, b"");
        let declared = u16::from_be_bytes([padded[0], padded[1]]) as usize;
        assert_eq!(declared, padded.len());
        assert!(declared > PACKET_HEADER_BYTES);
    }
}
