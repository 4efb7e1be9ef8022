//! Binary wire codec for the peer-to-peer data channel.
//!
//! Per-frame traffic travels over an unreliable, unordered DataChannel, so
//! every packet is self-contained and hand-packed into a fixed big-endian
//! layout:
//!
//! | type | name          | payload                                          |
//! |------|---------------|--------------------------------------------------|
//! | 0x01 | input         | frame u32, player u8, count u8, count × (frame u32, action i32) |
//! | 0x05 | ping          | timestamp u64                                    |
//! | 0x06 | pong          | echoed timestamp u64                             |
//! | 0x07 | state_hash    | frame u32, hash 8 bytes (13 bytes total)         |
//! | 0x08 | episode_ready | episode u32, end frame u32                       |
//!
//! Input packets carry a redundancy block of the sender's most recent
//! inputs so that lost packets are recovered by their successors without
//! retransmission.

use smallvec::SmallVec;

use crate::env::Action;
use crate::state_hash::StateHash;
use crate::{Frame, PlayerId};

/// Type byte of an input packet.
pub const PACKET_INPUT: u8 = 0x01;
/// Type byte of a ping packet.
pub const PACKET_PING: u8 = 0x05;
/// Type byte of a pong packet.
pub const PACKET_PONG: u8 = 0x06;
/// Type byte of a state-hash packet.
pub const PACKET_STATE_HASH: u8 = 0x07;
/// Type byte of an episode-ready packet.
pub const PACKET_EPISODE_READY: u8 = 0x08;

/// How many of the most recent inputs accompany each input packet.
pub const INPUT_REDUNDANCY: usize = 8;

/// A decoded input packet: the newest input plus its redundancy block.
///
/// The entry for the head frame is always first in `inputs`; receivers
/// de-duplicate by (frame, player), so ordering is otherwise irrelevant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputPacket {
    /// The sending player.
    pub player: PlayerId,
    /// The newest frame covered by this packet.
    pub frame: Frame,
    /// (frame, action) pairs, newest first.
    pub inputs: SmallVec<[(Frame, Action); INPUT_REDUNDANCY]>,
}

/// A decoded peer-to-peer packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Per-frame input with redundancy block.
    Input(InputPacket),
    /// RTT probe request.
    Ping {
        /// Sender's timestamp in milliseconds; opaque to the receiver.
        timestamp_ms: u64,
    },
    /// RTT probe echo.
    Pong {
        /// The timestamp from the ping being answered.
        timestamp_ms: u64,
    },
    /// Digest of the sender's confirmed state at a frame.
    StateHash {
        /// The confirmed frame the digest belongs to.
        frame: Frame,
        /// The truncated SHA-256 digest.
        hash: StateHash,
    },
    /// Declaration of the sender's locally detected episode end.
    EpisodeReady {
        /// Episode index the declaration belongs to.
        episode: u32,
        /// The sender's local episode end frame.
        end_frame: Frame,
    },
}

/// Errors raised while decoding a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer ended before the advertised payload.
    Truncated {
        /// Bytes required by the layout.
        needed: usize,
        /// Bytes actually present.
        got: usize,
    },
    /// The first byte did not name a known packet type.
    UnknownType(u8),
    /// The buffer was empty.
    Empty,
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Truncated { needed, got } => {
                write!(f, "truncated packet: needed {needed} bytes, got {got}")
            }
            Self::UnknownType(byte) => write!(f, "unknown packet type 0x{byte:02x}"),
            Self::Empty => write!(f, "empty packet"),
        }
    }
}

impl std::error::Error for CodecError {}

/// Encodes a packet into a fresh byte vector.
#[must_use]
pub fn encode(packet: &Packet) -> Vec<u8> {
    match packet {
        Packet::Input(input) => {
            let mut buf = Vec::with_capacity(7 + input.inputs.len() * 8);
            buf.push(PACKET_INPUT);
            buf.extend_from_slice(&(input.frame.as_i32() as u32).to_be_bytes());
            buf.push(input.player.as_usize() as u8);
            buf.push(input.inputs.len() as u8);
            for (frame, action) in &input.inputs {
                buf.extend_from_slice(&(frame.as_i32() as u32).to_be_bytes());
                buf.extend_from_slice(&action.to_be_bytes());
            }
            buf
        }
        Packet::Ping { timestamp_ms } => {
            let mut buf = Vec::with_capacity(9);
            buf.push(PACKET_PING);
            buf.extend_from_slice(&timestamp_ms.to_be_bytes());
            buf
        }
        Packet::Pong { timestamp_ms } => {
            let mut buf = Vec::with_capacity(9);
            buf.push(PACKET_PONG);
            buf.extend_from_slice(&timestamp_ms.to_be_bytes());
            buf
        }
        Packet::StateHash { frame, hash } => {
            let mut buf = Vec::with_capacity(13);
            buf.push(PACKET_STATE_HASH);
            buf.extend_from_slice(&(frame.as_i32() as u32).to_be_bytes());
            buf.extend_from_slice(hash.as_bytes());
            buf
        }
        Packet::EpisodeReady { episode, end_frame } => {
            let mut buf = Vec::with_capacity(9);
            buf.push(PACKET_EPISODE_READY);
            buf.extend_from_slice(&episode.to_be_bytes());
            buf.extend_from_slice(&(end_frame.as_i32() as u32).to_be_bytes());
            buf
        }
    }
}

fn read_u32(bytes: &[u8], at: usize) -> Result<u32, CodecError> {
    let slice = bytes
        .get(at..at + 4)
        .ok_or(CodecError::Truncated {
            needed: at + 4,
            got: bytes.len(),
        })?;
    let mut arr = [0u8; 4];
    arr.copy_from_slice(slice);
    Ok(u32::from_be_bytes(arr))
}

fn read_u64(bytes: &[u8], at: usize) -> Result<u64, CodecError> {
    let slice = bytes
        .get(at..at + 8)
        .ok_or(CodecError::Truncated {
            needed: at + 8,
            got: bytes.len(),
        })?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(slice);
    Ok(u64::from_be_bytes(arr))
}

/// Decodes a packet from raw bytes.
///
/// # Errors
/// Returns [`CodecError`] for empty buffers, unknown type bytes, and
/// truncated payloads. Trailing bytes past the advertised payload are
/// ignored.
pub fn decode(bytes: &[u8]) -> Result<Packet, CodecError> {
    let &kind = bytes.first().ok_or(CodecError::Empty)?;
    match kind {
        PACKET_INPUT => {
            let frame = Frame::new(read_u32(bytes, 1)? as i32);
            let player = *bytes.get(5).ok_or(CodecError::Truncated {
                needed: 6,
                got: bytes.len(),
            })?;
            let count = *bytes.get(6).ok_or(CodecError::Truncated {
                needed: 7,
                got: bytes.len(),
            })? as usize;
            let mut inputs = SmallVec::new();
            for i in 0..count {
                let at = 7 + i * 8;
                let entry_frame = Frame::new(read_u32(bytes, at)? as i32);
                let action = read_u32(bytes, at + 4)? as i32;
                inputs.push((entry_frame, action));
            }
            Ok(Packet::Input(InputPacket {
                player: PlayerId::new(player as usize),
                frame,
                inputs,
            }))
        }
        PACKET_PING => Ok(Packet::Ping {
            timestamp_ms: read_u64(bytes, 1)?,
        }),
        PACKET_PONG => Ok(Packet::Pong {
            timestamp_ms: read_u64(bytes, 1)?,
        }),
        PACKET_STATE_HASH => {
            let frame = Frame::new(read_u32(bytes, 1)? as i32);
            let slice = bytes.get(5..13).ok_or(CodecError::Truncated {
                needed: 13,
                got: bytes.len(),
            })?;
            let mut hash = [0u8; 8];
            hash.copy_from_slice(slice);
            Ok(Packet::StateHash {
                frame,
                hash: StateHash::from_bytes(hash),
            })
        }
        PACKET_EPISODE_READY => Ok(Packet::EpisodeReady {
            episode: read_u32(bytes, 1)?,
            end_frame: Frame::new(read_u32(bytes, 5)? as i32),
        }),
        other => Err(CodecError::UnknownType(other)),
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn input_roundtrip_with_redundancy() {
        let packet = Packet::Input(InputPacket {
            player: PlayerId::new(1),
            frame: Frame::new(120),
            inputs: SmallVec::from_vec(vec![
                (Frame::new(120), 3),
                (Frame::new(119), -1),
                (Frame::new(118), 0),
            ]),
        });
        let bytes = encode(&packet);
        assert_eq!(bytes[0], PACKET_INPUT);
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn state_hash_packet_is_thirteen_bytes() {
        let packet = Packet::StateHash {
            frame: Frame::new(42),
            hash: StateHash::from_bytes([0xAB; 8]),
        };
        let bytes = encode(&packet);
        assert_eq!(bytes.len(), 13);
        assert_eq!(&bytes[1..5], &42u32.to_be_bytes());
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn ping_pong_roundtrip() {
        for packet in [
            Packet::Ping {
                timestamp_ms: 1_234_567,
            },
            Packet::Pong {
                timestamp_ms: u64::MAX,
            },
        ] {
            assert_eq!(decode(&encode(&packet)).unwrap(), packet);
        }
    }

    #[test]
    fn episode_ready_roundtrip() {
        let packet = Packet::EpisodeReady {
            episode: 2,
            end_frame: Frame::new(450),
        };
        let bytes = encode(&packet);
        assert_eq!(bytes.len(), 9);
        assert_eq!(decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn multi_byte_integers_are_big_endian() {
        let bytes = encode(&Packet::Ping {
            timestamp_ms: 0x0102_0304_0506_0708,
        });
        assert_eq!(&bytes[1..], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn truncated_and_unknown_packets_are_rejected() {
        assert_eq!(decode(&[]), Err(CodecError::Empty));
        assert!(matches!(decode(&[0xFF]), Err(CodecError::UnknownType(0xFF))));
        assert!(matches!(
            decode(&[PACKET_PING, 0, 0]),
            Err(CodecError::Truncated { .. })
        ));
        // Input advertising more redundancy entries than are present.
        let mut bytes = encode(&Packet::Input(InputPacket {
            player: PlayerId::new(0),
            frame: Frame::new(5),
            inputs: SmallVec::from_vec(vec![(Frame::new(5), 1)]),
        }));
        bytes[6] = 4; // claim 4 entries
        assert!(matches!(decode(&bytes), Err(CodecError::Truncated { .. })));
    }

    #[test]
    fn negative_actions_survive_the_wire() {
        let packet = Packet::Input(InputPacket {
            player: PlayerId::new(0),
            frame: Frame::new(0),
            inputs: SmallVec::from_vec(vec![(Frame::new(0), -42)]),
        });
        assert_eq!(decode(&encode(&packet)).unwrap(), packet);
    }
}
