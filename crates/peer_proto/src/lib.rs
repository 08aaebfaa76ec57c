// BitTorrent v1 peer protocol: parsing and serialization of the
// handshake and the framed messages (4-byte big-endian length prefix,
// 1-byte type, payload).

use byteorder::{BE, ByteOrder};
use weir_core::hash_id::Id20;

const INTEGER_LEN: usize = 4;
const MSGID_LEN: usize = 1;
pub const PREAMBLE_LEN: usize = INTEGER_LEN + MSGID_LEN;
pub const PIECE_PREAMBLE_LEN: usize = PREAMBLE_LEN + INTEGER_LEN * 2;

pub const HANDSHAKE_LEN: usize = 68;

/// The largest block length a REQUEST may ask for.
pub const MAX_BLOCK_LEN: u32 = 1 << 15;

const PSTR_BT1: &str = "BitTorrent protocol";

/// The first 20 bytes of every handshake: pstr length byte + pstr.
pub const HANDSHAKE_PSTR_PREFIX: &[u8; 20] = b"\x13BitTorrent protocol";

type MsgId = u8;

pub const MSGID_CHOKE: MsgId = 0;
pub const MSGID_UNCHOKE: MsgId = 1;
pub const MSGID_INTERESTED: MsgId = 2;
pub const MSGID_NOT_INTERESTED: MsgId = 3;
pub const MSGID_HAVE: MsgId = 4;
pub const MSGID_BITFIELD: MsgId = 5;
pub const MSGID_REQUEST: MsgId = 6;
pub const MSGID_PIECE: MsgId = 7;
pub const MSGID_CANCEL: MsgId = 8;

#[derive(Clone, Copy)]
pub struct MsgIdDebug(MsgId);

impl MsgIdDebug {
    const fn name(&self) -> Option<&'static str> {
        let n = match self.0 {
            MSGID_CHOKE => "choke",
            MSGID_UNCHOKE => "unchoke",
            MSGID_INTERESTED => "interested",
            MSGID_NOT_INTERESTED => "not_interested",
            MSGID_HAVE => "have",
            MSGID_BITFIELD => "bitfield",
            MSGID_REQUEST => "request",
            MSGID_PIECE => "piece",
            MSGID_CANCEL => "cancel",
            _ => return None,
        };
        Some(n)
    }
}

impl core::fmt::Debug for MsgIdDebug {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "<unknown msg_id {}>", self.0),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum MessageDeserializeError {
    #[error("not enough data (msgid={1:?}): expected at least {0} more bytes")]
    NotEnoughData(usize, Option<MsgIdDebug>),
    #[error("unsupported message id {0}")]
    UnsupportedMessageId(u8),
    #[error("incorrect message length msg_id={msg_id:?}, expected={expected}, received={received}")]
    IncorrectMsgLen {
        received: u32,
        expected: u32,
        msg_id: MsgIdDebug,
    },
    #[error("pstr doesn't match {PSTR_BT1:?}")]
    HandshakePstrWrongContent,
    #[error("pstr should be 19 bytes long but got {0}")]
    HandshakePstrWrongLength(u8),
}

#[derive(thiserror::Error, Debug)]
pub enum SerializeError {
    #[error("not enough space in buffer")]
    NoSpaceInBuffer,
}

/// Writes the 13 fixed bytes of a PIECE message (length prefix, type,
/// index, begin) for a block of `block_len` bytes. The block itself is
/// transmitted separately.
pub fn serialize_piece_preamble(index: u32, begin: u32, block_len: u32, buf: &mut [u8]) -> usize {
    let len_prefix = MSGID_LEN as u32 + INTEGER_LEN as u32 * 2 + block_len;
    BE::write_u32(&mut buf[0..4], len_prefix);
    buf[4] = MSGID_PIECE;
    BE::write_u32(&mut buf[5..9], index);
    BE::write_u32(&mut buf[9..13], begin);
    PIECE_PREAMBLE_LEN
}

#[derive(PartialEq, Eq)]
pub struct Piece<'a> {
    pub index: u32,
    pub begin: u32,
    pub block: &'a [u8],
}

impl std::fmt::Debug for Piece<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Piece")
            .field("index", &self.index)
            .field("begin", &self.begin)
            .field("len", &self.len())
            .finish()
    }
}

impl<'a> Piece<'a> {
    pub fn from_data(index: u32, begin: u32, block: &'a [u8]) -> Self {
        Piece {
            index,
            begin,
            block,
        }
    }

    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.block.len()
    }

    pub fn serialize_unchecked_len(&self, buf: &mut [u8]) -> usize {
        buf[0..4].copy_from_slice(&self.index.to_be_bytes());
        buf[4..8].copy_from_slice(&self.begin.to_be_bytes());
        buf[8..8 + self.block.len()].copy_from_slice(self.block);
        8 + self.block.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Request {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

impl Request {
    pub fn new(index: u32, begin: u32, length: u32) -> Self {
        Self {
            index,
            begin,
            length,
        }
    }

    pub fn serialize_unchecked_len(&self, buf: &mut [u8]) -> usize {
        buf[0..4].copy_from_slice(&self.index.to_be_bytes());
        buf[4..8].copy_from_slice(&self.begin.to_be_bytes());
        buf[8..12].copy_from_slice(&self.length.to_be_bytes());
        12
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Message<'a> {
    Request(Request),
    Cancel(Request),
    Bitfield(&'a [u8]),
    KeepAlive,
    Have(u32),
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Piece(Piece<'a>),
}

impl Message<'_> {
    pub fn serialize(&self, out: &mut [u8]) -> Result<usize, SerializeError> {
        macro_rules! check_len {
            ($l:expr) => {
                if out.len() < $l {
                    return Err(SerializeError::NoSpaceInBuffer);
                }
            };
        }

        macro_rules! write_preamble {
            ($msg_len:expr, $msg_id:expr) => {
                out[0..4].copy_from_slice(&(($msg_len + 1u32).to_be_bytes()));
                out[4] = $msg_id;
            };
        }

        match self {
            Message::Request(request) | Message::Cancel(request) => {
                const TOTAL_LEN: usize = PREAMBLE_LEN + INTEGER_LEN * 3;
                check_len!(TOTAL_LEN);
                let msg_id = match self {
                    Message::Request(..) => MSGID_REQUEST,
                    _ => MSGID_CANCEL,
                };
                write_preamble!((INTEGER_LEN * 3) as u32, msg_id);
                request.serialize_unchecked_len(&mut out[PREAMBLE_LEN..]);
                Ok(TOTAL_LEN)
            }
            Message::Bitfield(b) => {
                let block_len = b.len();
                let total_len = PREAMBLE_LEN + block_len;
                check_len!(total_len);
                write_preamble!(block_len as u32, MSGID_BITFIELD);
                out[PREAMBLE_LEN..PREAMBLE_LEN + block_len].copy_from_slice(b);
                Ok(total_len)
            }
            Message::Choke | Message::Unchoke | Message::Interested | Message::NotInterested => {
                check_len!(PREAMBLE_LEN);
                let msg_id = match self {
                    Message::Choke => MSGID_CHOKE,
                    Message::Unchoke => MSGID_UNCHOKE,
                    Message::Interested => MSGID_INTERESTED,
                    _ => MSGID_NOT_INTERESTED,
                };
                write_preamble!(0, msg_id);
                Ok(PREAMBLE_LEN)
            }
            Message::Piece(p) => {
                let payload_len = INTEGER_LEN * 2 + p.len();
                let total_len = PREAMBLE_LEN + payload_len;
                check_len!(total_len);
                write_preamble!(payload_len as u32, MSGID_PIECE);
                p.serialize_unchecked_len(&mut out[PREAMBLE_LEN..]);
                Ok(total_len)
            }
            Message::KeepAlive => {
                check_len!(4);
                out[0..4].copy_from_slice(&0u32.to_be_bytes());
                Ok(4)
            }
            Message::Have(v) => {
                check_len!(PREAMBLE_LEN + INTEGER_LEN);
                write_preamble!(INTEGER_LEN as u32, MSGID_HAVE);
                out[5..9].copy_from_slice(&v.to_be_bytes());
                Ok(9)
            }
        }
    }

    /// Deserialize one message from the front of `buf`, returning it and
    /// the number of bytes it occupied. `NotEnoughData` means the frame
    /// is incomplete and the caller should read more.
    pub fn deserialize(buf: &[u8]) -> Result<(Message<'_>, usize), MessageDeserializeError> {
        if buf.len() < INTEGER_LEN {
            return Err(MessageDeserializeError::NotEnoughData(
                INTEGER_LEN - buf.len(),
                None,
            ));
        }
        let len_prefix = BE::read_u32(&buf[0..4]);
        let total_len = len_prefix as usize + INTEGER_LEN;
        if len_prefix == 0 {
            return Ok((Message::KeepAlive, total_len));
        }

        if buf.len() < PREAMBLE_LEN {
            return Err(MessageDeserializeError::NotEnoughData(
                total_len - buf.len(),
                None,
            ));
        }
        let msg_id = buf[4];
        let msg_len = len_prefix as usize - 1;
        let body = &buf[PREAMBLE_LEN..];

        macro_rules! check_msg_len {
            ($expected:expr) => {{
                if msg_len != $expected {
                    return Err(MessageDeserializeError::IncorrectMsgLen {
                        received: len_prefix - 1,
                        expected: $expected as u32,
                        msg_id: MsgIdDebug(msg_id),
                    });
                }
            }};
            (min $expected:expr) => {{
                if msg_len < $expected {
                    return Err(MessageDeserializeError::IncorrectMsgLen {
                        received: len_prefix - 1,
                        expected: $expected as u32,
                        msg_id: MsgIdDebug(msg_id),
                    });
                }
            }};
        }

        macro_rules! check_data_len {
            () => {{
                if body.len() < msg_len {
                    return Err(MessageDeserializeError::NotEnoughData(
                        msg_len - body.len(),
                        Some(MsgIdDebug(msg_id)),
                    ));
                }
            }};
        }

        match msg_id {
            MSGID_CHOKE => {
                check_msg_len!(0);
                Ok((Message::Choke, total_len))
            }
            MSGID_UNCHOKE => {
                check_msg_len!(0);
                Ok((Message::Unchoke, total_len))
            }
            MSGID_INTERESTED => {
                check_msg_len!(0);
                Ok((Message::Interested, total_len))
            }
            MSGID_NOT_INTERESTED => {
                check_msg_len!(0);
                Ok((Message::NotInterested, total_len))
            }
            MSGID_HAVE => {
                check_msg_len!(4);
                check_data_len!();
                Ok((Message::Have(BE::read_u32(&body[0..4])), total_len))
            }
            MSGID_BITFIELD => {
                check_msg_len!(min 1);
                check_data_len!();
                Ok((Message::Bitfield(&body[..msg_len]), total_len))
            }
            MSGID_REQUEST | MSGID_CANCEL => {
                check_msg_len!(12);
                check_data_len!();
                let request = Request {
                    index: BE::read_u32(&body[0..4]),
                    begin: BE::read_u32(&body[4..8]),
                    length: BE::read_u32(&body[8..12]),
                };
                let msg = if msg_id == MSGID_REQUEST {
                    Message::Request(request)
                } else {
                    Message::Cancel(request)
                };
                Ok((msg, total_len))
            }
            MSGID_PIECE => {
                // index + begin + at least one block byte
                check_msg_len!(min 9);
                check_data_len!();
                Ok((
                    Message::Piece(Piece {
                        index: BE::read_u32(&body[0..4]),
                        begin: BE::read_u32(&body[4..8]),
                        block: &body[8..msg_len],
                    }),
                    total_len,
                ))
            }
            msg_id => Err(MessageDeserializeError::UnsupportedMessageId(msg_id)),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: u64,
    pub info_hash: Id20,
    pub peer_id: Id20,
}

impl Handshake {
    pub fn new(info_hash: Id20, peer_id: Id20) -> Handshake {
        debug_assert_eq!(PSTR_BT1.len(), 19);
        Handshake {
            // No extensions supported; peers may set any bits here and
            // we accept them verbatim.
            reserved: 0,
            info_hash,
            peer_id,
        }
    }

    pub fn deserialize(b: &[u8]) -> Result<(Handshake, usize), MessageDeserializeError> {
        if b.len() < HANDSHAKE_LEN {
            return Err(MessageDeserializeError::NotEnoughData(
                HANDSHAKE_LEN - b.len(),
                None,
            ));
        }
        if b[0] as usize != PSTR_BT1.len() {
            return Err(MessageDeserializeError::HandshakePstrWrongLength(b[0]));
        }
        if &b[1..20] != PSTR_BT1.as_bytes() {
            return Err(MessageDeserializeError::HandshakePstrWrongContent);
        }

        let h = Handshake {
            reserved: BE::read_u64(&b[20..28]),
            info_hash: Id20::new(b[28..48].try_into().unwrap()),
            peer_id: Id20::new(b[48..68].try_into().unwrap()),
        };
        Ok((h, HANDSHAKE_LEN))
    }

    #[must_use]
    pub fn serialize_unchecked_len(&self, buf: &mut [u8]) -> usize {
        buf[0..20].copy_from_slice(HANDSHAKE_PSTR_PREFIX);
        buf[20..28].copy_from_slice(&self.reserved.to_be_bytes());
        buf[28..48].copy_from_slice(&self.info_hash.0);
        buf[48..68].copy_from_slice(&self.peer_id.0);
        HANDSHAKE_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handshake_serialize() {
        let info_hash = Id20::new([
            1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20,
        ]);
        let peer_id = Id20::new([
            20u8, 19, 18, 17, 16, 15, 14, 13, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1,
        ]);
        let mut buf = [0u8; 100];
        let se = Handshake::new(info_hash, peer_id);
        let len = se.serialize_unchecked_len(&mut buf);
        assert_eq!(len, 20 + 20 + 8 + 19 + 1);
        assert_eq!(buf[0], 19);
        assert_eq!(&buf[1..20], PSTR_BT1.as_bytes());
        assert_eq!(&buf[20..28], &[0u8; 8]);
        assert_eq!(&buf[28..48], &info_hash.0);
        assert_eq!(&buf[48..68], &peer_id.0);

        let (de, dlen) = Handshake::deserialize(&buf).unwrap();
        assert_eq!(dlen, len);
        assert_eq!(se, de);
    }

    #[test]
    fn test_handshake_any_reserved_accepted() {
        let mut buf = [0u8; HANDSHAKE_LEN];
        Handshake::new(Id20::default(), Id20::default()).serialize_unchecked_len(&mut buf);
        buf[20..28].copy_from_slice(&[0xff; 8]);
        let (h, _) = Handshake::deserialize(&buf).unwrap();
        assert_eq!(h.reserved, u64::MAX);
    }

    #[test]
    fn test_handshake_bad_pstr() {
        let mut buf = [0u8; HANDSHAKE_LEN];
        Handshake::new(Id20::default(), Id20::default()).serialize_unchecked_len(&mut buf);
        buf[1] = b'b';
        assert!(matches!(
            Handshake::deserialize(&buf),
            Err(MessageDeserializeError::HandshakePstrWrongContent)
        ));
        buf[0] = 18;
        assert!(matches!(
            Handshake::deserialize(&buf),
            Err(MessageDeserializeError::HandshakePstrWrongLength(18))
        ));
    }

    #[track_caller]
    fn assert_round_trip(bytes: &[u8], expected_len: usize) {
        // Every proper prefix must ask for more data, the full buffer
        // must decode to something that re-serializes identically.
        for split_point in 0..bytes.len() {
            let res = Message::deserialize(&bytes[..split_point]);
            if split_point < expected_len {
                assert!(
                    matches!(res, Err(MessageDeserializeError::NotEnoughData(..))),
                    "split_point={split_point}: expected NotEnoughData, got {res:?}"
                );
            } else {
                let (_, len) = res.unwrap();
                assert_eq!(len, expected_len);
            }
        }
        let (msg, len) = Message::deserialize(bytes).unwrap();
        assert_eq!(len, expected_len);
        let mut tmp = vec![0u8; bytes.len() + 10];
        let slen = msg.serialize(&mut tmp).unwrap();
        assert_eq!(slen, len);
        assert_eq!(&bytes[..len], &tmp[..len]);
    }

    #[test]
    fn test_deserialize_piece() {
        const LEN: usize = 100;
        let mut buf = [0u8; LEN + 30];
        #[allow(clippy::needless_range_loop)]
        for id in 0..buf.len() {
            buf[id] = id as u8;
        }

        let block_len = LEN - PIECE_PREAMBLE_LEN;
        serialize_piece_preamble(42, 43, block_len as u32, &mut buf);

        assert_round_trip(&buf[..LEN], LEN);

        let (msg, _) = Message::deserialize(&buf).unwrap();
        let piece = match &msg {
            Message::Piece(piece) => piece,
            other => panic!("expected piece got {other:?}"),
        };
        assert_eq!(piece.index, 42);
        assert_eq!(piece.begin, 43);
        assert_eq!(piece.block, &buf[13..LEN]);
    }

    #[test]
    fn test_deserialize_request_and_cancel() {
        for msgid in [MSGID_REQUEST, MSGID_CANCEL] {
            let mut buf = [0u8; 17];
            buf[0..4].copy_from_slice(&13u32.to_be_bytes());
            buf[4] = msgid;
            buf[5..9].copy_from_slice(&42u32.to_be_bytes());
            buf[9..13].copy_from_slice(&43u32.to_be_bytes());
            buf[13..17].copy_from_slice(&44u32.to_be_bytes());

            assert_round_trip(&buf, 17);

            let (msg, _) = Message::deserialize(&buf).unwrap();
            let req = Request::new(42, 43, 44);
            match (msgid, msg) {
                (MSGID_REQUEST, Message::Request(r)) | (MSGID_CANCEL, Message::Cancel(r)) => {
                    assert_eq!(r, req)
                }
                (msgid, msg) => panic!("msgid={msgid}, msg={msg:?}"),
            }
        }
    }

    #[test]
    fn test_keepalive() {
        let buf = [0u8; 4];
        assert_round_trip(&buf, 4);
        assert!(matches!(
            Message::deserialize(&buf).unwrap().0,
            Message::KeepAlive
        ));
    }

    #[test]
    fn test_have() {
        let mut buf = [0u8; 9];
        buf[0..4].copy_from_slice(&5u32.to_be_bytes());
        buf[4] = MSGID_HAVE;
        buf[5..9].copy_from_slice(&42u32.to_be_bytes());
        assert_round_trip(&buf, 9);
        assert!(matches!(
            Message::deserialize(&buf).unwrap().0,
            Message::Have(42)
        ));
    }

    #[test]
    fn test_bitfield() {
        let mut buf = [0u8; 47];
        buf[0..4].copy_from_slice(&43u32.to_be_bytes());
        buf[4] = MSGID_BITFIELD;
        for byte in buf[5..47].iter_mut() {
            *byte = 0b10101010;
        }
        assert_round_trip(&buf, 47);
        match Message::deserialize(&buf).unwrap().0 {
            Message::Bitfield(bf) => {
                assert_eq!(bf.len(), 42);
                assert!(bf.iter().all(|b| *b == 0b10101010));
            }
            other => panic!("expected bitfield, got {other:?}"),
        }
    }

    #[test]
    fn test_no_data_messages() {
        let mut buf = [0u8; 5];
        for msgid in [
            MSGID_CHOKE,
            MSGID_UNCHOKE,
            MSGID_INTERESTED,
            MSGID_NOT_INTERESTED,
        ] {
            buf[0..4].copy_from_slice(&1u32.to_be_bytes());
            buf[4] = msgid;
            assert_round_trip(&buf, 5);
            let (msg, len) = Message::deserialize(&buf).unwrap();
            assert_eq!(len, 5);
            match (msgid, &msg) {
                (MSGID_CHOKE, Message::Choke)
                | (MSGID_UNCHOKE, Message::Unchoke)
                | (MSGID_INTERESTED, Message::Interested)
                | (MSGID_NOT_INTERESTED, Message::NotInterested) => {}
                (msgid, msg) => panic!("msgid={msgid}, msg={msg:?}"),
            }
        }
    }

    #[test]
    fn test_unknown_msg_id() {
        let mut buf = [0u8; 5];
        buf[0..4].copy_from_slice(&1u32.to_be_bytes());
        buf[4] = 9;
        assert!(matches!(
            Message::deserialize(&buf),
            Err(MessageDeserializeError::UnsupportedMessageId(9))
        ));
    }

    #[test]
    fn test_incorrect_msg_len() {
        // HAVE with a length prefix of 6 instead of 5.
        let mut buf = [0u8; 10];
        buf[0..4].copy_from_slice(&6u32.to_be_bytes());
        buf[4] = MSGID_HAVE;
        assert!(matches!(
            Message::deserialize(&buf),
            Err(MessageDeserializeError::IncorrectMsgLen { .. })
        ));

        // PIECE with no block bytes at all.
        let mut buf = [0u8; 13];
        buf[0..4].copy_from_slice(&9u32.to_be_bytes());
        buf[4] = MSGID_PIECE;
        assert!(matches!(
            Message::deserialize(&buf),
            Err(MessageDeserializeError::IncorrectMsgLen { .. })
        ));
    }
}
