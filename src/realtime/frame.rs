//! RFC 6455 frame codec.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

/// Largest payload a control frame may carry.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Continuation),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
        }
    }

    /// `Close`, `Ping` and `Pong`.
    pub fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// Close status code carried in a close frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCode {
    /// 1000
    Normal,
    /// 1001
    GoingAway,
    /// 1002
    ProtocolError,
    /// 1003
    Unsupported,
    /// 1005, reported when a close frame carried no code. Never sent.
    NoStatus,
    /// 1006, reported when the peer vanished without a close frame. Never sent.
    Abnormal,
    /// 1007
    InvalidPayload,
    /// 1008
    PolicyViolation,
    /// 1009
    TooBig,
    /// 1011
    Internal,
    Other(u16),
}

impl From<u16> for CloseCode {
    fn from(code: u16) -> Self {
        match code {
            1000 => Self::Normal,
            1001 => Self::GoingAway,
            1002 => Self::ProtocolError,
            1003 => Self::Unsupported,
            1005 => Self::NoStatus,
            1006 => Self::Abnormal,
            1007 => Self::InvalidPayload,
            1008 => Self::PolicyViolation,
            1009 => Self::TooBig,
            1011 => Self::Internal,
            other => Self::Other(other),
        }
    }
}

impl From<CloseCode> for u16 {
    fn from(code: CloseCode) -> u16 {
        match code {
            CloseCode::Normal => 1000,
            CloseCode::GoingAway => 1001,
            CloseCode::ProtocolError => 1002,
            CloseCode::Unsupported => 1003,
            CloseCode::NoStatus => 1005,
            CloseCode::Abnormal => 1006,
            CloseCode::InvalidPayload => 1007,
            CloseCode::PolicyViolation => 1008,
            CloseCode::TooBig => 1009,
            CloseCode::Internal => 1011,
            CloseCode::Other(code) => code,
        }
    }
}

impl fmt::Display for CloseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", u16::from(*self))
    }
}

/// Framing violations in client input.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("client frame is not masked")]
    Unmasked,

    #[error("reserved bits set without a negotiated extension")]
    ReservedBits,

    #[error("reserved opcode {0:#x}")]
    ReservedOpcode(u8),

    #[error("fragmented control frame")]
    FragmentedControl,

    #[error("control frame payload of {0} bytes exceeds 125")]
    ControlTooLong(u64),

    #[error("frame payload of {len} bytes exceeds the {max} byte limit")]
    TooBig { len: u64, max: usize },

    #[error("close frame payload of one byte")]
    BadClosePayload,
}

impl FrameError {
    /// The close code the server answers this violation with.
    pub fn close_code(&self) -> CloseCode {
        match self {
            Self::TooBig { .. } => CloseCode::TooBig,
            _ => CloseCode::ProtocolError,
        }
    }
}

/// One decoded (and unmasked) frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub payload: Bytes,
}

/// Decodes one client frame from the start of `buf`.
///
/// Returns `Ok(None)` until the whole frame is buffered. The header is
/// validated as soon as it is complete, so a bad or oversized frame fails
/// without waiting for its payload.
pub fn decode(buf: &[u8], max_payload: usize) -> Result<Option<(Frame, usize)>, FrameError> {
    if buf.len() < 2 {
        return Ok(None);
    }
    let (b0, b1) = (buf[0], buf[1]);
    let fin = b0 & 0x80 != 0;
    if b0 & 0x70 != 0 {
        return Err(FrameError::ReservedBits);
    }
    let opcode = OpCode::from_u8(b0 & 0x0F).ok_or(FrameError::ReservedOpcode(b0 & 0x0F))?;
    if b1 & 0x80 == 0 {
        return Err(FrameError::Unmasked);
    }

    let (len, mut pos) = match b1 & 0x7F {
        126 => {
            let Some(ext) = buf.get(2..4) else {
                return Ok(None);
            };
            (u64::from(u16::from_be_bytes([ext[0], ext[1]])), 4)
        }
        127 => {
            let Some(ext) = buf.get(2..10) else {
                return Ok(None);
            };
            let mut raw = [0u8; 8];
            raw.copy_from_slice(ext);
            (u64::from_be_bytes(raw), 10)
        }
        short => (u64::from(short), 2),
    };

    if opcode.is_control() {
        if !fin {
            return Err(FrameError::FragmentedControl);
        }
        if len > MAX_CONTROL_PAYLOAD as u64 {
            return Err(FrameError::ControlTooLong(len));
        }
    }
    let len = usize::try_from(len)
        .ok()
        .filter(|&len| len <= max_payload)
        .ok_or(FrameError::TooBig {
            len,
            max: max_payload,
        })?;

    let Some(key) = buf.get(pos..pos + 4) else {
        return Ok(None);
    };
    let key = [key[0], key[1], key[2], key[3]];
    pos += 4;

    let Some(masked) = buf.get(pos..pos + len) else {
        return Ok(None);
    };
    let mut payload = BytesMut::from(masked);
    apply_mask(&mut payload, key);

    Ok(Some((
        Frame {
            fin,
            opcode,
            payload: payload.freeze(),
        },
        pos + len,
    )))
}

/// Encodes a server frame. Server frames are never masked.
pub fn encode(opcode: OpCode, payload: &[u8], fin: bool) -> BytesMut {
    let mut buf = BytesMut::with_capacity(payload.len() + 10);
    put_header(&mut buf, opcode, payload.len(), fin, false);
    buf.put_slice(payload);
    buf
}

/// Encodes a masked frame the way a client sends it.
pub fn encode_masked(opcode: OpCode, payload: &[u8], fin: bool, key: [u8; 4]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(payload.len() + 14);
    put_header(&mut buf, opcode, payload.len(), fin, true);
    buf.put_slice(&key);
    let start = buf.len();
    buf.put_slice(payload);
    apply_mask(&mut buf[start..], key);
    buf
}

fn put_header(buf: &mut BytesMut, opcode: OpCode, len: usize, fin: bool, masked: bool) {
    buf.put_u8(opcode.as_u8() | if fin { 0x80 } else { 0 });
    let mask_bit = if masked { 0x80 } else { 0 };
    if len < 126 {
        buf.put_u8(mask_bit | len as u8);
    } else if let Ok(len) = u16::try_from(len) {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(len);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(len as u64);
    }
}

fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Builds a close frame payload: the code in network order, then the reason.
pub fn close_payload(code: CloseCode, reason: &str) -> BytesMut {
    let mut buf = BytesMut::with_capacity(2 + reason.len());
    buf.put_u16(code.into());
    buf.put_slice(reason.as_bytes());
    buf
}

/// Splits a received close payload into code and reason. An empty payload
/// reports [`CloseCode::NoStatus`].
pub fn parse_close_payload(payload: &[u8]) -> Result<(CloseCode, String), FrameError> {
    match payload {
        [] => Ok((CloseCode::NoStatus, String::new())),
        [_] => Err(FrameError::BadClosePayload),
        [hi, lo, reason @ ..] => Ok((
            CloseCode::from(u16::from_be_bytes([*hi, *lo])),
            String::from_utf8_lossy(reason).into_owned(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    #[test]
    fn server_text_frame_decodes_as_client_would_send_it() {
        let server = encode(OpCode::Text, b"hello", true);
        assert_eq!(&server[..2], &[0x81, 0x05]);
        assert_eq!(&server[2..], b"hello");

        let client = encode_masked(OpCode::Text, &server[2..], true, KEY);
        let (frame, used) = decode(&client, 1024).unwrap().unwrap();
        assert_eq!(used, client.len());
        assert!(frame.fin);
        assert_eq!(frame.opcode, OpCode::Text);
        assert_eq!(frame.payload.as_ref(), b"hello");
    }

    #[test]
    fn rfc_masked_hello_sample() {
        let raw = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let (frame, used) = decode(&raw, 1024).unwrap().unwrap();
        assert_eq!(used, raw.len());
        assert_eq!(frame.payload.as_ref(), b"Hello");
    }

    #[test]
    fn length_tiers() {
        let medium = encode(OpCode::Binary, &[0u8; 300], true);
        assert_eq!(medium[1], 126);
        assert_eq!(u16::from_be_bytes([medium[2], medium[3]]), 300);
        assert_eq!(medium.len(), 4 + 300);

        let large = encode(OpCode::Binary, &vec![0u8; 70_000], false);
        assert_eq!(large[0], 0x02);
        assert_eq!(large[1], 127);
        assert_eq!(large.len(), 10 + 70_000);

        let client = encode_masked(OpCode::Binary, &vec![7u8; 70_000], true, KEY);
        let (frame, _) = decode(&client, 100_000).unwrap().unwrap();
        assert_eq!(frame.payload.len(), 70_000);
        assert!(frame.payload.iter().all(|&b| b == 7));
    }

    #[test]
    fn incomplete_frames_wait() {
        let client = encode_masked(OpCode::Text, &[b'x'; 200], true, KEY);
        for cut in [0, 1, 3, 5, 7, client.len() - 1] {
            assert_eq!(decode(&client[..cut], 1024), Ok(None), "cut at {cut}");
        }
    }

    #[test]
    fn unmasked_client_frame_is_rejected() {
        let server = encode(OpCode::Text, b"hi", true);
        assert_eq!(decode(&server, 1024), Err(FrameError::Unmasked));
        assert_eq!(FrameError::Unmasked.close_code(), CloseCode::ProtocolError);
    }

    #[test]
    fn control_frame_rules() {
        let fragmented = encode_masked(OpCode::Ping, b"", false, KEY);
        assert_eq!(decode(&fragmented, 1024), Err(FrameError::FragmentedControl));

        let long = encode_masked(OpCode::Ping, &[0u8; 126], true, KEY);
        assert_eq!(decode(&long, 1024), Err(FrameError::ControlTooLong(126)));
    }

    #[test]
    fn reserved_opcode_and_bits() {
        assert_eq!(decode(&[0x83, 0x80], 16), Err(FrameError::ReservedOpcode(3)));
        assert_eq!(decode(&[0xC1, 0x80], 16), Err(FrameError::ReservedBits));
    }

    #[test]
    fn oversized_header_fails_before_payload_arrives() {
        let mut header = vec![0x82, 0xFF];
        header.extend_from_slice(&(1u64 << 40).to_be_bytes());
        let err = decode(&header, 1024).unwrap_err();
        assert!(matches!(err, FrameError::TooBig { .. }));
        assert_eq!(err.close_code(), CloseCode::TooBig);
    }

    #[test]
    fn close_payload_round_trip() {
        let payload = close_payload(CloseCode::Normal, "ping timeout");
        assert_eq!(&payload[..2], &[0x03, 0xE8]);
        assert_eq!(
            parse_close_payload(&payload).unwrap(),
            (CloseCode::Normal, "ping timeout".to_owned())
        );
        assert_eq!(
            parse_close_payload(&[]).unwrap(),
            (CloseCode::NoStatus, String::new())
        );
        assert!(parse_close_payload(&[3]).is_err());
        assert_eq!(CloseCode::from(4000), CloseCode::Other(4000));
    }
}
