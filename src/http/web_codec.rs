//! RFC 6455 frame decoding and encoding.
//!
//! [`WebCodec`] is a pull-based decoder: feed raw bytes with
//! [`parse_frame`](WebCodec::parse_frame), then drain complete messages
//! with [`get_frame`](WebCodec::get_frame). Fragmented data messages are
//! reassembled; control frames may arrive between their fragments and are
//! queued as soon as they complete.

use crate::{errors::ErrorKind, limits::WebSocketLimits};
use base64::{engine::general_purpose::STANDARD, Engine};
use sha1::{Digest, Sha1};
use std::collections::VecDeque;

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `Sec-WebSocket-Accept` for a handshake key.
///
/// # Examples
/// ```
/// use maker_net::http::web_codec::accept_key;
///
/// assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(GUID);
    STANDARD.encode(hasher.finalize())
}

/// A fresh random `Sec-WebSocket-Key` for client handshakes.
pub fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    fastrand::fill(&mut nonce);
    STANDARD.encode(nonce)
}

/// Frame opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continue = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Self::Continue),
            0x1 => Some(Self::Text),
            0x2 => Some(Self::Binary),
            0x8 => Some(Self::Close),
            0x9 => Some(Self::Ping),
            0xA => Some(Self::Pong),
            _ => None,
        }
    }

    #[inline]
    pub const fn is_control(self) -> bool {
        matches!(self, Self::Close | Self::Ping | Self::Pong)
    }
}

/// Which side of the connection decodes: servers require masked input,
/// clients reject it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Begin,
    Length,
    ShortLength,
    LongLength,
    Mask,
    Payload,
}

/// Incremental frame decoder with a queue of completed messages.
#[derive(Debug)]
pub struct WebCodec {
    role: Role,
    state: State,

    fin: bool,
    opcode: Opcode,
    masked: bool,
    mask: [u8; 4],
    /// Bytes read of the extended length or the mask.
    read: usize,
    length: u64,
    payload: Vec<u8>,

    /// Opened data message waiting for its final fragment.
    fragment: Option<(Opcode, Vec<u8>)>,
    queue: VecDeque<(Opcode, Vec<u8>)>,

    max_frame_size: u64,
    max_message_size: usize,
}

impl WebCodec {
    pub fn new(limits: &WebSocketLimits, role: Role) -> Self {
        Self {
            role,
            state: State::Begin,
            fin: false,
            opcode: Opcode::Continue,
            masked: false,
            mask: [0; 4],
            read: 0,
            length: 0,
            payload: Vec::new(),
            fragment: None,
            queue: VecDeque::new(),
            max_frame_size: limits.max_frame_size,
            max_message_size: limits.max_message_size,
        }
    }

    /// Consumes `data`, queueing every message it completes.
    ///
    /// Any protocol violation is fatal: the peer must be sent a close
    /// frame and the connection dropped.
    pub fn parse_frame(&mut self, data: &[u8]) -> Result<(), ErrorKind> {
        let mut index = 0;

        while index < data.len() {
            match self.state {
                State::Begin => {
                    let byte = data[index];
                    index += 1;

                    if byte & 0x70 != 0 {
                        return Err(ErrorKind::WebSocket("reserved bits are set"));
                    }
                    self.fin = byte & 0x80 != 0;
                    self.opcode = Opcode::from_u8(byte & 0x0f)
                        .ok_or(ErrorKind::WebSocket("unknown opcode"))?;

                    if self.opcode.is_control() && !self.fin {
                        return Err(ErrorKind::WebSocket("fragmented control frame"));
                    }
                    self.state = State::Length;
                }
                State::Length => {
                    let byte = data[index];
                    index += 1;

                    self.masked = byte & 0x80 != 0;
                    if self.masked != (self.role == Role::Server) {
                        return Err(ErrorKind::WebSocket("invalid frame masking"));
                    }

                    let length = byte & 0x7f;
                    if self.opcode.is_control() && length > 125 {
                        return Err(ErrorKind::WebSocket("control frame too long"));
                    }

                    self.read = 0;
                    self.length = 0;
                    match length {
                        126 => self.state = State::ShortLength,
                        127 => self.state = State::LongLength,
                        length => {
                            self.length = length as u64;
                            self.after_length()?;
                        }
                    }
                }
                State::ShortLength | State::LongLength => {
                    self.length = self.length << 8 | data[index] as u64;
                    self.read += 1;
                    index += 1;

                    let needed = match self.state {
                        State::ShortLength => 2,
                        _ => 8,
                    };
                    if self.read == needed {
                        if self.length >> 63 != 0 {
                            return Err(ErrorKind::WebSocket("invalid frame length"));
                        }
                        self.after_length()?;
                    }
                }
                State::Mask => {
                    self.mask[self.read] = data[index];
                    self.read += 1;
                    index += 1;

                    if self.read == 4 {
                        self.begin_payload()?;
                    }
                }
                State::Payload => {
                    let remaining = (self.length - self.payload.len() as u64) as usize;
                    let take = remaining.min(data.len() - index);

                    let start = self.payload.len();
                    self.payload.extend_from_slice(&data[index..index + take]);
                    index += take;

                    if self.masked {
                        for (position, byte) in self.payload[start..].iter_mut().enumerate() {
                            *byte ^= self.mask[(start + position) & 3];
                        }
                    }

                    if self.payload.len() as u64 == self.length {
                        self.finish_frame()?;
                    }
                }
            }
        }

        Ok(())
    }

    /// Pops the oldest complete message.
    #[inline]
    pub fn get_frame(&mut self) -> Option<(Opcode, Vec<u8>)> {
        self.queue.pop_front()
    }

    /// Encodes one final frame into `out`. Client frames carry a mask.
    pub fn encode(opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>, out: &mut Vec<u8>) {
        out.push(0x80 | opcode as u8);

        let mask_bit = if mask.is_some() { 0x80 } else { 0 };
        match payload.len() {
            len @ 0..=125 => out.push(mask_bit | len as u8),
            len @ 126..=0xffff => {
                out.push(mask_bit | 126);
                out.extend_from_slice(&(len as u16).to_be_bytes());
            }
            len => {
                out.push(mask_bit | 127);
                out.extend_from_slice(&(len as u64).to_be_bytes());
            }
        }

        match mask {
            Some(mask) => {
                out.extend_from_slice(&mask);
                out.extend(
                    payload
                        .iter()
                        .enumerate()
                        .map(|(position, byte)| byte ^ mask[position & 3]),
                );
            }
            None => out.extend_from_slice(payload),
        }
    }

    /// Close frame payload: big-endian status code, then the reason
    /// truncated to fit a control frame.
    pub fn close_payload(code: u16, reason: &str) -> Vec<u8> {
        let mut end = reason.len().min(123);
        while !reason.is_char_boundary(end) {
            end -= 1;
        }

        let mut payload = Vec::with_capacity(2 + end);
        payload.extend_from_slice(&code.to_be_bytes());
        payload.extend_from_slice(&reason.as_bytes()[..end]);
        payload
    }

    fn after_length(&mut self) -> Result<(), ErrorKind> {
        if self.length > self.max_frame_size {
            return Err(ErrorKind::MessageTooLarge);
        }

        self.read = 0;
        match self.masked {
            true => {
                self.state = State::Mask;
                Ok(())
            }
            false => self.begin_payload(),
        }
    }

    fn begin_payload(&mut self) -> Result<(), ErrorKind> {
        self.payload = Vec::with_capacity(self.length.min(64 * 1024) as usize);
        match self.length {
            0 => self.finish_frame(),
            _ => {
                self.state = State::Payload;
                Ok(())
            }
        }
    }

    fn finish_frame(&mut self) -> Result<(), ErrorKind> {
        let payload = std::mem::take(&mut self.payload);
        self.state = State::Begin;

        match self.opcode {
            Opcode::Close if payload.len() == 1 => Err(ErrorKind::WebSocket("invalid close payload")),
            opcode if opcode.is_control() => {
                self.queue.push_back((opcode, payload));
                Ok(())
            }
            Opcode::Continue => {
                let Some((_, message)) = self.fragment.as_mut() else {
                    return Err(ErrorKind::WebSocket("unexpected continuation frame"));
                };
                if message.len() + payload.len() > self.max_message_size {
                    return Err(ErrorKind::MessageTooLarge);
                }
                message.extend_from_slice(&payload);

                match (self.fin, self.fragment.take()) {
                    (true, Some((opcode, message))) => self.finish_message(opcode, message),
                    (_, fragment) => {
                        self.fragment = fragment;
                        Ok(())
                    }
                }
            }
            opcode => {
                if self.fragment.is_some() {
                    return Err(ErrorKind::WebSocket("data frame inside a fragmented message"));
                }
                if payload.len() > self.max_message_size {
                    return Err(ErrorKind::MessageTooLarge);
                }

                match self.fin {
                    true => self.finish_message(opcode, payload),
                    false => {
                        self.fragment = Some((opcode, payload));
                        Ok(())
                    }
                }
            }
        }
    }

    fn finish_message(&mut self, opcode: Opcode, message: Vec<u8>) -> Result<(), ErrorKind> {
        if opcode == Opcode::Text && simdutf8::basic::from_utf8(&message).is_err() {
            return Err(ErrorKind::WebSocket("text message is not UTF-8"));
        }

        tracing::trace!(?opcode, length = message.len(), "websocket message decoded");
        self.queue.push_back((opcode, message));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> WebCodec {
        WebCodec::new(&WebSocketLimits::default(), Role::Server)
    }

    fn client() -> WebCodec {
        WebCodec::new(&WebSocketLimits::default(), Role::Client)
    }

    fn drain(codec: &mut WebCodec) -> Vec<(Opcode, Vec<u8>)> {
        std::iter::from_fn(|| codec.get_frame()).collect()
    }

    #[test]
    fn rfc_samples() {
        #[rustfmt::skip]
        let cases: [(Role, &[u8], Vec<(Opcode, Vec<u8>)>); 5] = [
            (Role::Client, b"\x81\x05Hello",                                    vec![(Opcode::Text, b"Hello".to_vec())]),
            (Role::Server, b"\x81\x85\x37\xfa\x21\x3d\x7f\x9f\x4d\x51\x58",     vec![(Opcode::Text, b"Hello".to_vec())]),
            (Role::Client, b"\x01\x03Hel\x80\x02lo",                            vec![(Opcode::Text, b"Hello".to_vec())]),
            (Role::Client, b"\x89\x05Hello",                                    vec![(Opcode::Ping, b"Hello".to_vec())]),
            (Role::Client, b"\x01\x03Hel\x89\x00\x80\x02lo",                    vec![(Opcode::Ping, vec![]), (Opcode::Text, b"Hello".to_vec())]),
        ];

        for (role, src, expected) in cases {
            let mut codec = WebCodec::new(&WebSocketLimits::default(), role);
            codec.parse_frame(src).unwrap();
            assert_eq!(drain(&mut codec), expected, "{src:?}");
        }
    }

    #[test]
    fn extended_lengths() {
        for len in [126usize, 256, 65535, 65536, 70000] {
            let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let mut encoded = Vec::new();
            WebCodec::encode(Opcode::Binary, &payload, None, &mut encoded);

            let mut codec = client();
            codec.parse_frame(&encoded).unwrap();
            assert_eq!(drain(&mut codec), vec![(Opcode::Binary, payload)]);
        }
    }

    #[test]
    fn masked_split_everywhere() {
        let mut encoded = Vec::new();
        WebCodec::encode(Opcode::Text, "héllo wörld".as_bytes(), Some([1, 2, 3, 4]), &mut encoded);
        WebCodec::encode(Opcode::Pong, b"", Some([9, 9, 9, 9]), &mut encoded);

        for split in 1..encoded.len() {
            let mut codec = server();
            codec.parse_frame(&encoded[..split]).unwrap();
            codec.parse_frame(&encoded[split..]).unwrap();

            assert_eq!(
                drain(&mut codec),
                vec![
                    (Opcode::Text, "héllo wörld".as_bytes().to_vec()),
                    (Opcode::Pong, vec![])
                ],
                "split at {split}"
            );
        }
    }

    #[test]
    fn fragmented_across_frames() {
        let mut encoded = Vec::new();
        for (first, part) in [(true, "one "), (false, "two "), (false, "three")] {
            let opcode = match first {
                true => Opcode::Text,
                false => Opcode::Continue,
            };
            WebCodec::encode(opcode, part.as_bytes(), Some([7, 0, 7, 0]), &mut encoded);
        }
        // Clear FIN on the first two frames.
        let second = 2 + 4 + 4;
        encoded[0] &= 0x7f;
        encoded[second] &= 0x7f;

        let mut codec = server();
        codec.parse_frame(&encoded).unwrap();
        assert_eq!(drain(&mut codec), vec![(Opcode::Text, b"one two three".to_vec())]);
    }

    #[test]
    fn violations() {
        let mut long_ping = b"\x89\x7e\x00\x7e".to_vec();
        long_ping.extend_from_slice(&[0; 126]);

        #[rustfmt::skip]
        let cases: [(Role, &[u8], ErrorKind); 9] = [
            (Role::Client, &long_ping,                  ErrorKind::WebSocket("control frame too long")),
            (Role::Client, b"\xc1\x00",                 ErrorKind::WebSocket("reserved bits are set")),
            (Role::Client, b"\x83\x00",                 ErrorKind::WebSocket("unknown opcode")),
            (Role::Client, b"\x80\x00",                 ErrorKind::WebSocket("unexpected continuation frame")),
            (Role::Client, b"\x09\x00",                 ErrorKind::WebSocket("fragmented control frame")),
            (Role::Server, b"\x81\x00",                 ErrorKind::WebSocket("invalid frame masking")),
            (Role::Client, b"\x01\x01a\x81\x01b",       ErrorKind::WebSocket("data frame inside a fragmented message")),
            (Role::Client, b"\x81\x02\xc3\x28",         ErrorKind::WebSocket("text message is not UTF-8")),
            (Role::Client, b"\x88\x01\x03",             ErrorKind::WebSocket("invalid close payload")),
        ];

        for (role, src, expected) in cases {
            let mut codec = WebCodec::new(&WebSocketLimits::default(), role);
            assert_eq!(codec.parse_frame(src), Err(expected), "{src:?}");
        }
    }

    #[test]
    fn size_limits() {
        let limits = WebSocketLimits {
            max_frame_size: 4,
            max_message_size: 6,
            ..WebSocketLimits::default()
        };

        let mut codec = WebCodec::new(&limits, Role::Client);
        assert_eq!(codec.parse_frame(b"\x82\x05"), Err(ErrorKind::MessageTooLarge));

        let mut codec = WebCodec::new(&limits, Role::Client);
        assert_eq!(
            codec.parse_frame(b"\x02\x04abcd\x80\x04efgh"),
            Err(ErrorKind::MessageTooLarge)
        );
    }

    #[test]
    fn handshake_keys() {
        assert_eq!(accept_key("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(STANDARD.decode(generate_key()).map(|key| key.len()), Ok(16));
        assert_eq!(WebCodec::close_payload(1000, "bye"), b"\x03\xe8bye");
        assert_eq!(WebCodec::close_payload(1001, &"é".repeat(100)).len(), 2 + 122);
    }
}
