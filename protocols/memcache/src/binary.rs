// Copyright (C) 2026  mcproxy authors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! The memcached binary protocol: 24-byte header, opcodes (with the quiet
//! variants used for `noreply` and multi-get batching), status codes, and
//! whole-frame request/response models.
//!
//! All multi-byte integers are network byte order, including the 64-bit
//! cas and arithmetic fields.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

pub mod codec;

pub use codec::{RequestCodec, ResponseCodec};

pub const HEADER_LEN: usize = 24;
pub const MAGIC_REQUEST: u8 = 0x80;
pub const MAGIC_RESPONSE: u8 = 0x81;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Quit = 0x07,
    Flush = 0x08,
    GetQ = 0x09,
    Noop = 0x0a,
    Version = 0x0b,
    GetK = 0x0c,
    GetKQ = 0x0d,
    Append = 0x0e,
    Prepend = 0x0f,
    Stat = 0x10,
    SetQ = 0x11,
    AddQ = 0x12,
    ReplaceQ = 0x13,
    DeleteQ = 0x14,
    IncrementQ = 0x15,
    DecrementQ = 0x16,
    QuitQ = 0x17,
    FlushQ = 0x18,
    AppendQ = 0x19,
    PrependQ = 0x1a,
}

impl Opcode {
    pub fn from_u8(raw: u8) -> Option<Opcode> {
        use Opcode::*;

        Some(match raw {
            0x00 => Get,
            0x01 => Set,
            0x02 => Add,
            0x03 => Replace,
            0x04 => Delete,
            0x05 => Increment,
            0x06 => Decrement,
            0x07 => Quit,
            0x08 => Flush,
            0x09 => GetQ,
            0x0a => Noop,
            0x0b => Version,
            0x0c => GetK,
            0x0d => GetKQ,
            0x0e => Append,
            0x0f => Prepend,
            0x10 => Stat,
            0x11 => SetQ,
            0x12 => AddQ,
            0x13 => ReplaceQ,
            0x14 => DeleteQ,
            0x15 => IncrementQ,
            0x16 => DecrementQ,
            0x17 => QuitQ,
            0x18 => FlushQ,
            0x19 => AppendQ,
            0x1a => PrependQ,
            _ => return None,
        })
    }

    /// The quiet (reply-suppressing) variant, used for `noreply` commands
    /// and for all but the last key of a multi-get batch. `Stat` quiets to
    /// `Noop`; opcodes without a quiet form return themselves.
    pub fn quiet(self) -> Opcode {
        use Opcode::*;

        match self {
            Get => GetQ,
            Set => SetQ,
            Add => AddQ,
            Replace => ReplaceQ,
            Delete => DeleteQ,
            Increment => IncrementQ,
            Decrement => DecrementQ,
            Quit => QuitQ,
            Flush => FlushQ,
            GetK => GetKQ,
            Append => AppendQ,
            Prepend => PrependQ,
            Stat => Noop,
            other => other,
        }
    }

    /// Maps a quiet opcode back to its plain form for response dispatch.
    pub fn unquiet(self) -> Opcode {
        use Opcode::*;

        match self {
            GetQ => Get,
            SetQ => Set,
            AddQ => Add,
            ReplaceQ => Replace,
            DeleteQ => Delete,
            IncrementQ => Increment,
            DecrementQ => Decrement,
            QuitQ => Quit,
            FlushQ => Flush,
            GetKQ => GetK,
            AppendQ => Append,
            PrependQ => Prepend,
            other => other,
        }
    }

    pub fn is_quiet(self) -> bool {
        self != self.unquiet()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    KeyEnoent,
    KeyEexists,
    NotStored,
    DeltaBadval,
    Enomem,
    Unknown(u16),
}

impl Status {
    pub fn from_u16(raw: u16) -> Status {
        match raw {
            0x0000 => Status::Ok,
            0x0001 => Status::KeyEnoent,
            0x0002 => Status::KeyEexists,
            0x0005 => Status::NotStored,
            0x0006 => Status::DeltaBadval,
            0x0082 => Status::Enomem,
            other => Status::Unknown(other),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Status::Ok => 0x0000,
            Status::KeyEnoent => 0x0001,
            Status::KeyEexists => 0x0002,
            Status::NotStored => 0x0005,
            Status::DeltaBadval => 0x0006,
            Status::Enomem => 0x0082,
            Status::Unknown(other) => other,
        }
    }
}

/// One binary request frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub opcode: Opcode,
    pub key: Bytes,
    pub extras: Bytes,
    pub value: Bytes,
    pub opaque: u32,
    pub cas: u64,
}

impl Request {
    /// A request carrying nothing but the opcode and an optional key.
    pub fn simple(opcode: Opcode, key: Bytes) -> Request {
        Request {
            opcode,
            key,
            extras: Bytes::new(),
            value: Bytes::new(),
            opaque: 0,
            cas: 0,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let body_len = self.extras.len() + self.key.len() + self.value.len();
        dst.reserve(HEADER_LEN + body_len);
        dst.put_u8(MAGIC_REQUEST);
        dst.put_u8(self.opcode as u8);
        dst.put_u16(self.key.len() as u16);
        dst.put_u8(self.extras.len() as u8);
        dst.put_u8(0); // datatype: raw bytes
        dst.put_u16(0); // vbucket id, unused
        dst.put_u32(body_len as u32);
        dst.put_u32(self.opaque);
        dst.put_u64(self.cas);
        dst.extend_from_slice(&self.extras);
        dst.extend_from_slice(&self.key);
        dst.extend_from_slice(&self.value);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Whole-frame decode; `Ok(None)` until a complete frame is buffered.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Request>> {
        let (header, mut body) = match split_frame(src, MAGIC_REQUEST)? {
            Some(parts) => parts,
            None => return Ok(None),
        };
        let extras = body.split_to(header.extras_len).freeze();
        let key = body.split_to(header.key_len).freeze();
        Ok(Some(Request {
            opcode: header.opcode,
            key,
            extras,
            value: body.freeze(),
            opaque: header.opaque,
            cas: header.cas,
        }))
    }
}

/// One binary response frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub opcode: Opcode,
    pub status: Status,
    pub opaque: u32,
    pub cas: u64,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Response {
    /// A bare header-only response.
    pub fn simple(opcode: Opcode, status: Status) -> Response {
        Response {
            opcode,
            status,
            opaque: 0,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: Bytes::new(),
        }
    }

    /// Item flags from the 4 leading extras bytes of a GET-family hit.
    pub fn flags(&self) -> u32 {
        if self.extras.len() >= 4 {
            u32::from_be_bytes([self.extras[0], self.extras[1], self.extras[2], self.extras[3]])
        } else {
            0
        }
    }

    /// The 64-bit counter carried by incr/decr success responses.
    pub fn counter(&self) -> Option<u64> {
        if self.value.len() == 8 {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&self.value);
            Some(u64::from_be_bytes(raw))
        } else {
            None
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        let body_len = self.extras.len() + self.key.len() + self.value.len();
        dst.reserve(HEADER_LEN + body_len);
        dst.put_u8(MAGIC_RESPONSE);
        dst.put_u8(self.opcode as u8);
        dst.put_u16(self.key.len() as u16);
        dst.put_u8(self.extras.len() as u8);
        dst.put_u8(0); // datatype: raw bytes
        dst.put_u16(self.status.to_u16());
        dst.put_u32(body_len as u32);
        dst.put_u32(self.opaque);
        dst.put_u64(self.cas);
        dst.extend_from_slice(&self.extras);
        dst.extend_from_slice(&self.key);
        dst.extend_from_slice(&self.value);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Whole-frame decode; `Ok(None)` until a complete frame is buffered.
    pub fn decode(src: &mut BytesMut) -> Result<Option<Response>> {
        let (header, mut body) = match split_frame(src, MAGIC_RESPONSE)? {
            Some(parts) => parts,
            None => return Ok(None),
        };
        let extras = body.split_to(header.extras_len).freeze();
        let key = body.split_to(header.key_len).freeze();
        Ok(Some(Response {
            opcode: header.opcode,
            status: Status::from_u16(header.status_or_vbucket),
            opaque: header.opaque,
            cas: header.cas,
            extras,
            key,
            value: body.freeze(),
        }))
    }
}

struct Header {
    opcode: Opcode,
    key_len: usize,
    extras_len: usize,
    status_or_vbucket: u16,
    opaque: u32,
    cas: u64,
}

/// Splits one complete frame off `src`, returning the parsed header and the
/// body with extras and key still attached.
fn split_frame(src: &mut BytesMut, magic: u8) -> Result<Option<(Header, BytesMut)>> {
    if src.len() < HEADER_LEN {
        return Ok(None);
    }
    let body_len = u32::from_be_bytes([src[8], src[9], src[10], src[11]]) as usize;
    if body_len > codec::MAX_BODY_LEN {
        return Err(Error::FrameTooLarge(body_len));
    }
    if src.len() < HEADER_LEN + body_len {
        src.reserve(HEADER_LEN + body_len - src.len());
        return Ok(None);
    }

    let mut frame = src.split_to(HEADER_LEN + body_len);
    let raw = frame.split_to(HEADER_LEN);
    if raw[0] != magic {
        return Err(Error::Frame("bad magic byte"));
    }
    let opcode = Opcode::from_u8(raw[1]).ok_or(Error::Frame("unknown opcode"))?;
    let key_len = u16::from_be_bytes([raw[2], raw[3]]) as usize;
    let extras_len = raw[4] as usize;
    if extras_len + key_len > body_len {
        return Err(Error::Frame("inconsistent frame lengths"));
    }

    let mut opaque = [0u8; 4];
    opaque.copy_from_slice(&raw[12..16]);
    let mut cas = [0u8; 8];
    cas.copy_from_slice(&raw[16..24]);

    Ok(Some((
        Header {
            opcode,
            key_len,
            extras_len,
            status_or_vbucket: u16::from_be_bytes([raw[6], raw[7]]),
            opaque: u32::from_be_bytes(opaque),
            cas: u64::from_be_bytes(cas),
        },
        frame,
    )))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_opcode_quiet_mapping() {
        assert_eq!(Opcode::GetK.quiet(), Opcode::GetKQ);
        assert_eq!(Opcode::GetKQ.unquiet(), Opcode::GetK);
        assert_eq!(Opcode::Set.quiet(), Opcode::SetQ);
        assert_eq!(Opcode::Stat.quiet(), Opcode::Noop);
        assert!(Opcode::SetQ.is_quiet());
        assert!(!Opcode::Set.is_quiet());
        assert!(!Opcode::Noop.is_quiet());
    }

    #[test]
    fn test_request_encode_layout() {
        let mut extras = BytesMut::new();
        extras.put_u32(7); // flags
        extras.put_u32(0); // exptime
        let req = Request {
            opcode: Opcode::Set,
            key: Bytes::from_static(b"k"),
            extras: extras.freeze(),
            value: Bytes::from_static(b"hello"),
            opaque: 0,
            cas: 0,
        };

        let bytes = req.to_bytes();
        assert_eq!(bytes.len(), HEADER_LEN + 8 + 1 + 5);
        assert_eq!(bytes[0], MAGIC_REQUEST);
        assert_eq!(bytes[1], 0x01); // SET
        assert_eq!(&bytes[2..4], &[0x00, 0x01]); // keylen
        assert_eq!(bytes[4], 8); // extlen
        assert_eq!(&bytes[8..12], &[0x00, 0x00, 0x00, 0x0e]); // bodylen = 14
        assert_eq!(&bytes[24..28], &[0x00, 0x00, 0x00, 0x07]); // flags
        assert_eq!(&bytes[32..33], b"k");
        assert_eq!(&bytes[33..], b"hello");
    }

    #[test]
    fn test_request_round_trip() {
        let req = Request {
            opcode: Opcode::GetK,
            key: Bytes::from_static(b"some-key"),
            extras: Bytes::new(),
            value: Bytes::new(),
            opaque: 0xdeadbeef,
            cas: 0,
        };

        let mut buf = BytesMut::new();
        req.encode(&mut buf);
        let decoded = Request::decode(&mut buf)
            .expect("decode failed")
            .expect("incomplete frame");
        assert_eq!(decoded, req);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_response_round_trip_and_partial() {
        let mut extras = BytesMut::new();
        extras.put_u32(7);
        let resp = Response {
            opcode: Opcode::GetK,
            status: Status::Ok,
            opaque: 0,
            cas: 42,
            extras: extras.freeze(),
            key: Bytes::from_static(b"k"),
            value: Bytes::from_static(b"hello"),
        };
        let bytes = resp.to_bytes();

        // Feed in two pieces; the first must not produce a frame.
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&bytes[..HEADER_LEN + 2]);
        assert!(Response::decode(&mut buf).expect("decode failed").is_none());

        buf.extend_from_slice(&bytes[HEADER_LEN + 2..]);
        let decoded = Response::decode(&mut buf)
            .expect("decode failed")
            .expect("incomplete frame");
        assert_eq!(decoded, resp);
        assert_eq!(decoded.flags(), 7);
    }

    #[test]
    fn test_counter_value() {
        let mut value = BytesMut::new();
        value.put_u64(12345);
        let resp = Response {
            opcode: Opcode::Increment,
            status: Status::Ok,
            opaque: 0,
            cas: 0,
            extras: Bytes::new(),
            key: Bytes::new(),
            value: value.freeze(),
        };
        assert_eq!(resp.counter(), Some(12345));
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = BytesMut::from(&[0x42u8; HEADER_LEN][..]);
        // bodylen bytes are 0x42424242 which trips the size cap first
        assert!(Response::decode(&mut buf).is_err());
    }
}
