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

//! Codecs for the text protocol. Both sides are two-phase: a command or
//! reply line first, then the `<bytes>`-sized data block where one is
//! announced. The encoder side passes pre-rendered bytes through, the
//! writer composes response chunks itself.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{
    key_ok, parse_num, scan_tokens, ArithVerb, Request, Response, StorageVerb, BAD_DATA_CHUNK,
    BAD_DELTA, BAD_FORMAT, MAX_VALUE_SIZE, TOO_LARGE,
};
use crate::error::Error;

/// Command lines longer than this kill the connection; generous enough
/// for multi-gets with a few hundred maximum-length keys.
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Splits one line off `src`, tolerating both CRLF and bare LF endings.
fn split_line(src: &mut BytesMut) -> Result<Option<BytesMut>, Error> {
    match src.iter().position(|&b| b == b'\n') {
        Some(pos) => {
            let mut line = src.split_to(pos + 1);
            line.truncate(pos);
            if line.last() == Some(&b'\r') {
                let len = line.len();
                line.truncate(len - 1);
            }
            Ok(Some(line))
        }
        None if src.len() > MAX_LINE_LENGTH => Err(Error::Frame("line too long")),
        None => Ok(None),
    }
}

#[derive(Debug)]
struct PendingStorage {
    verb: StorageVerb,
    key: Bytes,
    flags: u32,
    exptime: u32,
    bytes: usize,
    cas: Option<u64>,
    noreply: bool,
}

#[derive(Debug)]
enum RequestState {
    Line,
    Data(PendingStorage),
}

/// Decodes client commands; encodes pre-rendered reply bytes.
#[derive(Debug)]
pub struct RequestCodec {
    state: RequestState,
}

impl RequestCodec {
    pub fn new() -> Self {
        RequestCodec {
            state: RequestState::Line,
        }
    }
}

impl Default for RequestCodec {
    fn default() -> Self {
        Self::new()
    }
}

enum Parsed {
    Complete(Request),
    NeedData(PendingStorage),
}

fn parse_storage(verb: StorageVerb, tokens: &[&[u8]]) -> Parsed {
    let wants_cas = verb == StorageVerb::Cas;
    let base = if wants_cas { 6 } else { 5 };

    if tokens.len() < base || tokens.len() > base + 1 {
        return Parsed::Complete(Request::Invalid(BAD_FORMAT));
    }
    let noreply = tokens.len() == base + 1;
    if noreply && tokens[base] != b"noreply" {
        return Parsed::Complete(Request::Invalid(BAD_FORMAT));
    }
    if !key_ok(tokens[1]) {
        return Parsed::Complete(Request::Invalid(BAD_FORMAT));
    }

    let flags = match parse_num::<u32>(tokens[2]) {
        Some(v) => v,
        None => return Parsed::Complete(Request::Invalid(BAD_FORMAT)),
    };
    let exptime = match parse_num::<u32>(tokens[3]) {
        Some(v) => v,
        None => return Parsed::Complete(Request::Invalid(BAD_FORMAT)),
    };
    let bytes = match parse_num::<usize>(tokens[4]) {
        Some(v) => v,
        None => return Parsed::Complete(Request::Invalid(BAD_FORMAT)),
    };
    if bytes > MAX_VALUE_SIZE {
        return Parsed::Complete(Request::Invalid(TOO_LARGE));
    }
    let cas = if wants_cas {
        match parse_num::<u64>(tokens[5]) {
            Some(v) => Some(v),
            None => return Parsed::Complete(Request::Invalid(BAD_FORMAT)),
        }
    } else {
        None
    };

    Parsed::NeedData(PendingStorage {
        verb,
        key: Bytes::copy_from_slice(tokens[1]),
        flags,
        exptime,
        bytes,
        cas,
        noreply,
    })
}

fn parse_request_line(line: &[u8]) -> Parsed {
    let tokens = scan_tokens(line);
    let verb = match tokens.first() {
        Some(verb) => *verb,
        None => return Parsed::Complete(Request::Invalid("ERROR")),
    };

    let req = match verb {
        b"get" | b"gets" => {
            // Multi-key gets are unbounded, re-walk the raw line.
            let mut keys = Vec::new();
            for key in line.split(|&b| b == b' ').skip(1) {
                if key.is_empty() {
                    continue;
                }
                if !key_ok(key) {
                    return Parsed::Complete(Request::Invalid(BAD_FORMAT));
                }
                keys.push(Bytes::copy_from_slice(key));
            }
            if keys.is_empty() {
                return Parsed::Complete(Request::Invalid("ERROR"));
            }
            Request::Get {
                gets: verb == b"gets",
                keys,
            }
        }
        b"set" | b"add" | b"replace" | b"append" | b"prepend" | b"cas" => {
            let verb = match verb {
                b"set" => StorageVerb::Set,
                b"add" => StorageVerb::Add,
                b"replace" => StorageVerb::Replace,
                b"append" => StorageVerb::Append,
                b"prepend" => StorageVerb::Prepend,
                _ => StorageVerb::Cas,
            };
            return parse_storage(verb, &tokens);
        }
        b"delete" => {
            if tokens.len() < 2 || tokens.len() > 3 || !key_ok(tokens[1]) {
                Request::Invalid(BAD_FORMAT)
            } else if tokens.len() == 3 && tokens[2] != b"noreply" {
                Request::Invalid(BAD_FORMAT)
            } else {
                Request::Delete {
                    key: Bytes::copy_from_slice(tokens[1]),
                    noreply: tokens.len() == 3,
                }
            }
        }
        b"incr" | b"decr" => {
            let arith = if verb == b"incr" {
                ArithVerb::Incr
            } else {
                ArithVerb::Decr
            };
            if tokens.len() < 3 || tokens.len() > 4 || !key_ok(tokens[1]) {
                Request::Invalid(BAD_FORMAT)
            } else if tokens.len() == 4 && tokens[3] != b"noreply" {
                Request::Invalid(BAD_FORMAT)
            } else {
                match parse_num::<u64>(tokens[2]) {
                    Some(delta) => Request::Arith {
                        verb: arith,
                        key: Bytes::copy_from_slice(tokens[1]),
                        delta,
                        noreply: tokens.len() == 4,
                    },
                    None => Request::Invalid(BAD_DELTA),
                }
            }
        }
        b"flush_all" => match tokens.len() {
            1 => Request::FlushAll {
                exptime: None,
                noreply: false,
            },
            2 if tokens[1] == b"noreply" => Request::FlushAll {
                exptime: None,
                noreply: true,
            },
            2 => match parse_num::<u32>(tokens[1]) {
                Some(exptime) => Request::FlushAll {
                    exptime: Some(exptime),
                    noreply: false,
                },
                None => Request::Invalid(BAD_FORMAT),
            },
            3 if tokens[2] == b"noreply" => match parse_num::<u32>(tokens[1]) {
                Some(exptime) => Request::FlushAll {
                    exptime: Some(exptime),
                    noreply: true,
                },
                None => Request::Invalid(BAD_FORMAT),
            },
            _ => Request::Invalid(BAD_FORMAT),
        },
        b"stats" => {
            let args = if tokens.len() > 1 {
                let mut joined = BytesMut::new();
                for (i, tok) in tokens[1..].iter().enumerate() {
                    if i > 0 {
                        joined.extend_from_slice(b" ");
                    }
                    joined.extend_from_slice(tok);
                }
                Some(joined.freeze())
            } else {
                None
            };
            Request::Stats { args }
        }
        b"version" => Request::Version,
        b"quit" => Request::Quit,
        _ => Request::Unknown,
    };

    Parsed::Complete(req)
}

impl Decoder for RequestCodec {
    type Item = Request;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Request>, Error> {
        loop {
            match &self.state {
                RequestState::Line => {
                    let line = match split_line(src)? {
                        Some(line) => line,
                        None => return Ok(None),
                    };
                    match parse_request_line(&line) {
                        Parsed::Complete(req) => return Ok(Some(req)),
                        Parsed::NeedData(pending) => {
                            self.state = RequestState::Data(pending);
                        }
                    }
                }
                RequestState::Data(pending) => {
                    let need = pending.bytes + 2;
                    if src.len() < need {
                        src.reserve(need - src.len());
                        return Ok(None);
                    }
                    let pending = match std::mem::replace(&mut self.state, RequestState::Line) {
                        RequestState::Data(pending) => pending,
                        RequestState::Line => unreachable!("BUG: request codec state changed"),
                    };
                    let mut chunk = src.split_to(need);
                    if &chunk[pending.bytes..] != b"\r\n" {
                        return Ok(Some(Request::Invalid(BAD_DATA_CHUNK)));
                    }
                    chunk.truncate(pending.bytes);
                    return Ok(Some(Request::Storage {
                        verb: pending.verb,
                        key: pending.key,
                        flags: pending.flags,
                        exptime: pending.exptime,
                        bytes: pending.bytes,
                        cas: pending.cas,
                        noreply: pending.noreply,
                        data: chunk.freeze(),
                    }));
                }
            }
        }
    }
}

impl Encoder<Bytes> for RequestCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[derive(Debug)]
struct PendingValue {
    key: Bytes,
    flags: u32,
    cas: Option<u64>,
    bytes: usize,
}

#[derive(Debug)]
enum ResponseState {
    Line,
    Data(PendingValue),
}

/// Decodes server replies (a2a mode); encodes pre-rendered request bytes.
#[derive(Debug)]
pub struct ResponseCodec {
    state: ResponseState,
}

impl ResponseCodec {
    pub fn new() -> Self {
        ResponseCodec {
            state: ResponseState::Line,
        }
    }
}

impl Default for ResponseCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_value_header(line: &[u8]) -> Result<PendingValue, Error> {
    let tokens = scan_tokens(line);
    // VALUE <key> <flags> <bytes> [<cas>]
    if tokens.len() < 4 || tokens.len() > 5 {
        return Err(Error::Frame("bad VALUE header"));
    }
    let flags = parse_num::<u32>(tokens[2]).ok_or(Error::Frame("bad VALUE flags"))?;
    let bytes = parse_num::<usize>(tokens[3]).ok_or(Error::Frame("bad VALUE length"))?;
    if bytes > MAX_VALUE_SIZE {
        return Err(Error::FrameTooLarge(bytes));
    }
    let cas = if tokens.len() == 5 {
        Some(parse_num::<u64>(tokens[4]).ok_or(Error::Frame("bad VALUE cas"))?)
    } else {
        None
    };
    Ok(PendingValue {
        key: Bytes::copy_from_slice(tokens[1]),
        flags,
        cas,
        bytes,
    })
}

impl Decoder for ResponseCodec {
    type Item = Response;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Response>, Error> {
        loop {
            match &self.state {
                ResponseState::Line => {
                    let line = match split_line(src)? {
                        Some(line) => line,
                        None => return Ok(None),
                    };
                    if line.starts_with(b"VALUE ") {
                        self.state = ResponseState::Data(parse_value_header(&line)?);
                    } else if &line[..] == b"END" {
                        return Ok(Some(Response::End));
                    } else if line.starts_with(b"STAT ") {
                        let rest = &line[5..];
                        let (name, value) = match rest.iter().position(|&b| b == b' ') {
                            Some(pos) => (&rest[..pos], &rest[pos + 1..]),
                            None => (rest, &rest[rest.len()..]),
                        };
                        return Ok(Some(Response::Stat {
                            name: Bytes::copy_from_slice(name),
                            value: Bytes::copy_from_slice(value),
                        }));
                    } else {
                        return Ok(Some(Response::Line(line.freeze())));
                    }
                }
                ResponseState::Data(pending) => {
                    let need = pending.bytes + 2;
                    if src.len() < need {
                        src.reserve(need - src.len());
                        return Ok(None);
                    }
                    let pending = match std::mem::replace(&mut self.state, ResponseState::Line) {
                        ResponseState::Data(pending) => pending,
                        ResponseState::Line => unreachable!("BUG: response codec state changed"),
                    };
                    let mut chunk = src.split_to(need);
                    if &chunk[pending.bytes..] != b"\r\n" {
                        return Err(Error::Frame("bad VALUE data block"));
                    }
                    chunk.truncate(pending.bytes);
                    return Ok(Some(Response::Value {
                        key: pending.key,
                        flags: pending.flags,
                        cas: pending.cas,
                        data: chunk.freeze(),
                    }));
                }
            }
        }
    }
}

impl Encoder<Bytes> for ResponseCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn decode_all(codec: &mut RequestCodec, input: &[u8]) -> Vec<Request> {
        let mut buf = BytesMut::from(input);
        let mut out = Vec::new();
        while let Some(req) = codec.decode(&mut buf).expect("decode failed") {
            out.push(req);
        }
        out
    }

    #[test]
    fn test_set_round_trip() {
        let mut codec = RequestCodec::new();
        let reqs = decode_all(&mut codec, b"set k 7 0 5\r\nhello\r\n");
        assert_eq!(
            reqs,
            vec![Request::Storage {
                verb: StorageVerb::Set,
                key: Bytes::from_static(b"k"),
                flags: 7,
                exptime: 0,
                bytes: 5,
                cas: None,
                noreply: false,
                data: Bytes::from_static(b"hello"),
            }]
        );
    }

    #[test]
    fn test_set_split_across_reads() {
        let mut codec = RequestCodec::new();
        let mut buf = BytesMut::new();

        buf.extend_from_slice(b"set k 0 0 5\r\nhel");
        assert!(codec.decode(&mut buf).expect("decode failed").is_none());

        buf.extend_from_slice(b"lo\r\nget k\r\n");
        let first = codec.decode(&mut buf).expect("decode failed");
        assert!(matches!(first, Some(Request::Storage { .. })));
        let second = codec.decode(&mut buf).expect("decode failed");
        assert_eq!(
            second,
            Some(Request::Get {
                gets: false,
                keys: vec![Bytes::from_static(b"k")],
            })
        );
    }

    #[test]
    fn test_cas_and_noreply() {
        let mut codec = RequestCodec::new();
        let reqs = decode_all(&mut codec, b"cas k 0 0 1 99 noreply\r\nX\r\n");
        assert_eq!(
            reqs,
            vec![Request::Storage {
                verb: StorageVerb::Cas,
                key: Bytes::from_static(b"k"),
                flags: 0,
                exptime: 0,
                bytes: 1,
                cas: Some(99),
                noreply: true,
                data: Bytes::from_static(b"X"),
            }]
        );
    }

    #[test]
    fn test_bad_data_chunk() {
        let mut codec = RequestCodec::new();
        let reqs = decode_all(&mut codec, b"set k 0 0 5\r\nhelloXXget k\r\n");
        assert_eq!(reqs[0], Request::Invalid(BAD_DATA_CHUNK));
    }

    #[test]
    fn test_multi_key_get_is_not_capped() {
        let mut codec = RequestCodec::new();
        let line = b"get k0 k1 k2 k3 k4 k5 k6 k7 k8 k9 k10 k11\r\n";
        match decode_all(&mut codec, line).pop() {
            Some(Request::Get { gets, keys }) => {
                assert!(!gets);
                assert_eq!(keys.len(), 12);
                assert_eq!(keys[11], Bytes::from_static(b"k11"));
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_misc_commands() {
        let mut codec = RequestCodec::new();
        let reqs = decode_all(
            &mut codec,
            b"delete k\r\nincr k 2\r\nflush_all 10 noreply\r\nstats reset\r\nbogus\r\n",
        );
        assert_eq!(
            reqs,
            vec![
                Request::Delete {
                    key: Bytes::from_static(b"k"),
                    noreply: false,
                },
                Request::Arith {
                    verb: ArithVerb::Incr,
                    key: Bytes::from_static(b"k"),
                    delta: 2,
                    noreply: false,
                },
                Request::FlushAll {
                    exptime: Some(10),
                    noreply: true,
                },
                Request::Stats {
                    args: Some(Bytes::from_static(b"reset")),
                },
                Request::Unknown,
            ]
        );
    }

    #[test]
    fn test_bad_delta() {
        let mut codec = RequestCodec::new();
        let reqs = decode_all(&mut codec, b"incr k nope\r\n");
        assert_eq!(reqs, vec![Request::Invalid(BAD_DELTA)]);
    }

    #[test]
    fn test_response_value_parse() {
        let mut codec = ResponseCodec::new();
        let mut buf = BytesMut::from(&b"VALUE k 7 5 13\r\nhello\r\nEND\r\nSTORED\r\n"[..]);

        let value = codec.decode(&mut buf).expect("decode failed");
        assert_eq!(
            value,
            Some(Response::Value {
                key: Bytes::from_static(b"k"),
                flags: 7,
                cas: Some(13),
                data: Bytes::from_static(b"hello"),
            })
        );
        assert_eq!(
            codec.decode(&mut buf).expect("decode failed"),
            Some(Response::End)
        );
        assert_eq!(
            codec.decode(&mut buf).expect("decode failed"),
            Some(Response::Line(Bytes::from_static(b"STORED")))
        );
    }

    #[test]
    fn test_response_stat_parse() {
        let mut codec = ResponseCodec::new();
        let mut buf = BytesMut::from(&b"STAT curr_items 10\r\n"[..]);
        assert_eq!(
            codec.decode(&mut buf).expect("decode failed"),
            Some(Response::Stat {
                name: Bytes::from_static(b"curr_items"),
                value: Bytes::from_static(b"10"),
            })
        );
    }
}
