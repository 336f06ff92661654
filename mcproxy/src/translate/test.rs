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

use bytes::Bytes;

use memcache_proto::binary::{self, Opcode, Status, HEADER_LEN};
use memcache_proto::text::{ArithVerb, Request, StorageVerb};

use super::a2a;
use super::a2b;

fn storage(verb: StorageVerb, cas: Option<u64>, noreply: bool) -> Request {
    Request::Storage {
        verb,
        key: Bytes::from_static(b"k"),
        flags: 7,
        exptime: 60,
        bytes: 5,
        cas,
        noreply,
        data: Bytes::from_static(b"hello"),
    }
}

fn decode(frame: Bytes) -> binary::Request {
    let mut buf = bytes::BytesMut::from(&frame[..]);
    binary::Request::decode(&mut buf)
        .expect("frame did not decode")
        .expect("frame incomplete")
}

#[test]
fn test_set_builds_binary_set_with_extras() {
    let frame = a2b::build_request(&storage(StorageVerb::Set, None, false), false)
        .expect("set did not translate");
    assert_eq!(frame.len(), HEADER_LEN + 8 + 1 + 5);

    let req = decode(frame);
    assert_eq!(req.opcode, Opcode::Set);
    assert_eq!(&req.extras[..4], &7u32.to_be_bytes());
    assert_eq!(&req.extras[4..], &60u32.to_be_bytes());
    assert_eq!(&req.key[..], b"k");
    assert_eq!(&req.value[..], b"hello");
}

#[test]
fn test_noreply_selects_quiet_opcode() {
    let frame = a2b::build_request(&storage(StorageVerb::Set, None, true), true)
        .expect("set did not translate");
    assert_eq!(decode(frame).opcode, Opcode::SetQ);
}

#[test]
fn test_cas_maps_to_set_and_drops_cas() {
    // The cas token never reaches the binary hop; the header field stays
    // zero and the opcode is a plain SET.
    let frame = a2b::build_request(&storage(StorageVerb::Cas, Some(1234), false), false)
        .expect("cas did not translate");
    let req = decode(frame);
    assert_eq!(req.opcode, Opcode::Set);
    assert_eq!(req.cas, 0);
}

#[test]
fn test_append_skips_extras() {
    let frame = a2b::build_request(&storage(StorageVerb::Append, None, false), false)
        .expect("append did not translate");
    let req = decode(frame);
    assert_eq!(req.opcode, Opcode::Append);
    assert!(req.extras.is_empty());
}

#[test]
fn test_incr_extras_layout() {
    let request = Request::Arith {
        verb: ArithVerb::Incr,
        key: Bytes::from_static(b"counter"),
        delta: 3,
        noreply: false,
    };
    let req = decode(a2b::build_request(&request, false).expect("incr did not translate"));
    assert_eq!(req.opcode, Opcode::Increment);
    assert_eq!(req.extras.len(), 20);
    assert_eq!(&req.extras[..8], &3u64.to_be_bytes());
    assert_eq!(&req.extras[8..16], &0u64.to_be_bytes());
    // Expiration 0xffffffff: never auto-create, report NOT_FOUND instead.
    assert_eq!(&req.extras[16..], &[0xff, 0xff, 0xff, 0xff]);
}

#[test]
fn test_delete_is_bare() {
    let request = Request::Delete {
        key: Bytes::from_static(b"k"),
        noreply: false,
    };
    let req = decode(a2b::build_request(&request, false).expect("delete did not translate"));
    assert_eq!(req.opcode, Opcode::Delete);
    assert!(req.extras.is_empty());
    assert!(req.value.is_empty());
}

#[test]
fn test_store_status_mapping() {
    assert_eq!(a2b::store_status_line(Status::Ok), b"STORED\r\n");
    assert_eq!(a2b::store_status_line(Status::KeyEexists), b"EXISTS\r\n");
    assert_eq!(a2b::store_status_line(Status::KeyEnoent), b"NOT_FOUND\r\n");
    assert_eq!(a2b::store_status_line(Status::NotStored), b"NOT_STORED\r\n");
    assert_eq!(
        a2b::store_status_line(Status::Enomem),
        b"SERVER_ERROR a2b error\r\n"
    );
    assert_eq!(
        a2b::store_status_line(Status::Unknown(0x1234)),
        b"SERVER_ERROR a2b error\r\n"
    );
}

#[test]
fn test_a2a_line_rendering() {
    let line = a2a::render_line(&storage(StorageVerb::Cas, Some(9), true))
        .expect("storage did not render");
    assert_eq!(&line[..], b"cas k 7 60 5 9 noreply\r\nhello\r\n");

    let line = a2a::render_line(&Request::FlushAll {
        exptime: Some(10),
        noreply: false,
    })
    .expect("flush_all did not render");
    assert_eq!(&line[..], b"flush_all 10\r\n");

    let line = a2a::render_line(&Request::Stats {
        args: Some(Bytes::from_static(b"sizes")),
    })
    .expect("stats did not render");
    assert_eq!(&line[..], b"stats sizes\r\n");
}
