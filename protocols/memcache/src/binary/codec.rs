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

//! Binary protocol codecs. The decoders buffer one whole frame (header
//! plus `bodylen`) before yielding it; the encoder sides pass pre-rendered
//! frame bytes through.

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{Request, Response};
use crate::error::Error;

/// Sanity cap on the frame body, well above the common 1 MiB item limit.
pub const MAX_BODY_LEN: usize = 20 * 1024 * 1024;

/// Client-side codec: decodes responses, sends request bytes.
#[derive(Debug, Default)]
pub struct ResponseCodec;

impl Decoder for ResponseCodec {
    type Item = Response;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Response>, Error> {
        Response::decode(src)
    }
}

impl Encoder<Bytes> for ResponseCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Server-side codec: decodes requests, sends response bytes.
#[derive(Debug, Default)]
pub struct RequestCodec;

impl Decoder for RequestCodec {
    type Item = Request;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Request>, Error> {
        Request::decode(src)
    }
}

impl Encoder<Bytes> for RequestCodec {
    type Error = Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}
