//! # Codec
//!
//! Postcard encoding for envelopes and values. All decoding paths return
//! `Result`; malformed input never panics.
//! Values nested beyond [`MAX_NESTING_DEPTH`](crate::value::MAX_NESTING_DEPTH)
//! lists fail with [`Error::Encode`] or [`Error::Decode`].

use crate::error::Error;
use crate::error::Result;
use crate::frame::Reply;
use crate::frame::Request;
use crate::value::Value;

pub fn encode_request(request: &Request) -> Result<Vec<u8>> {
    postcard::to_stdvec(request).map_err(Error::Encode)
}

pub fn decode_request(bytes: &[u8]) -> Result<Request> {
    postcard::from_bytes(bytes).map_err(Error::Decode)
}

pub fn encode_reply(reply: &Reply) -> Result<Vec<u8>> {
    postcard::to_stdvec(reply).map_err(Error::Encode)
}

pub fn decode_reply(bytes: &[u8]) -> Result<Reply> {
    postcard::from_bytes(bytes).map_err(Error::Decode)
}

/// Serializes a value into the buffer format Rust images use for pickles.
pub fn encode_value(value: &Value) -> Result<Vec<u8>> {
    postcard::to_stdvec(value).map_err(Error::Encode)
}

pub fn decode_value(bytes: &[u8]) -> Result<Value> {
    postcard::from_bytes(bytes).map_err(Error::Decode)
}
