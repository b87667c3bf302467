/*!
Wire formats of the shroud overlay router.

Every message is a bencoded dict with single-letter keys emitted in
ascending byte order, so each value has exactly one encoding and signatures
can cover the encoded form directly.
*/

#![forbid(unsafe_code)]

#[macro_use]
extern crate cookie_factory;

pub mod dht;
pub mod errors;
pub mod intro;
pub mod link;
pub mod rc;
pub mod routing;

use nom::combinator::{map_opt, verify};
use nom::IResult;

use shroud_binary_io::*;
use shroud_crypto::{
    PathId, PublicKey, RouterId, SessionKey, Signature, TunnelNonce, KEY_SIZE, NONCEBYTES,
    PATH_ID_SIZE, PUBLIC_KEY_LENGTH, SESSION_KEY_SIZE, SIGNATURE_LENGTH,
};

/// Version tag carried by every message; peers speaking another version are
/// rejected.
pub const PROTO_VERSION: u64 = 0;

pub(crate) fn b_router_id(input: &[u8]) -> IResult<&[u8], RouterId> {
    map_opt(bbytes_exact(PUBLIC_KEY_LENGTH), |bytes: &[u8]| {
        bytes.try_into().ok().map(RouterId)
    })(input)
}

pub(crate) fn b_pubkey(input: &[u8]) -> IResult<&[u8], PublicKey> {
    map_opt(bbytes_exact(KEY_SIZE), |bytes: &[u8]| {
        bytes
            .try_into()
            .ok()
            .map(|key: [u8; KEY_SIZE]| PublicKey::from(key))
    })(input)
}

pub(crate) fn b_path_id(input: &[u8]) -> IResult<&[u8], PathId> {
    map_opt(bbytes_exact(PATH_ID_SIZE), |bytes: &[u8]| {
        bytes.try_into().ok().map(PathId)
    })(input)
}

pub(crate) fn b_tunnel_nonce(input: &[u8]) -> IResult<&[u8], TunnelNonce> {
    map_opt(bbytes_exact(NONCEBYTES), |bytes: &[u8]| {
        bytes.try_into().ok().map(TunnelNonce)
    })(input)
}

pub(crate) fn b_session_key(input: &[u8]) -> IResult<&[u8], SessionKey> {
    map_opt(bbytes_exact(SESSION_KEY_SIZE), |bytes: &[u8]| {
        bytes.try_into().ok()
    })(input)
}

pub(crate) fn b_signature(input: &[u8]) -> IResult<&[u8], Signature> {
    map_opt(bbytes_exact(SIGNATURE_LENGTH), |bytes: &[u8]| {
        let bytes: [u8; SIGNATURE_LENGTH] = bytes.try_into().ok()?;
        Some(Signature::from_bytes(&bytes))
    })(input)
}

/// Parse a `V` dict entry and reject versions other than [`PROTO_VERSION`].
pub(crate) fn b_version(input: &[u8]) -> IResult<&[u8], u64> {
    let (input, _) = bkey(b"V")(input)?;
    verify(bint, |version| *version == PROTO_VERSION)(input)
}

/// Zero signature placeholder used while computing or checking signatures.
pub fn zero_signature() -> Signature {
    Signature::from_bytes(&[0; SIGNATURE_LENGTH])
}
