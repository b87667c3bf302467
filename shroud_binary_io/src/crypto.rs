use std::convert::TryInto;

use nom::bytes::complete::take;
use nom::combinator::{map, map_opt};
use nom::IResult;

use shroud_crypto::{
    PathId, PublicKey, RouterId, SecretKey, TunnelNonce, KEY_SIZE, NONCEBYTES, PATH_ID_SIZE,
    PUBLIC_KEY_LENGTH,
};

use super::FromBytes;

impl FromBytes for PublicKey {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        map(
            map_opt(take(KEY_SIZE), |pk: &[u8]| pk.try_into().ok()),
            |pk: [u8; KEY_SIZE]| pk.into(),
        )(input)
    }
}

impl FromBytes for SecretKey {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        map(
            map_opt(take(KEY_SIZE), |sk: &[u8]| sk.try_into().ok()),
            |sk: [u8; KEY_SIZE]| sk.into(),
        )(input)
    }
}

impl FromBytes for RouterId {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        map(
            map_opt(take(PUBLIC_KEY_LENGTH), |id: &[u8]| id.try_into().ok()),
            RouterId,
        )(input)
    }
}

impl FromBytes for PathId {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        map(
            map_opt(take(PATH_ID_SIZE), |id: &[u8]| id.try_into().ok()),
            PathId,
        )(input)
    }
}

impl FromBytes for TunnelNonce {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        map(
            map_opt(take(NONCEBYTES), |nonce: &[u8]| nonce.try_into().ok()),
            TunnelNonce,
        )(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_parse_bytes() {
        let bytes = [42; KEY_SIZE];
        let (_rest, pk) = PublicKey::from_bytes(&bytes).unwrap();
        assert_eq!(pk.as_bytes(), &bytes as &[u8]);
    }

    #[test]
    fn router_id_parse_bytes() {
        let bytes = [7; PUBLIC_KEY_LENGTH];
        let (_rest, id) = RouterId::from_bytes(&bytes).unwrap();
        assert_eq!(id.as_bytes(), &bytes);
    }

    #[test]
    fn path_id_parse_too_short() {
        let bytes = [7; PATH_ID_SIZE - 1];
        assert!(PathId::from_bytes(&bytes).is_err());
    }
}
