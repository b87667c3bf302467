/*! Routing-layer messages carried inside the encrypted tunnel.

Every message is a dict whose `A` entry carries the verb letter:

Verb | Message
---- | -------
`P`  | `PathConfirm` — terminal hop acknowledges a finished build
`L`  | `PathLatency` — round-trip probe and its echo
`M`  | `DhtCarrier` — DHT messages relayed over a path
`D`  | `DataDiscard` — a hop dropped traffic for the given path
`O`  | `ObtainExit` — ask the terminal hop for internet egress
`G`  | `GrantExit` — egress granted, signed by the exit
`J`  | `RejectExit` — egress denied, signed by the exit
`U`  | `UpdateExit` — move an exit grant to a new path
`C`  | `CloseExit` — tear down an exit grant
`T`  | `TransferTraffic` — exit traffic, one 8-byte counter per packet
`H`  | `HiddenServiceFrame` — opaque hidden-service protocol frame

Encoded messages are padded with random bytes up to
[`MESSAGE_PAD_SIZE`](./constant.MESSAGE_PAD_SIZE.html) before tunnel
encryption so short control traffic does not stand out by length.
*/

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::combinator::{map, verify};
use nom::multi::many0;
use nom::IResult;
use rand::Rng;

use shroud_binary_io::*;
use shroud_crypto::{PathId, RouterId, Signature, Signer, SigningKey, Verifier};

use crate::dht::DhtMessage;
use crate::errors::ContactError;
use crate::{b_path_id, b_router_id, b_signature, b_version, zero_signature, PROTO_VERSION};

/// Routing messages shorter than this are padded with random bytes.
pub const MESSAGE_PAD_SIZE: usize = 128;

/// Upper bound of an encoded routing message.
pub const MAX_ROUTING_MSG_SIZE: usize = 8 * 1024;

/// Minimum size of one exit traffic packet: 8-byte counter plus payload.
pub const TRAFFIC_COUNTER_SIZE: usize = 8;

/// Terminal hop acknowledges a finished path build. Keys: `L` path
/// lifetime ms, `S` sequence, `V` version.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PathConfirm {
    pub lifetime: u64,
    pub seq: u64,
}

impl FromBytes for PathConfirm {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&b"d"[..])(input)?;
        let (input, _) = bkey(b"A")(input)?;
        let (input, _) = verify(bbytes_exact(1), |verb: &[u8]| verb == b"P")(input)?;
        let (input, _) = bkey(b"L")(input)?;
        let (input, lifetime) = bint(input)?;
        let (input, _) = bkey(b"S")(input)?;
        let (input, seq) = bint(input)?;
        let (input, _version) = b_version(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        Ok((input, PathConfirm { lifetime, seq }))
    }
}

impl ToBytes for PathConfirm {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_slice!(b"1:A1:P") >>
            gen_slice!(b"1:L") >>
            gen_call!(gen_bint, self.lifetime) >>
            gen_slice!(b"1:S") >>
            gen_call!(gen_bint, self.seq) >>
            gen_slice!(b"1:V") >>
            gen_call!(gen_bint, PROTO_VERSION) >>
            gen_slice!(b"e")
        )
    }
}

/** Round-trip probe.

The owner sends a random `T`; the terminal hop echoes it back in `L`. Keys:
`L` echoed probe, `S` sequence, `T` probe, `V` version.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PathLatency {
    pub echo: u64,
    pub seq: u64,
    pub probe: u64,
}

impl FromBytes for PathLatency {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&b"d"[..])(input)?;
        let (input, _) = bkey(b"A")(input)?;
        let (input, _) = verify(bbytes_exact(1), |verb: &[u8]| verb == b"L")(input)?;
        let (input, _) = bkey(b"L")(input)?;
        let (input, echo) = bint(input)?;
        let (input, _) = bkey(b"S")(input)?;
        let (input, seq) = bint(input)?;
        let (input, _) = bkey(b"T")(input)?;
        let (input, probe) = bint(input)?;
        let (input, _version) = b_version(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        Ok((input, PathLatency { echo, seq, probe }))
    }
}

impl ToBytes for PathLatency {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_slice!(b"1:A1:L") >>
            gen_slice!(b"1:L") >>
            gen_call!(gen_bint, self.echo) >>
            gen_slice!(b"1:S") >>
            gen_call!(gen_bint, self.seq) >>
            gen_slice!(b"1:T") >>
            gen_call!(gen_bint, self.probe) >>
            gen_slice!(b"1:V") >>
            gen_call!(gen_bint, PROTO_VERSION) >>
            gen_slice!(b"e")
        )
    }
}

/// DHT messages relayed over a path. Keys: `M` message list, `S` sequence,
/// `V` version.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DhtCarrier {
    pub msgs: Vec<DhtMessage>,
    pub seq: u64,
}

impl FromBytes for DhtCarrier {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&b"d"[..])(input)?;
        let (input, _) = bkey(b"A")(input)?;
        let (input, _) = verify(bbytes_exact(1), |verb: &[u8]| verb == b"M")(input)?;
        let (input, _) = bkey(b"M")(input)?;
        let (input, _) = tag(&b"l"[..])(input)?;
        let (input, msgs) = many0(DhtMessage::from_bytes)(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        let (input, _) = bkey(b"S")(input)?;
        let (input, seq) = bint(input)?;
        let (input, _version) = b_version(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        Ok((input, DhtCarrier { msgs, seq }))
    }
}

impl ToBytes for DhtCarrier {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_slice!(b"1:A1:M") >>
            gen_slice!(b"1:M") >>
            gen_slice!(b"l") >>
            gen_many_ref!(&self.msgs, |buf, msg| DhtMessage::to_bytes(msg, buf)) >>
            gen_slice!(b"e") >>
            gen_slice!(b"1:S") >>
            gen_call!(gen_bint, self.seq) >>
            gen_slice!(b"1:V") >>
            gen_call!(gen_bint, PROTO_VERSION) >>
            gen_slice!(b"e")
        )
    }
}

/// A hop informs the owner it dropped traffic. Keys: `P` path id, `S`
/// sequence, `V` version.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DataDiscard {
    pub path_id: PathId,
    pub seq: u64,
}

impl FromBytes for DataDiscard {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&b"d"[..])(input)?;
        let (input, _) = bkey(b"A")(input)?;
        let (input, _) = verify(bbytes_exact(1), |verb: &[u8]| verb == b"D")(input)?;
        let (input, _) = bkey(b"P")(input)?;
        let (input, path_id) = b_path_id(input)?;
        let (input, _) = bkey(b"S")(input)?;
        let (input, seq) = bint(input)?;
        let (input, _version) = b_version(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        Ok((input, DataDiscard { path_id, seq }))
    }
}

impl ToBytes for DataDiscard {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_slice!(b"1:A1:D") >>
            gen_slice!(b"1:P") >>
            gen_call!(gen_bbytes, self.path_id.as_bytes()) >>
            gen_slice!(b"1:S") >>
            gen_call!(gen_bint, self.seq) >>
            gen_slice!(b"1:V") >>
            gen_call!(gen_bint, PROTO_VERSION) >>
            gen_slice!(b"e")
        )
    }
}

macro_rules! impl_signed (
    ($name:ident) => (
        impl $name {
            fn signing_encoding(&self) -> Result<Vec<u8>, ContactError> {
                let mut unsigned = self.clone();
                unsigned.signature = zero_signature();
                let mut buf = [0; MAX_ROUTING_MSG_SIZE];
                let (_, size) = unsigned
                    .to_bytes((&mut buf, 0))
                    .map_err(|_| ContactError::Encode)?;
                Ok(buf[..size].to_vec())
            }

            /// Sign the message with `Z` zeroed in the covered encoding.
            pub fn sign(&mut self, key: &SigningKey) -> Result<(), ContactError> {
                let encoding = self.signing_encoding()?;
                self.signature = key.sign(&encoding);
                Ok(())
            }

            /// Check the signature against the claimed signer.
            pub fn verify(&self, signer: &RouterId) -> Result<(), ContactError> {
                let key = signer
                    .verifying_key()
                    .map_err(|_| ContactError::BadSignature)?;
                let encoding = self.signing_encoding()?;
                key.verify(&encoding, &self.signature)
                    .map_err(|_| ContactError::BadSignature)
            }
        }
    )
);

/** Ask the terminal hop for internet egress.

Signed by the client identity carried in `I` so the exit can profile
abusers. Keys: `E` traffic flag, `I` client identity, `S` sequence, `T`
transaction id, `V` version, `Z` signature.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObtainExit {
    pub flag: u64,
    pub identity: RouterId,
    pub seq: u64,
    pub tx_id: u64,
    pub signature: Signature,
}

impl_signed!(ObtainExit);

impl FromBytes for ObtainExit {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&b"d"[..])(input)?;
        let (input, _) = bkey(b"A")(input)?;
        let (input, _) = verify(bbytes_exact(1), |verb: &[u8]| verb == b"O")(input)?;
        let (input, _) = bkey(b"E")(input)?;
        let (input, flag) = bint(input)?;
        let (input, _) = bkey(b"I")(input)?;
        let (input, identity) = b_router_id(input)?;
        let (input, _) = bkey(b"S")(input)?;
        let (input, seq) = bint(input)?;
        let (input, _) = bkey(b"T")(input)?;
        let (input, tx_id) = bint(input)?;
        let (input, _version) = b_version(input)?;
        let (input, _) = bkey(b"Z")(input)?;
        let (input, signature) = b_signature(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        Ok((
            input,
            ObtainExit {
                flag,
                identity,
                seq,
                tx_id,
                signature,
            },
        ))
    }
}

impl ToBytes for ObtainExit {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_slice!(b"1:A1:O") >>
            gen_slice!(b"1:E") >>
            gen_call!(gen_bint, self.flag) >>
            gen_slice!(b"1:I") >>
            gen_call!(gen_bbytes, self.identity.as_bytes()) >>
            gen_slice!(b"1:S") >>
            gen_call!(gen_bint, self.seq) >>
            gen_slice!(b"1:T") >>
            gen_call!(gen_bint, self.tx_id) >>
            gen_slice!(b"1:V") >>
            gen_call!(gen_bint, PROTO_VERSION) >>
            gen_slice!(b"1:Z") >>
            gen_call!(gen_bbytes, &self.signature.to_bytes()) >>
            gen_slice!(b"e")
        )
    }
}

macro_rules! exit_reply_codec (
    ($name:ident, $verb:expr, $extra_key:expr, $extra_field:ident) => (
        impl FromBytes for $name {
            fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
                let (input, _) = tag(&b"d"[..])(input)?;
                let (input, _) = bkey(b"A")(input)?;
                let (input, _) = verify(bbytes_exact(1), |verb: &[u8]| verb == $verb)(input)?;
                let (input, _) = bkey($extra_key)(input)?;
                let (input, $extra_field) = bint(input)?;
                let (input, _) = bkey(b"S")(input)?;
                let (input, seq) = bint(input)?;
                let (input, _) = bkey(b"T")(input)?;
                let (input, tx_id) = bint(input)?;
                let (input, _version) = b_version(input)?;
                let (input, _) = bkey(b"Z")(input)?;
                let (input, signature) = b_signature(input)?;
                let (input, _) = tag(&b"e"[..])(input)?;
                Ok((
                    input,
                    $name {
                        $extra_field,
                        seq,
                        tx_id,
                        signature,
                    },
                ))
            }
        }

        impl ToBytes for $name {
            fn to_bytes<'a>(
                &self,
                buf: (&'a mut [u8], usize),
            ) -> Result<(&'a mut [u8], usize), GenError> {
                do_gen!(buf,
                    gen_slice!(b"d") >>
                    gen_slice!(b"1:A1:") >>
                    gen_slice!($verb) >>
                    gen_slice!(b"1:") >>
                    gen_slice!($extra_key) >>
                    gen_call!(gen_bint, self.$extra_field) >>
                    gen_slice!(b"1:S") >>
                    gen_call!(gen_bint, self.seq) >>
                    gen_slice!(b"1:T") >>
                    gen_call!(gen_bint, self.tx_id) >>
                    gen_slice!(b"1:V") >>
                    gen_call!(gen_bint, PROTO_VERSION) >>
                    gen_slice!(b"1:Z") >>
                    gen_call!(gen_bbytes, &self.signature.to_bytes()) >>
                    gen_slice!(b"e")
                )
            }
        }
    )
);

/// Egress granted; `B` carries the grant lifetime in ms. Signed by the
/// exit identity.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GrantExit {
    pub backoff: u64,
    pub seq: u64,
    pub tx_id: u64,
    pub signature: Signature,
}

impl_signed!(GrantExit);
exit_reply_codec!(GrantExit, b"G", b"B", backoff);

/// Egress denied; `B` carries the backoff in ms before retrying. Signed by
/// the exit identity.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RejectExit {
    pub backoff: u64,
    pub seq: u64,
    pub tx_id: u64,
    pub signature: Signature,
}

impl_signed!(RejectExit);
exit_reply_codec!(RejectExit, b"J", b"B", backoff);

/** Move an exit grant to another path of the same owner.

Keys: `P` new path id, `S` sequence, `T` transaction id, `V` version, `Z`
signature by the client identity the grant was made to.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UpdateExit {
    pub path_id: PathId,
    pub seq: u64,
    pub tx_id: u64,
    pub signature: Signature,
}

impl_signed!(UpdateExit);

impl FromBytes for UpdateExit {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&b"d"[..])(input)?;
        let (input, _) = bkey(b"A")(input)?;
        let (input, _) = verify(bbytes_exact(1), |verb: &[u8]| verb == b"U")(input)?;
        let (input, _) = bkey(b"P")(input)?;
        let (input, path_id) = b_path_id(input)?;
        let (input, _) = bkey(b"S")(input)?;
        let (input, seq) = bint(input)?;
        let (input, _) = bkey(b"T")(input)?;
        let (input, tx_id) = bint(input)?;
        let (input, _version) = b_version(input)?;
        let (input, _) = bkey(b"Z")(input)?;
        let (input, signature) = b_signature(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        Ok((
            input,
            UpdateExit {
                path_id,
                seq,
                tx_id,
                signature,
            },
        ))
    }
}

impl ToBytes for UpdateExit {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_slice!(b"1:A1:U") >>
            gen_slice!(b"1:P") >>
            gen_call!(gen_bbytes, self.path_id.as_bytes()) >>
            gen_slice!(b"1:S") >>
            gen_call!(gen_bint, self.seq) >>
            gen_slice!(b"1:T") >>
            gen_call!(gen_bint, self.tx_id) >>
            gen_slice!(b"1:V") >>
            gen_call!(gen_bint, PROTO_VERSION) >>
            gen_slice!(b"1:Z") >>
            gen_call!(gen_bbytes, &self.signature.to_bytes()) >>
            gen_slice!(b"e")
        )
    }
}

/// Tear down an exit grant; sent by either side, signed by its identity.
/// Keys: `S` sequence, `T` transaction id, `V` version, `Z` signature.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CloseExit {
    pub seq: u64,
    pub tx_id: u64,
    pub signature: Signature,
}

impl_signed!(CloseExit);

impl FromBytes for CloseExit {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&b"d"[..])(input)?;
        let (input, _) = bkey(b"A")(input)?;
        let (input, _) = verify(bbytes_exact(1), |verb: &[u8]| verb == b"C")(input)?;
        let (input, _) = bkey(b"S")(input)?;
        let (input, seq) = bint(input)?;
        let (input, _) = bkey(b"T")(input)?;
        let (input, tx_id) = bint(input)?;
        let (input, _version) = b_version(input)?;
        let (input, _) = bkey(b"Z")(input)?;
        let (input, signature) = b_signature(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        Ok((
            input,
            CloseExit {
                seq,
                tx_id,
                signature,
            },
        ))
    }
}

impl ToBytes for CloseExit {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_slice!(b"1:A1:C") >>
            gen_slice!(b"1:S") >>
            gen_call!(gen_bint, self.seq) >>
            gen_slice!(b"1:T") >>
            gen_call!(gen_bint, self.tx_id) >>
            gen_slice!(b"1:V") >>
            gen_call!(gen_bint, PROTO_VERSION) >>
            gen_slice!(b"1:Z") >>
            gen_call!(gen_bbytes, &self.signature.to_bytes()) >>
            gen_slice!(b"e")
        )
    }
}

/** Exit traffic.

Each packet starts with an 8-byte big endian counter the exit demuxes
flows by. Keys: `S` sequence, `V` version, `X` packet list.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransferTraffic {
    pub pkts: Vec<Vec<u8>>,
    pub seq: u64,
}

impl FromBytes for TransferTraffic {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&b"d"[..])(input)?;
        let (input, _) = bkey(b"A")(input)?;
        let (input, _) = verify(bbytes_exact(1), |verb: &[u8]| verb == b"T")(input)?;
        let (input, _) = bkey(b"S")(input)?;
        let (input, seq) = bint(input)?;
        let (input, _version) = b_version(input)?;
        let (input, _) = bkey(b"X")(input)?;
        let (input, _) = tag(&b"l"[..])(input)?;
        let (input, pkts) = many0(map(
            verify(bbytes, |pkt: &[u8]| pkt.len() > TRAFFIC_COUNTER_SIZE),
            |pkt: &[u8]| pkt.to_vec(),
        ))(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        Ok((input, TransferTraffic { pkts, seq }))
    }
}

impl ToBytes for TransferTraffic {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_cond!(
                self.pkts.iter().any(|pkt| pkt.len() <= TRAFFIC_COUNTER_SIZE),
                |buf| gen_error(buf, 0)
            ) >>
            gen_slice!(b"d") >>
            gen_slice!(b"1:A1:T") >>
            gen_slice!(b"1:S") >>
            gen_call!(gen_bint, self.seq) >>
            gen_slice!(b"1:V") >>
            gen_call!(gen_bint, PROTO_VERSION) >>
            gen_slice!(b"1:X") >>
            gen_slice!(b"l") >>
            gen_many_ref!(&self.pkts, |buf, pkt: &Vec<u8>| gen_bbytes(buf, pkt.as_slice())) >>
            gen_slice!(b"e") >>
            gen_slice!(b"e") >>
            gen_len_limit(MAX_ROUTING_MSG_SIZE)
        )
    }
}

/// Opaque hidden-service protocol frame handed to the service endpoint
/// handler. Keys: `D` frame bytes, `S` sequence, `V` version.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HiddenServiceFrame {
    pub payload: Vec<u8>,
    pub seq: u64,
}

impl FromBytes for HiddenServiceFrame {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&b"d"[..])(input)?;
        let (input, _) = bkey(b"A")(input)?;
        let (input, _) = verify(bbytes_exact(1), |verb: &[u8]| verb == b"H")(input)?;
        let (input, _) = bkey(b"D")(input)?;
        let (input, payload) = bbytes(input)?;
        let (input, _) = bkey(b"S")(input)?;
        let (input, seq) = bint(input)?;
        let (input, _version) = b_version(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        Ok((
            input,
            HiddenServiceFrame {
                payload: payload.to_vec(),
                seq,
            },
        ))
    }
}

impl ToBytes for HiddenServiceFrame {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_slice!(b"1:A1:H") >>
            gen_slice!(b"1:D") >>
            gen_call!(gen_bbytes, self.payload.as_slice()) >>
            gen_slice!(b"1:S") >>
            gen_call!(gen_bint, self.seq) >>
            gen_slice!(b"1:V") >>
            gen_call!(gen_bint, PROTO_VERSION) >>
            gen_slice!(b"e") >>
            gen_len_limit(MAX_ROUTING_MSG_SIZE)
        )
    }
}

/// Any routing-layer message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RoutingMessage {
    PathConfirm(PathConfirm),
    PathLatency(PathLatency),
    Dht(DhtCarrier),
    DataDiscard(DataDiscard),
    ObtainExit(ObtainExit),
    GrantExit(GrantExit),
    RejectExit(RejectExit),
    UpdateExit(UpdateExit),
    CloseExit(CloseExit),
    TransferTraffic(TransferTraffic),
    HiddenServiceFrame(HiddenServiceFrame),
}

impl FromBytes for RoutingMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        alt((
            map(PathConfirm::from_bytes, RoutingMessage::PathConfirm),
            map(PathLatency::from_bytes, RoutingMessage::PathLatency),
            map(DhtCarrier::from_bytes, RoutingMessage::Dht),
            map(DataDiscard::from_bytes, RoutingMessage::DataDiscard),
            map(ObtainExit::from_bytes, RoutingMessage::ObtainExit),
            map(GrantExit::from_bytes, RoutingMessage::GrantExit),
            map(RejectExit::from_bytes, RoutingMessage::RejectExit),
            map(UpdateExit::from_bytes, RoutingMessage::UpdateExit),
            map(CloseExit::from_bytes, RoutingMessage::CloseExit),
            map(TransferTraffic::from_bytes, RoutingMessage::TransferTraffic),
            map(
                HiddenServiceFrame::from_bytes,
                RoutingMessage::HiddenServiceFrame,
            ),
        ))(input)
    }
}

impl ToBytes for RoutingMessage {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        match self {
            RoutingMessage::PathConfirm(p) => p.to_bytes(buf),
            RoutingMessage::PathLatency(p) => p.to_bytes(buf),
            RoutingMessage::Dht(p) => p.to_bytes(buf),
            RoutingMessage::DataDiscard(p) => p.to_bytes(buf),
            RoutingMessage::ObtainExit(p) => p.to_bytes(buf),
            RoutingMessage::GrantExit(p) => p.to_bytes(buf),
            RoutingMessage::RejectExit(p) => p.to_bytes(buf),
            RoutingMessage::UpdateExit(p) => p.to_bytes(buf),
            RoutingMessage::CloseExit(p) => p.to_bytes(buf),
            RoutingMessage::TransferTraffic(p) => p.to_bytes(buf),
            RoutingMessage::HiddenServiceFrame(p) => p.to_bytes(buf),
        }
    }
}

impl RoutingMessage {
    /** Encode and pad with random bytes up to `MESSAGE_PAD_SIZE`.

    The parser stops at the end of the dict, so the padding needs no
    framing.
    */
    pub fn encode_padded<R: Rng>(&self, rng: &mut R) -> Result<Vec<u8>, GenError> {
        let mut buf = vec![0; MAX_ROUTING_MSG_SIZE];
        let (_, size) = self.to_bytes((&mut buf, 0))?;
        let padded = size.max(MESSAGE_PAD_SIZE);
        rng.fill(&mut buf[size..padded]);
        buf.truncate(padded);
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::thread_rng;

    encode_decode_test!(
        path_confirm_encode_decode,
        RoutingMessage::PathConfirm(PathConfirm {
            lifetime: 600_000,
            seq: 0,
        })
    );

    encode_decode_test!(
        path_latency_encode_decode,
        RoutingMessage::PathLatency(PathLatency {
            echo: 0,
            seq: 1,
            probe: 424_242,
        })
    );

    encode_decode_test!(
        data_discard_encode_decode,
        RoutingMessage::DataDiscard(DataDiscard {
            path_id: PathId::random(&mut thread_rng()),
            seq: 9,
        })
    );

    encode_decode_test!(
        transfer_traffic_encode_decode,
        RoutingMessage::TransferTraffic(TransferTraffic {
            pkts: vec![vec![7; 32], vec![9; 100]],
            seq: 4,
        })
    );

    encode_decode_test!(
        hidden_service_frame_encode_decode,
        RoutingMessage::HiddenServiceFrame(HiddenServiceFrame {
            payload: vec![1; 77],
            seq: 2,
        })
    );

    #[test]
    fn dht_carrier_encode_decode() {
        let mut rng = thread_rng();
        let msg = RoutingMessage::Dht(DhtCarrier {
            msgs: vec![crate::dht::DhtMessage::FindRouter(crate::dht::FindRouter {
                exploritory: false,
                iterative: false,
                key: RouterId::from(SigningKey::generate(&mut rng).verifying_key()),
                tx_id: 11,
            })],
            seq: 3,
        });
        let mut buf = [0; MAX_ROUTING_MSG_SIZE];
        let (_, size) = msg.to_bytes((&mut buf, 0)).unwrap();
        let (_, decoded) = RoutingMessage::from_bytes(&buf[..size]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn obtain_exit_sign_verify() {
        let mut rng = thread_rng();
        let client = SigningKey::generate(&mut rng);
        let mut msg = ObtainExit {
            flag: 1,
            identity: RouterId::from(client.verifying_key()),
            seq: 0,
            tx_id: 55,
            signature: zero_signature(),
        };
        msg.sign(&client).unwrap();
        msg.verify(&RouterId::from(client.verifying_key())).unwrap();

        let stranger = SigningKey::generate(&mut rng);
        assert_eq!(
            msg.verify(&RouterId::from(stranger.verifying_key())),
            Err(ContactError::BadSignature)
        );
    }

    #[test]
    fn grant_exit_sign_verify_round_trip() {
        let mut rng = thread_rng();
        let exit = SigningKey::generate(&mut rng);
        let mut msg = GrantExit {
            backoff: 0,
            seq: 2,
            tx_id: 55,
            signature: zero_signature(),
        };
        msg.sign(&exit).unwrap();

        let mut buf = [0; MAX_ROUTING_MSG_SIZE];
        let (_, size) = RoutingMessage::GrantExit(msg.clone())
            .to_bytes((&mut buf, 0))
            .unwrap();
        let (_, decoded) = RoutingMessage::from_bytes(&buf[..size]).unwrap();
        match decoded {
            RoutingMessage::GrantExit(decoded) => {
                assert_eq!(decoded, msg);
                decoded.verify(&RouterId::from(exit.verifying_key())).unwrap();
            }
            other => panic!("expected GrantExit, got {:?}", other),
        }
    }

    #[test]
    fn reject_update_close_encode_decode() {
        let mut rng = thread_rng();
        let exit = SigningKey::generate(&mut rng);

        let mut reject = RejectExit {
            backoff: 15_000,
            seq: 0,
            tx_id: 1,
            signature: zero_signature(),
        };
        reject.sign(&exit).unwrap();
        let mut update = UpdateExit {
            path_id: PathId::random(&mut rng),
            seq: 1,
            tx_id: 2,
            signature: zero_signature(),
        };
        update.sign(&exit).unwrap();
        let mut close = CloseExit {
            seq: 2,
            tx_id: 3,
            signature: zero_signature(),
        };
        close.sign(&exit).unwrap();

        for msg in [
            RoutingMessage::RejectExit(reject),
            RoutingMessage::UpdateExit(update),
            RoutingMessage::CloseExit(close),
        ] {
            let mut buf = [0; MAX_ROUTING_MSG_SIZE];
            let (_, size) = msg.to_bytes((&mut buf, 0)).unwrap();
            let (_, decoded) = RoutingMessage::from_bytes(&buf[..size]).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn encode_padded_pads_short_messages() {
        let mut rng = thread_rng();
        let msg = RoutingMessage::PathConfirm(PathConfirm {
            lifetime: 1,
            seq: 0,
        });
        let encoded = msg.encode_padded(&mut rng).unwrap();
        assert_eq!(encoded.len(), MESSAGE_PAD_SIZE);
        // padding is ignored by the parser
        let (_, decoded) = RoutingMessage::from_bytes(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn encode_padded_leaves_long_messages_alone() {
        let mut rng = thread_rng();
        let msg = RoutingMessage::TransferTraffic(TransferTraffic {
            pkts: vec![vec![3; 300]],
            seq: 0,
        });
        let encoded = msg.encode_padded(&mut rng).unwrap();
        assert!(encoded.len() > MESSAGE_PAD_SIZE);
        let (_, decoded) = RoutingMessage::from_bytes(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn transfer_traffic_rejects_short_packets() {
        let msg = TransferTraffic {
            pkts: vec![vec![1; TRAFFIC_COUNTER_SIZE]],
            seq: 0,
        };
        let mut buf = [0; MAX_ROUTING_MSG_SIZE];
        assert!(msg.to_bytes((&mut buf, 0)).is_err());
    }
}
