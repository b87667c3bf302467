/*! Link-layer messages exchanged between directly connected routers.

Every message is a dict whose `a` entry carries the verb letter:

Verb | Message
---- | -------
`c`  | `RelayCommit` — path build message carrying 8 encrypted frames
`u`  | `RelayUpstream` — tunnel data flowing away from the path owner
`d`  | `RelayDownstream` — tunnel data flowing towards the path owner
`m`  | `DhtImmediate` — DHT messages outside any path
*/

use crypto_box::aead::{Aead, AeadCore};
use crypto_box::SalsaBox;
use nom::branch::alt;
use nom::bytes::complete::{tag, take};
use nom::combinator::{map, map_opt, verify};
use nom::multi::count;
use nom::IResult;
use rand::{CryptoRng, Rng};

use shroud_binary_io::*;
use shroud_crypto::{
    PathId, PublicKey, RouterId, SecretKey, SessionKey, TunnelNonce, BOX_OVERHEAD, KEY_SIZE,
    NONCEBYTES,
};

use crate::dht::DhtMessage;
use crate::errors::GetPayloadError;
use crate::{b_path_id, b_router_id, b_session_key, b_tunnel_nonce, PROTO_VERSION};

/// Number of frames in a `RelayCommit`; one per hop, the rest are filler.
pub const NUM_FRAMES: usize = 8;

/// Fixed plaintext size of a hop record, padded with random bytes so every
/// frame looks the same on the wire.
pub const HOP_RECORD_SIZE: usize = 256;

/// Raw size of one encrypted frame: ephemeral key, nonce and sealed record.
pub const FRAME_SIZE: usize = KEY_SIZE + NONCEBYTES + HOP_RECORD_SIZE + BOX_OVERHEAD;

/// Upper bound of an encoded link message.
pub const MAX_LINK_MSG_SIZE: usize = 16 * 1024;

/** Per-hop path build instruction, sealed inside one frame of a
`RelayCommit`.

Serialized keys: `l` lifetime ms, `n` tunnel nonce-XOR mask, `r` rx path
id, `s` tunnel session key, `t` tx path id, `u` next hop router id, `v`
version.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HopRecord {
    pub lifetime: u64,
    pub nonce_xor: TunnelNonce,
    pub rx_id: PathId,
    pub session_key: SessionKey,
    pub tx_id: PathId,
    pub next_hop: RouterId,
}

impl FromBytes for HopRecord {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&b"d"[..])(input)?;
        let (input, _) = bkey(b"l")(input)?;
        let (input, lifetime) = bint(input)?;
        let (input, _) = bkey(b"n")(input)?;
        let (input, nonce_xor) = b_tunnel_nonce(input)?;
        let (input, _) = bkey(b"r")(input)?;
        let (input, rx_id) = b_path_id(input)?;
        let (input, _) = bkey(b"s")(input)?;
        let (input, session_key) = b_session_key(input)?;
        let (input, _) = bkey(b"t")(input)?;
        let (input, tx_id) = b_path_id(input)?;
        let (input, _) = bkey(b"u")(input)?;
        let (input, next_hop) = b_router_id(input)?;
        let (input, _) = bkey(b"v")(input)?;
        let (input, _version) = verify(bint, |version| *version == PROTO_VERSION)(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        Ok((
            input,
            HopRecord {
                lifetime,
                nonce_xor,
                rx_id,
                session_key,
                tx_id,
                next_hop,
            },
        ))
    }
}

impl ToBytes for HopRecord {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_slice!(b"1:l") >>
            gen_call!(gen_bint, self.lifetime) >>
            gen_slice!(b"1:n") >>
            gen_call!(gen_bbytes, self.nonce_xor.as_bytes()) >>
            gen_slice!(b"1:r") >>
            gen_call!(gen_bbytes, self.rx_id.as_bytes()) >>
            gen_slice!(b"1:s") >>
            gen_call!(gen_bbytes, &self.session_key) >>
            gen_slice!(b"1:t") >>
            gen_call!(gen_bbytes, self.tx_id.as_bytes()) >>
            gen_slice!(b"1:u") >>
            gen_call!(gen_bbytes, self.next_hop.as_bytes()) >>
            gen_slice!(b"1:v") >>
            gen_call!(gen_bint, PROTO_VERSION) >>
            gen_slice!(b"e") >>
            gen_len_limit(HOP_RECORD_SIZE)
        )
    }
}

/** One frame of a `RelayCommit`.

Raw layout: 32-byte ephemeral X25519 key, 24-byte nonce, sealed hop record.
A hop that can open the frame with its onion key learns its role on the
path; all other frames are indistinguishable random bytes to it.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct EncryptedFrame {
    pub ephemeral_key: PublicKey,
    pub nonce: [u8; NONCEBYTES],
    pub payload: Vec<u8>,
}

impl EncryptedFrame {
    /// Seal a hop record to the hop's onion key under a fresh ephemeral key.
    pub fn seal<R: Rng + CryptoRng>(
        rng: &mut R,
        record: &HopRecord,
        recipient: &PublicKey,
    ) -> EncryptedFrame {
        let mut plain = [0; HOP_RECORD_SIZE];
        let (_, size) = record.to_bytes((&mut plain, 0)).unwrap();
        rng.fill(&mut plain[size..]);

        let ephemeral = SecretKey::generate(rng);
        let ephemeral_key = ephemeral.public_key();
        let nonce = SalsaBox::generate_nonce(rng);
        let payload = SalsaBox::new(recipient, &ephemeral)
            .encrypt(&nonce, &plain[..])
            .unwrap();

        EncryptedFrame {
            ephemeral_key,
            nonce: nonce.into(),
            payload,
        }
    }

    /// Filler frame made of random bytes.
    pub fn random<R: Rng + CryptoRng>(rng: &mut R) -> EncryptedFrame {
        let mut nonce = [0; NONCEBYTES];
        rng.fill(&mut nonce);
        let mut payload = vec![0; HOP_RECORD_SIZE + BOX_OVERHEAD];
        rng.fill(&mut payload[..]);
        EncryptedFrame {
            ephemeral_key: SecretKey::generate(rng).public_key(),
            nonce,
            payload,
        }
    }

    /** Try to open the frame with our onion secret key.

    Fails for filler frames and frames addressed to other hops.
    */
    pub fn open(&self, onion_key: &SecretKey) -> Result<HopRecord, GetPayloadError> {
        let decrypted = SalsaBox::new(&self.ephemeral_key, onion_key)
            .decrypt((&self.nonce).into(), self.payload.as_slice())
            .map_err(|_| GetPayloadError::decrypt())?;
        match HopRecord::from_bytes(&decrypted) {
            Err(error) => Err(GetPayloadError::deserialize(error, decrypted.clone())),
            // trailing bytes are padding
            Ok((_, record)) => Ok(record),
        }
    }
}

impl FromBytes for EncryptedFrame {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, ephemeral_key) = PublicKey::from_bytes(input)?;
        let (input, nonce) = map_opt(take(NONCEBYTES), |bytes: &[u8]| bytes.try_into().ok())(input)?;
        let (input, payload) = take(HOP_RECORD_SIZE + BOX_OVERHEAD)(input)?;
        Ok((
            input,
            EncryptedFrame {
                ephemeral_key,
                nonce,
                payload: payload.to_vec(),
            },
        ))
    }
}

impl ToBytes for EncryptedFrame {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_cond!(
                self.payload.len() != HOP_RECORD_SIZE + BOX_OVERHEAD,
                |buf| gen_error(buf, 0)
            ) >>
            gen_slice!(self.ephemeral_key.as_bytes()) >>
            gen_slice!(self.nonce.as_ref()) >>
            gen_slice!(self.payload.as_slice())
        )
    }
}

/** Path build message, forwarded hop by hop.

Serialized keys: `a` = `c`, `c` list of `NUM_FRAMES` frames, `v` version.
Each hop opens the frame addressed to it, rotates the frame list by one and
forwards the message to the next hop named in its record.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RelayCommit {
    pub frames: Vec<EncryptedFrame>,
}

impl RelayCommit {
    /// Rotate the frame list so the next hop finds its frame in front,
    /// refilling our slot with randomness.
    pub fn rotate<R: Rng + CryptoRng>(&self, rng: &mut R) -> RelayCommit {
        let mut frames = self.frames.clone();
        frames.rotate_left(1);
        if let Some(last) = frames.last_mut() {
            *last = EncryptedFrame::random(rng);
        }
        RelayCommit { frames }
    }
}

fn b_frame(input: &[u8]) -> IResult<&[u8], EncryptedFrame> {
    let (input, raw) = bbytes_exact(FRAME_SIZE)(input)?;
    let (_, frame) = EncryptedFrame::from_bytes(raw)?;
    Ok((input, frame))
}

impl FromBytes for RelayCommit {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&b"d"[..])(input)?;
        let (input, _) = bkey(b"a")(input)?;
        let (input, _) = verify(bbytes_exact(1), |verb: &[u8]| verb == b"c")(input)?;
        let (input, _) = bkey(b"c")(input)?;
        let (input, _) = tag(&b"l"[..])(input)?;
        let (input, frames) = count(b_frame, NUM_FRAMES)(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        let (input, _) = bkey(b"v")(input)?;
        let (input, _version) = verify(bint, |version| *version == PROTO_VERSION)(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        Ok((input, RelayCommit { frames }))
    }
}

impl ToBytes for RelayCommit {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_cond!(self.frames.len() != NUM_FRAMES, |buf| gen_error(buf, 0)) >>
            gen_slice!(b"d") >>
            gen_slice!(b"1:a1:c") >>
            gen_slice!(b"1:c") >>
            gen_slice!(b"l") >>
            gen_many_ref!(&self.frames, |buf, frame: &EncryptedFrame| {
                let mut raw = [0; FRAME_SIZE];
                let (_, size) = frame.to_bytes((&mut raw, 0))?;
                gen_bbytes(buf, &raw[..size])
            }) >>
            gen_slice!(b"e") >>
            gen_slice!(b"1:v") >>
            gen_call!(gen_bint, PROTO_VERSION) >>
            gen_slice!(b"e")
        )
    }
}

/** Tunnel data flowing away from the path owner.

Serialized keys: `a` = `u`, `p` path id, `v` version, `x` ciphertext, `y`
tunnel nonce.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RelayUpstream {
    pub path_id: PathId,
    pub payload: Vec<u8>,
    pub nonce: TunnelNonce,
}

/// Tunnel data flowing towards the path owner; same layout as
/// `RelayUpstream` under verb `d`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RelayDownstream {
    pub path_id: PathId,
    pub payload: Vec<u8>,
    pub nonce: TunnelNonce,
}

macro_rules! relay_data_codec {
    ($name:ident, $verb:expr) => {
        impl FromBytes for $name {
            fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
                let (input, _) = tag(&b"d"[..])(input)?;
                let (input, _) = bkey(b"a")(input)?;
                let (input, _) = verify(bbytes_exact(1), |verb: &[u8]| verb == $verb)(input)?;
                let (input, _) = bkey(b"p")(input)?;
                let (input, path_id) = b_path_id(input)?;
                let (input, _) = bkey(b"v")(input)?;
                let (input, _version) = verify(bint, |version| *version == PROTO_VERSION)(input)?;
                let (input, _) = bkey(b"x")(input)?;
                let (input, payload) = bbytes(input)?;
                let (input, _) = bkey(b"y")(input)?;
                let (input, nonce) = b_tunnel_nonce(input)?;
                let (input, _) = tag(&b"e"[..])(input)?;
                Ok((
                    input,
                    $name {
                        path_id,
                        payload: payload.to_vec(),
                        nonce,
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
                    gen_slice!(b"1:a1:") >>
                    gen_slice!($verb) >>
                    gen_slice!(b"1:p") >>
                    gen_call!(gen_bbytes, self.path_id.as_bytes()) >>
                    gen_slice!(b"1:v") >>
                    gen_call!(gen_bint, PROTO_VERSION) >>
                    gen_slice!(b"1:x") >>
                    gen_call!(gen_bbytes, self.payload.as_slice()) >>
                    gen_slice!(b"1:y") >>
                    gen_call!(gen_bbytes, self.nonce.as_bytes()) >>
                    gen_slice!(b"e") >>
                    gen_len_limit(MAX_LINK_MSG_SIZE)
                )
            }
        }
    };
}

relay_data_codec!(RelayUpstream, b"u");
relay_data_codec!(RelayDownstream, b"d");

/** DHT messages sent directly over a link session, outside any path.

Serialized keys: `a` = `m`, `m` list of DHT messages, `v` version.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DhtImmediate {
    pub msgs: Vec<DhtMessage>,
}

impl FromBytes for DhtImmediate {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&b"d"[..])(input)?;
        let (input, _) = bkey(b"a")(input)?;
        let (input, _) = verify(bbytes_exact(1), |verb: &[u8]| verb == b"m")(input)?;
        let (input, _) = bkey(b"m")(input)?;
        let (input, _) = tag(&b"l"[..])(input)?;
        let (input, msgs) = nom::multi::many0(DhtMessage::from_bytes)(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        let (input, _) = bkey(b"v")(input)?;
        let (input, _version) = verify(bint, |version| *version == PROTO_VERSION)(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        Ok((input, DhtImmediate { msgs }))
    }
}

impl ToBytes for DhtImmediate {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_slice!(b"1:a1:m") >>
            gen_slice!(b"1:m") >>
            gen_slice!(b"l") >>
            gen_many_ref!(&self.msgs, |buf, msg| DhtMessage::to_bytes(msg, buf)) >>
            gen_slice!(b"e") >>
            gen_slice!(b"1:v") >>
            gen_call!(gen_bint, PROTO_VERSION) >>
            gen_slice!(b"e") >>
            gen_len_limit(MAX_LINK_MSG_SIZE)
        )
    }
}

/// Any link-layer message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LinkMessage {
    RelayCommit(RelayCommit),
    RelayUpstream(RelayUpstream),
    RelayDownstream(RelayDownstream),
    DhtImmediate(DhtImmediate),
}

impl FromBytes for LinkMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        alt((
            map(RelayCommit::from_bytes, LinkMessage::RelayCommit),
            map(RelayUpstream::from_bytes, LinkMessage::RelayUpstream),
            map(RelayDownstream::from_bytes, LinkMessage::RelayDownstream),
            map(DhtImmediate::from_bytes, LinkMessage::DhtImmediate),
        ))(input)
    }
}

impl ToBytes for LinkMessage {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        match self {
            LinkMessage::RelayCommit(p) => p.to_bytes(buf),
            LinkMessage::RelayUpstream(p) => p.to_bytes(buf),
            LinkMessage::RelayDownstream(p) => p.to_bytes(buf),
            LinkMessage::DhtImmediate(p) => p.to_bytes(buf),
        }
    }
}
