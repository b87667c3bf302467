/*! DHT messages.

Every message is a dict whose `A` entry carries the verb letter:

Verb | Message
---- | -------
`R`  | `FindRouter` — look up a router contact by id
`S`  | `GotRouter` — reply carrying zero or more contacts
`F`  | `FindIntro` — look up a hidden-service introset
`G`  | `GotIntro` — reply carrying the introset when known
`I`  | `PublishIntro` — store an introset under its service address
*/

use nom::branch::alt;
use nom::bytes::complete::tag;
use nom::combinator::{map, opt, verify};
use nom::multi::many0;
use nom::sequence::preceded;
use nom::IResult;

use shroud_binary_io::*;
use shroud_crypto::RouterId;

use crate::intro::{IntroSet, ServiceAddress, MAX_INTROSET_SIZE};
use crate::rc::{RouterContact, MAX_CONTACT_SIZE};
use crate::{b_router_id, b_version, PROTO_VERSION};

/// Upper bound of an encoded DHT message. Has to fit a `GotRouter` carrying
/// a handful of full contacts.
pub const MAX_DHT_MSG_SIZE: usize = 8 * MAX_CONTACT_SIZE + MAX_INTROSET_SIZE;

/** Iterative or exploritory router lookup.

Serialized keys: `A` = `R`, `E` exploritory flag, `I` iterative flag, `K`
target router id, `T` transaction id, `V` version.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FindRouter {
    /// Ask the peer for routers *near* the key instead of the key itself.
    pub exploritory: bool,
    /// The requester drives the lookup itself; the peer must not recurse.
    pub iterative: bool,
    pub key: RouterId,
    pub tx_id: u64,
}

impl FromBytes for FindRouter {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&b"d"[..])(input)?;
        let (input, _) = bkey(b"A")(input)?;
        let (input, _) = verify(bbytes_exact(1), |verb: &[u8]| verb == b"R")(input)?;
        let (input, _) = bkey(b"E")(input)?;
        let (input, exploritory) = bint(input)?;
        let (input, _) = bkey(b"I")(input)?;
        let (input, iterative) = bint(input)?;
        let (input, _) = bkey(b"K")(input)?;
        let (input, key) = b_router_id(input)?;
        let (input, _) = bkey(b"T")(input)?;
        let (input, tx_id) = bint(input)?;
        let (input, _version) = b_version(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        Ok((
            input,
            FindRouter {
                exploritory: exploritory != 0,
                iterative: iterative != 0,
                key,
                tx_id,
            },
        ))
    }
}

impl ToBytes for FindRouter {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_slice!(b"1:A1:R") >>
            gen_slice!(b"1:E") >>
            gen_call!(gen_bint, u64::from(self.exploritory)) >>
            gen_slice!(b"1:I") >>
            gen_call!(gen_bint, u64::from(self.iterative)) >>
            gen_slice!(b"1:K") >>
            gen_call!(gen_bbytes, self.key.as_bytes()) >>
            gen_slice!(b"1:T") >>
            gen_call!(gen_bint, self.tx_id) >>
            gen_slice!(b"1:V") >>
            gen_call!(gen_bint, PROTO_VERSION) >>
            gen_slice!(b"e")
        )
    }
}

/** Reply to `FindRouter`.

Serialized keys: `A` = `S`, `K` looked-up key, `N` more-follows flag, `R`
list of contacts, `T` transaction id, `V` version.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GotRouter {
    pub key: RouterId,
    /// Set when the sender will follow up with further replies.
    pub more: bool,
    pub contacts: Vec<RouterContact>,
    pub tx_id: u64,
}

impl FromBytes for GotRouter {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&b"d"[..])(input)?;
        let (input, _) = bkey(b"A")(input)?;
        let (input, _) = verify(bbytes_exact(1), |verb: &[u8]| verb == b"S")(input)?;
        let (input, _) = bkey(b"K")(input)?;
        let (input, key) = b_router_id(input)?;
        let (input, _) = bkey(b"N")(input)?;
        let (input, more) = bint(input)?;
        let (input, _) = bkey(b"R")(input)?;
        let (input, _) = tag(&b"l"[..])(input)?;
        let (input, contacts) = many0(RouterContact::from_bytes)(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        let (input, _) = bkey(b"T")(input)?;
        let (input, tx_id) = bint(input)?;
        let (input, _version) = b_version(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        Ok((
            input,
            GotRouter {
                key,
                more: more != 0,
                contacts,
                tx_id,
            },
        ))
    }
}

impl ToBytes for GotRouter {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_slice!(b"1:A1:S") >>
            gen_slice!(b"1:K") >>
            gen_call!(gen_bbytes, self.key.as_bytes()) >>
            gen_slice!(b"1:N") >>
            gen_call!(gen_bint, u64::from(self.more)) >>
            gen_slice!(b"1:R") >>
            gen_slice!(b"l") >>
            gen_many_ref!(&self.contacts, |buf, rc| RouterContact::to_bytes(rc, buf)) >>
            gen_slice!(b"e") >>
            gen_slice!(b"1:T") >>
            gen_call!(gen_bint, self.tx_id) >>
            gen_slice!(b"1:V") >>
            gen_call!(gen_bint, PROTO_VERSION) >>
            gen_slice!(b"e")
        )
    }
}

/** Hidden-service introset lookup.

Serialized keys: `A` = `F`, `N` service address, `T` transaction id, `V`
version.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct FindIntro {
    pub address: ServiceAddress,
    pub tx_id: u64,
}

impl FromBytes for FindIntro {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&b"d"[..])(input)?;
        let (input, _) = bkey(b"A")(input)?;
        let (input, _) = verify(bbytes_exact(1), |verb: &[u8]| verb == b"F")(input)?;
        let (input, _) = bkey(b"N")(input)?;
        let (input, address) = b_router_id(input)?;
        let (input, _) = bkey(b"T")(input)?;
        let (input, tx_id) = bint(input)?;
        let (input, _version) = b_version(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        Ok((input, FindIntro { address, tx_id }))
    }
}

impl ToBytes for FindIntro {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_slice!(b"1:A1:F") >>
            gen_slice!(b"1:N") >>
            gen_call!(gen_bbytes, self.address.as_bytes()) >>
            gen_slice!(b"1:T") >>
            gen_call!(gen_bint, self.tx_id) >>
            gen_slice!(b"1:V") >>
            gen_call!(gen_bint, PROTO_VERSION) >>
            gen_slice!(b"e")
        )
    }
}

/** Reply to `FindIntro`; the `I` entry is absent when the introset is not
known.

Serialized keys: `A` = `G`, `I` introset, `T` transaction id, `V` version.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GotIntro {
    pub intro_set: Option<IntroSet>,
    pub tx_id: u64,
}

impl FromBytes for GotIntro {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&b"d"[..])(input)?;
        let (input, _) = bkey(b"A")(input)?;
        let (input, _) = verify(bbytes_exact(1), |verb: &[u8]| verb == b"G")(input)?;
        let (input, intro_set) = opt(preceded(bkey(b"I"), IntroSet::from_bytes))(input)?;
        let (input, _) = bkey(b"T")(input)?;
        let (input, tx_id) = bint(input)?;
        let (input, _version) = b_version(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        Ok((input, GotIntro { intro_set, tx_id }))
    }
}

impl ToBytes for GotIntro {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_slice!(b"1:A1:G") >>
            gen_cond!(self.intro_set.is_some(), do_gen!(
                gen_slice!(b"1:I") >>
                gen_call!(|buf, intro_set: &Option<IntroSet>|
                    intro_set.as_ref().unwrap().to_bytes(buf), &self.intro_set)
            )) >>
            gen_slice!(b"1:T") >>
            gen_call!(gen_bint, self.tx_id) >>
            gen_slice!(b"1:V") >>
            gen_call!(gen_bint, PROTO_VERSION) >>
            gen_slice!(b"e")
        )
    }
}

/** Store an introset under its service address.

Serialized keys: `A` = `I`, `I` introset, `T` transaction id, `V` version.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PublishIntro {
    pub intro_set: IntroSet,
    pub tx_id: u64,
}

impl FromBytes for PublishIntro {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&b"d"[..])(input)?;
        let (input, _) = bkey(b"A")(input)?;
        let (input, _) = verify(bbytes_exact(1), |verb: &[u8]| verb == b"I")(input)?;
        let (input, _) = bkey(b"I")(input)?;
        let (input, intro_set) = IntroSet::from_bytes(input)?;
        let (input, _) = bkey(b"T")(input)?;
        let (input, tx_id) = bint(input)?;
        let (input, _version) = b_version(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        Ok((input, PublishIntro { intro_set, tx_id }))
    }
}

impl ToBytes for PublishIntro {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_slice!(b"1:A1:I") >>
            gen_slice!(b"1:I") >>
            gen_call!(|buf, intro_set: &IntroSet| intro_set.to_bytes(buf), &self.intro_set) >>
            gen_slice!(b"1:T") >>
            gen_call!(gen_bint, self.tx_id) >>
            gen_slice!(b"1:V") >>
            gen_call!(gen_bint, PROTO_VERSION) >>
            gen_slice!(b"e")
        )
    }
}

/// Any DHT message.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DhtMessage {
    FindRouter(FindRouter),
    GotRouter(GotRouter),
    FindIntro(FindIntro),
    GotIntro(GotIntro),
    PublishIntro(PublishIntro),
}

impl FromBytes for DhtMessage {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        alt((
            map(FindRouter::from_bytes, DhtMessage::FindRouter),
            map(GotRouter::from_bytes, DhtMessage::GotRouter),
            map(FindIntro::from_bytes, DhtMessage::FindIntro),
            map(GotIntro::from_bytes, DhtMessage::GotIntro),
            map(PublishIntro::from_bytes, DhtMessage::PublishIntro),
        ))(input)
    }
}

impl ToBytes for DhtMessage {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        match self {
            DhtMessage::FindRouter(p) => p.to_bytes(buf),
            DhtMessage::GotRouter(p) => p.to_bytes(buf),
            DhtMessage::FindIntro(p) => p.to_bytes(buf),
            DhtMessage::GotIntro(p) => p.to_bytes(buf),
            DhtMessage::PublishIntro(p) => p.to_bytes(buf),
        }
    }
}

impl DhtMessage {
    /// Transaction id, used to pair replies with pending lookups.
    pub fn tx_id(&self) -> u64 {
        match self {
            DhtMessage::FindRouter(p) => p.tx_id,
            DhtMessage::GotRouter(p) => p.tx_id,
            DhtMessage::FindIntro(p) => p.tx_id,
            DhtMessage::GotIntro(p) => p.tx_id,
            DhtMessage::PublishIntro(p) => p.tx_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use rand::thread_rng;
    use shroud_crypto::SigningKey;

    use crate::intro::tests::signed_introset;
    use crate::rc::tests::signed_contact;

    fn random_id(rng: &mut rand::rngs::ThreadRng) -> RouterId {
        RouterId::from(SigningKey::generate(rng).verifying_key())
    }

    encode_decode_test!(
        find_router_encode_decode,
        DhtMessage::FindRouter(FindRouter {
            exploritory: false,
            iterative: true,
            key: random_id(&mut thread_rng()),
            tx_id: 42,
        })
    );

    encode_decode_test!(
        find_intro_encode_decode,
        DhtMessage::FindIntro(FindIntro {
            address: random_id(&mut thread_rng()),
            tx_id: 7,
        })
    );

    encode_decode_test!(
        got_intro_empty_encode_decode,
        DhtMessage::GotIntro(GotIntro {
            intro_set: None,
            tx_id: 3,
        })
    );

    #[test]
    fn got_router_encode_decode() {
        let mut rng = thread_rng();
        let (_, rc) = signed_contact(&mut rng);
        let msg = DhtMessage::GotRouter(GotRouter {
            key: rc.router_id(),
            more: false,
            contacts: vec![rc],
            tx_id: 42,
        });
        let mut buf = [0; MAX_DHT_MSG_SIZE];
        let (_, size) = msg.to_bytes((&mut buf, 0)).unwrap();
        let (rest, decoded) = DhtMessage::from_bytes(&buf[..size]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, msg);
    }

    #[test]
    fn got_router_empty_encode_decode() {
        let mut rng = thread_rng();
        let msg = DhtMessage::GotRouter(GotRouter {
            key: random_id(&mut rng),
            more: true,
            contacts: Vec::new(),
            tx_id: 1,
        });
        let mut buf = [0; MAX_DHT_MSG_SIZE];
        let (_, size) = msg.to_bytes((&mut buf, 0)).unwrap();
        let (_, decoded) = DhtMessage::from_bytes(&buf[..size]).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn publish_intro_encode_decode() {
        let mut rng = thread_rng();
        let (_, intro_set) = signed_introset(&mut rng);
        let msg = DhtMessage::PublishIntro(PublishIntro {
            intro_set: intro_set.clone(),
            tx_id: 9,
        });
        let mut buf = [0; MAX_DHT_MSG_SIZE];
        let (_, size) = msg.to_bytes((&mut buf, 0)).unwrap();
        let (_, decoded) = DhtMessage::from_bytes(&buf[..size]).unwrap();
        assert_eq!(decoded, msg);

        let got = DhtMessage::GotIntro(GotIntro {
            intro_set: Some(intro_set),
            tx_id: 9,
        });
        let (_, size) = got.to_bytes((&mut buf, 0)).unwrap();
        let (_, decoded) = DhtMessage::from_bytes(&buf[..size]).unwrap();
        assert_eq!(decoded, got);
    }

    #[test]
    fn find_router_rejects_bad_version() {
        let mut rng = thread_rng();
        let msg = FindRouter {
            exploritory: false,
            iterative: false,
            key: random_id(&mut rng),
            tx_id: 4,
        };
        let mut buf = [0; 256];
        let (_, size) = msg.to_bytes((&mut buf, 0)).unwrap();
        let mut bad = buf[..size].to_vec();
        // flip the version integer
        let pos = bad.windows(4).position(|w| w == b"1:Vi").unwrap();
        bad[pos + 4] = b'9';
        assert!(FindRouter::from_bytes(&bad).is_err());
    }
}
