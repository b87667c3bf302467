/*! RouterContact, the signed and expiring descriptor every router gossips
about itself.

Serialized form is a bencoded dict:

Key | Content
--- | -------
`a` | list of advertised [`AddressInfo`](./struct.AddressInfo.html)s
`e` | exit flag, present only when the router egresses traffic
`i` | network id tag, up to 8 bytes
`k` | identity Ed25519 public key, 32 bytes
`n` | nickname, present only when non-empty, up to 32 bytes
`p` | onion X25519 public key, 32 bytes
`t` | last updated, ms since the unix epoch
`v` | protocol version
`z` | Ed25519 signature over this dict with `z` zeroed, 64 bytes
*/

use std::net::IpAddr;
use std::time::Duration;

use nom::bytes::complete::tag;
use nom::combinator::{map_opt, opt, verify};
use nom::multi::many0;
use nom::sequence::preceded;
use nom::IResult;

use shroud_binary_io::*;
use shroud_crypto::{
    PublicKey, RouterId, Signature, Signer, SigningKey, Verifier, SIGNATURE_LENGTH,
};

use crate::errors::ContactError;
use crate::{b_pubkey, b_router_id, b_signature, zero_signature, PROTO_VERSION};

/// Maximum size of the network id tag.
pub const NETID_SIZE: usize = 8;

/// Maximum size of a router nickname.
pub const NICKNAME_SIZE: usize = 32;

/// Upper bound of an encoded `RouterContact`.
pub const MAX_CONTACT_SIZE: usize = 1024;

/// Network id tag of the production overlay.
pub const DEFAULT_NET_ID: &[u8] = b"shroud";

/// How long a contact stays valid after its `last_updated` stamp.
pub const CONTACT_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/** Transport-layer reachability record inside a `RouterContact`.

Serialized form is a bencoded dict with keys `e` (per-address transport
public key), `f` (address family, `4` or `6`), `i` (textual IP address) and
`p` (port).
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddressInfo {
    /// Static X25519 key the link transport handshake is pinned to.
    pub key: PublicKey,
    /// IP address of the endpoint.
    pub ip: IpAddr,
    /// Port of the endpoint.
    pub port: u16,
}

impl AddressInfo {
    fn family(&self) -> u64 {
        if self.ip.is_ipv4() {
            4
        } else {
            6
        }
    }
}

impl FromBytes for AddressInfo {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&b"d"[..])(input)?;
        let (input, _) = bkey(b"e")(input)?;
        let (input, key) = b_pubkey(input)?;
        let (input, _) = bkey(b"f")(input)?;
        let (input, family) = verify(bint, |family| *family == 4 || *family == 6)(input)?;
        let (input, _) = bkey(b"i")(input)?;
        let (input, ip) = map_opt(bbytes, |bytes: &[u8]| {
            std::str::from_utf8(bytes).ok()?.parse().ok()
        })(input)?;
        let (input, _) = bkey(b"p")(input)?;
        let (input, port) = verify(bint, |port| *port > 0 && *port <= u64::from(u16::MAX))(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;

        let info = AddressInfo {
            key,
            ip,
            port: port as u16,
        };
        if info.family() != family {
            return Err(nom::Err::Error(nom::error::Error::new(
                input,
                nom::error::ErrorKind::Verify,
            )));
        }
        Ok((input, info))
    }
}

impl ToBytes for AddressInfo {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        let ip = self.ip.to_string();
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_slice!(b"1:e") >>
            gen_call!(gen_bbytes, self.key.as_bytes()) >>
            gen_slice!(b"1:f") >>
            gen_call!(gen_bint, self.family()) >>
            gen_slice!(b"1:i") >>
            gen_call!(gen_bbytes, ip.as_bytes()) >>
            gen_slice!(b"1:p") >>
            gen_call!(gen_bint, u64::from(self.port)) >>
            gen_slice!(b"e")
        )
    }
}

/** Signed advertisement of a peer's identity, onion key and reachable
addresses.

A contact is "public" if it advertises at least one address. It expires
[`CONTACT_LIFETIME`](./constant.CONTACT_LIFETIME.html) after its
`last_updated` stamp.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RouterContact {
    /// Advertised addresses. Empty for clients.
    pub addrs: Vec<AddressInfo>,
    /// Whether the router egresses traffic to the wider internet.
    pub exit: bool,
    /// Overlay network tag. Contacts from other overlays are rejected.
    pub netid: Vec<u8>,
    /// Identity Ed25519 key, also the router's DHT key.
    pub identity: RouterId,
    /// Optional human readable name.
    pub nickname: String,
    /// X25519 key path build frames are encrypted to.
    pub onion_key: PublicKey,
    /// Unix ms timestamp of the last re-sign.
    pub last_updated: u64,
    /// Protocol version.
    pub version: u64,
    /// Ed25519 signature over the canonical encoding with `z` zeroed.
    pub signature: Signature,
}

impl RouterContact {
    /// Create an unsigned contact. `sign` must be called before the value
    /// is given to anyone.
    pub fn new(identity: RouterId, onion_key: PublicKey, netid: &[u8], last_updated: u64) -> Self {
        RouterContact {
            addrs: Vec::new(),
            exit: false,
            netid: netid.to_vec(),
            identity,
            nickname: String::new(),
            onion_key,
            last_updated,
            version: PROTO_VERSION,
            signature: zero_signature(),
        }
    }

    pub fn router_id(&self) -> RouterId {
        self.identity
    }

    /// A public router advertises at least one address.
    pub fn is_public(&self) -> bool {
        !self.addrs.is_empty()
    }

    pub fn is_exit(&self) -> bool {
        self.exit
    }

    pub fn expired(&self, now_ms: u64) -> bool {
        now_ms >= self.last_updated + CONTACT_LIFETIME.as_millis() as u64
    }

    /// Whether the contact expires within `jitter_ms` from now.
    pub fn expires_soon(&self, now_ms: u64, jitter_ms: u64) -> bool {
        self.expired(now_ms + jitter_ms)
    }

    pub fn other_is_newer(&self, other: &RouterContact) -> bool {
        self.last_updated < other.last_updated
    }

    /// Address record matching an IP, used to pin the transport key during
    /// session auth.
    pub fn addr_for_ip(&self, ip: IpAddr) -> Option<&AddressInfo> {
        self.addrs.iter().find(|addr| addr.ip == ip)
    }

    fn signing_encoding(&self) -> Result<Vec<u8>, ContactError> {
        let mut unsigned = self.clone();
        unsigned.signature = zero_signature();
        let mut buf = [0; MAX_CONTACT_SIZE];
        let (_, size) = unsigned
            .to_bytes((&mut buf, 0))
            .map_err(|_| ContactError::Encode)?;
        Ok(buf[..size].to_vec())
    }

    /// Stamp and sign the contact with the router's identity key.
    pub fn sign(&mut self, key: &SigningKey) -> Result<(), ContactError> {
        self.identity = RouterId::from(key.verifying_key());
        let encoding = self.signing_encoding()?;
        self.signature = key.sign(&encoding);
        Ok(())
    }

    /** Check the contact against the local network id and clock.

    Passing means: the network id matches, `last_updated` is not in the
    future and the signature covers the canonical encoding. Expiry is a
    separate, cheaper check (`expired`).
    */
    pub fn verify(&self, netid: &[u8], now_ms: u64) -> Result<(), ContactError> {
        if self.netid != netid {
            return Err(ContactError::NetIdMismatch);
        }
        if self.last_updated > now_ms {
            return Err(ContactError::FutureTimestamp);
        }
        let key = self
            .identity
            .verifying_key()
            .map_err(|_| ContactError::BadSignature)?;
        let encoding = self.signing_encoding()?;
        key.verify(&encoding, &self.signature)
            .map_err(|_| ContactError::BadSignature)
    }
}

impl FromBytes for RouterContact {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&b"d"[..])(input)?;
        let (input, _) = bkey(b"a")(input)?;
        let (input, _) = tag(&b"l"[..])(input)?;
        let (input, addrs) = many0(AddressInfo::from_bytes)(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        let (input, exit) = bkey_int(b"e")(input)?;
        let (input, _) = bkey(b"i")(input)?;
        let (input, netid) = verify(bbytes, |bytes: &[u8]| {
            !bytes.is_empty() && bytes.len() <= NETID_SIZE
        })(input)?;
        let (input, _) = bkey(b"k")(input)?;
        let (input, identity) = b_router_id(input)?;
        let (input, nickname) = opt(preceded(
            bkey(b"n"),
            map_opt(
                verify(bbytes, |bytes: &[u8]| bytes.len() <= NICKNAME_SIZE),
                |bytes: &[u8]| String::from_utf8(bytes.to_vec()).ok(),
            ),
        ))(input)?;
        let (input, _) = bkey(b"p")(input)?;
        let (input, onion_key) = b_pubkey(input)?;
        let (input, _) = bkey(b"t")(input)?;
        let (input, last_updated) = bint(input)?;
        let (input, _) = bkey(b"v")(input)?;
        let (input, version) = bint(input)?;
        let (input, _) = bkey(b"z")(input)?;
        let (input, signature) = b_signature(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;

        Ok((
            input,
            RouterContact {
                addrs,
                exit: exit.map_or(false, |flag| flag != 0),
                netid: netid.to_vec(),
                identity,
                nickname: nickname.unwrap_or_default(),
                onion_key,
                last_updated,
                version,
                signature,
            },
        ))
    }
}

impl ToBytes for RouterContact {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_cond!(
                self.netid.is_empty() || self.netid.len() > NETID_SIZE ||
                    self.nickname.len() > NICKNAME_SIZE,
                |buf| gen_error(buf, 0)
            ) >>
            gen_slice!(b"d") >>
            gen_slice!(b"1:a") >>
            gen_slice!(b"l") >>
            gen_many_ref!(&self.addrs, |buf, addr| AddressInfo::to_bytes(addr, buf)) >>
            gen_slice!(b"e") >>
            gen_cond!(self.exit, do_gen!(
                gen_slice!(b"1:e") >> gen_call!(gen_bint, 1)
            )) >>
            gen_slice!(b"1:i") >>
            gen_call!(gen_bbytes, self.netid.as_slice()) >>
            gen_slice!(b"1:k") >>
            gen_call!(gen_bbytes, self.identity.as_bytes()) >>
            gen_cond!(!self.nickname.is_empty(), do_gen!(
                gen_slice!(b"1:n") >> gen_call!(gen_bbytes, self.nickname.as_bytes())
            )) >>
            gen_slice!(b"1:p") >>
            gen_call!(gen_bbytes, self.onion_key.as_bytes()) >>
            gen_slice!(b"1:t") >>
            gen_call!(gen_bint, self.last_updated) >>
            gen_slice!(b"1:v") >>
            gen_call!(gen_bint, self.version) >>
            gen_slice!(b"1:z") >>
            gen_call!(gen_bbytes, &self.signature.to_bytes()) >>
            gen_slice!(b"e") >>
            gen_len_limit(MAX_CONTACT_SIZE)
        )
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    use rand::thread_rng;
    use shroud_crypto::SecretKey;

    pub fn signed_contact(rng: &mut rand::rngs::ThreadRng) -> (SigningKey, RouterContact) {
        let identity = SigningKey::generate(rng);
        let onion_key = SecretKey::generate(rng).public_key();
        let mut rc = RouterContact::new(
            RouterId::from(identity.verifying_key()),
            onion_key,
            DEFAULT_NET_ID,
            1_000_000,
        );
        rc.addrs.push(AddressInfo {
            key: SecretKey::generate(rng).public_key(),
            ip: "203.0.113.7".parse().unwrap(),
            port: 1090,
        });
        rc.sign(&identity).unwrap();
        (identity, rc)
    }

    encode_decode_test!(
        address_info_encode_decode,
        AddressInfo {
            key: SecretKey::generate(&mut thread_rng()).public_key(),
            ip: "2001:db8::1".parse().unwrap(),
            port: 443,
        }
    );

    #[test]
    fn contact_encode_decode() {
        let (_, rc) = signed_contact(&mut thread_rng());
        let mut buf = [0; MAX_CONTACT_SIZE];
        let (_, size) = rc.to_bytes((&mut buf, 0)).unwrap();
        let (rest, decoded) = RouterContact::from_bytes(&buf[..size]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, rc);
    }

    #[test]
    fn contact_optional_keys_encode_decode() {
        let mut rng = thread_rng();
        let (identity, mut rc) = signed_contact(&mut rng);
        rc.exit = true;
        rc.nickname = "edge-7".to_string();
        rc.sign(&identity).unwrap();

        let mut buf = [0; MAX_CONTACT_SIZE];
        let (_, size) = rc.to_bytes((&mut buf, 0)).unwrap();
        let (_, decoded) = RouterContact::from_bytes(&buf[..size]).unwrap();
        assert_eq!(decoded, rc);
        assert!(decoded.is_exit());
        decoded.verify(DEFAULT_NET_ID, 2_000_000).unwrap();
    }

    #[test]
    fn contact_verify() {
        let (_, rc) = signed_contact(&mut thread_rng());
        rc.verify(DEFAULT_NET_ID, 2_000_000).unwrap();
    }

    #[test]
    fn contact_verify_rejects_tampering() {
        let (_, mut rc) = signed_contact(&mut thread_rng());
        rc.last_updated += 1;
        assert_eq!(
            rc.verify(DEFAULT_NET_ID, 2_000_000),
            Err(ContactError::BadSignature)
        );
    }

    #[test]
    fn contact_verify_rejects_wrong_netid() {
        let (_, rc) = signed_contact(&mut thread_rng());
        assert_eq!(
            rc.verify(b"testnet", 2_000_000),
            Err(ContactError::NetIdMismatch)
        );
    }

    #[test]
    fn contact_verify_rejects_future_stamp() {
        let (_, rc) = signed_contact(&mut thread_rng());
        assert_eq!(
            rc.verify(DEFAULT_NET_ID, 999_999),
            Err(ContactError::FutureTimestamp)
        );
    }

    #[test]
    fn contact_expiry() {
        let (_, rc) = signed_contact(&mut thread_rng());
        let lifetime = CONTACT_LIFETIME.as_millis() as u64;
        assert!(!rc.expired(1_000_000 + lifetime - 1));
        assert!(rc.expired(1_000_000 + lifetime));
        assert!(rc.expires_soon(1_000_000 + lifetime - 10, 10));
    }

    #[test]
    fn contact_without_addresses_is_not_public() {
        let mut rng = thread_rng();
        let identity = SigningKey::generate(&mut rng);
        let mut rc = RouterContact::new(
            RouterId::from(identity.verifying_key()),
            SecretKey::generate(&mut rng).public_key(),
            DEFAULT_NET_ID,
            0,
        );
        rc.sign(&identity).unwrap();
        assert!(!rc.is_public());
        rc.verify(DEFAULT_NET_ID, 0).unwrap();
    }
}
