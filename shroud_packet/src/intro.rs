/*! Hidden-service rendezvous descriptors.

An `IntroSet` is published into the DHT under the service address and tells
clients which routers currently host introduction paths for the service.
*/

use std::time::Duration;

use nom::bytes::complete::tag;
use nom::multi::many0;
use nom::IResult;

use shroud_binary_io::*;
use shroud_crypto::{PathId, RouterId, Signature, Signer, SigningKey, Verifier};

use crate::errors::ContactError;
use crate::{b_path_id, b_router_id, b_signature, zero_signature, PROTO_VERSION};

/// Hidden services are addressed by their Ed25519 public key, living in the
/// same key space as router ids.
pub type ServiceAddress = RouterId;

/// Upper bound of an encoded `IntroSet`.
pub const MAX_INTROSET_SIZE: usize = 4096;

/// How long an introset stays fresh after its timestamp.
pub const INTROSET_LIFETIME: Duration = Duration::from_secs(10 * 60);

/** One introduction point: an endpoint router plus the path id to rendezvous
on, with latency and expiry hints.

Serialized keys: `k` router, `l` latency ms, `p` path id, `v` version,
`x` expiry stamp.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Introduction {
    pub router: RouterId,
    pub path_id: PathId,
    pub latency: u64,
    pub expires_at: u64,
}

impl FromBytes for Introduction {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&b"d"[..])(input)?;
        let (input, _) = bkey(b"k")(input)?;
        let (input, router) = b_router_id(input)?;
        let (input, _) = bkey(b"l")(input)?;
        let (input, latency) = bint(input)?;
        let (input, _) = bkey(b"p")(input)?;
        let (input, path_id) = b_path_id(input)?;
        let (input, _) = bkey(b"v")(input)?;
        let (input, _version) = bint(input)?;
        let (input, _) = bkey(b"x")(input)?;
        let (input, expires_at) = bint(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        Ok((
            input,
            Introduction {
                router,
                path_id,
                latency,
                expires_at,
            },
        ))
    }
}

impl ToBytes for Introduction {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_slice!(b"1:k") >>
            gen_call!(gen_bbytes, self.router.as_bytes()) >>
            gen_slice!(b"1:l") >>
            gen_call!(gen_bint, self.latency) >>
            gen_slice!(b"1:p") >>
            gen_call!(gen_bbytes, self.path_id.as_bytes()) >>
            gen_slice!(b"1:v") >>
            gen_call!(gen_bint, PROTO_VERSION) >>
            gen_slice!(b"1:x") >>
            gen_call!(gen_bint, self.expires_at) >>
            gen_slice!(b"e")
        )
    }
}

/** Signed set of introductions for one hidden service.

Serialized keys: `a` service address, `i` introduction list, `t` publish
stamp, `v` version, `z` signature with the same zeroed-`z` convention the
router contact uses.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IntroSet {
    pub address: ServiceAddress,
    pub intros: Vec<Introduction>,
    pub timestamp: u64,
    pub version: u64,
    pub signature: Signature,
}

impl IntroSet {
    pub fn new(address: ServiceAddress, intros: Vec<Introduction>, timestamp: u64) -> Self {
        IntroSet {
            address,
            intros,
            timestamp,
            version: PROTO_VERSION,
            signature: zero_signature(),
        }
    }

    fn signing_encoding(&self) -> Result<Vec<u8>, ContactError> {
        let mut unsigned = self.clone();
        unsigned.signature = zero_signature();
        let mut buf = [0; MAX_INTROSET_SIZE];
        let (_, size) = unsigned
            .to_bytes((&mut buf, 0))
            .map_err(|_| ContactError::Encode)?;
        Ok(buf[..size].to_vec())
    }

    /// Sign with the service identity key. The service address is forced to
    /// the signing key.
    pub fn sign(&mut self, key: &SigningKey) -> Result<(), ContactError> {
        self.address = RouterId::from(key.verifying_key());
        let encoding = self.signing_encoding()?;
        self.signature = key.sign(&encoding);
        Ok(())
    }

    pub fn verify(&self, now_ms: u64) -> Result<(), ContactError> {
        if self.timestamp > now_ms {
            return Err(ContactError::FutureTimestamp);
        }
        let key = self
            .address
            .verifying_key()
            .map_err(|_| ContactError::BadSignature)?;
        let encoding = self.signing_encoding()?;
        key.verify(&encoding, &self.signature)
            .map_err(|_| ContactError::BadSignature)
    }

    /// An introset is stale once its lifetime passed or every introduction
    /// inside it expired.
    pub fn expired(&self, now_ms: u64) -> bool {
        if now_ms >= self.timestamp + INTROSET_LIFETIME.as_millis() as u64 {
            return true;
        }
        self.intros.iter().all(|intro| now_ms >= intro.expires_at)
    }
}

impl FromBytes for IntroSet {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, _) = tag(&b"d"[..])(input)?;
        let (input, _) = bkey(b"a")(input)?;
        let (input, address) = b_router_id(input)?;
        let (input, _) = bkey(b"i")(input)?;
        let (input, _) = tag(&b"l"[..])(input)?;
        let (input, intros) = many0(Introduction::from_bytes)(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        let (input, _) = bkey(b"t")(input)?;
        let (input, timestamp) = bint(input)?;
        let (input, _) = bkey(b"v")(input)?;
        let (input, version) = bint(input)?;
        let (input, _) = bkey(b"z")(input)?;
        let (input, signature) = b_signature(input)?;
        let (input, _) = tag(&b"e"[..])(input)?;
        Ok((
            input,
            IntroSet {
                address,
                intros,
                timestamp,
                version,
                signature,
            },
        ))
    }
}

impl ToBytes for IntroSet {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError> {
        do_gen!(buf,
            gen_slice!(b"d") >>
            gen_slice!(b"1:a") >>
            gen_call!(gen_bbytes, self.address.as_bytes()) >>
            gen_slice!(b"1:i") >>
            gen_slice!(b"l") >>
            gen_many_ref!(&self.intros, |buf, intro| Introduction::to_bytes(intro, buf)) >>
            gen_slice!(b"e") >>
            gen_slice!(b"1:t") >>
            gen_call!(gen_bint, self.timestamp) >>
            gen_slice!(b"1:v") >>
            gen_call!(gen_bint, self.version) >>
            gen_slice!(b"1:z") >>
            gen_call!(gen_bbytes, &self.signature.to_bytes()) >>
            gen_slice!(b"e") >>
            gen_len_limit(MAX_INTROSET_SIZE)
        )
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    use rand::thread_rng;

    pub fn signed_introset(rng: &mut rand::rngs::ThreadRng) -> (SigningKey, IntroSet) {
        let service = SigningKey::generate(rng);
        let intro = Introduction {
            router: RouterId::from(SigningKey::generate(rng).verifying_key()),
            path_id: PathId::random(rng),
            latency: 120,
            expires_at: 1_500_000,
        };
        let mut intro_set = IntroSet::new(
            RouterId::from(service.verifying_key()),
            vec![intro],
            1_000_000,
        );
        intro_set.sign(&service).unwrap();
        (service, intro_set)
    }

    encode_decode_test!(
        introduction_encode_decode,
        Introduction {
            router: RouterId::from(SigningKey::generate(&mut thread_rng()).verifying_key()),
            path_id: PathId::random(&mut thread_rng()),
            latency: 55,
            expires_at: 777,
        }
    );

    #[test]
    fn intro_set_encode_decode() {
        let (_, intro_set) = signed_introset(&mut thread_rng());
        let mut buf = [0; MAX_INTROSET_SIZE];
        let (_, size) = intro_set.to_bytes((&mut buf, 0)).unwrap();
        let (rest, decoded) = IntroSet::from_bytes(&buf[..size]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(decoded, intro_set);
    }

    #[test]
    fn intro_set_verify() {
        let (_, intro_set) = signed_introset(&mut thread_rng());
        intro_set.verify(1_200_000).unwrap();
        assert_eq!(
            intro_set.verify(999_999),
            Err(ContactError::FutureTimestamp)
        );
    }

    #[test]
    fn intro_set_verify_rejects_tampering() {
        let (_, mut intro_set) = signed_introset(&mut thread_rng());
        intro_set.intros[0].latency += 1;
        assert_eq!(
            intro_set.verify(1_200_000),
            Err(ContactError::BadSignature)
        );
    }

    #[test]
    fn intro_set_expiry() {
        let (_, intro_set) = signed_introset(&mut thread_rng());
        assert!(!intro_set.expired(1_200_000));
        // all intros expired
        assert!(intro_set.expired(1_500_000));
        // lifetime passed
        let lifetime = INTROSET_LIFETIME.as_millis() as u64;
        assert!(intro_set.expired(1_000_000 + lifetime));
    }
}
