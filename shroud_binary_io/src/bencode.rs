/*!
Bencode primitives.

All shroud wire formats are bencoded dicts with single-letter keys. The
encoders always emit keys in ascending byte order, which makes the encoding
canonical; signatures are computed over that canonical form.
*/

use cookie_factory::GenError;
use nom::bytes::complete::{tag, take, take_while1};
use nom::combinator::{map_opt, opt, verify};
use nom::IResult;

/// Parse a bencoded non-negative integer `i<digits>e`.
pub fn bint(input: &[u8]) -> IResult<&[u8], u64> {
    let (input, _) = tag(&b"i"[..])(input)?;
    let (input, value) = map_opt(take_while1(|c: u8| c.is_ascii_digit()), |digits: &[u8]| {
        std::str::from_utf8(digits).ok()?.parse().ok()
    })(input)?;
    let (input, _) = tag(&b"e"[..])(input)?;
    Ok((input, value))
}

/// Parse a bencoded byte string `<len>:<bytes>`.
pub fn bbytes(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (input, len) = map_opt(take_while1(|c: u8| c.is_ascii_digit()), |digits: &[u8]| {
        std::str::from_utf8(digits).ok()?.parse::<u64>().ok()
    })(input)?;
    let (input, _) = tag(&b":"[..])(input)?;
    take(len)(input)
}

/// Parse a bencoded byte string of exactly `len` bytes.
pub fn bbytes_exact(len: usize) -> impl Fn(&[u8]) -> IResult<&[u8], &[u8]> {
    move |input| verify(bbytes, |bytes: &[u8]| bytes.len() == len)(input)
}

/// Parse a single-letter dict key, e.g. `bkey(b"a")` matches `1:a`.
pub fn bkey(key: &'static [u8]) -> impl Fn(&[u8]) -> IResult<&[u8], &[u8]> {
    move |input| {
        let (input, _) = tag(format!("{}:", key.len()).as_bytes())(input)?;
        tag(key)(input)
    }
}

/// Parse an optional `key → integer` dict entry.
pub fn bkey_int(key: &'static [u8]) -> impl Fn(&[u8]) -> IResult<&[u8], Option<u64>> {
    move |input| {
        opt(|input| {
            let (input, _) = bkey(key)(input)?;
            bint(input)
        })(input)
    }
}

/// Dict opening marker.
pub fn bdict_start(input: &[u8]) -> IResult<&[u8], ()> {
    let (input, _) = tag(&b"d"[..])(input)?;
    Ok((input, ()))
}

/// List opening marker.
pub fn blist_start(input: &[u8]) -> IResult<&[u8], ()> {
    let (input, _) = tag(&b"l"[..])(input)?;
    Ok((input, ()))
}

/// Dict/list closing marker.
pub fn bend(input: &[u8]) -> IResult<&[u8], ()> {
    let (input, _) = tag(&b"e"[..])(input)?;
    Ok((input, ()))
}

fn gen_raw<'a>(
    buf: (&'a mut [u8], usize),
    bytes: &[u8],
) -> Result<(&'a mut [u8], usize), GenError> {
    let (out, offset) = buf;
    let end = offset
        .checked_add(bytes.len())
        .ok_or(GenError::InvalidOffset)?;
    if end > out.len() {
        return Err(GenError::BufferTooSmall(end));
    }
    out[offset..end].copy_from_slice(bytes);
    Ok((out, end))
}

/// Write a bencoded integer.
pub fn gen_bint(buf: (&mut [u8], usize), value: u64) -> Result<(&mut [u8], usize), GenError> {
    gen_raw(buf, format!("i{}e", value).as_bytes())
}

/// Write a bencoded byte string.
pub fn gen_bbytes<'a>(
    buf: (&'a mut [u8], usize),
    bytes: &[u8],
) -> Result<(&'a mut [u8], usize), GenError> {
    let buf = gen_raw(buf, format!("{}:", bytes.len()).as_bytes())?;
    gen_raw(buf, bytes)
}

/// Write a single-letter dict key.
pub fn gen_bkey<'a>(
    buf: (&'a mut [u8], usize),
    key: &[u8],
) -> Result<(&'a mut [u8], usize), GenError> {
    gen_bbytes(buf, key)
}

/// Write a dict opening marker.
pub fn gen_bdict_start(buf: (&mut [u8], usize)) -> Result<(&mut [u8], usize), GenError> {
    gen_raw(buf, b"d")
}

/// Write a list opening marker.
pub fn gen_blist_start(buf: (&mut [u8], usize)) -> Result<(&mut [u8], usize), GenError> {
    gen_raw(buf, b"l")
}

/// Write a dict/list closing marker.
pub fn gen_bend(buf: (&mut [u8], usize)) -> Result<(&mut [u8], usize), GenError> {
    gen_raw(buf, b"e")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bint_parse() {
        let (rest, value) = bint(b"i42e").unwrap();
        assert!(rest.is_empty());
        assert_eq!(value, 42);
    }

    #[test]
    fn bint_rejects_garbage() {
        assert!(bint(b"ie").is_err());
        assert!(bint(b"i-1e").is_err());
        assert!(bint(b"42e").is_err());
        assert!(bint(b"i99999999999999999999999e").is_err());
    }

    #[test]
    fn bbytes_parse() {
        let (rest, bytes) = bbytes(b"5:hello world").unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(rest, b" world");
    }

    #[test]
    fn bbytes_rejects_truncated() {
        assert!(bbytes(b"10:short").is_err());
    }

    #[test]
    fn bbytes_exact_checks_length() {
        assert!(bbytes_exact(4)(b"4:abcd").is_ok());
        assert!(bbytes_exact(4)(b"3:abc").is_err());
    }

    #[test]
    fn bkey_matches_letter() {
        let (rest, key) = bkey(b"a")(b"1:a1:b").unwrap();
        assert_eq!(key, b"a");
        assert_eq!(rest, b"1:b");
        assert!(bkey(b"a")(b"1:b").is_err());
    }

    #[test]
    fn bkey_int_optional() {
        let (_, found) = bkey_int(b"e")(b"1:ei1e").unwrap();
        assert_eq!(found, Some(1));
        let (rest, missing) = bkey_int(b"e")(b"1:ii0e").unwrap();
        assert_eq!(missing, None);
        assert_eq!(rest, b"1:ii0e");
    }

    #[test]
    fn int_round_trip() {
        let mut buf = [0; 32];
        let (_, size) = gen_bint((&mut buf, 0), 123456).unwrap();
        let (rest, value) = bint(&buf[..size]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(value, 123456);
    }

    #[test]
    fn bytes_round_trip() {
        let mut buf = [0; 32];
        let (_, size) = gen_bbytes((&mut buf, 0), b"payload").unwrap();
        let (rest, bytes) = bbytes(&buf[..size]).unwrap();
        assert!(rest.is_empty());
        assert_eq!(bytes, b"payload");
    }

    #[test]
    fn dict_markers_round_trip() {
        let mut buf = [0; 8];
        let buf1 = gen_bdict_start((&mut buf, 0)).unwrap();
        let (_, size) = gen_bend(buf1).unwrap();
        assert_eq!(&buf[..size], b"de");
    }

    #[test]
    fn gen_into_small_buffer_fails() {
        let mut buf = [0; 4];
        assert!(gen_bbytes((&mut buf, 0), b"too large").is_err());
    }
}
