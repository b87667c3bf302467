/*!
Serialization and deserialization traits plus the bencode primitives the
shroud wire formats are built from.
*/

#![forbid(unsafe_code)]

mod bencode;
mod crypto;

pub use crate::bencode::*;

pub use cookie_factory::GenError;
pub use nom::IResult;

/// The trait provides a method to deserialize a struct from raw bytes.
pub trait FromBytes: Sized {
    fn from_bytes(input: &[u8]) -> IResult<&[u8], Self>;
}

/// The trait provides a method to serialize a struct into a `(buffer, offset)`
/// pair the way cookie_factory generators do.
pub trait ToBytes {
    fn to_bytes<'a>(&self, buf: (&'a mut [u8], usize)) -> Result<(&'a mut [u8], usize), GenError>;
}

/// Unconditionally fail serialization with the given error code. Useful in
/// `gen_cond!` guards.
pub fn gen_error(_buf: (&mut [u8], usize), code: u32) -> Result<(&mut [u8], usize), GenError> {
    Err(GenError::CustomError(code))
}

/// Fail serialization if more than `limit` bytes have been written so far.
pub fn gen_len_limit(buf: (&mut [u8], usize), limit: usize) -> Result<(&mut [u8], usize), GenError> {
    if buf.1 <= limit {
        Ok(buf)
    } else {
        Err(GenError::BufferTooSmall(buf.1))
    }
}

/// Encode a value into a fresh byte vector bounded by `max_size`.
pub fn encode_to_vec<T: ToBytes>(value: &T, max_size: usize) -> Result<Vec<u8>, GenError> {
    let mut buf = vec![0; max_size];
    let (_, size) = value.to_bytes((&mut buf, 0))?;
    buf.truncate(size);
    Ok(buf)
}

/** Test serializing and deserializing an object.

The object is encoded into a byte buffer, decoded back and both values are
compared for equality.
*/
#[macro_export]
macro_rules! encode_decode_test (
    ($test:ident, $value:expr) => (
        #[test]
        fn $test() {
            use $crate::{FromBytes, ToBytes};

            fn decode_same<'b, T: FromBytes>(_witness: &T, input: &'b [u8]) -> $crate::IResult<&'b [u8], T> {
                T::from_bytes(input)
            }

            let value = $value;
            let mut buf = [0; 1024 * 4];
            let (_, size) = value.to_bytes((&mut buf, 0)).unwrap();
            let (rest, decoded_value) = decode_same(&value, &buf[..size]).unwrap();
            assert!(rest.is_empty());
            assert_eq!(decoded_value, value);
        }
    )
);
