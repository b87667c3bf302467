/*! Errors enum for packet decoding and payload decryption.
*/

use nom::error::Error as NomError;
use nom::Err;
use thiserror::Error;

/// Error that can happen when calling `get_payload` or `open` of an
/// encrypted packet part.
#[derive(Debug, PartialEq, Error)]
pub enum GetPayloadError {
    /// Error indicates that the payload could not be decrypted.
    #[error("Error to decrypt data")]
    Decrypt,
    /// Error indicates that the decrypted payload could not be parsed.
    #[error("Deserialize payload error: {:?}, data: {:?}", error, data)]
    Deserialize {
        /// Parsing error.
        error: Err<NomError<Vec<u8>>>,
        /// Payload of the packet.
        data: Vec<u8>,
    },
}

impl GetPayloadError {
    pub(crate) fn decrypt() -> GetPayloadError {
        GetPayloadError::Decrypt
    }

    pub(crate) fn deserialize(e: Err<NomError<&[u8]>>, data: Vec<u8>) -> GetPayloadError {
        GetPayloadError::Deserialize {
            error: e.map(|e| NomError::new(e.input.to_vec(), e.code)),
            data,
        }
    }
}

/// Error that can happen when checking a signed descriptor.
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ContactError {
    /// The signature does not cover the canonical encoding.
    #[error("Signature check failed")]
    BadSignature,
    /// The descriptor claims to come from the future.
    #[error("Timestamp is in the future")]
    FutureTimestamp,
    /// The descriptor belongs to a different overlay network.
    #[error("Network id mismatch")]
    NetIdMismatch,
    /// The descriptor could not be canonically encoded.
    #[error("Serialization failed")]
    Encode,
}
