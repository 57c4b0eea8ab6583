// Copyright (c) 2024 - 2026 Weft Contributors.
// All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Codec used for snapshots and message payload envelopes. Values are
//! prefixed with a codec byte so the format can evolve without breaking
//! older snapshots.

use std::mem;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::GenericError;

#[derive(Debug, thiserror::Error)]
pub enum StorageEncodeError {
    #[error("encoding failed: {0}")]
    EncodeValue(GenericError),
}

#[derive(Debug, thiserror::Error)]
pub enum StorageDecodeError {
    #[error("failed reading codec: {0}")]
    ReadingCodec(String),
    #[error("decoding failed: {0}")]
    DecodeValue(GenericError),
}

#[derive(Debug, Copy, Clone, strum_macros::FromRepr, derive_more::Display)]
#[repr(u8)]
pub enum StorageCodecKind {
    // flexbuffers + serde
    FlexbuffersSerde = 1,
}

impl From<StorageCodecKind> for u8 {
    fn from(value: StorageCodecKind) -> Self {
        value as u8
    }
}

impl TryFrom<u8> for StorageCodecKind {
    type Error = StorageDecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        StorageCodecKind::from_repr(value).ok_or(StorageDecodeError::ReadingCodec(format!(
            "unknown discriminant '{value}'"
        )))
    }
}

/// Codec which encodes serde values by first writing a codec byte and then
/// the flexbuffers-encoded value.
pub struct StorageCodec;

impl StorageCodec {
    pub fn encode<T: Serialize, B: BufMut>(
        value: &T,
        buf: &mut B,
    ) -> Result<(), StorageEncodeError> {
        buf.put_u8(StorageCodecKind::FlexbuffersSerde.into());
        let serialized = flexbuffers::to_vec(value)
            .map_err(|err| StorageEncodeError::EncodeValue(err.into()))?;
        buf.put_slice(&serialized);
        Ok(())
    }

    pub fn encode_to_bytes<T: Serialize>(value: &T) -> Result<Bytes, StorageEncodeError> {
        let mut buf = BytesMut::new();
        Self::encode(value, &mut buf)?;
        Ok(buf.freeze())
    }

    pub fn decode<T: DeserializeOwned, B: Buf>(buf: &mut B) -> Result<T, StorageDecodeError> {
        if buf.remaining() < mem::size_of::<u8>() {
            return Err(StorageDecodeError::ReadingCodec(format!(
                "remaining bytes in buf '{}' < codec bytes '{}'",
                buf.remaining(),
                mem::size_of::<u8>()
            )));
        }
        let StorageCodecKind::FlexbuffersSerde = StorageCodecKind::try_from(buf.get_u8())?;

        let bytes = buf.copy_to_bytes(buf.remaining());
        flexbuffers::from_slice(&bytes).map_err(|err| StorageDecodeError::DecodeValue(err.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Record {
        name: String,
        count: u64,
    }

    #[test]
    fn encode_decode() {
        let record = Record {
            name: "counter-7".to_owned(),
            count: 2,
        };
        let bytes = StorageCodec::encode_to_bytes(&record).unwrap();
        let decoded: Record = StorageCodec::decode(&mut bytes.clone()).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn empty_buffer_is_a_decode_error() {
        let mut empty = Bytes::new();
        let result: Result<Record, _> = StorageCodec::decode(&mut empty);
        assert!(matches!(result, Err(StorageDecodeError::ReadingCodec(_))));
    }
}
