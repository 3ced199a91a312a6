// SPDX-FileCopyrightText: 2024 Phoenix R&D GmbH <hello@phnx.im>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Versioned codec for persisted client documents (identity metadata, group
//! cursors). The first byte of every persisted blob is the codec version;
//! the payload of the current version is JSON.
//!
//! Wire traffic does not go through this codec: signalling frames and group
//! requests are plain JSON text by protocol definition.

use error::CodecError;
use serde::{Serialize, de::DeserializeOwned};

mod error;

pub use error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
#[non_exhaustive]
pub enum AcpCodec {
    #[default]
    V1 = 1,
}

impl TryFrom<u8> for AcpCodec {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            1 => Ok(AcpCodec::V1),
            _ => Err(Error::UnknownCodecVersion),
        }
    }
}

impl AcpCodec {
    fn serialize<T: Sized + Serialize>(
        &self,
        value: &T,
    ) -> Result<Vec<u8>, Box<dyn std::error::Error + Send + Sync + 'static>> {
        // The first byte is always the codec version
        let mut buf = vec![*self as u8];
        match self {
            AcpCodec::V1 => serde_json::to_writer(&mut buf, value)?,
        }
        Ok(buf)
    }

    fn deserialize<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
    ) -> Result<T, Box<dyn std::error::Error + Send + Sync + 'static>> {
        let res = match self {
            AcpCodec::V1 => serde_json::from_slice(bytes)?,
        };
        Ok(res)
    }

    pub fn to_vec<T>(value: &T) -> Result<Vec<u8>, Error>
    where
        T: Sized + Serialize,
    {
        let codec_version = AcpCodec::default();
        let res = codec_version.serialize(value).map_err(|error| CodecError {
            codec_version,
            error,
        })?;
        Ok(res)
    }

    pub fn from_slice<T>(bytes: &[u8]) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let codec_version_byte = bytes.first().ok_or(Error::EmptyInputSlice)?;
        let codec_version = AcpCodec::try_from(*codec_version_byte)?;
        codec_version.deserialize(&bytes[1..]).map_err(|error| {
            CodecError {
                codec_version,
                error,
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Doc {
        last_msg_id: u64,
        label: String,
    }

    #[test]
    fn round_trip() {
        let doc = Doc {
            last_msg_id: 42,
            label: "g1".into(),
        };
        let bytes = AcpCodec::to_vec(&doc).unwrap();
        assert_eq!(bytes[0], AcpCodec::V1 as u8);
        let back: Doc = AcpCodec::from_slice(&bytes).unwrap();
        assert_eq!(doc, back);
    }

    #[test]
    fn rejects_unknown_version() {
        let mut bytes = AcpCodec::to_vec(&42u32).unwrap();
        bytes[0] = 0xff;
        assert!(matches!(
            AcpCodec::from_slice::<u32>(&bytes),
            Err(Error::UnknownCodecVersion)
        ));
    }

    #[test]
    fn rejects_empty_input() {
        assert!(matches!(
            AcpCodec::from_slice::<u32>(&[]),
            Err(Error::EmptyInputSlice)
        ));
    }
}
