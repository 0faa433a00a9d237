// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Byte encoding of application keys, values and update tags.
//!
//! Every type used as a topic key, value or tag implements [`Codec`]. Keys
//! additionally need `Eq + Hash + Display`: keys are deduplicated by their
//! encoded form and named by their display string.
//!
//! Scalars are encoded little-endian; strings as raw UTF-8.

use std::fmt;

/// Encode/decode contract for application types.
pub trait Codec: Clone + Send + Sync + 'static {
    fn encode(&self) -> Vec<u8>;

    fn decode(bytes: &[u8]) -> Result<Self, CodecError>;
}

/// Encoding or decoding failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodecError {
    message: String,
}

impl CodecError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for CodecError {}

macro_rules! impl_codec_for_number {
    ($($ty:ty),* $(,)?) => {
        $(
            impl Codec for $ty {
                fn encode(&self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }

                fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
                    let raw: [u8; std::mem::size_of::<$ty>()] = bytes.try_into().map_err(|_| {
                        CodecError::new(format!(
                            "expected {} bytes for {}, got {}",
                            std::mem::size_of::<$ty>(),
                            stringify!($ty),
                            bytes.len()
                        ))
                    })?;
                    Ok(<$ty>::from_le_bytes(raw))
                }
            }
        )*
    };
}

impl_codec_for_number!(i8, i16, i32, i64, i128, u8, u16, u32, u64, u128, f32, f64);

impl Codec for bool {
    fn encode(&self) -> Vec<u8> {
        vec![u8::from(*self)]
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        match bytes {
            [0] => Ok(false),
            [1] => Ok(true),
            _ => Err(CodecError::new("invalid bool encoding")),
        }
    }
}

impl Codec for String {
    fn encode(&self) -> Vec<u8> {
        self.as_bytes().to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| CodecError::new(e.to_string()))
    }
}

impl Codec for Vec<u8> {
    fn encode(&self) -> Vec<u8> {
        self.clone()
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(bytes.to_vec())
    }
}

impl Codec for () {
    fn encode(&self) -> Vec<u8> {
        Vec::new()
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.is_empty() {
            Ok(())
        } else {
            Err(CodecError::new("unexpected payload for unit value"))
        }
    }
}

/// JSON encoding for serde types.
#[cfg(feature = "serde")]
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Json<T>(pub T);

#[cfg(feature = "serde")]
impl<T> Codec for Json<T>
where
    T: serde::Serialize + serde::de::DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn encode(&self) -> Vec<u8> {
        // Serializing plain data structures into a Vec cannot fail.
        serde_json::to_vec(&self.0).unwrap_or_default()
    }

    fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        serde_json::from_slice(bytes)
            .map(Json)
            .map_err(|e| CodecError::new(e.to_string()))
    }
}

#[cfg(feature = "serde")]
impl<T: fmt::Display> fmt::Display for Json<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
