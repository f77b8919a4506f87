use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;

/// A wrapper around `bytes::Bytes` providing utility methods for common operations
/// on HTTP bodies.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BodyBytes(pub Bytes);

impl BodyBytes {
    /// Converts the bytes to a `Vec<u8>`.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// Cheaply clones the bytes into a new `Bytes` instance.
    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }

    /// Checks if the byte slice is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Checks if the byte slice contains the specified byte slice.
    pub fn contains_slice(&self, slice: &[u8]) -> bool {
        if slice.is_empty() {
            return true;
        }

        self.0
            .as_ref()
            .windows(slice.len())
            .any(|window| window == slice)
    }

    /// Converts the bytes to a UTF-8 string, potentially lossy.
    /// Tries to parse input as a UTF-8 string first to avoid copying and creating an
    /// owned instance. If the bytes are not valid UTF-8, invalid characters are replaced
    /// with the Unicode replacement character.
    pub fn to_maybe_lossy_str(&self) -> Cow<'_, str> {
        match std::str::from_utf8(&self.0) {
            Ok(valid_str) => Cow::Borrowed(valid_str),
            Err(_) => Cow::Owned(String::from_utf8_lossy(&self.0).to_string()),
        }
    }
}

impl From<Bytes> for BodyBytes {
    fn from(value: Bytes) -> Self {
        BodyBytes(value)
    }
}

impl From<Vec<u8>> for BodyBytes {
    fn from(value: Vec<u8>) -> Self {
        BodyBytes(Bytes::from(value))
    }
}

impl From<String> for BodyBytes {
    fn from(value: String) -> Self {
        BodyBytes(Bytes::from(value))
    }
}

impl From<&str> for BodyBytes {
    fn from(value: &str) -> Self {
        BodyBytes(Bytes::from(value.to_string()))
    }
}

impl From<BodyBytes> for Bytes {
    fn from(value: BodyBytes) -> Self {
        value.0
    }
}

impl PartialEq for BodyBytes {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for BodyBytes {}

impl AsRef<[u8]> for BodyBytes {
    fn as_ref(&self) -> &[u8] {
        self.0.as_ref()
    }
}

impl std::fmt::Display for BodyBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(result) => write!(f, "{}", result),
            Err(_) => write!(f, "{}", BASE64.encode(&self.0)),
        }
    }
}

/// Serde adapter for optional bodies. Valid UTF-8 bodies travel as plain JSON
/// strings; binary bodies travel as `{"base64": "..."}` objects.
pub(crate) mod opt_serde_body {
    use super::{BodyBytes, BASE64};
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[derive(Serialize, Deserialize)]
    #[serde(untagged)]
    enum WireBody {
        Text(String),
        Binary { base64: String },
    }

    pub fn serialize<S>(bytes: &Option<BodyBytes>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            None => serializer.serialize_none(),
            Some(value) => {
                let wire = match std::str::from_utf8(value.as_ref()) {
                    Ok(text) => WireBody::Text(text.to_string()),
                    Err(_) => WireBody::Binary {
                        base64: BASE64.encode(value.as_ref()),
                    },
                };
                wire.serialize(serializer)
            }
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<BodyBytes>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: Option<WireBody> = Option::deserialize(deserializer)?;
        match value {
            None => Ok(None),
            Some(WireBody::Text(text)) => Ok(Some(BodyBytes::from(Bytes::from(text)))),
            Some(WireBody::Binary { base64 }) => {
                let decoded = BASE64.decode(base64).map_err(serde::de::Error::custom)?;
                Ok(Some(BodyBytes::from(Bytes::from(decoded))))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn contains_slice_test() {
        let body = BodyBytes::from("the quick brown fox");

        assert_eq!(body.contains_slice(b"quick"), true);
        assert_eq!(body.contains_slice(b""), true);
        assert_eq!(body.contains_slice(b"slow"), false);
    }

    #[test]
    fn display_falls_back_to_base64_test() {
        let text = BodyBytes::from("hello");
        assert_eq!(text.to_string(), "hello");

        let binary = BodyBytes::from(vec![0xff, 0xfe, 0x00]);
        assert_eq!(binary.to_string(), "//4A");
    }

    #[test]
    fn lossy_str_test() {
        let body = BodyBytes::from(vec![b'o', b'k', 0xff]);
        assert_eq!(body.to_maybe_lossy_str(), "ok\u{fffd}");
    }
}
