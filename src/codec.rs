//! Typed values over the string cache.
//!
//! The cache stores opaque strings; this module carries structured values
//! over them. An absent row maps to the empty string, so typed reads
//! compose with negative caching: a known-absent value is cached like any
//! other empty result.

use crate::cache::Client;
use crate::core::error::{FetchError, StrataResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;

/// Encodes and decodes cached payloads.
pub trait Codec {
    /// Encode a value into the string stored in the cache.
    fn encode<T: Serialize>(&self, value: &T) -> StrataResult<String>;

    /// Decode a stored string back into a value.
    fn decode<T: DeserializeOwned>(&self, data: &str) -> StrataResult<T>;
}

/// The default codec: JSON via serde_json.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> StrataResult<String> {
        Ok(serde_json::to_string(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, data: &str) -> StrataResult<T> {
        Ok(serde_json::from_str(data)?)
    }
}

impl Client {
    /// Typed [`fetch`](Client::fetch): the value crosses the cache as JSON
    /// and `None` is recorded as an empty result, so a known-absent row is
    /// negatively cached under the configured empty-expire policy.
    pub async fn fetch_json<T, F, Fut>(
        &self,
        key: &str,
        expire: Duration,
        fetch_fn: F,
    ) -> StrataResult<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<Option<T>, FetchError>> + Send + 'static,
    {
        let raw = self
            .fetch(key, expire, move || async move {
                match fetch_fn().await? {
                    None => Ok(String::new()),
                    Some(value) => JsonCodec
                        .encode(&value)
                        .map_err(|err| Box::new(err) as FetchError),
                }
            })
            .await?;
        if raw.is_empty() {
            return Ok(None);
        }
        JsonCodec.decode(&raw).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::StrataError;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Row {
        id: u64,
        name: String,
    }

    #[test]
    fn json_round_trip() {
        let row = Row {
            id: 7,
            name: "seven".to_string(),
        };
        let encoded = JsonCodec.encode(&row).unwrap();
        let decoded: Row = JsonCodec.decode(&encoded).unwrap();
        assert_eq!(decoded, row);
    }

    #[test]
    fn encoded_values_are_never_empty() {
        // The empty string is reserved for recorded negative results.
        let encoded = JsonCodec.encode(&None::<Row>).unwrap();
        assert!(!encoded.is_empty());
    }

    #[test]
    fn decode_failures_surface_as_codec_errors() {
        let err = JsonCodec.decode::<Row>("not json").unwrap_err();
        assert!(matches!(err, StrataError::Codec(_)));
    }
}
