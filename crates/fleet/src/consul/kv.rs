//! KV domain — get, recursive get, put, recursive delete.

use super::ConsulClient;
use crate::error::{Error, Result};
use base64::Engine;
use serde::Deserialize;

/// One decoded KV entry. Consul transports values as base64; the gateway
/// hands out UTF-8 strings, empty when the key has a nil value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
struct RawKvEntry {
    #[serde(rename = "Key")]
    key: String,
    #[serde(rename = "Value")]
    value: Option<String>,
}

fn decode_entry(entry: RawKvEntry) -> Result<KvPair> {
    let value = match entry.value {
        None => String::new(),
        Some(b64) => {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(b64.as_bytes())
                .map_err(|e| Error::InvariantViolation(format!("kv value not base64: {e}")))?;
            String::from_utf8(bytes)
                .map_err(|e| Error::InvariantViolation(format!("kv value not utf-8: {e}")))?
        }
    };
    Ok(KvPair {
        key: entry.key,
        value,
    })
}

impl ConsulClient {
    /// Fetch a single key. `None` when the key is absent.
    pub async fn kv_get(&self, key: &str) -> Result<Option<String>> {
        let url = self.url(&format!("/v1/kv/{key}"));
        let response = self.request(self.http.get(&url)).send().await?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let response = self.check_response(response).await?;
        let entries: Vec<RawKvEntry> = response.json().await?;

        entries
            .into_iter()
            .next()
            .map(|e| decode_entry(e).map(|p| p.value))
            .transpose()
    }

    /// Fetch every key under a prefix, in Consul's key order. An absent
    /// prefix yields an empty list.
    pub async fn kv_get_recursive(&self, prefix: &str) -> Result<Vec<KvPair>> {
        let url = self.url(&format!("/v1/kv/{prefix}"));
        let response = self
            .request(self.http.get(&url).query(&[("recurse", "true")]))
            .send()
            .await?;

        if response.status().as_u16() == 404 {
            return Ok(Vec::new());
        }
        let response = self.check_response(response).await?;
        let entries: Vec<RawKvEntry> = response.json().await?;

        entries.into_iter().map(decode_entry).collect()
    }

    pub async fn kv_put(&self, key: &str, value: &str) -> Result<()> {
        let url = self.url(&format!("/v1/kv/{key}"));
        let response = self
            .request(self.http.put(&url).body(value.to_string()))
            .send()
            .await?;
        self.check_response(response).await?;
        Ok(())
    }

    pub async fn kv_delete_recursive(&self, prefix: &str) -> Result<()> {
        let url = self.url(&format!("/v1/kv/{prefix}"));
        let response = self
            .request(self.http.delete(&url).query(&[("recurse", "true")]))
            .send()
            .await?;
        self.check_response(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_base64_value() {
        let entry = RawKvEntry {
            key: "tarantool/abc/blueprint/type".to_string(),
            value: Some("bWVtY2FjaGVk".to_string()),
        };
        let pair = decode_entry(entry).unwrap();
        assert_eq!(pair.value, "memcached");
    }

    #[test]
    fn test_decode_nil_value_is_empty() {
        let entry = RawKvEntry {
            key: "tarantool/abc".to_string(),
            value: None,
        };
        assert_eq!(decode_entry(entry).unwrap().value, "");
    }

    #[test]
    fn test_decode_bad_base64_is_invariant_violation() {
        let entry = RawKvEntry {
            key: "k".to_string(),
            value: Some("!!!".to_string()),
        };
        assert!(matches!(
            decode_entry(entry),
            Err(Error::InvariantViolation(_))
        ));
    }
}
