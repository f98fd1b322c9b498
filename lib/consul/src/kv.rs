use base64::Engine;
use base64::prelude::BASE64_STANDARD;
use serde::Deserialize;

use crate::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
    pub modify_index: u64,
}

impl KvPair {
    /// The value as UTF-8 with surrounding whitespace removed, invalid
    /// sequences are replaced.
    pub fn value_str(&self) -> String {
        String::from_utf8_lossy(&self.value).trim().to_string()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct RawKvPair {
    key: String,
    // null for keys without a value, e.g. folders
    value: Option<String>,
    #[serde(default)]
    modify_index: u64,
}

pub(crate) fn decode(body: &[u8]) -> Result<Vec<KvPair>, Error> {
    serde_json::from_slice::<Vec<RawKvPair>>(body)?
        .into_iter()
        .map(|raw| {
            let value = match raw.value {
                Some(encoded) => BASE64_STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|source| Error::DecodeValue {
                        key: raw.key.clone(),
                        source,
                    })?,
                None => Vec::new(),
            };

            Ok(KvPair {
                key: raw.key,
                value,
                modify_index: raw.modify_index,
            })
        })
        .collect()
}
