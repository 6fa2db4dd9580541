//! On-disk encoding of the key-value mapping.
//!
//! The whole mapping is one JSON object. Every key and every value is base64
//! encoded (URL-safe alphabet, padded) before it goes into the object, so any
//! string content produces valid JSON text.

use std::collections::BTreeMap;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE;

use crate::error::{Error, Result};

/// The replicated key-value namespace.
///
/// `BTreeMap` keeps iteration sorted, so two equal mappings always encode to
/// the same bytes.
pub type Mapping = BTreeMap<String, String>;

pub fn encode(mapping: &Mapping) -> Result<Vec<u8>> {
    let encoded: BTreeMap<String, String> = mapping
        .iter()
        .map(|(key, value)| (URL_SAFE.encode(key), URL_SAFE.encode(value)))
        .collect();
    serde_json::to_vec(&encoded).map_err(|err| Error::Corrupt(format!("encode: {err}")))
}

/// Decodes a data file or snapshot blob.
///
/// Either every entry decodes or the call fails; a partially decoded mapping
/// is never returned.
pub fn decode(bytes: &[u8]) -> Result<Mapping> {
    let encoded: BTreeMap<String, String> =
        serde_json::from_slice(bytes).map_err(|err| Error::Corrupt(format!("json: {err}")))?;

    encoded
        .iter()
        .map(|(key, value)| Ok((decode_field(key)?, decode_field(value)?)))
        .collect()
}

fn decode_field(field: &str) -> Result<String> {
    let raw = URL_SAFE
        .decode(field)
        .map_err(|err| Error::Corrupt(format!("base64 {field:?}: {err}")))?;
    String::from_utf8(raw).map_err(|err| Error::Corrupt(format!("utf-8 {field:?}: {err}")))
}
