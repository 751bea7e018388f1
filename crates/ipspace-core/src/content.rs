//! Content addressing
//!
//! Every object stored on the network is addressed by a CIDv1 whose
//! multihash is SHA-256 over the stored bytes:
//!
//! | object | codec | bytes hashed |
//! |--------|-------|--------------|
//! | raw content (`add_bytes`) | raw (0x55) | the content |
//! | DAG node (`dag_put`) | dag-json (0x0129) | canonical JSON |
//!
//! Canonical JSON is `serde_json` output of a [`Value`] whose object keys are
//! kept sorted, so the same tree always maps to the same CID.
//!
//! Links inside DAG nodes use the IPLD form `{"/": "<cid>"}`.

use cid::multihash::Multihash;
use cid::Cid;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::{SpaceError, SpaceResult};

/// Multicodec code for raw bytes
pub const RAW_CODEC: u64 = 0x55;

/// Multicodec code for dag-json
pub const DAG_JSON_CODEC: u64 = 0x0129;

/// Multihash code for SHA2-256
const SHA2_256: u64 = 0x12;

/// Key used by IPLD links in dag-json
pub const LINK_KEY: &str = "/";

fn sha256_multihash(data: &[u8]) -> Multihash {
    let digest = Sha256::digest(data);
    Multihash::wrap(SHA2_256, digest.as_slice()).expect("32-byte digest fits a multihash")
}

/// CID for raw content.
pub fn raw_cid(data: &[u8]) -> Cid {
    Cid::new_v1(RAW_CODEC, sha256_multihash(data))
}

/// Canonical byte encoding of a DAG node.
pub fn canonical_json(value: &Value) -> SpaceResult<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

/// CID for a DAG node.
pub fn json_cid(value: &Value) -> SpaceResult<Cid> {
    let bytes = canonical_json(value)?;
    Ok(Cid::new_v1(DAG_JSON_CODEC, sha256_multihash(&bytes)))
}

/// Parse a CID string.
pub fn parse_cid(s: &str) -> SpaceResult<Cid> {
    Cid::try_from(s).map_err(|e| SpaceError::InvalidCid(format!("{}: {}", s, e)))
}

/// Whether `s` parses as a CID.
pub fn is_valid_cid(s: &str) -> bool {
    Cid::try_from(s).is_ok()
}

/// Strip `/ipfs/` and split off a trailing sub-path.
///
/// `"/ipfs/bafy.../a/b"` gives `("bafy...", Some("a/b"))`.
pub fn split_ipfs_path(s: &str) -> (&str, Option<&str>) {
    let trimmed = s.strip_prefix("/ipfs/").unwrap_or(s);
    match trimmed.split_once('/') {
        Some((cid, rest)) if !rest.is_empty() => (cid, Some(rest)),
        Some((cid, _)) => (cid, None),
        None => (trimmed, None),
    }
}

/// Build an IPLD link value.
pub fn link(target: &str) -> Value {
    json!({ LINK_KEY: target })
}

/// Return the link target if `value` is an IPLD link.
pub fn as_link(value: &Value) -> Option<&str> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get(LINK_KEY).and_then(Value::as_str),
        _ => None,
    }
}

/// Visit every link in a tree, with its slash-separated path.
pub fn walk_links<'a>(value: &'a Value, path: &mut Vec<String>, f: &mut dyn FnMut(&str, &'a str)) {
    if let Some(target) = as_link(value) {
        f(&path.join("/"), target);
        return;
    }
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                path.push(key.clone());
                walk_links(child, path, f);
                path.pop();
            }
        }
        Value::Array(items) => {
            for (idx, child) in items.iter().enumerate() {
                path.push(idx.to_string());
                walk_links(child, path, f);
                path.pop();
            }
        }
        _ => {}
    }
}
