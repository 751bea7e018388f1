//! Decentralized identifiers
//!
//! Services advertised by a peer are identified by DID URLs of the form
//! `did:<method>:<id>[/path][#fragment]`, e.g. `did:ipid:QmPeer/blog`.

/// Components of a DID URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DidParts {
    pub method: String,
    pub id: String,
    /// Path including its leading `/`
    pub path: Option<String>,
    pub fragment: Option<String>,
}

impl DidParts {
    /// The bare DID, without path or fragment.
    pub fn did(&self) -> String {
        format!("did:{}:{}", self.method, self.id)
    }
}

/// Split a DID URL into its components.
pub fn explode(did: &str) -> Option<DidParts> {
    let rest = did.strip_prefix("did:")?;
    let (method, rest) = rest.split_once(':')?;
    if method.is_empty() || !method.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }

    let (rest, fragment) = match rest.split_once('#') {
        Some((rest, frag)) => (rest, Some(frag.to_string())),
        None => (rest, None),
    };
    let (id, path) = match rest.find('/') {
        Some(pos) => (&rest[..pos], Some(rest[pos..].to_string())),
        None => (rest, None),
    };
    if id.is_empty() {
        return None;
    }

    Some(DidParts {
        method: method.to_string(),
        id: id.to_string(),
        path,
        fragment,
    })
}

/// Path of a service DID joined to a peer handle: `alice` and
/// `did:ipid:Qm/blog/posts` give `alice/blog/posts`.
pub fn display_path(handle: &str, service_id: &str) -> Option<String> {
    let path = explode(service_id)?.path?;
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return None;
    }
    Some(format!("{}/{}", handle.trim_end_matches('/'), path))
}
