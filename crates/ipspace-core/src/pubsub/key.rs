//! Hierarchical topic keys
//!
//! A key is an ordered list of segments, written `g/services/app`. The `*`
//! segment is a wildcard:
//!
//! - in the middle of a pattern it matches exactly one segment
//!   (`g/*/app` matches `g/services/app`)
//! - as the last segment it matches one or more remaining segments
//!   (`g/*` matches `g/42` and `g/services/app`, but not `g`)

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};

use lru::LruCache;
use parking_lot::Mutex;

use crate::error::{SpaceError, SpaceResult};

/// Wildcard segment
pub const WILDCARD: &str = "*";

/// Number of interned keys kept by [`make_key`]
pub const KEY_CACHE_SIZE: usize = 256;

/// Interned topic key; clones share the segment list.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicKey(Arc<[String]>);

fn key_cache() -> &'static Mutex<LruCache<Vec<String>, TopicKey>> {
    static CACHE: OnceLock<Mutex<LruCache<Vec<String>, TopicKey>>> = OnceLock::new();
    CACHE.get_or_init(|| {
        let cap = NonZeroUsize::new(KEY_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN);
        Mutex::new(LruCache::new(cap))
    })
}

/// Build (or fetch the interned copy of) a key from its segments.
pub fn make_key<S: AsRef<str>>(segments: &[S]) -> TopicKey {
    let owned: Vec<String> = segments.iter().map(|s| s.as_ref().to_string()).collect();
    let mut cache = key_cache().lock();
    if let Some(key) = cache.get(&owned) {
        return key.clone();
    }
    let key = TopicKey(owned.clone().into());
    cache.put(owned, key.clone());
    key
}

impl TopicKey {
    /// Parse `a/b/c`. Empty keys and empty segments are rejected.
    pub fn parse(path: &str) -> SpaceResult<Self> {
        let segments: Vec<&str> = path.split('/').collect();
        if path.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return Err(SpaceError::InvalidKey(path.to_string()));
        }
        Ok(make_key(segments.as_slice()))
    }

    /// Segments in order.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Whether any segment is the wildcard.
    pub fn is_pattern(&self) -> bool {
        self.0.iter().any(|s| s == WILDCARD)
    }

    /// Whether this key, used as a subscription pattern, matches `key`.
    pub fn matches(&self, key: &TopicKey) -> bool {
        let pattern = &self.0;
        let target = &key.0;
        for (idx, seg) in pattern.iter().enumerate() {
            let last = idx + 1 == pattern.len();
            match target.get(idx) {
                None => return false,
                Some(_) if seg == WILDCARD && last => return true,
                Some(_) if seg == WILDCARD => continue,
                Some(t) if t == seg => continue,
                Some(_) => return false,
            }
        }
        pattern.len() == target.len()
    }

    /// Handler name derived from the key: `event_` followed by the
    /// non-wildcard segments joined with `_`.
    pub fn handler_name(&self) -> String {
        let parts: Vec<&str> = self
            .0
            .iter()
            .map(String::as_str)
            .filter(|s| *s != WILDCARD)
            .collect();
        format!("event_{}", parts.join("_"))
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

impl fmt::Debug for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TopicKey({})", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Predefined keys
// ═══════════════════════════════════════════════════════════════════════

/// Every key
pub fn key_all() -> TopicKey {
    make_key(&[WILDCARD])
}

/// `g/42`, bound by every key listener
pub fn key_42() -> TopicKey {
    make_key(&["g", "42"])
}

/// `g/services`
pub fn key_services() -> TopicKey {
    make_key(&["g", "services"])
}

/// `g/smartcontracts/*`
pub fn key_smart_contracts() -> TopicKey {
    make_key(&["g", "smartcontracts", WILDCARD])
}

/// `g/pubsub/json`
pub fn key_ps_json() -> TopicKey {
    make_key(&["g", "pubsub", "json"])
}

/// `g/pubsub/enc/json`
pub fn key_ps_enc_json() -> TopicKey {
    make_key(&["g", "pubsub", "enc", "json"])
}

/// `g/pubsub/chat/*`
pub fn key_chat_all() -> TopicKey {
    make_key(&["g", "pubsub", "chat", WILDCARD])
}

/// `g/pubsub/chat/channels`
pub fn key_chat_channels() -> TopicKey {
    make_key(&["g", "pubsub", "chat", "channels"])
}

/// `g/tokens/dagexchange`
pub fn key_tokens_dag_exchange() -> TopicKey {
    make_key(&["g", "tokens", "dagexchange"])
}

/// `g/tokens/ident`
pub fn key_tokens_ident() -> TopicKey {
    make_key(&["g", "tokens", "ident"])
}

/// `g/peers/added`
pub fn key_peer_added() -> TopicKey {
    make_key(&["g", "peers", "added"])
}

/// `g/peers/modified`
pub fn key_peer_modified() -> TopicKey {
    make_key(&["g", "peers", "modified"])
}

/// `g/peers/didmodified`
pub fn key_peer_did_modified() -> TopicKey {
    make_key(&["g", "peers", "didmodified"])
}

/// `g/peers/logout`
pub fn key_peer_logout() -> TopicKey {
    make_key(&["g", "peers", "logout"])
}

/// `g/services/<names...>`
pub fn key_service(names: &[&str]) -> TopicKey {
    let segments: Vec<&str> = ["g", "services"].into_iter().chain(names.iter().copied()).collect();
    make_key(segments.as_slice())
}

/// `g/services/<names...>/*`
pub fn key_service_all(names: &[&str]) -> TopicKey {
    let segments: Vec<&str> = ["g", "services"]
        .into_iter()
        .chain(names.iter().copied())
        .chain([WILDCARD])
        .collect();
    make_key(segments.as_slice())
}

/// `g/chat/channels/<channel>`
pub fn key_chat_channel(channel: &str) -> TopicKey {
    make_key(&["g", "chat", "channels", channel])
}

/// `g/pubsub/chatuserslist/<channel>`
pub fn key_chat_users_list(channel: &str) -> TopicKey {
    make_key(&["g", "pubsub", "chatuserslist", channel])
}

/// `g/pubsub/tokens/pubchat/<channel>`
pub fn key_pub_chat_tokens(channel: &str) -> TopicKey {
    make_key(&["g", "pubsub", "tokens", "pubchat", channel])
}

/// `g/smartcontracts/<name>/<address>`
pub fn key_smart_contract(name: &str, address: &str) -> TopicKey {
    make_key(&["g", "smartcontracts", name, address])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_key_interns() {
        let a = make_key(&["g", "42"]);
        let b = key_42();
        assert_eq!(a, b);
        assert!(Arc::ptr_eq(&a.0, &b.0));
        assert_eq!(a.to_string(), "g/42");
    }

    #[test]
    fn test_parse() {
        assert_eq!(TopicKey::parse("g/services/app").unwrap(), key_service(&["app"]));
        assert!(matches!(TopicKey::parse(""), Err(SpaceError::InvalidKey(_))));
        assert!(matches!(TopicKey::parse("g//x"), Err(SpaceError::InvalidKey(_))));
    }

    #[test]
    fn test_matches() {
        let g_all = make_key(&["g", WILDCARD]);
        assert!(key_42().matches(&key_42()));
        assert!(g_all.matches(&key_42()));
        assert!(g_all.matches(&key_service(&["app"])));
        assert!(!g_all.matches(&make_key(&["g"])));
        assert!(key_all().matches(&key_42()));

        let middle = make_key(&["g", WILDCARD, "app"]);
        assert!(middle.matches(&key_service(&["app"])));
        assert!(!middle.matches(&key_service(&["app", "x"])));

        assert!(!key_42().matches(&make_key(&["g", "43"])));
        assert!(!key_42().matches(&make_key(&["g", "42", "x"])));
        assert!(key_chat_all().matches(&key_chat_channels()));
        assert!(!key_chat_all().matches(&key_chat_channel("general")));
    }

    #[test]
    fn test_handler_name() {
        assert_eq!(key_42().handler_name(), "event_g_42");
        assert_eq!(key_service(&["app"]).handler_name(), "event_g_services_app");
        assert_eq!(key_chat_all().handler_name(), "event_g_pubsub_chat");
    }

    #[test]
    fn test_builders() {
        assert_eq!(key_service_all(&["ipfs"]).to_string(), "g/services/ipfs/*");
        assert_eq!(key_smart_contract("ldpass", "0xabc").to_string(), "g/smartcontracts/ldpass/0xabc");
        assert!(key_smart_contracts().matches(&key_smart_contract("ldpass", "0xabc")));
        assert_eq!(key_pub_chat_tokens("general").to_string(), "g/pubsub/tokens/pubchat/general");
        assert_eq!(key_chat_users_list("general").to_string(), "g/pubsub/chatuserslist/general");
    }
}
