//! User information document
//!
//! Encrypted per-profile identity record. Plaintext layout:
//!
//! ```json
//! { "userinfo": {
//!     "username": "<uid>", "firstname": "", "lastname": "", "altname": "",
//!     "nickname": "", "gender": -1, "org": "", "email": "",
//!     "country": { "code": "", "name": "" }, "city": "",
//!     "birthdate": "", "birthplace": "", "occupation": "", "telephone": "",
//!     "langs": [], "avatar": { "cid": "" }, "bio": "", "motto": "",
//!     "crypto": { "rsa": { "pubkeypem": "..." }, "gpg": {} },
//!     "resources": [], "peerid": "", "identtoken": "<hex>",
//!     "date": { "created": "YYYY-MM-DD HH:MM:SS", "modified": "..." },
//!     "uid": "<uid>", "locked": false, "schemav": 1 } }
//! ```

use rand::RngCore;
use serde_json::{json, Map, Value};

use crate::dag::set_path;
use crate::document::{CipheredDocument, DocumentSchema};

/// Current schema version
pub const SCHEMA_VERSION: u64 = 1;

/// Gender values
pub const GENDER_MALE: i64 = 0;
pub const GENDER_FEMALE: i64 = 1;
pub const GENDER_UNSPECIFIED: i64 = -1;

/// Fields managed by the document itself, never written by `set_infos`
const RESERVED_FIELDS: &[&str] = &["uid", "date", "schemav", "identtoken", "crypto", "locked"];

const IDENT_TOKEN_BYTES: usize = 128;

fn now_stamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Schema of the user information document.
pub struct UserInfoSchema;

impl DocumentSchema for UserInfoSchema {
    fn init_obj() -> Value {
        let uid = ulid::Ulid::new().to_string();
        let now = now_stamp();
        json!({
            "userinfo": {
                "username": uid,
                "firstname": "",
                "lastname": "",
                "altname": "",
                "nickname": "",
                "gender": GENDER_UNSPECIFIED,
                "org": "",
                "email": "",
                "country": { "code": "", "name": "" },
                "city": "",
                "birthdate": "",
                "birthplace": "",
                "occupation": "",
                "telephone": "",
                "langs": [],
                "avatar": { "cid": "" },
                "bio": "",
                "motto": "",
                "crypto": { "rsa": {}, "gpg": {} },
                "resources": [],
                "peerid": "",
                "date": { "created": now, "modified": now },
                "uid": uid,
                "locked": false,
                "schemav": SCHEMA_VERSION,
            }
        })
    }

    fn is_locked(root: &Value) -> bool {
        root.pointer("/userinfo/locked")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn touch(root: &mut Value) {
        if let Some(date) = root
            .pointer_mut("/userinfo/date")
            .and_then(Value::as_object_mut)
        {
            date.insert("modified".to_string(), Value::String(now_stamp()));
        }
    }

    fn valid(root: &Value) -> bool {
        root.get("userinfo").map(Value::is_object).unwrap_or(false)
    }
}

/// The user information document of a profile.
pub type UserInfo = CipheredDocument<UserInfoSchema>;

fn section(root: &mut Value) -> Option<&mut Map<String, Value>> {
    root.get_mut("userinfo").and_then(Value::as_object_mut)
}

impl CipheredDocument<UserInfoSchema> {
    /// Stable identifier, generated once when the document is created.
    pub fn uid(&self) -> String {
        self.traverse_str("userinfo.uid")
    }

    /// Public user name.
    pub fn username(&self) -> String {
        self.traverse_str("userinfo.username")
    }

    /// First name.
    pub fn firstname(&self) -> String {
        self.traverse_str("userinfo.firstname")
    }

    /// Last name.
    pub fn lastname(&self) -> String {
        self.traverse_str("userinfo.lastname")
    }

    /// Alternative name.
    pub fn altname(&self) -> String {
        self.traverse_str("userinfo.altname")
    }

    /// Nickname.
    pub fn nickname(&self) -> String {
        self.traverse_str("userinfo.nickname")
    }

    /// One of the `GENDER_*` constants; unspecified when absent.
    pub fn gender(&self) -> i64 {
        self.traverse("userinfo.gender")
            .and_then(|v| v.as_i64())
            .unwrap_or(GENDER_UNSPECIFIED)
    }

    /// Organization.
    pub fn org(&self) -> String {
        self.traverse_str("userinfo.org")
    }

    /// Contact email address.
    pub fn email(&self) -> String {
        self.traverse_str("userinfo.email")
    }

    /// City of residence.
    pub fn city(&self) -> String {
        self.traverse_str("userinfo.city")
    }

    /// Country name, as set by [`UserInfo::set_country_info`].
    pub fn country_name(&self) -> String {
        self.traverse_str("userinfo.country.name")
    }

    /// Country code, as set by [`UserInfo::set_country_info`].
    pub fn country_code(&self) -> String {
        self.traverse_str("userinfo.country.code")
    }

    /// Birth date, free form.
    pub fn birthdate(&self) -> String {
        self.traverse_str("userinfo.birthdate")
    }

    /// Birth place.
    pub fn birthplace(&self) -> String {
        self.traverse_str("userinfo.birthplace")
    }

    /// Occupation.
    pub fn occupation(&self) -> String {
        self.traverse_str("userinfo.occupation")
    }

    /// Telephone number.
    pub fn telephone(&self) -> String {
        self.traverse_str("userinfo.telephone")
    }

    /// Spoken languages; empty when absent or malformed.
    pub fn langs(&self) -> Vec<String> {
        self.traverse("userinfo.langs")
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    /// Avatar CID, or a `/ipfs/` path. Empty when unset.
    pub fn avatar_cid(&self) -> String {
        self.traverse_str("userinfo.avatar.cid")
    }

    /// Short biography shown on the home page.
    pub fn bio(&self) -> String {
        self.traverse_str("userinfo.bio")
    }

    /// Motto shown on the home page.
    pub fn motto(&self) -> String {
        self.traverse_str("userinfo.motto")
    }

    /// Peer id of the storage node that owns the profile.
    pub fn peer_id(&self) -> String {
        self.traverse_str("userinfo.peerid")
    }

    /// Embedded RSA public key, if registered.
    pub fn rsa_public_pem(&self) -> Option<String> {
        self.traverse("userinfo.crypto.rsa.pubkeypem")
            .and_then(|v| v.as_str().map(str::to_string))
    }

    /// Random identification token, if generated.
    pub fn ident_token(&self) -> Option<String> {
        self.traverse("userinfo.identtoken")
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|t| !t.is_empty())
    }

    /// Whether setters are refused.
    pub fn locked(&self) -> bool {
        self.is_locked()
    }

    /// Schema version the document was written with.
    pub fn schema_version(&self) -> u64 {
        self.traverse("userinfo.schemav")
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }

    /// Creation date, `YYYY-MM-DD HH:MM:SS` local time.
    pub fn date_created(&self) -> String {
        self.traverse_str("userinfo.date.created")
    }

    /// Last modification date, same format as [`UserInfo::date_created`].
    pub fn date_modified(&self) -> String {
        self.traverse_str("userinfo.date.modified")
    }

    /// Set the avatar CID. Refused when locked.
    pub fn set_avatar_cid(&self, cid: &str) -> bool {
        self.mutate(|root| {
            set_path(root, &["userinfo", "avatar", "cid"], json!(cid));
        })
    }

    /// Set the country name and code. Refused when locked.
    pub fn set_country_info(&self, name: &str, code: &str) -> bool {
        self.mutate(|root| {
            if let Some(info) = section(root) {
                info.insert("country".to_string(), json!({ "code": code, "name": name }));
            }
        })
    }

    /// Overwrite existing top-level fields. Unknown and reserved keys are
    /// ignored. Refused when locked.
    pub fn set_infos(&self, fields: &Map<String, Value>) -> bool {
        self.mutate(|root| {
            if let Some(info) = section(root) {
                for (key, value) in fields {
                    if RESERVED_FIELDS.contains(&key.as_str()) || !info.contains_key(key) {
                        continue;
                    }
                    info.insert(key.clone(), value.clone());
                }
            }
        })
    }

    /// Record the storage node's peer id. Emits only on change.
    pub fn set_peer_id(&self, peer_id: &str) -> bool {
        self.mutate_unlocked(|root| match section(root) {
            Some(info) if info.get("peerid").and_then(Value::as_str) != Some(peer_id) => {
                info.insert("peerid".to_string(), Value::String(peer_id.to_string()));
                true
            }
            _ => false,
        })
    }

    /// Embed the RSA public key. Emits only when it differs.
    pub fn set_rsa_public_pem(&self, pem: &str) -> bool {
        self.mutate_unlocked(|root| {
            if root.pointer("/userinfo/crypto/rsa/pubkeypem").and_then(Value::as_str) == Some(pem) {
                return false;
            }
            let Some(info) = section(root) else {
                return false;
            };
            let crypto = info.entry("crypto").or_insert_with(|| json!({}));
            if !crypto.is_object() {
                *crypto = json!({});
            }
            let Some(crypto) = crypto.as_object_mut() else {
                return false;
            };
            let rsa = crypto.entry("rsa").or_insert_with(|| json!({}));
            if !rsa.is_object() {
                *rsa = json!({});
            }
            match rsa.as_object_mut() {
                Some(rsa) => {
                    rsa.insert("pubkeypem".to_string(), Value::String(pem.to_string()));
                    true
                }
                None => false,
            }
        })
    }

    /// Generate the identification token if there is none.
    pub fn update_ident_token(&self) -> bool {
        if self.ident_token().is_some() {
            return false;
        }
        let mut bytes = [0u8; IDENT_TOKEN_BYTES];
        rand::rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);

        self.mutate_unlocked(|root| match section(root) {
            Some(info) => {
                info.insert("identtoken".to_string(), Value::String(token));
                true
            }
            None => false,
        })
    }

    /// Set or clear the lock. Always allowed.
    pub fn set_lock(&self, lock: bool) -> bool {
        self.mutate_unlocked(|root| match section(root) {
            Some(info) if info.get("locked").and_then(Value::as_bool) != Some(lock) => {
                info.insert("locked".to_string(), Value::Bool(lock));
                true
            }
            _ => false,
        })
    }
}
