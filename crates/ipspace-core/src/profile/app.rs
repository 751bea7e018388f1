//! User application: home page generation and DAG linking

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cid::Cid;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::userinfo::UserInfo;
use crate::content;
use crate::dag::{mk_link, set_path, EvolvingDag};
use crate::error::{SpaceError, SpaceResult};
use crate::node::NodeHandle;

/// What the home page is rendered from.
#[derive(Debug)]
pub struct HomeContext<'a> {
    /// `userinfo` section of the user information document
    pub userinfo: &'a Value,
    /// Board messages, newest first
    pub messages: Vec<&'a Value>,
    /// Whether a stylesheet directory is linked as `css`
    pub has_css: bool,
}

/// Renders the profile's home page.
pub trait HomeRenderer: Send + Sync {
    fn render(&self, ctx: &HomeContext<'_>) -> SpaceResult<String>;
}

/// Minimal HTML home page.
#[derive(Debug, Default, Clone, Copy)]
pub struct BasicHomeRenderer;

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn field<'a>(info: &'a Value, key: &str) -> &'a str {
    info.get(key).and_then(Value::as_str).unwrap_or("")
}

impl HomeRenderer for BasicHomeRenderer {
    fn render(&self, ctx: &HomeContext<'_>) -> SpaceResult<String> {
        let info = ctx.userinfo;
        let avatar = info
            .pointer("/avatar/cid")
            .and_then(Value::as_str)
            .unwrap_or("");

        let mut html = String::from("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n");
        html.push_str(&format!("<title>{}</title>\n", escape(field(info, "username"))));
        if ctx.has_css {
            html.push_str("<link rel=\"stylesheet\" href=\"css/main.css\">\n");
        }
        html.push_str("</head>\n<body>\n");

        if !avatar.is_empty() {
            html.push_str(&format!(
                "<img class=\"avatar\" src=\"/ipfs/{}\">\n",
                escape(avatar)
            ));
        }
        html.push_str(&format!("<h1>{}</h1>\n", escape(field(info, "username"))));
        for key in ["bio", "motto"] {
            let value = field(info, key);
            if !value.is_empty() {
                html.push_str(&format!("<p class=\"{}\">{}</p>\n", key, escape(value)));
            }
        }

        html.push_str("<div class=\"board\">\n");
        for message in &ctx.messages {
            html.push_str(&format!(
                "<div class=\"message\"><h3>{}</h3><span class=\"date\">{}</span><p>{}</p></div>\n",
                escape(field(message, "title")),
                escape(field(message, "date")),
                escape(field(message, "content")),
            ));
        }
        html.push_str("</div>\n</body>\n</html>\n");
        Ok(html)
    }
}

/// Keeps the home page and media links of a user DAG up to date.
pub struct UserApp {
    node: NodeHandle,
    renderer: Arc<dyn HomeRenderer>,
    css_entry: Option<Cid>,
    media_images: Vec<(String, Cid)>,
}

impl UserApp {
    /// Add the assets directory and media images, and prepare the app.
    ///
    /// A media image that cannot be read is left out of the DAG.
    pub async fn init(
        node: NodeHandle,
        renderer: Arc<dyn HomeRenderer>,
        assets_dir: Option<&Path>,
        media_images: &BTreeMap<String, PathBuf>,
    ) -> SpaceResult<Self> {
        let css_entry = match assets_dir {
            Some(dir) => {
                let cid = node.add_path(dir, true).await?;
                info!(?dir, %cid, "Added assets");
                Some(cid)
            }
            None => None,
        };

        let mut images = Vec::with_capacity(media_images.len());
        for (name, path) in media_images {
            match node.add_path(path, false).await {
                Ok(cid) => {
                    debug!(%name, %cid, "Added media image");
                    images.push((name.clone(), cid));
                }
                Err(e) => warn!(%name, ?path, error = %e, "Cannot add media image"),
            }
        }

        Ok(Self {
            node,
            renderer,
            css_entry,
            media_images: images,
        })
    }

    /// Assets directory CID.
    pub fn css_entry(&self) -> Option<&Cid> {
        self.css_entry.as_ref()
    }

    /// Media images that were added, by link name.
    pub fn media_images(&self) -> &[(String, Cid)] {
        &self.media_images
    }

    /// Render the home page and relink it, the assets, the media images
    /// and the avatar in one scoped mutation.
    pub async fn update(&self, dag: &EvolvingDag, userinfo: &UserInfo) -> SpaceResult<Cid> {
        dag.wait_loaded().await;
        let document = userinfo.root();
        let info = document.get("userinfo").cloned().unwrap_or_else(|| json!({}));
        let avatar = userinfo.avatar_cid();

        let mut tx = dag.edit().await;

        let page = {
            let messages: Vec<&Value> = tx
                .pointer("/board/messages")
                .and_then(Value::as_array)
                .map(|m| m.iter().rev().collect())
                .unwrap_or_default();
            self.renderer.render(&HomeContext {
                userinfo: &info,
                messages,
                has_css: self.css_entry.is_some(),
            })?
        };
        let index = self.node.add_bytes(page.as_bytes()).await?;

        set_path(&mut tx, &["index.html"], content::link(&index.to_string()));
        if let Some(css) = &self.css_entry {
            set_path(&mut tx, &["css"], content::link(&css.to_string()));
        }
        for (name, cid) in &self.media_images {
            let link = content::link(&cid.to_string());
            set_path(&mut tx, &["media", "images", name.as_str()], link);
        }
        if !avatar.is_empty() {
            match mk_link(&avatar) {
                Ok(link) => {
                    set_path(&mut tx, &["media", "images", "avatar"], link);
                }
                Err(e) => debug!(%avatar, error = %e, "Avatar is not a valid CID, not linked"),
            }
        }

        tx.commit().await
    }

    /// Append a message to the board.
    pub async fn post_message(&self, dag: &EvolvingDag, title: &str, text: &str) -> SpaceResult<Cid> {
        let message = json!({
            "title": title,
            "content": text,
            "date": chrono::Local::now().format("%Y-%m-%d %H:%M").to_string(),
        });

        let mut tx = dag.edit().await;
        let appended = match tx.pointer_mut("/board/messages").and_then(Value::as_array_mut) {
            Some(messages) => {
                messages.push(message.clone());
                true
            }
            None => false,
        };
        if !appended && !set_path(&mut tx, &["board", "messages"], json!([message])) {
            return Err(SpaceError::InvalidOperation(
                "DAG has no board to post to".to_string(),
            ));
        }
        tx.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_render() {
        let info = json!({
            "username": "alice <admin>",
            "bio": "Hello",
            "avatar": { "cid": "bafy123" }
        });
        let first = json!({ "title": "First", "content": "one", "date": "2026-10-19 10:00" });
        let second = json!({ "title": "Second", "content": "two", "date": "2026-10-19 11:00" });

        let html = BasicHomeRenderer
            .render(&HomeContext {
                userinfo: &info,
                messages: vec![&second, &first],
                has_css: false,
            })
            .unwrap();

        assert!(html.contains("<h1>alice &lt;admin&gt;</h1>"));
        assert!(html.contains("src=\"/ipfs/bafy123\""));
        assert!(html.contains("<p class=\"bio\">Hello</p>"));
        assert!(!html.contains("stylesheet"));
        assert!(html.find("Second").unwrap() < html.find("First").unwrap());
    }

    #[test]
    fn test_render_changes_with_avatar() {
        let a = json!({ "username": "alice", "avatar": { "cid": "" } });
        let b = json!({ "username": "alice", "avatar": { "cid": "bafy123" } });
        let render = |info: &Value| {
            BasicHomeRenderer
                .render(&HomeContext {
                    userinfo: info,
                    messages: vec![],
                    has_css: true,
                })
                .unwrap()
        };
        assert_ne!(render(&a), render(&b));
        assert!(render(&a).contains("stylesheet"));
    }
}
