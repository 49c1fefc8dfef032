//! Bidirectional `@user`/`#channel` ↔ `<@id>`/`<#id>` rewriting.
//!
//! Outgoing rewrite turns canonical tokens written by the model into the
//! surface's native mention syntax before a message is posted. Incoming
//! normalize does the reverse when a surface event is turned into model
//! input, so the model always sees stable `@name`/`#channel` tokens
//! regardless of which surface originated the message.
//!
//! Both directions are code-span aware: text inside inline backtick spans
//! or fenced ``` blocks is left untouched.

use std::collections::HashMap;

use async_trait::async_trait;
use regex::Regex;

/// Async lookup for entities not covered by static config — typically a
/// database of previously-seen surface ids.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Resolve a canonical user/channel token (case-insensitive) to a
    /// surface id.
    async fn lookup_id(&self, kind: EntityKind, canonical: &str) -> Option<String>;

    /// Resolve a surface id back to its canonical token.
    async fn lookup_canonical(&self, kind: EntityKind, id: &str) -> Option<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    User,
    Channel,
}

/// Static, config-sourced token ↔ id mappings, consulted before the store.
#[derive(Debug, Clone, Default)]
pub struct EntityConfig {
    pub users: HashMap<String, String>,
    pub channels: HashMap<String, String>,
}

impl EntityConfig {
    fn id_for(&self, kind: EntityKind, canonical: &str) -> Option<String> {
        let map = match kind {
            EntityKind::User => &self.users,
            EntityKind::Channel => &self.channels,
        };
        let needle = canonical.to_ascii_lowercase();
        map.iter()
            .find(|(k, _)| k.to_ascii_lowercase() == needle)
            .map(|(_, v)| v.clone())
    }

    fn canonical_for(&self, kind: EntityKind, id: &str) -> Option<String> {
        let map = match kind {
            EntityKind::User => &self.users,
            EntityKind::Channel => &self.channels,
        };
        map.iter().find(|(_, v)| *v == id).map(|(k, _)| k.clone())
    }
}

pub struct EntityMapper<S: EntityStore> {
    config: EntityConfig,
    store: S,
    outgoing_token: Regex,
    incoming_mention: Regex,
}

impl<S: EntityStore> EntityMapper<S> {
    pub fn new(config: EntityConfig, store: S) -> Self {
        Self {
            config,
            store,
            // `@` or `#` preceded by start-of-string or a non-word char,
            // followed by letters/digits/underscore/`.`/`-`.
            outgoing_token: Regex::new(r"(^|[^\w])([@#])([\w.-]+)").unwrap(),
            // `<@id>`, `<@!id>`, `<#id>`.
            incoming_mention: Regex::new(r"<([@#])(!)?(\d+|[\w.-]+)>").unwrap(),
        }
    }

    /// Rewrite canonical tokens to surface mentions. Only text outside
    /// code spans is touched.
    pub async fn rewrite_outgoing(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for segment in split_code_spans(text) {
            match segment {
                Segment::Code(s) => out.push_str(s),
                Segment::Text(s) => out.push_str(&self.rewrite_outgoing_segment(s).await),
            }
        }
        out
    }

    async fn rewrite_outgoing_segment(&self, text: &str) -> String {
        // Collect match spans first (regex crate has no async replace_all).
        let mut matches = Vec::new();
        for caps in self.outgoing_token.captures_iter(text) {
            let whole = caps.get(0).unwrap();
            let lead = caps.get(1).unwrap().as_str();
            let sigil = caps.get(2).unwrap().as_str();
            let token = caps.get(3).unwrap().as_str();
            matches.push((whole.start(), whole.end(), lead.to_string(), sigil.to_string(), token.to_string()));
        }

        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for (start, end, lead, sigil, token) in matches {
            out.push_str(&text[cursor..start]);
            let kind = if sigil == "@" { EntityKind::User } else { EntityKind::Channel };
            let resolved = self.config.id_for(kind, &token);
            let resolved = match resolved {
                Some(id) => Some(id),
                None => self.store.lookup_id(kind, &token).await,
            };
            out.push_str(&lead);
            match resolved {
                Some(id) => out.push_str(&format!("<{sigil}{id}>")),
                None => out.push_str(&format!("{sigil}{token}")),
            }
            cursor = end;
        }
        out.push_str(&text[cursor..]);
        out
    }

    /// Rewrite surface mentions back into canonical tokens.
    pub async fn normalize_incoming(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        for segment in split_code_spans(text) {
            match segment {
                Segment::Code(s) => out.push_str(s),
                Segment::Text(s) => out.push_str(&self.normalize_incoming_segment(s).await),
            }
        }
        out
    }

    async fn normalize_incoming_segment(&self, text: &str) -> String {
        let mut matches = Vec::new();
        for caps in self.incoming_mention.captures_iter(text) {
            let whole = caps.get(0).unwrap();
            let sigil = caps.get(1).unwrap().as_str().to_string();
            let id = caps.get(3).unwrap().as_str().to_string();
            matches.push((whole.start(), whole.end(), sigil, id));
        }

        let mut out = String::with_capacity(text.len());
        let mut cursor = 0;
        for (start, end, sigil, id) in matches {
            out.push_str(&text[cursor..start]);
            let kind = if sigil == "@" { EntityKind::User } else { EntityKind::Channel };
            let canonical = self
                .config
                .canonical_for(kind, &id)
                .or(self.store.lookup_canonical(kind, &id).await)
                .unwrap_or_else(|| fallback_canonical(kind, &id));
            out.push_str(&format!("{sigil}{canonical}"));
            cursor = end;
        }
        out.push_str(&text[cursor..]);
        out
    }
}

/// An [`EntityStore`] with no backing data — every lookup misses. Used when
/// a deployment has no surface-id directory beyond [`EntityConfig`]'s static
/// mappings, so [`EntityMapper`] can still be constructed as a concrete,
/// non-generic field on `AppState`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEntityStore;

#[async_trait]
impl EntityStore for NullEntityStore {
    async fn lookup_id(&self, _kind: EntityKind, _canonical: &str) -> Option<String> {
        None
    }

    async fn lookup_canonical(&self, _kind: EntityKind, _id: &str) -> Option<String> {
        None
    }
}

fn fallback_canonical(kind: EntityKind, id: &str) -> String {
    match kind {
        EntityKind::User => format!("user_{id}"),
        EntityKind::Channel => format!("channel_{id}"),
    }
}

enum Segment<'a> {
    Text(&'a str),
    Code(&'a str),
}

/// Split `text` into alternating text/code segments. Code spans are inline
/// `` `...` `` runs and fenced ` ``` ... ``` ` blocks; an unclosed fence
/// extends to the end of the string.
fn split_code_spans(text: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0usize;
    let mut text_start = 0usize;

    while i < bytes.len() {
        if bytes[i] == b'`' {
            let fence_len = if text[i..].starts_with("```") { 3 } else { 1 };
            if i > text_start {
                segments.push(Segment::Text(&text[text_start..i]));
            }
            let close = text[i + fence_len..].find(&"`".repeat(fence_len));
            let end = match close {
                Some(rel) => i + fence_len + rel + fence_len,
                None => text.len(),
            };
            segments.push(Segment::Code(&text[i..end]));
            i = end;
            text_start = end;
        } else {
            i += 1;
        }
    }
    if text_start < text.len() {
        segments.push(Segment::Text(&text[text_start..]));
    }
    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as Map;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct MockStore {
        id_by_canonical: Map<(String, String), String>,
        canonical_by_id: Map<(String, String), String>,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl EntityStore for MockStore {
        async fn lookup_id(&self, kind: EntityKind, canonical: &str) -> Option<String> {
            self.calls.lock().await.push(format!("lookup_id:{canonical}"));
            let key = (format!("{kind:?}"), canonical.to_ascii_lowercase());
            self.id_by_canonical.get(&key).cloned()
        }
        async fn lookup_canonical(&self, kind: EntityKind, id: &str) -> Option<String> {
            self.calls.lock().await.push(format!("lookup_canonical:{id}"));
            let key = (format!("{kind:?}"), id.to_string());
            self.canonical_by_id.get(&key).cloned()
        }
    }

    fn config_with(user: &str, user_id: &str, channel: &str, channel_id: &str) -> EntityConfig {
        let mut users = HashMap::new();
        users.insert(user.to_string(), user_id.to_string());
        let mut channels = HashMap::new();
        channels.insert(channel.to_string(), channel_id.to_string());
        EntityConfig { users, channels }
    }

    #[test]
    fn split_code_spans_handles_inline_and_fenced() {
        let text = "hi @bob `@not_a_mention` more ```\n@also_not\n```tail";
        let segs = split_code_spans(text);
        let rendered: Vec<&str> = segs
            .iter()
            .map(|s| match s {
                Segment::Text(t) => *t,
                Segment::Code(c) => *c,
            })
            .collect();
        assert_eq!(
            rendered,
            vec![
                "hi @bob ",
                "`@not_a_mention`",
                " more ",
                "```\n@also_not\n```",
                "tail",
            ]
        );
    }

    #[test]
    fn split_code_spans_unclosed_fence_runs_to_end() {
        let text = "before ```unterminated fence stays open";
        let segs = split_code_spans(text);
        match segs.last().unwrap() {
            Segment::Code(c) => assert_eq!(*c, "```unterminated fence stays open"),
            _ => panic!("expected unclosed fence to be treated as code"),
        }
    }

    #[tokio::test]
    async fn outgoing_rewrite_prefers_config_over_store() {
        let config = config_with("alice", "111", "general", "222");
        let store = MockStore::default();
        let mapper = EntityMapper::new(config, store);

        let out = mapper.rewrite_outgoing("hello @alice in #general").await;
        assert_eq!(out, "hello <@111> in <#222>");
        assert!(mapper.store.calls.lock().await.is_empty());
    }

    #[tokio::test]
    async fn outgoing_rewrite_falls_back_to_store() {
        let config = EntityConfig::default();
        let mut store = MockStore::default();
        store
            .id_by_canonical
            .insert(("User".to_string(), "bob".to_string()), "999".to_string());
        let mapper = EntityMapper::new(config, store);

        let out = mapper.rewrite_outgoing("ping @bob please").await;
        assert_eq!(out, "ping <@999> please");
    }

    #[tokio::test]
    async fn outgoing_rewrite_leaves_unresolvable_token_untouched() {
        let mapper = EntityMapper::new(EntityConfig::default(), MockStore::default());
        let out = mapper.rewrite_outgoing("no match for @ghost here").await;
        assert_eq!(out, "no match for @ghost here");
    }

    #[tokio::test]
    async fn outgoing_rewrite_skips_code_spans() {
        let config = config_with("alice", "111", "general", "222");
        let mapper = EntityMapper::new(config, MockStore::default());
        let out = mapper
            .rewrite_outgoing("say @alice but not `@alice` in code")
            .await;
        assert_eq!(out, "say <@111> but not `@alice` in code");
    }

    #[tokio::test]
    async fn incoming_normalize_prefers_config_then_store_then_fallback() {
        let config = config_with("alice", "111", "general", "222");
        let mut store = MockStore::default();
        store.canonical_by_id.insert(
            ("User".to_string(), "999".to_string()),
            "bob".to_string(),
        );
        let mapper = EntityMapper::new(config, store);

        let out = mapper
            .normalize_incoming("<@111> and <@999> and <@777> and <#222>")
            .await;
        assert_eq!(out, "@alice and @bob and @user_777 and #general");
    }

    #[tokio::test]
    async fn incoming_normalize_handles_nickname_bang_form() {
        let config = config_with("alice", "111", "general", "222");
        let mapper = EntityMapper::new(config, MockStore::default());
        let out = mapper.normalize_incoming("hey <@!111>").await;
        assert_eq!(out, "hey @alice");
    }

    #[tokio::test]
    async fn incoming_normalize_skips_code_spans() {
        let config = config_with("alice", "111", "general", "222");
        let mapper = EntityMapper::new(config, MockStore::default());
        let out = mapper
            .normalize_incoming("real <@111> but `<@111>` in code")
            .await;
        assert_eq!(out, "real @alice but `<@111>` in code");
    }
}
