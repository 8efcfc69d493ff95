use anyhow::{Context, Result};
use async_trait::async_trait;

/// A group chat the bot token has visibility into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatInfo {
    pub chat_id: String,
    pub name: String,
}

/// Outbound messaging seam. The dispatch engine only ever talks to this
/// trait; failures come back as errors, never as panics, so one bad send
/// cannot take the cycle down.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one message to one chat.
    async fn send(&self, token: &str, chat_id: &str, text: &str) -> Result<()>;

    /// Validate a token without sending user content.
    async fn test_connection(&self, token: &str) -> bool;

    /// Discover group chats the token can see. Used by configuration
    /// setup, not by the dispatch loop.
    async fn list_chats(&self, token: &str) -> Result<Vec<ChatInfo>>;
}

/// Telegram Bot API client.
pub struct TelegramTransport {
    client: reqwest::Client,
}

impl TelegramTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    fn api_url(token: &str, method: &str) -> String {
        format!("https://api.telegram.org/bot{token}/{method}")
    }
}

impl Default for TelegramTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send(&self, token: &str, chat_id: &str, text: &str) -> Result<()> {
        let body = serde_json::json!({
            "chat_id": chat_id,
            "text": text,
            "parse_mode": "HTML"
        });

        self.client
            .post(Self::api_url(token, "sendMessage"))
            .json(&body)
            .send()
            .await
            .context("Telegram sendMessage request failed")?
            .error_for_status()
            .context("Telegram rejected sendMessage")?;

        Ok(())
    }

    async fn test_connection(&self, token: &str) -> bool {
        self.client
            .get(Self::api_url(token, "getMe"))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn list_chats(&self, token: &str) -> Result<Vec<ChatInfo>> {
        let body = serde_json::json!({
            "limit": 100,
            "allowed_updates": ["message", "my_chat_member"]
        });

        let resp = self
            .client
            .post(Self::api_url(token, "getUpdates"))
            .json(&body)
            .send()
            .await
            .context("Telegram getUpdates request failed")?;

        let data: serde_json::Value = resp
            .json()
            .await
            .context("Telegram getUpdates returned invalid JSON")?;

        Ok(group_chats_from_updates(&data))
    }
}

/// Pull group/supergroup chats out of a getUpdates response, deduplicated
/// by chat id in first-seen order.
fn group_chats_from_updates(data: &serde_json::Value) -> Vec<ChatInfo> {
    let mut chats: Vec<ChatInfo> = Vec::new();

    let Some(results) = data.get("result").and_then(serde_json::Value::as_array) else {
        return chats;
    };

    for update in results {
        let chat = update
            .get("message")
            .and_then(|m| m.get("chat"))
            .or_else(|| update.get("my_chat_member").and_then(|m| m.get("chat")));

        let Some(chat) = chat else { continue };

        let chat_type = chat.get("type").and_then(serde_json::Value::as_str);
        if !matches!(chat_type, Some("group" | "supergroup")) {
            continue;
        }

        let Some(id) = chat.get("id").and_then(serde_json::Value::as_i64) else {
            continue;
        };
        let chat_id = id.to_string();

        if chats.iter().any(|c| c.chat_id == chat_id) {
            continue;
        }

        let name = chat
            .get("title")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("Unnamed group")
            .to_string();

        chats.push(ChatInfo { chat_id, name });
    }

    chats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_url_embeds_token_and_method() {
        assert_eq!(
            TelegramTransport::api_url("123:ABC", "getMe"),
            "https://api.telegram.org/bot123:ABC/getMe"
        );
    }

    #[test]
    fn group_chats_extracted_from_messages_and_membership_updates() {
        let data = serde_json::json!({
            "ok": true,
            "result": [
                { "update_id": 1, "message": { "chat": { "id": -100, "type": "group", "title": "Ops" } } },
                { "update_id": 2, "my_chat_member": { "chat": { "id": -200, "type": "supergroup", "title": "News" } } }
            ]
        });
        let chats = group_chats_from_updates(&data);
        assert_eq!(
            chats,
            vec![
                ChatInfo {
                    chat_id: "-100".into(),
                    name: "Ops".into()
                },
                ChatInfo {
                    chat_id: "-200".into(),
                    name: "News".into()
                },
            ]
        );
    }

    #[test]
    fn group_chats_ignore_private_chats() {
        let data = serde_json::json!({
            "ok": true,
            "result": [
                { "update_id": 1, "message": { "chat": { "id": 42, "type": "private" } } }
            ]
        });
        assert!(group_chats_from_updates(&data).is_empty());
    }

    #[test]
    fn group_chats_deduplicate_by_id() {
        let data = serde_json::json!({
            "ok": true,
            "result": [
                { "update_id": 1, "message": { "chat": { "id": -100, "type": "group", "title": "Ops" } } },
                { "update_id": 2, "message": { "chat": { "id": -100, "type": "group", "title": "Ops" } } }
            ]
        });
        assert_eq!(group_chats_from_updates(&data).len(), 1);
    }

    #[test]
    fn group_chats_fall_back_to_placeholder_title() {
        let data = serde_json::json!({
            "ok": true,
            "result": [
                { "update_id": 1, "message": { "chat": { "id": -300, "type": "group" } } }
            ]
        });
        assert_eq!(group_chats_from_updates(&data)[0].name, "Unnamed group");
    }

    #[test]
    fn group_chats_empty_on_malformed_payload() {
        assert!(group_chats_from_updates(&serde_json::json!({"ok": false})).is_empty());
        assert!(group_chats_from_updates(&serde_json::json!(null)).is_empty());
    }
}
