//! REST client for the Transmit mailbox API.
//!
//! All reads go through the shared cache; every mutation invalidates the
//! affected keys before returning. Idempotent GETs retry with exponential
//! backoff and full jitter; writes are issued exactly once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::Rng;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::cache::{keys, ttl, CacheManager};
use crate::config::GatewayConfig;
use crate::error::{Error, Result};

use super::types::{
    FlagAction, FolderStatus, MailboxFolder, MailboxMessage, MessageBody, MessageQuery,
    OutboundMessage, Sender,
};
use super::MailboxBackend;

const RETRY_MAX_ATTEMPTS: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(250);
const RETRY_CAP: Duration = Duration::from_secs(10);

pub struct TransmitClient {
    http: reqwest::Client,
    base_url: String,
    cache: Arc<CacheManager>,
    /// Process-global key -> (workspace id, validated-at). Successes only.
    key_cache: Mutex<HashMap<String, (String, Instant)>>,
    key_cache_ttl: Duration,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkspaceResponse {
    workspace_id: String,
}

#[derive(Deserialize)]
struct AccountsResponse {
    accounts: Vec<Sender>,
}

#[derive(Deserialize)]
struct FoldersResponse {
    folders: Vec<MailboxFolder>,
}

#[derive(Deserialize)]
struct MessagesResponse {
    messages: Vec<MailboxMessage>,
}

#[derive(Deserialize)]
struct UidResponse {
    uid: u32,
}

#[derive(Deserialize)]
struct SearchResponse {
    uids: Vec<u32>,
}

#[derive(Deserialize)]
struct FlagsResponse {
    flags: Vec<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FlagsRequest<'a> {
    action: FlagAction,
    folder: &'a str,
    flags: &'a [String],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CopyMoveRequest<'a> {
    folder: &'a str,
    target_folder: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AppendRequest<'a> {
    raw: String,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    flags: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    date: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    criteria: &'a [String],
}

#[derive(Serialize)]
struct CreateFolderRequest<'a> {
    name: &'a str,
}

impl TransmitClient {
    pub fn new(config: &GatewayConfig, cache: Arc<CacheManager>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.api_timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            base_url: config.api_base.clone(),
            cache,
            key_cache: Mutex::new(HashMap::new()),
            key_cache_ttl: config.api_key_cache_ttl,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// GET with retry on transient failure. The request is rebuilt for every
    /// attempt; writes never come through here.
    async fn get_with_retry<T: DeserializeOwned>(
        &self,
        operation: &str,
        key: &str,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        let mut attempt: u32 = 0;
        loop {
            let result = async {
                let mut request = self.http.get(url).bearer_auth(key);
                if !params.is_empty() {
                    request = request.query(params);
                }
                Self::read_json::<T>(request.send().await?).await
            }
            .await;

            match result {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 < RETRY_MAX_ATTEMPTS && e.is_transient() => {
                    let exp = RETRY_BASE
                        .saturating_mul(2u32.saturating_pow(attempt))
                        .min(RETRY_CAP);
                    // Full jitter: sleep anywhere in [0, exp].
                    let sleep_ms = rand::thread_rng().gen_range(0..=exp.as_millis() as u64);
                    tracing::debug!(
                        "Retrying {} after {} (sleeping {} ms, attempt {})",
                        operation,
                        e,
                        sleep_ms,
                        attempt + 1
                    );
                    tokio::time::sleep(Duration::from_millis(sleep_ms)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let status = resp.status();
        if status.is_success() {
            Ok(resp.json().await?)
        } else {
            Err(Self::status_error(status, resp.text().await.unwrap_or_default()))
        }
    }

    async fn read_unit(resp: reqwest::Response) -> Result<()> {
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Self::status_error(status, resp.text().await.unwrap_or_default()))
        }
    }

    fn status_error(status: StatusCode, body: String) -> Error {
        let mut message = body;
        if message.len() > 200 {
            let mut end = 200;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }
        match status.as_u16() {
            401 | 403 => Error::Auth("upstream rejected the API key".to_string()),
            404 => Error::MailboxNotFound(message),
            429 => Error::RateLimited,
            s => Error::Upstream { status: s, message },
        }
    }
}

#[async_trait]
impl MailboxBackend for TransmitClient {
    async fn validate_key(&self, key: &str) -> Result<String> {
        {
            let cached = self.key_cache.lock().unwrap();
            if let Some((workspace, at)) = cached.get(key) {
                if at.elapsed() < self.key_cache_ttl {
                    return Ok(workspace.clone());
                }
            }
        }

        let url = self.url("/api/workspaces");
        let resp: WorkspaceResponse = self
            .get_with_retry("validate_key", key, &url, &[])
            .await?;

        self.key_cache
            .lock()
            .unwrap()
            .insert(key.to_string(), (resp.workspace_id.clone(), Instant::now()));
        Ok(resp.workspace_id)
    }

    async fn list_senders(&self, key: &str) -> Result<Vec<Sender>> {
        if let Some(senders) = self.cache.get_json::<Vec<Sender>>(keys::SENDERS_ALL) {
            return Ok(senders);
        }

        let url = self.url("/api/mailbox/accounts");
        let resp: AccountsResponse = self
            .get_with_retry("list_senders", key, &url, &[])
            .await?;

        self.cache
            .put_json(keys::SENDERS_ALL, &resp.accounts, ttl::SENDER);
        for sender in &resp.accounts {
            self.cache
                .put_json(&keys::sender(&sender.email), sender, ttl::SENDER);
        }
        Ok(resp.accounts)
    }

    async fn sender_by_email(&self, key: &str, email: &str) -> Result<Option<Sender>> {
        if let Some(sender) = self.cache.get_json::<Sender>(&keys::sender(email)) {
            return Ok(Some(sender));
        }
        let senders = self.list_senders(key).await?;
        Ok(senders
            .into_iter()
            .find(|s| s.email.eq_ignore_ascii_case(email)))
    }

    async fn list_folders(&self, key: &str, sender_id: &str) -> Result<Vec<MailboxFolder>> {
        let cache_key = keys::folders(sender_id);
        if let Some(folders) = self.cache.get_json::<Vec<MailboxFolder>>(&cache_key) {
            return Ok(folders);
        }

        let url = self.url(&format!("/api/mailbox/{}/folders", sender_id));
        let resp: FoldersResponse = self
            .get_with_retry("list_folders", key, &url, &[])
            .await?;

        self.cache.put_json(&cache_key, &resp.folders, ttl::FOLDERS);
        Ok(resp.folders)
    }

    async fn folder_status(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
    ) -> Result<FolderStatus> {
        let cache_key = keys::status(sender_id, folder);
        if let Some(status) = self.cache.get_json::<FolderStatus>(&cache_key) {
            return Ok(status);
        }

        let url = self.url(&format!(
            "/api/mailbox/{}/folders/{}/status",
            sender_id, folder
        ));
        let status: FolderStatus = self
            .get_with_retry("folder_status", key, &url, &[])
            .await?;

        self.cache.put_json(&cache_key, &status, ttl::FOLDER_STATUS);
        Ok(status)
    }

    async fn list_messages(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        query: &MessageQuery,
    ) -> Result<Vec<MailboxMessage>> {
        let canonical = query.canonical();
        let cache_key = keys::messages(
            sender_id,
            folder,
            if canonical.is_empty() {
                None
            } else {
                Some(&canonical)
            },
        );
        if let Some(messages) = self.cache.get_json::<Vec<MailboxMessage>>(&cache_key) {
            return Ok(messages);
        }

        let url = self.url(&format!(
            "/api/mailbox/{}/folders/{}/messages",
            sender_id, folder
        ));
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(uids) = &query.uids {
            let list: Vec<String> = uids.iter().map(|u| u.to_string()).collect();
            params.push(("uids", list.join(",")));
        }
        if !query.fields.is_empty() {
            let fields: Vec<&str> = query.fields.iter().map(|f| f.as_str()).collect();
            params.push(("fields", fields.join(",")));
        }
        if let Some(limit) = query.limit {
            params.push(("limit", limit.to_string()));
        }
        if let Some(offset) = query.offset {
            params.push(("offset", offset.to_string()));
        }

        let resp: MessagesResponse = self
            .get_with_retry("list_messages", key, &url, &params)
            .await?;

        self.cache.put_json(&cache_key, &resp.messages, ttl::MESSAGES);
        Ok(resp.messages)
    }

    async fn get_message(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        uid: u32,
    ) -> Result<Option<MailboxMessage>> {
        let cache_key = keys::message(sender_id, folder, uid);
        if let Some(message) = self.cache.get_json::<MailboxMessage>(&cache_key) {
            return Ok(Some(message));
        }

        let url = self.url(&format!("/api/mailbox/{}/messages/{}", sender_id, uid));
        let params = [("folder", folder.to_string())];
        let result: Result<MailboxMessage> =
            self.get_with_retry("get_message", key, &url, &params).await;

        match result {
            Ok(message) => {
                self.cache.put_json(&cache_key, &message, ttl::MESSAGES);
                Ok(Some(message))
            }
            Err(Error::MailboxNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn get_body(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        uid: u32,
        peek: bool,
    ) -> Result<Option<MessageBody>> {
        let cache_key = keys::body(sender_id, folder, uid);
        if let Some(blob) = self.cache.get_body_blob(&cache_key).await {
            if let Ok(body) = serde_json::from_slice::<MessageBody>(&blob) {
                return Ok(Some(body));
            }
        }

        let url = self.url(&format!(
            "/api/mailbox/{}/messages/{}/body",
            sender_id, uid
        ));
        let params = [
            ("folder", folder.to_string()),
            ("peek", peek.to_string()),
        ];
        let result: Result<MessageBody> =
            self.get_with_retry("get_body", key, &url, &params).await;

        match result {
            Ok(body) => {
                if let Ok(blob) = serde_json::to_vec(&body) {
                    self.cache.put_body_blob(&cache_key, blob).await;
                }
                Ok(Some(body))
            }
            Err(Error::MailboxNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update_flags(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        uid: u32,
        action: FlagAction,
        flags: &[String],
    ) -> Result<Vec<String>> {
        let url = self.url(&format!(
            "/api/mailbox/{}/messages/{}/flags",
            sender_id, uid
        ));
        let resp: FlagsResponse = Self::read_json(
            self.http
                .patch(&url)
                .bearer_auth(key)
                .json(&FlagsRequest {
                    action,
                    folder,
                    flags,
                })
                .send()
                .await?,
        )
        .await?;

        self.cache.invalidate_message(sender_id, folder, uid).await;
        Ok(resp.flags)
    }

    async fn copy_message(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        target: &str,
        uid: u32,
    ) -> Result<u32> {
        let url = self.url(&format!(
            "/api/mailbox/{}/messages/{}/copy",
            sender_id, uid
        ));
        let resp: UidResponse = Self::read_json(
            self.http
                .post(&url)
                .bearer_auth(key)
                .json(&CopyMoveRequest {
                    folder,
                    target_folder: target,
                })
                .send()
                .await?,
        )
        .await?;

        self.cache.invalidate_folder(sender_id, target).await;
        Ok(resp.uid)
    }

    async fn move_message(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        target: &str,
        uid: u32,
    ) -> Result<u32> {
        let url = self.url(&format!(
            "/api/mailbox/{}/messages/{}/move",
            sender_id, uid
        ));
        let resp: UidResponse = Self::read_json(
            self.http
                .post(&url)
                .bearer_auth(key)
                .json(&CopyMoveRequest {
                    folder,
                    target_folder: target,
                })
                .send()
                .await?,
        )
        .await?;

        self.cache.invalidate_folder(sender_id, folder).await;
        self.cache.invalidate_folder(sender_id, target).await;
        Ok(resp.uid)
    }

    async fn append_message(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        raw: &[u8],
        flags: &[String],
        date: Option<DateTime<Utc>>,
    ) -> Result<u32> {
        let url = self.url(&format!(
            "/api/mailbox/{}/folders/{}/append",
            sender_id, folder
        ));
        let resp: UidResponse = Self::read_json(
            self.http
                .post(&url)
                .bearer_auth(key)
                .json(&AppendRequest {
                    raw: BASE64.encode(raw),
                    flags,
                    date,
                })
                .send()
                .await?,
        )
        .await?;

        self.cache.invalidate_folder(sender_id, folder).await;
        Ok(resp.uid)
    }

    async fn delete_message(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        uid: u32,
        expunge: bool,
    ) -> Result<()> {
        let url = self.url(&format!("/api/mailbox/{}/messages/{}", sender_id, uid));
        let params = [
            ("folder", folder.to_string()),
            ("expunge", expunge.to_string()),
        ];
        Self::read_unit(
            self.http
                .delete(&url)
                .query(&params)
                .bearer_auth(key)
                .send()
                .await?,
        )
        .await?;

        self.cache.invalidate_message(sender_id, folder, uid).await;
        Ok(())
    }

    async fn search(
        &self,
        key: &str,
        sender_id: &str,
        folder: &str,
        criteria: &[String],
    ) -> Result<Vec<u32>> {
        let url = self.url(&format!(
            "/api/mailbox/{}/folders/{}/search",
            sender_id, folder
        ));
        let resp: SearchResponse = Self::read_json(
            self.http
                .post(&url)
                .bearer_auth(key)
                .json(&SearchRequest { criteria })
                .send()
                .await?,
        )
        .await?;
        Ok(resp.uids)
    }

    async fn sync_mailbox(&self, key: &str, sender_id: &str) -> Result<()> {
        let url = self.url(&format!("/api/mailbox/{}/sync", sender_id));
        Self::read_unit(self.http.post(&url).bearer_auth(key).send().await?).await?;
        self.cache.invalidate_sender(sender_id).await;
        Ok(())
    }

    async fn create_folder(&self, key: &str, sender_id: &str, name: &str) -> Result<()> {
        let url = self.url(&format!("/api/mailbox/{}/folders", sender_id));
        Self::read_unit(
            self.http
                .post(&url)
                .bearer_auth(key)
                .json(&CreateFolderRequest { name })
                .send()
                .await?,
        )
        .await?;
        self.cache.delete(&keys::folders(sender_id));
        Ok(())
    }

    async fn delete_folder(&self, key: &str, sender_id: &str, folder_id: &str) -> Result<()> {
        let url = self.url(&format!(
            "/api/mailbox/{}/folders/{}",
            sender_id, folder_id
        ));
        Self::read_unit(self.http.delete(&url).bearer_auth(key).send().await?).await?;
        self.cache.delete(&keys::folders(sender_id));
        Ok(())
    }

    async fn send_message(&self, key: &str, message: &OutboundMessage) -> Result<()> {
        let url = self.url("/api/send");
        Self::read_unit(
            self.http
                .post(&url)
                .bearer_auth(key)
                .json(message)
                .send()
                .await?,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Timeout.is_transient());
        assert!(Error::RateLimited.is_transient());
        assert!(Error::Network("reset".to_string()).is_transient());
        for status in [502u16, 503] {
            assert!(Error::Upstream {
                status,
                message: String::new()
            }
            .is_transient());
        }
        assert!(!Error::Upstream {
            status: 500,
            message: String::new()
        }
        .is_transient());
        assert!(!Error::Auth("nope".to_string()).is_transient());
    }

    #[test]
    fn test_status_error_mapping() {
        assert!(matches!(
            TransmitClient::status_error(StatusCode::UNAUTHORIZED, String::new()),
            Error::Auth(_)
        ));
        assert!(matches!(
            TransmitClient::status_error(StatusCode::NOT_FOUND, String::new()),
            Error::MailboxNotFound(_)
        ));
        assert!(matches!(
            TransmitClient::status_error(StatusCode::TOO_MANY_REQUESTS, String::new()),
            Error::RateLimited
        ));
        assert!(matches!(
            TransmitClient::status_error(StatusCode::BAD_GATEWAY, String::new()),
            Error::Upstream { status: 502, .. }
        ));
    }

    #[test]
    fn test_key_format_gate() {
        assert!(super::super::is_valid_key_format("pm_live_abc123"));
        assert!(super::super::is_valid_key_format("pm_test_abc123"));
        assert!(!super::super::is_valid_key_format("sk_live_abc123"));
        assert!(!super::super::is_valid_key_format("password"));
    }
}
