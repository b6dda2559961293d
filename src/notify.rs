// Best-effort delivery of notifications to the messaging gateway

use async_trait::async_trait;
use eyre::{Context, Result, eyre};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Characters that must be backslash-escaped in MarkdownV2 text
const MARKDOWN_SPECIAL: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

/// Escapes `text` for the gateway's markup dialect
pub fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if MARKDOWN_SPECIAL.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Outbound messaging gateway
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<()>;

    async fn send_photo(&self, chat_id: i64, caption: &str, image: &[u8]) -> Result<()>;

    /// Whether the gateway can reach `chat_id`
    async fn validate_chat(&self, chat_id: i64) -> Result<bool>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NotifyBody<'a> {
    chat_id: i64,
    text: &'a str,
}

/// Gateway reached over HTTP
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpGateway {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build gateway HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<()> {
        let url = format!("{}/notify", self.base_url);
        self.client
            .post(&url)
            .json(&NotifyBody { chat_id, text })
            .send()
            .await
            .context("Failed to reach gateway")?
            .error_for_status()
            .context("Gateway rejected text message")?;
        Ok(())
    }

    async fn send_photo(&self, chat_id: i64, caption: &str, image: &[u8]) -> Result<()> {
        let url = format!("{}/notify/photo", self.base_url);
        let form = reqwest::multipart::Form::new()
            .text("chatId", chat_id.to_string())
            .text("caption", caption.to_string())
            .part(
                "file",
                reqwest::multipart::Part::bytes(image.to_vec()).file_name("image.jpg"),
            );

        self.client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .context("Failed to reach gateway")?
            .error_for_status()
            .context("Gateway rejected photo")?;
        Ok(())
    }

    async fn validate_chat(&self, chat_id: i64) -> Result<bool> {
        let url = format!("{}/check/{}", self.base_url, chat_id);
        let response = self.client.get(&url).send().await.context("Failed to reach gateway")?;
        Ok(response.status().is_success())
    }
}

/// What was handed to a [`MemoryGateway`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub chat_id: i64,
    pub text: String,
    /// Byte length of the attached image, if any
    pub image_len: Option<usize>,
}

/// Gateway that records deliveries instead of sending them.
/// Backs `--dry-run` and the tests.
#[derive(Default)]
pub struct MemoryGateway {
    deliveries: Mutex<Vec<Delivery>>,
    fail: bool,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gateway whose every call fails
    pub fn failing() -> Self {
        Self {
            deliveries: Mutex::new(Vec::new()),
            fail: true,
        }
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().map(|d| d.clone()).unwrap_or_default()
    }

    fn record(&self, delivery: Delivery) -> Result<()> {
        if self.fail {
            return Err(eyre!("gateway unavailable"));
        }
        info!(chat_id = delivery.chat_id, text = %delivery.text, "dry-run delivery");
        self.deliveries
            .lock()
            .map_err(|_| eyre!("delivery log poisoned"))?
            .push(delivery);
        Ok(())
    }
}

#[async_trait]
impl Gateway for MemoryGateway {
    async fn send_text(&self, chat_id: i64, text: &str) -> Result<()> {
        self.record(Delivery {
            chat_id,
            text: text.to_string(),
            image_len: None,
        })
    }

    async fn send_photo(&self, chat_id: i64, caption: &str, image: &[u8]) -> Result<()> {
        self.record(Delivery {
            chat_id,
            text: caption.to_string(),
            image_len: Some(image.len()),
        })
    }

    async fn validate_chat(&self, _chat_id: i64) -> Result<bool> {
        Ok(!self.fail)
    }
}

/// Message body handed to the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Text(String),
    Photo { caption: String, image: Vec<u8> },
}

/// Fire-and-forget front of a [`Gateway`]
#[derive(Clone)]
pub struct Dispatcher {
    gateway: Arc<dyn Gateway>,
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Dispatcher {
    pub fn new(gateway: Arc<dyn Gateway>) -> Self {
        Self {
            gateway,
            pending: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Sends `payload` to `chat_id`; a missing chat is a silent no-op and
    /// failures are logged, never returned
    pub async fn deliver(&self, chat_id: Option<i64>, payload: Payload) {
        let Some(chat_id) = chat_id else {
            debug!("No chat bound, skipping notification");
            return;
        };

        let result = match &payload {
            Payload::Text(text) => self.gateway.send_text(chat_id, text).await,
            Payload::Photo { caption, image } => {
                if image.is_empty() {
                    return;
                }
                self.gateway.send_photo(chat_id, caption, image).await
            }
        };

        match result {
            Ok(()) => debug!(chat_id, "Notification delivered"),
            Err(e) => warn!(chat_id, error = %e, "Notification not delivered"),
        }
    }

    /// Runs [`Dispatcher::deliver`] on its own task so the caller never waits.
    /// Returns whether a delivery was queued.
    pub fn spawn(&self, chat_id: Option<i64>, payload: Payload) -> bool {
        if chat_id.is_none() {
            debug!("No chat bound, skipping notification");
            return false;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!("No async runtime, dropping notification");
            return false;
        };

        let dispatcher = self.clone();
        let handle = runtime.spawn(async move { dispatcher.deliver(chat_id, payload).await });
        match self.pending.lock() {
            Ok(mut pending) => {
                pending.retain(|h| !h.is_finished());
                pending.push(handle);
            }
            Err(_) => warn!("Pending delivery list poisoned, not tracking task"),
        }
        true
    }

    /// Waits for every delivery queued by [`Dispatcher::spawn`] so far
    pub async fn drain(&self) {
        let handles = match self.pending.lock() {
            Ok(mut pending) => std::mem::take(&mut *pending),
            Err(_) => return,
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Notification task failed");
            }
        }
    }

    /// Never errors; an unreachable gateway counts as invalid
    pub async fn validate_chat(&self, chat_id: i64) -> bool {
        match self.gateway.validate_chat(chat_id).await {
            Ok(valid) => valid,
            Err(e) => {
                warn!(chat_id, error = %e, "Chat validation failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_markdown() {
        assert_eq!(escape_markdown("user_name"), "user\\_name");
        assert_eq!(escape_markdown("a.b!c"), "a\\.b\\!c");
        assert_eq!(escape_markdown("(1+1=2)"), "\\(1\\+1\\=2\\)");
        assert_eq!(escape_markdown("plain text"), "plain text");
        assert_eq!(escape_markdown("#[x]{y}|~`>-*"), "\\#\\[x\\]\\{y\\}\\|\\~\\`\\>\\-\\*");
    }

    #[tokio::test]
    async fn test_deliver_without_chat_is_noop() {
        let gateway = Arc::new(MemoryGateway::new());
        let dispatcher = Dispatcher::new(gateway.clone());
        dispatcher.deliver(None, Payload::Text("hi".to_string())).await;
        assert!(gateway.deliveries().is_empty());
        assert!(!dispatcher.spawn(None, Payload::Text("hi".to_string())));
    }

    #[tokio::test]
    async fn test_deliver_records_text_and_photo() {
        let gateway = Arc::new(MemoryGateway::new());
        let dispatcher = Dispatcher::new(gateway.clone());
        dispatcher.deliver(Some(10), Payload::Text("hello".to_string())).await;
        dispatcher
            .deliver(
                Some(10),
                Payload::Photo {
                    caption: "pic".to_string(),
                    image: vec![1, 2, 3],
                },
            )
            .await;

        let deliveries = gateway.deliveries();
        assert_eq!(deliveries.len(), 2);
        assert_eq!(deliveries[0].text, "hello");
        assert_eq!(deliveries[1].image_len, Some(3));
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let dispatcher = Dispatcher::new(Arc::new(MemoryGateway::failing()));
        dispatcher.deliver(Some(1), Payload::Text("lost".to_string())).await;
        assert!(!dispatcher.validate_chat(1).await);
    }

    #[tokio::test]
    async fn test_spawn_delivers_in_background() {
        let gateway = Arc::new(MemoryGateway::new());
        let dispatcher = Dispatcher::new(gateway.clone());
        assert!(dispatcher.spawn(Some(5), Payload::Text("bg".to_string())));
        assert!(dispatcher.spawn(Some(6), Payload::Text("bg".to_string())));
        dispatcher.drain().await;
        let chats: Vec<i64> = gateway.deliveries().iter().map(|d| d.chat_id).collect();
        assert_eq!(chats.len(), 2);
        assert!(chats.contains(&5) && chats.contains(&6));
    }

    #[tokio::test]
    async fn test_http_gateway_unreachable_is_error() {
        let gateway = HttpGateway::new("http://127.0.0.1:1", Duration::from_millis(200)).unwrap();
        assert!(gateway.send_text(1, "x").await.is_err());
        let dispatcher = Dispatcher::new(Arc::new(gateway));
        assert!(!dispatcher.validate_chat(1).await);
    }
}
