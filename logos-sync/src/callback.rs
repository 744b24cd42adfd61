//! Debounced HTTP change notifications.
//!
//! After a burst of updates in a room settles (`debounce_wait` without a new
//! update, or `debounce_max_wait` after the first one) the configured shared
//! types are read from the room document and POSTed as
//!
//! ```json
//! {"room": "<name>", "data": {"<shared name>": {"type": "Text", "content": "..."}}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use yrs::{GetString, ReadTxn, Transact};

use crate::room::Room;

/// Shared type kinds that can be reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SharedKind {
    Text,
    XmlFragment,
}

#[derive(Debug, Clone)]
pub struct CallbackConfig {
    pub url: String,
    pub debounce_wait: Duration,
    pub debounce_max_wait: Duration,
    pub timeout: Duration,
    /// Shared name → kind to include in each notification
    pub objects: BTreeMap<String, SharedKind>,
}

impl CallbackConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            debounce_wait: Duration::from_millis(2000),
            debounce_max_wait: Duration::from_millis(10_000),
            timeout: Duration::from_millis(5000),
            objects: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Serialize)]
struct SharedContent {
    #[serde(rename = "type")]
    kind: SharedKind,
    content: Value,
}

#[derive(Debug, Serialize)]
struct Notification {
    room: String,
    data: BTreeMap<String, SharedContent>,
}

/// Sends change notifications for every room it is attached to.
pub struct CallbackHook {
    config: CallbackConfig,
    client: reqwest::Client,
}

impl CallbackHook {
    pub fn new(config: CallbackConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &CallbackConfig {
        &self.config
    }

    /// Start notifying for `room` until its listeners are dropped.
    pub fn attach(self: &Arc<Self>, room: &Arc<Room>) {
        let (signals, signal_rx) = mpsc::unbounded_channel();
        room.observe_updates(move |_| {
            let _ = signals.send(());
        });
        let hook = self.clone();
        let room = Arc::downgrade(room);
        tokio::spawn(async move { hook.run(room, signal_rx).await });
    }

    async fn run(&self, room: Weak<Room>, mut signals: mpsc::UnboundedReceiver<()>) {
        while signals.recv().await.is_some() {
            let deadline = Instant::now() + self.config.debounce_max_wait;
            loop {
                let wake = (Instant::now() + self.config.debounce_wait).min(deadline);
                tokio::select! {
                    signal = signals.recv() => {
                        if signal.is_none() || Instant::now() >= deadline {
                            break;
                        }
                    }
                    _ = tokio::time::sleep_until(wake) => break,
                }
            }
            let Some(room) = room.upgrade() else {
                return;
            };
            self.notify(&room).await;
        }
    }

    async fn notify(&self, room: &Room) {
        let notification = notification_for(room, &self.config.objects);
        match self
            .client
            .post(&self.config.url)
            .json(&notification)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                log::debug!("Change callback for room {} delivered", room.name());
            }
            Ok(response) => log::warn!(
                "Change callback for room {} answered {}",
                room.name(),
                response.status()
            ),
            Err(e) => log::warn!("Change callback for room {} failed: {e}", room.name()),
        }
    }
}

fn notification_for(room: &Room, objects: &BTreeMap<String, SharedKind>) -> Notification {
    let txn = room.doc().transact();
    let data = objects
        .iter()
        .map(|(name, kind)| {
            let content = match kind {
                SharedKind::Text => txn.get_text(name.as_str()).map(|t| t.get_string(&txn)),
                SharedKind::XmlFragment => txn
                    .get_xml_fragment(name.as_str())
                    .map(|x| x.get_string(&txn)),
            };
            let content = content.map_or(Value::Null, Value::String);
            (name.clone(), SharedContent { kind: *kind, content })
        })
        .collect();
    Notification {
        room: room.name().to_string(),
        data,
    }
}
