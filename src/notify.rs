// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Push notifications. Delivery is fire-and-forget: failures are logged and
//! counted, never returned to the flow that triggered them.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::metrics;
use crate::remote::ClientError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub recipients: Vec<String>,
    pub title: String,
    pub body: String,
    pub metadata: Value,
}

impl Notification {
    pub fn new(recipients: Vec<String>, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            recipients,
            title: title.into(),
            body: body.into(),
            metadata: Value::Null,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[async_trait]
pub trait PushSender: Send + Sync {
    async fn send(&self, recipients: &[String], title: &str, body: &str, metadata: &Value) -> Result<(), ClientError>;
}

/// Deliver `notification` on its own task.
pub fn dispatch(sender: Arc<dyn PushSender>, notification: Notification) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = sender
            .send(
                &notification.recipients,
                &notification.title,
                &notification.body,
                &notification.metadata,
            )
            .await;
        match result {
            Ok(()) => metrics::record_notification(true),
            Err(e) => {
                warn!(title = %notification.title, error = %e, "Push notification failed");
                metrics::record_notification(false);
            }
        }
    })
}

/// Writes notifications to the log instead of a push service.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPushSender;

#[async_trait]
impl PushSender for LogPushSender {
    async fn send(&self, recipients: &[String], title: &str, body: &str, metadata: &Value) -> Result<(), ClientError> {
        info!(recipients = recipients.len(), title, body, %metadata, "Push notification");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl PushSender for Recorder {
        async fn send(&self, _: &[String], title: &str, _: &str, _: &Value) -> Result<(), ClientError> {
            self.sent.lock().push(title.to_string());
            if self.fail {
                return Err(ClientError::http(502, "gateway"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_dispatch_delivers() {
        let recorder = Arc::new(Recorder::default());
        let note = Notification::new(vec!["mod-1".into()], "Sync conflict", "1 deletion needs review");
        dispatch(recorder.clone(), note).await.unwrap();
        assert_eq!(recorder.sent.lock().as_slice(), ["Sync conflict".to_string()]);
    }

    #[tokio::test]
    async fn test_dispatch_swallows_failure() {
        let recorder = Arc::new(Recorder {
            fail: true,
            ..Recorder::default()
        });
        let note = Notification::new(vec![], "t", "b").with_metadata(serde_json::json!({"n": 1}));
        assert!(dispatch(recorder.clone(), note).await.is_ok());
        assert_eq!(recorder.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_log_sender_never_fails() {
        let sent = LogPushSender.send(&["a".into()], "t", "b", &Value::Null).await;
        assert!(sent.is_ok());
    }
}
