//! Change notification rendering and delivery.

use std::sync::Arc;

use crate::models::ChangeEvent;
use crate::services::Messenger;

/// What happened to one notification batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered,
    /// Nothing to say
    Empty,
    Failed(String),
}

/// Renders change lists and hands them to the messenger.
pub struct NotificationDispatcher {
    messenger: Arc<dyn Messenger>,
}

impl NotificationDispatcher {
    pub fn new(messenger: Arc<dyn Messenger>) -> Self {
        Self { messenger }
    }

    /// Render one message covering every change of an entity.
    pub fn render(display_name: &str, changes: &[ChangeEvent]) -> String {
        let mut text = format!("📊 Updates for {display_name}:\n");
        for change in changes {
            text.push_str("• ");
            text.push_str(&change.to_string());
            text.push('\n');
        }
        text.truncate(text.trim_end().len());
        text
    }

    /// Send one aggregated notification. Failures are logged, never raised.
    pub async fn dispatch(
        &self,
        target: &str,
        display_name: &str,
        changes: &[ChangeEvent],
    ) -> DispatchOutcome {
        if changes.is_empty() {
            return DispatchOutcome::Empty;
        }

        let text = Self::render(display_name, changes);
        match self.messenger.send(target, &text).await {
            Ok(()) => {
                log::info!(
                    "Notified {} about {} change(s) for {}",
                    target,
                    changes.len(),
                    display_name
                );
                DispatchOutcome::Delivered
            }
            Err(e) => {
                log::warn!("Notification to {} failed: {}", target, e);
                DispatchOutcome::Failed(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::error::{AppError, Result};

    #[derive(Default)]
    struct RecordingMessenger {
        sent: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    #[async_trait]
    impl Messenger for RecordingMessenger {
        async fn send(&self, target: &str, text: &str) -> Result<()> {
            if self.fail {
                return Err(AppError::messaging(target, "Forbidden: bot was blocked"));
            }
            self.sent
                .lock()
                .unwrap()
                .push((target.to_string(), text.to_string()));
            Ok(())
        }
    }

    fn changes() -> Vec<ChangeEvent> {
        vec![
            ChangeEvent::Group {
                old: Some("A-1".into()),
                new: "A-2".into(),
            },
            ChangeEvent::Grade {
                subject: "Algorithms".into(),
                module: Some("1".into()),
                old: Some("6".into()),
                new: "9".into(),
            },
        ]
    }

    #[test]
    fn test_render() {
        let text = NotificationDispatcher::render("Ivanov", &changes());
        assert_eq!(
            text,
            "📊 Updates for Ivanov:\n• Group: A-1 → A-2\n• Algorithms (module 1): 6 → 9"
        );
    }

    #[tokio::test]
    async fn test_dispatch_sends_one_message_per_batch() {
        let messenger = Arc::new(RecordingMessenger::default());
        let dispatcher = NotificationDispatcher::new(messenger.clone());

        let outcome = dispatcher.dispatch("1001", "Ivanov", &changes()).await;
        assert_eq!(outcome, DispatchOutcome::Delivered);

        let sent = messenger.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "1001");
    }

    #[tokio::test]
    async fn test_dispatch_swallows_failures() {
        let messenger = Arc::new(RecordingMessenger {
            fail: true,
            ..RecordingMessenger::default()
        });
        let dispatcher = NotificationDispatcher::new(messenger);

        let outcome = dispatcher.dispatch("1001", "Ivanov", &changes()).await;
        assert!(matches!(outcome, DispatchOutcome::Failed(msg) if msg.contains("blocked")));
    }

    #[tokio::test]
    async fn test_dispatch_skips_empty_batches() {
        let messenger = Arc::new(RecordingMessenger::default());
        let dispatcher = NotificationDispatcher::new(messenger.clone());

        assert_eq!(
            dispatcher.dispatch("1001", "Ivanov", &[]).await,
            DispatchOutcome::Empty
        );
        assert!(messenger.sent.lock().unwrap().is_empty());
    }
}
