//! Consumer that records delivered reminders

use std::sync::Arc;

use tracing::{debug, info, warn};

use calendar_broker::{BrokerClient, BrokerError, HandlerError, Message};
use calendar_store::{Notification, NotificationStore};

/// Persists notifications received from the reminder topic
///
/// Saving is insert-or-ignore on the notification id, so redelivered
/// messages leave exactly one record behind.
pub struct NotificationStorer {
    store: Arc<dyn NotificationStore>,
}

impl NotificationStorer {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self { store }
    }

    /// Handle one broker message
    ///
    /// Unparseable payloads are discarded. A failed save asks for redelivery.
    pub async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        let notification: Notification = match message.decode() {
            Ok(notification) => notification,
            Err(e) => {
                warn!(message_id = %message.id, error = %e, "dropping malformed notification");
                return Err(HandlerError::discard(e.to_string()));
            }
        };

        let id = notification.id;
        match self.store.save_notification(notification).await {
            Ok(true) => {
                info!(%id, "notification stored");
                Ok(())
            }
            Ok(false) => {
                debug!(%id, "notification already stored");
                Ok(())
            }
            Err(e) => Err(HandlerError::retry(e.to_string())),
        }
    }

    /// Subscribe this storer to `topic` as consumer group `group`
    pub fn register(
        self: Arc<Self>,
        broker: &BrokerClient,
        topic: &str,
        group: &str,
    ) -> Result<(), BrokerError> {
        broker.subscribe(topic, group, move |message| {
            let storer = self.clone();
            async move { storer.handle(message).await }
        })
    }
}
