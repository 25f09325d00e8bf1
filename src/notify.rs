//! New-order notifications.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::models::OrderRecord;

pub trait Notifier: Send + Sync {
    fn on_new_order(&self, order: &OrderRecord);
}

/// Notification payload for UI collaborators.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    pub order_id: i64,
    pub number: String,
    pub customer: String,
    pub total: f64,
    pub is_delivery: bool,
}

impl From<&OrderRecord> for OrderEvent {
    fn from(order: &OrderRecord) -> Self {
        Self {
            order_id: order.id,
            number: order.number.clone(),
            customer: order.customer.name.clone(),
            total: order.totals.total,
            is_delivery: order.extensions.is_delivery,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn on_new_order(&self, order: &OrderRecord) {
        info!(
            order_id = order.id,
            number = %order.number,
            total = order.totals.total,
            "New order received"
        );
    }
}

/// Publishes [`OrderEvent`]s to every subscriber.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: broadcast::Sender<OrderEvent>,
}

impl ChannelNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OrderEvent> {
        self.tx.subscribe()
    }
}

impl Notifier for ChannelNotifier {
    fn on_new_order(&self, order: &OrderRecord) {
        // No subscribers is not an error.
        if self.tx.send(OrderEvent::from(order)).is_err() {
            debug!(order_id = order.id, "No listeners for new order event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_notifier_broadcasts() {
        let notifier = ChannelNotifier::new(8);
        let mut rx = notifier.subscribe();

        let mut order = OrderRecord::new(100, "A-100", "processing");
        order.customer.name = "Ada".into();
        order.totals.total = 12.5;
        notifier.on_new_order(&order);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.order_id, 100);
        assert_eq!(event.number, "A-100");
        assert_eq!(event.customer, "Ada");
        assert_eq!(event.total, 12.5);
    }

    #[test]
    fn test_send_without_subscribers_is_quiet() {
        let notifier = ChannelNotifier::new(1);
        notifier.on_new_order(&OrderRecord::new(1, "1", "processing"));
    }
}
