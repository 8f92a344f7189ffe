//! Webhook ingestion: maps payment and shipping provider callbacks onto
//! order mutations with an audit trail.
//!
//! Validation failures are rejected before anything is read. Once a callback
//! is valid, any failure to apply it is recorded as a notification and
//! reported as a server error, so the provider redelivers. There is no
//! internal retry and no deduplication: every accepted delivery appends a
//! stage entry.

use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::engine::Engine;
use crate::errors::{StoreError, WebhookError};
use crate::lifecycle::{self, OrderMutation};
use crate::model::{Notification, NotificationKind, Order, OrderStatus};
use crate::store::{DocumentKey, ExpectedVersion, WriteBatch};
use crate::types::{OrderId, ProviderStatus, StageName, TriggeredBy};

/// Body of a provider callback. Both fields are required; they are optional
/// here so a missing field is reported as a rejection instead of a decode
/// failure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackPayload {
    /// Order the callback is about
    #[serde(default)]
    pub order_id: Option<String>,
    /// Provider status
    #[serde(default)]
    pub status: Option<String>,
}

impl CallbackPayload {
    /// A payload with both fields set.
    pub fn new(order_id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            order_id: Some(order_id.into()),
            status: Some(status.into()),
        }
    }
}

/// Which provider sent a callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    /// Payment provider
    Payment,
    /// Shipping provider
    Shipping,
}

impl Provider {
    const fn notification_kind(self) -> NotificationKind {
        match self {
            Self::Payment => NotificationKind::Payment,
            Self::Shipping => NotificationKind::Shipment,
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Payment => "payment",
            Self::Shipping => "shipping",
        }
    }

    /// Mutations a callback with `status` applies.
    pub fn mutations(self, status: &ProviderStatus) -> Vec<OrderMutation> {
        match self {
            Self::Payment => vec![
                OrderMutation::AppendStage(StageName::for_payment(status)),
                OrderMutation::SetPaymentStatus(status.clone()),
            ],
            Self::Shipping => {
                let mut mutations = vec![
                    OrderMutation::AppendStage(StageName::for_shipping(status)),
                    OrderMutation::SetShippingStatus(status.clone()),
                ];
                if status.is_delivered() {
                    mutations.push(OrderMutation::TransitionTo(OrderStatus::Completed));
                }
                mutations
            }
        }
    }
}

/// A validated callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Callback {
    /// Target order
    pub order_id: OrderId,
    /// Normalised provider status
    pub status: ProviderStatus,
}

impl TryFrom<&CallbackPayload> for Callback {
    type Error = WebhookError;

    fn try_from(payload: &CallbackPayload) -> Result<Self, Self::Error> {
        let order_id = payload
            .order_id
            .as_deref()
            .and_then(|raw| OrderId::try_new(raw).ok())
            .ok_or_else(|| WebhookError::Rejected("orderId is required".to_string()))?;
        let status = payload
            .status
            .as_deref()
            .and_then(|raw| ProviderStatus::try_new(raw).ok())
            .ok_or_else(|| WebhookError::Rejected("status is required".to_string()))?;
        Ok(Self { order_id, status })
    }
}

/// Applies provider callbacks to orders.
#[derive(Debug, Clone)]
pub struct WebhookIngestion {
    engine: Engine,
}

impl WebhookIngestion {
    /// Creates the service.
    pub const fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Records a payment provider callback.
    ///
    /// # Errors
    /// * `WebhookError::Rejected` - a required field is missing or blank
    /// * `WebhookError::Failed` - the order is unknown or the write failed
    #[instrument(name = "webhook.payment", skip(self, payload, triggered_by))]
    pub async fn handle_payment_callback(
        &self,
        payload: &CallbackPayload,
        triggered_by: Option<&TriggeredBy>,
    ) -> Result<Order, WebhookError> {
        self.handle(Provider::Payment, payload, triggered_by).await
    }

    /// Records a shipping provider callback; `delivered` completes the order.
    ///
    /// # Errors
    /// * `WebhookError::Rejected` - a required field is missing or blank
    /// * `WebhookError::Failed` - the order is unknown or the write failed
    #[instrument(name = "webhook.shipping", skip(self, payload, triggered_by))]
    pub async fn handle_shipping_callback(
        &self,
        payload: &CallbackPayload,
        triggered_by: Option<&TriggeredBy>,
    ) -> Result<Order, WebhookError> {
        self.handle(Provider::Shipping, payload, triggered_by).await
    }

    async fn handle(
        &self,
        provider: Provider,
        payload: &CallbackPayload,
        triggered_by: Option<&TriggeredBy>,
    ) -> Result<Order, WebhookError> {
        let callback = Callback::try_from(payload)?;

        match self.apply(provider, &callback, triggered_by).await {
            Ok(order) => {
                info!(
                    order_id = %callback.order_id,
                    provider = provider.as_str(),
                    status = %callback.status,
                    order_status = %order.status,
                    "Callback recorded"
                );
                Ok(order)
            }
            Err(failure) => {
                self.record_failure(provider, &callback, &failure).await;
                Err(WebhookError::Failed(failure))
            }
        }
    }

    async fn apply(
        &self,
        provider: Provider,
        callback: &Callback,
        triggered_by: Option<&TriggeredBy>,
    ) -> Result<Order, StoreError> {
        let store = self.engine.store();
        let current = store
            .order(&callback.order_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(DocumentKey::Order(callback.order_id.clone())))?;

        let (next, _) = lifecycle::apply(
            &current.document,
            &provider.mutations(&callback.status),
            triggered_by,
            self.engine.now(),
        );
        store
            .commit(WriteBatch::atomic().put_order(next.clone(), ExpectedVersion::Exact(current.version)))
            .await?;
        Ok(next)
    }

    async fn record_failure(&self, provider: Provider, callback: &Callback, failure: &StoreError) {
        error!(
            order_id = %callback.order_id,
            provider = provider.as_str(),
            error = %failure,
            "Callback could not be applied"
        );
        let notification = Notification::new(
            provider.notification_kind(),
            format!(
                "{} callback with status {} failed: {failure}",
                provider.as_str(),
                callback.status
            ),
            self.engine.now(),
        )
        .for_order(callback.order_id.clone());
        if let Err(store_error) = self
            .engine
            .store()
            .commit(WriteBatch::atomic().notify(notification))
            .await
        {
            error!(error = %store_error, "Could not record callback failure notification");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_are_rejected() {
        for payload in [
            CallbackPayload::default(),
            CallbackPayload {
                order_id: Some("ORD-1".into()),
                status: None,
            },
            CallbackPayload::new("   ", "succeeded"),
            CallbackPayload::new("ORD-1", "  "),
        ] {
            let result = Callback::try_from(&payload);
            assert!(matches!(result, Err(WebhookError::Rejected(_))), "{payload:?}");
        }
    }

    #[test]
    fn status_is_normalised() {
        let callback = Callback::try_from(&CallbackPayload::new(" ORD-1 ", " Delivered ")).unwrap();
        assert_eq!(callback.order_id.as_ref(), "ORD-1");
        assert!(callback.status.is_delivered());
    }

    #[test]
    fn shipping_delivery_requests_completion() {
        let mutations = Provider::Shipping.mutations(&ProviderStatus::delivered());
        assert_eq!(
            mutations.last(),
            Some(&OrderMutation::TransitionTo(OrderStatus::Completed))
        );
        let in_transit = ProviderStatus::try_new("in_transit").unwrap();
        assert_eq!(Provider::Shipping.mutations(&in_transit).len(), 2);
        assert_eq!(Provider::Payment.mutations(&ProviderStatus::succeeded()).len(), 2);
    }

    #[test]
    fn payload_uses_camel_case() {
        let payload: CallbackPayload =
            serde_json::from_str(r#"{"orderId": "ORD-9", "status": "failed"}"#).unwrap();
        assert_eq!(payload, CallbackPayload::new("ORD-9", "failed"));
    }
}
