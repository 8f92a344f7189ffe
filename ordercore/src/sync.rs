//! Status synchronization: keeps payment status, shipping status and the
//! shipping projection consistent with each other.
//!
//! Rules are pure [`ChangeHandler`]s registered per entity kind with
//! [`StatusSynchronizer::on_entity_change`]. A handler looks at the before
//! and after snapshots of one committed change and returns the
//! [`SyncAction`]s it wants. Actions name the documents involved, not the
//! values seen in the change: the synchronizer re-reads both the source and
//! the target when applying them, so a redelivered or reordered change can
//! never write a stale status.

use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::engine::Engine;
use crate::errors::SyncError;
use crate::lifecycle::{self, OrderMutation};
use crate::model::{Notification, NotificationKind, Order, OrderStatus, ShippingRecord};
use crate::retry::{with_retry, RetryError, RetryPolicy};
use crate::store::{
    Change, ChangeFeed, Document, DocumentKey, EntityKind, ExpectedVersion, OrderStore, WriteBatch,
};
use crate::types::{OrderId, PaymentId, TriggeredBy};

/// Name recorded as `triggeredBy` on stage entries written by the synchronizer.
pub const SYNC_ACTOR: &str = "status-sync";

/// A derived write requested by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// Apply mutations to an order through the lifecycle transition function.
    UpdateOrder {
        /// Target order
        order_id: OrderId,
        /// Mutations to apply
        mutations: Vec<OrderMutation>,
    },
    /// Copy the payment's current status onto the order it belongs to.
    MirrorPaymentStatus {
        /// Source payment
        payment_id: PaymentId,
        /// Order the payment was linked to when the change was seen
        order_id: OrderId,
    },
    /// Write the order's current shipping status into its projection.
    UpsertShipping {
        /// Order the projection belongs to
        order_id: OrderId,
    },
    /// Complete the order if it is still pending delivery confirmation and
    /// its current shipping status is `delivered`.
    CompleteIfDelivered {
        /// Target order
        order_id: OrderId,
    },
}

impl SyncAction {
    /// Order affected by the action.
    pub const fn order_id(&self) -> &OrderId {
        match self {
            Self::UpdateOrder { order_id, .. }
            | Self::MirrorPaymentStatus { order_id, .. }
            | Self::UpsertShipping { order_id }
            | Self::CompleteIfDelivered { order_id } => order_id,
        }
    }
}

/// A pure reaction to a document change.
pub trait ChangeHandler: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        "handler"
    }

    /// Actions implied by the change from `before` to `after`.
    fn plan(&self, before: Option<&Document>, after: &Document) -> Vec<SyncAction>;
}

impl<F> ChangeHandler for F
where
    F: Fn(Option<&Document>, &Document) -> Vec<SyncAction> + Send + Sync,
{
    fn plan(&self, before: Option<&Document>, after: &Document) -> Vec<SyncAction> {
        self(before, after)
    }
}

/// Copies a payment's status onto its order.
#[derive(Debug, Clone, Copy, Default)]
pub struct PaymentStatusRule;

impl ChangeHandler for PaymentStatusRule {
    fn name(&self) -> &str {
        "payment-status"
    }

    fn plan(&self, before: Option<&Document>, after: &Document) -> Vec<SyncAction> {
        let Some(payment) = after.as_payment() else {
            return Vec::new();
        };
        let Some(order_id) = &payment.order_id else {
            return Vec::new();
        };
        let status_changed = !matches!(
            before.and_then(Document::as_payment),
            Some(previous) if previous.status == payment.status
        );
        if !status_changed {
            return Vec::new();
        }
        vec![SyncAction::MirrorPaymentStatus {
            payment_id: payment.id.clone(),
            order_id: order_id.clone(),
        }]
    }
}

/// Mirrors an order's shipping status into the shipping projection and
/// completes the order once delivered.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShippingStatusRule;

impl ChangeHandler for ShippingStatusRule {
    fn name(&self) -> &str {
        "shipping-status"
    }

    fn plan(&self, before: Option<&Document>, after: &Document) -> Vec<SyncAction> {
        let (Some(previous), Some(order)) = (before.and_then(Document::as_order), after.as_order())
        else {
            return Vec::new();
        };
        if previous.shipping_status == order.shipping_status {
            return Vec::new();
        }

        let mut actions = vec![SyncAction::UpsertShipping {
            order_id: order.id.clone(),
        }];
        if order.shipping_status.is_delivered() && !order.is_terminal() {
            actions.push(SyncAction::CompleteIfDelivered {
                order_id: order.id.clone(),
            });
        }
        actions
    }
}

/// Result of applying one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    /// A write was committed.
    Applied,
    /// The target already reflected the action; nothing was written.
    Unchanged,
}

/// Summary of dispatching one change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Actions that wrote something
    pub applied: usize,
    /// Actions that found nothing to do
    pub unchanged: usize,
    /// Actions that failed and were recorded as notifications
    pub failed: usize,
}

/// Registry of change handlers plus the dispatcher applying their actions.
pub struct StatusSynchronizer {
    engine: Engine,
    handlers: Vec<(EntityKind, Arc<dyn ChangeHandler>)>,
}

impl StatusSynchronizer {
    /// A synchronizer with no handlers.
    pub fn new(engine: Engine) -> Self {
        Self {
            engine,
            handlers: Vec::new(),
        }
    }

    /// A synchronizer with the payment and shipping rules registered.
    pub fn with_default_rules(engine: Engine) -> Self {
        let mut synchronizer = Self::new(engine);
        synchronizer
            .on_entity_change(EntityKind::Payment, PaymentStatusRule)
            .on_entity_change(EntityKind::Order, ShippingStatusRule);
        synchronizer
    }

    /// Registers `handler` for changes to documents of `kind`.
    pub fn on_entity_change<H>(&mut self, kind: EntityKind, handler: H) -> &mut Self
    where
        H: ChangeHandler + 'static,
    {
        self.handlers.push((kind, Arc::new(handler)));
        self
    }

    /// Actions every matching handler wants for `change`.
    pub fn plan(&self, change: &Change) -> Vec<SyncAction> {
        let kind = change.kind();
        self.handlers
            .iter()
            .filter(|(registered, _)| *registered == kind)
            .flat_map(|(_, handler)| {
                let actions = handler.plan(change.before.as_ref(), &change.after);
                if !actions.is_empty() {
                    debug!(handler = handler.name(), actions = actions.len(), "Handler planned actions");
                }
                actions
            })
            .collect()
    }

    /// Plans and applies the actions for one change.
    ///
    /// Failures never propagate: each one is logged and recorded as a
    /// `sync` notification, and the remaining actions still run.
    #[instrument(name = "sync.dispatch", skip(self, change), fields(kind = %change.kind(), version = %change.version))]
    pub async fn dispatch(&self, change: &Change) -> DispatchReport {
        let mut report = DispatchReport::default();
        for action in self.plan(change) {
            match self.apply(&action).await {
                Ok(ActionOutcome::Applied) => report.applied += 1,
                Ok(ActionOutcome::Unchanged) => report.unchanged += 1,
                Err(failure) => {
                    report.failed += 1;
                    self.record_failure(&action, &failure).await;
                }
            }
        }
        report
    }

    /// Applies a single action.
    pub async fn apply(&self, action: &SyncAction) -> Result<ActionOutcome, SyncError> {
        match action {
            SyncAction::UpdateOrder {
                order_id,
                mutations,
            } => self.update_order(order_id, OrderUpdate::Fixed(mutations)).await,
            SyncAction::MirrorPaymentStatus {
                payment_id,
                order_id,
            } => {
                self.update_order(order_id, OrderUpdate::MirrorPayment(payment_id))
                    .await
            }
            SyncAction::UpsertShipping { order_id } => self.upsert_shipping(order_id).await,
            SyncAction::CompleteIfDelivered { order_id } => {
                self.update_order(order_id, OrderUpdate::CompleteIfDelivered)
                    .await
            }
        }
    }

    async fn update_order(
        &self,
        order_id: &OrderId,
        update: OrderUpdate<'_>,
    ) -> Result<ActionOutcome, SyncError> {
        let retry = self.engine.config().sync_retry.to_retry_config();
        let actor = TriggeredBy::system(SYNC_ACTOR);
        let actor = &actor;
        let engine = &self.engine;

        let result = with_retry(
            "sync.update_order",
            &retry,
            |error: &SyncError| {
                matches!(
                    error,
                    SyncError::Store(store) if RetryPolicy::ConflictsAndTransient.should_retry(store)
                )
            },
            |_| async move {
                let store = engine.store();
                let current = store
                    .order(order_id)
                    .await?
                    .ok_or_else(|| SyncError::MissingTarget(DocumentKey::Order(order_id.clone())))?;
                let mutations = update.mutations(store.as_ref(), &current.document).await?;
                if mutations.is_empty() {
                    return Ok::<_, SyncError>(ActionOutcome::Unchanged);
                }
                let (next, outcome) =
                    lifecycle::apply(&current.document, &mutations, Some(actor), engine.now());
                if !outcome.changed {
                    return Ok::<_, SyncError>(ActionOutcome::Unchanged);
                }
                store
                    .commit(WriteBatch::atomic().put_order(next, ExpectedVersion::Exact(current.version)))
                    .await?;
                debug!(%order_id, transition = ?outcome.transition, "Order synchronized");
                Ok::<_, SyncError>(ActionOutcome::Applied)
            },
        )
        .await;

        result.map_err(|error| match error {
            RetryError::Exhausted { last_error, .. } | RetryError::Aborted(last_error) => last_error,
        })
    }

    async fn upsert_shipping(&self, order_id: &OrderId) -> Result<ActionOutcome, SyncError> {
        let store = self.engine.store();
        let order = store
            .order(order_id)
            .await?
            .ok_or_else(|| SyncError::MissingTarget(DocumentKey::Order(order_id.clone())))?;
        let status = order.document.shipping_status;
        if let Some(current) = store.shipping(order_id).await? {
            if current.document.status == status {
                return Ok(ActionOutcome::Unchanged);
            }
        }
        let record = ShippingRecord {
            order_id: order_id.clone(),
            status: status.clone(),
            updated_at: self.engine.now(),
        };
        store.commit(WriteBatch::atomic().upsert_shipping(record)).await?;
        debug!(%order_id, %status, "Shipping projection updated");
        Ok(ActionOutcome::Applied)
    }

    async fn record_failure(&self, action: &SyncAction, failure: &SyncError) {
        error!(order_id = %action.order_id(), error = %failure, "Status synchronization failed");
        let notification = Notification::new(
            NotificationKind::Sync,
            format!("Status synchronization failed: {failure}"),
            self.engine.now(),
        )
        .for_order(action.order_id().clone());
        if let Err(store_error) = self
            .engine
            .store()
            .commit(WriteBatch::atomic().notify(notification))
            .await
        {
            error!(error = %store_error, "Could not record sync failure notification");
        }
    }

    /// Runs the dispatcher on the store's change feed until shut down.
    pub fn start(self) -> SyncHandle {
        let feed = self.engine.store().subscribe();
        self.spawn(feed)
    }

    /// Runs the dispatcher on `feed` until shut down or the feed closes.
    pub fn spawn(self, mut feed: ChangeFeed) -> SyncHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            info!(handlers = self.handlers.len(), "Status synchronizer started");
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    received = feed.recv() => match received {
                        Ok(change) => {
                            self.dispatch(&change).await;
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Status synchronizer lagged behind the change feed");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
            info!("Status synchronizer stopped");
        });
        SyncHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

/// How an order update derives its mutations from the freshly read order.
#[derive(Debug, Clone, Copy)]
enum OrderUpdate<'a> {
    Fixed(&'a [OrderMutation]),
    MirrorPayment(&'a PaymentId),
    CompleteIfDelivered,
}

impl OrderUpdate<'_> {
    async fn mutations(
        self,
        store: &dyn OrderStore,
        order: &Order,
    ) -> Result<Vec<OrderMutation>, SyncError> {
        match self {
            Self::Fixed(mutations) => Ok(mutations.to_vec()),
            Self::MirrorPayment(payment_id) => {
                let payment = store.payment(payment_id).await?.ok_or_else(|| {
                    SyncError::MissingTarget(DocumentKey::Payment(payment_id.clone()))
                })?;
                // Relinked to another order since the change was seen.
                if payment.document.order_id.as_ref() != Some(&order.id) {
                    return Ok(Vec::new());
                }
                Ok(vec![OrderMutation::SetPaymentStatus(payment.document.status)])
            }
            Self::CompleteIfDelivered if order.shipping_status.is_delivered() => {
                Ok(vec![OrderMutation::TransitionTo(OrderStatus::Completed)])
            }
            Self::CompleteIfDelivered => Ok(Vec::new()),
        }
    }
}

impl std::fmt::Debug for StatusSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusSynchronizer")
            .field("handlers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

/// Handle to a running synchronizer task.
#[derive(Debug)]
pub struct SyncHandle {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl SyncHandle {
    /// Signals the task to stop and waits for it.
    pub async fn shutdown(self) -> Result<(), tokio::task::JoinError> {
        // The task may already have stopped because the feed closed.
        let _ = self.shutdown.send(());
        self.join.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OrderItem, Payment, ShippingMethod, StageEvent};
    use crate::types::{Currency, CustomerId, Money, ProductId, ProviderStatus, Quantity, StageName, Timestamp};

    fn order() -> Order {
        let now = Timestamp::now();
        Order {
            id: OrderId::try_new("ORD-SYNC").unwrap(),
            customer_id: CustomerId::try_new("c").unwrap(),
            items: vec![OrderItem {
                product_id: ProductId::try_new("sku").unwrap(),
                quantity: Quantity::try_new(1).unwrap(),
                unit_price: Money::zero(),
            }],
            subtotal: Money::zero(),
            shipping_cost: Money::zero(),
            tax_amount: Money::zero(),
            discount_amount: Money::zero(),
            total_amount: Money::zero(),
            currency: Currency::try_new("SAR").unwrap(),
            shipping_method: ShippingMethod::Standard,
            status: OrderStatus::Pending,
            payment_status: ProviderStatus::pending(),
            shipping_status: ProviderStatus::pending(),
            stage_history: vec![StageEvent {
                stage: StageName::ordered(),
                timestamp: now,
                triggered_by: None,
            }],
            created_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn payment(status: ProviderStatus, order_id: Option<OrderId>) -> Document {
        Document::Payment(Payment {
            id: PaymentId::try_new("pay-1").unwrap(),
            order_id,
            amount: Money::zero(),
            status,
        })
    }

    #[test]
    fn payment_rule_fires_on_status_change_only() {
        let order_id = OrderId::try_new("ORD-SYNC").unwrap();
        let before = payment(ProviderStatus::pending(), Some(order_id.clone()));
        let after = payment(ProviderStatus::succeeded(), Some(order_id.clone()));

        let actions = PaymentStatusRule.plan(Some(&before), &after);
        assert_eq!(
            actions,
            vec![SyncAction::MirrorPaymentStatus {
                payment_id: PaymentId::try_new("pay-1").unwrap(),
                order_id,
            }]
        );
        assert!(PaymentStatusRule.plan(Some(&after), &after).is_empty());
    }

    #[test]
    fn payment_rule_ignores_unlinked_payments() {
        let after = payment(ProviderStatus::succeeded(), None);
        assert!(PaymentStatusRule.plan(None, &after).is_empty());
    }

    #[test]
    fn shipping_rule_completes_on_delivery() {
        let before = order();
        let mut after = before.clone();
        after.shipping_status = ProviderStatus::delivered();

        let actions =
            ShippingStatusRule.plan(Some(&Document::Order(before)), &Document::Order(after.clone()));
        assert_eq!(actions.len(), 2);
        assert_eq!(
            actions,
            vec![
                SyncAction::UpsertShipping {
                    order_id: after.id.clone(),
                },
                SyncAction::CompleteIfDelivered { order_id: after.id },
            ]
        );
    }

    #[test]
    fn shipping_rule_only_projects_for_terminal_orders() {
        let mut before = order();
        before.status = OrderStatus::Expired;
        let mut after = before.clone();
        after.shipping_status = ProviderStatus::delivered();
        let actions =
            ShippingStatusRule.plan(Some(&Document::Order(before)), &Document::Order(after));
        assert_eq!(actions.len(), 1);
    }

    #[test]
    fn shipping_rule_ignores_other_fields() {
        let before = order();
        let mut after = before.clone();
        after.payment_status = ProviderStatus::succeeded();
        assert!(ShippingStatusRule
            .plan(Some(&Document::Order(before)), &Document::Order(after))
            .is_empty());
    }
}
