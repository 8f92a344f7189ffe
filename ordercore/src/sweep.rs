//! Reconciliation sweep: resolves `pending` orders whose callbacks were lost
//! or never came.
//!
//! The decision is the pure [`resolve`]; the sweep reads a snapshot of
//! pending orders, resolves each, and writes the results as one best-effort
//! batch. Every write is checked against the version the order was read at,
//! so an order touched by a webhook during the sweep is skipped rather than
//! overwritten, and the next run looks at it again.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, instrument, warn};

use crate::engine::Engine;
use crate::errors::SweepError;
use crate::lifecycle::{self, OrderMutation};
use crate::model::{Notification, NotificationKind, Order, OrderStatus};
use crate::store::{DocumentKey, ExpectedVersion, WriteBatch};
use crate::types::{OrderId, Timestamp, TriggeredBy};

/// Name recorded as `triggeredBy` on stage entries written by the sweep.
pub const SWEEP_ACTOR: &str = "reconciliation-sweep";

/// How the sweep settles an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// Paid and delivered but never marked completed.
    Complete,
    /// Untouched for longer than the staleness threshold.
    Expire,
}

impl Resolution {
    /// Status the order moves to.
    pub const fn target(self) -> OrderStatus {
        match self {
            Self::Complete => OrderStatus::Completed,
            Self::Expire => OrderStatus::Expired,
        }
    }

    /// Mutations that carry out the resolution.
    pub fn mutations(self) -> Vec<OrderMutation> {
        vec![OrderMutation::TransitionTo(self.target())]
    }
}

/// Decides what to do with one order. The first matching rule wins:
///
/// 1. payment `succeeded` and shipping `delivered`: complete it
/// 2. `updated_at` older than `staleness`: expire it
///
/// Only `pending` orders are ever resolved.
pub fn resolve(order: &Order, now: Timestamp, staleness: chrono::Duration) -> Option<Resolution> {
    if order.status != OrderStatus::Pending {
        return None;
    }
    if order.payment_status.is_succeeded() && order.shipping_status.is_delivered() {
        return Some(Resolution::Complete);
    }
    if now.since(order.updated_at) > staleness {
        return Some(Resolution::Expire);
    }
    None
}

/// Outcome of one sweep run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Pending orders examined
    pub scanned: usize,
    /// Orders moved to `completed`
    pub completed: usize,
    /// Orders moved to `expired`
    pub expired: usize,
    /// Resolutions dropped because the order changed concurrently
    pub skipped: usize,
}

/// The reconciliation sweep.
#[derive(Debug, Clone)]
pub struct ReconciliationSweep {
    engine: Engine,
}

impl ReconciliationSweep {
    /// Creates the sweep.
    pub const fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Runs one pass over the pending orders.
    ///
    /// # Errors
    /// Returns `SweepError::Store` when the scan or the commit itself fails.
    /// Individual conflicting orders are not errors; they are counted in
    /// `SweepReport::skipped`.
    #[instrument(name = "sweep.run", skip(self))]
    pub async fn run_once(&self) -> Result<SweepReport, SweepError> {
        let store = self.engine.store();
        let now = self.engine.now();
        let staleness = self.engine.config().staleness_threshold.as_chrono();
        let actor = TriggeredBy::system(SWEEP_ACTOR);

        let pending = store.orders_with_status(OrderStatus::Pending).await?;
        let mut report = SweepReport {
            scanned: pending.len(),
            ..SweepReport::default()
        };

        let mut batch = WriteBatch::best_effort();
        let mut planned: HashMap<OrderId, Resolution> = HashMap::new();
        for current in pending {
            let Some(resolution) = resolve(&current.document, now, staleness) else {
                continue;
            };
            let (next, outcome) =
                lifecycle::apply(&current.document, &resolution.mutations(), Some(&actor), now);
            if outcome.changed {
                planned.insert(next.id.clone(), resolution);
                batch = batch.put_order(next, ExpectedVersion::Exact(current.version));
            }
        }

        if batch.is_empty() {
            info!(scanned = report.scanned, "Sweep found nothing to resolve");
            return Ok(report);
        }

        let receipt = store.commit(batch).await?;
        for (key, _) in &receipt.applied {
            let DocumentKey::Order(order_id) = key else {
                continue;
            };
            match planned.get(order_id) {
                Some(Resolution::Complete) => report.completed += 1,
                Some(Resolution::Expire) => report.expired += 1,
                None => {}
            }
        }
        for skipped in &receipt.skipped {
            warn!(document = %skipped.key, reason = %skipped.reason, "Sweep skipped a changed order");
        }
        report.skipped = receipt.skipped.len();

        info!(
            scanned = report.scanned,
            completed = report.completed,
            expired = report.expired,
            skipped = report.skipped,
            "Sweep finished"
        );
        Ok(report)
    }

    /// Runs one pass and records a failure as a `sweep` notification.
    pub async fn run_logged(&self) -> Option<SweepReport> {
        match self.run_once().await {
            Ok(report) => Some(report),
            Err(failure) => {
                error!(error = %failure, "Sweep run failed");
                let notification = Notification::new(
                    NotificationKind::Sweep,
                    format!("Reconciliation sweep failed: {failure}"),
                    self.engine.now(),
                );
                if let Err(store_error) = self
                    .engine
                    .store()
                    .commit(WriteBatch::atomic().notify(notification))
                    .await
                {
                    error!(error = %store_error, "Could not record sweep failure notification");
                }
                None
            }
        }
    }

    /// Runs the sweep every `period`, starting one period from now, until
    /// shut down. A failed run does not stop the schedule.
    pub fn spawn_schedule(self, period: Duration) -> SweepHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let join = tokio::spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(period_secs = period.as_secs(), "Sweep scheduler started");
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticks.tick() => {
                        self.run_logged().await;
                    }
                }
            }
            info!("Sweep scheduler stopped");
        });
        SweepHandle {
            shutdown: shutdown_tx,
            join,
        }
    }
}

/// Handle to a running sweep schedule.
#[derive(Debug)]
pub struct SweepHandle {
    shutdown: oneshot::Sender<()>,
    join: JoinHandle<()>,
}

impl SweepHandle {
    /// Signals the scheduler to stop and waits for it.
    pub async fn shutdown(self) -> Result<(), tokio::task::JoinError> {
        let _ = self.shutdown.send(());
        self.join.await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OrderItem, ShippingMethod, StageEvent};
    use crate::types::{
        Currency, CustomerId, Money, ProductId, ProviderStatus, Quantity, StageName,
    };
    use chrono::Duration as ChronoDuration;

    fn pending_order(updated_at: Timestamp) -> Order {
        Order {
            id: OrderId::try_new("ORD-SWEEP").unwrap(),
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
                timestamp: updated_at,
                triggered_by: None,
            }],
            created_by: None,
            created_at: updated_at,
            updated_at,
        }
    }

    #[test]
    fn stale_orders_expire() {
        let touched = Timestamp::now();
        let order = pending_order(touched);
        let day = ChronoDuration::hours(24);
        assert_eq!(
            resolve(&order, touched.plus(ChronoDuration::hours(25)), day),
            Some(Resolution::Expire)
        );
        assert_eq!(resolve(&order, touched.plus(ChronoDuration::hours(23)), day), None);
    }

    #[test]
    fn paid_and_delivered_completes_even_when_stale() {
        let touched = Timestamp::now();
        let mut order = pending_order(touched);
        order.payment_status = ProviderStatus::succeeded();
        order.shipping_status = ProviderStatus::delivered();
        assert_eq!(
            resolve(&order, touched.plus(ChronoDuration::days(3)), ChronoDuration::hours(24)),
            Some(Resolution::Complete)
        );
    }

    #[test]
    fn only_pending_orders_resolve() {
        let touched = Timestamp::now();
        let mut order = pending_order(touched);
        order.status = OrderStatus::Paid;
        assert_eq!(
            resolve(&order, touched.plus(ChronoDuration::days(3)), ChronoDuration::hours(24)),
            None
        );
    }

    #[test]
    fn resolution_targets() {
        assert_eq!(Resolution::Complete.target(), OrderStatus::Completed);
        assert_eq!(
            Resolution::Expire.mutations(),
            vec![OrderMutation::TransitionTo(OrderStatus::Expired)]
        );
    }
}
