//! The order state-transition function.
//!
//! Webhook ingestion, status synchronization and the reconciliation sweep all
//! express what they want as a list of [`OrderMutation`]s and hand it to
//! [`apply`]. Keeping a single function means the terminal-state rule and the
//! stage history format cannot drift between those paths.

use crate::model::{Order, OrderStatus, StageEvent};
use crate::types::{ProviderStatus, StageName, Timestamp, TriggeredBy};

/// A single requested change to an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderMutation {
    /// Record the latest payment provider status.
    SetPaymentStatus(ProviderStatus),
    /// Record the latest shipping provider status.
    SetShippingStatus(ProviderStatus),
    /// Append an audit entry.
    AppendStage(StageName),
    /// Move the order to a new lifecycle status, appending a stage named
    /// after it.
    TransitionTo(OrderStatus),
}

/// What [`apply`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MutationOutcome {
    /// Whether the order differs from the input.
    pub changed: bool,
    /// The status change that happened, if any.
    pub transition: Option<(OrderStatus, OrderStatus)>,
    /// Transitions that were requested but not allowed.
    pub refused: Vec<(OrderStatus, OrderStatus)>,
}

/// Whether an order in `from` may move to `to`.
///
/// Terminal statuses never move. `expired` is only reachable from
/// `pending`, since only unpaid orders are abandoned.
pub const fn can_transition(from: OrderStatus, to: OrderStatus) -> bool {
    use OrderStatus::{Cancelled, Completed, Expired, Paid, Pending, Shipped};
    matches!(
        (from, to),
        (Pending, Paid | Shipped | Completed | Expired | Cancelled)
            | (Paid, Shipped | Completed | Cancelled)
            | (Shipped, Completed | Cancelled)
    )
}

/// Applies `mutations` in order to a copy of `order`.
///
/// Provider status fields are still recorded on terminal orders, but the
/// order's own status never changes once terminal. `updated_at` is set to
/// `at` when anything changed.
pub fn apply(
    order: &Order,
    mutations: &[OrderMutation],
    triggered_by: Option<&TriggeredBy>,
    at: Timestamp,
) -> (Order, MutationOutcome) {
    let mut next = order.clone();
    let mut outcome = MutationOutcome::default();

    let stage = |name: StageName| StageEvent {
        stage: name,
        timestamp: at,
        triggered_by: triggered_by.cloned(),
    };

    for mutation in mutations {
        match mutation {
            OrderMutation::SetPaymentStatus(status) => {
                if next.payment_status != *status {
                    next.payment_status = status.clone();
                    outcome.changed = true;
                }
            }
            OrderMutation::SetShippingStatus(status) => {
                if next.shipping_status != *status {
                    next.shipping_status = status.clone();
                    outcome.changed = true;
                }
            }
            OrderMutation::AppendStage(name) => {
                next.stage_history.push(stage(name.clone()));
                outcome.changed = true;
            }
            OrderMutation::TransitionTo(target) => {
                let from = next.status;
                if from == *target {
                    continue;
                }
                if can_transition(from, *target) {
                    next.status = *target;
                    next.stage_history.push(stage(target.stage_name()));
                    outcome.transition = Some((
                        outcome.transition.map_or(from, |(first, _)| first),
                        *target,
                    ));
                    outcome.changed = true;
                } else {
                    tracing::debug!(
                        order_id = %order.id,
                        from = %from,
                        to = %target,
                        "Transition refused"
                    );
                    outcome.refused.push((from, *target));
                }
            }
        }
    }

    if outcome.changed {
        next.updated_at = at;
    }
    (next, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OrderItem, ShippingMethod};
    use crate::types::{Currency, CustomerId, Money, OrderId, ProductId, Quantity};
    use chrono::Duration;
    use proptest::prelude::*;

    fn order(status: OrderStatus) -> Order {
        let created = Timestamp::now();
        Order {
            id: OrderId::try_new("ORD-TEST").unwrap(),
            customer_id: CustomerId::try_new("customer-1").unwrap(),
            items: vec![OrderItem {
                product_id: ProductId::try_new("sku-1").unwrap(),
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
            status,
            payment_status: ProviderStatus::pending(),
            shipping_status: ProviderStatus::pending(),
            stage_history: vec![StageEvent {
                stage: StageName::ordered(),
                timestamp: created,
                triggered_by: None,
            }],
            created_by: None,
            created_at: created,
            updated_at: created,
        }
    }

    #[test]
    fn delivered_callback_completes_pending_order() {
        let before = order(OrderStatus::Pending);
        let at = before.updated_at.plus(Duration::minutes(5));
        let delivered = ProviderStatus::delivered();
        let (after, outcome) = apply(
            &before,
            &[
                OrderMutation::AppendStage(StageName::for_shipping(&delivered)),
                OrderMutation::SetShippingStatus(delivered),
                OrderMutation::TransitionTo(OrderStatus::Completed),
            ],
            None,
            at,
        );

        assert_eq!(after.status, OrderStatus::Completed);
        assert_eq!(after.stage_names(), vec!["ordered", "shipping_delivered", "completed"]);
        assert_eq!(after.updated_at, at);
        assert_eq!(outcome.transition, Some((OrderStatus::Pending, OrderStatus::Completed)));
    }

    #[test]
    fn terminal_orders_record_callbacks_but_keep_status() {
        let before = order(OrderStatus::Expired);
        let (after, outcome) = apply(
            &before,
            &[
                OrderMutation::SetShippingStatus(ProviderStatus::delivered()),
                OrderMutation::TransitionTo(OrderStatus::Completed),
            ],
            None,
            Timestamp::now(),
        );
        assert_eq!(after.status, OrderStatus::Expired);
        assert!(after.shipping_status.is_delivered());
        assert_eq!(after.stage_names(), vec!["ordered"]);
        assert_eq!(outcome.refused, vec![(OrderStatus::Expired, OrderStatus::Completed)]);
    }

    #[test]
    fn unchanged_status_is_not_a_change() {
        let before = order(OrderStatus::Pending);
        let (after, outcome) = apply(
            &before,
            &[OrderMutation::SetPaymentStatus(ProviderStatus::pending())],
            None,
            before.updated_at.plus(Duration::hours(1)),
        );
        assert!(!outcome.changed);
        assert_eq!(after, before);
    }

    #[test]
    fn stage_entries_carry_trigger() {
        let actor = TriggeredBy::try_new("user-7").unwrap();
        let (after, _) = apply(
            &order(OrderStatus::Pending),
            &[OrderMutation::TransitionTo(OrderStatus::Cancelled)],
            Some(&actor),
            Timestamp::now(),
        );
        assert_eq!(after.last_stage().unwrap().triggered_by.as_ref(), Some(&actor));
    }

    #[test]
    fn expired_only_from_pending() {
        assert!(can_transition(OrderStatus::Pending, OrderStatus::Expired));
        assert!(!can_transition(OrderStatus::Paid, OrderStatus::Expired));
        assert!(!can_transition(OrderStatus::Shipped, OrderStatus::Pending));
    }

    fn any_status() -> impl Strategy<Value = OrderStatus> {
        prop::sample::select(OrderStatus::ALL.to_vec())
    }

    fn any_mutation() -> impl Strategy<Value = OrderMutation> {
        prop_oneof![
            "[a-z]{1,12}".prop_map(|s| OrderMutation::SetPaymentStatus(
                ProviderStatus::try_new(s).unwrap()
            )),
            "[a-z]{1,12}".prop_map(|s| OrderMutation::SetShippingStatus(
                ProviderStatus::try_new(s).unwrap()
            )),
            "[a-z_]{1,20}".prop_map(|s| OrderMutation::AppendStage(StageName::try_new(s).unwrap())),
            any_status().prop_map(OrderMutation::TransitionTo),
        ]
    }

    proptest! {
        #[test]
        fn terminal_status_is_never_left(
            terminal in prop::sample::select(vec![
                OrderStatus::Completed,
                OrderStatus::Expired,
                OrderStatus::Cancelled,
            ]),
            mutations in prop::collection::vec(any_mutation(), 0..20),
        ) {
            let (after, outcome) = apply(&order(terminal), &mutations, None, Timestamp::now());
            prop_assert_eq!(after.status, terminal);
            prop_assert!(outcome.transition.is_none());
        }

        #[test]
        fn stage_history_only_grows(
            start in any_status(),
            mutations in prop::collection::vec(any_mutation(), 0..20),
        ) {
            let before = order(start);
            let (after, _) = apply(&before, &mutations, None, Timestamp::now());
            prop_assert!(after.stage_history.len() >= before.stage_history.len());
            prop_assert_eq!(&after.stage_history[..before.stage_history.len()], &before.stage_history[..]);
        }
    }
}
