//! Contextual scheduler.
//!
//! Decides when fulfillments can be scheduled for submission to the chain.
//! It does not manage the internal state of a fulfillment. Five gates run in
//! order, short-circuiting on the first refusal: fulfillment preconditions,
//! action preconditions, circuit breakers, handler-contextual conditions,
//! and the fee-payer balance floor.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::common::subsidizer::{SubsidizerError, SubsidizerTreasury};
use crate::config::SchedulerConfig;
use crate::data::fulfillment::{self, State};
use crate::data::{action, Provider};

use super::fulfillment_handler::FulfillmentHandler;

#[async_trait]
pub trait Scheduler: Send + Sync {
    /// Determines whether the given fulfillment can be scheduled for
    /// submission to the blockchain.
    async fn can_submit_to_blockchain(
        &self,
        record: &fulfillment::Record,
    ) -> anyhow::Result<bool>;
}

/// Scheduler that utilizes the global, account, intent, action and local
/// context of a fulfillment to decide on submission.
///
/// Generic handling covers precondition checks, circuit breaker safety
/// mechanisms, and the subsidizer sanity check; contextualized logic is
/// deferred to the per-type handler.
///
/// Assumes user balances are fully under timelock control, and that
/// fulfillments requiring client signatures were validated to guarantee
/// success before being created.
pub struct ContextualScheduler {
    data: Provider,
    conf: SchedulerConfig,
    handlers_by_type: HashMap<fulfillment::Type, Arc<dyn FulfillmentHandler>>,
    subsidizer: Arc<SubsidizerTreasury>,

    /// Tests exercise scheduling without a funded fee payer.
    include_subsidizer_checks: bool,
}

impl ContextualScheduler {
    pub fn new(
        data: Provider,
        conf: SchedulerConfig,
        handlers_by_type: HashMap<fulfillment::Type, Arc<dyn FulfillmentHandler>>,
        subsidizer: Arc<SubsidizerTreasury>,
    ) -> Self {
        Self {
            data,
            conf,
            handlers_by_type,
            subsidizer,
            include_subsidizer_checks: true,
        }
    }

    pub fn without_subsidizer_checks(mut self) -> Self {
        self.include_subsidizer_checks = false;
        self
    }
}

#[async_trait]
impl Scheduler for ContextualScheduler {
    async fn can_submit_to_blockchain(
        &self,
        record: &fulfillment::Record,
    ) -> anyhow::Result<bool> {
        let handler = self
            .handlers_by_type
            .get(&record.fulfillment_type)
            .ok_or_else(|| {
                anyhow!(
                    "no fulfillment handler for {:?} type",
                    record.fulfillment_type
                )
            })?;

        let mut involved_accounts = vec![record.source.as_str()];
        if let Some(destination) = &record.destination {
            involved_accounts.push(destination.as_str());
        }

        //
        // Part 1: Fulfillment state precondition checks
        //

        // There should be data for a signed transaction when it's not made
        // on demand.
        if !handler.supports_on_demand_transactions()
            && record.data.as_ref().map(|d| d.is_empty()).unwrap_or(true)
        {
            warn!(
                intent = %record.intent_id,
                "asking to schedule a fulfillment without a signed transaction"
            );
            return Ok(false);
        }

        // A terminal fulfillment can't be submitted. Hitting this indicates
        // a worker not transitioning states properly.
        if record.state.is_terminal() {
            warn!(
                intent = %record.intent_id,
                "asking to schedule a fulfillment that's in a terminal state"
            );
            return Ok(false);
        }

        // Already scheduled; the caller is idempotent.
        if record.state == State::Pending {
            return Ok(true);
        }

        //
        // Part 2: Action state precondition checks
        //

        let action_record = self
            .data
            .actions
            .get_by_id(&record.intent_id, record.action_id)?;

        match action_record.state {
            action::State::Unknown => {
                debug!(intent = %record.intent_id, "not scheduling fulfillment with action in unknown state");
                return Ok(false);
            }
            action::State::Revoked | action::State::Failed => {
                warn!(
                    intent = %record.intent_id,
                    state = ?action_record.state,
                    "cannot schedule fulfillment with action in terminal failure state"
                );
                return Ok(false);
            }
            _ => {}
        }

        //
        // Part 3: Circuit breakers
        //

        if self.conf.disable_transaction_scheduling {
            debug!("not scheduling fulfillment because scheduling is disabled");
            return Ok(false);
        }

        // Account-level: zero tolerance. A failed fulfillment impacts the
        // entire dependency graph of intents starting from this one and
        // needs manual intervention.
        for account in &involved_accounts {
            let failed = self
                .data
                .fulfillments
                .count_by_state_and_address(State::Failed, account)?;
            if failed > 0 {
                warn!(account = %account, "not scheduling fulfillment because an account has failed fulfillments");
                return Ok(false);
            }
        }

        // Intent-level: zero tolerance.
        let failed = self
            .data
            .fulfillments
            .count_by_intent_and_state(&record.intent_id, State::Failed)?;
        if failed > 0 {
            warn!(intent = %record.intent_id, "not scheduling fulfillment because intent has failed fulfillments");
            return Ok(false);
        }

        // Global: configurable threshold.
        let failed = self.data.fulfillments.count_by_state(State::Failed)?;
        if failed > self.conf.max_global_failed_fulfillments {
            warn!("not scheduling fulfillment because global circuit breaker was tripped");
            return Ok(false);
        }

        //
        // Part 4: Contextual scheduling
        //

        if !handler.can_submit_to_blockchain(record)? {
            debug!(intent = %record.intent_id, "handler did not schedule fulfillment");
            return Ok(false);
        }

        //
        // Part 5: Subsidizer checks
        //

        if self.include_subsidizer_checks {
            match self.subsidizer.enforce_minimum_balance().await {
                Ok(()) => {}
                Err(SubsidizerError::RequiresFunding) => {
                    warn!("not scheduling fulfillment because the subsidizer requires additional funding");
                    return Ok(false);
                }
                Err(err) => return Err(err.into()),
            }
        }

        debug!(intent = %record.intent_id, "scheduling this fulfillment for submission to blockchain");
        Ok(true)
    }
}
