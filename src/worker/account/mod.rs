//! Gift card auto-return.
//!
//! Unclaimed gift cards are returned to their issuer after the expiry
//! window. The return is modeled as an extra withdraw action appended to the
//! original issuance intent, so the sequencer drives it like any other
//! fulfillment. The voiding RPC shares the same entry points.

use std::time::{Duration, SystemTime};

use anyhow::{bail, Context};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::data::balance::OptimisticVersionLock;
use crate::data::{account_info, action, fulfillment, Provider, StoreError};
use crate::worker::{Runtime, ShutdownSignal};

/// Schedules the auto-return of a gift card's funds to its issuer.
///
/// Appends a withdraw action (and its on-demand fulfillment) to the issuance
/// intent, stamping the balance version lock so concurrent claims are
/// rejected at commit time. Idempotent: an existing withdraw action for the
/// vault makes this a no-op.
pub fn initiate_auto_return_process(
    data: &Provider,
    gift_card_vault: &str,
    balance_lock: &OptimisticVersionLock,
) -> anyhow::Result<()> {
    match data.actions.get_gift_card_claimed_action(gift_card_vault) {
        Ok(_) => return Ok(()),
        Err(StoreError::NotFound) => {}
        Err(err) => return Err(err.into()),
    }

    let issued_intent = data
        .intents
        .get_gift_card_issued_intent(gift_card_vault)
        .context("no issuance intent for gift card")?;

    // The issuer's vault is the source of the original transfer action.
    let issuance_actions = data.actions.get_all_by_intent(&issued_intent.intent_id)?;
    let transfer_action = issuance_actions
        .iter()
        .find(|a| a.action_type == action::Type::NoPrivacyTransfer)
        .context("issuance intent has no transfer action")?;
    let issuer_vault = transfer_action.source.clone();

    let next_action_id = issuance_actions
        .iter()
        .map(|a| a.action_id)
        .max()
        .map(|id| id + 1)
        .unwrap_or(0);

    let balance = data.balances.get_cached_balance(gift_card_vault)?;

    let mut auto_return_action = action::Record {
        id: 0,
        intent_id: issued_intent.intent_id.clone(),
        action_id: next_action_id,
        action_type: action::Type::NoPrivacyWithdraw,
        source: gift_card_vault.to_string(),
        destination: Some(issuer_vault.clone()),
        quantity: Some(balance),
        state: action::State::Pending,
        version: 0,
        created_at: SystemTime::now(),
    };

    let mut auto_return_fulfillment = fulfillment::Record {
        id: 0,
        intent_id: issued_intent.intent_id.clone(),
        intent_type: issued_intent.intent_type,
        action_id: next_action_id,
        action_type: action::Type::NoPrivacyWithdraw,
        fulfillment_type: fulfillment::Type::NoPrivacyWithdraw,
        state: fulfillment::State::Unknown,
        source: gift_card_vault.to_string(),
        destination: Some(issuer_vault),
        nonce: None,
        blockhash: None,
        data: None,
        signature: None,
        virtual_signature: None,
        disable_active_scheduling: false,
        intent_ordering_index: issued_intent.id,
        action_ordering_index: next_action_id,
        fulfillment_ordering_index: 0,
        version: 0,
        created_at: SystemTime::now(),
    };

    // Commit the version lock first: a racing claim that already advanced
    // the balance version wins, and no return is scheduled.
    if let Err(err) = data.balances.commit(balance_lock, None) {
        bail!("balance version advanced while scheduling auto-return: {err}");
    }

    data.actions
        .put_all(std::slice::from_mut(&mut auto_return_action))?;
    data.fulfillments
        .put_all(std::slice::from_mut(&mut auto_return_fulfillment))?;

    info!(vault = gift_card_vault, "scheduled gift card auto-return");
    Ok(())
}

/// Marks the auto-return disposition done so the sweep skips the account.
/// Failures are tolerated; the sweep re-processes idempotently later.
pub fn mark_auto_return_check_complete(
    data: &Provider,
    record: &account_info::Record,
) -> anyhow::Result<()> {
    let mut fresh = data
        .account_infos
        .get_by_token_address(&record.token_account)?;
    fresh.auto_return_check_complete = true;
    data.account_infos.update(&mut fresh)?;
    Ok(())
}

pub struct AccountRuntime {
    data: Provider,
    gift_card_expiry: Duration,
    batch_size: usize,
}

impl AccountRuntime {
    pub fn new(data: Provider, gift_card_expiry: Duration, batch_size: usize) -> Self {
        Self {
            data,
            gift_card_expiry,
            batch_size,
        }
    }

    /// One pass over expired, undispositioned gift cards.
    pub fn sweep_expired_gift_cards(&self) -> anyhow::Result<usize> {
        let due = self
            .data
            .account_infos
            .get_gift_cards_needing_auto_return_check(self.gift_card_expiry, self.batch_size)?;

        let mut processed = 0;
        for record in due {
            if let Err(err) = self.process_expired_gift_card(&record) {
                warn!(
                    vault = %record.token_account,
                    error = format!("{err:#}"),
                    "failure processing expired gift card"
                );
                continue;
            }
            processed += 1;
        }
        Ok(processed)
    }

    fn process_expired_gift_card(&self, record: &account_info::Record) -> anyhow::Result<()> {
        let balance_lock = self
            .data
            .balances
            .get_version_lock(&record.token_account)?;

        // Already claimed by someone; nothing to return.
        match self
            .data
            .actions
            .get_gift_card_claimed_action(&record.token_account)
        {
            Ok(_) => {}
            Err(StoreError::NotFound) => {
                initiate_auto_return_process(&self.data, &record.token_account, &balance_lock)?;
            }
            Err(err) => return Err(err.into()),
        }

        mark_auto_return_check_complete(&self.data, record)?;
        Ok(())
    }

    async fn gift_card_worker(&self, shutdown: ShutdownSignal, interval: Duration) {
        loop {
            if shutdown.sleep(interval).await {
                return;
            }

            match self.sweep_expired_gift_cards() {
                Ok(0) => {}
                Ok(processed) => info!(processed, "auto-returned expired gift cards"),
                Err(err) => warn!(error = format!("{err:#}"), "gift card sweep failed"),
            }
        }
    }

    async fn metrics_gauge_worker(&self, shutdown: ShutdownSignal) {
        let gauge_interval = Duration::from_secs(30);

        loop {
            if shutdown.sleep(gauge_interval).await {
                return;
            }

            match self
                .data
                .account_infos
                .get_gift_cards_needing_auto_return_check(self.gift_card_expiry, usize::MAX)
            {
                Ok(due) => info!(count = due.len(), "gift cards awaiting auto-return gauge"),
                Err(err) => warn!(error = %err, "failure reading auto-return backlog"),
            }
        }
    }
}

#[async_trait]
impl Runtime for AccountRuntime {
    async fn start(&self, shutdown: ShutdownSignal, interval: Duration) -> anyhow::Result<()> {
        tokio::join!(
            self.gift_card_worker(shutdown.clone(), interval),
            self.metrics_gauge_worker(shutdown.clone()),
        );
        Ok(())
    }
}
