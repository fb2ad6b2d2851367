//! Per-type fulfillment handlers.
//!
//! Each fulfillment type registers one handler with a fixed capability set:
//! contextual scheduling checks, on-demand transaction construction, and the
//! success / failure / revocation callbacks fired by the sequencer loops.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use solana_sdk::pubkey::Pubkey;
use tracing::debug;

use crate::common::VmRegistry;
use crate::data::fulfillment::{self, Type};
use crate::data::{nonce, Provider, StoreError};
use crate::transaction::{
    make_close_empty_account_transaction, make_withdraw_transaction, BuiltTransaction,
};

/// Dependencies shared by every fulfillment handler.
#[derive(Clone)]
pub struct HandlerDeps {
    pub data: Provider,
    pub vm_program_id: Pubkey,
    pub vm_registry: Arc<VmRegistry>,
    pub core_mint: Pubkey,
}

pub trait FulfillmentHandler: Send + Sync {
    /// Type-specific scheduling conditions, consulted after the generic
    /// scheduler gates pass.
    fn can_submit_to_blockchain(&self, record: &fulfillment::Record) -> anyhow::Result<bool>;

    /// Whether transactions for this type are built at submission time
    /// instead of being pre-signed at intent submission.
    fn supports_on_demand_transactions(&self) -> bool;

    /// Builds and signs a transaction against the given freshly claimed
    /// nonce. Only called for types that support on-demand transactions.
    fn make_on_demand_transaction(
        &self,
        record: &fulfillment::Record,
        nonce_record: &nonce::Record,
    ) -> anyhow::Result<BuiltTransaction>;

    /// Fired when the transaction is finalized successfully, before the
    /// state transition cascades upward.
    fn on_success(&self, record: &fulfillment::Record) -> anyhow::Result<()>;

    /// Fired when the transaction failed on chain. Returns true when the
    /// handler recovered (e.g. synthesized a replacement) and the
    /// fulfillment should stay Pending.
    fn on_failure(&self, record: &fulfillment::Record) -> anyhow::Result<bool>;

    /// Whether the fulfillment can no longer land, e.g. its nonce was
    /// consumed by another transaction.
    fn is_revoked(&self, record: &fulfillment::Record) -> anyhow::Result<bool>;
}

/// True when no earlier-ordered, non-terminal fulfillment involves the
/// account. This is the per-account total-order guarantee: a fulfillment
/// may not be submitted while any earlier one on the same account is live.
fn is_earliest_for_account(
    data: &Provider,
    address: &str,
    record: &fulfillment::Record,
) -> Result<bool, StoreError> {
    match data
        .fulfillments
        .get_first_schedulable_by_address_as_source(address)
    {
        Ok(first) if first.id != record.id && first.ordering() < record.ordering() => {
            return Ok(false)
        }
        Ok(_) | Err(StoreError::NotFound) => {}
        Err(err) => return Err(err),
    }

    match data
        .fulfillments
        .get_first_schedulable_by_address_as_destination(address)
    {
        Ok(first) if first.id != record.id && first.ordering() < record.ordering() => {
            return Ok(false)
        }
        Ok(_) | Err(StoreError::NotFound) => {}
        Err(err) => return Err(err),
    }

    Ok(true)
}

/// A durable nonce whose on-chain value moved past the value we built
/// against, while our transaction is still unobserved, was consumed by
/// another transaction. The fulfillment can never land.
fn nonce_consumed_elsewhere(
    data: &Provider,
    record: &fulfillment::Record,
) -> Result<bool, StoreError> {
    let (Some(nonce_address), Some(built_value)) = (&record.nonce, &record.blockhash) else {
        return Ok(false);
    };

    let nonce_record = data.nonces.get(nonce_address)?;
    Ok(nonce_record.blockhash.as_deref() != Some(built_value.as_str()))
}

/// Resolves the VM environment and timelock accounts for the owner of a
/// token account the server manages.
fn resolve_timelock(
    deps: &HandlerDeps,
    token_account: &str,
) -> anyhow::Result<(
    crate::common::VmEnvironment,
    crate::common::TimelockAccounts,
)> {
    let info = deps
        .data
        .account_infos
        .get_by_token_address(token_account)
        .context("no account info for token account")?;

    let mint = info
        .mint
        .parse::<Pubkey>()
        .context("malformed mint on account info")?;
    let environment = deps.vm_registry.for_mint(&mint)?.clone();

    let owner = crate::common::Account::from_base58(&info.owner)?;
    let timelock = environment.timelock_accounts_for(&deps.vm_program_id, &owner);
    Ok((environment, timelock))
}

fn update_cached_balance(
    data: &Provider,
    token_account: &str,
    new_balance: u64,
) -> Result<(), StoreError> {
    let lock = data.balances.get_version_lock(token_account)?;
    data.balances.commit(&lock, Some(new_balance))
}

pub struct InitializeLockedTimelockAccountHandler {
    deps: HandlerDeps,
}

impl FulfillmentHandler for InitializeLockedTimelockAccountHandler {
    fn can_submit_to_blockchain(&self, record: &fulfillment::Record) -> anyhow::Result<bool> {
        Ok(is_earliest_for_account(&self.deps.data, &record.source, record)?)
    }

    fn supports_on_demand_transactions(&self) -> bool {
        false
    }

    fn make_on_demand_transaction(
        &self,
        _record: &fulfillment::Record,
        _nonce_record: &nonce::Record,
    ) -> anyhow::Result<BuiltTransaction> {
        bail!("initialize fulfillments are pre-signed at intent submission")
    }

    fn on_success(&self, record: &fulfillment::Record) -> anyhow::Result<()> {
        debug!(vault = %record.source, "timelock account initialized");
        Ok(())
    }

    fn on_failure(&self, _record: &fulfillment::Record) -> anyhow::Result<bool> {
        Ok(false)
    }

    fn is_revoked(&self, record: &fulfillment::Record) -> anyhow::Result<bool> {
        Ok(nonce_consumed_elsewhere(&self.deps.data, record)?)
    }
}

pub struct NoPrivacyTransferWithAuthorityHandler {
    deps: HandlerDeps,
}

impl FulfillmentHandler for NoPrivacyTransferWithAuthorityHandler {
    fn can_submit_to_blockchain(&self, record: &fulfillment::Record) -> anyhow::Result<bool> {
        if !is_earliest_for_account(&self.deps.data, &record.source, record)? {
            return Ok(false);
        }
        if let Some(destination) = &record.destination {
            if !is_earliest_for_account(&self.deps.data, destination, record)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn supports_on_demand_transactions(&self) -> bool {
        false
    }

    fn make_on_demand_transaction(
        &self,
        _record: &fulfillment::Record,
        _nonce_record: &nonce::Record,
    ) -> anyhow::Result<BuiltTransaction> {
        bail!("transfer fulfillments are pre-signed at intent submission")
    }

    fn on_success(&self, record: &fulfillment::Record) -> anyhow::Result<()> {
        let action = self
            .deps
            .data
            .actions
            .get_by_id(&record.intent_id, record.action_id)?;
        let Some(amount) = action.quantity else {
            return Ok(());
        };

        let source_balance = self.deps.data.balances.get_cached_balance(&record.source)?;
        update_cached_balance(
            &self.deps.data,
            &record.source,
            source_balance.saturating_sub(amount),
        )?;

        if let Some(destination) = &record.destination {
            let destination_balance =
                self.deps.data.balances.get_cached_balance(destination)?;
            update_cached_balance(
                &self.deps.data,
                destination,
                destination_balance.saturating_add(amount),
            )?;
        }
        Ok(())
    }

    fn on_failure(&self, _record: &fulfillment::Record) -> anyhow::Result<bool> {
        Ok(false)
    }

    fn is_revoked(&self, record: &fulfillment::Record) -> anyhow::Result<bool> {
        Ok(nonce_consumed_elsewhere(&self.deps.data, record)?)
    }
}

pub struct NoPrivacyWithdrawHandler {
    deps: HandlerDeps,
}

impl FulfillmentHandler for NoPrivacyWithdrawHandler {
    fn can_submit_to_blockchain(&self, record: &fulfillment::Record) -> anyhow::Result<bool> {
        if !is_earliest_for_account(&self.deps.data, &record.source, record)? {
            return Ok(false);
        }
        if let Some(destination) = &record.destination {
            if !is_earliest_for_account(&self.deps.data, destination, record)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn supports_on_demand_transactions(&self) -> bool {
        true
    }

    fn make_on_demand_transaction(
        &self,
        record: &fulfillment::Record,
        nonce_record: &nonce::Record,
    ) -> anyhow::Result<BuiltTransaction> {
        let destination = record
            .destination
            .as_deref()
            .context("withdraw fulfillment is missing a destination")?
            .parse::<Pubkey>()
            .context("malformed withdraw destination")?;

        let (environment, timelock) = resolve_timelock(&self.deps, &record.source)?;
        Ok(make_withdraw_transaction(
            &self.deps.vm_program_id,
            &environment,
            &timelock,
            &destination,
            nonce_record,
        )?)
    }

    fn on_success(&self, record: &fulfillment::Record) -> anyhow::Result<()> {
        // A withdraw drains the source completely.
        let drained = self.deps.data.balances.get_cached_balance(&record.source)?;
        update_cached_balance(&self.deps.data, &record.source, 0)?;

        if let Some(destination) = &record.destination {
            let destination_balance =
                self.deps.data.balances.get_cached_balance(destination)?;
            update_cached_balance(
                &self.deps.data,
                destination,
                destination_balance.saturating_add(drained),
            )?;
        }
        Ok(())
    }

    fn on_failure(&self, _record: &fulfillment::Record) -> anyhow::Result<bool> {
        Ok(false)
    }

    fn is_revoked(&self, record: &fulfillment::Record) -> anyhow::Result<bool> {
        Ok(nonce_consumed_elsewhere(&self.deps.data, record)?)
    }
}

pub struct CloseEmptyTimelockAccountHandler {
    deps: HandlerDeps,
}

impl FulfillmentHandler for CloseEmptyTimelockAccountHandler {
    fn can_submit_to_blockchain(&self, record: &fulfillment::Record) -> anyhow::Result<bool> {
        if !is_earliest_for_account(&self.deps.data, &record.source, record)? {
            return Ok(false);
        }

        // Only an empty account may be closed.
        let balance = self.deps.data.balances.get_cached_balance(&record.source)?;
        Ok(balance == 0)
    }

    fn supports_on_demand_transactions(&self) -> bool {
        true
    }

    fn make_on_demand_transaction(
        &self,
        record: &fulfillment::Record,
        nonce_record: &nonce::Record,
    ) -> anyhow::Result<BuiltTransaction> {
        let (environment, timelock) = resolve_timelock(&self.deps, &record.source)?;
        Ok(make_close_empty_account_transaction(
            &self.deps.vm_program_id,
            &environment,
            &timelock,
            nonce_record,
        )?)
    }

    fn on_success(&self, record: &fulfillment::Record) -> anyhow::Result<()> {
        debug!(vault = %record.source, "empty timelock account closed");
        Ok(())
    }

    fn on_failure(&self, _record: &fulfillment::Record) -> anyhow::Result<bool> {
        Ok(false)
    }

    fn is_revoked(&self, record: &fulfillment::Record) -> anyhow::Result<bool> {
        Ok(nonce_consumed_elsewhere(&self.deps.data, record)?)
    }
}

/// All fulfillment types, used to verify registry completeness at startup.
pub const ALL_TYPES: [Type; 4] = [
    Type::InitializeLockedTimelockAccount,
    Type::NoPrivacyTransferWithAuthority,
    Type::NoPrivacyWithdraw,
    Type::CloseEmptyTimelockAccount,
];

pub fn get_fulfillment_handlers(
    deps: &HandlerDeps,
) -> HashMap<Type, Arc<dyn FulfillmentHandler>> {
    let mut handlers: HashMap<Type, Arc<dyn FulfillmentHandler>> = HashMap::new();
    handlers.insert(
        Type::InitializeLockedTimelockAccount,
        Arc::new(InitializeLockedTimelockAccountHandler { deps: deps.clone() }),
    );
    handlers.insert(
        Type::NoPrivacyTransferWithAuthority,
        Arc::new(NoPrivacyTransferWithAuthorityHandler { deps: deps.clone() }),
    );
    handlers.insert(
        Type::NoPrivacyWithdraw,
        Arc::new(NoPrivacyWithdrawHandler { deps: deps.clone() }),
    );
    handlers.insert(
        Type::CloseEmptyTimelockAccount,
        Arc::new(CloseEmptyTimelockAccountHandler { deps: deps.clone() }),
    );
    handlers
}
