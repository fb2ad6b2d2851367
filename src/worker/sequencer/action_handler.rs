//! Per-type action handlers.
//!
//! Fired by the sequencer when a fulfillment reaches a terminal state. The
//! new fulfillment state is passed in because it is not persisted until the
//! very end of a worker pass.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::bail;

use crate::data::action::{self, Type};
use crate::data::fulfillment::{self, State};
use crate::data::{Provider, StoreError};

pub trait ActionHandler: Send + Sync {
    fn on_fulfillment_state_change(
        &self,
        record: &fulfillment::Record,
        new_state: State,
    ) -> anyhow::Result<()>;
}

fn mark_action_confirmed(data: &Provider, intent_id: &str, action_id: u32) -> anyhow::Result<()> {
    let mut record = data.actions.get_by_id(intent_id, action_id)?;

    if record.state == action::State::Confirmed {
        return Ok(());
    }
    if record.state != action::State::Pending {
        bail!("invalid action state transition from {:?}", record.state);
    }

    record.state = action::State::Confirmed;
    match data.actions.update(&mut record) {
        Ok(()) => Ok(()),
        // A concurrent writer got there first; re-read settles idempotency.
        Err(StoreError::StaleVersion) => {
            let current = data.actions.get_by_id(intent_id, action_id)?;
            if current.state == action::State::Confirmed {
                Ok(())
            } else {
                bail!("lost action update race to an incompatible state")
            }
        }
        Err(err) => Err(err.into()),
    }
}

fn mark_action_failed(data: &Provider, intent_id: &str, action_id: u32) -> anyhow::Result<()> {
    let mut record = data.actions.get_by_id(intent_id, action_id)?;

    if record.state == action::State::Failed {
        return Ok(());
    }
    if record.state != action::State::Pending {
        bail!("invalid action state transition from {:?}", record.state);
    }

    record.state = action::State::Failed;
    match data.actions.update(&mut record) {
        Ok(()) => Ok(()),
        Err(StoreError::StaleVersion) => {
            let current = data.actions.get_by_id(intent_id, action_id)?;
            if current.state == action::State::Failed {
                Ok(())
            } else {
                bail!("lost action update race to an incompatible state")
            }
        }
        Err(err) => Err(err.into()),
    }
}

/// Shared policy: a Confirmed fulfillment confirms the action, a Failed one
/// fails it, anything else is a no-op. Each handler only differs in the
/// fulfillment type it accepts.
fn propagate(
    data: &Provider,
    expected: fulfillment::Type,
    record: &fulfillment::Record,
    new_state: State,
) -> anyhow::Result<()> {
    if record.fulfillment_type != expected {
        bail!(
            "unexpected fulfillment type {:?} for action handler",
            record.fulfillment_type
        );
    }

    match new_state {
        State::Confirmed => mark_action_confirmed(data, &record.intent_id, record.action_id),
        State::Failed => mark_action_failed(data, &record.intent_id, record.action_id),
        _ => Ok(()),
    }
}

pub struct OpenAccountActionHandler {
    data: Provider,
}

impl ActionHandler for OpenAccountActionHandler {
    fn on_fulfillment_state_change(
        &self,
        record: &fulfillment::Record,
        new_state: State,
    ) -> anyhow::Result<()> {
        propagate(
            &self.data,
            fulfillment::Type::InitializeLockedTimelockAccount,
            record,
            new_state,
        )
    }
}

pub struct CloseEmptyAccountActionHandler {
    data: Provider,
}

impl ActionHandler for CloseEmptyAccountActionHandler {
    fn on_fulfillment_state_change(
        &self,
        record: &fulfillment::Record,
        new_state: State,
    ) -> anyhow::Result<()> {
        propagate(
            &self.data,
            fulfillment::Type::CloseEmptyTimelockAccount,
            record,
            new_state,
        )
    }
}

pub struct NoPrivacyTransferActionHandler {
    data: Provider,
}

impl ActionHandler for NoPrivacyTransferActionHandler {
    fn on_fulfillment_state_change(
        &self,
        record: &fulfillment::Record,
        new_state: State,
    ) -> anyhow::Result<()> {
        propagate(
            &self.data,
            fulfillment::Type::NoPrivacyTransferWithAuthority,
            record,
            new_state,
        )
    }
}

pub struct NoPrivacyWithdrawActionHandler {
    data: Provider,
}

impl ActionHandler for NoPrivacyWithdrawActionHandler {
    fn on_fulfillment_state_change(
        &self,
        record: &fulfillment::Record,
        new_state: State,
    ) -> anyhow::Result<()> {
        propagate(
            &self.data,
            fulfillment::Type::NoPrivacyWithdraw,
            record,
            new_state,
        )
    }
}

/// All action types, used to verify registry completeness at startup.
pub const ALL_TYPES: [Type; 4] = [
    Type::OpenAccount,
    Type::CloseEmptyAccount,
    Type::NoPrivacyTransfer,
    Type::NoPrivacyWithdraw,
];

pub fn get_action_handlers(data: &Provider) -> HashMap<Type, Arc<dyn ActionHandler>> {
    let mut handlers: HashMap<Type, Arc<dyn ActionHandler>> = HashMap::new();
    handlers.insert(
        Type::OpenAccount,
        Arc::new(OpenAccountActionHandler { data: data.clone() }),
    );
    handlers.insert(
        Type::CloseEmptyAccount,
        Arc::new(CloseEmptyAccountActionHandler { data: data.clone() }),
    );
    handlers.insert(
        Type::NoPrivacyTransfer,
        Arc::new(NoPrivacyTransferActionHandler { data: data.clone() }),
    );
    handlers.insert(
        Type::NoPrivacyWithdraw,
        Arc::new(NoPrivacyWithdrawActionHandler { data: data.clone() }),
    );
    handlers
}
