//! Per-type intent handlers.
//!
//! Fired after an action handler runs. Each handler reads the action state
//! distribution from the store and promotes the intent when the distribution
//! is conclusive; anything else is a no-op until the next callback.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;

use crate::data::intent::{self, State, Type};
use crate::data::{action, Provider, StoreError};

pub trait IntentHandler: Send + Sync {
    fn on_action_updated(&self, intent_id: &str) -> anyhow::Result<()>;
}

/// Promotes the intent from its action state distribution: all Confirmed
/// promotes to Confirmed, any Failed promotes to Failed, all Revoked
/// promotes to Revoked.
fn promote_from_actions(data: &Provider, intent_id: &str) -> anyhow::Result<()> {
    let mut intent_record = data.intents.get(intent_id)?;
    if intent_record.state.is_terminal() {
        return Ok(());
    }

    let actions = data.actions.get_all_by_intent(intent_id)?;

    let any_failed = actions.iter().any(|a| a.state == action::State::Failed);
    let all_confirmed = actions.iter().all(|a| a.state == action::State::Confirmed);
    let all_revoked = actions.iter().all(|a| a.state == action::State::Revoked);

    let next_state = if any_failed {
        State::Failed
    } else if all_confirmed {
        State::Confirmed
    } else if all_revoked {
        State::Revoked
    } else {
        return Ok(());
    };

    intent_record.state = next_state;
    match data.intents.update(&mut intent_record) {
        Ok(()) => {
            info!(intent = intent_id, state = ?next_state, "intent reached terminal state");
            Ok(())
        }
        // Another callback promoted it first; the distribution is stable so
        // the outcome is identical.
        Err(StoreError::StaleVersion) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

macro_rules! distribution_intent_handler {
    ($name:ident) => {
        pub struct $name {
            data: Provider,
        }

        impl IntentHandler for $name {
            fn on_action_updated(&self, intent_id: &str) -> anyhow::Result<()> {
                promote_from_actions(&self.data, intent_id)
            }
        }
    };
}

distribution_intent_handler!(OpenAccountIntentHandler);
distribution_intent_handler!(SendPaymentIntentHandler);
distribution_intent_handler!(ReceivePaymentIntentHandler);
distribution_intent_handler!(VoidGiftCardIntentHandler);
distribution_intent_handler!(SwapIntentHandler);

/// All intent types, used to verify registry completeness at startup.
pub const ALL_TYPES: [Type; 5] = [
    Type::OpenAccount,
    Type::SendPayment,
    Type::ReceivePayment,
    Type::VoidGiftCard,
    Type::Swap,
];

pub fn get_intent_handlers(data: &Provider) -> HashMap<Type, Arc<dyn IntentHandler>> {
    let mut handlers: HashMap<Type, Arc<dyn IntentHandler>> = HashMap::new();
    handlers.insert(
        Type::OpenAccount,
        Arc::new(OpenAccountIntentHandler { data: data.clone() }),
    );
    handlers.insert(
        Type::SendPayment,
        Arc::new(SendPaymentIntentHandler { data: data.clone() }),
    );
    handlers.insert(
        Type::ReceivePayment,
        Arc::new(ReceivePaymentIntentHandler { data: data.clone() }),
    );
    handlers.insert(
        Type::VoidGiftCard,
        Arc::new(VoidGiftCardIntentHandler { data: data.clone() }),
    );
    handlers.insert(
        Type::Swap,
        Arc::new(SwapIntentHandler { data: data.clone() }),
    );
    handlers
}
