//! Anti-spam and AML guards.
//!
//! Both are consulted as opaque predicates by the intent submitter, gated by
//! intent type and owner history. A denial carries a reason tag surfaced to
//! the client.

use std::time::{Duration, SystemTime};

use thiserror::Error;
use tracing::debug;

use crate::config::GuardConfig;
use crate::currency::MAX_DAILY_USD_LIMIT;
use crate::data::{Provider, StoreError};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GuardError {
    #[error("denied: {0}")]
    Denied(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct Guard {
    conf: GuardConfig,
    data: Provider,
}

impl Guard {
    pub fn new(conf: GuardConfig, data: Provider) -> Self {
        Self { conf, data }
    }

    /// Anti-spam gate applied to every intent submission.
    pub fn allow_intent_submission(&self, owner: &str) -> Result<(), GuardError> {
        if !self.conf.antispam_enabled {
            return Ok(());
        }

        let hour_ago = SystemTime::now() - Duration::from_secs(3600);
        let recent = self.data.intents.count_by_initiator_since(owner, hour_ago)?;
        if recent >= self.conf.max_intents_per_hour {
            debug!(owner, recent, "owner exceeded hourly intent budget");
            return Err(GuardError::Denied("too-many-intents".to_string()));
        }

        Ok(())
    }

    /// AML gate applied to payment intents, against the rolling daily USD
    /// budget.
    pub fn allow_payment_value(&self, owner: &str, usd_value: f64) -> Result<(), GuardError> {
        if !self.conf.aml_enabled {
            return Ok(());
        }

        let day_ago = SystemTime::now() - Duration::from_secs(86_400);
        let consumed = self.data.intents.transacted_usd_since(owner, day_ago)?;
        if consumed + usd_value > MAX_DAILY_USD_LIMIT {
            debug!(owner, consumed, usd_value, "payment exceeds daily usd limit");
            return Err(GuardError::Denied("daily-limit-exceeded".to_string()));
        }

        Ok(())
    }
}
