//! Per-currency send limits.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::warn;
use warp::http::StatusCode;

use crate::auth::AuthError;
use crate::common::Account;
use crate::currency::{compute_send_limits, ComputedSendLimit};

use super::{decode_signature, ApiResponse, TransactionServer};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLimitsMessage {
    /// Owner account the limits apply to (base58)
    pub owner: String,
    /// Unix timestamp the daily consumption window starts at
    pub consumed_since: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLimitsRequest {
    pub message: GetLimitsMessage,
    /// Base58 signature over the canonical serialization of `message`
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetLimitsResponse {
    pub send_limits_by_currency: HashMap<String, ComputedSendLimit>,
    pub usd_transacted: f64,
}

enum LimitsError {
    Unauthenticated,
    Internal(anyhow::Error),
}

async fn get_limits(
    server: &TransactionServer,
    request: &GetLimitsRequest,
) -> Result<GetLimitsResponse, LimitsError> {
    let message = &request.message;

    let owner = Account::from_base58(&message.owner)
        .map_err(|err| LimitsError::Internal(err.into()))?;

    let signature = decode_signature(request.signature.as_deref());
    server
        .auth
        .authenticate(&owner, message, signature.as_ref())
        .map_err(|err| match err {
            AuthError::Unauthenticated => LimitsError::Unauthenticated,
            AuthError::Internal(message) => LimitsError::Internal(anyhow::anyhow!(message)),
        })?;

    let rates = server
        .data
        .currencies
        .get_rates(None)
        .map_err(|err| LimitsError::Internal(err.into()))?;
    let usd_rate = rates
        .rates
        .get("usd")
        .copied()
        .ok_or_else(|| LimitsError::Internal(anyhow::anyhow!("usd rate is missing")))?;

    let since = UNIX_EPOCH + Duration::from_secs(message.consumed_since);
    let since = since.min(SystemTime::now());
    let consumed_usd = server
        .data
        .intents
        .transacted_usd_since(&message.owner, since)
        .map_err(|err| LimitsError::Internal(err.into()))?;

    Ok(GetLimitsResponse {
        send_limits_by_currency: compute_send_limits(&rates.rates, usd_rate, consumed_usd),
        usd_transacted: consumed_usd,
    })
}

pub async fn get_limits_handler(
    request: GetLimitsRequest,
    server: Arc<TransactionServer>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let (status, response) = match get_limits(&server, &request).await {
        Ok(response) => (StatusCode::OK, ApiResponse::ok(response)),
        Err(LimitsError::Unauthenticated) => {
            (StatusCode::UNAUTHORIZED, ApiResponse::err("unauthenticated"))
        }
        Err(LimitsError::Internal(err)) => {
            warn!(error = format!("{err:#}"), "get limits failed internally");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiResponse::err("internal error"),
            )
        }
    };

    Ok(warp::reply::with_status(warp::reply::json(&response), status))
}
