//! Swap transaction submission.
//!
//! Once the funding intent confirms, the client signs the swap transaction
//! and submits it here. Acceptance moves the swap from Funded to Submitting;
//! the swap worker then drives the transaction to finalization. A funded
//! swap that never comes back through this endpoint is cancelled by the
//! worker after the client timeout.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use solana_sdk::signature::Signature;
use solana_sdk::transaction::Transaction;
use tracing::{info, warn};
use warp::http::StatusCode;

use crate::auth::AuthError;
use crate::common::Account;
use crate::data::swap::State;
use crate::data::StoreError;

use super::{decode_signature, ApiResponse, TransactionServer};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitSwapMessage {
    /// Owner account that created the swap (base58)
    pub owner: String,
    pub swap_id: String,
    /// Client-signed swap transaction (base64 wire blob)
    pub transaction: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitSwapRequest {
    pub message: SubmitSwapMessage,
    /// Base58 signature over the canonical serialization of `message`
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitSwapResult {
    Ok,
    NotFound,
    Denied,
    Invalid,
    StaleState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitSwapResponse {
    pub result: SubmitSwapResult,
    /// Signature of the accepted swap transaction
    pub signature: Option<String>,
    pub reason: Option<String>,
}

fn refusal(result: SubmitSwapResult, reason: &str) -> SubmitSwapResponse {
    SubmitSwapResponse {
        result,
        signature: None,
        reason: Some(reason.to_string()),
    }
}

enum SwapSubmitError {
    Unauthenticated,
    Internal(anyhow::Error),
}

/// Accepts the client-signed swap transaction for a funded swap.
async fn submit_swap_transaction(
    server: &TransactionServer,
    request: &SubmitSwapRequest,
) -> Result<SubmitSwapResponse, SwapSubmitError> {
    let message = &request.message;

    let owner = match Account::from_base58(&message.owner) {
        Ok(owner) => owner,
        Err(_) => return Ok(refusal(SubmitSwapResult::Invalid, "invalid owner account")),
    };

    let signature = decode_signature(request.signature.as_deref());
    server
        .auth
        .authenticate(&owner, message, signature.as_ref())
        .map_err(|err| match err {
            AuthError::Unauthenticated => SwapSubmitError::Unauthenticated,
            AuthError::Internal(message) => SwapSubmitError::Internal(anyhow::anyhow!(message)),
        })?;

    let mut record = match server.data.swaps.get(&message.swap_id) {
        Ok(record) => record,
        Err(StoreError::NotFound) => {
            return Ok(refusal(SubmitSwapResult::NotFound, "swap not found"))
        }
        Err(err) => return Err(SwapSubmitError::Internal(err.into())),
    };

    if record.owner != message.owner {
        return Ok(refusal(SubmitSwapResult::Denied, "swap belongs to another owner"));
    }

    // Only a funded swap accepts a signed transaction. Anything earlier
    // hasn't settled the funding leg yet; anything later was already
    // submitted, cancelled, or timed out.
    if record.state != State::Funded {
        return Ok(refusal(
            SubmitSwapResult::StaleState,
            "swap is not waiting for a signed transaction",
        ));
    }

    let blob = match STANDARD.decode(&message.transaction) {
        Ok(blob) => blob,
        Err(_) => return Ok(refusal(SubmitSwapResult::Invalid, "malformed transaction encoding")),
    };
    let transaction: Transaction = match bincode::deserialize(&blob) {
        Ok(transaction) => transaction,
        Err(_) => return Ok(refusal(SubmitSwapResult::Invalid, "malformed transaction")),
    };

    let transaction_signature = match transaction.signatures.first() {
        Some(signature) if *signature != Signature::default() => signature.to_string(),
        _ => return Ok(refusal(SubmitSwapResult::Invalid, "transaction is not signed")),
    };

    record.transaction_blob = Some(blob);
    record.transaction_signature = Some(transaction_signature.clone());
    record.state = State::Submitting;
    match server.data.swaps.update(&mut record) {
        Ok(()) => {}
        // A concurrent writer (the timeout worker, or a duplicate submit)
        // moved the swap first; the client re-reads and decides.
        Err(StoreError::StaleVersion) | Err(StoreError::InvalidStateTransition) => {
            return Ok(refusal(
                SubmitSwapResult::StaleState,
                "swap state changed during submission",
            ));
        }
        Err(err) => return Err(SwapSubmitError::Internal(err.into())),
    }

    info!(
        swap = %message.swap_id,
        signature = %transaction_signature,
        "swap transaction accepted for submission"
    );

    Ok(SubmitSwapResponse {
        result: SubmitSwapResult::Ok,
        signature: Some(transaction_signature),
        reason: None,
    })
}

pub async fn submit_swap_handler(
    request: SubmitSwapRequest,
    server: Arc<TransactionServer>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let (status, response) = match submit_swap_transaction(&server, &request).await {
        Ok(response) => (StatusCode::OK, ApiResponse::ok(response)),
        Err(SwapSubmitError::Unauthenticated) => {
            (StatusCode::UNAUTHORIZED, ApiResponse::err("unauthenticated"))
        }
        Err(SwapSubmitError::Internal(err)) => {
            warn!(error = format!("{err:#}"), "swap submission failed internally");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiResponse::err("internal error"),
            )
        }
    };

    Ok(warp::reply::with_status(warp::reply::json(&response), status))
}
