//! Gift card voiding.
//!
//! Returns an unclaimed gift card's funds to the issuer ahead of the expiry
//! sweep. Serialized by the per-account lock and the balance version lock so
//! a concurrent claim either wins cleanly or loses cleanly.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::warn;
use warp::http::StatusCode;

use crate::common::Account;
use crate::data::{account_info, StoreError};
use crate::worker::account::{initiate_auto_return_process, mark_auto_return_check_complete};

use super::{decode_signature, ApiResponse, TransactionServer};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoidGiftCardMessage {
    /// Owner account voiding the card; must be the issuer (base58)
    pub owner: String,
    /// Gift card vault being voided (base58)
    pub gift_card_vault: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoidGiftCardRequest {
    pub message: VoidGiftCardMessage,
    /// Base58 signature over the canonical serialization of `message`
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VoidGiftCardResult {
    Ok,
    NotFound,
    Denied,
    ClaimedByOtherUser,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoidGiftCardResponse {
    pub result: VoidGiftCardResult,
}

enum VoidError {
    Unauthenticated,
    Internal(anyhow::Error),
}

async fn void_gift_card(
    server: &TransactionServer,
    request: &VoidGiftCardRequest,
) -> Result<VoidGiftCardResult, VoidError> {
    let message = &request.message;

    let owner = Account::from_base58(&message.owner)
        .map_err(|err| VoidError::Internal(err.into()))?;

    let signature = decode_signature(request.signature.as_deref());
    server
        .auth
        .authenticate(&owner, message, signature.as_ref())
        .map_err(|err| match err {
            crate::auth::AuthError::Unauthenticated => VoidError::Unauthenticated,
            crate::auth::AuthError::Internal(message) => {
                VoidError::Internal(anyhow::anyhow!(message))
            }
        })?;

    let info = match server
        .data
        .account_infos
        .get_by_token_address(&message.gift_card_vault)
    {
        Ok(info) => info,
        Err(StoreError::NotFound) => return Ok(VoidGiftCardResult::NotFound),
        Err(err) => return Err(VoidError::Internal(err.into())),
    };
    if info.account_type != account_info::AccountType::RemoteSendGiftCard {
        return Ok(VoidGiftCardResult::NotFound);
    }

    // Only the issuer may void.
    let issued_intent = server
        .data
        .intents
        .get_gift_card_issued_intent(&message.gift_card_vault)
        .map_err(|err| VoidError::Internal(err.into()))?;
    if issued_intent.initiator_owner != message.owner {
        return Ok(VoidGiftCardResult::Denied);
    }

    // Past expiry the auto-return worker owns the account; the void is
    // already effectively done.
    let age = info.created_at.elapsed().unwrap_or_default();
    if age >= server.gift_card_expiry() {
        return Ok(VoidGiftCardResult::Ok);
    }

    let balance_lock = server
        .data
        .balances
        .get_version_lock(&message.gift_card_vault)
        .map_err(|err| VoidError::Internal(err.into()))?;

    let local_lock = server.local_account_lock(&message.gift_card_vault).await;
    let _guard = local_lock.lock().await;

    match server
        .data
        .actions
        .get_gift_card_claimed_action(&message.gift_card_vault)
    {
        Ok(claimed) => {
            // Someone already drained the card. Voiding is OK only when the
            // funds went back to the issuer's own vault.
            let environment = server
                .vm_registry
                .for_mint(&server.core_mint.address)
                .map_err(|err| VoidError::Internal(err.into()))?;
            let owner_timelock =
                environment.timelock_accounts_for(server.vm_registry.program_id(), &owner);

            if claimed.destination.as_deref() == Some(owner_timelock.vault.to_string().as_str()) {
                return Ok(VoidGiftCardResult::Ok);
            }
            return Ok(VoidGiftCardResult::ClaimedByOtherUser);
        }
        Err(StoreError::NotFound) => {}
        Err(err) => return Err(VoidError::Internal(err.into())),
    }

    initiate_auto_return_process(&server.data, &message.gift_card_vault, &balance_lock)
        .map_err(VoidError::Internal)?;

    // It's ok if this fails; the auto-return worker re-processes the
    // account idempotently later.
    if let Err(err) = mark_auto_return_check_complete(&server.data, &info) {
        warn!(vault = %message.gift_card_vault, error = format!("{err:#}"), "failure marking auto-return check complete");
    }

    Ok(VoidGiftCardResult::Ok)
}

pub async fn void_gift_card_handler(
    request: VoidGiftCardRequest,
    server: Arc<TransactionServer>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let (status, response) = match void_gift_card(&server, &request).await {
        Ok(result) => (
            StatusCode::OK,
            ApiResponse::ok(VoidGiftCardResponse { result }),
        ),
        Err(VoidError::Unauthenticated) => {
            (StatusCode::UNAUTHORIZED, ApiResponse::err("unauthenticated"))
        }
        Err(VoidError::Internal(err)) => {
            warn!(error = format!("{err:#}"), "void gift card failed internally");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiResponse::err("internal error"),
            )
        }
    };

    Ok(warp::reply::with_status(warp::reply::json(&response), status))
}
