//! Intent submission.
//!
//! Validates a client-signed intent, decomposes it into actions and
//! fulfillments with dense ordering indices, binds durable nonces, builds
//! and signs the pre-signed transactions, and persists the whole graph
//! atomically.

use std::sync::Arc;
use std::time::SystemTime;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};
use solana_sdk::pubkey::Pubkey;
use tracing::{info, warn};
use warp::http::StatusCode;

use crate::auth::AuthError;
use crate::common::{Account, TimelockAccounts};
use crate::data::nonce;
use crate::data::{account_info, action, fulfillment, intent, swap, StoreError};
use crate::guard::GuardError;
use crate::transaction::{
    make_initialize_timelock_account_transaction, make_transfer_with_authority_transaction,
    NoncePoolError,
};

use super::{decode_signature, ApiResponse, TransactionServer};

// ============================================================================
// REQUEST/RESPONSE STRUCTURES
// ============================================================================

/// The signed portion of a submission. Clients sign the canonical
/// serialization of this structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntentDescriptor {
    /// Client-provided opaque intent id, globally unique
    pub id: String,
    /// Owner account submitting the intent (base58)
    pub owner: String,
    /// Type-specific payload
    pub details: IntentDetails,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IntentDetails {
    OpenAccount,
    SendPayment {
        /// Destination owner account (base58). For remote sends this is the
        /// gift card owner key the client generated.
        destination_owner: String,
        quarks: u64,
        /// Issues the payment as a gift card claimable by anyone holding
        /// the destination owner key.
        is_remote_send: bool,
    },
    ReceivePayment {
        /// Gift card vault being claimed (base58)
        gift_card_vault: String,
    },
    Swap {
        swap_id: String,
        to_mint: String,
        quarks: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitIntentRequest {
    pub intent: IntentDescriptor,
    /// Base58 signature over the canonical serialization of `intent`
    pub signature: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitIntentResult {
    Ok,
    Invalid,
    Denied,
    StaleState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitIntentResponse {
    pub result: SubmitIntentResult,
    pub intent_id: Option<String>,
    /// Signatures of the server-signed transactions, in fulfillment order
    pub server_signatures: Vec<String>,
    pub reason: Option<String>,
}

#[derive(Debug)]
pub enum SubmitIntentError {
    Invalid(String),
    Denied(String),
    StaleState(String),
    Unauthenticated,
    /// Transient; the client retries.
    Internal(anyhow::Error),
}

impl From<StoreError> for SubmitIntentError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::AlreadyExists => {
                SubmitIntentError::StaleState("conflicting record already exists".to_string())
            }
            other => SubmitIntentError::Internal(other.into()),
        }
    }
}

impl From<GuardError> for SubmitIntentError {
    fn from(err: GuardError) -> Self {
        match err {
            GuardError::Denied(reason) => SubmitIntentError::Denied(reason),
            GuardError::Store(err) => SubmitIntentError::Internal(err.into()),
        }
    }
}

impl From<AuthError> for SubmitIntentError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthenticated => SubmitIntentError::Unauthenticated,
            AuthError::Internal(message) => SubmitIntentError::Internal(anyhow!(message)),
        }
    }
}

// ============================================================================
// DECOMPOSITION
// ============================================================================

/// How the pre-signed transaction for a planned fulfillment is built.
/// On-demand types defer construction to the sequencer.
enum Template {
    Initialize {
        timelock: TimelockAccounts,
    },
    Transfer {
        source: TimelockAccounts,
        destination: Pubkey,
        quarks: u64,
    },
    OnDemand,
}

struct PlannedFulfillment {
    record: fulfillment::Record,
    template: Template,
}

/// The full decomposition of one intent, ready for nonce binding and
/// persistence.
struct Plan {
    intent: intent::Record,
    actions: Vec<action::Record>,
    fulfillments: Vec<PlannedFulfillment>,
    new_account_infos: Vec<account_info::Record>,
    new_swap: Option<swap::Record>,
    usd_value: Option<f64>,
}

fn new_intent_record(descriptor: &IntentDescriptor, intent_type: intent::Type) -> intent::Record {
    intent::Record {
        id: 0,
        intent_id: descriptor.id.clone(),
        intent_type,
        initiator_owner: descriptor.owner.clone(),
        destination_owner: None,
        destination_token_account: None,
        mint: None,
        quantity: None,
        usd_value: None,
        state: intent::State::Pending,
        version: 0,
        created_at: SystemTime::now(),
    }
}

fn new_action_record(
    descriptor: &IntentDescriptor,
    action_id: u32,
    action_type: action::Type,
    source: String,
    destination: Option<String>,
    quantity: Option<u64>,
) -> action::Record {
    action::Record {
        id: 0,
        intent_id: descriptor.id.clone(),
        action_id,
        action_type,
        source,
        destination,
        quantity,
        state: action::State::Pending,
        version: 0,
        created_at: SystemTime::now(),
    }
}

fn new_fulfillment_record(
    descriptor: &IntentDescriptor,
    intent_type: intent::Type,
    action_record: &action::Record,
    fulfillment_type: fulfillment::Type,
    fulfillment_ordering_index: u32,
) -> fulfillment::Record {
    fulfillment::Record {
        id: 0,
        intent_id: descriptor.id.clone(),
        intent_type,
        action_id: action_record.action_id,
        action_type: action_record.action_type,
        fulfillment_type,
        state: fulfillment::State::Unknown,
        source: action_record.source.clone(),
        destination: action_record.destination.clone(),
        nonce: None,
        blockhash: None,
        data: None,
        signature: None,
        virtual_signature: None,
        disable_active_scheduling: false,
        // Stamped with the store-assigned intent id at persistence; the
        // action and fulfillment positions are dense from decomposition.
        intent_ordering_index: 0,
        action_ordering_index: action_record.action_id,
        fulfillment_ordering_index,
        version: 0,
        created_at: SystemTime::now(),
    }
}

fn usd_value_of(server: &TransactionServer, quarks: u64) -> Result<f64, SubmitIntentError> {
    let rates = server
        .data
        .currencies
        .get_rates(None)
        .map_err(|_| SubmitIntentError::Internal(anyhow!("no exchange rates available")))?;
    let usd_rate = rates
        .rates
        .get("usd")
        .copied()
        .ok_or_else(|| SubmitIntentError::Internal(anyhow!("usd rate is missing")))?;
    Ok(server.core_mint.quarks_to_units_f64(quarks) * usd_rate)
}

fn primary_vault(
    server: &TransactionServer,
    owner: &Account,
) -> Result<TimelockAccounts, SubmitIntentError> {
    let environment = server
        .vm_registry
        .for_mint(&server.core_mint.address)
        .map_err(|err| SubmitIntentError::Internal(err.into()))?;
    Ok(environment.timelock_accounts_for(server.vm_registry.program_id(), owner))
}

fn require_opened(
    server: &TransactionServer,
    vault: &Pubkey,
    what: &str,
) -> Result<account_info::Record, SubmitIntentError> {
    server
        .data
        .account_infos
        .get_by_token_address(&vault.to_string())
        .map_err(|_| SubmitIntentError::StaleState(format!("{what} account is not opened")))
}

/// Decomposes an intent descriptor into its action/fulfillment graph.
///
/// Pure with respect to the request: the same descriptor and store state
/// always produce the same plan, with ordering indices assigned densely in
/// (action position, fulfillment position) order.
fn decompose(
    server: &TransactionServer,
    owner: &Account,
    descriptor: &IntentDescriptor,
) -> Result<Plan, SubmitIntentError> {
    match &descriptor.details {
        IntentDetails::OpenAccount => plan_open_account(server, owner, descriptor),
        IntentDetails::SendPayment {
            destination_owner,
            quarks,
            is_remote_send,
        } => plan_send_payment(
            server,
            owner,
            descriptor,
            destination_owner,
            *quarks,
            *is_remote_send,
        ),
        IntentDetails::ReceivePayment { gift_card_vault } => {
            plan_receive_payment(server, owner, descriptor, gift_card_vault)
        }
        IntentDetails::Swap {
            swap_id,
            to_mint,
            quarks,
        } => plan_swap(server, owner, descriptor, swap_id, to_mint, *quarks),
    }
}

fn plan_open_account(
    server: &TransactionServer,
    owner: &Account,
    descriptor: &IntentDescriptor,
) -> Result<Plan, SubmitIntentError> {
    let timelock = primary_vault(server, owner)?;
    let vault = timelock.vault.to_string();

    if server.data.account_infos.get_by_token_address(&vault).is_ok() {
        return Err(SubmitIntentError::StaleState(
            "account is already opened".to_string(),
        ));
    }

    let mut intent_record = new_intent_record(descriptor, intent::Type::OpenAccount);
    intent_record.mint = Some(server.core_mint.address.to_string());

    let action_record = new_action_record(
        descriptor,
        0,
        action::Type::OpenAccount,
        vault.clone(),
        None,
        None,
    );
    let fulfillment_record = new_fulfillment_record(
        descriptor,
        intent::Type::OpenAccount,
        &action_record,
        fulfillment::Type::InitializeLockedTimelockAccount,
        0,
    );

    let account_info_record = account_info::Record {
        id: 0,
        owner: owner.to_base58(),
        mint: server.core_mint.address.to_string(),
        account_type: account_info::AccountType::Primary,
        index: 0,
        token_account: vault,
        auto_return_check_complete: false,
        version: 0,
        created_at: SystemTime::now(),
    };

    Ok(Plan {
        intent: intent_record,
        actions: vec![action_record],
        fulfillments: vec![PlannedFulfillment {
            record: fulfillment_record,
            template: Template::Initialize { timelock },
        }],
        new_account_infos: vec![account_info_record],
        new_swap: None,
        usd_value: None,
    })
}

fn plan_send_payment(
    server: &TransactionServer,
    owner: &Account,
    descriptor: &IntentDescriptor,
    destination_owner: &str,
    quarks: u64,
    is_remote_send: bool,
) -> Result<Plan, SubmitIntentError> {
    if quarks == 0 {
        return Err(SubmitIntentError::Invalid(
            "payment quantity must be positive".to_string(),
        ));
    }

    let source_timelock = primary_vault(server, owner)?;
    require_opened(server, &source_timelock.vault, "source")?;

    let destination_account = Account::from_base58(destination_owner)
        .map_err(|_| SubmitIntentError::Invalid("invalid destination owner".to_string()))?;
    let destination_timelock = primary_vault(server, &destination_account)?;
    let destination_vault = destination_timelock.vault.to_string();

    let usd_value = usd_value_of(server, quarks)?;

    let mut intent_record = new_intent_record(descriptor, intent::Type::SendPayment);
    intent_record.destination_owner = Some(destination_owner.to_string());
    intent_record.destination_token_account = Some(destination_vault.clone());
    intent_record.mint = Some(server.core_mint.address.to_string());
    intent_record.quantity = Some(quarks);
    intent_record.usd_value = Some(usd_value);

    let mut actions = Vec::new();
    let mut fulfillments = Vec::new();
    let mut new_account_infos = Vec::new();

    if is_remote_send {
        // A remote send issues a gift card: open the gift card vault first,
        // then fund it.
        if server
            .data
            .account_infos
            .get_by_token_address(&destination_vault)
            .is_ok()
        {
            return Err(SubmitIntentError::StaleState(
                "gift card account already exists".to_string(),
            ));
        }

        let open_action = new_action_record(
            descriptor,
            0,
            action::Type::OpenAccount,
            destination_vault.clone(),
            None,
            None,
        );
        fulfillments.push(PlannedFulfillment {
            record: new_fulfillment_record(
                descriptor,
                intent::Type::SendPayment,
                &open_action,
                fulfillment::Type::InitializeLockedTimelockAccount,
                0,
            ),
            template: Template::Initialize {
                timelock: destination_timelock.clone(),
            },
        });
        actions.push(open_action);

        new_account_infos.push(account_info::Record {
            id: 0,
            owner: destination_owner.to_string(),
            mint: server.core_mint.address.to_string(),
            account_type: account_info::AccountType::RemoteSendGiftCard,
            index: 0,
            token_account: destination_vault.clone(),
            auto_return_check_complete: false,
            version: 0,
            created_at: SystemTime::now(),
        });
    } else {
        require_opened(server, &destination_timelock.vault, "destination")?;
    }

    let transfer_action = new_action_record(
        descriptor,
        actions.len() as u32,
        action::Type::NoPrivacyTransfer,
        source_timelock.vault.to_string(),
        Some(destination_vault),
        Some(quarks),
    );
    fulfillments.push(PlannedFulfillment {
        record: new_fulfillment_record(
            descriptor,
            intent::Type::SendPayment,
            &transfer_action,
            fulfillment::Type::NoPrivacyTransferWithAuthority,
            0,
        ),
        template: Template::Transfer {
            source: source_timelock,
            destination: destination_timelock.vault,
            quarks,
        },
    });
    actions.push(transfer_action);

    Ok(Plan {
        intent: intent_record,
        actions,
        fulfillments,
        new_account_infos,
        new_swap: None,
        usd_value: Some(usd_value),
    })
}

fn plan_receive_payment(
    server: &TransactionServer,
    owner: &Account,
    descriptor: &IntentDescriptor,
    gift_card_vault: &str,
) -> Result<Plan, SubmitIntentError> {
    let info = server
        .data
        .account_infos
        .get_by_token_address(gift_card_vault)
        .map_err(|_| SubmitIntentError::Invalid("gift card not found".to_string()))?;
    if info.account_type != account_info::AccountType::RemoteSendGiftCard {
        return Err(SubmitIntentError::Invalid("gift card not found".to_string()));
    }

    let owner_timelock = primary_vault(server, owner)?;
    require_opened(server, &owner_timelock.vault, "destination")?;

    let balance = server
        .data
        .balances
        .get_cached_balance(gift_card_vault)
        .map_err(|err| SubmitIntentError::Internal(err.into()))?;

    let mut intent_record = new_intent_record(descriptor, intent::Type::ReceivePayment);
    intent_record.destination_owner = Some(owner.to_base58());
    intent_record.mint = Some(info.mint.clone());
    intent_record.quantity = Some(balance);

    let withdraw_action = new_action_record(
        descriptor,
        0,
        action::Type::NoPrivacyWithdraw,
        gift_card_vault.to_string(),
        Some(owner_timelock.vault.to_string()),
        Some(balance),
    );
    let withdraw_fulfillment = new_fulfillment_record(
        descriptor,
        intent::Type::ReceivePayment,
        &withdraw_action,
        fulfillment::Type::NoPrivacyWithdraw,
        0,
    );

    Ok(Plan {
        intent: intent_record,
        actions: vec![withdraw_action],
        fulfillments: vec![PlannedFulfillment {
            record: withdraw_fulfillment,
            template: Template::OnDemand,
        }],
        new_account_infos: vec![],
        new_swap: None,
        usd_value: None,
    })
}

fn plan_swap(
    server: &TransactionServer,
    owner: &Account,
    descriptor: &IntentDescriptor,
    swap_id: &str,
    to_mint: &str,
    quarks: u64,
) -> Result<Plan, SubmitIntentError> {
    if quarks == 0 {
        return Err(SubmitIntentError::Invalid(
            "swap quantity must be positive".to_string(),
        ));
    }
    if server.data.swaps.get(swap_id).is_ok() {
        return Err(SubmitIntentError::StaleState("swap already exists".to_string()));
    }

    let source_timelock = primary_vault(server, owner)?;
    require_opened(server, &source_timelock.vault, "source")?;

    let environment = server
        .vm_registry
        .for_mint(&server.core_mint.address)
        .map_err(|err| SubmitIntentError::Internal(err.into()))?;
    let omnibus = environment.omnibus;

    let mut intent_record = new_intent_record(descriptor, intent::Type::Swap);
    intent_record.mint = Some(server.core_mint.address.to_string());
    intent_record.quantity = Some(quarks);

    let fund_action = new_action_record(
        descriptor,
        0,
        action::Type::NoPrivacyTransfer,
        source_timelock.vault.to_string(),
        Some(omnibus.to_string()),
        Some(quarks),
    );
    let fund_fulfillment = new_fulfillment_record(
        descriptor,
        intent::Type::Swap,
        &fund_action,
        fulfillment::Type::NoPrivacyTransferWithAuthority,
        0,
    );

    let swap_record = swap::Record {
        id: 0,
        swap_id: swap_id.to_string(),
        owner: owner.to_base58(),
        source_vault: source_timelock.vault.to_string(),
        funding_intent_id: Some(descriptor.id.clone()),
        from_mint: server.core_mint.address.to_string(),
        to_mint: to_mint.to_string(),
        quantity: quarks,
        transaction_signature: None,
        transaction_blob: None,
        nonce: None,
        state: swap::State::Created,
        version: 0,
        created_at: SystemTime::now(),
        funded_at: None,
    };

    Ok(Plan {
        intent: intent_record,
        actions: vec![fund_action],
        fulfillments: vec![PlannedFulfillment {
            record: fund_fulfillment,
            template: Template::Transfer {
                source: source_timelock,
                destination: omnibus,
                quarks,
            },
        }],
        new_account_infos: vec![],
        new_swap: Some(swap_record),
        usd_value: None,
    })
}

// ============================================================================
// SUBMISSION FLOW
// ============================================================================

/// Submits a client intent through the full pipeline: authentication, guard
/// consultation, decomposition, nonce binding, transaction building, and the
/// atomic persist.
pub async fn submit_intent(
    server: &TransactionServer,
    request: &SubmitIntentRequest,
) -> Result<SubmitIntentResponse, SubmitIntentError> {
    let descriptor = &request.intent;

    let owner = Account::from_base58(&descriptor.owner)
        .map_err(|_| SubmitIntentError::Invalid("invalid owner account".to_string()))?;

    let signature = decode_signature(request.signature.as_deref());
    server
        .auth
        .authenticate(&owner, descriptor, signature.as_ref())?;

    server.guard.allow_intent_submission(&descriptor.owner)?;

    let mut plan = decompose(server, &owner, descriptor)?;

    if let Some(usd_value) = plan.usd_value {
        server.guard.allow_payment_value(&descriptor.owner, usd_value)?;
    }

    // Bind nonces and build the pre-signed transactions. A single claim
    // failure releases everything claimed so far; the whole submission is
    // transiently retryable.
    let pool = server
        .client_intent_nonce_pool()
        .map_err(SubmitIntentError::Internal)?;
    let environment = server
        .vm_registry
        .for_mint(&server.core_mint.address)
        .map_err(|err| SubmitIntentError::Internal(err.into()))?
        .clone();

    let mut bound_nonces: Vec<nonce::Record> = Vec::new();
    let release_all = |nonces: &mut Vec<nonce::Record>| {
        for nonce_record in nonces.iter_mut() {
            if let Err(err) = pool.release(nonce_record) {
                warn!(address = %nonce_record.address, error = %err, "failure releasing nonce");
            }
        }
    };

    for planned in plan.fulfillments.iter_mut() {
        if matches!(planned.template, Template::OnDemand) {
            continue;
        }

        let mut nonce_record = match pool.claim() {
            Ok(nonce_record) => nonce_record,
            Err(NoncePoolError::NoAvailableNonces) => {
                release_all(&mut bound_nonces);
                return Err(SubmitIntentError::Internal(anyhow!("nonce pool exhausted")));
            }
            Err(err) => {
                release_all(&mut bound_nonces);
                return Err(SubmitIntentError::Internal(err.into()));
            }
        };

        let built = match &planned.template {
            Template::OnDemand => continue,
            Template::Initialize { timelock } => make_initialize_timelock_account_transaction(
                server.vm_registry.program_id(),
                &environment,
                timelock,
                &nonce_record,
            ),
            Template::Transfer {
                source,
                destination,
                quarks,
            } => make_transfer_with_authority_transaction(
                server.vm_registry.program_id(),
                &environment,
                source,
                destination,
                *quarks,
                &nonce_record,
            ),
        };

        let built = match built {
            Ok(built) => built,
            Err(err) => {
                if let Err(release_err) = pool.release(&mut nonce_record) {
                    warn!(address = %nonce_record.address, error = %release_err, "failure releasing nonce");
                }
                release_all(&mut bound_nonces);
                return Err(SubmitIntentError::Internal(err.into()));
            }
        };

        nonce_record.signature = Some(built.signature.clone());

        planned.record.nonce = Some(nonce_record.address.clone());
        planned.record.blockhash = nonce_record.blockhash.clone();
        planned.record.data = Some(built.blob);
        planned.record.signature = Some(built.signature);
        planned.record.virtual_signature = built.virtual_signature;

        bound_nonces.push(nonce_record);
    }

    // Persist the graph in one transaction: intent, actions, fulfillments,
    // and the Reserved -> Claimed transition for every bound nonce.
    let mut fulfillment_records: Vec<fulfillment::Record> = plan
        .fulfillments
        .iter()
        .map(|planned| planned.record.clone())
        .collect();

    if let Err(err) = server.data.submit_intent_graph(
        &mut plan.intent,
        &mut plan.actions,
        &mut fulfillment_records,
        &mut bound_nonces,
    ) {
        release_all(&mut bound_nonces);
        return Err(err.into());
    }

    for info in plan.new_account_infos.iter_mut() {
        server.data.account_infos.put(info)?;
    }
    if let Some(mut swap_record) = plan.new_swap {
        server.data.swaps.put(&mut swap_record)?;
        swap_record.state = swap::State::Funding;
        server.data.swaps.update(&mut swap_record)?;
    }

    server.metrics.record_intent_submitted();
    info!(
        intent = %descriptor.id,
        owner = %descriptor.owner,
        fulfillments = fulfillment_records.len(),
        "intent submitted"
    );

    Ok(SubmitIntentResponse {
        result: SubmitIntentResult::Ok,
        intent_id: Some(descriptor.id.clone()),
        server_signatures: fulfillment_records
            .iter()
            .filter_map(|record| record.signature.clone())
            .collect(),
        reason: None,
    })
}

pub async fn submit_intent_handler(
    request: SubmitIntentRequest,
    server: Arc<TransactionServer>,
) -> Result<impl warp::Reply, warp::Rejection> {
    let (status, response) = match submit_intent(&server, &request).await {
        Ok(response) => (StatusCode::OK, ApiResponse::ok(response)),
        Err(SubmitIntentError::Invalid(reason)) => (
            StatusCode::OK,
            ApiResponse::ok(SubmitIntentResponse {
                result: SubmitIntentResult::Invalid,
                intent_id: None,
                server_signatures: vec![],
                reason: Some(reason),
            }),
        ),
        Err(SubmitIntentError::Denied(reason)) => {
            server.metrics.record_intent_denied();
            (
                StatusCode::OK,
                ApiResponse::ok(SubmitIntentResponse {
                    result: SubmitIntentResult::Denied,
                    intent_id: None,
                    server_signatures: vec![],
                    reason: Some(reason),
                }),
            )
        }
        Err(SubmitIntentError::StaleState(reason)) => (
            StatusCode::OK,
            ApiResponse::ok(SubmitIntentResponse {
                result: SubmitIntentResult::StaleState,
                intent_id: None,
                server_signatures: vec![],
                reason: Some(reason),
            }),
        ),
        Err(SubmitIntentError::Unauthenticated) => {
            (StatusCode::UNAUTHORIZED, ApiResponse::err("unauthenticated"))
        }
        Err(SubmitIntentError::Internal(err)) => {
            warn!(error = format!("{err:#}"), "intent submission failed internally");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiResponse::err("internal error"),
            )
        }
    };

    Ok(warp::reply::with_status(warp::reply::json(&response), status))
}
