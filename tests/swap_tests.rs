//! Swap lifecycle tests, in particular the abandonment path.

mod helpers;

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::system_instruction;
use solana_sdk::transaction::Transaction;

use orchestrator::auth::sign_canonical;
use orchestrator::common::Account;
use orchestrator::data::nonce::{Environment, Purpose, INSTANCE_SOLANA_MAINNET};
use orchestrator::data::{intent, swap};
use orchestrator::rpc::submit_intent::{submit_intent, IntentDetails};
use orchestrator::rpc::swap::{
    submit_swap_handler, SubmitSwapMessage, SubmitSwapRequest, SubmitSwapResponse,
    SubmitSwapResult,
};
use orchestrator::rpc::ApiResponse;
use orchestrator::transaction::LocalNoncePool;
use orchestrator::worker::swap::SwapRuntime;

use helpers::{setup, signed_submit_request, TestEnv};

fn swap_runtime(env: &TestEnv) -> SwapRuntime {
    let pool = Arc::new(LocalNoncePool::new(
        env.data.clone(),
        Environment::Solana,
        INSTANCE_SOLANA_MAINNET.to_string(),
        Purpose::ClientSwap,
    ));
    SwapRuntime::new(
        env.data.clone(),
        env.chain.clone(),
        env.vm_registry.clone(),
        pool,
        env.config.swap.clone(),
        env.config.worker.batch_size,
        env.metrics.clone(),
    )
    .unwrap()
}

async fn submit_swap(env: &TestEnv, owner: &Account, swap_id: &str) -> swap::Record {
    let request = signed_submit_request(
        owner,
        &format!("fund-{swap_id}"),
        IntentDetails::Swap {
            swap_id: swap_id.to_string(),
            to_mint: "other-mint".to_string(),
            quarks: 3_000_000,
        },
    );
    submit_intent(&env.server, &request).await.unwrap();
    env.data.swaps.get(swap_id).unwrap()
}

/// Drives the funding intent to confirmation and the swap to Funded.
async fn drive_swap_to_funded(env: &TestEnv, runtime: &SwapRuntime, swap_id: &str) {
    env.process_unknown_fulfillments().await;
    let fulfillment = &env
        .data
        .fulfillments
        .get_all_by_action(&format!("fund-{swap_id}"), 0)
        .unwrap()[0];
    env.chain
        .finalize_success(fulfillment.signature.as_deref().unwrap());
    env.process_pending_fulfillments().await;

    let mut record = env.data.swaps.get(swap_id).unwrap();
    runtime.handle_swap(&mut record).await.unwrap();
    assert_eq!(record.state, swap::State::Funded);
}

/// A transaction signed by the owner, in the base64 wire form clients send.
fn client_signed_transaction(owner: &Account) -> String {
    let instruction = system_instruction::transfer(owner.public_key(), &Pubkey::new_unique(), 1);
    let transaction = Transaction::new_signed_with_payer(
        &[instruction],
        Some(owner.public_key()),
        &[owner.keypair().unwrap()],
        Hash::new_from_array([8u8; 32]),
    );
    STANDARD.encode(bincode::serialize(&transaction).unwrap())
}

fn signed_swap_submit_request(
    owner: &Account,
    swap_id: &str,
    transaction: String,
) -> SubmitSwapRequest {
    let message = SubmitSwapMessage {
        owner: owner.to_base58(),
        swap_id: swap_id.to_string(),
        transaction,
    };
    let signature = sign_canonical(owner, &message).unwrap();
    SubmitSwapRequest {
        message,
        signature: Some(bs58::encode(signature).into_string()),
    }
}

async fn submit_swap_via_handler(env: &TestEnv, request: SubmitSwapRequest) -> SubmitSwapResponse {
    use warp::Reply;

    let reply = submit_swap_handler(request, env.server.clone()).await.unwrap();
    let response = reply.into_response();
    let body = warp::hyper::body::to_bytes(response.into_body())
        .await
        .unwrap();
    let envelope: ApiResponse<SubmitSwapResponse> = serde_json::from_slice(&body).unwrap();
    envelope.data.unwrap()
}

#[tokio::test]
async fn swap_submission_creates_funding_record() {
    let env = setup();
    env.seed_rates();
    env.seed_client_intent_nonces(4);

    let owner = Account::generate();
    env.register_opened_account(&owner);
    env.set_cached_balance(&env.vault_of(&owner), 10_000_000);

    let record = submit_swap(&env, &owner, "swap-1").await;
    assert_eq!(record.state, swap::State::Funding);
    assert_eq!(record.funding_intent_id.as_deref(), Some("fund-swap-1"));
    assert_eq!(record.quantity, 3_000_000);
}

#[tokio::test]
async fn swap_becomes_funded_when_funding_intent_confirms() {
    let env = setup();
    env.seed_rates();
    env.seed_client_intent_nonces(4);

    let owner = Account::generate();
    env.register_opened_account(&owner);
    env.set_cached_balance(&env.vault_of(&owner), 10_000_000);

    let mut record = submit_swap(&env, &owner, "swap-1").await;
    let runtime = swap_runtime(&env);

    // Funding intent still pending: no transition.
    runtime.handle_swap(&mut record).await.unwrap();
    assert_eq!(record.state, swap::State::Funding);

    // Drive the funding transfer to confirmation.
    env.process_unknown_fulfillments().await;
    let fulfillment = &env
        .data
        .fulfillments
        .get_all_by_action("fund-swap-1", 0)
        .unwrap()[0];
    env.chain
        .finalize_success(fulfillment.signature.as_deref().unwrap());
    env.process_pending_fulfillments().await;
    assert_eq!(
        env.data.intents.get("fund-swap-1").unwrap().state,
        intent::State::Confirmed
    );

    let mut record = env.data.swaps.get("swap-1").unwrap();
    runtime.handle_swap(&mut record).await.unwrap();
    assert_eq!(record.state, swap::State::Funded);
    assert!(record.funded_at.is_some());
}

#[tokio::test]
async fn unfunded_swap_is_cancelled_after_timeout() {
    let env = setup();
    env.seed_rates();
    env.seed_client_intent_nonces(4);

    let owner = Account::generate();
    env.register_opened_account(&owner);
    env.set_cached_balance(&env.vault_of(&owner), 10_000_000);

    // A swap created long ago whose funding intent never arrived.
    let mut record = swap::Record {
        id: 0,
        swap_id: "swap-1".to_string(),
        owner: owner.to_base58(),
        source_vault: env.vault_of(&owner),
        funding_intent_id: None,
        from_mint: env.core_mint.address.to_string(),
        to_mint: "other-mint".to_string(),
        quantity: 3_000_000,
        transaction_signature: None,
        transaction_blob: None,
        nonce: None,
        state: swap::State::Created,
        version: 0,
        created_at: SystemTime::now()
            - Duration::from_secs(env.config.swap.client_timeout_to_fund_secs + 10),
        funded_at: None,
    };
    env.data.swaps.put(&mut record).unwrap();

    let runtime = swap_runtime(&env);
    runtime.handle_swap(&mut record).await.unwrap();
    assert_eq!(env.data.swaps.get("swap-1").unwrap().state, swap::State::Cancelled);
}

#[tokio::test]
async fn abandoned_funded_swap_is_cancelled_and_funds_restored() {
    let env = setup();
    env.seed_rates();
    env.seed_client_intent_nonces(4);
    env.seed_swap_nonces(4);

    let owner = Account::generate();
    env.register_opened_account(&owner);
    let vault = env.vault_of(&owner);
    env.set_cached_balance(&vault, 10_000_000);

    let mut record = submit_swap(&env, &owner, "swap-1").await;

    // Mark funded long ago; the transfer drained the vault by the swap
    // amount.
    record.state = swap::State::Funded;
    record.funded_at = Some(
        SystemTime::now() - Duration::from_secs(env.config.swap.client_timeout_to_swap_secs + 10),
    );
    env.data.swaps.update(&mut record).unwrap();
    env.set_cached_balance(&vault, 7_000_000);

    let runtime = swap_runtime(&env);

    // Timeout trips: a cancellation transaction is built and the swap moves
    // to Cancelling.
    runtime.handle_swap(&mut record).await.unwrap();
    assert_eq!(record.state, swap::State::Cancelling);
    assert!(record.transaction_signature.is_some());
    assert!(record.transaction_blob.is_some());
    assert!(record.nonce.is_some());

    // Not yet finalized: the worker keeps submitting.
    runtime.handle_swap(&mut record).await.unwrap();
    assert_eq!(record.state, swap::State::Cancelling);
    assert!(env.chain.submitted_count() >= 1);

    // Finalize the cancellation; balances are restored to the source vault
    // and the swap terminates.
    env.chain
        .finalize_success(record.transaction_signature.as_deref().unwrap());
    runtime.handle_swap(&mut record).await.unwrap();
    assert_eq!(record.state, swap::State::Cancelled);
    assert_eq!(
        env.data.balances.get_cached_balance(&vault).unwrap(),
        10_000_000
    );
}

#[tokio::test]
async fn submitted_swap_reaches_finalized() {
    let env = setup();
    env.seed_rates();
    env.seed_client_intent_nonces(4);

    let owner = Account::generate();
    env.register_opened_account(&owner);
    env.set_cached_balance(&env.vault_of(&owner), 10_000_000);

    submit_swap(&env, &owner, "swap-1").await;
    let runtime = swap_runtime(&env);
    drive_swap_to_funded(&env, &runtime, "swap-1").await;

    // The client comes back with the signed swap transaction.
    let request = signed_swap_submit_request(&owner, "swap-1", client_signed_transaction(&owner));
    let response = submit_swap_via_handler(&env, request).await;
    assert_eq!(response.result, SubmitSwapResult::Ok);
    assert!(response.signature.is_some());

    let mut record = env.data.swaps.get("swap-1").unwrap();
    assert_eq!(record.state, swap::State::Submitting);
    assert_eq!(record.transaction_signature, response.signature);
    assert!(record.transaction_blob.is_some());

    // Not yet finalized: the worker keeps submitting the blob.
    let submitted_before = env.chain.submitted_count();
    runtime.handle_swap(&mut record).await.unwrap();
    assert_eq!(record.state, swap::State::Submitting);
    assert!(env.chain.submitted_count() > submitted_before);

    // Finalize the swap transaction; the lifecycle completes.
    env.chain
        .finalize_success(record.transaction_signature.as_deref().unwrap());
    runtime.handle_swap(&mut record).await.unwrap();
    assert_eq!(record.state, swap::State::Finalized);
    assert_eq!(
        env.data.swaps.get("swap-1").unwrap().state,
        swap::State::Finalized
    );
}

#[tokio::test]
async fn failed_swap_transaction_marks_the_swap_failed() {
    let env = setup();
    env.seed_rates();
    env.seed_client_intent_nonces(4);

    let owner = Account::generate();
    env.register_opened_account(&owner);
    env.set_cached_balance(&env.vault_of(&owner), 10_000_000);

    submit_swap(&env, &owner, "swap-1").await;
    let runtime = swap_runtime(&env);
    drive_swap_to_funded(&env, &runtime, "swap-1").await;

    let request = signed_swap_submit_request(&owner, "swap-1", client_signed_transaction(&owner));
    let response = submit_swap_via_handler(&env, request).await;
    assert_eq!(response.result, SubmitSwapResult::Ok);

    let mut record = env.data.swaps.get("swap-1").unwrap();
    env.chain.finalize_failure(
        record.transaction_signature.as_deref().unwrap(),
        "slippage exceeded",
    );
    runtime.handle_swap(&mut record).await.unwrap();
    assert_eq!(record.state, swap::State::Failed);
}

#[tokio::test]
async fn swap_submission_requires_a_funded_swap() {
    let env = setup();
    env.seed_rates();
    env.seed_client_intent_nonces(4);

    let owner = Account::generate();
    env.register_opened_account(&owner);
    env.set_cached_balance(&env.vault_of(&owner), 10_000_000);

    // Still Funding: the funding intent hasn't confirmed.
    submit_swap(&env, &owner, "swap-1").await;
    let request = signed_swap_submit_request(&owner, "swap-1", client_signed_transaction(&owner));
    let response = submit_swap_via_handler(&env, request).await;
    assert_eq!(response.result, SubmitSwapResult::StaleState);

    let record = env.data.swaps.get("swap-1").unwrap();
    assert_eq!(record.state, swap::State::Funding);
    assert!(record.transaction_blob.is_none());
}

#[tokio::test]
async fn swap_submission_rejects_other_owners_and_unknown_swaps() {
    let env = setup();
    env.seed_rates();
    env.seed_client_intent_nonces(4);

    let owner = Account::generate();
    env.register_opened_account(&owner);
    env.set_cached_balance(&env.vault_of(&owner), 10_000_000);

    submit_swap(&env, &owner, "swap-1").await;
    let runtime = swap_runtime(&env);
    drive_swap_to_funded(&env, &runtime, "swap-1").await;

    // Someone else, correctly signed as themselves, cannot submit.
    let interloper = Account::generate();
    let request =
        signed_swap_submit_request(&interloper, "swap-1", client_signed_transaction(&interloper));
    let response = submit_swap_via_handler(&env, request).await;
    assert_eq!(response.result, SubmitSwapResult::Denied);

    // Unknown swap id.
    let request = signed_swap_submit_request(&owner, "swap-2", client_signed_transaction(&owner));
    let response = submit_swap_via_handler(&env, request).await;
    assert_eq!(response.result, SubmitSwapResult::NotFound);

    // Malformed transaction payload.
    let request = signed_swap_submit_request(&owner, "swap-1", "not-base64!".to_string());
    let response = submit_swap_via_handler(&env, request).await;
    assert_eq!(response.result, SubmitSwapResult::Invalid);

    // The swap is still waiting for its real transaction.
    assert_eq!(
        env.data.swaps.get("swap-1").unwrap().state,
        swap::State::Funded
    );
}
