//! End-to-end pipeline tests: submission through sequencer sweeps to
//! terminal intent states, with upward cascade.

mod helpers;

use orchestrator::common::Account;
use orchestrator::data::nonce::State as NonceState;
use orchestrator::data::{action, fulfillment, intent};
use orchestrator::rpc::submit_intent::{submit_intent, IntentDetails};

use helpers::{setup, signed_submit_request};

#[tokio::test]
async fn happy_open_account_reaches_confirmed() {
    let env = setup();
    env.seed_rates();
    env.seed_client_intent_nonces(4);

    let owner = Account::generate();
    let request = signed_submit_request(&owner, "intent-1", IntentDetails::OpenAccount);
    submit_intent(&env.server, &request).await.unwrap();

    // First sweep: the Unknown fulfillment is schedulable and submitted.
    env.process_unknown_fulfillments().await;
    assert_eq!(env.chain.submitted_count(), 1);

    let record = &env.data.fulfillments.get_all_by_action("intent-1", 0).unwrap()[0];
    assert_eq!(record.state, fulfillment::State::Pending);

    // Second sweep before finalization: nothing changes.
    env.process_pending_fulfillments().await;
    let record = &env.data.fulfillments.get_all_by_action("intent-1", 0).unwrap()[0];
    assert_eq!(record.state, fulfillment::State::Pending);

    // Finalize on chain, then sweep again: the cascade promotes everything.
    env.chain.finalize_success(record.signature.as_deref().unwrap());
    env.process_pending_fulfillments().await;

    let record = &env.data.fulfillments.get_all_by_action("intent-1", 0).unwrap()[0];
    assert_eq!(record.state, fulfillment::State::Confirmed);

    let action_record = env.data.actions.get_by_id("intent-1", 0).unwrap();
    assert_eq!(action_record.state, action::State::Confirmed);

    let intent_record = env.data.intents.get("intent-1").unwrap();
    assert_eq!(intent_record.state, intent::State::Confirmed);

    // The consumed nonce was released for recycling.
    let nonce_record = env
        .data
        .nonces
        .get(record.nonce.as_deref().unwrap())
        .unwrap();
    assert_eq!(nonce_record.state, NonceState::Released);
}

#[tokio::test]
async fn failed_transaction_cascades_to_failed_intent() {
    let env = setup();
    env.seed_rates();
    env.seed_client_intent_nonces(4);

    let owner = Account::generate();
    let request = signed_submit_request(&owner, "intent-1", IntentDetails::OpenAccount);
    submit_intent(&env.server, &request).await.unwrap();

    env.process_unknown_fulfillments().await;
    let record = &env.data.fulfillments.get_all_by_action("intent-1", 0).unwrap()[0];
    env.chain
        .finalize_failure(record.signature.as_deref().unwrap(), "custom program error");
    env.process_pending_fulfillments().await;

    let record = &env.data.fulfillments.get_all_by_action("intent-1", 0).unwrap()[0];
    assert_eq!(record.state, fulfillment::State::Failed);
    assert_eq!(
        env.data.actions.get_by_id("intent-1", 0).unwrap().state,
        action::State::Failed
    );
    assert_eq!(
        env.data.intents.get("intent-1").unwrap().state,
        intent::State::Failed
    );
}

#[tokio::test]
async fn consumed_nonce_revokes_unlanded_fulfillment() {
    let env = setup();
    env.seed_rates();
    env.seed_client_intent_nonces(4);

    let owner = Account::generate();
    let request = signed_submit_request(&owner, "intent-1", IntentDetails::OpenAccount);
    submit_intent(&env.server, &request).await.unwrap();

    env.process_unknown_fulfillments().await;
    let record = &env.data.fulfillments.get_all_by_action("intent-1", 0).unwrap()[0];

    // The nonce's durable value advances without our transaction landing:
    // another transaction consumed it.
    let mut nonce_record = env
        .data
        .nonces
        .get(record.nonce.as_deref().unwrap())
        .unwrap();
    nonce_record.state = NonceState::Released;
    env.data.nonces.update(&mut nonce_record).unwrap();
    nonce_record.state = NonceState::Available;
    nonce_record.blockhash = Some(bs58::encode(helpers::rand_value()).into_string());
    env.data.nonces.update(&mut nonce_record).unwrap();

    env.process_pending_fulfillments().await;

    let record = &env.data.fulfillments.get_all_by_action("intent-1", 0).unwrap()[0];
    assert_eq!(record.state, fulfillment::State::Revoked);
}

#[tokio::test]
async fn gift_card_claim_builds_transaction_on_demand() {
    let env = setup();
    env.seed_rates();
    env.seed_client_intent_nonces(8);
    env.seed_on_demand_nonces(4);

    // Issue a gift card.
    let sender = Account::generate();
    let gift_card_owner = Account::generate();
    env.register_opened_account(&sender);
    env.set_cached_balance(&env.vault_of(&sender), 10_000_000);
    let request = signed_submit_request(
        &sender,
        "gift-1",
        IntentDetails::SendPayment {
            destination_owner: gift_card_owner.to_base58(),
            quarks: 1_000_000,
            is_remote_send: true,
        },
    );
    submit_intent(&env.server, &request).await.unwrap();

    // Drive the issuance to confirmation.
    env.process_unknown_fulfillments().await;
    for record in env.data.fulfillments.get_all_by_action("gift-1", 0).unwrap() {
        env.chain.finalize_success(record.signature.as_deref().unwrap());
    }
    env.process_pending_fulfillments().await;
    env.process_unknown_fulfillments().await;
    for record in env.data.fulfillments.get_all_by_action("gift-1", 1).unwrap() {
        env.chain.finalize_success(record.signature.as_deref().unwrap());
    }
    env.process_pending_fulfillments().await;
    assert_eq!(
        env.data.intents.get("gift-1").unwrap().state,
        intent::State::Confirmed
    );

    // Claim it.
    let claimer = Account::generate();
    env.register_opened_account(&claimer);
    let gift_vault = env.vault_of(&gift_card_owner);
    let request = signed_submit_request(
        &claimer,
        "claim-1",
        IntentDetails::ReceivePayment {
            gift_card_vault: gift_vault.clone(),
        },
    );
    submit_intent(&env.server, &request).await.unwrap();

    // The claim fulfillment starts with no transaction; the sweep builds
    // one against a fresh on-demand nonce.
    let record = &env.data.fulfillments.get_all_by_action("claim-1", 0).unwrap()[0];
    assert_eq!(record.fulfillment_type, fulfillment::Type::NoPrivacyWithdraw);
    assert!(record.data.is_none());
    assert!(record.nonce.is_none());

    env.process_unknown_fulfillments().await;

    let record = &env.data.fulfillments.get_all_by_action("claim-1", 0).unwrap()[0];
    assert_eq!(record.state, fulfillment::State::Pending);
    assert!(record.data.is_some());
    assert!(record.signature.is_some());
    let nonce_record = env
        .data
        .nonces
        .get(record.nonce.as_deref().unwrap())
        .unwrap();
    assert_eq!(nonce_record.state, NonceState::Claimed);

    env.chain.finalize_success(record.signature.as_deref().unwrap());
    env.process_pending_fulfillments().await;
    assert_eq!(
        env.data.intents.get("claim-1").unwrap().state,
        intent::State::Confirmed
    );

    // The claim drained the gift card into the claimer's vault.
    assert_eq!(
        env.data.balances.get_cached_balance(&gift_vault).unwrap(),
        0
    );
    assert_eq!(
        env.data
            .balances
            .get_cached_balance(&env.vault_of(&claimer))
            .unwrap(),
        1_000_000
    );
}

#[tokio::test]
async fn repeated_sweeps_are_idempotent() {
    let env = setup();
    env.seed_rates();
    env.seed_client_intent_nonces(4);

    let owner = Account::generate();
    let request = signed_submit_request(&owner, "intent-1", IntentDetails::OpenAccount);
    submit_intent(&env.server, &request).await.unwrap();

    env.process_unknown_fulfillments().await;
    let record = &env.data.fulfillments.get_all_by_action("intent-1", 0).unwrap()[0];
    env.chain.finalize_success(record.signature.as_deref().unwrap());

    env.process_pending_fulfillments().await;
    env.process_pending_fulfillments().await;
    env.process_unknown_fulfillments().await;

    assert_eq!(
        env.data.intents.get("intent-1").unwrap().state,
        intent::State::Confirmed
    );
    // Only the one original submission hit the chain.
    assert_eq!(env.chain.submitted_count(), 1);
}
