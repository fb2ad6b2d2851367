//! Transaction construction.
//!
//! Every fulfillment type maps to one transaction template. A template is a
//! durable-nonce transaction: the nonce's current value stands in for a
//! recent blockhash, giving the signed blob an indefinite lifetime, and the
//! subsidizer signs as fee payer and nonce authority.

pub mod nonce_pool;
pub mod vm_instruction;

use sha2::{Digest, Sha256};
use solana_sdk::hash::Hash;
use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::system_instruction;
use solana_sdk::transaction::Transaction;
use thiserror::Error;

use crate::common::{Account, TimelockAccounts, VmEnvironment};
use crate::data::nonce;

use vm_instruction::VmInstruction;

pub use nonce_pool::{LocalNoncePool, NoncePoolError};

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("nonce record is missing its durable value")]
    MissingNonceValue,
    #[error("malformed nonce value")]
    MalformedNonceValue,
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("instruction encoding failed: {0}")]
    Encoding(String),
}

/// A built transaction plus the identifiers the pipeline persists.
#[derive(Debug, Clone)]
pub struct BuiltTransaction {
    pub transaction: Transaction,
    pub blob: Vec<u8>,
    pub signature: String,
    /// Set for fulfillments executed inside the virtual machine.
    pub virtual_signature: Option<String>,
}

fn nonce_value_as_hash(record: &nonce::Record) -> Result<Hash, TransactionError> {
    let value = record
        .blockhash
        .as_deref()
        .ok_or(TransactionError::MissingNonceValue)?;
    let bytes = bs58::decode(value)
        .into_vec()
        .map_err(|_| TransactionError::MalformedNonceValue)?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| TransactionError::MalformedNonceValue)?;
    Ok(Hash::new_from_array(bytes))
}

/// Derives the virtual signature identifying a fulfillment inside a
/// compressed virtual-machine transaction.
pub fn derive_virtual_signature(vm: &Pubkey, message: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"virtual_signature");
    hasher.update(vm.as_ref());
    hasher.update(message);
    bs58::encode(hasher.finalize()).into_string()
}

fn build(
    instructions: Vec<Instruction>,
    subsidizer: &Account,
    nonce_record: &nonce::Record,
    virtual_machine: Option<&Pubkey>,
) -> Result<BuiltTransaction, TransactionError> {
    let nonce_value = nonce_value_as_hash(nonce_record)?;

    // On Solana the nonce must be advanced in the same transaction; virtual
    // durable nonces are advanced by the VM itself.
    let mut all_instructions = Vec::with_capacity(instructions.len() + 1);
    if nonce_record.environment == nonce::Environment::Solana {
        let nonce_address = nonce_record
            .address
            .parse::<Pubkey>()
            .map_err(|_| TransactionError::MalformedNonceValue)?;
        all_instructions.push(system_instruction::advance_nonce_account(
            &nonce_address,
            subsidizer.public_key(),
        ));
    }
    all_instructions.extend(instructions);

    let keypair = subsidizer
        .keypair()
        .map_err(|err| TransactionError::Signing(err.to_string()))?;
    let transaction = Transaction::new_signed_with_payer(
        &all_instructions,
        Some(subsidizer.public_key()),
        &[keypair],
        nonce_value,
    );

    let blob = bincode::serialize(&transaction)
        .map_err(|err| TransactionError::Encoding(err.to_string()))?;
    let signature = transaction.signatures[0].to_string();
    let virtual_signature = virtual_machine
        .map(|vm| derive_virtual_signature(vm, &transaction.message_data()));

    Ok(BuiltTransaction {
        transaction,
        blob,
        signature,
        virtual_signature,
    })
}

/// Initializes a locked timelock account for an owner.
pub fn make_initialize_timelock_account_transaction(
    vm_program_id: &Pubkey,
    environment: &VmEnvironment,
    timelock: &TimelockAccounts,
    nonce_record: &nonce::Record,
) -> Result<BuiltTransaction, TransactionError> {
    let instruction = VmInstruction::InitializeTimelockAccount {
        owner: timelock.owner.to_bytes(),
        state_bump: timelock.state_bump,
        vault_bump: timelock.vault_bump,
    }
    .into_instruction(vm_program_id, environment, timelock, None)
    .map_err(|err| TransactionError::Encoding(err.to_string()))?;

    build(
        vec![instruction],
        &environment.authority,
        nonce_record,
        Some(&environment.vm),
    )
}

/// Transfers quarks between timelock vaults with the VM authority.
pub fn make_transfer_with_authority_transaction(
    vm_program_id: &Pubkey,
    environment: &VmEnvironment,
    source: &TimelockAccounts,
    destination: &Pubkey,
    quarks: u64,
    nonce_record: &nonce::Record,
) -> Result<BuiltTransaction, TransactionError> {
    let instruction = VmInstruction::TransferWithAuthority { amount: quarks }
        .into_instruction(vm_program_id, environment, source, Some(destination))
        .map_err(|err| TransactionError::Encoding(err.to_string()))?;

    build(
        vec![instruction],
        &environment.authority,
        nonce_record,
        Some(&environment.vm),
    )
}

/// Withdraws the full balance of a vault to a destination and leaves the
/// source empty.
pub fn make_withdraw_transaction(
    vm_program_id: &Pubkey,
    environment: &VmEnvironment,
    source: &TimelockAccounts,
    destination: &Pubkey,
    nonce_record: &nonce::Record,
) -> Result<BuiltTransaction, TransactionError> {
    let instruction = VmInstruction::Withdraw
        .into_instruction(vm_program_id, environment, source, Some(destination))
        .map_err(|err| TransactionError::Encoding(err.to_string()))?;

    build(
        vec![instruction],
        &environment.authority,
        nonce_record,
        Some(&environment.vm),
    )
}

/// Closes an empty timelock account, reclaiming rent to the subsidizer.
pub fn make_close_empty_account_transaction(
    vm_program_id: &Pubkey,
    environment: &VmEnvironment,
    timelock: &TimelockAccounts,
    nonce_record: &nonce::Record,
) -> Result<BuiltTransaction, TransactionError> {
    let instruction = VmInstruction::CloseEmptyAccount
        .into_instruction(vm_program_id, environment, timelock, None)
        .map_err(|err| TransactionError::Encoding(err.to_string()))?;

    build(
        vec![instruction],
        &environment.authority,
        nonce_record,
        None,
    )
}

/// Returns swap funds from the omnibus back to the source vault after a
/// client abandoned the swap.
pub fn make_swap_cancellation_transaction(
    vm_program_id: &Pubkey,
    environment: &VmEnvironment,
    source_vault: &Pubkey,
    quarks: u64,
    nonce_record: &nonce::Record,
) -> Result<BuiltTransaction, TransactionError> {
    let instruction = VmInstruction::OmnibusRelease { amount: quarks }
        .into_release_instruction(vm_program_id, environment, source_vault)
        .map_err(|err| TransactionError::Encoding(err.to_string()))?;

    build(
        vec![instruction],
        &environment.authority,
        nonce_record,
        None,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::nonce::{Environment, Purpose, State};
    use std::time::SystemTime;

    fn test_environment() -> (Pubkey, VmEnvironment) {
        let program_id = Pubkey::new_unique();
        let environment = VmEnvironment {
            authority: Account::generate(),
            vm: Pubkey::new_unique(),
            omnibus: Pubkey::new_unique(),
            mint: Pubkey::new_unique(),
        };
        (program_id, environment)
    }

    fn test_nonce(environment: Environment) -> nonce::Record {
        nonce::Record {
            id: 1,
            address: Pubkey::new_unique().to_string(),
            authority: "authority".to_string(),
            environment,
            instance: "instance".to_string(),
            purpose: Purpose::ClientIntent,
            state: State::Reserved,
            blockhash: Some(bs58::encode([7u8; 32]).into_string()),
            signature: None,
            version: 1,
            created_at: SystemTime::now(),
        }
    }

    #[test]
    fn solana_nonce_transactions_advance_the_nonce() {
        let (program_id, environment) = test_environment();
        let owner = Account::generate();
        let timelock = environment.timelock_accounts_for(&program_id, &owner);

        let built = make_close_empty_account_transaction(
            &program_id,
            &environment,
            &timelock,
            &test_nonce(Environment::Solana),
        )
        .unwrap();

        // advance_nonce_account plus the close instruction
        assert_eq!(built.transaction.message.instructions.len(), 2);
        assert!(built.virtual_signature.is_none());
    }

    #[test]
    fn virtual_transactions_carry_a_virtual_signature() {
        let (program_id, environment) = test_environment();
        let owner = Account::generate();
        let timelock = environment.timelock_accounts_for(&program_id, &owner);

        let built = make_initialize_timelock_account_transaction(
            &program_id,
            &environment,
            &timelock,
            &test_nonce(Environment::Cvm),
        )
        .unwrap();

        assert_eq!(built.transaction.message.instructions.len(), 1);
        assert!(built.virtual_signature.is_some());
    }

    #[test]
    fn building_is_deterministic_for_the_same_nonce() {
        let (program_id, environment) = test_environment();
        let owner = Account::generate();
        let timelock = environment.timelock_accounts_for(&program_id, &owner);
        let nonce_record = test_nonce(Environment::Cvm);

        let a = make_initialize_timelock_account_transaction(
            &program_id,
            &environment,
            &timelock,
            &nonce_record,
        )
        .unwrap();
        let b = make_initialize_timelock_account_transaction(
            &program_id,
            &environment,
            &timelock,
            &nonce_record,
        )
        .unwrap();

        assert_eq!(a.signature, b.signature);
        assert_eq!(a.virtual_signature, b.virtual_signature);
    }

    #[test]
    fn missing_nonce_value_is_an_error() {
        let (program_id, environment) = test_environment();
        let owner = Account::generate();
        let timelock = environment.timelock_accounts_for(&program_id, &owner);
        let mut nonce_record = test_nonce(Environment::Cvm);
        nonce_record.blockhash = None;

        assert!(matches!(
            make_initialize_timelock_account_transaction(
                &program_id,
                &environment,
                &timelock,
                &nonce_record,
            ),
            Err(TransactionError::MissingNonceValue)
        ));
    }
}
