//! Virtual machine program instructions.
//!
//! Borsh-encoded instruction payloads for the VM program that custodies
//! timelock accounts. The account ordering contract is fixed per variant and
//! mirrored by the on-chain program.

use borsh::{BorshDeserialize, BorshSerialize};
use solana_sdk::instruction::{AccountMeta, Instruction};
use solana_sdk::pubkey::Pubkey;

use crate::common::{TimelockAccounts, VmEnvironment};

#[derive(Debug, Clone, BorshSerialize, BorshDeserialize)]
pub enum VmInstruction {
    /// Creates the timelock state and vault accounts for an owner.
    InitializeTimelockAccount {
        owner: [u8; 32],
        state_bump: u8,
        vault_bump: u8,
    },
    /// Moves quarks from a timelock vault under the VM authority.
    TransferWithAuthority { amount: u64 },
    /// Drains a vault completely to a destination.
    Withdraw,
    /// Closes an empty timelock account and reclaims rent.
    CloseEmptyAccount,
    /// Releases omnibus-held funds back to a vault.
    OmnibusRelease { amount: u64 },
}

impl VmInstruction {
    /// Builds the instruction for variants operating on a timelock account.
    ///
    /// Accounts: authority (signer), vm, timelock state, vault, then the
    /// destination for moving variants.
    pub fn into_instruction(
        self,
        program_id: &Pubkey,
        environment: &VmEnvironment,
        timelock: &TimelockAccounts,
        destination: Option<&Pubkey>,
    ) -> std::io::Result<Instruction> {
        let data = borsh::to_vec(&self)?;

        let mut accounts = vec![
            AccountMeta::new(*environment.authority.public_key(), true),
            AccountMeta::new_readonly(environment.vm, false),
            AccountMeta::new(timelock.state, false),
            AccountMeta::new(timelock.vault, false),
        ];
        if let Some(destination) = destination {
            accounts.push(AccountMeta::new(*destination, false));
        }

        Ok(Instruction {
            program_id: *program_id,
            accounts,
            data,
        })
    }

    /// Builds the omnibus-release instruction.
    ///
    /// Accounts: authority (signer), vm, omnibus, receiving vault.
    pub fn into_release_instruction(
        self,
        program_id: &Pubkey,
        environment: &VmEnvironment,
        destination_vault: &Pubkey,
    ) -> std::io::Result<Instruction> {
        let data = borsh::to_vec(&self)?;

        Ok(Instruction {
            program_id: *program_id,
            accounts: vec![
                AccountMeta::new(*environment.authority.public_key(), true),
                AccountMeta::new_readonly(environment.vm, false),
                AccountMeta::new(environment.omnibus, false),
                AccountMeta::new(*destination_vault, false),
            ],
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trip() {
        let instruction = VmInstruction::TransferWithAuthority { amount: 123 };
        let bytes = borsh::to_vec(&instruction).unwrap();
        let decoded = VmInstruction::try_from_slice(&bytes).unwrap();
        match decoded {
            VmInstruction::TransferWithAuthority { amount } => assert_eq!(amount, 123),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
