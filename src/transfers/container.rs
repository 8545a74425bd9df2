//! Per-account transfer container.
//!
//! Owned outputs move through a fixed lifecycle as the chain advances:
//! unconfirmed → soft-locked (in chain, younger than the unlock window) →
//! locked (deposits, until `creating_height + term`) → unlocked → spent.
//! A reorg detaches everything at or above the detach height back to
//! unconfirmed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::constants;
use crate::crypto::{KeyImage, PublicKey};
use crate::transfers::{UNCONFIRMED_GLOBAL_INDEX, UNCONFIRMED_HEIGHT};
use crate::Hash;

/// Lifecycle state of one owned output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    Unconfirmed,
    SoftLocked,
    Locked,
    Unlocked,
    Spent,
}

/// Deposit lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DepositState {
    Locked,
    Unlocked,
    Spent,
}

/// An owned output and where it came from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferOutput {
    pub amount: u64,
    pub global_output_index: u32,
    pub output_in_transaction: u32,
    pub tx_hash: Hash,
    pub tx_public_key: PublicKey,
    pub block_height: u64,
    pub unlock_time: u64,
    /// One-time key of a key output.
    pub key: Option<PublicKey>,
    /// Key image we can derive for a key output (spend detection).
    pub key_image: Option<KeyImage>,
    /// Deposit term of a multisignature output; zero for key outputs.
    pub term: u32,
    pub required_signatures: u32,
    pub state: TransferState,
}

/// A tracked deposit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Deposit {
    pub amount: u64,
    pub term: u32,
    pub creating_tx: Hash,
    pub output_in_transaction: u32,
    pub creating_height: u64,
    pub interest: u64,
    pub unlock_height: u64,
    pub state: DepositState,
}

/// Balance summary across all buckets. Investments are deposits with
/// quarterly terms.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceSummary {
    pub available: u64,
    pub pending: u64,
    pub locked_deposit: u64,
    pub unlocked_deposit: u64,
    pub locked_investment: u64,
    pub unlocked_investment: u64,
}

/// Outcome of advancing the container to a new height.
#[derive(Debug, Default)]
pub struct AdvanceResult {
    pub unlocked: usize,
    pub locked: usize,
}

/// Container of one account's outputs and deposits.
#[derive(Default)]
pub struct TransfersContainer {
    outputs: Vec<TransferOutput>,
    deposits: Vec<Deposit>,
    /// Key image → position in `outputs`.
    by_key_image: HashMap<KeyImage, usize>,
    current_height: u64,
}

impl TransfersContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_height(&self) -> u64 {
        self.current_height
    }

    pub fn transfers_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn deposits(&self) -> &[Deposit] {
        &self.deposits
    }

    pub fn outputs(&self) -> &[TransferOutput] {
        &self.outputs
    }

    /// Track a new owned output. Unconfirmed outputs use the sentinel
    /// height/index.
    pub fn add_output(&mut self, mut output: TransferOutput) {
        output.state = if output.block_height == UNCONFIRMED_HEIGHT {
            TransferState::Unconfirmed
        } else if output.term > 0 {
            TransferState::Locked
        } else {
            TransferState::SoftLocked
        };
        if output.term > 0 && output.block_height != UNCONFIRMED_HEIGHT {
            self.deposits.push(Deposit {
                amount: output.amount,
                term: output.term,
                creating_tx: output.tx_hash,
                output_in_transaction: output.output_in_transaction,
                creating_height: output.block_height,
                interest: 0,
                unlock_height: output.block_height + output.term as u64,
                state: DepositState::Locked,
            });
        }
        if let Some(image) = output.key_image {
            self.by_key_image.insert(image, self.outputs.len());
        }
        self.outputs.push(output);
    }

    /// Record the interest of the most recently added deposit (computed by
    /// the synchronizer which owns the currency rules).
    pub fn set_last_deposit_interest(&mut self, interest: u64) {
        if let Some(deposit) = self.deposits.last_mut() {
            deposit.interest = interest;
        }
    }

    /// Confirm an unconfirmed output once its transaction lands in a block.
    pub fn confirm_output(
        &mut self,
        tx_hash: &Hash,
        output_in_transaction: u32,
        block_height: u64,
        global_output_index: u32,
    ) -> bool {
        for output in &mut self.outputs {
            if output.tx_hash == *tx_hash
                && output.output_in_transaction == output_in_transaction
                && output.state == TransferState::Unconfirmed
            {
                output.block_height = block_height;
                output.global_output_index = global_output_index;
                output.state = if output.term > 0 {
                    TransferState::Locked
                } else {
                    TransferState::SoftLocked
                };
                return true;
            }
        }
        false
    }

    /// Mark an output spent by its key image. Returns the output spent.
    pub fn mark_spent_by_key_image(&mut self, image: &KeyImage) -> Option<&TransferOutput> {
        let index = *self.by_key_image.get(image)?;
        let output = &mut self.outputs[index];
        output.state = TransferState::Spent;
        Some(&self.outputs[index])
    }

    /// Mark a deposit spent by its creating transaction and output index.
    pub fn mark_deposit_spent(&mut self, tx_hash: &Hash, output_in_transaction: u32) -> bool {
        let mut found = false;
        for deposit in &mut self.deposits {
            if deposit.creating_tx == *tx_hash
                && deposit.output_in_transaction == output_in_transaction
            {
                deposit.state = DepositState::Spent;
                found = true;
            }
        }
        if found {
            for output in &mut self.outputs {
                if output.tx_hash == *tx_hash
                    && output.output_in_transaction == output_in_transaction
                {
                    output.state = TransferState::Spent;
                }
            }
        }
        found
    }

    /// Advance to `height`, moving outputs across lock boundaries. Returns
    /// how many transfers changed lock state.
    pub fn advance_height(&mut self, height: u64) -> AdvanceResult {
        self.current_height = height;
        let mut result = AdvanceResult::default();
        for output in &mut self.outputs {
            match output.state {
                TransferState::SoftLocked => {
                    if Self::is_spendable(output, height) {
                        output.state = TransferState::Unlocked;
                        result.unlocked += 1;
                    }
                }
                TransferState::Locked => {
                    if output.term > 0
                        && output.block_height != UNCONFIRMED_HEIGHT
                        && output.block_height + output.term as u64 <= height
                    {
                        output.state = TransferState::Unlocked;
                        result.unlocked += 1;
                    }
                }
                _ => {}
            }
        }
        for deposit in &mut self.deposits {
            if deposit.state == DepositState::Locked && deposit.unlock_height <= height {
                deposit.state = DepositState::Unlocked;
            }
        }
        result
    }

    fn is_spendable(output: &TransferOutput, height: u64) -> bool {
        if output.block_height == UNCONFIRMED_HEIGHT {
            return false;
        }
        let age_ok =
            output.block_height + constants::MINED_MONEY_UNLOCK_WINDOW <= height;
        let unlock_ok = if output.unlock_time < constants::MAX_BLOCK_NUMBER {
            output.unlock_time <= height
        } else {
            // Time-based unlock is resolved by the synchronizer clock; treat
            // as locked until the height-based age passes.
            false
        };
        age_ok && (output.unlock_time == 0 || unlock_ok)
    }

    /// Detach every output and deposit at or above `height`; detached
    /// confirmed outputs return to unconfirmed. Returns affected tx hashes.
    pub fn detach(&mut self, height: u64) -> Vec<Hash> {
        let mut affected = Vec::new();
        for output in &mut self.outputs {
            if output.block_height != UNCONFIRMED_HEIGHT && output.block_height >= height {
                affected.push(output.tx_hash);
                output.block_height = UNCONFIRMED_HEIGHT;
                output.global_output_index = UNCONFIRMED_GLOBAL_INDEX;
                output.state = TransferState::Unconfirmed;
            }
        }
        self.deposits.retain(|d| {
            if d.creating_height >= height {
                affected.push(d.creating_tx);
                false
            } else {
                true
            }
        });
        affected.sort();
        affected.dedup();
        affected
    }

    /// Current balances by bucket.
    pub fn balance(&self) -> BalanceSummary {
        let mut summary = BalanceSummary::default();
        for output in &self.outputs {
            let is_investment = output.term != 0 && output.term % 64_800 == 0;
            match output.state {
                TransferState::Unlocked if output.term == 0 => {
                    summary.available += output.amount
                }
                TransferState::Unconfirmed | TransferState::SoftLocked => {
                    summary.pending += output.amount
                }
                TransferState::Locked if is_investment => {
                    summary.locked_investment += output.amount
                }
                TransferState::Locked => summary.locked_deposit += output.amount,
                TransferState::Unlocked if is_investment => {
                    summary.unlocked_investment += output.amount
                }
                TransferState::Unlocked => summary.unlocked_deposit += output.amount,
                TransferState::Spent => {}
            }
        }
        summary
    }

    /// Whether a key image belongs to this account.
    pub fn owns_key_image(&self, image: &KeyImage) -> bool {
        self.by_key_image.contains_key(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_output(tx: u8, height: u64, amount: u64) -> TransferOutput {
        TransferOutput {
            amount,
            global_output_index: 3,
            output_in_transaction: 0,
            tx_hash: [tx; 32],
            tx_public_key: PublicKey([tx; 32]),
            block_height: height,
            unlock_time: 0,
            key: Some(PublicKey([tx; 32])),
            key_image: Some(KeyImage([tx; 32])),
            term: 0,
            required_signatures: 0,
            state: TransferState::Unconfirmed,
        }
    }

    fn deposit_output(tx: u8, height: u64, amount: u64, term: u32) -> TransferOutput {
        TransferOutput {
            term,
            required_signatures: 1,
            key: None,
            key_image: None,
            ..key_output(tx, height, amount)
        }
    }

    #[test]
    fn key_output_lifecycle() {
        let mut container = TransfersContainer::new();
        container.add_output(key_output(1, 100, 500));
        assert_eq!(container.outputs()[0].state, TransferState::SoftLocked);

        // Below the unlock window: still soft-locked.
        let result = container.advance_height(105);
        assert_eq!(result.unlocked, 0);
        assert_eq!(container.balance().pending, 500);

        // Past the window: unlocked and available.
        let result = container.advance_height(110);
        assert_eq!(result.unlocked, 1);
        assert_eq!(container.balance().available, 500);

        // Spend by key image.
        assert!(container
            .mark_spent_by_key_image(&KeyImage([1u8; 32]))
            .is_some());
        assert_eq!(container.balance().available, 0);
    }

    #[test]
    fn deposit_lifecycle() {
        let mut container = TransfersContainer::new();
        container.add_output(deposit_output(2, 601, 1_000_000, 21_900));
        container.set_last_deposit_interest(2_416);
        let deposit = &container.deposits()[0];
        assert_eq!(deposit.unlock_height, 601 + 21_900);
        assert_eq!(deposit.interest, 2_416);
        assert_eq!(deposit.state, DepositState::Locked);
        assert_eq!(container.balance().locked_deposit, 1_000_000);

        container.advance_height(601 + 21_900);
        assert_eq!(container.deposits()[0].state, DepositState::Unlocked);
        assert_eq!(container.balance().unlocked_deposit, 1_000_000);

        assert!(container.mark_deposit_spent(&[2u8; 32], 0));
        assert_eq!(container.deposits()[0].state, DepositState::Spent);
        assert_eq!(container.balance().unlocked_deposit, 0);
    }

    #[test]
    fn investment_bucket() {
        let mut container = TransfersContainer::new();
        container.add_output(deposit_output(3, 700, 50_000_000_000, 64_800));
        assert_eq!(container.balance().locked_investment, 50_000_000_000);
        container.advance_height(700 + 64_800);
        assert_eq!(container.balance().unlocked_investment, 50_000_000_000);
    }

    #[test]
    fn unconfirmed_confirm_flow() {
        let mut container = TransfersContainer::new();
        let mut output = key_output(4, UNCONFIRMED_HEIGHT, 900);
        output.global_output_index = UNCONFIRMED_GLOBAL_INDEX;
        container.add_output(output);
        assert_eq!(container.outputs()[0].state, TransferState::Unconfirmed);
        assert_eq!(container.balance().pending, 900);

        assert!(container.confirm_output(&[4u8; 32], 0, 50, 7));
        assert_eq!(container.outputs()[0].state, TransferState::SoftLocked);
        assert_eq!(container.outputs()[0].global_output_index, 7);
        // Unknown output confirms nothing.
        assert!(!container.confirm_output(&[9u8; 32], 0, 50, 7));
    }

    #[test]
    fn detach_returns_to_unconfirmed() {
        let mut container = TransfersContainer::new();
        container.add_output(key_output(5, 100, 10));
        container.add_output(key_output(6, 200, 20));
        container.add_output(deposit_output(7, 250, 1_000_000, 21_900));

        let affected = container.detach(150);
        assert_eq!(affected.len(), 2);
        assert_eq!(container.outputs()[0].state, TransferState::SoftLocked);
        assert_eq!(container.outputs()[1].state, TransferState::Unconfirmed);
        assert_eq!(
            container.outputs()[1].global_output_index,
            UNCONFIRMED_GLOBAL_INDEX
        );
        // The deposit above the detach height is gone.
        assert!(container.deposits().is_empty());
    }

    #[test]
    fn time_locked_output_stays_pending() {
        let mut container = TransfersContainer::new();
        let mut output = key_output(8, 100, 40);
        output.unlock_time = constants::MAX_BLOCK_NUMBER + 1_000;
        container.add_output(output);
        container.advance_height(100_000);
        assert_eq!(container.outputs()[0].state, TransferState::SoftLocked);
        assert_eq!(container.balance().pending, 40);
    }

    #[test]
    fn owns_key_image_lookup() {
        let mut container = TransfersContainer::new();
        container.add_output(key_output(9, 10, 5));
        assert!(container.owns_key_image(&KeyImage([9u8; 32])));
        assert!(!container.owns_key_image(&KeyImage([1u8; 32])));
    }
}
