//! Wallet-side output tracking: per-account transfer containers and the
//! synchronizer that drives them from chain and pool state.

pub mod container;
pub mod synchronizer;

pub use container::{
    Deposit, DepositState, TransferOutput, TransferState, TransfersContainer,
};
pub use synchronizer::{AccountSubscription, TransfersSynchronizer};

/// Global output index of an output not yet in a block.
pub const UNCONFIRMED_GLOBAL_INDEX: u32 = u32::MAX;
/// Block height of an output not yet in a block.
pub const UNCONFIRMED_HEIGHT: u64 = u64::MAX;
