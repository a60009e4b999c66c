//! Chain access: the adapter contract, the registry, and a scriptable
//! mock for tests.

pub mod adapter;
pub mod mock;
pub mod registry;

pub use adapter::{
    BalanceChange, ChainAdapter, GasEstimate, Receipt, ReceiptStatus, SignedTx, SimulationOutcome,
    UnsignedTx,
};
pub use mock::MockChainAdapter;
pub use registry::ChainRegistry;
