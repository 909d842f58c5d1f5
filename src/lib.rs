//! Badge issuance registry.
//!
//! * [`contracts`] — the badge contract: create, read, update, delete, exists
//!   and list over a key-value world state, plus name-based dispatch.
//! * [`ledger`] — the traits a contract runs against and a local host that
//!   buffers each transaction's writes and persists committed state as a
//!   digest-checked snapshot.

pub mod contracts;
pub mod ledger;

pub use contracts::{Badge, BadgeContract, ContractError, ErrorKind};
pub use ledger::{ChaincodeStub, StateError, TransactionContext, WorldState};
