//! Change capture ledger
//!
//! Every committed mutation of the application database is captured here
//! as an immutable, ordered change record. The ledger is the source of
//! truth for what each peer still needs to receive.

pub mod entry;
pub mod store;

pub use entry::{ChangeId, ChangeRecord, Operation};
pub use store::{ChangeLedger, LedgerEntry};
