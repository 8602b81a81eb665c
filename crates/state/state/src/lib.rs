pub mod error;
pub mod key;
pub mod store;
pub mod testing;

pub use error::StateError;
pub use key::{GLOBAL_SCOPE, KeyKind, StateKey};
pub use store::{CasResult, StateStore, WriteOp};
