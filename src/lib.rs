//! A symbolic verifier for cryptographic protocol models.
//!
//! A model lists principals, the constants they know, generate and compute,
//! the messages they exchange and the security queries to check. The
//! [`Verifier`] pits a passive or active attacker against the model and
//! reports which queries it manages to break.

pub mod analysis;
pub mod attacker;
pub mod context;
pub mod error;
pub mod info;
pub mod inject;
pub mod knowledge;
pub mod possible;
pub mod primitive;
pub mod principal;
pub mod query;
pub mod replacement;
pub mod results;
pub mod rewrite;
pub mod sanity;
pub mod value;
pub mod verify;

pub use error::{InternalError, SanityError, VerifyError};
pub use results::{QueryOptionResult, VerifyResult};
pub use verify::{Verification, Verifier};
pub use verisym_parse as parse;
pub use verisym_parse::parse_model;
