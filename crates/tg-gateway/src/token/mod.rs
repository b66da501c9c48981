//! Token admission
//!
//! Tokens are single-use, encrypted routing descriptors minted by a trusted
//! backend. [`ReplayGuard`] enforces the single use; [`TokenCodec`] turns an
//! admitted token into a [`ConnectionDescriptor`].

mod codec;
mod replay;

pub use codec::{ConnectionDescriptor, ConnectionInfo, TokenCodec};
pub use replay::{run_token_sweep, ReplayGuard};
