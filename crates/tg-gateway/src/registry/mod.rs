//! Session registry backends
//!
//! The gateway only ever talks to `Arc<dyn SessionRegistry>`; which store
//! sits behind it is decided here, once, from configuration.

mod memory;
mod remote;

use std::sync::Arc;

use tg_core::config::{RegistryBackend, RegistryConfig};
use tg_core::traits::SessionRegistry;
use tg_core::RegistryError;

pub use self::memory::MemoryRegistry;
pub use self::remote::RedisRegistry;

/// Build the configured session registry
pub fn from_config(config: &RegistryConfig) -> Result<Arc<dyn SessionRegistry>, RegistryError> {
    match config.backend {
        RegistryBackend::Memory => {
            tracing::info!("Using in-process session registry");
            Ok(Arc::new(MemoryRegistry::new()))
        }
        RegistryBackend::Redis => {
            tracing::info!("Using Redis session registry at {}", config.redis_url);
            Ok(Arc::new(RedisRegistry::new(config)?))
        }
    }
}
