//! Connection bookkeeping

mod lifecycle;
mod settings;
mod table;

pub use lifecycle::ConnectionState;
pub use settings::ConnectionParams;
pub use table::{ActiveConnection, ConnectionTable};
