pub mod context;
pub mod gate;

// Re-export public items
pub use context::AuthContext;
pub use gate::{ApiKey, ApiKeyScope, GateRejection, HttpMethod};
