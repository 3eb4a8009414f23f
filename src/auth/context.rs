use chrono::Utc;
use uuid::Uuid;

use crate::auth::gate::{self, ApiKey, ApiKeyScope, HttpMethod};
use crate::errors::ServiceError;

/// Authorization context for the current operation, built from the resolved
/// API key the HTTP layer hands us.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub key: ApiKey,
}

impl AuthContext {
    pub fn new(key: ApiKey) -> Self {
        Self { key }
    }

    /// Context for internal operations (schedule-triggered jobs, pruning).
    /// These never pass through the HTTP gate.
    pub fn internal_system_context() -> Self {
        Self {
            key: ApiKey {
                id: Uuid::nil(),
                customer_id: Uuid::nil(),
                scope: ApiKeyScope::Admin,
                revoked: false,
                expires_at: None,
            },
        }
    }

    pub fn customer_id(&self) -> Uuid {
        self.key.customer_id
    }

    pub fn is_system(&self) -> bool {
        self.key.id.is_nil()
    }

    /// Authorize an operation invoked through the given HTTP method.
    pub fn authorize_method(&self, method: HttpMethod) -> Result<(), ServiceError> {
        gate::check(&self.key, method, Utc::now()).map_err(|rejection| {
            ServiceError::PermissionDenied {
                code: match rejection.code.as_str() {
                    gate::CODE_KEY_REVOKED => gate::CODE_KEY_REVOKED,
                    gate::CODE_KEY_EXPIRED => gate::CODE_KEY_EXPIRED,
                    _ => gate::CODE_INSUFFICIENT_SCOPE,
                },
                message: rejection.error,
            }
        })
    }

    /// For operations restricted to the key's own customer.
    pub fn authorize_customer(&self, owner_id: Uuid) -> Result<(), ServiceError> {
        if self.is_system() || self.customer_id() == owner_id {
            Ok(())
        } else {
            Err(ServiceError::PermissionDenied {
                code: gate::CODE_INSUFFICIENT_SCOPE,
                message: "You do not have permission to access this resource".to_string(),
            })
        }
    }
}
