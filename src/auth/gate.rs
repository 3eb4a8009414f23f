use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// HTTP methods the authorization gate reasons about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HttpMethod {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub const ALL: [HttpMethod; 6] = [
        HttpMethod::Get,
        HttpMethod::Head,
        HttpMethod::Post,
        HttpMethod::Put,
        HttpMethod::Patch,
        HttpMethod::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Head => "HEAD",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(HttpMethod::Get),
            "HEAD" => Some(HttpMethod::Head),
            "POST" => Some(HttpMethod::Post),
            "PUT" => Some(HttpMethod::Put),
            "PATCH" => Some(HttpMethod::Patch),
            "DELETE" => Some(HttpMethod::Delete),
            _ => None,
        }
    }
}

/// Permission tier of an API key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApiKeyScope {
    Read,
    Write,
    Admin,
}

impl ApiKeyScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiKeyScope::Read => "read",
            ApiKeyScope::Write => "write",
            ApiKeyScope::Admin => "admin",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "read" => Some(ApiKeyScope::Read),
            "write" => Some(ApiKeyScope::Write),
            "admin" => Some(ApiKeyScope::Admin),
            _ => None,
        }
    }

    /// The set of HTTP methods this scope may invoke.
    pub fn allowed_methods(&self) -> &'static [HttpMethod] {
        match self {
            ApiKeyScope::Read => &[HttpMethod::Get, HttpMethod::Head],
            ApiKeyScope::Write => &[HttpMethod::Get, HttpMethod::Head, HttpMethod::Post],
            ApiKeyScope::Admin => &HttpMethod::ALL,
        }
    }

    pub fn allows(&self, method: HttpMethod) -> bool {
        self.allowed_methods().contains(&method)
    }
}

/// Resolved API key as presented by the authentication subsystem.
/// The gate only reads `scope` and the revocation/expiry flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub scope: ApiKeyScope,
    pub revoked: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ApiKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }
}

/// Structured rejection returned when the gate refuses a request.
/// `code` is a fixed machine-readable identifier; the embedding HTTP layer
/// serializes this body with status `ServiceError::FORBIDDEN_STATUS`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateRejection {
    pub error: String,
    pub code: String,
}

pub const CODE_INSUFFICIENT_SCOPE: &str = "insufficient_scope";
pub const CODE_KEY_REVOKED: &str = "key_revoked";
pub const CODE_KEY_EXPIRED: &str = "key_expired";

/// Check a resolved key against a request method.
pub fn check(key: &ApiKey, method: HttpMethod, now: DateTime<Utc>) -> Result<(), GateRejection> {
    if key.revoked {
        return Err(GateRejection {
            error: "API key has been revoked".to_string(),
            code: CODE_KEY_REVOKED.to_string(),
        });
    }
    if key.is_expired(now) {
        return Err(GateRejection {
            error: "API key has expired".to_string(),
            code: CODE_KEY_EXPIRED.to_string(),
        });
    }
    if !key.scope.allows(method) {
        return Err(GateRejection {
            error: format!(
                "Scope '{}' may not invoke {}",
                key.scope.as_str(),
                method.as_str()
            ),
            code: CODE_INSUFFICIENT_SCOPE.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(scope: ApiKeyScope) -> ApiKey {
        ApiKey {
            id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            scope,
            revoked: false,
            expires_at: None,
        }
    }

    #[test]
    fn scope_method_matrix() {
        let cases = [
            (ApiKeyScope::Read, HttpMethod::Get, true),
            (ApiKeyScope::Read, HttpMethod::Head, true),
            (ApiKeyScope::Read, HttpMethod::Post, false),
            (ApiKeyScope::Read, HttpMethod::Put, false),
            (ApiKeyScope::Read, HttpMethod::Patch, false),
            (ApiKeyScope::Read, HttpMethod::Delete, false),
            (ApiKeyScope::Write, HttpMethod::Get, true),
            (ApiKeyScope::Write, HttpMethod::Head, true),
            (ApiKeyScope::Write, HttpMethod::Post, true),
            (ApiKeyScope::Write, HttpMethod::Put, false),
            (ApiKeyScope::Write, HttpMethod::Patch, false),
            (ApiKeyScope::Write, HttpMethod::Delete, false),
        ];
        for (scope, method, expected) in cases {
            assert_eq!(
                scope.allows(method),
                expected,
                "{:?} {:?}",
                scope,
                method
            );
        }
        for method in HttpMethod::ALL {
            assert!(ApiKeyScope::Admin.allows(method), "admin {:?}", method);
        }
    }

    #[test]
    fn rejection_carries_fixed_code() {
        let err = check(&key(ApiKeyScope::Read), HttpMethod::Post, Utc::now()).unwrap_err();
        assert_eq!(err.code, CODE_INSUFFICIENT_SCOPE);
    }

    #[test]
    fn revoked_key_is_rejected_for_any_method() {
        let mut k = key(ApiKeyScope::Admin);
        k.revoked = true;
        let err = check(&k, HttpMethod::Get, Utc::now()).unwrap_err();
        assert_eq!(err.code, CODE_KEY_REVOKED);
    }

    #[test]
    fn expired_key_is_rejected() {
        let mut k = key(ApiKeyScope::Write);
        k.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        let err = check(&k, HttpMethod::Get, Utc::now()).unwrap_err();
        assert_eq!(err.code, CODE_KEY_EXPIRED);
    }
}
