// src/auth/mod.rs
//! Bearer-token authentication: `lookup(hash(presented))` against
//! `ApiKeyStore`, checking both the key and its tenant are active. Uses a
//! background-task-via-`tokio::spawn` pattern for the best-effort
//! `last_used_at` touch, and `axum_extra`'s typed `Authorization: Bearer`
//! extractor.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use tracing::debug;

use crate::error::GatewayError;
use crate::knowledge_db::api_key_store::hash_key;
use crate::knowledge_db::KnowledgeDatabase;

/// The authenticated scope attached to a request by `AuthenticatedTenant`'s
/// extractor impl: every store call downstream is scoped by `tenant_id`,
/// which every query must carry explicitly.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub tenant_id: String,
    pub api_key_id: String,
}

/// An axum extractor: any handler taking `AuthContext` as an argument gets
/// authentication for free, failing the request with `UNAUTHENTICATED` or
/// `PERMISSION_DENIED` before the handler body ever runs.
impl FromRequestParts<crate::app_state::AppState> for AuthContext {
    type Rejection = GatewayError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &crate::app_state::AppState,
    ) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| GatewayError::Unauthenticated)?;
        authenticate(&state.db, bearer.token()).await
    }
}

/// Core authentication logic, factored out of the extractor so it can be
/// unit-tested without constructing a full axum request.
pub async fn authenticate(db: &Arc<KnowledgeDatabase>, presented: &str) -> Result<AuthContext, GatewayError> {
    if presented.trim().is_empty() {
        return Err(GatewayError::Unauthenticated);
    }
    let hash = hash_key(presented);
    let key = db
        .api_keys
        .find_by_hash(&hash)
        .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?
        .ok_or(GatewayError::Unauthenticated)?;

    if !key.active {
        return Err(GatewayError::PermissionDenied);
    }
    let tenant_active = db
        .tenants
        .is_active(&key.tenant_id)
        .map_err(|e| GatewayError::StoreUnavailable(e.to_string()))?;
    if !tenant_active {
        return Err(GatewayError::PermissionDenied);
    }

    // Best-effort, fire-and-forget: a missed update to last_used_at is an
    // acceptable loss, so this runs off the request path rather than being
    // awaited inline.
    let db = Arc::clone(db);
    let key_id = key.id.clone();
    tokio::spawn(async move {
        if let Err(e) = db.api_keys.touch_last_used(&key_id) {
            debug!("touch_last_used failed for key {}: {}", key_id, e);
        }
    });

    Ok(AuthContext { tenant_id: key.tenant_id, api_key_id: key.id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::knowledge_db::schema::Plan;

    fn test_db() -> Arc<KnowledgeDatabase> {
        Arc::new(KnowledgeDatabase::new_in_memory(8).expect("in-memory db"))
    }

    #[tokio::test]
    async fn rejects_empty_bearer() {
        let db = test_db();
        let result = authenticate(&db, "").await;
        assert!(matches!(result, Err(GatewayError::Unauthenticated)));
    }

    #[tokio::test]
    async fn rejects_unknown_key() {
        let db = test_db();
        let result = authenticate(&db, "not-a-real-key").await;
        assert!(matches!(result, Err(GatewayError::Unauthenticated)));
    }

    #[tokio::test]
    async fn accepts_active_key_for_active_tenant() {
        let db = test_db();
        let tenant = db.tenants.create("acme", Plan::Free).unwrap();
        let key = db.api_keys.create(&tenant.tenant_id, "default", "sk-test-123").unwrap();
        let ctx = authenticate(&db, "sk-test-123").await.unwrap();
        assert_eq!(ctx.tenant_id, tenant.tenant_id);
        assert_eq!(ctx.api_key_id, key.id);
    }

    #[tokio::test]
    async fn rejects_key_of_inactive_tenant() {
        let db = test_db();
        let tenant = db.tenants.create("acme", Plan::Free).unwrap();
        db.api_keys.create(&tenant.tenant_id, "default", "sk-test-456").unwrap();
        db.tenants.set_active(&tenant.tenant_id, false).unwrap();
        let result = authenticate(&db, "sk-test-456").await;
        assert!(matches!(result, Err(GatewayError::PermissionDenied)));
    }
}
