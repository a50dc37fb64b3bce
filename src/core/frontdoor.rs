//! Request boundary.
//!
//! [`Frontdoor`] authenticates a bearer token, routes the caller to a cell
//! and hands the request to the owning component. The authenticated user id
//! replaces whatever user id the request body carried.

use crate::control::routing::{CellRouter, Route};
use crate::core::error::{CoreError, CoreResult};
use crate::core::ids::{OrderId, ReservationId, SaleId};
use crate::core::runtime::Services;
use crate::core::time::Deadline;
use crate::flash::pow::ChallengeIssue;
use crate::flash::{FlashSaleEngine, PurchaseAttempt};
use crate::ledger::Reservation;
use crate::saga::{CheckoutOutcome, CheckoutRequest, SagaOrchestrator};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Identity extracted from a validated token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: String,
}

pub trait AuthValidator: Send + Sync {
    fn validate(&self, token: &str) -> CoreResult<Claims>;
}

/// Fixed token → user table.
#[derive(Debug, Default)]
pub struct StaticTokenValidator {
    tokens: RwLock<HashMap<String, String>>,
}

impl StaticTokenValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, T, U>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (T, U)>,
        T: Into<String>,
        U: Into<String>,
    {
        let tokens = pairs
            .into_iter()
            .map(|(t, u)| (t.into(), u.into()))
            .collect();
        Self {
            tokens: RwLock::new(tokens),
        }
    }

    pub fn insert(&self, token: impl Into<String>, user_id: impl Into<String>) {
        self.tokens.write().insert(token.into(), user_id.into());
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.write().remove(token).is_some()
    }
}

impl AuthValidator for StaticTokenValidator {
    fn validate(&self, token: &str) -> CoreResult<Claims> {
        self.tokens
            .read()
            .get(token)
            .map(|user_id| Claims {
                user_id: user_id.clone(),
            })
            .ok_or_else(|| CoreError::invalid_input("invalid token"))
    }
}

/// A component result paired with the cell that served it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routed<T> {
    pub route: Route,
    pub value: T,
}

#[derive(Clone)]
pub struct Frontdoor {
    auth: Arc<dyn AuthValidator>,
    router: Arc<CellRouter>,
    flash: FlashSaleEngine,
    sagas: SagaOrchestrator,
}

impl Frontdoor {
    pub fn new(auth: Arc<dyn AuthValidator>, services: &Services) -> Self {
        Self {
            auth,
            router: services.router.clone(),
            flash: services.flash.clone(),
            sagas: services.sagas.clone(),
        }
    }

    /// Validate `token` and route its user.
    pub fn authenticate(&self, token: &str) -> CoreResult<(Claims, Route)> {
        let claims = self.auth.validate(token)?;
        let route = self.router.route(&claims.user_id);
        Ok((claims, route))
    }

    pub fn get_challenge(&self, token: &str, sale_id: SaleId) -> CoreResult<Routed<ChallengeIssue>> {
        let (claims, route) = self.authenticate(token)?;
        let value = self.flash.get_challenge(sale_id, &claims.user_id)?;
        Ok(Routed { route, value })
    }

    pub async fn attempt_purchase(
        &self,
        token: &str,
        mut attempt: PurchaseAttempt,
        deadline: Deadline,
    ) -> CoreResult<Routed<Reservation>> {
        let (claims, route) = self.authenticate(token)?;
        attempt.user_id = claims.user_id;
        let value = self.flash.attempt_purchase(attempt, deadline).await?;
        Ok(Routed { route, value })
    }

    pub fn confirm_purchase(
        &self,
        token: &str,
        reservation_id: ReservationId,
    ) -> CoreResult<Routed<OrderId>> {
        let (claims, route) = self.authenticate(token)?;
        let value = self.flash.confirm_purchase(reservation_id, &claims.user_id)?;
        Ok(Routed { route, value })
    }

    pub async fn checkout(
        &self,
        token: &str,
        mut request: CheckoutRequest,
        deadline: Deadline,
    ) -> CoreResult<Routed<CheckoutOutcome>> {
        let (claims, route) = self.authenticate(token)?;
        request.user_id = claims.user_id;
        let value = self.sagas.checkout(request, deadline).await?;
        Ok(Routed { route, value })
    }

    pub fn cancel_checkout(
        &self,
        token: &str,
        idempotency_key: &str,
    ) -> CoreResult<Routed<CheckoutOutcome>> {
        let (claims, route) = self.authenticate(token)?;
        let saga = self
            .sagas
            .get(idempotency_key)
            .ok_or_else(|| CoreError::not_found("saga", idempotency_key))?;
        if saga.request.user_id != claims.user_id {
            return Err(CoreError::not_found("saga", idempotency_key));
        }
        let value = self.sagas.cancel(idempotency_key)?;
        Ok(Routed { route, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_tokens_validate_and_revoke() {
        let auth = StaticTokenValidator::from_pairs([("t-alice", "alice")]);
        assert_eq!(auth.validate("t-alice").unwrap().user_id, "alice");
        assert!(matches!(
            auth.validate("t-bob"),
            Err(CoreError::InvalidInput { .. })
        ));

        auth.insert("t-bob", "bob");
        assert_eq!(auth.validate("t-bob").unwrap().user_id, "bob");
        assert!(auth.revoke("t-bob"));
        assert!(auth.validate("t-bob").is_err());
    }
}
