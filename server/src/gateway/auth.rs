//! Socket session authentication.
//!
//! Clients present a signed bearer token at connection time; the token is
//! verified before the upgrade is accepted, never after.

use common::api::error::{ApiError, ApiResult};
use common::ids::UserId;
use common::user::UserRole;
use jsonwebtoken::{
    decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    /// The account id.
    sub: String,
    /// "PASSENGER" or "DRIVER".
    role: String,
    exp: u64,
}

/// The verified identity a connection runs as.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SessionIdentity {
    pub user_id: UserId,
    pub role: UserRole,
}

#[derive(Clone)]
pub struct TokenVerifier {
    decoding: DecodingKey,
    encoding: EncodingKey,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            encoding: EncodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn verify(&self, token: &str) -> ApiResult<SessionIdentity> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|err| {
                ApiError::unauthenticated(format!("invalid token: {err}"))
            })?;
        let user_id = UserId::from_str(&data.claims.sub).map_err(|_| {
            ApiError::unauthenticated("token subject is not a user id")
        })?;
        let role = UserRole::from_str(&data.claims.role).map_err(|_| {
            ApiError::unauthenticated("token carries an unknown role")
        })?;
        if !matches!(role, UserRole::Passenger | UserRole::Driver) {
            return Err(ApiError::forbidden(
                "only passengers and drivers connect to dispatch",
            ));
        }
        Ok(SessionIdentity { user_id, role })
    }

    /// Mint a token. Auth issuance lives in the accounts service; this is
    /// for local tooling and tests.
    pub fn issue(
        &self,
        user_id: UserId,
        role: UserRole,
        ttl: Duration,
    ) -> anyhow::Result<String> {
        let exp = SystemTime::now()
            .duration_since(UNIX_EPOCH)?
            .saturating_add(ttl)
            .as_secs();
        let claims = Claims {
            sub: user_id.to_string(),
            role: role.to_string(),
            exp,
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn issue_verify_roundtrip() {
        let verifier = TokenVerifier::new("sekret");
        let user = UserId::generate();
        let token = verifier
            .issue(user, UserRole::Driver, Duration::from_secs(60))
            .unwrap();
        let identity = verifier.verify(&token).unwrap();
        assert_eq!(identity.user_id, user);
        assert_eq!(identity.role, UserRole::Driver);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let signer = TokenVerifier::new("a");
        let verifier = TokenVerifier::new("b");
        let token = signer
            .issue(UserId::generate(), UserRole::Passenger, Duration::from_secs(60))
            .unwrap();
        assert!(verifier.verify(&token).is_err());
    }

    #[test]
    fn admin_tokens_cannot_open_dispatch_sockets() {
        let verifier = TokenVerifier::new("sekret");
        let token = verifier
            .issue(UserId::generate(), UserRole::Admin, Duration::from_secs(60))
            .unwrap();
        let err = verifier.verify(&token).unwrap_err();
        assert_eq!(err.kind, common::api::error::ErrorKind::Forbidden);
    }
}
