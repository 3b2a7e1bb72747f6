//! Supabase access-token validation

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Audience Supabase puts on tokens issued to signed-in users.
pub const SUPABASE_AUDIENCE: &str = "authenticated";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Supabase user id; doubles as the account id.
    pub sub: Uuid,
    pub aud: String,
    pub exp: i64,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Clone)]
pub struct JwtManager {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl std::fmt::Debug for JwtManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtManager").finish_non_exhaustive()
    }
}

impl JwtManager {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn validate_access_token(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_audience(&[SUPABASE_AUDIENCE]);
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp", "sub", "aud"]);
        Ok(decode::<Claims>(token, &self.decoding, &validation)?.claims)
    }

    /// Sign a token the way Supabase does, for local tooling and tests.
    pub fn issue(
        &self,
        account_id: Uuid,
        email: Option<&str>,
        ttl: time::Duration,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = Claims {
            sub: account_id,
            aud: SUPABASE_AUDIENCE.to_string(),
            exp: (OffsetDateTime::now_utc() + ttl).unix_timestamp(),
            email: email.map(str::to_string),
            role: Some("authenticated".to_string()),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_validates() {
        let jwt = JwtManager::new("test-jwt-secret-key-for-testing-only");
        let id = Uuid::new_v4();
        let token = jwt
            .issue(id, Some("user@example.com"), time::Duration::hours(1))
            .unwrap();

        let claims = jwt.validate_access_token(&token).unwrap();
        assert_eq!(claims.sub, id);
        assert_eq!(claims.email.as_deref(), Some("user@example.com"));
    }

    #[test]
    fn expired_token_is_rejected() {
        let jwt = JwtManager::new("test-jwt-secret-key-for-testing-only");
        let token = jwt
            .issue(Uuid::new_v4(), None, time::Duration::hours(-2))
            .unwrap();
        assert!(jwt.validate_access_token(&token).is_err());
    }

    #[test]
    fn token_from_other_secret_is_rejected() {
        let issuer = JwtManager::new("some-other-project-secret-value");
        let jwt = JwtManager::new("test-jwt-secret-key-for-testing-only");
        let token = issuer
            .issue(Uuid::new_v4(), None, time::Duration::hours(1))
            .unwrap();
        assert!(jwt.validate_access_token(&token).is_err());
    }
}
