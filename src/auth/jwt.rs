use jsonwebtoken::{decode, DecodingKey, Validation};

use crate::config::JwtConfig;
use crate::error::AppError;

use super::Claims;

pub struct JwtValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtValidator {
    pub fn new(config: &JwtConfig) -> Self {
        let decoding_key = DecodingKey::from_secret(config.secret.as_bytes());

        let mut validation = Validation::default();

        if let Some(ref issuer) = config.issuer {
            validation.set_issuer(&[issuer]);
        }

        if let Some(ref audience) = config.audience {
            validation.set_audience(&[audience]);
        }

        Self {
            decoding_key,
            validation,
        }
    }

    pub fn validate(&self, token: &str) -> Result<Claims, AppError> {
        let token_data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| AppError::Auth(format!("Invalid token: {}", e)))?;

        Ok(token_data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn test_config() -> JwtConfig {
        JwtConfig {
            secret: "relay-test-secret".to_string(),
            issuer: None,
            audience: None,
        }
    }

    fn sign(claims: &Claims, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn claims_for(tenant: Option<&str>, exp_offset: i64) -> Claims {
        let now = chrono::Utc::now().timestamp();
        Claims {
            sub: "user-123".to_string(),
            exp: now + exp_offset,
            iat: now,
            tenant_id: tenant.map(str::to_string),
            organizations: vec![],
            extra: Default::default(),
        }
    }

    #[test]
    fn test_valid_token_carries_tenant() {
        let config = test_config();
        let validator = JwtValidator::new(&config);

        let token = sign(&claims_for(Some("org-1"), 3600), &config.secret);
        let claims = validator.validate(&token).unwrap();

        assert_eq!(claims.user_id(), "user-123");
        assert_eq!(claims.tenant_id(), "org-1");
    }

    #[test]
    fn test_expired_token_rejected() {
        let config = test_config();
        let validator = JwtValidator::new(&config);

        let token = sign(&claims_for(Some("org-1"), -3600), &config.secret);
        assert!(matches!(validator.validate(&token), Err(AppError::Auth(_))));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let validator = JwtValidator::new(&test_config());
        let token = sign(&claims_for(None, 3600), "another-secret");
        assert!(validator.validate(&token).is_err());
    }

    #[test]
    fn test_garbage_token_rejected() {
        let validator = JwtValidator::new(&test_config());
        assert!(validator.validate("invalid-token").is_err());
    }
}
