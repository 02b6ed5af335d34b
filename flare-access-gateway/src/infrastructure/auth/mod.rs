//! 认证模块
//!
//! 基于 HS256 JWT 的令牌校验：签名、过期时间、可选的签发方，
//! 以及 `sub` 必须与请求头中的用户 ID 一致。

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::TokenValidator;

/// Token Claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// 用户ID
    pub sub: String,
    /// 过期时间（Unix时间戳）
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// JWT 令牌校验器
pub struct JwtTokenValidator {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtTokenValidator {
    pub fn new(secret: &str, issuer: Option<&str>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        if let Some(issuer) = issuer {
            validation.set_issuer(&[issuer]);
            validation.set_required_spec_claims(&["exp", "iss"]);
        }

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    fn verify(&self, token: &str) -> Option<TokenClaims> {
        match decode::<TokenClaims>(token, &self.decoding_key, &self.validation) {
            Ok(data) => Some(data.claims),
            Err(err) => {
                warn!(error = %err, token_preview = %preview(token), "token validation failed");
                None
            }
        }
    }
}

fn preview(token: &str) -> &str {
    token.get(..12).unwrap_or(token)
}

#[async_trait]
impl TokenValidator for JwtTokenValidator {
    async fn validate(&self, token: &str, user_id: i64) -> bool {
        let Some(claims) = self.verify(token) else {
            return false;
        };

        if claims.sub.parse::<i64>().ok() != Some(user_id) {
            warn!(user_id, sub = %claims.sub, "token subject does not match user id");
            return false;
        }

        debug!(user_id, "token authenticated");
        true
    }
}
