//! JWT 认证模块
//!
//! 提供 JWT token 生成、验证，以及从 WebSocket 升级请求中提取凭据

use application::{Credentials, IdentityError, IdentityProvider};
use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use config::JwtConfig;
use domain::UserId;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

/// 浏览器客户端保存令牌使用的 Cookie 名
pub const ACCESS_TOKEN_COOKIE: &str = "access_token";

/// JWT Claims 结构
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: UserId,
    pub exp: i64, // 过期时间 (Unix timestamp)
}

/// JWT Token 服务
#[derive(Clone)]
pub struct JwtService {
    config: JwtConfig,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtService {
    pub fn new(config: JwtConfig) -> Self {
        let encoding_key = EncodingKey::from_secret(config.secret.as_ref());
        let decoding_key = DecodingKey::from_secret(config.secret.as_ref());

        Self {
            config,
            encoding_key,
            decoding_key,
        }
    }

    /// 生成 JWT token
    pub fn generate_token(&self, user_id: UserId) -> Result<String, ApiError> {
        let exp = chrono::Utc::now() + chrono::Duration::hours(self.config.expiration_hours);

        let claims = Claims {
            user_id,
            exp: exp.timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|err| ApiError::internal_server_error(format!("Token generation failed: {}", err)))
    }

    /// 验证并解析 JWT token
    pub fn verify_token(&self, token: &str) -> Result<Claims, IdentityError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|token_data| token_data.claims)
            .map_err(|err| IdentityError::InvalidToken(err.to_string()))
    }
}

#[async_trait]
impl IdentityProvider for JwtService {
    async fn identify(&self, credentials: &Credentials) -> Result<UserId, IdentityError> {
        let token = credentials
            .access_token
            .as_deref()
            .ok_or(IdentityError::MissingToken)?;
        let claims = self.verify_token(token)?;
        if claims.user_id.is_zero() {
            return Err(IdentityError::InvalidToken("empty subject".to_string()));
        }
        Ok(claims.user_id)
    }
}

/// 从请求中提取凭据
///
/// 依次查找 `Authorization: Bearer`、查询参数 `token` 和 `access_token` Cookie。
pub fn credentials_from_request(headers: &HeaderMap, query_token: Option<&str>) -> Credentials {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim);

    let token = bearer
        .or(query_token)
        .map(str::to_owned)
        .or_else(|| cookie_value(headers, ACCESS_TOKEN_COOKIE))
        .filter(|token| !token.is_empty());

    Credentials {
        access_token: token,
    }
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.to_string())
}
