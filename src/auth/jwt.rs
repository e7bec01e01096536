//! JWT 발급/검증 (HS256)

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// 토큰 발급자
const ISSUER: &str = "Quantis";

/// JWT_SECRET 환경변수가 없을 때 쓰는 개발용 기본키
const DEFAULT_SECRET: &str = "1a9c7205a64fac856e71d90da0d1324541e0995eaf89e9d0e4f2c39491170454";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: i64,
    pub iss: String,
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

fn jwt_secret() -> String {
    std::env::var("JWT_SECRET").unwrap_or_else(|_| DEFAULT_SECRET.to_string())
}

/// 사용자 ID로 토큰 발급
pub fn generate_token(user_id: i64, ttl: Duration) -> Result<(String, DateTime<Utc>), String> {
    let now = Utc::now();
    let expired_at = now + ttl;

    let claims = Claims {
        user_id,
        iss: ISSUER.to_string(),
        sub: user_id.to_string(),
        iat: now.timestamp(),
        exp: expired_at.timestamp(),
    };

    let token = encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(jwt_secret().as_bytes()),
    )
    .map_err(|e| format!("failed to sign token: {}", e))?;

    Ok((token, expired_at))
}

/// 토큰 해석 및 서명/만료/발급자 검증
pub fn parse_token(token: &str) -> Result<Claims, String> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[ISSUER]);

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(jwt_secret().as_bytes()),
        &validation,
    )
    .map_err(|e| format!("invalid token: {}", e))?;

    Ok(data.claims)
}

/// 토큰 문자열에서 사용자 ID 추출 ("Bearer " 접두어 허용)
pub fn validate_token(token: &str) -> Result<i64, String> {
    let token = token.strip_prefix("Bearer ").unwrap_or(token);
    if token.is_empty() {
        return Err("missing token".to_string());
    }

    parse_token(token).map(|claims| claims.user_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_round_trip() {
        let (token, expired_at) = generate_token(42, Duration::minutes(30)).unwrap();
        assert!(expired_at > Utc::now());

        let claims = parse_token(&token).unwrap();
        assert_eq!(claims.user_id, 42);
        assert_eq!(claims.iss, "Quantis");
        assert_eq!(claims.sub, "42");

        assert_eq!(validate_token(&token).unwrap(), 42);
        assert_eq!(validate_token(&format!("Bearer {}", token)).unwrap(), 42);
    }

    #[test]
    fn test_invalid_token_rejected() {
        assert!(validate_token("").is_err());
        assert!(validate_token("not-a-token").is_err());

        // 만료된 토큰
        let (token, _) = generate_token(1, Duration::minutes(-10)).unwrap();
        assert!(validate_token(&token).is_err());
    }
}
