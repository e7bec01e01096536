//! 가입/로그인 서비스와 요청 인증 추출기

pub mod jwt;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::Json;
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::{DateTime, Duration, Utc};
use log::info;
use sqlx::SqlitePool;

use crate::api::models::ErrorBody;
use crate::db::repository::{UserRepository, WalletRepository};

/// 로그인 토큰 유효 시간
const TOKEN_TTL_MINUTES: i64 = 30;

/// 사용자 등록. 기본 지갑(USDT 시드 포함)까지 초기화한다.
pub async fn registration(
    pool: &SqlitePool,
    name: &str,
    email: &str,
    password: &str,
) -> Result<i64, String> {
    if UserRepository::find_by_email(pool, email)
        .await
        .map_err(|e| format!("failed to query user: {}", e))?
        .is_some()
    {
        return Err("user already registered".to_string());
    }

    let hashed = hash(password, DEFAULT_COST).map_err(|e| format!("failed to hash password: {}", e))?;

    let user_id = UserRepository::insert(pool, name, email, &hashed)
        .await
        .map_err(|e| format!("failed to create user: {}", e))?;

    WalletRepository::init_default_wallets(pool, user_id)
        .await
        .map_err(|e| format!("failed to initialize wallets: {}", e))?;

    info!("사용자 등록 완료: id={}, email={}", user_id, email);

    Ok(user_id)
}

/// 로그인. 성공 시 (토큰, 만료 시각)을 돌려준다.
pub async fn login(
    pool: &SqlitePool,
    email: &str,
    password: &str,
) -> Result<(String, DateTime<Utc>), String> {
    let user = UserRepository::find_by_email(pool, email)
        .await
        .map_err(|e| format!("failed to query user: {}", e))?
        .ok_or_else(|| "invalid email or password".to_string())?;

    let ok = verify(password, &user.password).unwrap_or(false);
    if !ok {
        return Err("invalid email or password".to_string());
    }

    jwt::generate_token(user.id, Duration::minutes(TOKEN_TTL_MINUTES))
}

/// 인증된 요청에서 해석한 사용자 ID
///
/// 핸들러 시그니처에 넣으면 Bearer 토큰 검증이 끝난 사용자 ID가 들어온다.
pub struct AuthUser(pub i64);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = (StatusCode, Json<ErrorBody>);

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| unauthorized("missing authorization header"))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| unauthorized("invalid authorization header format"))?;

        match jwt::validate_token(token) {
            Ok(user_id) => Ok(AuthUser(user_id)),
            Err(e) => Err(unauthorized(&e)),
        }
    }
}

fn unauthorized(message: &str) -> (StatusCode, Json<ErrorBody>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorBody::new(format!("Unauthorized: {}", message))),
    )
}
