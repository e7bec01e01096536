use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde_json::{json, Value};

use crate::api::models::{
    ErrorBody, KlinesQuery, ListQuery, LoginRequest, OpenPositionRequest, PlaceOrderRequest,
    RegistrationRequest,
};
use crate::auth::{self, AuthUser};
use crate::db::models::{OrderSide, PositionSide, PositionStatus};
use crate::db::repository::{
    OrderRepository, PositionRepository, TransactionRepository, WalletRepository,
};
use crate::market::klines;
use crate::server::ServerState;

type ApiError = (StatusCode, Json<ErrorBody>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(ErrorBody::new(message)))
}

/// 가입 핸들러
pub async fn register(
    State(state): State<ServerState>,
    Json(payload): Json<RegistrationRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if payload.name.is_empty() || payload.email.is_empty() || payload.password.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "name, email and password are required",
        ));
    }

    if !payload.email.contains('@') {
        return Err(api_error(StatusCode::BAD_REQUEST, "invalid email"));
    }

    match auth::registration(&state.db_pool, &payload.name, &payload.email, &payload.password).await
    {
        Ok(user_id) => Ok((
            StatusCode::CREATED,
            Json(json!({ "success": true, "id": user_id })),
        )),
        Err(e) if e == "user already registered" => Err(api_error(StatusCode::CONFLICT, e)),
        Err(e) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e)),
    }
}

/// 로그인 핸들러
pub async fn login(
    State(state): State<ServerState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<Value>, ApiError> {
    if payload.email.is_empty() || payload.password.is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "email and password are required",
        ));
    }

    match auth::login(&state.db_pool, &payload.email, &payload.password).await {
        Ok((token, expired_at)) => Ok(Json(json!({
            "success": true,
            "token": token,
            "expiredAt": expired_at,
        }))),
        Err(e) if e == "invalid email or password" => Err(api_error(StatusCode::UNAUTHORIZED, e)),
        Err(e) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e)),
    }
}

/// 봉차트 패스스루 핸들러
pub async fn get_klines(
    State(state): State<ServerState>,
    Query(query): Query<KlinesQuery>,
) -> Result<Json<Value>, ApiError> {
    let symbol = query.symbol.unwrap_or_else(|| "BTCUSDT".to_string());
    let interval = query.interval.unwrap_or_else(|| "1m".to_string());
    let limit = query.limit.unwrap_or(1000);

    match klines::fetch_klines(&state.config.upstream_rest_url, &symbol, &interval, limit).await {
        Ok(data) => Ok(Json(json!({ "success": true, "data": data }))),
        Err(e) => Err(api_error(StatusCode::BAD_GATEWAY, e)),
    }
}

/// 주문 접수 핸들러 (시장가/지정가)
pub async fn place_order(
    State(state): State<ServerState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<PlaceOrderRequest>,
) -> Result<Json<Value>, ApiError> {
    if payload.quantity <= 0.0 {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Quantity must be positive",
        ));
    }

    let side = match payload.side.as_str() {
        "BUY" => OrderSide::Buy,
        "SELL" => OrderSide::Sell,
        _ => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "Invalid side, must be BUY or SELL",
            ))
        }
    };

    let order = match payload.order_type.as_str() {
        "MARKET" => {
            state
                .trading
                .place_market_order(user_id, &payload.symbol, side, payload.quantity)
                .await
        }
        "LIMIT" => {
            let limit_price = match payload.limit_price {
                Some(price) if price > 0.0 => price,
                _ => {
                    return Err(api_error(
                        StatusCode::BAD_REQUEST,
                        "Limit price is required and must be positive for limit orders",
                    ))
                }
            };
            state
                .trading
                .place_limit_order(user_id, &payload.symbol, side, payload.quantity, limit_price)
                .await
        }
        _ => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "Invalid order type, must be MARKET or LIMIT",
            ))
        }
    };

    match order {
        Ok(order) => Ok(Json(json!({
            "success": true,
            "message": "Order placed successfully",
            "order": order,
        }))),
        Err(e) => Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("Failed to place order: {}", e),
        )),
    }
}

/// 주문 취소 핸들러
pub async fn cancel_order(
    State(state): State<ServerState>,
    AuthUser(user_id): AuthUser,
    Path(order_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    match state.trading.cancel_order(user_id, order_id).await {
        Ok(()) => Ok(Json(json!({
            "success": true,
            "message": "Order canceled successfully",
        }))),
        Err(e) if e == "order not found" => Err(api_error(StatusCode::NOT_FOUND, e)),
        Err(e) if e == "unauthorized: order does not belong to user" => {
            Err(api_error(StatusCode::FORBIDDEN, e))
        }
        Err(e) if e == "order cannot be canceled" => Err(api_error(StatusCode::BAD_REQUEST, e)),
        Err(e) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e)),
    }
}

/// 주문 이력 조회 핸들러
pub async fn get_orders(
    State(state): State<ServerState>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let (limit, offset) = query.normalized();

    let orders = match &query.symbol {
        Some(symbol) => {
            OrderRepository::find_by_user_and_symbol(&state.db_pool, user_id, symbol, limit, offset)
                .await
        }
        None => OrderRepository::find_by_user(&state.db_pool, user_id, limit, offset).await,
    }
    .map_err(|e| {
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to get orders: {}", e),
        )
    })?;

    Ok(Json(json!({
        "success": true,
        "orders": orders,
        "count": orders.len(),
    })))
}

/// 원장 조회 핸들러
pub async fn get_transactions(
    State(state): State<ServerState>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let (limit, offset) = query.normalized();

    let transactions = match &query.symbol {
        Some(symbol) => {
            TransactionRepository::find_by_user_and_symbol(
                &state.db_pool,
                user_id,
                symbol,
                limit,
                offset,
            )
            .await
        }
        None => TransactionRepository::find_by_user(&state.db_pool, user_id, limit, offset).await,
    }
    .map_err(|e| {
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to get transactions: {}", e),
        )
    })?;

    Ok(Json(json!({
        "success": true,
        "transactions": transactions,
        "count": transactions.len(),
    })))
}

/// 지갑 조회 핸들러. 지갑이 없으면 기본 지갑을 초기화한다.
pub async fn get_wallets(
    State(state): State<ServerState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Value>, ApiError> {
    let mut wallets = WalletRepository::find_all_by_user(&state.db_pool, user_id)
        .await
        .map_err(|e| {
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to get wallets: {}", e),
            )
        })?;

    if wallets.is_empty() {
        WalletRepository::init_default_wallets(&state.db_pool, user_id)
            .await
            .map_err(|e| {
                api_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    format!("Failed to initialize wallets: {}", e),
                )
            })?;

        wallets = WalletRepository::find_all_by_user(&state.db_pool, user_id)
            .await
            .unwrap_or_default();
    }

    Ok(Json(json!({ "success": true, "wallets": wallets })))
}

/// 현재가 조회 핸들러
pub async fn get_prices(State(state): State<ServerState>) -> Json<Value> {
    let prices = state.price_cache.snapshot().await;

    Json(json!({ "success": true, "prices": prices }))
}

/// 레버리지 개설 핸들러
pub async fn open_position(
    State(state): State<ServerState>,
    AuthUser(user_id): AuthUser,
    Json(payload): Json<OpenPositionRequest>,
) -> Result<Json<Value>, ApiError> {
    if payload.quantity <= 0.0 {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Quantity must be positive",
        ));
    }

    if !(1..=10).contains(&payload.leverage) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Leverage must be between 1 and 10",
        ));
    }

    let side = match payload.side.as_str() {
        "LONG" => PositionSide::Long,
        "SHORT" => PositionSide::Short,
        _ => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "Side must be LONG or SHORT",
            ))
        }
    };

    let position = match payload.order_type.as_str() {
        "MARKET" => {
            state
                .leverage
                .open_market(user_id, &payload.symbol, side, payload.leverage, payload.quantity)
                .await
        }
        "LIMIT" => {
            let limit_price = match payload.limit_price {
                Some(price) if price > 0.0 => price,
                Some(_) => {
                    return Err(api_error(
                        StatusCode::BAD_REQUEST,
                        "LimitPrice must be positive",
                    ))
                }
                None => {
                    return Err(api_error(
                        StatusCode::BAD_REQUEST,
                        "LimitPrice is required for limit orders",
                    ))
                }
            };
            state
                .leverage
                .open_limit(
                    user_id,
                    &payload.symbol,
                    side,
                    payload.leverage,
                    payload.quantity,
                    limit_price,
                )
                .await
        }
        _ => {
            return Err(api_error(
                StatusCode::BAD_REQUEST,
                "OrderType must be MARKET or LIMIT",
            ))
        }
    };

    match position {
        Ok(position) => Ok(Json(json!({
            "success": true,
            "message": "Position opened successfully",
            // 지정가 개설이면 id 0인 미리보기 스냅샷이다 (체결 시 저장)
            "position": position,
        }))),
        Err(e) => Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("Failed to open position: {}", e),
        )),
    }
}

/// 평청산 핸들러
pub async fn close_position(
    State(state): State<ServerState>,
    AuthUser(user_id): AuthUser,
    Path(position_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    match state.leverage.close_position(user_id, position_id).await {
        Ok(position) => Ok(Json(json!({
            "success": true,
            "message": "Position closed successfully",
            "position": position,
        }))),
        Err(e) if e == "position not found" => Err(api_error(StatusCode::NOT_FOUND, e)),
        Err(e) if e == "unauthorized: position does not belong to user" => {
            Err(api_error(StatusCode::FORBIDDEN, e))
        }
        Err(e) if e == "position is not open" => Err(api_error(StatusCode::BAD_REQUEST, e)),
        Err(e) => Err(api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to close position: {}", e),
        )),
    }
}

/// 보유 포지션 조회 핸들러. 응답 전에 미실현 손익을 현재가로 갱신한다.
pub async fn get_open_positions(
    State(state): State<ServerState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<Value>, ApiError> {
    let mut positions = PositionRepository::open_by_user(&state.db_pool, user_id)
        .await
        .map_err(|e| {
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to get positions: {}", e),
            )
        })?;

    for position in &mut positions {
        if let Some(current_price) = state.price_cache.get(&position.symbol).await {
            position.unrealized_pnl = position.calculate_unrealized_pnl(current_price);
        }
    }

    Ok(Json(json!({
        "success": true,
        "positions": positions,
        "count": positions.len(),
    })))
}

/// 포지션 이력 조회 핸들러 (종료분 포함)
pub async fn get_position_history(
    State(state): State<ServerState>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<Value>, ApiError> {
    let (limit, offset) = query.normalized();

    let positions = match &query.symbol {
        Some(symbol) => {
            PositionRepository::find_by_user_and_symbol(
                &state.db_pool,
                user_id,
                symbol,
                limit,
                offset,
            )
            .await
        }
        None => PositionRepository::find_by_user(&state.db_pool, user_id, limit, offset).await,
    }
    .map_err(|e| {
        api_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to get positions: {}", e),
        )
    })?;

    Ok(Json(json!({
        "success": true,
        "positions": positions,
        "count": positions.len(),
    })))
}

/// 포지션 상세 조회 핸들러
pub async fn get_position_detail(
    State(state): State<ServerState>,
    AuthUser(user_id): AuthUser,
    Path(position_id): Path<i64>,
) -> Result<Json<Value>, ApiError> {
    let mut position = PositionRepository::find_by_id(&state.db_pool, position_id)
        .await
        .map_err(|e| {
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to get position: {}", e),
            )
        })?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, "Position not found"))?;

    if position.user_id != user_id {
        return Err(api_error(
            StatusCode::FORBIDDEN,
            "Unauthorized: position does not belong to user",
        ));
    }

    if position.status == PositionStatus::Open {
        if let Some(current_price) = state.price_cache.get(&position.symbol).await {
            position.unrealized_pnl = position.calculate_unrealized_pnl(current_price);
        }
    }

    Ok(Json(json!({ "success": true, "position": position })))
}
