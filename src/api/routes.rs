use axum::{
    routing::{get, post},
    Router,
};

use crate::api::handlers::*;
use crate::api::websocket::websocket_handler;
use crate::server::ServerState;

/// API 라우터 생성
pub fn create_api_router() -> Router<ServerState> {
    Router::new()
        // 인증 API
        .route("/auth/registration", post(register))
        .route("/auth/login", post(login))
        // 시장 데이터 API
        .route("/market/klines", get(get_klines))
        // 현물 거래 API
        .route("/trading/order", post(place_order))
        .route("/trading/order/:id/cancel", post(cancel_order))
        .route("/trading/orders", get(get_orders))
        .route("/trading/transactions", get(get_transactions))
        .route("/trading/wallets", get(get_wallets))
        .route("/trading/prices", get(get_prices))
        // 레버리지 API
        .route("/leverage/position/open", post(open_position))
        .route("/leverage/position/:id/close", post(close_position))
        .route("/leverage/position/:id", get(get_position_detail))
        .route("/leverage/positions/open", get(get_open_positions))
        .route("/leverage/positions/history", get(get_position_history))
        // WebSocket
        .route("/ws", get(websocket_handler))
}
