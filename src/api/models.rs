use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::models::{LeveragePosition, Order};

/// 실패 응답 봉투: {"success": false, "error": "..."}
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

/// 가입 요청
#[derive(Debug, Deserialize)]
pub struct RegistrationRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

/// 로그인 요청
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// 현물 주문 요청
///
/// side/type은 잘못된 값에 400을 주기 위해 문자열로 받아 핸들러에서 해석한다.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrderRequest {
    pub symbol: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub side: String,
    pub quantity: f64,
    pub limit_price: Option<f64>,
}

/// 레버리지 개설 요청
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenPositionRequest {
    pub symbol: String,
    pub side: String,
    pub leverage: i64,
    pub quantity: f64,
    pub order_type: String,
    pub limit_price: Option<f64>,
}

/// 목록 조회 공통 쿼리
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub symbol: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl ListQuery {
    /// limit은 1..=100으로 강제 (기본 20), offset은 음수 불가 (기본 0)
    pub fn normalized(&self) -> (i64, i64) {
        let limit = match self.limit {
            Some(limit) if (1..=100).contains(&limit) => limit,
            _ => 20,
        };
        let offset = self.offset.unwrap_or(0).max(0);
        (limit, offset)
    }
}

/// 봉차트 조회 쿼리
#[derive(Debug, Deserialize)]
pub struct KlinesQuery {
    pub symbol: Option<String>,
    pub interval: Option<String>,
    pub limit: Option<u32>,
}

/// WebSocket 사용자 이벤트 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WsMessageType {
    OrderExecuted,
    LimitOrderFilled,
    LeveragePositionOpened,
    LeveragePositionClosed,
    Error,
}

/// WebSocket 사용자 이벤트
///
/// 시세 프레임과 달리 서버가 만들어 특정 사용자에게만 보낸다.
#[derive(Debug, Serialize)]
pub struct WsMessage {
    #[serde(rename = "type")]
    pub message_type: WsMessageType,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
}

/// 시장가 체결 알림 데이터
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderExecutedData {
    order_id: i64,
    symbol: String,
    side: String,
    quantity: f64,
    price: f64,
    total_amount: f64,
    status: String,
}

/// 지정가 체결 알림 데이터
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LimitOrderFilledData {
    order_id: i64,
    symbol: String,
    side: String,
    limit_price: f64,
    executed_price: f64,
    quantity: f64,
    total_amount: f64,
    status: String,
}

/// 포지션 개설 알림 데이터
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PositionOpenedData {
    position_id: i64,
    symbol: String,
    side: String,
    leverage: i64,
    quantity: f64,
    entry_price: f64,
    margin: f64,
    liquidation_price: f64,
    status: String,
}

/// 포지션 종료 알림 데이터 (평청산/강제 청산 공용)
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PositionClosedData {
    position_id: i64,
    symbol: String,
    side: String,
    leverage: i64,
    entry_price: f64,
    exit_price: f64,
    quantity: f64,
    pnl: f64,
    pnl_percentage: f64,
    status: String,
}

impl WsMessage {
    fn new(message_type: WsMessageType, data: impl Serialize) -> Self {
        Self {
            message_type,
            timestamp: Utc::now(),
            data: serde_json::to_value(data).unwrap_or(Value::Null),
        }
    }

    /// 시장가 체결 알림
    pub fn order_executed(order: &Order) -> Self {
        Self::new(
            WsMessageType::OrderExecuted,
            OrderExecutedData {
                order_id: order.id,
                symbol: order.symbol.clone(),
                side: order.side.to_string(),
                quantity: order.quantity,
                price: order.price,
                total_amount: order.total_amount,
                status: format!("{:?}", order.status).to_uppercase(),
            },
        )
    }

    /// 지정가 체결 알림
    pub fn limit_order_filled(order: &Order) -> Self {
        Self::new(
            WsMessageType::LimitOrderFilled,
            LimitOrderFilledData {
                order_id: order.id,
                symbol: order.symbol.clone(),
                side: order.side.to_string(),
                limit_price: order.limit_price.unwrap_or(0.0),
                executed_price: order.price,
                quantity: order.quantity,
                total_amount: order.total_amount,
                status: format!("{:?}", order.status).to_uppercase(),
            },
        )
    }

    /// 포지션 개설 알림
    pub fn position_opened(position: &LeveragePosition) -> Self {
        Self::new(
            WsMessageType::LeveragePositionOpened,
            PositionOpenedData {
                position_id: position.id,
                symbol: position.symbol.clone(),
                side: position.side.to_string(),
                leverage: position.leverage,
                quantity: position.quantity,
                entry_price: position.entry_price,
                margin: position.margin,
                liquidation_price: position.liquidation_price,
                status: format!("{:?}", position.status).to_uppercase(),
            },
        )
    }

    /// 포지션 종료 알림 (status로 평청산/강제 청산을 구분)
    pub fn position_closed(position: &LeveragePosition) -> Self {
        let pnl_percentage = if position.margin != 0.0 {
            (position.realized_pnl / position.margin) * 100.0
        } else {
            0.0
        };

        Self::new(
            WsMessageType::LeveragePositionClosed,
            PositionClosedData {
                position_id: position.id,
                symbol: position.symbol.clone(),
                side: position.side.to_string(),
                leverage: position.leverage,
                entry_price: position.entry_price,
                exit_price: position.exit_price.unwrap_or(0.0),
                quantity: position.quantity,
                pnl: position.realized_pnl,
                pnl_percentage,
                status: format!("{:?}", position.status).to_uppercase(),
            },
        )
    }

    /// NDJSON 스트림에 실을 직렬화 문자열
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_message_serialization() {
        let message = WsMessage::new(
            WsMessageType::Error,
            serde_json::json!({"message": "boom"}),
        );
        let json = message.to_json();

        let parsed: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed["type"], "ERROR");
        assert_eq!(parsed["data"]["message"], "boom");
        // RFC3339 타임스탬프
        assert!(parsed["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_list_query_normalization() {
        let query = ListQuery {
            symbol: None,
            limit: Some(500),
            offset: Some(-3),
        };
        assert_eq!(query.normalized(), (20, 0));

        let query = ListQuery {
            symbol: None,
            limit: Some(50),
            offset: Some(10),
        };
        assert_eq!(query.normalized(), (50, 10));

        let query = ListQuery {
            symbol: None,
            limit: None,
            offset: None,
        };
        assert_eq!(query.normalized(), (20, 0));
    }
}
