use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// 매수 또는 매도
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// 주문 유형
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    /// 시장가 주문
    Market,
    /// 지정가 주문
    Limit,
}

/// 주문 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// 대기 중 (지정가 주문이 체결을 기다림)
    Pending,
    /// 체결 완료
    Completed,
    /// 실패
    Failed,
    /// 취소됨
    Canceled,
}

/// 포지션 방향
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionSide {
    /// 롱 (상승 베팅)
    Long,
    /// 숏 (하락 베팅)
    Short,
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// 포지션 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    /// 보유 중
    Open,
    /// 평청산 (사용자 청산)
    Closed,
    /// 강제 청산
    Liquidated,
}

/// 원장 기록 유형
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    Buy,
    Sell,
    Deposit,
    Withdraw,
    MarginDeposit,
    MarginWithdraw,
    Liquidation,
}

/// 사용자
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 지갑 — 사용자 × 자산별 1행
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub id: i64,
    #[serde(skip_serializing)]
    pub user_id: i64,
    /// 자산 코드: USDT, BTC, ETH, SOL
    pub symbol: String,
    pub balance: f64,
    /// 미체결 의무에 잡혀 있는 금액
    pub locked: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// 가용 잔고 = 잔고 - 잠금
    pub fn available_balance(&self) -> f64 {
        self.balance - self.locked
    }
}

/// 주문
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: i64,
    #[serde(skip_serializing)]
    pub user_id: i64,
    pub symbol: String,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub order_type: OrderType,
    pub side: OrderSide,
    /// 기초 자산 수량
    pub quantity: f64,
    /// 지정가 (지정가 주문에서만 사용)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_price: Option<f64>,
    /// 체결 가격
    pub price: f64,
    /// 체결 총액 (quote 기준)
    pub total_amount: f64,
    pub is_leverage: bool,
    pub leverage: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_side: Option<PositionSide>,
    pub status: OrderStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 레버리지 포지션
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct LeveragePosition {
    pub id: i64,
    #[serde(skip_serializing)]
    pub user_id: i64,
    /// 개설 주문 (지정가 개설일 때만 존재)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<i64>,
    pub symbol: String,
    pub side: PositionSide,
    pub leverage: i64,
    pub entry_price: f64,
    pub quantity: f64,
    /// 보증금 (USDT)
    pub margin: f64,
    pub liquidation_price: f64,
    pub unrealized_pnl: f64,
    pub realized_pnl: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_price: Option<f64>,
    pub status: PositionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
}

impl LeveragePosition {
    /// 미실현 손익 계산
    ///
    /// 롱: (현재가 - 진입가) × 수량, 숏: (진입가 - 현재가) × 수량
    pub fn calculate_unrealized_pnl(&self, current_price: f64) -> f64 {
        match self.side {
            PositionSide::Long => (current_price - self.entry_price) * self.quantity,
            PositionSide::Short => (self.entry_price - current_price) * self.quantity,
        }
    }

    /// 청산 조건 검사
    pub fn is_liquidated(&self, current_price: f64) -> bool {
        match self.side {
            PositionSide::Long => current_price <= self.liquidation_price,
            PositionSide::Short => current_price >= self.liquidation_price,
        }
    }
}

/// 청산 가격 계산
///
/// 유지 보증금율 90%를 기준으로 10% 버퍼를 남긴다.
/// 롱: 진입가 × (1 - 0.9/레버리지), 숏: 진입가 × (1 + 0.9/레버리지)
pub fn calculate_liquidation_price(entry_price: f64, side: PositionSide, leverage: i64) -> f64 {
    let liquidation_ratio = 0.9 / leverage as f64;
    match side {
        PositionSide::Long => entry_price * (1.0 - liquidation_ratio),
        PositionSide::Short => entry_price * (1.0 + liquidation_ratio),
    }
}

/// 필요 보증금 계산: (진입가 × 수량) / 레버리지
pub fn calculate_required_margin(entry_price: f64, quantity: f64, leverage: i64) -> f64 {
    (entry_price * quantity) / leverage as f64
}

/// 원장 기록
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: i64,
    #[serde(skip_serializing)]
    pub user_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<i64>,
    #[serde(rename = "type")]
    #[sqlx(rename = "type")]
    pub tx_type: TransactionType,
    /// 자산 코드
    pub symbol: String,
    /// 증감액 (양수 = 증가, 음수 = 감소)
    pub amount: f64,
    pub balance_before: f64,
    pub balance_after: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// 지원 거래쌍을 (base, quote)로 분해
///
/// 예: BTCUSDT -> (BTC, USDT). 그 외 심볼은 경계에서 거부된다.
pub fn parse_symbol(symbol: &str) -> Result<(&'static str, &'static str), String> {
    match symbol {
        "BTCUSDT" => Ok(("BTC", "USDT")),
        "ETHUSDT" => Ok(("ETH", "USDT")),
        "SOLUSDT" => Ok(("SOL", "USDT")),
        _ => Err("invalid trading symbol".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_position(side: PositionSide, entry: f64, quantity: f64, leverage: i64) -> LeveragePosition {
        let now = Utc::now();
        LeveragePosition {
            id: 1,
            user_id: 1,
            order_id: None,
            symbol: "BTCUSDT".to_string(),
            side,
            leverage,
            entry_price: entry,
            quantity,
            margin: calculate_required_margin(entry, quantity, leverage),
            liquidation_price: calculate_liquidation_price(entry, side, leverage),
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            exit_price: None,
            status: PositionStatus::Open,
            created_at: now,
            updated_at: now,
            closed_at: None,
        }
    }

    #[test]
    fn test_parse_symbol() {
        assert_eq!(parse_symbol("BTCUSDT").unwrap(), ("BTC", "USDT"));
        assert_eq!(parse_symbol("ETHUSDT").unwrap(), ("ETH", "USDT"));
        assert_eq!(parse_symbol("SOLUSDT").unwrap(), ("SOL", "USDT"));
        assert!(parse_symbol("DOGEUSDT").is_err());
        assert!(parse_symbol("btcusdt").is_err());
        assert!(parse_symbol("").is_err());
    }

    #[test]
    fn test_liquidation_price() {
        // 롱 10배: 50000 * (1 - 0.09) = 45500
        let price = calculate_liquidation_price(50000.0, PositionSide::Long, 10);
        assert!((price - 45500.0).abs() < 1e-9);

        // 숏 5배: 200 * (1 + 0.18) = 236
        let price = calculate_liquidation_price(200.0, PositionSide::Short, 5);
        assert!((price - 236.0).abs() < 1e-9);
    }

    #[test]
    fn test_required_margin() {
        // 50000 * 0.1 / 10 = 500
        let margin = calculate_required_margin(50000.0, 0.1, 10);
        assert!((margin - 500.0).abs() < 1e-9);
    }

    #[test]
    fn test_unrealized_pnl() {
        let long = sample_position(PositionSide::Long, 50000.0, 0.1, 10);
        assert!((long.calculate_unrealized_pnl(51000.0) - 100.0).abs() < 1e-9);
        assert!((long.calculate_unrealized_pnl(49000.0) + 100.0).abs() < 1e-9);

        let short = sample_position(PositionSide::Short, 200.0, 10.0, 5);
        assert!((short.calculate_unrealized_pnl(180.0) - 200.0).abs() < 1e-9);
        assert!((short.calculate_unrealized_pnl(210.0) + 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_is_liquidated() {
        let long = sample_position(PositionSide::Long, 50000.0, 0.1, 10);
        assert!(!long.is_liquidated(45501.0));
        assert!(long.is_liquidated(long.liquidation_price));
        assert!(long.is_liquidated(45499.0));

        let short = sample_position(PositionSide::Short, 200.0, 10.0, 5);
        assert!(!short.is_liquidated(235.5));
        assert!(short.is_liquidated(short.liquidation_price));
        assert!(short.is_liquidated(236.5));
    }

    #[test]
    fn test_available_balance() {
        let now = Utc::now();
        let wallet = Wallet {
            id: 1,
            user_id: 1,
            symbol: "USDT".to_string(),
            balance: 1000.0,
            locked: 250.0,
            created_at: now,
            updated_at: now,
        };
        assert!((wallet.available_balance() - 750.0).abs() < 1e-9);
    }
}
