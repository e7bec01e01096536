//! 현물 주문 서비스
//!
//! 시장가/지정가 주문 접수와 취소 진입점.

use std::sync::Arc;

use log::info;
use sqlx::SqlitePool;

use crate::db::models::{parse_symbol, Order, OrderSide, OrderStatus, OrderType};
use crate::db::repository::OrderRepository;
use crate::market::price_cache::{PriceCache, MARKET_PRICE_MAX_AGE};
use crate::trading::matcher::LimitOrderMatcher;
use crate::trading::settlement::SettlementEngine;

/// 주문 서비스
pub struct TradingService {
    pool: SqlitePool,
    price_cache: Arc<PriceCache>,
    matcher: Arc<LimitOrderMatcher>,
    settlement: Arc<SettlementEngine>,
}

impl TradingService {
    pub fn new(
        pool: SqlitePool,
        price_cache: Arc<PriceCache>,
        matcher: Arc<LimitOrderMatcher>,
        settlement: Arc<SettlementEngine>,
    ) -> Self {
        Self {
            pool,
            price_cache,
            matcher,
            settlement,
        }
    }

    /// 시장가 주문. 신선한 현재가로 즉시 정산한다.
    pub async fn place_market_order(
        &self,
        user_id: i64,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
    ) -> Result<Order, String> {
        if quantity <= 0.0 {
            return Err("quantity must be positive".to_string());
        }

        parse_symbol(symbol)?;

        let price = self
            .price_cache
            .get_fresh(symbol, MARKET_PRICE_MAX_AGE)
            .await
            .map_err(|e| format!("failed to get market price: {}", e))?;

        let order = OrderRepository::create(
            &self.pool,
            user_id,
            symbol,
            OrderType::Market,
            side,
            quantity,
            None,
        )
        .await
        .map_err(|e| format!("failed to create order: {}", e))?;

        let order = self.settlement.settle_fill(order.id, price).await?;

        info!(
            "시장가 주문 완료: user={}, #{} {} {} {:.8} @ {:.2}",
            user_id, order.id, order.side, order.symbol, order.quantity, order.price
        );

        Ok(order)
    }

    /// 지정가 주문. 주문을 만들어 매처에 맡기고 바로 돌아온다.
    ///
    /// 즉시 체결 가능 여부를 여기서 검사하지 않는다. 실행 시점 판단을
    /// 매처 한 곳으로 모아야 동시 체결 경합이 없다.
    pub async fn place_limit_order(
        &self,
        user_id: i64,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        limit_price: f64,
    ) -> Result<Order, String> {
        if quantity <= 0.0 {
            return Err("quantity must be positive".to_string());
        }

        if limit_price <= 0.0 {
            return Err("limit price must be positive".to_string());
        }

        parse_symbol(symbol)?;

        let order = OrderRepository::create(
            &self.pool,
            user_id,
            symbol,
            OrderType::Limit,
            side,
            quantity,
            Some(limit_price),
        )
        .await
        .map_err(|e| format!("failed to create order: {}", e))?;

        let current_price = self.price_cache.get(symbol).await.unwrap_or(0.0);
        info!(
            "지정가 주문 #{} 접수: {} {} @ {:.2} (현재가 {:.2})",
            order.id, side, symbol, limit_price, current_price
        );

        self.matcher.add(order.clone()).await;

        Ok(order)
    }

    /// 주문 취소. PENDING 지정가 주문만 취소할 수 있다.
    ///
    /// 매처가 이미 정산을 시작했다면 정산 트랜잭션이 먼저 커밋되고
    /// 이 취소는 상태 검사에서 거부된다.
    pub async fn cancel_order(&self, user_id: i64, order_id: i64) -> Result<(), String> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| format!("failed to start transaction: {}", e))?;

        let order = OrderRepository::fetch(&mut tx, order_id)
            .await
            .map_err(|e| format!("failed to read order: {}", e))?
            .ok_or_else(|| "order not found".to_string())?;

        if order.user_id != user_id {
            return Err("unauthorized: order does not belong to user".to_string());
        }

        if order.status != OrderStatus::Pending {
            return Err("order cannot be canceled".to_string());
        }

        OrderRepository::cancel(&mut tx, order_id)
            .await
            .map_err(|e| format!("failed to cancel order: {}", e))?;

        tx.commit()
            .await
            .map_err(|e| format!("failed to commit transaction: {}", e))?;

        self.matcher.remove(order_id).await;

        info!("주문 #{} 취소: user={}", order_id, user_id);

        Ok(())
    }
}
