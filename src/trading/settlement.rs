//! 체결 정산 엔진
//!
//! 시장가 주문, 지정가 체결, 레버리지 체결이 공유하는 단일 정산
//! 트랜잭션. 거래로 인한 지갑 변경은 전부 여기서만 일어나고,
//! 실패하면 원자적으로 롤백한 뒤 주문을 FAILED로 남긴다.
//! 알림은 커밋이 끝난 뒤에만 내보낸다.

use log::{error, info};
use sqlx::{SqliteConnection, SqlitePool};

use crate::api::models::WsMessage;
use crate::db::models::{
    calculate_liquidation_price, calculate_required_margin, parse_symbol, LeveragePosition, Order,
    OrderSide, OrderStatus, OrderType, TransactionType,
};
use crate::db::repository::{
    OrderRepository, PositionRepository, TransactionRepository, WalletRepository,
};
use crate::hub::HubHandle;

/// 취소 경합 등으로 주문이 이미 종결 상태일 때의 중단 신호.
/// 이 오류는 부수효과 없이 중단했다는 뜻이므로 FAILED 전이를 하지 않는다.
pub const ERR_ORDER_NOT_PENDING: &str = "order is not pending";

/// 정산 엔진
pub struct SettlementEngine {
    pool: SqlitePool,
    hub: HubHandle,
}

impl SettlementEngine {
    pub fn new(pool: SqlitePool, hub: HubHandle) -> Self {
        Self { pool, hub }
    }

    /// 주문을 execution_price로 정산한다.
    ///
    /// 성공하면 갱신된 주문을 돌려주고 소유 사용자에게 알림을 보낸다.
    /// 실패하면 롤백 후 주문을 FAILED로 전이하고 오류 문자열을 기록한다.
    pub async fn settle_fill(&self, order_id: i64, execution_price: f64) -> Result<Order, String> {
        match self.execute_fill(order_id, execution_price).await {
            Ok((order, position)) => {
                info!(
                    "주문 #{} 체결 완료: {} {} {:.8} @ {:.2}, 총액 {:.2}",
                    order.id, order.side, order.symbol, order.quantity, order.price, order.total_amount
                );
                self.notify_fill(&order, position.as_ref());
                Ok(order)
            }
            Err(e) => {
                if e != ERR_ORDER_NOT_PENDING {
                    if let Err(mark_err) =
                        OrderRepository::mark_failed(&self.pool, order_id, &e).await
                    {
                        error!("주문 #{} FAILED 기록 실패: {}", order_id, mark_err);
                    }
                }
                Err(e)
            }
        }
    }

    /// 정산 트랜잭션 본체
    async fn execute_fill(
        &self,
        order_id: i64,
        execution_price: f64,
    ) -> Result<(Order, Option<LeveragePosition>), String> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| format!("failed to start transaction: {}", e))?;

        let order = OrderRepository::fetch(&mut tx, order_id)
            .await
            .map_err(|e| format!("failed to read order: {}", e))?
            .ok_or_else(|| "order not found".to_string())?;

        // 취소나 중복 정산과의 경합은 여기서 걸러진다
        if order.status != OrderStatus::Pending {
            return Err(ERR_ORDER_NOT_PENDING.to_string());
        }

        let (base, quote) = parse_symbol(&order.symbol)?;

        let (total_amount, position) = if order.is_leverage {
            let (total, position) = self.fill_leverage(&mut tx, &order, base, quote).await?;
            (total, Some(position))
        } else {
            let total = match order.side {
                OrderSide::Buy => {
                    self.fill_spot_buy(&mut tx, &order, base, quote, execution_price)
                        .await?
                }
                OrderSide::Sell => {
                    self.fill_spot_sell(&mut tx, &order, base, quote, execution_price)
                        .await?
                }
            };
            (total, None)
        };

        OrderRepository::complete(&mut tx, order.id, execution_price, total_amount)
            .await
            .map_err(|e| format!("failed to update order: {}", e))?;

        tx.commit()
            .await
            .map_err(|e| format!("failed to commit transaction: {}", e))?;

        let order = OrderRepository::find_by_id(&self.pool, order_id)
            .await
            .map_err(|e| format!("failed to read order: {}", e))?
            .ok_or_else(|| "order not found".to_string())?;

        Ok((order, position))
    }

    /// 현물 매수: USDT 차감, base 자산 가산, 원장 2건
    async fn fill_spot_buy(
        &self,
        conn: &mut SqliteConnection,
        order: &Order,
        base: &str,
        quote: &str,
        price: f64,
    ) -> Result<f64, String> {
        let required = order.quantity * price;

        let quote_wallet = WalletRepository::fetch(conn, order.user_id, quote)
            .await
            .map_err(|e| format!("failed to get {} wallet: {}", quote, e))?
            .ok_or_else(|| format!("{} wallet not found", quote))?;

        if quote_wallet.available_balance() < required {
            return Err("insufficient USDT balance".to_string());
        }

        let base_wallet = WalletRepository::fetch_or_create(conn, order.user_id, base)
            .await
            .map_err(|e| format!("failed to get {} wallet: {}", base, e))?;

        WalletRepository::update_balances(
            conn,
            quote_wallet.id,
            quote_wallet.balance - required,
            quote_wallet.locked,
        )
        .await
        .map_err(|e| format!("failed to update {} balance: {}", quote, e))?;

        WalletRepository::update_balances(
            conn,
            base_wallet.id,
            base_wallet.balance + order.quantity,
            base_wallet.locked,
        )
        .await
        .map_err(|e| format!("failed to update {} balance: {}", base, e))?;

        TransactionRepository::insert(
            conn,
            order.user_id,
            Some(order.id),
            TransactionType::Buy,
            quote,
            -required,
            quote_wallet.balance,
            quote_wallet.balance - required,
            &format!("Buy {} with {} at price {:.2}", base, quote, price),
        )
        .await
        .map_err(|e| format!("failed to create transaction: {}", e))?;

        TransactionRepository::insert(
            conn,
            order.user_id,
            Some(order.id),
            TransactionType::Buy,
            base,
            order.quantity,
            base_wallet.balance,
            base_wallet.balance + order.quantity,
            &format!("Bought {:.8} {} at price {:.2}", order.quantity, base, price),
        )
        .await
        .map_err(|e| format!("failed to create transaction: {}", e))?;

        Ok(required)
    }

    /// 현물 매도: base 자산 차감, USDT 가산, 원장 2건
    async fn fill_spot_sell(
        &self,
        conn: &mut SqliteConnection,
        order: &Order,
        base: &str,
        quote: &str,
        price: f64,
    ) -> Result<f64, String> {
        let base_wallet = WalletRepository::fetch(conn, order.user_id, base)
            .await
            .map_err(|e| format!("failed to get {} wallet: {}", base, e))?
            .ok_or_else(|| format!("{} wallet not found", base))?;

        if base_wallet.available_balance() < order.quantity {
            return Err(format!("insufficient {} balance", base));
        }

        let total_amount = order.quantity * price;

        let quote_wallet = WalletRepository::fetch_or_create(conn, order.user_id, quote)
            .await
            .map_err(|e| format!("failed to get {} wallet: {}", quote, e))?;

        WalletRepository::update_balances(
            conn,
            base_wallet.id,
            base_wallet.balance - order.quantity,
            base_wallet.locked,
        )
        .await
        .map_err(|e| format!("failed to update {} balance: {}", base, e))?;

        WalletRepository::update_balances(
            conn,
            quote_wallet.id,
            quote_wallet.balance + total_amount,
            quote_wallet.locked,
        )
        .await
        .map_err(|e| format!("failed to update {} balance: {}", quote, e))?;

        TransactionRepository::insert(
            conn,
            order.user_id,
            Some(order.id),
            TransactionType::Sell,
            base,
            -order.quantity,
            base_wallet.balance,
            base_wallet.balance - order.quantity,
            &format!("Sell {} for {} at price {:.2}", base, quote, price),
        )
        .await
        .map_err(|e| format!("failed to create transaction: {}", e))?;

        TransactionRepository::insert(
            conn,
            order.user_id,
            Some(order.id),
            TransactionType::Sell,
            quote,
            total_amount,
            quote_wallet.balance,
            quote_wallet.balance + total_amount,
            &format!("Sold {:.8} {} at price {:.2}", order.quantity, base, price),
        )
        .await
        .map_err(|e| format!("failed to create transaction: {}", e))?;

        Ok(total_amount)
    }

    /// 레버리지 지정가 체결
    ///
    /// 명목가 전체를 옮기지 않는다. base 지갑을 수량만큼 움직이고
    /// (매도형은 quote도 가산), 마지막에 보증금을 차감·잠금하면서
    /// 포지션을 생성한다. 진입가는 지정가다.
    async fn fill_leverage(
        &self,
        conn: &mut SqliteConnection,
        order: &Order,
        base: &str,
        quote: &str,
    ) -> Result<(f64, LeveragePosition), String> {
        let limit_price = order
            .limit_price
            .ok_or_else(|| "limit price is required for leverage orders".to_string())?;
        let position_side = order
            .position_side
            .ok_or_else(|| "position side is required for leverage orders".to_string())?;

        let notional = order.quantity * limit_price;

        match order.side {
            OrderSide::Buy => {
                let base_wallet = WalletRepository::fetch_or_create(conn, order.user_id, base)
                    .await
                    .map_err(|e| format!("failed to get {} wallet: {}", base, e))?;

                WalletRepository::update_balances(
                    conn,
                    base_wallet.id,
                    base_wallet.balance + order.quantity,
                    base_wallet.locked,
                )
                .await
                .map_err(|e| format!("failed to update {} balance: {}", base, e))?;

                TransactionRepository::insert(
                    conn,
                    order.user_id,
                    Some(order.id),
                    TransactionType::Buy,
                    base,
                    order.quantity,
                    base_wallet.balance,
                    base_wallet.balance + order.quantity,
                    &format!(
                        "Leverage buy {:.8} {} at price {:.2}",
                        order.quantity, base, limit_price
                    ),
                )
                .await
                .map_err(|e| format!("failed to create transaction: {}", e))?;
            }
            OrderSide::Sell => {
                let base_wallet = WalletRepository::fetch(conn, order.user_id, base)
                    .await
                    .map_err(|e| format!("failed to get {} wallet: {}", base, e))?
                    .ok_or_else(|| format!("{} wallet not found", base))?;

                if base_wallet.available_balance() < order.quantity {
                    return Err("insufficient coin balance".to_string());
                }

                WalletRepository::update_balances(
                    conn,
                    base_wallet.id,
                    base_wallet.balance - order.quantity,
                    base_wallet.locked,
                )
                .await
                .map_err(|e| format!("failed to update {} balance: {}", base, e))?;

                TransactionRepository::insert(
                    conn,
                    order.user_id,
                    Some(order.id),
                    TransactionType::Sell,
                    base,
                    -order.quantity,
                    base_wallet.balance,
                    base_wallet.balance - order.quantity,
                    &format!(
                        "Leverage sell {:.8} {} at price {:.2}",
                        order.quantity, base, limit_price
                    ),
                )
                .await
                .map_err(|e| format!("failed to create transaction: {}", e))?;

                let quote_wallet = WalletRepository::fetch(conn, order.user_id, quote)
                    .await
                    .map_err(|e| format!("failed to get {} wallet: {}", quote, e))?
                    .ok_or_else(|| format!("{} wallet not found", quote))?;

                WalletRepository::update_balances(
                    conn,
                    quote_wallet.id,
                    quote_wallet.balance + notional,
                    quote_wallet.locked,
                )
                .await
                .map_err(|e| format!("failed to update {} balance: {}", quote, e))?;

                TransactionRepository::insert(
                    conn,
                    order.user_id,
                    Some(order.id),
                    TransactionType::Sell,
                    quote,
                    notional,
                    quote_wallet.balance,
                    quote_wallet.balance + notional,
                    &format!(
                        "Sold {:.8} {} at price {:.2}",
                        order.quantity, base, limit_price
                    ),
                )
                .await
                .map_err(|e| format!("failed to create transaction: {}", e))?;
            }
        }

        // 보증금 차감 + 잠금. 위 단계의 변경을 반영하려고 다시 읽는다.
        let margin = calculate_required_margin(limit_price, order.quantity, order.leverage);

        let usdt_wallet = WalletRepository::fetch(conn, order.user_id, quote)
            .await
            .map_err(|e| format!("failed to get {} wallet: {}", quote, e))?
            .ok_or_else(|| "USDT wallet not found".to_string())?;

        if usdt_wallet.available_balance() < margin {
            return Err("insufficient USDT balance".to_string());
        }

        WalletRepository::update_balances(
            conn,
            usdt_wallet.id,
            usdt_wallet.balance - margin,
            usdt_wallet.locked + margin,
        )
        .await
        .map_err(|e| format!("failed to update {} balance: {}", quote, e))?;

        let liquidation_price =
            calculate_liquidation_price(limit_price, position_side, order.leverage);

        let position_id = PositionRepository::insert(
            conn,
            order.user_id,
            Some(order.id),
            &order.symbol,
            position_side,
            order.leverage,
            limit_price,
            order.quantity,
            margin,
            liquidation_price,
        )
        .await
        .map_err(|e| format!("failed to create position: {}", e))?;

        TransactionRepository::insert(
            conn,
            order.user_id,
            Some(order.id),
            TransactionType::MarginDeposit,
            quote,
            -margin,
            usdt_wallet.balance,
            usdt_wallet.balance - margin,
            &format!(
                "Open {} position #{} with {}x leverage (Limit Order)",
                position_side, position_id, order.leverage
            ),
        )
        .await
        .map_err(|e| format!("failed to create transaction: {}", e))?;

        let position = PositionRepository::fetch(conn, position_id)
            .await
            .map_err(|e| format!("failed to read position: {}", e))?
            .ok_or_else(|| "position not found".to_string())?;

        info!(
            "레버리지 포지션 #{} 생성: user={}, {} {} {}x, 진입가 {:.2}, 보증금 {:.2}",
            position_id, order.user_id, position_side, order.symbol, order.leverage, limit_price, margin
        );

        Ok((notional, position))
    }

    /// 커밋 후 알림. 실패해도 정산 결과에는 영향이 없다.
    fn notify_fill(&self, order: &Order, position: Option<&LeveragePosition>) {
        let message = match order.order_type {
            OrderType::Market => WsMessage::order_executed(order),
            OrderType::Limit => WsMessage::limit_order_filled(order),
        };
        self.hub.broadcast_to_user(order.user_id, message.to_json());

        if let Some(position) = position {
            let message = WsMessage::position_opened(position);
            self.hub.broadcast_to_user(order.user_id, message.to_json());
        }
    }
}
