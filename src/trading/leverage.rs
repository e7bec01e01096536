//! 레버리지 포지션 엔진
//!
//! 개설/평청산 동기 진입점과 5초 주기의 강제 청산 감시,
//! 미실현 손익 새로고침을 담당한다. 청산 감시와 사용자 평청산이
//! 같은 포지션을 두고 경합하면 트랜잭션 안의 상태 검사가 패자를
//! 거부한다.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use sqlx::SqlitePool;
use tokio::time::interval;

use crate::api::models::WsMessage;
use crate::db::models::{
    calculate_liquidation_price, calculate_required_margin, parse_symbol, LeveragePosition,
    OrderSide, OrderType, PositionSide, PositionStatus, TransactionType,
};
use crate::db::repository::{
    OrderRepository, PositionRepository, TransactionRepository, WalletRepository,
};
use crate::hub::HubHandle;
use crate::market::price_cache::{PriceCache, MARKET_PRICE_MAX_AGE};
use crate::trading::matcher::LimitOrderMatcher;

/// 청산 감시 주기
const LIQUIDATION_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// 허용 레버리지 범위
const MIN_LEVERAGE: i64 = 1;
const MAX_LEVERAGE: i64 = 10;

/// 레버리지 엔진
pub struct LeverageEngine {
    pool: SqlitePool,
    price_cache: Arc<PriceCache>,
    hub: HubHandle,
    matcher: Arc<LimitOrderMatcher>,
}

impl LeverageEngine {
    pub fn new(
        pool: SqlitePool,
        price_cache: Arc<PriceCache>,
        hub: HubHandle,
        matcher: Arc<LimitOrderMatcher>,
    ) -> Self {
        Self {
            pool,
            price_cache,
            hub,
            matcher,
        }
    }

    fn validate_open(
        symbol: &str,
        leverage: i64,
        quantity: f64,
    ) -> Result<(), String> {
        if quantity <= 0.0 {
            return Err("quantity must be positive".to_string());
        }

        if !(MIN_LEVERAGE..=MAX_LEVERAGE).contains(&leverage) {
            return Err("leverage must be between 1 and 10".to_string());
        }

        let (_, quote) = parse_symbol(symbol)?;
        if quote != "USDT" {
            return Err("only USDT pairs are supported for leverage trading".to_string());
        }

        Ok(())
    }

    /// 시장가 개설
    ///
    /// 신선한 가격을 요구한다. 보증금을 차감하고 포지션을 만든 뒤
    /// MARGIN_DEPOSIT 원장을 남긴다.
    pub async fn open_market(
        &self,
        user_id: i64,
        symbol: &str,
        side: PositionSide,
        leverage: i64,
        quantity: f64,
    ) -> Result<LeveragePosition, String> {
        Self::validate_open(symbol, leverage, quantity)?;

        let current_price = self
            .price_cache
            .get_fresh(symbol, MARKET_PRICE_MAX_AGE)
            .await?;

        let margin = calculate_required_margin(current_price, quantity, leverage);
        let liquidation_price = calculate_liquidation_price(current_price, side, leverage);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| format!("failed to start transaction: {}", e))?;

        let wallet = WalletRepository::fetch(&mut tx, user_id, "USDT")
            .await
            .map_err(|e| format!("failed to get USDT wallet: {}", e))?
            .ok_or_else(|| "USDT wallet not found".to_string())?;

        if wallet.available_balance() < margin {
            return Err(format!(
                "insufficient USDT balance: required {:.2}, available {:.2}",
                margin,
                wallet.available_balance()
            ));
        }

        WalletRepository::update_balances(&mut tx, wallet.id, wallet.balance - margin, wallet.locked)
            .await
            .map_err(|e| format!("failed to deduct margin: {}", e))?;

        let position_id = PositionRepository::insert(
            &mut tx,
            user_id,
            None,
            symbol,
            side,
            leverage,
            current_price,
            quantity,
            margin,
            liquidation_price,
        )
        .await
        .map_err(|e| format!("failed to create position: {}", e))?;

        TransactionRepository::insert(
            &mut tx,
            user_id,
            None,
            TransactionType::MarginDeposit,
            "USDT",
            -margin,
            wallet.balance,
            wallet.balance - margin,
            &format!("Open {} position #{} with {}x leverage", side, position_id, leverage),
        )
        .await
        .map_err(|e| format!("failed to create transaction: {}", e))?;

        let position = PositionRepository::fetch(&mut tx, position_id)
            .await
            .map_err(|e| format!("failed to read position: {}", e))?
            .ok_or_else(|| "position not found".to_string())?;

        tx.commit()
            .await
            .map_err(|e| format!("failed to commit transaction: {}", e))?;

        info!(
            "레버리지 포지션 개설: user={}, #{} {} {} {}x, 진입가 {:.2}, 보증금 {:.2}",
            user_id, position_id, side, symbol, leverage, current_price, margin
        );

        let message = WsMessage::position_opened(&position);
        self.hub.broadcast_to_user(user_id, message.to_json());

        Ok(position)
    }

    /// 지정가 개설
    ///
    /// 주문만 만들어 매처에 등록한다. 지갑과 포지션은 체결 시점의
    /// 정산 트랜잭션에서 처리되고, 여기서 돌려주는 스냅샷은
    /// 미리보기용이며 저장되지 않는다 (id = 0).
    pub async fn open_limit(
        &self,
        user_id: i64,
        symbol: &str,
        side: PositionSide,
        leverage: i64,
        quantity: f64,
        limit_price: f64,
    ) -> Result<LeveragePosition, String> {
        Self::validate_open(symbol, leverage, quantity)?;

        if limit_price <= 0.0 {
            return Err("limit price must be positive".to_string());
        }

        let order_side = match side {
            PositionSide::Long => OrderSide::Buy,
            PositionSide::Short => OrderSide::Sell,
        };

        let order = OrderRepository::create_leverage(
            &self.pool,
            user_id,
            symbol,
            OrderType::Limit,
            order_side,
            quantity,
            Some(limit_price),
            leverage,
            side,
        )
        .await
        .map_err(|e| format!("failed to create order: {}", e))?;

        info!(
            "레버리지 지정가 주문 #{} 매처 등록: {} {} {}x @ {:.2}",
            order.id, side, symbol, leverage, limit_price
        );

        let provisional = LeveragePosition {
            id: 0,
            user_id,
            order_id: Some(order.id),
            symbol: symbol.to_string(),
            side,
            leverage,
            entry_price: limit_price,
            quantity,
            margin: calculate_required_margin(limit_price, quantity, leverage),
            liquidation_price: calculate_liquidation_price(limit_price, side, leverage),
            unrealized_pnl: 0.0,
            realized_pnl: 0.0,
            exit_price: None,
            status: PositionStatus::Open,
            created_at: order.created_at,
            updated_at: order.updated_at,
            closed_at: None,
        };

        self.matcher.add(order).await;

        Ok(provisional)
    }

    /// 사용자 평청산
    pub async fn close_position(
        &self,
        user_id: i64,
        position_id: i64,
    ) -> Result<LeveragePosition, String> {
        let position = PositionRepository::find_by_id(&self.pool, position_id)
            .await
            .map_err(|e| format!("failed to read position: {}", e))?
            .ok_or_else(|| "position not found".to_string())?;

        if position.user_id != user_id {
            return Err("unauthorized: position does not belong to user".to_string());
        }

        let current_price = self
            .price_cache
            .get(&position.symbol)
            .await
            .ok_or_else(|| format!("price not available for {}", position.symbol))?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| format!("failed to start transaction: {}", e))?;

        // 청산 감시와의 경합은 이 재검사가 패자를 걸러낸다
        let position = PositionRepository::fetch(&mut tx, position_id)
            .await
            .map_err(|e| format!("failed to read position: {}", e))?
            .ok_or_else(|| "position not found".to_string())?;

        if position.status != PositionStatus::Open {
            return Err("position is not open".to_string());
        }

        let pnl = position.calculate_unrealized_pnl(current_price);

        PositionRepository::mark_closed(
            &mut tx,
            position_id,
            PositionStatus::Closed,
            current_price,
            pnl,
        )
        .await
        .map_err(|e| format!("failed to close position: {}", e))?;

        let wallet = WalletRepository::fetch(&mut tx, user_id, "USDT")
            .await
            .map_err(|e| format!("failed to get USDT wallet: {}", e))?
            .ok_or_else(|| "USDT wallet not found".to_string())?;

        // 보증금 + 손익 반환. 음수면 잔여분은 보증금 손실로 남는다.
        let return_amount = position.margin + pnl;
        let credited = return_amount.max(0.0);

        // 지정가 개설 포지션은 체결 때 잠근 보증금을 해제한다
        let locked_release = if position.order_id.is_some() {
            position.margin.min(wallet.locked)
        } else {
            0.0
        };

        WalletRepository::update_balances(
            &mut tx,
            wallet.id,
            wallet.balance + credited,
            wallet.locked - locked_release,
        )
        .await
        .map_err(|e| format!("failed to return funds: {}", e))?;

        TransactionRepository::insert(
            &mut tx,
            user_id,
            position.order_id,
            TransactionType::MarginWithdraw,
            "USDT",
            credited,
            wallet.balance,
            wallet.balance + credited,
            &format!("Close {} position #{}: PnL {:.2} USDT", position.side, position_id, pnl),
        )
        .await
        .map_err(|e| format!("failed to create transaction: {}", e))?;

        tx.commit()
            .await
            .map_err(|e| format!("failed to commit transaction: {}", e))?;

        let position = PositionRepository::find_by_id(&self.pool, position_id)
            .await
            .map_err(|e| format!("failed to read position: {}", e))?
            .ok_or_else(|| "position not found".to_string())?;

        info!(
            "레버리지 포지션 평청산: user={}, #{}, 종료가 {:.2}, PnL {:.2}",
            user_id, position_id, current_price, pnl
        );

        let message = WsMessage::position_closed(&position);
        self.hub.broadcast_to_user(user_id, message.to_json());

        Ok(position)
    }

    /// 청산 감시 루프 시작. 5초마다 강제 청산 검사와 손익 갱신을 돈다.
    pub fn start_liquidation_sweep(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(LIQUIDATION_CHECK_INTERVAL);
            loop {
                ticker.tick().await;
                engine.check_and_liquidate().await;
                engine.refresh_unrealized_pnl().await;
            }
        });
        info!("청산 감시 시작 ({}초 주기)", LIQUIDATION_CHECK_INTERVAL.as_secs());
    }

    /// 보유 포지션 전체를 현재가와 대조해 청산 대상을 처리
    pub async fn check_and_liquidate(&self) {
        let positions = match PositionRepository::all_open(&self.pool).await {
            Ok(positions) => positions,
            Err(e) => {
                error!("보유 포지션 조회 실패: {}", e);
                return;
            }
        };

        for position in positions {
            let current_price = match self.price_cache.get(&position.symbol).await {
                Some(price) => price,
                None => continue,
            };

            if !position.is_liquidated(current_price) {
                continue;
            }

            warn!(
                "포지션 #{} 강제 청산: user={}, {} {}, 청산가 {:.2}, 현재가 {:.2}",
                position.id,
                position.user_id,
                position.side,
                position.symbol,
                position.liquidation_price,
                current_price
            );

            if let Err(e) = self.liquidate(&position).await {
                error!("포지션 #{} 청산 실패: {}", position.id, e);
            }
        }
    }

    /// 강제 청산 트랜잭션
    ///
    /// 지갑에는 돌려주지 않는다 (보증금 몰수). 원장에는 커밋 시점의
    /// 잔고 스냅샷과 증감액 0을 남긴다.
    async fn liquidate(&self, position: &LeveragePosition) -> Result<(), String> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| format!("failed to start transaction: {}", e))?;

        let current = PositionRepository::fetch(&mut tx, position.id)
            .await
            .map_err(|e| format!("failed to read position: {}", e))?
            .ok_or_else(|| "position not found".to_string())?;

        if current.status != PositionStatus::Open {
            return Err("position is not open".to_string());
        }

        PositionRepository::mark_closed(
            &mut tx,
            current.id,
            PositionStatus::Liquidated,
            current.liquidation_price,
            -current.margin,
        )
        .await
        .map_err(|e| format!("failed to liquidate position: {}", e))?;

        let wallet = WalletRepository::fetch(&mut tx, current.user_id, "USDT")
            .await
            .map_err(|e| format!("failed to get USDT wallet: {}", e))?
            .ok_or_else(|| "USDT wallet not found".to_string())?;

        let locked_release = if current.order_id.is_some() {
            current.margin.min(wallet.locked)
        } else {
            0.0
        };

        if locked_release > 0.0 {
            WalletRepository::update_balances(
                &mut tx,
                wallet.id,
                wallet.balance,
                wallet.locked - locked_release,
            )
            .await
            .map_err(|e| format!("failed to release margin lock: {}", e))?;
        }

        TransactionRepository::insert(
            &mut tx,
            current.user_id,
            current.order_id,
            TransactionType::Liquidation,
            "USDT",
            0.0,
            wallet.balance,
            wallet.balance,
            &format!("Position #{} liquidated at {:.2}", current.id, current.liquidation_price),
        )
        .await
        .map_err(|e| format!("failed to create transaction: {}", e))?;

        tx.commit()
            .await
            .map_err(|e| format!("failed to commit transaction: {}", e))?;

        let position = PositionRepository::find_by_id(&self.pool, current.id)
            .await
            .map_err(|e| format!("failed to read position: {}", e))?
            .ok_or_else(|| "position not found".to_string())?;

        info!("포지션 #{} 청산 완료", position.id);

        let message = WsMessage::position_closed(&position);
        self.hub.broadcast_to_user(position.user_id, message.to_json());

        Ok(())
    }

    /// 보유 포지션의 미실현 손익 갱신 (표시용 지연값, 체결과 비원자적)
    pub async fn refresh_unrealized_pnl(&self) {
        let positions = match PositionRepository::all_open(&self.pool).await {
            Ok(positions) => positions,
            Err(e) => {
                error!("보유 포지션 조회 실패: {}", e);
                return;
            }
        };

        for position in positions {
            let current_price = match self.price_cache.get(&position.symbol).await {
                Some(price) => price,
                None => continue,
            };

            let pnl = position.calculate_unrealized_pnl(current_price);
            if let Err(e) =
                PositionRepository::update_unrealized_pnl(&self.pool, position.id, pnl).await
            {
                debug!("포지션 #{} 손익 갱신 실패: {}", position.id, e);
            }
        }
    }
}
