//! 지정가 주문 매처
//!
//! 대기 중인 지정가 주문을 메모리에 들고 1초마다 가격 캐시와
//! 대조해서 조건을 만족한 주문을 정산 엔진으로 넘긴다.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use sqlx::SqlitePool;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::time::interval;

use crate::db::models::{Order, OrderSide, OrderStatus, OrderType};
use crate::db::repository::OrderRepository;
use crate::market::price_cache::PriceCache;
use crate::trading::settlement::{SettlementEngine, ERR_ORDER_NOT_PENDING};

/// 매칭 주기
const CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// 체결 조건: 매수는 현재가 ≤ 지정가, 매도는 현재가 ≥ 지정가
pub fn should_trigger(side: OrderSide, current_price: f64, limit_price: f64) -> bool {
    match side {
        OrderSide::Buy => current_price <= limit_price,
        OrderSide::Sell => current_price >= limit_price,
    }
}

/// 지정가 매처
pub struct LimitOrderMatcher {
    pool: SqlitePool,
    price_cache: Arc<PriceCache>,
    settlement: Arc<SettlementEngine>,
    pending: RwLock<HashMap<i64, Order>>,
    running: Mutex<bool>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl LimitOrderMatcher {
    pub fn new(
        pool: SqlitePool,
        price_cache: Arc<PriceCache>,
        settlement: Arc<SettlementEngine>,
    ) -> Self {
        Self {
            pool,
            price_cache,
            settlement,
            pending: RwLock::new(HashMap::new()),
            running: Mutex::new(false),
            stop_tx: Mutex::new(None),
        }
    }

    /// 매처 시작 (멱등). 영속화된 대기 주문을 적재한 뒤 주기 태스크를 띄운다.
    pub async fn start(self: &Arc<Self>) {
        {
            let mut running = self.running.lock().await;
            if *running {
                return;
            }
            *running = true;
        }

        info!("지정가 매처 시작");

        self.load_pending_orders().await;

        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.stop_tx.lock().await = Some(stop_tx);

        let matcher = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(CHECK_INTERVAL);
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => matcher.check_pending_orders().await,
                }
            }
        });
    }

    /// 매처 중지 (멱등)
    pub async fn stop(&self) {
        let mut running = self.running.lock().await;
        if !*running {
            return;
        }
        *running = false;

        if let Some(stop_tx) = self.stop_tx.lock().await.take() {
            let _ = stop_tx.send(true);
        }

        info!("지정가 매처 중지");
    }

    /// DB의 대기 지정가 주문을 메모리로 적재
    async fn load_pending_orders(&self) {
        match OrderRepository::pending_limit_orders(&self.pool).await {
            Ok(orders) => {
                let count = orders.len();
                let mut pending = self.pending.write().await;
                for order in orders {
                    pending.insert(order.id, order);
                }
                info!("대기 지정가 주문 {}건 적재", count);
            }
            Err(e) => error!("대기 지정가 주문 적재 실패: {}", e),
        }
    }

    /// 감시 목록에 주문 추가. PENDING 상태의 지정가 주문만 받는다.
    pub async fn add(&self, order: Order) {
        if order.order_type != OrderType::Limit || order.status != OrderStatus::Pending {
            return;
        }

        info!(
            "지정가 주문 #{} 매처 등록: {} {} @ {:.2}",
            order.id,
            order.side,
            order.symbol,
            order.limit_price.unwrap_or(0.0)
        );

        let mut pending = self.pending.write().await;
        pending.insert(order.id, order);
    }

    /// 감시 목록에서 주문 제거 (취소 시 사용)
    pub async fn remove(&self, order_id: i64) {
        let mut pending = self.pending.write().await;
        if pending.remove(&order_id).is_some() {
            info!("지정가 주문 #{} 매처에서 제거", order_id);
        }
    }

    pub async fn contains(&self, order_id: i64) -> bool {
        self.pending.read().await.contains_key(&order_id)
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.read().await.len()
    }

    /// 한 틱 분량의 매칭 수행
    ///
    /// 읽기 잠금으로 스냅샷을 뜨고 주문별로 평가 시점의 현재가에 체결한다.
    /// 가격이 없는 심볼은 이번 틱을 건너뛴다.
    pub async fn check_pending_orders(&self) {
        let snapshot: Vec<Order> = {
            let pending = self.pending.read().await;
            pending.values().cloned().collect()
        };

        for order in snapshot {
            let current_price = match self.price_cache.get(&order.symbol).await {
                Some(price) => price,
                None => continue,
            };

            let limit_price = match order.limit_price {
                Some(price) => price,
                None => continue,
            };

            if !should_trigger(order.side, current_price, limit_price) {
                continue;
            }

            info!(
                "지정가 주문 #{} 체결 시도: {} {} 지정가 {:.2}, 현재가 {:.2}",
                order.id, order.side, order.symbol, limit_price, current_price
            );

            match self.settlement.settle_fill(order.id, current_price).await {
                Ok(_) => {
                    self.remove(order.id).await;
                }
                Err(e) if e == ERR_ORDER_NOT_PENDING => {
                    // 취소됐거나 이미 종결된 주문은 감시 목록에서 정리
                    self.remove(order.id).await;
                }
                Err(e) => {
                    // 일시적 실패로 보고 다음 틱에 재시도
                    warn!("지정가 주문 #{} 체결 실패: {}", order.id, e);
                }
            }
        }
    }
}
