//! 현물 거래 통합 테스트
//!
//! 인메모리 SQLite 위에서 시장가 정산, 지정가 매칭, 취소 경로를
//! 끝까지 돌려 지갑/원장/알림을 검증한다.

use std::sync::Arc;
use std::time::Duration;

use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use quantis::db;
use quantis::db::models::{OrderSide, OrderStatus, TransactionType, Wallet};
use quantis::db::repository::{
    OrderRepository, TransactionRepository, UserRepository, WalletRepository,
};
use quantis::hub::{Client, Hub, HubHandle, CLIENT_QUEUE_CAPACITY};
use quantis::market::PriceCache;
use quantis::trading::{LimitOrderMatcher, SettlementEngine, TradingService};

struct TestVenue {
    pool: SqlitePool,
    price_cache: Arc<PriceCache>,
    hub: HubHandle,
    matcher: Arc<LimitOrderMatcher>,
    trading: TradingService,
}

async fn setup() -> TestVenue {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("인메모리 DB 연결 실패");
    db::create_tables(&pool).await.expect("테이블 생성 실패");

    let (hub, hub_rx) = Hub::channel();
    tokio::spawn(Hub::new().run(hub_rx));

    let price_cache = Arc::new(PriceCache::new());
    let settlement = Arc::new(SettlementEngine::new(pool.clone(), hub.clone()));
    let matcher = Arc::new(LimitOrderMatcher::new(
        pool.clone(),
        Arc::clone(&price_cache),
        Arc::clone(&settlement),
    ));
    let trading = TradingService::new(
        pool.clone(),
        Arc::clone(&price_cache),
        Arc::clone(&matcher),
        settlement,
    );

    TestVenue {
        pool,
        price_cache,
        hub,
        matcher,
        trading,
    }
}

async fn seed_user(pool: &SqlitePool, email: &str) -> i64 {
    let user_id = UserRepository::insert(pool, "tester", email, "hashed-password")
        .await
        .unwrap();
    WalletRepository::init_default_wallets(pool, user_id)
        .await
        .unwrap();
    user_id
}

async fn wallet(pool: &SqlitePool, user_id: i64, symbol: &str) -> Wallet {
    let mut conn = pool.acquire().await.unwrap();
    WalletRepository::fetch(&mut conn, user_id, symbol)
        .await
        .unwrap()
        .expect("지갑 없음")
}

/// 사용자 이벤트 수신용 클라이언트를 허브에 등록
async fn listen_as(hub: &HubHandle, user_id: i64) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
    hub.register(Client {
        id: Uuid::new_v4(),
        user_id,
        sender: tx,
    })
    .await;
    sleep(Duration::from_millis(50)).await;
    rx
}

async fn next_event(rx: &mut mpsc::Receiver<String>) -> serde_json::Value {
    let frame = timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("알림 수신 타임아웃")
        .expect("송신 큐 닫힘");
    serde_json::from_str(&frame).unwrap()
}

#[tokio::test]
async fn test_market_buy_happy_path() {
    let venue = setup().await;
    let user_id = seed_user(&venue.pool, "buyer@test.io").await;
    let mut events = listen_as(&venue.hub, user_id).await;

    venue.price_cache.update("BTCUSDT", 50000.0).await;

    let order = venue
        .trading
        .place_market_order(user_id, "BTCUSDT", OrderSide::Buy, 0.5)
        .await
        .unwrap();

    assert_eq!(order.status, OrderStatus::Completed);
    assert_eq!(order.price, 50000.0);
    assert_eq!(order.total_amount, 25000.0);

    // 지갑: USDT -25000, BTC +0.5
    let usdt = wallet(&venue.pool, user_id, "USDT").await;
    let btc = wallet(&venue.pool, user_id, "BTC").await;
    assert_eq!(usdt.balance, 75000.0);
    assert_eq!(btc.balance, 0.5);

    // 원장: 주문당 2건, 전후 잔고 스냅샷 일치
    let ledger = TransactionRepository::find_by_order(&venue.pool, order.id)
        .await
        .unwrap();
    assert_eq!(ledger.len(), 2);
    let usdt_entry = ledger.iter().find(|t| t.symbol == "USDT").unwrap();
    assert_eq!(usdt_entry.tx_type, TransactionType::Buy);
    assert_eq!(usdt_entry.amount, -25000.0);
    assert_eq!(usdt_entry.balance_before, 100000.0);
    assert_eq!(usdt_entry.balance_after, 75000.0);
    let btc_entry = ledger.iter().find(|t| t.symbol == "BTC").unwrap();
    assert_eq!(btc_entry.amount, 0.5);
    assert_eq!(btc_entry.balance_before, 0.0);
    assert_eq!(btc_entry.balance_after, 0.5);

    // 커밋 후 알림
    let event = next_event(&mut events).await;
    assert_eq!(event["type"], "ORDER_EXECUTED");
    assert_eq!(event["data"]["orderId"], order.id);
    assert_eq!(event["data"]["price"], 50000.0);
    assert_eq!(event["data"]["status"], "COMPLETED");
}

#[tokio::test]
async fn test_market_buy_insufficient_balance_marks_order_failed() {
    let venue = setup().await;
    let user_id = seed_user(&venue.pool, "poor@test.io").await;

    venue.price_cache.update("BTCUSDT", 50000.0).await;

    // 3 BTC = 150,000 USDT > 시드 잔고 100,000
    let err = venue
        .trading
        .place_market_order(user_id, "BTCUSDT", OrderSide::Buy, 3.0)
        .await
        .unwrap_err();
    assert!(err.contains("insufficient USDT balance"));

    // 주문은 FAILED로 남고 오류 문자열이 기록된다
    let orders = OrderRepository::find_by_user(&venue.pool, user_id, 10, 0)
        .await
        .unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].status, OrderStatus::Failed);
    assert!(orders[0].error_msg.as_deref().unwrap().contains("insufficient"));

    // 지갑과 원장은 건드리지 않는다
    let usdt = wallet(&venue.pool, user_id, "USDT").await;
    assert_eq!(usdt.balance, 100000.0);
    let ledger = TransactionRepository::find_by_order(&venue.pool, orders[0].id)
        .await
        .unwrap();
    assert!(ledger.is_empty());
}

#[tokio::test]
async fn test_market_sell_requires_coin_balance() {
    let venue = setup().await;
    let user_id = seed_user(&venue.pool, "nocoin@test.io").await;

    venue.price_cache.update("ETHUSDT", 3000.0).await;

    let err = venue
        .trading
        .place_market_order(user_id, "ETHUSDT", OrderSide::Sell, 1.0)
        .await
        .unwrap_err();
    assert!(err.contains("insufficient ETH balance"));
}

#[tokio::test]
async fn test_market_order_without_price_fails() {
    let venue = setup().await;
    let user_id = seed_user(&venue.pool, "noprice@test.io").await;

    let err = venue
        .trading
        .place_market_order(user_id, "SOLUSDT", OrderSide::Buy, 1.0)
        .await
        .unwrap_err();
    assert!(err.contains("failed to get market price"));

    // 지원하지 않는 심볼은 가격 조회 전에 거부
    let err = venue
        .trading
        .place_market_order(user_id, "DOGEUSDT", OrderSide::Buy, 1.0)
        .await
        .unwrap_err();
    assert!(err.contains("invalid trading symbol"));
}

#[tokio::test]
async fn test_spot_buy_then_sell() {
    let venue = setup().await;
    let user_id = seed_user(&venue.pool, "trader@test.io").await;

    venue.price_cache.update("BTCUSDT", 50000.0).await;
    venue
        .trading
        .place_market_order(user_id, "BTCUSDT", OrderSide::Buy, 0.5)
        .await
        .unwrap();

    venue.price_cache.update("BTCUSDT", 52000.0).await;
    let sell = venue
        .trading
        .place_market_order(user_id, "BTCUSDT", OrderSide::Sell, 0.2)
        .await
        .unwrap();

    assert_eq!(sell.status, OrderStatus::Completed);
    assert_eq!(sell.total_amount, 10400.0);

    let usdt = wallet(&venue.pool, user_id, "USDT").await;
    let btc = wallet(&venue.pool, user_id, "BTC").await;
    assert_eq!(usdt.balance, 85400.0);
    assert!((btc.balance - 0.3).abs() < 1e-9);
}

#[tokio::test]
async fn test_limit_buy_waits_until_price_reaches_limit() {
    let venue = setup().await;
    let user_id = seed_user(&venue.pool, "limit@test.io").await;
    let mut events = listen_as(&venue.hub, user_id).await;

    venue.price_cache.update("ETHUSDT", 3000.0).await;

    let order = venue
        .trading
        .place_limit_order(user_id, "ETHUSDT", OrderSide::Buy, 1.0, 2500.0)
        .await
        .unwrap();

    assert_eq!(order.status, OrderStatus::Pending);
    assert!(venue.matcher.contains(order.id).await);

    // 아직 지정가에 못 미침 → 체결 없음
    venue.matcher.check_pending_orders().await;
    let unchanged = OrderRepository::find_by_id(&venue.pool, order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unchanged.status, OrderStatus::Pending);
    assert!(venue.matcher.contains(order.id).await);

    // 가격이 지정가까지 내려오면 다음 틱에 체결
    venue.price_cache.update("ETHUSDT", 2500.0).await;
    venue.matcher.check_pending_orders().await;

    let filled = OrderRepository::find_by_id(&venue.pool, order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(filled.status, OrderStatus::Completed);
    assert_eq!(filled.price, 2500.0);
    assert_eq!(filled.total_amount, 2500.0);
    assert!(!venue.matcher.contains(order.id).await);

    let usdt = wallet(&venue.pool, user_id, "USDT").await;
    let eth = wallet(&venue.pool, user_id, "ETH").await;
    assert_eq!(usdt.balance, 97500.0);
    assert_eq!(eth.balance, 1.0);

    let event = next_event(&mut events).await;
    assert_eq!(event["type"], "LIMIT_ORDER_FILLED");
    assert_eq!(event["data"]["orderId"], order.id);
    assert_eq!(event["data"]["limitPrice"], 2500.0);
    assert_eq!(event["data"]["executedPrice"], 2500.0);
}

#[tokio::test]
async fn test_limit_sell_triggers_at_or_above_limit() {
    let venue = setup().await;
    let user_id = seed_user(&venue.pool, "sell-limit@test.io").await;

    // 먼저 ETH를 확보
    venue.price_cache.update("ETHUSDT", 3000.0).await;
    venue
        .trading
        .place_market_order(user_id, "ETHUSDT", OrderSide::Buy, 2.0)
        .await
        .unwrap();

    let order = venue
        .trading
        .place_limit_order(user_id, "ETHUSDT", OrderSide::Sell, 1.0, 3100.0)
        .await
        .unwrap();

    // 현재가 3000 < 지정가 3100 → 대기
    venue.matcher.check_pending_orders().await;
    assert!(venue.matcher.contains(order.id).await);

    venue.price_cache.update("ETHUSDT", 3100.0).await;
    venue.matcher.check_pending_orders().await;

    let filled = OrderRepository::find_by_id(&venue.pool, order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(filled.status, OrderStatus::Completed);
    assert_eq!(filled.price, 3100.0);

    let usdt = wallet(&venue.pool, user_id, "USDT").await;
    let eth = wallet(&venue.pool, user_id, "ETH").await;
    // 94000 (매수 후) + 3100 (매도)
    assert_eq!(usdt.balance, 97100.0);
    assert_eq!(eth.balance, 1.0);
}

#[tokio::test]
async fn test_cancel_before_fill() {
    let venue = setup().await;
    let user_id = seed_user(&venue.pool, "cancel@test.io").await;

    venue.price_cache.update("ETHUSDT", 3000.0).await;

    let order = venue
        .trading
        .place_limit_order(user_id, "ETHUSDT", OrderSide::Buy, 1.0, 2500.0)
        .await
        .unwrap();

    venue.trading.cancel_order(user_id, order.id).await.unwrap();

    let canceled = OrderRepository::find_by_id(&venue.pool, order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(canceled.status, OrderStatus::Canceled);
    assert!(!venue.matcher.contains(order.id).await);

    // 이후 가격이 움직여도 체결되지 않는다
    venue.price_cache.update("ETHUSDT", 2500.0).await;
    venue.matcher.check_pending_orders().await;

    let still_canceled = OrderRepository::find_by_id(&venue.pool, order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(still_canceled.status, OrderStatus::Canceled);
    let usdt = wallet(&venue.pool, user_id, "USDT").await;
    assert_eq!(usdt.balance, 100000.0);

    // 종결 상태의 재취소는 오류
    let err = venue
        .trading
        .cancel_order(user_id, order.id)
        .await
        .unwrap_err();
    assert_eq!(err, "order cannot be canceled");
}

#[tokio::test]
async fn test_cancel_requires_ownership() {
    let venue = setup().await;
    let owner = seed_user(&venue.pool, "owner@test.io").await;
    let stranger = seed_user(&venue.pool, "stranger@test.io").await;

    let order = venue
        .trading
        .place_limit_order(owner, "BTCUSDT", OrderSide::Buy, 0.1, 40000.0)
        .await
        .unwrap();

    let err = venue
        .trading
        .cancel_order(stranger, order.id)
        .await
        .unwrap_err();
    assert_eq!(err, "unauthorized: order does not belong to user");

    let unchanged = OrderRepository::find_by_id(&venue.pool, order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unchanged.status, OrderStatus::Pending);
}

#[tokio::test]
async fn test_completed_market_order_cannot_be_canceled() {
    let venue = setup().await;
    let user_id = seed_user(&venue.pool, "done@test.io").await;

    venue.price_cache.update("SOLUSDT", 200.0).await;
    let order = venue
        .trading
        .place_market_order(user_id, "SOLUSDT", OrderSide::Buy, 1.0)
        .await
        .unwrap();

    let err = venue
        .trading
        .cancel_order(user_id, order.id)
        .await
        .unwrap_err();
    assert_eq!(err, "order cannot be canceled");
}

#[tokio::test]
async fn test_matcher_reload_from_database() {
    let venue = setup().await;
    let user_id = seed_user(&venue.pool, "reload@test.io").await;

    venue
        .trading
        .place_limit_order(user_id, "BTCUSDT", OrderSide::Buy, 0.1, 40000.0)
        .await
        .unwrap();
    venue
        .trading
        .place_limit_order(user_id, "ETHUSDT", OrderSide::Sell, 1.0, 99999.0)
        .await
        .unwrap();

    // 재기동한 매처가 영속화된 PENDING 지정가 주문을 다시 적재한다
    let settlement = Arc::new(SettlementEngine::new(venue.pool.clone(), venue.hub.clone()));
    let fresh = Arc::new(LimitOrderMatcher::new(
        venue.pool.clone(),
        Arc::clone(&venue.price_cache),
        settlement,
    ));
    fresh.start().await;
    assert_eq!(fresh.pending_count().await, 2);

    // start는 멱등
    fresh.start().await;
    assert_eq!(fresh.pending_count().await, 2);

    fresh.stop().await;
    fresh.stop().await;
}
