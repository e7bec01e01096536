use std::sync::Arc;

use log::info;
use sqlx::sqlite::SqlitePool;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::api::create_api_router;
use crate::db;
use crate::hub::{Hub, HubHandle};
use crate::market::{MarketFeed, PriceCache};
use crate::trading::{LeverageEngine, LimitOrderMatcher, SettlementEngine, TradingService};

/// 서버 설정
#[derive(Clone)]
pub struct ServerConfig {
    pub http_addr: String,
    pub database_url: String,
    /// 업스트림 멀티플렉스 체결 스트림 URL
    pub upstream_ws_url: String,
    /// 업스트림 REST API 베이스 URL (봉차트 패스스루)
    pub upstream_rest_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            database_url: "sqlite://quantis.db?mode=rwc".to_string(),
            upstream_ws_url:
                "wss://stream.binance.com:9443/stream?streams=btcusdt@trade/ethusdt@trade/solusdt@trade"
                    .to_string(),
            upstream_rest_url: "https://api.binance.com".to_string(),
        }
    }
}

impl ServerConfig {
    /// 환경변수로 기본값을 덮어쓴 설정
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("QUANTIS_HTTP_ADDR") {
            config.http_addr = addr;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(url) = std::env::var("UPSTREAM_WS_URL") {
            config.upstream_ws_url = url;
        }
        if let Ok(url) = std::env::var("UPSTREAM_REST_URL") {
            config.upstream_rest_url = url;
        }

        config
    }
}

/// 서버 상태. 핸들러가 공유하는 장수명 컴포넌트 참조.
#[derive(Clone)]
pub struct ServerState {
    pub config: ServerConfig,
    pub db_pool: SqlitePool,
    pub price_cache: Arc<PriceCache>,
    pub hub: HubHandle,
    pub matcher: Arc<LimitOrderMatcher>,
    pub settlement: Arc<SettlementEngine>,
    pub trading: Arc<TradingService>,
    pub leverage: Arc<LeverageEngine>,
}

/// 서버 시작: 컴포넌트 조립 → 백그라운드 태스크 기동 → HTTP 서빙
pub async fn start_server(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!("Quantis 서버 시작 중...");

    // DB 초기화 실패는 치명적이다
    let db_pool = db::init_database(&config.database_url).await?;

    // 팬아웃 허브
    let (hub, hub_rx) = Hub::channel();
    tokio::spawn(Hub::new().run(hub_rx));
    info!("✅ 허브 기동");

    // 가격 캐시 + 업스트림 피드 리더
    let price_cache = Arc::new(PriceCache::new());
    let feed = MarketFeed::new(
        config.upstream_ws_url.clone(),
        hub.clone(),
        Arc::clone(&price_cache),
    );
    tokio::spawn(feed.run());
    info!("✅ 업스트림 피드 리더 기동");

    // 정산 엔진과 지정가 매처
    let settlement = Arc::new(SettlementEngine::new(db_pool.clone(), hub.clone()));
    let matcher = Arc::new(LimitOrderMatcher::new(
        db_pool.clone(),
        Arc::clone(&price_cache),
        Arc::clone(&settlement),
    ));
    matcher.start().await;
    info!("✅ 지정가 매처 기동");

    // 레버리지 엔진 + 청산 감시
    let leverage = Arc::new(LeverageEngine::new(
        db_pool.clone(),
        Arc::clone(&price_cache),
        hub.clone(),
        Arc::clone(&matcher),
    ));
    leverage.start_liquidation_sweep();

    let trading = Arc::new(TradingService::new(
        db_pool.clone(),
        Arc::clone(&price_cache),
        Arc::clone(&matcher),
        Arc::clone(&settlement),
    ));

    let state = ServerState {
        config: config.clone(),
        db_pool,
        price_cache,
        hub,
        matcher,
        settlement,
        trading,
        leverage,
    };

    let app = create_api_router()
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    info!("✅ 서버 시작 완료: http://{}", config.http_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
