//! 가격 캐시
//!
//! 업스트림 체결 스트림이 쓰는 심볼별 최신 가격을 보관한다.
//! 쓰기는 피드 리더 하나, 읽기는 전 거래 로직이 공유한다.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::warn;
use serde::Deserialize;
use tokio::sync::RwLock;

/// 시장가 체결에 허용하는 최대 가격 나이
pub const MARKET_PRICE_MAX_AGE: Duration = Duration::from_secs(10);

/// 업스트림 멀티플렉스 프레임
///
/// `{"stream":"btcusdt@trade","data":{"e":"trade","E":...,"s":"BTCUSDT","p":"...","q":"..."}}`
#[derive(Debug, Deserialize)]
pub struct StreamFrame {
    pub stream: String,
    pub data: TradeEvent,
}

/// 체결 이벤트 페이로드
#[derive(Debug, Deserialize)]
pub struct TradeEvent {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E", default)]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(rename = "q", default)]
    pub quantity: String,
}

#[derive(Debug, Clone, Copy)]
struct PriceEntry {
    price: f64,
    updated_at: Instant,
}

/// 심볼 → (가격, 갱신 시각) 동시성 캐시
pub struct PriceCache {
    entries: RwLock<HashMap<String, PriceEntry>>,
}

impl PriceCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// 가격 기록 (피드 리더 전용)
    pub async fn update(&self, symbol: &str, price: f64) {
        let mut entries = self.entries.write().await;
        entries.insert(
            symbol.to_string(),
            PriceEntry {
                price,
                updated_at: Instant::now(),
            },
        );
    }

    /// 최신 가격 조회
    pub async fn get(&self, symbol: &str) -> Option<f64> {
        let entries = self.entries.read().await;
        entries.get(symbol).map(|e| e.price)
    }

    /// 신선도 제한이 걸린 가격 조회
    ///
    /// 마지막 갱신이 max_age보다 오래됐으면 오류를 돌려준다.
    pub async fn get_fresh(&self, symbol: &str, max_age: Duration) -> Result<f64, String> {
        let entries = self.entries.read().await;
        let entry = entries
            .get(symbol)
            .ok_or_else(|| format!("price not available for {}", symbol))?;

        if entry.updated_at.elapsed() > max_age {
            return Err(format!("price data is stale for {}", symbol));
        }

        Ok(entry.price)
    }

    /// 전체 가격 스냅샷 (공개 가격 엔드포인트용 복사본)
    pub async fn snapshot(&self) -> HashMap<String, f64> {
        let entries = self.entries.read().await;
        entries.iter().map(|(k, v)| (k.clone(), v.price)).collect()
    }

    /// 업스트림 프레임을 해석해 체결 이벤트면 가격을 갱신
    ///
    /// 제어 프레임 등 해석 불가 프레임은 조용히 무시한다.
    pub async fn apply_frame(&self, frame: &str) {
        let parsed: StreamFrame = match serde_json::from_str(frame) {
            Ok(parsed) => parsed,
            Err(_) => return,
        };

        if parsed.data.event_type != "trade" {
            return;
        }

        let price: f64 = match parsed.data.price.parse() {
            Ok(price) => price,
            Err(e) => {
                warn!("{} 가격 파싱 실패: {}", parsed.data.symbol, e);
                return;
            }
        };

        self.update(&parsed.data.symbol, price).await;
    }
}

impl Default for PriceCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_update_and_get() {
        let cache = PriceCache::new();
        assert_eq!(cache.get("BTCUSDT").await, None);

        cache.update("BTCUSDT", 50000.0).await;
        assert_eq!(cache.get("BTCUSDT").await, Some(50000.0));

        // 덮어쓰기
        cache.update("BTCUSDT", 50100.5).await;
        assert_eq!(cache.get("BTCUSDT").await, Some(50100.5));
    }

    #[tokio::test]
    async fn test_get_fresh() {
        let cache = PriceCache::new();

        // 캐시에 없는 심볼
        let err = cache
            .get_fresh("ETHUSDT", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(err.contains("price not available"));

        cache.update("ETHUSDT", 3000.0).await;
        let price = cache
            .get_fresh("ETHUSDT", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(price, 3000.0);

        // max_age 0이면 즉시 stale 취급
        let err = cache
            .get_fresh("ETHUSDT", Duration::from_secs(0))
            .await
            .unwrap_err();
        assert!(err.contains("stale"));
    }

    #[tokio::test]
    async fn test_snapshot() {
        let cache = PriceCache::new();
        cache.update("BTCUSDT", 50000.0).await;
        cache.update("SOLUSDT", 200.0).await;

        let snapshot = cache.snapshot().await;
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get("BTCUSDT"), Some(&50000.0));
        assert_eq!(snapshot.get("SOLUSDT"), Some(&200.0));
    }

    #[tokio::test]
    async fn test_apply_frame() {
        let cache = PriceCache::new();

        let frame = r#"{"stream":"btcusdt@trade","data":{"e":"trade","E":1700000000000,"s":"BTCUSDT","p":"50123.45","q":"0.012"}}"#;
        cache.apply_frame(frame).await;
        assert_eq!(cache.get("BTCUSDT").await, Some(50123.45));

        // 체결이 아닌 이벤트는 무시
        let frame = r#"{"stream":"btcusdt@depth","data":{"e":"depthUpdate","E":1,"s":"BTCUSDT","p":"1.0"}}"#;
        cache.apply_frame(frame).await;
        assert_eq!(cache.get("BTCUSDT").await, Some(50123.45));

        // 깨진 프레임은 조용히 무시
        cache.apply_frame("ping").await;
        cache.apply_frame("{\"stream\":1}").await;
        assert_eq!(cache.get("BTCUSDT").await, Some(50123.45));
    }
}
