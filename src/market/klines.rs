//! 업스트림 REST 봉차트 패스스루

use serde::Serialize;
use serde_json::Value;

/// 차트 라이브러리가 쓰는 봉 한 개 (time은 초 단위)
#[derive(Debug, Clone, Serialize)]
pub struct KlinePoint {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
}

/// 업스트림 REST API에서 봉차트를 받아 변환
///
/// 업스트림 응답은 배열의 배열이고 시각은 밀리초, 가격은 문자열이다.
pub async fn fetch_klines(
    rest_base_url: &str,
    symbol: &str,
    interval: &str,
    limit: u32,
) -> Result<Vec<KlinePoint>, String> {
    let url = format!(
        "{}/api/v3/klines?symbol={}&interval={}&limit={}",
        rest_base_url, symbol, interval, limit
    );

    let response = reqwest::get(&url)
        .await
        .map_err(|e| format!("failed to connect to upstream: {}", e))?;

    let raw: Vec<Vec<Value>> = response
        .json()
        .await
        .map_err(|e| format!("failed to parse upstream response: {}", e))?;

    let points = raw
        .iter()
        .filter_map(|k| {
            Some(KlinePoint {
                // 밀리초 → 초
                time: k.first()?.as_i64()? / 1000,
                open: value_to_f64(k.get(1)?),
                high: value_to_f64(k.get(2)?),
                low: value_to_f64(k.get(3)?),
                close: value_to_f64(k.get(4)?),
            })
        })
        .collect();

    Ok(points)
}

/// 업스트림의 문자열 숫자 필드를 f64로 변환
fn value_to_f64(value: &Value) -> f64 {
    match value {
        Value::String(s) => s.parse().unwrap_or(0.0),
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_to_f64() {
        assert_eq!(value_to_f64(&Value::String("0.01634790".to_string())), 0.01634790);
        assert_eq!(value_to_f64(&serde_json::json!(42)), 42.0);
        assert_eq!(value_to_f64(&Value::String("garbage".to_string())), 0.0);
        assert_eq!(value_to_f64(&Value::Null), 0.0);
    }
}
