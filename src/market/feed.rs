//! 업스트림 시세 피드 리더
//!
//! 업스트림 체결 스트림에 상시 연결을 유지하면서 수신 프레임을
//! 그대로 허브 브로드캐스트로 넘기고 가격 캐시를 갱신한다.
//! 어떤 프레임이 의미 있는지는 여기서 판단하지 않는다.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use log::{info, warn};
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::hub::HubHandle;
use crate::market::price_cache::PriceCache;

/// 재접속 대기 시간
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// 업스트림 피드 리더
pub struct MarketFeed {
    url: String,
    hub: HubHandle,
    price_cache: Arc<PriceCache>,
}

impl MarketFeed {
    pub fn new(url: String, hub: HubHandle, price_cache: Arc<PriceCache>) -> Self {
        Self {
            url,
            hub,
            price_cache,
        }
    }

    /// 피드 수신 루프. 독립 태스크로 실행되어야 한다.
    ///
    /// 읽기 오류가 나면 연결을 닫고 5초 뒤 다시 접속한다.
    pub async fn run(self) {
        info!("업스트림 피드 접속 시작: {}", self.url);

        loop {
            match connect_async(self.url.as_str()).await {
                Ok((mut stream, _)) => {
                    info!("업스트림 피드 접속 성공");

                    while let Some(message) = stream.next().await {
                        match message {
                            Ok(Message::Text(frame)) => {
                                // 수신 프레임을 그대로 전체 브로드캐스트
                                self.hub.broadcast(frame.clone()).await;
                                // 체결 이벤트면 가격 캐시 갱신
                                self.price_cache.apply_frame(&frame).await;
                            }
                            Ok(Message::Close(_)) => {
                                warn!("업스트림 피드가 연결을 종료함");
                                break;
                            }
                            Ok(_) => {
                                // ping/pong 등 제어 프레임은 무시
                            }
                            Err(e) => {
                                warn!("업스트림 피드 읽기 실패: {}", e);
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        "업스트림 피드 접속 실패: {} ({}초 후 재시도)",
                        e,
                        RECONNECT_BACKOFF.as_secs()
                    );
                }
            }

            sleep(RECONNECT_BACKOFF).await;
        }
    }
}
