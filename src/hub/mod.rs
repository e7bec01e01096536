//! WebSocket 팬아웃 허브
//!
//! 접속 클라이언트 레지스트리를 단일 태스크가 소유하고,
//! 시세 프레임 전체 브로드캐스트와 사용자 대상 알림 라우팅을 처리한다.
//! 브로드캐스트는 논블로킹이며, 큐가 가득 찬 느린 소비자는 버린다.

use std::collections::HashMap;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

/// 클라이언트별 송신 큐 용량
pub const CLIENT_QUEUE_CAPACITY: usize = 256;

/// 허브 입력 큐 용량 (피드 리더는 이 큐가 가득 차면 페이싱된다)
const HUB_QUEUE_CAPACITY: usize = 1024;

/// 접속 중인 클라이언트 하나
///
/// sender는 커넥션의 writer 태스크가 비우는 송신 큐다.
/// 허브에서 제거되면 sender가 드롭되어 큐가 정확히 한 번 닫힌다.
#[derive(Debug)]
pub struct Client {
    pub id: Uuid,
    /// 인증된 사용자 ID. 0이면 익명 (시세만 수신)
    pub user_id: i64,
    pub sender: mpsc::Sender<String>,
}

/// 허브 태스크의 네 가지 입력
#[derive(Debug)]
pub enum HubMessage {
    Register(Client),
    Unregister(Uuid),
    Broadcast(String),
    BroadcastToUser(i64, String),
}

/// 팬아웃 허브. 두 인덱스는 허브 태스크에서만 변경된다.
pub struct Hub {
    clients: HashMap<Uuid, Client>,
    clients_by_user: HashMap<i64, Vec<Uuid>>,
}

impl Hub {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            clients_by_user: HashMap::new(),
        }
    }

    /// 허브 입력 채널 생성
    pub fn channel() -> (HubHandle, mpsc::Receiver<HubMessage>) {
        let (tx, rx) = mpsc::channel(HUB_QUEUE_CAPACITY);
        (HubHandle { tx }, rx)
    }

    /// 허브 루프. 독립 태스크로 실행되어야 한다.
    pub async fn run(mut self, mut rx: mpsc::Receiver<HubMessage>) {
        info!("허브 시작");

        while let Some(message) = rx.recv().await {
            match message {
                HubMessage::Register(client) => self.handle_register(client),
                HubMessage::Unregister(client_id) => self.handle_unregister(client_id),
                HubMessage::Broadcast(frame) => self.handle_broadcast(&frame),
                HubMessage::BroadcastToUser(user_id, frame) => {
                    self.handle_broadcast_to_user(user_id, &frame)
                }
            }
        }

        info!("허브 종료");
    }

    /// 클라이언트 등록. 재등록해도 인덱스가 중복되지 않는다.
    pub fn handle_register(&mut self, client: Client) {
        let client_id = client.id;
        let user_id = client.user_id;

        self.clients.insert(client_id, client);

        if user_id > 0 {
            let ids = self.clients_by_user.entry(user_id).or_default();
            if !ids.contains(&client_id) {
                ids.push(client_id);
            }
        }

        info!(
            "클라이언트 등록: {} (user={}), 총 {}명",
            client_id,
            user_id,
            self.clients.len()
        );
    }

    /// 클라이언트 제거. 두 인덱스에서 빼고 송신 큐를 닫는다.
    pub fn handle_unregister(&mut self, client_id: Uuid) {
        if self.remove_client(client_id) {
            info!("클라이언트 해제: {}, 총 {}명", client_id, self.clients.len());
        }
    }

    /// 시세 프레임 전체 브로드캐스트
    ///
    /// try_send가 실패하는 클라이언트(큐 가득참/닫힘)는 비정상으로 보고 버린다.
    pub fn handle_broadcast(&mut self, frame: &str) {
        let mut dropped = Vec::new();

        for (client_id, client) in &self.clients {
            if client.sender.try_send(frame.to_string()).is_err() {
                dropped.push(*client_id);
            }
        }

        for client_id in dropped {
            warn!("송신 큐 가득참, 클라이언트 강제 해제: {}", client_id);
            self.remove_client(client_id);
        }
    }

    /// 특정 사용자의 클라이언트에게만 전송
    pub fn handle_broadcast_to_user(&mut self, user_id: i64, frame: &str) {
        let ids = match self.clients_by_user.get(&user_id) {
            Some(ids) => ids.clone(),
            None => {
                debug!("user={} 접속 클라이언트 없음, 알림 폐기", user_id);
                return;
            }
        };

        for client_id in ids {
            let full = match self.clients.get(&client_id) {
                Some(client) => client.sender.try_send(frame.to_string()).is_err(),
                None => false,
            };
            if full {
                warn!("송신 큐 가득참, 클라이언트 강제 해제: {}", client_id);
                self.remove_client(client_id);
            }
        }
    }

    fn remove_client(&mut self, client_id: Uuid) -> bool {
        // clients에서 빼면 sender가 드롭되어 writer 태스크가 종료된다
        let removed = match self.clients.remove(&client_id) {
            Some(client) => client,
            None => return false,
        };

        if removed.user_id > 0 {
            if let Some(ids) = self.clients_by_user.get_mut(&removed.user_id) {
                ids.retain(|id| *id != client_id);
                if ids.is_empty() {
                    self.clients_by_user.remove(&removed.user_id);
                }
            }
        }

        true
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn contains(&self, client_id: Uuid) -> bool {
        self.clients.contains_key(&client_id)
    }

    pub fn user_client_count(&self, user_id: i64) -> usize {
        self.clients_by_user
            .get(&user_id)
            .map(|ids| ids.len())
            .unwrap_or(0)
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

/// 허브 입력 채널의 클론 가능한 손잡이
#[derive(Clone)]
pub struct HubHandle {
    tx: mpsc::Sender<HubMessage>,
}

impl HubHandle {
    pub async fn register(&self, client: Client) {
        if self.tx.send(HubMessage::Register(client)).await.is_err() {
            warn!("허브가 종료되어 클라이언트 등록 실패");
        }
    }

    pub async fn unregister(&self, client_id: Uuid) {
        if self
            .tx
            .send(HubMessage::Unregister(client_id))
            .await
            .is_err()
        {
            warn!("허브가 종료되어 클라이언트 해제 실패");
        }
    }

    /// 시세 프레임 브로드캐스트. 허브 입력 큐가 가득 차면 대기한다 (피드 페이싱).
    pub async fn broadcast(&self, frame: String) {
        if self.tx.send(HubMessage::Broadcast(frame)).await.is_err() {
            warn!("허브가 종료되어 브로드캐스트 실패");
        }
    }

    /// 사용자 대상 알림. 논블로킹이며 실패는 기록 후 폐기한다
    /// (체결 커밋이나 응답에 영향을 주면 안 된다).
    pub fn broadcast_to_user(&self, user_id: i64, frame: String) {
        if let Err(e) = self
            .tx
            .try_send(HubMessage::BroadcastToUser(user_id, frame))
        {
            warn!("user={} 알림 전달 실패, 폐기: {}", user_id, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_client(user_id: i64) -> (Client, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        let client = Client {
            id: Uuid::new_v4(),
            user_id,
            sender: tx,
        };
        (client, rx)
    }

    #[tokio::test]
    async fn test_register_unregister() {
        let mut hub = Hub::new();
        let (client, _rx) = make_client(7);
        let client_id = client.id;

        hub.handle_register(client);
        assert_eq!(hub.client_count(), 1);
        assert_eq!(hub.user_client_count(7), 1);

        hub.handle_unregister(client_id);
        assert_eq!(hub.client_count(), 0);
        assert_eq!(hub.user_client_count(7), 0);

        // 이미 해제된 클라이언트 재해제는 무해
        hub.handle_unregister(client_id);
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn test_anonymous_client_not_indexed_by_user() {
        let mut hub = Hub::new();
        let (client, _rx) = make_client(0);

        hub.handle_register(client);
        assert_eq!(hub.client_count(), 1);
        assert_eq!(hub.user_client_count(0), 0);
    }

    #[tokio::test]
    async fn test_reregister_does_not_duplicate() {
        let mut hub = Hub::new();
        let (tx, _rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        let id = Uuid::new_v4();

        hub.handle_register(Client {
            id,
            user_id: 3,
            sender: tx.clone(),
        });
        hub.handle_register(Client {
            id,
            user_id: 3,
            sender: tx,
        });

        assert_eq!(hub.client_count(), 1);
        assert_eq!(hub.user_client_count(3), 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_clients() {
        let mut hub = Hub::new();
        let (c1, mut rx1) = make_client(1);
        let (c2, mut rx2) = make_client(0);
        hub.handle_register(c1);
        hub.handle_register(c2);

        hub.handle_broadcast("frame-1");
        hub.handle_broadcast("frame-2");

        assert_eq!(rx1.recv().await.unwrap(), "frame-1");
        assert_eq!(rx1.recv().await.unwrap(), "frame-2");
        assert_eq!(rx2.recv().await.unwrap(), "frame-1");
        assert_eq!(rx2.recv().await.unwrap(), "frame-2");
    }

    #[tokio::test]
    async fn test_broadcast_to_user_routing() {
        let mut hub = Hub::new();
        let (c1, mut rx1) = make_client(1);
        let (c2, mut rx2) = make_client(2);
        hub.handle_register(c1);
        hub.handle_register(c2);

        hub.handle_broadcast_to_user(1, "only-for-user-1");

        assert_eq!(rx1.recv().await.unwrap(), "only-for-user-1");
        assert!(rx2.try_recv().is_err());

        // 접속 없는 사용자 대상 알림은 폐기
        hub.handle_broadcast_to_user(99, "nobody");
    }

    #[tokio::test]
    async fn test_slow_consumer_is_dropped() {
        let mut hub = Hub::new();
        let (c1, mut rx1) = make_client(1);
        let c1_id = c1.id;
        // c2는 writer가 멈춘 상태 (큐를 비우지 않음)
        let (c2, _rx2) = make_client(2);
        let c2_id = c2.id;
        hub.handle_register(c1);
        hub.handle_register(c2);

        for i in 0..300 {
            hub.handle_broadcast(&format!("frame-{}", i));
            // c1은 계속 비워준다
            assert_eq!(rx1.recv().await.unwrap(), format!("frame-{}", i));
        }

        // 큐 용량 256을 넘긴 c2는 해제되고 c1만 남는다
        assert_eq!(hub.client_count(), 1);
        assert!(hub.contains(c1_id));
        assert!(!hub.contains(c2_id));
        assert_eq!(hub.user_client_count(2), 0);
    }
}
