//! 허브 팬아웃 통합 테스트
//!
//! 허브 태스크를 실제로 띄워 등록/브로드캐스트/사용자 라우팅/해제를
//! 검증한다.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

use quantis::hub::{Client, Hub, CLIENT_QUEUE_CAPACITY};

fn make_client(user_id: i64) -> (Client, mpsc::Receiver<String>, Uuid) {
    let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
    let id = Uuid::new_v4();
    (
        Client {
            id,
            user_id,
            sender: tx,
        },
        rx,
        id,
    )
}

async fn recv_frame(rx: &mut mpsc::Receiver<String>) -> String {
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("프레임 수신 타임아웃")
        .expect("송신 큐가 닫힘")
}

#[tokio::test]
async fn test_broadcast_reaches_all_clients_in_order() {
    let (hub, hub_rx) = Hub::channel();
    tokio::spawn(Hub::new().run(hub_rx));

    let (c1, mut rx1, _) = make_client(1);
    let (c2, mut rx2, _) = make_client(0);
    hub.register(c1).await;
    hub.register(c2).await;
    sleep(Duration::from_millis(50)).await;

    for i in 0..5 {
        hub.broadcast(format!("frame-{}", i)).await;
    }

    // 커넥션별 프레임 순서는 보존된다
    for i in 0..5 {
        assert_eq!(recv_frame(&mut rx1).await, format!("frame-{}", i));
        assert_eq!(recv_frame(&mut rx2).await, format!("frame-{}", i));
    }
}

#[tokio::test]
async fn test_user_broadcast_targets_only_owner() {
    let (hub, hub_rx) = Hub::channel();
    tokio::spawn(Hub::new().run(hub_rx));

    let (c1, mut rx1, _) = make_client(7);
    let (c2, mut rx2, _) = make_client(8);
    let (c3, mut rx3, _) = make_client(0);
    hub.register(c1).await;
    hub.register(c2).await;
    hub.register(c3).await;
    sleep(Duration::from_millis(50)).await;

    hub.broadcast_to_user(7, "order-filled".to_string());

    assert_eq!(recv_frame(&mut rx1).await, "order-filled");

    sleep(Duration::from_millis(50)).await;
    assert!(rx2.try_recv().is_err());
    assert!(rx3.try_recv().is_err());
}

#[tokio::test]
async fn test_same_user_multiple_connections() {
    let (hub, hub_rx) = Hub::channel();
    tokio::spawn(Hub::new().run(hub_rx));

    // 같은 사용자가 두 커넥션으로 접속
    let (c1, mut rx1, _) = make_client(5);
    let (c2, mut rx2, _) = make_client(5);
    hub.register(c1).await;
    hub.register(c2).await;
    sleep(Duration::from_millis(50)).await;

    hub.broadcast_to_user(5, "notice".to_string());

    assert_eq!(recv_frame(&mut rx1).await, "notice");
    assert_eq!(recv_frame(&mut rx2).await, "notice");
}

#[tokio::test]
async fn test_unregister_closes_outbound_queue() {
    let (hub, hub_rx) = Hub::channel();
    tokio::spawn(Hub::new().run(hub_rx));

    let (c1, mut rx1, c1_id) = make_client(1);
    hub.register(c1).await;
    sleep(Duration::from_millis(50)).await;

    hub.unregister(c1_id).await;
    sleep(Duration::from_millis(50)).await;

    // 해제되면 송신 큐가 닫혀 writer 태스크가 종료 신호를 받는다
    assert!(rx1.recv().await.is_none());

    // 해제 이후 브로드캐스트는 더 이상 도달하지 않는다
    hub.broadcast("late-frame".to_string()).await;
    sleep(Duration::from_millis(50)).await;
    assert!(rx1.try_recv().is_err());
}

#[tokio::test]
async fn test_slow_consumer_dropped_fast_consumer_kept() {
    let (hub, hub_rx) = Hub::channel();
    tokio::spawn(Hub::new().run(hub_rx));

    let (c1, mut rx1, _) = make_client(1);
    // c2의 writer는 멈춰 있다 (큐를 비우지 않음)
    let (c2, mut rx2, _) = make_client(2);
    hub.register(c1).await;
    hub.register(c2).await;
    sleep(Duration::from_millis(50)).await;

    // 큐 용량 256을 넘는 연속 프레임
    for i in 0..300 {
        hub.broadcast(format!("frame-{}", i)).await;
        // c1은 제때 비워준다
        assert_eq!(recv_frame(&mut rx1).await, format!("frame-{}", i));
    }

    sleep(Duration::from_millis(50)).await;

    // c2는 용량까지만 쌓인 뒤 허브에서 해제되어 큐가 닫힌다
    let mut received = 0;
    while let Ok(frame) = rx2.try_recv() {
        assert_eq!(frame, format!("frame-{}", received));
        received += 1;
    }
    assert_eq!(received, CLIENT_QUEUE_CAPACITY);
    assert!(rx2.recv().await.is_none());

    // c1은 이후 프레임도 계속 받는다
    hub.broadcast("after-drop".to_string()).await;
    assert_eq!(recv_frame(&mut rx1).await, "after-drop");
}
