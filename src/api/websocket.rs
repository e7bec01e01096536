//! WebSocket 업그레이드와 커넥션별 reader/writer 태스크
//!
//! writer는 허브가 채우는 송신 큐를 비우고, reader는 끊김 감지를
//! 위해서만 읽는다 (수신 페이로드는 버린다).

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::api::models::ErrorBody;
use crate::auth::jwt;
use crate::hub::{Client, HubHandle, CLIENT_QUEUE_CAPACITY};
use crate::server::ServerState;

/// WebSocket 연결 핸들러
///
/// ?token= 쿼리로 사용자를 식별한다. 토큰이 없으면 익명(시세만),
/// 있는데 유효하지 않으면 401이다.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(state): State<ServerState>,
) -> Response {
    let user_id = match params.get("token") {
        Some(token) => match jwt::validate_token(token) {
            Ok(user_id) => user_id,
            Err(e) => {
                return (
                    StatusCode::UNAUTHORIZED,
                    Json(ErrorBody::new(format!("Unauthorized: {}", e))),
                )
                    .into_response();
            }
        },
        None => 0,
    };

    ws.on_upgrade(move |socket| websocket_connection(socket, state.hub.clone(), user_id))
}

/// WebSocket 연결 처리
async fn websocket_connection(socket: WebSocket, hub: HubHandle, user_id: i64) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let client_id = Uuid::new_v4();
    let (sender, mut outbound) = mpsc::channel::<String>(CLIENT_QUEUE_CAPACITY);

    hub.register(Client {
        id: client_id,
        user_id,
        sender,
    })
    .await;

    info!("WebSocket 연결: {} (user={})", client_id, user_id);

    // writer: 송신 큐를 비워 소켓에 쓴다. 허브가 큐를 닫으면 종료.
    let write_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if ws_sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.send(Message::Close(None)).await;
    });

    // reader: 끊김 감지 전용. 수신 내용은 버린다.
    let read_task = tokio::spawn(async move {
        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });

    // 어느 쪽이 먼저 끝나든 연결 종료로 간주
    tokio::select! {
        _ = write_task => {},
        _ = read_task => {},
    }

    hub.unregister(client_id).await;
    debug!("WebSocket 종료: {}", client_id);
}
