use quantis::server::{start_server, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화 (RUST_LOG로 레벨 제어)
    env_logger::init();

    let config = ServerConfig::from_env();
    start_server(config).await
}
