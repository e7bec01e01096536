//! 영속 계층의 타입드 접근자.
//!
//! 읽기는 풀에서 암묵적 커넥션을 쓰고, 쓰기는 호출자의 트랜잭션
//! 커넥션을 명시적으로 받아 체결 트랜잭션 안에서 조합된다.

use chrono::Utc;
use sqlx::sqlite::SqlitePool;
use sqlx::{Error as SqlxError, SqliteConnection};

use super::models::{
    LeveragePosition, Order, OrderSide, OrderStatus, OrderType, PositionSide, PositionStatus,
    Transaction, TransactionType, User, Wallet,
};

/// 신규 사용자의 기본 지갑 구성: USDT는 시드 잔고, 나머지는 0
const DEFAULT_WALLETS: [(&str, f64); 4] = [
    ("USDT", 100_000.0),
    ("BTC", 0.0),
    ("ETH", 0.0),
    ("SOL", 0.0),
];

/// 사용자 저장소
pub struct UserRepository;

impl UserRepository {
    /// 사용자 생성
    pub async fn insert(
        pool: &SqlitePool,
        name: &str,
        email: &str,
        password_hash: &str,
    ) -> Result<i64, SqlxError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO user (name, email, password, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(name)
        .bind(email)
        .bind(password_hash)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// 이메일로 조회
    pub async fn find_by_email(pool: &SqlitePool, email: &str) -> Result<Option<User>, SqlxError> {
        sqlx::query_as::<_, User>("SELECT * FROM user WHERE email = ?")
            .bind(email)
            .fetch_optional(pool)
            .await
    }

    /// ID로 조회
    pub async fn find_by_id(pool: &SqlitePool, user_id: i64) -> Result<Option<User>, SqlxError> {
        sqlx::query_as::<_, User>("SELECT * FROM user WHERE id = ?")
            .bind(user_id)
            .fetch_optional(pool)
            .await
    }
}

/// 지갑 저장소
pub struct WalletRepository;

impl WalletRepository {
    /// 트랜잭션 안에서 지갑 조회
    pub async fn fetch(
        conn: &mut SqliteConnection,
        user_id: i64,
        symbol: &str,
    ) -> Result<Option<Wallet>, SqlxError> {
        sqlx::query_as::<_, Wallet>("SELECT * FROM wallet WHERE user_id = ? AND symbol = ?")
            .bind(user_id)
            .bind(symbol)
            .fetch_optional(&mut *conn)
            .await
    }

    /// 트랜잭션 안에서 지갑 조회, 없으면 잔고 0으로 생성
    pub async fn fetch_or_create(
        conn: &mut SqliteConnection,
        user_id: i64,
        symbol: &str,
    ) -> Result<Wallet, SqlxError> {
        if let Some(wallet) = Self::fetch(conn, user_id, symbol).await? {
            return Ok(wallet);
        }

        let now = Utc::now();
        sqlx::query(
            "INSERT INTO wallet (user_id, symbol, balance, locked, created_at, updated_at)
             VALUES (?, ?, 0, 0, ?, ?)",
        )
        .bind(user_id)
        .bind(symbol)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        match Self::fetch(conn, user_id, symbol).await? {
            Some(wallet) => Ok(wallet),
            None => Err(SqlxError::RowNotFound),
        }
    }

    /// 잔고/잠금액 갱신 (절대값 기록, 체결 트랜잭션 전용)
    pub async fn update_balances(
        conn: &mut SqliteConnection,
        wallet_id: i64,
        balance: f64,
        locked: f64,
    ) -> Result<(), SqlxError> {
        sqlx::query("UPDATE wallet SET balance = ?, locked = ?, updated_at = ? WHERE id = ?")
            .bind(balance)
            .bind(locked)
            .bind(Utc::now())
            .bind(wallet_id)
            .execute(&mut *conn)
            .await?;

        Ok(())
    }

    /// 사용자의 모든 지갑 조회
    pub async fn find_all_by_user(
        pool: &SqlitePool,
        user_id: i64,
    ) -> Result<Vec<Wallet>, SqlxError> {
        sqlx::query_as::<_, Wallet>("SELECT * FROM wallet WHERE user_id = ? ORDER BY id")
            .bind(user_id)
            .fetch_all(pool)
            .await
    }

    /// 신규 사용자 기본 지갑 초기화 (이미 있으면 무시)
    pub async fn init_default_wallets(pool: &SqlitePool, user_id: i64) -> Result<(), SqlxError> {
        let now = Utc::now();
        for (symbol, balance) in DEFAULT_WALLETS {
            sqlx::query(
                "INSERT OR IGNORE INTO wallet (user_id, symbol, balance, locked, created_at, updated_at)
                 VALUES (?, ?, ?, 0, ?, ?)",
            )
            .bind(user_id)
            .bind(symbol)
            .bind(balance)
            .bind(now)
            .bind(now)
            .execute(pool)
            .await?;
        }
        Ok(())
    }
}

/// 주문 저장소
pub struct OrderRepository;

impl OrderRepository {
    /// 현물 주문 생성 (PENDING 상태)
    pub async fn create(
        pool: &SqlitePool,
        user_id: i64,
        symbol: &str,
        order_type: OrderType,
        side: OrderSide,
        quantity: f64,
        limit_price: Option<f64>,
    ) -> Result<Order, SqlxError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO orders (user_id, symbol, type, side, quantity, limit_price, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(symbol)
        .bind(order_type)
        .bind(side)
        .bind(quantity)
        .bind(limit_price)
        .bind(OrderStatus::Pending)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        match Self::find_by_id(pool, result.last_insert_rowid()).await? {
            Some(order) => Ok(order),
            None => Err(SqlxError::RowNotFound),
        }
    }

    /// 레버리지 주문 생성 (PENDING 상태)
    pub async fn create_leverage(
        pool: &SqlitePool,
        user_id: i64,
        symbol: &str,
        order_type: OrderType,
        side: OrderSide,
        quantity: f64,
        limit_price: Option<f64>,
        leverage: i64,
        position_side: PositionSide,
    ) -> Result<Order, SqlxError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO orders (user_id, symbol, type, side, quantity, limit_price, is_leverage, leverage, position_side, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(symbol)
        .bind(order_type)
        .bind(side)
        .bind(quantity)
        .bind(limit_price)
        .bind(leverage)
        .bind(position_side)
        .bind(OrderStatus::Pending)
        .bind(now)
        .bind(now)
        .execute(pool)
        .await?;

        match Self::find_by_id(pool, result.last_insert_rowid()).await? {
            Some(order) => Ok(order),
            None => Err(SqlxError::RowNotFound),
        }
    }

    /// 트랜잭션 안에서 주문 조회
    pub async fn fetch(
        conn: &mut SqliteConnection,
        order_id: i64,
    ) -> Result<Option<Order>, SqlxError> {
        sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = ?")
            .bind(order_id)
            .fetch_optional(&mut *conn)
            .await
    }

    /// ID로 조회
    pub async fn find_by_id(pool: &SqlitePool, order_id: i64) -> Result<Option<Order>, SqlxError> {
        sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE id = ?")
            .bind(order_id)
            .fetch_optional(pool)
            .await
    }

    /// 사용자별 주문 조회 (최신순)
    pub async fn find_by_user(
        pool: &SqlitePool,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Order>, SqlxError> {
        sqlx::query_as::<_, Order>(
            "SELECT * FROM orders WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
    }

    /// 사용자 × 거래쌍별 주문 조회 (최신순)
    pub async fn find_by_user_and_symbol(
        pool: &SqlitePool,
        user_id: i64,
        symbol: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Order>, SqlxError> {
        sqlx::query_as::<_, Order>(
            "SELECT * FROM orders WHERE user_id = ? AND symbol = ? ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(symbol)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
    }

    /// 대기 중인 지정가 주문 전체 조회 (매처 초기 적재용)
    pub async fn pending_limit_orders(pool: &SqlitePool) -> Result<Vec<Order>, SqlxError> {
        sqlx::query_as::<_, Order>("SELECT * FROM orders WHERE type = ? AND status = ?")
            .bind(OrderType::Limit)
            .bind(OrderStatus::Pending)
            .fetch_all(pool)
            .await
    }

    /// 체결 완료 처리 (체결 트랜잭션 안에서 호출)
    pub async fn complete(
        conn: &mut SqliteConnection,
        order_id: i64,
        price: f64,
        total_amount: f64,
    ) -> Result<(), SqlxError> {
        sqlx::query(
            "UPDATE orders SET status = ?, price = ?, total_amount = ?, error_msg = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(OrderStatus::Completed)
        .bind(price)
        .bind(total_amount)
        .bind(Utc::now())
        .bind(order_id)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// 취소 처리 (취소 트랜잭션 안에서 호출)
    pub async fn cancel(conn: &mut SqliteConnection, order_id: i64) -> Result<(), SqlxError> {
        sqlx::query("UPDATE orders SET status = ?, updated_at = ? WHERE id = ?")
            .bind(OrderStatus::Canceled)
            .bind(Utc::now())
            .bind(order_id)
            .execute(&mut *conn)
            .await?;

        Ok(())
    }

    /// 체결 실패 기록 (롤백 후 트랜잭션 밖에서 호출)
    pub async fn mark_failed(
        pool: &SqlitePool,
        order_id: i64,
        error_msg: &str,
    ) -> Result<(), SqlxError> {
        sqlx::query("UPDATE orders SET status = ?, error_msg = ?, updated_at = ? WHERE id = ?")
            .bind(OrderStatus::Failed)
            .bind(error_msg)
            .bind(Utc::now())
            .bind(order_id)
            .execute(pool)
            .await?;

        Ok(())
    }
}

/// 원장 저장소 (append-only)
pub struct TransactionRepository;

impl TransactionRepository {
    /// 원장 기록 추가 (체결 트랜잭션 안에서 호출)
    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        conn: &mut SqliteConnection,
        user_id: i64,
        order_id: Option<i64>,
        tx_type: TransactionType,
        symbol: &str,
        amount: f64,
        balance_before: f64,
        balance_after: f64,
        description: &str,
    ) -> Result<(), SqlxError> {
        sqlx::query(
            "INSERT INTO transactions (user_id, order_id, type, symbol, amount, balance_before, balance_after, description, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(order_id)
        .bind(tx_type)
        .bind(symbol)
        .bind(amount)
        .bind(balance_before)
        .bind(balance_after)
        .bind(description)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// 사용자별 원장 조회 (최신순)
    pub async fn find_by_user(
        pool: &SqlitePool,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Transaction>, SqlxError> {
        sqlx::query_as::<_, Transaction>(
            "SELECT * FROM transactions WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
    }

    /// 사용자 × 자산별 원장 조회 (최신순)
    pub async fn find_by_user_and_symbol(
        pool: &SqlitePool,
        user_id: i64,
        symbol: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Transaction>, SqlxError> {
        sqlx::query_as::<_, Transaction>(
            "SELECT * FROM transactions WHERE user_id = ? AND symbol = ? ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(symbol)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
    }

    /// 주문별 원장 조회 (시간순)
    pub async fn find_by_order(
        pool: &SqlitePool,
        order_id: i64,
    ) -> Result<Vec<Transaction>, SqlxError> {
        sqlx::query_as::<_, Transaction>(
            "SELECT * FROM transactions WHERE order_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(order_id)
        .fetch_all(pool)
        .await
    }
}

/// 레버리지 포지션 저장소
pub struct PositionRepository;

impl PositionRepository {
    /// OPEN 포지션 생성 (개설 트랜잭션 안에서 호출)
    #[allow(clippy::too_many_arguments)]
    pub async fn insert(
        conn: &mut SqliteConnection,
        user_id: i64,
        order_id: Option<i64>,
        symbol: &str,
        side: PositionSide,
        leverage: i64,
        entry_price: f64,
        quantity: f64,
        margin: f64,
        liquidation_price: f64,
    ) -> Result<i64, SqlxError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO leverage_position
             (user_id, order_id, symbol, side, leverage, entry_price, quantity, margin, liquidation_price, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(order_id)
        .bind(symbol)
        .bind(side)
        .bind(leverage)
        .bind(entry_price)
        .bind(quantity)
        .bind(margin)
        .bind(liquidation_price)
        .bind(PositionStatus::Open)
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// 트랜잭션 안에서 포지션 조회
    pub async fn fetch(
        conn: &mut SqliteConnection,
        position_id: i64,
    ) -> Result<Option<LeveragePosition>, SqlxError> {
        sqlx::query_as::<_, LeveragePosition>("SELECT * FROM leverage_position WHERE id = ?")
            .bind(position_id)
            .fetch_optional(&mut *conn)
            .await
    }

    /// ID로 조회
    pub async fn find_by_id(
        pool: &SqlitePool,
        position_id: i64,
    ) -> Result<Option<LeveragePosition>, SqlxError> {
        sqlx::query_as::<_, LeveragePosition>("SELECT * FROM leverage_position WHERE id = ?")
            .bind(position_id)
            .fetch_optional(pool)
            .await
    }

    /// 사용자의 보유 포지션 조회
    pub async fn open_by_user(
        pool: &SqlitePool,
        user_id: i64,
    ) -> Result<Vec<LeveragePosition>, SqlxError> {
        sqlx::query_as::<_, LeveragePosition>(
            "SELECT * FROM leverage_position WHERE user_id = ? AND status = ? ORDER BY created_at DESC, id DESC",
        )
        .bind(user_id)
        .bind(PositionStatus::Open)
        .fetch_all(pool)
        .await
    }

    /// 전체 보유 포지션 조회 (청산 감시용)
    pub async fn all_open(pool: &SqlitePool) -> Result<Vec<LeveragePosition>, SqlxError> {
        sqlx::query_as::<_, LeveragePosition>("SELECT * FROM leverage_position WHERE status = ?")
            .bind(PositionStatus::Open)
            .fetch_all(pool)
            .await
    }

    /// 사용자별 포지션 이력 조회 (최신순)
    pub async fn find_by_user(
        pool: &SqlitePool,
        user_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<LeveragePosition>, SqlxError> {
        sqlx::query_as::<_, LeveragePosition>(
            "SELECT * FROM leverage_position WHERE user_id = ? ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
    }

    /// 사용자 × 거래쌍별 포지션 이력 조회 (최신순)
    pub async fn find_by_user_and_symbol(
        pool: &SqlitePool,
        user_id: i64,
        symbol: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<LeveragePosition>, SqlxError> {
        sqlx::query_as::<_, LeveragePosition>(
            "SELECT * FROM leverage_position WHERE user_id = ? AND symbol = ? ORDER BY created_at DESC, id DESC LIMIT ? OFFSET ?",
        )
        .bind(user_id)
        .bind(symbol)
        .bind(limit)
        .bind(offset)
        .fetch_all(pool)
        .await
    }

    /// 포지션 종료 기록 (CLOSED/LIQUIDATED, 종료 트랜잭션 안에서 호출)
    pub async fn mark_closed(
        conn: &mut SqliteConnection,
        position_id: i64,
        status: PositionStatus,
        exit_price: f64,
        realized_pnl: f64,
    ) -> Result<(), SqlxError> {
        let now = Utc::now();
        sqlx::query(
            "UPDATE leverage_position
             SET status = ?, exit_price = ?, realized_pnl = ?, unrealized_pnl = 0, closed_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(status)
        .bind(exit_price)
        .bind(realized_pnl)
        .bind(now)
        .bind(now)
        .bind(position_id)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    /// 미실현 손익 갱신 (주기적 새로고침, 표시용 지연값)
    pub async fn update_unrealized_pnl(
        pool: &SqlitePool,
        position_id: i64,
        unrealized_pnl: f64,
    ) -> Result<(), SqlxError> {
        sqlx::query("UPDATE leverage_position SET unrealized_pnl = ?, updated_at = ? WHERE id = ?")
            .bind(unrealized_pnl)
            .bind(Utc::now())
            .bind(position_id)
            .execute(pool)
            .await?;

        Ok(())
    }
}
