use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    #[error("db error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("order not found: {0}")]
    OrderNotFound(Uuid),
    #[error("order {order_id} not matchable: {reason}")]
    NotMatchable { order_id: Uuid, reason: &'static str },
    #[error("book not crossed: bid={bid_cents} offer={offer_cents}")]
    NotCrossed { bid_cents: i64, offer_cents: i64 },
    #[error("{0}")]
    Internal(String),
}

impl MatchError {
    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

pub type MatchResult<T> = Result<T, MatchError>;
