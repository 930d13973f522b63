//! Order identifier allocation
//!
//! Every payment attempt gets its own order id. The gateway accepts 6 to 64
//! characters drawn from `[A-Za-z0-9_-]`.

use rand::{distributions::Alphanumeric, Rng};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

const PREFIX: &str = "ORD";
const MIN_LEN: usize = 6;
const MAX_LEN: usize = 64;

/// How order ids are generated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderIdStrategy {
    /// `ORD-<unix millis>-<6 random alphanumerics>`
    #[default]
    Timestamp,
    /// `ORD-<uuid v4 without dashes>`
    Uuid,
}

impl OrderIdStrategy {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "timestamp" => Some(OrderIdStrategy::Timestamp),
            "uuid" => Some(OrderIdStrategy::Uuid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrderIdAllocator {
    strategy: OrderIdStrategy,
}

impl OrderIdAllocator {
    pub fn new(strategy: OrderIdStrategy) -> Self {
        Self { strategy }
    }

    pub fn allocate(&self) -> String {
        match self.strategy {
            OrderIdStrategy::Timestamp => {
                let millis = time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
                let suffix: String = rand::thread_rng()
                    .sample_iter(&Alphanumeric)
                    .take(6)
                    .map(char::from)
                    .collect();
                format!("{}-{}-{}", PREFIX, millis, suffix)
            }
            OrderIdStrategy::Uuid => format!("{}-{}", PREFIX, Uuid::new_v4().simple()),
        }
    }
}

/// Check an order id against the gateway's format rules
pub fn validate_order_id(order_id: &str) -> BillingResult<()> {
    let len = order_id.len();
    if !(MIN_LEN..=MAX_LEN).contains(&len) {
        return Err(BillingError::InvalidOrderId(format!(
            "length must be between {} and {} characters",
            MIN_LEN, MAX_LEN
        )));
    }
    if !order_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(BillingError::InvalidOrderId(
            "only letters, digits, '-' and '_' are allowed".to_string(),
        ));
    }
    Ok(())
}
