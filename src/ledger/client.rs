//! Asset Ledger boundary
//!
//! The saga reaches the ledger only through [`LedgerClient`], conceptually a
//! remote call:
//!
//! - `reserve {customerId, instrument, amount, orderId}` → ok | InsufficientBalance | NotFound
//! - `release {customerId, instrument, amount}` → ok (best effort, compensation)
//! - `balanceCheck {customerId, instrument, amount}` → bool (advisory)
//!
//! [`TimeoutLedgerClient`] bounds every call; a timeout is a transient
//! failure, never a success.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::error::LedgerError;
use super::types::ReserveOutcome;
use super::AssetLedger;
use crate::core_types::{CustomerId, OrderId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveRequest {
    pub customer_id: CustomerId,
    pub instrument: String,
    pub amount: Decimal,
    pub order_id: OrderId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseRequest {
    pub customer_id: CustomerId,
    pub instrument: String,
    pub amount: Decimal,
    /// Scope the release to this order's reservation (idempotent)
    pub order_id: Option<OrderId>,
}

#[async_trait]
pub trait LedgerClient: Send + Sync {
    async fn reserve(&self, req: &ReserveRequest) -> Result<ReserveOutcome, LedgerError>;

    async fn release(&self, req: &ReleaseRequest) -> Result<(), LedgerError>;

    async fn balance_check(
        &self,
        customer_id: CustomerId,
        instrument: &str,
        amount: Decimal,
    ) -> Result<bool, LedgerError>;
}

/// In-process adapter over an [`AssetLedger`].
pub struct LocalLedgerClient {
    ledger: Arc<dyn AssetLedger>,
}

impl LocalLedgerClient {
    pub fn new(ledger: Arc<dyn AssetLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl LedgerClient for LocalLedgerClient {
    async fn reserve(&self, req: &ReserveRequest) -> Result<ReserveOutcome, LedgerError> {
        self.ledger
            .reserve_for_order(req.order_id, req.customer_id, &req.instrument, req.amount)
            .await
    }

    async fn release(&self, req: &ReleaseRequest) -> Result<(), LedgerError> {
        match req.order_id {
            Some(order_id) => {
                self.ledger
                    .release_for_order(order_id, Some(req.amount))
                    .await?;
            }
            None => {
                self.ledger
                    .release(req.customer_id, &req.instrument, req.amount)
                    .await?;
            }
        }
        Ok(())
    }

    async fn balance_check(
        &self,
        customer_id: CustomerId,
        instrument: &str,
        amount: Decimal,
    ) -> Result<bool, LedgerError> {
        self.ledger
            .balance_check(customer_id, instrument, amount)
            .await
    }
}

/// Bounds every call of the wrapped client.
pub struct TimeoutLedgerClient {
    inner: Arc<dyn LedgerClient>,
    timeout: Duration,
}

impl TimeoutLedgerClient {
    pub fn new(inner: Arc<dyn LedgerClient>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl std::future::Future<Output = Result<T, LedgerError>> + Send,
    ) -> Result<T, LedgerError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                warn!(op, timeout_ms = self.timeout.as_millis() as u64, "Ledger call timed out");
                Err(LedgerError::Timeout(self.timeout))
            }
        }
    }
}

#[async_trait]
impl LedgerClient for TimeoutLedgerClient {
    async fn reserve(&self, req: &ReserveRequest) -> Result<ReserveOutcome, LedgerError> {
        self.bounded("reserve", self.inner.reserve(req)).await
    }

    async fn release(&self, req: &ReleaseRequest) -> Result<(), LedgerError> {
        self.bounded("release", self.inner.release(req)).await
    }

    async fn balance_check(
        &self,
        customer_id: CustomerId,
        instrument: &str,
        amount: Decimal,
    ) -> Result<bool, LedgerError> {
        self.bounded(
            "balance_check",
            self.inner.balance_check(customer_id, instrument, amount),
        )
        .await
    }
}


#[cfg(test)]
mod tests {
    use super::mock::{MockFailure, MockLedgerClient};
    use super::*;
    use crate::ledger::MemoryLedger;
    use crate::outbox::MemoryOutbox;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn request(customer_id: CustomerId, amount: Decimal) -> ReserveRequest {
        ReserveRequest {
            customer_id,
            instrument: "TRY".into(),
            amount,
            order_id: Uuid::new_v4(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_transient_error() {
        let mock = Arc::new(MockLedgerClient::new());
        mock.set_delay(Some(Duration::from_secs(10)));
        let client = TimeoutLedgerClient::new(mock.clone(), Duration::from_millis(100));

        let err = client
            .reserve(&request(Uuid::new_v4(), dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Timeout(_)));
        assert!(err.is_transient());
        assert_eq!(mock.reserve_count(), 1);
    }

    #[tokio::test]
    async fn test_business_errors_pass_through_timeout_wrapper() {
        let mock = Arc::new(MockLedgerClient::new());
        mock.fail_reserve(Some(MockFailure::Insufficient));
        let client = TimeoutLedgerClient::new(mock, Duration::from_secs(1));
        let err = client
            .reserve(&request(Uuid::new_v4(), dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientBalance { .. }));
    }

    #[tokio::test]
    async fn test_local_client_reserve_and_scoped_release() {
        let ledger = Arc::new(MemoryLedger::new(Arc::new(MemoryOutbox::new())));
        let c = Uuid::new_v4();
        ledger.credit(c, "TRY", dec!(1000)).await.unwrap();
        let client = LocalLedgerClient::new(ledger.clone());

        let req = request(c, dec!(400));
        assert_eq!(client.reserve(&req).await.unwrap(), ReserveOutcome::Reserved);
        assert_eq!(
            client.reserve(&req).await.unwrap(),
            ReserveOutcome::AlreadyReserved
        );
        assert!(client.balance_check(c, "TRY", dec!(600)).await.unwrap());
        assert!(!client.balance_check(c, "TRY", dec!(601)).await.unwrap());

        let release = ReleaseRequest {
            customer_id: c,
            instrument: "TRY".into(),
            amount: dec!(400),
            order_id: Some(req.order_id),
        };
        client.release(&release).await.unwrap();
        client.release(&release).await.unwrap();
        let b = ledger.balance(c, "TRY").await.unwrap().unwrap();
        assert_eq!((b.usable(), b.blocked()), (dec!(1000), dec!(0)));
    }
}
