//! In-memory implementation of TransactionStore.
//!
//! Uses `Arc<RwLock<HashMap<String, Transaction>>>` for shared concurrent
//! access. Used by tests and sandbox deployments where persistence is not
//! required; the compare-and-swap semantics match the SQLite adapter.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::domain::{Transaction, TransactionStatus};
use crate::ports::{StoreResult, TransactionStore};

#[derive(Default, Clone)]
pub struct InMemoryTransactionStore {
    transactions: Arc<RwLock<HashMap<String, Transaction>>>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.transactions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.transactions.read().await.is_empty()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn put(&self, tx: &Transaction) -> StoreResult<()> {
        let mut transactions = self.transactions.write().await;
        transactions.insert(tx.id.clone(), tx.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> StoreResult<Option<Transaction>> {
        let transactions = self.transactions.read().await;
        Ok(transactions.get(id).cloned())
    }

    async fn update_if_status(
        &self,
        tx: &Transaction,
        expected: TransactionStatus,
    ) -> StoreResult<bool> {
        let mut transactions = self.transactions.write().await;
        match transactions.get_mut(&tx.id) {
            Some(stored) if stored.status == expected => {
                *stored = tx.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn health_check(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> Transaction {
        Transaction::new(
            id.to_string(),
            1200,
            "usd".to_string(),
            "prod_9".to_string(),
            "seller_9".to_string(),
            "buyer_9".to_string(),
            true,
            "Z9Y8X7".to_string(),
        )
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let store = InMemoryTransactionStore::new();
        store.put(&sample("pi_1")).await.unwrap();

        let loaded = store.get("pi_1").await.unwrap().unwrap();
        assert_eq!(loaded.amount, 1200);
        assert!(store.get("pi_2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_conditional_update_checks_status() {
        let store = InMemoryTransactionStore::new();
        let mut tx = sample("pi_1");
        store.put(&tx).await.unwrap();

        tx.status = TransactionStatus::Paid;
        assert!(store
            .update_if_status(&tx, TransactionStatus::Pending)
            .await
            .unwrap());

        tx.status = TransactionStatus::Completed;
        assert!(!store
            .update_if_status(&tx, TransactionStatus::Pending)
            .await
            .unwrap());
        assert_eq!(
            store.get("pi_1").await.unwrap().unwrap().status,
            TransactionStatus::Paid
        );
    }

    #[tokio::test]
    async fn test_conditional_update_on_absent_id() {
        let store = InMemoryTransactionStore::new();
        let tx = sample("pi_ghost");
        assert!(!store
            .update_if_status(&tx, TransactionStatus::Pending)
            .await
            .unwrap());
    }
}
