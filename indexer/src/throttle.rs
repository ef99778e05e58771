use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{Address, BlockRef};
use ethers::types::U256;
use tokio::{
    sync::{Mutex, OwnedSemaphorePermit, Semaphore},
    time::{sleep_until, Instant},
};

use crate::{
    chain::{ChainClient, TransferLog, TransferSide},
    error::ChainError,
};

#[derive(Debug, Clone, Copy)]
pub struct ThrottlePolicy {
    pub max_in_flight: usize,
    pub min_interval: Duration,
}

impl Default for ThrottlePolicy {
    fn default() -> Self {
        Self {
            max_in_flight: 8,
            min_interval: Duration::from_millis(25),
        }
    }
}

/// Shared gate in front of an upstream node: caps in-flight calls and spaces
/// their start times so a burst from the worker pool stays under the provider quota.
pub struct ThrottledChainClient<C> {
    inner: C,
    permits: Arc<Semaphore>,
    min_interval: Duration,
    next_slot: Mutex<Instant>,
}

impl<C> ThrottledChainClient<C>
where
    C: ChainClient,
{
    pub fn new(inner: C, policy: ThrottlePolicy) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(policy.max_in_flight.max(1))),
            min_interval: policy.min_interval,
            next_slot: Mutex::new(Instant::now()),
        }
    }

    async fn admit(&self) -> Result<OwnedSemaphorePermit, ChainError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ChainError::Transport("chain client throttle closed".to_string()))?;
        let slot = {
            let mut next = self.next_slot.lock().await;
            let slot = (*next).max(Instant::now());
            *next = slot + self.min_interval;
            slot
        };
        sleep_until(slot).await;
        Ok(permit)
    }
}

#[async_trait]
impl<C> ChainClient for ThrottledChainClient<C>
where
    C: ChainClient,
{
    async fn latest_block(&self) -> Result<u64, ChainError> {
        let _permit = self.admit().await?;
        self.inner.latest_block().await
    }

    async fn block_timestamp(&self, number: u64) -> Result<DateTime<Utc>, ChainError> {
        let _permit = self.admit().await?;
        self.inner.block_timestamp(number).await
    }

    async fn transfer_logs(
        &self,
        owner: Address,
        side: TransferSide,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferLog>, ChainError> {
        let _permit = self.admit().await?;
        self.inner
            .transfer_logs(owner, side, from_block, to_block)
            .await
    }

    async fn symbol(&self, token: Address) -> Result<String, ChainError> {
        let _permit = self.admit().await?;
        self.inner.symbol(token).await
    }

    async fn name(&self, token: Address) -> Result<String, ChainError> {
        let _permit = self.admit().await?;
        self.inner.name(token).await
    }

    async fn decimals(&self, token: Address) -> Result<u8, ChainError> {
        let _permit = self.admit().await?;
        self.inner.decimals(token).await
    }

    async fn balance_of(
        &self,
        token: Address,
        owner: Address,
        at: BlockRef,
    ) -> Result<U256, ChainError> {
        let _permit = self.admit().await?;
        self.inner.balance_of(token, owner, at).await
    }

    async fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
        at: BlockRef,
    ) -> Result<U256, ChainError> {
        let _permit = self.admit().await?;
        self.inner.allowance(token, owner, spender, at).await
    }

    async fn native_balance(&self, owner: Address, at: BlockRef) -> Result<U256, ChainError> {
        let _permit = self.admit().await?;
        self.inner.native_balance(owner, at).await
    }
}
