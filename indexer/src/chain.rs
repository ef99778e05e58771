use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use domain::{Address, BlockRef};
use ethers::{
    contract::abigen,
    providers::Middleware,
    types::{BlockId, BlockNumber, Filter, H256, U256},
    utils::keccak256,
};
use tracing::debug;

use crate::error::ChainError;

abigen!(
    Erc20Token,
    r#"[
        function name() external view returns (string)
        function symbol() external view returns (string)
        function decimals() external view returns (uint8)
        function balanceOf(address owner) external view returns (uint256)
        function allowance(address owner, address spender) external view returns (uint256)
    ]"#,
);

pub const TRANSFER_EVENT_SIGNATURE: &str = "Transfer(address,address,uint256)";

pub fn transfer_topic() -> H256 {
    H256::from(keccak256(TRANSFER_EVENT_SIGNATURE))
}

/// Which indexed side of `Transfer(from, to, value)` must equal the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferSide {
    Received,
    Sent,
}

impl std::fmt::Display for TransferSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransferSide::Received => f.write_str("incoming"),
            TransferSide::Sent => f.write_str("outgoing"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferLog {
    pub token: Address,
    pub from: Address,
    pub to: Address,
    pub block_number: u64,
}

/// Read-only view of an EVM chain with the handful of ERC-20 calls the engine needs.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn latest_block(&self) -> Result<u64, ChainError>;

    async fn block_timestamp(&self, number: u64) -> Result<DateTime<Utc>, ChainError>;

    /// Greatest block whose timestamp is at or before `timestamp`.
    ///
    /// Binary search over block timestamps; clients backed by a
    /// block-by-timestamp index should override this.
    async fn block_by_timestamp(&self, timestamp: DateTime<Utc>) -> Result<u64, ChainError> {
        let latest = self.latest_block().await?;
        if timestamp >= self.block_timestamp(latest).await? {
            return Ok(latest);
        }
        if timestamp < self.block_timestamp(0).await? {
            return Ok(0);
        }
        // ts(low) <= timestamp < ts(high)
        let (mut low, mut high) = (0u64, latest);
        while high - low > 1 {
            let mid = low + (high - low) / 2;
            if self.block_timestamp(mid).await? <= timestamp {
                low = mid;
            } else {
                high = mid;
            }
        }
        debug!(%timestamp, block = low, "mapped timestamp to block");
        Ok(low)
    }

    /// ERC-20 `Transfer` logs with `owner` on the given side, inclusive range.
    async fn transfer_logs(
        &self,
        owner: Address,
        side: TransferSide,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferLog>, ChainError>;

    async fn symbol(&self, token: Address) -> Result<String, ChainError>;

    async fn name(&self, token: Address) -> Result<String, ChainError>;

    async fn decimals(&self, token: Address) -> Result<u8, ChainError>;

    async fn balance_of(
        &self,
        token: Address,
        owner: Address,
        at: BlockRef,
    ) -> Result<U256, ChainError>;

    async fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
        at: BlockRef,
    ) -> Result<U256, ChainError>;

    async fn native_balance(&self, owner: Address, at: BlockRef) -> Result<U256, ChainError>;
}

fn block_id(at: BlockRef) -> BlockId {
    match at {
        BlockRef::Latest => BlockId::Number(BlockNumber::Latest),
        BlockRef::Number(n) => BlockId::Number(BlockNumber::Number(n.into())),
    }
}

/// [`ChainClient`] over any ethers middleware (HTTP or WS provider).
pub struct EthersChainClient<M>
where
    M: Middleware + 'static,
{
    provider: Arc<M>,
}

impl<M> EthersChainClient<M>
where
    M: Middleware + 'static,
{
    pub fn new(provider: Arc<M>) -> Self {
        Self { provider }
    }

    fn token(&self, token: Address) -> Erc20Token<M> {
        Erc20Token::new(token.as_h160(), self.provider.clone())
    }
}

#[async_trait]
impl<M> ChainClient for EthersChainClient<M>
where
    M: Middleware + 'static,
{
    async fn latest_block(&self) -> Result<u64, ChainError> {
        self.provider
            .get_block_number()
            .await
            .map(|n| n.as_u64())
            .map_err(|err| ChainError::classify(err.to_string(), BlockRef::Latest))
    }

    async fn block_timestamp(&self, number: u64) -> Result<DateTime<Utc>, ChainError> {
        let at = BlockRef::Number(number);
        let block = self
            .provider
            .get_block(BlockNumber::Number(number.into()))
            .await
            .map_err(|err| ChainError::classify(err.to_string(), at))?
            .ok_or(ChainError::BlockNotFound(number))?;
        DateTime::<Utc>::from_timestamp(block.timestamp.low_u64() as i64, 0)
            .ok_or_else(|| ChainError::Decode(format!("invalid timestamp on block {number}")))
    }

    async fn transfer_logs(
        &self,
        owner: Address,
        side: TransferSide,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<TransferLog>, ChainError> {
        let filter = Filter::new()
            .topic0(transfer_topic())
            .from_block(BlockNumber::Number(from_block.into()))
            .to_block(BlockNumber::Number(to_block.into()));
        let filter = match side {
            TransferSide::Received => filter.topic2(owner.to_topic()),
            TransferSide::Sent => filter.topic1(owner.to_topic()),
        };

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .map_err(|err| ChainError::classify(err.to_string(), BlockRef::Number(to_block)))?;

        // ERC-721 shares the signature but indexes the token id as a fourth topic.
        Ok(logs
            .into_iter()
            .filter(|log| log.topics.len() == 3)
            .map(|log| TransferLog {
                token: log.address.into(),
                from: Address::from_topic(&log.topics[1]),
                to: Address::from_topic(&log.topics[2]),
                block_number: log.block_number.map(|n| n.as_u64()).unwrap_or(from_block),
            })
            .collect())
    }

    async fn symbol(&self, token: Address) -> Result<String, ChainError> {
        self.token(token)
            .symbol()
            .call()
            .await
            .map_err(|err| ChainError::classify(err.to_string(), BlockRef::Latest))
    }

    async fn name(&self, token: Address) -> Result<String, ChainError> {
        self.token(token)
            .name()
            .call()
            .await
            .map_err(|err| ChainError::classify(err.to_string(), BlockRef::Latest))
    }

    async fn decimals(&self, token: Address) -> Result<u8, ChainError> {
        self.token(token)
            .decimals()
            .call()
            .await
            .map_err(|err| ChainError::classify(err.to_string(), BlockRef::Latest))
    }

    async fn balance_of(
        &self,
        token: Address,
        owner: Address,
        at: BlockRef,
    ) -> Result<U256, ChainError> {
        self.token(token)
            .balance_of(owner.as_h160())
            .block(block_id(at))
            .call()
            .await
            .map_err(|err| ChainError::classify(err.to_string(), at))
    }

    async fn allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
        at: BlockRef,
    ) -> Result<U256, ChainError> {
        self.token(token)
            .allowance(owner.as_h160(), spender.as_h160())
            .block(block_id(at))
            .call()
            .await
            .map_err(|err| ChainError::classify(err.to_string(), at))
    }

    async fn native_balance(&self, owner: Address, at: BlockRef) -> Result<U256, ChainError> {
        self.provider
            .get_balance(owner.as_h160(), Some(block_id(at)))
            .await
            .map_err(|err| ChainError::classify(err.to_string(), at))
    }
}
