use std::sync::Arc;

use domain::{Address, BlockRef, FormattedBalance, RawBalance, SnapshotAt, TokenMetadata};
use tracing::debug;

use crate::{
    chain::ChainClient,
    error::{ChainError, TokenError},
    metadata::TokenMetadataResolver,
};

/// Point reads of balances and allowances, optionally pinned to a past block.
pub struct BalanceFetcher {
    client: Arc<dyn ChainClient>,
    metadata: Arc<TokenMetadataResolver>,
}

impl BalanceFetcher {
    pub fn new(client: Arc<dyn ChainClient>, metadata: Arc<TokenMetadataResolver>) -> Self {
        Self { client, metadata }
    }

    /// `balanceOf(owner)` on `token`; the native sentinel reads the coin balance instead.
    pub async fn fetch_balance(
        &self,
        owner: Address,
        token: Address,
        at: BlockRef,
    ) -> Result<RawBalance, TokenError> {
        if token.is_native() {
            return self.fetch_native_balance(owner, at).await;
        }
        let raw_amount = self
            .client
            .balance_of(token, owner, at)
            .await
            .map_err(|err| TokenError::balance(token, err))?;
        debug!(owner = %owner, token = %token, block = %at, raw = %raw_amount, "balance fetched");
        Ok(RawBalance {
            contract_address: token,
            owner_address: owner,
            raw_amount,
            at_block: at,
        })
    }

    pub async fn fetch_native_balance(
        &self,
        owner: Address,
        at: BlockRef,
    ) -> Result<RawBalance, TokenError> {
        let contract = domain::NATIVE_TOKEN_ADDRESS;
        let raw_amount = self
            .client
            .native_balance(owner, at)
            .await
            .map_err(|err| TokenError::balance(contract, err))?;
        Ok(RawBalance {
            contract_address: contract,
            owner_address: owner,
            raw_amount,
            at_block: at,
        })
    }

    /// Balance scaled by the token's own decimals.
    pub async fn fetch_formatted(
        &self,
        owner: Address,
        token: Address,
        at: BlockRef,
    ) -> Result<(TokenMetadata, FormattedBalance), TokenError> {
        let (metadata, raw) = tokio::try_join!(
            self.metadata.resolve(token),
            self.fetch_balance(owner, token, at),
        )?;
        let formatted = raw.format(metadata.decimals);
        Ok((metadata, formatted))
    }

    /// `allowance(owner, spender)` on `token`, scaled by its decimals.
    pub async fn fetch_allowance(
        &self,
        token: Address,
        owner: Address,
        spender: Address,
        at: BlockRef,
    ) -> Result<(TokenMetadata, FormattedBalance), TokenError> {
        let allowance = async {
            self.client
                .allowance(token, owner, spender, at)
                .await
                .map_err(|err| TokenError::balance(token, err))
        };
        let (metadata, raw) = tokio::try_join!(self.metadata.resolve(token), allowance)?;
        let decimals = metadata.decimals;
        Ok((metadata, FormattedBalance::new(raw, decimals)))
    }

    /// Pins a snapshot request to a concrete block. A block past the head is
    /// [`ChainError::BlockAhead`], never a pruned-state failure.
    pub async fn resolve_block(&self, at: SnapshotAt) -> Result<BlockRef, ChainError> {
        match at {
            SnapshotAt::Latest => self.client.latest_block().await.map(BlockRef::Number),
            SnapshotAt::Block(number) => {
                let latest = self.client.latest_block().await?;
                if number > latest {
                    return Err(ChainError::BlockAhead {
                        requested: number,
                        latest,
                    });
                }
                Ok(BlockRef::Number(number))
            }
            SnapshotAt::Timestamp(timestamp) => self
                .client
                .block_by_timestamp(timestamp)
                .await
                .map(BlockRef::Number),
        }
    }
}
