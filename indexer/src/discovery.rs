use std::{collections::BTreeSet, sync::Arc};

use domain::{Address, ErrorKind, SnapshotWarning};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::chain::{ChainClient, TransferSide};

#[derive(Debug, Clone, Copy)]
pub struct DiscoveryPolicy {
    /// Blocks per log query before any splitting.
    pub block_range: u64,
    /// A failing range this small is reported instead of split again.
    pub min_block_range: u64,
}

impl Default for DiscoveryPolicy {
    fn default() -> Self {
        Self {
            block_range: 5_000,
            min_block_range: 16,
        }
    }
}

/// Candidate holdings plus the ranges that could not be scanned.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub contracts: BTreeSet<Address>,
    pub warnings: Vec<SnapshotWarning>,
}

impl Discovery {
    pub fn is_complete(&self) -> bool {
        self.warnings.is_empty()
    }
}

pub struct HoldingDiscoverer {
    client: Arc<dyn ChainClient>,
    policy: DiscoveryPolicy,
}

impl HoldingDiscoverer {
    pub fn new(client: Arc<dyn ChainClient>, policy: DiscoveryPolicy) -> Self {
        let policy = DiscoveryPolicy {
            block_range: policy.block_range.max(1),
            min_block_range: policy.min_block_range.max(1),
        };
        Self { client, policy }
    }

    /// Every ERC-20 contract that emitted a `Transfer` to or from `owner`
    /// within `since_block..=until_block`.
    pub async fn discover(
        &self,
        owner: Address,
        since_block: u64,
        until_block: u64,
        cancel: &CancellationToken,
    ) -> Discovery {
        let mut discovery = Discovery::default();
        if since_block > until_block {
            return discovery;
        }
        for side in [TransferSide::Received, TransferSide::Sent] {
            self.scan(owner, side, since_block, until_block, cancel, &mut discovery)
                .await;
        }
        info!(
            owner = %owner,
            since_block,
            until_block,
            contracts = discovery.contracts.len(),
            gaps = discovery.warnings.len(),
            "holding discovery finished"
        );
        discovery
    }

    async fn scan(
        &self,
        owner: Address,
        side: TransferSide,
        since_block: u64,
        until_block: u64,
        cancel: &CancellationToken,
        discovery: &mut Discovery,
    ) {
        let mut cursor = Some(since_block);
        // split halves waiting to be retried, lower half on top
        let mut pending: Vec<(u64, u64)> = Vec::new();

        loop {
            let (from, to) = match pending.pop() {
                Some(range) => range,
                None => match cursor {
                    Some(start) => {
                        let end = start
                            .saturating_add(self.policy.block_range - 1)
                            .min(until_block);
                        cursor = (end < until_block).then(|| end + 1);
                        (start, end)
                    }
                    None => break,
                },
            };

            if cancel.is_cancelled() {
                discovery.warnings.push(gap(
                    side,
                    from,
                    until_block,
                    "scan cancelled before completion".to_string(),
                ));
                return;
            }

            let query = self.client.transfer_logs(owner, side, from, to);
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = query => Some(result),
            };
            let Some(result) = outcome else {
                discovery.warnings.push(gap(
                    side,
                    from,
                    until_block,
                    "scan cancelled before completion".to_string(),
                ));
                return;
            };

            match result {
                Ok(logs) => {
                    debug!(owner = %owner, %side, from, to, logs = logs.len(), "transfer logs scanned");
                    discovery
                        .contracts
                        .extend(logs.into_iter().map(|log| log.token));
                }
                Err(err) if to - from + 1 > self.policy.min_block_range => {
                    let mid = from + (to - from) / 2;
                    debug!(owner = %owner, %side, from, to, error = %err, "log query failed, halving range");
                    pending.push((mid + 1, to));
                    pending.push((from, mid));
                }
                Err(err) => {
                    warn!(owner = %owner, %side, from, to, error = %err, "giving up on block range");
                    discovery.warnings.push(gap(side, from, to, err.to_string()));
                }
            }
        }
    }
}

fn gap(side: TransferSide, from: u64, to: u64, reason: String) -> SnapshotWarning {
    SnapshotWarning {
        kind: ErrorKind::DiscoveryPartial,
        message: format!("{side} transfers in blocks {from}..={to} not scanned: {reason}"),
        from_block: Some(from),
        to_block: Some(to),
    }
}
