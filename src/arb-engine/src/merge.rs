//! CTF merge: turn a filled Yes+No pair back into collateral.
//!
//! One `mergePositions` call burns qty of each outcome token and credits
//! qty USDC, realizing the spread without waiting for resolution. The call
//! goes through a nonce-tracked signer (alloy's wallet filler allocates
//! nonces in submission order) and is retried on transient chain failure
//! with bounded exponential backoff and fresh gas estimation. A receipt
//! re-check after confirmation catches reorged transactions and
//! retriggers the merge; retries are idempotent because the token burn
//! can succeed at most once per pair.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

/// Outcome-token units per contract: USDC's 6 decimals.
const USDC_UNITS_PER_CONTRACT: u128 = 1_000_000;

/// What the coordinator sees: merge a pair, get the confirmed tx hash.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MergeExecutor: Send + Sync {
    async fn merge_pair(&self, condition_id: &str, qty: u64) -> Result<String>;
}

/// Raw chain operations behind the merge logic, separated so the retry
/// and reorg handling is testable without a chain.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainOps: Send + Sync {
    /// Submit `mergePositions` for the condition; returns the tx hash of
    /// the mined transaction.
    async fn send_merge(&self, condition_id: &str, amount: u128) -> Result<String>;

    /// Whether the transaction is still present in the canonical chain.
    async fn receipt_exists(&self, tx_hash: &str) -> Result<bool>;

    /// Grant the exchange ERC-1155 operator rights if not already held.
    async fn ensure_approval(&self) -> Result<()>;
}

pub struct CtfMerger {
    chain: Arc<dyn ChainOps>,
    max_retries: u32,
    /// Settle time before the receipt re-check.
    reorg_wait: Duration,
    approved: tokio::sync::OnceCell<()>,
}

impl CtfMerger {
    pub fn new(chain: Arc<dyn ChainOps>, max_retries: u32, reorg_wait: Duration) -> Self {
        Self {
            chain,
            max_retries,
            reorg_wait,
            approved: tokio::sync::OnceCell::new(),
        }
    }
}

#[async_trait]
impl MergeExecutor for CtfMerger {
    async fn merge_pair(&self, condition_id: &str, qty: u64) -> Result<String> {
        self.approved
            .get_or_try_init(|| self.chain.ensure_approval())
            .await?;

        let amount = qty as u128 * USDC_UNITS_PER_CONTRACT;
        let mut delay = Duration::from_millis(500);

        for attempt in 1..=self.max_retries {
            match self.chain.send_merge(condition_id, amount).await {
                Ok(tx_hash) => {
                    tokio::time::sleep(self.reorg_wait).await;
                    match self.chain.receipt_exists(&tx_hash).await {
                        Ok(true) => {
                            info!("Merged {} pairs of {} in {}", qty, condition_id, tx_hash);
                            return Ok(tx_hash);
                        }
                        Ok(false) => {
                            warn!(
                                "Merge tx {} orphaned by a reorg (attempt {}); resubmitting",
                                tx_hash, attempt
                            );
                        }
                        Err(e) => {
                            warn!("Receipt re-check for {} failed: {}", tx_hash, e);
                        }
                    }
                }
                Err(e) => {
                    warn!("Merge attempt {} failed: {}", attempt, e);
                }
            }
            tokio::time::sleep(delay).await;
            delay *= 2;
        }

        Err(anyhow!(
            "merge of {qty} pairs of {condition_id} failed after {} attempts",
            self.max_retries
        ))
    }
}

/// Stand-in wired when live trading is disabled; dry runs simulate the
/// merge without reaching this.
pub struct DisabledMerge;

#[async_trait]
impl MergeExecutor for DisabledMerge {
    async fn merge_pair(&self, _: &str, _: u64) -> Result<String> {
        Err(anyhow!("live trading is disabled"))
    }
}

// ---------------------------------------------------------------------------
// Live chain implementation
// ---------------------------------------------------------------------------

use alloy::primitives::{Address, B256, U256};
use alloy::providers::{Provider, ProviderBuilder};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer as _;
use alloy::sol;
use polymarket_client_sdk::ctf::types::MergePositionsRequest;
use polymarket_client_sdk::ctf::Client as CtfClient;
use polymarket_client_sdk::types::address;
use polymarket_client_sdk::{contract_config, POLYGON};

/// USDC.e collateral on Polygon.
const USDC: Address = address!("0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174");

sol! {
    #[sol(rpc)]
    interface IERC1155 {
        function setApprovalForAll(address operator, bool approved) external;
        function isApprovedForAll(address account, address operator) external view returns (bool);
    }
}

struct SdkChain<P: Provider> {
    provider: P,
    ctf: CtfClient<P>,
    owner: Address,
    exchange: Address,
    conditional_tokens: Address,
}

/// Connect the Polygon signer and CTF client for live merging.
pub async fn connect_chain(rpc_url: &str, private_key: &str) -> Result<impl ChainOps> {
    let private_key = if private_key.starts_with("0x") {
        private_key.to_string()
    } else {
        format!("0x{private_key}")
    };
    let signer = PrivateKeySigner::from_str(&private_key)
        .context("Invalid wallet private key")?
        .with_chain_id(Some(POLYGON));
    let owner = signer.address();

    let provider = ProviderBuilder::new()
        .wallet(signer)
        .connect(rpc_url)
        .await
        .context("Failed to connect to Polygon RPC")?;

    let config = contract_config(POLYGON, false)
        .ok_or_else(|| anyhow!("no contract config for Polygon"))?;
    let ctf = CtfClient::new(provider.clone(), POLYGON).context("Failed to create CTF client")?;

    info!("Polygon chain client connected as {}", owner);

    Ok(SdkChain {
        provider,
        ctf,
        owner,
        exchange: config.exchange,
        conditional_tokens: config.conditional_tokens,
    })
}

#[async_trait]
impl<P> ChainOps for SdkChain<P>
where
    P: Provider + Clone + Send + Sync + 'static,
{
    async fn send_merge(&self, condition_id: &str, amount: u128) -> Result<String> {
        let condition = B256::from_str(condition_id).context("Invalid condition id")?;
        // Binary-market merge: parent collection id is 32 zero bytes and
        // the partition is [1, 2].
        let request =
            MergePositionsRequest::for_binary_market(USDC, condition, U256::from(amount));
        let resp = self
            .ctf
            .merge_positions(&request)
            .await
            .context("mergePositions call failed")?;
        info!(
            "Merge mined: tx={} block={}",
            resp.transaction_hash, resp.block_number
        );
        Ok(format!("{}", resp.transaction_hash))
    }

    async fn receipt_exists(&self, tx_hash: &str) -> Result<bool> {
        let hash = B256::from_str(tx_hash).context("Invalid tx hash")?;
        let receipt = self
            .provider
            .get_transaction_receipt(hash)
            .await
            .context("receipt lookup failed")?;
        Ok(receipt.is_some())
    }

    async fn ensure_approval(&self) -> Result<()> {
        let ctf_tokens = IERC1155::new(self.conditional_tokens, self.provider.clone());
        let approved = ctf_tokens
            .isApprovedForAll(self.owner, self.exchange)
            .call()
            .await
            .context("isApprovedForAll failed")?;
        if approved {
            return Ok(());
        }
        info!("Granting CTF operator approval to {}", self.exchange);
        let pending = ctf_tokens
            .setApprovalForAll(self.exchange, true)
            .send()
            .await
            .context("setApprovalForAll failed")?;
        let tx = pending.watch().await.context("approval not mined")?;
        info!("CTF approval mined: {}", tx);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    fn merger(chain: MockChainOps, retries: u32) -> CtfMerger {
        CtfMerger::new(Arc::new(chain), retries, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_merge_success_first_attempt() {
        let mut chain = MockChainOps::new();
        chain.expect_ensure_approval().times(1).returning(|| Ok(()));
        chain
            .expect_send_merge()
            .with(eq("0xcond"), eq(10_000_000u128))
            .times(1)
            .returning(|_, _| Ok("0xtx1".to_string()));
        chain
            .expect_receipt_exists()
            .with(eq("0xtx1"))
            .times(1)
            .returning(|_| Ok(true));

        let tx = merger(chain, 3).merge_pair("0xcond", 10).await.unwrap();
        assert_eq!(tx, "0xtx1");
    }

    #[tokio::test]
    async fn test_reorged_merge_is_resubmitted() {
        // First tx mines then vanishes from the canonical chain; the
        // merger resubmits and the second attempt sticks.
        let mut chain = MockChainOps::new();
        chain.expect_ensure_approval().returning(|| Ok(()));
        let mut seq = mockall::Sequence::new();
        chain
            .expect_send_merge()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok("0xtx1".to_string()));
        chain
            .expect_receipt_exists()
            .with(eq("0xtx1"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(false));
        chain
            .expect_send_merge()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok("0xtx2".to_string()));
        chain
            .expect_receipt_exists()
            .with(eq("0xtx2"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(true));

        let tx = merger(chain, 3).merge_pair("0xcond", 10).await.unwrap();
        assert_eq!(tx, "0xtx2");
    }

    #[tokio::test]
    async fn test_transient_failure_retried_with_backoff() {
        let mut chain = MockChainOps::new();
        chain.expect_ensure_approval().returning(|| Ok(()));
        let mut attempts = 0;
        chain.expect_send_merge().times(2).returning(move |_, _| {
            attempts += 1;
            if attempts == 1 {
                Err(anyhow!("underpriced gas"))
            } else {
                Ok("0xtx".to_string())
            }
        });
        chain.expect_receipt_exists().returning(|_| Ok(true));

        assert!(merger(chain, 3).merge_pair("0xcond", 1).await.is_ok());
    }

    #[tokio::test]
    async fn test_retries_exhausted_is_error() {
        let mut chain = MockChainOps::new();
        chain.expect_ensure_approval().returning(|| Ok(()));
        chain
            .expect_send_merge()
            .times(3)
            .returning(|_, _| Err(anyhow!("rpc down")));

        assert!(merger(chain, 3).merge_pair("0xcond", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_approval_checked_once() {
        let mut chain = MockChainOps::new();
        chain.expect_ensure_approval().times(1).returning(|| Ok(()));
        chain
            .expect_send_merge()
            .times(2)
            .returning(|_, _| Ok("0xtx".to_string()));
        chain.expect_receipt_exists().returning(|_| Ok(true));

        let merger = merger(chain, 3);
        merger.merge_pair("0xcond", 1).await.unwrap();
        merger.merge_pair("0xcond", 2).await.unwrap();
    }
}
