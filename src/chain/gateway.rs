//! [`ChainGateway`] over an EVM JSON-RPC endpoint set

use super::provider::{classify_rpc_error, ChainProvider};
use super::{ChainGateway, HtlcCall, HtlcInfo, HtlcMethod, HtlcState, TxReceipt};
use crate::config::WalletConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::{decode_log, RawEvent};
use crate::hashlock::ChainId;
use crate::tx::{build_transaction, GasEstimator, NonceManager};

use async_trait::async_trait;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, Filter, TransactionRequest, H256, U64};
use ethers::utils::id;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Load the relayer's signing key from the configured environment variable
pub fn load_wallet(config: &WalletConfig) -> RelayerResult<LocalWallet> {
    let key = std::env::var(&config.private_key_env).map_err(|_| {
        RelayerError::Wallet(format!(
            "No wallet configured. Set {}",
            config.private_key_env
        ))
    })?;

    key.trim()
        .parse::<LocalWallet>()
        .map_err(|e| RelayerError::Wallet(format!("Invalid private key: {}", e)))
}

/// ABI-encoded call data for an HTLC method
pub fn htlc_calldata(method: &HtlcMethod) -> Bytes {
    match method {
        HtlcMethod::Unlock { preimage } => {
            let mut data = id("unlock(bytes32)").to_vec();
            data.extend_from_slice(preimage.as_bytes());
            data.into()
        }
        HtlcMethod::Refund => id("refund()").to_vec().into(),
    }
}

pub struct EvmGateway {
    provider: Arc<ChainProvider>,
    wallet: LocalWallet,
    nonces: NonceManager,
    gas: GasEstimator,
    poll_interval: Duration,
}

impl EvmGateway {
    pub async fn new(
        provider: Arc<ChainProvider>,
        wallet: LocalWallet,
        poll_interval: Duration,
    ) -> RelayerResult<Self> {
        let chain_id = provider.chain_id();
        let wallet = wallet.with_chain_id(chain_id);
        let nonces = NonceManager::new(chain_id, wallet.address());

        if let Err(e) = nonces.sync(&provider).await {
            warn!("Failed to init nonce for chain {}: {}", chain_id, e);
        }

        info!(
            "Gateway for chain {} initialized with wallet {:?}",
            chain_id,
            wallet.address()
        );

        Ok(Self {
            provider,
            wallet,
            nonces,
            gas: GasEstimator::new(),
            poll_interval,
        })
    }

    pub fn wallet_address(&self) -> Address {
        self.wallet.address()
    }

    /// `eth_call` a zero-argument view and return the raw 32-byte word
    async fn view(&self, htlc: Address, signature: &str) -> RelayerResult<[u8; 32]> {
        let tx: TypedTransaction = TransactionRequest::new()
            .to(htlc)
            .data(id(signature).to_vec())
            .into();
        let output = self.provider.call(&tx).await?;

        if output.len() < 32 {
            return Err(RelayerError::EventParsing(format!(
                "{} on {:?} returned {} bytes",
                signature,
                htlc,
                output.len()
            )));
        }
        let mut word = [0u8; 32];
        word.copy_from_slice(&output[..32]);
        Ok(word)
    }

    async fn sign_and_send(&self, tx: TypedTransaction) -> RelayerResult<H256> {
        let signature = self
            .wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| RelayerError::Wallet(e.to_string()))?;

        self.provider
            .send_raw_transaction(tx.rlp_signed(&signature))
            .await
    }
}

#[async_trait]
impl ChainGateway for EvmGateway {
    fn chain_id(&self) -> ChainId {
        self.provider.chain_id()
    }

    async fn current_block_height(&self) -> RelayerResult<u64> {
        self.provider.get_block_number().await
    }

    async fn latest_block_timestamp(&self) -> RelayerResult<u64> {
        self.provider.get_latest_timestamp().await
    }

    async fn block_hash(&self, number: u64) -> RelayerResult<Option<H256>> {
        self.provider.get_block_hash(number).await
    }

    async fn fetch_events(
        &self,
        addresses: Vec<Address>,
        from: u64,
        to: u64,
    ) -> RelayerResult<Vec<RawEvent>> {
        if addresses.is_empty() || from > to {
            return Ok(Vec::new());
        }

        let filter = Filter::new()
            .address(addresses)
            .from_block(from)
            .to_block(to);
        let logs = self.provider.get_logs(&filter).await?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            if log.removed == Some(true) {
                continue;
            }
            match decode_log(self.chain_id(), &log) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => debug!("Skipping unrelated log {:?}", log.transaction_hash),
                Err(e) => warn!(
                    "Undecodable log on chain {} in tx {:?}: {}",
                    self.chain_id(),
                    log.transaction_hash,
                    e
                ),
            }
        }

        debug!(
            "Chain {}: {} events in blocks {} to {}",
            self.chain_id(),
            events.len(),
            from,
            to
        );
        Ok(events)
    }

    async fn submit_transaction(&self, call: HtlcCall) -> RelayerResult<H256> {
        let chain_id = self.chain_id();
        let request = TransactionRequest::new()
            .from(self.wallet.address())
            .to(call.contract)
            .data(htlc_calldata(&call.method))
            .chain_id(chain_id);

        // Estimation runs the call first, so a doomed unlock/refund reverts here without gas spent
        let gas_limit = self
            .gas
            .estimate_limit(&self.provider, &request.clone().into())
            .await?;
        let gas_price = self.gas.price(&self.provider).await?;
        let nonce = self.nonces.allocate(&self.provider).await?;

        let tx = build_transaction(request, nonce, gas_limit, &gas_price);

        match self.sign_and_send(tx).await {
            Ok(tx_hash) => {
                self.nonces.mark_pending(nonce, tx_hash).await;
                info!(
                    "Submitted {} to {:?} on chain {}: {:?} (nonce {})",
                    call.method.name(),
                    call.contract,
                    chain_id,
                    tx_hash,
                    nonce
                );
                Ok(tx_hash)
            }
            Err(e) => {
                self.nonces.release(nonce).await;
                if matches!(e, RelayerError::NonceConflict { .. }) {
                    warn!("Nonce conflict on chain {}, re-syncing: {}", chain_id, e);
                    self.nonces.sync(&self.provider).await?;
                }
                Err(e)
            }
        }
    }

    async fn wait_for_confirmation(
        &self,
        tx_hash: H256,
        confirmations: u64,
        timeout: Duration,
    ) -> RelayerResult<TxReceipt> {
        let chain_id = self.chain_id();

        let wait = async {
            loop {
                match self.provider.get_transaction_receipt(tx_hash).await {
                    Ok(Some(receipt)) => {
                        if let Some(block) = receipt.block_number.map(|b| b.as_u64()) {
                            if receipt.status == Some(U64::zero()) {
                                self.nonces.confirm(tx_hash).await;
                                return Err(classify_rpc_error(
                                    chain_id,
                                    &format!("transaction {:?} reverted in block {}", tx_hash, block),
                                ));
                            }

                            let head = self.provider.last_block().await.max(
                                self.provider.get_block_number().await.unwrap_or_default(),
                            );
                            if head + 1 >= block + confirmations {
                                self.nonces.confirm(tx_hash).await;
                                return Ok(TxReceipt {
                                    tx_hash,
                                    block_number: block,
                                    gas_used: receipt.gas_used,
                                });
                            }
                        }
                    }
                    Ok(None) => {}
                    Err(e) => debug!("Receipt lookup for {:?} failed: {}", tx_hash, e),
                }

                tokio::time::sleep(self.poll_interval).await;
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| RelayerError::Timeout {
                operation: format!("{} confirmations of {:?} on chain {}", confirmations, tx_hash, chain_id),
            })?
    }

    async fn htlc_info(&self, htlc: Address) -> RelayerResult<HtlcInfo> {
        let unlocked = self.view(htlc, "unlocked()").await?;
        let refunded = self.view(htlc, "refunded()").await?;
        let receiver = self
            .view(htlc, "receiver()")
            .await
            .ok()
            .map(|word| Address::from_slice(&word[12..]))
            .filter(|a| !a.is_zero());

        let state = if unlocked[31] != 0 {
            HtlcState::Unlocked
        } else if refunded[31] != 0 {
            HtlcState::Refunded
        } else {
            HtlcState::Open
        };

        Ok(HtlcInfo { receiver, state })
    }
}
