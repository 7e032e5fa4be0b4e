//! Gas estimation and pricing for HTLC calls

use crate::chain::{ChainProvider, GasPrice};
use crate::error::RelayerResult;

use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Eip1559TransactionRequest, TransactionRequest, U256};
use tracing::debug;

/// Gas estimator for transactions
pub struct GasEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl GasEstimator {
    pub fn new() -> Self {
        Self {
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
        }
    }

    /// Node estimate plus buffer. A revert during estimation surfaces as `ContractRevert`.
    pub async fn estimate_limit(
        &self,
        provider: &ChainProvider,
        tx: &TypedTransaction,
    ) -> RelayerResult<U256> {
        let estimate = provider.estimate_gas(tx).await?;
        Ok(with_buffer(estimate, self.gas_limit_buffer_percent))
    }

    /// Get buffered gas price for a chain
    pub async fn price(&self, provider: &ChainProvider) -> RelayerResult<GasPrice> {
        let gas_price = provider.get_gas_price().await?;
        let buffered = self.buffer_price(gas_price);

        debug!("Gas price for chain {}: {:?}", provider.chain_id(), buffered);
        Ok(buffered)
    }

    fn buffer_price(&self, price: GasPrice) -> GasPrice {
        match price {
            GasPrice::Legacy(price) => {
                GasPrice::Legacy(with_buffer(price, self.gas_price_buffer_percent))
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => GasPrice::Eip1559 {
                max_fee_per_gas: with_buffer(max_fee_per_gas, self.gas_price_buffer_percent),
                max_priority_fee_per_gas: with_buffer(
                    max_priority_fee_per_gas,
                    self.gas_price_buffer_percent,
                ),
            },
        }
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new()
    }
}

fn with_buffer(value: U256, percent: u64) -> U256 {
    value + value * percent / 100
}

/// Assemble a typed transaction for the pricing model in `gas_price`
pub fn build_transaction(
    request: TransactionRequest,
    nonce: u64,
    gas_limit: U256,
    gas_price: &GasPrice,
) -> TypedTransaction {
    match gas_price {
        GasPrice::Legacy(price) => TypedTransaction::Legacy(
            request.nonce(nonce).gas(gas_limit).gas_price(*price),
        ),
        GasPrice::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => {
            let mut tx = Eip1559TransactionRequest::new()
                .nonce(nonce)
                .gas(gas_limit)
                .max_fee_per_gas(*max_fee_per_gas)
                .max_priority_fee_per_gas(*max_priority_fee_per_gas);
            if let Some(to) = request.to {
                tx = tx.to(to);
            }
            if let Some(from) = request.from {
                tx = tx.from(from);
            }
            if let Some(data) = request.data {
                tx = tx.data(data);
            }
            if let Some(chain_id) = request.chain_id {
                tx = tx.chain_id(chain_id.as_u64());
            }
            TypedTransaction::Eip1559(tx)
        }
    }
}
