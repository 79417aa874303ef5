//! Transaction transport
//!
//! [`Transport`] turns a list of steps into a signed transaction, submits it
//! and waits for its receipt. Submissions are serialized so nonces are
//! assigned without gaps; confirmation waits run concurrently.

use crate::error::TransportError;
use crate::ledger::{estimate_gas, Ledger, Receipt, Transaction, TxStatus, TxStep};
use crate::signer::Signer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uprox_artifact::{Address, ContentHash};

/// Default interval between receipt polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// What a confirmation wait observed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Confirmation {
    /// Receipt received (the transaction may still have reverted)
    Mined(Receipt),
    /// No receipt before the timeout; the transaction may still apply
    Unobserved { tx_hash: ContentHash },
}

/// Signer plus ledger
#[derive(Debug)]
pub struct Transport {
    ledger: Arc<dyn Ledger>,
    signer: Arc<dyn Signer>,
    gas_ceiling: u64,
    confirmation_timeout: Duration,
    poll_interval: Duration,
    submit_lock: Mutex<()>,
}

impl Transport {
    /// Create transport
    #[must_use]
    pub fn new(
        ledger: Arc<dyn Ledger>,
        signer: Arc<dyn Signer>,
        gas_ceiling: u64,
        confirmation_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            signer,
            gas_ceiling,
            confirmation_timeout,
            poll_interval: DEFAULT_POLL_INTERVAL,
            submit_lock: Mutex::new(()),
        }
    }

    /// With receipt poll interval
    #[inline]
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Account transactions are sent from
    #[inline]
    #[must_use]
    pub fn sender(&self) -> Address {
        self.signer.address()
    }

    /// Underlying ledger
    #[inline]
    #[must_use]
    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Sign and submit steps as one atomic transaction
    ///
    /// Nothing reaches the ledger if the gas estimate exceeds the ceiling.
    ///
    /// # Errors
    /// Returns [`TransportError`] if the transaction is not accepted.
    pub async fn submit(&self, steps: Vec<TxStep>) -> Result<ContentHash, TransportError> {
        let gas_limit = estimate_gas(&steps);
        if gas_limit > self.gas_ceiling {
            return Err(TransportError::GasCeilingExceeded {
                required: gas_limit,
                ceiling: self.gas_ceiling,
            });
        }

        let _submitting = self.submit_lock.lock().await;
        let from = self.signer.address();
        let nonce = self.ledger.nonce(&from).await?;
        let signed = self.signer.sign(Transaction {
            from,
            nonce,
            gas_limit,
            steps,
        })?;
        let tx_hash = self.ledger.send_transaction(signed).await?;
        debug!(tx = %tx_hash.short(), nonce, gas_limit, "Transaction submitted");
        Ok(tx_hash)
    }

    /// Wait for a receipt until the confirmation timeout
    ///
    /// Ledger errors while polling do not end the wait: the transaction was
    /// accepted, so only a receipt or the timeout decides the outcome.
    pub async fn confirm(&self, tx_hash: ContentHash) -> Confirmation {
        let deadline = Instant::now() + self.confirmation_timeout;
        loop {
            match self.ledger.receipt(&tx_hash).await {
                Ok(Some(receipt)) => {
                    debug!(tx = %tx_hash.short(), block = receipt.block, "Transaction mined");
                    return Confirmation::Mined(receipt);
                }
                Ok(None) => {}
                Err(e) => warn!(tx = %tx_hash.short(), error = %e, "Receipt poll failed"),
            }
            if Instant::now() + self.poll_interval > deadline {
                info!(
                    tx = %tx_hash.short(),
                    timeout_ms = self.confirmation_timeout.as_millis() as u64,
                    "Confirmation timed out"
                );
                return Confirmation::Unobserved { tx_hash };
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Submit and wait, requiring success
    ///
    /// # Errors
    /// Returns [`TransportError::Reverted`] for reverted transactions.
    /// `Ok(Confirmation::Unobserved)` is returned when the wait timed out.
    pub async fn execute(&self, steps: Vec<TxStep>) -> Result<Confirmation, TransportError> {
        let tx_hash = self.submit(steps).await?;
        match self.confirm(tx_hash).await {
            Confirmation::Mined(receipt) => match receipt.status {
                TxStatus::Success => Ok(Confirmation::Mined(receipt)),
                TxStatus::Reverted { step, reason } => {
                    Err(TransportError::Reverted {
                        tx_hash,
                        step,
                        reason,
                    })
                }
            },
            unobserved @ Confirmation::Unobserved { .. } => Ok(unobserved),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ContractCode, LocalLedger};
    use crate::signer::KeySigner;
    use uprox_artifact::Selector;

    fn deploy_step(tag: u8) -> TxStep {
        TxStep::DeployCode {
            code: ContractCode {
                address: Address::new([tag; 20]),
                bytecode: vec![tag; 8],
                initializer: Some(Selector::of("initialize")),
                upgrade_entrypoint: true,
            },
        }
    }

    fn transport(ledger: Arc<LocalLedger>, gas_ceiling: u64) -> Transport {
        Transport::new(
            ledger,
            Arc::new(KeySigner::from_seed(&[4; 32])),
            gas_ceiling,
            Duration::from_millis(200),
        )
        .with_poll_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn gas_ceiling_blocks_submission() {
        let ledger = Arc::new(LocalLedger::in_memory());
        let transport = transport(Arc::clone(&ledger), 1_000);

        let result = transport.submit(vec![deploy_step(1)]).await;
        assert!(matches!(
            result,
            Err(TransportError::GasCeilingExceeded { ceiling: 1_000, .. })
        ));
        assert_eq!(ledger.block_height(), 0);
    }

    #[tokio::test]
    async fn sequential_submissions_use_fresh_nonces() {
        let ledger = Arc::new(LocalLedger::in_memory());
        let transport = transport(Arc::clone(&ledger), 1_000_000);

        for tag in 1..=3 {
            let outcome = transport.execute(vec![deploy_step(tag)]).await.unwrap();
            assert!(matches!(outcome, Confirmation::Mined(ref r) if r.succeeded()));
        }
        assert_eq!(ledger.nonce(&transport.sender()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn concurrent_submissions_do_not_collide() {
        let ledger = Arc::new(LocalLedger::in_memory());
        let transport = Arc::new(transport(Arc::clone(&ledger), 1_000_000));

        let handles: Vec<_> = (1..=6u8)
            .map(|tag| {
                let transport = Arc::clone(&transport);
                tokio::spawn(async move { transport.submit(vec![deploy_step(tag)]).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(ledger.block_height(), 6);
    }
}
