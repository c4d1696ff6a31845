//! The async billing worker pool: a fixed pool of long-lived workers
//! pulling from a bounded queue, rather than a per-call permit. A billing
//! request never blocks the relay controller: it is handed off to
//! [`Consumer::submit`] and the worker pool processes it off the hot path.
//!
//! Each job still runs inside its own `tokio::spawn`, so a panic in price
//! calculation or the store call is caught as a `JoinError` by the worker
//! loop instead of unwinding the worker task itself — the pool survives
//! indefinitely even if a single job panics.

pub mod pricing;

use std::sync::Arc;

use aiproxy_core::model::{ConsumeRecord, ModelPrices, Usage};
use aiproxy_core::store::TenantStore;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

/// Everything the consumer needs to price and record one response.
#[derive(Debug, Clone)]
pub struct BillingJob {
    pub request_id: String,
    pub tenant_id: i64,
    pub token_id: i64,
    pub token_name: String,
    pub channel_id: i64,
    pub model: String,
    pub usage: Usage,
    pub prices: ModelPrices,
    pub ip: String,
    pub retry_times: u32,
    pub downstream_ok: bool,
}

/// A pool of background workers draining a bounded billing queue.
pub struct Consumer {
    tx: mpsc::Sender<BillingJob>,
    workers: Vec<JoinHandle<()>>,
}

impl Consumer {
    /// Spawns `worker_count` workers sharing a queue of `queue_capacity`
    /// pending jobs. `submit` backpressures the caller once the queue is
    /// full rather than growing unboundedly.
    pub fn spawn(store: Arc<dyn TenantStore>, worker_count: usize, queue_capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let rx = Arc::new(AsyncMutex::new(rx));

        let workers = (0..worker_count.max(1))
            .map(|id| {
                let rx = Arc::clone(&rx);
                let store = Arc::clone(&store);
                tokio::spawn(worker_loop(id, rx, store))
            })
            .collect();

        Self { tx, workers }
    }

    /// Hands a billing job to the pool. Fails only once the pool has been
    /// shut down.
    pub async fn submit(&self, job: BillingJob) -> Result<(), BillingJob> {
        self.tx.send(job).await.map_err(|err| err.0)
    }

    /// Stops accepting new jobs and waits for every worker to finish
    /// draining the queue, the wait-group half of process shutdown.
    pub async fn shutdown(self) {
        drop(self.tx);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

async fn worker_loop(
    id: usize,
    rx: Arc<AsyncMutex<mpsc::Receiver<BillingJob>>>,
    store: Arc<dyn TenantStore>,
) {
    loop {
        let job = {
            let mut guard = rx.lock().await;
            guard.recv().await
        };
        let Some(job) = job else {
            break;
        };

        let store = Arc::clone(&store);
        let handle = tokio::spawn(async move { process_job(job, store).await });
        if let Err(_join_err) = handle.await {
            #[cfg(feature = "tracing")]
            tracing::error!(worker = id, error = %_join_err, "billing worker panicked; recovered");
            #[cfg(feature = "metrics")]
            metrics::counter!("consumer_worker_panics_total").increment(1);
        }
    }
}

async fn process_job(job: BillingJob, store: Arc<dyn TenantStore>) {
    let amount = pricing::compute_amount(&job.usage, &job.prices);

    match store.post_consume(&job.token_name, amount).await {
        Ok(debited) => {
            let record = ConsumeRecord {
                request_id: job.request_id.clone(),
                tenant_id: job.tenant_id,
                token_id: job.token_id,
                channel_id: job.channel_id,
                model: job.model.clone(),
                usage: job.usage,
                amount: debited,
                ip: job.ip.clone(),
                retry_times: job.retry_times,
                downstream_ok: job.downstream_ok,
                debit_error: None,
            };
            if let Err(_err) = store.write_consume_record(&record).await {
                #[cfg(feature = "tracing")]
                tracing::error!(request_id = %job.request_id, error = %_err, "failed to write consume record");
            }
        }
        Err(err) => {
            // Debit failed; still write the audit row so nothing goes
            // unaccounted for.
            let record = ConsumeRecord {
                request_id: job.request_id.clone(),
                tenant_id: job.tenant_id,
                token_id: job.token_id,
                channel_id: job.channel_id,
                model: job.model.clone(),
                usage: job.usage,
                amount: 0.0,
                ip: job.ip.clone(),
                retry_times: job.retry_times,
                downstream_ok: job.downstream_ok,
                debit_error: Some(err.to_string()),
            };
            let _ = store.write_consume_record(&record).await;

            #[cfg(feature = "metrics")]
            metrics::counter!("consumer_debit_errors_total").increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aiproxy_core::model::{Tenant, Token};
    use aiproxy_core::store::test_support::InMemoryStore;

    fn store_with_tenant(balance: f64) -> Arc<InMemoryStore> {
        let store = InMemoryStore::default();
        store.tenants.lock().unwrap().insert(
            1,
            Tenant {
                id: 1,
                name: "acme".into(),
                enabled: true,
                model_tags: vec![],
                balance,
            },
        );
        store.tokens.lock().unwrap().insert(
            "tok-a".to_string(),
            Token {
                id: 1,
                name: "tok-a".into(),
                tenant_id: 1,
                enabled: true,
                allowed_models: vec![],
                rpm_quota: None,
                tpm_quota: None,
                rpd_quota: None,
            },
        );
        Arc::new(store)
    }

    fn job(request_id: &str, prompt: u32, completion: u32) -> BillingJob {
        BillingJob {
            request_id: request_id.to_string(),
            tenant_id: 1,
            token_id: 1,
            token_name: "tok-a".to_string(),
            channel_id: 7,
            model: "gpt-test".to_string(),
            usage: Usage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: prompt + completion,
                cached_tokens: 0,
                cache_creation_tokens: 0,
            },
            prices: ModelPrices {
                input_price: 1.0,
                output_price: 2.0,
                cached_price: None,
                cache_creation_price: None,
                image_price: None,
                price_unit: 1000.0,
            },
            ip: "127.0.0.1".to_string(),
            retry_times: 0,
            downstream_ok: true,
        }
    }

    #[tokio::test]
    async fn debits_and_writes_a_consume_record() {
        let store = store_with_tenant(100.0);
        let consumer = Consumer::spawn(store.clone(), 2, 16);
        consumer.submit(job("r1", 500, 250)).await.unwrap();
        consumer.shutdown().await;

        let records = store.consume_records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert!((records[0].amount - 1.0).abs() < 1e-9);
        assert!(records[0].debit_error.is_none());
        assert_eq!(store.tenants.lock().unwrap()[&1].balance, 99.0);
    }

    #[tokio::test]
    async fn insufficient_balance_caps_debit_but_still_records() {
        let store = store_with_tenant(0.5);
        let consumer = Consumer::spawn(store.clone(), 1, 16);
        consumer.submit(job("r2", 500, 250)).await.unwrap();
        consumer.shutdown().await;

        let records = store.consume_records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert!((records[0].amount - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn debit_error_still_produces_an_audit_row() {
        let store = InMemoryStore::default(); // no tenant/token registered
        let store = Arc::new(store);
        let consumer = Consumer::spawn(store.clone(), 1, 16);
        consumer.submit(job("r3", 10, 10)).await.unwrap();
        consumer.shutdown().await;

        let records = store.consume_records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].debit_error.is_some());
        assert_eq!(records[0].amount, 0.0);
    }

    #[tokio::test]
    async fn many_jobs_across_several_workers_all_land() {
        let store = store_with_tenant(1_000_000.0);
        let consumer = Consumer::spawn(store.clone(), 4, 64);
        for i in 0..50 {
            consumer
                .submit(job(&format!("r-{i}"), 100, 10))
                .await
                .unwrap();
        }
        consumer.shutdown().await;
        assert_eq!(store.consume_records.lock().unwrap().len(), 50);
    }
}
