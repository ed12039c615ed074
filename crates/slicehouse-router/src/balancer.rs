//! Balancer
//!
//! Chooses one ready slice pipeline of a sink for each record and writes the
//! record to it.
//!
//! ## Probing
//!
//! ```text
//! start = strategy()                  // random or round-robin counter
//! for i in 0..n:
//!     candidate = pipelines[(start + i) % n]
//!     PipelineNotReady -> try the next one
//!     Ok / other error -> return it
//! all not ready -> NoPipelineReady
//! ```
//!
//! A real write failure is returned as it is, it is never hidden by probing
//! the remaining candidates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use slicehouse_core::RecordContext;

use crate::config::BalancerKind;
use crate::encoding::RecordStatus;
use crate::error::{Result, RouterError};

/// A write destination the balancer can choose.
#[async_trait]
pub trait BalancedPipeline: Send + Sync {
    /// Returns `PipelineNotReady` if the pipeline cannot accept writes now.
    async fn write_record(&self, record: &dyn RecordContext) -> Result<RecordStatus>;
}

#[async_trait]
pub trait Balancer: Send + Sync {
    async fn write_record(
        &self,
        record: &dyn RecordContext,
        pipelines: &[Arc<dyn BalancedPipeline>],
    ) -> Result<RecordStatus>;
}

pub fn new_balancer(kind: BalancerKind) -> Arc<dyn Balancer> {
    match kind {
        BalancerKind::Random => Arc::new(RandomBalancer),
        BalancerKind::RoundRobin => Arc::new(RoundRobinBalancer::new()),
    }
}

/// Starts probing at a random pipeline.
#[derive(Debug, Default)]
pub struct RandomBalancer;

#[async_trait]
impl Balancer for RandomBalancer {
    async fn write_record(
        &self,
        record: &dyn RecordContext,
        pipelines: &[Arc<dyn BalancedPipeline>],
    ) -> Result<RecordStatus> {
        let start = match pipelines.len() {
            0 | 1 => 0,
            n => rand::thread_rng().gen_range(0..n),
        };
        write_from(start, record, pipelines).await
    }
}

/// Starts probing at the pipeline after the previous start.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    counter: AtomicU64,
}

impl RoundRobinBalancer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Balancer for RoundRobinBalancer {
    async fn write_record(
        &self,
        record: &dyn RecordContext,
        pipelines: &[Arc<dyn BalancedPipeline>],
    ) -> Result<RecordStatus> {
        let start = match pipelines.len() {
            0 | 1 => 0,
            n => (self.counter.fetch_add(1, Ordering::Relaxed) % n as u64) as usize,
        };
        write_from(start, record, pipelines).await
    }
}

async fn write_from(
    start: usize,
    record: &dyn RecordContext,
    pipelines: &[Arc<dyn BalancedPipeline>],
) -> Result<RecordStatus> {
    match pipelines {
        [] => Err(RouterError::NoPipeline),
        [single] => match single.write_record(record).await {
            Err(e) if e.is_not_ready() => Err(RouterError::NoPipelineReady),
            other => other,
        },
        _ => {
            let n = pipelines.len();
            for i in 0..n {
                match pipelines[(start + i) % n].write_record(record).await {
                    Err(e) if e.is_not_ready() => continue,
                    other => return other,
                }
            }
            Err(RouterError::NoPipelineReady)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slicehouse_core::{Record, UtcTime};
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    struct TestPipeline {
        id: usize,
        ready: AtomicBool,
        fail: bool,
        log: Arc<Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl BalancedPipeline for TestPipeline {
        async fn write_record(&self, _record: &dyn RecordContext) -> Result<RecordStatus> {
            if !self.ready.load(Ordering::SeqCst) {
                return Err(RouterError::PipelineNotReady);
            }
            if self.fail {
                return Err(RouterError::Write("disk full".into()));
            }
            self.log.lock().unwrap().push(self.id);
            Ok(RecordStatus::Accepted)
        }
    }

    fn pipelines(n: usize) -> (Vec<Arc<TestPipeline>>, Arc<Mutex<Vec<usize>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipelines = (1..=n)
            .map(|id| {
                Arc::new(TestPipeline {
                    id,
                    ready: AtomicBool::new(true),
                    fail: false,
                    log: log.clone(),
                })
            })
            .collect();
        (pipelines, log)
    }

    fn as_dyn(pipelines: &[Arc<TestPipeline>]) -> Vec<Arc<dyn BalancedPipeline>> {
        pipelines
            .iter()
            .map(|p| p.clone() as Arc<dyn BalancedPipeline>)
            .collect()
    }

    fn record() -> Record {
        Record::new(UtcTime::now(), "{}")
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let (pipelines, log) = pipelines(3);
        let candidates = as_dyn(&pipelines);
        let balancer = RoundRobinBalancer::new();

        for _ in 0..6 {
            balancer.write_record(&record(), &candidates).await.unwrap();
        }
        assert_eq!(*log.lock().unwrap(), vec![1, 2, 3, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_round_robin_skips_not_ready() {
        let (pipelines, log) = pipelines(3);
        let candidates = as_dyn(&pipelines);
        let balancer = RoundRobinBalancer::new();

        balancer.write_record(&record(), &candidates).await.unwrap();
        pipelines[1].ready.store(false, Ordering::SeqCst);
        balancer.write_record(&record(), &candidates).await.unwrap();
        balancer.write_record(&record(), &candidates).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec![1, 3, 3]);
    }

    #[tokio::test]
    async fn test_no_pipeline() {
        let balancer = RoundRobinBalancer::new();
        let err = balancer.write_record(&record(), &[]).await.unwrap_err();
        assert!(matches!(err, RouterError::NoPipeline));

        let err = RandomBalancer.write_record(&record(), &[]).await.unwrap_err();
        assert!(matches!(err, RouterError::NoPipeline));
    }

    #[tokio::test]
    async fn test_all_not_ready() {
        let (pipelines, _) = pipelines(3);
        for p in &pipelines {
            p.ready.store(false, Ordering::SeqCst);
        }
        let candidates = as_dyn(&pipelines);

        for balancer in [new_balancer(BalancerKind::Random), new_balancer(BalancerKind::RoundRobin)] {
            let err = balancer.write_record(&record(), &candidates).await.unwrap_err();
            assert!(matches!(err, RouterError::NoPipelineReady));
        }
    }

    #[tokio::test]
    async fn test_single_not_ready() {
        let (pipelines, _) = pipelines(1);
        pipelines[0].ready.store(false, Ordering::SeqCst);
        let err = RandomBalancer
            .write_record(&record(), &as_dyn(&pipelines))
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::NoPipelineReady));
    }

    #[tokio::test]
    async fn test_write_error_is_not_masked() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let failing: Arc<dyn BalancedPipeline> = Arc::new(TestPipeline {
            id: 1,
            ready: AtomicBool::new(true),
            fail: true,
            log: log.clone(),
        });
        let healthy: Arc<dyn BalancedPipeline> = Arc::new(TestPipeline {
            id: 2,
            ready: AtomicBool::new(true),
            fail: false,
            log: log.clone(),
        });

        let balancer = RoundRobinBalancer::new();
        let err = balancer
            .write_record(&record(), &[failing, healthy])
            .await
            .unwrap_err();
        assert!(matches!(err, RouterError::Write(_)));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_random_writes_to_ready_pipeline() {
        let (pipelines, log) = pipelines(3);
        pipelines[0].ready.store(false, Ordering::SeqCst);
        pipelines[2].ready.store(false, Ordering::SeqCst);
        let candidates = as_dyn(&pipelines);

        for _ in 0..5 {
            RandomBalancer.write_record(&record(), &candidates).await.unwrap();
        }
        assert_eq!(*log.lock().unwrap(), vec![2; 5]);
    }
}
