//! Bounded, self-refilling pools of pre-initialised provider instances.
//!
//! One pool per provider kind. Idle instances are owned by the pool; a
//! leased [`ProviderSet`] is uniquely owned by its session until returned.
//! Counters obey `idle + in_use = total <= max` at all times, and a
//! maintenance loop replenishes towards `min` while the pool is open.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, PoolConfig};
use crate::error::{Error, Result};
use crate::providers::registry::ProviderRegistry;
use crate::providers::{AsrProvider, LlmProvider, Provider, TtsProvider, VlllmProvider};

/// Constructs ready-to-stream instances for one pool.
#[async_trait]
pub trait ProviderFactory<T: ?Sized + Send + Sync>: Send + Sync {
    async fn create(&self) -> Result<Arc<T>>;
}

struct PoolInner<T: ?Sized> {
    idle: VecDeque<Arc<T>>,
    total: usize,
    in_use: usize,
    closed: bool,
}

/// Point-in-time pool counters for monitoring.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PoolStats {
    pub available: usize,
    pub in_use: usize,
    pub total: usize,
    pub min: usize,
    pub max: usize,
}

pub struct ResourcePool<T: ?Sized + Provider + 'static> {
    name: String,
    factory: Arc<dyn ProviderFactory<T>>,
    config: PoolConfig,
    inner: Mutex<PoolInner<T>>,
    stop: CancellationToken,
}

impl<T: ?Sized + Provider + 'static> ResourcePool<T> {
    /// Build the pool and fill it to `min`. Initial construction failures
    /// are startup failures and propagate.
    pub async fn new(
        name: impl Into<String>,
        factory: Arc<dyn ProviderFactory<T>>,
        config: PoolConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let name = name.into();

        let mut idle = VecDeque::with_capacity(config.max);
        for _ in 0..config.min {
            idle.push_back(factory.create().await?);
        }
        let total = idle.len();
        info!(pool = %name, total, "pool initialised");

        let pool = Arc::new(Self {
            name,
            factory,
            config,
            inner: Mutex::new(PoolInner {
                idle,
                total,
                in_use: 0,
                closed: false,
            }),
            stop: CancellationToken::new(),
        });

        let maintainer = Arc::clone(&pool);
        tokio::spawn(async move { maintainer.maintain().await });

        Ok(pool)
    }

    /// Lease an instance: idle first, then fresh construction below `max`,
    /// otherwise [`Error::PoolExhausted`].
    pub async fn get(&self) -> Result<Arc<T>> {
        {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return Err(Error::PoolClosed);
            }
            if let Some(instance) = inner.idle.pop_front() {
                inner.in_use += 1;
                return Ok(instance);
            }
            if inner.total >= self.config.max {
                return Err(Error::PoolExhausted(self.name.clone()));
            }
            // Reserve the slot before constructing so concurrent leases
            // cannot overshoot `max`.
            inner.total += 1;
            inner.in_use += 1;
        }

        match self.factory.create().await {
            Ok(instance) => Ok(instance),
            Err(err) => {
                let mut inner = self.inner.lock().await;
                inner.total -= 1;
                inner.in_use -= 1;
                Err(err)
            }
        }
    }

    /// Return a leased instance. The pool resets it before re-pooling;
    /// instances that fail reset, arrive at a closed pool, or exceed the
    /// idle buffer are destroyed instead.
    pub async fn put(&self, instance: Arc<T>) {
        let reusable = match instance.reset().await {
            Ok(()) => true,
            Err(err) => {
                warn!(pool = %self.name, "reset failed on return, destroying: {err}");
                false
            }
        };

        let destroy = {
            let mut inner = self.inner.lock().await;
            inner.in_use = inner.in_use.saturating_sub(1);
            if inner.closed || !reusable || inner.idle.len() >= self.config.max {
                inner.total = inner.total.saturating_sub(1);
                true
            } else {
                inner.idle.push_back(Arc::clone(&instance));
                false
            }
        };

        if destroy {
            if let Err(err) = instance.cleanup().await {
                warn!(pool = %self.name, "cleanup on return failed: {err}");
            }
        }
    }

    /// Destroy a leased instance after a fatal provider failure, releasing
    /// its slot so the factory can build a replacement.
    pub async fn discard(&self, instance: Arc<T>) {
        {
            let mut inner = self.inner.lock().await;
            inner.in_use = inner.in_use.saturating_sub(1);
            inner.total = inner.total.saturating_sub(1);
        }
        if let Err(err) = instance.cleanup().await {
            warn!(pool = %self.name, "cleanup on discard failed: {err}");
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let inner = self.inner.lock().await;
        PoolStats {
            available: inner.idle.len(),
            in_use: inner.in_use,
            total: inner.total,
            min: self.config.min,
            max: self.config.max,
        }
    }

    /// Close the pool: no further leases, idle instances destroyed,
    /// returned instances destroyed on arrival.
    pub async fn close(&self) {
        self.stop.cancel();
        let drained = {
            let mut inner = self.inner.lock().await;
            if inner.closed {
                return;
            }
            inner.closed = true;
            let drained: Vec<Arc<T>> = inner.idle.drain(..).collect();
            inner.total = inner.total.saturating_sub(drained.len());
            drained
        };
        for instance in drained {
            if let Err(err) = instance.cleanup().await {
                warn!(pool = %self.name, "cleanup on close failed: {err}");
            }
        }
        debug!(pool = %self.name, "pool closed");
    }

    async fn maintain(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.check_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => return,
                _ = ticker.tick() => self.refill().await,
            }
        }
    }

    /// Replenish up to `refill_size` instances per tick while idle count is
    /// below `min`.
    async fn refill(&self) {
        for _ in 0..self.config.refill_size.max(1) {
            {
                let mut inner = self.inner.lock().await;
                if inner.closed
                    || inner.idle.len() >= self.config.min
                    || inner.total >= self.config.max
                {
                    return;
                }
                inner.total += 1;
            }
            match self.factory.create().await {
                Ok(instance) => {
                    let mut inner = self.inner.lock().await;
                    if inner.closed {
                        inner.total -= 1;
                        drop(inner);
                        let _ = instance.cleanup().await;
                        return;
                    }
                    inner.idle.push_back(instance);
                }
                Err(err) => {
                    self.inner.lock().await.total -= 1;
                    error!(pool = %self.name, "refill failed: {err}");
                    return;
                }
            }
        }
    }
}

/// A coherent bundle of providers leased together for one session.
pub struct ProviderSet {
    pub asr: Arc<dyn AsrProvider>,
    pub llm: Arc<dyn LlmProvider>,
    pub vlllm: Option<Arc<dyn VlllmProvider>>,
    pub tts: Arc<dyn TtsProvider>,
}

impl std::fmt::Debug for ProviderSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSet").finish_non_exhaustive()
    }
}

/// Adapts a registry factory plus its configuration to one pool.
struct ConfiguredFactory<T: ?Sized + Send + Sync> {
    build: Box<
        dyn Fn() -> futures::future::BoxFuture<'static, Result<Arc<T>>> + Send + Sync,
    >,
}

#[async_trait]
impl<T: ?Sized + Provider + 'static> ProviderFactory<T> for ConfiguredFactory<T> {
    async fn create(&self) -> Result<Arc<T>> {
        let instance = (self.build)().await?;
        // Pools hold ready-to-stream instances; initialisation failures are
        // construction failures.
        instance.initialize().await?;
        Ok(instance)
    }
}

/// One pool per provider kind, plus the atomic [`ProviderSet`] lease.
pub struct PoolManager {
    asr: Arc<ResourcePool<dyn AsrProvider>>,
    llm: Arc<ResourcePool<dyn LlmProvider>>,
    vlllm: Option<Arc<ResourcePool<dyn VlllmProvider>>>,
    tts: Arc<ResourcePool<dyn TtsProvider>>,
}

impl PoolManager {
    pub async fn new(registry: &ProviderRegistry, config: &Config) -> Result<Self> {
        let asr_factory = registry.asr_factory(&config.providers.asr.kind)?;
        let asr_config = config.providers.asr.clone();
        let asr = ResourcePool::new(
            "asr",
            Arc::new(ConfiguredFactory {
                build: Box::new(move || {
                    let factory = Arc::clone(&asr_factory);
                    let config = asr_config.clone();
                    Box::pin(async move { factory.create(&config).await })
                }),
            }),
            config.pools.asr,
        )
        .await?;

        let llm_factory = registry.llm_factory(&config.providers.llm.kind)?;
        let llm_config = config.providers.llm.clone();
        let llm = ResourcePool::new(
            "llm",
            Arc::new(ConfiguredFactory {
                build: Box::new(move || {
                    let factory = Arc::clone(&llm_factory);
                    let config = llm_config.clone();
                    Box::pin(async move { factory.create(&config).await })
                }),
            }),
            config.pools.llm,
        )
        .await?;

        let vlllm = match &config.providers.vlllm {
            Some(provider_config) => {
                let factory = registry.vlllm_factory(&provider_config.kind)?;
                let provider_config = provider_config.clone();
                Some(
                    ResourcePool::new(
                        "vlllm",
                        Arc::new(ConfiguredFactory {
                            build: Box::new(move || {
                                let factory = Arc::clone(&factory);
                                let config = provider_config.clone();
                                Box::pin(async move { factory.create(&config).await })
                            }),
                        }),
                        config.pools.vlllm,
                    )
                    .await?,
                )
            }
            None => None,
        };

        let tts_factory = registry.tts_factory(&config.providers.tts.kind)?;
        let tts_config = config.providers.tts.clone();
        let tts = ResourcePool::new(
            "tts",
            Arc::new(ConfiguredFactory {
                build: Box::new(move || {
                    let factory = Arc::clone(&tts_factory);
                    let config = tts_config.clone();
                    Box::pin(async move { factory.create(&config).await })
                }),
            }),
            config.pools.tts,
        )
        .await?;

        Ok(Self {
            asr,
            llm,
            vlllm,
            tts,
        })
    }

    /// Lease a full set, or nothing: partial sub-leases are returned before
    /// the error propagates.
    pub async fn lease_set(&self) -> Result<ProviderSet> {
        let asr = self.asr.get().await?;

        let llm = match self.llm.get().await {
            Ok(llm) => llm,
            Err(err) => {
                self.asr.put(asr).await;
                return Err(err);
            }
        };

        let vlllm = match &self.vlllm {
            Some(pool) => match pool.get().await {
                Ok(vlllm) => Some(vlllm),
                Err(err) => {
                    self.llm.put(llm).await;
                    self.asr.put(asr).await;
                    return Err(err);
                }
            },
            None => None,
        };

        let tts = match self.tts.get().await {
            Ok(tts) => tts,
            Err(err) => {
                if let (Some(pool), Some(instance)) = (&self.vlllm, vlllm) {
                    pool.put(instance).await;
                }
                self.llm.put(llm).await;
                self.asr.put(asr).await;
                return Err(err);
            }
        };

        Ok(ProviderSet {
            asr,
            llm,
            vlllm,
            tts,
        })
    }

    /// Return a set to its pools; each instance is reset on the way in.
    pub async fn release_set(&self, set: ProviderSet) {
        self.asr.put(set.asr).await;
        self.llm.put(set.llm).await;
        if let (Some(pool), Some(instance)) = (&self.vlllm, set.vlllm) {
            pool.put(instance).await;
        }
        self.tts.put(set.tts).await;
    }

    /// Destroy a set after a fatal provider failure.
    pub async fn discard_set(&self, set: ProviderSet) {
        self.asr.discard(set.asr).await;
        self.llm.discard(set.llm).await;
        if let (Some(pool), Some(instance)) = (&self.vlllm, set.vlllm) {
            pool.discard(instance).await;
        }
        self.tts.discard(set.tts).await;
    }

    pub async fn detailed_stats(&self) -> HashMap<&'static str, PoolStats> {
        let mut stats = HashMap::new();
        stats.insert("asr", self.asr.stats().await);
        stats.insert("llm", self.llm.stats().await);
        if let Some(pool) = &self.vlllm {
            stats.insert("vlllm", pool.stats().await);
        }
        stats.insert("tts", self.tts.stats().await);
        stats
    }

    pub async fn close(&self) {
        self.asr.close().await;
        self.llm.close().await;
        if let Some(pool) = &self.vlllm {
            pool.close().await;
        }
        self.tts.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct CountingProvider {
        resets: AtomicUsize,
    }

    #[async_trait]
    impl Provider for CountingProvider {
        async fn initialize(&self) -> Result<()> {
            Ok(())
        }

        async fn cleanup(&self) -> Result<()> {
            Ok(())
        }

        async fn reset(&self) -> Result<()> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingFactory {
        created: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl ProviderFactory<CountingProvider> for CountingFactory {
        async fn create(&self) -> Result<Arc<CountingProvider>> {
            if self.fail {
                return Err(Error::ProviderFatal("factory down".into()));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(CountingProvider {
                resets: AtomicUsize::new(0),
            }))
        }
    }

    fn pool_config(min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            min,
            max,
            refill_size: 2,
            check_interval_secs: 3600,
        }
    }

    async fn counting_pool(
        min: usize,
        max: usize,
    ) -> (Arc<ResourcePool<CountingProvider>>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(CountingFactory {
            created: Arc::clone(&created),
            fail: false,
        });
        let pool = ResourcePool::new("test", factory, pool_config(min, max))
            .await
            .expect("pool should build");
        (pool, created)
    }

    #[tokio::test]
    async fn counters_hold_invariant_through_lease_cycle() {
        let (pool, _) = counting_pool(1, 3).await;

        let stats = pool.stats().await;
        assert_eq!(stats.available + stats.in_use, stats.total);
        assert_eq!(stats.total, 1);

        let a = pool.get().await.expect("idle lease");
        let b = pool.get().await.expect("constructed lease");
        let stats = pool.stats().await;
        assert_eq!(stats.in_use, 2);
        assert_eq!(stats.available + stats.in_use, stats.total);

        pool.put(a).await;
        pool.put(b).await;
        let stats = pool.stats().await;
        assert_eq!(stats.in_use, 0);
        assert_eq!(stats.available, 2);
        assert!(stats.total <= 3);
    }

    #[tokio::test]
    async fn exhausted_pool_rejects_then_recovers_after_put() {
        let (pool, _) = counting_pool(0, 1).await;

        let first = pool.get().await.expect("first lease");
        let err = pool.get().await.expect_err("second lease must fail");
        assert_eq!(err.kind(), "pool_exhausted");

        pool.put(first).await;
        pool.get().await.expect("lease after return succeeds");
    }

    #[tokio::test]
    async fn put_resets_before_repooling() {
        let (pool, _) = counting_pool(1, 1).await;
        let instance = pool.get().await.expect("lease");
        assert_eq!(instance.resets.load(Ordering::SeqCst), 0);
        pool.put(Arc::clone(&instance)).await;
        assert_eq!(instance.resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn construction_failure_does_not_leak_slots() {
        let created = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(CountingFactory {
            created: Arc::clone(&created),
            fail: true,
        });
        let pool = ResourcePool::new("failing", factory, pool_config(0, 2))
            .await
            .expect("min=0 builds without construction");

        assert!(pool.get().await.is_err());
        let stats = pool.stats().await;
        assert_eq!(stats.total, 0);
        assert_eq!(stats.in_use, 0);
    }

    #[tokio::test]
    async fn closed_pool_refuses_leases_and_destroys_returns() {
        let (pool, _) = counting_pool(1, 2).await;
        let leased = pool.get().await.expect("lease before close");

        pool.close().await;
        assert!(matches!(pool.get().await, Err(Error::PoolClosed)));

        pool.put(leased).await;
        let stats = pool.stats().await;
        assert_eq!(stats.available, 0);
        assert_eq!(stats.total, 0);
    }

    mod manager {
        use super::*;
        use crate::audio::{AudioFrame, AudioParams};
        use crate::config::{Config, ProviderConfig, ProvidersConfig};
        use crate::providers::registry::{
            AsrFactory, LlmFactory, TtsFactory, VlllmFactory,
        };
        use crate::providers::{
            ChatTurn, FrameStream, TokenStream, TranscriptListener, VoiceConfig,
        };

        struct StubProvider;

        #[async_trait]
        impl Provider for StubProvider {
            async fn initialize(&self) -> Result<()> {
                Ok(())
            }

            async fn cleanup(&self) -> Result<()> {
                Ok(())
            }

            async fn reset(&self) -> Result<()> {
                Ok(())
            }
        }

        #[async_trait]
        impl AsrProvider for StubProvider {
            async fn add_audio(&self, _frame: &AudioFrame) -> Result<()> {
                Ok(())
            }

            async fn set_listener(&self, _listener: TranscriptListener) {}

            async fn take_listener(&self) -> Option<TranscriptListener> {
                None
            }

            async fn finalize(&self) -> Result<()> {
                Ok(())
            }
        }

        #[async_trait]
        impl LlmProvider for StubProvider {
            async fn respond(&self, _turns: Vec<ChatTurn>) -> Result<TokenStream> {
                let (_tx, rx) = tokio::sync::mpsc::channel(1);
                Ok(rx)
            }
        }

        #[async_trait]
        impl TtsProvider for StubProvider {
            async fn synthesise(
                &self,
                _text: &str,
                _voice: &VoiceConfig,
                _params: AudioParams,
            ) -> Result<FrameStream> {
                let (_tx, rx) = tokio::sync::mpsc::channel(1);
                Ok(rx)
            }
        }

        struct StubAsrFactory;

        #[async_trait]
        impl AsrFactory for StubAsrFactory {
            async fn create(&self, _config: &ProviderConfig) -> Result<Arc<dyn AsrProvider>> {
                Ok(Arc::new(StubProvider))
            }
        }

        struct StubLlmFactory;

        #[async_trait]
        impl LlmFactory for StubLlmFactory {
            async fn create(&self, _config: &ProviderConfig) -> Result<Arc<dyn LlmProvider>> {
                Ok(Arc::new(StubProvider))
            }
        }

        struct StubTtsFactory;

        #[async_trait]
        impl TtsFactory for StubTtsFactory {
            async fn create(&self, _config: &ProviderConfig) -> Result<Arc<dyn TtsProvider>> {
                Ok(Arc::new(StubProvider))
            }
        }

        struct FailingVlllmFactory;

        #[async_trait]
        impl VlllmFactory for FailingVlllmFactory {
            async fn create(&self, _config: &ProviderConfig) -> Result<Arc<dyn VlllmProvider>> {
                Err(Error::ProviderFatal("vendor unreachable".into()))
            }
        }

        fn stub_registry() -> ProviderRegistry {
            let mut registry = ProviderRegistry::new();
            registry.register_asr("stub", Arc::new(StubAsrFactory));
            registry.register_llm("stub", Arc::new(StubLlmFactory));
            registry.register_tts("stub", Arc::new(StubTtsFactory));
            registry.register_vlllm("failing", Arc::new(FailingVlllmFactory));
            registry
        }

        fn stub_config(with_failing_vlllm: bool) -> Config {
            let mut config = Config::default();
            let provider = |kind: &str| ProviderConfig {
                kind: kind.to_string(),
                ..ProviderConfig::default()
            };
            config.providers = ProvidersConfig {
                asr: provider("stub"),
                llm: provider("stub"),
                vlllm: with_failing_vlllm.then(|| provider("failing")),
                tts: provider("stub"),
            };
            let pool = PoolConfig {
                min: 0,
                max: 2,
                refill_size: 1,
                check_interval_secs: 3600,
            };
            config.pools.asr = pool;
            config.pools.llm = pool;
            config.pools.vlllm = pool;
            config.pools.tts = pool;
            config
        }

        #[tokio::test]
        async fn lease_and_release_round_trip() {
            let manager = PoolManager::new(&stub_registry(), &stub_config(false))
                .await
                .expect("manager should build");
            let set = manager.lease_set().await.expect("lease");
            let stats = manager.detailed_stats().await;
            assert_eq!(stats["asr"].in_use, 1);
            assert_eq!(stats["tts"].in_use, 1);
            assert!(!stats.contains_key("vlllm"));

            manager.release_set(set).await;
            let stats = manager.detailed_stats().await;
            assert_eq!(stats["asr"].in_use, 0);
            assert_eq!(stats["llm"].in_use, 0);
        }

        #[tokio::test]
        async fn failed_sub_lease_rolls_back_earlier_leases() {
            let manager = PoolManager::new(&stub_registry(), &stub_config(true))
                .await
                .expect("min=0 builds without construction");
            let err = manager.lease_set().await.expect_err("vlllm factory fails");
            assert_eq!(err.kind(), "provider_fatal");

            // Nothing stays leased after the rollback.
            let stats = manager.detailed_stats().await;
            assert_eq!(stats["asr"].in_use, 0);
            assert_eq!(stats["llm"].in_use, 0);
            assert_eq!(stats["tts"].in_use, 0);
        }
    }

    #[tokio::test]
    async fn refill_restores_minimum() {
        let (pool, created) = counting_pool(2, 4).await;
        let a = pool.get().await.expect("lease");
        let b = pool.get().await.expect("lease");
        // Simulate fatal failures draining the pool below min.
        pool.discard(a).await;
        pool.discard(b).await;
        assert_eq!(pool.stats().await.total, 0);

        pool.refill().await;
        let stats = pool.stats().await;
        assert_eq!(stats.available, 2);
        assert!(created.load(Ordering::SeqCst) >= 4);
    }
}
