//! Samples executed queries, folds them into patterns and periodically turns
//! the patterns into index suggestions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::pattern::{DetectedQueryPattern, ExecutedQuery, QueryShape};
use crate::cancel::Cancellation;
use crate::indexes::{CreateOutcome, IndexError, IndexManager, IndexSuggestion};
use crate::projection::{AggregateRegistry, collection_name};
use crate::retry::duration_ms;
use crate::smart_config::{ObjectCategory, QueryPatternTrackingConfig, SmartProjectionService};
use crate::workers::WorkerHandle;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub enabled: bool,
    /// How often accumulated patterns are analysed.
    #[serde(with = "duration_ms")]
    pub analysis_interval: Duration,
    /// Samples buffered between `observe` and the fold task; overflow is dropped.
    pub channel_capacity: usize,
    /// Execution counts are multiplied by this after every analysis.
    pub decay_factor: f64,
    /// Distinct patterns tracked per collection; new shapes beyond this are ignored.
    pub max_patterns_per_collection: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            analysis_interval: Duration::from_secs(60 * 60),
            channel_capacity: 10_000,
            decay_factor: 0.5,
            max_patterns_per_collection: 1_000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OptimizerStats {
    pub observed: u64,
    pub sampled: u64,
    /// Dropped because the sample buffer was full.
    pub dropped: u64,
    pub folded: u64,
    pub analyses: u64,
    pub suggestions: u64,
    pub indexes_created: u64,
    pub evicted: u64,
}

/// What `observe` did with a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Sampled,
    NotSampled,
    /// Tracking disabled for this tenant and type, or the optimizer is off.
    Disabled,
    UnknownAggregateType,
    BufferFull,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalysisReport {
    pub collections: usize,
    pub patterns: usize,
    pub suggestions: Vec<IndexSuggestion>,
    /// Names of indexes created automatically in this run.
    pub created: Vec<String>,
    pub evicted: usize,
}

#[derive(Debug)]
struct Sample {
    collection: String,
    query: ExecutedQuery,
    at: DateTime<Utc>,
}

type PatternTable = HashMap<String, HashMap<String, DetectedQueryPattern>>;

struct Inner {
    config: OptimizerConfig,
    indexes: IndexManager,
    configs: Arc<SmartProjectionService>,
    registry: Arc<AggregateRegistry>,
    patterns: Mutex<PatternTable>,
    tx: mpsc::Sender<Sample>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Sample>>,
    analysis: tokio::sync::Mutex<()>,
    stats: Mutex<OptimizerStats>,
    last_suggestions: Mutex<HashMap<String, Vec<IndexSuggestion>>>,
}

/// Query pattern optimizer. Cheap to clone.
#[derive(Clone)]
pub struct QueryPatternOptimizer {
    inner: Arc<Inner>,
}

impl core::fmt::Debug for QueryPatternOptimizer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("QueryPatternOptimizer")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl QueryPatternOptimizer {
    pub fn new(
        config: OptimizerConfig,
        indexes: IndexManager,
        configs: Arc<SmartProjectionService>,
        registry: Arc<AggregateRegistry>,
    ) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                indexes,
                configs,
                registry,
                patterns: Mutex::new(HashMap::new()),
                tx,
                rx: tokio::sync::Mutex::new(rx),
                analysis: tokio::sync::Mutex::new(()),
                stats: Mutex::new(OptimizerStats::default()),
                last_suggestions: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn stats(&self) -> OptimizerStats {
        self.inner.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn record_stats(&self, f: impl FnOnce(&mut OptimizerStats)) {
        if let Ok(mut stats) = self.inner.stats.lock() {
            f(&mut stats);
        }
    }

    /// Sampling decision plus a non-blocking hand-off to the fold task.
    ///
    /// Only the tenant's resolved tracking config is consulted here; nothing on
    /// this path waits for pattern bookkeeping.
    pub async fn observe(&self, query: ExecutedQuery) -> Observation {
        let category = match self.admit(&query) {
            Ok(category) => category,
            Err(observation) => return observation,
        };
        let config = match self.inner.configs.resolve(query.tenant_id, &query.aggregate_type, category).await {
            Ok(config) => config,
            Err(err) => {
                debug!(aggregate_type = %query.aggregate_type, error = %err, "no tracking config; sample skipped");
                return Observation::Disabled;
            }
        };
        self.sample(&config.query_pattern_tracking, query)
    }

    /// [`observe`](Self::observe) without waiting: samples inline when the
    /// tenant's config is cached, otherwise resolves on a spawned task.
    pub fn observe_detached(&self, query: ExecutedQuery) {
        match self.inner.configs.peek(query.tenant_id, &query.aggregate_type) {
            Some(config) => {
                if self.admit(&query).is_ok() {
                    self.sample(&config.query_pattern_tracking, query);
                }
            }
            None => {
                let optimizer = self.clone();
                tokio::spawn(async move {
                    optimizer.observe(query).await;
                });
            }
        }
    }

    fn admit(&self, query: &ExecutedQuery) -> Result<ObjectCategory, Observation> {
        self.record_stats(|s| s.observed += 1);
        if !self.inner.config.enabled {
            return Err(Observation::Disabled);
        }
        self.inner
            .registry
            .category_of(&query.aggregate_type)
            .ok_or(Observation::UnknownAggregateType)
    }

    fn sample(&self, tracking: &QueryPatternTrackingConfig, query: ExecutedQuery) -> Observation {
        if !tracking.enabled {
            return Observation::Disabled;
        }
        if !rand::thread_rng().gen_bool(tracking.sample_rate.clamp(0.0, 1.0)) {
            return Observation::NotSampled;
        }

        let sample = Sample {
            collection: collection_name(&query.aggregate_type),
            query,
            at: Utc::now(),
        };
        match self.inner.tx.try_send(sample) {
            Ok(()) => {
                self.record_stats(|s| s.sampled += 1);
                Observation::Sampled
            }
            Err(_) => {
                self.record_stats(|s| s.dropped += 1);
                Observation::BufferFull
            }
        }
    }

    /// Fold one execution into its pattern.
    pub fn record(&self, collection: &str, query: &ExecutedQuery, at: DateTime<Utc>) {
        let shape = QueryShape::of(query);
        let hash = shape.pattern_hash();
        let Ok(mut table) = self.inner.patterns.lock() else {
            return;
        };
        let patterns = table.entry(collection.to_string()).or_default();
        if !patterns.contains_key(&hash) && patterns.len() >= self.inner.config.max_patterns_per_collection {
            return;
        }
        patterns
            .entry(hash)
            .or_insert_with(|| DetectedQueryPattern::new(collection, &shape, at))
            .record(query, at);
        drop(table);
        self.record_stats(|s| s.folded += 1);
    }

    /// Fold whatever is buffered. Returns 0 while the fold task owns the buffer.
    pub fn fold_pending(&self) -> usize {
        let Ok(mut rx) = self.inner.rx.try_lock() else {
            return 0;
        };
        let mut folded = 0;
        while let Ok(sample) = rx.try_recv() {
            self.record(&sample.collection, &sample.query, sample.at);
            folded += 1;
        }
        folded
    }

    /// Snapshot of the patterns tracked for `collection`, busiest first.
    pub fn patterns(&self, collection: &str) -> Vec<DetectedQueryPattern> {
        let mut patterns: Vec<DetectedQueryPattern> = self
            .inner
            .patterns
            .lock()
            .map(|t| t.get(collection).map(|p| p.values().cloned().collect()).unwrap_or_default())
            .unwrap_or_default();
        patterns.sort_by(|a, b| b.execution_count.cmp(&a.execution_count).then_with(|| a.pattern_hash.cmp(&b.pattern_hash)));
        patterns
    }

    /// Suggestions from the last analysis of `collection`, for operator review.
    pub fn suggestions(&self, collection: &str) -> Vec<IndexSuggestion> {
        self.inner
            .last_suggestions
            .lock()
            .map(|s| s.get(collection).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Operator path: build a suggestion the automatic run did not create.
    pub async fn apply_suggestion(
        &self,
        suggestion: &IndexSuggestion,
        cancel: &Cancellation,
    ) -> Result<CreateOutcome, IndexError> {
        let outcome = self
            .inner
            .indexes
            .create_suggested_index(&suggestion.collection, suggestion, cancel)
            .await?;
        self.mark_index_created(&suggestion.collection, &suggestion.pattern_hash);
        if outcome == CreateOutcome::Created {
            self.record_stats(|s| s.indexes_created += 1);
        }
        Ok(outcome)
    }

    fn mark_index_created(&self, collection: &str, pattern_hash: &str) {
        if let Ok(mut table) = self.inner.patterns.lock() {
            if let Some(pattern) = table.get_mut(collection).and_then(|p| p.get_mut(pattern_hash)) {
                pattern.index_created = true;
            }
        }
    }

    /// Run one analysis pass now.
    ///
    /// Returns `Ok(None)` without doing anything if another pass is running.
    pub async fn analyze_now(&self, cancel: &Cancellation) -> Result<Option<AnalysisReport>, IndexError> {
        let Ok(_guard) = self.inner.analysis.try_lock() else {
            debug!("analysis already running; skipped");
            return Ok(None);
        };
        self.fold_pending();

        let collections: Vec<String> = self
            .inner
            .patterns
            .lock()
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default();

        let mut report = AnalysisReport::default();
        for collection in collections {
            cancel.check()?;
            self.analyze_collection(&collection, cancel, &mut report).await?;
            report.collections += 1;
        }

        self.record_stats(|s| {
            s.analyses += 1;
            s.suggestions += report.suggestions.len() as u64;
            s.indexes_created += report.created.len() as u64;
            s.evicted += report.evicted as u64;
        });
        info!(
            collections = report.collections,
            patterns = report.patterns,
            suggestions = report.suggestions.len(),
            created = report.created.len(),
            evicted = report.evicted,
            "query pattern analysis finished"
        );
        Ok(Some(report))
    }

    async fn analyze_collection(
        &self,
        collection: &str,
        cancel: &Cancellation,
        report: &mut AnalysisReport,
    ) -> Result<(), IndexError> {
        let Some(descriptor) = self.inner.registry.for_collection(collection) else {
            return Ok(());
        };
        let config = match self
            .inner
            .configs
            .resolve_object_type(&descriptor.aggregate_type, descriptor.category)
            .await
        {
            Ok(config) => config,
            Err(err) => {
                warn!(collection, error = %err, "cannot resolve config; analysis skipped");
                return Ok(());
            }
        };
        let tracking = &config.query_pattern_tracking;
        let window = chrono::Duration::hours(i64::from(tracking.analysis_window_hours));

        let mut patterns = self.patterns(collection);
        report.patterns += patterns.len();

        if tracking.enabled {
            match self
                .inner
                .indexes
                .suggest_indexes(collection, &mut patterns, tracking, cancel)
                .await
            {
                Ok(suggestions) => {
                    if tracking.auto_create_indexes && config.auto_optimize {
                        for suggestion in suggestions.iter().take(tracking.max_auto_indexes_per_run) {
                            cancel.check()?;
                            match self.inner.indexes.create_suggested_index(collection, suggestion, cancel).await {
                                Ok(_) => {
                                    if let Some(p) = patterns.iter_mut().find(|p| p.pattern_hash == suggestion.pattern_hash) {
                                        p.index_created = true;
                                    }
                                    report.created.push(suggestion.suggested_index_name.clone());
                                }
                                Err(IndexError::Cancelled) => return Err(IndexError::Cancelled),
                                Err(err) => warn!(
                                    collection,
                                    index = %suggestion.suggested_index_name,
                                    error = %err,
                                    "auto index creation failed"
                                ),
                            }
                        }
                    }
                    if let Ok(mut last) = self.inner.last_suggestions.lock() {
                        last.insert(collection.to_string(), suggestions.clone());
                    }
                    report.suggestions.extend(suggestions);
                }
                Err(IndexError::Cancelled) => return Err(IndexError::Cancelled),
                Err(err) => warn!(collection, error = %err, "index suggestion failed"),
            }
        }

        // Merge flags back and age the table; samples folded meanwhile are kept.
        let now = Utc::now();
        if let Ok(mut table) = self.inner.patterns.lock() {
            if let Some(current) = table.get_mut(collection) {
                for analysed in &patterns {
                    if let Some(p) = current.get_mut(&analysed.pattern_hash) {
                        p.index_created = analysed.index_created;
                    }
                }
                let before = current.len();
                current.retain(|_, p| now - p.last_seen <= window);
                report.evicted += before - current.len();
                for p in current.values_mut() {
                    p.decay(self.inner.config.decay_factor);
                }
                if current.is_empty() {
                    table.remove(collection);
                }
            }
        }
        Ok(())
    }

    /// Start the fold task and the periodic analysis task.
    pub fn spawn(&self) -> OptimizerHandle {
        let folder = {
            let this = self.clone();
            WorkerHandle::spawn("pattern-folder", move |cancel| async move { this.run_folder(cancel).await })
        };
        let analyzer = {
            let this = self.clone();
            WorkerHandle::spawn("pattern-analyzer", move |cancel| async move { this.run_analyzer(cancel).await })
        };
        OptimizerHandle {
            optimizer: self.clone(),
            folder,
            analyzer,
        }
    }

    async fn run_folder(&self, cancel: Cancellation) {
        let mut rx = self.inner.rx.lock().await;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                sample = rx.recv() => match sample {
                    Some(sample) => self.record(&sample.collection, &sample.query, sample.at),
                    None => break,
                },
            }
        }
        while let Ok(sample) = rx.try_recv() {
            self.record(&sample.collection, &sample.query, sample.at);
        }
    }

    async fn run_analyzer(&self, cancel: Cancellation) {
        info!(interval = ?self.inner.config.analysis_interval, "query pattern analyzer started");
        let mut tick = tokio::time::interval(self.inner.config.analysis_interval.max(Duration::from_millis(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // the first tick completes immediately
        tick.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            match self.analyze_now(&cancel).await {
                Ok(_) => {}
                Err(IndexError::Cancelled) => break,
                Err(err) => warn!(error = %err, "query pattern analysis failed"),
            }
        }
        info!(stats = ?self.stats(), "query pattern analyzer stopped");
    }
}

/// Handle to a running optimizer.
#[derive(Debug)]
pub struct OptimizerHandle {
    optimizer: QueryPatternOptimizer,
    folder: WorkerHandle,
    analyzer: WorkerHandle,
}

impl OptimizerHandle {
    pub fn optimizer(&self) -> &QueryPatternOptimizer {
        &self.optimizer
    }

    pub fn stats(&self) -> OptimizerStats {
        self.optimizer.stats()
    }

    /// Stop analysis (an in-flight pass observes cancellation), then fold
    /// what is buffered and stop.
    pub async fn shutdown(self) {
        self.analyzer.shutdown().await;
        self.folder.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use smartproj_core::TenantId;

    use super::*;
    use crate::indexes::{InMemoryIndexBackend, IndexBackend};
    use crate::projection::{AggregateDescriptor, InMemoryAggregateSource};
    use crate::query_patterns::SortField;
    use crate::smart_config::{ConfigCacheConfig, ConfigOverride, InMemoryOverrideSource, ObjectCategory, TrackingOverride};

    struct Fixture {
        optimizer: QueryPatternOptimizer,
        backend: Arc<InMemoryIndexBackend>,
        overrides: Arc<InMemoryOverrideSource>,
    }

    fn fixture(config: OptimizerConfig) -> Fixture {
        let backend = Arc::new(InMemoryIndexBackend::new());
        let overrides = Arc::new(InMemoryOverrideSource::new());
        let registry = AggregateRegistry::new().with(AggregateDescriptor::new(
            "SalesOrder",
            ObjectCategory::Transaction,
            Arc::new(InMemoryAggregateSource::new()),
        ));
        let configs = Arc::new(SmartProjectionService::new(overrides.clone(), ConfigCacheConfig::default()));
        let optimizer = QueryPatternOptimizer::new(config, IndexManager::new(backend.clone()), configs, Arc::new(registry));
        Fixture {
            optimizer,
            backend,
            overrides,
        }
    }

    fn track_everything(overrides: &InMemoryOverrideSource, auto_create: bool) {
        overrides.set_object_override(
            "SalesOrder",
            ConfigOverride {
                query_pattern_tracking: Some(TrackingOverride {
                    sample_rate: Some(1.0),
                    min_execution_count: Some(5),
                    auto_create_indexes: Some(auto_create),
                    ..TrackingOverride::default()
                }),
                ..ConfigOverride::default()
            },
        );
    }

    fn query(filter: serde_json::Value) -> ExecutedQuery {
        ExecutedQuery {
            tenant_id: TenantId::new(),
            aggregate_type: "SalesOrder".into(),
            filter,
            sort: vec![SortField::desc("DocumentDate")],
            execution_time_ms: 40.0,
            docs_examined: 5_000,
            docs_returned: 5,
        }
    }

    #[tokio::test]
    async fn sampled_queries_fold_into_one_pattern_per_shape() {
        let f = fixture(OptimizerConfig::default());
        track_everything(&f.overrides, false);

        for customer in ["a", "b", "c"] {
            let obs = f.optimizer.observe(query(json!({"CustomerId": customer, "Status": "Open"}))).await;
            assert_eq!(obs, Observation::Sampled);
        }
        assert_eq!(f.optimizer.fold_pending(), 3);

        let patterns = f.optimizer.patterns("Entity_SalesOrder");
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].execution_count, 3);
        assert_eq!(patterns[0].filter_fields, vec!["CustomerId", "Status"]);
    }

    #[tokio::test]
    async fn zero_sample_rate_and_unknown_types_are_ignored() {
        let f = fixture(OptimizerConfig::default());
        f.overrides.set_object_override(
            "SalesOrder",
            ConfigOverride {
                query_pattern_tracking: Some(TrackingOverride {
                    sample_rate: Some(0.0),
                    ..TrackingOverride::default()
                }),
                ..ConfigOverride::default()
            },
        );
        assert_eq!(f.optimizer.observe(query(json!({"Status": "Open"}))).await, Observation::NotSampled);

        let mut unknown = query(json!({}));
        unknown.aggregate_type = "Payroll".into();
        assert_eq!(f.optimizer.observe(unknown).await, Observation::UnknownAggregateType);
    }

    #[tokio::test]
    async fn full_buffer_drops_instead_of_blocking() {
        let f = fixture(OptimizerConfig {
            channel_capacity: 2,
            ..OptimizerConfig::default()
        });
        track_everything(&f.overrides, false);
        for _ in 0..2 {
            assert_eq!(f.optimizer.observe(query(json!({"Status": "Open"}))).await, Observation::Sampled);
        }
        assert_eq!(f.optimizer.observe(query(json!({"Status": "Open"}))).await, Observation::BufferFull);
        assert_eq!(f.optimizer.stats().dropped, 1);
    }

    #[tokio::test]
    async fn analysis_suggests_without_auto_create() {
        let f = fixture(OptimizerConfig::default());
        track_everything(&f.overrides, false);
        for _ in 0..10 {
            f.optimizer.observe(query(json!({"CustomerId": "c", "Status": "Open"}))).await;
        }

        let report = f.optimizer.analyze_now(&Cancellation::never()).await.unwrap().unwrap();
        assert_eq!(report.suggestions.len(), 1);
        assert!(report.created.is_empty());
        assert_eq!(f.optimizer.suggestions("Entity_SalesOrder").len(), 1);
        assert!(f.backend.list_indexes("Entity_SalesOrder").await.unwrap().is_empty());

        // counts decay after each pass
        assert_eq!(f.optimizer.patterns("Entity_SalesOrder")[0].execution_count, 5);

        // operator applies it
        let suggestion = f.optimizer.suggestions("Entity_SalesOrder").remove(0);
        f.optimizer.apply_suggestion(&suggestion, &Cancellation::never()).await.unwrap();
        assert!(f.optimizer.patterns("Entity_SalesOrder")[0].index_created);
    }

    #[tokio::test]
    async fn auto_create_builds_index_and_closes_the_loop() {
        let f = fixture(OptimizerConfig::default());
        track_everything(&f.overrides, true);
        for _ in 0..10 {
            f.optimizer.observe(query(json!({"CustomerId": "c", "Status": "Open"}))).await;
        }

        let report = f.optimizer.analyze_now(&Cancellation::never()).await.unwrap().unwrap();
        assert_eq!(report.created.len(), 1);
        let indexes = f.backend.list_indexes("Entity_SalesOrder").await.unwrap();
        assert_eq!(indexes.len(), 1);
        assert!(indexes[0].background);
        assert!(f.optimizer.patterns("Entity_SalesOrder")[0].index_created);

        // traffic keeps coming; the covered pattern yields nothing new
        for _ in 0..10 {
            f.optimizer.observe(query(json!({"CustomerId": "c", "Status": "Open"}))).await;
        }
        let again = f.optimizer.analyze_now(&Cancellation::never()).await.unwrap().unwrap();
        assert!(again.suggestions.is_empty());
        assert!(again.created.is_empty());
    }

    #[tokio::test]
    async fn auto_create_respects_per_run_cap() {
        let f = fixture(OptimizerConfig::default());
        f.overrides.set_object_override(
            "SalesOrder",
            ConfigOverride {
                query_pattern_tracking: Some(TrackingOverride {
                    sample_rate: Some(1.0),
                    min_execution_count: Some(1),
                    auto_create_indexes: Some(true),
                    max_auto_indexes_per_run: Some(1),
                    ..TrackingOverride::default()
                }),
                ..ConfigOverride::default()
            },
        );
        f.optimizer.observe(query(json!({"A": 1}))).await;
        f.optimizer.observe(query(json!({"B": 1}))).await;

        let report = f.optimizer.analyze_now(&Cancellation::never()).await.unwrap().unwrap();
        assert_eq!(report.suggestions.len(), 2);
        assert_eq!(report.created.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_analysis_is_single_flight() {
        let f = fixture(OptimizerConfig::default());
        let _held = f.optimizer.inner.analysis.lock().await;
        assert!(f.optimizer.analyze_now(&Cancellation::never()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn idle_patterns_are_evicted() {
        let f = fixture(OptimizerConfig::default());
        let old = Utc::now() - chrono::Duration::hours(48);
        f.optimizer.record("Entity_SalesOrder", &query(json!({"Status": "x"})), old);

        let report = f.optimizer.analyze_now(&Cancellation::never()).await.unwrap().unwrap();
        assert_eq!(report.evicted, 1);
        assert!(f.optimizer.patterns("Entity_SalesOrder").is_empty());
    }

    #[tokio::test]
    async fn spawned_tasks_fold_and_stop() {
        let f = fixture(OptimizerConfig::default());
        track_everything(&f.overrides, false);
        let handle = f.optimizer.spawn();
        for _ in 0..3 {
            handle.optimizer().observe(query(json!({"Status": "Open"}))).await;
        }
        handle.shutdown().await;
        assert_eq!(f.optimizer.patterns("Entity_SalesOrder")[0].execution_count, 3);
    }
}
