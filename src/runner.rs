//! Multi-batch runs and scheduled jobs
//!
//! A [`Pipeline`] bundles the long-lived components. [`run_generation`]
//! drives a sequence of batches, persists what is accepted, evolves the
//! weights on schedule and always writes the final artifacts, even when
//! interrupted.

use crate::config::GeneratorConfig;
use crate::db::{QuestionSink, QuestionStore};
use crate::embeddings::OnnxEmbedder;
use crate::generator::{GenerationCapability, QuestionGenerator};
use crate::metrics::{EvaluationMetrics, EvolutionSchedule, MetricsReport};
use crate::providers::ProviderChain;
use crate::similarity::{Embedder, SimilarityEngine};
use crate::taxonomy::IntentTaxonomy;
use crate::types::{BatchRequest, Difficulty, GeneratedQuestion};
use crate::weights::{EvolutionStrategy, WeightModel};
use anyhow::{Context, Result};
use rand::Rng;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::future::Future;
use std::time::{Duration, Instant};

/// Long-lived components shared by every batch of a process
pub struct Pipeline {
    pub config: GeneratorConfig,
    pub generator: QuestionGenerator,
    pub sink: Option<Box<dyn QuestionSink>>,
}

impl Pipeline {
    pub fn new(config: GeneratorConfig, generator: QuestionGenerator, sink: Option<Box<dyn QuestionSink>>) -> Self {
        Self { config, generator, sink }
    }

    /// Wire the production components from configuration
    pub fn build(config: GeneratorConfig) -> Result<Self> {
        let taxonomy = IntentTaxonomy::load(&config.taxonomy_path, &config.excluded_intents)?;
        let weights = WeightModel::new(taxonomy, &config)?;
        tracing::info!("Weight model: {} active intents", weights.weights().len());

        let store = open_store(&config);
        let reference = match &store {
            Some(store) => store.load_reference_pool()?,
            None => Vec::new(),
        };

        let embedder = OnnxEmbedder::new(&config.model_dir).context("Failed to load embedding model")?;
        let similarity = SimilarityEngine::new(Some(Box::new(embedder)), reference, &config)?;

        let capability = ProviderChain::from_config(&config)?;
        tracing::info!("Provider chain: {} provider key(s)", capability.len());

        let system_context = load_system_context(&config.system_context_path);
        let generator = QuestionGenerator::new(weights, similarity, Box::new(capability), system_context, &config);

        let sink = store.map(|s| Box::new(s) as Box<dyn QuestionSink>);
        Ok(Self::new(config, generator, sink))
    }

    /// Assemble from caller-supplied capabilities; used by tests and embedders of the library
    pub fn with_capabilities(
        config: GeneratorConfig,
        taxonomy: IntentTaxonomy,
        embedder: Box<dyn Embedder>,
        reference: Vec<(String, Vec<f32>)>,
        capability: Box<dyn GenerationCapability>,
        system_context: String,
        sink: Option<Box<dyn QuestionSink>>,
    ) -> Result<Self> {
        let weights = WeightModel::new(taxonomy, &config)?;
        let similarity = SimilarityEngine::new(Some(embedder), reference, &config)?;
        let generator = QuestionGenerator::new(weights, similarity, capability, system_context, &config);
        Ok(Self::new(config, generator, sink))
    }

    fn persist(&mut self, questions: &[GeneratedQuestion], batch_id: &str, cron_run_id: Option<&str>) {
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        if let Err(e) = sink.insert_questions(questions, batch_id, cron_run_id) {
            tracing::error!("Failed to persist {} questions: {:#}", questions.len(), e);
        }
    }

    /// Random mix size from the configured inclusive range
    fn pick_mix_size(&self) -> usize {
        let (lo, hi) = self.config.intent_mix_sizes;
        rand::thread_rng().gen_range(lo..=hi.max(lo))
    }

    fn evaluator(&self) -> EvaluationMetrics {
        EvaluationMetrics::new(self.generator.weights().taxonomy().active_ids().len())
    }

    /// Metrics for `questions`, whose vectors entered the generated pool at `pool_start`
    fn report_since(&self, questions: &[GeneratedQuestion], duplicates: usize, pool_start: usize) -> MetricsReport {
        let vectors: Vec<&[f32]> = self
            .generator
            .similarity()
            .generated_pool()
            .vectors()
            .skip(pool_start)
            .collect();
        self.evaluator().calculate(questions, duplicates, &vectors)
    }
}

/// Open the SQLite store when enabled; failure degrades to no storage
pub fn open_store(config: &GeneratorConfig) -> Option<QuestionStore> {
    if !config.use_db {
        return None;
    }
    match QuestionStore::open(&config.db_path) {
        Ok(store) => Some(store),
        Err(e) => {
            tracing::warn!("Question store unavailable, continuing without storage: {:#}", e);
            None
        }
    }
}

/// Similarity engine over the stored reference corpus, without providers
pub fn build_similarity(config: &GeneratorConfig) -> Result<SimilarityEngine> {
    let reference = match open_store(config) {
        Some(store) => store.load_reference_pool()?,
        None => Vec::new(),
    };
    let embedder = OnnxEmbedder::new(&config.model_dir).context("Failed to load embedding model")?;
    Ok(SimilarityEngine::new(Some(Box::new(embedder)), reference, config)?)
}

fn load_system_context(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!("No system context at {:?} ({}); using none", path, e);
            String::new()
        }
    }
}

/// What a multi-batch run should do
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub batch_size: usize,
    pub batches: usize,
    pub difficulty: Difficulty,
    /// Fixed intents per question; random from the configured range when `None`
    pub mix_size: Option<usize>,
    pub target_intents: Option<Vec<u32>>,
    /// Overrides the configured evolution strategy
    pub strategy: Option<EvolutionStrategy>,
    pub dry_run: bool,
}

impl RunPlan {
    pub fn new(batch_size: usize, batches: usize) -> Self {
        Self {
            batch_size,
            batches,
            difficulty: Difficulty::Hard,
            mix_size: None,
            target_intents: None,
            strategy: None,
            dry_run: false,
        }
    }

    /// Enough batches to reach `total` questions
    pub fn for_total(total: usize, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self::new(batch_size, total.div_ceil(batch_size))
    }

    /// One batch of three, never evolving
    pub fn dry_run(mut self) -> Self {
        self.batch_size = 3;
        self.batches = 1;
        self.dry_run = true;
        self
    }
}

/// Result of [`run_generation`]
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub batch_id: String,
    pub questions: Vec<GeneratedQuestion>,
    pub metrics: MetricsReport,
    pub batches_run: usize,
    pub interrupted: bool,
}

#[derive(Serialize)]
struct RunMeta<'a> {
    batch_id: &'a str,
    duration_seconds: f64,
    batches_attempted: usize,
    batches_run: usize,
    difficulty: Difficulty,
    timestamp: String,
}

/// Run `plan` to completion, or until `stop` is set.
///
/// Batch failures end the loop early but never skip finalization.
pub fn run_generation(pipeline: &mut Pipeline, plan: &RunPlan, stop: &AtomicBool) -> Result<RunOutcome> {
    let strategy = match plan.strategy {
        Some(s) => s,
        None => pipeline.config.evolution_strategy.parse()?,
    };
    let schedule = if plan.dry_run {
        EvolutionSchedule::disabled()
    } else {
        EvolutionSchedule::new(pipeline.config.evolution_frequency, plan.batch_size)
    };

    let output_dir = pipeline.config.output_dir.clone();
    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("Failed to create output directory {:?}", output_dir))?;

    let started = Instant::now();
    let batch_id = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    let pool_start = pipeline.generator.similarity().generated_len();
    let duplicates_start = pipeline.generator.stats().total_rejected_duplicates;

    tracing::info!(
        "Starting generation: {} batches of {} (evolution every {:?} batches, strategy={})",
        plan.batches,
        plan.batch_size,
        schedule.interval(),
        strategy
    );

    let mut questions: Vec<GeneratedQuestion> = Vec::new();
    let mut batches_run = 0;
    let mut interrupted = false;

    for i in 0..plan.batches {
        if stop.load(Ordering::SeqCst) {
            tracing::warn!("Generation interrupted after {} batches", batches_run);
            interrupted = true;
            break;
        }
        tracing::info!("Batch {}/{}", i + 1, plan.batches);

        let request = BatchRequest {
            batch_size: plan.batch_size,
            difficulty: plan.difficulty,
            mix_size: plan.mix_size.unwrap_or_else(|| pipeline.pick_mix_size()),
            target_intents: plan.target_intents.clone(),
        };

        let batch = match pipeline.generator.generate_batch(&request) {
            Ok(batch) => batch,
            Err(e) => {
                tracing::error!("Generation failed: {}", e);
                break;
            }
        };
        batches_run += 1;

        if !batch.is_empty() {
            pipeline.persist(&batch, &batch_id, None);
            questions.extend(batch);
            let path = output_dir.join(format!("questions_{}.json", batch_id));
            if let Err(e) = write_json(&path, &questions) {
                tracing::error!("Failed to write {:?}: {:#}", path, e);
            }
        }

        if schedule.should_evolve(i) {
            if let Err(e) = pipeline.generator.evolve(strategy) {
                tracing::error!("Weight evolution failed: {}", e);
                break;
            }
        }
    }

    // Finalize
    tracing::info!("Generation finished. Total questions: {}", questions.len());
    let duplicates = pipeline.generator.stats().total_rejected_duplicates - duplicates_start;
    let metrics = pipeline.report_since(&questions, duplicates, pool_start);

    let meta = RunMeta {
        batch_id: &batch_id,
        duration_seconds: started.elapsed().as_secs_f64(),
        batches_attempted: plan.batches,
        batches_run,
        difficulty: plan.difficulty,
        timestamp: chrono::Local::now().to_rfc3339(),
    };
    let mut metrics_json = serde_json::to_value(&metrics)?;
    metrics_json["meta"] = serde_json::to_value(&meta)?;

    let evolution_log = pipeline.generator.weights().evolution_log();
    let combined = serde_json::json!({
        "metrics": metrics_json,
        "intent_evolution": evolution_log,
        "generator_stats": pipeline.generator.stats(),
    });
    write_json(&output_dir.join("generation_metrics.json"), &combined)?;
    write_json(&output_dir.join("intent_evolution_log.json"), &evolution_log)?;
    tracing::info!("Saved metrics to {:?}", output_dir);

    Ok(RunOutcome {
        batch_id,
        questions,
        metrics,
        batches_run,
        interrupted,
    })
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string_pretty(value)?;
    std::fs::write(path, content).with_context(|| format!("Failed to write {:?}", path))
}

/// Periodic jobs run by `--schedule`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledJob {
    /// General batch at `hard`, random mix size
    Questions,
    /// Two-intent mixes at `medium`
    Intents,
}

impl ScheduledJob {
    /// `questions`, `intents` or `both`
    pub fn parse_mode(mode: &str) -> crate::Result<Vec<ScheduledJob>> {
        match mode {
            "questions" => Ok(vec![ScheduledJob::Questions]),
            "intents" => Ok(vec![ScheduledJob::Intents]),
            "both" => Ok(vec![ScheduledJob::Questions, ScheduledJob::Intents]),
            other => Err(crate::Error::Config(format!("unknown schedule mode: {}", other))),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ScheduledJob::Questions => "cron_general",
            ScheduledJob::Intents => "cron_intent",
        }
    }

    /// One-off runs use smaller batches
    fn batch_size(&self, config: &GeneratorConfig, run_once: bool) -> usize {
        match (self, run_once) {
            (ScheduledJob::Questions, false) => config.batch_size,
            (ScheduledJob::Questions, true) => 10,
            (ScheduledJob::Intents, false) => 20,
            (ScheduledJob::Intents, true) => 5,
        }
    }
}

/// Run one scheduled job; errors are logged. Returns the job's metrics,
/// empty when nothing was accepted.
pub fn run_scheduled_job(pipeline: &mut Pipeline, job: ScheduledJob, run_once: bool) -> MetricsReport {
    tracing::info!("--- Starting {} job ---", job.label());

    let request = match job {
        ScheduledJob::Questions => BatchRequest {
            batch_size: job.batch_size(&pipeline.config, run_once),
            difficulty: Difficulty::Hard,
            mix_size: pipeline.pick_mix_size(),
            target_intents: None,
        },
        ScheduledJob::Intents => BatchRequest {
            batch_size: job.batch_size(&pipeline.config, run_once),
            difficulty: Difficulty::Medium,
            mix_size: 2,
            target_intents: None,
        },
    };

    let pool_start = pipeline.generator.similarity().generated_len();
    let duplicates_start = pipeline.generator.stats().total_rejected_duplicates;

    let report = match pipeline.generator.generate_batch(&request) {
        Ok(questions) if questions.is_empty() => MetricsReport::default(),
        Ok(questions) => {
            let cron_run_id = uuid::Uuid::new_v4().to_string();
            pipeline.persist(&questions, job.label(), Some(&cron_run_id));
            let duplicates = pipeline.generator.stats().total_rejected_duplicates - duplicates_start;
            let report = pipeline.report_since(&questions, duplicates, pool_start);
            tracing::info!(
                "{}: {} questions, coverage {:.2}, avg intents {:.2}, diversity {:.4}",
                job.label(),
                report.total_generated,
                report.intent_coverage,
                report.avg_intents_per_question,
                report.diversity
            );
            report
        }
        Err(e) => {
            tracing::error!("Error in {} job: {}", job.label(), e);
            MetricsReport::default()
        }
    };

    tracing::info!("--- {} job finished ---", job.label());
    report
}

/// Run `jobs` every `period` until `shutdown` resolves, then hand the
/// pipeline back.
///
/// `shutdown` stays pinned across ticks and is checked first, so a stop
/// requested while a job is running ends the loop once that job returns.
pub async fn run_schedule_loop<F>(
    mut pipeline: Pipeline,
    jobs: Vec<ScheduledJob>,
    period: Duration,
    shutdown: F,
) -> Result<Pipeline>
where
    F: Future<Output = ()>,
{
    let mut interval = tokio::time::interval(period);
    // the first tick fires immediately; jobs start one interval in
    interval.tick().await;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                tracing::info!("Scheduler stopping");
                break;
            }
            _ = interval.tick() => {
                let batch = jobs.clone();
                pipeline = tokio::task::spawn_blocking(move || {
                    for job in batch {
                        run_scheduled_job(&mut pipeline, job, false);
                    }
                    pipeline
                })
                .await?;
            }
        }
    }
    Ok(pipeline)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GenerationError;
    use crate::generator::{Completion, GenerationRequest};
    use crate::similarity::WordEmbedder;
    use crate::taxonomy::sample_intents;
    use std::sync::{Arc, Mutex};

    /// Answers every call with `batch_size` fresh questions
    struct FreshQuestions {
        next: usize,
    }

    impl GenerationCapability for FreshQuestions {
        fn generate(&mut self, request: &GenerationRequest) -> std::result::Result<Completion, GenerationError> {
            let items: Vec<_> = (0..request.batch_size)
                .map(|_| {
                    self.next += 1;
                    serde_json::json!({
                        "question": format!("Fresh question token{} alpha{} beta{}?", self.next, self.next, self.next),
                        "confusion_points": ["synthetic"]
                    })
                })
                .collect();
            Ok(Completion {
                text: serde_json::to_string(&items).unwrap(),
                provider: Some("fake".into()),
                model: Some("fake-1".into()),
            })
        }
    }

    /// Fresh questions; the first call also requests shutdown
    struct StopDuringJob {
        inner: FreshQuestions,
        stop: Option<tokio::sync::oneshot::Sender<()>>,
        calls: Arc<Mutex<usize>>,
    }

    impl GenerationCapability for StopDuringJob {
        fn generate(&mut self, request: &GenerationRequest) -> std::result::Result<Completion, GenerationError> {
            *self.calls.lock().unwrap() += 1;
            if let Some(stop) = self.stop.take() {
                let _ = stop.send(());
            }
            self.inner.generate(request)
        }
    }

    #[derive(Clone, Default)]
    struct RecordingSink {
        batches: Arc<Mutex<Vec<(usize, String, Option<String>)>>>,
        fail: bool,
    }

    impl QuestionSink for RecordingSink {
        fn insert_questions(
            &mut self,
            questions: &[GeneratedQuestion],
            batch_id: &str,
            cron_run_id: Option<&str>,
        ) -> Result<usize> {
            if self.fail {
                anyhow::bail!("disk full");
            }
            self.batches
                .lock()
                .unwrap()
                .push((questions.len(), batch_id.to_string(), cron_run_id.map(String::from)));
            Ok(questions.len())
        }
    }

    fn pipeline(output_dir: &Path, sink: RecordingSink) -> Pipeline {
        pipeline_with(output_dir, sink, Box::new(FreshQuestions { next: 0 }))
    }

    fn pipeline_with(output_dir: &Path, sink: RecordingSink, capability: Box<dyn GenerationCapability>) -> Pipeline {
        let config = GeneratorConfig {
            output_dir: output_dir.to_path_buf(),
            evolution_frequency: 4,
            backoff_unit_ms: 0,
            runtime_pause_ms: 0,
            ..GeneratorConfig::default()
        };
        let taxonomy = IntentTaxonomy::new(sample_intents(28), &config.excluded_intents).unwrap();
        Pipeline::with_capabilities(
            config,
            taxonomy,
            Box::new(WordEmbedder::new(512)),
            Vec::new(),
            capability,
            String::new(),
            Some(Box::new(sink)),
        )
        .unwrap()
    }

    #[test]
    fn test_run_plan_batches() {
        assert_eq!(RunPlan::for_total(500, 50).batches, 10);
        assert_eq!(RunPlan::for_total(101, 50).batches, 3);
        let dry = RunPlan::for_total(500, 50).dry_run();
        assert_eq!((dry.batch_size, dry.batches, dry.dry_run), (3, 1, true));
    }

    #[test]
    fn test_run_generation_writes_artifacts_and_evolves() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecordingSink::default();
        let mut pipeline = pipeline(dir.path(), sink.clone());
        let plan = RunPlan {
            mix_size: Some(2),
            ..RunPlan::new(2, 4)
        };

        let outcome = run_generation(&mut pipeline, &plan, &AtomicBool::new(false)).unwrap();
        assert_eq!(outcome.batches_run, 4);
        assert_eq!(outcome.questions.len(), 8);
        assert!(!outcome.interrupted);
        assert_eq!(outcome.metrics.total_generated, 8);
        assert!(outcome.metrics.diversity > 0.0);

        // evolution_frequency 4 / batch_size 2 -> every 2 batches
        assert_eq!(pipeline.generator.weights().weight_history().len(), 2);
        assert_eq!(sink.batches.lock().unwrap().len(), 4);

        let per_batch = dir.path().join(format!("questions_{}.json", outcome.batch_id));
        let saved: Vec<GeneratedQuestion> =
            serde_json::from_str(&std::fs::read_to_string(per_batch).unwrap()).unwrap();
        assert_eq!(saved.len(), 8);

        let metrics: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(dir.path().join("generation_metrics.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(metrics["metrics"]["total_generated"], 8);
        assert_eq!(metrics["metrics"]["meta"]["batches_attempted"], 4);
        assert_eq!(metrics["intent_evolution"]["generation_count"], 8);
        assert_eq!(metrics["generator_stats"]["total_generated"], 8);
        assert!(dir.path().join("intent_evolution_log.json").exists());
    }

    #[test]
    fn test_stop_flag_still_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let mut pipeline = pipeline(dir.path(), RecordingSink::default());
        let outcome = run_generation(&mut pipeline, &RunPlan::new(2, 5), &AtomicBool::new(true)).unwrap();

        assert!(outcome.interrupted);
        assert_eq!(outcome.batches_run, 0);
        assert_eq!(outcome.metrics, MetricsReport::default());
        assert!(dir.path().join("generation_metrics.json").exists());
    }

    #[test]
    fn test_sink_failure_does_not_stop_run() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecordingSink { fail: true, ..RecordingSink::default() };
        let mut pipeline = pipeline(dir.path(), sink);
        let outcome = run_generation(&mut pipeline, &RunPlan::new(2, 2).dry_run(), &AtomicBool::new(false)).unwrap();

        assert_eq!(outcome.questions.len(), 3);
        // dry runs never evolve
        assert!(pipeline.generator.weights().weight_history().is_empty());
    }

    #[test]
    fn test_scheduled_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecordingSink::default();
        let mut pipeline = pipeline(dir.path(), sink.clone());

        let general = run_scheduled_job(&mut pipeline, ScheduledJob::Questions, true);
        let intent = run_scheduled_job(&mut pipeline, ScheduledJob::Intents, true);
        assert_eq!(general.total_generated, 10);
        assert_eq!(intent.total_generated, 5);
        // diversity comes from each job's own slice of the generated pool
        assert!(general.diversity > 0.0);
        assert!(intent.diversity > 0.0);
        assert_eq!(intent.avg_intents_per_question, 2.0);

        let batches = sink.batches.lock().unwrap();
        assert_eq!(batches[0].1, "cron_general");
        assert_eq!(batches[1].1, "cron_intent");
        assert!(batches[1].2.is_some());

        // state carries across jobs
        assert_eq!(pipeline.generator.stats().total_generated, 15);
        assert!(ScheduledJob::parse_mode("weekly").is_err());
        assert_eq!(ScheduledJob::parse_mode("both").unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_during_job_stops_after_it() {
        let dir = tempfile::tempdir().unwrap();
        let (stop, stopped) = tokio::sync::oneshot::channel();
        let calls = Arc::new(Mutex::new(0));
        let capability = StopDuringJob {
            inner: FreshQuestions { next: 0 },
            stop: Some(stop),
            calls: calls.clone(),
        };
        let sink = RecordingSink::default();
        let pipeline = pipeline_with(dir.path(), sink.clone(), Box::new(capability));

        let shutdown = async {
            let _ = stopped.await;
        };
        let pipeline = run_schedule_loop(
            pipeline,
            vec![ScheduledJob::Questions],
            Duration::from_millis(1),
            shutdown,
        )
        .await
        .unwrap();

        // the job in flight finishes, no further tick runs
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(pipeline.generator.stats().total_generated, 50);
        assert_eq!(sink.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_schedule_loop_stops_before_first_job() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = pipeline(dir.path(), RecordingSink::default());
        let pipeline = run_schedule_loop(pipeline, vec![ScheduledJob::Intents], Duration::from_millis(1), async {})
            .await
            .unwrap();
        assert_eq!(pipeline.generator.stats().total_generated, 0);
    }
}
