//! qgen - multi-intent question generator CLI
//!
//! Run with: qgen --generate --total=500
//! Or on a timer: qgen --schedule --mode=both

use anyhow::{Context, Result};
use intent_qgen::{
    run_generation, run_schedule_loop, run_scheduled_job,
    runner::{build_similarity, open_store},
    Difficulty, EvolutionLog, EvolutionStrategy, GeneratorConfig, IntentTaxonomy, Pipeline, RunPlan,
    ScheduledJob, WeightModel,
};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const USAGE: &str = "\
Usage: qgen <command> [options]

Commands:
  --generate      Run a multi-batch generation
                    --total=N | --batches=N, --batch-size=N, --difficulty=medium|hard|expert,
                    --mix-size=N, --intents=1,2,3, --strategy=adaptive|random_walk|coverage_based,
                    --dry-run
  --schedule      Run generation jobs on an interval
                    --mode=questions|intents|both, --interval-minutes=N, --run-once
  --similar <q>   Reference questions closest to <q> (--top-k=N)
  --check <q>     Duplicate check for <q> against the reference corpus
  --stats         Question store summary
  --weights       Latest saved intent weights

Global:
  --config=<path> JSON config file (defaults plus QGEN_* environment otherwise)";

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        println!("{}", USAGE);
        return Ok(());
    }

    tracing_subscriber::fmt::init();
    let config = load_config(&args)?;

    match args[1].as_str() {
        "--generate" => run_generate(config, &args[2..]).await,
        "--schedule" => run_schedule(config, &args[2..]).await,
        "--similar" => {
            let top_k = parse_flag(&args, "--top-k")?.unwrap_or(5);
            run_similar(&config, &positional(&args[2..]), top_k)
        }
        "--check" => run_check(&config, &positional(&args[2..])),
        "--stats" => run_stats(&config),
        "--weights" => run_weights(&config),
        "--help" | "-h" => {
            println!("{}", USAGE);
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}\n\n{}", other, USAGE);
            std::process::exit(2);
        }
    }
}

fn load_config(args: &[String]) -> Result<GeneratorConfig> {
    match flag_value(args, "--config") {
        Some(path) => GeneratorConfig::load(&PathBuf::from(path)),
        None => GeneratorConfig::from_env(),
    }
}

/// Value of a `--key=value` flag
fn flag_value<'a>(args: &'a [String], key: &str) -> Option<&'a str> {
    let prefix = format!("{}=", key);
    args.iter().find_map(|a| a.strip_prefix(prefix.as_str()))
}

fn has_flag(args: &[String], flag: &str) -> bool {
    args.iter().any(|a| a == flag)
}

/// Non-flag words joined with spaces
fn positional(args: &[String]) -> String {
    args.iter()
        .filter(|a| !a.starts_with("--"))
        .cloned()
        .collect::<Vec<_>>()
        .join(" ")
}

fn parse_flag<T>(args: &[String], key: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    flag_value(args, key)
        .map(|v| v.parse::<T>().with_context(|| format!("invalid value for {}: {}", key, v)))
        .transpose()
}

fn parse_plan(config: &GeneratorConfig, args: &[String]) -> Result<RunPlan> {
    let batch_size = parse_flag(args, "--batch-size")?.unwrap_or(config.batch_size);
    let mut plan = match parse_flag::<usize>(args, "--batches")? {
        Some(batches) => RunPlan::new(batch_size.max(1), batches),
        None => {
            let total = parse_flag(args, "--total")?.unwrap_or(config.total_questions);
            RunPlan::for_total(total, batch_size)
        }
    };

    if let Some(difficulty) = parse_flag::<Difficulty>(args, "--difficulty")? {
        plan.difficulty = difficulty;
    }
    plan.mix_size = parse_flag(args, "--mix-size")?;
    plan.strategy = parse_flag::<EvolutionStrategy>(args, "--strategy")?;
    if let Some(list) = flag_value(args, "--intents") {
        let ids = list
            .split(',')
            .map(|s| s.trim().parse::<u32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .with_context(|| format!("invalid intent list: {}", list))?;
        plan.target_intents = Some(ids);
    }
    if has_flag(args, "--dry-run") {
        plan = plan.dry_run();
    }
    Ok(plan)
}

/// Sets the returned flag on the first Ctrl-C
fn stop_on_ctrl_c() -> Arc<AtomicBool> {
    let stop = Arc::new(AtomicBool::new(false));
    let flag = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, finishing the current batch");
            flag.store(true, Ordering::SeqCst);
        }
    });
    stop
}

async fn run_generate(config: GeneratorConfig, args: &[String]) -> Result<()> {
    let plan = parse_plan(&config, args)?;
    let stop = stop_on_ctrl_c();

    // Providers use a blocking HTTP client; build, run and drop them off the runtime
    let outcome = tokio::task::spawn_blocking(move || {
        let mut pipeline = Pipeline::build(config)?;
        run_generation(&mut pipeline, &plan, &stop)
    })
    .await??;

    println!("{}", outcome.metrics);
    println!(
        "Batch {}: {} questions over {} batch(es){}",
        outcome.batch_id,
        outcome.questions.len(),
        outcome.batches_run,
        if outcome.interrupted { " (interrupted)" } else { "" }
    );
    Ok(())
}

async fn run_schedule(config: GeneratorConfig, args: &[String]) -> Result<()> {
    let jobs = ScheduledJob::parse_mode(flag_value(args, "--mode").unwrap_or("both"))?;
    let minutes: u64 = parse_flag(args, "--interval-minutes")?.unwrap_or(config.cron_interval_minutes);
    let run_once = has_flag(args, "--run-once");

    let mut pipeline = tokio::task::spawn_blocking(move || Pipeline::build(config)).await??;

    if run_once {
        tokio::task::spawn_blocking(move || {
            for job in jobs {
                run_scheduled_job(&mut pipeline, job, true);
            }
        })
        .await?;
        return Ok(());
    }

    tracing::info!(
        "Scheduler started: {:?} every {} minute(s). Ctrl-C to stop.",
        jobs,
        minutes
    );
    let period = Duration::from_secs(minutes.max(1) * 60);
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let pipeline = run_schedule_loop(pipeline, jobs, period, shutdown).await?;

    tokio::task::spawn_blocking(move || drop(pipeline)).await?;
    Ok(())
}

fn run_similar(config: &GeneratorConfig, query: &str, top_k: usize) -> Result<()> {
    if query.is_empty() {
        println!("Usage: qgen --similar <query> [--top-k=N]");
        return Ok(());
    }

    let mut engine = build_similarity(config)?;
    if engine.reference_len() == 0 {
        println!("No reference questions loaded. Run `import <file.json>` first.");
        return Ok(());
    }

    println!("\nQuery: {}\n", query);
    let results = engine.find_similar(query, top_k, None)?;
    if results.is_empty() {
        println!("No reference question above {:.2}", config.reference_threshold);
    }
    for (i, (text, score)) in results.iter().enumerate() {
        println!("{:>2}. ({:.3}) {}", i + 1, score, text);
    }
    Ok(())
}

fn run_check(config: &GeneratorConfig, question: &str) -> Result<()> {
    if question.is_empty() {
        println!("Usage: qgen --check <question>");
        return Ok(());
    }

    let mut engine = build_similarity(config)?;
    let check = engine.check(question, None)?;
    println!(
        "{} (max similarity {:.4}, threshold {:.2}, {} reference questions)",
        if check.is_duplicate { "DUPLICATE" } else { "unique" },
        check.max_similarity,
        engine.duplicate_threshold(),
        engine.reference_len()
    );
    Ok(())
}

fn run_stats(config: &GeneratorConfig) -> Result<()> {
    let Some(store) = open_store(config) else {
        println!("Question store disabled (set use_db or QGEN_USE_DB=true).");
        return Ok(());
    };

    println!("\nQUESTION STORE: {:?}\n", config.db_path);
    println!("Generated questions: {}", store.question_count()?);
    println!("Reference questions: {}", store.reference_count()?);

    println!("\nBy provider:");
    for (provider, count) in store.provider_stats()? {
        println!("   {:<16} {}", provider, count);
    }

    println!("\nMost recent:");
    for q in store.recent_questions(5)? {
        println!("   [{}] {} {:?}", q.difficulty, q.question, q.expected_intents);
    }
    Ok(())
}

fn run_weights(config: &GeneratorConfig) -> Result<()> {
    let path = config.output_dir.join("intent_evolution_log.json");
    let log: EvolutionLog = match std::fs::read_to_string(&path) {
        Ok(content) => serde_json::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))?,
        Err(_) => {
            println!("No saved evolution log at {:?}; showing starting weights.", path);
            let taxonomy = IntentTaxonomy::load(&config.taxonomy_path, &config.excluded_intents)?;
            WeightModel::new(taxonomy, config)?.evolution_log()
        }
    };

    println!(
        "\nGenerations: {}  Evolutions: {}\n",
        log.generation_count, log.weight_history_length
    );
    let mut weights: Vec<(&String, &f64)> = log.current_weights.iter().collect();
    weights.sort_by(|a, b| b.1.total_cmp(a.1));
    for (id, weight) in weights {
        let used = log.intent_usage.get(id).copied().unwrap_or(0);
        let bar = "#".repeat((weight * 100.0).round() as usize);
        println!("   Intent {:>3}: {:.4} used {:>4} {}", id, weight, used, bar);
    }
    Ok(())
}
