//! KBPO CLI - Command-line interface
//!
//! Usage:
//!   kbpo validate <file> [--format mfile|tackb] [--docs <file>] [--write <out>]
//!   kbpo sample --submission <id> --distribution <d> -n <n> --seed <s>
//!   kbpo score --corpus <tag> [--mode joint|simple]
//!   kbpo pooling-bias --queries <file> --gold <file> --preds <file>... --mode <m>
//!   kbpo intervals --queries <file> --gold <file> --preds <file>...
//!   kbpo leaderboard [--score-type entity|relation]

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use kbpo_core::{AppConfig, DistributionKind, ScoreType, ScoringMode};
use kbpo_eval::pooling::{read_gold, read_output, read_queries};
use kbpo_eval::{
    entity_counts, entity_intervals, pooling_bias, AveragedScore, Bootstrap, OutputEntry,
    PoolingMode, QueryMap, Sampler,
};
use kbpo_parser::{parse_kb_file, write_entries, InputFormat, ParseOptions};
use kbpo_pipeline::{leaderboard, score_corpus, HttpCrowdClient, Pipeline};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "kbpo")]
#[command(about = "Statistical evaluation of knowledge base population systems")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "KBPO_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a submission file and report its diagnostics
    Validate {
        /// Submission file
        file: PathBuf,
        /// `mfile` or `tackb`
        #[arg(long, default_value = "mfile")]
        format: InputFormat,
        /// Corpus document list: `<doc_id>\t<length>` per line
        #[arg(long)]
        docs: Option<PathBuf>,
        /// Write the validated knowledge base as an entry file
        #[arg(long)]
        write: Option<PathBuf>,
    },
    /// Draw a sample from a stored submission
    Sample {
        #[arg(long)]
        submission: Uuid,
        /// `relation` or `entity`
        #[arg(long)]
        distribution: Option<DistributionKind>,
        #[arg(short = 'n', long)]
        n: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        #[arg(long)]
        with_replacement: bool,
    },
    /// Score every submission of a corpus against the current verdicts
    Score {
        #[arg(long)]
        corpus: String,
        /// `joint` or `simple`
        #[arg(long)]
        mode: Option<ScoringMode>,
    },
    /// Compare scores on the full pool with leave-one-out and leave-team-out pools
    PoolingBias {
        #[command(flatten)]
        pool: PoolArgs,
        #[arg(long, default_value = "closed-world")]
        mode: PoolingMode,
    },
    /// Bootstrap confidence intervals of every run
    Intervals {
        #[command(flatten)]
        pool: PoolArgs,
        #[arg(long, default_value = "closed-world")]
        mode: PoolingMode,
        #[arg(long, default_value_t = 5000)]
        samples: usize,
        #[arg(long, default_value_t = 0.95)]
        confidence: f64,
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Show the leaderboard
    Leaderboard {
        #[arg(long, default_value = "entity")]
        score_type: ScoreType,
    },
}

#[derive(clap::Args)]
struct PoolArgs {
    /// Query list: `<entity query> <slot filling query>` per line
    #[arg(long)]
    queries: PathBuf,
    /// Assessed gold entries
    #[arg(long)]
    gold: PathBuf,
    /// System output files; entries are grouped by run id
    #[arg(long, required = true, num_args = 1..)]
    preds: Vec<PathBuf>,
}

struct Pool {
    queries: QueryMap,
    gold: Vec<kbpo_eval::GoldEntry>,
    outputs: BTreeMap<String, Vec<OutputEntry>>,
}

fn open(path: &Path) -> anyhow::Result<BufReader<File>> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    Ok(BufReader::new(file))
}

impl PoolArgs {
    fn load(&self) -> anyhow::Result<Pool> {
        let queries = read_queries(open(&self.queries)?)?;
        let gold = read_gold(open(&self.gold)?, &queries)?;
        let mut outputs: BTreeMap<String, Vec<OutputEntry>> = BTreeMap::new();
        for path in &self.preds {
            for entry in read_output(open(path)?, &queries)? {
                outputs.entry(entry.run_id.clone()).or_default().push(entry);
            }
        }
        Ok(Pool {
            queries,
            gold,
            outputs,
        })
    }
}

/// `<doc_id>[\t<length>]` lines; a missing length skips the bounds check
fn read_documents<R: BufRead>(reader: R) -> anyhow::Result<HashMap<String, usize>> {
    let mut documents = HashMap::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let mut parts = line.split_whitespace();
        let Some(doc_id) = parts.next() else {
            continue;
        };
        let length = match parts.next() {
            Some(n) => n
                .parse()
                .with_context(|| format!("docs line {}: bad length {n:?}", i + 1))?,
            None => 0,
        };
        documents.insert(doc_id.to_string(), length);
    }
    Ok(documents)
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::from_file(path)?.with_env_override()?,
        None => AppConfig::from_env()?,
    };
    config.validate()?;
    Ok(config)
}

fn fmt_score(label: &str, score: &AveragedScore) -> String {
    format!(
        "{label}\tmicro P={:.4} R={:.4} F1={:.4}\tmacro P={:.4} R={:.4} F1={:.4}",
        score.micro.precision,
        score.micro.recall,
        score.micro.f1,
        score.r#macro.precision,
        score.r#macro.recall,
        score.r#macro.f1,
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kbpo=info,warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Validate {
            file,
            format,
            docs,
            write,
        } => {
            let mut options = ParseOptions::default();
            if let Some(docs) = docs {
                options = options.with_documents(read_documents(open(&docs)?)?);
            }
            let outcome = parse_kb_file(&file, format, &options)?;
            for diagnostic in outcome.diagnostics.entries() {
                println!("{diagnostic}");
            }
            let kb = &outcome.kb;
            println!(
                "{}: {} mentions, {} links, {} relations ({} errors, {} warnings)",
                file.display(),
                kb.mentions.len(),
                kb.links.len(),
                kb.relations.len(),
                outcome.diagnostics.errors().count(),
                outcome.diagnostics.warnings().count(),
            );
            if let Some(out) = write {
                let writer = BufWriter::new(
                    File::create(&out).with_context(|| format!("cannot create {}", out.display()))?,
                );
                write_entries(kb, writer)?;
                println!("wrote {}", out.display());
            }
        }
        Commands::Sample {
            submission,
            distribution,
            n,
            seed,
            with_replacement,
        } => {
            let config = load_config(cli.config.as_deref())?;
            let store = kbpo_store::connect(&config.database).await?;
            let crowd = Arc::new(HttpCrowdClient::from_config(&config.crowd));
            let sampling = config.sampling.clone();
            let pipeline = Pipeline::new(store, crowd, config);
            let report = pipeline
                .sample_batch(
                    submission,
                    distribution.unwrap_or(sampling.distribution),
                    n.unwrap_or(sampling.num_samples),
                    with_replacement || sampling.with_replacement,
                    seed.or(sampling.seed),
                )
                .await?;
            println!(
                "sample batch {}: {} samples (seed {}), {} new questions",
                report.batch.id, report.batch.num_samples, report.batch.seed, report.new_questions
            );
            if let Some(questions) = report.questions {
                println!("question batch {}", questions.id);
            }
        }
        Commands::Score { corpus, mode } => {
            let mut config = load_config(cli.config.as_deref())?;
            if let Some(mode) = mode {
                config.scoring.mode = mode;
            }
            let store = kbpo_store::connect(&config.database).await?;
            let records = score_corpus(store.as_ref(), &corpus, &config.scoring).await?;
            for record in &records {
                println!(
                    "{}\t{}\tP={:.4} [{:.4}, {:.4}]\tR={:.4} [{:.4}, {:.4}]\tF1={:.4} [{:.4}, {:.4}]",
                    record.submission_id,
                    record.score_type,
                    record.score.precision,
                    record.left.precision,
                    record.right.precision,
                    record.score.recall,
                    record.left.recall,
                    record.right.recall,
                    record.score.f1,
                    record.left.f1,
                    record.right.f1,
                );
            }
            println!("{} score records ({} mode)", records.len(), config.scoring.mode);
        }
        Commands::PoolingBias { pool, mode } => {
            let pool = pool.load()?;
            for row in pooling_bias(&pool.gold, &pool.outputs, &pool.queries, mode) {
                println!("{}", row.run_id);
                println!("{}", fmt_score("  pooled", &row.pooled));
                println!("{}", fmt_score("  leave-one-out", &row.leave_one_out));
                println!("{}", fmt_score("  leave-team-out", &row.leave_team_out));
            }
        }
        Commands::Intervals {
            pool,
            mode,
            samples,
            confidence,
            seed,
        } => {
            let pool = pool.load()?;
            let bootstrap = Bootstrap::new(samples, confidence)?;
            let mut sampler = Sampler::from_option(seed);
            println!("# seed {}", sampler.seed());
            const METRICS: [&str; 6] = ["micro-P", "micro-R", "micro-F1", "macro-P", "macro-R", "macro-F1"];
            for (run_id, output) in &pool.outputs {
                let counts = entity_counts(&pool.gold, output, &pool.queries, mode);
                println!("{}", fmt_score(run_id, &AveragedScore::of(&counts)));
                let intervals = entity_intervals(&counts, &bootstrap, &mut sampler);
                for (metric, interval) in METRICS.iter().zip(&intervals) {
                    println!(
                        "  {metric}\tmean={:.4}\t[{:.4}, {:.4}]",
                        interval.mean, interval.left, interval.right
                    );
                }
            }
        }
        Commands::Leaderboard { score_type } => {
            let config = load_config(cli.config.as_deref())?;
            let store = kbpo_store::connect(&config.database).await?;
            let rows = leaderboard(store.as_ref(), score_type).await?;
            if rows.is_empty() {
                println!("No scored submissions.");
            }
            for (rank, row) in rows.iter().enumerate() {
                println!(
                    "{:>3}. {}\t{}\tP={:.4}\tR={:.4}\tF1={:.4} [{:.4}, {:.4}]",
                    rank + 1,
                    row.name,
                    row.corpus_tag,
                    row.precision,
                    row.recall,
                    row.f1,
                    row.f1_range[0],
                    row.f1_range[1],
                );
            }
        }
    }

    Ok(())
}
