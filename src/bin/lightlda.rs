//! lightlda CLI
//!
//! Train, apply, and inspect LDA models over `word:count` corpora.

use clap::{Parser, Subcommand};
use lightlda::{LdaConfig, LdaEngine, ModelSnapshot};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Parser)]
#[command(name = "lightlda")]
#[command(version)]
#[command(about = "Metropolis-Hastings LDA topic modelling")]
#[command(long_about = r#"
lightlda: multi-threaded LDA with O(1) alias-table proposals

Corpus format:
  one document per line, whitespace-separated word:count pairs
  (word ids are 0-based integers), e.g.

    0:3 17:1 42:2
    5:1 17:4
"#)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a model on a corpus
    Train {
        /// Corpus file
        corpus: PathBuf,

        /// Model output (default: corpus.lda)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// JSON parameter file; command-line options override it
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of topics
        #[arg(short = 'k', long)]
        topics: Option<usize>,

        /// Vocabulary size (default: largest word id + 1)
        #[arg(long)]
        vocab: Option<usize>,

        /// Training iterations
        #[arg(short, long)]
        iterations: Option<u32>,

        /// Dirichlet prior total over topics
        #[arg(long)]
        alpha_sum: Option<f32>,

        /// Per-word Dirichlet prior
        #[arg(long)]
        beta: Option<f32>,

        /// Worker threads (0 = auto)
        #[arg(short, long)]
        threads: Option<usize>,

        /// Metropolis-Hastings rounds per token
        #[arg(long)]
        mh_steps: Option<u32>,

        /// Report the log-likelihood every N iterations
        #[arg(long)]
        likelihood_interval: Option<u32>,

        /// Run seed
        #[arg(long)]
        seed: Option<u64>,

        /// Write the document-topic table here
        #[arg(long)]
        doc_topics: Option<PathBuf>,

        /// Write the word-topic table here
        #[arg(long)]
        dump_model: Option<PathBuf>,
    },

    /// Infer topics for a corpus with a trained model
    Infer {
        /// Model file (.lda)
        model: PathBuf,

        /// Corpus file
        corpus: PathBuf,

        /// Burn-in iterations
        #[arg(short, long, default_value = "20")]
        burnin: u32,

        /// Topics reported per document
        #[arg(short, long, default_value = "10")]
        max_topics: usize,

        /// Worker threads (0 = auto)
        #[arg(short, long, default_value = "0")]
        threads: usize,

        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show model information
    Info {
        /// Model file (.lda)
        model: PathBuf,

        /// Top words listed per topic
        #[arg(short, long, default_value = "10")]
        words: usize,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            corpus,
            output,
            config,
            topics,
            vocab,
            iterations,
            alpha_sum,
            beta,
            threads,
            mh_steps,
            likelihood_interval,
            seed,
            doc_topics,
            dump_model,
        } => {
            let mut params = match config {
                Some(path) => LdaConfig::from_json_file(path)?,
                None => LdaConfig::default(),
            };
            if let Some(v) = topics {
                params.num_topics = v;
            }
            if let Some(v) = iterations {
                params.num_iterations = v;
            }
            if let Some(v) = alpha_sum {
                params.alpha_sum = v;
            }
            if let Some(v) = beta {
                params.beta = v;
            }
            if let Some(v) = threads {
                params.num_threads = v;
            }
            if let Some(v) = mh_steps {
                params.mh_steps = v;
            }
            if likelihood_interval.is_some() {
                params.likelihood_interval = likelihood_interval;
            }
            if let Some(v) = seed {
                params.seed = v;
            }
            train(&corpus, output, params, vocab, doc_topics, dump_model)?;
        }
        Commands::Infer {
            model,
            corpus,
            burnin,
            max_topics,
            threads,
            output,
        } => {
            infer(&model, &corpus, burnin, max_topics, threads, output)?;
        }
        Commands::Info { model, words } => {
            show_info(&model, words)?;
        }
    }

    Ok(())
}

/// One document's parallel `(word ids, counts)` lists.
type Document = (Vec<i32>, Vec<i32>);

fn read_corpus(path: &Path) -> Result<Vec<Document>, Box<dyn std::error::Error>> {
    let text = fs::read_to_string(path)?;
    let mut docs = Vec::new();
    for (line_no, line) in text.lines().enumerate() {
        let mut ids = Vec::new();
        let mut freqs = Vec::new();
        for field in line.split_whitespace() {
            let (word, count) = field
                .split_once(':')
                .ok_or_else(|| format!("line {}: expected word:count, got {:?}", line_no + 1, field))?;
            ids.push(word.parse::<i32>()?);
            freqs.push(count.parse::<i32>()?);
        }
        docs.push((ids, freqs));
    }
    Ok(docs)
}

/// Largest word id plus one.
fn vocab_size(docs: &[Document]) -> Result<usize, Box<dyn std::error::Error>> {
    let mut size = 0usize;
    for (d, (ids, _)) in docs.iter().enumerate() {
        for &word in ids {
            let word = usize::try_from(word)
                .map_err(|_| format!("document {}: negative word id {}", d, word))?;
            size = size.max(word + 1);
        }
    }
    Ok(size.max(1))
}

/// Buffer slots needed to hold `docs`.
fn corpus_size(docs: &[Document]) -> usize {
    docs.iter()
        .map(|(_, freqs)| 1 + 2 * freqs.iter().map(|&f| f.max(0) as usize).sum::<usize>())
        .sum()
}

fn train(
    corpus: &Path,
    output: Option<PathBuf>,
    mut params: LdaConfig,
    vocab: Option<usize>,
    doc_topics: Option<PathBuf>,
    dump_model: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let docs = read_corpus(corpus)?;
    params.num_vocabs = match vocab {
        Some(v) => v,
        None => vocab_size(&docs)?,
    };

    let mut engine = LdaEngine::new(params)?;
    engine.allocate_data_memory(docs.len(), corpus_size(&docs));
    for (ids, freqs) in &docs {
        engine.feed_in_data(ids, freqs)?;
    }

    let start = Instant::now();
    engine.initialize_before_train()?;
    engine.train(doc_topics.as_deref())?;
    let elapsed = start.elapsed();

    let output_path = output.unwrap_or_else(|| {
        let mut p = corpus.to_path_buf();
        p.set_extension("lda");
        p
    });
    let snapshot = engine.snapshot()?;
    snapshot.save(&output_path)?;
    if let Some(path) = dump_model {
        engine.dump_full_model(&path)?;
    }

    let config = engine.config();
    println!("lightlda training");
    println!("=================");
    println!("Documents:  {}", docs.len());
    println!("Vocabulary: {}", config.num_vocabs);
    println!("Topics:     {}", config.num_topics);
    println!("Threads:    {}", engine.num_threads());
    println!("Iterations: {}", config.num_iterations);
    println!("Time:       {:.2}s", elapsed.as_secs_f64());
    for (iter, ll) in engine.likelihood_history() {
        println!("  iter {:>4}: log-likelihood {:.6e}", iter, ll);
    }
    println!("Model:      {} ({} nonzero entries)", output_path.display(), snapshot.nonzero_num());
    Ok(())
}

fn infer(
    model: &Path,
    corpus: &Path,
    burnin: u32,
    max_topics: usize,
    threads: usize,
    output: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = ModelSnapshot::load(model)?;
    let docs = read_corpus(corpus)?;
    let mut engine = LdaEngine::from_snapshot(LdaConfig::default().with_threads(threads), &snapshot)?;
    engine.allocate_data_memory(docs.len(), corpus_size(&docs));
    for (ids, freqs) in &docs {
        engine.feed_in_data(ids, freqs)?;
    }
    engine.test(burnin)?;

    let mut out = String::new();
    for d in 0..engine.num_documents() {
        out.push_str(&d.to_string());
        for (topic, count) in engine.get_doc_topic(d, max_topics)? {
            out.push_str(&format!(" {}:{}", topic, count));
        }
        out.push('\n');
    }
    match output {
        Some(path) => fs::write(path, out)?,
        None => print!("{}", out),
    }
    Ok(())
}

fn show_info(model: &Path, words: usize) -> Result<(), Box<dyn std::error::Error>> {
    let snapshot = ModelSnapshot::load(model)?;
    let engine = LdaEngine::from_snapshot(LdaConfig::default().with_threads(1), &snapshot)?;
    let stat = engine.get_model_stat()?;

    println!("lightlda model");
    println!("==============");
    println!("Topics:     {}", snapshot.num_topics);
    println!("Vocabulary: {}", snapshot.num_vocabs);
    println!("Alpha sum:  {}", snapshot.alpha_sum);
    println!("Beta:       {}", snapshot.beta);
    println!("Rows:       {}", snapshot.rows.len());
    println!("Nonzero:    {}", snapshot.nonzero_num());
    println!("Arenas:     table {} ints, alias {} ints", stat.table_size, stat.alias_size);
    println!();

    let summary = engine.summary_row();
    for (topic, total) in summary.iter().enumerate() {
        let top: Vec<String> = engine
            .get_topic_summary(topic, words)?
            .iter()
            .map(|tw| format!("{}({:.4})", tw.word, tw.prob))
            .collect();
        println!("Topic {:>4} [{}]: {}", topic, total, top.join(" "));
    }
    Ok(())
}
