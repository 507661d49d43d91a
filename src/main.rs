use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use dialoguer::Confirm;
use facecull::config::{PipelineConfig, Subject, default_output_dir, load_subjects};
use facecull::core::detector::RustfaceDetector;
use facecull::core::embedder::ArcFaceEmbedder;
use facecull::core::filter::MultiFacePolicy;
use facecull::services::download::AnyDownloader;
use facecull::services::pipeline::{Collaborators, Pipeline};
use facecull::services::report::{IdentityMode, SubjectReport, SubjectState, write_summary};
use facecull::services::source::{DirectorySource, UrlListSource, UrlSource};
use facecull::services::validate::{delete_duplicates, validate};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(
    name = "facecull",
    version,
    about = "Collect identity-consistent single-face photo sets"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Collect photos for the subjects in a JSON file, from URL lists
    Collect {
        /// JSON file of `{"name": ..., "aliases": [...]}` entries
        #[arg(short, long, value_name = "FILE")]
        subjects: PathBuf,
        /// Directory of `<subject_slug>.txt` URL lists
        #[arg(long, value_name = "DIR", default_value = "urls")]
        urls: PathBuf,
        #[command(flatten)]
        run: RunArgs,
    },

    /// Run the pipeline over pre-downloaded pools, one sub-directory per subject
    Process {
        #[arg(short, long, value_name = "DIR")]
        input: PathBuf,
        #[command(flatten)]
        run: RunArgs,
    },

    /// Re-check accepted photos for duplicates
    Validate {
        /// Output directory of an earlier run
        #[arg(short, long, value_name = "DIR")]
        output: Option<PathBuf>,
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Delete the later file of each duplicate pair
        #[arg(long)]
        delete: bool,
        /// Skip the confirmation prompt
        #[arg(long, requires = "delete")]
        yes: bool,
    },

    /// Write the default configuration
    InitConfig {
        #[arg(long, value_name = "FILE", default_value = "facecull.json")]
        path: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Dataset root (default: <pictures>/facecull)
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Accepted photos wanted per subject
    #[arg(long)]
    target: Option<usize>,
    #[arg(long)]
    max_rounds: Option<usize>,
    /// SeetaFace model file, downloaded when absent
    #[arg(long, value_name = "FILE")]
    model: Option<PathBuf>,
    /// ArcFace ONNX model (default: <data dir>/facecull/w600k_r50.onnx)
    #[arg(long, value_name = "FILE")]
    embedding_model: Option<PathBuf>,
    /// Split multi-face photos into per-face crops instead of discarding them
    #[arg(long)]
    split_faces: bool,
}

impl RunArgs {
    fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = load_config(self.config.as_deref())?;
        if let Some(target) = self.target {
            config.collection.target_count = target;
        }
        if let Some(max_rounds) = self.max_rounds {
            config.collection.max_rounds = max_rounds;
        }
        if self.split_faces {
            config.face_filter.multi_face_policy = MultiFacePolicy::Split;
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }

    fn output_dir(&self) -> PathBuf {
        self.output.clone().unwrap_or_else(default_output_dir)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Collect {
            subjects,
            urls,
            run,
        } => {
            let subjects = load_subjects(&subjects)
                .with_context(|| format!("Failed to load subjects from {:?}", subjects))?;
            run_pipeline(&run, Arc::new(UrlListSource::new(urls)), subjects).await?;
        }

        Commands::Process { input, run } => {
            let subjects: Vec<Subject> = DirectorySource::subject_dirs(&input)
                .with_context(|| format!("Failed to list subject directories in {:?}", input))?
                .into_iter()
                .map(Subject::new)
                .collect();
            run_pipeline(&run, Arc::new(DirectorySource::new(input)), subjects).await?;
        }

        Commands::Validate {
            output,
            config,
            delete,
            yes,
        } => {
            let output = output.unwrap_or_else(default_output_dir);
            let config = load_config(config.as_deref())?;
            println!("▶ Validating accepted photos in: {}", output.display());

            let pairs = benchmark("validation", || validate(&output, &config))
                .with_context(|| format!("Failed to validate {:?}", output))?;
            if pairs.is_empty() {
                println!("No duplicates found.");
                return Ok(());
            }

            println!("Found {} duplicate pair(s):", pairs.len());
            for pair in &pairs {
                println!("\n✨ {}:", pair.subject);
                println!("   🏆 Keeping → {}", pair.kept.display());
                println!("   📦 Duplicate → {} ({})", pair.duplicate.display(), pair.reason);
            }

            if delete {
                let confirmed = yes
                    || Confirm::new()
                        .with_prompt(format!("Delete {} duplicate file(s)?", pairs.len()))
                        .default(false)
                        .interact()?;
                if confirmed {
                    let removed = delete_duplicates(&pairs).context("Failed to delete duplicates")?;
                    println!("\n🗑️  Deleted {} file(s)", removed);
                } else {
                    println!("\n⚠️  Nothing was deleted.");
                }
            }
        }

        Commands::InitConfig { path } => {
            PipelineConfig::default()
                .save(&path)
                .with_context(|| format!("Failed to write configuration to {:?}", path))?;
            println!("✅ Wrote default configuration to {}", path.display());
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {:?}", path)),
        None => Ok(PipelineConfig::default()),
    }
}

async fn run_pipeline(
    run: &RunArgs,
    source: Arc<dyn UrlSource>,
    subjects: Vec<Subject>,
) -> Result<()> {
    if subjects.is_empty() {
        bail!("No subjects to process");
    }
    let config = run.pipeline_config()?;
    let output = run.output_dir();
    println!(
        "▶ Collecting {} photo(s) for each of {} subject(s) into: {}",
        config.collection.target_count,
        subjects.len(),
        output.display()
    );

    let model = run.model.clone();
    let settings = config.detector.clone();
    let detector = tokio::task::spawn_blocking(move || {
        benchmark("loading face detector", || {
            RustfaceDetector::load_or_download(model.as_deref(), settings)
        })
    })
    .await
    .context("Face detector loader panicked")?
    .context("Failed to load face detector")?;

    let embedding_model = run.embedding_model.clone();
    let settings = config.embedder.clone();
    let embedder = tokio::task::spawn_blocking(move || {
        benchmark("loading face embedder", || {
            ArcFaceEmbedder::load(embedding_model.as_deref(), settings)
        })
    })
    .await
    .context("Face embedder loader panicked")?
    .context("Failed to load face embedding model")?;

    let downloader = AnyDownloader::new(config.download.clone(), config.timeouts.download());
    let pipeline = Pipeline::new(
        config,
        &output,
        Collaborators {
            source,
            downloader: Arc::new(downloader),
            detector: Arc::new(detector),
            embedder: Arc::new(embedder),
        },
    );

    let start = Instant::now();
    let reports = pipeline.run_all(subjects).await;
    println!("⏱ collection took {:.2?}", start.elapsed());
    for report in &reports {
        print_report(report);
    }

    let failed: Vec<String> = reports
        .iter()
        .filter(|r| r.state == SubjectState::Failed)
        .map(|r| r.name.clone())
        .collect();
    let summary = pipeline.summarize(reports);
    let path = write_summary(&output, &summary)
        .with_context(|| format!("Failed to write summary into {:?}", output))?;
    println!(
        "\n✅ {} / {} photos accepted; summary in {}",
        summary.total_accepted,
        summary.total_target,
        path.display()
    );

    if !failed.is_empty() {
        bail!("Aborted subject(s): {}", failed.join(", "));
    }
    Ok(())
}

fn print_report(report: &SubjectReport) {
    println!("\n✨ {}:", report.name);
    println!(
        "   🏆 Accepted {} / {} ({} resumed)",
        report.accepted_count, report.target_count, report.resumed
    );
    match &report.identity {
        IdentityMode::Verified {
            cluster_size,
            sample_size,
        } => println!(
            "   🪪 Identity verified against a cluster of {} / {}",
            cluster_size, sample_size
        ),
        IdentityMode::Loaded => println!("   🪪 Identity verified against the saved reference"),
        IdentityMode::NotRequired => println!("   🪪 Target already met by stored photos"),
        IdentityMode::Permissive { cause } => {
            println!("   ⚠️  Identity not verified: {}", cause)
        }
    }
    for (kind, count) in &report.rejections {
        println!("   📦 {}: {}", kind, count);
    }
    match report.state {
        SubjectState::Done => {}
        SubjectState::Exhausted => println!("   ⚠️  Sources exhausted, short by {}", report.shortfall),
        SubjectState::Failed => println!(
            "   ❌ Aborted: {}",
            report.error.as_deref().unwrap_or("unknown error")
        ),
    }
}

/// Run `f()`, print how long it took (with `label`), and return its result.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    println!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}
