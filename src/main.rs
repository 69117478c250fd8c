use article_media::artifact::{self, ArtifactSpec};
use article_media::batch::{
    BatchError, BatchOptions, BatchRunner, FailurePolicy, Pacing, RunMode,
};
use article_media::checkpoint::CheckpointStore;
use article_media::config::{self, Settings};
use article_media::estimate;
use article_media::markdown::{self, Placeholder};
use article_media::media::{
    CommandGenerator, CommandUploader, CredentialValidator, GenerationStage, Resolution,
    TokenCheck, UploadStage,
};
use article_media::output::{self, EventPrinter};
use article_media::types::BatchResult;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const CREDENTIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// How long an aborted run waits for queued event lines.
const PRINTER_DRAIN: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "article-media")]
#[command(about = "Generate article images and upload them to an image host")]
#[command(long_about = "\
Generate article images and upload them to an image host

Input is either a JSON batch file or a Markdown article with placeholders.

Batch file:

  {\"images\": [
    {\"name\": \"cover\", \"prompt\": \"A lighthouse at dawn\", \"aspect_ratio\": \"16:9\"},
    {\"name\": \"diagram\", \"prompt\": \"Flat illustration of a pipeline\"}
  ]}

Markdown placeholders (outside code blocks):

  <!-- IMAGE: cover | 16:9 | A lighthouse at dawn -->
  <!-- IMAGE: diagram | Flat illustration of a pipeline -->

After a successful run each uploaded placeholder becomes ![name](url) in
<stem>.published.md (or in place with --in-place).

Aspect ratios: 1:1 2:3 3:2 3:4 4:3 4:5 5:4 9:16 16:9 21:9 (default 3:2)

Run 'article-media gen-config' to generate a documented article-media.toml.")]
#[command(version)]
struct Cli {
    /// Settings file
    #[arg(long, default_value = config::SETTINGS_FILENAME, global = true)]
    settings: PathBuf,

    /// Log filter when RUST_LOG is unset (error, warn, info, debug, trace)
    #[arg(long, default_value = "warn", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate and upload every image in a batch file or Markdown article
    Run(RunArgs),
    /// Check that the generator and uploader are installed and configured
    Check,
    /// Print a stock article-media.toml with all options documented
    GenConfig,
}

#[derive(clap::Args)]
struct RunArgs {
    /// JSON batch file or Markdown article
    input: PathBuf,

    /// Print the cost and time estimate without generating anything
    #[arg(long)]
    dry_run: bool,

    /// Generate in parallel, then upload serially
    #[arg(long)]
    parallel: bool,

    /// Parallel generation width (implies --parallel)
    #[arg(long)]
    workers: Option<usize>,

    /// Record failures and keep going instead of stopping at the first one
    #[arg(long)]
    continue_on_error: bool,

    /// Generate only; keep files local
    #[arg(long)]
    no_upload: bool,

    /// Delete each local file once it is uploaded
    #[arg(long)]
    delete_local: bool,

    /// Output resolution (1K, 2K, 4K)
    #[arg(long)]
    resolution: Option<Resolution>,

    /// Generation model
    #[arg(long)]
    model: Option<String>,

    /// Directory for generated images (default: next to the input)
    #[arg(long)]
    images_dir: Option<PathBuf>,

    /// Write a report: .md for Markdown, anything else for JSON
    #[arg(long)]
    output: Option<PathBuf>,

    /// Skip images a previous interrupted run already finished
    #[arg(long)]
    resume: bool,

    /// Rewrite the Markdown input itself instead of <stem>.published.md
    #[arg(long)]
    in_place: bool,
}

/// A loaded input: the batch plus, for Markdown, what is needed to rewrite it.
struct Input {
    specs: Vec<ArtifactSpec>,
    document: Option<(String, Vec<Placeholder>)>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Command::Run(args) => {
            let settings = config::load_settings(&cli.settings)?;
            run(args, settings)?;
        }
        Command::Check => {
            let settings = config::load_settings(&cli.settings)?;
            check(&settings)?;
        }
        Command::GenConfig => {
            print!("{}", config::stock_settings_toml());
        }
    }

    Ok(())
}

/// `RUST_LOG` wins over `--log-level`.
fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn run(args: RunArgs, mut settings: Settings) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(resolution) = args.resolution {
        settings.generation.resolution = resolution;
    }
    if let Some(model) = &args.model {
        settings.generation.model = model.clone();
    }
    if let Some(workers) = args.workers {
        settings.concurrency.workers = workers;
    }
    settings.validate()?;

    let input = load_input(&args.input)?;
    let upload = !args.no_upload;

    if args.dry_run {
        let estimate = estimate::estimate(
            input.specs.len(),
            &settings.generation.model,
            settings.generation.resolution,
            upload,
            &settings.cost_model(),
        )?;
        output::print_estimate(&estimate);
        return Ok(());
    }

    let images_dir = args.images_dir.clone().unwrap_or_else(|| {
        input_dir(&args.input).join(&settings.generation.images_dir)
    });
    let runner = build_runner(&settings, &args, &images_dir)
        .with_checkpoint(CheckpointStore::for_specs(&images_dir, &input.specs), args.resume);

    let mode = if args.parallel || args.workers.is_some() {
        RunMode::Parallel {
            workers: settings.concurrency.workers,
        }
    } else {
        RunMode::Serial
    };

    let (tx, rx) = mpsc::channel();
    let printer = EventPrinter::spawn(rx);
    let runner = runner.with_events(tx);

    let mut artifacts = artifact::artifacts_from_specs(&input.specs);
    let outcome = runner.run(&mut artifacts, mode);
    drop(runner);

    let result = match outcome {
        Ok(result) => {
            // All senders are gone once the pool has drained.
            printer.finish();
            result
        }
        Err(BatchError::Aborted { failure, partial }) => {
            // In-flight workers still hold a sender until their current call
            // returns; wait briefly so queued lines print before the banner.
            if !printer.drain(PRINTER_DRAIN) {
                tracing::debug!("event printer still waiting on in-flight workers");
            }
            println!();
            output::print_abort(&failure, &partial);
            if let Some(path) = &args.output {
                output::write_report(path, &partial)?;
                println!("Report: {}", path.display());
            }
            return Err(format!("batch aborted: {failure}").into());
        }
        Err(e) => return Err(e.into()),
    };

    println!();
    output::print_summary(&result);

    if let Some(path) = &args.output {
        output::write_report(path, &result)?;
        println!("Report: {}", path.display());
    }

    if let Some((text, placeholders)) = &input.document {
        publish_document(&args, text, placeholders, &result)?;
    }

    if result.is_complete_success() {
        Ok(())
    } else {
        Err(format!("{} of {} images failed", result.failed, result.total).into())
    }
}

fn check(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    println!("==> Checking collaborators");
    let items = article_media::media::preflight(&settings.generation, &settings.upload);
    output::print_preflight(&items);

    let credentials = credential_validator(settings);
    if let Some(status) = credentials.validate_once() {
        println!("upload credentials: {status}");
    }

    let failed = items.iter().filter(|i| !i.ok).count();
    if failed == 0 {
        println!("==> Ready");
        Ok(())
    } else {
        Err(format!("{failed} check(s) failed").into())
    }
}

fn load_input(path: &Path) -> Result<Input, Box<dyn std::error::Error>> {
    if is_markdown(path) {
        let text = std::fs::read_to_string(path)?;
        let placeholders = markdown::find_placeholders(&text)?;
        let specs = markdown::specs_from_placeholders(&placeholders)?;
        Ok(Input {
            specs,
            document: Some((text, placeholders)),
        })
    } else {
        Ok(Input {
            specs: artifact::load_batch_config(path)?,
            document: None,
        })
    }
}

fn is_markdown(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("md") || e.eq_ignore_ascii_case("markdown"))
}

fn input_dir(input: &Path) -> PathBuf {
    input
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn build_runner(settings: &Settings, args: &RunArgs, images_dir: &Path) -> BatchRunner {
    let retry = settings.retry_policy();
    let generation = GenerationStage::new(
        Arc::new(CommandGenerator::from_settings(&settings.generation)),
        retry.clone(),
        images_dir,
    )
    .with_resolution(settings.generation.resolution)
    .with_model(settings.generation.model.clone())
    .with_timeout(settings.generation.timeout());

    let upload = UploadStage::new(
        Arc::new(CommandUploader::from_settings(&settings.upload)),
        retry,
    )
    .with_timeout(settings.upload.timeout())
    .with_credentials(credential_validator(settings));

    let options = BatchOptions {
        policy: if args.continue_on_error {
            FailurePolicy::ContinueOnError
        } else {
            FailurePolicy::FailFast
        },
        upload: !args.no_upload,
        delete_local: args.delete_local,
        pacing: Pacing {
            upload_pause: Duration::from_secs_f64(settings.concurrency.upload_pause_secs),
            task_delay: Duration::from_secs_f64(settings.concurrency.task_delay_secs),
        },
    };
    BatchRunner::new(generation, upload, options)
}

fn credential_validator(settings: &Settings) -> CredentialValidator {
    let upload = &settings.upload;
    if upload.token_env.is_empty() {
        return CredentialValidator::disabled();
    }
    CredentialValidator::new(TokenCheck {
        token_env: upload.token_env.clone(),
        validate_url: (!upload.validate_url.is_empty()).then(|| upload.validate_url.clone()),
        timeout: CREDENTIAL_TIMEOUT,
    })
}

/// Replace uploaded placeholders and write the published article.
fn publish_document(
    args: &RunArgs,
    text: &str,
    placeholders: &[Placeholder],
    result: &BatchResult,
) -> std::io::Result<()> {
    let urls = markdown::uploaded_urls(result);
    if urls.is_empty() {
        return Ok(());
    }
    let (published, replaced) = markdown::rewrite_placeholders(text, placeholders, &urls);
    let target = if args.in_place {
        args.input.clone()
    } else {
        published_path(&args.input)
    };
    std::fs::write(&target, published)?;
    println!(
        "Article: {} ({replaced} of {} placeholders replaced)",
        target.display(),
        placeholders.len()
    );
    Ok(())
}

fn published_path(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "article".to_string());
    input.with_file_name(format!("{stem}.published.md"))
}
