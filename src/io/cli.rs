//! Command-line interface: alignment runs, queue workers and PNG import/export

use crate::io::configuration::{
    AlignConfig, BARRIER_POLL_INTERVAL_MS, DEFAULT_SEARCH_RADIUS, DEFAULT_STORAGE_CHUNK,
};
use crate::io::error::{Result, WithContext, invalid_parameter};
use crate::io::image::{export_section, import_sections};
use crate::io::logging::LogOptions;
use crate::io::progress::ProgressManager;
use crate::model::predictor::ModelRegistry;
use crate::pipeline::barrier::BarrierConfig;
use crate::pipeline::context::TaskContext;
use crate::pipeline::executor::{DryRunExecutor, LocalExecutor, QueuedExecutor, Worker};
use crate::pipeline::queue::DirectoryQueue;
use crate::pipeline::scheduler::{RunSummary, Scheduler};
use crate::spatial::bbox::BoundingBox;
use crate::store::filesystem::{FileMarkers, FileStore};
use crate::store::tensor_store::{LayerHandle, TensorStore};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "stackalign")]
#[command(
    author,
    version,
    about = "Align serial-section image stacks by block-wise vector voting"
)]
/// Command-line arguments
pub struct Cli {
    /// What to run
    #[command(subcommand)]
    pub command: Command,

    /// Log at debug level unless `RUST_LOG` says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Write logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Suppress progress bars
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

impl Cli {
    /// Logging options selected by the flags
    pub const fn log_options(&self) -> LogOptions {
        LogOptions {
            verbose: self.verbose,
            json: self.json_logs,
        }
    }

    /// Check if progress should be displayed
    pub const fn should_show_progress(&self) -> bool {
        !self.quiet
    }
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Block-wise alignment of a section range
    Align(AlignArgs),
    /// Pairwise fields between raw sections, optionally voted over triangles
    Pairwise(AlignArgs),
    /// Execute queued tasks until the queue stays empty
    Worker(WorkerArgs),
    /// Ingest a directory of PNG sections as an image layer
    Import(ImportArgs),
    /// Write one section of an image layer to PNG
    Export(ExportArgs),
}

/// Arguments of `align` and `pairwise`
#[derive(Args, Debug)]
// Each flag overrides one independent configuration switch
#[allow(clippy::struct_excessive_bools)]
pub struct AlignArgs {
    /// Store root directory
    #[arg(short, long)]
    pub store: PathBuf,

    /// JSON run configuration
    #[arg(short, long)]
    pub config: PathBuf,

    /// Hand tasks to workers through this queue directory instead of
    /// running them locally
    #[arg(long)]
    pub queue: Option<PathBuf>,

    /// Also drain the queue from this process
    #[arg(long, requires = "queue")]
    pub inline_worker: bool,

    /// Record the phases without executing them
    #[arg(long)]
    pub dry_run: bool,

    /// Skip block steps before this index
    #[arg(long)]
    pub restart: Option<usize>,

    /// Worker threads for local execution
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Average each prediction with its half-turn counterpart
    #[arg(long)]
    pub flip_average: bool,

    /// Vote pairwise fields over triangles (pairwise runs only)
    #[arg(long)]
    pub vote: bool,
}

impl AlignArgs {
    /// Apply the flags on top of a loaded configuration
    pub fn apply(&self, config: &mut AlignConfig) {
        config.dry_run |= self.dry_run;
        config.flip_average |= self.flip_average;
        config.pairwise_vote |= self.vote;
        if let Some(restart) = self.restart {
            config.restart = restart;
        }
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
    }
}

/// Arguments of `worker`
#[derive(Args, Debug)]
pub struct WorkerArgs {
    /// Store root directory
    #[arg(short, long)]
    pub store: PathBuf,

    /// Queue directory
    #[arg(long)]
    pub queue: PathBuf,

    /// Search radius of the built-in translation model
    #[arg(long, default_value_t = DEFAULT_SEARCH_RADIUS)]
    pub search_radius: usize,

    /// Average each prediction with its half-turn counterpart
    #[arg(long)]
    pub flip_average: bool,

    /// Keep polling this many seconds after the queue runs empty
    #[arg(long, default_value_t = 0)]
    pub idle_secs: u64,
}

/// Arguments of `import`
#[derive(Args, Debug)]
pub struct ImportArgs {
    /// Store root directory
    #[arg(short, long)]
    pub store: PathBuf,

    /// Directory of PNG sections, imported in name order
    #[arg(short, long)]
    pub dir: PathBuf,

    /// Image layer written
    #[arg(short, long, default_value = "src/image")]
    pub layer: String,

    /// Section index of the first file
    #[arg(short, long, default_value_t = 0)]
    pub z_start: i64,

    /// Storage chunk edge in pixels
    #[arg(long, default_value_t = DEFAULT_STORAGE_CHUNK)]
    pub chunk: u32,
}

/// Arguments of `export`
#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Store root directory
    #[arg(short, long)]
    pub store: PathBuf,

    /// Image layer read
    #[arg(short, long, default_value = "dst/image")]
    pub layer: String,

    /// Section exported
    #[arg(short, long)]
    pub z: i64,

    /// Resolution level
    #[arg(short, long, default_value_t = 0)]
    pub mip: u32,

    /// Region `x0,y0,x1,y1` in mip 0 pixels
    #[arg(short, long, value_delimiter = ',', num_args = 4)]
    pub bbox: Vec<i64>,

    /// PNG written
    #[arg(short, long)]
    pub out: PathBuf,
}

/// Runs the selected subcommand
#[derive(Debug)]
pub struct App {
    cli: Cli,
}

impl App {
    /// App for parsed arguments
    pub const fn new(cli: Cli) -> Self {
        Self { cli }
    }

    /// Run the subcommand
    ///
    /// # Errors
    ///
    /// Returns the first configuration, storage or task failure
    pub fn run(&self) -> Result<()> {
        match &self.cli.command {
            Command::Align(args) => self.align(args, false).map(drop),
            Command::Pairwise(args) => self.align(args, true).map(drop),
            Command::Worker(args) => Self::worker(args),
            Command::Import(args) => Self::import(args),
            Command::Export(args) => Self::export(args),
        }
    }

    fn progress(&self) -> ProgressManager {
        if self.cli.should_show_progress() {
            ProgressManager::new()
        } else {
            ProgressManager::hidden()
        }
    }

    fn align(&self, args: &AlignArgs, pairwise: bool) -> Result<RunSummary> {
        let mut config =
            AlignConfig::from_json_file(&args.config).with_operation("load configuration")?;
        args.apply(&mut config);

        let store = Arc::new(FileStore::open(&args.store)?);
        let source = store.layer_info(&config.src_path)?.ok_or_else(|| {
            invalid_parameter(
                "src_path",
                &config.src_path,
                &"layer not found in store, import the sections first",
            )
        })?;
        let mut models = ModelRegistry::with_builtin(config.search_radius);
        if config.flip_average {
            models = models.flip_averaged();
        }
        let scheduler = Scheduler::new(config, source, &models)?;
        let phases = if pairwise {
            scheduler.pairwise_phases()?
        } else {
            scheduler.phases()?
        };

        let mut progress = self.progress();
        progress.initialize(phases.len());
        let config = scheduler.config();
        let summary = if config.dry_run {
            scheduler.run(&phases, &DryRunExecutor::default(), &progress)?
        } else {
            let layers = if pairwise {
                scheduler.pairwise_layers()
            } else {
                scheduler.layers()
            };
            scheduler.create_layers(store.as_ref(), &layers)?;
            let barrier = BarrierConfig::new(
                config.barrier_timeout(),
                Duration::from_millis(BARRIER_POLL_INTERVAL_MS),
            );
            let markers = Arc::new(FileMarkers::new(&args.store));
            let ctx = TaskContext::new(store, markers.clone(), models);
            match &args.queue {
                Some(dir) => {
                    let queue = Arc::new(DirectoryQueue::open(dir)?);
                    let mut executor = QueuedExecutor::new(queue.clone(), markers, barrier);
                    if args.inline_worker {
                        executor = executor.with_inline_worker(Worker::new(ctx, queue));
                    }
                    scheduler.run(&phases, &executor, &progress)?
                }
                None => {
                    let executor = LocalExecutor::new(ctx, config.threads, barrier)?;
                    scheduler.run(&phases, &executor, &progress)?
                }
            }
        };
        progress.finish();
        Ok(summary)
    }

    fn worker(args: &WorkerArgs) -> Result<()> {
        let store = Arc::new(FileStore::open(&args.store)?);
        let markers = Arc::new(FileMarkers::new(&args.store));
        let mut models = ModelRegistry::with_builtin(args.search_radius);
        if args.flip_average {
            models = models.flip_averaged();
        }
        let queue = Arc::new(DirectoryQueue::open(&args.queue)?);
        let worker = Worker::new(TaskContext::new(store, markers, models), queue);

        let idle_limit = Duration::from_secs(args.idle_secs);
        let poll = Duration::from_millis(BARRIER_POLL_INTERVAL_MS);
        let mut handled = 0_usize;
        let mut idle_since = Instant::now();
        loop {
            if worker.run_one()? {
                handled += 1;
                idle_since = Instant::now();
                continue;
            }
            if idle_since.elapsed() >= idle_limit {
                break;
            }
            std::thread::sleep(poll);
        }
        info!(handled, "worker finished");
        Ok(())
    }

    fn import(args: &ImportArgs) -> Result<()> {
        let store = FileStore::open(&args.store)?;
        let layer = LayerHandle::image(args.layer.clone(), [args.chunk; 2]);
        let summary = import_sections(&store, &layer, &args.dir, args.z_start)?;
        info!(
            sections = summary.sections.len(),
            bbox = %summary.bbox,
            layer = %layer.path,
            "sections imported"
        );
        Ok(())
    }

    fn export(args: &ExportArgs) -> Result<()> {
        let store = FileStore::open(&args.store)?;
        let layer = store.layer_info(&args.layer)?.ok_or_else(|| {
            invalid_parameter("layer", &args.layer, &"layer not found in store")
        })?;
        let bbox = match args.bbox.as_slice() {
            [x0, y0, x1, y1] => BoundingBox::new(*x0..*x1, *y0..*y1),
            other => {
                return Err(invalid_parameter(
                    "bbox",
                    &format!("{other:?}"),
                    &"expected x0,y0,x1,y1",
                ));
            }
        };
        bbox.check_integral(args.mip)?;
        export_section(&store, &layer, args.z, args.mip, &bbox, &args.out)
    }
}
