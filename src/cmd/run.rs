//! The `run` subcommand.

use clap::Args;

use crate::{
    async_utils::io::{read_json_values, write_jsonl},
    classify::drivers::{ClassifierType, LlmOpts},
    clock::{Clock, SystemClock},
    config::PipelineConfig,
    intake::parse_events,
    objects::fs::FsObjectStore,
    ocr::engines::{OcrEngineOpts, ocr_engine_for_name},
    pipeline::Pipeline,
    prelude::*,
    rate_limit::RateLimit,
    schema::SchemaSet,
    ui::{ProgressConfig, Ui},
    workflow::Workflow,
};

use super::RootOpts;

/// Run command line arguments.
#[derive(Debug, Args)]
pub struct RunOpts {
    /// Inbound events, as JSONL or JSON. Defaults to standard input.
    #[clap(value_name = "EVENTS")]
    pub events_path: Option<PathBuf>,

    #[clap(flatten)]
    pub root: RootOpts,

    /// Pipeline config file (TOML, or JSON if it ends in `.json`).
    #[clap(long)]
    pub config: Option<PathBuf>,

    /// OCR engine to use.
    #[clap(long, default_value = "textract", value_parser = ["textract", "tesseract"])]
    pub ocr: String,

    /// Classification driver to use.
    #[clap(long, value_enum, default_value = "openai")]
    pub classifier: ClassifierType,

    /// Classification model. Overrides the config file.
    #[clap(long)]
    pub model: Option<String>,

    /// Batching window, in seconds. Overrides the config file.
    #[clap(long = "window", value_name = "SECONDS")]
    pub window_seconds: Option<f64>,

    /// OCR poll interval, in seconds. Overrides the config file.
    #[clap(long = "poll-interval", value_name = "SECONDS")]
    pub poll_interval_seconds: Option<f64>,

    /// Max number of stage invocations to run at a time.
    #[clap(short = 'j', long = "jobs", default_value = "8")]
    pub job_count: usize,

    /// Bucket holding the page objects, for Textract asynchronous jobs.
    #[clap(long)]
    pub textract_bucket: Option<String>,

    /// Budget for OCR requests, such as "10/s" or "600/m". Overrides the
    /// config file.
    #[clap(long = "ocr-rate-limit")]
    pub ocr_rate_limit: Option<RateLimit>,

    /// Turn on the PII stage. Overrides the config file.
    #[clap(long)]
    pub pii: bool,

    /// Where to write the final records. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,

    #[clap(flatten)]
    pub llm_opts: LlmOpts,
}

impl RunOpts {
    /// Load the config file, if any, and apply our overrides.
    async fn pipeline_config(&self) -> Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path).await?,
            None => PipelineConfig::default(),
        };
        if let Some(model) = &self.model {
            config.model = model.clone();
        }
        if let Some(window_seconds) = self.window_seconds {
            config.window_seconds = window_seconds;
        }
        if let Some(poll_interval_seconds) = self.poll_interval_seconds {
            config.poll_interval_seconds = poll_interval_seconds;
        }
        if let Some(rate_limit) = &self.ocr_rate_limit {
            config.ocr_rate_limit = Some(rate_limit.clone());
        }
        if let Some(rate_limit) = &self.llm_opts.rate_limit {
            config.classification_rate_limit = Some(rate_limit.clone());
        }
        if self.pii {
            config.pii.enabled = true;
        }
        config.validate()?;
        Ok(config)
    }
}

/// The `run` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_run(ui: Ui, opts: &RunOpts) -> Result<()> {
    let config = opts.pipeline_config().await?;
    debug!(?config, "Loaded config");

    // Read all our events before touching any state, so a malformed input
    // file changes nothing.
    let mut events = vec![];
    for payload in read_json_values(opts.events_path.as_deref()).await? {
        events.extend(parse_events(&payload)?);
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let ocr = ocr_engine_for_name(
        &opts.ocr,
        &OcrEngineOpts {
            textract_bucket: opts.textract_bucket.clone(),
            rate_limit: config.ocr_rate_limit.clone(),
            concurrency_limit: opts.job_count,
        },
    )
    .await?;
    let llm_opts = LlmOpts {
        rate_limit: config.classification_rate_limit.clone(),
        ..opts.llm_opts.clone()
    };
    let classifier = opts.classifier.create_classifier(&config.model, &llm_opts)?;
    let schemas = SchemaSet::load(config.schema_dir.as_deref()).await?;
    let pipeline = Pipeline {
        store: Arc::new(opts.root.open_store(clock.clone()).await?),
        objects: Arc::new(FsObjectStore::new(&opts.root.root)),
        ocr,
        classifier,
        schemas: Arc::new(schemas),
        clock,
        config: Arc::new(config),
    };

    let spinner = ui.new_spinner(&ProgressConfig {
        emoji: "📄",
        msg: "Processing documents",
        done_msg: "Processed documents",
    });
    let mut workflow = Workflow::new(pipeline.clone(), opts.job_count).with_progress(spinner);
    workflow.resume_in_flight().await?;

    let event_count = events.len();
    let mut intake_errors = vec![];
    for event in events {
        intake_errors.extend(workflow.submit_event(event).await);
    }
    let stats = workflow.run_until_idle().await?;
    drop(workflow);
    info!(
        events = event_count,
        rejected = intake_errors.len(),
        invocations = stats.invocations,
        retired = stats.retired,
        finished = stats.finished,
        "Run finished"
    );

    let records = pipeline.store.list().await?;
    write_jsonl(opts.output_path.as_deref(), &records).await?;

    // Rejected uploads were already logged with their messages.
    if !intake_errors.is_empty() {
        let rejected = intake_errors
            .iter()
            .map(|err| format!("{} ({})", err.object_key, err.kind))
            .collect::<Vec<_>>();
        return Err(anyhow!(
            "{} of {} events could not be accepted: {}",
            intake_errors.len(),
            event_count,
            rejected.join(", ")
        ));
    }
    Ok(())
}
