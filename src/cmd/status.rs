//! The `status` subcommand.

use clap::Args;

use crate::{
    async_utils::io::write_jsonl,
    clock::SystemClock,
    model::DocumentAggregate,
    prelude::*,
    store::DocumentStore as _,
    timeline::Timeline,
};

use super::RootOpts;

/// Status command line arguments.
#[derive(Debug, Args)]
pub struct StatusOpts {
    /// Only show this document.
    #[clap(value_name = "DOCUMENT_ID")]
    pub document_id: Option<String>,

    #[clap(flatten)]
    pub root: RootOpts,

    /// Output path. Defaults to standard output.
    #[clap(short = 'o', long = "out")]
    pub output_path: Option<PathBuf>,
}

/// One line of `status` output.
#[derive(Debug, Serialize)]
struct StatusLine {
    record: DocumentAggregate,
    timeline: Timeline,
}

impl StatusLine {
    fn new(record: DocumentAggregate) -> Self {
        let timeline = Timeline::from_record(&record);
        Self { record, timeline }
    }
}

/// The `status` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_status(opts: &StatusOpts) -> Result<()> {
    let store = opts.root.open_store(Arc::new(SystemClock)).await?;
    let records = match &opts.document_id {
        Some(document_id) => {
            let record = store
                .get(document_id)
                .await?
                .ok_or_else(|| anyhow!("no record for document {document_id:?}"))?;
            vec![record]
        }
        None => store.list().await?,
    };
    let lines = records.into_iter().map(StatusLine::new).collect::<Vec<_>>();
    write_jsonl(opts.output_path.as_deref(), &lines).await
}
