//! Command-line entry points.

use clap::Args;

use crate::{clock::Clock, prelude::*, store::fs::FsDocumentStore};

pub mod run;
pub mod schema;
pub mod status;

/// Where a `run` keeps its objects and records.
#[derive(Debug, Clone, Args)]
pub struct RootOpts {
    /// Directory holding the objects (`incoming/`, `complete/`, `results/`
    /// and so on). Records are kept in `.docproc/records` beneath it.
    #[clap(long, value_name = "DIR")]
    pub root: PathBuf,
}

impl RootOpts {
    /// The directory holding one JSON file per record.
    pub fn records_dir(&self) -> PathBuf {
        self.root.join(".docproc").join("records")
    }

    /// Open the record store.
    pub async fn open_store(&self, clock: Arc<dyn Clock>) -> Result<FsDocumentStore> {
        FsDocumentStore::open(self.records_dir(), clock).await
    }
}
