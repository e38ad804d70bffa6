//! Standard APIs we use everywhere.

#[allow(unused_imports)]
pub use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

#[allow(unused_imports)]
pub use anyhow::{Context as _, Result, anyhow};
pub use async_trait::async_trait;
pub use chrono::{DateTime, Utc};
pub use schemars::JsonSchema;
pub use serde::{Deserialize, Serialize};
#[allow(unused_imports)]
pub use serde_json::{Value, json};
#[allow(unused_imports)]
pub use tracing::{debug, error, info, instrument, trace, warn};

#[allow(unused_imports)]
pub use crate::error::{ErrKind, PipelineError, ResultExt as _};
#[allow(unused_imports)]
pub use crate::clock::Clock as _;
