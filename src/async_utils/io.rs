//! I/O utilities.
//!
//! This module reads JSON and TOML config files, reads streams of JSON values
//! (JSONL, a single JSON document, or a JSON array), and writes JSONL output.
//! All of it works with either a path or standard input/output.

use serde::de::DeserializeOwned;
use tokio::{
    fs::File,
    io::{AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _, BufWriter},
};

use crate::prelude::*;

/// Read TOML or JSON from a file. Files ending in `.json` are JSON; anything
/// else is TOML.
pub async fn read_json_or_toml<T>(path: &Path) -> Result<T>
where
    T: DeserializeOwned,
{
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read file at path: {:?}", path))?;
    let is_json = path.extension().is_some_and(|ext| ext == "json");
    if is_json {
        serde_json::from_str(&data)
            .with_context(|| format!("Failed to parse JSON from file at path: {:?}", path))
    } else {
        toml::from_str(&data)
            .with_context(|| format!("Failed to parse TOML from file at path: {:?}", path))
    }
}

/// Read every JSON value from a file or standard input.
///
/// Accepts JSONL, concatenated or pretty-printed JSON documents, and
/// top-level arrays (which are flattened one level).
pub async fn read_json_values(path: Option<&Path>) -> Result<Vec<Value>> {
    let (description, data) = match path {
        Some(path) => {
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read file at path: {:?}", path))?;
            (path.display().to_string(), data)
        }
        None => {
            let mut data = String::new();
            tokio::io::stdin()
                .read_to_string(&mut data)
                .await
                .context("Failed to read standard input")?;
            ("stdin".to_owned(), data)
        }
    };
    parse_json_values(&data).with_context(|| format!("Failed to parse JSON from {description}"))
}

/// Parse a sequence of JSON values from a string.
pub fn parse_json_values(data: &str) -> Result<Vec<Value>> {
    let mut values = vec![];
    for value in serde_json::Deserializer::from_str(data).into_iter::<Value>() {
        match value? {
            Value::Array(items) => values.extend(items),
            value => values.push(value),
        }
    }
    Ok(values)
}

/// Create an [`AsyncWrite`] for a file or stdout.
pub async fn create_writer(
    path: Option<&Path>,
) -> Result<Box<dyn AsyncWrite + Unpin + Send + Sync + 'static>> {
    match path {
        Some(path) => {
            let file = File::create(path)
                .await
                .with_context(|| format!("Failed to create file at path: {:?}", path))?;
            Ok(Box::new(file))
        }
        None => Ok(Box::new(tokio::io::stdout())),
    }
}

/// Write values as JSONL to either standard output or a file.
pub async fn write_jsonl<T>(path: Option<&Path>, values: &[T]) -> Result<()>
where
    T: Serialize,
{
    let mut writer = BufWriter::new(create_writer(path).await?);
    for value in values {
        let json = serde_json::to_string(value).context("Failed to serialize JSON")?;
        writer
            .write_all(json.as_bytes())
            .await
            .context("Failed to write JSON to output")?;
        writer
            .write_all(b"\n")
            .await
            .context("Failed to write newline to output")?;
    }
    writer.flush().await.context("Failed to flush output")?;
    Ok(())
}
