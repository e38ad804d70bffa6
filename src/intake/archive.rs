//! Expanding uploaded zip archives into individual page uploads.

use std::io::{Cursor, Read as _};

use crate::{
    objects::{ObjectStore, layout},
    prelude::*,
};

use super::event::InboundEvent;

/// Refuse to expand single entries larger than this.
const MAX_ENTRY_BYTES: u64 = 256 * 1024 * 1024;

/// A file extracted from an archive.
#[derive(Debug)]
struct ArchiveEntry {
    filename: String,
    data: Vec<u8>,
}

/// Expand the archive at `location` into the intake area and return one
/// inbound event per extracted file. Entries keep their base filename, so
/// `docs/inv-7_1.jpg` becomes `{intake_prefix}inv-7_1.jpg`. The archive
/// itself is moved to `archive/`.
#[instrument(level = "debug", skip_all, fields(location = %location))]
pub async fn expand_archive(
    objects: &dyn ObjectStore,
    intake_prefix: &str,
    source_location: &str,
    location: &str,
    now: DateTime<Utc>,
) -> Result<Vec<InboundEvent>, PipelineError> {
    let data = objects.get(location).await?;

    // `zip` does blocking reads, so keep it off the async workers.
    let entries = tokio::task::spawn_blocking(move || read_entries(data))
        .await
        .context("archive extraction task failed")
        .or_kind(ErrKind::Unknown)?
        .or_kind(ErrKind::InvalidFileType)?;

    let mut events = Vec::with_capacity(entries.len());
    for entry in entries {
        let object_key = format!("{intake_prefix}{}", entry.filename);
        objects.put(&object_key, entry.data).await?;
        events.push(InboundEvent {
            source_location: source_location.to_owned(),
            object_key,
            event_time: Some(now),
        });
    }

    let filename = location.rsplit('/').next().unwrap_or(location);
    objects
        .move_object(location, &layout::archived(filename))
        .await?;
    info!(extracted = events.len(), "Expanded archive");
    Ok(events)
}

/// Read all regular file entries from a zip archive.
fn read_entries(data: Vec<u8>) -> Result<Vec<ArchiveEntry>> {
    let mut archive =
        zip::ZipArchive::new(Cursor::new(data)).context("not a valid zip archive")?;
    let mut entries = vec![];
    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .with_context(|| format!("cannot read archive entry {i}"))?;
        if file.is_dir() {
            continue;
        }
        // `enclosed_name` rejects absolute paths and `..` components.
        let Some(path) = file.enclosed_name() else {
            warn!(name = %file.name(), "Skipping unsafe archive entry");
            continue;
        };
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if filename.starts_with('.') || path.starts_with("__MACOSX") {
            continue;
        }
        if file.size() > MAX_ENTRY_BYTES {
            return Err(anyhow!(
                "archive entry {filename} is {} bytes, over the {MAX_ENTRY_BYTES} byte limit",
                file.size()
            ));
        }
        let filename = filename.to_owned();
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)
            .with_context(|| format!("cannot decompress {filename}"))?;
        entries.push(ArchiveEntry { filename, data });
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use std::io::Write as _;

    use zip::{ZipWriter, write::SimpleFileOptions};

    use super::*;
    use crate::objects::memory::MemoryObjectStore;

    fn build_zip(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .add_directory("scans/", SimpleFileOptions::default())
            .unwrap();
        for (name, data) in files {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[tokio::test]
    async fn test_expand_archive() {
        let objects = MemoryObjectStore::new();
        let zip = build_zip(&[
            ("scans/inv-7_1.jpg", b"page one"),
            ("scans/inv-7_2.jpg", b"page two"),
            ("__MACOSX/scans/._inv-7_1.jpg", b"junk"),
        ]);
        objects.put("incoming/batch.zip", zip).await.unwrap();

        let events = expand_archive(
            &objects,
            "incoming/",
            "uploads",
            "incoming/batch.zip",
            Utc::now(),
        )
        .await
        .unwrap();
        let keys = events.iter().map(|e| e.object_key.as_str()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["incoming/inv-7_1.jpg", "incoming/inv-7_2.jpg"]);
        assert_eq!(objects.get_text("incoming/inv-7_2.jpg").await.unwrap(), "page two");
        assert!(!objects.contains("incoming/batch.zip"));
        assert!(objects.contains("archive/batch.zip"));
    }

    #[tokio::test]
    async fn test_corrupt_archive() {
        let objects = MemoryObjectStore::new();
        objects
            .put("incoming/bad.zip", b"not a zip".to_vec())
            .await
            .unwrap();
        let err = expand_archive(&objects, "incoming/", "uploads", "incoming/bad.zip", Utc::now())
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrKind::InvalidFileType);
        // A failed expansion leaves the archive where it was.
        assert!(objects.contains("incoming/bad.zip"));
    }
}
