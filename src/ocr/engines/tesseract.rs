//! Tesseract OCR engine. Always synchronous.

use std::path::Path;

use tokio::{fs, process::Command};

use crate::{
    async_utils::{UNREADABLE_IMAGE_REGEX, check_for_command_failure},
    intake::filename::sniff_supported_mime,
    prelude::*,
};

use super::{OcrEngine, OcrPageRequest, OcrPoll, OcrSubmission};

/// Resolution used when rasterizing PDF pages.
const RASTERIZE_DPI: u32 = 300;

/// OCR engine wrapping the `tesseract` CLI tool. PDFs are rasterized with
/// `pdftocairo` first.
#[non_exhaustive]
pub struct TesseractOcrEngine {}

impl TesseractOcrEngine {
    /// Create a new `tesseract` engine.
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for TesseractOcrEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OcrEngine for TesseractOcrEngine {
    #[instrument(
        level = "debug",
        skip_all,
        fields(document_id = %page.document_id, page = %page.page_index)
    )]
    async fn submit(&self, page: OcrPageRequest) -> Result<OcrSubmission> {
        let mime_type = match sniff_supported_mime(&page.data) {
            Ok(mime_type) => mime_type,
            Err(err) => {
                return Ok(OcrSubmission::Rejected {
                    kind: err.kind,
                    reason: err.message,
                });
            }
        };
        let extension = mime_guess::get_mime_extensions_str(mime_type)
            .and_then(|o| o.first())
            .ok_or_else(|| anyhow!("cannot determine extension for {mime_type}"))?;

        // Write our input to a temporary file.
        let tmpdir = tempfile::TempDir::with_prefix("tesseract")?;
        let input_path = tmpdir.path().join(format!("input.{extension}"));
        fs::write(&input_path, &page.data)
            .await
            .context("cannot write tesseract input file")?;

        let images = if mime_type == "application/pdf" {
            match rasterize_pdf(&input_path, tmpdir.path()).await {
                Ok(images) => images,
                Err(err) => {
                    return Ok(OcrSubmission::Rejected {
                        kind: ErrKind::OcrJobFailed,
                        reason: format!("{err:#}"),
                    });
                }
            }
        } else {
            vec![input_path]
        };

        let mut texts = Vec::with_capacity(images.len());
        for image in &images {
            match run_tesseract(image).await {
                Ok(text) => texts.push(text),
                Err(err) => {
                    return Ok(OcrSubmission::Rejected {
                        kind: ErrKind::OcrJobFailed,
                        reason: format!("{err:#}"),
                    });
                }
            }
        }
        Ok(OcrSubmission::Completed {
            text: texts.join("\n"),
        })
    }

    async fn poll(&self, job_id: &str) -> Result<OcrPoll> {
        Err(anyhow!("tesseract does not start asynchronous jobs (asked about {job_id:?})"))
    }
}

/// Run `tesseract` on one image and return its text.
async fn run_tesseract(image: &Path) -> Result<String> {
    let output_base = image.with_extension("");
    let output = Command::new("tesseract")
        .arg(image)
        .arg(&output_base)
        .output()
        .await
        .context("cannot run tesseract")?;
    check_for_command_failure("tesseract", &output, Some(&UNREADABLE_IMAGE_REGEX))?;
    fs::read_to_string(output_base.with_extension("txt"))
        .await
        .context("cannot read tesseract output file")
}

/// Rasterize every page of a PDF to PNG, returning the images in page order.
async fn rasterize_pdf(pdf: &Path, dir: &Path) -> Result<Vec<PathBuf>> {
    let out_prefix = dir.join("raster");
    let output = Command::new("pdftocairo")
        .arg("-png")
        .arg("-r")
        .arg(RASTERIZE_DPI.to_string())
        .arg(pdf)
        .arg(&out_prefix)
        .output()
        .await
        .context("cannot run pdftocairo")?;
    check_for_command_failure("pdftocairo", &output, None)?;

    // pdftocairo names pages `raster-1.png`, `raster-01.png`, ... depending
    // on the page count, so sort by the parsed number.
    let mut images = vec![];
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(number) = name
            .strip_prefix("raster-")
            .and_then(|rest| rest.strip_suffix(".png"))
            .and_then(|n| n.parse::<u32>().ok())
        {
            images.push((number, entry.path()));
        }
    }
    if images.is_empty() {
        return Err(anyhow!("pdftocairo produced no pages"));
    }
    images.sort();
    Ok(images.into_iter().map(|(_, path)| path).collect())
}
