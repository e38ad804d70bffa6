//! Page filename grammar: `{document_id}{separator}{page_index}.{ext}`.

use std::sync::LazyLock;

use regex::Regex;

use crate::prelude::*;

/// `document_id` is greedy, so it ends at the last `_` or `-` that is
/// followed by digits and the extension.
static PAGE_FILENAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<document_id>.+)[_-](?P<page>\d+)\.(?P<ext>[^.]+)$")
        .expect("built-in filename pattern should be valid")
});

/// Extensions we accept for pages, with their MIME types.
const SUPPORTED_TYPES: &[&str] = &["image/jpeg", "image/png", "application/pdf"];

/// The parts of a page filename.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageName {
    pub document_id: String,
    pub page_index: u32,
    pub extension: String,
}

/// Split a base filename into document id, page index and extension.
pub fn parse_page_filename(filename: &str) -> Result<PageName, PipelineError> {
    let invalid = || {
        PipelineError::new(
            ErrKind::InvalidFilename,
            format!("{filename:?} does not end in a page number like \"_1.jpg\""),
        )
    };
    let caps = PAGE_FILENAME.captures(filename).ok_or_else(invalid)?;
    let page_index = caps["page"].parse::<u32>().map_err(|_| invalid())?;
    Ok(PageName {
        document_id: caps["document_id"].to_owned(),
        page_index,
        extension: caps["ext"].to_owned(),
    })
}

/// Check that an extension names a supported page type, returning its MIME
/// type.
pub fn supported_mime_for_extension(extension: &str) -> Result<&'static str, PipelineError> {
    let mime = mime_guess::from_ext(&extension.to_ascii_lowercase())
        .first_raw()
        .filter(|mime| SUPPORTED_TYPES.contains(mime));
    mime.ok_or_else(|| {
        PipelineError::new(
            ErrKind::InvalidFileType,
            format!("unsupported file type {extension:?}: expected jpg, jpeg, png or pdf"),
        )
    })
}

/// Sniff page bytes, returning the MIME type if it is one we can OCR.
pub fn sniff_supported_mime(data: &[u8]) -> Result<&'static str, PipelineError> {
    match infer::get(data).map(|kind| kind.mime_type()) {
        Some(mime) if SUPPORTED_TYPES.contains(&mime) => Ok(mime),
        Some(mime) => Err(PipelineError::new(
            ErrKind::InvalidFileType,
            format!("page content is {mime}, which is not a supported type"),
        )),
        None => Err(PipelineError::new(
            ErrKind::InvalidFileType,
            "page content is not a supported image or PDF",
        )),
    }
}
