//! Rasterizes a single PDF page to a PNG. Shells out to `pdftoppm` (poppler-utils) the
//! same way the original wraps it via `pdf2image` — no pure-Rust PDF renderer is in this
//! stack, and poppler is the de-facto system dependency for this anyway.

use std::path::Path;

use tokio::process::Command;

pub async fn rasterize_page(pdf_bytes: &[u8], page_num: u32, dpi: u32) -> anyhow::Result<Vec<u8>> {
    let dir = tempfile::tempdir()?;
    let pdf_path = dir.path().join("page_source.pdf");
    tokio::fs::write(&pdf_path, pdf_bytes).await?;

    let out_prefix = dir.path().join("page");
    let status = Command::new("pdftoppm")
        .arg("-png")
        .arg("-r")
        .arg(dpi.to_string())
        .arg("-f")
        .arg(page_num.to_string())
        .arg("-l")
        .arg(page_num.to_string())
        .arg(&pdf_path)
        .arg(&out_prefix)
        .status()
        .await
        .map_err(|e| anyhow::anyhow!("failed to spawn pdftoppm (is poppler-utils installed?): {e}"))?;

    if !status.success() {
        anyhow::bail!("pdftoppm exited with status {status} for page {page_num}");
    }

    find_rendered_page(dir.path(), page_num).await
}

/// `pdftoppm` names single-page output `page-<N>.png`, zero-padded to the digit width of
/// the page range; since we always render exactly one page, it is padded to at least one
/// digit, but poppler pads wider for multi-digit `-l` values in some versions, so scan the
/// directory rather than guessing the exact name.
async fn find_rendered_page(dir: &Path, page_num: u32) -> anyhow::Result<Vec<u8>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let needle = format!("-{page_num}.png");
    let mut fallback_single = None;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.ends_with(".png") {
            if name.ends_with(&needle) || name.ends_with(&format!("-{:02}.png", page_num)) || name.ends_with(&format!("-{:03}.png", page_num)) {
                return Ok(tokio::fs::read(entry.path()).await?);
            }
            fallback_single = Some(entry.path());
        }
    }
    match fallback_single {
        Some(path) => Ok(tokio::fs::read(path).await?),
        None => anyhow::bail!("pdftoppm produced no output for page {page_num}"),
    }
}
