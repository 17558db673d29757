//! Tier-2 OCR (§4.4): rasterize each page that failed the embedded-text check, run the
//! PIL-equivalent preprocessing pipeline (grayscale, autocontrast, contrast boost, a
//! median-style denoise, Otsu threshold), then Tesseract. Preprocessing and the Tesseract
//! call are CPU-bound and run on a blocking thread (§5 "off-loop CPU work"), mirroring the
//! original's `asyncio.to_thread(self._run_tesseract_batch, ...)`.

use image::{DynamicImage, GrayImage};

use super::raster::rasterize_page;
use super::readable_ratio;

pub async fn run_batch(
    pdf_bytes: &[u8],
    page_nums: &[u32],
    dpi: u32,
    contrast_factor: f64,
) -> anyhow::Result<Vec<(u32, String, f64)>> {
    let mut results = Vec::with_capacity(page_nums.len());
    for &page_num in page_nums {
        let png_bytes = rasterize_page(pdf_bytes, page_num, dpi).await?;
        let (text, ratio) =
            tokio::task::spawn_blocking(move || preprocess_and_ocr(&png_bytes, contrast_factor)).await??;
        results.push((page_num, text, ratio));
    }
    Ok(results)
}

fn preprocess_and_ocr(png_bytes: &[u8], contrast_factor: f64) -> anyhow::Result<(String, f64)> {
    let image = image::load_from_memory(png_bytes)?;
    let preprocessed = preprocess(image, contrast_factor);
    let text = run_tesseract(&preprocessed)?;
    let ratio = readable_ratio(&text);
    Ok((text, ratio))
}

/// Grayscale → autocontrast → contrast boost → median-style blur → Otsu binarization.
/// Deskew is intentionally not attempted here: it needs Hough-line detection that
/// `imageproc` doesn't provide, and the original's OpenCV deskew path is itself an
/// optional best-effort step gated on an import that may not be present.
fn preprocess(image: DynamicImage, contrast_factor: f64) -> GrayImage {
    let gray = image.to_luma8();
    let gray = autocontrast(&gray);
    let boosted = boost_contrast(&gray, contrast_factor);
    let denoised = imageproc::filter::median_filter(&boosted, 1, 1);
    let threshold = imageproc::contrast::otsu_level(&denoised);
    imageproc::contrast::threshold(&denoised, threshold, imageproc::contrast::ThresholdType::Binary)
}

/// PIL's `ImageOps.autocontrast`: stretch the histogram so the darkest/lightest pixels
/// map to 0/255, clipping a small fraction at each end.
fn autocontrast(image: &GrayImage) -> GrayImage {
    let mut histogram = [0u32; 256];
    for p in image.pixels() {
        histogram[p.0[0] as usize] += 1;
    }
    let total: u32 = histogram.iter().sum();
    let cutoff = (total as f64 * 0.005) as u32;

    let mut lo = 0u8;
    let mut seen = 0u32;
    for (v, &count) in histogram.iter().enumerate() {
        seen += count;
        if seen > cutoff {
            lo = v as u8;
            break;
        }
    }
    let mut hi = 255u8;
    seen = 0;
    for (v, &count) in histogram.iter().enumerate().rev() {
        seen += count;
        if seen > cutoff {
            hi = v as u8;
            break;
        }
    }
    if hi <= lo {
        return image.clone();
    }

    let (lo, hi) = (lo as f64, hi as f64);
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let v = image.get_pixel(x, y).0[0] as f64;
        let stretched = ((v - lo) / (hi - lo) * 255.0).clamp(0.0, 255.0);
        image::Luma([stretched as u8])
    })
}

fn boost_contrast(image: &GrayImage, factor: f64) -> GrayImage {
    let mean = {
        let sum: u64 = image.pixels().map(|p| p.0[0] as u64).sum();
        sum as f64 / image.len().max(1) as f64
    };
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let v = image.get_pixel(x, y).0[0] as f64;
        let adjusted = mean + (v - mean) * factor;
        image::Luma([adjusted.clamp(0.0, 255.0) as u8])
    })
}

#[cfg(feature = "tesseract-ocr")]
fn run_tesseract(image: &GrayImage) -> anyhow::Result<String> {
    let mut buf = Vec::new();
    let dyn_image = DynamicImage::ImageLuma8(image.clone());
    dyn_image.write_to(&mut std::io::Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let mut tess = tesseract::Tesseract::new(None, Some("rus+eng"))
        .map_err(|e| anyhow::anyhow!("failed to initialize tesseract: {e}"))?
        .set_image_from_mem(&buf)
        .map_err(|e| anyhow::anyhow!("failed to load image into tesseract: {e}"))?;
    tess = tess
        .set_page_seg_mode(tesseract::PageSegMode::PsmSingleBlock)
        .map_err(|e| anyhow::anyhow!("failed to set tesseract page segmentation mode: {e}"))?;

    let text = tess
        .get_text()
        .map_err(|e| anyhow::anyhow!("tesseract recognition failed: {e}"))?;
    Ok(text.trim().to_string())
}

#[cfg(not(feature = "tesseract-ocr"))]
fn run_tesseract(_image: &GrayImage) -> anyhow::Result<String> {
    tracing::warn!("tesseract-ocr feature disabled, skipping tier-2 recognition");
    Ok(String::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boost_contrast_preserves_dimensions() {
        let img = GrayImage::from_pixel(10, 10, image::Luma([128]));
        let boosted = boost_contrast(&img, 1.6);
        assert_eq!(boosted.dimensions(), (10, 10));
    }
}
