//! Tier-3 OCR (§4.4): last resort for scans Tesseract couldn't read. A single
//! image-understanding call per page, same prompt as the original's Claude Vision call,
//! expressed as a plain `reqwest` request rather than a vendor SDK (there is no such SDK
//! in this dependency stack).

use base64::Engine;
use serde_json::json;

use super::VisionClient;

pub const DEFAULT_VISION_MODEL: &str = "claude-haiku-4-5-20251001";
const MAX_TOKENS: u32 = 4096;
const ENDPOINT: &str = "https://api.anthropic.com/v1/messages";

const PROMPT: &str = "Это скан страницы из российского официального приказа о присвоении \
спортивных разрядов или квалификационных категорий.\n\nИзвлеки ВЕСЬ текст со страницы. \
Сохраняй структуру таблиц, нумерацию строк, ФИО, даты, названия видов спорта.\n\nВерни \
ТОЛЬКО текст документа, без комментариев.";

pub async fn ocr_image(client: &VisionClient, png_bytes: &[u8]) -> anyhow::Result<String> {
    let b64 = base64::engine::general_purpose::STANDARD.encode(png_bytes);

    let body = json!({
        "model": client.model,
        "max_tokens": MAX_TOKENS,
        "messages": [{
            "role": "user",
            "content": [
                {
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": "image/png",
                        "data": b64,
                    },
                },
                { "type": "text", "text": PROMPT },
            ],
        }],
    });

    let response = client
        .http
        .post(ENDPOINT)
        .header("x-api-key", &client.api_key)
        .header("anthropic-version", "2023-06-01")
        .json(&body)
        .send()
        .await?
        .error_for_status()?;

    let parsed: serde_json::Value = response.json().await?;
    let text = parsed["content"][0]["text"]
        .as_str()
        .ok_or_else(|| anyhow::anyhow!("vision response had no text content"))?;
    Ok(text.trim().to_string())
}
