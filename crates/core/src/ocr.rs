use crate::config::{OcrBackend, OcrSettings};
use crate::error::ModelError;
use crate::layout::ImageCrop;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const OCR_TIMEOUT: Duration = Duration::from_secs(120);

/// Recognizes the text of a figure. Implementations block; callers run them
/// off the async runtime.
pub trait OcrEngine: Send + Sync {
    fn recognize(&self, image: &ImageCrop) -> Result<String, ModelError>;
}

pub fn engine_from_settings(settings: &OcrSettings) -> Result<Arc<dyn OcrEngine>, ModelError> {
    Ok(match settings.backend {
        OcrBackend::Tesseract => Arc::new(TesseractOcr::new(
            settings.tesseract_binary.clone(),
            settings.language.clone(),
        )),
        OcrBackend::Http => {
            let endpoint = settings
                .endpoint
                .clone()
                .ok_or_else(|| ModelError::Disabled("ocr endpoint".to_string()))?;
            Arc::new(HttpOcrEngine::new(
                endpoint,
                settings.api_key.clone(),
                settings.language.clone(),
            ))
        }
        OcrBackend::Disabled => Arc::new(DisabledOcr),
    })
}

/// Runs the `tesseract` command line tool on a temporary copy of the image.
pub struct TesseractOcr {
    binary: String,
    language: String,
}

impl TesseractOcr {
    pub fn new(binary: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            language: language.into(),
        }
    }
}

impl OcrEngine for TesseractOcr {
    fn recognize(&self, image: &ImageCrop) -> Result<String, ModelError> {
        let mut file = tempfile::Builder::new()
            .prefix("ocr-")
            .suffix(&format!(".{}", image.extension()))
            .tempfile()?;
        file.write_all(&image.bytes)?;
        file.flush()?;

        let output = Command::new(&self.binary)
            .arg(file.path())
            .arg("stdout")
            .arg("-l")
            .arg(&self.language)
            .output()?;

        if !output.status.success() {
            return Err(ModelError::Response {
                backend: "tesseract".to_string(),
                details: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(
            width = image.width,
            height = image.height,
            chars = text.len(),
            "tesseract finished"
        );
        Ok(text)
    }
}

/// Posts the image as base64 JSON to an OCR service. The blocking client is
/// built per call so the engine can be constructed on an async thread.
pub struct HttpOcrEngine {
    endpoint: String,
    api_key: Option<String>,
    language: String,
}

#[derive(Debug, Serialize)]
struct OcrRequest<'a> {
    image_base64: String,
    media_type: &'a str,
    language: &'a str,
}

#[derive(Debug, Deserialize)]
struct OcrResponse {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    pages: Vec<OcrPage>,
}

#[derive(Debug, Deserialize)]
struct OcrPage {
    #[serde(default)]
    text: String,
}

impl HttpOcrEngine {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key,
            language: language.into(),
        }
    }
}

impl OcrEngine for HttpOcrEngine {
    fn recognize(&self, image: &ImageCrop) -> Result<String, ModelError> {
        let body = OcrRequest {
            image_base64: BASE64_STANDARD.encode(&image.bytes),
            media_type: image.media_type,
            language: &self.language,
        };

        let client = Client::builder().timeout(OCR_TIMEOUT).build()?;
        let mut request = client.post(&self.endpoint).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send()?;
        let status = response.status();
        if !status.is_success() {
            let details = response.text().unwrap_or_default();
            return Err(ModelError::Response {
                backend: "ocr".to_string(),
                details: format!("{status}: {details}"),
            });
        }

        let parsed: OcrResponse = response.json()?;
        response_text(parsed).ok_or_else(|| ModelError::Response {
            backend: "ocr".to_string(),
            details: "response has neither text nor pages".to_string(),
        })
    }
}

fn response_text(response: OcrResponse) -> Option<String> {
    if let Some(text) = response.text {
        return Some(text.trim().to_string());
    }
    if response.pages.is_empty() {
        return None;
    }
    Some(
        response
            .pages
            .into_iter()
            .map(|page| page.text.trim().to_string())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

/// Used when no OCR backend is configured; every figure is skipped.
pub struct DisabledOcr;

impl OcrEngine for DisabledOcr {
    fn recognize(&self, _image: &ImageCrop) -> Result<String, ModelError> {
        Err(ModelError::Disabled("ocr".to_string()))
    }
}
