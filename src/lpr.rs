//! Plate recognition collaborator.
//!
//! `recognize` receives the JPEG-encoded evidence crop and answers with the
//! registered owner, `None` when no plate could be read or the plate is not on
//! record, or an error for transport and service failures. The finalizer treats
//! `None` and errors the same way (abandon the event) but logs them differently.

use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use crate::violation::OwnerRecord;

pub const DEFAULT_LPR_TIMEOUT: Duration = Duration::from_secs(3);

const MULTIPART_BOUNDARY: &str = "rider-watch-crop-boundary";

pub trait PlateRecognizer: Send + Sync {
    fn name(&self) -> &str;

    fn recognize(&self, crop_jpeg: &[u8]) -> Result<Option<OwnerRecord>>;
}

/// Strip separators and upper-case a plate string.
///
/// Returns `None` when nothing plate-like remains (empty, or the service's
/// "no plate" marker).
pub fn normalize_plate(raw: &str) -> Result<Option<String>> {
    static SEPARATORS: OnceLock<Regex> = OnceLock::new();
    static PLATE: OnceLock<Regex> = OnceLock::new();

    let separators = match SEPARATORS.get() {
        Some(re) => re,
        None => {
            let re = Regex::new(r"[\s\-]+").context("compile plate separator pattern")?;
            SEPARATORS.get_or_init(|| re)
        }
    };
    let plate = match PLATE.get() {
        Some(re) => re,
        None => {
            let re = Regex::new(r"^[A-Z0-9]{2,10}$").context("compile plate pattern")?;
            PLATE.get_or_init(|| re)
        }
    };

    let cleaned = separators.replace_all(raw, "").to_uppercase();
    if cleaned == "NO_PLATE_FOUND" || !plate.is_match(&cleaned) {
        return Ok(None);
    }
    Ok(Some(cleaned))
}

#[derive(Deserialize)]
struct RecognitionResponse {
    #[serde(default)]
    data: Option<OwnerRecord>,
}

/// Recognition service client: multipart `file` upload, JSON `{"data": ...}` reply.
pub struct HttpPlateRecognizer {
    url: String,
    agent: ureq::Agent,
}

impl HttpPlateRecognizer {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            url: url.into(),
            agent,
        }
    }

    fn multipart_body(crop_jpeg: &[u8]) -> Vec<u8> {
        let mut body = Vec::with_capacity(crop_jpeg.len() + 256);
        body.extend_from_slice(format!("--{}\r\n", MULTIPART_BOUNDARY).as_bytes());
        body.extend_from_slice(
            b"Content-Disposition: form-data; name=\"file\"; filename=\"violation.jpg\"\r\n",
        );
        body.extend_from_slice(b"Content-Type: image/jpeg\r\n\r\n");
        body.extend_from_slice(crop_jpeg);
        body.extend_from_slice(format!("\r\n--{}--\r\n", MULTIPART_BOUNDARY).as_bytes());
        body
    }
}

impl PlateRecognizer for HttpPlateRecognizer {
    fn name(&self) -> &str {
        "http"
    }

    fn recognize(&self, crop_jpeg: &[u8]) -> Result<Option<OwnerRecord>> {
        let body = Self::multipart_body(crop_jpeg);
        let response = match self
            .agent
            .post(&self.url)
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={}", MULTIPART_BOUNDARY),
            )
            .set("Connection", "close")
            .send_bytes(&body)
        {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => return Ok(None),
            Err(ureq::Error::Status(code, _)) => {
                return Err(anyhow!("plate recognition returned status {}", code))
            }
            Err(e) => return Err(anyhow!("plate recognition request failed: {}", e)),
        };

        let text = response
            .into_string()
            .context("read plate recognition response")?;
        let parsed: RecognitionResponse =
            serde_json::from_str(&text).context("parse plate recognition response")?;
        let Some(mut owner) = parsed.data else {
            return Ok(None);
        };
        match normalize_plate(&owner.license_plate_number)? {
            Some(plate) => {
                owner.license_plate_number = plate;
                Ok(Some(owner))
            }
            None => Ok(None),
        }
    }
}

#[derive(Clone, Debug)]
enum StaticAnswer {
    Found(OwnerRecord),
    NotFound,
    Fail(String),
}

/// Recognizer with a fixed answer, for the demo daemon and tests.
pub struct StaticPlateRecognizer {
    answer: StaticAnswer,
    calls: AtomicU64,
}

impl StaticPlateRecognizer {
    pub fn found(owner: OwnerRecord) -> Self {
        Self::with_answer(StaticAnswer::Found(owner))
    }

    pub fn not_found() -> Self {
        Self::with_answer(StaticAnswer::NotFound)
    }

    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_answer(StaticAnswer::Fail(message.into()))
    }

    fn with_answer(answer: StaticAnswer) -> Self {
        Self {
            answer,
            calls: AtomicU64::new(0),
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

impl PlateRecognizer for StaticPlateRecognizer {
    fn name(&self) -> &str {
        "static"
    }

    fn recognize(&self, _crop_jpeg: &[u8]) -> Result<Option<OwnerRecord>> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match &self.answer {
            StaticAnswer::Found(owner) => Ok(Some(owner.clone())),
            StaticAnswer::NotFound => Ok(None),
            StaticAnswer::Fail(message) => Err(anyhow!("{}", message)),
        }
    }
}
