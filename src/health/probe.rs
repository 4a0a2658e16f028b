//! Probe response interpretation for the `/llmhealth` contract.
//!
//! Backends answer either JSON `{"status": "idle"|"busy", "gpu_util_max5s": n}`
//! or a plain text body. Anything that is not a clean answer is pushed to
//! the safe side: unknown status strings read as busy, and any transport or
//! parse failure reads as invalid.

use super::state::HealthSample;
use serde_json::Value;

/// Outcome of one probe, always well-formed; failures collapse to
/// [`HealthSample::Invalid`].
#[derive(Debug, Clone, Copy)]
pub struct ProbeReading {
    pub sample: HealthSample,
    pub gpu_util_max5s: Option<f64>,
}

impl ProbeReading {
    pub fn invalid() -> Self {
        Self {
            sample: HealthSample::Invalid,
            gpu_util_max5s: None,
        }
    }
}

/// Map a status string to a sample. Unknown values are busy.
pub fn interpret_status_text(text: &str) -> HealthSample {
    match text.trim().to_ascii_lowercase().as_str() {
        "idle" => HealthSample::Idle,
        _ => HealthSample::Busy,
    }
}

/// Issue one GET against `<health_base>/llmhealth`.
pub async fn probe(client: &reqwest::Client, health_base: &str) -> ProbeReading {
    let url = format!("{}/llmhealth", health_base.trim_end_matches('/'));
    match try_probe(client, &url).await {
        Ok(reading) => reading,
        Err(_) => ProbeReading::invalid(),
    }
}

async fn try_probe(client: &reqwest::Client, url: &str) -> Result<ProbeReading, ProbeError> {
    let response = client.get(url).send().await?;

    let is_json = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("application/json"))
        .unwrap_or(false);

    let body = response.text().await?;

    if !is_json {
        return Ok(ProbeReading {
            sample: interpret_status_text(&body),
            gpu_util_max5s: None,
        });
    }

    let value: Value = serde_json::from_str(&body)?;
    let sample = match value.get("status").and_then(Value::as_str) {
        Some(status) => interpret_status_text(status),
        None => interpret_status_text(&body),
    };
    let gpu_util_max5s = value.get("gpu_util_max5s").and_then(Value::as_f64);

    Ok(ProbeReading {
        sample,
        gpu_util_max5s,
    })
}

#[derive(Debug, thiserror::Error)]
enum ProbeError {
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
