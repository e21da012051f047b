use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use registry::Webapp;

use crate::{CodecError, ExportFormat, RawWebapp, FORMAT_VERSION};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeOut<'a> {
    version: &'a str,
    export_date: DateTime<Utc>,
    webapps: &'a [Webapp],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EnvelopeIn {
    #[serde(default)]
    #[allow(dead_code)]
    version: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    export_date: Option<DateTime<Utc>>,
    webapps: Vec<RawWebapp>,
}

pub(crate) fn export_json(webapps: &[Webapp]) -> Result<String> {
    let envelope = EnvelopeOut {
        version: FORMAT_VERSION,
        export_date: Utc::now(),
        webapps,
    };
    serde_json::to_string_pretty(&envelope).context("serialize JSON export")
}

pub(crate) fn import_json(text: &str) -> Result<Vec<RawWebapp>, CodecError> {
    let envelope: EnvelopeIn =
        serde_json::from_str(text).map_err(|err| CodecError::Format {
            format: ExportFormat::Json,
            detail: err.to_string(),
        })?;
    Ok(envelope.webapps)
}
