use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use thiserror::Error;

use registry::{Artifact, Webapp, DEFAULT_CATEGORY};

mod json;
mod xml;

pub const PRODUCT: &str = "webshelf";
pub const FORMAT_VERSION: &str = "1.0";

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed {format} payload: {detail}")]
    Format { format: ExportFormat, detail: String },
    #[error("invalid export payload: {0}")]
    Validation(String),
    #[error("unsupported file extension: {0:?}")]
    UnsupportedExtension(String),
}

/// Wire formats the registry can be exported to and imported from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Xml,
}

impl ExportFormat {
    pub fn from_path(path: &Path) -> Result<Self, CodecError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        match ext.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "xml" => Ok(ExportFormat::Xml),
            other => Err(CodecError::UnsupportedExtension(other.to_string())),
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Xml => "xml",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ExportFormat::Json => "application/json",
            ExportFormat::Xml => "application/xml",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Json => write!(f, "JSON"),
            ExportFormat::Xml => write!(f, "XML"),
        }
    }
}

/// Reconciliation policy applied when importing into an existing registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Discard the current registry entirely.
    Replace,
    /// Keep everything current; append candidate records with new ids.
    /// Colliding ids are dropped — existing data wins.
    Merge,
}

/// Serialize the full record set in the requested format.
pub fn export(webapps: &[Webapp], format: ExportFormat) -> Result<String> {
    match format {
        ExportFormat::Json => json::export_json(webapps),
        ExportFormat::Xml => xml::export_xml(webapps),
    }
}

/// Parse and validate an exported payload. Fails with `CodecError::Format`
/// when the text is not the declared format, `CodecError::Validation` when a
/// parsed record is missing `id`, `name`, or `fileContent`. Never partial:
/// one bad record rejects the whole payload.
pub fn import(text: &str, format: ExportFormat) -> Result<Vec<Webapp>, CodecError> {
    let raw = match format {
        ExportFormat::Json => json::import_json(text)?,
        ExportFormat::Xml => xml::import_xml(text)?,
    };
    raw.into_iter()
        .enumerate()
        .map(|(index, raw)| finish(index, raw))
        .collect()
}

/// Apply the import policy against the current record set.
pub fn reconcile(current: &[Webapp], candidate: Vec<Webapp>, mode: ImportMode) -> Vec<Webapp> {
    match mode {
        ImportMode::Replace => candidate,
        ImportMode::Merge => {
            let existing: HashSet<&str> = current.iter().map(|w| w.id.as_str()).collect();
            let mut merged = current.to_vec();
            merged.extend(
                candidate
                    .into_iter()
                    .filter(|w| !existing.contains(w.id.as_str())),
            );
            merged
        }
    }
}

/// Download filename for an export produced today.
pub fn export_file_name(format: ExportFormat) -> String {
    format!(
        "{PRODUCT}-export-{}.{}",
        Utc::now().format("%Y-%m-%d"),
        format.extension()
    )
}

/// Parsed-but-unvalidated record; both wire formats funnel through this
/// before `finish` enforces required fields and fills defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawWebapp {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_content: Option<String>,
    #[serde(default)]
    pub screenshot: Option<Artifact>,
    #[serde(default)]
    pub date_added: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage_count: Option<u64>,
}

pub(crate) fn finish(index: usize, raw: RawWebapp) -> Result<Webapp, CodecError> {
    let id = required(index, "id", raw.id)?;
    let name = required(index, "name", raw.name)?;
    let file_content = required(index, "fileContent", raw.file_content)?;
    let now = Utc::now();
    Ok(Webapp {
        id,
        name,
        description: raw.description.unwrap_or_default(),
        category: raw
            .category
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
        tags: raw.tags,
        file_name: raw.file_name.unwrap_or_default(),
        file_content,
        screenshot: raw.screenshot.unwrap_or_default(),
        date_added: raw.date_added.unwrap_or(now),
        last_used: raw.last_used,
        last_modified: raw.last_modified.unwrap_or(now),
        usage_count: raw.usage_count.unwrap_or(0),
    })
}

fn required(index: usize, field: &str, value: Option<String>) -> Result<String, CodecError> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(CodecError::Validation(format!(
            "webapp {index}: missing required field `{field}`"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_webapps() -> Vec<Webapp> {
        let added = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        let used = Utc.with_ymd_and_hms(2024, 4, 2, 18, 5, 7).unwrap();

        let mut calc = Webapp::new("Calc <&> \"quoted\"", "calc.html", "<html>1</html>");
        calc.id = "id-calc".to_string();
        calc.description = "it's a calculator".to_string();
        calc.category = "productivity".to_string();
        calc.tags = vec!["math".to_string(), "tools".to_string(), "math".to_string()];
        calc.screenshot = Artifact::Image {
            url: "data:image/png;base64,QUJD".to_string(),
            title: "Calc".to_string(),
        };
        calc.date_added = added;
        calc.last_used = Some(used);
        calc.last_modified = used;
        calc.usage_count = 12;

        let mut notes = Webapp::new(
            "Notes",
            "notes.html",
            "<html><script>if (a ]]> b) {}</script>\n<body>  spaced  </body></html>",
        );
        notes.id = "id-notes".to_string();
        notes.screenshot = Artifact::Text {
            title: "Untitled Webapp".to_string(),
            preview: "<html><script>]]>...".to_string(),
        };
        notes.date_added = added;
        notes.last_modified = added;

        let mut fresh = Webapp::new("Fresh", "fresh.html", "<html>new</html>");
        fresh.id = "id-fresh".to_string();
        fresh.screenshot = Artifact::Pending;
        fresh.date_added = added;
        fresh.last_modified = added;

        vec![calc, notes, fresh]
    }

    #[test]
    fn test_json_round_trip() {
        let webapps = sample_webapps();
        let text = export(&webapps, ExportFormat::Json).unwrap();
        let back = import(&text, ExportFormat::Json).unwrap();
        assert_eq!(back, webapps);
    }

    #[test]
    fn test_xml_round_trip() {
        let webapps = sample_webapps();
        let text = export(&webapps, ExportFormat::Xml).unwrap();
        let back = import(&text, ExportFormat::Xml).unwrap();
        assert_eq!(back, webapps);
    }

    #[test]
    fn test_import_garbage_is_format_error() {
        for format in [ExportFormat::Json, ExportFormat::Xml] {
            let err = import("not an export", format).unwrap_err();
            assert!(matches!(err, CodecError::Format { .. }), "{format}: {err}");
        }
    }

    #[test]
    fn test_import_json_missing_content_is_validation_error() {
        let text = r#"{
            "version": "1.0",
            "exportDate": "2024-03-01T09:30:00Z",
            "webapps": [
                {"id": "a", "name": "Ok", "fileContent": "<html></html>"},
                {"id": "b", "name": "Broken"}
            ]
        }"#;
        let err = import(text, ExportFormat::Json).unwrap_err();
        match err {
            CodecError::Validation(detail) => assert!(detail.contains("fileContent")),
            other => panic!("expected validation error, got {other}"),
        }
    }

    #[test]
    fn test_merge_is_idempotent() {
        let webapps = sample_webapps();
        let merged = reconcile(&webapps, webapps.clone(), ImportMode::Merge);
        assert_eq!(merged, webapps);
    }

    #[test]
    fn test_replace_is_total() {
        let current = sample_webapps();
        let candidate = vec![Webapp::new("Only", "only.html", "<html></html>")];
        let replaced = reconcile(&current, candidate.clone(), ImportMode::Replace);
        assert_eq!(replaced, candidate);
    }

    #[test]
    fn test_merge_keeps_existing_on_collision() {
        let current = sample_webapps();

        let mut colliding = Webapp::new("Evil twin", "evil.html", "<html>other</html>");
        colliding.id = current[0].id.clone();
        let new = Webapp::new("Brand new", "new.html", "<html>n</html>");

        let merged = reconcile(&current, vec![colliding, new.clone()], ImportMode::Merge);
        assert_eq!(merged.len(), current.len() + 1);
        assert_eq!(merged[0], current[0]);
        assert_eq!(merged.last().unwrap(), &new);
    }

    #[test]
    fn test_export_file_name_pattern() {
        let name = export_file_name(ExportFormat::Xml);
        assert!(name.starts_with("webshelf-export-"));
        assert!(name.ends_with(".xml"));
    }

    #[test]
    fn test_format_from_path() {
        assert_eq!(
            ExportFormat::from_path(Path::new("backup.JSON")).unwrap(),
            ExportFormat::Json
        );
        assert_eq!(
            ExportFormat::from_path(Path::new("backup.xml")).unwrap(),
            ExportFormat::Xml
        );
        assert!(matches!(
            ExportFormat::from_path(Path::new("backup.txt")),
            Err(CodecError::UnsupportedExtension(_))
        ));
    }

    #[test]
    fn test_mime_types() {
        assert_eq!(ExportFormat::Json.mime_type(), "application/json");
        assert_eq!(ExportFormat::Xml.mime_type(), "application/xml");
    }
}
