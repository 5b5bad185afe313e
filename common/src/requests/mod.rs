use serde::{Deserialize, Serialize};

fn default_delimiter() -> String {
    ",".to_string()
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

fn default_true() -> bool {
    true
}

/// The `json` part of a multipart import upload. Must be sent before the
/// `file` part.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubmitImportRequest {
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
    #[serde(default = "default_encoding")]
    pub encoding: String,
    #[serde(default = "default_true")]
    pub has_header: bool,
}

impl Default for SubmitImportRequest {
    fn default() -> Self {
        Self {
            delimiter: default_delimiter(),
            encoding: default_encoding(),
            has_header: true,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListErrorsQuery {
    pub limit: Option<usize>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CleanupArchivesQuery {
    pub keep: Option<usize>,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PurgeImportsQuery {
    pub older_than_days: i64,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListJobsQuery {
    pub limit: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_request_fills_defaults() {
        let req: SubmitImportRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.delimiter, ",");
        assert_eq!(req.encoding, "utf-8");
        assert!(req.has_header);
    }

    #[test]
    fn submit_request_keeps_explicit_values() {
        let req: SubmitImportRequest =
            serde_json::from_str(r#"{"delimiter":";","encoding":"cp1251","has_header":false}"#)
                .unwrap();
        assert_eq!(req.delimiter, ";");
        assert_eq!(req.encoding, "cp1251");
        assert!(!req.has_header);
    }
}
