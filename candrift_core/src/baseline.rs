//! Expected-response table used by the classifier.
//!
//! A baseline records, per arbitration ID, whether the bus normally stays
//! silent after a frame with that ID or which response is normally seen.
//! It is captured from a known-good vehicle and loaded before the session.

use crate::frame::Frame;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BaselineError {
    #[error("Failed to read baseline file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse baseline file {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("Baseline lists arbitration ID 0x{0:X} more than once")]
    DuplicateId(u32),
}

/// Shape of the response normally observed for an arbitration ID.
///
/// Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ResponseShape {
    #[serde(default)]
    pub response_id: Option<u32>,
    #[serde(default)]
    pub dlc: Option<usize>,
    #[serde(default)]
    pub payload_prefix: Vec<u8>,
}

impl ResponseShape {
    pub fn matches(&self, frame: &Frame) -> bool {
        self.response_id.is_none_or(|id| id == frame.id())
            && self.dlc.is_none_or(|dlc| dlc == frame.dlc())
            && frame.payload().starts_with(&self.payload_prefix)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectedResponse {
    /// Nothing is normally heard after this ID is sent.
    Silent,
    /// A response matching the shape is normally heard.
    Responds(ResponseShape),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
enum ExpectationKind {
    Silent,
    Responds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct BaselineEntry {
    id: u32,
    expect: ExpectationKind,
    #[serde(default)]
    response_id: Option<u32>,
    #[serde(default)]
    dlc: Option<usize>,
    #[serde(default)]
    payload_prefix: Vec<u8>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct BaselineFile {
    #[serde(default)]
    entry: Vec<BaselineEntry>,
}

/// Mapping of arbitration ID to its expected response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Baseline {
    entries: HashMap<u32, ExpectedResponse>,
}

impl Baseline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_silent(&mut self, id: u32) -> &mut Self {
        self.entries.insert(id, ExpectedResponse::Silent);
        self
    }

    pub fn mark_responsive(&mut self, id: u32, shape: ResponseShape) -> &mut Self {
        self.entries.insert(id, ExpectedResponse::Responds(shape));
        self
    }

    pub fn expectation(&self, id: u32) -> Option<&ExpectedResponse> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parses TOML of the form:
    ///
    /// ```toml
    /// [[entry]]
    /// id = 0x7DF
    /// expect = "responds"
    /// response-id = 0x7E8
    /// payload-prefix = [0x41]
    /// ```
    pub fn from_toml_str(text: &str, origin: &Path) -> Result<Self, BaselineError> {
        let file: BaselineFile = toml::from_str(text).map_err(|e| BaselineError::Parse {
            path: origin.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_file_entries(file)
    }

    /// Parses the JSON equivalent of [`Baseline::from_toml_str`].
    pub fn from_json_str(text: &str, origin: &Path) -> Result<Self, BaselineError> {
        let file: BaselineFile = serde_json::from_str(text).map_err(|e| BaselineError::Parse {
            path: origin.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_file_entries(file)
    }

    /// Loads a baseline file, choosing JSON for `.json` files and TOML otherwise.
    pub fn load_from_file(path: &Path) -> Result<Self, BaselineError> {
        let text = std::fs::read_to_string(path).map_err(|source| BaselineError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&text, path),
            _ => Self::from_toml_str(&text, path),
        }
    }

    fn from_file_entries(file: BaselineFile) -> Result<Self, BaselineError> {
        let mut baseline = Baseline::new();
        for entry in file.entry {
            if baseline.entries.contains_key(&entry.id) {
                return Err(BaselineError::DuplicateId(entry.id));
            }
            match entry.expect {
                ExpectationKind::Silent => baseline.mark_silent(entry.id),
                ExpectationKind::Responds => baseline.mark_responsive(
                    entry.id,
                    ResponseShape {
                        response_id: entry.response_id,
                        dlc: entry.dlc,
                        payload_prefix: entry.payload_prefix,
                    },
                ),
            };
        }
        Ok(baseline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_shape_matches_on_set_fields_only() {
        let shape = ResponseShape {
            response_id: Some(0x7E8),
            dlc: None,
            payload_prefix: vec![0x41],
        };
        assert!(shape.matches(&Frame::new(0x7E8, vec![0x41, 0x00]).unwrap()));
        assert!(!shape.matches(&Frame::new(0x7E9, vec![0x41]).unwrap()));
        assert!(!shape.matches(&Frame::new(0x7E8, vec![0x7F, 0x01]).unwrap()));
        assert!(ResponseShape::default().matches(&Frame::new(0x1, Vec::<u8>::new()).unwrap()));
    }

    #[test]
    fn parses_toml_baseline() {
        let text = r#"
            [[entry]]
            id = 0x200
            expect = "responds"
            response-id = 0x208
            dlc = 8

            [[entry]]
            id = 0x300
            expect = "silent"
        "#;
        let baseline = Baseline::from_toml_str(text, Path::new("baseline.toml")).unwrap();
        assert_eq!(baseline.len(), 2);
        assert_eq!(baseline.expectation(0x300), Some(&ExpectedResponse::Silent));
        match baseline.expectation(0x200) {
            Some(ExpectedResponse::Responds(shape)) => {
                assert_eq!(shape.response_id, Some(0x208));
                assert_eq!(shape.dlc, Some(8));
            }
            other => panic!("Expected responsive entry, got {other:?}"),
        }
        assert!(baseline.expectation(0x400).is_none());
    }

    #[test]
    fn parses_json_baseline() {
        let text = r#"{"entry": [{"id": 16, "expect": "silent"}]}"#;
        let baseline = Baseline::from_json_str(text, Path::new("baseline.json")).unwrap();
        assert_eq!(baseline.expectation(0x10), Some(&ExpectedResponse::Silent));
    }

    #[test]
    fn rejects_duplicate_ids_and_unknown_keys() {
        let dup = "[[entry]]\nid = 1\nexpect = \"silent\"\n[[entry]]\nid = 1\nexpect = \"silent\"\n";
        assert!(matches!(
            Baseline::from_toml_str(dup, Path::new("dup.toml")),
            Err(BaselineError::DuplicateId(1))
        ));
        let unknown = "[[entry]]\nid = 1\nexpect = \"silent\"\ncolour = \"red\"\n";
        assert!(matches!(
            Baseline::from_toml_str(unknown, Path::new("bad.toml")),
            Err(BaselineError::Parse { .. })
        ));
    }
}
