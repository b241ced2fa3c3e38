//! Export options parsing and validation
//!
//! `ExportOptions` is built once per export request and is never modified
//! while the pipeline runs. It can be constructed in code with the `with_*`
//! builders or deserialized from a JSON document where every field is optional.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Suffix appended to `debug_name` for the export stage's diagnostics
pub const EXPORT_STEP_SUFFIX: &str = "_export";

/// Default label identifying the module in diagnostics
pub const DEFAULT_DEBUG_NAME: &str = "stablehlo_quant";

/// Constants smaller than this stay embedded when unfreezing
pub const DEFAULT_UNFREEZE_SIZE_THRESHOLD_BYTES: usize = 64 * 1024;

/// Options controlling the optional behaviors of the export pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportOptions {
    /// Run the shape-determining constant duplication step before lowering
    pub duplicate_shape_determining_constants: bool,

    /// Move large constants into variables saved to a checkpoint.
    ///
    /// Experimental, no stability guarantees.
    pub unfreeze_constants: bool,

    /// Directory the checkpoint is written to; required when unfreezing
    #[serde(alias = "checkpoint_directory")]
    pub checkpoint_dir: Option<PathBuf>,

    /// Identifies the module in log output only
    pub debug_name: String,

    /// Minimum constant size considered for unfreezing
    pub unfreeze_size_threshold_bytes: usize,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            duplicate_shape_determining_constants: true,
            unfreeze_constants: false,
            checkpoint_dir: None,
            debug_name: DEFAULT_DEBUG_NAME.to_string(),
            unfreeze_size_threshold_bytes: DEFAULT_UNFREEZE_SIZE_THRESHOLD_BYTES,
        }
    }
}

impl ExportOptions {
    /// Create options with the documented defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable shape-determining constant duplication
    pub fn with_duplicate_shape_determining_constants(mut self, enabled: bool) -> Self {
        self.duplicate_shape_determining_constants = enabled;
        self
    }

    /// Enable or disable constant unfreezing
    pub fn with_unfreeze_constants(mut self, enabled: bool) -> Self {
        self.unfreeze_constants = enabled;
        self
    }

    /// Set the checkpoint directory
    pub fn with_checkpoint_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.checkpoint_dir = Some(dir.into());
        self
    }

    /// Set the debug name
    pub fn with_debug_name<S: Into<String>>(mut self, name: S) -> Self {
        self.debug_name = name.into();
        self
    }

    /// Set the unfreeze size threshold
    pub fn with_unfreeze_size_threshold(mut self, bytes: usize) -> Self {
        self.unfreeze_size_threshold_bytes = bytes;
        self
    }

    /// Load options from a JSON file
    ///
    /// # Examples
    /// ```rust,no_run
    /// use quant_export::config::ExportOptions;
    /// use std::path::Path;
    ///
    /// let options = ExportOptions::from_file(Path::new("./export.json"))?;
    /// options.validate()?;
    /// # Ok::<(), quant_export::Error>(())
    /// ```
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::invalid_config(format!(
                "Failed to read export options {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_json_str(&content)
    }

    /// Parse options from a JSON string; missing fields take their defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let options: ExportOptions = serde_json::from_str(json)?;
        Ok(options)
    }

    /// Checkpoint directory, if one is set and non-empty
    pub fn checkpoint_dir(&self) -> Option<&Path> {
        self.checkpoint_dir
            .as_deref()
            .filter(|dir| !dir.as_os_str().is_empty())
    }

    /// Label used for the export stage in diagnostics
    pub fn debug_label(&self) -> String {
        format!("{}{}", self.debug_name, EXPORT_STEP_SUFFIX)
    }

    /// Validate cross-field constraints
    ///
    /// Unfreezing constants without somewhere to write them is an error rather
    /// than a silent no-op.
    pub fn validate(&self) -> Result<()> {
        if self.unfreeze_constants && self.checkpoint_dir().is_none() {
            return Err(Error::invalid_config(
                "unfreeze_constants requires a non-empty checkpoint_dir",
            ));
        }
        Ok(())
    }

    /// One-line description for logs
    pub fn summary(&self) -> String {
        format!(
            "{}: duplicate_shape_constants={}, unfreeze_constants={}, checkpoint_dir={}",
            self.debug_name,
            self.duplicate_shape_determining_constants,
            self.unfreeze_constants,
            self.checkpoint_dir()
                .map(|dir| dir.display().to_string())
                .unwrap_or_else(|| "<none>".to_string())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let options = ExportOptions::default();
        assert!(options.duplicate_shape_determining_constants);
        assert!(!options.unfreeze_constants);
        assert!(options.checkpoint_dir.is_none());
        assert_eq!(options.debug_name, "stablehlo_quant");
        assert_eq!(options.debug_label(), "stablehlo_quant_export");
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_unfreeze_requires_checkpoint_dir() {
        let options = ExportOptions::new().with_unfreeze_constants(true);
        assert!(options.validate().unwrap_err().is_config_error());

        let empty = ExportOptions::new()
            .with_unfreeze_constants(true)
            .with_checkpoint_dir("");
        assert!(empty.validate().unwrap_err().is_config_error());

        let ok = ExportOptions::new()
            .with_unfreeze_constants(true)
            .with_checkpoint_dir("/tmp/ckpt");
        assert!(ok.validate().is_ok());
    }

    #[test]
    fn test_checkpoint_dir_without_unfreeze_is_valid() {
        let options = ExportOptions::new().with_checkpoint_dir("/tmp/unused");
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let options = ExportOptions::from_json_str(
            r#"{"unfreeze_constants": true, "checkpoint_directory": "/data/ckpt"}"#,
        )
        .unwrap();
        assert!(options.unfreeze_constants);
        assert!(options.duplicate_shape_determining_constants);
        assert_eq!(options.checkpoint_dir(), Some(Path::new("/data/ckpt")));
        assert_eq!(options.debug_name, DEFAULT_DEBUG_NAME);
    }

    #[test]
    fn test_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"duplicate_shape_determining_constants": false, "debug_name": "resnet"}}"#
        )
        .unwrap();

        let options = ExportOptions::from_file(file.path()).unwrap();
        assert!(!options.duplicate_shape_determining_constants);
        assert_eq!(options.debug_label(), "resnet_export");
        assert!(options.summary().contains("checkpoint_dir=<none>"));
    }

    #[test]
    fn test_from_missing_file_is_config_error() {
        let err = ExportOptions::from_file(Path::new("/nonexistent/export.json")).unwrap_err();
        assert!(err.is_config_error());
    }
}
