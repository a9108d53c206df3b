/*!
 * Error handling for the supply-check library
 *
 * Provides detailed error types with context, suggestions, and recovery guidance.
 * Matching itself never returns these: the loader and the service layer turn
 * them into typed "unloaded" states or `success: false` results.
 */

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use serde::{Serialize, Deserialize};

/// Library result type
pub type Result<T> = std::result::Result<T, SupplyCheckError>;

/// Error types with context and suggestions
#[derive(Error, Debug)]
pub enum SupplyCheckError {
    /// File I/O errors with context
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
        context: ErrorContext,
    },

    /// File not found with suggestions
    #[error("File not found: {path}")]
    FileNotFound {
        path: PathBuf,
        suggestion: String,
    },

    /// Workbook could not be opened or its first sheet read
    #[error("Spreadsheet error: {message}")]
    Spreadsheet {
        message: String,
        context: ErrorContext,
    },

    /// CSV parsing errors with location information
    #[error("CSV parsing error at line {line:?}: {message}")]
    CsvParse {
        message: String,
        line: Option<usize>,
        context: ErrorContext,
    },

    /// File extension the reader does not handle
    #[error("Unsupported file format '{extension}'")]
    UnsupportedFormat {
        extension: String,
        supported: Vec<String>,
    },

    /// Network failures while talking to the MHLW site
    #[error("HTTP error: {message}")]
    Http {
        message: String,
        url: Option<String>,
    },

    /// The MHLW page no longer links to a spreadsheet
    #[error("No spreadsheet link found on {page_url}")]
    LinkNotFound {
        page_url: String,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        suggestion: Option<String>,
    },

    /// Export errors
    #[error("Export error: {message}")]
    Export {
        message: String,
        format: ExportFormat,
        suggestion: Option<String>,
    },

    /// A bounded operation ran past its deadline
    #[error("Operation timed out after {seconds}s: {operation}")]
    Timeout {
        operation: String,
        seconds: u64,
    },

    /// Feature not enabled error
    #[error("Feature '{feature}' is not enabled")]
    FeatureNotEnabled {
        feature: String,
        enable_instruction: String,
    },

    /// Generic errors with custom message
    #[error("{message}")]
    Custom {
        message: String,
        suggestion: Option<String>,
    },
}

/// File an error was raised for, when known
#[derive(Debug, Default, Clone)]
pub struct ErrorContext {
    pub file_path: Option<PathBuf>,
}

impl ErrorContext {
    /// Context pointing at a file
    pub fn for_file<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            file_path: Some(path.into()),
        }
    }
}

/// Export format for match results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Json,
    JsonLines,
    Csv,
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Json => write!(f, "JSON"),
            ExportFormat::JsonLines => write!(f, "JSON Lines"),
            ExportFormat::Csv => write!(f, "CSV"),
        }
    }
}

impl SupplyCheckError {
    /// Create a file not found error with helpful suggestion
    pub fn file_not_found_with_suggestion(path: PathBuf) -> Self {
        let suggestion = if path.to_string_lossy().contains("mhlw") {
            format!(
                "The supply-status cache '{}' has not been downloaded yet. \
                Run `supplycheck refresh` to fetch the latest spreadsheet from the MHLW site.",
                path.display()
            )
        } else {
            format!(
                "Check if the file exists at '{}'. Make sure the path is correct and you have read permissions.",
                path.display()
            )
        };

        Self::FileNotFound { path, suggestion }
    }

    /// Create an unsupported format error listing what the reader accepts
    pub fn unsupported_format(extension: &str) -> Self {
        Self::UnsupportedFormat {
            extension: extension.to_string(),
            supported: crate::constants::SUPPORTED_EXTENSIONS
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }

    /// Create a feature not enabled error
    pub fn feature_required(feature: &str) -> Self {
        let enable_instruction = match feature {
            "download" => "Add 'supplycheck = { version = \"0.1\", features = [\"download\"] }' to your Cargo.toml",
            _ => "Enable the required feature in your Cargo.toml",
        };

        Self::FeatureNotEnabled {
            feature: feature.to_string(),
            enable_instruction: enable_instruction.to_string(),
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            Self::FileNotFound { suggestion, .. } => {
                format!("{}\n\nSuggestion: {}", self, suggestion)
            }
            Self::UnsupportedFormat { supported, .. } => {
                format!("{}\n\nSupported formats: {}", self, supported.join(", "))
            }
            Self::FeatureNotEnabled { enable_instruction, .. } => {
                format!("{}\n\nTo enable: {}", self, enable_instruction)
            }
            Self::Configuration { suggestion: Some(sug), .. }
            | Self::Export { suggestion: Some(sug), .. }
            | Self::Custom { suggestion: Some(sug), .. } => {
                format!("{}\n\nSuggestion: {}", self, sug)
            }
            Self::Io { context, .. }
            | Self::Spreadsheet { context, .. }
            | Self::CsvParse { context, .. } => match &context.file_path {
                Some(path) => format!("{}\n\nFile: {}", self, path.display()),
                None => self.to_string(),
            },
            _ => self.to_string(),
        }
    }
}

// Convenience conversions
impl From<std::io::Error> for SupplyCheckError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
            source: err,
            context: ErrorContext::default(),
        }
    }
}

impl From<csv::Error> for SupplyCheckError {
    fn from(err: csv::Error) -> Self {
        let (line, message) = match err.position() {
            Some(pos) => (Some(pos.line() as usize), err.to_string()),
            None => (None, err.to_string()),
        };

        Self::CsvParse {
            message,
            line,
            context: ErrorContext::default(),
        }
    }
}

impl From<serde_json::Error> for SupplyCheckError {
    fn from(err: serde_json::Error) -> Self {
        SupplyCheckError::Export {
            message: err.to_string(),
            format: ExportFormat::Json,
            suggestion: Some("Check if the data is serializable to JSON.".to_string()),
        }
    }
}

#[cfg(feature = "download")]
impl From<reqwest::Error> for SupplyCheckError {
    fn from(err: reqwest::Error) -> Self {
        Self::Http {
            url: err.url().map(|u| u.to_string()),
            message: err.to_string(),
        }
    }
}
