use serde::Serialize;
use thiserror::Error;

/// User-friendly error presentation for CLI diagnostics and run reports.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPresentation {
    pub title: String,
    pub message: String,
    pub action: Option<String>,
}

/// Application-wide error type.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Source ────────────────────────────────────────────────────────────────
    #[error("Source unreadable: {0}")]
    SourceUnreadable(String),

    #[error("Group '{0}' disappeared from the source")]
    GroupMissing(String),

    #[error(
        "Range {offset}..{end} unavailable in group '{group}' ({available} records available)"
    )]
    RangeUnavailable {
        group: String,
        offset: u64,
        end: u64,
        available: u64,
    },

    // ── Output ────────────────────────────────────────────────────────────────
    #[error("Write to {target} failed: {message}")]
    WriteFailed { target: String, message: String },

    /// The artifact on disk does not match its manifest. Triggers reconstruction.
    #[error("Artifact inconsistent: {0}")]
    ArtifactInconsistent(String),

    // ── File / CSV ────────────────────────────────────────────────────────────
    #[error("I/O error: {0}")]
    Io(String),

    #[error("CSV error: {0}")]
    Csv(String),

    // ── Staging ───────────────────────────────────────────────────────────────
    #[error("Staging ingestion failed for {} group(s): {}", failed.len(), failed.join(", "))]
    PartialIngestFailure { failed: Vec<String> },

    #[error("Staging store error: {0}")]
    Staging(String),

    // ── Run control ───────────────────────────────────────────────────────────
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation cancelled")]
    Cancelled,

    // ── Generic fallback ──────────────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Converts the error into a presentation suitable for a terminal diagnostic.
    pub fn to_presentation(&self) -> ErrorPresentation {
        match self {
            // ── Source ────────────────────────────────────────────────────────
            AppError::SourceUnreadable(msg) => ErrorPresentation {
                title: "Input Unreadable".into(),
                message: format!("The input workbook could not be opened: {}", msg),
                action: Some("Check the input path and its permissions".into()),
            },

            AppError::GroupMissing(name) => ErrorPresentation {
                title: "Input Changed".into(),
                message: format!(
                    "Sheet '{}' disappeared while the input was being read.",
                    name
                ),
                action: Some("Make sure nothing modifies the input, then run again".into()),
            },

            AppError::RangeUnavailable { group, .. } => ErrorPresentation {
                title: "Input Changed".into(),
                message: format!(
                    "Sheet '{}' holds fewer records than when it was analyzed.",
                    group
                ),
                action: Some("Make sure nothing modifies the input, then run again".into()),
            },

            // ── Output ────────────────────────────────────────────────────────
            AppError::WriteFailed { target, message } => ErrorPresentation {
                title: "Write Failed".into(),
                message: format!("Could not write {}: {}", target, message),
                action: Some(
                    "Check free disk space and run again; completed outputs are kept".into(),
                ),
            },

            AppError::ArtifactInconsistent(msg) => ErrorPresentation {
                title: "Output Inconsistent".into(),
                message: format!("An output workbook is inconsistent: {}", msg),
                action: Some("Run again to rebuild the affected workbook".into()),
            },

            // ── File / CSV ────────────────────────────────────────────────────
            AppError::Io(msg) => ErrorPresentation {
                title: "File Error".into(),
                message: format!("A file could not be read or written: {}", msg),
                action: Some("Check paths, permissions and free disk space".into()),
            },

            AppError::Csv(msg) => ErrorPresentation {
                title: "Invalid CSV".into(),
                message: format!("A sheet has a formatting problem: {}", msg),
                action: Some("Fix the sheet and try again".into()),
            },

            // ── Staging ───────────────────────────────────────────────────────
            AppError::PartialIngestFailure { failed } => ErrorPresentation {
                title: "Staging Incomplete".into(),
                message: format!(
                    "{} sheet(s) could not be staged: {}",
                    failed.len(),
                    failed.join(", ")
                ),
                action: Some(
                    "Run again with the same --staging-db to retry only those sheets".into(),
                ),
            },

            AppError::Staging(_) => ErrorPresentation {
                title: "Staging Database Error".into(),
                message: "The staging database could not be used.".into(),
                action: Some("Delete the staging database and run again".into()),
            },

            // ── Run control ───────────────────────────────────────────────────
            AppError::InvalidConfig(msg) => ErrorPresentation {
                title: "Invalid Options".into(),
                message: msg.clone(),
                action: Some("Fix the command line options and try again".into()),
            },

            AppError::Cancelled => ErrorPresentation {
                title: "Cancelled".into(),
                message: "The run was cancelled before all outputs were written.".into(),
                action: Some("Run again to finish the remaining outputs".into()),
            },

            // ── Generic ───────────────────────────────────────────────────────
            AppError::Internal(_) => ErrorPresentation {
                title: "Unexpected Error".into(),
                message: "Something went wrong. Please try again.".into(),
                action: Some("Try again".into()),
            },
        }
    }
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.to_presentation().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all_variants() -> Vec<AppError> {
        vec![
            AppError::SourceUnreadable("no such file".into()),
            AppError::GroupMissing("Sheet_3".into()),
            AppError::RangeUnavailable {
                group: "Sheet_1".into(),
                offset: 10,
                end: 20,
                available: 15,
            },
            AppError::WriteFailed {
                target: "output_1/Sheet_2".into(),
                message: "disk full".into(),
            },
            AppError::ArtifactInconsistent("manifest missing".into()),
            AppError::Io("permission denied".into()),
            AppError::Csv("unterminated quote".into()),
            AppError::PartialIngestFailure {
                failed: vec!["Sheet_2".into()],
            },
            AppError::Staging("locked".into()),
            AppError::InvalidConfig("records_per_group must be >= 1".into()),
            AppError::Cancelled,
            AppError::Internal("something broke".into()),
        ]
    }

    #[test]
    fn all_variants_have_nonempty_title_message_and_action() {
        for variant in all_variants() {
            let presentation = variant.to_presentation();
            assert!(
                !presentation.title.trim().is_empty(),
                "Empty title for {:?}",
                variant
            );
            assert!(
                !presentation.message.trim().is_empty(),
                "Empty message for {:?}",
                variant
            );
            assert!(
                presentation.action.is_some(),
                "Expected action for {:?}",
                variant
            );
        }
    }

    #[test]
    fn range_unavailable_display_names_the_range() {
        let err = AppError::RangeUnavailable {
            group: "Sheet_1".into(),
            offset: 10,
            end: 20,
            available: 15,
        };
        let text = err.to_string();
        assert!(text.contains("10..20"), "got: {}", text);
        assert!(text.contains("15 records"), "got: {}", text);
    }

    #[test]
    fn partial_ingest_lists_failed_groups() {
        let err = AppError::PartialIngestFailure {
            failed: vec!["Sheet_2".into(), "Sheet_5".into()],
        };
        assert!(err.to_string().contains("2 group(s)"));
        assert!(err.to_presentation().message.contains("Sheet_5"));
    }

    #[test]
    fn serialization_produces_presentation_fields() {
        for variant in all_variants() {
            let json = serde_json::to_string(&variant)
                .unwrap_or_else(|e| panic!("Failed to serialize {:?}: {}", variant, e));
            let parsed: serde_json::Value =
                serde_json::from_str(&json).expect("serialized error should be valid JSON");

            assert!(parsed.get("title").is_some(), "{:?} missing title", variant);
            assert!(
                parsed.get("message").is_some(),
                "{:?} missing message",
                variant
            );
            assert!(
                parsed.get("action").is_some(),
                "{:?} missing action",
                variant
            );
        }
    }

    #[test]
    fn internal_details_are_not_shown() {
        let presentation =
            AppError::Internal("sqlite: disk I/O error at 0x7f".into()).to_presentation();
        assert!(!presentation.message.contains("0x7f"));
    }
}
