use std::fmt;

pub const INVALID_ATTACHMENT_REPLY: &str =
    "❌ Uh oh, that's not a valid file! Your attachment must be a PNG or JPG.";
pub const MISSING_ATTACHMENT_REPLY: &str =
    "❓ Hmmm, there's no image attached to this message to be processed!";
pub const FETCH_ERROR_REPLY: &str = "❌ Oh no, an error occurred! Please contact the admin.";
pub const PROCESSING_REPLY: &str = "✅ Your image is being processed!";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStage {
    Received,
    Validating,
    Fetching,
    Describing,
    CorrectingColor,
    Resizing,
    Delivering,
    Done,
    Failed,
}

impl RunStage {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStage::Received => "received",
            RunStage::Validating => "validating",
            RunStage::Fetching => "fetching",
            RunStage::Describing => "describing",
            RunStage::CorrectingColor => "correcting_color",
            RunStage::Resizing => "resizing",
            RunStage::Delivering => "delivering",
            RunStage::Done => "done",
            RunStage::Failed => "failed",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failure kind per stage boundary. Collaborator errors are converted
/// into exactly one of these at the boundary where they occur; the
/// orchestrator only ever matches on kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageError {
    InvalidAttachment { pretty_type: String },
    MissingAttachment,
    Fetch { cause: String },
    Description { cause: String },
    Correction { cause: String },
    Resize { cause: String },
    Delivery { cause: String },
}

impl StageError {
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::InvalidAttachment { .. } => "invalid_attachment",
            StageError::MissingAttachment => "missing_attachment",
            StageError::Fetch { .. } => "fetch_error",
            StageError::Description { .. } => "description_error",
            StageError::Correction { .. } => "correction_error",
            StageError::Resize { .. } => "resize_error",
            StageError::Delivery { .. } => "delivery_error",
        }
    }

    /// Expected user outcomes, as opposed to operator-visible failures.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            StageError::InvalidAttachment { .. } | StageError::MissingAttachment
        )
    }

    /// The thread reply this failure owes the user, if any. Correction,
    /// resize, and delivery failures stay silent after the processing
    /// notice; description failures only degrade the caption.
    pub fn user_reply(&self) -> Option<&'static str> {
        match self {
            StageError::InvalidAttachment { .. } => Some(INVALID_ATTACHMENT_REPLY),
            StageError::MissingAttachment => Some(MISSING_ATTACHMENT_REPLY),
            StageError::Fetch { .. } => Some(FETCH_ERROR_REPLY),
            StageError::Description { .. }
            | StageError::Correction { .. }
            | StageError::Resize { .. }
            | StageError::Delivery { .. } => None,
        }
    }

    pub fn cause(&self) -> Option<&str> {
        match self {
            StageError::InvalidAttachment { .. } | StageError::MissingAttachment => None,
            StageError::Fetch { cause }
            | StageError::Description { cause }
            | StageError::Correction { cause }
            | StageError::Resize { cause }
            | StageError::Delivery { cause } => Some(cause.as_str()),
        }
    }
}

impl fmt::Display for StageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageError::InvalidAttachment { pretty_type } => {
                write!(f, "attachment type '{pretty_type}' is not a supported image")
            }
            StageError::MissingAttachment => write!(f, "message has no attachment"),
            StageError::Fetch { cause } => write!(f, "image fetch failed: {cause}"),
            StageError::Description { cause } => write!(f, "description failed: {cause}"),
            StageError::Correction { cause } => write!(f, "color correction failed: {cause}"),
            StageError::Resize { cause } => write!(f, "resize failed: {cause}"),
            StageError::Delivery { cause } => write!(f, "delivery failed: {cause}"),
        }
    }
}

impl std::error::Error for StageError {}

/// Total result of one pipeline run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub run_id: String,
    pub stage: RunStage,
    pub delivered: bool,
    pub error: Option<StageError>,
}

impl RunOutcome {
    pub fn delivered(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            stage: RunStage::Done,
            delivered: true,
            error: None,
        }
    }

    pub fn failed(run_id: impl Into<String>, error: StageError) -> Self {
        Self {
            run_id: run_id.into(),
            stage: RunStage::Failed,
            delivered: false,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.delivered && self.error.is_none()
    }

    pub fn label(&self) -> &'static str {
        match &self.error {
            None => "delivered",
            Some(error) => error.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{RunOutcome, RunStage, StageError};

    #[test]
    fn expected_outcomes_carry_user_replies() {
        let invalid = StageError::InvalidAttachment {
            pretty_type: "GIF".to_string(),
        };
        assert!(invalid.is_expected());
        assert!(invalid.user_reply().is_some());
        assert!(StageError::MissingAttachment.is_expected());
        assert!(StageError::MissingAttachment.user_reply().is_some());
    }

    #[test]
    fn fetch_errors_reply_generically_and_keep_cause_for_the_log() {
        let error = StageError::Fetch {
            cause: "public url resolution failed".to_string(),
        };
        assert!(!error.is_expected());
        assert_eq!(error.user_reply(), Some(super::FETCH_ERROR_REPLY));
        assert_eq!(error.cause(), Some("public url resolution failed"));
    }

    #[test]
    fn post_processing_failures_stay_silent() {
        for error in [
            StageError::Description {
                cause: "timeout".to_string(),
            },
            StageError::Correction {
                cause: "decode".to_string(),
            },
            StageError::Resize {
                cause: "empty".to_string(),
            },
            StageError::Delivery {
                cause: "upload".to_string(),
            },
        ] {
            assert!(error.user_reply().is_none(), "{} should be silent", error);
        }
    }

    #[test]
    fn outcome_constructors_set_terminal_stage() {
        let ok = RunOutcome::delivered("run-1");
        assert!(ok.is_success());
        assert_eq!(ok.stage, RunStage::Done);
        assert_eq!(ok.label(), "delivered");

        let failed = RunOutcome::failed("run-2", StageError::MissingAttachment);
        assert!(!failed.is_success());
        assert_eq!(failed.stage, RunStage::Failed);
        assert_eq!(failed.label(), "missing_attachment");
    }
}
