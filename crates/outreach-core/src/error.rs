use thiserror::Error;

use crate::template::RenderError;

#[derive(Debug, Error)]
pub enum OutreachError {
    #[error("not initialized: run 'outreach init'")]
    NotInitialized,

    #[error("campaign not found: {0}")]
    CampaignNotFound(String),

    #[error("sender not found: {0}")]
    SenderNotFound(String),

    #[error("sender already exists: {0}")]
    SenderExists(String),

    #[error("invalid sender id '{0}': use letters, digits, '+', '_', '.' or '-'")]
    InvalidSenderId(String),

    #[error("recipient {recipient} is already enrolled in campaign {campaign}")]
    AlreadyEnrolled { campaign: String, recipient: String },

    #[error("recipient {0} has opted out")]
    OptedOut(String),

    #[error("enrollment not found: {campaign}/{recipient}")]
    EnrollmentNotFound { campaign: String, recipient: String },

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    /// Rejected campaign definition or enrollment. Raised at creation time,
    /// never while dispatching.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Render(#[from] RenderError),

    #[error("store error: {0}")]
    Store(String),

    #[error("budget actor for sender '{0}' is gone")]
    BudgetActorClosed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, OutreachError>;
