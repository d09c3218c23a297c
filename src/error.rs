//! The closed set of check errors surfaced in per-project check status and in
//! HTTP error bodies.

use thiserror::Error;

/// Everything that can go wrong while admitting a project, verifying a pledge
/// or assembling a claim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CheckError {
    #[error("malformed project or unrecognized network: {0}")]
    BadProject(String),
    #[error("malformed pledge: {0}")]
    BadPledgeShape(String),
    #[error("pledge is below the project minimum")]
    PledgeTooSmall,
    #[error("accepting this pledge would push the total above the goal")]
    GoalExceeded,
    #[error("pledge input collides with an already-known pledge")]
    DuplicatedOutpoint,
    #[error("a pledged input is not an unspent output by peer consensus")]
    OutputsUnspendable,
    #[error("peers disagree about the pledged outputs")]
    InconsistentUtxoAnswers,
    #[error("pledge signature does not satisfy the spent output's script")]
    ScriptFailed(String),
    #[error("network call exceeded its time budget")]
    Timeout,
    #[error("no peer available")]
    Offline,
    #[error("claim transaction did not propagate to enough peers")]
    ClaimBroadcastFailed,
    #[error("claim inputs differ from the goal by {0} satoshis")]
    ValueMismatch(i64),
    #[error("authentication signature invalid")]
    Unauthorized,
    #[error("pledge conflicts with an already-recorded one")]
    Conflict,
}

impl CheckError {
    /// Transient failures recover by retry on the next block tip change or an
    /// explicit refresh; terminal ones reject the pledge outright.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CheckError::Timeout | CheckError::Offline | CheckError::InconsistentUtxoAnswers
        )
    }

    /// Stable machine-readable kind, used in HTTP error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            CheckError::BadProject(_) => "BadProject",
            CheckError::BadPledgeShape(_) => "BadPledgeShape",
            CheckError::PledgeTooSmall => "PledgeTooSmall",
            CheckError::GoalExceeded => "GoalExceeded",
            CheckError::DuplicatedOutpoint => "DuplicatedOutpoint",
            CheckError::OutputsUnspendable => "OutputsUnspendable",
            CheckError::InconsistentUtxoAnswers => "InconsistentUTXOAnswers",
            CheckError::ScriptFailed(_) => "ScriptFailed",
            CheckError::Timeout => "Timeout",
            CheckError::Offline => "Offline",
            CheckError::ClaimBroadcastFailed => "ClaimBroadcastFailed",
            CheckError::ValueMismatch(_) => "ValueMismatch",
            CheckError::Unauthorized => "Unauthorized",
            CheckError::Conflict => "Conflict",
        }
    }
}
