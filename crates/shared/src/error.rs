use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One step of a deal settlement. Named so a partial failure can report
/// exactly where the money stopped moving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStep {
    DebitAdvertiser,
    CreditContentMaker,
    RefundAdvertiser,
    UpdateStatus,
    Announce,
}

impl fmt::Display for SettlementStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SettlementStep::DebitAdvertiser => "debit advertiser balance",
            SettlementStep::CreditContentMaker => "credit content-maker balance",
            SettlementStep::RefundAdvertiser => "refund advertiser balance",
            SettlementStep::UpdateStatus => "update deal status",
            SettlementStep::Announce => "announce system message",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    /// Invalid credentials, expired refresh token, or deleted account.
    /// Terminal for the session; the caller must force a logout.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Hub handshake or transport failure. Recoverable via automatic
    /// reconnection or a manual retry.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Operation attempted while the hub channel is not connected.
    #[error("not connected to the chat hub")]
    NotConnected,

    /// Rejected before any network call.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Non-2xx REST response; `message` is the server-supplied text when
    /// one could be parsed.
    #[error("server error (HTTP {status}): {message}")]
    Server { status: u16, message: String },

    /// Local persistence failed underneath the client (sqlite unavailable,
    /// corrupt session blob). Not a backend fault.
    #[error("client storage failure: {0}")]
    Storage(String),

    /// A settlement step failed after an earlier step already moved funds
    /// or state. Financial state is out of sync and needs manual
    /// reconciliation; callers must not collapse this into a generic error.
    #[error("{operation} partially failed: '{failed}' failed after '{completed}': {message}")]
    PartialFailure {
        operation: &'static str,
        completed: SettlementStep,
        failed: SettlementStep,
        message: String,
    },
}

impl ClientError {
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        ClientError::Server {
            status,
            message: message.into(),
        }
    }

    pub fn is_partial_failure(&self) -> bool {
        matches!(self, ClientError::PartialFailure { .. })
    }
}
