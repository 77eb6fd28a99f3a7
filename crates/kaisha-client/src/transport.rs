//! The seam between the session and whatever carries requests to the server.
//!
//! A transport provides the query/mutation channel (request-response) and the
//! push channel (a broadcast of [`PushEvent`]s). How either is physically
//! opened is the transport's business; the session only needs this trait.

use async_trait::async_trait;
use kaisha_cache::FailureReason;
use kaisha_types::{Company, CompanyId, PushEvent};
use tokio::sync::broadcast;

/// Errors a transport can report for a single request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The round trip never completed.
    #[error("server unreachable: {0}")]
    Unreachable(String),
    /// The server has no such company.
    #[error("company {0} not found on server")]
    NotFound(CompanyId),
    /// The server refused the request.
    #[error("server rejected request: {0}")]
    Rejected(String),
}

impl TransportError {
    /// How the ledger should record this error.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            TransportError::Unreachable(msg) => FailureReason::Transport(msg.clone()),
            TransportError::NotFound(_) | TransportError::Rejected(_) => {
                FailureReason::Conflict(self.to_string())
            }
        }
    }
}

/// Query, mutation, and subscription operations of the company service.
#[async_trait]
pub trait CompanyTransport: Send + Sync + 'static {
    /// `companies` query: the full collection, in server order.
    async fn fetch_all(&self) -> Result<Vec<Company>, TransportError>;

    /// `addCompany` mutation. Returns the entity with its server-assigned id.
    async fn add_company(&self, name: &str) -> Result<Company, TransportError>;

    /// `changeCompanyName` mutation.
    async fn change_company_name(
        &self,
        id: CompanyId,
        name: &str,
    ) -> Result<Company, TransportError>;

    /// `deleteCompany` mutation.
    async fn delete_company(&self, id: CompanyId) -> Result<(), TransportError>;

    /// Open the push channel (`companyAdded`, `companyNameChanged`).
    ///
    /// Events sent before this call are not replayed.
    fn subscribe(&self) -> broadcast::Receiver<PushEvent>;
}
