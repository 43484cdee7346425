use thiserror::Error;

/// Engine error taxonomy. Edges map these onto gRPC status codes and HTTP
/// responses; the engine itself never panics on caller input.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Caller fault: malformed entity, unknown controller, bad filter.
    #[error("invalid argument: {0}")]
    Validation(String),

    /// The policy gate refused the action.
    #[error("permission denied: {action} {entity}")]
    PolicyDenied { action: &'static str, entity: String },

    /// Requested id is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// A subscriber fell too far behind and was disconnected.
    #[error("subscriber overrun, reconnect for a fresh replay")]
    Exhausted,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<WorldError> for tonic::Status {
    fn from(err: WorldError) -> Self {
        match err {
            WorldError::Validation(msg) => tonic::Status::invalid_argument(msg),
            WorldError::PolicyDenied { .. } => tonic::Status::permission_denied(err.to_string()),
            WorldError::NotFound(id) => tonic::Status::not_found(id),
            WorldError::Exhausted => tonic::Status::resource_exhausted(err.to_string()),
            WorldError::Internal(e) => tonic::Status::internal(e.to_string()),
        }
    }
}
