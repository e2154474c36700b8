//! Shared error taxonomy used across all three reconcilers.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("invalid user input: {0}")]
    UserInput(String),

    #[error("json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("finalizer error: {0}")]
    Finalizer(Box<kube::runtime::finalizer::Error<Error>>),

    #[error("API-surface tracker has not completed its first discovery poll yet")]
    NotStarted,
}

impl From<kube::runtime::finalizer::Error<Error>> for Error {
    fn from(e: kube::runtime::finalizer::Error<Error>) -> Self {
        Error::Finalizer(Box::new(e))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// A conservative classification used only for metrics labeling; the
    /// reconcilers themselves decide transient-vs-permanent explicitly at
    /// the call site because that decision depends on which step failed,
    /// not just which error type surfaced.
    pub fn metric_label(&self) -> String {
        match self {
            Error::Kube { .. } => "kube".to_string(),
            Error::UserInput(_) => "user_input".to_string(),
            Error::Json { .. } => "json".to_string(),
            Error::Finalizer(_) => "finalizer".to_string(),
            Error::NotStarted => "not_started".to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 404
        )
    }
}
