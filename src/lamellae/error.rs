#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// the endpoint of the given core has gone away
    Disconnected(usize),
    /// the given core does not exist
    NoSuchCore(usize),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            TransportError::Disconnected(core) => {
                write!(f, "transport endpoint of core {} is disconnected", core)
            }
            TransportError::NoSuchCore(core) => {
                write!(f, "core {} is not part of this job", core)
            }
        }
    }
}

impl std::error::Error for TransportError {}

pub type TransportResult<T> = Result<T, TransportError>;
