use crate::config;

use enum_dispatch::enum_dispatch;
use std::time::Duration;

pub(crate) mod error;
pub use error::{TransportError, TransportResult};

pub(crate) mod local_lamellae;
use local_lamellae::Local;

/// The list of available lamellae backends, used to specify how aggregated buffers are moved between cores
#[derive(
    serde::Serialize, serde::Deserialize, Debug, PartialEq, Eq, Ord, PartialOrd, Hash, Clone, Copy,
)]
pub enum Backend {
    /// The Local backend -- every core is a thread of the calling process
    Local,
}

impl Default for Backend {
    fn default() -> Self {
        match config().backend.as_str() {
            "local" => Backend::Local,
            other => {
                tracing::warn!("unknown lamellae backend {:?}, falling back to local", other);
                Backend::Local
            }
        }
    }
}

#[enum_dispatch(LamellaeComm, LamellaeAM)]
#[derive(Debug)]
pub(crate) enum Lamellae {
    Local,
}

#[enum_dispatch]
pub(crate) trait LamellaeComm: LamellaeAM {
    fn my_core(&self) -> usize;
    fn num_cores(&self) -> usize;
    fn backend(&self) -> Backend;
    #[allow(non_snake_case)]
    fn MB_sent(&self) -> f64;
}

/// Point to point delivery of opaque byte buffers.
///
/// Buffers from one core to another arrive in the order they were sent, each one intact.
#[enum_dispatch]
pub(crate) trait LamellaeAM {
    fn send_to_core(&self, core: usize, data: Vec<u8>) -> TransportResult<()>;
    fn try_recv(&self) -> TransportResult<Option<Vec<u8>>>;
    /// Block the calling thread for at most `timeout` waiting for a buffer
    fn recv_timeout(&self, timeout: Duration) -> TransportResult<Option<Vec<u8>>>;
}

/// Create one lamellae endpoint per core, index `i` belongs to core `i`
pub(crate) fn create_lamellae(backend: Backend, num_cores: usize) -> Vec<Lamellae> {
    match backend {
        Backend::Local => local_lamellae::create_local_lamellae(num_cores)
            .into_iter()
            .map(Lamellae::Local)
            .collect(),
    }
}
