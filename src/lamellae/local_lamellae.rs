use super::{Backend, LamellaeAM, LamellaeComm, TransportError, TransportResult};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// every endpoint holds a clone of every channel end, so no channel disconnects
// until the last core of the job has dropped its endpoint
struct LocalFabric {
    senders: Vec<Sender<Vec<u8>>>,
    receivers: Vec<Receiver<Vec<u8>>>,
}

pub(crate) struct Local {
    my_core: usize,
    fabric: Arc<LocalFabric>,
    sent: AtomicUsize,
}

impl std::fmt::Debug for Local {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Local[{}/{}]", self.my_core, self.fabric.senders.len())
    }
}

pub(crate) fn create_local_lamellae(num_cores: usize) -> Vec<Local> {
    let (senders, receivers): (Vec<_>, Vec<_>) = (0..num_cores).map(|_| unbounded()).unzip();
    let fabric = Arc::new(LocalFabric { senders, receivers });
    (0..num_cores)
        .map(|my_core| Local {
            my_core,
            fabric: fabric.clone(),
            sent: AtomicUsize::new(0),
        })
        .collect()
}

impl Local {
    fn receiver(&self) -> &Receiver<Vec<u8>> {
        &self.fabric.receivers[self.my_core]
    }
}

impl LamellaeComm for Local {
    fn my_core(&self) -> usize {
        self.my_core
    }
    fn num_cores(&self) -> usize {
        self.fabric.senders.len()
    }
    fn backend(&self) -> Backend {
        Backend::Local
    }
    #[allow(non_snake_case)]
    fn MB_sent(&self) -> f64 {
        self.sent.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }
}

impl LamellaeAM for Local {
    fn send_to_core(&self, core: usize, data: Vec<u8>) -> TransportResult<()> {
        let sender = self
            .fabric
            .senders
            .get(core)
            .ok_or(TransportError::NoSuchCore(core))?;
        let len = data.len();
        sender
            .send(data)
            .map_err(|_| TransportError::Disconnected(core))?;
        self.sent.fetch_add(len, Ordering::Relaxed);
        Ok(())
    }

    fn try_recv(&self) -> TransportResult<Option<Vec<u8>>> {
        match self.receiver().try_recv() {
            Ok(data) => Ok(Some(data)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(TransportError::Disconnected(self.my_core)),
        }
    }

    fn recv_timeout(&self, timeout: Duration) -> TransportResult<Option<Vec<u8>>> {
        match self.receiver().recv_timeout(timeout) {
            Ok(data) => Ok(Some(data)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::Disconnected(self.my_core)),
        }
    }
}
