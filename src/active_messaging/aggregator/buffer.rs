use super::{AggregatorGenericCallHeader, HEADER_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BufferState {
    Empty,
    Filling,
    Flushing,
}

/// Bytes taken out of a buffer by a flush
#[derive(Debug)]
pub(crate) struct FlushedBuffer {
    pub(crate) data: Vec<u8>,
    pub(crate) records: usize,
    pub(crate) oldest: u64,
    pub(crate) newest: u64,
    pub(crate) generation: u64,
}

/// Outgoing records for one destination core, packed back to back
#[derive(Debug)]
pub(crate) struct AggregatorBuffer {
    data: Vec<u8>,
    records: usize,
    oldest: u64,
    newest: u64,
    state: BufferState,
    generation: u64,
}

impl AggregatorBuffer {
    pub(crate) fn new(capacity: usize) -> AggregatorBuffer {
        AggregatorBuffer {
            data: Vec::with_capacity(capacity),
            records: 0,
            oldest: 0,
            newest: 0,
            state: BufferState::Empty,
            generation: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.records == 0
    }

    pub(crate) fn records(&self) -> usize {
        self.records
    }

    pub(crate) fn state(&self) -> BufferState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// tick at which the oldest unflushed record was inserted
    #[cfg(test)]
    pub(crate) fn oldest(&self) -> Option<u64> {
        if self.is_empty() {
            None
        } else {
            Some(self.oldest)
        }
    }

    /// Can a record of `record_len` bytes be appended without passing `target_size`.
    ///
    /// An empty buffer accepts anything, so an oversized record travels alone.
    pub(crate) fn fits(&self, record_len: usize, target_size: usize) -> bool {
        self.is_empty() || self.data.len() + record_len <= target_size
    }

    pub(crate) fn insert(
        &mut self,
        header: &AggregatorGenericCallHeader,
        args: &[u8],
        payload: &[u8],
        now: u64,
    ) -> Result<(), anyhow::Error> {
        debug_assert_ne!(self.state, BufferState::Flushing);
        let start = self.data.len();
        if let Err(e) = crate::serialize_into(&mut self.data, header) {
            self.data.truncate(start);
            return Err(e);
        }
        debug_assert_eq!(self.data.len() - start, *HEADER_LEN);
        self.data.extend_from_slice(args);
        self.data.extend_from_slice(payload);
        if self.records == 0 {
            self.oldest = now;
        }
        self.newest = now;
        self.records += 1;
        self.state = BufferState::Filling;
        Ok(())
    }

    /// Take the packed records out, the buffer keeps its allocation for the next generation
    pub(crate) fn begin_flush(&mut self) -> FlushedBuffer {
        self.state = BufferState::Flushing;
        let flushed = FlushedBuffer {
            data: self.data.to_vec(),
            records: self.records,
            oldest: self.oldest,
            newest: self.newest,
            generation: self.generation,
        };
        self.data.clear();
        self.records = 0;
        flushed
    }

    pub(crate) fn finish_flush(&mut self) {
        debug_assert_eq!(self.state, BufferState::Flushing);
        self.state = BufferState::Empty;
        self.generation += 1;
    }
}
