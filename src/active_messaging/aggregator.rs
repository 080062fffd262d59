//! Per-destination batching of active messages.
//!
//! Every core owns one [Aggregator] with one outgoing buffer per core of the job. Records are
//! appended to the buffer of their destination (or of the core configured to forward for it) and
//! the whole buffer is handed to the transport as a single message when
//! - the next record would push it past `target_size`, or a record alone reaches it,
//! - someone asks for it with [flush][Aggregator::flush] or [flush_all][Aggregator::flush_all],
//! - its oldest record has waited longer than `autoflush_ticks` (checked by [poll][Aggregator::poll]),
//! - the core has nothing else to run and `flush_on_idle` is set.
//!
//! Records to the same destination are delivered in the order they were sent.
use super::{registered_handler, Envelope, HandlerId};
use crate::config;
use crate::lamellae::{Lamellae, LamellaeAM, LamellaeComm};
use crate::lamellar_core::Core;
use crate::stats::{AggregatorStats, FlushKind};

use std::cell::{Cell, RefCell};
use std::collections::{BTreeSet, VecDeque};
use std::time::{Duration, Instant};

mod buffer;
use buffer::{AggregatorBuffer, BufferState};

/// Tunables of an [Aggregator], defaults come from the `LAMELLAR_*` environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorConfig {
    /// ticks (microseconds) a record may wait before a poll flushes its buffer
    pub autoflush_ticks: u64,
    /// bytes a buffer may hold before it is flushed
    pub target_size: usize,
    /// timed out buffers flushed per poll, 0 for no limit
    pub max_flush_per_poll: usize,
    pub aggregation_enabled: bool,
    pub flush_on_idle: bool,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        let config = config();
        AggregatorConfig {
            autoflush_ticks: config.aggregator_autoflush_ticks,
            target_size: config.aggregator_target_size,
            max_flush_per_poll: config.aggregator_max_flush,
            aggregation_enabled: config.aggregator_enable,
            flush_on_idle: config.flush_on_idle,
        }
    }
}

/// Header preceding every record of an aggregated buffer
#[derive(serde::Serialize, serde::Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
pub(crate) struct AggregatorGenericCallHeader {
    pub(crate) destination: u32,
    pub(crate) source: u32,
    pub(crate) handler_id: HandlerId,
    pub(crate) args_size: u32,
    pub(crate) payload_size: u32,
    pub(crate) tag: u64,
}

lazy_static! {
    pub(crate) static ref HEADER_LEN: usize =
        match crate::serialized_size(&AggregatorGenericCallHeader::default()) {
            Ok(len) => len,
            Err(e) => fatal!("unable to size the aggregator record header: {}", e),
        };
}

/// Length of a record section as carried in its header
fn wire_len(len: usize, what: &str) -> u32 {
    match u32::try_from(len) {
        Ok(len) => len,
        Err(_) => fatal!("{} of {} bytes do not fit in a record header", what, len),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// fewer bytes remain than the header needs
    TruncatedHeader { offset: usize, len: usize },
    /// the header announces more bytes than the buffer holds
    TruncatedBody {
        offset: usize,
        needed: usize,
        len: usize,
    },
    Malformed(String),
}

impl std::fmt::Display for WireError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            WireError::TruncatedHeader { offset, len } => write!(
                f,
                "record header at offset {} runs past the end of a {} byte buffer",
                offset, len
            ),
            WireError::TruncatedBody {
                offset,
                needed,
                len,
            } => write!(
                f,
                "record at offset {} needs {} bytes but the buffer holds {}",
                offset, needed, len
            ),
            WireError::Malformed(e) => write!(f, "malformed record header: {}", e),
        }
    }
}

impl std::error::Error for WireError {}

/// One record of a received buffer
#[derive(Debug)]
pub(crate) struct Record<'a> {
    pub(crate) header: AggregatorGenericCallHeader,
    pub(crate) args: &'a [u8],
    pub(crate) payload: &'a [u8],
}

/// Walk the records packed into `data`
pub(crate) fn decode_records(data: &[u8]) -> RecordIter<'_> {
    RecordIter { data, offset: 0 }
}

pub(crate) struct RecordIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = Result<Record<'a>, WireError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }
        let offset = self.offset;
        let len = self.data.len();
        let body_start = offset + *HEADER_LEN;
        if body_start > len {
            self.offset = len;
            return Some(Err(WireError::TruncatedHeader { offset, len }));
        }
        let header: AggregatorGenericCallHeader =
            match crate::deserialize(&self.data[offset..body_start]) {
                Ok(header) => header,
                Err(e) => {
                    self.offset = len;
                    return Some(Err(WireError::Malformed(e.to_string())));
                }
            };
        let args_end = body_start + header.args_size as usize;
        let end = args_end + header.payload_size as usize;
        if end > len {
            self.offset = len;
            return Some(Err(WireError::TruncatedBody {
                offset,
                needed: end - offset,
                len,
            }));
        }
        self.offset = end;
        Some(Ok(Record {
            header,
            args: &self.data[body_start..args_end],
            payload: &self.data[args_end..end],
        }))
    }
}

/// A buffer delivered by the transport, waiting to be deaggregated
#[derive(Debug)]
pub(crate) struct ReceivedAM {
    pub(crate) data: Vec<u8>,
}

impl ReceivedAM {
    pub(crate) fn size(&self) -> usize {
        self.data.len()
    }
}

pub struct Aggregator {
    my_core: usize,
    num_cores: usize,
    config: AggregatorConfig,
    lamellae: Lamellae,
    buffers: Vec<RefCell<AggregatorBuffer>>,
    route_map: RefCell<Vec<usize>>,
    // set once a record for the destination went out through another core, cleared by a barrier
    route_in_use: Vec<Cell<bool>>,
    // (tick of oldest record, buffer index) for every non-empty buffer
    least_recently_sent: RefCell<BTreeSet<(u64, usize)>>,
    inbox: RefCell<VecDeque<ReceivedAM>>,
    stats: RefCell<AggregatorStats>,
    counted_sent: Cell<u64>,
    counted_delivered: Cell<u64>,
    epoch: Instant,
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Aggregator[core {}/{}, {} pending buffers]",
            self.my_core,
            self.num_cores,
            self.least_recently_sent.borrow().len()
        )
    }
}

impl Aggregator {
    pub(crate) fn new(lamellae: Lamellae, config: AggregatorConfig) -> Aggregator {
        let my_core = lamellae.my_core();
        let num_cores = lamellae.num_cores();
        let capacity = config.target_size + *HEADER_LEN;
        Aggregator {
            my_core,
            num_cores,
            buffers: (0..num_cores)
                .map(|_| RefCell::new(AggregatorBuffer::new(capacity)))
                .collect(),
            route_map: RefCell::new((0..num_cores).collect()),
            route_in_use: (0..num_cores).map(|_| Cell::new(false)).collect(),
            least_recently_sent: RefCell::new(BTreeSet::new()),
            inbox: RefCell::new(VecDeque::new()),
            stats: RefCell::new(AggregatorStats::default()),
            counted_sent: Cell::new(0),
            counted_delivered: Cell::new(0),
            epoch: Instant::now(),
            config,
            lamellae,
        }
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }

    /// Microseconds since this aggregator was created
    pub fn ticks(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    pub fn stats(&self) -> AggregatorStats {
        self.stats.borrow().clone()
    }

    #[allow(non_snake_case)]
    pub fn MB_sent(&self) -> f64 {
        self.lamellae.MB_sent()
    }

    /// Bytes waiting in the buffer of `core`
    pub fn pending_bytes(&self, core: usize) -> usize {
        self.check_core(core);
        self.buffers[core].borrow().len()
    }

    /// Records waiting in the buffer of `core`
    pub fn pending_records(&self, core: usize) -> usize {
        self.check_core(core);
        self.buffers[core].borrow().records()
    }

    /// The core whose buffer carries records addressed to `dst`
    pub fn route(&self, dst: usize) -> usize {
        self.check_core(dst);
        self.route_map.borrow()[dst]
    }

    /// Send records for `dst` through `via`, which forwards them on arrival.
    ///
    /// A route may be changed as long as no record for `dst` has gone out through the current
    /// one since the last barrier, otherwise records sent over the new route could overtake
    /// them and this is fatal. Records still buffered for the old route are flushed first.
    pub fn set_route(&self, dst: usize, via: usize) {
        self.check_core(dst);
        self.check_core(via);
        let old = self.route(dst);
        if old == via {
            return;
        }
        if self.route_in_use[dst].get() {
            fatal!(
                "core {} cannot route records for {} via {}, records already went out via {} since the last barrier",
                self.my_core,
                dst,
                via,
                old
            );
        }
        self.flush_buffer(old, FlushKind::Requested);
        tracing::debug!("core {} routing records for {} via {}", self.my_core, dst, via);
        self.route_map.borrow_mut()[dst] = via;
    }

    /// Every record sent before has been delivered, routes may change again
    pub(crate) fn quiesced(&self) {
        for in_use in &self.route_in_use {
            in_use.set(false);
        }
    }

    /// (sent, delivered) counts of counted handlers, used for quiescence detection
    pub(crate) fn counted_messages(&self) -> (u64, u64) {
        (self.counted_sent.get(), self.counted_delivered.get())
    }

    fn check_core(&self, core: usize) {
        if core >= self.num_cores {
            fatal!(
                "core {} is out of range for a job of {} cores",
                core,
                self.num_cores
            );
        }
    }

    /// Append one record for `dst`, or run it right away if `dst` is this core.
    #[tracing::instrument(skip_all, level = "trace")]
    pub(crate) fn send_tagged(
        &self,
        core: &Core,
        dst: usize,
        handler_id: HandlerId,
        tag: u64,
        args: &[u8],
        payload: &[u8],
    ) {
        self.check_core(dst);
        let handler = match registered_handler(handler_id) {
            Some(handler) => handler,
            None => fatal!("send with unknown handler id {}", handler_id),
        };
        if handler.counted {
            self.counted_sent.set(self.counted_sent.get() + 1);
        }
        let header = AggregatorGenericCallHeader {
            destination: dst as u32,
            source: self.my_core as u32,
            handler_id,
            args_size: wire_len(args.len(), "arguments"),
            payload_size: wire_len(payload.len(), "payload"),
            tag,
        };
        if dst == self.my_core {
            self.stats.borrow_mut().loopback_messages += 1;
            self.dispatch(core, &header, args, payload);
            return;
        }
        let target = self.route(dst);
        if target != dst {
            self.route_in_use[dst].set(true);
        }
        self.enqueue(target, &header, args, payload);
    }

    fn enqueue(
        &self,
        target: usize,
        header: &AggregatorGenericCallHeader,
        args: &[u8],
        payload: &[u8],
    ) {
        let record_len = *HEADER_LEN + args.len() + payload.len();
        if !self.config.aggregation_enabled {
            self.send_immediate(target, header, args, payload, record_len);
            return;
        }
        let fits = self.buffers[target]
            .borrow()
            .fits(record_len, self.config.target_size);
        if !fits {
            self.flush_buffer(target, FlushKind::Capacity);
        }
        let now = self.ticks();
        let (was_empty, len) = {
            let mut buf = self.buffers[target].borrow_mut();
            let was_empty = buf.is_empty();
            if let Err(e) = buf.insert(header, args, payload, now) {
                fatal!("failed to encode record for core {}: {}", target, e);
            }
            (was_empty, buf.len())
        };
        if was_empty {
            self.least_recently_sent.borrow_mut().insert((now, target));
        }
        {
            let mut stats = self.stats.borrow_mut();
            stats.messages_aggregated += 1;
            stats.bytes_aggregated += record_len as u64;
        }
        if len >= self.config.target_size {
            self.flush_buffer(target, FlushKind::Capacity);
        }
    }

    fn send_immediate(
        &self,
        target: usize,
        header: &AggregatorGenericCallHeader,
        args: &[u8],
        payload: &[u8],
        record_len: usize,
    ) {
        let mut data = Vec::with_capacity(record_len);
        if let Err(e) = crate::serialize_into(&mut data, header) {
            fatal!("failed to encode record for core {}: {}", target, e);
        }
        data.extend_from_slice(args);
        data.extend_from_slice(payload);
        {
            let mut stats = self.stats.borrow_mut();
            stats.immediate_sends += 1;
            stats.transport_sends += 1;
            stats.transport_bytes += record_len as u64;
            stats.aggregated_sizes.record(record_len as u64);
        }
        self.transport_send(target, data);
    }

    fn transport_send(&self, target: usize, data: Vec<u8>) {
        if let Err(e) = self.lamellae.send_to_core(target, data) {
            fatal!("core {} failed to send to core {}: {}", self.my_core, target, e);
        }
    }

    fn flush_buffer(&self, target: usize, kind: FlushKind) -> bool {
        let flushed = {
            let mut buf = self.buffers[target].borrow_mut();
            if buf.is_empty() {
                return false;
            }
            debug_assert_eq!(buf.state(), BufferState::Filling);
            buf.begin_flush()
        };
        self.least_recently_sent
            .borrow_mut()
            .remove(&(flushed.oldest, target));
        let now = self.ticks();
        self.stats.borrow_mut().record_flush(
            kind,
            flushed.data.len(),
            flushed.records,
            now.saturating_sub(flushed.oldest),
            now.saturating_sub(flushed.newest),
        );
        tracing::trace!(
            "core {} flushing {} records ({} bytes) to core {} [{:?}, generation {}]",
            self.my_core,
            flushed.records,
            flushed.data.len(),
            target,
            kind,
            flushed.generation
        );
        self.transport_send(target, flushed.data);
        self.buffers[target].borrow_mut().finish_flush();
        true
    }

    /// Hand the buffer carrying records for `dst` to the transport.
    ///
    /// Returns false if there was nothing to send.
    pub fn flush(&self, dst: usize) -> bool {
        let target = self.route(dst);
        self.flush_buffer(target, FlushKind::Requested)
    }

    /// Flush every non-empty buffer, returns how many were sent
    pub fn flush_all(&self) -> usize {
        let flushed = self.flush_every(FlushKind::All);
        if flushed > 0 {
            self.stats.borrow_mut().multi_flushes += 1;
        }
        flushed
    }

    fn flush_every(&self, kind: FlushKind) -> usize {
        let pending: Vec<usize> = self
            .least_recently_sent
            .borrow()
            .iter()
            .map(|(_, target)| *target)
            .collect();
        pending
            .into_iter()
            .filter(|target| self.flush_buffer(*target, kind))
            .count()
    }

    /// Flush everything when the core has run out of tasks, if `flush_on_idle` is set
    pub(crate) fn idle_flush_poll(&self) -> usize {
        if !self.config.flush_on_idle {
            return 0;
        }
        self.flush_every(FlushKind::Idle)
    }

    /// Flush buffers whose oldest record has waited at least `autoflush_ticks`,
    /// oldest first, at most `max_flush_per_poll` of them
    pub(crate) fn flush_timed_out(&self) -> usize {
        let now = self.ticks();
        let limit = match self.config.max_flush_per_poll {
            0 => usize::MAX,
            max => max,
        };
        let expired: Vec<usize> = self
            .least_recently_sent
            .borrow()
            .iter()
            .take_while(|(oldest, _)| now.saturating_sub(*oldest) >= self.config.autoflush_ticks)
            .take(limit)
            .map(|(_, target)| *target)
            .collect();
        expired
            .into_iter()
            .filter(|target| self.flush_buffer(*target, FlushKind::Timeout))
            .count()
    }

    /// Time until the oldest pending record times out, None if nothing is pending
    pub(crate) fn next_timeout(&self) -> Option<Duration> {
        let oldest = self.least_recently_sent.borrow().iter().next().map(|(t, _)| *t)?;
        let due = oldest + self.config.autoflush_ticks;
        Some(Duration::from_micros(due.saturating_sub(self.ticks())))
    }

    /// Transport receive callback
    pub(crate) fn on_receive(&self, data: Vec<u8>) {
        let am = ReceivedAM { data };
        tracing::trace!("core {} received {} bytes", self.my_core, am.size());
        self.stats.borrow_mut().buffers_received += 1;
        self.inbox.borrow_mut().push_back(am);
    }

    fn receive_pending(&self) -> usize {
        let mut received = 0;
        loop {
            match self.lamellae.try_recv() {
                Ok(Some(data)) => {
                    self.on_receive(data);
                    received += 1;
                }
                Ok(None) => return received,
                Err(e) => fatal!("core {} failed to receive: {}", self.my_core, e),
            }
        }
    }

    /// Block the thread for up to `timeout` waiting for one buffer from the transport
    pub(crate) fn wait_for_message(&self, timeout: Duration) -> bool {
        match self.lamellae.recv_timeout(timeout) {
            Ok(Some(data)) => {
                self.on_receive(data);
                true
            }
            Ok(None) => false,
            Err(e) => fatal!("core {} failed to receive: {}", self.my_core, e),
        }
    }

    /// One round of progress: drain the transport, flush timed out buffers, run received records.
    ///
    /// Returns the amount of work done, 0 means nothing happened.
    pub(crate) fn poll(&self, core: &Core) -> usize {
        let received = self.receive_pending();
        let flushed = self.flush_timed_out();
        let handled = self.deaggregate(core);
        received + flushed + handled
    }

    /// Run every record sitting in the inbox, forwarding those meant for other cores
    pub(crate) fn deaggregate(&self, core: &Core) -> usize {
        let mut handled = 0;
        loop {
            // handlers may send, so nothing stays borrowed while they run
            let am = match self.inbox.borrow_mut().pop_front() {
                Some(am) => am,
                None => return handled,
            };
            for record in decode_records(&am.data) {
                let record = match record {
                    Ok(record) => record,
                    Err(e) => fatal!("core {} received a corrupt buffer: {}", self.my_core, e),
                };
                let len = *HEADER_LEN + record.args.len() + record.payload.len();
                let dst = record.header.destination as usize;
                if dst == self.my_core {
                    {
                        let mut stats = self.stats.borrow_mut();
                        stats.messages_deaggregated += 1;
                        stats.bytes_deaggregated += len as u64;
                    }
                    self.dispatch(core, &record.header, record.args, record.payload);
                } else {
                    self.check_core(dst);
                    {
                        let mut stats = self.stats.borrow_mut();
                        stats.messages_forwarded += 1;
                        stats.bytes_forwarded += len as u64;
                    }
                    // single hop, straight to the destination's own buffer
                    self.enqueue(dst, &record.header, record.args, record.payload);
                }
                handled += 1;
            }
        }
    }

    fn dispatch(
        &self,
        core: &Core,
        header: &AggregatorGenericCallHeader,
        args: &[u8],
        payload: &[u8],
    ) {
        let handler = match registered_handler(header.handler_id) {
            Some(handler) => handler,
            None => fatal!(
                "core {} received a record for unknown handler id {} from core {}",
                self.my_core,
                header.handler_id,
                header.source
            ),
        };
        if handler.counted {
            self.counted_delivered.set(self.counted_delivered.get() + 1);
        }
        (handler.exec)(
            core,
            Envelope {
                source: header.source as usize,
                tag: header.tag,
                args,
                payload,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(dst: u32, args: &[u8], payload: &[u8]) -> Vec<u8> {
        let header = AggregatorGenericCallHeader {
            destination: dst,
            source: 0,
            handler_id: 3,
            args_size: args.len() as u32,
            payload_size: payload.len() as u32,
            tag: 42,
        };
        let mut data = crate::serialize(&header).unwrap();
        data.extend_from_slice(args);
        data.extend_from_slice(payload);
        data
    }

    fn test_config() -> AggregatorConfig {
        AggregatorConfig {
            autoflush_ticks: 60_000_000,
            target_size: 1 << 16,
            max_flush_per_poll: 0,
            aggregation_enabled: true,
            flush_on_idle: false,
        }
    }

    /// An aggregator for core 0, the other endpoints are kept alive next to it
    fn core_zero(num_cores: usize, config: AggregatorConfig) -> (Aggregator, Vec<Lamellae>) {
        let mut lamellaes = crate::lamellae::create_lamellae(crate::Backend::Local, num_cores);
        let aggregator = Aggregator::new(lamellaes.remove(0), config);
        (aggregator, lamellaes)
    }

    fn buffer_one(aggregator: &Aggregator, target: usize) {
        let header = AggregatorGenericCallHeader {
            destination: target as u32,
            source: 0,
            handler_id: 3,
            args_size: 1,
            payload_size: 0,
            tag: 0,
        };
        aggregator.enqueue(target, &header, &[7], &[]);
    }

    #[test]
    fn timed_out_buffers_are_flushed_oldest_first() {
        let config = AggregatorConfig {
            autoflush_ticks: 1,
            max_flush_per_poll: 1,
            ..test_config()
        };
        let (aggregator, _others) = core_zero(4, config);
        for target in [3, 1, 2] {
            buffer_one(&aggregator, target);
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(aggregator.flush_timed_out(), 1);
        assert_eq!(aggregator.pending_records(3), 0);
        assert_eq!(aggregator.pending_records(1), 1);
        assert_eq!(aggregator.pending_records(2), 1);
        assert_eq!(aggregator.flush_timed_out(), 1);
        assert_eq!(aggregator.pending_records(1), 0);
        assert_eq!(aggregator.pending_records(2), 1);
        assert_eq!(aggregator.stats().timeout_flushes, 2);
    }

    #[test]
    fn no_limit_flushes_every_timed_out_buffer() {
        let config = AggregatorConfig {
            autoflush_ticks: 1,
            ..test_config()
        };
        let (aggregator, _others) = core_zero(4, config);
        for target in 1..4 {
            buffer_one(&aggregator, target);
        }
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(aggregator.flush_timed_out(), 3);
        assert!((1..4).all(|target| aggregator.pending_records(target) == 0));
    }

    #[test]
    fn idle_flushes_follow_the_config() {
        let (aggregator, _others) = core_zero(3, test_config());
        buffer_one(&aggregator, 1);
        assert_eq!(aggregator.idle_flush_poll(), 0);
        assert_eq!(aggregator.pending_records(1), 1);

        let config = AggregatorConfig {
            flush_on_idle: true,
            ..test_config()
        };
        let (aggregator, _others) = core_zero(3, config);
        buffer_one(&aggregator, 1);
        buffer_one(&aggregator, 2);
        assert_eq!(aggregator.idle_flush_poll(), 2);
        assert_eq!(aggregator.idle_flush_poll(), 0);
        let stats = aggregator.stats();
        assert_eq!(stats.idle_flushes, 2);
        assert_eq!(stats.timeout_flushes, 0);
    }

    #[test]
    fn flush_all_counts_only_when_something_is_sent() {
        let (aggregator, _others) = core_zero(2, test_config());
        assert_eq!(aggregator.flush_all(), 0);
        assert_eq!(aggregator.stats().multi_flushes, 0);
        buffer_one(&aggregator, 1);
        assert_eq!(aggregator.flush_all(), 1);
        assert_eq!(aggregator.flush_all(), 0);
        let stats = aggregator.stats();
        assert_eq!(stats.multi_flushes, 1);
        assert_eq!(stats.all_flushes, 1);
    }

    #[test]
    fn unused_routes_may_change() {
        let (aggregator, _others) = core_zero(3, test_config());
        aggregator.set_route(2, 1);
        assert_eq!(aggregator.route(2), 1);
        aggregator.set_route(2, 2);
        assert_eq!(aggregator.route(2), 2);
    }

    #[test]
    #[should_panic(expected = "do not fit in a record header")]
    fn oversized_sections_are_fatal() {
        wire_len(u32::MAX as usize + 1, "payload");
    }

    #[test]
    fn header_is_fixed_size() {
        assert_eq!(*HEADER_LEN, 5 * 4 + 8);
    }

    #[test]
    fn records_decode_in_order() {
        let mut data = record(1, &[1, 2], &[3]);
        data.extend(record(2, &[], &[4, 5, 6]));
        data.extend(record(1, &[7], &[]));
        let records: Vec<_> = decode_records(&data).map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].header.destination, 1);
        assert_eq!(records[0].args, &[1, 2]);
        assert_eq!(records[0].payload, &[3]);
        assert_eq!(records[1].payload, &[4, 5, 6]);
        assert_eq!(records[2].args, &[7]);
        assert_eq!(records[2].header.tag, 42);
    }

    #[test]
    fn truncated_buffers_are_reported() {
        let data = record(1, &[1, 2], &[3]);
        let short = &data[..data.len() - 1];
        match decode_records(short).next() {
            Some(Err(WireError::TruncatedBody { offset: 0, .. })) => {}
            other => panic!("unexpected {:?}", other.map(|r| r.map(|r| r.header))),
        }
        let short = &data[..4];
        assert!(matches!(
            decode_records(short).next(),
            Some(Err(WireError::TruncatedHeader { .. }))
        ));
    }
}
