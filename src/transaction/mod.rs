//! Transaction State Machines
//!
//! Every confirmed exchange between this device and a peer is a transaction,
//! keyed by the peer address, the invoke ID and which side of the exchange we
//! are on. [`TransactionManager`] owns all of them in one map together with the
//! per-peer invoke ID counters.
//!
//! The manager performs no I/O. Each entry point returns a list of
//! [`TsmAction`]s (APDUs to send, indications for the service handler,
//! confirmations of our own requests) and arms at most one timer per
//! transaction on the caller's [`TimerQueue`]. When a timer fires the caller
//! hands it back through [`TransactionManager::on_timeout`].
//!
//! # Client side
//!
//! ```text
//! send_request ──► AwaitingAck ──────────────► Complete
//!        │              │  ▲
//!        ▼              ▼  │ (all segments acked)
//! SegmentedRequest ─────┘  SegmentedReceive ──► Complete
//! ```
//!
//! # Server side
//!
//! ```text
//! request ──► [SegmentedReceive] ──► Processing ──► [SegmentedResponse] ──► Complete
//! ```
//!
//! Any state may end in `Aborted`. Terminal transactions are removed at once,
//! releasing their timer and invoke ID.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::debug;
use thiserror::Error;

use crate::app::{
    Apdu, ApplicationError, ComplexAck, DeviceInfo, MaxApduSize, MaxSegments, Segmentation,
};
use crate::config::StackConfig;
use crate::network::Address;
use crate::service::{AbortReason, ServiceAck, ServiceFailure};
use crate::timer::{TimerEvent, TimerHandle, TimerQueue};
use crate::ErrorKind;

mod client;
mod invoke_id;
mod server;
mod window;

use client::ClientTransaction;
use server::ServerTransaction;

pub use client::ClientState;
pub use invoke_id::InvokeIdAllocator;
pub use server::ServerState;

/// Result type for transaction operations
pub type Result<T> = std::result::Result<T, TransactionError>;

/// Errors returned to the caller of a transaction operation.
///
/// Failures of a running exchange (timeouts, aborts, rejects) are not errors:
/// they arrive as [`TsmAction::Confirmation`] with a [`ServiceFailure`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransactionError {
    #[error("no free invoke ID for {0}")]
    NoInvokeId(Address),
    #[error("segmentation not supported by {0}")]
    SegmentationNotSupported(&'static str),
    #[error("message needs {segments} segments, peer accepts {accepted}")]
    ApduTooLong { segments: usize, accepted: usize },
    #[error("no transaction awaiting a response for {0}")]
    UnknownTransaction(TransactionKey),
    #[error(transparent)]
    Application(#[from] ApplicationError),
}

impl TransactionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransactionError::NoInvokeId(_) => ErrorKind::Resource,
            TransactionError::SegmentationNotSupported(_)
            | TransactionError::ApduTooLong { .. } => ErrorKind::Segmentation,
            TransactionError::UnknownTransaction(_) => ErrorKind::InvalidArgument,
            TransactionError::Application(err) => err.kind(),
        }
    }
}

/// Which side of the exchange this device is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// We sent the confirmed request
    Client,
    /// The peer sent the confirmed request
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransactionKey {
    pub peer: Address,
    pub invoke_id: u8,
    pub direction: Direction,
}

impl TransactionKey {
    pub fn client(peer: Address, invoke_id: u8) -> Self {
        Self {
            peer,
            invoke_id,
            direction: Direction::Client,
        }
    }

    pub fn server(peer: Address, invoke_id: u8) -> Self {
        Self {
            peer,
            invoke_id,
            direction: Direction::Server,
        }
    }
}

impl fmt::Display for TransactionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = match self.direction {
            Direction::Client => "client",
            Direction::Server => "server",
        };
        write!(f, "{} {}/{}", side, self.peer, self.invoke_id)
    }
}

/// Timer values and local capabilities used by the state machines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsmConfig {
    pub apdu_timeout: Duration,
    pub apdu_retries: u8,
    pub segment_timeout: Duration,
    pub application_timeout: Duration,
    pub proposed_window_size: u8,
    pub max_apdu_length_accepted: MaxApduSize,
    pub max_segments_accepted: MaxSegments,
    pub segmentation_supported: Segmentation,
    pub invoke_id_start: u8,
}

impl From<&StackConfig> for TsmConfig {
    fn from(config: &StackConfig) -> Self {
        Self {
            apdu_timeout: config.apdu_timeout(),
            apdu_retries: config.apdu_retries,
            segment_timeout: config.segment_timeout(),
            application_timeout: config.application_timeout(),
            proposed_window_size: config.proposed_window_size,
            max_apdu_length_accepted: config.max_apdu_length_accepted,
            max_segments_accepted: config.max_segments_accepted,
            segmentation_supported: config.segmentation_supported,
            invoke_id_start: config.invoke_id_start,
        }
    }
}

impl Default for TsmConfig {
    fn default() -> Self {
        Self::from(&StackConfig::default())
    }
}

impl TsmConfig {
    /// Largest message we accept in segments
    fn reassembly_limit(&self) -> usize {
        let segments = self.max_segments_accepted.count().unwrap_or(256);
        segments * self.max_apdu_length_accepted.size()
    }
}

/// Work the state machines hand back to the stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TsmAction {
    /// Transmit an APDU to the peer
    Send { peer: Address, apdu: Apdu },
    /// A complete confirmed request for the service handler
    Indication {
        peer: Address,
        invoke_id: u8,
        service_choice: u8,
        parameters: Bytes,
    },
    /// Final outcome of a request this device sent; exactly one per request
    Confirmation {
        peer: Address,
        invoke_id: u8,
        result: std::result::Result<ServiceAck, ServiceFailure>,
    },
}

/// Observable state of a live transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Client(ClientState),
    Server(ServerState),
}

/// Whether a transaction survives the step that was just applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    Finished,
}

#[derive(Debug)]
enum Transaction {
    Client(ClientTransaction),
    Server(ServerTransaction),
}

impl Transaction {
    fn timer(&self) -> Option<TimerHandle> {
        match self {
            Transaction::Client(tx) => tx.timer,
            Transaction::Server(tx) => tx.timer,
        }
    }
}

/// Borrowed pieces of the manager handed to one state machine step
struct Context<'a> {
    key: &'a TransactionKey,
    config: &'a TsmConfig,
    timers: &'a mut TimerQueue,
    now: Instant,
    actions: &'a mut Vec<TsmAction>,
}

impl Context<'_> {
    fn send(&mut self, apdu: Apdu) {
        self.actions.push(TsmAction::Send {
            peer: self.key.peer.clone(),
            apdu,
        });
    }

    fn confirm(&mut self, result: std::result::Result<ServiceAck, ServiceFailure>) {
        self.actions.push(TsmAction::Confirmation {
            peer: self.key.peer.clone(),
            invoke_id: self.key.invoke_id,
            result,
        });
    }

    fn indicate(&mut self, service_choice: u8, parameters: Bytes) {
        self.actions.push(TsmAction::Indication {
            peer: self.key.peer.clone(),
            invoke_id: self.key.invoke_id,
            service_choice,
            parameters,
        });
    }

    fn abort_pdu(&self, reason: AbortReason) -> Apdu {
        Apdu::Abort {
            server: self.key.direction == Direction::Server,
            invoke_id: self.key.invoke_id,
            reason,
        }
    }

    fn segment_ack(&self, negative: bool, sequence_number: u8, window_size: u8) -> Apdu {
        Apdu::SegmentAck {
            negative,
            server: self.key.direction == Direction::Server,
            invoke_id: self.key.invoke_id,
            sequence_number,
            window_size,
        }
    }

    /// Replace the transaction's timer with one firing `after` from now
    fn restart_timer(&mut self, timer: &mut Option<TimerHandle>, after: Duration) {
        if let Some(previous) = timer.take() {
            self.timers.cancel(previous);
        }
        *timer = Some(
            self.timers
                .schedule(self.now + after, TimerEvent::Transaction(self.key.clone())),
        );
    }
}

/// Owner of every live transaction of one stack instance
#[derive(Debug)]
pub struct TransactionManager {
    config: TsmConfig,
    transactions: HashMap<TransactionKey, Transaction>,
    invoke_ids: InvokeIdAllocator,
}

impl TransactionManager {
    pub fn new(config: TsmConfig) -> Self {
        let invoke_ids = InvokeIdAllocator::new(config.invoke_id_start);
        Self {
            config,
            transactions: HashMap::new(),
            invoke_ids,
        }
    }

    pub fn config(&self) -> &TsmConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.transactions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
    }

    pub fn contains(&self, key: &TransactionKey) -> bool {
        self.transactions.contains_key(key)
    }

    pub fn state(&self, key: &TransactionKey) -> Option<TransactionState> {
        self.transactions.get(key).map(|transaction| match transaction {
            Transaction::Client(tx) => TransactionState::Client(tx.state()),
            Transaction::Server(tx) => TransactionState::Server(tx.state()),
        })
    }

    /// Remove a transaction together with its timer
    fn finish(&mut self, key: &TransactionKey, timers: &mut TimerQueue) {
        if let Some(transaction) = self.transactions.remove(key) {
            if let Some(timer) = transaction.timer() {
                timers.cancel(timer);
            }
            debug!("{} released", key);
        }
    }

    /// Start a confirmed request to `peer`; returns the invoke ID used
    #[allow(clippy::too_many_arguments)]
    pub fn send_request(
        &mut self,
        peer: &Address,
        service_choice: u8,
        parameters: Bytes,
        peer_info: Option<&DeviceInfo>,
        timers: &mut TimerQueue,
        now: Instant,
    ) -> Result<(u8, Vec<TsmAction>)> {
        let plan = client::plan_request(&self.config, parameters.len(), peer_info)?;

        let transactions = &self.transactions;
        let invoke_id = self
            .invoke_ids
            .allocate(peer, |id| {
                transactions.contains_key(&TransactionKey::client(peer.clone(), id))
            })
            .ok_or_else(|| TransactionError::NoInvokeId(peer.clone()))?;

        let key = TransactionKey::client(peer.clone(), invoke_id);
        let mut actions = Vec::new();
        let mut ctx = Context {
            key: &key,
            config: &self.config,
            timers: &mut *timers,
            now,
            actions: &mut actions,
        };
        let tx = ClientTransaction::start(&mut ctx, service_choice, parameters, plan);
        self.transactions.insert(key, Transaction::Client(tx));
        Ok((invoke_id, actions))
    }

    /// Feed an APDU received from `peer` to the matching transaction, or
    /// open a server transaction for a new confirmed request
    pub fn receive(
        &mut self,
        peer: &Address,
        apdu: Apdu,
        timers: &mut TimerQueue,
        now: Instant,
    ) -> Vec<TsmAction> {
        let key = match &apdu {
            Apdu::UnconfirmedRequest { .. } => return Vec::new(),
            Apdu::ConfirmedRequest(request) => {
                TransactionKey::server(peer.clone(), request.invoke_id)
            }
            Apdu::SimpleAck { invoke_id, .. }
            | Apdu::ComplexAck(ComplexAck { invoke_id, .. })
            | Apdu::Error { invoke_id, .. }
            | Apdu::Reject { invoke_id, .. } => TransactionKey::client(peer.clone(), *invoke_id),
            Apdu::SegmentAck {
                server, invoke_id, ..
            }
            | Apdu::Abort {
                server, invoke_id, ..
            } => {
                if *server {
                    TransactionKey::client(peer.clone(), *invoke_id)
                } else {
                    TransactionKey::server(peer.clone(), *invoke_id)
                }
            }
        };

        let mut actions = Vec::new();
        let mut ctx = Context {
            key: &key,
            config: &self.config,
            timers: &mut *timers,
            now,
            actions: &mut actions,
        };
        let step = match self.transactions.get_mut(&key) {
            Some(Transaction::Client(tx)) => tx.on_apdu(&mut ctx, apdu),
            Some(Transaction::Server(tx)) => tx.on_apdu(&mut ctx, apdu),
            None => match apdu {
                Apdu::ConfirmedRequest(request) => {
                    if let Some(tx) = ServerTransaction::start(&mut ctx, request) {
                        self.transactions.insert(key.clone(), Transaction::Server(tx));
                    }
                    Step::Continue
                }
                other => {
                    debug!("discarding {:?} for {}: no such transaction", other.apdu_type(), key);
                    Step::Continue
                }
            },
        };
        if step == Step::Finished {
            self.finish(&key, timers);
        }
        actions
    }

    /// Answer a confirmed request previously handed out as an indication
    pub fn respond(
        &mut self,
        peer: &Address,
        invoke_id: u8,
        result: std::result::Result<ServiceAck, ServiceFailure>,
        timers: &mut TimerQueue,
        now: Instant,
    ) -> Result<Vec<TsmAction>> {
        let key = TransactionKey::server(peer.clone(), invoke_id);
        let Some(Transaction::Server(tx)) = self.transactions.get_mut(&key) else {
            return Err(TransactionError::UnknownTransaction(key));
        };
        if tx.state() != ServerState::Processing {
            return Err(TransactionError::UnknownTransaction(key));
        }

        let mut actions = Vec::new();
        let mut ctx = Context {
            key: &key,
            config: &self.config,
            timers: &mut *timers,
            now,
            actions: &mut actions,
        };
        if tx.respond(&mut ctx, result) == Step::Finished {
            self.finish(&key, timers);
        }
        Ok(actions)
    }

    /// Abort a live transaction at the caller's request. The peer receives an
    /// Abort PDU; for our own requests the outcome is also confirmed. Unknown
    /// keys are ignored.
    pub fn abort(
        &mut self,
        key: &TransactionKey,
        reason: AbortReason,
        timers: &mut TimerQueue,
        now: Instant,
    ) -> Vec<TsmAction> {
        let mut actions = Vec::new();
        let mut ctx = Context {
            key,
            config: &self.config,
            timers: &mut *timers,
            now,
            actions: &mut actions,
        };
        match self.transactions.get_mut(key) {
            Some(Transaction::Client(tx)) => tx.abort(&mut ctx, reason),
            Some(Transaction::Server(tx)) => tx.abort(&mut ctx, reason),
            None => return actions,
        }
        self.finish(key, timers);
        actions
    }

    /// Handle a fired transaction timer. Stale handles, left over from a
    /// timer that was replaced, are ignored.
    pub fn on_timeout(
        &mut self,
        handle: TimerHandle,
        key: &TransactionKey,
        timers: &mut TimerQueue,
        now: Instant,
    ) -> Vec<TsmAction> {
        let mut actions = Vec::new();
        let Some(transaction) = self.transactions.get_mut(key) else {
            return actions;
        };
        if transaction.timer() != Some(handle) {
            return actions;
        }

        let mut ctx = Context {
            key,
            config: &self.config,
            timers: &mut *timers,
            now,
            actions: &mut actions,
        };
        let step = match transaction {
            Transaction::Client(tx) => {
                tx.timer = None;
                tx.on_timeout(&mut ctx)
            }
            Transaction::Server(tx) => {
                tx.timer = None;
                tx.on_timeout(&mut ctx)
            }
        };
        if step == Step::Finished {
            self.finish(key, timers);
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{ConfirmedRequest, SegmentHeader};
    use crate::service::{ConfirmedServiceChoice, ErrorClass, ErrorCode, RejectReason};
    use crate::timer::{Clock, ManualClock};

    const READ_PROPERTY: u8 = ConfirmedServiceChoice::ReadProperty as u8;

    fn peer() -> Address {
        Address::local(vec![192, 168, 1, 20, 0xBA, 0xC0])
    }

    struct Harness {
        tsm: TransactionManager,
        timers: TimerQueue,
        clock: ManualClock,
    }

    impl Harness {
        fn new(config: TsmConfig) -> Self {
            Self {
                tsm: TransactionManager::new(config),
                timers: TimerQueue::new(),
                clock: ManualClock::new(),
            }
        }

        fn send(&mut self, parameters: &'static [u8]) -> (u8, Vec<TsmAction>) {
            let now = self.clock.now();
            self.tsm
                .send_request(
                    &peer(),
                    READ_PROPERTY,
                    Bytes::from_static(parameters),
                    None,
                    &mut self.timers,
                    now,
                )
                .unwrap()
        }

        fn receive(&mut self, apdu: Apdu) -> Vec<TsmAction> {
            let now = self.clock.now();
            self.tsm.receive(&peer(), apdu, &mut self.timers, now)
        }

        /// Advance the clock to the next deadline and fire what expired
        fn fire_next(&mut self) -> Vec<TsmAction> {
            let deadline = self.timers.next_deadline().unwrap();
            self.clock
                .advance(deadline.saturating_duration_since(self.clock.now()));
            let now = self.clock.now();
            let mut actions = Vec::new();
            while let Some((handle, event)) = self.timers.pop_next_expired(now) {
                if let TimerEvent::Transaction(key) = event {
                    actions.extend(self.tsm.on_timeout(handle, &key, &mut self.timers, now));
                }
            }
            actions
        }
    }

    fn sent(actions: &[TsmAction]) -> Vec<&Apdu> {
        actions
            .iter()
            .filter_map(|action| match action {
                TsmAction::Send { apdu, .. } => Some(apdu),
                _ => None,
            })
            .collect()
    }

    fn confirmations(actions: &[TsmAction]) -> Vec<&std::result::Result<ServiceAck, ServiceFailure>> {
        actions
            .iter()
            .filter_map(|action| match action {
                TsmAction::Confirmation { result, .. } => Some(result),
                _ => None,
            })
            .collect()
    }

    fn segment(invoke_id: u8, sequence_number: u8, more_follows: bool, data: &'static [u8]) -> Apdu {
        Apdu::ComplexAck(ComplexAck {
            invoke_id,
            segment: Some(SegmentHeader {
                sequence_number,
                window_size: 2,
                more_follows,
            }),
            service_choice: READ_PROPERTY,
            parameters: Bytes::from_static(data),
        })
    }

    fn segmenting_config() -> TsmConfig {
        TsmConfig {
            segmentation_supported: Segmentation::Both,
            max_segments_accepted: MaxSegments::Unspecified,
            ..TsmConfig::default()
        }
    }

    #[test]
    fn test_retries_then_single_timeout() {
        let mut h = Harness::new(TsmConfig::default());
        let start = h.clock.now();
        let (invoke_id, actions) = h.send(&[0x0C, 0x02, 0x00, 0x00, 0x08]);
        assert_eq!(invoke_id, 1);
        assert_eq!(sent(&actions).len(), 1);

        let mut resends = 0;
        let mut failures = Vec::new();
        while h.timers.next_deadline().is_some() {
            let actions = h.fire_next();
            resends += sent(&actions).len();
            failures.extend(confirmations(&actions).into_iter().cloned());
        }

        assert_eq!(resends, 3);
        assert_eq!(failures, vec![Err(ServiceFailure::Timeout)]);
        assert_eq!(h.clock.now() - start, Duration::from_secs(12));
        assert!(h.tsm.is_empty());
        assert!(h.timers.is_empty());
    }

    #[test]
    fn test_simple_ack_completes_once() {
        let mut h = Harness::new(TsmConfig::default());
        let (invoke_id, _) = h.send(&[0x01]);
        let ack = Apdu::SimpleAck {
            invoke_id,
            service_choice: READ_PROPERTY,
        };

        let actions = h.receive(ack.clone());
        assert_eq!(
            actions,
            vec![TsmAction::Confirmation {
                peer: peer(),
                invoke_id,
                result: Ok(ServiceAck::Simple),
            }]
        );
        assert!(h.tsm.is_empty());
        assert!(h.timers.is_empty());

        assert!(h.receive(ack).is_empty());
    }

    #[test]
    fn test_error_reject_and_abort_outcomes() {
        let mut h = Harness::new(TsmConfig::default());
        let (first, _) = h.send(&[0x01]);
        let (second, _) = h.send(&[0x01]);
        let (third, _) = h.send(&[0x01]);
        assert_eq!((first, second, third), (1, 2, 3));

        let actions = h.receive(Apdu::Error {
            invoke_id: first,
            service_choice: READ_PROPERTY,
            error_class: ErrorClass::Object,
            error_code: ErrorCode::UnknownObject,
        });
        assert_eq!(
            confirmations(&actions),
            vec![&Err(ServiceFailure::error(ErrorClass::Object, ErrorCode::UnknownObject))]
        );

        let actions = h.receive(Apdu::Reject {
            invoke_id: second,
            reason: RejectReason::UnrecognizedService,
        });
        assert_eq!(
            confirmations(&actions),
            vec![&Err(ServiceFailure::Reject(RejectReason::UnrecognizedService))]
        );

        let actions = h.receive(Apdu::Abort {
            server: true,
            invoke_id: third,
            reason: AbortReason::OutOfResources,
        });
        assert_eq!(
            confirmations(&actions),
            vec![&Err(ServiceFailure::Abort {
                reason: AbortReason::OutOfResources,
                server: true,
            })]
        );
        assert!(h.tsm.is_empty());
    }

    #[test]
    fn test_unmatched_responses_are_discarded() {
        let mut h = Harness::new(TsmConfig::default());
        assert!(h
            .receive(Apdu::SimpleAck {
                invoke_id: 42,
                service_choice: READ_PROPERTY
            })
            .is_empty());
        assert!(h
            .receive(Apdu::Abort {
                server: false,
                invoke_id: 42,
                reason: AbortReason::Other
            })
            .is_empty());
        assert!(h.tsm.is_empty());
    }

    #[test]
    fn test_segmented_complex_ack_in_order() {
        let mut h = Harness::new(segmenting_config());
        let (invoke_id, _) = h.send(&[0x01]);

        let actions = h.receive(segment(invoke_id, 0, true, b"abc"));
        assert_eq!(
            sent(&actions),
            vec![&Apdu::SegmentAck {
                negative: false,
                server: false,
                invoke_id,
                sequence_number: 0,
                window_size: 2,
            }]
        );
        let key = TransactionKey::client(peer(), invoke_id);
        assert_eq!(
            h.tsm.state(&key),
            Some(TransactionState::Client(ClientState::SegmentedReceive))
        );

        assert!(h.receive(segment(invoke_id, 1, true, b"def")).is_empty());

        let actions = h.receive(segment(invoke_id, 2, false, b"gh"));
        assert_eq!(
            actions,
            vec![
                TsmAction::Send {
                    peer: peer(),
                    apdu: Apdu::SegmentAck {
                        negative: false,
                        server: false,
                        invoke_id,
                        sequence_number: 2,
                        window_size: 2,
                    },
                },
                TsmAction::Confirmation {
                    peer: peer(),
                    invoke_id,
                    result: Ok(ServiceAck::Complex(Bytes::from_static(b"abcdefgh"))),
                },
            ]
        );
        assert!(h.tsm.is_empty());
    }

    #[test]
    fn test_segmented_complex_ack_out_of_order() {
        let mut h = Harness::new(segmenting_config());
        let (invoke_id, _) = h.send(&[0x01]);
        h.receive(segment(invoke_id, 0, true, b"abc"));

        let actions = h.receive(segment(invoke_id, 2, false, b"gh"));
        assert!(confirmations(&actions).is_empty());
        assert_eq!(
            sent(&actions),
            vec![&Apdu::SegmentAck {
                negative: true,
                server: false,
                invoke_id,
                sequence_number: 0,
                window_size: 2,
            }]
        );

        let actions = h.receive(segment(invoke_id, 2, false, b"gh"));
        assert!(confirmations(&actions).is_empty());
        assert_eq!(sent(&actions).len(), 1);

        assert!(h.receive(segment(invoke_id, 1, true, b"def")).is_empty());
        let actions = h.receive(segment(invoke_id, 2, false, b"gh"));
        assert_eq!(
            confirmations(&actions),
            vec![&Ok(ServiceAck::Complex(Bytes::from_static(b"abcdefgh")))]
        );
    }

    #[test]
    fn test_segmented_ack_without_segmentation_support() {
        let mut h = Harness::new(TsmConfig::default());
        let (invoke_id, _) = h.send(&[0x01]);
        let actions = h.receive(segment(invoke_id, 0, true, b"abc"));
        assert_eq!(
            sent(&actions),
            vec![&Apdu::Abort {
                server: false,
                invoke_id,
                reason: AbortReason::SegmentationNotSupported,
            }]
        );
        assert_eq!(
            confirmations(&actions),
            vec![&Err(ServiceFailure::Abort {
                reason: AbortReason::SegmentationNotSupported,
                server: false,
            })]
        );
        assert!(h.tsm.is_empty());
    }

    #[test]
    fn test_segment_timeout_fails_request() {
        let mut h = Harness::new(segmenting_config());
        let (invoke_id, _) = h.send(&[0x01]);
        h.receive(segment(invoke_id, 0, true, b"abc"));
        let actions = h.fire_next();
        assert_eq!(confirmations(&actions), vec![&Err(ServiceFailure::Timeout)]);
        assert!(h.tsm.is_empty());
    }

    #[test]
    fn test_segmented_request_follows_granted_window() {
        let config = TsmConfig {
            max_apdu_length_accepted: MaxApduSize::Up50,
            ..segmenting_config()
        };
        let mut h = Harness::new(config);
        let now = h.clock.now();
        let parameters = Bytes::from(vec![0x55; 200]);
        let (invoke_id, actions) = h
            .tsm
            .send_request(&peer(), READ_PROPERTY, parameters.clone(), None, &mut h.timers, now)
            .unwrap();

        // 200 octets in 44-octet segments
        let first = sent(&actions);
        assert_eq!(first.len(), 1);
        match first[0] {
            Apdu::ConfirmedRequest(ConfirmedRequest {
                segment: Some(header),
                parameters,
                ..
            }) => {
                assert_eq!(header.sequence_number, 0);
                assert_eq!(header.window_size, 2);
                assert!(header.more_follows);
                assert_eq!(parameters.len(), 44);
            }
            other => panic!("unexpected {:?}", other),
        }

        let grant = |sequence_number| Apdu::SegmentAck {
            negative: false,
            server: true,
            invoke_id,
            sequence_number,
            window_size: 3,
        };
        let actions = h.receive(grant(0));
        let sequences: Vec<_> = sent(&actions)
            .iter()
            .filter_map(|apdu| match apdu {
                Apdu::ConfirmedRequest(request) => request.segment.map(|s| s.sequence_number),
                _ => None,
            })
            .collect();
        assert_eq!(sequences, vec![1, 2, 3]);

        let actions = h.receive(grant(3));
        let last = sent(&actions);
        assert_eq!(last.len(), 1);
        match last[0] {
            Apdu::ConfirmedRequest(request) => {
                let header = request.segment.unwrap();
                assert_eq!(header.sequence_number, 4);
                assert!(!header.more_follows);
                assert_eq!(request.parameters.len(), 200 - 4 * 44);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(h.receive(grant(4)).is_empty());
        let key = TransactionKey::client(peer(), invoke_id);
        assert_eq!(
            h.tsm.state(&key),
            Some(TransactionState::Client(ClientState::AwaitingAck))
        );

        let actions = h.receive(Apdu::SimpleAck {
            invoke_id,
            service_choice: READ_PROPERTY,
        });
        assert_eq!(confirmations(&actions), vec![&Ok(ServiceAck::Simple)]);
    }

    #[test]
    fn test_request_too_long_without_segmentation() {
        let mut h = Harness::new(TsmConfig::default());
        let now = h.clock.now();
        let err = h
            .tsm
            .send_request(
                &peer(),
                READ_PROPERTY,
                Bytes::from(vec![0; 2000]),
                None,
                &mut h.timers,
                now,
            )
            .unwrap_err();
        assert!(matches!(err, TransactionError::SegmentationNotSupported(_)));
        assert_eq!(err.kind(), ErrorKind::Segmentation);
        assert!(h.tsm.is_empty());

        // the failed request did not consume an invoke ID
        let (invoke_id, _) = h.send(&[0x01]);
        assert_eq!(invoke_id, 1);
    }

    #[test]
    fn test_invoke_ids_exhausted() {
        let mut h = Harness::new(TsmConfig::default());
        let mut seen = std::collections::HashSet::new();
        for _ in 0..256 {
            let (invoke_id, _) = h.send(&[0x01]);
            assert!(seen.insert(invoke_id));
        }
        let now = h.clock.now();
        let err = h
            .tsm
            .send_request(&peer(), READ_PROPERTY, Bytes::new(), None, &mut h.timers, now)
            .unwrap_err();
        assert_eq!(err, TransactionError::NoInvokeId(peer()));
        assert_eq!(err.kind(), ErrorKind::Resource);

        // another peer has its own counter
        let other = Address::local(vec![0x01]);
        let (invoke_id, _) = h
            .tsm
            .send_request(&other, READ_PROPERTY, Bytes::new(), None, &mut h.timers, now)
            .unwrap();
        assert_eq!(invoke_id, 1);
    }

    #[test]
    fn test_caller_abort_releases_everything() {
        let mut h = Harness::new(TsmConfig::default());
        let (invoke_id, _) = h.send(&[0x01]);
        let key = TransactionKey::client(peer(), invoke_id);
        let now = h.clock.now();

        let actions = h.tsm.abort(&key, AbortReason::Other, &mut h.timers, now);
        assert_eq!(
            sent(&actions),
            vec![&Apdu::Abort {
                server: false,
                invoke_id,
                reason: AbortReason::Other,
            }]
        );
        assert_eq!(confirmations(&actions).len(), 1);
        assert!(h.tsm.is_empty());
        assert!(h.timers.is_empty());

        assert!(h.tsm.abort(&key, AbortReason::Other, &mut h.timers, now).is_empty());
    }
}
