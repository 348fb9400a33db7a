//! Stack Façade
//!
//! [`Stack`] ties the layers together for one BACnet device (or router). The
//! link side pushes every received NPDU into [`Stack::on_receive`] and gets
//! frames back through its [`Transport`]; the application side initiates
//! requests with [`Stack::send`] and serves requests as a [`ServiceHandler`].
//!
//! ```text
//! Transport ──on_receive──► Npdu::decode ──► NetworkRouter ──► Apdu::decode
//!                                                                  │
//!                 ServiceHandler ◄── TransactionManager ◄──────────┘
//!                       │
//! Transport ◄── NetworkRouter ◄── TransactionManager ◄── send / respond
//! ```
//!
//! The stack is a single-threaded state machine. Nothing blocks and nothing
//! sleeps: timers live in one queue, [`Stack::next_deadline`] says when to
//! come back and [`Stack::poll`] fires whatever expired. The
//! [`driver`](crate::stack::driver) module runs a stack on a tokio task.
//!
//! A frame that fails to decode at any layer is dropped with a `warn!` and a
//! [`StackEvent::DecodeError`]; it never affects other traffic.
//!
//! # Example
//!
//! ```no_run
//! use bacnet_stack::network::router::PortId;
//! use bacnet_stack::service::{ServiceAck, ServiceFailure, UnconfirmedServiceChoice};
//! use bacnet_stack::stack::{OutgoingRequest, ServiceHandler, ServiceRequest};
//! use bacnet_stack::{Address, LinkDestination, Stack, StackConfig, Transport, TransportError};
//! use bytes::Bytes;
//!
//! struct Udp;
//!
//! impl Transport for Udp {
//!     fn transmit(
//!         &mut self,
//!         _port: PortId,
//!         _npdu: Bytes,
//!         _destination: &LinkDestination,
//!     ) -> Result<(), TransportError> {
//!         Ok(())
//!     }
//! }
//!
//! struct Device;
//!
//! impl ServiceHandler for Device {
//!     fn handle_request(
//!         &mut self,
//!         _request: ServiceRequest,
//!         _source: &Address,
//!     ) -> Result<Option<ServiceAck>, ServiceFailure> {
//!         Ok(Some(ServiceAck::Simple))
//!     }
//!
//!     fn handle_confirmation(
//!         &mut self,
//!         invoke_id: u8,
//!         _peer: &Address,
//!         result: Result<ServiceAck, ServiceFailure>,
//!     ) {
//!         println!("request {} finished: {:?}", invoke_id, result);
//!     }
//! }
//!
//! let mut stack = Stack::new(StackConfig::default(), Udp, Device).unwrap();
//! let who_is = OutgoingRequest::unconfirmed(UnconfirmedServiceChoice::WhoIs, Bytes::new());
//! stack.send(&Address::global_broadcast(), who_is).unwrap();
//! ```

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{debug, info, trace, warn};
use thiserror::Error;

use crate::app::{Apdu, ApplicationError, DeviceInfoCache};
use crate::config::{ConfigError, StackConfig};
use crate::datalink::{DataLinkError, LinkDestination};
use crate::encoding::EncodingError;
use crate::network::router::{NetworkRouter, PortId, RouterOutput, Transmission};
use crate::network::{Address, NetworkError, NetworkPriority, Npdu, NpduBody};
use crate::service::{
    AbortReason, ConfirmedServiceChoice, DeviceCommunicationControlRequest, EnableDisable,
    ErrorClass, ErrorCode, IAmRequest, RejectReason, ServiceAck, ServiceFailure,
    UnconfirmedServiceChoice,
};
use crate::timer::{Clock, SystemClock, TimerEvent, TimerHandle, TimerQueue};
use crate::transaction::{
    TransactionError, TransactionKey, TransactionManager, TsmAction, TsmConfig,
};
use crate::util::hex_preview;
use crate::ErrorKind;

#[cfg(feature = "async")]
pub mod driver;

/// Errors a link transport reports for a frame it could not send
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    DataLink(#[from] DataLinkError),
    #[error("{0} is not attached")]
    UnknownPort(PortId),
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::DataLink(err) => err.kind(),
            _ => ErrorKind::Transport,
        }
    }
}

/// Errors returned by the stack façade
#[derive(Debug, Error)]
pub enum StackError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Application(#[from] ApplicationError),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("communication disabled by DeviceCommunicationControl")]
    CommunicationDisabled,
}

impl StackError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StackError::Config(err) => err.kind(),
            StackError::Encoding(err) => err.kind(),
            StackError::Application(err) => err.kind(),
            StackError::Network(err) => err.kind(),
            StackError::Transaction(err) => err.kind(),
            StackError::Transport(err) => err.kind(),
            StackError::CommunicationDisabled => ErrorKind::CommunicationDisabled,
        }
    }
}

/// Things the application may want to know about that are not service traffic
#[derive(Debug)]
pub enum StackEvent {
    /// A received frame was dropped because it could not be decoded
    DecodeError {
        port: PortId,
        source_mac: Vec<u8>,
        error: StackError,
    },
    /// An NPDU could not be routed
    RoutingFailure(NetworkError),
    /// The transport refused a frame
    TransmitFailed { port: PortId, error: TransportError },
    /// DeviceCommunicationControl changed the communication state
    CommunicationControl(EnableDisable),
}

/// A service request for the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceRequest {
    Confirmed {
        invoke_id: u8,
        service: ConfirmedServiceChoice,
        parameters: Bytes,
    },
    Unconfirmed {
        service: UnconfirmedServiceChoice,
        parameters: Bytes,
    },
}

/// A request the application initiates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingRequest {
    Confirmed {
        service: ConfirmedServiceChoice,
        parameters: Bytes,
    },
    Unconfirmed {
        service: UnconfirmedServiceChoice,
        parameters: Bytes,
    },
}

impl OutgoingRequest {
    pub fn confirmed(service: ConfirmedServiceChoice, parameters: impl Into<Bytes>) -> Self {
        OutgoingRequest::Confirmed {
            service,
            parameters: parameters.into(),
        }
    }

    pub fn unconfirmed(service: UnconfirmedServiceChoice, parameters: impl Into<Bytes>) -> Self {
        OutgoingRequest::Unconfirmed {
            service,
            parameters: parameters.into(),
        }
    }

    pub fn i_am(i_am: &IAmRequest) -> Self {
        let mut parameters = Vec::new();
        i_am.encode(&mut parameters);
        Self::unconfirmed(UnconfirmedServiceChoice::IAm, parameters)
    }
}

/// Link side of the stack: sends encoded NPDUs on a port
pub trait Transport {
    /// Hand an encoded NPDU to the link of `port`. Failures are logged by the
    /// stack; lost requests are recovered by the transaction retries.
    fn transmit(
        &mut self,
        port: PortId,
        npdu: Bytes,
        destination: &LinkDestination,
    ) -> Result<(), TransportError>;
}

/// Application side of the stack
pub trait ServiceHandler {
    /// Serve a request. For confirmed requests `Ok(None)` defers the answer
    /// to a later [`Stack::respond`]; the result of unconfirmed requests is
    /// only logged.
    fn handle_request(
        &mut self,
        request: ServiceRequest,
        source: &Address,
    ) -> Result<Option<ServiceAck>, ServiceFailure>;

    /// Final outcome of a request sent with [`Stack::send`]
    fn handle_confirmation(
        &mut self,
        invoke_id: u8,
        peer: &Address,
        result: Result<ServiceAck, ServiceFailure>,
    );

    fn on_event(&mut self, event: StackEvent) {
        let _ = event;
    }
}

/// One BACnet device: router, transaction state machines and timers
pub struct Stack<T: Transport, H: ServiceHandler> {
    config: StackConfig,
    router: NetworkRouter,
    tsm: TransactionManager,
    timers: TimerQueue,
    clock: Box<dyn Clock>,
    devices: DeviceInfoCache,
    communication: EnableDisable,
    communication_timer: Option<TimerHandle>,
    transport: T,
    handler: H,
}

impl<T: Transport, H: ServiceHandler> Stack<T, H> {
    pub fn new(config: StackConfig, transport: T, handler: H) -> Result<Self, StackError> {
        Self::with_clock(config, transport, handler, SystemClock)
    }

    pub fn with_clock(
        config: StackConfig,
        transport: T,
        handler: H,
        clock: impl Clock + 'static,
    ) -> Result<Self, StackError> {
        config.validate()?;
        let router = NetworkRouter::new(&config.ports, config.router.clone());
        let tsm = TransactionManager::new(TsmConfig::from(&config));
        info!(
            "BACnet stack with {} port(s), router: {}",
            config.ports.len(),
            config.is_router()
        );
        Ok(Self {
            config,
            router,
            tsm,
            timers: TimerQueue::new(),
            clock: Box::new(clock),
            devices: DeviceInfoCache::new(),
            communication: EnableDisable::Enable,
            communication_timer: None,
            transport,
            handler,
        })
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn router(&self) -> &NetworkRouter {
        &self.router
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.tsm
    }

    pub fn devices(&self) -> &DeviceInfoCache {
        &self.devices
    }

    pub fn communication_state(&self) -> EnableDisable {
        self.communication
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// When [`poll`](Self::poll) next has work to do
    pub fn next_deadline(&self) -> Option<Instant> {
        self.timers.next_deadline()
    }

    /// Send a request; confirmed requests return their invoke ID
    pub fn send(
        &mut self,
        destination: &Address,
        request: OutgoingRequest,
    ) -> Result<Option<u8>, StackError> {
        let now = self.clock.now();
        match request {
            OutgoingRequest::Confirmed {
                service,
                parameters,
            } => {
                if self.communication != EnableDisable::Enable {
                    return Err(StackError::CommunicationDisabled);
                }
                let (invoke_id, actions) = self.tsm.send_request(
                    destination,
                    service as u8,
                    parameters,
                    self.devices.get(destination),
                    &mut self.timers,
                    now,
                )?;
                debug!("{:?} to {} as invoke ID {}", service, destination, invoke_id);
                self.apply(actions, now);
                Ok(Some(invoke_id))
            }
            OutgoingRequest::Unconfirmed {
                service,
                parameters,
            } => {
                // I-Am stays possible so the device can still be found
                if self.communication != EnableDisable::Enable
                    && service != UnconfirmedServiceChoice::IAm
                {
                    return Err(StackError::CommunicationDisabled);
                }
                let apdu = Apdu::UnconfirmedRequest {
                    service_choice: service as u8,
                    parameters,
                };
                self.send_apdu(destination, &apdu, now)?;
                Ok(None)
            }
        }
    }

    /// Answer a confirmed request the handler deferred
    pub fn respond(
        &mut self,
        peer: &Address,
        invoke_id: u8,
        result: Result<ServiceAck, ServiceFailure>,
    ) -> Result<(), StackError> {
        let now = self.clock.now();
        let actions = self
            .tsm
            .respond(peer, invoke_id, result, &mut self.timers, now)?;
        self.apply(actions, now);
        Ok(())
    }

    /// Abort a request this device sent. The handler still receives its
    /// confirmation. Unknown invoke IDs are ignored.
    pub fn abort(&mut self, peer: &Address, invoke_id: u8, reason: AbortReason) {
        let now = self.clock.now();
        let key = TransactionKey::client(peer.clone(), invoke_id);
        let actions = self.tsm.abort(&key, reason, &mut self.timers, now);
        self.apply(actions, now);
    }

    /// Feed one NPDU received on `port` from the link address `source_mac`
    pub fn on_receive(&mut self, port: PortId, npdu: Bytes, source_mac: &[u8]) {
        let now = self.clock.now();
        let decoded = match Npdu::decode(&npdu) {
            Ok(decoded) => decoded,
            Err(err) => {
                self.decode_failed(port, source_mac, &npdu, err.into());
                return;
            }
        };

        let outcome = self
            .router
            .route_inbound(port, source_mac, decoded, &mut self.timers, now);
        trace!(
            "{} octets from {} on {}: {:?}",
            npdu.len(),
            hex::encode(source_mac),
            port,
            outcome.decision
        );
        for output in outcome.outputs {
            match output {
                RouterOutput::Deliver { source, apdu, .. } => {
                    self.deliver(port, source_mac, source, apdu, now)
                }
                other => self.router_output(other),
            }
        }
    }

    /// Fire every expired timer; returns how many fired
    pub fn poll(&mut self) -> usize {
        let now = self.clock.now();
        let mut fired = 0;
        while let Some((handle, event)) = self.timers.pop_next_expired(now) {
            fired += 1;
            match event {
                TimerEvent::Transaction(key) => {
                    let actions = self.tsm.on_timeout(handle, &key, &mut self.timers, now);
                    self.apply(actions, now);
                }
                TimerEvent::RouteResolution(network) => {
                    for output in self.router.on_resolution_timeout(network) {
                        self.router_output(output);
                    }
                }
                TimerEvent::CommunicationControl => {
                    if self.communication_timer == Some(handle) {
                        self.communication_timer = None;
                        info!("DeviceCommunicationControl duration elapsed");
                        self.set_communication(EnableDisable::Enable, None, now);
                    }
                }
            }
        }
        self.router.expire_routes(now);
        fired
    }

    fn decode_failed(&mut self, port: PortId, source_mac: &[u8], frame: &[u8], error: StackError) {
        warn!(
            "dropping frame from {} on {}: {} [{}]",
            hex::encode(source_mac),
            port,
            error,
            hex_preview(frame)
        );
        self.handler.on_event(StackEvent::DecodeError {
            port,
            source_mac: source_mac.to_vec(),
            error,
        });
    }

    fn router_output(&mut self, output: RouterOutput) {
        match output {
            RouterOutput::Transmit(transmission) => self.transmit(transmission),
            RouterOutput::Failure(err) => {
                warn!("routing failed: {}", err);
                self.handler.on_event(StackEvent::RoutingFailure(err));
            }
            RouterOutput::Deliver { source, .. } => {
                debug!("unexpected delivery from {} outside a receive", source);
            }
        }
    }

    fn transmit(&mut self, transmission: Transmission) {
        let Transmission {
            port,
            destination,
            npdu,
        } = transmission;
        let encoded = match npdu.encode() {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!("cannot encode NPDU for {} on {}: {}", destination, port, err);
                return;
            }
        };
        trace!("{} octets to {} on {}", encoded.len(), destination, port);
        if let Err(error) = self.transport.transmit(port, encoded, &destination) {
            warn!("transmit to {} on {} failed: {}", destination, port, error);
            self.handler
                .on_event(StackEvent::TransmitFailed { port, error });
        }
    }

    fn send_apdu(&mut self, peer: &Address, apdu: &Apdu, now: Instant) -> Result<(), StackError> {
        let expecting_reply = matches!(apdu, Apdu::ConfirmedRequest(_));
        let transmissions = self.router.route_outbound(
            peer,
            NpduBody::Apdu(apdu.encode()),
            expecting_reply,
            NetworkPriority::Normal,
            &mut self.timers,
            now,
        )?;
        for transmission in transmissions {
            self.transmit(transmission);
        }
        Ok(())
    }

    fn deliver(&mut self, port: PortId, source_mac: &[u8], source: Address, data: Bytes, now: Instant) {
        let apdu = match Apdu::decode(&data) {
            Ok(apdu) => apdu,
            Err(err) => {
                self.decode_failed(port, source_mac, &data, err.into());
                return;
            }
        };

        if !self.accepts(&apdu) {
            debug!(
                "communication disabled, dropping {:?} from {}",
                apdu.apdu_type(),
                source
            );
            return;
        }

        match apdu {
            Apdu::UnconfirmedRequest {
                service_choice,
                parameters,
            } => self.unconfirmed_request(port, source_mac, source, service_choice, parameters),
            Apdu::ConfirmedRequest(request) => {
                self.devices.update_from_request(&source, &request);
                let actions = self.tsm.receive(
                    &source,
                    Apdu::ConfirmedRequest(request),
                    &mut self.timers,
                    now,
                );
                self.apply(actions, now);
            }
            other => {
                let actions = self.tsm.receive(&source, other, &mut self.timers, now);
                self.apply(actions, now);
            }
        }
    }

    /// Whether a received APDU passes DeviceCommunicationControl. While
    /// disabled only DeviceCommunicationControl, ReinitializeDevice and
    /// Who-Is get through; acknowledgments and aborts are dropped too.
    fn accepts(&self, apdu: &Apdu) -> bool {
        if self.communication != EnableDisable::Disable {
            return true;
        }
        match apdu {
            Apdu::ConfirmedRequest(request) => {
                request.service_choice == ConfirmedServiceChoice::DeviceCommunicationControl as u8
                    || request.service_choice == ConfirmedServiceChoice::ReinitializeDevice as u8
            }
            Apdu::UnconfirmedRequest { service_choice, .. } => {
                *service_choice == UnconfirmedServiceChoice::WhoIs as u8
            }
            _ => false,
        }
    }

    fn unconfirmed_request(
        &mut self,
        port: PortId,
        source_mac: &[u8],
        source: Address,
        service_choice: u8,
        parameters: Bytes,
    ) {
        let service = match UnconfirmedServiceChoice::try_from(service_choice) {
            Ok(service) => service,
            Err(err) => {
                debug!("dropping unconfirmed request from {}: {}", source, err);
                return;
            }
        };
        if service == UnconfirmedServiceChoice::IAm {
            match IAmRequest::decode(&parameters) {
                Ok(i_am) => self.devices.update_from_i_am(&source, &i_am),
                Err(err) => {
                    self.decode_failed(port, source_mac, &parameters, err.into());
                    return;
                }
            }
        }

        let request = ServiceRequest::Unconfirmed {
            service,
            parameters,
        };
        if let Err(failure) = self.handler.handle_request(request, &source) {
            debug!("{:?} from {} failed: {}", service, source, failure);
        }
    }

    /// Carry out what the transaction layer asked for
    fn apply(&mut self, actions: Vec<TsmAction>, now: Instant) {
        let mut queue = VecDeque::from(actions);
        while let Some(action) = queue.pop_front() {
            match action {
                TsmAction::Send { peer, apdu } => {
                    if self.communication == EnableDisable::Disable
                        && matches!(apdu, Apdu::ConfirmedRequest(_))
                    {
                        debug!("communication disabled, not sending to {}", peer);
                        continue;
                    }
                    if let Err(err) = self.send_apdu(&peer, &apdu, now) {
                        warn!("cannot send {:?} to {}: {}", apdu.apdu_type(), peer, err);
                        if let StackError::Network(err) = err {
                            self.handler.on_event(StackEvent::RoutingFailure(err));
                        }
                    }
                }
                TsmAction::Indication {
                    peer,
                    invoke_id,
                    service_choice,
                    parameters,
                } => {
                    let Some(result) = self.indication(&peer, invoke_id, service_choice, parameters, now)
                    else {
                        continue;
                    };
                    match self
                        .tsm
                        .respond(&peer, invoke_id, result, &mut self.timers, now)
                    {
                        Ok(more) => queue.extend(more),
                        Err(err) => warn!("cannot answer {} invoke ID {}: {}", peer, invoke_id, err),
                    }
                }
                TsmAction::Confirmation {
                    peer,
                    invoke_id,
                    result,
                } => self.handler.handle_confirmation(invoke_id, &peer, result),
            }
        }
    }

    /// Serve a complete confirmed request; `None` when the answer is deferred
    fn indication(
        &mut self,
        peer: &Address,
        invoke_id: u8,
        service_choice: u8,
        parameters: Bytes,
        now: Instant,
    ) -> Option<Result<ServiceAck, ServiceFailure>> {
        let service = match ConfirmedServiceChoice::try_from(service_choice) {
            Ok(service) => service,
            Err(err) => {
                debug!("rejecting request from {}: {}", peer, err);
                return Some(Err(ServiceFailure::Reject(RejectReason::UnrecognizedService)));
            }
        };
        if service == ConfirmedServiceChoice::DeviceCommunicationControl {
            return Some(self.communication_control(peer, &parameters, now));
        }

        let request = ServiceRequest::Confirmed {
            invoke_id,
            service,
            parameters,
        };
        self.handler.handle_request(request, peer).transpose()
    }

    fn communication_control(
        &mut self,
        peer: &Address,
        parameters: &[u8],
        now: Instant,
    ) -> Result<ServiceAck, ServiceFailure> {
        let request = DeviceCommunicationControlRequest::decode(parameters).map_err(|err| {
            debug!("bad DeviceCommunicationControl from {}: {}", peer, err);
            ServiceFailure::Reject(RejectReason::InvalidParameterDataType)
        })?;
        if let Some(expected) = &self.config.dcc_password {
            let given = request.password.as_ref().map(|password| password.as_str());
            if given != Some(expected.as_str()) {
                warn!("DeviceCommunicationControl from {} with a wrong password", peer);
                return Err(ServiceFailure::error(
                    ErrorClass::Security,
                    ErrorCode::PasswordFailure,
                ));
            }
        }
        info!(
            "{} set communication to {:?} for {:?} minutes",
            peer, request.enable_disable, request.time_duration
        );
        self.set_communication(request.enable_disable, request.time_duration, now);
        Ok(ServiceAck::Simple)
    }

    fn set_communication(&mut self, state: EnableDisable, minutes: Option<u16>, now: Instant) {
        if let Some(timer) = self.communication_timer.take() {
            self.timers.cancel(timer);
        }
        if state != EnableDisable::Enable {
            if let Some(minutes) = minutes {
                let deadline = now + Duration::from_secs(u64::from(minutes) * 60);
                self.communication_timer =
                    Some(self.timers.schedule(deadline, TimerEvent::CommunicationControl));
            }
        }
        if self.communication != state {
            self.communication = state;
            self.handler.on_event(StackEvent::CommunicationControl(state));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{ComplexAck, ConfirmedRequest, MaxApduSize, MaxSegments, Segmentation};
    use crate::encoding::ObjectIdentifier;
    use crate::network::router::PRIMARY_PORT;
    use crate::timer::ManualClock;

    const PEER_MAC: [u8; 6] = [192, 168, 1, 20, 0xBA, 0xC0];

    #[derive(Default)]
    struct RecordingTransport {
        sent: Vec<(PortId, Npdu, LinkDestination)>,
    }

    impl RecordingTransport {
        fn apdus(&self) -> Vec<Apdu> {
            self.sent
                .iter()
                .filter_map(|(_, npdu, _)| match &npdu.body {
                    NpduBody::Apdu(data) => Apdu::decode(data).ok(),
                    NpduBody::Network(_) => None,
                })
                .collect()
        }
    }

    impl Transport for RecordingTransport {
        fn transmit(
            &mut self,
            port: PortId,
            npdu: Bytes,
            destination: &LinkDestination,
        ) -> Result<(), TransportError> {
            let npdu = Npdu::decode(&npdu).map_err(|_| TransportError::Closed)?;
            self.sent.push((port, npdu, destination.clone()));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        requests: Vec<(ServiceRequest, Address)>,
        confirmations: Vec<(u8, Result<ServiceAck, ServiceFailure>)>,
        events: Vec<StackEvent>,
        defer: bool,
    }

    impl ServiceHandler for RecordingHandler {
        fn handle_request(
            &mut self,
            request: ServiceRequest,
            source: &Address,
        ) -> Result<Option<ServiceAck>, ServiceFailure> {
            self.requests.push((request, source.clone()));
            if self.defer {
                Ok(None)
            } else {
                Ok(Some(ServiceAck::Complex(Bytes::from_static(&[0x3E, 0x44, 0x3F]))))
            }
        }

        fn handle_confirmation(
            &mut self,
            invoke_id: u8,
            _peer: &Address,
            result: Result<ServiceAck, ServiceFailure>,
        ) {
            self.confirmations.push((invoke_id, result));
        }

        fn on_event(&mut self, event: StackEvent) {
            self.events.push(event);
        }
    }

    type TestStack = Stack<RecordingTransport, RecordingHandler>;

    fn stack() -> (TestStack, ManualClock) {
        let _ = env_logger::builder().is_test(true).try_init();
        let clock = ManualClock::new();
        let stack = Stack::with_clock(
            StackConfig::default(),
            RecordingTransport::default(),
            RecordingHandler::default(),
            clock.clone(),
        )
        .unwrap();
        (stack, clock)
    }

    fn peer() -> Address {
        Address::local(PEER_MAC.to_vec())
    }

    fn frame(apdu: Apdu) -> Bytes {
        Npdu::apdu(apdu.encode()).encode().unwrap()
    }

    fn confirmed(invoke_id: u8, service_choice: u8, parameters: &'static [u8]) -> Apdu {
        Apdu::ConfirmedRequest(ConfirmedRequest {
            segmented_response_accepted: false,
            max_segments: MaxSegments::Unspecified,
            max_apdu: MaxApduSize::Up1476,
            invoke_id,
            segment: None,
            service_choice,
            parameters: Bytes::from_static(parameters),
        })
    }

    fn dcc(request: DeviceCommunicationControlRequest) -> Apdu {
        let mut parameters = Vec::new();
        request.encode(&mut parameters).unwrap();
        Apdu::ConfirmedRequest(ConfirmedRequest {
            segmented_response_accepted: false,
            max_segments: MaxSegments::Unspecified,
            max_apdu: MaxApduSize::Up1476,
            invoke_id: 50,
            segment: None,
            service_choice: ConfirmedServiceChoice::DeviceCommunicationControl as u8,
            parameters: Bytes::from(parameters),
        })
    }

    #[test]
    fn test_unconfirmed_broadcast() {
        let (mut stack, _) = stack();
        let who_is = OutgoingRequest::unconfirmed(UnconfirmedServiceChoice::WhoIs, Bytes::new());
        assert_eq!(stack.send(&Address::local_broadcast(), who_is).unwrap(), None);

        let (port, npdu, destination) = &stack.transport().sent[0];
        assert_eq!(*port, PRIMARY_PORT);
        assert_eq!(*destination, LinkDestination::Broadcast);
        assert!(!npdu.expecting_reply);
        assert_eq!(
            stack.transport().apdus(),
            vec![Apdu::UnconfirmedRequest {
                service_choice: UnconfirmedServiceChoice::WhoIs as u8,
                parameters: Bytes::new(),
            }]
        );
    }

    #[test]
    fn test_confirmed_request_and_ack() {
        let (mut stack, _) = stack();
        let request = OutgoingRequest::confirmed(ConfirmedServiceChoice::ReadProperty, vec![0x0C]);
        let invoke_id = stack.send(&peer(), request).unwrap().unwrap();

        let (_, npdu, destination) = &stack.transport().sent[0];
        assert!(npdu.expecting_reply);
        assert_eq!(*destination, LinkDestination::Unicast(PEER_MAC.to_vec()));

        let ack = Apdu::ComplexAck(ComplexAck {
            invoke_id,
            segment: None,
            service_choice: ConfirmedServiceChoice::ReadProperty as u8,
            parameters: Bytes::from_static(&[0x01]),
        });
        stack.on_receive(PRIMARY_PORT, frame(ack), &PEER_MAC);
        assert_eq!(
            stack.handler().confirmations,
            vec![(invoke_id, Ok(ServiceAck::Complex(Bytes::from_static(&[0x01]))))]
        );
        assert!(stack.transactions().is_empty());
        assert!(stack.next_deadline().is_none());
    }

    #[test]
    fn test_request_times_out_after_retries() {
        let (mut stack, clock) = stack();
        let request = OutgoingRequest::confirmed(ConfirmedServiceChoice::ReadProperty, vec![0x0C]);
        let invoke_id = stack.send(&peer(), request).unwrap().unwrap();

        while let Some(deadline) = stack.next_deadline() {
            clock.advance(deadline.saturating_duration_since(clock.now()));
            stack.poll();
        }
        assert_eq!(stack.transport().sent.len(), 4);
        assert_eq!(
            stack.handler().confirmations,
            vec![(invoke_id, Err(ServiceFailure::Timeout))]
        );
    }

    #[test]
    fn test_inbound_request_is_answered() {
        let (mut stack, _) = stack();
        let read_property = ConfirmedServiceChoice::ReadProperty as u8;
        stack.on_receive(PRIMARY_PORT, frame(confirmed(7, read_property, &[0x0C])), &PEER_MAC);

        assert_eq!(
            stack.handler().requests,
            vec![(
                ServiceRequest::Confirmed {
                    invoke_id: 7,
                    service: ConfirmedServiceChoice::ReadProperty,
                    parameters: Bytes::from_static(&[0x0C]),
                },
                peer()
            )]
        );
        assert_eq!(
            stack.transport().apdus(),
            vec![Apdu::ComplexAck(ComplexAck {
                invoke_id: 7,
                segment: None,
                service_choice: read_property,
                parameters: Bytes::from_static(&[0x3E, 0x44, 0x3F]),
            })]
        );
        assert_eq!(
            stack.devices().get(&peer()).map(|info| info.max_apdu_length_accepted),
            Some(1476)
        );
    }

    #[test]
    fn test_deferred_response() {
        let (mut stack, _) = stack();
        stack.handler_mut().defer = true;
        let write_property = ConfirmedServiceChoice::WriteProperty as u8;
        stack.on_receive(PRIMARY_PORT, frame(confirmed(3, write_property, &[0x0C])), &PEER_MAC);
        assert!(stack.transport().sent.is_empty());

        stack.respond(&peer(), 3, Ok(ServiceAck::Simple)).unwrap();
        assert_eq!(
            stack.transport().apdus(),
            vec![Apdu::SimpleAck {
                invoke_id: 3,
                service_choice: write_property
            }]
        );
        assert!(stack.respond(&peer(), 3, Ok(ServiceAck::Simple)).is_err());
    }

    #[test]
    fn test_unknown_service_rejected() {
        let (mut stack, _) = stack();
        stack.on_receive(PRIMARY_PORT, frame(confirmed(9, 13, &[])), &PEER_MAC);
        assert!(stack.handler().requests.is_empty());
        assert_eq!(
            stack.transport().apdus(),
            vec![Apdu::Reject {
                invoke_id: 9,
                reason: RejectReason::UnrecognizedService
            }]
        );
    }

    #[test]
    fn test_malformed_frame_is_reported() {
        let (mut stack, _) = stack();
        stack.on_receive(PRIMARY_PORT, Bytes::from_static(&[0x01, 0x00, 0x00]), &PEER_MAC);
        stack.on_receive(PRIMARY_PORT, Bytes::from_static(&[0x07]), &PEER_MAC);

        let events = &stack.handler().events;
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|event| matches!(
            event,
            StackEvent::DecodeError { error, .. } if error.kind() == ErrorKind::MalformedPdu
        )));
        assert!(stack.transport().sent.is_empty());

        // the stack keeps working
        let read_property = ConfirmedServiceChoice::ReadProperty as u8;
        stack.on_receive(PRIMARY_PORT, frame(confirmed(1, read_property, &[])), &PEER_MAC);
        assert_eq!(stack.transport().sent.len(), 1);
    }

    #[test]
    fn test_i_am_refreshes_device_info() {
        let (mut stack, _) = stack();
        let i_am = IAmRequest::new(
            ObjectIdentifier::new(ObjectIdentifier::DEVICE, 1234).unwrap(),
            480,
            Segmentation::Both,
            260,
        );
        let mut parameters = Vec::new();
        i_am.encode(&mut parameters);
        let apdu = Apdu::UnconfirmedRequest {
            service_choice: UnconfirmedServiceChoice::IAm as u8,
            parameters: Bytes::from(parameters),
        };
        stack.on_receive(PRIMARY_PORT, frame(apdu), &PEER_MAC);

        let info = stack.devices().get(&peer()).unwrap();
        assert_eq!(info.device_instance, Some(1234));
        assert_eq!(info.max_apdu_length_accepted, 480);
        assert_eq!(info.segmentation_supported, Segmentation::Both);
        assert_eq!(stack.handler().requests.len(), 1);
    }

    #[test]
    fn test_communication_control_with_duration() {
        let (mut stack, clock) = stack();
        let request = DeviceCommunicationControlRequest::new(EnableDisable::Disable).with_duration(1);
        stack.on_receive(PRIMARY_PORT, frame(dcc(request)), &PEER_MAC);

        assert_eq!(stack.communication_state(), EnableDisable::Disable);
        assert_eq!(
            stack.transport().apdus(),
            vec![Apdu::SimpleAck {
                invoke_id: 50,
                service_choice: ConfirmedServiceChoice::DeviceCommunicationControl as u8,
            }]
        );

        // other requests are ignored, initiation is refused, I-Am still goes out
        let read_property = ConfirmedServiceChoice::ReadProperty as u8;
        stack.on_receive(PRIMARY_PORT, frame(confirmed(2, read_property, &[])), &PEER_MAC);
        assert!(stack.handler().requests.is_empty());
        let err = stack
            .send(
                &peer(),
                OutgoingRequest::confirmed(ConfirmedServiceChoice::ReadProperty, Vec::new()),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CommunicationDisabled);
        let i_am = IAmRequest::new(
            ObjectIdentifier::new(ObjectIdentifier::DEVICE, 1).unwrap(),
            1476,
            Segmentation::NoSegmentation,
            260,
        );
        assert!(stack
            .send(&Address::local_broadcast(), OutgoingRequest::i_am(&i_am))
            .is_ok());

        clock.advance(Duration::from_secs(60));
        assert_eq!(stack.poll(), 1);
        assert_eq!(stack.communication_state(), EnableDisable::Enable);
        assert!(matches!(
            stack.handler().events.as_slice(),
            [
                StackEvent::CommunicationControl(EnableDisable::Disable),
                StackEvent::CommunicationControl(EnableDisable::Enable)
            ]
        ));
    }

    #[test]
    fn test_disabled_communication_drops_acknowledgments() {
        let (mut stack, _) = stack();
        let request = OutgoingRequest::confirmed(ConfirmedServiceChoice::ReadProperty, vec![0x0C]);
        let invoke_id = stack.send(&peer(), request).unwrap().unwrap();

        let disable = DeviceCommunicationControlRequest::new(EnableDisable::Disable);
        stack.on_receive(PRIMARY_PORT, frame(dcc(disable)), &PEER_MAC);
        assert_eq!(stack.communication_state(), EnableDisable::Disable);

        let ack = Apdu::SimpleAck {
            invoke_id,
            service_choice: ConfirmedServiceChoice::ReadProperty as u8,
        };
        stack.on_receive(PRIMARY_PORT, frame(ack.clone()), &PEER_MAC);
        assert!(stack.handler().confirmations.is_empty());
        assert_eq!(stack.transactions().len(), 1);

        let enable = DeviceCommunicationControlRequest::new(EnableDisable::Enable);
        stack.on_receive(PRIMARY_PORT, frame(dcc(enable)), &PEER_MAC);
        stack.on_receive(PRIMARY_PORT, frame(ack), &PEER_MAC);
        assert_eq!(
            stack.handler().confirmations,
            vec![(invoke_id, Ok(ServiceAck::Simple))]
        );
    }

    #[test]
    fn test_request_header_refines_device_info() {
        let (mut stack, _) = stack();
        let i_am = IAmRequest::new(
            ObjectIdentifier::new(ObjectIdentifier::DEVICE, 99).unwrap(),
            480,
            Segmentation::NoSegmentation,
            260,
        );
        let mut parameters = Vec::new();
        i_am.encode(&mut parameters);
        let apdu = Apdu::UnconfirmedRequest {
            service_choice: UnconfirmedServiceChoice::IAm as u8,
            parameters: Bytes::from(parameters),
        };
        stack.on_receive(PRIMARY_PORT, frame(apdu), &PEER_MAC);

        let request = Apdu::ConfirmedRequest(ConfirmedRequest {
            segmented_response_accepted: true,
            max_segments: MaxSegments::Unspecified,
            max_apdu: MaxApduSize::Up1476,
            invoke_id: 4,
            segment: None,
            service_choice: ConfirmedServiceChoice::ReadProperty as u8,
            parameters: Bytes::from_static(&[0x0C]),
        });
        stack.on_receive(PRIMARY_PORT, frame(request), &PEER_MAC);

        let info = stack.devices().get(&peer()).unwrap();
        assert_eq!(info.device_instance, Some(99));
        assert_eq!(info.max_apdu_length_accepted, 480);
        assert_eq!(info.segmentation_supported, Segmentation::Receive);
    }

    #[test]
    fn test_communication_control_password() {
        let clock = ManualClock::new();
        let config = StackConfig {
            dcc_password: Some("secret".into()),
            ..StackConfig::default()
        };
        let mut stack = Stack::with_clock(
            config,
            RecordingTransport::default(),
            RecordingHandler::default(),
            clock,
        )
        .unwrap();

        let wrong = DeviceCommunicationControlRequest::new(EnableDisable::Disable).with_password("guess");
        stack.on_receive(PRIMARY_PORT, frame(dcc(wrong)), &PEER_MAC);
        assert_eq!(stack.communication_state(), EnableDisable::Enable);
        assert!(matches!(
            stack.transport().apdus().as_slice(),
            [Apdu::Error {
                error_code: ErrorCode::PasswordFailure,
                ..
            }]
        ));

        let right = DeviceCommunicationControlRequest::new(EnableDisable::DisableInitiation)
            .with_password("secret");
        stack.on_receive(PRIMARY_PORT, frame(dcc(right)), &PEER_MAC);
        assert_eq!(stack.communication_state(), EnableDisable::DisableInitiation);
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let config = StackConfig {
            ports: Vec::new(),
            ..StackConfig::default()
        };
        let err = Stack::new(
            config,
            RecordingTransport::default(),
            RecordingHandler::default(),
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_caller_abort_is_confirmed() {
        let (mut stack, _) = stack();
        let request = OutgoingRequest::confirmed(ConfirmedServiceChoice::ReadProperty, vec![0x0C]);
        let invoke_id = stack.send(&peer(), request).unwrap().unwrap();
        stack.abort(&peer(), invoke_id, AbortReason::Other);

        assert!(matches!(
            stack.transport().apdus().last(),
            Some(Apdu::Abort {
                server: false,
                reason: AbortReason::Other,
                ..
            })
        ));
        assert_eq!(
            stack.handler().confirmations,
            vec![(
                invoke_id,
                Err(ServiceFailure::Abort {
                    reason: AbortReason::Other,
                    server: false
                })
            )]
        );
        assert!(stack.next_deadline().is_none());
    }
}
