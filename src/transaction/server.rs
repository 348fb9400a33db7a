//! Responding side of a confirmed exchange.

use bytes::Bytes;
use log::{debug, info, warn};

use super::window::{AckOutcome, ReceiveWindow, SegmentOutcome, SendWindow};
use super::{Context, Step};
use crate::app::segmentation::{
    SegmentedPayload, COMPLEX_ACK_OVERHEAD, COMPLEX_ACK_SEGMENT_OVERHEAD,
};
use crate::app::{Apdu, ComplexAck, ConfirmedRequest, SegmentHeader};
use crate::service::{AbortReason, ServiceAck, ServiceFailure};
use crate::timer::TimerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Collecting the segments of the request
    SegmentedReceive,
    /// Waiting for the service handler
    Processing,
    /// Sending the segments of our Complex-ACK
    SegmentedResponse,
    Complete,
    Aborted,
}

#[derive(Debug)]
pub(super) struct ServerTransaction {
    state: ServerState,
    service_choice: u8,
    segmented_response_accepted: bool,
    client_max_apdu: usize,
    client_max_segments: Option<usize>,
    receive: Option<ReceiveWindow>,
    send: Option<SendWindow>,
    pub(super) timer: Option<TimerHandle>,
}

impl ServerTransaction {
    /// Open a transaction for a new request. `None` when the request was
    /// refused on the spot.
    pub(super) fn start(ctx: &mut Context<'_>, request: ConfirmedRequest) -> Option<Self> {
        let mut tx = Self {
            state: ServerState::Processing,
            service_choice: request.service_choice,
            segmented_response_accepted: request.segmented_response_accepted,
            client_max_apdu: request.max_apdu.size(),
            client_max_segments: request.max_segments.count(),
            receive: None,
            send: None,
            timer: None,
        };

        let Some(header) = request.segment else {
            tx.process(ctx, request.parameters);
            return Some(tx);
        };

        if !ctx.config.segmentation_supported.can_receive() {
            warn!("{} segmented request, but we cannot receive segments", ctx.key);
            let abort = ctx.abort_pdu(AbortReason::SegmentationNotSupported);
            ctx.send(abort);
            return None;
        }
        if header.sequence_number != 0 {
            debug!("{} request starts at segment {}", ctx.key, header.sequence_number);
            let abort = ctx.abort_pdu(AbortReason::InvalidApduInThisState);
            ctx.send(abort);
            return None;
        }

        let receive = match ReceiveWindow::start(&request.parameters, header.window_size, ctx.config)
        {
            Ok(receive) => receive,
            Err(err) => {
                warn!("{} {}", ctx.key, err);
                let abort = ctx.abort_pdu(AbortReason::BufferOverflow);
                ctx.send(abort);
                return None;
            }
        };
        let ack = ctx.segment_ack(false, 0, receive.window());
        ctx.send(ack);

        if header.more_follows {
            tx.receive = Some(receive);
            tx.set_state(ctx, ServerState::SegmentedReceive);
            let timeout = ctx.config.segment_timeout;
            ctx.restart_timer(&mut tx.timer, timeout);
        } else {
            tx.process(ctx, receive.into_bytes());
        }
        Some(tx)
    }

    pub(super) fn state(&self) -> ServerState {
        self.state
    }

    fn set_state(&mut self, ctx: &Context<'_>, state: ServerState) {
        if self.state != state {
            debug!("{} {:?} -> {:?}", ctx.key, self.state, state);
            self.state = state;
        }
    }

    /// Hand the complete request to the service handler
    fn process(&mut self, ctx: &mut Context<'_>, parameters: Bytes) {
        self.set_state(ctx, ServerState::Processing);
        let timeout = ctx.config.application_timeout;
        ctx.restart_timer(&mut self.timer, timeout);
        ctx.indicate(self.service_choice, parameters);
    }

    fn abort_with(&mut self, ctx: &mut Context<'_>, reason: AbortReason) -> Step {
        let apdu = ctx.abort_pdu(reason);
        ctx.send(apdu);
        self.set_state(ctx, ServerState::Aborted);
        Step::Finished
    }

    /// Caller-requested abort
    pub(super) fn abort(&mut self, ctx: &mut Context<'_>, reason: AbortReason) {
        self.abort_with(ctx, reason);
    }

    pub(super) fn on_apdu(&mut self, ctx: &mut Context<'_>, apdu: Apdu) -> Step {
        match (self.state, apdu) {
            (_, Apdu::Abort { reason, .. }) => {
                info!("{} aborted by the client: {:?}", ctx.key, reason);
                self.set_state(ctx, ServerState::Aborted);
                Step::Finished
            }
            (ServerState::SegmentedReceive, Apdu::ConfirmedRequest(request)) => {
                self.segmented_request(ctx, request)
            }
            (ServerState::Processing | ServerState::SegmentedResponse, Apdu::ConfirmedRequest(_)) => {
                debug!("{} duplicate request ignored", ctx.key);
                Step::Continue
            }
            (
                ServerState::SegmentedResponse,
                Apdu::SegmentAck {
                    sequence_number,
                    window_size,
                    ..
                },
            ) => self.segment_ack(ctx, sequence_number, window_size),
            (state, other) => {
                debug!("{} ignoring {:?} in {:?}", ctx.key, other.apdu_type(), state);
                Step::Continue
            }
        }
    }

    fn segmented_request(&mut self, ctx: &mut Context<'_>, request: ConfirmedRequest) -> Step {
        let Some(header) = request.segment else {
            return self.abort_with(ctx, AbortReason::InvalidApduInThisState);
        };
        let Some(receive) = self.receive.as_mut() else {
            return self.abort_with(ctx, AbortReason::InvalidApduInThisState);
        };

        let window = receive.window();
        match receive.receive(header, &request.parameters) {
            Ok(SegmentOutcome::Accepted) => {}
            Ok(SegmentOutcome::WindowFull(last)) => {
                let ack = ctx.segment_ack(false, last, window);
                ctx.send(ack);
            }
            Ok(SegmentOutcome::Complete(last)) => {
                let ack = ctx.segment_ack(false, last, window);
                ctx.send(ack);
                let parameters = self
                    .receive
                    .take()
                    .map(ReceiveWindow::into_bytes)
                    .unwrap_or_default();
                self.process(ctx, parameters);
                return Step::Continue;
            }
            Ok(SegmentOutcome::OutOfOrder {
                expected,
                received,
                last,
            }) => {
                warn!(
                    "{} segment {} out of order, expected {}",
                    ctx.key, received, expected
                );
                let nak = ctx.segment_ack(true, last, window);
                ctx.send(nak);
            }
            Err(err) => {
                warn!("{} {}", ctx.key, err);
                return self.abort_with(ctx, AbortReason::BufferOverflow);
            }
        }
        let timeout = ctx.config.segment_timeout;
        ctx.restart_timer(&mut self.timer, timeout);
        Step::Continue
    }

    /// The service handler's answer
    pub(super) fn respond(
        &mut self,
        ctx: &mut Context<'_>,
        result: std::result::Result<ServiceAck, ServiceFailure>,
    ) -> Step {
        let invoke_id = ctx.key.invoke_id;
        let apdu = match result {
            Ok(ServiceAck::Simple) => Apdu::SimpleAck {
                invoke_id,
                service_choice: self.service_choice,
            },
            Ok(ServiceAck::Complex(parameters)) => return self.respond_complex(ctx, parameters),
            Err(ServiceFailure::Error { class, code }) => Apdu::Error {
                invoke_id,
                service_choice: self.service_choice,
                error_class: class,
                error_code: code,
            },
            Err(ServiceFailure::Reject(reason)) => Apdu::Reject { invoke_id, reason },
            Err(ServiceFailure::Abort { reason, .. }) => return self.abort_with(ctx, reason),
            Err(ServiceFailure::Timeout) => {
                return self.abort_with(ctx, AbortReason::ApplicationExceededReplyTime)
            }
        };
        ctx.send(apdu);
        self.set_state(ctx, ServerState::Complete);
        Step::Finished
    }

    fn respond_complex(&mut self, ctx: &mut Context<'_>, parameters: Bytes) -> Step {
        let max_apdu = self.client_max_apdu;
        if COMPLEX_ACK_OVERHEAD + parameters.len() <= max_apdu {
            ctx.send(Apdu::ComplexAck(ComplexAck {
                invoke_id: ctx.key.invoke_id,
                segment: None,
                service_choice: self.service_choice,
                parameters,
            }));
            self.set_state(ctx, ServerState::Complete);
            return Step::Finished;
        }

        if !ctx.config.segmentation_supported.can_transmit() || !self.segmented_response_accepted {
            warn!("{} answer of {} octets needs segmentation", ctx.key, parameters.len());
            return self.abort_with(ctx, AbortReason::SegmentationNotSupported);
        }

        let segment_size = max_apdu.saturating_sub(COMPLEX_ACK_SEGMENT_OVERHEAD).max(1);
        let send = SendWindow::new(
            SegmentedPayload::new(parameters, segment_size),
            ctx.config.proposed_window_size,
        );
        if let Some(accepted) = self.client_max_segments {
            if send.count() > accepted {
                warn!(
                    "{} answer needs {} segments, client accepts {}",
                    ctx.key,
                    send.count(),
                    accepted
                );
                return self.abort_with(ctx, AbortReason::ApduTooLong);
            }
        }

        self.send_segments(ctx, send.pending());
        self.send = Some(send);
        self.set_state(ctx, ServerState::SegmentedResponse);
        let timeout = ctx.config.segment_timeout;
        ctx.restart_timer(&mut self.timer, timeout);
        Step::Continue
    }

    fn send_segments(&self, ctx: &mut Context<'_>, segments: Vec<(SegmentHeader, Bytes)>) {
        for (header, parameters) in segments {
            ctx.send(Apdu::ComplexAck(ComplexAck {
                invoke_id: ctx.key.invoke_id,
                segment: Some(header),
                service_choice: self.service_choice,
                parameters,
            }));
        }
    }

    fn segment_ack(&mut self, ctx: &mut Context<'_>, sequence_number: u8, window_size: u8) -> Step {
        let Some(send) = self.send.as_mut() else {
            return Step::Continue;
        };
        match send.on_segment_ack(sequence_number, window_size) {
            AckOutcome::Complete => {
                self.set_state(ctx, ServerState::Complete);
                return Step::Finished;
            }
            AckOutcome::Advanced => {
                let window = send.window();
                self.send_segments(ctx, window);
            }
            AckOutcome::Duplicate => {
                debug!("{} segment-ACK {} outside the window", ctx.key, sequence_number);
            }
        }
        let timeout = ctx.config.segment_timeout;
        ctx.restart_timer(&mut self.timer, timeout);
        Step::Continue
    }

    pub(super) fn on_timeout(&mut self, ctx: &mut Context<'_>) -> Step {
        match self.state {
            ServerState::SegmentedReceive => {
                warn!("{} request segments stopped arriving", ctx.key);
                self.set_state(ctx, ServerState::Aborted);
                Step::Finished
            }
            ServerState::Processing => {
                warn!("{} no answer from the service handler", ctx.key);
                self.abort_with(ctx, AbortReason::ApplicationExceededReplyTime)
            }
            ServerState::SegmentedResponse => {
                let retries = ctx.config.apdu_retries;
                let Some(send) = self.send.as_mut() else {
                    return Step::Finished;
                };
                if send.retry_count < retries {
                    send.retry_count += 1;
                    let pending = send.pending();
                    self.send_segments(ctx, pending);
                    let timeout = ctx.config.segment_timeout;
                    ctx.restart_timer(&mut self.timer, timeout);
                    Step::Continue
                } else {
                    warn!("{} answer segments not acknowledged", ctx.key);
                    self.set_state(ctx, ServerState::Aborted);
                    Step::Finished
                }
            }
            ServerState::Complete | ServerState::Aborted => Step::Finished,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::transaction::{TransactionKey, TransactionManager, TransactionState, TsmAction, TsmConfig};
    use super::*;
    use crate::app::{MaxApduSize, MaxSegments, Segmentation};
    use crate::network::Address;
    use crate::service::{ErrorClass, ErrorCode};
    use crate::timer::{Clock, ManualClock, TimerEvent, TimerQueue};

    const READ_PROPERTY: u8 = 12;

    fn client() -> Address {
        Address::remote(5, vec![0x21])
    }

    fn request(invoke_id: u8, segment: Option<SegmentHeader>, parameters: &'static [u8]) -> Apdu {
        Apdu::ConfirmedRequest(ConfirmedRequest {
            segmented_response_accepted: true,
            max_segments: MaxSegments::Unspecified,
            max_apdu: MaxApduSize::Up50,
            invoke_id,
            segment,
            service_choice: READ_PROPERTY,
            parameters: Bytes::from_static(parameters),
        })
    }

    fn header(sequence_number: u8, more_follows: bool) -> Option<SegmentHeader> {
        Some(SegmentHeader {
            sequence_number,
            window_size: 4,
            more_follows,
        })
    }

    fn sent(actions: &[TsmAction]) -> Vec<Apdu> {
        actions
            .iter()
            .filter_map(|action| match action {
                TsmAction::Send { apdu, .. } => Some(apdu.clone()),
                _ => None,
            })
            .collect()
    }

    fn segmenting() -> TsmConfig {
        TsmConfig {
            segmentation_supported: Segmentation::Both,
            max_segments_accepted: MaxSegments::Unspecified,
            ..TsmConfig::default()
        }
    }

    #[test]
    fn test_request_indication_and_simple_ack() {
        let mut tsm = TransactionManager::new(TsmConfig::default());
        let mut timers = TimerQueue::new();
        let clock = ManualClock::new();

        let actions = tsm.receive(&client(), request(7, None, &[0x0C]), &mut timers, clock.now());
        assert_eq!(
            actions,
            vec![TsmAction::Indication {
                peer: client(),
                invoke_id: 7,
                service_choice: READ_PROPERTY,
                parameters: Bytes::from_static(&[0x0C]),
            }]
        );
        let key = TransactionKey::server(client(), 7);
        assert_eq!(
            tsm.state(&key),
            Some(TransactionState::Server(ServerState::Processing))
        );

        // a retransmission while processing is not a second indication
        assert!(tsm
            .receive(&client(), request(7, None, &[0x0C]), &mut timers, clock.now())
            .is_empty());

        let actions = tsm
            .respond(&client(), 7, Ok(ServiceAck::Simple), &mut timers, clock.now())
            .unwrap();
        assert_eq!(
            sent(&actions),
            vec![Apdu::SimpleAck {
                invoke_id: 7,
                service_choice: READ_PROPERTY
            }]
        );
        assert!(tsm.is_empty());
        assert!(timers.is_empty());
        assert!(tsm
            .respond(&client(), 7, Ok(ServiceAck::Simple), &mut timers, clock.now())
            .is_err());
    }

    #[test]
    fn test_error_response() {
        let mut tsm = TransactionManager::new(TsmConfig::default());
        let mut timers = TimerQueue::new();
        let now = ManualClock::new().now();
        tsm.receive(&client(), request(1, None, &[]), &mut timers, now);
        let actions = tsm
            .respond(
                &client(),
                1,
                Err(ServiceFailure::error(ErrorClass::Property, ErrorCode::UnknownProperty)),
                &mut timers,
                now,
            )
            .unwrap();
        assert_eq!(
            sent(&actions),
            vec![Apdu::Error {
                invoke_id: 1,
                service_choice: READ_PROPERTY,
                error_class: ErrorClass::Property,
                error_code: ErrorCode::UnknownProperty,
            }]
        );
    }

    #[test]
    fn test_application_timeout_aborts() {
        let mut tsm = TransactionManager::new(TsmConfig::default());
        let mut timers = TimerQueue::new();
        let clock = ManualClock::new();
        tsm.receive(&client(), request(3, None, &[]), &mut timers, clock.now());

        clock.advance(Duration::from_secs(3));
        let now = clock.now();
        let (handle, event) = timers.pop_next_expired(now).unwrap();
        let TimerEvent::Transaction(key) = event else {
            panic!("unexpected timer event");
        };
        let actions = tsm.on_timeout(handle, &key, &mut timers, now);
        assert_eq!(
            sent(&actions),
            vec![Apdu::Abort {
                server: true,
                invoke_id: 3,
                reason: AbortReason::ApplicationExceededReplyTime,
            }]
        );
        assert!(tsm.is_empty());
    }

    #[test]
    fn test_segmented_request_reassembled() {
        let mut tsm = TransactionManager::new(segmenting());
        let mut timers = TimerQueue::new();
        let now = ManualClock::new().now();

        let actions = tsm.receive(&client(), request(9, header(0, true), b"ab"), &mut timers, now);
        assert_eq!(
            sent(&actions),
            vec![Apdu::SegmentAck {
                negative: false,
                server: true,
                invoke_id: 9,
                sequence_number: 0,
                window_size: 2,
            }]
        );

        let actions = tsm.receive(&client(), request(9, header(1, false), b"cd"), &mut timers, now);
        assert_eq!(
            actions,
            vec![
                TsmAction::Send {
                    peer: client(),
                    apdu: Apdu::SegmentAck {
                        negative: false,
                        server: true,
                        invoke_id: 9,
                        sequence_number: 1,
                        window_size: 2,
                    },
                },
                TsmAction::Indication {
                    peer: client(),
                    invoke_id: 9,
                    service_choice: READ_PROPERTY,
                    parameters: Bytes::from_static(b"abcd"),
                },
            ]
        );
    }

    #[test]
    fn test_segmented_request_refused_without_support() {
        let mut tsm = TransactionManager::new(TsmConfig::default());
        let mut timers = TimerQueue::new();
        let now = ManualClock::new().now();
        let actions = tsm.receive(&client(), request(4, header(0, true), b"ab"), &mut timers, now);
        assert_eq!(
            sent(&actions),
            vec![Apdu::Abort {
                server: true,
                invoke_id: 4,
                reason: AbortReason::SegmentationNotSupported,
            }]
        );
        assert!(tsm.is_empty());
    }

    #[test]
    fn test_segmented_complex_ack() {
        let mut tsm = TransactionManager::new(segmenting());
        let mut timers = TimerQueue::new();
        let now = ManualClock::new().now();
        tsm.receive(&client(), request(2, None, &[]), &mut timers, now);

        // the client accepts 50-octet APDUs: 45 octets per segment
        let actions = tsm
            .respond(
                &client(),
                2,
                Ok(ServiceAck::Complex(Bytes::from(vec![0xAA; 100]))),
                &mut timers,
                now,
            )
            .unwrap();
        let first = sent(&actions);
        assert_eq!(first.len(), 1);
        let Apdu::ComplexAck(ack) = &first[0] else {
            panic!("expected a Complex-ACK segment");
        };
        assert_eq!(ack.parameters.len(), 45);
        assert_eq!(ack.segment.map(|s| s.window_size), Some(2));

        let segment_ack = |sequence_number| Apdu::SegmentAck {
            negative: false,
            server: false,
            invoke_id: 2,
            sequence_number,
            window_size: 2,
        };
        let actions = tsm.receive(&client(), segment_ack(0), &mut timers, now);
        let rest: Vec<_> = sent(&actions)
            .into_iter()
            .filter_map(|apdu| match apdu {
                Apdu::ComplexAck(ack) => Some((ack.segment, ack.parameters.len())),
                _ => None,
            })
            .collect();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[1].0.map(|s| s.more_follows), Some(false));
        assert_eq!(rest[1].1, 10);

        assert!(tsm.receive(&client(), segment_ack(2), &mut timers, now).is_empty());
        assert!(tsm.is_empty());
        assert!(timers.is_empty());
    }

    #[test]
    fn test_complex_ack_too_long_for_client() {
        let mut tsm = TransactionManager::new(TsmConfig::default());
        let mut timers = TimerQueue::new();
        let now = ManualClock::new().now();
        tsm.receive(&client(), request(6, None, &[]), &mut timers, now);
        let actions = tsm
            .respond(
                &client(),
                6,
                Ok(ServiceAck::Complex(Bytes::from(vec![0; 60]))),
                &mut timers,
                now,
            )
            .unwrap();
        assert_eq!(
            sent(&actions),
            vec![Apdu::Abort {
                server: true,
                invoke_id: 6,
                reason: AbortReason::SegmentationNotSupported,
            }]
        );
        assert!(tsm.is_empty());
    }
}
