//! Requesting side of a confirmed exchange.

use bytes::Bytes;
use log::{debug, info, warn};

use super::window::{AckOutcome, ReceiveWindow, SegmentOutcome, SendWindow};
use super::{Context, Result, Step, TransactionError, TsmConfig};
use crate::app::segmentation::{
    segment_count, SegmentedPayload, CONFIRMED_REQUEST_OVERHEAD,
    CONFIRMED_REQUEST_SEGMENT_OVERHEAD,
};
use crate::app::{Apdu, ComplexAck, ConfirmedRequest, DeviceInfo, SegmentHeader};
use crate::service::{AbortReason, ServiceAck, ServiceFailure};
use crate::timer::TimerHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Sending the segments of our request
    SegmentedRequest,
    /// Request sent, waiting for the answer
    AwaitingAck,
    /// Collecting the segments of a Complex-ACK
    SegmentedReceive,
    Complete,
    Aborted,
}

/// Segment size and count decided before an invoke ID is taken, so a request
/// that cannot be sent does not consume one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct RequestPlan {
    segment_size: usize,
    segments: usize,
}

pub(super) fn plan_request(
    config: &TsmConfig,
    length: usize,
    peer: Option<&DeviceInfo>,
) -> Result<RequestPlan> {
    let ours = config.max_apdu_length_accepted.size();
    let max_apdu = peer.map_or(ours, |info| info.max_apdu_length_accepted.min(ours));

    if CONFIRMED_REQUEST_OVERHEAD + length <= max_apdu {
        return Ok(RequestPlan {
            segment_size: length.max(1),
            segments: 1,
        });
    }

    let segment_size = max_apdu
        .saturating_sub(CONFIRMED_REQUEST_SEGMENT_OVERHEAD)
        .max(1);
    let segments = segment_count(length, segment_size);

    if !config.segmentation_supported.can_transmit() {
        return Err(TransactionError::SegmentationNotSupported("local device"));
    }
    if let Some(info) = peer {
        if !info.segmentation_supported.can_receive() {
            return Err(TransactionError::SegmentationNotSupported("peer"));
        }
        if let Some(accepted) = info.max_segments_accepted {
            if segments > accepted {
                return Err(TransactionError::ApduTooLong { segments, accepted });
            }
        }
    }

    Ok(RequestPlan {
        segment_size,
        segments,
    })
}

#[derive(Debug)]
pub(super) struct ClientTransaction {
    state: ClientState,
    /// The whole request; segments are cut from its parameters
    request: ConfirmedRequest,
    send: SendWindow,
    retry_count: u8,
    receive: Option<ReceiveWindow>,
    pub(super) timer: Option<TimerHandle>,
}

impl ClientTransaction {
    pub(super) fn start(
        ctx: &mut Context<'_>,
        service_choice: u8,
        parameters: Bytes,
        plan: RequestPlan,
    ) -> Self {
        let request = ConfirmedRequest {
            segmented_response_accepted: ctx.config.segmentation_supported.can_receive(),
            max_segments: ctx.config.max_segments_accepted,
            max_apdu: ctx.config.max_apdu_length_accepted,
            invoke_id: ctx.key.invoke_id,
            segment: None,
            service_choice,
            parameters: parameters.clone(),
        };
        let payload = SegmentedPayload::new(parameters, plan.segment_size);
        debug_assert_eq!(payload.count(), plan.segments);

        let mut tx = Self {
            state: if plan.segments > 1 {
                ClientState::SegmentedRequest
            } else {
                ClientState::AwaitingAck
            },
            request,
            send: SendWindow::new(payload, ctx.config.proposed_window_size),
            retry_count: 0,
            receive: None,
            timer: None,
        };
        debug!("{} started in {:?}", ctx.key, tx.state);
        tx.send_request(ctx);
        tx
    }

    pub(super) fn state(&self) -> ClientState {
        self.state
    }

    fn set_state(&mut self, ctx: &Context<'_>, state: ClientState) {
        if self.state != state {
            debug!("{} {:?} -> {:?}", ctx.key, self.state, state);
            self.state = state;
        }
    }

    /// (Re)send the request from the beginning
    fn send_request(&mut self, ctx: &mut Context<'_>) {
        self.send.rewind();
        self.send.retry_count = 0;
        if self.send.is_segmented() {
            self.set_state(ctx, ClientState::SegmentedRequest);
            self.send_segments(ctx, self.send.pending());
            let timeout = ctx.config.segment_timeout;
            ctx.restart_timer(&mut self.timer, timeout);
        } else {
            self.set_state(ctx, ClientState::AwaitingAck);
            ctx.send(Apdu::ConfirmedRequest(self.request.clone()));
            let timeout = ctx.config.apdu_timeout;
            ctx.restart_timer(&mut self.timer, timeout);
        }
    }

    fn send_segments(&self, ctx: &mut Context<'_>, segments: Vec<(SegmentHeader, Bytes)>) {
        for (header, parameters) in segments {
            ctx.send(Apdu::ConfirmedRequest(ConfirmedRequest {
                segment: Some(header),
                parameters,
                ..self.request.clone()
            }));
        }
    }

    fn complete(&mut self, ctx: &mut Context<'_>, result: std::result::Result<ServiceAck, ServiceFailure>) -> Step {
        let state = match result {
            Err(ServiceFailure::Abort { .. }) | Err(ServiceFailure::Timeout) => ClientState::Aborted,
            _ => ClientState::Complete,
        };
        self.set_state(ctx, state);
        ctx.confirm(result);
        Step::Finished
    }

    fn abort_with(&mut self, ctx: &mut Context<'_>, reason: AbortReason) -> Step {
        let apdu = ctx.abort_pdu(reason);
        ctx.send(apdu);
        self.complete(
            ctx,
            Err(ServiceFailure::Abort {
                reason,
                server: false,
            }),
        )
    }

    /// Caller-requested abort
    pub(super) fn abort(&mut self, ctx: &mut Context<'_>, reason: AbortReason) {
        self.abort_with(ctx, reason);
    }

    pub(super) fn on_apdu(&mut self, ctx: &mut Context<'_>, apdu: Apdu) -> Step {
        match self.state {
            ClientState::SegmentedRequest => self.segmented_request(ctx, apdu),
            ClientState::AwaitingAck => self.await_confirmation(ctx, apdu),
            ClientState::SegmentedReceive => self.segmented_confirmation(ctx, apdu),
            ClientState::Complete | ClientState::Aborted => Step::Finished,
        }
    }

    fn segmented_request(&mut self, ctx: &mut Context<'_>, apdu: Apdu) -> Step {
        match apdu {
            Apdu::SegmentAck {
                sequence_number,
                window_size,
                ..
            } => {
                match self.send.on_segment_ack(sequence_number, window_size) {
                    AckOutcome::Duplicate => {
                        debug!("{} segment-ACK {} outside the window", ctx.key, sequence_number);
                        let timeout = ctx.config.segment_timeout;
                        ctx.restart_timer(&mut self.timer, timeout);
                    }
                    AckOutcome::Complete => {
                        self.set_state(ctx, ClientState::AwaitingAck);
                        let timeout = ctx.config.apdu_timeout;
                        ctx.restart_timer(&mut self.timer, timeout);
                    }
                    AckOutcome::Advanced => {
                        self.send_segments(ctx, self.send.window());
                        let timeout = ctx.config.segment_timeout;
                        ctx.restart_timer(&mut self.timer, timeout);
                    }
                }
                Step::Continue
            }
            // an answer before the peer has seen the whole request
            Apdu::SimpleAck { .. } | Apdu::ComplexAck(_) => {
                warn!("{} answered before the request was complete", ctx.key);
                self.abort_with(ctx, AbortReason::InvalidApduInThisState)
            }
            Apdu::Error { .. } | Apdu::Reject { .. } | Apdu::Abort { .. } => {
                self.await_confirmation(ctx, apdu)
            }
            other => {
                debug!("{} ignoring {:?} while sending segments", ctx.key, other.apdu_type());
                Step::Continue
            }
        }
    }

    fn await_confirmation(&mut self, ctx: &mut Context<'_>, apdu: Apdu) -> Step {
        match apdu {
            Apdu::SimpleAck { .. } => self.complete(ctx, Ok(ServiceAck::Simple)),
            Apdu::ComplexAck(ComplexAck {
                segment: None,
                parameters,
                ..
            }) => self.complete(ctx, Ok(ServiceAck::Complex(parameters))),
            Apdu::ComplexAck(ComplexAck {
                segment: Some(header),
                parameters,
                ..
            }) => self.start_receive(ctx, header, &parameters),
            Apdu::Error {
                error_class,
                error_code,
                ..
            } => self.complete(ctx, Err(ServiceFailure::error(error_class, error_code))),
            Apdu::Reject { reason, .. } => self.complete(ctx, Err(ServiceFailure::Reject(reason))),
            Apdu::Abort { reason, server, .. } => {
                info!("{} aborted by the peer: {:?}", ctx.key, reason);
                self.complete(ctx, Err(ServiceFailure::Abort { reason, server }))
            }
            other => {
                debug!("{} ignoring {:?} while awaiting the answer", ctx.key, other.apdu_type());
                Step::Continue
            }
        }
    }

    /// First segment of a segmented Complex-ACK
    fn start_receive(&mut self, ctx: &mut Context<'_>, header: SegmentHeader, data: &[u8]) -> Step {
        if !ctx.config.segmentation_supported.can_receive() {
            warn!("{} segmented answer, but we cannot receive segments", ctx.key);
            return self.abort_with(ctx, AbortReason::SegmentationNotSupported);
        }
        if header.sequence_number != 0 {
            return self.abort_with(ctx, AbortReason::InvalidApduInThisState);
        }

        let receive = match ReceiveWindow::start(data, header.window_size, ctx.config) {
            Ok(receive) => receive,
            Err(err) => {
                warn!("{} {}", ctx.key, err);
                return self.abort_with(ctx, AbortReason::BufferOverflow);
            }
        };
        let ack = ctx.segment_ack(false, 0, receive.window());
        ctx.send(ack);

        if !header.more_follows {
            return self.complete(ctx, Ok(ServiceAck::Complex(receive.into_bytes())));
        }
        self.receive = Some(receive);
        self.set_state(ctx, ClientState::SegmentedReceive);
        let timeout = ctx.config.segment_timeout;
        ctx.restart_timer(&mut self.timer, timeout);
        Step::Continue
    }

    fn segmented_confirmation(&mut self, ctx: &mut Context<'_>, apdu: Apdu) -> Step {
        let (header, parameters) = match apdu {
            Apdu::ComplexAck(ComplexAck {
                segment: Some(header),
                parameters,
                ..
            }) => (header, parameters),
            Apdu::Abort { reason, server, .. } => {
                return self.complete(ctx, Err(ServiceFailure::Abort { reason, server }))
            }
            other => {
                warn!("{} unexpected {:?} between segments", ctx.key, other.apdu_type());
                return self.abort_with(ctx, AbortReason::InvalidApduInThisState);
            }
        };
        let Some(receive) = self.receive.as_mut() else {
            return self.abort_with(ctx, AbortReason::InvalidApduInThisState);
        };

        let window = receive.window();
        match receive.receive(header, &parameters) {
            Ok(SegmentOutcome::Accepted) => {}
            Ok(SegmentOutcome::WindowFull(last)) => {
                let ack = ctx.segment_ack(false, last, window);
                ctx.send(ack);
            }
            Ok(SegmentOutcome::Complete(last)) => {
                let ack = ctx.segment_ack(false, last, window);
                ctx.send(ack);
                let data = self
                    .receive
                    .take()
                    .map(ReceiveWindow::into_bytes)
                    .unwrap_or_default();
                return self.complete(ctx, Ok(ServiceAck::Complex(data)));
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

    pub(super) fn on_timeout(&mut self, ctx: &mut Context<'_>) -> Step {
        let retries = ctx.config.apdu_retries;
        match self.state {
            ClientState::AwaitingAck => {
                if self.retry_count < retries {
                    self.retry_count += 1;
                    info!(
                        "{} no answer, retry {} of {}",
                        ctx.key, self.retry_count, retries
                    );
                    self.send_request(ctx);
                    Step::Continue
                } else {
                    warn!("{} no answer after {} retries", ctx.key, retries);
                    self.complete(ctx, Err(ServiceFailure::Timeout))
                }
            }
            ClientState::SegmentedRequest => {
                if self.send.retry_count < retries {
                    self.send.retry_count += 1;
                    self.send_segments(ctx, self.send.pending());
                    let timeout = ctx.config.segment_timeout;
                    ctx.restart_timer(&mut self.timer, timeout);
                    Step::Continue
                } else {
                    warn!("{} segments not acknowledged", ctx.key);
                    self.complete(ctx, Err(ServiceFailure::Timeout))
                }
            }
            ClientState::SegmentedReceive => {
                warn!("{} answer segments stopped arriving", ctx.key);
                self.complete(ctx, Err(ServiceFailure::Timeout))
            }
            ClientState::Complete | ClientState::Aborted => Step::Finished,
        }
    }
}
