//! Tokio driver for a [`Stack`].
//!
//! The stack itself never blocks, so the driver is a single task that owns
//! it and multiplexes three things: received frames, application commands
//! and the next timer deadline. Everything reaches the task through a
//! [`StackHandle`], which is cheap to clone.
//!
//! Outbound frames leave through a [`ChannelTransport`]; [`pump`] forwards
//! them to any [`FrameSink`], such as a UDP socket wrapper.

use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::{OutgoingRequest, ServiceHandler, Stack, StackError, Transport, TransportError};
use crate::datalink::LinkDestination;
use crate::network::router::PortId;
use crate::network::Address;
use crate::service::{AbortReason, ServiceAck, ServiceFailure};
use crate::timer::Clock;

/// Clock that follows tokio time, so paused test runtimes drive the timers
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }
}

/// An encoded NPDU on its way to a link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub port: PortId,
    pub destination: LinkDestination,
    pub npdu: Bytes,
}

/// [`Transport`] that queues frames for an async writer
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    frames: mpsc::UnboundedSender<OutboundFrame>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (frames, rx) = mpsc::unbounded_channel();
        (Self { frames }, rx)
    }
}

impl Transport for ChannelTransport {
    fn transmit(
        &mut self,
        port: PortId,
        npdu: Bytes,
        destination: &LinkDestination,
    ) -> Result<(), TransportError> {
        self.frames
            .send(OutboundFrame {
                port,
                destination: destination.clone(),
                npdu,
            })
            .map_err(|_| TransportError::Closed)
    }
}

/// Async writer for outbound frames
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: OutboundFrame) -> Result<(), TransportError>;
}

/// Forward queued frames to `sink` until the queue closes. Failed frames are
/// logged and skipped.
pub async fn pump<S: FrameSink>(mut frames: mpsc::UnboundedReceiver<OutboundFrame>, mut sink: S) {
    while let Some(frame) = frames.recv().await {
        let port = frame.port;
        if let Err(err) = sink.send_frame(frame).await {
            warn!("frame on {} not sent: {}", port, err);
        }
    }
    debug!("outbound frame queue closed");
}

type Reply<T> = oneshot::Sender<Result<T, StackError>>;

#[derive(Debug)]
enum Command {
    Receive {
        port: PortId,
        npdu: Bytes,
        source_mac: Vec<u8>,
    },
    Send {
        destination: Address,
        request: OutgoingRequest,
        reply: Reply<Option<u8>>,
    },
    Respond {
        peer: Address,
        invoke_id: u8,
        result: Result<ServiceAck, ServiceFailure>,
        reply: Reply<()>,
    },
    Abort {
        peer: Address,
        invoke_id: u8,
        reason: AbortReason,
    },
    Shutdown,
}

/// Cloneable access to a running [`StackDriver`]
#[derive(Debug, Clone)]
pub struct StackHandle {
    commands: mpsc::Sender<Command>,
}

fn closed<T>(_: T) -> StackError {
    StackError::Transport(TransportError::Closed)
}

impl StackHandle {
    /// Hand a received NPDU to the stack
    pub async fn deliver(
        &self,
        port: PortId,
        npdu: Bytes,
        source_mac: impl Into<Vec<u8>>,
    ) -> Result<(), StackError> {
        let command = Command::Receive {
            port,
            npdu,
            source_mac: source_mac.into(),
        };
        self.commands.send(command).await.map_err(closed)
    }

    pub async fn send(
        &self,
        destination: Address,
        request: OutgoingRequest,
    ) -> Result<Option<u8>, StackError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Send {
            destination,
            request,
            reply,
        };
        self.commands.send(command).await.map_err(closed)?;
        rx.await.map_err(closed)?
    }

    pub async fn respond(
        &self,
        peer: Address,
        invoke_id: u8,
        result: Result<ServiceAck, ServiceFailure>,
    ) -> Result<(), StackError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Respond {
            peer,
            invoke_id,
            result,
            reply,
        };
        self.commands.send(command).await.map_err(closed)?;
        rx.await.map_err(closed)?
    }

    pub async fn abort(
        &self,
        peer: Address,
        invoke_id: u8,
        reason: AbortReason,
    ) -> Result<(), StackError> {
        let command = Command::Abort {
            peer,
            invoke_id,
            reason,
        };
        self.commands.send(command).await.map_err(closed)
    }

    /// Stop the driver; the task returns the stack
    pub async fn shutdown(&self) -> Result<(), StackError> {
        self.commands.send(Command::Shutdown).await.map_err(closed)
    }
}

/// Owns a [`Stack`] and runs it on a tokio task
pub struct StackDriver<T: Transport, H: ServiceHandler> {
    stack: Stack<T, H>,
    commands: mpsc::Receiver<Command>,
}

impl<T, H> StackDriver<T, H>
where
    T: Transport + Send + 'static,
    H: ServiceHandler + Send + 'static,
{
    /// The stack should use a [`TokioClock`]
    pub fn new(stack: Stack<T, H>, capacity: usize) -> (Self, StackHandle) {
        let (tx, commands) = mpsc::channel(capacity.max(1));
        (Self { stack, commands }, StackHandle { commands: tx })
    }

    pub fn spawn(stack: Stack<T, H>, capacity: usize) -> (StackHandle, JoinHandle<Stack<T, H>>) {
        let (driver, handle) = Self::new(stack, capacity);
        (handle, tokio::spawn(driver.run()))
    }

    /// Run until shutdown or until every handle is dropped
    pub async fn run(mut self) -> Stack<T, H> {
        info!("stack driver started");
        loop {
            let deadline = self.stack.next_deadline();
            let timer = async {
                match deadline {
                    Some(deadline) => {
                        tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                    }
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break,
                    Some(command) => self.handle_command(command),
                },
                _ = timer => {
                    self.stack.poll();
                }
            }
        }
        info!("stack driver stopped");
        self.stack
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Receive {
                port,
                npdu,
                source_mac,
            } => self.stack.on_receive(port, npdu, &source_mac),
            Command::Send {
                destination,
                request,
                reply,
            } => {
                let _ = reply.send(self.stack.send(&destination, request));
            }
            Command::Respond {
                peer,
                invoke_id,
                result,
                reply,
            } => {
                let _ = reply.send(self.stack.respond(&peer, invoke_id, result));
            }
            Command::Abort {
                peer,
                invoke_id,
                reason,
            } => self.stack.abort(&peer, invoke_id, reason),
            Command::Shutdown => {}
        }
    }
}
