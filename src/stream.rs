//! Subscription stream that reconnects on transient failures
//!
//! [`ResilientStream`] traps transient errors of the underlying server-streaming call and
//! transparently opens a new call with the same request, so consumers see a never ending
//! flow of messages. Permanent errors, end of stream and context cancellation are surfaced.

use crate::context::{Context, ContextError};
use crate::error::{ClientError, Result};
use async_trait::async_trait;
use futures::Stream;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tonic::{Code, Status};
use tracing::{debug, trace, warn};

/// Receiving half of a server-streaming call
#[async_trait]
pub trait MessageStream: Send + 'static {
    type Message: Send + 'static;

    /// Next message, `Ok(None)` once the server cleanly ended the stream
    async fn recv_message(&mut self) -> std::result::Result<Option<Self::Message>, Status>;
}

#[async_trait]
impl<T: Send + 'static> MessageStream for tonic::Streaming<T> {
    type Message = T;

    async fn recv_message(&mut self) -> std::result::Result<Option<T>, Status> {
        self.message().await
    }
}

/// Opens a new call of the subscription a [`ResilientStream`] wraps
#[async_trait]
pub trait Subscribe: Send + Sync + 'static {
    type Stream: MessageStream;

    async fn subscribe(&self, ctx: &Context) -> Result<Self::Stream>;
}

/// Message type delivered by the calls a [`Subscribe`] opens
pub type SubscribeMessage<S> = <<S as Subscribe>::Stream as MessageStream>::Message;

/// Whether a failed receive is worth a reconnection
///
/// Codes that need caller or operator intervention are permanent. Availability is preferred
/// for the ambiguous ones, `ResourceExhausted`, `DataLoss` and `FailedPrecondition` are retried.
pub fn is_transient(status: &Status) -> bool {
    match status.code() {
        // An error carrying OK is unexpected, assume the connection is broken
        Code::Ok => {
            warn!(error = %status, "Stream error has code OK, this is unexpected, assuming we need to reconnect");
            true
        }

        Code::Cancelled
        | Code::InvalidArgument
        | Code::DeadlineExceeded
        | Code::NotFound
        | Code::AlreadyExists
        | Code::PermissionDenied
        | Code::Unimplemented
        | Code::Unauthenticated
        | Code::OutOfRange => false,

        Code::ResourceExhausted | Code::DataLoss | Code::FailedPrecondition => true,

        Code::Unknown | Code::Aborted | Code::Internal | Code::Unavailable => true,

        #[allow(unreachable_patterns)]
        _ => false,
    }
}

/// Lifecycle of a [`ResilientStream`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Streaming,
    Retrying,
    /// The server ended the stream, terminal
    Completed,
    /// A permanent error or the context ended the stream, terminal
    Failed,
}

/// Shared view on the last error a [`ResilientStream`] trapped
#[derive(Debug, Clone, Default)]
pub struct LastError(Arc<Mutex<Option<Status>>>);

impl LastError {
    pub fn get(&self) -> Option<Status> {
        self.0.lock().clone()
    }

    fn set(&self, status: Status) {
        *self.0.lock() = Some(status);
    }
}

pub struct ResilientStream<S: Subscribe> {
    ctx: Context,
    subscriber: S,
    stream: S::Stream,
    state: StreamState,
    last_error: LastError,
    reconnect_delay: Duration,
    reconnects: u64,
}

impl<S: Subscribe> ResilientStream<S> {
    /// Open the first call through `subscriber`
    ///
    /// `ctx` is the context of the whole subscription, it is checked on every failure.
    pub async fn connect(ctx: Context, subscriber: S) -> Result<Self> {
        let stream = subscriber.subscribe(&ctx).await?;
        Ok(Self::new(ctx, subscriber, stream))
    }

    /// Wrap an already opened call
    pub fn new(ctx: Context, subscriber: S, stream: S::Stream) -> Self {
        Self {
            ctx,
            subscriber,
            stream,
            state: StreamState::Streaming,
            last_error: LastError::default(),
            reconnect_delay: Duration::ZERO,
            reconnects: 0,
        }
    }

    /// Pause before each reconnection, interrupted by the context
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Last error seen on this stream, including the transient ones that were trapped
    pub fn last_error(&self) -> Option<Status> {
        self.last_error.get()
    }

    /// Handle observing the last error, valid after the stream is consumed
    pub fn last_error_handle(&self) -> LastError {
        self.last_error.clone()
    }

    /// Number of calls opened to replace a failed one
    pub fn reconnects(&self) -> u64 {
        self.reconnects
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Next message
    ///
    /// Returns `Ok(None)` once the server ended the stream. Transient failures are never
    /// returned, this call waits across as many reconnections as needed.
    pub async fn recv(&mut self) -> Result<Option<SubscribeMessage<S>>> {
        match self.state {
            StreamState::Completed => return Ok(None),
            StreamState::Failed => return Err(ClientError::StreamClosed),
            StreamState::Streaming => {}
            // A previous receive was dropped while replacing a failed call, the current one
            // is still the failed call
            StreamState::Retrying => self.reconnect().await?,
        }

        loop {
            trace!("About to receive a message from the gRPC stream");
            let received = tokio::select! {
                biased;
                err = self.ctx.done() => Err(err),
                received = self.stream.recv_message() => Ok(received),
            };

            let status = match received {
                Ok(Ok(Some(message))) => {
                    trace!("Forwarding received message to consumer");
                    self.state = StreamState::Streaming;
                    return Ok(Some(message));
                }
                Err(err) => return Err(self.fail_with_context(err)),
                Ok(received) => {
                    // When the context is cancelled the call may end with an end-of-stream
                    // or a transport error, the context error is the real cause.
                    if let Some(err) = self.ctx.err() {
                        return Err(self.fail_with_context(err));
                    }

                    match received {
                        Ok(_) => {
                            debug!("gRPC stream completed");
                            self.state = StreamState::Completed;
                            return Ok(None);
                        }
                        Err(status) => status,
                    }
                }
            };

            self.last_error.set(status.clone());
            if !is_transient(&status) {
                debug!(error = %status, "Stream permanent error occurred, giving up");
                self.state = StreamState::Failed;
                return Err(status.into());
            }

            debug!(error = %status, "Stream transient error occurred, reconnecting");
            self.state = StreamState::Retrying;
            self.reconnect().await?;
        }
    }

    /// Replace the underlying call, retrying while opening it fails transiently
    async fn reconnect(&mut self) -> Result<()> {
        loop {
            if !self.reconnect_delay.is_zero() {
                let delay = self.reconnect_delay;
                let slept = self
                    .ctx
                    .run(async {
                        tokio::time::sleep(delay).await;
                        Ok::<_, ContextError>(())
                    })
                    .await;

                if let Err(err) = slept {
                    return Err(self.fail_with_context(err));
                }
            }

            let err = match self.subscriber.subscribe(&self.ctx).await {
                Ok(stream) => {
                    self.stream = stream;
                    self.state = StreamState::Streaming;
                    self.reconnects += 1;
                    debug!(reconnects = self.reconnects, "Stream reconnected");
                    return Ok(());
                }
                Err(err) => err,
            };

            if let Some(ctx_err) = self.ctx.err() {
                return Err(self.fail_with_context(ctx_err));
            }

            match err.status() {
                Some(status) if is_transient(status) => {
                    debug!(error = %status, "Reconnection failed with a transient error, retrying");
                    self.last_error.set(status.clone());
                }
                _ => {
                    debug!(error = %err, "Reconnection failed permanently, giving up");
                    if let Some(status) = err.status() {
                        self.last_error.set(status.clone());
                    }
                    self.state = StreamState::Failed;
                    return Err(err);
                }
            }
        }
    }

    fn fail_with_context(&mut self, err: ContextError) -> ClientError {
        debug!(error = %err, "Stream context is done, returning its error right away");
        self.state = StreamState::Failed;
        err.into()
    }

    /// Adapt into a [`Stream`] that ends after the server completes it or after its first error
    pub fn into_stream(self) -> impl Stream<Item = Result<SubscribeMessage<S>>> + Send {
        futures::stream::unfold(self, |mut stream| async move {
            if stream.state == StreamState::Failed {
                return None;
            }

            match stream.recv().await {
                Ok(Some(message)) => Some((Ok(message), stream)),
                Ok(None) => None,
                Err(err) => Some((Err(err), stream)),
            }
        })
    }
}
