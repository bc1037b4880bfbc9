use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::stream::FusedStream;
use futures::{FutureExt, Stream, StreamExt};
use kubeapi_transport::ByteStream;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::decoder::LineDecoder;
use super::event::ChangeEvent;
use super::state::{StateCell, WatchState};
use crate::error::KubeClientError;

type WatchItem<K> = Result<ChangeEvent<K>, KubeClientError>;
type ConnectFuture = BoxFuture<'static, Result<ByteStream, KubeClientError>>;

/// Typed, cancellable stream of watch events.
///
/// Nothing happens until the stream is first polled: only then is the watch
/// request issued. Events arrive in server order. A producer task reads the
/// response body and hands events over a channel with room for one event,
/// so at most one decoded event waits for the consumer and the network is
/// not read further until it is taken.
///
/// The stream ends after an `ERROR` event, a clean end of the body, a
/// failure (reported as a final `Err` item), or cancellation. Which one is
/// reported by [`state`](Self::state). It is not restarted; resuming from a
/// resource version is up to the caller.
///
/// Dropping the stream cancels it and closes the connection.
pub struct WatchStream<K> {
    state: StateCell,
    cancel: CancellationToken,
    connect: Option<ConnectFuture>,
    receiver: Option<mpsc::Receiver<WatchItem<K>>>,
    max_line: usize,
}

impl<K> Unpin for WatchStream<K> {}

impl<K> WatchStream<K>
where
    K: DeserializeOwned + Send + 'static,
{
    /// Build a stream around a future that opens the event body.
    ///
    /// `connect` is not polled until the stream is. Cancelling `parent`
    /// cancels the stream; cancelling the stream leaves `parent` untouched.
    /// A single line longer than `max_line` bytes fails the stream.
    pub fn from_connect<F>(connect: F, parent: &CancellationToken, max_line: usize) -> Self
    where
        F: Future<Output = Result<ByteStream, KubeClientError>> + Send + 'static,
    {
        Self {
            state: StateCell::new(),
            cancel: parent.child_token(),
            connect: Some(connect.boxed()),
            receiver: None,
            max_line,
        }
    }
}

impl<K> WatchStream<K> {
    #[must_use]
    pub fn state(&self) -> WatchState {
        self.state.get()
    }

    /// Stop the watch. No further events are yielded.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.state.advance(WatchState::Cancelled);
    }

    /// Token that cancels this stream when triggered.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl<K> Stream for WatchStream<K>
where
    K: DeserializeOwned + Send + 'static,
{
    type Item = WatchItem<K>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.cancel.is_cancelled() {
            this.connect = None;
            this.receiver = None;
            this.state.advance(WatchState::Cancelled);
            return Poll::Ready(None);
        }

        if let Some(connect) = this.connect.take() {
            let (tx, rx) = mpsc::channel(1);
            tokio::spawn(produce::<K>(
                connect,
                tx,
                this.state.clone(),
                this.cancel.clone(),
                this.max_line,
            ));
            this.receiver = Some(rx);
        }

        let Some(receiver) = this.receiver.as_mut() else {
            return Poll::Ready(None);
        };
        match receiver.poll_recv(cx) {
            Poll::Ready(None) => {
                this.receiver = None;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

impl<K> FusedStream for WatchStream<K>
where
    K: DeserializeOwned + Send + 'static,
{
    fn is_terminated(&self) -> bool {
        self.connect.is_none() && self.receiver.is_none()
    }
}

impl<K> Drop for WatchStream<K> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<K> fmt::Debug for WatchStream<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchStream")
            .field("state", &self.state.get())
            .field("max_line", &self.max_line)
            .finish_non_exhaustive()
    }
}

async fn produce<K>(
    connect: ConnectFuture,
    tx: mpsc::Sender<WatchItem<K>>,
    state: StateCell,
    cancel: CancellationToken,
    max_line: usize,
) where
    K: DeserializeOwned + Send + 'static,
{
    state.advance(WatchState::Connecting);

    let connected = tokio::select! {
        biased;
        () = cancel.cancelled() => None,
        result = connect => Some(result),
    };
    let body = match connected {
        None => {
            finish_cancelled(&state);
            return;
        }
        Some(Ok(body)) => body,
        Some(Err(err)) => {
            warn!(error = %err, "watch request failed");
            state.advance(WatchState::Failed);
            // Capacity is free, nothing has been sent yet.
            if tx.try_send(Err(err)).is_err() {
                debug!("watch consumer went away before the failure was delivered");
            }
            return;
        }
    };

    if state.advance(WatchState::Streaming) != WatchState::Streaming {
        return;
    }
    debug!("watch stream established");

    pump(body, &tx, &state, &cancel, max_line).await;
}

/// Forward events until the body ends, fails, or the watch is cancelled.
async fn pump<K>(
    mut body: ByteStream,
    tx: &mpsc::Sender<WatchItem<K>>,
    state: &StateCell,
    cancel: &CancellationToken,
    max_line: usize,
) where
    K: DeserializeOwned,
{
    let mut decoder = LineDecoder::new(max_line);
    let mut delivered: u64 = 0;

    loop {
        // Wait until the previous event was taken before reading on.
        let permit = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            permit = tx.reserve() => permit.ok(),
        };
        let Some(permit) = permit else {
            finish_cancelled(state);
            return;
        };

        let line = loop {
            match decoder.next_line() {
                Ok(Some(line)) => break line,
                Ok(None) => {}
                Err(err) => return fail(state, permit, err),
            }

            let chunk = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    finish_cancelled(state);
                    return;
                }
                chunk = body.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => decoder.push(&bytes),
                Some(Err(err)) => return fail(state, permit, KubeClientError::Connection(err)),
                None => {
                    return match decoder.finish() {
                        Ok(()) => {
                            state.advance(WatchState::Completed);
                            debug!(events = delivered, "watch stream completed");
                        }
                        Err(err) => fail(state, permit, err),
                    };
                }
            }
        };

        match ChangeEvent::<K>::from_line(&line) {
            Ok(event) => {
                delivered += 1;
                if event.is_error() {
                    state.advance(WatchState::Completed);
                    debug!(events = delivered, "watch stream closed by server error event");
                    permit.send(Ok(event));
                    return;
                }
                permit.send(Ok(event));
            }
            Err(err) => return fail(state, permit, err),
        }
    }
}

fn fail<K>(state: &StateCell, permit: mpsc::Permit<'_, WatchItem<K>>, err: KubeClientError) {
    warn!(error = %err, "watch stream failed");
    state.advance(WatchState::Failed);
    permit.send(Err(err));
}

fn finish_cancelled(state: &StateCell) {
    state.advance(WatchState::Cancelled);
    debug!("watch stream cancelled");
}
