//! Single-assignment result cell bridging the completion of a confirmed request back to the
//!  caller.
//!
//! The transport engine holds the [ResponseSender] and resolves it exactly once; the caller
//!  holds the [ServiceFuture] and either waits for the result (async or blocking), or registers
//!  a callback. The first resolution wins, later ones are ignored.

use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::error::{ServiceError, ServiceFailure};

/// A positive answer to a confirmed request
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AckResponse {
    Simple { service_choice: u8 },
    /// `payload` is the (reassembled, if it was segmented) service specific result
    Complex { service_choice: u8, payload: Bytes },
}

#[derive(Debug, Clone, Eq, PartialEq)]
enum TokenState {
    Pending,
    Succeeded(AckResponse),
    Failed(ServiceFailure),
    Errored(ServiceError),
    Cancelled,
}

impl TokenState {
    fn result(&self) -> Option<Result<AckResponse, ServiceError>> {
        match self {
            TokenState::Pending => None,
            TokenState::Succeeded(ack) => Some(Ok(ack.clone())),
            TokenState::Failed(failure) => Some(Err(ServiceError::Failed(*failure))),
            TokenState::Errored(error) => Some(Err(error.clone())),
            TokenState::Cancelled => Some(Err(ServiceError::Cancelled)),
        }
    }
}

type ResponseConsumer = Box<dyn FnOnce(Result<AckResponse, ServiceError>) + Send>;

struct Shared {
    state: Mutex<TokenState>,
    consumers: Mutex<Vec<ResponseConsumer>>,
    condvar: Condvar,
    notify: Notify,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, TokenState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_consumers(&self) -> MutexGuard<'_, Vec<ResponseConsumer>> {
        self.consumers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// returns `true` if this call resolved the token
    fn resolve(&self, new_state: TokenState) -> bool {
        let result = {
            let mut state = self.lock_state();
            match &*state {
                TokenState::Pending => {}
                TokenState::Cancelled => {
                    debug!("ignoring result for cancelled request");
                    return false;
                }
                prev if *prev == new_state => {
                    trace!("ignoring repeated result {:?}", new_state);
                    return false;
                }
                prev => {
                    warn!("request was already completed with {:?}, ignoring {:?} - this is a bug", prev, new_state);
                    return false;
                }
            }
            *state = new_state;
            state.result()
        };

        self.condvar.notify_all();
        self.notify.notify_waiters();

        if let Some(result) = result {
            let consumers = std::mem::take(&mut *self.lock_consumers());
            for consumer in consumers {
                consumer(result.clone());
            }
        }
        true
    }
}

/// Creates a connected pair of producer and consumer side
pub fn service_future() -> (ResponseSender, ServiceFuture) {
    let shared = Arc::new(Shared {
        state: Mutex::new(TokenState::Pending),
        consumers: Mutex::new(Vec::new()),
        condvar: Condvar::new(),
        notify: Notify::new(),
    });
    (ResponseSender { shared: shared.clone() }, ServiceFuture { shared })
}

/// The producer side of a [ServiceFuture]. If it is dropped while still pending, the request
///  completes with [ServiceError::LoopTerminated].
pub struct ResponseSender {
    shared: Arc<Shared>,
}

impl Debug for ResponseSender {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResponseSender{{{:?}}}", *self.shared.lock_state())
    }
}

impl ResponseSender {
    pub fn succeeded(&self, ack: AckResponse) -> bool {
        self.shared.resolve(TokenState::Succeeded(ack))
    }

    pub fn failed(&self, failure: ServiceFailure) -> bool {
        self.shared.resolve(TokenState::Failed(failure))
    }

    pub fn errored(&self, error: ServiceError) -> bool {
        self.shared.resolve(TokenState::Errored(error))
    }

    pub fn is_cancelled(&self) -> bool {
        *self.shared.lock_state() == TokenState::Cancelled
    }

    pub fn is_done(&self) -> bool {
        *self.shared.lock_state() != TokenState::Pending
    }
}

impl Drop for ResponseSender {
    fn drop(&mut self) {
        if !self.is_done() {
            self.shared.resolve(TokenState::Errored(ServiceError::LoopTerminated));
        }
    }
}

/// The caller's handle on the outcome of a confirmed request. Clones share the same outcome.
#[derive(Clone)]
pub struct ServiceFuture {
    shared: Arc<Shared>,
}

impl Debug for ServiceFuture {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ServiceFuture{{{:?}}}", *self.shared.lock_state())
    }
}

impl ServiceFuture {
    /// A future that is already completed, for requests that fail before they are queued
    pub fn resolved_with_error(error: ServiceError) -> ServiceFuture {
        let (sender, future) = service_future();
        sender.errored(error);
        future
    }

    pub fn is_done(&self) -> bool {
        *self.shared.lock_state() != TokenState::Pending
    }

    pub fn try_get(&self) -> Option<Result<AckResponse, ServiceError>> {
        self.shared.lock_state().result()
    }

    /// Waits for the outcome. If `timeout` elapses first, this returns a timeout error without
    ///  affecting the request itself.
    pub async fn get(&self, timeout: Option<Duration>) -> Result<AckResponse, ServiceError> {
        match timeout {
            None => self.wait().await,
            Some(timeout) => match tokio::time::timeout(timeout, self.wait()).await {
                Ok(result) => result,
                Err(_) => Err(ServiceError::Timeout { expected_sequence: None }),
            },
        }
    }

    async fn wait(&self) -> Result<AckResponse, ServiceError> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_get() {
                return result;
            }
            notified.await;
        }
    }

    /// Blocks the calling thread until the outcome is known. This must not be called from
    ///  inside an async runtime's worker thread.
    pub fn blocking_get(&self, timeout: Option<Duration>) -> Result<AckResponse, ServiceError> {
        let state = self.shared.lock_state();
        let state = match timeout {
            None => self.shared.condvar
                .wait_while(state, |s| *s == TokenState::Pending)
                .unwrap_or_else(PoisonError::into_inner),
            Some(timeout) => self.shared.condvar
                .wait_timeout_while(state, timeout, |s| *s == TokenState::Pending)
                .unwrap_or_else(PoisonError::into_inner)
                .0,
        };
        state.result()
            .unwrap_or(Err(ServiceError::Timeout { expected_sequence: None }))
    }

    /// Registers a callback for the outcome. It is called immediately if the outcome is already
    ///  known, and otherwise on the thread that resolves the request.
    pub fn on_complete(&self, consumer: impl FnOnce(Result<AckResponse, ServiceError>) + Send + 'static) {
        let immediate = {
            let state = self.shared.lock_state();
            match state.result() {
                Some(result) => Some(result),
                None => {
                    self.shared.lock_consumers().push(Box::new(consumer));
                    return;
                }
            }
        };
        if let Some(result) = immediate {
            consumer(result);
        }
    }

    /// Cancels the request if it is still pending: pending and future waits return
    ///  [ServiceError::Cancelled], and a later response is ignored. Returns `false` if the
    ///  request was already completed.
    pub fn cancel(&self) -> bool {
        self.shared.resolve(TokenState::Cancelled)
    }
}
