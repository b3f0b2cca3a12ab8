//! A single request/response exchange on a connection.
//!
//! An [`OperationState`] is claimed exactly once: by the reader when the
//! response arrives, by its timer when the timeout elapses, by the caller
//! cancelling it, or by the connection failing. The claim is a compare-and-set
//! on the status, so the callback runs once no matter how those paths race.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use cassie_cql::frame::SerializedRequest;
use tokio::task::JoinHandle;

use super::connection::{ConnectionInner, QueryResponse};
use crate::errors::RequestError;

/// Receives the outcome of a request sent with [`Connection::send_with_callback`](super::Connection::send_with_callback).
pub type ResponseCallback = Box<dyn FnOnce(Result<QueryResponse, RequestError>) + Send + 'static>;

const PENDING: u8 = 0;
const COMPLETED: u8 = 1;
const TIMED_OUT: u8 = 2;
const CANCELLED: u8 = 3;

/// Where an operation is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationStatus {
    /// Queued or written, waiting for a response.
    Pending,
    /// The callback got a response or an error.
    Completed,
    /// The timeout elapsed first. A late response is dropped.
    TimedOut,
    /// Cancelled by the caller. A late response is dropped.
    Cancelled,
}

/// Handle of one in-flight request.
pub struct OperationState {
    status: AtomicU8,
    // Taken by the writer when the request gets a stream id.
    request: StdMutex<Option<SerializedRequest>>,
    callback: StdMutex<Option<ResponseCallback>>,
    timeout: Duration,
    timer: StdMutex<Option<JoinHandle<()>>>,
    connection: Weak<ConnectionInner>,
}

impl OperationState {
    pub(crate) fn new(
        request: Option<SerializedRequest>,
        callback: ResponseCallback,
        timeout: Duration,
        connection: Weak<ConnectionInner>,
    ) -> Arc<OperationState> {
        Arc::new(OperationState {
            status: AtomicU8::new(PENDING),
            request: StdMutex::new(request),
            callback: StdMutex::new(Some(callback)),
            timeout,
            timer: StdMutex::new(None),
            connection,
        })
    }

    pub fn status(&self) -> OperationStatus {
        match self.status.load(Ordering::Acquire) {
            PENDING => OperationStatus::Pending,
            COMPLETED => OperationStatus::Completed,
            TIMED_OUT => OperationStatus::TimedOut,
            _ => OperationStatus::Cancelled,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Cancels the operation. Returns false if it was already claimed.
    ///
    /// The callback receives [`RequestError::Cancelled`]. If the request was
    /// already written, its stream id stays reserved until the response arrives.
    pub fn cancel(&self) -> bool {
        if !self.claim(CANCELLED) {
            return false;
        }
        if let Some(connection) = self.connection.upgrade() {
            connection.operation_finished();
        }
        self.invoke(Err(RequestError::Cancelled));
        true
    }

    /// Moves the operation out of the pending status. Only one caller ever wins.
    fn claim(&self, to: u8) -> bool {
        let won = self
            .status
            .compare_exchange(PENDING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.stop_timer();
        }
        won
    }

    pub(crate) fn claim_completed(&self) -> bool {
        self.claim(COMPLETED)
    }

    pub(crate) fn take_request(&self) -> Option<SerializedRequest> {
        self.request.lock().unwrap().take()
    }

    pub(crate) fn set_timer(&self, timer: JoinHandle<()>) {
        let mut slot = self.timer.lock().unwrap();
        if self.status.load(Ordering::Acquire) == PENDING {
            *slot = Some(timer);
        } else {
            timer.abort();
        }
    }

    fn stop_timer(&self) {
        if let Some(timer) = self.timer.lock().unwrap().take() {
            timer.abort();
        }
    }

    /// Runs the callback. Must only be called by the winner of the claim.
    pub(crate) fn invoke(&self, result: Result<QueryResponse, RequestError>) {
        let callback = self.callback.lock().unwrap().take();
        if let Some(callback) = callback {
            callback(result);
        }
    }

    pub(crate) fn on_timeout(&self) {
        // Counted before the claim: once TIMED_OUT is visible, a late response
        // may already be decrementing the counter.
        let connection = self.connection.upgrade();
        if let Some(connection) = &connection {
            connection.count_timed_out();
        }
        if !self.claim(TIMED_OUT) {
            if let Some(connection) = &connection {
                connection.settle_timed_out();
            }
            return;
        }
        if let Some(connection) = &connection {
            connection.operation_timed_out();
        }
        self.invoke(Err(RequestError::Timeout(self.timeout)));
    }
}

impl fmt::Debug for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationState")
            .field("status", &self.status())
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn detached(timeout: Duration) -> (Arc<OperationState>, std::sync::mpsc::Receiver<RequestError>) {
        let (sender, receiver) = std::sync::mpsc::channel();
        let op = OperationState::new(
            None,
            Box::new(move |result| {
                if let Err(err) = result {
                    sender.send(err).unwrap();
                }
            }),
            timeout,
            Weak::new(),
        );
        (op, receiver)
    }

    #[test]
    fn only_the_first_claim_runs_the_callback() {
        let (op, receiver) = detached(Duration::from_secs(1));

        op.on_timeout();
        assert_eq!(op.status(), OperationStatus::TimedOut);
        assert!(!op.cancel());
        assert!(!op.claim_completed());

        assert_matches!(receiver.try_recv(), Ok(RequestError::Timeout(_)));
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn cancel_wins_over_a_late_timeout() {
        let (op, receiver) = detached(Duration::from_secs(1));

        assert!(op.cancel());
        op.on_timeout();
        assert_eq!(op.status(), OperationStatus::Cancelled);

        assert_matches!(receiver.try_recv(), Ok(RequestError::Cancelled));
        assert!(receiver.try_recv().is_err());
    }
}
