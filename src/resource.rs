//! Shared lifecycle state machine of connections, sessions, and links.
//!
//! Every protocol resource goes through the same open/close handshake: a
//! local performative and its remote answer on the way up, and the same
//! pair on the way down. [`Lifecycle`] tracks which halves have happened
//! and holds the at-most-one pending open request and the pending close
//! requests; the engine emits the performatives and completes the
//! requests it takes back out.

use crate::requests::AsyncRequest;

/// Lifecycle state of a protocol resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// Created, no performative exchanged
    Idle,

    /// Local open emitted, remote answer outstanding
    OpeningLocal,

    /// Remote open received before a local one (peer-initiated; only
    /// legal for child resources)
    OpeningRemote,

    /// Both opens exchanged
    Open,

    /// Local close emitted, remote answer outstanding
    ClosingLocal,

    /// Remote close received, local echo outstanding
    ClosingRemote,

    /// Cleanly closed
    Closed,

    /// Torn down by an error
    Failed,
}

impl ResourceState {
    /// Whether the resource reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ResourceState::Closed | ResourceState::Failed)
    }
}

/// What the caller should do after a local close request.
#[derive(Debug)]
pub(crate) enum CloseDisposition {
    /// Emit the close performative
    Emit,

    /// A close is already in flight; the request was queued onto it
    AlreadyClosing,

    /// The resource is already terminal; the request was completed
    Completed,
}

/// Outcome of a remote close.
#[derive(Debug)]
pub(crate) enum RemoteClose<T, OE, CE> {
    /// Answer to our local close: the resource is now closed and these
    /// requests complete successfully
    Answered {
        /// Pending close requests to complete
        pending_closes: Vec<AsyncRequest<(), CE>>,
    },

    /// Peer-initiated close; the caller echoes the close performative.
    /// A pending open is handed back: it either failed (remote error,
    /// rejected open) or, when the resource was marked close-expected,
    /// completes with a distinct outcome decided by the caller.
    Initiated {
        /// Pending open request, if the resource never finished opening
        pending_open: Option<AsyncRequest<T, OE>>,
        /// Whether this close was announced by [`Lifecycle::expect_remote_close`]
        close_expected: bool,
    },
}

/// Open/close bookkeeping shared by every resource kind.
///
/// `T` is the value a completed open produces, `OE` the error type of
/// the open exchange, `CE` the error type of the close exchange.
#[derive(Debug)]
pub(crate) struct Lifecycle<T, OE, CE> {
    state: ResourceState,
    pending_open: Option<AsyncRequest<T, OE>>,
    pending_closes: Vec<AsyncRequest<(), CE>>,
    close_expected: bool,
}

impl<T, OE, CE> Lifecycle<T, OE, CE> {
    pub fn new() -> Self {
        Self {
            state: ResourceState::Idle,
            pending_open: None,
            pending_closes: Vec::new(),
            close_expected: false,
        }
    }

    pub fn state(&self) -> ResourceState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ResourceState::Open
    }

    /// Records the emission of the local open performative.
    ///
    /// Legal only from `Idle` (the façade never double-opens) or from
    /// `OpeningRemote`, where the local open completes the handshake; in
    /// that case the caller completes the request itself.
    pub fn local_open(&mut self, request: AsyncRequest<T, OE>) -> ResourceState {
        debug_assert!(
            matches!(
                self.state,
                ResourceState::Idle | ResourceState::OpeningRemote
            ),
            "open from {:?}",
            self.state
        );
        debug_assert!(self.pending_open.is_none(), "an open is already in flight");

        self.state = match self.state {
            ResourceState::OpeningRemote => ResourceState::Open,
            _ => ResourceState::OpeningLocal,
        };
        self.pending_open = Some(request);
        self.state
    }

    /// Records a peer-initiated open before any local one. Only child
    /// resources are ever opened by the peer first (link reattach).
    #[allow(dead_code)]
    pub fn remote_open_first(&mut self) {
        debug_assert_eq!(self.state, ResourceState::Idle);
        self.state = ResourceState::OpeningRemote;
    }

    /// Marks that the remote open failed validation and the peer is now
    /// expected to close the resource; the pending open stays parked
    /// until that close arrives.
    pub fn expect_remote_close(&mut self) {
        self.close_expected = true;
    }

    /// Records the remote open answering our local one.
    ///
    /// Returns the open request to complete, unless the resource was
    /// marked close-expected, in which case the request stays parked for
    /// [`on_remote_closed`](Self::on_remote_closed).
    pub fn on_remote_opened(&mut self) -> Option<AsyncRequest<T, OE>> {
        match self.state {
            ResourceState::OpeningLocal if self.close_expected => None,
            ResourceState::OpeningLocal | ResourceState::Open => {
                self.state = ResourceState::Open;
                self.pending_open.take()
            }
            _ => None,
        }
    }

    /// Records a local close request.
    pub fn local_close(&mut self, request: AsyncRequest<(), CE>) -> CloseDisposition {
        match self.state {
            ResourceState::Closed | ResourceState::Failed => {
                request.succeed(());
                CloseDisposition::Completed
            }
            ResourceState::ClosingLocal => {
                // One close performative per resource; later callers ride
                // on the outcome of the first
                self.pending_closes.push(request);
                CloseDisposition::AlreadyClosing
            }
            _ => {
                self.state = ResourceState::ClosingLocal;
                self.pending_closes.push(request);
                CloseDisposition::Emit
            }
        }
    }

    /// Records the remote close performative.
    pub fn on_remote_closed(&mut self) -> RemoteClose<T, OE, CE> {
        match self.state {
            ResourceState::ClosingLocal => {
                self.state = ResourceState::Closed;
                RemoteClose::Answered {
                    pending_closes: std::mem::take(&mut self.pending_closes),
                }
            }
            _ => {
                self.state = ResourceState::ClosingRemote;
                RemoteClose::Initiated {
                    pending_open: self.pending_open.take(),
                    close_expected: self.close_expected,
                }
            }
        }
    }

    /// Records the local echo ending a peer-initiated close.
    pub fn local_close_echoed(&mut self) {
        debug_assert_eq!(self.state, ResourceState::ClosingRemote);
        self.state = ResourceState::Closed;
    }

    /// Tears the resource down, handing back every pending request so
    /// the caller can fail them.
    pub fn fail(&mut self) -> (Option<AsyncRequest<T, OE>>, Vec<AsyncRequest<(), CE>>) {
        self.state = ResourceState::Failed;
        (
            self.pending_open.take(),
            std::mem::take(&mut self.pending_closes),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::{CloseDisposition, Lifecycle, RemoteClose, ResourceState};
    use crate::requests::AsyncRequest;

    #[tokio::test]
    async fn clean_open_close_round_trip() {
        let mut lifecycle = Lifecycle::<u32, (), ()>::new();

        let (open, open_rx) = AsyncRequest::new();
        assert_eq!(lifecycle.local_open(open), ResourceState::OpeningLocal);

        lifecycle.on_remote_opened().unwrap().succeed(5);
        assert_eq!(open_rx.await.unwrap(), Ok(5));
        assert!(lifecycle.is_open());

        let (close, close_rx) = AsyncRequest::new();
        assert!(matches!(
            lifecycle.local_close(close),
            CloseDisposition::Emit
        ));
        match lifecycle.on_remote_closed() {
            RemoteClose::Answered { pending_closes } => {
                for request in pending_closes {
                    request.succeed(());
                }
            }
            other => panic!("expected Answered, got {:?}", other),
        }
        assert_eq!(close_rx.await.unwrap(), Ok(()));
        assert_eq!(lifecycle.state(), ResourceState::Closed);
    }

    #[tokio::test]
    async fn second_close_rides_on_the_first() {
        let mut lifecycle = Lifecycle::<(), (), ()>::new();
        lifecycle.local_open(AsyncRequest::noop());
        lifecycle.on_remote_opened().unwrap().succeed(());

        let (first, first_rx) = AsyncRequest::new();
        let (second, second_rx) = AsyncRequest::new();
        assert!(matches!(
            lifecycle.local_close(first),
            CloseDisposition::Emit
        ));
        assert!(matches!(
            lifecycle.local_close(second),
            CloseDisposition::AlreadyClosing
        ));

        match lifecycle.on_remote_closed() {
            RemoteClose::Answered { pending_closes } => {
                assert_eq!(pending_closes.len(), 2);
                for request in pending_closes {
                    request.succeed(());
                }
            }
            other => panic!("expected Answered, got {:?}", other),
        }
        assert_eq!(first_rx.await.unwrap(), Ok(()));
        assert_eq!(second_rx.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn close_in_terminal_state_completes_immediately() {
        let mut lifecycle = Lifecycle::<(), (), ()>::new();
        lifecycle.fail();

        let (request, rx) = AsyncRequest::new();
        assert!(matches!(
            lifecycle.local_close(request),
            CloseDisposition::Completed
        ));
        assert_eq!(rx.await.unwrap(), Ok(()));
    }

    #[test]
    fn expected_remote_close_parks_the_open_request() {
        let mut lifecycle = Lifecycle::<(), (), ()>::new();
        lifecycle.local_open(AsyncRequest::noop());
        lifecycle.expect_remote_close();

        // Validation failed: the remote open does not complete the request
        assert!(lifecycle.on_remote_opened().is_none());

        match lifecycle.on_remote_closed() {
            RemoteClose::Initiated {
                pending_open,
                close_expected,
            } => {
                assert!(pending_open.is_some());
                assert!(close_expected);
            }
            other => panic!("expected Initiated, got {:?}", other),
        }
    }

    #[test]
    fn peer_initiated_open_completes_on_local_open() {
        let mut lifecycle = Lifecycle::<(), (), ()>::new();
        lifecycle.remote_open_first();
        assert_eq!(lifecycle.state(), ResourceState::OpeningRemote);
        assert_eq!(
            lifecycle.local_open(AsyncRequest::noop()),
            ResourceState::Open
        );
    }
}
