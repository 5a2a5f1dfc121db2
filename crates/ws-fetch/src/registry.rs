//! Routing of inbound responses.
//!
//! A response is offered, in order, to the pending request with the same id
//! (one-shot), to the broadcast listener registered for that id as a topic
//! (standing), and finally to the unhandled-response listener.

use crate::envelope::Response;
use crate::error::{Error, Result};

use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::sync::Arc;

use tokio::sync::oneshot;

/// Completion handle of one in-flight request.
pub(crate) type ResponseSender = oneshot::Sender<Result<Response>>;

/// Standing callback for a broadcast topic.
///
/// Receives `Ok` for statuses in the success range and [`Error::Status`]
/// otherwise.
pub type BroadcastListener = Arc<dyn Fn(Result<Response>) + Send + Sync>;

/// Callback for responses nobody else claimed.
pub type UnhandledResponseListener = Arc<dyn Fn(Response) + Send + Sync>;

/// Map a response onto the success/failure convention shared by waiters and
/// broadcast listeners.
fn outcome(response: Response) -> Result<Response> {
    if response.is_success() {
        Ok(response)
    } else {
        Err(Error::Status(response))
    }
}

/// In-flight requests keyed by correlation id.
#[derive(Debug, Default)]
pub(crate) struct PendingRequests {
    waiters: HashMap<String, ResponseSender>,
}

impl PendingRequests {
    /// Register a waiter. Returns the sender back if the id is already taken.
    ///
    /// Waiters whose caller has stopped listening are forgotten first, so an
    /// abandoned request never outlives the next insert.
    pub fn insert(&mut self, id: String, sender: ResponseSender) -> std::result::Result<(), ResponseSender> {
        self.waiters.retain(|_, waiter| !waiter.is_closed());
        if self.waiters.contains_key(&id) {
            return Err(sender);
        }
        self.waiters.insert(id, sender);
        Ok(())
    }

    pub fn take(&mut self, id: &str) -> Option<ResponseSender> {
        self.waiters.remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.waiters.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    /// Reject and forget every waiter.
    pub fn reject_all(&mut self, error: &Error) -> usize {
        let count = self.waiters.len();
        for (_, sender) in self.waiters.drain() {
            let _ = sender.send(Err(error.clone()));
        }
        count
    }
}

/// Broadcast listeners keyed by topic.
#[derive(Default)]
pub(crate) struct BroadcastListeners {
    listeners: HashMap<String, BroadcastListener>,
}

impl BroadcastListeners {
    /// Replace the listener for `topic`; `None` removes it.
    pub fn set(&mut self, topic: String, listener: Option<BroadcastListener>) {
        match listener {
            Some(listener) => {
                self.listeners.insert(topic, listener);
            }
            None => {
                self.listeners.remove(&topic);
            }
        }
    }

    pub fn get(&self, topic: &str) -> Option<&BroadcastListener> {
        self.listeners.get(topic)
    }
}

impl Debug for BroadcastListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.listeners.keys()).finish()
    }
}

/// Where a dispatched response ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Delivery {
    Pending,
    Broadcast,
    Unhandled,
    Dropped,
}

#[derive(Default)]
pub(crate) struct Dispatcher {
    pub pending: PendingRequests,
    pub broadcasts: BroadcastListeners,
    pub unhandled: Option<UnhandledResponseListener>,
}

impl Dispatcher {
    pub fn dispatch(&mut self, response: Response) -> Delivery {
        if let Some(sender) = self.pending.take(&response.id) {
            // The caller may have stopped waiting; the id is released either way.
            let _ = sender.send(outcome(response));
            return Delivery::Pending;
        }

        if let Some(listener) = self.broadcasts.get(&response.id) {
            listener(outcome(response));
            return Delivery::Broadcast;
        }

        if let Some(listener) = &self.unhandled {
            listener(response);
            return Delivery::Unhandled;
        }

        Delivery::Dropped
    }
}

impl Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.pending.len())
            .field("broadcasts", &self.broadcasts)
            .field("unhandled", &self.unhandled.is_some())
            .finish()
    }
}
