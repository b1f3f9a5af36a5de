//! Message bus between CA plug-ins and the application.
//!
//! Messages bound for the application are either handed to a callback or
//! queued for [`CaManager::get_msg`](super::CaManager::get_msg). A message
//! takes exactly one of the two paths: callbacks only see messages that
//! arrive while they are installed, and a queued message is removed by the
//! first `get_msg` that matches it.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use caman_protocol::{CaError, CaMessage, Destination, Message};

use super::Shared;
use crate::plugin::CaResult;

/// Push-style consumer of application-bound messages. The callback owns the
/// message it receives and should hand it back with
/// [`CaManager::free_msg`](super::CaManager::free_msg).
pub type MsgCallback = Arc<dyn Fn(Message) + Send + Sync>;

/// Queued messages kept before the oldest is dropped.
pub const MAX_QUEUED_MESSAGES: usize = 1024;

#[derive(Default)]
struct BusInner {
    queue: VecDeque<Message>,
    callbacks: HashMap<String, MsgCallback>,
    default_callback: Option<MsgCallback>,
}

#[derive(Default)]
pub(crate) struct MessageBus {
    inner: Mutex<BusInner>,
    available: Condvar,
}

impl MessageBus {
    /// Deliver an application-bound message. Messages the bus could not keep
    /// (the oldest of a full queue, or `msg` itself when the queue cannot
    /// grow) come back with the outcome; the caller frees them.
    pub(crate) fn deliver(&self, msg: Message) -> (CaResult, Vec<Message>) {
        let mut inner = self.inner.lock();

        let callback = inner
            .callbacks
            .get(&msg.ca_name)
            .or(inner.default_callback.as_ref())
            .cloned();
        if let Some(callback) = callback {
            drop(inner);
            callback(msg);
            return (Ok(()), Vec::new());
        }

        let mut dropped = Vec::new();
        if inner.queue.len() >= MAX_QUEUED_MESSAGES {
            if let Some(old) = inner.queue.pop_front() {
                warn!(
                    "Message queue full, dropping {} from {}",
                    old.message_type().name(),
                    old.ca_name
                );
                dropped.push(old);
            }
        }
        if let Err(e) = inner.queue.try_reserve(1) {
            warn!("Cannot queue {} from {}", msg.message_type().name(), msg.ca_name);
            dropped.push(msg);
            return (Err(CaError::from(e)), dropped);
        }
        inner.queue.push_back(msg);
        drop(inner);

        self.available.notify_all();
        (Ok(()), dropped)
    }

    /// Take the oldest queued message whose source matches `filter`, waiting
    /// up to `timeout` for one to arrive.
    pub(crate) fn take(&self, filter: Option<&str>, timeout: Duration) -> CaResult<Message> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();

        loop {
            let found = inner
                .queue
                .iter()
                .position(|m| filter.map_or(true, |name| m.ca_name == name));
            if let Some(msg) = found.and_then(|pos| inner.queue.remove(pos)) {
                return Ok(msg);
            }
            if self.available.wait_until(&mut inner, deadline).timed_out() {
                let found = inner
                    .queue
                    .iter()
                    .position(|m| filter.map_or(true, |name| m.ca_name == name));
                return found
                    .and_then(|pos| inner.queue.remove(pos))
                    .ok_or(CaError::Timeout);
            }
        }
    }

    /// Install or remove a callback. `None` as name addresses the callback
    /// used for plug-ins without one of their own.
    pub(crate) fn set_callback(&self, name: Option<&str>, callback: Option<MsgCallback>) {
        let mut inner = self.inner.lock();
        match (name, callback) {
            (Some(name), Some(cb)) => {
                inner.callbacks.insert(name.to_string(), cb);
            }
            (Some(name), None) => {
                inner.callbacks.remove(name);
            }
            (None, cb) => inner.default_callback = cb,
        }
    }

    /// Remove every queued message produced by `name`.
    pub(crate) fn drain_from(&self, name: &str) -> Vec<Message> {
        let mut inner = self.inner.lock();
        let (drained, kept): (VecDeque<_>, VecDeque<_>) =
            inner.queue.drain(..).partition(|m| m.ca_name == name);
        inner.queue = kept;
        drained.into()
    }

    pub(crate) fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }
}

/// Handle a plug-in uses to push messages to the manager and application.
///
/// Sending is refused while the plug-in is not enabled.
#[derive(Clone)]
pub struct MsgSender {
    name: String,
    shared: Weak<Shared>,
}

impl fmt::Debug for MsgSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgSender").field("name", &self.name).finish()
    }
}

impl MsgSender {
    pub(crate) fn new(name: &str, shared: &Arc<Shared>) -> Self {
        Self {
            name: name.to_string(),
            shared: Arc::downgrade(shared),
        }
    }

    /// Name of the plug-in this sender belongs to.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn send(&self, dest: Destination, body: CaMessage) -> CaResult {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| CaError::Unavailable("CA manager is gone".into()))?;
        debug!("{} -> {:?}: {}", self.name, dest, body.message_type().name());
        shared.route(Message::new(self.name.clone(), dest, body))
    }
}
