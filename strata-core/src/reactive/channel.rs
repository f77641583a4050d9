//! Delivery channels for subscriber handlers.
//!
//! Triggered subscribers wait in their channel's FIFO queue, at most once
//! each, until someone runs the channel. Running drains only the batch that
//! was queued when the run started; anything triggered by the handlers
//! themselves waits for the next run.
//!
//! A failing handler never stops the batch. Its error goes to the channel's
//! error callback, or to the log when the channel has none.

use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

use super::runtime::Graph;
use crate::error::Error;

/// Callback receiving the errors of a channel's handlers.
pub(crate) type ErrorCallback = Rc<dyn Fn(&Error)>;

pub(crate) struct ChannelState {
    /// Subscriber entries awaiting delivery.
    pub queue: VecDeque<usize>,
    pub on_error: Option<ErrorCallback>,
}

/// A queue of triggered subscribers, drained on demand.
///
/// # Example
///
/// ```rust,ignore
/// let channel = graph.channel();
/// let sub = graph.subscribe(&channel, &count, |g| {
///     println!("count is now {}", g.get(&count)?);
///     Ok(())
/// })?;
///
/// set_count.set(&graph, 1)?;
/// channel.run(&graph); // prints "count is now 1"
/// ```
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    graph: u32,
    key: usize,
}

impl Channel {
    pub(crate) fn graph(&self) -> u32 {
        self.graph
    }

    pub(crate) fn key(&self) -> usize {
        self.key
    }

    /// Run the queued handlers. Same as [`Graph::run_channel`].
    pub fn run(&self, graph: &Graph) -> usize {
        graph.run_channel(self)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Channel({}@g{})", self.key, self.graph)
    }
}

impl Graph {
    /// Create a channel that logs handler failures.
    pub fn channel(&self) -> Channel {
        self.open_channel(None)
    }

    /// Create a channel that passes handler failures to `on_error`.
    pub fn channel_with<F>(&self, on_error: F) -> Channel
    where
        F: Fn(&Error) + 'static,
    {
        self.open_channel(Some(Rc::new(on_error)))
    }

    fn open_channel(&self, on_error: Option<ErrorCallback>) -> Channel {
        let mut store = self.store_mut();
        let key = store.channels.insert(ChannelState {
            queue: VecDeque::new(),
            on_error,
        });
        Channel {
            graph: store.id,
            key,
        }
    }

    /// Number of handlers waiting on `channel`.
    pub fn pending(&self, channel: &Channel) -> usize {
        let store = self.store();
        if channel.graph != store.id {
            return 0;
        }
        store
            .channels
            .get(channel.key)
            .map_or(0, |state| state.queue.len())
    }

    /// Run the handlers queued on `channel`, oldest first.
    ///
    /// Returns how many handlers ran.
    pub fn run_channel(&self, channel: &Channel) -> usize {
        let (batch, on_error) = {
            let mut store = self.store_mut();
            if channel.graph != store.id {
                return 0;
            }
            let Some(state) = store.channels.get_mut(channel.key) else {
                return 0;
            };
            (std::mem::take(&mut state.queue), state.on_error.clone())
        };

        let mut ran = 0;
        for key in batch {
            let (atom, handler) = {
                let mut store = self.store_mut();
                let table = &mut store.subscribers;
                let Some(entry) = table.entries.get_mut(key) else {
                    continue;
                };
                entry.queued = false;
                if entry.removed {
                    table.release_if_idle(key);
                    continue;
                }
                (entry.atom, Rc::clone(&entry.handler))
            };

            ran += 1;
            if let Err(error) = handler(self) {
                match &on_error {
                    Some(callback) => callback(&error),
                    None => tracing::warn!(%atom, %error, "subscriber failed"),
                }
            }
        }
        ran
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
