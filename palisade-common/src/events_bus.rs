use tokio::sync::broadcast;

/// Fan-out for channel events. Connection lifecycle changes and inbound
/// messages are published onto a bus and observed by however many
/// subscribers care - frequently none, outside of tests.
///
/// Semantics worth knowing:
///
/// - Cloning the bus yields another publishing/subscribing handle onto
///   the same event stream.
/// - A subscription carries only events published after it was opened, so
///   subscribe *before* triggering whatever you want to observe.
/// - Publishing never blocks and never fails: with nobody subscribed the
///   event simply evaporates, and a subscriber that falls too far behind
///   loses its oldest events rather than stalling the publisher. A
///   connection task must never be wedged by a slow observer.
///
/// [`tokio::sync::broadcast`] has exactly those trade-offs, so this is a
/// thin skin over it.
#[derive(Clone)]
pub struct EventsBus<T> {
    event_tx: broadcast::Sender<T>,
}

impl<T: Clone> EventsBus<T> {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let (event_tx, _rx) =
            broadcast::channel(crate::DEFAULT_CHANNEL_SIZE);
        Self { event_tx }
    }

    /// Publish one event to whoever is currently subscribed.
    pub fn notify(&self, event: T) {
        // A send with no live receivers reports an error; for a bus that
        // is the uninteresting case, not a failure.
        let _ = self.event_tx.send(event);
    }

    /// Open a subscription covering everything published from this point
    /// on.
    pub fn subscribe(&self) -> EventsRx<'_, T> {
        EventsRx {
            _event_tx: &self.event_tx,
            event_rx: self.event_tx.subscribe(),
        }
    }
}

/// One subscriber's view of an [`EventsBus`].
pub struct EventsRx<'a, T> {
    // Borrowing the sender pins the channel open for as long as the
    // subscription lives.
    _event_tx: &'a broadcast::Sender<T>,
    event_rx: broadcast::Receiver<T>,
}

impl<T: Clone> EventsRx<'_, T> {
    /// The next event, whatever it is. Pair with a timeout; a bus has no
    /// end.
    pub async fn next(&mut self) -> T {
        self.next_filtered(|_| true).await
    }

    /// The next event satisfying `filter`, discarding the rest. This is
    /// how tests wait for, say, the disconnect of one particular address.
    pub async fn next_filtered(&mut self, filter: impl Fn(&T) -> bool) -> T {
        use tokio::sync::broadcast::error::RecvError;
        loop {
            match self.event_rx.recv().await {
                Ok(event) if filter(&event) => return event,
                Ok(_uninteresting) => (),
                // We overran and lost some events. The one being waited
                // for may have been among them; all we can do is keep
                // reading and rely on the caller's timeout.
                Err(RecvError::Lagged(_)) => (),
                Err(RecvError::Closed) => unreachable!(
                    "The subscription borrows the sender, so the channel \
                     outlives it"
                ),
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn subscriptions_start_at_the_present() {
        let bus = EventsBus::<&str>::new();
        bus.notify("lost to history");

        let mut rx = bus.subscribe();
        bus.notify("first");
        bus.notify("second");
        bus.notify("third");

        assert_eq!(rx.next().await, "first");
        assert_eq!(rx.next_filtered(|e| e.ends_with("ird")).await, "third");
    }
}
