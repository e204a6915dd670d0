//! Change-notification listener: one channel per domain, feeding the
//! debounced invalidator.
//!
//! The listener never reconnects on its own. When the transport gives
//! up, it parks in `Error` and the polling backstop bounds staleness
//! until the domain is re-acquired.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::debounce::DebouncedInvalidator;
use crate::keys::Domain;
use crate::source::{ChangeEvent, ChannelFactory};

/// Connection state of a domain's channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    /// Channel open requested, handshake not yet complete.
    Connecting = 0,
    /// Receiving events.
    Active = 1,
    /// Transport failed permanently; no internal retry.
    Error = 2,
    /// Explicitly unsubscribed.
    Closed = 3,
}

impl From<u8> for ChannelState {
    fn from(v: u8) -> Self {
        match v {
            0 => ChannelState::Connecting,
            1 => ChannelState::Active,
            2 => ChannelState::Error,
            3 => ChannelState::Closed,
            _ => ChannelState::Error,
        }
    }
}

/// Consumes one domain's change events and turns them into debounced
/// invalidation signals.
pub struct ChangeListener {
    domain: Domain,
    /// Domains additionally signalled on structural changes.
    linked: Vec<Domain>,
    invalidator: Arc<DebouncedInvalidator>,
    state: AtomicU8,
}

impl ChangeListener {
    pub fn new(
        domain: Domain,
        linked: Vec<Domain>,
        invalidator: Arc<DebouncedInvalidator>,
    ) -> Arc<Self> {
        Arc::new(Self {
            domain,
            linked,
            invalidator,
            state: AtomicU8::new(ChannelState::Connecting as u8),
        })
    }

    /// Current channel state.
    pub fn state(&self) -> ChannelState {
        ChannelState::from(self.state.load(Ordering::SeqCst))
    }

    /// Mark the channel closed after an explicit unsubscribe.
    pub fn close(&self) {
        self.set_state(ChannelState::Closed);
    }

    fn set_state(&self, state: ChannelState) {
        let previous = ChannelState::from(self.state.swap(state as u8, Ordering::SeqCst));
        if previous != state {
            debug!(domain = %self.domain, ?previous, current = ?state, "channel state change");
        }
    }

    /// Open the channel and pump events until it ends or shutdown.
    #[tracing::instrument(skip(self, channels, shutdown), fields(domain = %self.domain))]
    pub async fn run(
        self: Arc<Self>,
        channels: Arc<dyn ChannelFactory>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut events = match channels.open(&self.domain).await {
            Ok(events) => {
                self.set_state(ChannelState::Active);
                events
            }
            Err(error) => {
                warn!(domain = %self.domain, error = %error, "channel open failed");
                self.set_state(ChannelState::Error);
                return;
            }
        };

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        self.set_state(ChannelState::Closed);
                        return;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => {
                        // Transport gave up; the poller bounds staleness
                        // until the next acquisition reopens the channel.
                        warn!(domain = %self.domain, "change channel ended");
                        self.set_state(ChannelState::Error);
                        return;
                    }
                }
            }
        }
    }

    fn dispatch(&self, event: ChangeEvent) {
        trace!(
            domain = %self.domain,
            kind = %event.kind,
            row_id = event.row_id.as_deref().unwrap_or("-"),
            "change event"
        );
        self.invalidator.signal(&self.domain);
        if event.kind.is_structural() {
            for linked in &self.linked {
                self.invalidator.signal(linked);
            }
        }
    }
}
