//! Code for notifying other modules about changes in the directory.
//!
//! Consumers that derive state from the consensus (traffic-shaping
//! parameters, connection rate limits, controller event streams)
//! subscribe here and re-read what they need when an event arrives.

use crate::doc::ConsensusFlavor;
use crate::ids::RsaIdentity;

use postage::{broadcast, sink::Sink as _};

/// An event that the networkstatus code can broadcast to indicate a
/// change in the status of its directory.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum DirEvent {
    /// A new consensus has been installed as current.
    NewConsensus {
        /// The flavor that was installed.
        flavor: ConsensusFlavor,
    },
    /// Entries in the consensus were added or changed relative to the
    /// previous one.
    NetworkStatusChanged {
        /// Identities of the added or changed entries.
        changed: Vec<RsaIdentity>,
    },
    /// A freshly downloaded consensus for the flavor we use arrived
    /// and validated.
    ConsensusArrived,
    /// A document's timestamps disagree with our clock.
    ClockSkew {
        /// Apparent skew in seconds; negative means our clock is
        /// behind.
        min_skew: i64,
        /// Where the skewed document came from.
        source: String,
    },
    /// The consensus says our software version is not recommended.
    DangerousVersion {
        /// The version we are running.
        current: String,
        /// Why it is dangerous: "NEW", "OBSOLETE", or "UNRECOMMENDED".
        reason: &'static str,
        /// The versions the consensus recommends.
        recommended: String,
    },
}

/// Length of the event queue to use in publishers.
///
/// Chosen arbitrarily.
const QUEUE_LEN: usize = 64;

/// A handle to use in publishing [`DirEvent`]s.
///
/// Cloning a Publisher gives a new handle to the same queue; any event
/// sent with the clone behaves as if it were sent with the original.
#[derive(Clone)]
pub(crate) struct Publisher {
    /// Sender to use in publishing events.
    send: broadcast::Sender<DirEvent>,
}

impl Publisher {
    /// Create a new Publisher.
    #[allow(clippy::new_without_default)]
    pub(crate) fn new() -> Self {
        let (send, _recv) = broadcast::channel(QUEUE_LEN);
        Publisher { send }
    }

    /// Broadcast the provided [`DirEvent`] to every subscribed
    /// listener.
    ///
    /// Events are best-effort: if a subscriber's queue is full, or if
    /// there are no subscribers at all, the event is dropped.
    pub(crate) fn send(&self, ev: DirEvent) {
        // Clone the sender to incref it and get a mutable copy.
        // (It is an Arc internally.)
        let mut sender = self.send.clone();
        let _ignore = sender.try_send(ev);
    }

    /// Return a new receiver of events.
    ///
    /// This receiver will see every event that is sent on this
    /// publisher _after_ it was created.
    pub(crate) fn subscribe(&self) -> broadcast::Receiver<DirEvent> {
        self.send.subscribe()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use postage::stream::Stream as _;

    #[test]
    fn drop_without_subscribers() {
        let publ = Publisher::new();
        for _ in 0..1000 {
            publ.send(DirEvent::ConsensusArrived);
        }
    }

    #[test]
    fn subscribe_sees_later_events() {
        let publ = Publisher::new();
        publ.send(DirEvent::ConsensusArrived);
        let mut sub = publ.send.subscribe();
        publ.send(DirEvent::NewConsensus {
            flavor: ConsensusFlavor::Microdesc,
        });
        match sub.try_recv() {
            Ok(DirEvent::NewConsensus { flavor }) => {
                assert_eq!(flavor, ConsensusFlavor::Microdesc);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert!(sub.try_recv().is_err());
    }
}
