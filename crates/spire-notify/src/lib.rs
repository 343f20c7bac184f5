// Address-prefix notification service: the subscriber index with TTL and the
// worker that joins chain events against it.

mod index;
mod worker;

pub use index::{AddressKey, Matched, SubscribeOutcome, SubscriberIndex, SubscriptionKey};
pub use worker::{
    candidate_fields, purge_interval, NotificationWorker, NotifySink, SinkError,
    ADDRESS_UPDATE_COMMAND,
};
