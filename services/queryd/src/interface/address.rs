// Handler for address.subscribe, the one command that mutates server state.
use std::sync::Arc;

use spire_notify::{AddressKey, SubscribeOutcome};
use spire_wire::{payload, Envelope, ErrorCode};

use crate::dispatch::{HandlerFuture, ServerContext};

pub fn subscribe(ctx: Arc<ServerContext>, request: Envelope) -> HandlerFuture {
    Box::pin(async move {
        let subscription = match payload::decode_subscribe_request(&request.data) {
            Ok(subscription) => subscription,
            Err(code) => return payload::encode_code(code),
        };

        let route = request.route();
        // Subscriptions are owned by the router identity; a dealer-side
        // frame with no identity cannot subscribe.
        if route.dest.is_empty() {
            return payload::encode_code(ErrorCode::BadStream);
        }
        let key = AddressKey::from_dest(&route.dest);

        if subscription.unsubscribe {
            ctx.index.unsubscribe(&key, &subscription.prefix);
            return payload::encode_code(ErrorCode::Success);
        }

        tracing::debug!(
            bit_len = subscription.prefix.bit_len(),
            "address.subscribe"
        );
        match ctx
            .index
            .subscribe(key, subscription.prefix, route, ctx.subscription_ttl)
        {
            SubscribeOutcome::Created | SubscribeOutcome::Refreshed => {
                payload::encode_code(ErrorCode::Success)
            }
            SubscribeOutcome::Evicted => payload::encode_code(ErrorCode::SubscriptionLimit),
        }
    })
}
