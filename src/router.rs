use tracing::{debug, info};

use crate::{
    protocol,
    registry::{ClientId, Registry, SendOutcome},
};

/// Classifies one inbound text message and dispatches it through the
/// registry.
///
/// `/w <name> <text>` is a whisper (recipient and sender each see a copy),
/// `/dm <name> <text>` is a direct message (recipient only); the whisper
/// marker is checked first. Anything else, including a marker with too few
/// tokens, is a public broadcast — there is no escaping, so a broadcast
/// that happens to start with a marker is misrouted (inherited limitation).
pub async fn route(registry: &Registry, sender: ClientId, sender_name: &str, text: &str) {
    let words: Vec<&str> = text.split_whitespace().collect();
    match words.as_slice() {
        [marker, recipient, body @ ..]
            if *marker == protocol::WHISPER_MARKER && !body.is_empty() =>
        {
            whisper(registry, sender, sender_name, recipient, &body.join(" ")).await;
        }
        [marker, recipient, body @ ..]
            if *marker == protocol::DIRECT_MARKER && !body.is_empty() =>
        {
            direct_message(registry, sender, sender_name, recipient, &body.join(" ")).await;
        }
        _ => {
            info!(from = sender_name, "broadcasting message");
            registry
                .broadcast(&protocol::broadcast_line(sender_name, text))
                .await;
        }
    }
}

async fn whisper(
    registry: &Registry,
    sender: ClientId,
    sender_name: &str,
    recipient: &str,
    body: &str,
) {
    let Some(target) = registry.lookup_by_name(recipient).await else {
        registry.send_to(sender, &protocol::not_found(recipient)).await;
        return;
    };

    info!(from = sender_name, to = recipient, "routing whisper");
    let delivered = deliver(registry, target, &protocol::whisper_to_recipient(sender_name, body)).await;
    if delivered == SendOutcome::Delivered {
        registry
            .send_to(sender, &protocol::whisper_echo(recipient, body))
            .await;
    }
}

async fn direct_message(
    registry: &Registry,
    sender: ClientId,
    sender_name: &str,
    recipient: &str,
    body: &str,
) {
    let Some(target) = registry.lookup_by_name(recipient).await else {
        registry.send_to(sender, &protocol::not_found(recipient)).await;
        return;
    };

    info!(from = sender_name, to = recipient, "routing direct message");
    deliver(registry, target, &protocol::direct_message(sender_name, body)).await;
}

/// Targeted delivery honoring the `send_to` contract: a failed send means
/// the recipient's transport is broken, so it is unregistered and the
/// remaining sessions get a presence update.
async fn deliver(registry: &Registry, target: ClientId, line: &str) -> SendOutcome {
    let outcome = registry.send_to(target, line).await;
    if outcome == SendOutcome::Failed {
        debug!(client = target, "recipient unreachable, unregistering");
        if registry.unregister(target).await.is_some() {
            registry.broadcast_presence().await;
        }
    }
    outcome
}
