//! Reserved internal queries.
//!
//! Query names under the `_murmur_` namespace never reach the embedder;
//! a pipeline stage ahead of the snapshotter intercepts and serves
//! them. Reserved handlers:
//!
//! - `ping`: liveness/latency probe; the automatic ack is the answer.
//! - `conflict`: name-conflict disambiguation, answered with the local
//!   view of the contested member record.
//! - `install-key` / `use-key` / `remove-key` / `list-keys`: keyring
//!   rotation, see [`crate::key_manager`].

use std::sync::Arc;

use murmur_wire::{
    ConflictResponse, KeyRequestMessage, KeyResponseMessage, MessageType, decode_body,
    encode_message, peek_type,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::core::MurmurInner;
use crate::event::{Event, QueryEvent};
use crate::query::QueryParams;
use crate::{Murmur, MurmurState};

/// Name prefix marking queries and events as implementation-reserved.
pub(crate) const INTERNAL_PREFIX: &str = "_murmur_";

/// Builds the wire name of an internal query.
pub(crate) fn internal_query_name(op: &str) -> String {
    format!("{INTERNAL_PREFIX}{op}")
}

/// Spawns the pipeline stage that intercepts internal queries and
/// forwards everything else.
pub(crate) fn spawn(
    inner: Arc<MurmurInner>,
    mut rx: mpsc::Receiver<Event>,
    tx: mpsc::Sender<Event>,
) {
    let mut shutdown = inner.shutdown_rx();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(Event::Query(query)) if query.name.starts_with(INTERNAL_PREFIX) => {
                        handle_internal(&inner, &query).await;
                    }
                    Some(event) => {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                    None => return,
                },
                _ = shutdown.changed() => return,
            }
        }
    });
}

async fn handle_internal(inner: &Arc<MurmurInner>, query: &QueryEvent) {
    let op = query
        .name
        .strip_prefix(INTERNAL_PREFIX)
        .unwrap_or_default();

    match op {
        // The automatic ack already answered; nothing else to do.
        "ping" => {}
        "conflict" => handle_conflict(inner, query).await,
        "install-key" | "use-key" | "remove-key" | "list-keys" => {
            handle_key_operation(inner, op, query).await;
        }
        other => {
            warn!(op = other, "unhandled internal query");
        }
    }
}

// ============================================================================
// Conflict Resolution
// ============================================================================

/// Responds to a conflict query with our view of the contested member.
async fn handle_conflict(inner: &Arc<MurmurInner>, query: &QueryEvent) {
    let node = String::from_utf8_lossy(&query.payload).into_owned();

    if node == inner.config.node_name {
        // We are the one being disambiguated; our own answer carries no
        // information.
        debug!("ignoring conflict query about the local node");
        return;
    }

    let member = {
        let db = inner.members.lock().expect("member lock poisoned");
        db.get(&node).map(|state| state.member.clone())
    };
    let Some(member) = member else {
        debug!(node = %node, "no local record for conflicted member");
        return;
    };

    let payload = match encode_message(MessageType::ConflictResponse, &ConflictResponse { member })
    {
        Ok(raw) => raw.to_vec(),
        Err(e) => {
            warn!(error = %e, "failed to encode conflict response");
            return;
        }
    };

    if let Err(e) = query.respond(payload).await {
        warn!(error = %e, "failed to respond to conflict query");
    }
}

/// Issues the conflict query for our own name and acts on the verdict:
/// if a majority of responders disagree with our address, this
/// incarnation is the impostor and shuts itself down.
pub(crate) fn spawn_conflict_resolution(core: Arc<MurmurInner>) {
    tokio::spawn(async move {
        let local_name = core.config.node_name.clone();
        let local_addr = core.transport.local_addr();
        let murmur = Murmur::from_inner(core);

        let mut handle = match murmur
            .query(
                &internal_query_name("conflict"),
                local_name.as_bytes(),
                QueryParams::default(),
            )
            .await
        {
            Ok(handle) => handle,
            Err(e) => {
                warn!(error = %e, "failed to issue conflict query");
                return;
            }
        };

        let mut responses = 0usize;
        let mut matching = 0usize;
        while let Some(resp) = handle.next_response().await {
            let conflict: ConflictResponse = match peek_type(&resp.payload) {
                Ok((MessageType::ConflictResponse, body)) => match decode_body(body) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(from = %resp.from, error = %e, "bad conflict response");
                        continue;
                    }
                },
                _ => {
                    warn!(from = %resp.from, "bad conflict response framing");
                    continue;
                }
            };

            if conflict.member.name != local_name {
                continue;
            }
            responses += 1;
            if conflict.member.addr == local_addr {
                matching += 1;
            }
        }

        if responses == 0 {
            // Nobody else has an opinion; nothing to act on.
            return;
        }

        let majority = responses / 2 + 1;
        if matching >= majority {
            info!(
                matching,
                responses, "majority agrees with our address, staying up"
            );
            return;
        }

        error!(
            matching,
            responses, "minority in name conflict resolution, shutting down"
        );
        if murmur.state() != MurmurState::Shutdown
            && let Err(e) = murmur.shutdown().await
        {
            error!(error = %e, "shutdown after lost conflict resolution failed");
        }
    });
}

// ============================================================================
// Key Management (responder side)
// ============================================================================

async fn handle_key_operation(inner: &Arc<MurmurInner>, op: &str, query: &QueryEvent) {
    let mut response = KeyResponseMessage::default();

    match run_key_operation(inner, op, query) {
        Ok(keys) => {
            response.result = true;
            response.keys = keys;
        }
        Err(message) => {
            response.result = false;
            response.message = message;
        }
    }

    let payload = match encode_message(MessageType::KeyResponse, &response) {
        Ok(raw) => raw.to_vec(),
        Err(e) => {
            warn!(error = %e, "failed to encode key response");
            return;
        }
    };
    if let Err(e) = query.respond(payload).await {
        warn!(op, error = %e, "failed to respond to key query");
    }
}

/// Applies one keyring mutation. Returns the installed key list for
/// `list-keys`, or a failure message.
fn run_key_operation(
    inner: &Arc<MurmurInner>,
    op: &str,
    query: &QueryEvent,
) -> Result<Vec<String>, String> {
    let Some(keyring) = inner.transport.keyring() else {
        return Err("no keyring to modify".to_string());
    };

    let request: KeyRequestMessage = if query.payload.is_empty() {
        KeyRequestMessage::default()
    } else {
        decode_body(&query.payload).map_err(|e| format!("malformed key request: {e}"))?
    };

    match op {
        "install-key" => {
            keyring
                .install(&request.key)
                .map_err(|e| e.to_string())?;
        }
        "use-key" => {
            keyring
                .use_key(&request.key)
                .map_err(|e| e.to_string())?;
        }
        "remove-key" => {
            keyring
                .remove(&request.key)
                .map_err(|e| e.to_string())?;
        }
        "list-keys" => {
            return Ok(keyring.keys_base64());
        }
        other => return Err(format!("unknown key operation {other}")),
    }

    // Mutations persist before acknowledging; a node that answers
    // success and then loses the key on restart breaks the rotation.
    if let Some(path) = &inner.config.keyring_file
        && let Err(e) = keyring.save(path)
    {
        return Err(format!("keyring not persisted: {e}"));
    }

    Ok(Vec::new())
}
