//! Request/reply correlation for worker inference calls.
//!
//! Every issued request gets a process-wide id and one `PendingRequest`
//! entry. The entry optionally names the sensor the audio came from and
//! optionally carries a waiter (HTTP bridge, streaming slot). Replies,
//! timeouts, expiry and restarts all remove entries through this table.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use sensor_relay_types::{BroadcastEvent, InferenceResult};
use tokio::sync::oneshot;

use crate::web::broadcast::SharedBroadcastHub;
use crate::web::error::RelayError;

/// What the waiter of a pending request eventually receives: the raw
/// worker message, or the reason it will never arrive.
pub type ReplyOutcome = Result<String, RelayError>;
pub type ReplyWaiter = oneshot::Sender<ReplyOutcome>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOrigin {
    /// Submitted over the real-time socket. Subject to the expiry sweep.
    Realtime,
    /// Submitted through the HTTP bridge, which runs its own timeout.
    Http,
}

#[derive(Debug)]
pub struct PendingRequest {
    pub id: u64,
    pub created_at: Instant,
    pub sensor_id: Option<String>,
    pub origin: RequestOrigin,
    waiter: Option<ReplyWaiter>,
}

impl PendingRequest {
    fn complete(self, outcome: ReplyOutcome) {
        if let Some(waiter) = self.waiter {
            // The waiter may have given up already (HTTP timeout raced us).
            let _ = waiter.send(outcome);
        }
    }
}

pub struct RequestCorrelator {
    next_id: u64,
    entries: HashMap<u64, PendingRequest>,
    hub: SharedBroadcastHub,
}

impl RequestCorrelator {
    pub fn new(hub: SharedBroadcastHub) -> Self {
        Self {
            next_id: 0,
            entries: HashMap::new(),
            hub,
        }
    }

    /// Allocate the next id and record the entry, sensor linkage included.
    pub fn register(
        &mut self,
        sensor_id: Option<String>,
        origin: RequestOrigin,
        waiter: Option<ReplyWaiter>,
    ) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.entries.insert(
            id,
            PendingRequest {
                id,
                created_at: Instant::now(),
                sensor_id,
                origin,
                waiter,
            },
        );
        id
    }

    /// Dispatch a worker reply. Unknown ids are dropped.
    pub fn resolve(&mut self, id: u64, message: String) -> Result<(), RelayError> {
        let Some(entry) = self.entries.remove(&id) else {
            debug!("[BRIDGE] Discarding reply for unknown request id={id}");
            return Err(RelayError::UnknownResponseId(id));
        };

        self.hub.publish(&BroadcastEvent::response(id, message.clone()));

        match InferenceResult::decode(&message) {
            Ok(result) => {
                log_model_output(id, &result);
                match &entry.sensor_id {
                    Some(sensor_id) if result.has_prediction() => {
                        info!(
                            "[BRIDGE] Sensor update: {sensor_id} -> prediction {}, confidence {}",
                            result.prediction,
                            result.confidence_or_zero()
                        );
                        self.hub.publish(&BroadcastEvent::sensor_update(
                            sensor_id.clone(),
                            result.prediction.clone(),
                            result.confidence_or_zero(),
                        ));
                    }
                    Some(sensor_id) => {
                        debug!("[BRIDGE] Reply {id} for {sensor_id} has no prediction");
                    }
                    None => {}
                }
            }
            Err(e) => warn!("[BRIDGE] Reply {id} is not an inference record ({e}): {message}"),
        }

        entry.complete(Ok(message));
        Ok(())
    }

    /// Forget an entry without notifying anyone (timed-out HTTP call,
    /// failed write). Returns whether it was still pending.
    pub fn discard(&mut self, id: u64) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Remove real-time entries older than `max_age`. Each expired id gets
    /// an error broadcast and its waiter is failed.
    pub fn expire(&mut self, max_age: Duration, now: Instant) -> Vec<u64> {
        let expired: Vec<u64> = self
            .entries
            .values()
            .filter(|entry| {
                entry.origin == RequestOrigin::Realtime
                    && now.saturating_duration_since(entry.created_at) >= max_age
            })
            .map(|entry| entry.id)
            .collect();

        for id in &expired {
            if let Some(entry) = self.entries.remove(id) {
                warn!("[BRIDGE] Request {id} expired after {max_age:?}");
                self.hub
                    .publish(&BroadcastEvent::error(RelayError::Expired(*id).to_string()));
                entry.complete(Err(RelayError::Expired(*id)));
            }
        }
        expired
    }

    /// Fail every pending entry because the worker is being replaced.
    pub fn drain(&mut self) -> usize {
        let drained: Vec<PendingRequest> = self.entries.drain().map(|(_, entry)| entry).collect();
        let count = drained.len();
        for entry in drained {
            if entry.origin == RequestOrigin::Realtime {
                self.hub.publish(&BroadcastEvent::error(format!(
                    "Request {} aborted: worker restarted",
                    entry.id
                )));
            }
            entry.complete(Err(RelayError::WorkerRestarted));
        }
        if count > 0 {
            warn!("[BRIDGE] Drained {count} pending requests for worker restart");
        }
        count
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn log_model_output(id: u64, result: &InferenceResult) {
    info!(
        "[MODEL OUTPUT] id={id} prediction={} confidence={:?} probabilities={:?} classes={:?} features={:?} rms={:?} max_amp={:?}",
        result.prediction,
        result.confidence,
        result.probabilities,
        result.classes,
        result.num_features,
        result.rms_energy,
        result.max_amplitude
    );
    if result.was_overridden {
        info!(
            "[MODEL OUTPUT] id={id} overridden for low volume, original prediction {:?}",
            result.original_prediction
        );
    }
}
