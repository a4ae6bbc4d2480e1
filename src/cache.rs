//! Correlation cache binding a request to its eventual response and ack.
//!
//! Records live here from request entry until the collector acknowledges them
//! (or the process stops). All operations run under one lock; they are short
//! and never await.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::record::{ApiCall, RequestSnapshot, ResponseSnapshot};

struct Entry {
    call: ApiCall,
    /// Monotonic start point; `duration_us` is computed from this so a
    /// wall-clock step can never produce a negative duration.
    started: Instant,
}

#[derive(Default)]
pub struct CallCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl CallCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a pending record for a freshly seen request. An existing entry
    /// under the same id is replaced; ids are UUIDs, so a collision means the
    /// id was reused deliberately.
    pub fn create(
        &self,
        request_id: &str,
        api_path: &str,
        api_method: &str,
        request: RequestSnapshot,
    ) {
        let mut call = ApiCall::new(api_path, api_method, request_id, now_millis());
        call.request = request;
        let entry = Entry {
            call,
            started: Instant::now(),
        };
        self.entries
            .lock()
            .expect("call cache lock poisoned")
            .insert(request_id.to_string(), entry);
    }

    /// Attach the response side and mark the record eligible for transmission.
    /// Unknown ids and repeated finalizes are soft errors: logged, dropped.
    pub fn finalize(&self, request_id: &str, response: ResponseSnapshot) -> Option<ApiCall> {
        let mut entries = self.entries.lock().expect("call cache lock poisoned");
        let Some(entry) = entries.get_mut(request_id) else {
            warn!(request_id, "finalize for unknown request id, dropping");
            return None;
        };
        if entry.call.finalized {
            warn!(request_id, "request id already finalized, dropping");
            return None;
        }
        entry.call.response = response;
        entry.call.duration_us = (entry.started.elapsed().as_micros() as i64).max(1);
        entry.call.finalized = true;
        debug!(request_id, size = entries.len(), "call finalized");
        entries.get(request_id).map(|entry| entry.call.clone())
    }

    /// Stable snapshot of every record that is ready to send.
    pub fn get_finalized(&self) -> Vec<ApiCall> {
        self.entries
            .lock()
            .expect("call cache lock poisoned")
            .values()
            .filter(|entry| entry.call.finalized)
            .map(|entry| entry.call.clone())
            .collect()
    }

    /// Evict an acknowledged record. Absent ids are a no-op.
    pub fn delete(&self, request_id: &str) {
        self.entries
            .lock()
            .expect("call cache lock poisoned")
            .remove(request_id);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("call cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or(0)
}
