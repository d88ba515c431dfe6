// Copyright 2025 The Uptane Client Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Durable queue of event reports for the backend.
//!
//! Reports survive process restarts and failed uploads; the queue is flushed
//! oldest-first and an entry is only dropped once the backend accepted it,
//! which gives at-least-once delivery.

use crate::error::Result;
use crate::metadata::format_datetime;
use crate::storage::Storage;
use crate::transport::{self, Transport};
use chrono::Utc;
use log::warn;
use serde_json::{json, Value};
use uuid::Uuid;

/// Enqueue one event report.
pub fn enqueue(
    storage: &mut dyn Storage,
    event_id: &str,
    event_version: u32,
    event: Value,
) -> Result<()> {
    let report = json!({
        "id": Uuid::new_v4().to_string(),
        "deviceTime": format_datetime(&Utc::now()),
        "eventType": {"id": event_id, "version": event_version},
        "event": event,
    });
    storage.enqueue_report(&report)?;
    Ok(())
}

/// Upload queued reports oldest-first, stopping at the first failure.
///
/// Returns how many reports the backend accepted. Remaining entries stay
/// queued for the next flush.
pub async fn flush(
    storage: &mut dyn Storage,
    transport: &mut dyn Transport,
    server: &str,
) -> Result<usize> {
    let mut delivered = 0;
    for (seq, report) in storage.load_reports()? {
        let url = format!("{}/events", server);
        match transport::post_json(transport, &url, &report).await {
            Ok(()) => {
                storage.remove_report(seq)?;
                delivered += 1;
            }
            Err(e) => {
                warn!("report upload failed, keeping {} queued: {}", seq, e);
                break;
            }
        }
    }
    Ok(delivered)
}
