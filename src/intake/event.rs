//! Inbound object-creation events.
//!
//! We accept our own flat [`InboundEvent`] as well as the storage
//! notification and queue envelope shapes that object stores deliver.

use crate::prelude::*;

/// One uploaded object.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct InboundEvent {
    /// The storage location (bucket) holding the object.
    pub source_location: String,
    /// The object's key within the location.
    pub object_key: String,
    /// When the object was created, if known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_time: Option<DateTime<Utc>>,
}

impl InboundEvent {
    /// The last path segment of the key.
    pub fn filename(&self) -> &str {
        self.object_key
            .rsplit('/')
            .next()
            .unwrap_or(&self.object_key)
    }
}

/// A storage notification record.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageRecord {
    event_source: Option<String>,
    event_time: Option<DateTime<Utc>>,
    s3: StorageEntity,
}

#[derive(Debug, Deserialize)]
struct StorageEntity {
    bucket: StorageBucket,
    object: StorageObject,
}

#[derive(Debug, Deserialize)]
struct StorageBucket {
    name: String,
}

#[derive(Debug, Deserialize)]
struct StorageObject {
    key: String,
}

/// Object keys in notifications are form-encoded.
fn decode_key(key: &str) -> Result<String> {
    let spaced = key.replace('+', " ");
    let decoded = urlencoding::decode(&spaced)
        .with_context(|| format!("object key {key:?} is not valid UTF-8"))?;
    Ok(decoded.into_owned())
}

/// Extract every inbound event from a payload.
///
/// Payload shapes:
///
/// - `{"source_location": ..., "object_key": ...}`
/// - `{"Records": [{"eventSource": "aws:s3", "s3": {...}}]}`
/// - `{"Records": [{"eventSource": "aws:sqs", "body": "<JSON payload>"}]}`
///
/// Test events and records from other sources are skipped.
pub fn parse_events(payload: &Value) -> Result<Vec<InboundEvent>> {
    if payload.get("Event").and_then(Value::as_str) == Some("s3:TestEvent") {
        debug!("Skipping storage test event");
        return Ok(vec![]);
    }
    let Some(records) = payload.get("Records") else {
        let event = serde_json::from_value::<InboundEvent>(payload.clone())
            .context("payload is neither an inbound event nor a notification")?;
        return Ok(vec![event]);
    };
    let records = records
        .as_array()
        .ok_or_else(|| anyhow!("\"Records\" must be an array"))?;

    let mut events = vec![];
    for record in records {
        match record.get("eventSource").and_then(Value::as_str) {
            Some("aws:sqs") => {
                let body = record
                    .get("body")
                    .and_then(Value::as_str)
                    .ok_or_else(|| anyhow!("queue record has no body"))?;
                let inner: Value = serde_json::from_str(body)
                    .with_context(|| format!("cannot parse queue message body {body:?}"))?;
                events.extend(parse_events(&inner)?);
            }
            Some("aws:s3") => {
                let record = serde_json::from_value::<StorageRecord>(record.clone())
                    .context("cannot parse storage notification record")?;
                trace!(source = ?record.event_source, "Storage record");
                events.push(InboundEvent {
                    source_location: record.s3.bucket.name,
                    object_key: decode_key(&record.s3.object.key)?,
                    event_time: record.event_time,
                });
            }
            other => debug!(source = ?other, "Skipping record from unknown source"),
        }
    }
    Ok(events)
}
