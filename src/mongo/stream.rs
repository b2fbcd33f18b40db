// ABOUTME: Change stream helpers for the MongoDB backend
// ABOUTME: Builds the watch pipeline and converts events and resume tokens to JSON

use anyhow::{anyhow, Context};
use bson::{doc, Bson, Document};
use mongodb::change_stream::event::ResumeToken;
use serde_json::Value;

use crate::capture::subscription::ChangeEvent;
use crate::error::{CdcError, Result};

/// Operation types forwarded to the sink. Deletes carry no document and are skipped.
pub const WATCHED_OPERATIONS: [&str; 3] = ["insert", "update", "replace"];

/// `$match` on watched operations, then `$project` down to what consumers read.
/// `_id` must survive the projection; it is the resume token.
pub fn watch_pipeline() -> Vec<Document> {
    vec![
        doc! { "$match": { "operationType": { "$in": WATCHED_OPERATIONS.to_vec() } } },
        doc! { "$project": { "_id": 1, "documentKey": 1, "fullDocument": 1, "ns": 1 } },
    ]
}

/// Serialize the `_id` of a change event as relaxed extended JSON.
pub fn encode_resume_token(id: &Document) -> String {
    Bson::Document(id.clone()).into_relaxed_extjson().to_string()
}

/// Reverse of [`encode_resume_token`].
pub fn decode_resume_token(token: &str) -> anyhow::Result<ResumeToken> {
    let json: Value = serde_json::from_str(token).context("Resume token is not JSON")?;
    let document = match Bson::try_from(json).context("Resume token is not extended JSON")? {
        Bson::Document(document) => document,
        other => {
            return Err(anyhow!(
                "Resume token must be a document, got {:?}",
                other.element_type()
            ))
        }
    };
    let bytes = bson::to_vec(&document).context("Failed to encode resume token")?;
    bson::from_slice(&bytes).context("Failed to decode resume token")
}

/// Resume position for a stored token, falling back to "now" when it cannot be used.
pub fn resume_position(source: &str, token: Option<&str>) -> Option<ResumeToken> {
    let token = token?;
    match decode_resume_token(token) {
        Ok(resume) => Some(resume),
        Err(e) => {
            tracing::warn!(
                "Ignoring undecodable resume token for '{}', subscribing from now: {:#}",
                source,
                e
            );
            None
        }
    }
}

/// Turn one projected change event into the document delivered to the sink.
pub fn to_change_event(event: Document) -> Result<ChangeEvent> {
    let resume_token = match event.get("_id") {
        Some(Bson::Document(id)) => encode_resume_token(id),
        _ => {
            return Err(CdcError::backend(
                "Read change stream",
                "event has no resume token",
            ))
        }
    };
    Ok(ChangeEvent {
        document: Bson::Document(event).into_relaxed_extjson(),
        resume_token,
    })
}
