//! Realtime Transcript Aggregator (C5): merges delta events from the
//! remote stream into active utterances keyed by `(response, item)`.
//!
//! Grounded in the teacher's `TranscriptResult`/`TranscriptRole` shapes in
//! `core::realtime::base`, generalized to the full delta/final/`response.done`
//! handling §4.5 requires.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tracing::warn;

use crate::events::{AsyncHandler, Emitter, Subscription};

/// §3 `Utterance State`.
#[derive(Debug, Clone, PartialEq)]
pub struct UtteranceState {
    pub utterance_id: String,
    pub session_id: String,
    pub content: String,
    pub chunk_count: u32,
    pub sequence: u32,
    pub start_timestamp: u64,
    pub last_updated: u64,
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptDeltaEvent {
    pub utterance_id: String,
    pub delta: String,
    pub content: String,
    pub sequence: u32,
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptFinalEvent {
    pub utterance_id: String,
    pub session_id: String,
    pub content: String,
    pub end_offset_ms: u64,
}

/// Raw inbound event from the data channel, before extraction. `kind`
/// carries the recognized type strings from §4.5 (e.g.
/// `"response.output_text.delta"`, `"response.done"`).
#[derive(Debug, Clone)]
pub struct RawRealtimeEvent {
    pub kind: String,
    pub response_id: Option<String>,
    pub item_id: Option<String>,
    pub payload: Value,
}

fn is_delta_kind(kind: &str) -> bool {
    matches!(
        kind,
        "response.output_text.delta"
            | "response.text.delta"
            | "response.audio_transcript.delta"
            | "response.output_audio_transcript.delta"
            | "response.output_audio_transcription.delta"
            | "conversation.item.audio_transcription.delta"
    )
}

fn is_final_kind(kind: &str) -> bool {
    matches!(
        kind,
        "response.output_text.done"
            | "response.text.done"
            | "response.audio_transcript.done"
            | "response.output_audio_transcript.done"
            | "response.output_audio_transcription.completed"
            | "conversation.item.audio_transcription.completed"
    )
}

/// §4.5 text extraction rule: string, `{text}`, `{transcript}`, `{delta:
/// string}` nested — first non-empty match wins, in that priority.
pub fn extract_text(payload: &Value) -> Option<String> {
    if let Some(s) = payload.as_str() {
        if !s.is_empty() {
            return Some(s.to_string());
        }
        return None;
    }
    if let Some(obj) = payload.as_object() {
        if let Some(text) = obj.get("text").and_then(Value::as_str) {
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
        if let Some(transcript) = obj.get("transcript").and_then(Value::as_str) {
            if !transcript.is_empty() {
                return Some(transcript.to_string());
            }
        }
        if let Some(delta) = obj.get("delta") {
            if let Some(s) = delta.as_str() {
                if !s.is_empty() {
                    return Some(s.to_string());
                }
            } else if let Some(nested) = delta.as_object() {
                if let Some(text) = nested.get("text").and_then(Value::as_str) {
                    if !text.is_empty() {
                        return Some(text.to_string());
                    }
                }
                if let Some(transcript) = nested.get("transcript").and_then(Value::as_str) {
                    if !transcript.is_empty() {
                        return Some(transcript.to_string());
                    }
                }
            }
        }
    }
    None
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn utterance_id(response_id: &str, item_id: Option<&str>) -> String {
    match item_id {
        Some(item) => format!("{response_id}-{item}"),
        None => response_id.to_string(),
    }
}

/// C5. One instance per session.
pub struct TranscriptAggregator {
    session_id: String,
    active: parking_lot::Mutex<HashMap<String, UtteranceState>>,
    on_delta: Emitter<TranscriptDeltaEvent>,
    on_final: Emitter<TranscriptFinalEvent>,
}

impl TranscriptAggregator {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            active: parking_lot::Mutex::new(HashMap::new()),
            on_delta: Emitter::new(),
            on_final: Emitter::new(),
        }
    }

    pub fn on_delta(&self, handler: AsyncHandler<TranscriptDeltaEvent>) -> Subscription<TranscriptDeltaEvent> {
        self.on_delta.subscribe(handler)
    }

    pub fn on_final(&self, handler: AsyncHandler<TranscriptFinalEvent>) -> Subscription<TranscriptFinalEvent> {
        self.on_final.subscribe(handler)
    }

    /// Dispatches a raw inbound event per §4.5's state transitions.
    pub async fn handle_event(&self, event: RawRealtimeEvent) {
        let Some(response_id) = event.response_id.clone() else {
            warn!(kind = %event.kind, "realtime event missing response_id, dropped");
            return;
        };

        if event.kind == "response.done" {
            self.finalize_response(&response_id).await;
            return;
        }

        let uid = utterance_id(&response_id, event.item_id.as_deref());

        if is_delta_kind(&event.kind) {
            self.handle_delta(uid, event.payload).await;
        } else if is_final_kind(&event.kind) {
            self.handle_final(uid, event.payload).await;
        }
    }

    async fn handle_delta(&self, uid: String, payload: Value) {
        // B3: delta with empty/missing text is dropped without mutating state.
        let Some(text) = extract_text(&payload) else {
            return;
        };

        let event = {
            let mut active = self.active.lock();
            let entry = active.entry(uid.clone()).or_insert_with(|| UtteranceState {
                utterance_id: uid.clone(),
                session_id: self.session_id.clone(),
                content: String::new(),
                chunk_count: 0,
                sequence: 0,
                start_timestamp: now_ms(),
                last_updated: now_ms(),
                confidence: None,
            });

            entry.content.push_str(&text);
            entry.chunk_count += 1;
            let sequence = entry.sequence;
            entry.sequence += 1;
            entry.last_updated = now_ms();

            TranscriptDeltaEvent {
                utterance_id: uid,
                delta: text,
                content: entry.content.clone(),
                sequence,
                confidence: entry.confidence,
            }
        };

        self.on_delta.emit(event).await;
    }

    async fn handle_final(&self, uid: String, payload: Value) {
        let final_event = {
            let mut active = self.active.lock();
            let Some(mut state) = active.remove(&uid) else {
                return;
            };
            if let Some(text) = extract_text(&payload) {
                state.content = text;
            }
            let end_offset_ms = (now_ms().saturating_sub(state.start_timestamp)).max(1);
            TranscriptFinalEvent {
                utterance_id: state.utterance_id,
                session_id: state.session_id,
                content: state.content,
                end_offset_ms,
            }
        };
        self.on_final.emit(final_event).await;
    }

    /// `response.done`: finalize every active utterance for this response.
    async fn finalize_response(&self, response_id: &str) {
        let matching: Vec<String> = {
            let active = self.active.lock();
            active
                .keys()
                .filter(|uid| uid.as_str() == response_id || uid.starts_with(&format!("{response_id}-")))
                .cloned()
                .collect()
        };

        for uid in matching {
            self.handle_final(uid, Value::Null).await;
        }
    }

    pub fn active_utterance_count(&self) -> usize {
        self.active.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn event(kind: &str, response_id: &str, item_id: Option<&str>, payload: Value) -> RawRealtimeEvent {
        RawRealtimeEvent {
            kind: kind.to_string(),
            response_id: Some(response_id.to_string()),
            item_id: item_id.map(str::to_string),
            payload,
        }
    }

    #[test]
    fn extraction_priority_matches_scenario_6() {
        assert_eq!(extract_text(&json!("hello world")), Some("hello world".to_string()));
        assert_eq!(
            extract_text(&json!({"text": "normalized"})),
            Some("normalized".to_string())
        );
        assert_eq!(
            extract_text(&json!({"transcript": "fallback"})),
            Some("fallback".to_string())
        );
        assert_eq!(extract_text(&json!({"confidence": 0.45})), None);
    }

    #[tokio::test]
    async fn deltas_concatenate_in_order_p2() {
        let aggregator = TranscriptAggregator::new("sess-1");
        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let received_clone = received.clone();
        aggregator.on_delta(Arc::new(move |e: TranscriptDeltaEvent| {
            let received = received_clone.clone();
            Box::pin(async move {
                received.lock().push(e);
            })
        }));

        aggregator
            .handle_event(event(
                "response.output_text.delta",
                "resp-1",
                Some("item-1"),
                json!("hello "),
            ))
            .await;
        aggregator
            .handle_event(event(
                "response.output_text.delta",
                "resp-1",
                Some("item-1"),
                json!("world"),
            ))
            .await;

        let events = received.lock();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].content, "hello ");
        assert_eq!(events[1].content, "hello world");
        assert_eq!(events[0].sequence, 0);
        assert_eq!(events[1].sequence, 1);
    }

    #[tokio::test]
    async fn response_done_finalizes_all_matching_utterances_p3() {
        let aggregator = TranscriptAggregator::new("sess-1");
        let finals = Arc::new(AtomicU32::new(0));
        let finals_clone = finals.clone();
        aggregator.on_final(Arc::new(move |_: TranscriptFinalEvent| {
            let finals = finals_clone.clone();
            Box::pin(async move {
                finals.fetch_add(1, Ordering::SeqCst);
            })
        }));

        aggregator
            .handle_event(event("response.output_text.delta", "resp-1", Some("a"), json!("hi")))
            .await;
        aggregator
            .handle_event(event("response.output_text.delta", "resp-1", Some("b"), json!("there")))
            .await;
        assert_eq!(aggregator.active_utterance_count(), 2);

        aggregator
            .handle_event(RawRealtimeEvent {
                kind: "response.done".to_string(),
                response_id: Some("resp-1".to_string()),
                item_id: None,
                payload: Value::Null,
            })
            .await;

        assert_eq!(finals.load(Ordering::SeqCst), 2);
        assert_eq!(aggregator.active_utterance_count(), 0);
    }

    #[tokio::test]
    async fn empty_delta_is_dropped_b3() {
        let aggregator = TranscriptAggregator::new("sess-1");
        aggregator
            .handle_event(event("response.output_text.delta", "resp-1", Some("a"), json!("")))
            .await;
        assert_eq!(aggregator.active_utterance_count(), 0);
    }

    #[tokio::test]
    async fn event_missing_response_id_is_dropped() {
        let aggregator = TranscriptAggregator::new("sess-1");
        aggregator
            .handle_event(RawRealtimeEvent {
                kind: "response.output_text.delta".to_string(),
                response_id: None,
                item_id: None,
                payload: json!("hi"),
            })
            .await;
        assert_eq!(aggregator.active_utterance_count(), 0);
    }
}
