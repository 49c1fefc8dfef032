//! Safe recovery checkpoint builder.
//!
//! Given a transcript of provider-agnostic [`Message`]s, produces a prefix
//! that is always safe to hand back to the model as a resume point: either a
//! committed non-tool message, or a complete assistant-tool-call →
//! tool-result group. A trailing assistant message with tool-call parts
//! whose results never arrived (the process restarted mid-turn) is closed
//! out with synthesized failed tool-result messages rather than dropped or
//! left dangling.

use std::collections::HashSet;

use crate::tool::{ContentPart, Message, MessageContent, Role};

/// Default placeholder used for synthesized tool-result output when the
/// caller doesn't supply one.
pub const DEFAULT_RESTART_NOTICE: &str = "server restarted";

/// Scan `messages` once, left-to-right, and return a safe-to-resume prefix.
///
/// `restart_notice` becomes the `content` of any synthesized tool-result
/// messages closing out tool calls that never got a response.
pub fn build_safe_recovery_checkpoint(messages: &[Message], restart_notice: &str) -> Vec<Message> {
    let mut committed_index: Option<usize> = None;
    let mut open_tool_calls: HashSet<String> = HashSet::new();
    let mut last_open_segment_index: Option<usize> = None;

    for (i, message) in messages.iter().enumerate() {
        if !open_tool_calls.is_empty() {
            if message.role != Role::Tool {
                // Invalid continuation: stop at the end of the previous
                // open segment, leaving this tool call unresolved.
                break;
            }
            for id in tool_result_ids(message) {
                open_tool_calls.remove(&id);
            }
            if open_tool_calls.is_empty() {
                committed_index = Some(i);
                last_open_segment_index = None;
            }
            continue;
        }

        if message.role == Role::Tool {
            // A standalone tool message with no open expectation is invalid.
            break;
        }

        if message.role == Role::Assistant {
            let ids = tool_call_ids(message);
            if !ids.is_empty() {
                open_tool_calls = ids;
                last_open_segment_index = Some(i);
                continue;
            }
        }

        committed_index = Some(i);
    }

    if open_tool_calls.is_empty() {
        return match committed_index {
            Some(idx) => messages[..=idx].to_vec(),
            None => Vec::new(),
        };
    }

    let base_end = last_open_segment_index.expect("open tool calls imply an open segment");
    let mut result = messages[..=base_end].to_vec();

    let mut ids: Vec<&String> = open_tool_calls.iter().collect();
    ids.sort();
    for call_id in ids {
        let tool_name = tool_name_for_call(messages, base_end, call_id).unwrap_or_default();
        result.push(synthesize_failed_tool_result(call_id, &tool_name, restart_notice));
    }

    result
}

fn tool_call_ids(message: &Message) -> HashSet<String> {
    match &message.content {
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolUse { id, .. } => Some(id.clone()),
                _ => None,
            })
            .collect(),
        MessageContent::Text(_) => HashSet::new(),
    }
}

fn tool_result_ids(message: &Message) -> HashSet<String> {
    match &message.content {
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                _ => None,
            })
            .collect(),
        MessageContent::Text(_) => HashSet::new(),
    }
}

fn tool_name_for_call(messages: &[Message], assistant_index: usize, call_id: &str) -> Option<String> {
    match &messages[assistant_index].content {
        MessageContent::Parts(parts) => parts.iter().find_map(|p| match p {
            ContentPart::ToolUse { id, name, .. } if id == call_id => Some(name.clone()),
            _ => None,
        }),
        MessageContent::Text(_) => None,
    }
}

fn synthesize_failed_tool_result(call_id: &str, _tool_name: &str, restart_notice: &str) -> Message {
    Message {
        role: Role::Tool,
        content: MessageContent::Parts(vec![ContentPart::ToolResult {
            tool_use_id: call_id.to_string(),
            content: restart_notice.to_string(),
            is_error: true,
        }]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assistant_tool_call(id: &str, name: &str) -> Message {
        Message {
            role: Role::Assistant,
            content: MessageContent::Parts(vec![ContentPart::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input: serde_json::json!({}),
            }]),
        }
    }

    fn tool_result(id: &str) -> Message {
        Message::tool_result(id, "ok")
    }

    #[test]
    fn empty_transcript_yields_empty_checkpoint() {
        let out = build_safe_recovery_checkpoint(&[], DEFAULT_RESTART_NOTICE);
        assert!(out.is_empty());
    }

    #[test]
    fn closed_transcript_is_unchanged() {
        let messages = vec![
            Message::user("hi"),
            assistant_tool_call("c1", "search"),
            tool_result("c1"),
            Message::assistant("done"),
        ];
        let out = build_safe_recovery_checkpoint(&messages, DEFAULT_RESTART_NOTICE);
        assert_eq!(out.len(), 4);
        assert_eq!(out.last().unwrap().role, Role::Assistant);
    }

    #[test]
    fn trailing_user_message_is_committed() {
        let messages = vec![Message::user("hi"), Message::assistant("hello")];
        let out = build_safe_recovery_checkpoint(&messages, DEFAULT_RESTART_NOTICE);
        assert_eq!(out.len(), 2);
    }

    /// Scenario S4: trailing assistant tool-call with no subsequent tool
    /// message gets a synthesized failed tool-result appended.
    #[test]
    fn unresolved_trailing_tool_call_is_synthesized() {
        let messages = vec![
            Message::user("restart the server"),
            assistant_tool_call("restart-1", "restart_server"),
        ];
        let out = build_safe_recovery_checkpoint(&messages, "server restarted");

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].role, Role::User);
        assert_eq!(out[1].role, Role::Assistant);
        assert_eq!(out[2].role, Role::Tool);

        match &out[2].content {
            MessageContent::Parts(parts) => {
                assert_eq!(parts.len(), 1);
                match &parts[0] {
                    ContentPart::ToolResult { tool_use_id, content, is_error } => {
                        assert_eq!(tool_use_id, "restart-1");
                        assert_eq!(content, "server restarted");
                        assert!(*is_error);
                    }
                    other => panic!("unexpected part: {other:?}"),
                }
            }
            other => panic!("unexpected content: {other:?}"),
        }
    }

    #[test]
    fn multiple_unresolved_tool_calls_all_synthesized() {
        let messages = vec![
            Message::user("do two things"),
            Message {
                role: Role::Assistant,
                content: MessageContent::Parts(vec![
                    ContentPart::ToolUse {
                        id: "a".into(),
                        name: "one".into(),
                        input: serde_json::json!({}),
                    },
                    ContentPart::ToolUse {
                        id: "b".into(),
                        name: "two".into(),
                        input: serde_json::json!({}),
                    },
                ]),
            },
        ];
        let out = build_safe_recovery_checkpoint(&messages, "server restarted");
        assert_eq!(out.len(), 4);
        let synthesized_ids: HashSet<String> = out[2..]
            .iter()
            .filter_map(|m| match &m.content {
                MessageContent::Parts(parts) => parts.iter().find_map(|p| match p {
                    ContentPart::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                    _ => None,
                }),
                _ => None,
            })
            .collect();
        assert_eq!(synthesized_ids, HashSet::from(["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn partially_resolved_tool_calls_only_remaining_synthesized() {
        let messages = vec![
            Message::user("do two things"),
            Message {
                role: Role::Assistant,
                content: MessageContent::Parts(vec![
                    ContentPart::ToolUse {
                        id: "a".into(),
                        name: "one".into(),
                        input: serde_json::json!({}),
                    },
                    ContentPart::ToolUse {
                        id: "b".into(),
                        name: "two".into(),
                        input: serde_json::json!({}),
                    },
                ]),
            },
            tool_result("a"),
        ];
        let out = build_safe_recovery_checkpoint(&messages, "server restarted");
        // committedIndex never reaches the assistant message since "b" is
        // still open when the tool message's results are exhausted.
        assert_eq!(out.len(), 4);
        assert_eq!(out[2].role, Role::Tool);
        assert_eq!(out[3].role, Role::Tool);
    }

    #[test]
    fn standalone_tool_message_with_no_expectation_stops_scan() {
        let messages = vec![Message::user("hi"), tool_result("orphan")];
        let out = build_safe_recovery_checkpoint(&messages, DEFAULT_RESTART_NOTICE);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].role, Role::User);
    }

    /// Testable property #1: the result never ends on a dangling
    /// assistant-tool-call message.
    #[test]
    fn result_never_ends_on_dangling_tool_call() {
        let messages = vec![Message::user("hi"), assistant_tool_call("c1", "search")];
        let out = build_safe_recovery_checkpoint(&messages, DEFAULT_RESTART_NOTICE);
        assert_eq!(out.last().unwrap().role, Role::Tool);
    }

    /// Testable property #2: idempotence on an already-closed transcript.
    #[test]
    fn idempotent_on_already_closed_transcript() {
        let messages = vec![
            Message::user("hi"),
            assistant_tool_call("restart-1", "restart_server"),
        ];
        let first = build_safe_recovery_checkpoint(&messages, "server restarted");
        let second = build_safe_recovery_checkpoint(&first, "server restarted");
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }

    #[test]
    fn interleaved_open_segments_keep_only_last_open() {
        let messages = vec![
            Message::user("first"),
            assistant_tool_call("c1", "search"),
            tool_result("c1"),
            Message::user("second"),
            assistant_tool_call("c2", "search"),
        ];
        let out = build_safe_recovery_checkpoint(&messages, "server restarted");
        assert_eq!(out.len(), 6);
        assert_eq!(out[3].role, Role::User);
        assert_eq!(out[4].role, Role::Assistant);
        assert_eq!(out[5].role, Role::Tool);
    }
}
