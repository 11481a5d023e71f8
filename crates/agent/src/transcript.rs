//! Transcript ownership: structural repair and overflow compaction.
//!
//! The model call has two structural invariants (enforced here, not at the
//! call site):
//!
//! 1. The first turn sent to the model is a `User` turn.
//! 2. Every tool call part has a matching tool response before the next
//!    plain `User`/text-`Model` turn.
//!
//! `repair` restores both before every model call and is idempotent.
//! `compact` shrinks the transcript when the context window overflows and no
//! fallback model is left: whole turns are removed oldest-first, text-only
//! turns before tool-bearing turns, and tool-bearing turns only as complete
//! call+response groups so a subsequent `repair` stays a no-op.

use std::collections::HashSet;
use tracing::debug;
use windlass_core::{Part, Role, ToolCallRequest, ToolResult, Turn};

/// Placeholder text for a synthesized leading user turn.
const PLACEHOLDER_USER_TEXT: &str = "[earlier conversation context is unavailable]";

/// Error message injected for a tool call that never resolved.
const UNRESOLVED_CALL_TEXT: &str = "call did not complete; no result was produced";

/// Tuning for overflow compaction.
///
/// With `spare_tool_turns` set (the default), text-only turns are trimmed
/// first and tool-bearing turns only once no text-only turn is left. Unset,
/// turns are trimmed strictly oldest-first regardless of content.
#[derive(Debug, Clone)]
pub struct CompactionPolicy {
    pub spare_tool_turns: bool,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self {
            spare_tool_turns: true,
        }
    }
}

/// The ordered conversation turns for one session.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    turns: Vec<Turn>,
}

impl Transcript {
    pub fn new() -> Self {
        Self { turns: Vec::new() }
    }

    pub fn from_turns(turns: Vec<Turn>) -> Self {
        Self { turns }
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Ids of all tool responses present anywhere in the transcript.
    fn responded_ids(&self) -> HashSet<String> {
        self.turns
            .iter()
            .flat_map(|t| t.tool_responses().map(|r| r.call_id.clone()))
            .collect()
    }

    /// Restore the structural invariants. Returns the number of fixes made;
    /// a second call on the same transcript always returns 0.
    pub fn repair(&mut self) -> usize {
        let mut repairs = 0;
        let responded = self.responded_ids();

        let mut i = 0;
        while i < self.turns.len() {
            let orphans: Vec<ToolCallRequest> = self.turns[i]
                .tool_calls()
                .filter(|call| !responded.contains(&call.id))
                .cloned()
                .collect();

            if !orphans.is_empty() {
                debug!(turn = i, count = orphans.len(), "Injecting responses for orphaned tool calls");
                repairs += orphans.len();
                let results: Vec<ToolResult> = orphans
                    .iter()
                    .map(|call| ToolResult::error(&call.id, UNRESOLVED_CALL_TEXT))
                    .collect();

                // Fold into an adjacent tool turn when one exists, otherwise
                // insert a fresh one right after the orphaned calls.
                if let Some(next) = self.turns.get_mut(i + 1)
                    && next.role == Role::Tool
                {
                    next.parts
                        .extend(results.into_iter().map(|result| Part::ToolResponse { result }));
                } else {
                    self.turns.insert(i + 1, Turn::tool_results(results));
                }
            }
            i += 1;
        }

        if let Some(first) = self.turns.first()
            && first.role != Role::User
        {
            self.turns.insert(0, Turn::user(PLACEHOLDER_USER_TEXT));
            repairs += 1;
        }

        repairs
    }

    /// Remove whole turns to shrink the transcript. Returns whether the
    /// transcript got shorter; `false` means compaction is out of options
    /// and the overflow must surface to the caller.
    ///
    /// The final turn (the message currently being processed) is never
    /// removed. One attempt always nets a shorter transcript, even when a
    /// placeholder user turn has to be prepended afterwards.
    pub fn compact(&mut self, policy: &CompactionPolicy) -> bool {
        let before = self.turns.len();
        if before <= 1 {
            return false;
        }

        if policy.spare_tool_turns {
            if !self.drop_text_turns() {
                self.drop_oldest_tool_group();
            }
        } else {
            // Oldest-first regardless of content. Keep removing until the
            // attempt nets out shorter even after a placeholder prepend.
            loop {
                let len = self.turns.len();
                if len <= 1 {
                    break;
                }
                if self.turns[0].has_tool_parts() && self.turns[0].role != Role::Tool {
                    self.drop_oldest_tool_group();
                } else {
                    self.turns.remove(0);
                }
                if self.turns.len() == len {
                    break; // nothing removable
                }
                let placeholder = self.turns.first().is_some_and(|t| t.role != Role::User);
                if self.turns.len() + usize::from(placeholder) < before {
                    break;
                }
            }
        }

        if let Some(first) = self.turns.first()
            && first.role != Role::User
        {
            self.turns.insert(0, Turn::user(PLACEHOLDER_USER_TEXT));
        }

        self.turns.len() < before
    }

    /// Drop the oldest half of the text-only turns (at least one). Returns
    /// whether that achieved a net shrink; when the placeholder a drop
    /// would force cancels it out, the drop count grows until the attempt
    /// nets shorter or candidates run out.
    fn drop_text_turns(&mut self) -> bool {
        let len = self.turns.len();
        let last = len - 1;
        let text_only: Vec<usize> = (0..last)
            .filter(|&i| !self.turns[i].has_tool_parts())
            .collect();
        if text_only.is_empty() {
            return false;
        }

        let mut drop_count = text_only.len().div_ceil(2);
        loop {
            let dropped: HashSet<usize> = text_only[..drop_count].iter().copied().collect();
            let first_kept = (0..len).find(|i| !dropped.contains(i)).unwrap_or(last);
            let placeholder = self.turns[first_kept].role != Role::User;
            let new_len = len - drop_count + usize::from(placeholder);

            if new_len < len {
                let mut index = 0;
                self.turns.retain(|_| {
                    let keep = !dropped.contains(&index);
                    index += 1;
                    keep
                });
                debug!(dropped = drop_count, "Compacted text-only turns");
                return true;
            }
            if drop_count == text_only.len() {
                return false;
            }
            drop_count += 1;
        }
    }

    /// Drop the oldest tool-bearing turn together with the tool turn that
    /// answers it. Groups touching the final turn are left alone.
    fn drop_oldest_tool_group(&mut self) {
        let last = self.turns.len() - 1;
        for head in 0..last {
            if !self.turns[head].has_tool_parts() {
                continue;
            }

            // A lone tool turn (e.g. a synthesized placeholder) drops alone.
            if self.turns[head].role == Role::Tool {
                self.turns.remove(head);
                debug!(turn = head, "Compacted orphan tool turn");
                return;
            }

            let ids: HashSet<String> = self.turns[head]
                .tool_calls()
                .map(|call| call.id.clone())
                .collect();

            // The answering tool turn sits right behind the call turn.
            let partner = self
                .turns
                .get(head + 1)
                .filter(|t| {
                    t.role == Role::Tool
                        && t.tool_responses().all(|r| ids.contains(&r.call_id))
                })
                .map(|_| head + 1);

            // Removing the group must not touch the final turn.
            if partner == Some(last) {
                continue;
            }

            if let Some(partner) = partner {
                self.turns.remove(partner);
            }
            self.turns.remove(head);
            debug!(turn = head, "Compacted tool call/response group");
            return;
        }
    }
}
