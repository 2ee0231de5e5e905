use std::collections::{BTreeMap, BTreeSet};

use super::{AccumulatedToolCall, ToolCallFragment};

/// Index-keyed assembler for streamed tool-call fragments.
///
/// One accumulator belongs to exactly one stream. Argument chunks are
/// appended in arrival order and never reset, so the final `arguments` for an
/// index is the byte-exact concatenation of its chunks. Partial JSON is never
/// inspected here.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<usize, AccumulatedToolCall>,
    /// Indices whose id was synthesized and may still be replaced.
    synthesized_ids: BTreeSet<usize>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a fragment and return the current snapshot for its index.
    pub fn merge(&mut self, fragment: ToolCallFragment) -> &AccumulatedToolCall {
        let ToolCallFragment {
            index,
            id,
            function_name,
            arguments_chunk,
        } = fragment;

        let synthesized_ids = &mut self.synthesized_ids;
        let call = self.calls.entry(index).or_insert_with(|| {
            synthesized_ids.insert(index);
            AccumulatedToolCall {
                id: format!("call_{index}"),
                function_name: String::new(),
                arguments: String::new(),
            }
        });

        if let Some(id) = id.filter(|id| !id.is_empty())
            && synthesized_ids.remove(&index)
        {
            call.id = id;
        }

        // Providers either send the whole name once, repeat it, or split it
        // across fragments. A piece equal to the whole name so far counts as
        // a repeat, so a name split into two identical halves ("ab" + "ab")
        // stays "ab".
        if let Some(name) = function_name.filter(|n| !n.is_empty())
            && call.function_name != name
        {
            call.function_name.push_str(&name);
        }

        call.arguments.push_str(&arguments_chunk);
        call
    }

    pub fn get(&self, index: usize) -> Option<&AccumulatedToolCall> {
        self.calls.get(&index)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Immutable snapshot of every call seen so far.
    pub fn snapshot(&self) -> BTreeMap<usize, AccumulatedToolCall> {
        self.calls.clone()
    }

    /// Consume the accumulator, yielding the final calls.
    pub fn finish(self) -> BTreeMap<usize, AccumulatedToolCall> {
        self.calls
    }
}
