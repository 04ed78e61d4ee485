//! Runtime limits for building and executing programs.
//!
//! Configuration only describes constraints; the parser, macro expander, binary
//! decoder and engine each enforce the ones that concern them.

use crate::{
    MAX_FRAME_DEPTH, MAX_HEAP_SLOTS, MAX_MACRO_DEPTH, MAX_PARSE_DEPTH, MAX_RENDER_ELEMENTS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Maximum list nesting accepted by the text parser and the binary decoder
    pub max_parse_depth: usize,

    /// Maximum depth of nested macro expansions
    pub max_macro_depth: usize,

    /// Maximum number of active scope frames
    pub max_frames: usize,

    /// Maximum number of executed instructions, unbounded when `None`
    pub step_limit: Option<u64>,

    /// Maximum number of live heap slots; `alloc` and `realloc` fail past it
    pub max_heap_slots: usize,

    /// Maximum number of list elements one `print` writes before eliding
    pub max_render_elements: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            max_parse_depth: MAX_PARSE_DEPTH,
            max_macro_depth: MAX_MACRO_DEPTH,
            max_frames: MAX_FRAME_DEPTH,
            step_limit: None,
            max_heap_slots: MAX_HEAP_SLOTS,
            max_render_elements: MAX_RENDER_ELEMENTS,
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }

    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = Some(limit);
        self
    }

    pub fn with_max_parse_depth(mut self, depth: usize) -> Self {
        self.max_parse_depth = depth;
        self
    }

    pub fn with_max_heap_slots(mut self, slots: usize) -> Self {
        self.max_heap_slots = slots;
        self
    }

    pub fn with_max_render_elements(mut self, elements: usize) -> Self {
        self.max_render_elements = elements;
        self
    }
}
