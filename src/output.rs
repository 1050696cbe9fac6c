// ABOUTME: Ordered output buffer that coalesces engine output between state transitions
// ABOUTME: Drained on a latency deadline and always before any state-change event
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

use crate::engine::OutputCategory;

/// A run of output written to one stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    /// Stream the output was written to
    pub category: OutputCategory,
    /// Concatenated text
    pub text: String,
}

/// Pending output awaiting a flush
#[derive(Debug, Default)]
pub struct OutputBuffer {
    chunks: VecDeque<OutputChunk>,
    first_buffered_at: Option<Instant>,
}

impl OutputBuffer {
    /// Append text, merging it into the last chunk when the stream matches
    pub fn push(&mut self, category: OutputCategory, text: &str) {
        if text.is_empty() {
            return;
        }
        if self.first_buffered_at.is_none() {
            self.first_buffered_at = Some(Instant::now());
        }
        match self.chunks.back_mut() {
            Some(last) if last.category == category => last.text.push_str(text),
            _ => self.chunks.push_back(OutputChunk {
                category,
                text: text.to_owned(),
            }),
        }
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// When the buffer must be flushed at the latest
    pub fn deadline(&self, interval: Duration) -> Option<Instant> {
        self.first_buffered_at.map(|at| at + interval)
    }

    /// Remove and return everything buffered, in order
    pub fn drain(&mut self) -> Vec<OutputChunk> {
        self.first_buffered_at = None;
        self.chunks.drain(..).collect()
    }
}
