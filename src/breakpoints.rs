// ABOUTME: Mirror of the breakpoints the engine currently holds, per script and per command
// ABOUTME: Updated from set-breakpoint results and from engine breakpoint events
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 dravr.ai

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};

use crate::engine::{BreakpointChange, BreakpointInfo};

/// Current breakpoint set
#[derive(Debug, Default)]
pub struct BreakpointMirror {
    lines: HashMap<PathBuf, Vec<BreakpointInfo>>,
    commands: Vec<BreakpointInfo>,
}

impl BreakpointMirror {
    /// Replace the line breakpoints of a script
    pub fn replace_lines(&mut self, script: &Path, breakpoints: Vec<BreakpointInfo>) {
        if breakpoints.is_empty() {
            self.lines.remove(script);
        } else {
            self.lines.insert(script.to_path_buf(), breakpoints);
        }
    }

    /// Replace all command breakpoints
    pub fn replace_commands(&mut self, breakpoints: Vec<BreakpointInfo>) {
        self.commands = breakpoints;
    }

    /// Line breakpoints of a script, in request order
    pub fn lines_for(&self, script: &Path) -> &[BreakpointInfo] {
        self.lines.get(script).map_or(&[], Vec::as_slice)
    }

    /// Command breakpoints
    pub fn commands(&self) -> &[BreakpointInfo] {
        &self.commands
    }

    /// Total number of breakpoints tracked
    pub fn len(&self) -> usize {
        self.lines.values().map(Vec::len).sum::<usize>() + self.commands.len()
    }

    /// Whether no breakpoints are tracked
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply a change reported by the engine outside a set-breakpoints call
    pub fn apply(&mut self, change: BreakpointChange, breakpoint: &BreakpointInfo) {
        let slot = match (&breakpoint.source, &breakpoint.command) {
            (Some(source), _) => self.lines.entry(source.clone()).or_default(),
            (None, Some(_)) => &mut self.commands,
            (None, None) => return,
        };

        let position = breakpoint
            .id
            .and_then(|id| slot.iter().position(|bp| bp.id == Some(id)));

        match (change, position) {
            (BreakpointChange::Removed, Some(index)) => {
                slot.remove(index);
            }
            (BreakpointChange::Removed, None) => {}
            (BreakpointChange::Added | BreakpointChange::Updated, Some(index)) => {
                slot[index] = breakpoint.clone();
            }
            (BreakpointChange::Added | BreakpointChange::Updated, None) => {
                slot.push(breakpoint.clone());
            }
        }

        self.lines.retain(|_, bps| !bps.is_empty());
    }
}

// ============================================================================
// Echo Filter
// ============================================================================

/// Oldest expected echoes are forgotten past this many
const MAX_EXPECTED_ECHOES: usize = 256;

type Change = (BreakpointChange, BreakpointInfo);

/// Separates the engine's echoes of set-breakpoints calls from changes made
/// elsewhere (a `Set-PSBreakpoint` typed at the prompt, for instance)
///
/// Engine changes are held while any set call is in flight. When a call
/// finishes it records the breakpoints it removed and created; held and
/// later changes matching those records are echoes and are dropped, the
/// rest are released in arrival order.
#[derive(Debug, Default)]
pub struct EchoFilter {
    in_flight: usize,
    expected: VecDeque<Change>,
    held: VecDeque<Change>,
}

impl EchoFilter {
    /// A set-breakpoints call started
    pub fn begin(&mut self) {
        self.in_flight += 1;
    }

    /// A set-breakpoints call replaced `removed` with `created`
    pub fn finish(&mut self, removed: &[BreakpointInfo], created: &[BreakpointInfo]) {
        self.in_flight = self.in_flight.saturating_sub(1);
        let removals = removed
            .iter()
            .filter(|bp| bp.id.is_some())
            .map(|bp| (BreakpointChange::Removed, bp.clone()));
        let additions = created
            .iter()
            .filter(|bp| bp.verified)
            .map(|bp| (BreakpointChange::Added, bp.clone()));
        self.expected.extend(removals.chain(additions));
        while self.expected.len() > MAX_EXPECTED_ECHOES {
            self.expected.pop_front();
        }
    }

    /// A set-breakpoints call failed or was cancelled; it changed nothing
    pub fn abandon(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    /// Queue a change reported by the engine
    pub fn push(&mut self, change: BreakpointChange, breakpoint: BreakpointInfo) {
        self.held.push_back((change, breakpoint));
    }

    /// Changes that are not echoes; empty while a set call is in flight
    pub fn release(&mut self) -> Vec<Change> {
        if self.in_flight > 0 {
            return Vec::new();
        }
        let held: Vec<Change> = self.held.drain(..).collect();
        held.into_iter()
            .filter(|(change, breakpoint)| !self.take_expected(*change, breakpoint))
            .collect()
    }

    fn take_expected(&mut self, change: BreakpointChange, breakpoint: &BreakpointInfo) -> bool {
        let found = self
            .expected
            .iter()
            .position(|(kind, known)| is_echo(*kind, known, change, breakpoint));
        found.and_then(|index| self.expected.remove(index)).is_some()
    }
}

fn is_echo(
    expected_change: BreakpointChange,
    expected: &BreakpointInfo,
    change: BreakpointChange,
    breakpoint: &BreakpointInfo,
) -> bool {
    let same_kind = match expected_change {
        BreakpointChange::Removed => change == BreakpointChange::Removed,
        BreakpointChange::Added | BreakpointChange::Updated => change != BreakpointChange::Removed,
    };
    same_kind
        && match (expected.id, breakpoint.id) {
            (Some(a), Some(b)) => a == b,
            _ => expected == breakpoint,
        }
}
