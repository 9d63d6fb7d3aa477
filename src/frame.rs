// Copyright (C) 2024 Ryan Daum <ryan.daum@gmail.com>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

use crate::op::{InclusiveRange, Label, LabelKind};
use crate::{slot_width_of, ValueKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrameKind {
    /// The synthetic frame at the bottom of the control stack.
    Function,
    /// `needs_continuation` starts false and latches true the first time a
    /// branch targets the block; a never-targeted block gets no
    /// continuation label.
    Block { needs_continuation: bool },
    Loop,
    If { has_else: bool },
}

/// One open structured-control construct. Entry heights exclude the block's
/// parameters: those conceptually belong to the block body and are restored
/// when an `else` rewinds the stack.
#[derive(Debug, Clone)]
pub struct ControlFrame {
    pub frame_id: u32,
    /// Operand-stack entries below the block's parameters.
    pub entry_len: usize,
    /// Same height, in 64-bit slots.
    pub entry_slots: usize,
    pub params: Vec<ValueKind>,
    pub results: Vec<ValueKind>,
    pub kind: ControlFrameKind,
}

impl ControlFrame {
    /// The canonical label a branch to this frame transfers to: loops branch
    /// to their header, everything else to its continuation, the function
    /// frame to the return point.
    pub fn branch_target_label(&self) -> Label {
        match self.kind {
            ControlFrameKind::Function => Label::ret(),
            ControlFrameKind::Loop => Label::new(LabelKind::Header, self.frame_id),
            ControlFrameKind::Block { .. } | ControlFrameKind::If { .. } => {
                Label::new(LabelKind::Continuation, self.frame_id)
            }
        }
    }

    /// The slot range to discard before control leaves through this frame.
    /// The values to carry across (results, or parameters when branching to
    /// a loop header) sit above the range; `is_end` distinguishes closing
    /// the frame from branching to it. `None` when nothing needs dropping.
    pub fn drop_range(&self, current_slots: usize, is_end: bool) -> Option<InclusiveRange> {
        let carried = if !is_end && self.kind == ControlFrameKind::Loop {
            slot_width_of(&self.params)
        } else {
            slot_width_of(&self.results)
        };
        let start = carried as i32;
        let end = match self.kind {
            // The function frame drops locals and parameters too.
            ControlFrameKind::Function => current_slots as i32 - 1,
            _ => current_slots as i32 - 1 - self.entry_slots as i32,
        };
        (start <= end).then(|| InclusiveRange::new(start, end))
    }
}

/// The stack of open control frames, bottomed by the function frame.
pub struct ControlFrames {
    frames: Vec<ControlFrame>,
}

impl Default for ControlFrames {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlFrames {
    pub fn new() -> Self {
        ControlFrames { frames: vec![] }
    }

    pub fn push(&mut self, frame: ControlFrame) {
        self.frames.push(frame);
    }

    pub fn pop(&mut self) -> Option<ControlFrame> {
        self.frames.pop()
    }

    pub fn top(&self) -> Option<&ControlFrame> {
        self.frames.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut ControlFrame> {
        self.frames.last_mut()
    }

    /// The `n`-th frame from the top, 0-based; the addressing branch depths
    /// use.
    pub fn get(&self, n: usize) -> Option<&ControlFrame> {
        let len = self.frames.len();
        if n >= len {
            return None;
        }
        Some(&self.frames[len - 1 - n])
    }

    pub fn get_mut(&mut self, n: usize) -> Option<&mut ControlFrame> {
        let len = self.frames.len();
        if n >= len {
            return None;
        }
        Some(&mut self.frames[len - 1 - n])
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// The function frame.
    pub fn bottom(&self) -> Option<&ControlFrame> {
        self.frames.first()
    }

    /// Latch a block's continuation-label requirement the first time a
    /// branch targets it.
    pub fn ensure_continuation(frame: &mut ControlFrame) {
        if let ControlFrameKind::Block { needs_continuation } = &mut frame.kind {
            *needs_continuation = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_frame(entry_slots: usize, results: Vec<ValueKind>) -> ControlFrame {
        ControlFrame {
            frame_id: 2,
            entry_len: entry_slots,
            entry_slots,
            params: vec![],
            results,
            kind: ControlFrameKind::Block {
                needs_continuation: false,
            },
        }
    }

    #[test]
    fn drop_range_spares_results() {
        // Stack: [entry(1), junk(2), result(1)], entry height 1.
        let frame = block_frame(1, vec![ValueKind::I32]);
        assert_eq!(
            frame.drop_range(4, true),
            Some(InclusiveRange::new(1, 2))
        );
    }

    #[test]
    fn empty_drop_range_is_none() {
        let frame = block_frame(0, vec![]);
        assert_eq!(frame.drop_range(0, true), None);
    }

    #[test]
    fn loop_branch_spares_params_not_results() {
        let frame = ControlFrame {
            frame_id: 3,
            entry_len: 0,
            entry_slots: 0,
            params: vec![ValueKind::I32, ValueKind::I32],
            results: vec![ValueKind::I32],
            kind: ControlFrameKind::Loop,
        };
        // Branching to the header keeps the two loop arguments.
        assert_eq!(
            frame.drop_range(3, false),
            Some(InclusiveRange::new(2, 2))
        );
        // Closing the loop keeps its single result.
        assert_eq!(
            frame.drop_range(3, true),
            Some(InclusiveRange::new(1, 2))
        );
    }

    #[test]
    fn function_frame_drops_locals() {
        let frame = ControlFrame {
            frame_id: 1,
            entry_len: 2,
            entry_slots: 2,
            params: vec![ValueKind::I32, ValueKind::I32],
            results: vec![ValueKind::I32],
            kind: ControlFrameKind::Function,
        };
        assert_eq!(
            frame.drop_range(3, true),
            Some(InclusiveRange::new(1, 2))
        );
    }
}
