//! Progress mapping.
//!
//! Progress is a monotonic function of (stage, sub-index):
//! brief 5%, outline 10%, refinement 15-40%, chapters 40-85%,
//! assembly 85%, completion 100%.

use super::types::TaskStatus;

const REFINEMENT_START: u8 = 15;
const REFINEMENT_END: u8 = 40;
const CHAPTERS_START: u8 = 40;
const CHAPTERS_END: u8 = 85;

/// Progress reported on entering `status`. `Failed` keeps whatever was reached.
pub fn stage_progress(status: TaskStatus) -> Option<u8> {
    match status {
        TaskStatus::Pending => Some(0),
        TaskStatus::AnalyzingBrief => Some(5),
        TaskStatus::GeneratingOutline => Some(10),
        TaskStatus::RefiningOutline => Some(REFINEMENT_START),
        TaskStatus::GeneratingChapters => Some(CHAPTERS_START),
        TaskStatus::Assembling => Some(CHAPTERS_END),
        TaskStatus::Completed => Some(100),
        TaskStatus::Failed => None,
    }
}

/// Progress after `cycle` of `max_cycles` refinement rounds.
pub fn refinement_progress(cycle: u32, max_cycles: u32) -> u8 {
    spread(REFINEMENT_START, REFINEMENT_END, cycle as usize, max_cycles as usize)
}

/// Progress after `done` of `total` chapters have content.
pub fn chapter_progress(done: usize, total: usize) -> u8 {
    spread(CHAPTERS_START, CHAPTERS_END, done, total)
}

fn spread(start: u8, end: u8, done: usize, total: usize) -> u8 {
    if total == 0 {
        return end;
    }
    let done = done.min(total);
    let width = (end - start) as usize;
    start + (width * done / total) as u8
}
