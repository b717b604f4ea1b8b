//! The teardown report: totals, a corruption check over the live chain,
//! and the deduplicated leak listing.

use crate::block::BlockHeader;
use crate::config;
use crate::printer::{self, emit_error, emit_line, FixedWriter};
use crate::registry::LiveRegistry;
use crate::resolve::StackResolver;
use crate::util::fnv1a64;
use hashbrown::HashSet;
use regex::Regex;

const LEAK_BUFFER: usize = 16384;

/// Emit the final report for the chain starting at `head`.
///
/// # Safety
/// `head` must be the registry snapshot; the host must be quiescing (the
/// walk runs without the registry lock).
pub unsafe fn emit_results(head: *mut BlockHeader, totals: (u64, u64), filter: Option<&Regex>) {
    emit_line!("");
    emit_line!("RESULTS --------------------------------------------------------");
    emit_line!("");

    emit_line!("# total number of allocations: {}", totals.0);
    emit_line!("# total size of allocations: {}", totals.1);

    if LiveRegistry::is_corrupted(head) {
        emit_error!("check", "heap is corrupted - leak checking is not possible");
        return;
    }

    if config::with_leaks() {
        emit_leaks(head, filter);
    }

    emit_line!("");
}

unsafe fn emit_leaks(head: *mut BlockHeader, filter: Option<&Regex>) {
    let mut resolver = StackResolver::new();
    let mut seen: HashSet<u64> = HashSet::new();
    let colors = printer::use_colors();
    let max_frames = config::max_frames();
    let max_leaks = config::max_leaks() as u64;

    let mut unique: u64 = 0;
    let mut duplicates: u64 = 0;
    let mut leaked_bytes: u64 = 0;
    let mut truncated = false;

    let mut block = head;
    while !block.is_null() {
        let mut buffer = FixedWriter::<LEAK_BUFFER>::new();
        let resolved = resolver.resolve(max_frames, colors, &mut buffer, (*block).stack);
        let text = if resolved { buffer.as_str() } else { "" };

        if !suppress(filter, text) {
            let hash = fnv1a64(text.as_bytes());
            if seen.contains(&hash) {
                duplicates += 1;
                leaked_bytes += (*block).size as u64;
            } else {
                if seen.try_reserve(1).is_ok() {
                    seen.insert(hash);
                }
                emit_error!(
                    "check",
                    "leak of size {} byte(s), allocated with via {}:",
                    (*block).size,
                    (*block).kind().name()
                );
                emit_line!("{}", if text.is_empty() { "  # no stack available" } else { text });
                unique += 1;
                leaked_bytes += (*block).size as u64;

                if unique >= max_leaks {
                    emit_line!("# leak report truncated after {} unique leak(s)", unique);
                    truncated = true;
                    break;
                }
            }
        }

        block = (*block).next;
    }

    if truncated {
        return;
    }

    if leaked_bytes == 0 {
        emit_line!("# no leaks found");
    } else {
        emit_error!(
            "check",
            "found {} unique leaks(s), {} duplicates, with total size of {} byte(s)",
            unique,
            duplicates,
            leaked_bytes
        );
    }
}

fn suppress(filter: Option<&Regex>, text: &str) -> bool {
    match filter {
        Some(pattern) if !text.is_empty() => pattern.is_match(text),
        _ => false,
    }
}
