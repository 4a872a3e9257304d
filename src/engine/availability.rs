use crate::model::*;

use super::index::SlotIndex;

/// Sub-windows of `query` in which one more reservation would still be admitted.
pub fn free_windows(index: &SlotIndex, query: &Span) -> Vec<Span> {
    if index.capacity == 0 {
        return Vec::new();
    }
    let claimed: Vec<Span> = index
        .overlapping(query)
        .map(|s| {
            Span::new(
                s.window.start.max(query.start),
                s.window.end.min(query.end),
            )
        })
        .collect();
    let saturated = compute_saturated_spans(&claimed, index.capacity);
    subtract_intervals(&[*query], &saturated)
}

/// Merge start-sorted overlapping/adjacent spans into disjoint spans.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted by start and internally disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut cursor = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= cursor {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > cursor {
                result.push(Span::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
            j += 1;
        }

        if cursor < b.end {
            result.push(Span::new(cursor, b.end));
        }
    }

    result
}

/// Sweep line over claims: the ranges where at least `capacity` of them overlap.
/// Returns sorted, disjoint spans.
pub fn compute_saturated_spans(claims: &[Span], capacity: u32) -> Vec<Span> {
    if claims.is_empty() || capacity == 0 {
        return Vec::new();
    }
    if capacity == 1 {
        let mut sorted = claims.to_vec();
        sorted.sort_by_key(|s| s.start);
        return merge_overlapping(&sorted);
    }

    // +1 at start, -1 at end; ends sort before starts at the same instant (half-open).
    let mut edges: Vec<(Ms, i32)> = Vec::with_capacity(claims.len() * 2);
    for c in claims {
        edges.push((c.start, 1));
        edges.push((c.end, -1));
    }
    edges.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut result = Vec::new();
    let mut depth: u32 = 0;
    let mut saturated_since: Option<Ms> = None;

    for &(at, delta) in &edges {
        if delta > 0 {
            depth += 1;
        } else {
            depth -= 1;
        }

        if depth >= capacity && saturated_since.is_none() {
            saturated_since = Some(at);
        } else if depth < capacity
            && let Some(start) = saturated_since.take()
            && at > start
        {
            result.push(Span::new(start, at));
        }
    }

    result
}
