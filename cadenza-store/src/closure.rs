// SPDX-FileCopyrightText: 2026 Cadenza contributors
// SPDX-License-Identifier: MIT

//! Generic transitive closure over reference edges.

use std::collections::BTreeSet;

/// Compute the closure of `start` under `edges`.
///
/// `edges` maps one element to its direct successors (references, or
/// referrers for a reversed walk). Elements are visited once; the result
/// contains the start set.
pub async fn compute_closure<T, F, Fut, E>(start: BTreeSet<T>, mut edges: F) -> Result<BTreeSet<T>, E>
where
    T: Ord + Clone,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = Result<BTreeSet<T>, E>>,
{
    let mut done: BTreeSet<T> = BTreeSet::new();
    let mut queue: Vec<T> = start.into_iter().collect();

    while let Some(item) = queue.pop() {
        if !done.insert(item.clone()) {
            continue;
        }
        for next in edges(item).await? {
            if !done.contains(&next) {
                queue.push(next);
            }
        }
    }
    Ok(done)
}
