//! Two-dimensional phase unwrapping.
//!
//! Quality guided path following: every pixel gets a reliability derived from
//! the wrapped second differences to its eight neighbors, and unwrapping grows
//! from the most reliable pixel along the most reliable edges first. Noisy
//! regions and phase singularities are therefore reached last and cannot
//! spread their errors into clean regions.

use ndarray::Array2;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::f64::consts::PI;

/// Wraps a phase difference into `[-pi, pi]`.
pub fn wrap(phase: f64) -> f64 {
    phase - 2.0 * PI * (phase / (2.0 * PI)).round()
}

struct Edge {
    reliability: f64,
    from: (usize, usize),
    to: (usize, usize),
}

impl PartialEq for Edge {
    fn eq(&self, other: &Self) -> bool {
        self.reliability.total_cmp(&other.reliability) == Ordering::Equal
    }
}

impl Eq for Edge {}

impl PartialOrd for Edge {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Edge {
    fn cmp(&self, other: &Self) -> Ordering {
        self.reliability.total_cmp(&other.reliability)
    }
}

/// Per-pixel reliability. Border pixels, which lack a full neighborhood, get 0.
fn reliability(phase: &Array2<f64>) -> Array2<f64> {
    let (h, w) = phase.dim();
    let mut out = Array2::<f64>::zeros((h, w));
    if h < 3 || w < 3 {
        return out;
    }
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let c = phase[[y, x]];
            let d = |a: f64, b: f64| wrap(a - c) - wrap(c - b);
            let horizontal = d(phase[[y, x - 1]], phase[[y, x + 1]]);
            let vertical = d(phase[[y - 1, x]], phase[[y + 1, x]]);
            let diagonal = d(phase[[y - 1, x - 1]], phase[[y + 1, x + 1]]);
            let anti = d(phase[[y - 1, x + 1]], phase[[y + 1, x - 1]]);
            let second = (horizontal * horizontal
                + vertical * vertical
                + diagonal * diagonal
                + anti * anti)
                .sqrt();
            out[[y, x]] = 1.0 / (second + 1e-9);
        }
    }
    out
}

/// Removes 2π jumps from a wrapped phase map.
pub fn unwrap_phase(wrapped: &Array2<f64>) -> Array2<f64> {
    let (h, w) = wrapped.dim();
    let mut unwrapped = wrapped.clone();
    if h == 0 || w == 0 {
        return unwrapped;
    }

    let quality = reliability(wrapped);
    let mut done = Array2::<bool>::from_elem((h, w), false);

    let start = quality
        .indexed_iter()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map_or((0, 0), |(idx, _)| idx);

    let mut heap = BinaryHeap::new();
    let push_neighbors = |heap: &mut BinaryHeap<Edge>, done: &Array2<bool>, from: (usize, usize)| {
        let (y, x) = from;
        let mut candidates = Vec::with_capacity(4);
        if y > 0 {
            candidates.push((y - 1, x));
        }
        if y + 1 < h {
            candidates.push((y + 1, x));
        }
        if x > 0 {
            candidates.push((y, x - 1));
        }
        if x + 1 < w {
            candidates.push((y, x + 1));
        }
        for to in candidates {
            if !done[to] {
                heap.push(Edge {
                    reliability: quality[from] + quality[to],
                    from,
                    to,
                });
            }
        }
    };

    done[start] = true;
    push_neighbors(&mut heap, &done, start);
    while let Some(edge) = heap.pop() {
        if done[edge.to] {
            continue;
        }
        unwrapped[edge.to] = unwrapped[edge.from] + wrap(wrapped[edge.to] - wrapped[edge.from]);
        done[edge.to] = true;
        push_neighbors(&mut heap, &done, edge.to);
    }
    unwrapped
}
