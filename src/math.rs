use crate::bbox::{BBox, Ltrb};
use crate::error::Error;

use munkres::{solve_assignment, Position, WeightMatrix};
use ndarray::prelude::*;

/// Largest side the solver accepts. Bigger frames are shed whole: the caller
/// gets an error, and the tracker lets every track coast for that frame
/// without spawning new ones.
pub const MAX_MATRIX_SIDE: usize = 1024;

// costs closer than this count as a tie
const TIE_EPS: f64 = 1e-9;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Assignment {
    /// `(row, column, iou)` for every accepted pair, ordered by row.
    pub matches: Vec<(usize, usize, f32)>,
    pub unmatched_rows: Vec<usize>,
    pub unmatched_columns: Vec<usize>,
}

/// IoU of every `(row, column)` pair, rows being tracks and columns detections.
pub fn iou_matrix(rows: &[BBox<Ltrb>], columns: &[BBox<Ltrb>]) -> Array2<f32> {
    Array2::from_shape_fn((rows.len(), columns.len()), |(r, c)| {
        rows[r].iou(&columns[c])
    })
}

/// Optimal one-to-one assignment minimizing the sum of `1 - IoU`.
///
/// Pairs below `iou_threshold` are gated out. Among gated-in pairs the
/// solution first has as many matches as possible, then the lowest total
/// cost. Equal-cost alternatives are settled in row order: a lower row keeps
/// the cheaper column, and between equally cheap columns the lower one.
pub fn linear_assignment(iou: ArrayView2<'_, f32>, iou_threshold: f32) -> Result<Assignment, Error> {
    let (nrows, ncols) = iou.dim();

    if nrows == 0 || ncols == 0 {
        return Ok(Assignment {
            matches: Vec::new(),
            unmatched_rows: (0..nrows).collect(),
            unmatched_columns: (0..ncols).collect(),
        });
    }

    let n = nrows.max(ncols);
    if n > MAX_MATRIX_SIDE {
        return Err(Error::Assignment(format!(
            "cost matrix {}x{} is too big",
            nrows, ncols
        )));
    }

    let cost = |r: usize, c: usize| -> Option<f64> {
        if r < nrows && c < ncols && iou[(r, c)] >= iou_threshold {
            Some(1.0 - iou[(r, c)] as f64)
        } else {
            None
        }
    };

    // every valid pair costs at most 1, so one gated pair outweighs any
    // full set of valid ones and the solver never trades a match away
    let gate = (n + 1) as f64;
    let mut mat = WeightMatrix::from_fn(n, |(r, c)| cost(r, c).unwrap_or(gate));

    let solution = solve_assignment(&mut mat)
        .map_err(|err| Error::Assignment(format!("{:?}", err)))?;

    let mut by_row = vec![None; nrows];
    for Position { row, column } in solution {
        if cost(row, column).is_some() {
            by_row[row] = Some(column);
        }
    }

    settle_ties(&mut by_row, ncols, &cost);

    let mut matches = Vec::new();
    let mut unmatched_rows = Vec::new();
    let mut taken = vec![false; ncols];

    for (row, column) in by_row.into_iter().enumerate() {
        match column {
            Some(column) => {
                taken[column] = true;
                matches.push((row, column, iou[(row, column)]));
            }
            None => unmatched_rows.push(row),
        }
    }

    let unmatched_columns = (0..ncols).filter(|&c| !taken[c]).collect();

    Ok(Assignment {
        matches,
        unmatched_rows,
        unmatched_columns,
    })
}

/// Rewrites an optimal assignment into the canonical one among those with
/// the same total cost and match count.
///
/// Each row, lowest first, takes the best column it can get through a cost
/// neutral exchange with a free column or with a higher row. Every exchange
/// strictly improves the per-row key sequence, so the loop settles.
fn settle_ties<C>(by_row: &mut [Option<usize>], ncols: usize, cost: &C)
where
    C: Fn(usize, usize) -> Option<f64>,
{
    let nrows = by_row.len();
    let mut owner = vec![None; ncols];
    for (r, c) in by_row.iter().enumerate() {
        if let Some(c) = *c {
            owner[c] = Some(r);
        }
    }

    let same = |a: f64, b: f64| (a - b).abs() <= TIE_EPS;
    let max_passes = 4 * nrows.max(ncols) + 4;

    for _ in 0..max_passes {
        let mut changed = false;

        for r1 in 0..nrows {
            for c in 0..ncols {
                let k = match cost(r1, c) {
                    Some(k) => k,
                    None => continue,
                };

                let current = by_row[r1].and_then(|c1| Some((cost(r1, c1)?, c1)));

                let better = match current {
                    Some((_, c1)) if c1 == c => false,
                    Some((k1, c1)) => k < k1 - TIE_EPS || (same(k, k1) && c < c1),
                    None => true,
                };
                if !better {
                    continue;
                }

                match owner[c] {
                    None => {
                        // a free column is only taken at equal cost
                        if let Some((k1, _)) = current {
                            if !same(k, k1) {
                                continue;
                            }
                        }

                        if let Some((_, c1)) = current {
                            owner[c1] = None;
                        }
                    }

                    // never disturb a lower row
                    Some(r2) if r2 < r1 => continue,

                    Some(r2) => {
                        let k2 = match cost(r2, c) {
                            Some(k2) => k2,
                            None => continue,
                        };

                        match current {
                            Some((k1, c1)) => {
                                let k21 = match cost(r2, c1) {
                                    Some(k21) => k21,
                                    None => continue,
                                };
                                if !same(k + k21, k1 + k2) {
                                    continue;
                                }

                                by_row[r2] = Some(c1);
                                owner[c1] = Some(r2);
                            }
                            None => {
                                if !same(k, k2) {
                                    continue;
                                }

                                by_row[r2] = None;
                            }
                        }
                    }
                }

                by_row[r1] = Some(c);
                owner[c] = Some(r1);
                changed = true;
            }
        }

        if !changed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn empty_sides_are_tolerated() {
        let rows = iou_matrix(&[BBox::ltrb(0.0, 0.0, 1.0, 1.0)], &[]);
        let a = linear_assignment(rows.view(), 0.3).unwrap();
        assert!(a.matches.is_empty());
        assert_eq!(a.unmatched_rows, vec![0]);
        assert!(a.unmatched_columns.is_empty());

        let cols = iou_matrix(&[], &[BBox::ltrb(0.0, 0.0, 1.0, 1.0)]);
        let a = linear_assignment(cols.view(), 0.3).unwrap();
        assert!(a.matches.is_empty());
        assert!(a.unmatched_rows.is_empty());
        assert_eq!(a.unmatched_columns, vec![0]);

        let none = Array2::<f32>::zeros((0, 0));
        assert_eq!(linear_assignment(none.view(), 0.3).unwrap(), Assignment::default());
    }

    #[test]
    fn prefers_globally_optimal_pairs() {
        // greedy would give row 0 column 0 (0.6) and leave row 1 at 0.35
        let iou = array![[0.6, 0.5], [0.55, 0.0]];
        let a = linear_assignment(iou.view(), 0.3).unwrap();

        assert_eq!(
            a.matches.iter().map(|&(r, c, _)| (r, c)).collect::<Vec<_>>(),
            vec![(0, 1), (1, 0)]
        );
    }

    #[test]
    fn gated_pairs_are_never_accepted() {
        let iou = array![[0.2, 0.0], [0.0, 0.9]];
        let a = linear_assignment(iou.view(), 0.3).unwrap();

        assert_eq!(a.matches, vec![(1, 1, 0.9)]);
        assert_eq!(a.unmatched_rows, vec![0]);
        assert_eq!(a.unmatched_columns, vec![0]);
        for &(r, c, score) in &a.matches {
            assert!(iou[(r, c)] >= 0.3);
            assert!(score >= 0.3);
        }
    }

    #[test]
    fn rectangular_matrices() {
        let iou = array![[0.1, 0.8, 0.4]];
        let a = linear_assignment(iou.view(), 0.3).unwrap();
        assert_eq!(a.matches, vec![(0, 1, 0.8)]);
        assert_eq!(a.unmatched_columns, vec![0, 2]);

        let iou = array![[0.7], [0.9], [0.0]];
        let a = linear_assignment(iou.view(), 0.3).unwrap();
        assert_eq!(a.matches, vec![(1, 0, 0.9)]);
        assert_eq!(a.unmatched_rows, vec![0, 2]);
    }

    fn pairs(a: &Assignment) -> Vec<(usize, usize)> {
        a.matches.iter().map(|&(r, c, _)| (r, c)).collect()
    }

    fn total_cost(iou: &Array2<f32>, pairs: &[(usize, usize)]) -> f64 {
        pairs.iter().map(|&(r, c)| 1.0 - iou[(r, c)] as f64).sum()
    }

    // exhaustive search: most matches first, then least cost
    fn best(iou: &Array2<f32>, threshold: f32) -> (usize, f64) {
        fn walk(
            iou: &Array2<f32>,
            threshold: f32,
            row: usize,
            used: &mut Vec<bool>,
            count: usize,
            cost: f64,
            best: &mut (usize, f64),
        ) {
            if row == iou.nrows() {
                if count > best.0 || (count == best.0 && cost < best.1) {
                    *best = (count, cost);
                }
                return;
            }

            walk(iou, threshold, row + 1, used, count, cost, best);

            for c in 0..iou.ncols() {
                if !used[c] && iou[(row, c)] >= threshold {
                    used[c] = true;
                    let k = 1.0 - iou[(row, c)] as f64;
                    walk(iou, threshold, row + 1, used, count + 1, cost + k, best);
                    used[c] = false;
                }
            }
        }

        let mut result = (0, f64::INFINITY);
        walk(iou, threshold, 0, &mut vec![false; iou.ncols()], 0, 0.0, &mut result);
        result
    }

    #[test]
    fn ties_resolve_to_lowest_indexes() {
        let iou = array![[0.5, 0.5], [0.5, 0.5]];

        for _ in 0..10 {
            let a = linear_assignment(iou.view(), 0.3).unwrap();
            assert_eq!(a.matches, vec![(0, 0, 0.5), (1, 1, 0.5)]);
        }
    }

    #[test]
    fn two_tracks_tied_for_one_detection() {
        let a = linear_assignment(array![[0.5], [0.5]].view(), 0.3).unwrap();
        assert_eq!(pairs(&a), vec![(0, 0)]);
        assert_eq!(a.unmatched_rows, vec![1]);

        let a = linear_assignment(array![[0.5, 0.5]].view(), 0.3).unwrap();
        assert_eq!(pairs(&a), vec![(0, 0)]);
        assert_eq!(a.unmatched_columns, vec![1]);

        let a = linear_assignment(array![[0.0, 0.5], [0.7, 0.5], [0.0, 0.5]].view(), 0.3).unwrap();
        assert_eq!(pairs(&a), vec![(0, 1), (1, 0)]);
    }

    #[test]
    fn lower_track_keeps_the_cheaper_detection_on_a_tie() {
        // (0,2)(1,1)(2,0) and (0,1)(1,2)(2,0) cost the same
        let iou = array![[0.4, 0.4, 0.9], [0.4, 0.4, 0.9], [0.9, 0.4, 0.4]];
        let a = linear_assignment(iou.view(), 0.3).unwrap();
        assert_eq!(pairs(&a), vec![(0, 2), (1, 1), (2, 0)]);

        let iou = array![[0.6, 0.6, 0.0], [0.6, 0.6, 0.0]];
        let a = linear_assignment(iou.view(), 0.3).unwrap();
        assert_eq!(pairs(&a), vec![(0, 0), (1, 1)]);
        assert_eq!(a.unmatched_columns, vec![2]);
    }

    #[test]
    fn cost_is_optimal_with_padding() {
        let iou = array![
            [0.896, 0.0],
            [0.406, 0.519],
            [0.846, 0.919],
            [0.532, 0.918],
            [0.557, 0.844]
        ];
        let a = linear_assignment(iou.view(), 0.3).unwrap();
        let (count, cost) = best(&iou, 0.3);

        assert_eq!(a.matches.len(), count);
        assert!((total_cost(&iou, &pairs(&a)) - cost).abs() < 1e-6);
    }

    #[test]
    fn matches_exhaustive_search() {
        // xorshift, so the cases are the same on every run
        let mut state = 0x2545_f491_u32;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state % 1000) as f32 / 1000.0
        };

        for case in 0..500 {
            let rows = 1 + case % 5;
            let cols = 1 + (case / 5) % 5;
            let iou = Array2::from_shape_simple_fn((rows, cols), || {
                let v = next();
                if v < 0.3 {
                    0.0
                } else {
                    v
                }
            });

            let a = linear_assignment(iou.view(), 0.3).unwrap();
            let (count, cost) = best(&iou, 0.3);

            assert_eq!(a.matches.len(), count, "{:?}", iou);
            assert!((total_cost(&iou, &pairs(&a)) - cost).abs() < 1e-6, "{:?}", iou);
            assert_eq!(a.unmatched_rows.len(), rows - count);
            assert_eq!(a.unmatched_columns.len(), cols - count);
        }
    }

    #[test]
    fn oversized_frames_are_refused() {
        let iou = Array2::<f32>::zeros((1, MAX_MATRIX_SIDE + 1));
        assert!(matches!(
            linear_assignment(iou.view(), 0.3),
            Err(Error::Assignment(_))
        ));
    }

    #[test]
    fn iou_matrix_shape_and_values() {
        let rows = [BBox::ltrb(0.0, 0.0, 10.0, 10.0), BBox::ltrb(0.0, 0.0, 5.0, 5.0)];
        let cols = [BBox::ltrb(0.0, 0.0, 10.0, 10.0)];
        let m = iou_matrix(&rows, &cols);

        assert_eq!(m.dim(), (2, 1));
        assert!((m[(0, 0)] - 1.0).abs() < 1e-6);
        assert!((m[(1, 0)] - 0.25).abs() < 1e-6);
    }
}
