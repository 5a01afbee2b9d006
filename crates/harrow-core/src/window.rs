use tracing::debug;

use crate::element::Element;

/// Applies the query's global record window `(first, num)` to a validated
/// element list, in dataset order. `num == -1` means "everything from
/// `first`".
///
/// Elements wholly before or after the window are dropped; the elements
/// containing the window's edges are trimmed by adjusting their `first`/`num`.
/// Elements carrying their own selection bypass windowing entirely: they are
/// kept iff the selection is non-empty.
///
/// Elements must already carry resolved `num` values (no `-1`), i.e. the
/// validation exchange has run.
pub fn apply_window(elements: Vec<Element>, first: i64, num: i64) -> Vec<Element> {
    let mut kept = Vec::with_capacity(elements.len());
    let mut cur: i64 = 0;

    for mut e in elements {
        match &e.selection {
            None => {
                let e_num = e.num;

                // Entirely before the window.
                if cur + e_num < first {
                    cur += e_num;
                    debug!(target: "harrow_sched", url = %e.url, cur, "window: skip element");
                    continue;
                }
                // Entirely after the window.
                if num != -1 && first + num <= cur {
                    cur += e_num;
                    debug!(target: "harrow_sched", url = %e.url, cur, "window: drop element");
                    continue;
                }
                // Contains the window's end.
                if num != -1 && first + num < cur + e_num {
                    e.num = first + num - cur;
                }
                // Contains the window's start.
                if cur < first {
                    e.first += first - cur;
                    e.num -= first - cur;
                }
                cur += e_num;
            }
            Some(sel) => {
                if sel.is_empty() {
                    continue;
                }
            }
        }
        kept.push(e);
    }

    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::Selection;

    fn file(i: usize, entries: i64) -> Element {
        let mut e = Element::new(
            format!("hrw://h{i}.example.org/data/f{i}.dat"),
            "/data",
            format!("f{i}"),
            0,
            entries,
            "",
        );
        e.entries = entries;
        e
    }

    #[test]
    fn window_trims_boundary_elements() {
        let elements: Vec<Element> = (0..5).map(|i| file(i, 1000)).collect();
        let kept = apply_window(elements, 1500, 2000);

        // [1500, 3500) out of 5 x 1000: file 0 and file 4 fall away, file 1
        // keeps its back half, file 3 keeps its front half.
        assert_eq!(kept.len(), 3);
        assert_eq!((kept[0].first, kept[0].num), (500, 500));
        assert_eq!((kept[1].first, kept[1].num), (0, 1000));
        assert_eq!((kept[2].first, kept[2].num), (0, 500));

        let total: i64 = kept.iter().map(|e| e.num).sum();
        assert_eq!(total, 2000);
    }

    #[test]
    fn full_window_is_identity() {
        let elements: Vec<Element> = (0..3).map(|i| file(i, 100)).collect();
        let kept = apply_window(elements.clone(), 0, -1);
        assert_eq!(kept, elements);
    }

    #[test]
    fn window_past_the_end_drops_everything() {
        let elements: Vec<Element> = (0..2).map(|i| file(i, 10)).collect();
        let kept = apply_window(elements, 100, 5);
        assert!(kept.is_empty());
    }

    #[test]
    fn selection_elements_bypass_the_window() {
        let mut with_sel = file(0, 1000);
        with_sel.selection = Some(Selection::Entries(vec![1, 2, 3]));
        let mut empty_sel = file(1, 1000);
        empty_sel.selection = Some(Selection::Entries(Vec::new()));

        let kept = apply_window(vec![with_sel.clone(), empty_sel], 900, 50);
        assert_eq!(kept, vec![with_sel]);
    }
}
