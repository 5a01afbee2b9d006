use serde::{Deserialize, Serialize};

/// A filter over a file's records, attached to an [`Element`].
///
/// Two shapes exist in the wild: a sparse, sorted list of record indices and
/// a dense contiguous window. A selected element's logical record stream is
/// the selection itself: the scheduler addresses it by *position* in the
/// selection, `0..len()`. The packetizer treats both shapes uniformly
/// through `len` and `restrict`.
///
/// [`Element`]: crate::Element
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selection {
    /// Sparse: explicit record indices, ascending.
    Entries(Vec<i64>),
    /// Dense: all records in `[first, first + num)`.
    Window { first: i64, num: i64 },
}

impl Selection {
    /// Number of records the selection admits.
    pub fn len(&self) -> i64 {
        match self {
            Selection::Entries(list) => list.len() as i64,
            Selection::Window { num, .. } => (*num).max(0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Narrows the selection to positions `[first, first + num)`.
    ///
    /// A packet carved at positions `[first, first + num)` of a selected
    /// element carries exactly this slice, so a worker sees only the
    /// records it was handed.
    pub fn restrict(&self, first: i64, num: i64) -> Selection {
        match self {
            Selection::Entries(list) => {
                let len = list.len() as i64;
                let lo = first.clamp(0, len);
                let hi = first.saturating_add(num.max(0)).clamp(lo, len);
                Selection::Entries(list[lo as usize..hi as usize].to_vec())
            }
            Selection::Window {
                first: win_first,
                num: win_num,
            } => {
                let len = (*win_num).max(0);
                let lo = first.clamp(0, len);
                let hi = first.saturating_add(num.max(0)).clamp(lo, len);
                Selection::Window {
                    first: win_first + lo,
                    num: hi - lo,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_restrict_slices_by_position() {
        let sel = Selection::Entries(vec![1, 5, 9, 14, 20]);
        assert_eq!(sel.len(), 5);
        assert_eq!(sel.restrict(1, 3), Selection::Entries(vec![5, 9, 14]));
        assert_eq!(sel.restrict(4, 10), Selection::Entries(vec![20]));
    }

    #[test]
    fn window_restrict_slices_by_position() {
        let sel = Selection::Window { first: 10, num: 20 };
        assert_eq!(sel.restrict(0, 5), Selection::Window { first: 10, num: 5 });
        assert_eq!(
            sel.restrict(15, 100),
            Selection::Window { first: 25, num: 5 }
        );
    }

    #[test]
    fn out_of_range_restrict_is_empty() {
        let sel = Selection::Entries(vec![1, 2, 3]);
        assert!(sel.restrict(10, 5).is_empty());
        let win = Selection::Window { first: 0, num: 3 };
        assert!(win.restrict(3, 1).is_empty());
    }

    #[test]
    fn restricting_everything_is_identity() {
        let sel = Selection::Entries(vec![2, 4, 6]);
        assert_eq!(sel.restrict(0, 3), sel);
    }
}
