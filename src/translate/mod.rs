//! Line translation across commits.
//!
//! Answers two questions for a single line: where did it go, and is it
//! still present at this position. Everything is derived from parsed file
//! diffs; nothing here performs I/O.

use crate::Side;
use crate::parser::{Change, ChangeKind, FileDiff};

/// Which way a diff is read relative to the thread being moved.
///
/// `Forward` diffs run from the thread's anchor to the target commit, so the
/// thread's line is in the diff's "from" numbering. `Reversed` diffs run from
/// the target to the anchor (the target is an ancestor), so the line is in the
/// "to" numbering and must be mapped backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reversed,
}

impl Direction {
    /// The change kind that proves the anchored line vanished on the way to
    /// the target commit.
    pub fn disqualifying(self) -> ChangeKind {
        match self {
            Direction::Forward => ChangeKind::Del,
            Direction::Reversed => ChangeKind::Add,
        }
    }

    /// The side whose numbering the thread's line uses in this diff.
    pub fn anchored_side(self) -> Side {
        match self {
            Direction::Forward => Side::Left,
            Direction::Reversed => Side::Right,
        }
    }
}

/// Result of moving a line through a diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineTranslation {
    pub file: String,
    pub line: i64,
}

/// How far `line` (in the diff's "from" numbering) has moved within one file.
///
/// An exact `normal` anchor wins over the accumulated delta; overshooting a
/// `normal` line returns the delta accumulated so far.
pub fn line_nudge(file_diff: &FileDiff, line: i64) -> i64 {
    nudge(file_diff, line, Direction::Forward)
}

/// Direction-aware nudge. `Reversed` maps a "to" line back to "from".
pub fn nudge(file_diff: &FileDiff, line: i64, direction: Direction) -> i64 {
    let Some(first) = file_diff.hunks.first() else {
        return 0;
    };
    let first_line = match direction {
        Direction::Forward => first.old_start,
        Direction::Reversed => first.new_start,
    };
    if line < i64::from(first_line) {
        return 0;
    }

    let mut delta = 0;
    for change in file_diff.changes() {
        match (change, direction) {
            (Change::Normal { ln1, ln2, .. }, Direction::Forward) => {
                let (ln1, ln2) = (i64::from(*ln1), i64::from(*ln2));
                if ln1 == line {
                    return ln2 - ln1;
                }
                if ln1 > line {
                    return delta;
                }
            }
            (Change::Normal { ln1, ln2, .. }, Direction::Reversed) => {
                let (ln1, ln2) = (i64::from(*ln1), i64::from(*ln2));
                if ln2 == line {
                    return ln1 - ln2;
                }
                if ln2 > line {
                    return delta;
                }
            }
            (Change::Add { .. }, Direction::Forward) | (Change::Del { .. }, Direction::Reversed) => {
                delta += 1;
            }
            (Change::Del { .. }, Direction::Forward) | (Change::Add { .. }, Direction::Reversed) => {
                delta -= 1;
            }
        }
    }

    // Off the end of the diff
    delta
}

/// Find the file diff whose anchored-side path is `file`.
pub fn find_file<'a>(diffs: &'a [FileDiff], file: &str, direction: Direction) -> Option<&'a FileDiff> {
    diffs.iter().find(|d| {
        let path = match direction {
            Direction::Forward => d.from_path(),
            Direction::Reversed => d.to_path(),
        };
        path == Some(file)
    })
}

/// Move `(file, line)` through a diff read in `direction`.
///
/// Returns `None` when the diff does not touch `file` at all. That is "no
/// match", which callers must keep distinct from an outdated line.
pub fn translate_in(
    diffs: &[FileDiff],
    file: &str,
    line: i64,
    direction: Direction,
) -> Option<LineTranslation> {
    let file_diff = find_file(diffs, file, direction)?;
    let renamed = match direction {
        Direction::Forward => file_diff.to_path(),
        Direction::Reversed => file_diff.from_path(),
    };

    Some(LineTranslation {
        file: renamed.unwrap_or(file).to_string(),
        line: line + nudge(file_diff, line, direction),
    })
}

/// Move a line through a diff taken from its commit to a later commit.
pub fn translate(diffs: &[FileDiff], file: &str, line: i64) -> Option<LineTranslation> {
    translate_in(diffs, file, line, Direction::Forward)
}

/// Follow the head of a review forward: the diff runs from the anchor to the
/// new head, matched on the "from" path.
pub fn translate_across_head_move(
    diffs: &[FileDiff],
    file: &str,
    line: i64,
) -> Option<LineTranslation> {
    translate_in(diffs, file, line, Direction::Forward)
}

/// Follow a base that moved to an ancestor: the diff runs from the new base to
/// the anchor, matched on the "to" path.
pub fn translate_across_base_move(
    diffs: &[FileDiff],
    file: &str,
    line: i64,
) -> Option<LineTranslation> {
    translate_in(diffs, file, line, Direction::Reversed)
}

/// Every change recorded at `line`.
///
/// `add`/`del` changes match on their own line number. `normal` changes
/// match on `ln1` for the left side and `ln2` for the right side.
pub fn changes_at(file_diff: &FileDiff, line: i64, side: Side) -> Vec<&Change> {
    file_diff
        .changes()
        .filter(|change| match change {
            Change::Add { ln, .. } | Change::Del { ln, .. } => i64::from(*ln) == line,
            Change::Normal { ln1, ln2, .. } => match side {
                Side::Left => i64::from(*ln1) == line,
                Side::Right => i64::from(*ln2) == line,
            },
        })
        .collect()
}

/// Whether a change of `kind` is recorded at `line`.
pub fn has_change_at(file_diff: &FileDiff, line: i64, side: Side, kind: ChangeKind) -> bool {
    changes_at(file_diff, line, side)
        .iter()
        .any(|c| c.kind() == kind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{Hunk, parse_diff};

    fn scenario_a() -> FileDiff {
        FileDiff {
            from: Some("f.txt".to_string()),
            to: Some("f.txt".to_string()),
            hunks: vec![Hunk {
                old_start: 10,
                old_lines: 4,
                new_start: 10,
                new_lines: 4,
                changes: vec![
                    Change::Normal { ln1: 10, ln2: 10, content: "a".to_string() },
                    Change::Normal { ln1: 11, ln2: 11, content: "b".to_string() },
                    Change::Del { ln: 12, content: "old".to_string() },
                    Change::Add { ln: 12, content: "new".to_string() },
                    Change::Normal { ln1: 13, ln2: 13, content: "c".to_string() },
                ],
            }],
        }
    }

    const SHIFT_DIFF: &str = r#"diff --git a/src/lib.rs b/src/lib.rs
--- a/src/lib.rs
+++ b/src/lib.rs
@@ -3,4 +3,6 @@
 three
+inserted one
+inserted two
 four
-five
+five changed
 six
@@ -20,3 +22,2 @@
 twenty
-twenty one
 twenty two
"#;

    #[test]
    fn lines_before_first_hunk_do_not_move() {
        let diff = scenario_a();
        for line in 1..10 {
            assert_eq!(line_nudge(&diff, line), 0);
        }
    }

    #[test]
    fn scenario_a_translations() {
        let diffs = vec![scenario_a()];
        assert_eq!(translate(&diffs, "f.txt", 13).unwrap().line, 13);
        assert_eq!(translate(&diffs, "f.txt", 5).unwrap().line, 5);
        assert_eq!(translate(&diffs, "f.txt", 20).unwrap().line, 20);
    }

    #[test]
    fn exact_normal_anchor_wins() {
        let diffs = parse_diff(SHIFT_DIFF).unwrap();
        // "four" was line 4, now line 6
        assert_eq!(translate(&diffs, "src/lib.rs", 4).unwrap().line, 6);
        // "six" was line 6, now line 8
        assert_eq!(translate(&diffs, "src/lib.rs", 6).unwrap().line, 8);
        // "twenty two" was line 22, now line 23
        assert_eq!(translate(&diffs, "src/lib.rs", 22).unwrap().line, 23);
    }

    #[test]
    fn lines_between_hunks_take_accumulated_delta() {
        let diffs = parse_diff(SHIFT_DIFF).unwrap();
        // line 10 sits between the hunks: +2 from the insertions
        assert_eq!(translate(&diffs, "src/lib.rs", 10).unwrap().line, 12);
    }

    #[test]
    fn lines_after_last_hunk_take_final_delta() {
        let diffs = parse_diff(SHIFT_DIFF).unwrap();
        assert_eq!(translate(&diffs, "src/lib.rs", 40).unwrap().line, 41);
    }

    #[test]
    fn deleted_line_takes_delta_before_overshoot() {
        let diffs = parse_diff(SHIFT_DIFF).unwrap();
        // "five" (old 5) was replaced; the overshoot at "six" returns the +2
        // accumulated by then
        assert_eq!(line_nudge(&diffs[0], 5), 2);
    }

    #[test]
    fn untouched_file_is_no_match() {
        let diffs = parse_diff(SHIFT_DIFF).unwrap();
        assert_eq!(translate(&diffs, "README.md", 3), None);
    }

    #[test]
    fn rename_carries_the_new_path() {
        let diff = r#"diff --git a/old.rs b/new.rs
similarity index 90%
rename from old.rs
rename to new.rs
--- a/old.rs
+++ b/new.rs
@@ -1,2 +1,3 @@
+// header
 fn a() {}
 fn b() {}
"#;
        let diffs = parse_diff(diff).unwrap();
        let moved = translate_across_head_move(&diffs, "old.rs", 2).unwrap();
        assert_eq!(moved, LineTranslation { file: "new.rs".to_string(), line: 3 });
    }

    #[test]
    fn base_move_reads_the_diff_backwards() {
        let diffs = parse_diff(SHIFT_DIFF).unwrap();
        // "four" is line 6 in the newer commit, line 4 in the older one
        let moved = translate_across_base_move(&diffs, "src/lib.rs", 6).unwrap();
        assert_eq!(moved.line, 4);
        // after the last hunk the reverse delta applies
        assert_eq!(translate_across_base_move(&diffs, "src/lib.rs", 41).unwrap().line, 40);
    }

    #[test]
    fn changes_at_matches_by_side() {
        let diff = scenario_a();
        let left: Vec<ChangeKind> = changes_at(&diff, 12, Side::Left).iter().map(|c| c.kind()).collect();
        assert_eq!(left, vec![ChangeKind::Del, ChangeKind::Add]);

        let right_13 = changes_at(&diff, 13, Side::Right);
        assert_eq!(right_13.len(), 1);
        assert_eq!(right_13[0].kind(), ChangeKind::Normal);

        assert!(changes_at(&diff, 7, Side::Left).is_empty());
    }

    #[test]
    fn normal_lines_match_on_their_own_side() {
        let diffs = parse_diff(SHIFT_DIFF).unwrap();
        // "four": ln1 = 4, ln2 = 6
        assert!(has_change_at(&diffs[0], 4, Side::Left, ChangeKind::Normal));
        assert!(!has_change_at(&diffs[0], 4, Side::Right, ChangeKind::Normal));
        assert!(has_change_at(&diffs[0], 6, Side::Right, ChangeKind::Normal));
    }

    #[test]
    fn file_without_hunks_has_zero_nudge() {
        let diff = FileDiff {
            from: Some("a".to_string()),
            to: Some("b".to_string()),
            hunks: Vec::new(),
        };
        assert_eq!(line_nudge(&diff, 100), 0);
    }
}
