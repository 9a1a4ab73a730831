//! Which lectures of a course a run actually downloads.
//!
//! Two independent filters compose with logical AND: an explicit chapter set
//! (`"1,3-5,7"`) and an inclusive (chapter, lecture) range. An item is
//! eligible only when both accept it.

use std::collections::BTreeSet;

use thiserror::Error;
use tracing::warn;

use crate::catalog::models::Position;

/// Lecture ordinal used for an unbounded range end. No real chapter carries
/// this many lectures.
pub const LECTURE_ORDINAL_MAX: u32 = 1000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("--start-lecture requires --start-chapter")]
    StartLectureWithoutChapter,
    #[error("--end-lecture requires --end-chapter")]
    EndLectureWithoutChapter,
}

/// Explicit chapter ordinals parsed from a list expression like `"1,3-5,7"`.
/// Malformed tokens are warned and skipped rather than failing the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChapterSet {
    chapters: BTreeSet<u32>,
}

impl ChapterSet {
    pub fn parse(input: &str) -> Self {
        let mut chapters = BTreeSet::new();
        for token in input.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if let Some((lo, hi)) = token.split_once('-') {
                match (lo.trim().parse::<u32>(), hi.trim().parse::<u32>()) {
                    (Ok(lo), Ok(hi)) if lo <= hi => chapters.extend(lo..=hi),
                    _ => warn!(target: "selection", token, "ignoring malformed chapter range"),
                }
            } else {
                match token.parse::<u32>() {
                    Ok(n) => {
                        chapters.insert(n);
                    }
                    Err(_) => warn!(target: "selection", token, "ignoring malformed chapter token"),
                }
            }
        }
        Self { chapters }
    }

    pub fn contains(&self, chapter: u32) -> bool {
        self.chapters.contains(&chapter)
    }

    pub fn is_empty(&self) -> bool {
        self.chapters.is_empty()
    }
}

/// Resolved selection for one run. Build via [`SelectionBuilder`] so the
/// chapter/lecture flag dependencies are checked in one place.
#[derive(Debug, Clone)]
pub struct Selection {
    start: Position,
    end: Position,
    chapters: Option<ChapterSet>,
}

impl Selection {
    pub fn everything() -> Self {
        Self {
            start: Position::new(1, 1),
            end: Position::new(u32::MAX, LECTURE_ORDINAL_MAX),
            chapters: None,
        }
    }

    pub fn is_eligible(&self, position: Position) -> bool {
        if let Some(set) = &self.chapters
            && !set.contains(position.chapter)
        {
            return false;
        }
        position >= self.start && position <= self.end
    }
}

#[derive(Debug, Default)]
pub struct SelectionBuilder {
    start_chapter: Option<u32>,
    start_lecture: Option<u32>,
    end_chapter: Option<u32>,
    end_lecture: Option<u32>,
    chapter_list: Option<String>,
}

impl SelectionBuilder {
    pub fn start(mut self, chapter: Option<u32>, lecture: Option<u32>) -> Self {
        self.start_chapter = chapter;
        self.start_lecture = lecture;
        self
    }

    pub fn end(mut self, chapter: Option<u32>, lecture: Option<u32>) -> Self {
        self.end_chapter = chapter;
        self.end_lecture = lecture;
        self
    }

    pub fn chapters(mut self, list: Option<String>) -> Self {
        self.chapter_list = list;
        self
    }

    /// `last_chapter` is the course's chapter count, used for the default
    /// range end.
    pub fn build(self, last_chapter: u32) -> Result<Selection, SelectionError> {
        if self.start_lecture.is_some() && self.start_chapter.is_none() {
            return Err(SelectionError::StartLectureWithoutChapter);
        }
        if self.end_lecture.is_some() && self.end_chapter.is_none() {
            return Err(SelectionError::EndLectureWithoutChapter);
        }
        let start = Position::new(
            self.start_chapter.unwrap_or(1),
            self.start_lecture.unwrap_or(1),
        );
        let end = Position::new(
            self.end_chapter.unwrap_or(last_chapter.max(1)),
            self.end_lecture.unwrap_or(LECTURE_ORDINAL_MAX),
        );
        let chapters = self.chapter_list.as_deref().map(ChapterSet::parse);
        if let Some(set) = &chapters
            && set.is_empty()
        {
            warn!(target: "selection", "chapter filter matched nothing, no items will be selected");
        }
        Ok(Selection {
            start,
            end,
            chapters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chapter_set_parses_singles_and_ranges() {
        let set = ChapterSet::parse("1,3-5,7");
        for n in [1, 3, 4, 5, 7] {
            assert!(set.contains(n), "{n} should be in set");
        }
        for n in [2, 6, 8] {
            assert!(!set.contains(n), "{n} should not be in set");
        }
    }

    #[test]
    fn chapter_set_skips_malformed_tokens() {
        let set = ChapterSet::parse("2, x, 9-7, 4-4,");
        assert!(set.contains(2));
        assert!(set.contains(4));
        assert!(!set.contains(7));
        assert!(!set.contains(8));
        assert!(!set.contains(9));
    }

    #[test]
    fn range_is_inclusive_and_lexicographic() {
        let selection = SelectionBuilder::default()
            .start(Some(2), Some(3))
            .end(Some(2), Some(10))
            .build(5)
            .unwrap();
        assert!(!selection.is_eligible(Position::new(2, 2)));
        assert!(selection.is_eligible(Position::new(2, 3)));
        assert!(selection.is_eligible(Position::new(2, 10)));
        assert!(!selection.is_eligible(Position::new(2, 11)));
        assert!(!selection.is_eligible(Position::new(1, 9)));
        assert!(!selection.is_eligible(Position::new(3, 1)));
    }

    #[test]
    fn defaults_span_whole_course() {
        let selection = SelectionBuilder::default().build(4).unwrap();
        assert!(selection.is_eligible(Position::new(1, 1)));
        assert!(selection.is_eligible(Position::new(4, 999)));
        assert!(!selection.is_eligible(Position::new(5, 1)));
    }

    #[test]
    fn chapter_set_composes_with_range() {
        let selection = SelectionBuilder::default()
            .start(Some(1), None)
            .end(Some(4), None)
            .chapters(Some("1,3-5,7".into()))
            .build(8)
            .unwrap();
        assert!(selection.is_eligible(Position::new(3, 1)));
        assert!(!selection.is_eligible(Position::new(2, 1))); // not in set
        assert!(!selection.is_eligible(Position::new(5, 1))); // past range end
        assert!(!selection.is_eligible(Position::new(7, 1))); // in set, past range
    }

    #[test]
    fn lecture_flags_require_chapter_flags() {
        let err = SelectionBuilder::default()
            .start(None, Some(3))
            .build(5)
            .unwrap_err();
        assert_eq!(err, SelectionError::StartLectureWithoutChapter);

        let err = SelectionBuilder::default()
            .end(None, Some(3))
            .build(5)
            .unwrap_err();
        assert_eq!(err, SelectionError::EndLectureWithoutChapter);
    }

    #[test]
    fn everything_accepts_anything() {
        let selection = Selection::everything();
        assert!(selection.is_eligible(Position::new(1, 1)));
        assert!(selection.is_eligible(Position::new(500, 999)));
    }
}
