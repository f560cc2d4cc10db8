use crate::models::{
    CourseIndexEntry, CourseIndexGroup, CourseOpenAnswerBundle, CourseRef, CoursesIndex,
    OpenAnswerRecord, QuestionAnswers,
};
use std::collections::HashMap;
use tracing::debug;

/// Open answers grouped by course key. Within a course the answers are
/// ordered by question text, answers to the same question keep file order.
#[derive(Debug, Default)]
pub struct OpenAnswerIndex {
    by_key: HashMap<String, Vec<OpenAnswerRecord>>,
}

impl OpenAnswerIndex {
    pub fn new(records: Vec<OpenAnswerRecord>) -> Self {
        let mut by_key: HashMap<String, Vec<OpenAnswerRecord>> = HashMap::new();
        for record in records {
            by_key
                .entry(record.course_key.clone())
                .or_default()
                .push(record);
        }
        for answers in by_key.values_mut() {
            answers.sort_by(|a, b| a.question_text.cmp(&b.question_text));
        }
        Self { by_key }
    }

    /// All answers for a course; empty when there are none.
    pub fn lookup(&self, course_key: &str) -> &[OpenAnswerRecord] {
        self.by_key
            .get(course_key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Group answers by question, pinned questions first in `pinned` order,
/// the others after them in the order they were first seen.
pub fn bundle_answers(records: &[OpenAnswerRecord], pinned: &[&str]) -> Vec<QuestionAnswers> {
    let mut positions: HashMap<&str, usize> = HashMap::new();
    let mut grouped: Vec<QuestionAnswers> = Vec::new();
    for record in records {
        let idx = *positions
            .entry(record.question_text.as_str())
            .or_insert_with(|| {
                grouped.push(QuestionAnswers {
                    question: record.question_text.clone(),
                    answers: Vec::new(),
                });
                grouped.len() - 1
            });
        grouped[idx].answers.push(record.answer.clone());
    }

    let mut slots: Vec<Option<QuestionAnswers>> = grouped.into_iter().map(Some).collect();
    let mut ordered = Vec::with_capacity(slots.len());
    for question in pinned {
        if let Some(idx) = positions.get(question) {
            if let Some(entry) = slots[*idx].take() {
                ordered.push(entry);
            }
        }
    }
    ordered.extend(slots.into_iter().flatten());
    ordered
}

pub struct OpenAnswerJoiner<'a> {
    index: &'a OpenAnswerIndex,
    pinned: &'a [&'a str],
}

impl<'a> OpenAnswerJoiner<'a> {
    pub fn new(index: &'a OpenAnswerIndex, pinned: &'a [&'a str]) -> Self {
        Self { index, pinned }
    }

    /// Bundle the open answers of every course taught and build the courses
    /// index. Courses without answers stay in the index without a link.
    pub fn join(&self, courses: &[CourseRef]) -> (Vec<CourseOpenAnswerBundle>, CoursesIndex) {
        let mut bundles = Vec::new();
        let mut index = CoursesIndex::default();

        for (n, course) in courses.iter().enumerate() {
            let records = self.index.lookup(&course.key);
            let anchor = if records.is_empty() {
                debug!(course = %course.key, "No open answers for course");
                None
            } else {
                let anchor = format!("course-{}", n + 1);
                bundles.push(CourseOpenAnswerBundle {
                    anchor: anchor.clone(),
                    course_name: course.name.clone(),
                    course_year: course.year.clone(),
                    questions: bundle_answers(records, self.pinned),
                });
                Some(anchor)
            };

            let entry = CourseIndexEntry {
                name: course.name.clone(),
                anchor,
            };
            match index.groups.iter_mut().find(|g| g.year == course.year) {
                Some(group) => group.courses.push(entry),
                None => index.groups.push(CourseIndexGroup {
                    year: course.year.clone(),
                    courses: vec![entry],
                }),
            }
        }

        (bundles, index)
    }
}
