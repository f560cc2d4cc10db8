use crate::loader::ResponseData;
use crate::models::{
    CourseDetailSummary, CourseRef, MeltedCourseDetail, ResponseRecord, TeacherId,
    TeacherScoreSummary, WideResponseRecord,
};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use tracing::info;

/// Detail table in the shape of its export version.
#[derive(Debug, Clone)]
pub enum DetailTable {
    /// Per (teacher, year, course, question), 2017
    Grouped(Vec<CourseDetailSummary>),
    /// Per (teacher, course, form, item), 2018
    Melted(Vec<MeltedCourseDetail>),
}

impl DetailTable {
    pub fn contains_teacher(&self, teacher: TeacherId) -> bool {
        match self {
            DetailTable::Grouped(rows) => rows.iter().any(|r| r.teacher == teacher),
            DetailTable::Melted(rows) => rows.iter().any(|r| r.teacher == teacher),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            DetailTable::Grouped(rows) => rows.len(),
            DetailTable::Melted(rows) => rows.len(),
        }
    }
}

/// Everything the reports are built from, computed once per run.
#[derive(Debug, Clone)]
pub struct EvaluationTables {
    /// Only the long export carries per-question values to score teachers on
    pub teacher_scores: Option<Vec<TeacherScoreSummary>>,
    pub details: DetailTable,
    pub courses_taught: HashMap<TeacherId, Vec<CourseRef>>,
}

impl EvaluationTables {
    /// Whether the teacher has data to report on. Looks at the score summary
    /// when there is one, otherwise at the detail table.
    pub fn has_teacher(&self, teacher: TeacherId) -> bool {
        match &self.teacher_scores {
            Some(scores) => scores.iter().any(|s| s.teacher == teacher),
            None => self.details.contains_teacher(teacher),
        }
    }

    pub fn teacher_scores_for(&self, teacher: TeacherId) -> Option<Vec<&TeacherScoreSummary>> {
        self.teacher_scores
            .as_ref()
            .map(|scores| scores.iter().filter(|s| s.teacher == teacher).collect())
    }

    pub fn courses_for(&self, teacher: TeacherId) -> &[CourseRef] {
        self.courses_taught
            .get(&teacher)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Running respondent-weighted total of one group.
#[derive(Debug, Clone, Copy, Default)]
struct WeightedSum {
    total: f64,
    count: f64,
}

impl WeightedSum {
    // Respondents always count, the weighted total only with a value
    fn add(&mut self, value: Option<f64>, count: Option<f64>) {
        let Some(count) = count else {
            return;
        };
        self.count += count;
        if let Some(value) = value {
            self.total += value * count;
        }
    }

    fn mean(&self) -> Option<f64> {
        if self.count == 0.0 {
            return None;
        }
        let mean = self.total / self.count;
        mean.is_finite().then(|| round2(mean))
    }
}

/// Round to 2 decimals, ties to even.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round_ties_even() / 100.0
}

/// Compare two cell values numerically when both are numbers, as text otherwise.
pub fn compare_cells(a: &str, b: &str) -> Ordering {
    match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        (Ok(x), Ok(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
        _ => a.cmp(b),
    }
}

/// Group rows by key in first-encounter order, summing weighted values.
fn group_weighted<K, I>(rows: I) -> Vec<(K, WeightedSum)>
where
    K: Eq + Hash + Clone,
    I: IntoIterator<Item = (K, Option<f64>, Option<f64>)>,
{
    let mut positions: HashMap<K, usize> = HashMap::new();
    let mut groups: Vec<(K, WeightedSum)> = Vec::new();

    for (key, value, count) in rows {
        let idx = *positions.entry(key.clone()).or_insert_with(|| {
            groups.push((key, WeightedSum::default()));
            groups.len() - 1
        });
        groups[idx].1.add(value, count);
    }

    groups
}

pub struct EvaluationAnalyzer<'a> {
    pub exclusion_question: &'a str,
}

impl<'a> EvaluationAnalyzer<'a> {
    pub fn new(exclusion_question: &'a str) -> Self {
        Self { exclusion_question }
    }

    fn is_excluded(&self, question_text: &str) -> bool {
        !self.exclusion_question.is_empty() && question_text.contains(self.exclusion_question)
    }

    pub fn analyze(&self, data: ResponseData) -> EvaluationTables {
        let tables = match data {
            ResponseData::Long(mut records) => {
                sort_response_records(&mut records);
                EvaluationTables {
                    teacher_scores: Some(self.teacher_scores(&records)),
                    details: DetailTable::Grouped(self.course_details(&records)),
                    courses_taught: courses_from_records(&records),
                }
            }
            ResponseData::Wide(records) => {
                let melted = self.melt(&records);
                let courses_taught = courses_from_melted(&melted);
                EvaluationTables {
                    teacher_scores: None,
                    details: DetailTable::Melted(melted),
                    courses_taught,
                }
            }
        };

        info!(
            teacher_scores = tables.teacher_scores.as_ref().map(Vec::len).unwrap_or(0),
            detail_rows = tables.details.len(),
            teachers = tables.courses_taught.len(),
            "Aggregated evaluation data"
        );
        tables
    }

    /// Teacher score per (teacher, year), leaving out the excluded question.
    /// Sorted by teacher then year, both descending.
    pub fn teacher_scores(&self, records: &[ResponseRecord]) -> Vec<TeacherScoreSummary> {
        let groups = group_weighted(
            records
                .iter()
                .filter(|r| !self.is_excluded(&r.question_text))
                .map(|r| {
                    (
                        (r.teacher, r.course_year.clone()),
                        r.resp_value,
                        r.resp_count,
                    )
                }),
        );

        let mut summaries: Vec<TeacherScoreSummary> = groups
            .into_iter()
            .filter_map(|((teacher, course_year), sum)| {
                sum.mean().map(|score| TeacherScoreSummary {
                    teacher,
                    course_year,
                    score,
                })
            })
            .collect();

        summaries.sort_by(|a, b| {
            b.teacher
                .cmp(&a.teacher)
                .then_with(|| compare_cells(&b.course_year, &a.course_year))
        });
        summaries
    }

    /// Average score and respondents per (teacher, year, course, question),
    /// sorted teacher ascending, year descending, course and question ascending.
    pub fn course_details(&self, records: &[ResponseRecord]) -> Vec<CourseDetailSummary> {
        let groups = group_weighted(records.iter().map(|r| {
            (
                (
                    r.teacher,
                    r.course_year.clone(),
                    r.course_name.clone(),
                    r.question_text.clone(),
                ),
                r.resp_value,
                r.resp_count,
            )
        }));

        let mut details: Vec<CourseDetailSummary> = groups
            .into_iter()
            .filter_map(|((teacher, course_year, course_name, question_text), sum)| {
                sum.mean().map(|score| CourseDetailSummary {
                    teacher,
                    course_year,
                    course_name,
                    question_text,
                    respondents: sum.count,
                    score,
                })
            })
            .collect();

        details.sort_by(|a, b| {
            a.teacher
                .cmp(&b.teacher)
                .then_with(|| compare_cells(&b.course_year, &a.course_year))
                .then_with(|| a.course_name.cmp(&b.course_name))
                .then_with(|| a.question_text.cmp(&b.question_text))
        });
        details
    }

    /// Unpivot wide rows into one row per item, item-major, then sort by
    /// teacher ascending, course name descending, course code and education
    /// form ascending. Rows without a score or respondent count are dropped.
    pub fn melt(&self, records: &[WideResponseRecord]) -> Vec<MeltedCourseDetail> {
        let item_count = records.iter().map(|r| r.items.len()).max().unwrap_or(0);
        let mut melted = Vec::with_capacity(item_count * records.len());

        for item_idx in 0..item_count {
            for record in records {
                let Some((item, Some(score))) = record.items.get(item_idx) else {
                    continue;
                };
                let Some(respondents) = record.resp_count else {
                    continue;
                };
                melted.push(MeltedCourseDetail {
                    teacher: record.teacher,
                    course_code: record.course_code.clone(),
                    course_name: record.course_name.clone(),
                    educ_form: record.educ_form.clone(),
                    respondents,
                    item: item.clone(),
                    score: *score,
                });
            }
        }

        melted.sort_by(|a, b| {
            a.teacher
                .cmp(&b.teacher)
                .then_with(|| b.course_name.cmp(&a.course_name))
                .then_with(|| compare_cells(&a.course_code, &b.course_code))
                .then_with(|| a.educ_form.cmp(&b.educ_form))
        });
        melted
    }
}

/// Teacher ascending, year descending, course name and question ascending.
fn sort_response_records(records: &mut [ResponseRecord]) {
    records.sort_by(|a, b| {
        a.teacher
            .cmp(&b.teacher)
            .then_with(|| compare_cells(&b.course_year, &a.course_year))
            .then_with(|| a.course_name.cmp(&b.course_name))
            .then_with(|| a.question_text.cmp(&b.question_text))
    });
}

fn push_course(
    courses: &mut HashMap<TeacherId, Vec<CourseRef>>,
    seen: &mut HashSet<(TeacherId, CourseRef)>,
    teacher: TeacherId,
    course: CourseRef,
) {
    if seen.insert((teacher, course.clone())) {
        courses.entry(teacher).or_default().push(course);
    }
}

fn courses_from_records(records: &[ResponseRecord]) -> HashMap<TeacherId, Vec<CourseRef>> {
    let mut courses = HashMap::new();
    let mut seen = HashSet::new();
    for record in records {
        let course = CourseRef {
            key: record.course_key.clone(),
            name: record.course_name.clone(),
            year: Some(record.course_year.clone()),
        };
        push_course(&mut courses, &mut seen, record.teacher, course);
    }
    courses
}

fn courses_from_melted(rows: &[MeltedCourseDetail]) -> HashMap<TeacherId, Vec<CourseRef>> {
    let mut courses = HashMap::new();
    let mut seen = HashSet::new();
    for row in rows {
        let course = CourseRef {
            key: row.course_code.clone(),
            name: row.course_name.clone(),
            year: None,
        };
        push_course(&mut courses, &mut seen, row.teacher, course);
    }
    courses
}
