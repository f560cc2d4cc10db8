use crate::error::{ReportError, Result};
use crate::models::{
    OpenAnswerRecord, ResponseRecord, RosterEntry, SchemaVersion, TeacherId, WideResponseRecord,
};
use csv::{ReaderBuilder, StringRecord, Trim};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const COURSE_SCORE_ITEM: &str = "Course score";

/// Column layout and special cases of one export version.
#[derive(Debug, Clone)]
pub struct SchemaProfile {
    pub version: SchemaVersion,
    /// (export header, canonical field) for the numeric response table
    pub response_columns: &'static [(&'static str, &'static str)],
    /// (export header, canonical field) for the open-answer table
    pub open_answer_columns: &'static [(&'static str, &'static str)],
    /// Export columns ignored entirely
    pub dropped_columns: &'static [&'static str],
    /// Item columns shown under another name (wide exports only)
    pub renamed_items: &'static [(&'static str, &'static str)],
    /// When set, only these open questions are kept, under the second name
    pub open_question_translations: Option<&'static [(&'static str, &'static str)]>,
    /// Open questions shown first, in this order
    pub pinned_questions: &'static [&'static str],
}

const RESPONSE_COLUMNS_2017: &[(&str, &str)] = &[
    ("EVL_SIN_ID", "sin_id"),
    ("EVL_JAAR", "course_year"),
    ("VRG_TEXT_ENG", "question_text"),
    ("EEV_PARAM_DOCENT", "teacher_erna"),
    ("Total", "resp_count"),
    ("AMC_ORDERID", "resp_value"),
    ("Lange naam", "course_name"),
];

const OPEN_ANSWER_COLUMNS_2017: &[(&str, &str)] = &[
    ("EVL_SIN_ID", "sin_id"),
    ("VRG_TEXT_ENG", "question_text"),
    ("ROP_CONTENT", "resp_value"),
];

const PINNED_2017: &[&str] = &[
    "The strongest features of this course are:",
    "De sterke punten van dit vak zijn:",
    "The weakest features of this course are:",
    "De zwakke punten van dit vak zijn:",
];

const RESPONSE_COLUMNS_2018: &[(&str, &str)] = &[
    ("Teacher code", "teacher_erna"),
    ("Course ID", "course_code"),
    ("Course name", "course_name"),
    ("Education form", "educ_form"),
    ("Respondents per teacher", "resp_count"),
    ("Vakscore - gemiddelde", "course_score"),
];

const OPEN_ANSWER_COLUMNS_2018: &[(&str, &str)] = &[
    ("EVL_VAK", "course_code"),
    ("VRG_TEXT_NL", "question_text"),
    ("ROP_CONTENT", "resp_value"),
];

const RENAMED_ITEMS_2018: &[(&str, &str)] = &[(
    "Ik heb veel geleerd in dit vak",
    "I learned much in this course",
)];

const OPEN_QUESTIONS_2018: &[(&str, &str)] = &[
    (
        "Wat heb je gewaardeerd in dit vak?",
        "What did you appreciate in this course?",
    ),
    (
        "Welke suggesties heb je om dit vak te verbeteren?",
        "Which suggestions do you have to improve this course?",
    ),
];

const PINNED_2018: &[&str] = &[
    "What did you appreciate in this course?",
    "Which suggestions do you have to improve this course?",
];

impl SchemaProfile {
    pub fn for_version(version: SchemaVersion) -> Self {
        match version {
            SchemaVersion::V2017 => Self {
                version,
                response_columns: RESPONSE_COLUMNS_2017,
                open_answer_columns: OPEN_ANSWER_COLUMNS_2017,
                dropped_columns: &[],
                renamed_items: &[],
                open_question_translations: None,
                pinned_questions: PINNED_2017,
            },
            SchemaVersion::V2018 => Self {
                version,
                response_columns: RESPONSE_COLUMNS_2018,
                open_answer_columns: OPEN_ANSWER_COLUMNS_2018,
                dropped_columns: &["Teacher name", "Period"],
                renamed_items: RENAMED_ITEMS_2018,
                open_question_translations: Some(OPEN_QUESTIONS_2018),
                pinned_questions: PINNED_2018,
            },
        }
    }

    /// Field the open answers are joined on
    pub fn join_field(&self) -> &'static str {
        match self.version {
            SchemaVersion::V2017 => "sin_id",
            SchemaVersion::V2018 => "course_code",
        }
    }
}

/// Numeric response table in the shape of its export version.
#[derive(Debug, Clone)]
pub enum ResponseData {
    Long(Vec<ResponseRecord>),
    Wide(Vec<WideResponseRecord>),
}

/// Maps canonical field names to column positions of one table.
struct ColumnIndex {
    file: PathBuf,
    fields: Vec<(&'static str, usize)>,
}

impl ColumnIndex {
    fn build(
        file: &Path,
        headers: &StringRecord,
        columns: &[(&'static str, &'static str)],
    ) -> Result<Self> {
        let mut fields = Vec::with_capacity(columns.len());
        for (source, canonical) in columns {
            let position = headers
                .iter()
                .position(|h| h == *source)
                .ok_or_else(|| ReportError::Schema {
                    file: file.to_path_buf(),
                    column: source.to_string(),
                })?;
            fields.push((*canonical, position));
        }
        Ok(Self {
            file: file.to_path_buf(),
            fields,
        })
    }

    fn position(&self, canonical: &str) -> usize {
        self.fields
            .iter()
            .find(|(name, _)| *name == canonical)
            .map(|(_, pos)| *pos)
            .unwrap_or(usize::MAX)
    }

    fn text(&self, record: &StringRecord, canonical: &str) -> String {
        record
            .get(self.position(canonical))
            .unwrap_or("")
            .to_string()
    }

    fn teacher(&self, record: &StringRecord) -> Result<TeacherId> {
        let raw = self.text(record, "teacher_erna");
        TeacherId::parse(&raw).ok_or_else(|| ReportError::InvalidRecord {
            file: self.file.clone(),
            row: row_number(record),
            reason: format!("cannot normalize teacher id '{}'", raw),
        })
    }

    fn number(&self, record: &StringRecord, canonical: &str) -> Result<Option<f64>> {
        let raw = self.text(record, canonical);
        parse_number(&raw).map_err(|_| ReportError::InvalidRecord {
            file: self.file.clone(),
            row: row_number(record),
            reason: format!("{} '{}' is not a number", canonical, raw),
        })
    }
}

fn row_number(record: &StringRecord) -> usize {
    record.position().map(|p| p.line() as usize).unwrap_or(0)
}

/// Parse a spreadsheet number cell. Empty cells are missing values.
pub fn parse_number(raw: &str) -> std::result::Result<Option<f64>, std::num::ParseFloatError> {
    let raw = raw.trim();
    if raw.is_empty() || raw.eq_ignore_ascii_case("nan") {
        return Ok(None);
    }
    raw.replace(',', ".").parse::<f64>().map(Some)
}

fn read_table(path: &Path) -> Result<(StringRecord, Vec<StringRecord>)> {
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .trim(Trim::All)
        .from_path(path)?;
    let headers = reader.headers()?.clone();
    let records = reader.records().collect::<std::result::Result<Vec<_>, _>>()?;
    debug!(path = %path.display(), rows = records.len(), "Read table");
    Ok((headers, records))
}

pub struct SurveyLoader<'a> {
    profile: &'a SchemaProfile,
}

impl<'a> SurveyLoader<'a> {
    pub fn new(profile: &'a SchemaProfile) -> Self {
        Self { profile }
    }

    pub fn load_responses(&self, path: &Path) -> Result<ResponseData> {
        let data = match self.profile.version {
            SchemaVersion::V2017 => ResponseData::Long(self.load_long_responses(path)?),
            SchemaVersion::V2018 => ResponseData::Wide(self.load_wide_responses(path)?),
        };
        Ok(data)
    }

    fn load_long_responses(&self, path: &Path) -> Result<Vec<ResponseRecord>> {
        let (headers, rows) = read_table(path)?;
        let columns = ColumnIndex::build(path, &headers, self.profile.response_columns)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            records.push(ResponseRecord {
                teacher: columns.teacher(row)?,
                course_key: normalize_course_key(&columns.text(row, "sin_id")),
                course_year: columns.text(row, "course_year"),
                course_name: columns.text(row, "course_name"),
                question_text: columns.text(row, "question_text"),
                resp_value: columns.number(row, "resp_value")?,
                resp_count: columns.number(row, "resp_count")?,
            });
        }

        info!(path = %path.display(), records = records.len(), "Loaded response records");
        Ok(records)
    }

    fn load_wide_responses(&self, path: &Path) -> Result<Vec<WideResponseRecord>> {
        let (headers, rows) = read_table(path)?;
        let columns = ColumnIndex::build(path, &headers, self.profile.response_columns)?;

        let fixed: HashSet<usize> = columns.fields.iter().map(|(_, pos)| *pos).collect();
        // "Course score" leads the item list, the rest follow in file order
        let mut item_columns = vec![(
            COURSE_SCORE_ITEM.to_string(),
            columns.position("course_score"),
        )];
        for (pos, header) in headers.iter().enumerate() {
            if fixed.contains(&pos) || self.profile.dropped_columns.contains(&header) {
                continue;
            }
            let name = self
                .profile
                .renamed_items
                .iter()
                .find(|(from, _)| *from == header)
                .map(|(_, to)| to.to_string())
                .unwrap_or_else(|| header.to_string());
            item_columns.push((name, pos));
        }

        let mut warned: HashSet<usize> = HashSet::new();
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut items = Vec::with_capacity(item_columns.len());
            for (name, pos) in &item_columns {
                let raw = row.get(*pos).unwrap_or("");
                let score = match parse_number(raw) {
                    Ok(score) => score,
                    Err(_) => {
                        if warned.insert(*pos) {
                            warn!(
                                item = %name,
                                value = raw,
                                "Non-numeric item score treated as missing"
                            );
                        }
                        None
                    }
                };
                items.push((name.clone(), score));
            }

            records.push(WideResponseRecord {
                teacher: columns.teacher(row)?,
                course_code: normalize_course_key(&flatten_newlines(
                    &columns.text(row, "course_code"),
                )),
                course_name: flatten_newlines(&columns.text(row, "course_name")),
                educ_form: flatten_newlines(&columns.text(row, "educ_form")),
                resp_count: columns.number(row, "resp_count")?,
                items,
            });
        }

        info!(
            path = %path.display(),
            records = records.len(),
            items = item_columns.len(),
            "Loaded wide response records"
        );
        Ok(records)
    }

    pub fn load_open_answers(&self, path: &Path) -> Result<Vec<OpenAnswerRecord>> {
        let (headers, rows) = read_table(path)?;
        let columns = ColumnIndex::build(path, &headers, self.profile.open_answer_columns)?;
        let key_field = self.profile.join_field();

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut question_text = columns.text(row, "question_text");
            if let Some(translations) = self.profile.open_question_translations {
                match translations.iter().find(|(from, _)| *from == question_text) {
                    Some((_, to)) => question_text = to.to_string(),
                    None => continue,
                }
            }
            records.push(OpenAnswerRecord {
                course_key: normalize_course_key(&columns.text(row, key_field)),
                question_text,
                answer: columns.text(row, "resp_value"),
            });
        }

        info!(path = %path.display(), records = records.len(), "Loaded open answers");
        Ok(records)
    }
}

fn flatten_newlines(value: &str) -> String {
    value.replace('\n', "/ ")
}

static INTEGRAL_FLOAT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)\.0+$").expect("valid course key regex"));

/// Course key as joined across tables: `501.0` and `501` are the same course.
pub fn normalize_course_key(raw: &str) -> String {
    let raw = raw.trim();
    INTEGRAL_FLOAT_RE
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|digits| digits.as_str().to_string())
        .unwrap_or_else(|| raw.to_string())
}

/// Read the roster: `id;name;department[;person type]` per line.
pub fn load_roster(path: &Path) -> Result<Vec<RosterEntry>> {
    let mut reader = ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .flexible(true)
        .quoting(false)
        .trim(Trim::All)
        .from_path(path)?;

    let mut entries = Vec::new();
    for record in reader.records() {
        let record = record?;
        let line = row_number(&record);
        if record.iter().all(|field| field.is_empty()) {
            continue;
        }
        if record.len() != 3 && record.len() != 4 {
            return Err(ReportError::Roster {
                path: path.to_path_buf(),
                line,
                reason: format!("expected 3 or 4 fields, found {}", record.len()),
            });
        }
        entries.push(RosterEntry {
            raw_id: record[0].to_string(),
            name: record[1].to_string(),
            department: record[2].to_string(),
            person_type: record.get(3).map(|s| s.to_string()),
        });
    }

    info!(path = %path.display(), entries = entries.len(), "Loaded roster");
    Ok(entries)
}
