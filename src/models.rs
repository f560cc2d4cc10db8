use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

use crate::error::{ReportError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub schema_version: SchemaVersion,
    pub output_format: OutputFormat,
    /// Also write the HTML twin next to every PDF
    pub write_html: bool,
    /// Log a failed PDF conversion and move on instead of aborting the batch
    pub continue_on_render_error: bool,
    pub paths: PathsConfig,
    pub aggregation: AggregationConfig,
    pub pdf: PdfOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchemaVersion {
    #[serde(rename = "2017")]
    V2017,
    #[serde(rename = "2018")]
    V2018,
}

/// Naming scheme for the generated report files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// `<dept>/Educ_eval_<name>_<id>_<dept>`
    StandAlone,
    /// `Educ_eval_<name>_<id>_<dept>`
    StandAloneFlat,
    /// `<id>`, as consumed by the research output pipeline
    Ro,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub main_dir: PathBuf,
    pub roster_file: PathBuf,
    pub response_file: PathBuf,
    pub open_answer_file: PathBuf,
    pub report_dir: PathBuf,
    pub missing_log: PathBuf,
    pub template: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Questions containing this text do not count towards the teacher score
    pub exclusion_question: String,
}

/// Options handed to wkhtmltopdf for every document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PdfOptions {
    pub wkhtmltopdf: PathBuf,
    pub print_media_type: bool,
    pub page_size: String,
    pub margin_top: String,
    pub margin_right: String,
    pub margin_bottom: String,
    pub margin_left: String,
    pub footer_left: String,
    pub footer_right: String,
    pub footer_font_name: String,
    pub footer_font_size: u32,
    pub quiet: bool,
    pub timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            schema_version: SchemaVersion::V2017,
            output_format: OutputFormat::StandAloneFlat,
            write_html: true,
            continue_on_render_error: false,
            paths: PathsConfig::default(),
            aggregation: AggregationConfig::default(),
            pdf: PdfOptions::default(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            main_dir: PathBuf::from("."),
            roster_file: PathBuf::from("INPUT_educ_eval_indiv_report.txt"),
            response_file: PathBuf::from("export_teacher.csv"),
            open_answer_file: PathBuf::from("export_open_questions.csv"),
            report_dir: PathBuf::from("reports"),
            missing_log: PathBuf::from("LOG_missing_educ_eval_indiv_report.txt"),
            template: None,
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            exclusion_question: "good command of the English language".to_string(),
        }
    }
}

impl Default for PdfOptions {
    fn default() -> Self {
        Self {
            wkhtmltopdf: PathBuf::from("wkhtmltopdf"),
            print_media_type: true,
            page_size: "A4".to_string(),
            margin_top: "10mm".to_string(),
            margin_right: "10mm".to_string(),
            margin_bottom: "10mm".to_string(),
            margin_left: "10mm".to_string(),
            footer_left: "Report generated on: [date]".to_string(),
            footer_right: "Page [page] of [toPage]".to_string(),
            footer_font_name: "sans-serif".to_string(),
            footer_font_size: 8,
            quiet: true,
            timeout_secs: None,
        }
    }
}

impl Config {
    pub fn load_from_file(file_path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(file_path)?;
        Self::from_toml(&content)
            .map_err(|e| ReportError::Configuration(format!("{}: {}", file_path, e)))
    }

    pub fn from_toml(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn save_to_file(&self, file_path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ReportError::Configuration(e.to_string()))?;
        std::fs::write(file_path, content)?;
        Ok(())
    }

    pub fn resolve(&self, path: &std::path::Path) -> PathBuf {
        self.paths.main_dir.join(path)
    }
}

/// Canonical (short, numeric) ERNA id of a teacher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TeacherId(pub u32);

static TEACHER_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0*(\d+)(?:\.0+)?[A-Za-z]*$").expect("valid teacher id regex"));

impl TeacherId {
    /// Normalize a raw id to its numeric form: `06610pfr`, `6610.0` and
    /// `6610` all become `6610`.
    pub fn parse(raw: &str) -> Option<Self> {
        let caps = TEACHER_ID_RE.captures(raw.trim())?;
        caps.get(1)?.as_str().parse::<u32>().ok().map(TeacherId)
    }
}

impl fmt::Display for TeacherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One row of the 2017 long-format export.
#[derive(Debug, Clone)]
pub struct ResponseRecord {
    pub teacher: TeacherId,
    pub course_key: String,
    pub course_year: String,
    pub course_name: String,
    pub question_text: String,
    pub resp_value: Option<f64>,
    pub resp_count: Option<f64>,
}

/// One row of the 2018 wide export: a course with a score per item column.
#[derive(Debug, Clone)]
pub struct WideResponseRecord {
    pub teacher: TeacherId,
    pub course_code: String,
    pub course_name: String,
    pub educ_form: String,
    pub resp_count: Option<f64>,
    pub items: Vec<(String, Option<f64>)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpenAnswerRecord {
    pub course_key: String,
    pub question_text: String,
    pub answer: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TeacherScoreSummary {
    pub teacher: TeacherId,
    pub course_year: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CourseDetailSummary {
    pub teacher: TeacherId,
    pub course_year: String,
    pub course_name: String,
    pub question_text: String,
    pub respondents: f64,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeltedCourseDetail {
    pub teacher: TeacherId,
    pub course_code: String,
    pub course_name: String,
    pub educ_form: String,
    pub respondents: f64,
    pub item: String,
    pub score: f64,
}

/// A course taught by a teacher, keyed the way open answers refer to it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CourseRef {
    pub key: String,
    pub name: String,
    pub year: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuestionAnswers {
    pub question: String,
    pub answers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CourseOpenAnswerBundle {
    pub anchor: String,
    pub course_name: String,
    pub course_year: Option<String>,
    pub questions: Vec<QuestionAnswers>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CourseIndexEntry {
    pub name: String,
    /// Set when the course has an open-answer section to link to
    pub anchor: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CourseIndexGroup {
    pub year: Option<String>,
    pub courses: Vec<CourseIndexEntry>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CoursesIndex {
    pub groups: Vec<CourseIndexGroup>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RosterEntry {
    pub raw_id: String,
    pub name: String,
    pub department: String,
    pub person_type: Option<String>,
}

impl RosterEntry {
    pub fn teacher_id(&self) -> Option<TeacherId> {
        TeacherId::parse(&self.raw_id)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MissingEntry {
    pub raw_id: String,
    pub name: String,
    pub department: String,
}

impl From<&RosterEntry> for MissingEntry {
    fn from(entry: &RosterEntry) -> Self {
        Self {
            raw_id: entry.raw_id.clone(),
            name: entry.name.clone(),
            department: entry.department.clone(),
        }
    }
}

impl fmt::Display for MissingEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}; {}; {}", self.raw_id, self.name, self.department)
    }
}
