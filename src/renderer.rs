use crate::analyzer::DetailTable;
use crate::error::{ReportError, Result};
use crate::models::{
    CourseOpenAnswerBundle, CoursesIndex, OutputFormat, RosterEntry, TeacherId,
    TeacherScoreSummary,
};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::node::Text;
use scraper::{Html, Node, Selector};
use std::fmt::Write;
use std::path::{Path, PathBuf};

pub const SUMMARY_TABLE_ID: &str = "one-column-emphasis-teacher";
pub const DETAIL_TABLE_ID: &str = "one-column-emphasis";
pub const REDACTED_CELL: &str = "XXX";
pub const NODATA_SUFFIX: &str = "_NODATA";

/// A table whose leading `index_columns` are row headers (`<th>`) and the
/// rest data cells (`<td>`).
#[derive(Debug, Clone, PartialEq)]
pub struct HtmlTable {
    pub id: String,
    pub header: Vec<String>,
    pub index_columns: usize,
    pub rows: Vec<Vec<String>>,
}

impl HtmlTable {
    /// Rows below `row` that repeat the index values `0..=level` of `row`.
    fn run_length(&self, row: usize, level: usize) -> usize {
        let prefix = &self.rows[row][..=level];
        self.rows[row + 1..]
            .iter()
            .take_while(|other| other.len() > level && &other[..=level] == prefix)
            .count()
    }

    fn continues_previous(&self, row: usize, level: usize) -> bool {
        row > 0
            && self.rows[row - 1].len() > level
            && self.rows[row - 1][..=level] == self.rows[row][..=level]
    }

    /// Render as HTML. With more than one index column, repeated index values
    /// are merged into a single cell spanning the rows they cover.
    pub fn to_html(&self) -> String {
        let sparsify = self.index_columns > 1;
        let mut html = String::new();
        let _ = writeln!(html, "<table class=\"dataframe\" id=\"{}\">", escape_html(&self.id));
        let _ = writeln!(html, "  <thead>");
        let _ = write!(html, "    <tr>");
        for name in &self.header {
            let _ = write!(html, "<th>{}</th>", escape_html(name));
        }
        let _ = writeln!(html, "</tr>");
        let _ = writeln!(html, "  </thead>");
        let _ = writeln!(html, "  <tbody>");

        for (i, row) in self.rows.iter().enumerate() {
            let _ = write!(html, "    <tr>");
            for (level, cell) in row.iter().enumerate() {
                let value = escape_html(cell);
                if level >= self.index_columns {
                    let _ = write!(html, "<td>{}</td>", value);
                    continue;
                }
                if !sparsify {
                    let _ = write!(html, "<th>{}</th>", value);
                    continue;
                }
                if self.continues_previous(i, level) {
                    continue;
                }
                let span = self.run_length(i, level) + 1;
                if span > 1 {
                    let _ = write!(html, "<th rowspan=\"{}\" valign=\"top\">{}</th>", span, value);
                } else {
                    let _ = write!(html, "<th>{}</th>", value);
                }
            }
            let _ = writeln!(html, "</tr>");
        }

        let _ = writeln!(html, "  </tbody>");
        let _ = write!(html, "</table>");
        html
    }
}

pub fn format_score(score: f64) -> String {
    format!("{:.2}", score)
}

pub fn format_count(count: f64) -> String {
    if count.fract() == 0.0 {
        format!("{:.0}", count)
    } else {
        count.to_string()
    }
}

pub fn summary_table(scores: &[&TeacherScoreSummary]) -> HtmlTable {
    HtmlTable {
        id: SUMMARY_TABLE_ID.to_string(),
        header: vec!["year".to_string(), "teacher score".to_string()],
        index_columns: 1,
        rows: scores
            .iter()
            .map(|s| vec![s.course_year.clone(), format_score(s.score)])
            .collect(),
    }
}

/// The teacher's rows of the detail table, in table order.
pub fn detail_table(details: &DetailTable, teacher: TeacherId) -> HtmlTable {
    match details {
        DetailTable::Grouped(rows) => HtmlTable {
            id: DETAIL_TABLE_ID.to_string(),
            header: ["year", "course", "question", "respondents", "teacher score"]
                .iter()
                .map(|h| h.to_string())
                .collect(),
            index_columns: 3,
            rows: rows
                .iter()
                .filter(|r| r.teacher == teacher)
                .map(|r| {
                    vec![
                        r.course_year.clone(),
                        r.course_name.clone(),
                        r.question_text.clone(),
                        format_count(r.respondents),
                        format_score(r.score),
                    ]
                })
                .collect(),
        },
        DetailTable::Melted(rows) => HtmlTable {
            id: DETAIL_TABLE_ID.to_string(),
            header: [
                "Course code",
                "Course name",
                "Education form",
                "# Respondents",
                "Item",
                "Score",
            ]
            .iter()
            .map(|h| h.to_string())
            .collect(),
            index_columns: 5,
            rows: rows
                .iter()
                .filter(|r| r.teacher == teacher)
                .map(|r| {
                    vec![
                        r.course_code.clone(),
                        r.course_name.clone(),
                        r.educ_form.clone(),
                        format_count(r.respondents),
                        r.item.clone(),
                        format_score(r.score),
                    ]
                })
                .collect(),
        },
    }
}

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn courses_index_html(index: &CoursesIndex) -> String {
    let mut html = String::new();
    let entry_html = |html: &mut String, name: &str, anchor: Option<&str>| {
        let name = escape_html(name);
        let _ = match anchor {
            Some(anchor) => writeln!(html, "<li><a href=\"#{}\">{}</a></li>", anchor, name),
            None => writeln!(html, "<li>{}</li>", name),
        };
    };

    let _ = writeln!(html, "<ul class=\"courses-index\">");
    for group in &index.groups {
        match &group.year {
            Some(year) => {
                let _ = writeln!(html, "<li>{}<ul>", escape_html(year));
                for course in &group.courses {
                    entry_html(&mut html, &course.name, course.anchor.as_deref());
                }
                let _ = writeln!(html, "</ul></li>");
            }
            None => {
                for course in &group.courses {
                    entry_html(&mut html, &course.name, course.anchor.as_deref());
                }
            }
        }
    }
    let _ = write!(html, "</ul>");
    html
}

fn courses_features_html(bundles: &[CourseOpenAnswerBundle]) -> String {
    let mut html = String::new();
    for bundle in bundles {
        let _ = writeln!(html, "<div class=\"course-features\" id=\"{}\">", bundle.anchor);
        let title = match &bundle.course_year {
            Some(year) => format!("{} ({})", bundle.course_name, year),
            None => bundle.course_name.clone(),
        };
        let _ = writeln!(html, "<h3>{}</h3>", escape_html(&title));
        for question in &bundle.questions {
            let _ = writeln!(html, "<h4>{}</h4>", escape_html(&question.question));
            let _ = writeln!(html, "<ul>");
            for answer in &question.answers {
                let _ = writeln!(html, "<li>{}</li>", escape_html(answer));
            }
            let _ = writeln!(html, "</ul>");
        }
        let _ = writeln!(html, "</div>");
    }
    html
}

/// Values for the named template slots of one teacher's report.
#[derive(Debug, Clone, Default)]
pub struct ReportSlots {
    pub name: String,
    pub erna: String,
    pub teacher_statistics: String,
    pub courses_details: String,
    pub courses_index: String,
    pub courses_features: String,
}

impl ReportSlots {
    pub fn new(
        entry: &RosterEntry,
        teacher: TeacherId,
        summary: Option<&HtmlTable>,
        details: &HtmlTable,
        index: &CoursesIndex,
        bundles: &[CourseOpenAnswerBundle],
    ) -> Self {
        Self {
            name: escape_html(&entry.name),
            erna: teacher.to_string(),
            teacher_statistics: summary.map(HtmlTable::to_html).unwrap_or_default(),
            courses_details: details.to_html(),
            courses_index: courses_index_html(index),
            courses_features: courses_features_html(bundles),
        }
    }

    fn get(&self, slot: &str) -> Option<&str> {
        let value = match slot {
            "name" => &self.name,
            "erna" => &self.erna,
            "teacher_statistics" => &self.teacher_statistics,
            "courses_details" => &self.courses_details,
            "courses_index" => &self.courses_index,
            "courses_features" => &self.courses_features,
            _ => return None,
        };
        Some(value.as_str())
    }
}

static SLOT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\s*([A-Za-z_]+)\s*\}\}").expect("valid slot regex"));

const BUILTIN_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Education evaluation {{ name }}</title>
<style>
body { font-family: sans-serif; font-size: 11px; }
#sidebar { float: left; width: 22%; }
#content { margin-left: 24%; }
table { border-collapse: collapse; margin-bottom: 16px; }
#one-column-emphasis, #one-column-emphasis-teacher { text-align: left; }
#one-column-emphasis th, #one-column-emphasis td,
#one-column-emphasis-teacher th, #one-column-emphasis-teacher td {
  padding: 4px 8px;
  border-bottom: 1px solid #ccc;
}
#one-column-emphasis-teacher td, #one-column-emphasis td { background: #eff2ff; }
.course-features { page-break-inside: avoid; }
</style>
</head>
<body>
<div id="sidebar">
<h2>Courses</h2>
{{ courses_index }}
</div>
<div id="content">
<h1>Education evaluation report</h1>
<p>{{ name }} ({{ erna }})</p>
{{ teacher_statistics }}
<h2>Course details</h2>
{{ courses_details }}
<h2>Open answers</h2>
{{ courses_features }}
</div>
</body>
</html>
"#;

/// Report template with `{{ slot }}` placeholders.
#[derive(Debug, Clone)]
pub struct Template {
    source: String,
}

impl Template {
    pub fn builtin() -> Self {
        Self {
            source: BUILTIN_TEMPLATE.to_string(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::from_source(std::fs::read_to_string(path)?))
    }

    pub fn from_source(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn render(&self, slots: &ReportSlots) -> Result<String> {
        let mut out = String::with_capacity(self.source.len() * 2);
        let mut last = 0;
        for caps in SLOT_RE.captures_iter(&self.source) {
            let (Some(whole), Some(slot)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            let value = slots
                .get(slot.as_str())
                .ok_or_else(|| ReportError::Template(slot.as_str().to_string()))?;
            out.push_str(&self.source[last..whole.start()]);
            out.push_str(value);
            last = whole.end();
        }
        out.push_str(&self.source[last..]);
        Ok(out)
    }
}

/// Replace the content of every data cell with the placeholder, leaving the
/// document structure untouched.
pub fn redact(html: &str) -> String {
    let mut document = Html::parse_document(html);
    let selector = Selector::parse("td").expect("static selector");
    let cells: Vec<_> = document.select(&selector).map(|cell| cell.id()).collect();

    for id in cells {
        if let Some(mut cell) = document.tree.get_mut(id) {
            while let Some(mut child) = cell.first_child() {
                child.detach();
            }
            cell.append(Node::Text(Text {
                text: REDACTED_CELL.into(),
            }));
        }
    }

    format!("<!DOCTYPE html>\n{}", document.root_element().html())
}

/// Fills the template for one teacher, redacting when asked to.
#[derive(Debug, Clone)]
pub struct DocumentRenderer {
    template: Template,
    redact: bool,
}

impl DocumentRenderer {
    pub fn new(template: Template, redact: bool) -> Self {
        Self { template, redact }
    }

    pub fn redacts(&self) -> bool {
        self.redact
    }

    pub fn render(&self, slots: &ReportSlots) -> Result<String> {
        let html = self.template.render(slots)?;
        Ok(if self.redact { redact(&html) } else { html })
    }
}

impl OutputFormat {
    /// Path of the report relative to the report directory, without extension.
    pub fn report_stem(&self, entry: &RosterEntry, teacher: TeacherId, redacted: bool) -> PathBuf {
        let suffix = if redacted { NODATA_SUFFIX } else { "" };
        let descriptive = format!(
            "Educ_eval_{}_{}_{}{}",
            entry.name.replace(' ', "_"),
            teacher,
            entry.department,
            suffix
        );
        match self {
            OutputFormat::StandAlone => Path::new(&entry.department).join(descriptive),
            OutputFormat::StandAloneFlat => PathBuf::from(descriptive),
            OutputFormat::Ro => PathBuf::from(format!("{}{}", teacher, suffix)),
        }
    }

    /// Subdirectory that has to exist before the report can be written.
    pub fn department_dir<'e>(&self, entry: &'e RosterEntry) -> Option<&'e str> {
        match self {
            OutputFormat::StandAlone => Some(entry.department.as_str()),
            OutputFormat::StandAloneFlat | OutputFormat::Ro => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CourseIndexEntry, CourseIndexGroup, QuestionAnswers};

    fn entry() -> RosterEntry {
        RosterEntry {
            raw_id: "06610pfr".to_string(),
            name: "Jane Doe".to_string(),
            department: "Econometrics".to_string(),
            person_type: None,
        }
    }

    fn grouped_table() -> HtmlTable {
        HtmlTable {
            id: DETAIL_TABLE_ID.to_string(),
            header: vec!["year".into(), "course".into(), "question".into(), "score".into()],
            index_columns: 3,
            rows: vec![
                vec!["2016".into(), "A".into(), "Q1".into(), "4.00".into()],
                vec!["2016".into(), "A".into(), "Q2".into(), "3.00".into()],
                vec!["2016".into(), "B".into(), "Q1".into(), "2.50".into()],
            ],
        }
    }

    fn count(html: &str, selector: &str) -> usize {
        let document = Html::parse_document(html);
        let selector = Selector::parse(selector).unwrap();
        document.select(&selector).count()
    }

    fn texts(html: &str, selector: &str) -> Vec<String> {
        let document = Html::parse_document(html);
        let selector = Selector::parse(selector).unwrap();
        document
            .select(&selector)
            .map(|e| e.text().collect::<String>())
            .collect()
    }

    #[test]
    fn repeated_index_values_span_rows() {
        let html = grouped_table().to_html();
        assert!(html.contains("<th rowspan=\"3\" valign=\"top\">2016</th>"));
        assert!(html.contains("<th rowspan=\"2\" valign=\"top\">A</th>"));
        // 2016, A, Q1 | Q2 | B, Q1
        assert_eq!(count(&html, "tbody th"), 6);
        assert_eq!(count(&html, "tbody td"), 3);
        assert_eq!(count(&html, "table#one-column-emphasis"), 1);
    }

    #[test]
    fn single_index_column_is_not_merged() {
        let table = HtmlTable {
            id: SUMMARY_TABLE_ID.to_string(),
            header: vec!["year".into(), "teacher score".into()],
            index_columns: 1,
            rows: vec![vec!["2016".into(), "4.00".into()], vec!["2016".into(), "3.00".into()]],
        };
        let html = table.to_html();
        assert!(!html.contains("rowspan"));
        assert_eq!(count(&html, "tbody th"), 2);
    }

    #[test]
    fn cells_are_escaped() {
        let table = HtmlTable {
            id: "t".to_string(),
            header: vec!["q".into(), "v".into()],
            index_columns: 1,
            rows: vec![vec!["<b>R&D</b>".into(), "1".into()]],
        };
        assert!(table.to_html().contains("&lt;b&gt;R&amp;D&lt;/b&gt;"));
    }

    #[test]
    fn number_formatting() {
        assert_eq!(format_score(3.5), "3.50");
        assert_eq!(format_count(12.0), "12");
        assert_eq!(format_count(2.5), "2.5");
    }

    #[test]
    fn redaction_keeps_structure_and_masks_only_data_cells() {
        let table = grouped_table();
        let index = CoursesIndex::default();
        let slots = ReportSlots::new(&entry(), TeacherId(6610), Some(&table), &table, &index, &[]);
        let plain = DocumentRenderer::new(Template::builtin(), false)
            .render(&slots)
            .unwrap();
        let redacted = DocumentRenderer::new(Template::builtin(), true)
            .render(&slots)
            .unwrap();

        for selector in ["table", "tr", "th", "td", "#one-column-emphasis"] {
            assert_eq!(count(&plain, selector), count(&redacted, selector), "{selector}");
        }
        assert!(texts(&redacted, "td").iter().all(|t| t == REDACTED_CELL));
        assert_eq!(texts(&plain, "th"), texts(&redacted, "th"));
        assert_eq!(texts(&plain, "h1"), texts(&redacted, "h1"));
        assert!(texts(&plain, "td").iter().all(|t| t != REDACTED_CELL));
    }

    #[test]
    fn template_fills_every_slot() {
        let index = CoursesIndex {
            groups: vec![CourseIndexGroup {
                year: Some("2016".to_string()),
                courses: vec![
                    CourseIndexEntry {
                        name: "Econometrics I".to_string(),
                        anchor: Some("course-1".to_string()),
                    },
                    CourseIndexEntry {
                        name: "Beta".to_string(),
                        anchor: None,
                    },
                ],
            }],
        };
        let bundles = vec![CourseOpenAnswerBundle {
            anchor: "course-1".to_string(),
            course_name: "Econometrics I".to_string(),
            course_year: Some("2016".to_string()),
            questions: vec![QuestionAnswers {
                question: "The strongest features of this course are:".to_string(),
                answers: vec!["Clear & concise".to_string()],
            }],
        }];
        let table = grouped_table();
        let slots = ReportSlots::new(&entry(), TeacherId(6610), None, &table, &index, &bundles);
        let html = Template::builtin().render(&slots).unwrap();

        assert!(!html.contains("{{"));
        assert!(html.contains("Jane Doe (6610)"));
        assert!(html.contains("<a href=\"#course-1\">Econometrics I</a>"));
        assert!(html.contains("<li>Beta</li>"));
        assert!(html.contains("id=\"course-1\""));
        assert!(html.contains("Clear &amp; concise"));
        assert_eq!(count(&html, "#one-column-emphasis-teacher"), 0);
    }

    #[test]
    fn unknown_slot_is_a_template_error() {
        let template = Template::from_source("<p>{{ name }} {{ salary }}</p>");
        let err = template.render(&ReportSlots::default()).unwrap_err();
        assert!(matches!(err, ReportError::Template(slot) if slot == "salary"));
    }

    #[test]
    fn output_naming_schemes() {
        let entry = entry();
        let id = TeacherId(6610);
        assert_eq!(
            OutputFormat::StandAloneFlat.report_stem(&entry, id, false),
            PathBuf::from("Educ_eval_Jane_Doe_6610_Econometrics")
        );
        assert_eq!(
            OutputFormat::StandAlone.report_stem(&entry, id, true),
            Path::new("Econometrics").join("Educ_eval_Jane_Doe_6610_Econometrics_NODATA")
        );
        assert_eq!(
            OutputFormat::Ro.report_stem(&entry, id, true),
            PathBuf::from("6610_NODATA")
        );
        assert_eq!(OutputFormat::StandAlone.department_dir(&entry), Some("Econometrics"));
        assert_eq!(OutputFormat::Ro.department_dir(&entry), None);
    }
}
