use crate::analyzer::{EvaluationAnalyzer, EvaluationTables};
use crate::error::{ReportError, Result};
use crate::joiner::{OpenAnswerIndex, OpenAnswerJoiner};
use crate::loader::{load_roster, SchemaProfile, SurveyLoader};
use crate::models::{Config, MissingEntry, RosterEntry, TeacherId};
use crate::pdf::PdfRenderer;
use crate::renderer::{detail_table, summary_table, DocumentRenderer, ReportSlots, Template};
use std::ffi::OsString;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

#[derive(Debug, Default)]
pub struct RunSummary {
    pub generated: Vec<PathBuf>,
    pub missing: Vec<MissingEntry>,
    /// Entries whose PDF conversion failed while continuing on render errors
    pub failed: Vec<RosterEntry>,
}

pub struct Reporter<'a> {
    config: &'a Config,
    profile: &'a SchemaProfile,
    tables: &'a EvaluationTables,
    answers: &'a OpenAnswerIndex,
    documents: &'a DocumentRenderer,
    pdf: &'a dyn PdfRenderer,
}

fn with_extension(stem: &Path, extension: &str) -> PathBuf {
    let mut name: OsString = stem.as_os_str().to_owned();
    name.push(".");
    name.push(extension);
    PathBuf::from(name)
}

impl<'a> Reporter<'a> {
    pub fn new(
        config: &'a Config,
        profile: &'a SchemaProfile,
        tables: &'a EvaluationTables,
        answers: &'a OpenAnswerIndex,
        documents: &'a DocumentRenderer,
        pdf: &'a dyn PdfRenderer,
    ) -> Self {
        Self {
            config,
            profile,
            tables,
            answers,
            documents,
            pdf,
        }
    }

    /// Process the roster in order, one teacher at a time.
    pub fn run(&self, roster: &[RosterEntry]) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        for entry in roster {
            info!(
                teacher = %entry.raw_id,
                name = %entry.name,
                person_type = entry.person_type.as_deref().unwrap_or("-"),
                "Processing"
            );
            let teacher = match entry.teacher_id() {
                Some(id) if self.tables.has_teacher(id) => id,
                _ => {
                    warn!(
                        teacher = %entry.raw_id,
                        name = %entry.name,
                        "No evaluation data, skipping"
                    );
                    summary.missing.push(MissingEntry::from(entry));
                    continue;
                }
            };

            match self.report_teacher(entry, teacher) {
                Ok(paths) => summary.generated.extend(paths),
                Err(e) if self.config.continue_on_render_error && is_render_error(&e) => {
                    error!(teacher = %teacher, error = %e, "Report failed, continuing");
                    summary.failed.push(entry.clone());
                }
                Err(e) => return Err(e),
            }
        }

        Ok(summary)
    }

    fn report_teacher(&self, entry: &RosterEntry, teacher: TeacherId) -> Result<Vec<PathBuf>> {
        let summary = self
            .tables
            .teacher_scores_for(teacher)
            .map(|scores| summary_table(&scores));
        let details = detail_table(&self.tables.details, teacher);

        let joiner = OpenAnswerJoiner::new(self.answers, self.profile.pinned_questions);
        let (bundles, index) = joiner.join(self.tables.courses_for(teacher));

        let slots = ReportSlots::new(entry, teacher, summary.as_ref(), &details, &index, &bundles);
        let html = self.documents.render(&slots)?;

        let report_dir = self.config.resolve(&self.config.paths.report_dir);
        if let Some(department) = self.config.output_format.department_dir(entry) {
            fs::create_dir_all(report_dir.join(department))?;
        }
        let stem = report_dir.join(self.config.output_format.report_stem(
            entry,
            teacher,
            self.documents.redacts(),
        ));

        let mut written = Vec::new();
        let pdf_path = with_extension(&stem, "pdf");
        self.pdf.render_pdf(&html, &pdf_path)?;
        written.push(pdf_path);

        if self.config.write_html {
            let html_path = with_extension(&stem, "html");
            fs::write(&html_path, &html)?;
            written.push(html_path);
        }

        info!(
            teacher = %teacher,
            courses = index.groups.iter().map(|g| g.courses.len()).sum::<usize>(),
            open_answer_courses = bundles.len(),
            "Report written"
        );
        Ok(written)
    }
}

fn is_render_error(error: &ReportError) -> bool {
    matches!(error, ReportError::Render { .. })
}

/// Overwrite the log with one `id; name; department` line per missing entry.
pub fn write_missing_log(path: &Path, missing: &[MissingEntry]) -> Result<()> {
    let mut out = BufWriter::new(fs::File::create(path)?);
    for entry in missing {
        writeln!(out, "{}", entry)?;
    }
    out.flush()?;
    Ok(())
}

/// Load, aggregate and report for every roster entry, then write the
/// missing-entries log.
pub fn generate_reports(
    config: &Config,
    redact: bool,
    pdf: &dyn PdfRenderer,
) -> Result<RunSummary> {
    let profile = SchemaProfile::for_version(config.schema_version);
    let loader = SurveyLoader::new(&profile);

    let responses = loader.load_responses(&config.resolve(&config.paths.response_file))?;
    let open_answers = loader.load_open_answers(&config.resolve(&config.paths.open_answer_file))?;
    let roster = load_roster(&config.resolve(&config.paths.roster_file))?;

    let template = match &config.paths.template {
        Some(path) => Template::load(&config.resolve(path))?,
        None => Template::builtin(),
    };

    let tables = EvaluationAnalyzer::new(&config.aggregation.exclusion_question).analyze(responses);
    let answers = OpenAnswerIndex::new(open_answers);
    let documents = DocumentRenderer::new(template, redact);

    fs::create_dir_all(config.resolve(&config.paths.report_dir))?;
    let reporter = Reporter::new(config, &profile, &tables, &answers, &documents, pdf);
    let summary = reporter.run(&roster)?;

    let log_path = config.resolve(&config.paths.missing_log);
    write_missing_log(&log_path, &summary.missing)?;
    info!(
        path = %log_path.display(),
        missing = summary.missing.len(),
        "Missing entries log written"
    );

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::tests::make_temp_dir;
    use crate::models::{OutputFormat, SchemaVersion};
    use scraper::{Html, Selector};
    use std::cell::RefCell;

    /// Writes the HTML it is given instead of a PDF.
    #[derive(Default)]
    struct RecordingPdf {
        rendered: RefCell<Vec<PathBuf>>,
        fail_for: Option<&'static str>,
    }

    impl PdfRenderer for RecordingPdf {
        fn render_pdf(&self, html: &str, output: &Path) -> Result<()> {
            if let Some(marker) = self.fail_for {
                let name = output.file_name().map(|n| n.to_string_lossy().into_owned());
                if name.is_some_and(|n| n.contains(marker)) {
                    return Err(ReportError::Render {
                        path: output.to_path_buf(),
                        reason: "exit status: 1".to_string(),
                    });
                }
            }
            fs::write(output, html)?;
            self.rendered.borrow_mut().push(output.to_path_buf());
            Ok(())
        }
    }

    const RESPONSES_2017: &str =
        "EVL_SIN_ID,EVL_JAAR,VRG_TEXT_ENG,EEV_PARAM_DOCENT,Total,AMC_ORDERID,Lange naam\n\
        501,2016,Explains clearly,06610pfr,10,4,Econometrics I\n\
        501,2016,Has a good command of the English language,06610pfr,10,5,Econometrics I\n\
        502,2016,Is well prepared,6610,5,3,Applied Econometrics\n\
        700,2016,Explains clearly,1234,8,4,Finance\n";

    const OPEN_2017: &str = "EVL_SIN_ID,VRG_TEXT_ENG,ROP_CONTENT\n\
        501,The strongest features of this course are:,Clear slides\n\
        501,Other remarks,Nice room\n\
        501,The strongest features of this course are:,Good examples\n";

    fn setup(dir: &Path, roster: &str, format: OutputFormat) -> Config {
        fs::write(dir.join("teacher.csv"), RESPONSES_2017).unwrap();
        fs::write(dir.join("open.csv"), OPEN_2017).unwrap();
        fs::write(dir.join("roster.txt"), roster).unwrap();

        let mut config = Config::default();
        config.schema_version = SchemaVersion::V2017;
        config.output_format = format;
        config.paths.main_dir = dir.to_path_buf();
        config.paths.response_file = PathBuf::from("teacher.csv");
        config.paths.open_answer_file = PathBuf::from("open.csv");
        config.paths.roster_file = PathBuf::from("roster.txt");
        config
    }

    fn cell_texts(html: &str, selector: &str) -> Vec<String> {
        let document = Html::parse_document(html);
        let selector = Selector::parse(selector).unwrap();
        document
            .select(&selector)
            .map(|e| e.text().collect::<String>())
            .collect()
    }

    #[test]
    fn jane_doe_report_has_weighted_score_and_sorted_details() {
        let dir = make_temp_dir();
        let config = setup(
            &dir,
            "6610;Jane Doe;Econometrics;UD\n",
            OutputFormat::StandAloneFlat,
        );
        let pdf = RecordingPdf::default();
        let summary = generate_reports(&config, false, &pdf).unwrap();

        assert!(summary.missing.is_empty());
        let html_path = dir
            .join("reports")
            .join("Educ_eval_Jane_Doe_6610_Econometrics.html");
        assert!(summary.generated.contains(&html_path));
        assert_eq!(
            pdf.rendered.borrow().as_slice(),
            &[dir.join("reports").join("Educ_eval_Jane_Doe_6610_Econometrics.pdf")]
        );

        let html = fs::read_to_string(&html_path).unwrap();
        // (4 * 10 + 3 * 5) / 15, the language question left out
        assert_eq!(cell_texts(&html, "#one-column-emphasis-teacher td"), vec!["3.67"]);
        assert_eq!(
            cell_texts(&html, "#one-column-emphasis tbody tr").len(),
            3,
            "one detail row per course and question"
        );
        let questions = cell_texts(&html, "#one-column-emphasis tbody th");
        let applied = questions.iter().position(|q| q == "Applied Econometrics").unwrap();
        let econ = questions.iter().position(|q| q == "Econometrics I").unwrap();
        assert!(applied < econ);

        // Pinned question first, both answers kept in order
        let headings = cell_texts(&html, ".course-features h4");
        assert_eq!(
            headings,
            vec!["The strongest features of this course are:", "Other remarks"]
        );
        assert_eq!(
            cell_texts(&html, ".course-features ul li"),
            vec!["Clear slides", "Good examples", "Nice room"]
        );

        let log = fs::read_to_string(dir.join("LOG_missing_educ_eval_indiv_report.txt")).unwrap();
        assert!(log.is_empty());
    }

    #[test]
    fn unknown_teacher_is_logged_and_gets_no_documents() {
        let dir = make_temp_dir();
        let config = setup(
            &dir,
            "9999;John Roe;Finance\n6610;Jane Doe;Econometrics\nabc;Nobody;None\n",
            OutputFormat::Ro,
        );
        let pdf = RecordingPdf::default();
        let summary = generate_reports(&config, false, &pdf).unwrap();

        assert_eq!(summary.missing.len(), 2);
        assert_eq!(pdf.rendered.borrow().len(), 1);
        assert!(!dir.join("reports").join("9999.pdf").exists());
        assert!(dir.join("reports").join("6610.pdf").exists());

        let log = fs::read_to_string(dir.join("LOG_missing_educ_eval_indiv_report.txt")).unwrap();
        assert_eq!(log, "9999; John Roe; Finance\nabc; Nobody; None\n");
    }

    #[test]
    fn nested_format_creates_department_directory() {
        let dir = make_temp_dir();
        let mut config = setup(&dir, "1234;Ann Lee;Finance\n", OutputFormat::StandAlone);
        config.write_html = false;
        let pdf = RecordingPdf::default();
        let summary = generate_reports(&config, true, &pdf).unwrap();

        let expected = dir
            .join("reports")
            .join("Finance")
            .join("Educ_eval_Ann_Lee_1234_Finance_NODATA.pdf");
        assert_eq!(summary.generated, vec![expected.clone()]);
        let html = fs::read_to_string(&expected).unwrap();
        assert!(cell_texts(&html, "td").iter().all(|t| t == "XXX"));
        assert!(!dir
            .join("reports")
            .join("Finance")
            .join("Educ_eval_Ann_Lee_1234_Finance_NODATA.html")
            .exists());
    }

    #[test]
    fn render_failure_aborts_by_default() {
        let dir = make_temp_dir();
        let config = setup(
            &dir,
            "6610;Jane Doe;Econometrics\n1234;Ann Lee;Finance\n",
            OutputFormat::Ro,
        );
        let pdf = RecordingPdf {
            fail_for: Some("6610"),
            ..RecordingPdf::default()
        };
        let err = generate_reports(&config, false, &pdf).unwrap_err();
        assert!(matches!(err, ReportError::Render { .. }));
        assert!(pdf.rendered.borrow().is_empty());
    }

    #[test]
    fn render_failure_can_be_skipped() {
        let dir = make_temp_dir();
        let mut config = setup(
            &dir,
            "6610;Jane Doe;Econometrics\n1234;Ann Lee;Finance\n",
            OutputFormat::Ro,
        );
        config.continue_on_render_error = true;
        let pdf = RecordingPdf {
            fail_for: Some("6610"),
            ..RecordingPdf::default()
        };
        let summary = generate_reports(&config, false, &pdf).unwrap();
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].raw_id, "6610");
        assert_eq!(pdf.rendered.borrow().len(), 1);
    }

    #[test]
    fn wide_export_report_uses_melted_details() {
        let dir = make_temp_dir();
        fs::write(
            dir.join("teacher.csv"),
            "Teacher code,Teacher name,Course ID,Course name,Period,Education form,\
             Respondents per teacher,Explains well,Vakscore - gemiddelde\n\
             06610pfr,Jane Doe,FEB1,Micro,1,Lecture,12,4.1,4.0\n\
             06610pfr,Jane Doe,FEB2,Macro,2,Tutorial,8,3.2,\n",
        )
        .unwrap();
        fs::write(
            dir.join("open.csv"),
            "EVL_VAK,VRG_TEXT_NL,ROP_CONTENT\n\
             FEB2,Welke suggesties heb je om dit vak te verbeteren?,More breaks\n\
             FEB2,Wat heb je gewaardeerd in dit vak?,Great cases\n",
        )
        .unwrap();
        fs::write(dir.join("roster.txt"), "06610pfr;Jane Doe;Economics\n").unwrap();

        let mut config = Config::default();
        config.schema_version = SchemaVersion::V2018;
        config.output_format = OutputFormat::Ro;
        config.paths.main_dir = dir.to_path_buf();
        config.paths.response_file = PathBuf::from("teacher.csv");
        config.paths.open_answer_file = PathBuf::from("open.csv");
        config.paths.roster_file = PathBuf::from("roster.txt");

        let pdf = RecordingPdf::default();
        generate_reports(&config, false, &pdf).unwrap();

        let html = fs::read_to_string(dir.join("reports").join("6610.html")).unwrap();
        assert!(cell_texts(&html, "#one-column-emphasis-teacher").is_empty());
        // Micro sorts after Macro descending; Macro has no course score
        assert_eq!(
            cell_texts(&html, "#one-column-emphasis td"),
            vec!["4.00", "4.10", "3.20"]
        );
        assert_eq!(
            cell_texts(&html, ".course-features h4"),
            vec![
                "What did you appreciate in this course?",
                "Which suggestions do you have to improve this course?",
            ]
        );
    }
}
