use crate::error::{ReportError, Result};
use crate::models::PdfOptions;
use std::ffi::OsString;
use std::io::Write;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::debug;

/// Converts a rendered HTML document into a PDF file.
pub trait PdfRenderer {
    fn render_pdf(&self, html: &str, output: &Path) -> Result<()>;
}

/// PDF conversion through the `wkhtmltopdf` executable, reading HTML from stdin.
pub struct WkHtmlToPdf {
    options: PdfOptions,
}

impl WkHtmlToPdf {
    pub fn new(options: PdfOptions) -> Self {
        Self { options }
    }

    pub fn args(&self, output: &Path) -> Vec<OsString> {
        let o = &self.options;
        let mut args: Vec<OsString> = Vec::new();
        let mut push = |flag: &str, value: Option<&str>| {
            args.push(flag.into());
            if let Some(value) = value {
                args.push(value.into());
            }
        };

        push(
            if o.print_media_type {
                "--print-media-type"
            } else {
                "--no-print-media-type"
            },
            None,
        );
        push("--page-size", Some(o.page_size.as_str()));
        push("--margin-top", Some(o.margin_top.as_str()));
        push("--margin-right", Some(o.margin_right.as_str()));
        push("--margin-bottom", Some(o.margin_bottom.as_str()));
        push("--margin-left", Some(o.margin_left.as_str()));
        push("--footer-left", Some(o.footer_left.as_str()));
        push("--footer-right", Some(o.footer_right.as_str()));
        push("--footer-font-name", Some(o.footer_font_name.as_str()));
        push("--footer-font-size", Some(o.footer_font_size.to_string().as_str()));
        if o.quiet {
            push("--quiet", None);
        }

        args.push("-".into());
        args.push(output.as_os_str().to_owned());
        args
    }

    fn failure(output: &Path, reason: impl Into<String>) -> ReportError {
        ReportError::Render {
            path: output.to_path_buf(),
            reason: reason.into(),
        }
    }
}

fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if started.elapsed() >= timeout {
            child.kill()?;
            child.wait()?;
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

impl PdfRenderer for WkHtmlToPdf {
    fn render_pdf(&self, html: &str, output: &Path) -> Result<()> {
        debug!(path = %output.display(), "Running wkhtmltopdf");
        let mut child = Command::new(&self.options.wkhtmltopdf)
            .args(self.args(output))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                Self::failure(
                    output,
                    format!("cannot start {}: {}", self.options.wkhtmltopdf.display(), e),
                )
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(e) = stdin.write_all(html.as_bytes()) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Self::failure(output, format!("writing HTML failed: {}", e)));
            }
        }

        let status = match self.options.timeout_secs {
            Some(secs) => wait_with_timeout(&mut child, Duration::from_secs(secs))
                .map_err(|e| Self::failure(output, e.to_string()))?
                .ok_or_else(|| Self::failure(output, format!("timed out after {}s", secs)))?,
            None => child
                .wait()
                .map_err(|e| Self::failure(output, e.to_string()))?,
        };

        if !status.success() {
            return Err(Self::failure(output, format!("wkhtmltopdf exited with {}", status)));
        }
        Ok(())
    }
}
