//! JUnit XML report generation.
//!
//! Each [`SuiteReport`] becomes one Ant-style JUnit document, the format
//! Jenkins, GitLab CI, GitHub Actions and most other CI systems read.
//!
//! # Format
//!
//! ```xml
//! <?xml version="1.0" encoding="UTF-8"?>
//! <testsuite name="XmlReportTest" tests="4" failures="1" errors="1" skipped="1" time="0.012" timestamp="2024-05-01T12:00:00">
//!   <properties>
//!   </properties>
//!   <testcase classname="XmlReportTest" name="testXmlErrors" time="0.004">
//!     <error message="testXmlErrors exception" type="java.lang.Exception">...</error>
//!   </testcase>
//!   <testcase classname="XmlReportTest" name="testXmlPasses" time="0.002"/>
//!   <testcase classname="XmlReportTest" name="testXmlSkipped" time="0">
//!     <skipped/>
//!   </testcase>
//!   <system-out>Test output
//! </system-out>
//!   <system-err></system-err>
//! </testsuite>
//! ```
//!
//! Bookkeeping such as attempt counts never reaches the document.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};

use super::aggregator::{SuiteReport, TestCaseReport};
use crate::runner::{Failure, TestOutcome};

/// Renders a suite report as a JUnit XML document.
///
/// The output depends only on the report, so rendering the same snapshot
/// twice yields identical bytes.
pub fn to_xml(report: &SuiteReport) -> anyhow::Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;

    let mut testsuite = BytesStart::new("testsuite");
    testsuite.push_attribute(("name", strip_invalid(&report.name).as_str()));
    testsuite.push_attribute(("tests", report.tests().to_string().as_str()));
    testsuite.push_attribute(("failures", report.failures().to_string().as_str()));
    testsuite.push_attribute(("errors", report.errors().to_string().as_str()));
    testsuite.push_attribute(("skipped", report.skipped().to_string().as_str()));
    testsuite.push_attribute(("time", format_time(report.time()).as_str()));
    testsuite.push_attribute((
        "timestamp",
        report
            .timestamp
            .format("%Y-%m-%dT%H:%M:%S")
            .to_string()
            .as_str(),
    ));
    writer.write_event(Event::Start(testsuite))?;

    writer.write_event(Event::Start(BytesStart::new("properties")))?;
    writer.write_event(Event::End(BytesEnd::new("properties")))?;

    for case in &report.cases {
        write_testcase(&mut writer, case)?;
    }

    write_text_element(&mut writer, "system-out", &report.stdout)?;
    write_text_element(&mut writer, "system-err", &report.stderr)?;

    writer.write_event(Event::End(BytesEnd::new("testsuite")))?;

    let xml = String::from_utf8(writer.into_inner())?;
    Ok(xml)
}

fn write_testcase<W: std::io::Write>(
    writer: &mut Writer<W>,
    case: &TestCaseReport,
) -> anyhow::Result<()> {
    let mut testcase = BytesStart::new("testcase");
    testcase.push_attribute(("classname", strip_invalid(&case.classname).as_str()));
    testcase.push_attribute(("name", strip_invalid(&case.name).as_str()));
    testcase.push_attribute(("time", format_time(case.time).as_str()));

    match (case.outcome, &case.failure) {
        (TestOutcome::Passed, _) => {
            writer.write_event(Event::Empty(testcase))?;
        }
        (TestOutcome::Skipped, _) => {
            writer.write_event(Event::Start(testcase))?;
            writer.write_event(Event::Empty(BytesStart::new("skipped")))?;
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
        (TestOutcome::Failed, failure) => {
            writer.write_event(Event::Start(testcase))?;
            write_failure(writer, "failure", failure.as_ref())?;
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
        (TestOutcome::Error, failure) => {
            writer.write_event(Event::Start(testcase))?;
            write_failure(writer, "error", failure.as_ref())?;
            writer.write_event(Event::End(BytesEnd::new("testcase")))?;
        }
    }

    Ok(())
}

fn write_failure<W: std::io::Write>(
    writer: &mut Writer<W>,
    tag: &str,
    failure: Option<&Failure>,
) -> anyhow::Result<()> {
    let mut element = BytesStart::new(tag);
    let Some(failure) = failure else {
        writer.write_event(Event::Empty(element))?;
        return Ok(());
    };

    if let Some(message) = &failure.message {
        element.push_attribute(("message", strip_invalid(message).as_str()));
    }
    element.push_attribute(("type", strip_invalid(&failure.kind).as_str()));

    if failure.stack_trace.is_empty() {
        writer.write_event(Event::Empty(element))?;
    } else {
        writer.write_event(Event::Start(element))?;
        writer.write_event(Event::Text(BytesText::new(&strip_invalid(
            &failure.stack_trace,
        ))))?;
        writer.write_event(Event::End(BytesEnd::new(tag)))?;
    }
    Ok(())
}

/// Writes `<tag>text</tag>`, keeping the element even when empty.
fn write_text_element<W: std::io::Write>(
    writer: &mut Writer<W>,
    tag: &str,
    text: &str,
) -> anyhow::Result<()> {
    writer.write_event(Event::Start(BytesStart::new(tag)))?;
    writer.write_event(Event::Text(BytesText::new(&strip_invalid(text))))?;
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

/// Seconds with millisecond precision; exactly `"0"` for zero.
fn format_time(duration: Duration) -> String {
    if duration.is_zero() {
        "0".to_string()
    } else {
        format!("{:.3}", duration.as_secs_f64())
    }
}

/// Removes characters XML 1.0 cannot carry. Escaping is left to the writer.
fn strip_invalid(s: &str) -> String {
    s.chars()
        .filter(|c| matches!(c, '\t' | '\n' | '\r' | ' '..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..='\u{10FFFF}'))
        .collect()
}

/// Turns a suite identifier into a safe file name stem.
pub fn artifact_stem(suite: &str) -> String {
    suite
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect()
}

/// Writes per-suite report artifacts into an output directory.
///
/// ```
/// use shardline::report::JunitWriter;
///
/// let writer = JunitWriter::new("test-results").with_output_files(false);
/// assert_eq!(
///     writer.xml_path("com.example.FooTest"),
///     std::path::Path::new("test-results/TEST-com.example.FooTest.xml"),
/// );
/// ```
#[derive(Debug, Clone)]
pub struct JunitWriter {
    outdir: PathBuf,
    output_files: bool,
}

impl JunitWriter {
    pub fn new(outdir: impl Into<PathBuf>) -> Self {
        Self {
            outdir: outdir.into(),
            output_files: true,
        }
    }

    /// Also write `<suite>.out.txt` and `<suite>.err.txt`.
    pub fn with_output_files(mut self, enabled: bool) -> Self {
        self.output_files = enabled;
        self
    }

    pub fn outdir(&self) -> &Path {
        &self.outdir
    }

    pub fn xml_path(&self, suite: &str) -> PathBuf {
        self.outdir.join(format!("TEST-{}.xml", artifact_stem(suite)))
    }

    /// Writes the artifacts for one suite, returning the paths written.
    pub fn write_suite(&self, report: &SuiteReport) -> anyhow::Result<Vec<PathBuf>> {
        std::fs::create_dir_all(&self.outdir).with_context(|| {
            format!("Failed to create output directory: {}", self.outdir.display())
        })?;

        let mut written = Vec::new();

        let xml = to_xml(report)
            .with_context(|| format!("Failed to render JUnit XML for {}", report.name))?;
        let xml_path = self.xml_path(&report.name);
        std::fs::write(&xml_path, xml)
            .with_context(|| format!("Failed to write {}", xml_path.display()))?;
        written.push(xml_path);

        if self.output_files {
            let stem = artifact_stem(&report.name);
            for (suffix, text) in [("out", &report.stdout), ("err", &report.stderr)] {
                let path = self.outdir.join(format!("{}.{}.txt", stem, suffix));
                std::fs::write(&path, text)
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                written.push(path);
            }
        }

        tracing::info!("JUnit XML written to: {}", written[0].display());
        Ok(written)
    }
}
