//! Rendering of results and errors as text, JSON or YAML.

use std::io::{self, Write};

use clap::ValueEnum;
use serde::Serialize;

use manager::{Classify, ErrorKind, ExitStatus, Remediation};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    Yaml,
}

/// Glyphs with an ASCII fallback for terminals that cannot show emoji.
#[derive(Clone, Copy, Debug)]
pub enum Glyph {
    Ok,
    Warn,
    Fail,
    Step,
    Hint,
}

impl Glyph {
    fn render(self, emoji: bool) -> &'static str {
        match (self, emoji) {
            (Glyph::Ok, true) => "✅",
            (Glyph::Warn, true) => "⚠️ ",
            (Glyph::Fail, true) => "❌",
            (Glyph::Step, true) => "▸",
            (Glyph::Hint, true) => "💡",
            (Glyph::Ok, false) => "[ok]",
            (Glyph::Warn, false) => "[warn]",
            (Glyph::Fail, false) => "[fail]",
            (Glyph::Step, false) => "->",
            (Glyph::Hint, false) => "hint:",
        }
    }
}

const GREEN: &str = "32";
const YELLOW: &str = "33";
const RED: &str = "31";
const BOLD: &str = "1";
const DIM: &str = "2";

/// Writes command results to stdout and diagnostics to stderr.
#[derive(Clone, Debug)]
pub struct Printer {
    pub format: OutputFormat,
    color: bool,
    emoji: bool,
    quiet: bool,
}

impl Printer {
    pub fn new(format: OutputFormat, color: bool, emoji: bool, quiet: bool) -> Self {
        Self {
            format,
            color,
            emoji,
            quiet,
        }
    }

    pub fn is_text(&self) -> bool {
        self.format == OutputFormat::Text
    }

    fn paint(&self, code: &str, text: &str) -> String {
        if self.color {
            format!("\x1b[{code}m{text}\x1b[0m")
        } else {
            text.to_string()
        }
    }

    pub fn glyph(&self, glyph: Glyph) -> &'static str {
        glyph.render(self.emoji)
    }

    /// Structured output for JSON/YAML, `text` otherwise.
    pub fn emit<T: Serialize>(&self, value: &T, text: impl FnOnce(&Printer) -> String) -> anyhow::Result<()> {
        let rendered = match self.format {
            OutputFormat::Json => {
                let mut s = serde_json::to_string_pretty(value)?;
                s.push('\n');
                s
            }
            OutputFormat::Yaml => serde_yaml::to_string(value)?,
            OutputFormat::Text => text(self),
        };
        let mut stdout = io::stdout().lock();
        stdout.write_all(rendered.as_bytes())?;
        if !rendered.ends_with('\n') {
            stdout.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Progress/status lines; suppressed for structured output and `--quiet`.
    pub fn step(&self, message: &str) {
        if self.is_text() && !self.quiet {
            eprintln!("{} {message}", self.paint(DIM, self.glyph(Glyph::Step)));
        }
    }

    pub fn success(&self, message: &str) {
        if self.is_text() && !self.quiet {
            eprintln!("{} {}", self.glyph(Glyph::Ok), self.paint(GREEN, message));
        }
    }

    pub fn warn(&self, message: &str) {
        if self.is_text() {
            eprintln!("{} {}", self.glyph(Glyph::Warn), self.paint(YELLOW, message));
        }
    }

    /// Key/value line for text reports.
    pub fn field(&self, key: &str, value: impl std::fmt::Display) -> String {
        format!("{:<18} {value}\n", self.paint(BOLD, key))
    }

    pub fn status_word(&self, ok: bool, word: &str) -> String {
        self.paint(if ok { GREEN } else { RED }, word)
    }

    /// Prints a failure in the selected format and returns its exit status.
    pub fn error(&self, err: &anyhow::Error) -> ExitStatus {
        let classified = classify(err);
        let kind = classified.map(|c| c.kind()).unwrap_or(ErrorKind::Internal);
        let remediation = classified
            .map(|c| c.remediation())
            .unwrap_or_else(|| Remediation::new(format!("{err:#}")));
        let status = ExitStatus::from(kind);

        match self.format {
            OutputFormat::Json | OutputFormat::Yaml => {
                let body = ErrorBody {
                    ok: false,
                    error: format!("{err:#}"),
                    code: status.code(),
                    kind: kind.label(),
                    causes: &remediation.causes,
                    actions: &remediation.actions,
                };
                let rendered = if self.format == OutputFormat::Json {
                    serde_json::to_string_pretty(&body).map(|s| s + "\n").unwrap_or_default()
                } else {
                    serde_yaml::to_string(&body).unwrap_or_default()
                };
                print!("{rendered}");
            }
            OutputFormat::Text => eprint!("{}", self.error_block(err, &remediation)),
        }
        status
    }

    fn error_block(&self, err: &anyhow::Error, r: &Remediation) -> String {
        let mut out = format!(
            "{} {}\n",
            self.glyph(Glyph::Fail),
            self.paint(RED, &format!("{err:#}"))
        );
        if r.problem != err.to_string() && !format!("{err:#}").contains(&r.problem) {
            out.push_str(&format!("\n{}\n  {}\n", self.paint(BOLD, "Problem"), r.problem));
        }
        if !r.causes.is_empty() {
            out.push_str(&format!("\n{}\n", self.paint(BOLD, "Causes")));
            for cause in &r.causes {
                out.push_str(&format!("  - {cause}\n"));
            }
        }
        if !r.actions.is_empty() {
            out.push_str(&format!("\n{}\n", self.paint(BOLD, "Actions")));
            for action in &r.actions {
                out.push_str(&format!("  {} {action}\n", self.glyph(Glyph::Hint)));
            }
        }
        out
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    ok: bool,
    error: String,
    code: i32,
    kind: &'static str,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    causes: &'a [String],
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    actions: &'a [String],
}

/// First classified error in the chain.
pub fn classify(err: &anyhow::Error) -> Option<&dyn Classify> {
    err.chain().find_map(as_classify)
}

fn as_classify<'a>(cause: &'a (dyn std::error::Error + 'static)) -> Option<&'a dyn Classify> {
    macro_rules! try_as {
        ($($ty:ty),* $(,)?) => {
            $(if let Some(e) = cause.downcast_ref::<$ty>() {
                return Some(e as &dyn Classify);
            })*
        };
    }
    try_as!(
        crate::CliError,
        manager::SyncError,
        manager::ValidatorError,
        manager::BootstrapError,
        manager::SnapshotError,
        manager::SupervisorError,
        manager::ResetError,
        manager::RpcError,
        manager::ExecError,
    );
    None
}

/// Whether the locale can show emoji.
pub fn locale_supports_utf8() -> bool {
    ["LC_ALL", "LC_CTYPE", "LANG"]
        .iter()
        .find_map(|k| std::env::var(k).ok().filter(|v| !v.is_empty()))
        .map(|v| {
            let v = v.to_ascii_lowercase();
            v.contains("utf-8") || v.contains("utf8")
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn chain_is_searched_for_a_classified_error() {
        let err = Err::<(), _>(manager::SnapshotError::Cancelled)
            .context("snapshot download failed")
            .expect_err("error");
        let kind = classify(&err).map(|c| c.kind());
        assert_eq!(kind, Some(ErrorKind::Cancellation));
    }

    #[test]
    fn unclassified_errors_are_internal() {
        let err = anyhow::anyhow!("plain failure");
        assert!(classify(&err).is_none());
        let printer = Printer::new(OutputFormat::Json, false, false, true);
        assert_eq!(printer.error(&err).code(), 1);
    }

    #[test]
    fn ascii_fallback_glyphs() {
        let printer = Printer::new(OutputFormat::Text, false, false, false);
        assert_eq!(printer.glyph(Glyph::Ok), "[ok]");
        assert_eq!(printer.glyph(Glyph::Hint), "hint:");
    }

    #[test]
    fn error_block_has_headings() {
        let printer = Printer::new(OutputFormat::Text, false, false, false);
        let err = anyhow::Error::new(manager::SnapshotError::Mismatch {
            expected: "a".into(),
            actual: "b".into(),
        });
        let block = printer.error_block(&err, &classify(&err).expect("classified").remediation());
        assert!(block.contains("Causes"));
        assert!(block.contains("Actions"));
        assert!(block.contains("push-validator snapshot download --no-cache"));
    }
}
