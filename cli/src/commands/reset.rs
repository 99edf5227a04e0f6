use std::time::Duration;

use anyhow::Context;
use manager::poststart::PromptAnswer;
use manager::ResetReport;

use crate::CliError;
use crate::deps::Deps;
use crate::output::{Glyph, Printer};

const CONFIRM_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn reset(deps: &Deps) -> anyhow::Result<()> {
    stop_node(deps).await?;
    let report = manager::reset_data(&deps.layout()).context("reset failed")?;
    deps.out.emit(&report, |p| render(p, "chain data removed", &report))
}

pub async fn full_reset(deps: &Deps) -> anyhow::Result<()> {
    if !deps.flags.yes {
        if !deps.prompter.interactive() {
            return Err(CliError::Validation(
                "full-reset deletes configuration and chain data; pass --yes to confirm".into(),
            )
            .into());
        }
        let question = format!(
            "Delete configuration and chain data under {}? Keys are kept.",
            deps.cfg.node.home.display()
        );
        if deps.prompter.confirm(&question, CONFIRM_TIMEOUT).await != PromptAnswer::Yes {
            deps.out.warn("full reset aborted");
            return Ok(());
        }
    }

    stop_node(deps).await?;
    let report = manager::full_reset(&deps.layout()).context("full reset failed")?;
    deps.out.emit(&report, |p| {
        let mut text = render(p, "configuration and chain data removed", &report);
        text.push_str(&format!("\n{} push-validator init", p.glyph(Glyph::Hint)));
        text
    })
}

async fn stop_node(deps: &Deps) -> anyhow::Result<()> {
    if deps.supervisor.is_running() {
        deps.out.step("stopping node");
    }
    deps.supervisor
        .stop()
        .await
        .context("node must be stopped before a reset")
}

fn render(p: &Printer, headline: &str, report: &ResetReport) -> String {
    let mut text = format!("{} {headline}\n", p.glyph(Glyph::Ok));
    for path in &report.removed {
        text.push_str(&format!("  - {}\n", path.display()));
    }
    if report.state_written {
        text.push_str("  wrote zero priv_validator_state.json\n");
    }
    text
}
