use manager::config;
use manager::doctor::{self, CheckStatus, DoctorInput, DoctorReport};

use crate::CliError;
use crate::deps::Deps;
use crate::output::{Glyph, Printer};

pub async fn doctor(deps: &Deps) -> anyhow::Result<()> {
    let cfg = &deps.cfg;
    let input = DoctorInput {
        layout: deps.layout(),
        binary: deps.binary.clone(),
        binary_name: deps
            .binary
            .as_deref()
            .map(config::binary_name)
            .unwrap_or_else(|| config::DEFAULT_BINARY_NAME.to_string()),
        chain_id: cfg.node.chain_id.clone(),
        p2p_port: cfg.node.p2p_port,
        rpc_port: cfg.node.rpc_port,
        local_rpc_url: cfg.rpc.local_url.clone(),
        remote_rpc_url: cfg.rpc.remote_url(),
        node_running: deps.supervisor.is_running(),
    };

    let report = doctor::run(&input, &deps.runner, &deps.rpc).await;
    deps.out.emit(&report, |p| render(p, &report))?;

    let failed = report
        .checks
        .iter()
        .filter(|c| c.status == CheckStatus::Fail)
        .count();
    if failed > 0 {
        return Err(CliError::DoctorFailed { failed }.into());
    }
    Ok(())
}

fn render(p: &Printer, report: &DoctorReport) -> String {
    let mut text = String::new();
    for check in &report.checks {
        let glyph = match check.status {
            CheckStatus::Pass => Glyph::Ok,
            CheckStatus::Warn => Glyph::Warn,
            CheckStatus::Fail => Glyph::Fail,
        };
        text.push_str(&format!("{} {:<16} {}\n", p.glyph(glyph), check.name, check.detail));
        if let Some(hint) = check.hint.as_ref().filter(|_| check.status != CheckStatus::Pass) {
            text.push_str(&format!("   {} {hint}\n", p.glyph(Glyph::Hint)));
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputFormat;

    #[tokio::test]
    async fn uninitialized_home_renders_failures_with_hints() {
        let tmp = tempfile::TempDir::new().expect("create temp dir");
        let input = DoctorInput {
            layout: manager::HomeLayout::new(tmp.path()),
            binary: None,
            binary_name: "pchaind".into(),
            chain_id: "push_42101-1".into(),
            p2p_port: 0,
            rpc_port: 0,
            local_rpc_url: "http://127.0.0.1:1".into(),
            remote_rpc_url: "http://127.0.0.1:1".into(),
            node_running: false,
        };
        let rpc = manager::HttpRpcClient::new(
            "http://127.0.0.1:1",
            std::time::Duration::from_millis(200),
            std::time::Duration::from_millis(200),
        )
        .expect("client");
        let runner = manager::exec::FakeRunner::new();

        let report = doctor::run(&input, &runner, &rpc).await;
        assert!(!report.passed());

        let text = render(&Printer::new(OutputFormat::Text, false, false, false), &report);
        assert!(text.contains("[fail] home"));
        assert!(text.contains("hint: push-validator init"));
    }
}
