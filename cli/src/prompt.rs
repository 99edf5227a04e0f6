//! Interactive confirmation with a deadline.

use std::io::IsTerminal;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use manager::poststart::PromptAnswer;

/// stdin and stdout are both terminals.
pub fn is_tty() -> bool {
    std::io::stdin().is_terminal() && std::io::stdout().is_terminal()
}

#[derive(Clone, Debug)]
pub struct Prompter {
    interactive: bool,
    cancel: CancellationToken,
}

impl Prompter {
    pub fn new(interactive: bool, cancel: CancellationToken) -> Self {
        Self { interactive, cancel }
    }

    pub fn interactive(&self) -> bool {
        self.interactive
    }

    /// Asks a yes/no question on stderr. Non-interactive sessions, EOF,
    /// cancellation and the deadline all count as "no".
    pub async fn confirm(&self, question: &str, timeout: Duration) -> PromptAnswer {
        if !self.interactive {
            return PromptAnswer::No;
        }
        eprint!("{question} [y/N] ");

        let mut line = String::new();
        let mut stdin = BufReader::new(tokio::io::stdin());
        let read = tokio::select! {
            _ = self.cancel.cancelled() => return PromptAnswer::No,
            res = tokio::time::timeout(timeout, stdin.read_line(&mut line)) => res,
        };
        match read {
            Err(_) => {
                eprintln!();
                PromptAnswer::TimedOut
            }
            Ok(Ok(_)) if parse_answer(&line) => PromptAnswer::Yes,
            Ok(_) => PromptAnswer::No,
        }
    }
}

fn parse_answer(line: &str) -> bool {
    matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_explicit_yes_confirms() {
        assert!(parse_answer("y\n"));
        assert!(parse_answer(" YES "));
        assert!(!parse_answer("\n"));
        assert!(!parse_answer("nope"));
    }

    #[tokio::test]
    async fn non_interactive_never_reads_stdin() {
        let prompter = Prompter::new(false, CancellationToken::new());
        assert_eq!(
            prompter.confirm("continue?", Duration::from_secs(60)).await,
            PromptAnswer::No
        );
    }
}
