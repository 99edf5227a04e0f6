//! Map-backed [`CommandRunner`] for tests.
//!
//! Responses are keyed by the joined command line (see
//! [`super::command_line`]). A lookup tries the exact line first, then the
//! longest registered prefix, so tests can ignore trailing flags they do
//! not care about. Every call is recorded for later assertions.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use super::{CommandRunner, ExecError, command_line};

#[derive(Clone, Debug)]
enum Reply {
    Ok(Vec<u8>),
    Fail { code: i32, stderr: String },
}

/// Scripted subprocess runner.
#[derive(Default)]
pub struct FakeRunner {
    replies: Mutex<HashMap<String, Reply>>,
    calls: Mutex<Vec<String>>,
    inputs: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `line` (or any command starting with it) with `stdout`.
    pub fn respond(self, line: impl Into<String>, stdout: impl Into<Vec<u8>>) -> Self {
        self.set(line, Reply::Ok(stdout.into()));
        self
    }

    /// Answer `line` with a non-zero exit and `stderr`.
    pub fn fail(self, line: impl Into<String>, code: i32, stderr: impl Into<String>) -> Self {
        self.set(
            line,
            Reply::Fail {
                code,
                stderr: stderr.into(),
            },
        );
        self
    }

    /// Replace the reply for `line` after construction.
    pub fn set_response(&self, line: impl Into<String>, stdout: impl Into<Vec<u8>>) {
        self.set(line, Reply::Ok(stdout.into()));
    }

    fn set(&self, line: impl Into<String>, reply: Reply) {
        self.replies
            .lock()
            .expect("fake runner mutex poisoned")
            .insert(line.into(), reply);
    }

    /// Command lines seen so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("fake runner mutex poisoned").clone()
    }

    /// stdin payloads seen so far, in order.
    pub fn inputs(&self) -> Vec<String> {
        self.inputs
            .lock()
            .expect("fake runner mutex poisoned")
            .clone()
    }

    fn lookup(&self, line: &str) -> Option<Reply> {
        let replies = self.replies.lock().expect("fake runner mutex poisoned");
        if let Some(reply) = replies.get(line) {
            return Some(reply.clone());
        }
        replies
            .iter()
            .filter(|(key, _)| line.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, reply)| reply.clone())
    }

    fn answer(&self, program: &Path, args: &[String]) -> Result<Vec<u8>, ExecError> {
        let line = command_line(program, args);
        self.calls
            .lock()
            .expect("fake runner mutex poisoned")
            .push(line.clone());

        match self.lookup(&line) {
            Some(Reply::Ok(out)) => Ok(out),
            Some(Reply::Fail { code, stderr }) => Err(ExecError::Failed {
                program: program.display().to_string(),
                code: Some(code),
                stdout: String::new(),
                stderr,
            }),
            None => Err(ExecError::Failed {
                program: program.display().to_string(),
                code: Some(127),
                stdout: String::new(),
                stderr: format!("fake runner has no reply for `{line}`"),
            }),
        }
    }
}

impl CommandRunner for FakeRunner {
    async fn run(&self, program: &Path, args: &[String]) -> Result<Vec<u8>, ExecError> {
        self.answer(program, args)
    }

    async fn run_with_input(
        &self,
        program: &Path,
        args: &[String],
        input: &str,
    ) -> Result<Vec<u8>, ExecError> {
        self.inputs
            .lock()
            .expect("fake runner mutex poisoned")
            .push(input.to_string());
        self.answer(program, args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::args;
    use std::path::PathBuf;

    #[tokio::test]
    async fn longest_prefix_wins() {
        let fake = FakeRunner::new()
            .respond("pchaind keys", "generic")
            .respond("pchaind keys show alice", "alice");
        let bin = PathBuf::from("/x/pchaind");

        let out = fake
            .run(&bin, &args(["keys", "show", "alice", "--home", "/h"]))
            .await
            .expect("prefix reply");
        assert_eq!(out, b"alice");

        let out = fake
            .run(&bin, &args(["keys", "list"]))
            .await
            .expect("shorter prefix reply");
        assert_eq!(out, b"generic");
        assert_eq!(fake.calls().len(), 2);
    }

    #[tokio::test]
    async fn unknown_commands_fail() {
        let fake = FakeRunner::new();
        let err = fake
            .run(&PathBuf::from("pchaind"), &args(["version"]))
            .await
            .expect_err("no reply registered");
        assert!(matches!(err, ExecError::Failed { code: Some(127), .. }));
    }
}
