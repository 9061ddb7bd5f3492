use std::collections::VecDeque;
use std::io::{self, BufRead, Write};
use std::sync::Mutex;

use crossterm::tty::IsTty;

use crate::error::{Error, Result};

/// User-facing output and prompts.
///
/// `say` is a headline (a step starting), `message` is detail under it, and
/// `error` is shown even when the outcome is already decided (cleanup failures).
pub trait Ui: Send + Sync {
    fn say(&self, msg: &str);
    fn message(&self, msg: &str);
    fn error(&self, msg: &str);
    fn ask(&self, prompt: &str) -> Result<String>;
}

#[derive(Default)]
pub struct BasicUi {
    out: Mutex<()>,
}

impl BasicUi {
    pub fn new() -> Self {
        Self::default()
    }

    fn print(&self, line: &str) {
        let _g = self.out.lock();
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
        let _ = stdout.flush();
    }
}

impl Ui for BasicUi {
    fn say(&self, msg: &str) {
        self.print(&format!("==> {msg}"));
    }

    fn message(&self, msg: &str) {
        self.print(&format!("    {msg}"));
    }

    fn error(&self, msg: &str) {
        let _g = self.out.lock();
        let _ = writeln!(io::stderr(), "!!! {msg}");
    }

    fn ask(&self, prompt: &str) -> Result<String> {
        let stdin = io::stdin();
        if !stdin.is_tty() {
            return Err(Error::msg(format!(
                "cannot ask '{}': stdin is not a terminal",
                prompt.trim()
            )));
        }
        {
            let _g = self.out.lock();
            let mut stdout = io::stdout().lock();
            let _ = write!(stdout, "{prompt} ");
            let _ = stdout.flush();
        }
        let mut line = String::new();
        let n = stdin
            .lock()
            .read_line(&mut line)
            .map_err(|e| Error::msg(format!("failed to read answer: {e}")))?;
        if n == 0 {
            return Err(Error::msg("stdin closed while waiting for an answer"));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

/// Discards output and refuses to ask anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullUi;

impl Ui for NullUi {
    fn say(&self, _msg: &str) {}
    fn message(&self, _msg: &str) {}
    fn error(&self, _msg: &str) {}

    fn ask(&self, prompt: &str) -> Result<String> {
        Err(Error::msg(format!(
            "cannot ask '{}' without an interactive ui",
            prompt.trim()
        )))
    }
}

/// Replays canned answers and records everything shown. Used by tests and by
/// non-terminal front ends that collect answers up front.
#[derive(Default)]
pub struct ScriptedUi {
    answers: Mutex<VecDeque<String>>,
    transcript: Mutex<Vec<String>>,
}

impl ScriptedUi {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: Mutex::new(answers.into_iter().map(Into::into).collect()),
            transcript: Mutex::new(Vec::new()),
        }
    }

    pub fn transcript(&self) -> Vec<String> {
        self.transcript
            .lock()
            .map(|g| g.clone())
            .unwrap_or_default()
    }

    fn record(&self, line: String) {
        if let Ok(mut g) = self.transcript.lock() {
            g.push(line);
        }
    }
}

impl Ui for ScriptedUi {
    fn say(&self, msg: &str) {
        self.record(format!("say: {msg}"));
    }

    fn message(&self, msg: &str) {
        self.record(format!("message: {msg}"));
    }

    fn error(&self, msg: &str) {
        self.record(format!("error: {msg}"));
    }

    fn ask(&self, prompt: &str) -> Result<String> {
        self.record(format!("ask: {prompt}"));
        self.answers
            .lock()
            .ok()
            .and_then(|mut g| g.pop_front())
            .ok_or_else(|| Error::msg(format!("no scripted answer for '{}'", prompt.trim())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_ui_replays_answers_in_order() {
        let ui = ScriptedUi::new(["2", "yes"]);
        assert_eq!(ui.ask("pick").unwrap(), "2");
        ui.message("picked");
        assert_eq!(ui.ask("sure?").unwrap(), "yes");
        let err = ui.ask("again?").unwrap_err().to_string();
        assert!(err.contains("no scripted answer"), "unexpected err: {err}");
        assert_eq!(
            ui.transcript(),
            vec!["ask: pick", "message: picked", "ask: sure?", "ask: again?"]
        );
    }

    #[test]
    fn null_ui_refuses_questions() {
        assert!(NullUi.ask("continue?").is_err());
    }
}
