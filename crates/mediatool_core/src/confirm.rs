use anyhow::{Context, Result};
use dialoguer::Confirm as Prompt;
use dialoguer::console::Term;

/// Asks the operator before anything is mutated.
pub trait Confirm {
    fn confirm(&mut self, prompt: &str) -> Result<bool>;
}

/// Interactive yes/no on stderr, defaulting to no.
#[derive(Debug, Default)]
pub struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn confirm(&mut self, prompt: &str) -> Result<bool> {
        Prompt::new()
            .with_prompt(prompt)
            .default(false)
            .interact_on(&Term::stderr())
            .context("failed to read confirmation")
    }
}

/// `--yes`: accepts every prompt and remembers what it accepted.
#[derive(Debug, Default)]
pub struct AutoConfirm {
    pub answered: Vec<String>,
}

impl Confirm for AutoConfirm {
    fn confirm(&mut self, prompt: &str) -> Result<bool> {
        self.answered.push(prompt.to_string());
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_confirm_accepts_and_records_prompts() {
        let mut confirm = AutoConfirm::default();
        assert!(confirm.confirm("Apply 3 cleanup changes?").expect("confirm"));
        assert_eq!(confirm.answered, vec!["Apply 3 cleanup changes?".to_string()]);
    }
}
