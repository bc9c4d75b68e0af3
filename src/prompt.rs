//! Operator interaction.
//!
//! Every question the tool asks goes through [`Operator`] so that `--yes`
//! mode and tests can answer without a terminal.

use anyhow::Result;
use dialoguer::{Confirm, Input, Password, theme::ColorfulTheme};

/// Source of operator answers.
pub trait Operator: Send + Sync {
    /// Ask a yes/no question.
    fn confirm(&self, prompt: &str, default: bool) -> Result<bool>;

    /// Ask for a free-form value.
    fn input(&self, prompt: &str) -> Result<String>;

    /// Ask for a secret value without echoing it.
    fn password(&self, prompt: &str) -> Result<String>;
}

/// Terminal-backed operator using dialoguer prompts.
pub struct InteractiveOperator {
    assume_yes: bool,
}

impl InteractiveOperator {
    pub fn new(assume_yes: bool) -> Self {
        Self { assume_yes }
    }
}

impl Operator for InteractiveOperator {
    fn confirm(&self, prompt: &str, default: bool) -> Result<bool> {
        if self.assume_yes {
            tracing::info!("{} -> yes (--yes)", prompt);
            return Ok(true);
        }

        let answer = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .default(default)
            .interact()?;
        Ok(answer)
    }

    fn input(&self, prompt: &str) -> Result<String> {
        let value: String = Input::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .interact_text()?;
        Ok(value.trim().to_string())
    }

    fn password(&self, prompt: &str) -> Result<String> {
        let value = Password::with_theme(&ColorfulTheme::default())
            .with_prompt(prompt)
            .interact()?;
        Ok(value)
    }
}

#[cfg(test)]
pub mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use anyhow::{Result, anyhow};

    use super::Operator;

    /// Operator that replays scripted answers and records every prompt.
    #[derive(Default)]
    pub struct ScriptedOperator {
        confirms: Mutex<VecDeque<bool>>,
        inputs: Mutex<VecDeque<String>>,
        asked: Mutex<Vec<String>>,
    }

    impl ScriptedOperator {
        pub fn with_confirms(answers: &[bool]) -> Self {
            Self {
                confirms: Mutex::new(answers.iter().copied().collect()),
                ..Default::default()
            }
        }

        pub fn with_inputs(mut self, inputs: &[&str]) -> Self {
            self.inputs = Mutex::new(inputs.iter().map(|s| s.to_string()).collect());
            self
        }

        pub fn asked(&self) -> Vec<String> {
            self.asked.lock().unwrap().clone()
        }
    }

    impl Operator for ScriptedOperator {
        fn confirm(&self, prompt: &str, _default: bool) -> Result<bool> {
            self.asked.lock().unwrap().push(prompt.to_string());
            self.confirms
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow!("unexpected prompt: {prompt}"))
        }

        fn input(&self, prompt: &str) -> Result<String> {
            self.asked.lock().unwrap().push(prompt.to_string());
            self.inputs
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow!("unexpected input prompt: {prompt}"))
        }

        fn password(&self, prompt: &str) -> Result<String> {
            self.input(prompt)
        }
    }
}
