//! Interactive confirmation seam.
//!
//! Task bodies ask questions through [`Confirm`]; the CLI supplies a terminal
//! implementation, tests and `--yes` runs supply a fixed answer.

pub trait Confirm {
    /// Ask a yes/no `question`. Returns true when the user agreed.
    fn confirm(&self, question: &str) -> bool;
}

/// Answers every question with the same value.
#[derive(Debug, Clone, Copy)]
pub struct FixedAnswer(pub bool);

impl Confirm for FixedAnswer {
    fn confirm(&self, question: &str) -> bool {
        log_status!("prompt", "{} [{}]", question, if self.0 { "yes" } else { "no" });
        self.0
    }
}
