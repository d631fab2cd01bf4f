//! Terminal I/O utilities for CLI.
//!
//! Provides TTY detection and user prompting.

use std::io::{self, BufRead, IsTerminal, Write};

use groundwork::prompt::Confirm;

pub fn is_stdin_tty() -> bool {
    io::stdin().is_terminal()
}

pub fn prompt(message: &str) -> groundwork::Result<String> {
    eprint!("{}", message);
    io::stderr().flush().ok();

    let stdin = io::stdin();
    let mut line = String::new();
    stdin.lock().read_line(&mut line).map_err(|e| {
        groundwork::Error::internal_io(
            format!("Failed to read input: {}", e),
            Some("read stdin".to_string()),
        )
    })?;

    Ok(line.trim().to_string())
}

/// Asks on the terminal. Without a TTY every question is declined.
pub struct TerminalConfirm;

impl Confirm for TerminalConfirm {
    fn confirm(&self, question: &str) -> bool {
        if !is_stdin_tty() {
            groundwork::log_status!("prompt", "{} (no terminal, declining)", question);
            return false;
        }

        match prompt(&format!("{} [y/N] ", question)) {
            Ok(answer) => matches!(answer.to_lowercase().as_str(), "y" | "yes"),
            Err(_) => false,
        }
    }
}
