//! Shell escaping and quoting utilities.

/// Escape a value for use inside single quotes.
/// Replaces `'` with `'\''` (end quote, escaped quote, start quote).
pub fn escape_single_quote_content(value: &str) -> String {
    value.replace('\'', "'\\''")
}

/// Escape an entire command string for `bash -c` execution.
/// Wraps the command in single quotes and escapes embedded quotes.
pub fn escape_command_for_shell(command: &str) -> String {
    format!("'{}'", escape_single_quote_content(command))
}

/// Quote a path for shell execution (always quotes).
pub fn quote_path(path: &str) -> String {
    format!("'{}'", escape_single_quote_content(path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_command_wraps_in_single_quotes() {
        assert_eq!(escape_command_for_shell("git pull"), "'git pull'");
    }

    #[test]
    fn escape_command_with_embedded_quote() {
        assert_eq!(
            escape_command_for_shell("grep 'x' ~/.bashrc"),
            "'grep '\\''x'\\'' ~/.bashrc'"
        );
    }

    #[test]
    fn quote_path_simple() {
        assert_eq!(quote_path("/srv/sites"), "'/srv/sites'");
    }

    #[test]
    fn quote_path_with_quote() {
        assert_eq!(quote_path("/srv/it's"), "'/srv/it'\\''s'");
    }
}
