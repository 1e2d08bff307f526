//! Statement guard keeping transaction control out of guest hands.

use crate::error::{ControllerError, ControllerResult};

/// Commands that only the controller may issue.
pub const FORBIDDEN_COMMANDS: [&str; 2] = ["commit", "rollback"];

/// Strips surrounding whitespace and empty statements, then lowercases.
pub fn normalize_statement(statement: &str) -> String {
    statement
        .trim_matches(|character: char| character.is_whitespace() || character == ';')
        .to_lowercase()
}

/// Fails with [`ControllerError::ForbiddenStatement`] for transaction-control statements.
pub fn check_statement(statement: &str) -> ControllerResult<()> {
    let normalized = normalize_statement(statement);
    match FORBIDDEN_COMMANDS
        .iter()
        .find(|command| normalized == **command)
    {
        Some(command) => Err(ControllerError::ForbiddenStatement {
            statement: statement.to_string(),
            command: (*command).to_string(),
        }),
        None => Ok(()),
    }
}
