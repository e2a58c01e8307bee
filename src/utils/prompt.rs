//! Interactive confirmation for destructive size edits

use crate::utils::error::{PlanError, Result};
use dialoguer::{theme::ColorfulTheme, Confirm};

fn delete_warning(name: &str) -> String {
    format!(
        "⚠️  WARNING: {} already has a partition; resizing deletes it and its data",
        name
    )
}

/// Ask whether the existing partition behind `name` may be deleted
///
/// Answering no returns `Ok(false)`; Esc aborts with `UserCancelled`.
pub fn confirm_delete(name: &str) -> Result<bool> {
    eprintln!("\n{}\n", delete_warning(name));
    Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Delete the partition for {}?", name))
        .default(false)
        .interact_opt()
        .map_err(|e| PlanError::Io(std::io::Error::other(e.to_string())))?
        .ok_or(PlanError::UserCancelled)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warning_names_the_entry() {
        let warning = delete_warning("/var");
        assert!(warning.contains("/var already has a partition"));
        assert!(warning.contains("deletes it and its data"));
    }
}
