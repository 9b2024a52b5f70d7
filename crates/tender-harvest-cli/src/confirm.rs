//! Yes/no prompt used by interactive reclamation.

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

/// Parse a yes/no answer; `None` for anything else.
pub fn parse_answer(line: &str) -> Option<bool> {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" | "" => Some(false),
        _ => None,
    }
}

/// Line-editor backed prompt. Ctrl-C or Ctrl-D count as "no".
pub struct Prompt {
    editor: DefaultEditor,
}

impl Prompt {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            editor: DefaultEditor::new()?,
        })
    }

    pub fn confirm(&mut self, question: &str) -> bool {
        loop {
            match self.editor.readline(&format!("{question} [y/N] ")) {
                Ok(line) => match parse_answer(&line) {
                    Some(answer) => return answer,
                    None => println!("  Please answer y or n."),
                },
                Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => return false,
                Err(e) => {
                    eprintln!("  Error: {e}");
                    return false;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer("Y"), Some(true));
        assert_eq!(parse_answer(" yes "), Some(true));
        assert_eq!(parse_answer(""), Some(false));
        assert_eq!(parse_answer("no"), Some(false));
        assert_eq!(parse_answer("maybe"), None);
    }
}
