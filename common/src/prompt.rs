use std::io::{self, IsTerminal};

use zeroize::Zeroizing;

/// Source of interactively typed secrets
pub trait SecretPrompt {
    /// Read one entry without echo. `label` is shown to the user.
    fn read_secret(&mut self, label: &str) -> io::Result<Zeroizing<String>>;

    /// Tell the user something went wrong and the prompt will repeat
    fn notice(&mut self, message: &str);
}

/// Non-echoing prompt on the controlling terminal
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

impl SecretPrompt for TerminalPrompt {
    fn read_secret(&mut self, label: &str) -> io::Result<Zeroizing<String>> {
        rpassword::prompt_password(format!("{label}: ")).map(Zeroizing::new)
    }

    fn notice(&mut self, message: &str) {
        eprintln!("\n{message}\n");
    }
}

/// Whether stdin is attached to a terminal
pub fn stdin_is_terminal() -> bool {
    io::stdin().is_terminal()
}
