//! Terminal credential prompt

use std::io::{self, BufRead, IsTerminal, Write};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use annot_core::remote::{CredentialAction, CredentialPrompt, Credentials};

/// Asks for a new login on the terminal when the remote rejects one
///
/// Cancels right away when stdin is not a terminal.
pub struct StdinPrompt {
    host: String,
    provided: Mutex<Option<Credentials>>,
}

impl StdinPrompt {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            provided: Mutex::new(None),
        }
    }

    /// The last credentials entered, if any
    pub fn provided(&self) -> Option<Credentials> {
        self.provided.lock().ok().and_then(|slot| slot.clone())
    }
}

#[async_trait]
impl CredentialPrompt for StdinPrompt {
    async fn on_auth_failure(&self, attempted: &Credentials, reason: &str) -> CredentialAction {
        if !io::stdin().is_terminal() {
            debug!("Not a terminal, not asking for credentials");
            return CredentialAction::Cancel;
        }

        eprintln!("Login to {} failed: {}", self.host, reason);
        let default_user = attempted.username.clone();
        let answer = tokio::task::spawn_blocking(move || read_login(&default_user)).await;

        match answer {
            Ok(Ok(Some((username, password)))) => {
                let credentials = Credentials::new(username, password, self.host.clone());
                if let Ok(mut slot) = self.provided.lock() {
                    *slot = Some(credentials.clone());
                }
                CredentialAction::Provide(credentials)
            }
            Ok(Ok(None)) => CredentialAction::Cancel,
            Ok(Err(e)) => {
                debug!("Failed to read credentials: {}", e);
                CredentialAction::Cancel
            }
            Err(e) => {
                debug!("Credential prompt task failed: {}", e);
                CredentialAction::Cancel
            }
        }
    }
}

/// Read a username and password; an empty password cancels
fn read_login(default_user: &str) -> io::Result<Option<(String, String)>> {
    let stdin = io::stdin();
    let mut lines = stdin.lock();

    if default_user.is_empty() {
        eprint!("Username: ");
    } else {
        eprint!("Username [{}]: ", default_user);
    }
    io::stderr().flush()?;
    let mut username = String::new();
    lines.read_line(&mut username)?;
    let username = match username.trim() {
        "" => default_user.to_string(),
        entered => entered.to_string(),
    };

    eprint!("Password (empty to work offline): ");
    io::stderr().flush()?;
    let mut password = String::new();
    lines.read_line(&mut password)?;
    let password = password.trim_end_matches(['\r', '\n']).to_string();

    if username.is_empty() || password.is_empty() {
        return Ok(None);
    }
    Ok(Some((username, password)))
}
