//! Serve command handler

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tracing::info;

use annot_core::remote::{server, MemoryBackend};

use crate::output::Output;

/// Host an in-memory document store over WebSocket until interrupted
pub async fn run(addr: &str, users: &[String], output: &Output) -> Result<()> {
    let users = users
        .iter()
        .map(|u| parse_user(u))
        .collect::<Result<Vec<_>>>()?;
    let backend = if users.is_empty() {
        MemoryBackend::new()
    } else {
        MemoryBackend::with_users(users)
    };

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to listen on {}", addr))?;
    let local = listener.local_addr().context("Failed to read listen address")?;
    output.message(&format!("Document server on ws://{} (Ctrl-C to stop)", local));

    tokio::select! {
        result = server::serve(listener, Arc::new(backend)) => {
            result.context("Document server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
        }
    }
    Ok(())
}

/// Parse a `user:password` pair
fn parse_user(raw: &str) -> Result<(String, String)> {
    match raw.split_once(':') {
        Some((user, password)) if !user.is_empty() && !password.is_empty() => {
            Ok((user.to_string(), password.to_string()))
        }
        _ => bail!("Invalid user '{}'. Use user:password", raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user() {
        assert_eq!(
            parse_user("ana:s3cr:et").unwrap(),
            ("ana".to_string(), "s3cr:et".to_string())
        );
        assert!(parse_user("ana").is_err());
        assert!(parse_user(":pw").is_err());
        assert!(parse_user("ana:").is_err());
    }
}
