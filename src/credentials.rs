//! Credentials for headless agents.
//!
//! Headless agents run without a terminal to log in from, so they receive a
//! token through their environment. [`EnvCredentials`] reads it from an
//! environment variable and falls back to a configured login command whose
//! last line of output is the token.

use async_trait::async_trait;
use std::sync::Mutex;

use tokio::process::Command;
use tracing::{debug, info};

use crate::{Error, Result};

/// Progress callback used while a credential is being acquired.
pub type Progress<'a> = &'a (dyn Fn(&str) + Send + Sync);

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// A credential that is available right now.
    fn token(&self) -> Option<String>;

    /// Obtain a credential, running whatever login flow is configured.
    async fn acquire(&self, progress: Progress<'_>) -> Result<String>;
}

pub struct EnvCredentials {
    var: String,
    login_command: Option<String>,
    acquired: Mutex<Option<String>>,
}

impl EnvCredentials {
    pub fn new(var: impl Into<String>, login_command: Option<String>) -> Self {
        Self {
            var: var.into(),
            login_command,
            acquired: Mutex::new(None),
        }
    }
}

#[async_trait]
impl CredentialProvider for EnvCredentials {
    fn token(&self) -> Option<String> {
        let acquired = self.acquired.lock().unwrap_or_else(|e| e.into_inner()).clone();
        acquired.or_else(|| {
            std::env::var(&self.var)
                .ok()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
        })
    }

    async fn acquire(&self, progress: Progress<'_>) -> Result<String> {
        if let Some(token) = self.token() {
            return Ok(token);
        }
        let Some(command) = &self.login_command else {
            return Err(Error::Credential(format!(
                "{} is not set and no login command is configured",
                self.var
            )));
        };

        progress("Waiting for agent login to complete");
        debug!("EnvCredentials: running login command");
        let output = Command::new("sh").arg("-c").arg(command).output().await?;
        if !output.status.success() {
            return Err(Error::Credential(format!(
                "login command failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let token = stdout
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .map(String::from)
            .ok_or_else(|| Error::Credential("login command printed no token".to_string()))?;

        *self.acquired.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());
        info!("Agent credential acquired");
        progress("Agent credential acquired");
        Ok(token)
    }
}
