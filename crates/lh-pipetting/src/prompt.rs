//! Operator prompts.
//!
//! Some operations stop and wait for a person: reloading a rack, confirming that
//! liquid is leaving the needle while priming. The engine asks through
//! [`OperatorPrompt`] so the same sequences run from a terminal, from a test, or
//! unattended.

use async_trait::async_trait;
use std::io::{BufRead, Write};

use lh_core::error::{LhResult, LiquidHandlerError};

/// Something that can put a question to the operator.
#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    /// Show `message` and wait until the operator acknowledges it.
    ///
    /// # Errors
    ///
    /// [`LiquidHandlerError::OperatorAborted`] if the operator refuses to continue.
    async fn acknowledge(&self, title: &str, message: &str) -> LhResult<()>;

    /// Ask a yes/no question.
    ///
    /// # Errors
    ///
    /// [`LiquidHandlerError::OperatorAborted`] if the operator cancels.
    async fn confirm(&self, title: &str, question: &str) -> LhResult<bool>;
}

/// Prompts on stdout and reads answers from stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsolePrompt;

impl ConsolePrompt {
    async fn ask(title: &str, text: &str, hint: &str) -> LhResult<String> {
        let banner = format!("\n== {title} ==\n{text}\n{hint} ");
        tokio::task::spawn_blocking(move || -> std::io::Result<String> {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(banner.as_bytes())?;
            stdout.flush()?;
            let mut line = String::new();
            std::io::stdin().lock().read_line(&mut line)?;
            Ok(line.trim().to_ascii_lowercase())
        })
        .await
        .map_err(|e| LiquidHandlerError::Io(std::io::Error::other(e)))?
        .map_err(LiquidHandlerError::from)
    }
}

#[async_trait]
impl OperatorPrompt for ConsolePrompt {
    async fn acknowledge(&self, title: &str, message: &str) -> LhResult<()> {
        let answer = Self::ask(title, message, "[Enter to continue, 'abort' to stop]").await?;
        if answer == "abort" {
            return Err(LiquidHandlerError::OperatorAborted(title.to_string()));
        }
        Ok(())
    }

    async fn confirm(&self, title: &str, question: &str) -> LhResult<bool> {
        loop {
            match Self::ask(title, question, "[y/n/cancel]").await?.as_str() {
                "y" | "yes" => return Ok(true),
                "n" | "no" => return Ok(false),
                "c" | "cancel" | "abort" => {
                    return Err(LiquidHandlerError::OperatorAborted(title.to_string()))
                }
                _ => continue,
            }
        }
    }
}

/// Answers every prompt without waiting. For unattended runs and dry runs.
#[derive(Debug, Clone, Copy)]
pub struct AutoConfirm {
    answer: bool,
}

impl AutoConfirm {
    /// Answer "yes" to every question.
    pub const fn yes() -> Self {
        Self { answer: true }
    }

    /// Answer "no" to every question.
    pub const fn no() -> Self {
        Self { answer: false }
    }
}

impl Default for AutoConfirm {
    fn default() -> Self {
        Self::yes()
    }
}

#[async_trait]
impl OperatorPrompt for AutoConfirm {
    async fn acknowledge(&self, title: &str, message: &str) -> LhResult<()> {
        tracing::info!(title, message, "Operator prompt auto-acknowledged");
        Ok(())
    }

    async fn confirm(&self, title: &str, question: &str) -> LhResult<bool> {
        tracing::info!(title, question, answer = self.answer, "Operator prompt auto-answered");
        Ok(self.answer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn auto_confirm_answers() {
        assert!(AutoConfirm::yes().confirm("t", "q").await.unwrap());
        assert!(!AutoConfirm::no().confirm("t", "q").await.unwrap());
        AutoConfirm::default().acknowledge("t", "m").await.unwrap();
    }
}
