// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Cooperative cancellation for checks and downloads

use crate::error::{Result, UpdateError};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;

/// Cloneable cancel flag. Every clone observes the same cancellation.
#[derive(Debug, Clone)]
pub struct Cancellation {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

impl Cancellation {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once `cancel` has been called on any clone
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // The sender lives as long as self, so this only ends on cancel
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(UpdateError::Cancelled);
        }
        Ok(())
    }

    /// Run `fut` unless cancelled first
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output> {
        self.check()?;
        tokio::select! {
            biased;
            () = self.cancelled() => Err(UpdateError::Cancelled),
            out = fut => Ok(out),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_clones_share_state() {
        let cancel = Cancellation::new();
        let other = cancel.clone();
        assert!(!other.is_cancelled());
        assert!(other.check().is_ok());

        cancel.cancel();
        assert!(other.is_cancelled());
        assert!(matches!(other.check(), Err(UpdateError::Cancelled)));
    }

    #[tokio::test]
    async fn test_run_completes() {
        let cancel = Cancellation::new();
        assert_eq!(cancel.run(async { 42 }).await.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_interrupted() {
        let cancel = Cancellation::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let result = cancel
            .run(tokio::time::sleep(Duration::from_secs(3600)))
            .await;
        assert!(matches!(result, Err(UpdateError::Cancelled)));
    }

    #[tokio::test]
    async fn test_run_refuses_when_already_cancelled() {
        let cancel = Cancellation::new();
        cancel.cancel();
        assert!(matches!(cancel.run(async {}).await, Err(UpdateError::Cancelled)));
    }
}
