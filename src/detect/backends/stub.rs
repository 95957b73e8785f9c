use anyhow::{anyhow, Result};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;

/// Scripted backend for tests and hardware-less runs.
///
/// Each `detect` call returns the next scripted batch, cycling; with no
/// script it reports nothing. A failing stub errors on every call. Like the
/// real backends it must be loaded before `detect`.
#[derive(Debug, Default)]
pub struct StubBackend {
    script: Vec<Vec<Detection>>,
    cursor: usize,
    failure: Option<String>,
    fail_load: bool,
    loaded: bool,
    threshold: f32,
    calls: u64,
}

impl StubBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: Vec<Vec<Detection>>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    /// Backend whose `detect` always fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::default()
        }
    }

    /// Backend whose `load_model` fails.
    pub fn without_model() -> Self {
        Self {
            fail_load: true,
            ..Self::default()
        }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn load_model(&mut self) -> Result<()> {
        if self.fail_load {
            return Err(anyhow!("stub model unavailable"));
        }
        self.loaded = true;
        Ok(())
    }

    fn is_loaded(&self) -> bool {
        self.loaded
    }

    fn set_confidence_threshold(&mut self, threshold: f32) {
        self.threshold = threshold;
    }

    fn detect(&mut self, _pixels: &[u8], _width: u32, _height: u32) -> Result<Vec<Detection>> {
        self.calls += 1;
        if !self.loaded {
            return Err(anyhow!("stub model not loaded"));
        }
        if let Some(message) = &self.failure {
            return Err(anyhow!("{}", message));
        }
        if self.script.is_empty() {
            return Ok(Vec::new());
        }
        let batch = self.script[self.cursor % self.script.len()].clone();
        self.cursor += 1;
        Ok(batch)
    }
}
