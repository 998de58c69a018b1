use crate::error::SourceError;
use crate::frame::FrameBuffer;

use super::Source;

/// A scripted step for `SyntheticSource`, used to deterministically drive
/// the Ingestor's reconnection state machine in tests.
#[derive(Debug, Clone)]
pub enum Step {
    Frame(FrameBuffer),
    TransientFail,
    FatalFail,
    Eof,
}

/// A `Source` whose behavior is fully scripted, for exercising MAX_FAIL /
/// MAX_RETRY boundaries without a real device or file.
pub struct SyntheticSource {
    steps: Vec<Step>,
    cursor: usize,
    reopen_count: usize,
    fail_reopen_after: Option<usize>,
}

impl SyntheticSource {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            cursor: 0,
            reopen_count: 0,
            fail_reopen_after: None,
        }
    }

    /// Makes `reopen` fail starting from the Nth call (0-indexed), to
    /// exercise reconnection exhaustion.
    pub fn fail_reopen_after(mut self, n: usize) -> Self {
        self.fail_reopen_after = Some(n);
        self
    }

    pub fn reopen_count(&self) -> usize {
        self.reopen_count
    }
}

impl Source for SyntheticSource {
    fn read_frame(&mut self) -> Result<Option<FrameBuffer>, SourceError> {
        if self.cursor >= self.steps.len() {
            return Ok(None);
        }
        let step = self.steps[self.cursor].clone();
        self.cursor += 1;
        match step {
            Step::Frame(buf) => Ok(Some(buf)),
            Step::TransientFail => Err(SourceError::Transient("scripted transient failure".into())),
            Step::FatalFail => Err(SourceError::Fatal("scripted fatal failure".into())),
            Step::Eof => Ok(None),
        }
    }

    fn reopen(&mut self) -> Result<(), SourceError> {
        if let Some(threshold) = self.fail_reopen_after {
            if self.reopen_count >= threshold {
                self.reopen_count += 1;
                return Err(SourceError::Transient("scripted reopen failure".into()));
            }
        }
        self.reopen_count += 1;
        Ok(())
    }
}
