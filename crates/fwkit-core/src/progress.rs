//! Weighted-step progress reporting.
//!
//! Long-running load pipelines are synchronous; a caller that wants to
//! render progress registers a callback and receives the completed fraction
//! after every finished step.

struct Step {
    weight: u32,
    name: String,
}

/// Progress tracker for a fixed sequence of weighted steps.
#[derive(Default)]
pub struct Progress {
    steps: Vec<Step>,
    done: usize,
    callback: Option<Box<dyn Fn(f32, &str) + Send>>,
}

impl Progress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a tracker that reports each completed step to `callback`
    /// with the overall fraction and the step name.
    pub fn with_callback(callback: impl Fn(f32, &str) + Send + 'static) -> Self {
        Self {
            steps: Vec::new(),
            done: 0,
            callback: Some(Box::new(callback)),
        }
    }

    /// Declare the next step. All steps must be declared before the first
    /// `step_done` call for the fractions to be meaningful.
    pub fn add_step(&mut self, weight: u32, name: &str) {
        self.steps.push(Step {
            weight,
            name: name.to_string(),
        });
    }

    /// Mark the current step as finished.
    pub fn step_done(&mut self) {
        debug_assert!(self.done < self.steps.len(), "more step_done than steps");
        if self.done >= self.steps.len() {
            return;
        }
        let name = self.steps[self.done].name.clone();
        self.done += 1;
        if let Some(cb) = &self.callback {
            cb(self.fraction(), &name);
        }
    }

    /// Completed fraction in `0.0..=1.0`, by weight.
    pub fn fraction(&self) -> f32 {
        let total: u32 = self.steps.iter().map(|s| s.weight).sum();
        if total == 0 {
            return 0.0;
        }
        let done: u32 = self.steps.iter().take(self.done).map(|s| s.weight).sum();
        done as f32 / total as f32
    }

    /// Forget all steps; the tracker can be reused for another pipeline.
    pub fn reset(&mut self) {
        self.steps.clear();
        self.done = 0;
    }
}
