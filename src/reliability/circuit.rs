/// Consecutive-failure breaker for a batch's storage calls.
///
/// Once `threshold` candidates in a row fail with retryable storage errors,
/// the rest of the batch fails fast instead of burning the retry budget on a
/// store that is down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub state: CircuitState,
    pub failures: u32,
    pub threshold: u32,
}

impl CircuitBreaker {
    /// A threshold of 0 disables the breaker.
    pub fn new(threshold: u32) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            threshold,
        }
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
        self.state = CircuitState::Closed;
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
        if self.threshold > 0 && self.failures >= self.threshold {
            self.state = CircuitState::Open;
        }
    }

    pub fn allow(&self) -> bool {
        self.state == CircuitState::Closed
    }
}
