//! Circuit breaker over consecutive subscription failures.
//!
//! A subscription that connects is only on probation (half-open) until it
//! delivers an event or stays up long enough. Connections that die sooner keep
//! counting towards the threshold, so a flapping engine still trips it.

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Failures below threshold, keep reconnecting
    Closed,
    /// Threshold reached, give up
    Open,
    /// Connected but not yet proven healthy
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    /// Consecutive failures
    failure_count: u32,
    failure_threshold: u32,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Subscription established
    pub fn record_connected(&mut self) {
        if self.state == CircuitState::Closed {
            self.state = CircuitState::HalfOpen;
        }
    }

    /// Subscription proved healthy
    pub fn record_success(&mut self) {
        if self.state != CircuitState::Open {
            self.state = CircuitState::Closed;
            self.failure_count = 0;
        }
    }

    /// Subscription could not be opened or broke
    pub fn record_failure(&mut self) {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => {
                self.failure_count += 1;
                self.state = if self.failure_count >= self.failure_threshold {
                    CircuitState::Open
                } else {
                    CircuitState::Closed
                };
            }
            CircuitState::Open => {}
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == CircuitState::Open
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(10)
    }
}
