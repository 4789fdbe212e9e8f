#[derive(Clone)]
pub struct EngineError {
    exit_code: u8,
    message: String,
}

impl EngineError {
    pub fn new(exit_code: u8, message: impl Into<String>) -> Self {
        Self {
            exit_code,
            message: message.into(),
        }
    }

    /// Invalid caller input (bad ranges, shape mismatches, unknown names).
    pub fn usage(message: impl Into<String>) -> Self {
        Self::new(2, message)
    }

    /// Numerical failure inside a fit backend.
    pub fn fit(message: impl Into<String>) -> Self {
        Self::new(3, message)
    }

    /// Filesystem / serialization failure.
    pub fn io(message: impl Into<String>) -> Self {
        Self::new(4, message)
    }

    pub fn exit_code(&self) -> u8 {
        self.exit_code
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::fmt::Debug for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineError")
            .field("exit_code", &self.exit_code)
            .field("message", &self.message)
            .finish()
    }
}

impl std::error::Error for EngineError {}
