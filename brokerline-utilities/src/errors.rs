use std::fmt;

pub type SendableError = Box<dyn std::error::Error + Send + Sync>;

/// Setup failure carrying a dotted code, e.g. `brokerline.transport.unknown_backend`.
#[derive(Debug)]
pub struct RuntimeError {
    code: String,
    message: String,
}

impl RuntimeError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn boxed(code: impl Into<String>, message: impl Into<String>) -> SendableError {
        Box::new(Self::new(code, message))
    }

    pub fn code(&self) -> &str {
        &self.code
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_code() {
        let err = RuntimeError::new("brokerline.transport.unknown_backend", "Unknown backend 'amqp'");
        assert_eq!(err.code(), "brokerline.transport.unknown_backend");
        assert_eq!(
            err.to_string(),
            "brokerline.transport.unknown_backend: Unknown backend 'amqp'"
        );
    }

    #[test]
    fn boxed_error_downcasts() {
        let err = RuntimeError::boxed("brokerline.config", "bad value");
        let runtime = err.downcast_ref::<RuntimeError>().map(RuntimeError::code);
        assert_eq!(runtime, Some("brokerline.config"));
    }
}
