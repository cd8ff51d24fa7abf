//! Which methods stream their responses.

use regex::Regex;

/// Methods ending in `Stream` are streamed unless registered otherwise.
pub const STREAM_SUFFIX_PATTERN: &str = "Stream$";

/// Ordered list of patterns; the first match wins. Built once at startup and
/// read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct StreamingDetector {
    patterns: Vec<Regex>,
}

impl StreamingDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a detector for the given exact method names followed by the
    /// `Stream$` convention.
    pub fn with_methods<I, S>(methods: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut detector = Self::new();
        for method in methods {
            detector.register_method(method.as_ref())?;
        }
        detector.register(STREAM_SUFFIX_PATTERN)?;
        Ok(detector)
    }

    pub fn register(&mut self, pattern: &str) -> Result<(), regex::Error> {
        self.patterns.push(Regex::new(pattern)?);
        Ok(())
    }

    /// Registers an exact, fully-qualified method name.
    pub fn register_method(&mut self, method: &str) -> Result<(), regex::Error> {
        self.register(&format!("^{}$", regex::escape(method)))
    }

    pub fn is_streamed(&self, method: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(method))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_patterns_and_suffix_convention() {
        let mut detector = StreamingDetector::new();
        detector.register("^/svc.A/Foo$").unwrap();
        detector.register("Stream$").unwrap();

        assert!(detector.is_streamed("/svc.A/Foo"));
        assert!(!detector.is_streamed("/svc.A/Foo2"));
        assert!(detector.is_streamed("/svc.B/getStream"));
        assert!(!detector.is_streamed("/svc.B/getStreamItem"));
    }

    #[test]
    fn registered_methods_are_quoted() {
        let detector = StreamingDetector::with_methods(["/machine.MachineService/Logs"]).unwrap();

        assert!(detector.is_streamed("/machine.MachineService/Logs"));
        assert!(!detector.is_streamed("/machineXMachineService/Logs"));
        assert!(detector.is_streamed("/machine.MachineService/EventsStream"));
        assert!(!detector.is_streamed("/machine.MachineService/Version"));
    }

    #[test]
    fn invalid_pattern_is_an_error() {
        assert!(StreamingDetector::new().register("(unclosed").is_err());
    }
}
