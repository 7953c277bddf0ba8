/// Abstraction over user-facing output.
///
/// Command modules use this trait instead of `println!`/`eprintln!` so that
/// what they print can be captured in tests.
pub trait UserOutput: Send + Sync {
    /// Informational line (tables, JSON, progress)
    fn status(&self, message: &str);

    /// Success message (e.g., "Shutdown started")
    fn success(&self, message: &str);

    /// Warning message (e.g., a service that failed to restart)
    fn warning(&self, message: &str);

    /// Error message
    fn error(&self, message: &str);
}

/// Standard CLI output: stdout/stderr with ANSI colors.
pub struct CliOutput;

impl UserOutput for CliOutput {
    fn status(&self, message: &str) {
        println!("{}", message);
    }

    fn success(&self, message: &str) {
        println!("\x1b[32m{}\x1b[0m", message);
    }

    fn warning(&self, message: &str) {
        eprintln!("\x1b[33m{}\x1b[0m", message);
    }

    fn error(&self, message: &str) {
        eprintln!("\x1b[31m{}\x1b[0m", message);
    }
}

/// Collects every line; used by command tests.
#[cfg(test)]
#[derive(Default)]
pub struct CapturedOutput {
    pub lines: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl CapturedOutput {
    pub fn text(&self) -> String {
        self.lines
            .lock()
            .map(|lines| lines.join("\n"))
            .unwrap_or_default()
    }
}

#[cfg(test)]
impl UserOutput for CapturedOutput {
    fn status(&self, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(message.to_string());
        }
    }

    fn success(&self, message: &str) {
        self.status(message);
    }

    fn warning(&self, message: &str) {
        self.status(message);
    }

    fn error(&self, message: &str) {
        self.status(message);
    }
}
