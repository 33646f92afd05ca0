use std::time::{Duration, Instant};

pub struct Recorder {
    start: Instant,
}

impl Recorder {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    pub fn reset(&mut self) {
        self.start = Instant::now();
    }

    pub fn elapsed_time(&self) -> Duration {
        Instant::now() - self.start
    }

    pub fn elapsed_time_string(&self) -> String {
        format_duration(self.elapsed_time())
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let elapsed = self.start.elapsed();
        write!(f, "{}.{:03}s", elapsed.as_secs(), elapsed.subsec_millis())
    }
}

pub fn format_duration(elapsed: Duration) -> String {
    let total_seconds = elapsed.as_secs();
    if total_seconds > 60 {
        let minutes = total_seconds / 60;
        let seconds = total_seconds - (minutes * 60);
        format!("{} minutes {} seconds", minutes, seconds)
    } else {
        format!("{}.{:03} seconds", total_seconds, elapsed.subsec_millis())
    }
}
