//! Progress reporting collaborator.
//!
//! The engine never draws progress itself; long-running loops call into
//! this trait with sequential counts and a terminal `finish`.

use log::info;

pub trait Progress {
    fn update(&mut self, i: usize);
    fn finish(&mut self);
}

/// Silent reporter, the default for library use.
pub struct NoProgress;

impl Progress for NoProgress {
    fn update(&mut self, _i: usize) {}
    fn finish(&mut self) {}
}

/// Reporter that logs coarse-grained progress through `log`.
pub struct LogProgress {
    label: String,
    max: usize,
    last_logged: usize,
}

impl LogProgress {
    pub fn new(label: impl Into<String>, max: usize) -> Self {
        Self {
            label: label.into(),
            max,
            last_logged: 0,
        }
    }
}

impl Progress for LogProgress {
    fn update(&mut self, i: usize) {
        // Log at most every 10% to keep multifit output readable.
        let stride = (self.max / 10).max(1);
        if i >= self.last_logged + stride || i == self.max {
            info!("{}: {}/{}", self.label, i, self.max);
            self.last_logged = i;
        }
    }

    fn finish(&mut self) {
        info!("{}: done", self.label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reporters_accept_full_sequences() {
        let mut quiet = NoProgress;
        let mut logged = LogProgress::new("fit", 25);
        for i in 1..=25 {
            quiet.update(i);
            logged.update(i);
        }
        quiet.finish();
        logged.finish();
    }
}
