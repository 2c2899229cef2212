use std::fmt::Display;

/// Processing stage of a session, reported alongside its progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Stage {
    #[default]
    Extract,
    Align,
    Clock,
    Spikes,
    Write,
}

impl Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Extract => "extract",
            Stage::Align => "align",
            Stage::Clock => "clock",
            Stage::Spikes => "spikes",
            Stage::Write => "write",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Default)]
pub struct SessionStatus {
    pub progress: f32,
    pub session_index: usize,
    pub label: String,
    pub stage: Stage,
}

impl SessionStatus {
    pub fn new(progress: f32, session_index: usize, label: &str, stage: Stage) -> Self {
        Self {
            progress,
            session_index,
            label: label.to_string(),
            stage,
        }
    }
}
