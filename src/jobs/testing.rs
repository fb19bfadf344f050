//! Shared fixtures for job component tests.

use super::engine::{EngineSettings, JobEngine};
use super::lifecycle::JobLifecycle;
use super::submitter::{JobSubmitter, StartMode, StartOptions, SubmitterSettings, MAX_UPLOAD_BYTES};
use super::transcript::{TranscriptArtifact, TranscriptWord};
use crate::jobs::poller::PollSchedule;
use crate::stores::{
    Backends, MemoryMetadataStore, MemoryObjectStore, MetadataStore, ObjectStore, SimulatedTranscriptionService,
    SpeakerLabelOptions, TranscriptionService,
};
use std::sync::Arc;
use std::time::Duration;

/// Concrete in-memory collaborators, kept typed so tests can inspect them.
pub struct Harness {
    pub objects: Arc<MemoryObjectStore>,
    pub metadata: Arc<MemoryMetadataStore>,
    pub simulator: Arc<SimulatedTranscriptionService>,
}

impl Harness {
    pub fn new() -> Self {
        let objects = Arc::new(MemoryObjectStore::new(Duration::from_secs(900)));
        let simulator = Arc::new(SimulatedTranscriptionService::new(objects.clone() as Arc<dyn ObjectStore>));
        Self {
            objects,
            metadata: Arc::new(MemoryMetadataStore::new()),
            simulator,
        }
    }

    pub fn backends(&self) -> Backends {
        Backends {
            objects: self.objects.clone() as Arc<dyn ObjectStore>,
            service: self.simulator.clone() as Arc<dyn TranscriptionService>,
            metadata: self.metadata.clone() as Arc<dyn MetadataStore>,
            simulator: Some(self.simulator.clone()),
        }
    }

    pub fn settings(&self, start_mode: StartMode) -> SubmitterSettings {
        SubmitterSettings {
            max_upload_bytes: MAX_UPLOAD_BYTES,
            upload_prefix: "uploads".to_string(),
            start_mode,
            start_options: StartOptions {
                language_code: "en-US".to_string(),
                speaker_labels: SpeakerLabelOptions {
                    enabled: false,
                    max_speakers: 2,
                },
            },
        }
    }

    pub fn submitter(&self, start_mode: StartMode) -> JobSubmitter {
        self.submitter_with(self.settings(start_mode))
    }

    pub fn submitter_with(&self, settings: SubmitterSettings) -> JobSubmitter {
        let backends = self.backends();
        JobSubmitter::new(backends.objects, backends.service, backends.metadata, settings)
    }

    pub fn lifecycle(&self) -> JobLifecycle {
        let backends = self.backends();
        JobLifecycle::new(backends.objects, backends.service, backends.metadata)
    }

    pub fn engine(&self, start_mode: StartMode) -> JobEngine {
        JobEngine::new(
            &self.backends(),
            EngineSettings {
                submitter: self.settings(start_mode),
                completed_page_size: 100,
                schedule: PollSchedule::standard(),
            },
        )
    }
}

/// Artifact whose words carry the given confidences, one second apart.
pub fn artifact(job_name: &str, transcript: &str, confidences: &[f64]) -> TranscriptArtifact {
    let words: Vec<TranscriptWord> = transcript
        .split_whitespace()
        .zip(confidences)
        .enumerate()
        .map(|(i, (word, confidence))| TranscriptWord {
            content: word.to_string(),
            confidence: *confidence,
            start_time: i as f64,
            end_time: i as f64 + 0.5,
        })
        .collect();
    TranscriptArtifact::from_words(job_name, transcript, &words)
}
