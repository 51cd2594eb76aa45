use chrono::Utc;
use serde::Serialize;

use super::{RecordStatus, Service};

/// Point-in-time view of one recording session.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub bytes_written: u64,
    pub status: RecordStatus,
    pub start_time: i64,
    pub elapsed_seconds: i64,
}

impl Service {
    /// A room with no tracked recorder is idle.
    pub fn get_status(&self, room_id: u64) -> RecordStatus {
        match self.inner().recording.get(&room_id) {
            Some(recorder) => recorder.status(),
            None => RecordStatus::Idle,
        }
    }

    pub fn list_recording(&self) -> Vec<u64> {
        self.inner()
            .recording
            .iter()
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn get_stats(&self, room_id: u64) -> Option<Stats> {
        let recorder = self.inner().recording.get(&room_id)?;
        Some(Stats {
            bytes_written: recorder.bytes_read(),
            status: recorder.status(),
            start_time: recorder.start_time().timestamp(),
            elapsed_seconds: (Utc::now() - recorder.start_time()).num_seconds(),
        })
    }
}
