//! Progress reporting
//!
//! Upload counts for 30% of the blended figure and encryption for 70%.
//! Each percentage is rounded on its own before blending.

use super::types::{ProgressInfo, UploadState};

const UPLOAD_WEIGHT: f64 = 0.3;
const PROCESS_WEIGHT: f64 = 0.7;

fn percent(part: usize, total: usize) -> u8 {
    let pct = (part as f64 / total as f64 * 100.0).round();
    pct.clamp(0.0, 100.0) as u8
}

impl ProgressInfo {
    /// Compute percentages from chunk counts. No chunks means everything is done.
    pub fn compute(total_chunks: usize, uploaded_chunks: usize, processed_chunks: usize) -> Self {
        if total_chunks == 0 {
            return Self {
                total_chunks,
                uploaded_chunks,
                processed_chunks,
                upload_percent: 100,
                process_percent: 100,
                total_percent: 100,
            };
        }

        let upload_percent = percent(uploaded_chunks, total_chunks);
        let process_percent = percent(processed_chunks, total_chunks);
        let blended = UPLOAD_WEIGHT * f64::from(upload_percent) + PROCESS_WEIGHT * f64::from(process_percent);

        Self {
            total_chunks,
            uploaded_chunks,
            processed_chunks,
            upload_percent,
            process_percent,
            total_percent: blended.round().clamp(0.0, 100.0) as u8,
        }
    }

    pub fn is_processing_complete(&self) -> bool {
        self.total_chunks > 0 && self.processed_chunks == self.total_chunks
    }
}

impl UploadState {
    /// Coarse label: paused wins, then processing complete, otherwise uploading
    pub fn from_progress(paused: bool, progress: &ProgressInfo) -> Self {
        if paused {
            Self::Paused
        } else if progress.is_processing_complete() {
            Self::ProcessingComplete
        } else {
            Self::Uploading
        }
    }
}
