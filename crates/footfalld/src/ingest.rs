//! Frame ingestion from the detector/tracker collaborator.
//!
//! The feed is newline-delimited JSON, one frame per line:
//!
//! ```json
//! {"timestamp":"2026-03-01T12:00:00Z","detections":[
//!   {"track_id":7,"embedding":[0.1,0.9],"bbox":{"x":10,"y":20,"width":64,"height":64},
//!    "confidence":0.93,"crop_path":"crops/2026-03-01/7.jpg"}]}
//! ```
//!
//! `crop_path` is optional. An empty `detections` array is a valid frame
//! and means every live track is lost.

use footfall_core::Frame;

pub fn parse_frame(line: &str) -> Result<Frame, serde_json::Error> {
    serde_json::from_str(line)
}
