use async_trait::async_trait;
use parking_lot::Mutex;

use super::{MediaConstraints, MediaDevices, MediaStream, MediaTrack, TrackKind};
use crate::error::MediaError;

/// Capture backend that produces tracks without hardware. Every stream it
/// hands out is remembered so callers can check that tracks were stopped.
#[derive(Debug)]
pub struct SyntheticDevices {
    microphone: bool,
    camera: bool,
    deny: bool,
    issued: Mutex<Vec<MediaStream>>,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self {
            microphone: true,
            camera: true,
            deny: false,
            issued: Mutex::new(Vec::new()),
        }
    }
}

impl SyntheticDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every capture request is refused as if the user declined the prompt.
    pub fn denied() -> Self {
        Self {
            deny: true,
            ..Self::default()
        }
    }

    pub fn without_camera(mut self) -> Self {
        self.camera = false;
        self
    }

    pub fn without_microphone(mut self) -> Self {
        self.microphone = false;
        self
    }

    pub fn issued(&self) -> Vec<MediaStream> {
        self.issued.lock().clone()
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(
        &self,
        constraints: MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        if self.deny {
            return Err(MediaError::PermissionDenied);
        }
        if constraints.video && !self.camera {
            return Err(MediaError::NoDevice(TrackKind::Video));
        }
        if constraints.audio && !self.microphone {
            return Err(MediaError::NoDevice(TrackKind::Audio));
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio, "synthetic microphone"));
        }
        if constraints.video {
            tracks.push(MediaTrack::new(TrackKind::Video, "synthetic camera"));
        }
        let stream = MediaStream::new(tracks);
        self.issued.lock().push(stream.clone());
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_devices_are_reported_by_kind() {
        let devices = SyntheticDevices::new().without_camera();
        let err = devices
            .get_user_media(MediaConstraints::default())
            .await
            .unwrap_err();
        assert_eq!(err, MediaError::NoDevice(TrackKind::Video));

        let denied = SyntheticDevices::denied();
        assert_eq!(
            denied
                .get_user_media(MediaConstraints::default())
                .await
                .unwrap_err(),
            MediaError::PermissionDenied
        );
        assert!(denied.issued().is_empty());
    }
}
