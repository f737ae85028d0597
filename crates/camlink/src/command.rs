/// Out-of-band control commands accepted by
/// [`CameraClient::send_command`](crate::CameraClient::send_command).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Smooth zoom is not supported; accepted and ignored.
    StartSmoothZoom(u32),
    StopSmoothZoom,
    /// Degrees clockwise; one of 0, 90, 180, 270.
    SetDisplayOrientation(u32),
    EnableShutterSound(bool),
    /// Sound playback belongs to the application; accepted and ignored.
    PlayRecordingSound,
    StartFaceDetection,
    StopFaceDetection,
    EnableFocusMoveMessages(bool),
    /// Succeeds while the client is connected.
    Ping,
    /// Recording stream depth; rejected while recording.
    SetVideoBufferCount(usize),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::StartSmoothZoom(_) => "start_smooth_zoom",
            Command::StopSmoothZoom => "stop_smooth_zoom",
            Command::SetDisplayOrientation(_) => "set_display_orientation",
            Command::EnableShutterSound(_) => "enable_shutter_sound",
            Command::PlayRecordingSound => "play_recording_sound",
            Command::StartFaceDetection => "start_face_detection",
            Command::StopFaceDetection => "stop_face_detection",
            Command::EnableFocusMoveMessages(_) => "enable_focus_move_messages",
            Command::Ping => "ping",
            Command::SetVideoBufferCount(_) => "set_video_buffer_count",
        }
    }
}
