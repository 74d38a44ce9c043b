pub mod audio;
pub mod config;
pub mod device;
pub mod duration;
pub mod error;
pub mod logging;
pub mod recording;
pub mod session;

pub use audio::{Chunk, ChunkTracker, Codec, EncoderCommand, EncoderParams};
pub use config::Config;
pub use device::{
    DeviceInfo, DeviceRequest, DeviceResolver, FixedDeviceResolver, PulseDeviceResolver,
};
pub use error::{RecorderError, RecorderResult};
pub use logging::{Level, LogEvent, LogSettings, RotationPolicy, SessionLogger};
pub use recording::{ExitRecord, ProcessSupervisor};
pub use session::{
    BoundaryMode, SessionConfig, SessionController, SessionHandle, SessionSnapshot, SessionState,
    SessionSummary, StopHandle, StopReason, TimeLimitPolicy,
};
