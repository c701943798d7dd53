//! Command codes the session layer speaks.

use camlink_command_core::{CommandCode, MessageFamily};

pub mod live {
    use super::*;

    pub const START_WATCH: CommandCode = CommandCode::new(MessageFamily::LiveStream, 1);
    pub const STOP_WATCH: CommandCode = CommandCode::new(MessageFamily::LiveStream, 2);
    pub const CHANGE_STREAM: CommandCode = CommandCode::new(MessageFamily::LiveStream, 3);
    pub const REQUEST_KEY_FRAME: CommandCode = CommandCode::new(MessageFamily::LiveStream, 4);
    pub const START_TALK: CommandCode = CommandCode::new(MessageFamily::LiveStream, 5);
    pub const STOP_TALK: CommandCode = CommandCode::new(MessageFamily::LiveStream, 6);
    /// Device confirms it is ready for talk audio
    pub const TALK_AUDIO_OPEN: CommandCode = CommandCode::new(MessageFamily::LiveStream, 7);
}

pub mod system {
    use super::*;

    pub const PTZ: CommandCode = CommandCode::new(MessageFamily::SystemControl, 1);
    pub const UPLOAD_START: CommandCode = CommandCode::new(MessageFamily::SystemControl, 10);
    pub const UPLOAD_CHUNK: CommandCode = CommandCode::new(MessageFamily::SystemControl, 11);
    pub const UPLOAD_FINISH: CommandCode = CommandCode::new(MessageFamily::SystemControl, 12);
    /// Notify only
    pub const UPLOAD_PROGRESS: CommandCode = CommandCode::new(MessageFamily::SystemControl, 13);
    pub const AUTO_ALARM: CommandCode = CommandCode::new(MessageFamily::SystemControl, 20);
    pub const CONFIG_OPEN: CommandCode = CommandCode::new(MessageFamily::SystemControl, 30);
    pub const CONFIG_CLOSE: CommandCode = CommandCode::new(MessageFamily::SystemControl, 31);
}

pub mod replay {
    use super::*;
    use crate::session::ReplayAction;

    /// Replay actions use their action number as the code
    pub const fn action(action: ReplayAction) -> CommandCode {
        CommandCode::new(MessageFamily::NvrReplay, action as u16)
    }

    pub const PLAY_START: CommandCode = CommandCode::new(MessageFamily::NvrReplay, 10);
    pub const SEARCH_RECORDS: CommandCode = CommandCode::new(MessageFamily::NvrReplay, 11);
    pub const SEARCH_BY_MONTH: CommandCode = CommandCode::new(MessageFamily::NvrReplay, 12);
    pub const DOWNLOAD_START: CommandCode = CommandCode::new(MessageFamily::NvrReplay, 13);
    pub const DOWNLOAD_STOP: CommandCode = CommandCode::new(MessageFamily::NvrReplay, 14);
    /// Notify only
    pub const DOWNLOAD_PROGRESS: CommandCode = CommandCode::new(MessageFamily::NvrReplay, 15);
    /// Notify only, the device finished sending the file
    pub const DOWNLOAD_END: CommandCode = CommandCode::new(MessageFamily::NvrReplay, 16);
}

/// Unsolicited device notifications
pub mod notify {
    use super::*;

    pub const ALARM: CommandCode = CommandCode::new(MessageFamily::IotCamera, 1);
    pub const EVENT: CommandCode = CommandCode::new(MessageFamily::IotCamera, 2);
    pub const DEVICE_OFFLINE: CommandCode = CommandCode::new(MessageFamily::IotCamera, 3);
    pub const CHANNEL_OFFLINE: CommandCode = CommandCode::new(MessageFamily::IotCamera, 4);
    pub const CHANNEL_ONLINE: CommandCode = CommandCode::new(MessageFamily::IotCamera, 5);
    pub const CHANNEL_UNCONNECTED: CommandCode = CommandCode::new(MessageFamily::IotCamera, 6);
    pub const AUTH_FAILED: CommandCode = CommandCode::new(MessageFamily::IotCamera, 7);
}
