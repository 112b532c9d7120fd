pub mod command_messenger;
#[cfg(any(test, feature = "test-util"))]
pub mod fake;
pub mod logs;
pub mod messenger;
pub mod process_support;
pub mod supervisor;

pub use command_messenger::{ClientCommand, CommandMessenger};
pub use logs::{LogBuffer, LogSink};
pub use messenger::{ChatClient, ClientOptions, LoginCallback, LoginRequest, Messenger};
pub use supervisor::{LaunchedBot, Supervisor, SupervisorConfig, Termination};
