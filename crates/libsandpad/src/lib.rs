pub mod broker;
pub mod catalog;
pub mod config;
pub mod console;
pub mod coordinator;
pub mod error;
pub mod output;
pub mod process;
pub mod seed;
pub mod session;
mod writer;

pub use broker::EventBroker;
pub use catalog::FileCatalog;
pub use config::{CommandSpec, CoordinatorConfig};
pub use console::{ConsoleSink, InteractiveConsole};
pub use coordinator::Coordinator;
pub use error::SandpadError;
pub use output::{ConsoleOutput, HistoryLog, OutputChunk, Scrollback};
pub use process::ProcessController;
pub use session::{RuntimeSession, Subscription};
