pub mod buffer;
pub mod calibrate;
pub mod config;
pub mod device;
pub mod dispatch;
pub mod driver;
pub mod engine;
pub mod error;
pub mod plan;
pub mod settings;
pub mod sim;
pub mod status;
pub mod utils;

pub use buffer::*;
pub use calibrate::*;
pub use config::*;
pub use device::*;
pub use dispatch::*;
pub use driver::*;
pub use engine::*;
pub use error::*;
pub use plan::*;
pub use settings::*;
pub use sim::*;
pub use status::*;
pub use utils::*;
