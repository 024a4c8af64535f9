mod business_source_port;
mod instructions_port;
mod persistence_port;
mod ui_dispatcher_port;

pub use business_source_port::{BusinessSource, CacheInstructions, FetchOrigin, FetchStatus};
pub use instructions_port::{AsyncInstructor, BindTarget, Instructions, Payload, StreamSupply};
pub use persistence_port::Persistence;
pub use ui_dispatcher_port::{UiDispatcher, UiTask};
