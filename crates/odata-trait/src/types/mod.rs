pub mod message;
pub mod path;
pub mod request;

pub use message::*;
pub use path::*;
pub use request::*;
