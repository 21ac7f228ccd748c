mod addr;
mod buffer;
mod cancel;
mod endpoint;
pub mod http;
mod resolver;
pub mod runloop;
mod session;
mod uri_parse;

pub use addr::{HostName, SocketAddr};
pub use buffer::Buffer;
pub use cancel::{CancelToken, Guarded};
pub use endpoint::{Addresses, Endpoint};
pub use resolver::{Resolver, SystemResolver};
pub use session::Session;
pub use uri_parse::ParsedUri;
