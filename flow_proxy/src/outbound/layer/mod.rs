mod tls;
mod tls_engine;

pub use tls::TlsFlow;
pub use tls_engine::{HandshakeAction, Plaintext, RustlsEngine, TlsEngine};

use crate::{flow::RemoteDataFlow, Error, Result};

/// A transform stacked under a proxy client leg, named by a `+` prefix of
/// the configured protocol (`tls+http`).
pub trait Layer {
    fn wrap(&self, next: Box<dyn RemoteDataFlow>) -> Box<dyn RemoteDataFlow>;
}

pub struct TlsLayer;

impl Layer for TlsLayer {
    fn wrap(&self, next: Box<dyn RemoteDataFlow>) -> Box<dyn RemoteDataFlow> {
        Box::new(TlsFlow::new(next, Box::new(RustlsEngine::new())))
    }
}

pub fn by_name(name: &str) -> Result<Box<dyn Layer>> {
    match name {
        "tls" => Ok(Box::new(TlsLayer)),
        _ => Err(Error::InvalidConfig(format!("unknown layer: {}", name))),
    }
}
