pub mod dto;
mod keys;
mod members;
pub mod response;
mod router;
mod session;
mod settings;
pub mod validation;

pub use router::{AppState, create_router};
