#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate prometheus;

pub mod api;
pub mod channel;
pub mod eligibility;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod poll;
pub mod settings;
pub mod shutdown;
pub mod store;
pub mod transition;

pub use api::Error;
