//! The transformer chain applied to every replication request before it
//! reaches a writer: augment with the current local object, project onto
//! the field whitelist, then stamp the follower label.

#![forbid(unsafe_code)]

mod augmenter;
mod label;
mod transformer;
mod whitelist;

pub use augmenter::Augmenter;
pub use label::Label;
pub use transformer::{Pipeline, Transformer};
pub use whitelist::{EndpointsWhitelist, ServiceWhitelist};
